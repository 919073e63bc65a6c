// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `tandem`: inspect a schema, compile a query for both stores and derive
//! the realtime channels a result set needs.
#![allow(clippy::print_stdout)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::Table;
use serde_json::Value;
use tandem_query::{QueryCompiler, QueryDescriptor};
use tandem_realtime::derive_channels;
use tandem_schema::{Row, Schema, TableDescriptor};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tandem developer CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print tables, columns and foreign keys of a schema.
    Inspect {
        #[command(flatten)]
        schema: SchemaArgs,
        /// Print the reflected schema as JSON instead of tables.
        #[arg(long)]
        json: bool,
    },
    /// Compile a query descriptor into a local plan and remote query strings.
    Compile {
        #[command(flatten)]
        schema: SchemaArgs,
        /// Query descriptor (JSON).
        query: PathBuf,
        /// Maximum window of one remote fetch.
        #[arg(long, default_value_t = 1000)]
        page_size: usize,
    },
    /// Derive the realtime channels for a query and its local result rows.
    Channels {
        #[command(flatten)]
        schema: SchemaArgs,
        /// Query descriptor (JSON).
        query: PathBuf,
        /// Materialized result rows (JSON array, local property names).
        rows: PathBuf,
    },
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Schema description (JSON).
    #[arg(long, short)]
    schema: PathBuf,
    /// Read the schema as a PostgREST OpenAPI document.
    #[arg(long)]
    openapi: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Inspect { schema, json } => inspect(&*load_schema(&schema)?, json),
        Command::Compile {
            schema,
            query,
            page_size,
        } => compile(load_schema(&schema)?, &query, page_size),
        Command::Channels { schema, query, rows } => channels(&load_schema(&schema)?, &query, &rows),
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
}

fn load_schema(args: &SchemaArgs) -> Result<Arc<Schema>> {
    let schema = if args.openapi {
        Schema::from_openapi(&read_json(&args.schema)?)?
    } else {
        let text = fs::read_to_string(&args.schema).with_context(|| format!("read {}", args.schema.display()))?;
        Schema::from_json(&text)?
    };
    info!(
        tables = schema.table_names().count(),
        fingerprint = %schema.fingerprint().to_hex(),
        "schema loaded"
    );
    Ok(Arc::new(schema))
}

fn load_query(path: &Path) -> Result<QueryDescriptor> {
    Ok(QueryDescriptor::from_json(&read_json(path)?)?)
}

fn inspect(schema: &Schema, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(schema)?);
        return Ok(());
    }
    println!("fingerprint {}", schema.fingerprint().to_hex());
    for table in schema.tables() {
        println!();
        println!("{}", table.name);
        println!("{}", columns_table(table));
    }
    Ok(())
}

fn columns_table(table: &TableDescriptor) -> Table {
    let mut out = Table::new();
    out.set_header(vec!["column", "property", "type", "nullable", "default", "references"]);
    for column in &table.columns {
        let references = table
            .foreign_keys
            .iter()
            .find(|fk| fk.column == column.name)
            .map(|fk| format!("{}.{}", fk.target_table, fk.target_column))
            .unwrap_or_default();
        out.add_row(vec![
            column.name.clone(),
            column.property.clone(),
            format!("{:?}", column.column_type),
            if column.nullable { "yes" } else { "no" }.to_string(),
            column.default.clone().unwrap_or_default(),
            references,
        ]);
    }
    out
}

fn compile(schema: Arc<Schema>, query: &Path, page_size: usize) -> Result<()> {
    if page_size == 0 {
        bail!("--page-size must be at least 1");
    }
    let descriptor = load_query(query)?;
    let compiler = QueryCompiler::new(schema).with_page_size(page_size);
    let plan = compiler.compile_local(&descriptor)?;
    let request = compiler.compile_remote(&descriptor)?;
    debug!(batches = request.batches.len(), "query compiled");

    println!("# local plan");
    println!("{}", serde_json::to_string_pretty(&plan)?);
    for (i, range) in request.batches.iter().enumerate() {
        let role = if i < request.prefix { "prefix" } else { "result" };
        println!("# remote batch {i} ({role}, offset {}, limit {})", range.offset, range.limit);
        println!("{}", request.query_string(*range));
    }
    if request.open_ended {
        println!("# further result pages of {} follow until one comes back short", request.page_size);
    }
    Ok(())
}

fn channels(schema: &Arc<Schema>, query: &Path, rows: &Path) -> Result<()> {
    let descriptor = load_query(query)?;
    let root = QueryCompiler::new(Arc::clone(schema)).normalize(&descriptor)?;
    let rows: Vec<Row> = match read_json(rows)? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => bail!("result rows must be objects, got {other}"),
            })
            .collect::<Result<_>>()?,
        _ => bail!("{} must hold a JSON array of rows", rows.display()),
    };
    for name in derive_channels(schema, &root, &rows)? {
        println!("{name}");
    }
    Ok(())
}
