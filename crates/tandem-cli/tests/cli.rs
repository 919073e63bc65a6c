// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Integration tests for the `tandem` binary.
#![allow(clippy::unwrap_used)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const SCHEMA: &str = r#"{
  "tables": {
    "users": {"columns": [
      {"name": "id", "type": "uuid", "nullable": false},
      {"name": "display_name", "type": "text", "nullable": false}
    ]},
    "posts": {
      "columns": [
        {"name": "id", "type": "uuid", "nullable": false},
        {"name": "author_id", "type": "uuid", "nullable": false},
        {"name": "title", "type": "text", "nullable": false},
        {"name": "created_at", "type": "timestamptz", "nullable": false, "default": "now()"}
      ],
      "foreign_keys": [{"column": "author_id", "references": {"table": "users", "column": "id"}}]
    },
    "comments": {
      "columns": [
        {"name": "id", "type": "uuid", "nullable": false},
        {"name": "post_id", "type": "uuid", "nullable": false},
        {"name": "body", "type": "text"}
      ],
      "foreign_keys": [{"column": "post_id", "references": {"table": "posts", "column": "id"}}]
    }
  }
}"#;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            dir: TempDir::new().unwrap(),
        };
        fixture.write("schema.json", SCHEMA);
        fixture
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn tandem() -> Command {
    Command::cargo_bin("tandem").unwrap()
}

#[test]
fn inspect_lists_columns_and_references() {
    let fx = Fixture::new();
    tandem()
        .args(["inspect", "--schema"])
        .arg(fx.path("schema.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("fingerprint "))
        .stdout(predicate::str::contains("authorId"))
        .stdout(predicate::str::contains("users.id"))
        .stdout(predicate::str::contains("posts.id"));
}

#[test]
fn inspect_json_round_trips_through_serde() {
    let fx = Fixture::new();
    let output = tandem()
        .args(["inspect", "--json", "-s"])
        .arg(fx.path("schema.json"))
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(value.to_string().contains("display_name"));
}

#[test]
fn compile_prints_local_plan_and_remote_batches() {
    let fx = Fixture::new();
    let query = fx.write(
        "query.json",
        r#"{"table": "posts", "filter": {"title": "hello"}, "offset": 150, "limit": 20,
            "include": {"author": "users", "comments": "comments"}}"#,
    );
    tandem()
        .args(["compile", "--page-size", "100", "--schema"])
        .arg(fx.path("schema.json"))
        .arg(&query)
        .assert()
        .success()
        .stdout(predicate::str::contains("# local plan"))
        .stdout(predicate::str::contains("# remote batch 0 (prefix, offset 0, limit 100)"))
        .stdout(predicate::str::contains("# remote batch 1 (prefix, offset 100, limit 50)"))
        .stdout(predicate::str::contains("# remote batch 2 (result, offset 150, limit 20)"))
        .stdout(predicate::str::contains("author:users!author_id(*)"))
        .stdout(predicate::str::contains("title=eq.hello"));
}

#[test]
fn compile_splits_large_limits_into_result_pages() {
    let fx = Fixture::new();
    let query = fx.write("query.json", r#"{"table": "posts", "limit": 5}"#);
    tandem()
        .args(["compile", "--page-size", "3", "--schema"])
        .arg(fx.path("schema.json"))
        .arg(&query)
        .assert()
        .success()
        .stdout(predicate::str::contains("# remote batch 0 (result, offset 0, limit 3)"))
        .stdout(predicate::str::contains("# remote batch 1 (result, offset 3, limit 2)"))
        .stdout(predicate::str::contains("further result pages").not());
}

#[test]
fn compile_rejects_unknown_tables() {
    let fx = Fixture::new();
    let query = fx.write("query.json", r#"{"table": "nope"}"#);
    tandem()
        .args(["compile", "--schema"])
        .arg(fx.path("schema.json"))
        .arg(&query)
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn channels_follow_result_rows_and_includes() {
    let fx = Fixture::new();
    let query = fx.write("query.json", r#"{"table": "posts", "include": {"comments": "comments"}}"#);
    let rows = fx.write(
        "rows.json",
        r#"[{"id": "p1", "authorId": "u1", "title": "a", "comments": []},
            {"id": "p2", "authorId": "u1", "title": "b", "comments": []}]"#,
    );
    tandem()
        .args(["channels", "--schema"])
        .arg(fx.path("schema.json"))
        .arg(&query)
        .arg(&rows)
        .assert()
        .success()
        .stdout(predicate::str::contains("posts:id:p1"))
        .stdout(predicate::str::contains("posts:id:p2"))
        .stdout(predicate::str::contains("comments:post_id:p1"));
}

#[test]
fn channels_reject_non_array_rows() {
    let fx = Fixture::new();
    let query = fx.write("query.json", r#"{"table": "posts"}"#);
    let rows = fx.write("rows.json", r#"{"id": "p1"}"#);
    tandem()
        .args(["channels", "--schema"])
        .arg(fx.path("schema.json"))
        .arg(&query)
        .arg(&rows)
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON array"));
}
