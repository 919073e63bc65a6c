// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session startup: prefs, schema reset, collections, migration.

use std::sync::Arc;
use std::time::Duration;

use tandem_app_core::config::{ConfigService, ConfigStore};
use tandem_app_core::prefs::{SchemaState, SyncPrefs, SCHEMA_STATE_KEY, SYNC_PREFS_KEY};
use tandem_query::QueryCompiler;
use tandem_realtime::{ChannelManager, ReplicaHandler};
use tandem_replication::{LeaderRelay, MasterStates, PullHub, PushErrorCallback, ReplicationEngine, StaleReconciler};
use tandem_schema::Schema;
use tandem_store_port::{LeaderChannel, LocalDocument, LocalStore, PubSub, RemoteStore};
use tracing::{debug, info, instrument, warn};

use crate::session::Parts;
use crate::{SessionError, SyncSession};

/// Rewrites a document stored under an older schema version
/// (`from_version`). Returning `None` drops the document.
pub type MigrationStrategy = Arc<dyn Fn(LocalDocument, u32) -> Option<LocalDocument> + Send + Sync>;

type SharedConfig = ConfigService<Box<dyn ConfigStore + Send + Sync>>;

/// Collects collaborators and callbacks, then opens a [`SyncSession`].
pub struct SessionBuilder {
    schema: Arc<Schema>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    pubsub: Option<Arc<dyn PubSub>>,
    leader: Option<Arc<dyn LeaderChannel>>,
    config: Option<SharedConfig>,
    prefs: Option<SyncPrefs>,
    migration: Option<MigrationStrategy>,
    on_push_error: Option<PushErrorCallback>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("tables", &self.schema.table_names().collect::<Vec<_>>())
            .field("realtime", &self.pubsub.is_some())
            .field("leader", &self.leader.is_some())
            .field("prefs", &self.prefs)
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    /// Start from the schema and the two stores every session needs.
    pub fn new(schema: Arc<Schema>, store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            schema,
            store,
            remote,
            pubsub: None,
            leader: None,
            config: None,
            prefs: None,
            migration: None,
            on_push_error: None,
        }
    }

    /// Enable realtime channels over `pubsub`.
    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Coordinate with other replicas (used when `leader_election` is set).
    pub fn with_leader(mut self, leader: Arc<dyn LeaderChannel>) -> Self {
        self.leader = Some(leader);
        self
    }

    /// Load prefs from and persist schema state to `store`.
    pub fn with_config(mut self, store: impl ConfigStore + Send + Sync + 'static) -> Self {
        self.config = Some(ConfigService::new(Box::new(store)));
        self
    }

    /// Use `prefs` instead of the stored ones.
    pub fn with_prefs(mut self, prefs: SyncPrefs) -> Self {
        self.prefs = Some(prefs);
        self
    }

    /// Migrate documents stored under an older schema version.
    pub fn with_migration(mut self, migration: MigrationStrategy) -> Self {
        self.migration = Some(migration);
        self
    }

    /// Report push conflicts and transport failures.
    pub fn with_push_error_callback(mut self, callback: PushErrorCallback) -> Self {
        self.on_push_error = Some(callback);
        self
    }

    /// Prepare the local replica and open the session.
    ///
    /// Replication starts right away when `auto_start` is set.
    #[instrument(skip_all)]
    pub async fn open(self) -> Result<SyncSession, SessionError> {
        let prefs = self.resolve_prefs();
        let fingerprint = self.schema.fingerprint().to_hex();
        self.reset_if_schema_changed(&fingerprint).await?;
        self.create_collections(prefs.schema_version).await?;
        if let Some(config) = &self.config {
            let state = SchemaState {
                fingerprint,
                schema_version: prefs.schema_version,
            };
            if let Err(err) = config.save(SCHEMA_STATE_KEY, &state) {
                warn!(?err, "failed to persist schema state");
            }
        }

        let leader = match (prefs.leader_election, self.leader) {
            (true, Some(leader)) => Some(leader),
            (true, None) => {
                warn!("leader election requested without a leader channel; running standalone");
                None
            }
            (false, Some(_)) => {
                debug!("leader channel ignored, leader election is off");
                None
            }
            (false, None) => None,
        };

        let pulls = Arc::new(PullHub::new());
        let masters = Arc::new(MasterStates::new());
        let mut engine = ReplicationEngine::new(Arc::clone(&self.schema), Arc::clone(&self.remote), Arc::clone(&pulls));
        if let Some(callback) = self.on_push_error {
            engine = engine.with_error_callback(callback);
        }
        let engine = Arc::new(engine);
        let relay = Arc::new(LeaderRelay::new(Arc::clone(&engine), Arc::clone(&pulls), leader));
        let reconciler = Arc::new(StaleReconciler::new(
            Arc::clone(&self.schema),
            Arc::clone(&self.remote),
            Arc::clone(&pulls),
        ));
        let channels = self.pubsub.map(|pubsub| {
            let handler = ReplicaHandler::new(
                Arc::clone(&self.schema),
                Arc::clone(&self.store),
                Arc::clone(&self.remote),
                Arc::clone(&pulls),
            );
            ChannelManager::new(
                pubsub,
                Arc::new(handler),
                Duration::from_millis(prefs.channel_detach_delay_ms),
            )
        });
        let compiler = QueryCompiler::new(Arc::clone(&self.schema)).with_page_size(prefs.remote_page_size);

        let auto_start = prefs.auto_start;
        let session = SyncSession::from_parts(Parts {
            schema: self.schema,
            prefs,
            compiler,
            store: self.store,
            remote: self.remote,
            pulls,
            masters,
            relay,
            reconciler,
            channels,
        });
        if auto_start {
            session.start();
        }
        info!(started = auto_start, leader = session.is_leader(), "sync session opened");
        Ok(session)
    }

    fn resolve_prefs(&self) -> SyncPrefs {
        if let Some(prefs) = &self.prefs {
            return prefs.clone();
        }
        let Some(config) = &self.config else {
            return SyncPrefs::default();
        };
        match config.load_or_init::<SyncPrefs>(SYNC_PREFS_KEY) {
            Ok((prefs, save_err)) => {
                if let Some(err) = save_err {
                    warn!(?err, "failed to persist default sync prefs");
                }
                prefs
            }
            Err(err) => {
                warn!(?err, "failed to load sync prefs; using defaults");
                SyncPrefs::default()
            }
        }
    }

    async fn reset_if_schema_changed(&self, fingerprint: &str) -> Result<(), SessionError> {
        let Some(config) = &self.config else {
            return Ok(());
        };
        let previous = match config.load::<SchemaState>(SCHEMA_STATE_KEY) {
            Ok(previous) => previous,
            Err(err) => {
                warn!(?err, "failed to load schema state");
                None
            }
        };
        if let Some(previous) = previous.filter(|state| state.fingerprint != fingerprint) {
            info!(previous = %previous.fingerprint, current = %fingerprint, "schema changed; resetting local replica");
            self.store.reset().await?;
        }
        Ok(())
    }

    async fn create_collections(&self, version: u32) -> Result<(), SessionError> {
        for table in self.schema.tables() {
            let previous = self
                .store
                .create_collection(&table.name, &table.collection_shape(version))
                .await?;
            match previous {
                Some(from) if from < version => self.migrate(&table.name, from).await?,
                Some(from) if from > version => {
                    warn!(table = %table.name, from, to = version, "collection is newer than the schema version");
                }
                _ => {}
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn migrate(&self, table: &str, from: u32) -> Result<(), SessionError> {
        let Some(migration) = &self.migration else {
            debug!("no migration strategy; documents kept as stored");
            return Ok(());
        };
        let documents = self.store.all(table).await?;
        let (mut kept, mut dropped) = (0_usize, 0_usize);
        for document in documents {
            let id = document.id.clone();
            match migration(document, from) {
                Some(migrated) => {
                    self.store.upsert(table, migrated).await?;
                    kept += 1;
                }
                None => {
                    self.store.remove(table, &id).await?;
                    dropped += 1;
                }
            }
        }
        info!(kept, dropped, "collection migrated");
        Ok(())
    }
}
