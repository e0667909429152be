//! Plansync - Composite Plan Document Store
//!
//! Stores nested insurance-plan documents as normalized records, mirrors them
//! into a parent-child search index, and applies every mutation through a
//! single queue consumer.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Plansync                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │   Auth      │  │   Plan      │  │   Plan Schema           │  │
//! │  │   Gateway   │──▶   Service   │──▶   (Validator)           │  │
//! │  └─────────────┘  └──┬───────┬──┘  └─────────────────────────┘  │
//! │            reads     │       │ create / update / delete         │
//! │        ┌─────────────┘       ▼                                  │
//! │        │            ┌─────────────────┐                         │
//! │        │            │ Mutation Queue  │                         │
//! │        │            └────────┬────────┘                         │
//! │        │                     ▼                                  │
//! │        │            ┌─────────────────┐   ┌──────────────────┐  │
//! │        │            │   Consumer      │──▶│   Sync Engine    │  │
//! │        │            │ (single flight) │   │ decompose/merge/ │  │
//! │        │            └─────────────────┘   │ cascade delete   │  │
//! │        │                                  └───┬──────────┬───┘  │
//! │        ▼                                      ▼          ▼      │
//! │  ┌─────────────────────────────────┐  ┌──────────────────────┐  │
//! │  │        Primary Store            │  │    Search Index      │  │
//! │  │  p1, type:id records, ETags     │  │  join_field parent/  │  │
//! │  │                                 │  │  child, routed by p1 │  │
//! │  └─────────────────────────────────┘  └──────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod cascade;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod etag;
pub mod index;
pub mod queue;
pub mod schema;
pub mod service;
pub mod storage;
pub mod validation;

pub use config::{Config, Environment};
pub use engine::{Applied, SyncEngine};
pub use error::{Error, ErrorKind, Result};
pub use schema::PlanSchema;
pub use service::{Accepted, Conditional, PlanService};

use std::sync::Arc;

use auth::AuthGateway;
use index::{MemoryIndex, SearchIndex};
use queue::{ChannelQueue, Consumer, ConsumerHandle, QueueError, StatsSnapshot};
use storage::{FileStore, MemoryStore, PrimaryStore};

/// The main plansync handle
///
/// Store, index and queue are opened once here and shared with every
/// component.
pub struct Plansync {
    pub config: Config,
    store: Arc<dyn PrimaryStore>,
    index: Arc<dyn SearchIndex>,
    queue: Arc<ChannelQueue>,
    engine: Arc<SyncEngine>,
    service: PlanService,
    auth: Arc<dyn AuthGateway>,
}

impl Plansync {
    /// Open the file store and index snapshot under `config.data_dir`
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let store = FileStore::open(&config.data_dir);
        store.ensure_exists().await?;

        let index = if config.persist_index {
            MemoryIndex::open(config.index_name.clone(), &config.index_snapshot()).await?
        } else {
            MemoryIndex::new(config.index_name.clone())
        };

        tracing::info!(
            data_dir = %config.data_dir.display(),
            environment = %config.environment,
            "Opened plansync"
        );
        Self::assemble(config, Arc::new(store), Arc::new(index))
    }

    /// Everything in memory, nothing persisted
    pub fn in_memory(config: Config) -> anyhow::Result<Self> {
        let index = MemoryIndex::new(config.index_name.clone());
        Self::assemble(config, Arc::new(MemoryStore::new()), Arc::new(index))
    }

    fn assemble(
        config: Config,
        store: Arc<dyn PrimaryStore>,
        index: Arc<dyn SearchIndex>,
    ) -> anyhow::Result<Self> {
        let schema = Arc::new(match &config.schema_path {
            Some(path) => PlanSchema::load(path)?,
            None => PlanSchema::builtin(),
        });
        let queue = Arc::new(ChannelQueue::new(config.queue_name.clone(), config.queue_capacity));
        let engine = Arc::new(SyncEngine::new(store.clone(), index.clone(), schema.clone()));
        let service = PlanService::new(store.clone(), index.clone(), schema, queue.clone())
            .with_scan_pattern(config.plan_scan_pattern.clone());
        let auth = auth::gateway_for(&config);

        Ok(Self {
            config,
            store,
            index,
            queue,
            engine,
            service,
            auth,
        })
    }

    pub fn service(&self) -> &PlanService {
        &self.service
    }

    pub fn auth(&self) -> &dyn AuthGateway {
        self.auth.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn PrimaryStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    pub fn queue(&self) -> &ChannelQueue {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// The consumer for this instance's queue
    ///
    /// Fails with [`QueueError::ConsumerActive`] while another consumer,
    /// spawned or not, still exists.
    pub fn consumer(&self) -> std::result::Result<Consumer, QueueError> {
        Consumer::new(self.queue.clone(), self.engine.clone())
    }

    /// Run the consumer on its own task
    pub fn start_consumer(&self) -> std::result::Result<ConsumerHandle, QueueError> {
        Ok(self.consumer()?.spawn())
    }

    /// Apply every queued mutation now
    ///
    /// Refused while a started consumer owns the queue.
    pub async fn drain(&self) -> Result<StatsSnapshot> {
        let consumer = self.consumer()?;
        consumer.drain().await?;
        Ok(consumer.stats())
    }
}
