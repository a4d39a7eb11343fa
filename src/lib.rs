// ABOUTME: Billing state synchronization library
// ABOUTME: Leases, per-dataset queues, change-stream watching, document serialization and reconciliation

pub mod backend;
pub mod config;
pub mod document;
pub mod error;
pub mod handlers;
pub mod lease;
pub mod manager;
pub mod model;
pub mod queue;
pub mod serialize;
pub mod sweeper;
pub mod upstream;
pub mod watcher;
pub mod webhook;

pub use config::{LeaseSettings, StateConfig};
pub use document::{ChangeEvent, ChangeKind, Document, DocumentRef, DocumentStore, Transaction};
pub use error::{Result, StateError};
pub use lease::{Lease, LeaseCoordinator, LockService, RetryStrategy};
pub use manager::{ResyncStats, StateManager};
pub use model::{Record, RecordKind};
pub use queue::{Queue, SetStore};
pub use sweeper::{SweepResult, Sweeper};
pub use watcher::ChangeStreamWatcher;
pub use webhook::{WebhookHandler, WebhookResponse};
