//! The migration core: persistence port, dynamic configuration, the worker
//! state machine, and the supervising manager.

pub mod dynamic_config;
pub mod error;
pub mod manager;
pub mod mem_store;
pub mod models;
pub mod pg_store;
pub mod retry;
pub mod state;
pub mod store;
pub mod worker;

pub use dynamic_config::DynamicConfig;
pub use error::{MigrationError, StoreError};
pub use manager::{CoreEvent, ManagerOptions, MigrationManager};
pub use mem_store::MemStore;
pub use models::{
    AttemptOutcome, Batch, BatchState, CollisionPolicy, DestCredentials, MigrationAttempt,
    MigrationKind, NewAttempt, NewRepository, RepoState, Repository, RetrySettings, Settings,
    Visibility,
};
pub use pg_store::{create_pool, PgStore};
pub use store::{ClaimContext, Store, TransitionPatch};
pub use worker::MigrationWorker;
