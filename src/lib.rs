pub mod config;
pub mod forge;
pub mod migration;

pub use config::Config;

// Re-export the core types for convenience
pub use forge::{
    ArchiveHandle, DestForge, ForgeError, ForgeFactory, ForgeHolder, ForgeSet, MigrationPhase,
    MigrationPoll, MigrationStatus, ResolvedSource, ResolvedTarget, RestForgeFactory, SourceForge,
};
pub use migration::{
    create_pool, ClaimContext, CoreEvent, DynamicConfig, ManagerOptions, MemStore,
    MigrationError, MigrationManager, MigrationWorker, PgStore, Store, StoreError,
    TransitionPatch,
};
pub use migration::models::{
    AttemptOutcome, Batch, BatchState, CollisionPolicy, DestCredentials, MigrationAttempt,
    MigrationKind, NewAttempt, NewRepository, RepoState, Repository, RetrySettings, Settings,
    Visibility,
};
