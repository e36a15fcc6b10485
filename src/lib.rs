pub mod coalescer;
pub mod error;
pub mod layout;
pub mod migration;
pub mod project;
pub mod rollback;
pub mod settings;
pub mod snapshot;
pub mod store;
pub mod window;

pub use coalescer::WriteCoalescer;
pub use error::TermKeepError;
pub use layout::{
    LiveTerminal, PersistedTerminal, PersistedTerminalLayout, RestorationService, TerminalBuffer,
    TerminalPool, TerminalSeed,
};
pub use migration::{MigrationEngine, MigrationEntry, MigrationRecord, MigrationRun};
pub use project::{Project, ProjectRegistry};
pub use rollback::{PendingRollback, RollbackVersionMetadata, VersionKeeper};
pub use settings::AppSettings;
pub use snapshot::{PersistedSnapshot, SnapshotStore};
pub use store::DurableStore;
pub use window::{DisplayBounds, WindowState, WindowTracker};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, TermKeepError>;
