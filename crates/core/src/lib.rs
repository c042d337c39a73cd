//! Core library: file lifecycle, conflict-merging updates, error recovery and rollback.

pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod error_classifier;
pub mod events;
pub mod lifecycle;
pub mod mover;
pub mod paths;
pub mod resolver;
pub mod rollback;

pub use coordinator::{BulkUpdateResult, TransactionalUpdateCoordinator};
pub use error::{LifecycleError, MoveError, ResolveError, RollbackError};
pub use error_classifier::{ErrorClassifier, ErrorContext, ErrorType, RecoveryAction};
pub use lifecycle::FileLifecycleService;
pub use mover::{MoveOptions, MoveOutcome, Mover};
pub use resolver::ConcurrencyResolver;
pub use rollback::RollbackManager;
