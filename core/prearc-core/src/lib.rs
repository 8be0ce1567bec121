//! # prearc-core
//!
//! Staging ("prearchive") lifecycle for incoming imaging sessions: the status
//! state machine, where sessions live on disk, the operations that move them
//! between states, advisory per-session file locks and a per-session log.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Every operation blocks its calling thread.
//! - **Collaborators behind traits**: Persistence, project configuration,
//!   authorization and document building are injected (see [`services`], [`store`]).
//! - **No hidden globals**: The status lookup table is built once and owned by
//!   [`Prearchive`]; the only process-wide state is the lock directory mutex.
//! - **Optimistic concurrency**: Records carry a version; the transition guard
//!   enters a shadow state by compare-and-swap.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use prearc_core::{Prearchive, PrearcConfig, Triple};
//!
//! let prearchive = Prearchive::from_config(PrearcConfig::load(None)?)?;
//! let triple = Triple::new(Some("ALPHA"), "20240102_030405", "S1");
//! let record = prearchive.add_session(&triple, None)?;
//! ```

// Public modules
pub mod builder;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod locator;
pub mod lock;
pub mod logs;
pub mod services;
pub mod status;
pub mod store;
pub mod timestamp;
pub mod types;

// Re-export commonly used items at crate root
pub use builder::{DirectorySessionBuilder, SessionDocument};
pub use config::{ConfigProjectDirectory, PrearcConfig, ProjectConfig, StorageLayout};
pub use error::{PrearcError, Result};
pub use lifecycle::{
    ArchivePolicy, ArchiveRequest, BuildRequest, Prearchive, RequestMetadata, Settle,
};
pub use locator::SessionLocator;
pub use lock::{SessionFileLock, SessionLockManager};
pub use logs::SessionLogs;
pub use services::{Authorizer, BuildParams, GrantAuthorizer, ProjectDirectory, SessionBuilder, SitePreferences};
pub use status::{potentially_ready, PrearcStatus, StatusFamily, StatusTable};
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore};
pub use timestamp::{is_timestamp_dir, make_timestamp_dir, parse_timestamp_dir};
pub use types::*;
