//! Durable lifecycle log for orchestrated agents.
//!
//! Each line of the registry file is one [`RegistryEntry`]. Rows are only ever
//! appended; the two permitted in-place edits (stamping and clearing
//! `stoppedAt`) rewrite the whole file.

mod error;
mod record;
mod registry;
mod store;

pub use error::RegistryError;
pub use record::{AgentKind, AgentState, LocalAgent, RegistryEntry, RemoteAgent};
pub use registry::{Registry, FIND_WINDOW, REGISTRY_DIR, REGISTRY_FILE};
pub use store::{JsonlStore, RecordStore};
