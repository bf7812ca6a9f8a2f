//! Language runtime sessions.

mod models;
mod probe;
mod registry;
mod store;

pub use models::{
    DocumentContext, Frontmatter, ProjectConfig, RuntimeMode, RuntimeSession, SessionState,
    StartConfig,
};
pub use probe::HealthProbe;
pub use registry::{RegistryOptions, RuntimeRegistry};
pub use store::{PersistedRuntime, StateStore};
