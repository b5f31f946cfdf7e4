pub mod config;
pub mod orchestrator;
pub mod prompt;
pub mod runtime;
pub mod ssh;
pub mod tag;

// Re-export dependencies potentially needed by consumers (like the binary)
pub use bollard;
pub use kdk_common as common;

pub use config::{ConfigStore, KdkConfig};
pub use orchestrator::{Orchestrator, CONTAINER_NAME};
pub use runtime::{ContainerRuntime, DockerRuntime, LaunchSpec};
