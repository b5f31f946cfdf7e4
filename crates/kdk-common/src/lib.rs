// Shared error taxonomy and value types used across the kdk crates.

use std::fmt::Display;
use std::str::FromStr;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KdkError {
    #[error("Runtime Error: {0}")]
    Runtime(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Wrong State: {0}")]
    WrongState(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Provisioning Failed: {0}")]
    Provision(String),

    #[error("Declined: {0}")]
    Declined(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Define the primary Result type for kdk operations
pub type Result<T> = std::result::Result<T, KdkError>;

/// A failure from a step that must never abort the command it runs in.
///
/// The ssh session and keypair generation are the two call sites. Callers
/// log these at warn level and carry on; they never convert into `KdkError`.
#[derive(Error, Debug)]
#[error("best-effort step failed: {0}")]
pub struct BestEffort(pub String);

impl BestEffort {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A (repository, tag) image reference.
///
/// Serves two roles: the configured base image, and derived snapshot images
/// tagged `<user>-kdk:<unix-seconds>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = KdkError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(KdkError::Config("image reference is empty".to_string()));
        }
        // Split on the last ':' unless it belongs to a registry host:port.
        match s.rsplit_once(':') {
            Some((repo, tag)) if !repo.is_empty() && !tag.is_empty() && !tag.contains('/') => {
                Ok(Self::new(repo, tag))
            }
            _ => Ok(Self::new(s.trim_end_matches(':'), "latest")),
        }
    }
}

/// Handle to a container instance as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
}

impl Display for ContainerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ContainerDescriptor(name: {}, image: {}, running: {})",
            self.name, self.image, self.running
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_parsing() {
        let image: ImageRef = "ubuntu:24.04".parse().unwrap();
        assert_eq!(image.repository, "ubuntu");
        assert_eq!(image.tag, "24.04");
        assert_eq!(image.to_string(), "ubuntu:24.04");

        let untagged: ImageRef = "debian".parse().unwrap();
        assert_eq!(untagged.tag, "latest");

        // A registry port is not a tag
        let registry: ImageRef = "localhost:5000/dev/base".parse().unwrap();
        assert_eq!(registry.repository, "localhost:5000/dev/base");
        assert_eq!(registry.tag, "latest");

        let both: ImageRef = "localhost:5000/dev/base:v2".parse().unwrap();
        assert_eq!(both.repository, "localhost:5000/dev/base");
        assert_eq!(both.tag, "v2");

        assert!("".parse::<ImageRef>().is_err());
    }

    #[test]
    fn test_serialization() {
        let descriptor = ContainerDescriptor {
            id: "abc123".to_string(),
            name: "kdk".to_string(),
            image: "alice-kdk:1000".to_string(),
            running: true,
        };
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(json.contains("alice-kdk:1000"));

        let image = ImageRef::new("alice-kdk", "1000");
        let yaml = serde_yaml::to_string(&image).unwrap();
        let back: ImageRef = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn test_best_effort_display() {
        let err = BestEffort::new("keygen failed");
        assert_eq!(err.to_string(), "best-effort step failed: keygen failed");
    }
}
