//! The persisted configuration record and its YAML store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kdk_common::{ImageRef, KdkError, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::runtime::{LaunchSpec, PortMapping};

/// Enumerated runtime invocation options.
///
/// Every field the run call accepts is named here and validated before any
/// runtime call is made; there is no pass-through of arbitrary options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Volume binds, `HOST:CONTAINER` or `HOST:CONTAINER:MODE`.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Published ports, `HOST:CONTAINER` or `IP:HOST:CONTAINER`.
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub security_opt: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSettings {
    /// Host port the container's sshd is published on.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user inside the container.
    #[serde(default = "default_ssh_user")]
    pub user: String,
}

fn default_ssh_port() -> u16 {
    2222
}

fn default_ssh_user() -> String {
    "kdk".to_string()
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            user: default_ssh_user(),
        }
    }
}

/// The configuration record: base image, runtime options, environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdkConfig {
    pub image: ImageRef,
    #[serde(default)]
    pub runtime: RunOptions,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ssh: SshSettings,
}

impl KdkConfig {
    /// Validate the runtime options and flatten them into a launch spec for
    /// the given image. Errors here stop the command before any runtime call.
    pub fn launch_spec(&self, image: &ImageRef) -> Result<LaunchSpec> {
        for volume in &self.runtime.volumes {
            if !volume.contains(':') {
                return Err(KdkError::Config(format!(
                    "invalid volume spec '{volume}': expected HOST:CONTAINER"
                )));
            }
        }
        let ports = self
            .runtime
            .ports
            .iter()
            .map(|spec| parse_port_spec(spec))
            .collect::<Result<Vec<_>>>()?;
        let env = self
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        Ok(LaunchSpec {
            image: image.to_string(),
            env,
            binds: self.runtime.volumes.clone(),
            ports,
            cap_add: self.runtime.cap_add.clone(),
            security_opt: self.runtime.security_opt.clone(),
            privileged: self.runtime.privileged,
        })
    }
}

fn parse_port_spec(spec: &str) -> Result<PortMapping> {
    let invalid = || {
        KdkError::Config(format!(
            "invalid port spec '{spec}': expected HOST:CONTAINER or IP:HOST:CONTAINER"
        ))
    };
    let parts: Vec<&str> = spec.split(':').collect();
    let (host_ip, host, container) = match parts.as_slice() {
        [host, container] => (None, *host, *container),
        [ip, host, container] => (Some(ip.to_string()), *host, *container),
        _ => return Err(invalid()),
    };
    Ok(PortMapping {
        host_ip,
        host_port: host.parse().map_err(|_| invalid())?,
        container_port: container.parse().map_err(|_| invalid())?,
    })
}

/// YAML-backed persistence for the configuration record.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$KDK_CONFIG` if set, else `$HOME/.config/kdk/config.yaml`.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("KDK_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        let home = std::env::var("HOME")
            .map_err(|_| KdkError::Config("HOME is not set and KDK_CONFIG is unset".to_string()))?;
        Ok(Path::new(&home).join(".config").join("kdk").join("config.yaml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory the ssh identity lives in, beside the config file.
    pub fn key_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub async fn load(&self) -> Result<KdkConfig> {
        if !self.exists() {
            return Err(KdkError::Config(format!(
                "no configuration at {}; run `kdk init` first",
                self.path.display()
            )));
        }
        let raw = fs::read_to_string(&self.path).await?;
        serde_yaml::from_str(&raw).map_err(|e| {
            KdkError::Config(format!("failed to parse {}: {e}", self.path.display()))
        })
    }

    pub async fn save(&self, config: &KdkConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let raw = serde_yaml::to_string(config)
            .map_err(|e| KdkError::Config(format!("failed to serialize configuration: {e}")))?;
        fs::write(&self.path, raw).await?;
        info!(path = %self.path.display(), "configuration written");
        Ok(())
    }
}
