//! One-time ssh identity generation and interactive session attachment.
//!
//! Both operations are best-effort: failures here are reported to the caller
//! as [`BestEffort`] and must never abort the surrounding command.

use std::path::{Path, PathBuf};

use kdk_common::BestEffort;
use ring::rand::{SecureRandom, SystemRandom};
use ssh_key::private::Ed25519Keypair;
use ssh_key::{LineEnding, PrivateKey};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::SshSettings;

type Effort<T> = std::result::Result<T, BestEffort>;

fn best_effort(context: &str, err: impl std::fmt::Display) -> BestEffort {
    BestEffort::new(format!("{context}: {err}"))
}

/// Generate `id_ed25519` / `id_ed25519.pub` under `dir` if they do not exist
/// yet, and return the private key path. An existing key is left untouched.
pub async fn ensure_keypair(dir: &Path) -> Effort<PathBuf> {
    let private_path = dir.join("id_ed25519");
    if private_path.exists() {
        return Ok(private_path);
    }

    fs::create_dir_all(dir)
        .await
        .map_err(|e| best_effort("failed to create key directory", e))?;

    let rng = SystemRandom::new();
    let mut seed = [0u8; 32];
    rng.fill(&mut seed)
        .map_err(|e| BestEffort::new(format!("failed to generate key seed: {e:?}")))?;

    let keypair = Ed25519Keypair::from_seed(&seed);
    let private_key = PrivateKey::from(keypair);
    let public_key = private_key.public_key();

    let private_pem = private_key
        .to_openssh(LineEnding::LF)
        .map_err(|e| best_effort("failed to encode private key", e))?;
    fs::write(&private_path, private_pem.as_bytes())
        .await
        .map_err(|e| best_effort("failed to write private key", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&private_path)
            .await
            .map_err(|e| best_effort("failed to stat private key", e))?
            .permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&private_path, perms)
            .await
            .map_err(|e| best_effort("failed to restrict private key", e))?;
    }

    let public_str = public_key
        .to_openssh()
        .map_err(|e| best_effort("failed to encode public key", e))?;
    fs::write(dir.join("id_ed25519.pub"), public_str)
        .await
        .map_err(|e| best_effort("failed to write public key", e))?;

    info!(path = %private_path.display(), "generated ssh identity");
    Ok(private_path)
}

/// Open an interactive ssh session against the container's published port,
/// inheriting the terminal. A non-zero exit from the ssh client is not a
/// failure; only failing to launch it is.
pub async fn attach(settings: &SshSettings, identity: Option<&Path>) -> Effort<()> {
    let mut command = Command::new("ssh");
    command
        .arg("-p")
        .arg(settings.port.to_string())
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null");
    if let Some(identity) = identity {
        command.arg("-i").arg(identity);
    }
    command.arg(format!("{}@127.0.0.1", settings.user));

    let status = command
        .status()
        .await
        .map_err(|e| best_effort("failed to launch ssh", e))?;
    if !status.success() {
        debug!(code = ?status.code(), "ssh session ended with non-zero status");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_keypair_generated_once() {
        let dir = tempdir().unwrap();

        let path = ensure_keypair(dir.path()).await.unwrap();
        assert!(path.exists());
        assert!(dir.path().join("id_ed25519.pub").exists());

        let first = std::fs::read(&path).unwrap();
        assert!(String::from_utf8_lossy(&first).contains("OPENSSH PRIVATE KEY"));

        // Second call must not rewrite the identity
        let again = ensure_keypair(dir.path()).await.unwrap();
        assert_eq!(again, path);
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_key_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = ensure_keypair(dir.path()).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_unwritable_dir_is_best_effort() {
        // A file where the directory should be makes creation fail
        let dir = tempdir().unwrap();
        let blocked = dir.path().join("keys");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let err = ensure_keypair(&blocked).await.unwrap_err();
        assert!(err.to_string().contains("best-effort"));
    }
}
