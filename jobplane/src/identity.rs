//! Node key pair loading.
//!
//! The key pair determines the node's [`libp2p::PeerId`]. Without a key file
//! the node gets a fresh identity on every start; with one, the identity
//! survives restarts.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use libp2p::identity::Keypair;
use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read key file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write key file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key file {path} is not a valid key pair: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("failed to encode key pair: {0}")]
    Encode(String),
}

/// Loads the key pair at `path`, creating it if missing.
///
/// `None` yields an ephemeral Ed25519 key pair. New key files are written
/// with owner-only permissions on Unix.
pub fn load_or_generate(path: Option<&Path>) -> Result<Keypair, IdentityError> {
    let Some(path) = path else {
        return Ok(Keypair::generate_ed25519());
    };

    if path.exists() {
        let bytes = fs::read(path).map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let keypair =
            Keypair::from_protobuf_encoding(&bytes).map_err(|e| IdentityError::Decode {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        info!("Loaded node identity from {}", path.display());
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| IdentityError::Encode(e.to_string()))?;
    write_private(path, &bytes).map_err(|source| IdentityError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Generated node identity at {}", path.display());
    Ok(keypair)
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
