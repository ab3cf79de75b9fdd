//! Payload Deployer
//!
//! Copies the relay helper binary into a container's filesystem.

use anyhow::{Context, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::InjectError;
use crate::runtime::adapter::RuntimeAdapter;

/// Permissions given to the helper inside the container
const PAYLOAD_MODE: u32 = 0o755;

/// The relay helper binary
#[derive(Debug, Clone)]
pub struct Payload {
    name: String,
    bytes: Bytes,
    digest: String,
}

impl Payload {
    /// Wrap helper bytes that will be installed under `name`
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let digest = hex::encode(Sha256::digest(&bytes));
        Self {
            name: name.into(),
            bytes,
            digest,
        }
    }

    /// Read the helper binary from the host filesystem
    pub fn load(path: &Path, name: impl Into<String>) -> Result<Self, InjectError> {
        let bytes = std::fs::read(path).map_err(|source| InjectError::Payload {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(name, bytes))
    }

    /// File name inside the install directory
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hex-encoded SHA-256 of the helper binary
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Pack the helper into a single-entry tar archive
    pub fn to_archive(&self) -> Result<Bytes> {
        let mut header = tar::Header::new_gnu();
        header
            .set_path(&self.name)
            .with_context(|| format!("Invalid payload name: {}", self.name))?;
        header.set_size(self.bytes.len() as u64);
        header.set_mode(PAYLOAD_MODE);
        header.set_mtime(0);
        header.set_cksum();

        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append(&header, self.bytes.as_ref())
            .context("Failed to append payload to archive")?;
        let archive = builder
            .into_inner()
            .context("Failed to finish payload archive")?;

        Ok(Bytes::from(archive))
    }
}

/// Deploys the helper into containers through the runtime
pub struct PayloadDeployer<R: RuntimeAdapter> {
    runtime: Arc<R>,
    payload: Payload,
    install_dir: String,
    archive: Bytes,
}

impl<R: RuntimeAdapter> PayloadDeployer<R> {
    /// Create a new deployer installing `payload` into `install_dir`
    pub fn new(runtime: Arc<R>, payload: Payload, install_dir: impl Into<String>) -> Result<Self> {
        let archive = payload.to_archive()?;
        Ok(Self {
            runtime,
            payload,
            install_dir: install_dir.into(),
            archive,
        })
    }

    /// Absolute path of the helper inside a container once deployed
    pub fn install_path(&self) -> String {
        format!(
            "{}/{}",
            self.install_dir.trim_end_matches('/'),
            self.payload.name()
        )
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Copy the helper into the container, overwriting any previous copy.
    ///
    /// Not retried here; the next discovery cycle retries naturally.
    pub async fn deploy(&self, container_id: &str) -> Result<(), InjectError> {
        debug!(
            container_id = %container_id,
            path = %self.install_path(),
            digest = %self.payload.digest(),
            "Copying relay helper into container"
        );

        self.runtime
            .upload_archive(container_id, &self.install_dir, self.archive.clone())
            .await
            .map_err(InjectError::Deploy)
    }
}
