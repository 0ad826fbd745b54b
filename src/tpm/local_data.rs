//! Owner-side secrets kept by the TPM state service between boots.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum LocalDataError {
    #[error("failed to access local data at {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to parse local data at {0}: {1}")]
    Parse(PathBuf, serde_yaml::Error),
    #[error("failed to serialize local data: {0}")]
    Serialize(serde_yaml::Error),
}

pub type Result<T, E = LocalDataError> = core::result::Result<T, E>;

/// Hex (de)serialization for secrets held in [`Zeroizing`] buffers.
mod secret_hex {
    use serde::{Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S: Serializer>(
        secret: &Zeroizing<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        hex::serde::serialize(secret.as_slice(), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Zeroizing<Vec<u8>>, D::Error> {
        hex::serde::deserialize::<D, Vec<u8>>(deserializer).map(Zeroizing::new)
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerDelegate {
    #[serde(with = "hex")]
    pub blob: Vec<u8>,
    #[serde(with = "secret_hex")]
    pub secret: Zeroizing<Vec<u8>>,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalData {
    #[serde(with = "secret_hex")]
    pub owner_password: Zeroizing<Vec<u8>>,
    #[serde(with = "secret_hex")]
    pub endorsement_password: Zeroizing<Vec<u8>>,
    pub owner_delegate: Option<OwnerDelegate>,
    /// Subsystems that still need the owner password.
    pub owner_dependency: Vec<String>,
}

impl std::fmt::Debug for LocalData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalData")
            .field("has_owner_password", &!self.owner_password.is_empty())
            .field("has_endorsement_password", &!self.endorsement_password.is_empty())
            .field("has_owner_delegate", &self.owner_delegate.is_some())
            .field("owner_dependency", &self.owner_dependency)
            .finish()
    }
}

impl LocalData {
    /// Removes `dependency`, clearing the owner password once nothing depends
    /// on it. Returns whether the dependency was present.
    pub fn remove_owner_dependency(&mut self, dependency: &str) -> bool {
        let before = self.owner_dependency.len();
        self.owner_dependency.retain(|d| d != dependency);
        let removed = self.owner_dependency.len() != before;
        if self.owner_dependency.is_empty() && !self.owner_password.is_empty() {
            log::info!("Clearing owner password: no dependencies left");
            self.owner_password = Zeroizing::default();
        }
        removed
    }
}

/// YAML file holding [`LocalData`].
#[derive(Clone, Debug)]
pub struct LocalDataStore {
    path: PathBuf,
}

impl LocalDataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the store; a missing file is empty local data.
    pub fn load(&self) -> Result<LocalData> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No local data at {}", self.path.display());
                return Ok(LocalData::default());
            }
            Err(e) => return Err(LocalDataError::Io(self.path.clone(), e)),
        };
        serde_yaml::from_str(&contents).map_err(|e| LocalDataError::Parse(self.path.clone(), e))
    }

    /// Replaces the store atomically.
    pub fn store(&self, local_data: &LocalData) -> Result<()> {
        let contents = serde_yaml::to_string(local_data).map_err(LocalDataError::Serialize)?;
        let io_error = |e| LocalDataError::Io(self.path.clone(), e);
        let staging = self.path.with_extension("tmp");
        let mut file = fs::File::create(&staging).map_err(io_error)?;
        file.write_all(contents.as_bytes()).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        fs::rename(&staging, &self.path).map_err(io_error)
    }

    /// Loads, edits and stores the local data in one step.
    pub fn update<R>(&self, edit: impl FnOnce(&mut LocalData) -> R) -> Result<R> {
        let mut local_data = self.load()?;
        let result = edit(&mut local_data);
        self.store(&local_data)?;
        Ok(result)
    }
}
