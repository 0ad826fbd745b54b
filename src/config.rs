//! Process configuration, read once at start-up.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::proto::TpmVersion;
use crate::tpm::v2::Tpm2Settings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tpm_version: TpmVersion,
    /// Dependency released by `remove_owner_dependency`.
    pub owner_dependency: String,
    pub salting_key_handle: u32,
    pub endorsement_certificate_index_v1: u32,
    pub endorsement_certificate_index_rsa_v2: u32,
    pub endorsement_certificate_index_ecc_v2: u32,
    pub tcti: String,
    pub local_data_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let tpm2 = Tpm2Settings::default();
        Self {
            tpm_version: TpmVersion::Tpm20,
            owner_dependency: "attestation".to_string(),
            salting_key_handle: tpm2.salting_key_handle,
            endorsement_certificate_index_v1: 0x1000_f000,
            endorsement_certificate_index_rsa_v2: tpm2.rsa_endorsement_certificate_index,
            endorsement_certificate_index_ecc_v2: tpm2.ecc_endorsement_certificate_index,
            tcti: "device:/dev/tpmrm0".to_string(),
            local_data_path: None,
        }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config = Self::from_yaml(&contents)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn tpm2_settings(&self) -> Tpm2Settings {
        Tpm2Settings {
            salting_key_handle: self.salting_key_handle,
            rsa_endorsement_certificate_index: self.endorsement_certificate_index_rsa_v2,
            ecc_endorsement_certificate_index: self.endorsement_certificate_index_ecc_v2,
        }
    }
}
