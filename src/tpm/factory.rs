//! Picks the backend for the TPM this process talks to.

use ambassador::Delegate;

use super::common::TpmManagerFactory;
use super::v1::tss::TssConnector;
use super::v1::TpmUtilityV1;
use super::v2::commands::Tpm2CommandsFactory;
use super::v2::TpmUtilityV2;
use super::{Result, TpmError, TpmUtility};
use crate::config::Config;
use crate::proto::TpmVersion;

/// Connections a backend is built on. Only the one matching the configured
/// TPM version is used.
pub struct Collaborators {
    pub tpm_manager: TpmManagerFactory,
    pub tss_connector: Option<Box<dyn TssConnector>>,
    /// TPM 2.0 command transport; the crate ships none.
    pub tpm2_commands: Option<Tpm2CommandsFactory>,
}

#[derive(Delegate)]
#[delegate(TpmUtility)]
pub enum AnyTpmUtility {
    V1(TpmUtilityV1),
    V2(TpmUtilityV2),
}

impl AnyTpmUtility {
    /// Builds the backend for `config.tpm_version`. The result still needs
    /// `initialize`.
    pub fn from_config(config: &Config, collaborators: Collaborators) -> Result<Self> {
        log::info!("Using the {} backend", config.tpm_version);
        match config.tpm_version {
            TpmVersion::Tpm12 => {
                let connector = collaborators
                    .tss_connector
                    .ok_or(TpmError::MissingCollaborator("TPM 1.2 TSS connection"))?;
                Ok(Self::V1(TpmUtilityV1::with_manager(
                    &config.owner_dependency,
                    collaborators.tpm_manager,
                    connector,
                    config.endorsement_certificate_index_v1,
                )))
            }
            TpmVersion::Tpm20 => {
                let tpm2_commands = collaborators
                    .tpm2_commands
                    .ok_or(TpmError::MissingCollaborator("TPM 2.0 command layer"))?;
                Ok(Self::V2(TpmUtilityV2::with_manager(
                    &config.owner_dependency,
                    collaborators.tpm_manager,
                    tpm2_commands,
                    config.tpm2_settings(),
                )))
            }
        }
    }
}
