//! TPM state service backed by a local TPM 2.0 through `tss-esapi`.
//!
//! Owner secrets come from a [`LocalDataStore`]; enabled and owned are read
//! from the TPM's permanent and startup-clear properties.

use std::path::PathBuf;
use std::str::FromStr;

use tss_esapi::abstraction::nv;
use tss_esapi::constants::property_tag::PropertyTag;
use tss_esapi::handles::{NvIndexTpmHandle, TpmHandle};
use tss_esapi::interface_types::resource_handles::{Hierarchy, NvAuth};
use tss_esapi::structures::Auth;
use tss_esapi::tcti_ldr::TctiNameConf;

use super::common::{TpmManager, TpmManagerError, TpmManagerFactory, TpmStatus};
use super::local_data::LocalDataStore;

const PERMANENT_OWNER_AUTH_SET: u32 = 1 << 0;
const STARTUP_CLEAR_SH_ENABLE: u32 = 1 << 1;
const STARTUP_CLEAR_EH_ENABLE: u32 = 1 << 2;

fn unavailable(e: tss_esapi::Error) -> TpmManagerError {
    TpmManagerError::Unavailable(e.to_string())
}

pub struct EsapiTpmManager {
    context: tss_esapi::Context,
    local_data: LocalDataStore,
}

impl EsapiTpmManager {
    pub fn new(tcti: &str, local_data: LocalDataStore) -> Result<Self, TpmManagerError> {
        let tcti = TctiNameConf::from_str(tcti).map_err(unavailable)?;
        let context = tss_esapi::Context::new(tcti).map_err(unavailable)?;
        Ok(Self {
            context,
            local_data,
        })
    }

    /// The context is opened on the state service's worker thread.
    pub fn factory(tcti: String, local_data_path: PathBuf) -> TpmManagerFactory {
        Box::new(move || {
            let manager = Self::new(&tcti, LocalDataStore::new(local_data_path))?;
            Ok(Box::new(manager) as Box<dyn TpmManager>)
        })
    }

    fn property(&mut self, tag: PropertyTag) -> Result<u32, TpmManagerError> {
        Ok(self
            .context
            .get_tpm_property(tag)
            .map_err(unavailable)?
            .unwrap_or_default())
    }
}

impl TpmManager for EsapiTpmManager {
    fn get_tpm_status(&mut self) -> Result<TpmStatus, TpmManagerError> {
        let startup_clear = self.property(PropertyTag::StartupClear)?;
        let permanent = self.property(PropertyTag::Permanent)?;
        let enable = STARTUP_CLEAR_SH_ENABLE | STARTUP_CLEAR_EH_ENABLE;
        Ok(TpmStatus {
            enabled: startup_clear & enable == enable,
            owned: permanent & PERMANENT_OWNER_AUTH_SET != 0,
            local_data: self.local_data.load()?,
        })
    }

    fn remove_owner_dependency(&mut self, dependency: &str) -> Result<(), TpmManagerError> {
        let removed = self
            .local_data
            .update(|local_data| local_data.remove_owner_dependency(dependency))?;
        if !removed {
            log::debug!("Owner dependency `{}` was not held", dependency);
        }
        Ok(())
    }

    fn read_space(
        &mut self,
        nv_index: u32,
        use_owner_authorization: bool,
    ) -> Result<Vec<u8>, TpmManagerError> {
        let read_error = |e: tss_esapi::Error| TpmManagerError::ReadSpace(nv_index, e.to_string());
        let nv_index_handle = NvIndexTpmHandle::new(nv_index).map_err(read_error)?;
        let index = self
            .context
            .execute_without_session(|ctx| {
                ctx.tr_from_tpm_public(TpmHandle::NvIndex(nv_index_handle))
            })
            .map_err(|_| TpmManagerError::NvSpaceMissing(nv_index))?;

        let auth = match use_owner_authorization {
            true => {
                let owner_password = self.local_data.load()?.owner_password.to_vec();
                let owner_auth = Auth::try_from(owner_password).map_err(read_error)?;
                self.context
                    .tr_set_auth(Hierarchy::Owner.into(), owner_auth)
                    .map_err(read_error)?;
                NvAuth::Owner
            }
            false => NvAuth::NvIndex(index.into()),
        };
        let data = self
            .context
            .execute_with_nullauth_session(|ctx| nv::read_full(ctx, auth, nv_index_handle))
            .map_err(read_error)?;
        // Leave the owner authorization unset between requests.
        if use_owner_authorization {
            self.context
                .tr_set_auth(Hierarchy::Owner.into(), Auth::default())
                .map_err(read_error)?;
        }
        Ok(data)
    }
}
