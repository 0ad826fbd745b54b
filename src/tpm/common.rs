//! State shared by both TPM backends: readiness and the secrets the TPM state
//! service hands out.

use thiserror::Error;
use zeroize::Zeroizing;

use super::local_data::{LocalData, LocalDataError};
use super::service::ServiceThread;
use super::{Result, TpmError};

#[derive(Error, Debug)]
pub enum TpmManagerError {
    #[error("TPM state service is unavailable: {0}")]
    Unavailable(String),
    #[error("NV space {0:#x} does not exist")]
    NvSpaceMissing(u32),
    #[error("failed to read NV space {0:#x}: {1}")]
    ReadSpace(u32, String),
    #[error(transparent)]
    LocalData(#[from] LocalDataError),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TpmStatus {
    pub enabled: bool,
    pub owned: bool,
    pub local_data: LocalData,
}

/// The out-of-process service that owns the TPM and its owner secrets.
///
/// Implementations are created and used on one thread; see [`ServiceThread`].
pub trait TpmManager {
    fn get_tpm_status(&mut self) -> Result<TpmStatus, TpmManagerError>;

    /// Removing a dependency that is not held succeeds.
    fn remove_owner_dependency(&mut self, dependency: &str) -> Result<(), TpmManagerError>;

    fn read_space(
        &mut self,
        nv_index: u32,
        use_owner_authorization: bool,
    ) -> Result<Vec<u8>, TpmManagerError>;
}

pub type TpmManagerFactory =
    Box<dyn FnOnce() -> Result<Box<dyn TpmManager>, TpmManagerError> + Send>;

#[derive(Default)]
struct TpmStateCache {
    /// `None` until the state service has answered once.
    is_ready: Option<bool>,
    endorsement_password: Zeroizing<Vec<u8>>,
    owner_password: Zeroizing<Vec<u8>>,
    delegate_blob: Vec<u8>,
    delegate_secret: Zeroizing<Vec<u8>>,
}

/// Owner delegation credentials for TPM 1.2.
pub struct Delegate {
    pub blob: Vec<u8>,
    pub secret: Zeroizing<Vec<u8>>,
}

pub struct TpmUtilityCommon {
    owner_dependency: String,
    manager_factory: Option<TpmManagerFactory>,
    service: Option<ServiceThread<dyn TpmManager>>,
    state: TpmStateCache,
}

impl TpmUtilityCommon {
    pub fn new(owner_dependency: impl Into<String>, manager_factory: TpmManagerFactory) -> Self {
        Self {
            owner_dependency: owner_dependency.into(),
            manager_factory: Some(manager_factory),
            service: None,
            state: TpmStateCache::default(),
        }
    }

    /// Starts the state service thread. Calling it again is a no-op.
    pub fn initialize(&mut self) -> Result<()> {
        if self.service.is_some() {
            return Ok(());
        }
        let factory = self
            .manager_factory
            .take()
            .ok_or(TpmError::MissingCollaborator("TPM state service"))?;
        self.service = Some(ServiceThread::spawn("tpm_manager", factory)?);
        log::debug!("TPM state service started");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.service.is_some()
    }

    fn service(&self) -> Result<&ServiceThread<dyn TpmManager>> {
        self.service.as_ref().ok_or(TpmError::NotInitialized)
    }

    /// Readiness is re-queried until the TPM reports enabled and owned; after
    /// that the cached answer stands until [`Self::invalidate`].
    pub fn is_tpm_ready(&mut self) -> bool {
        if self.state.is_ready != Some(true) {
            if let Err(e) = self.cache_tpm_state() {
                log::error!("Failed to get TPM state: {}", e);
            }
        }
        self.state.is_ready == Some(true)
    }

    /// Forgets everything learned from the state service.
    pub fn invalidate(&mut self) {
        self.state = TpmStateCache::default();
    }

    pub fn cache_tpm_state(&mut self) -> Result<()> {
        let status = self.service()?.call(|manager| manager.get_tpm_status())??;
        let local_data = &status.local_data;
        self.state.is_ready = Some(status.enabled && status.owned);
        self.state.endorsement_password = local_data.endorsement_password.clone();
        self.state.owner_password = local_data.owner_password.clone();
        match &local_data.owner_delegate {
            Some(delegate) => {
                self.state.delegate_blob = delegate.blob.clone();
                self.state.delegate_secret = delegate.secret.clone();
            }
            None => {
                self.state.delegate_blob.clear();
                self.state.delegate_secret = Zeroizing::default();
            }
        }
        log::debug!(
            "TPM enabled: {}, owned: {}",
            status.enabled,
            status.owned
        );
        Ok(())
    }

    pub fn endorsement_password(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        if self.state.endorsement_password.is_empty() {
            self.cache_tpm_state()?;
        }
        match self.state.endorsement_password.is_empty() {
            true => Err(TpmError::Unavailable("endorsement password")),
            false => Ok(self.state.endorsement_password.clone()),
        }
    }

    pub fn owner_password(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        if self.state.owner_password.is_empty() {
            self.cache_tpm_state()?;
        }
        match self.state.owner_password.is_empty() {
            true => Err(TpmError::Unavailable("owner password")),
            false => Ok(self.state.owner_password.clone()),
        }
    }

    pub fn delegate(&mut self) -> Result<Delegate> {
        if self.state.delegate_blob.is_empty() || self.state.delegate_secret.is_empty() {
            self.cache_tpm_state()?;
        }
        if self.state.delegate_blob.is_empty() || self.state.delegate_secret.is_empty() {
            return Err(TpmError::Unavailable("owner delegate"));
        }
        Ok(Delegate {
            blob: self.state.delegate_blob.clone(),
            secret: self.state.delegate_secret.clone(),
        })
    }

    pub fn remove_owner_dependency(&mut self) -> Result<()> {
        let dependency = self.owner_dependency.clone();
        self.service()?
            .call(move |manager| manager.remove_owner_dependency(&dependency))??;
        // The owner password may have been cleared by the service.
        self.state.owner_password = Zeroizing::default();
        log::info!("Removed owner dependency `{}`", self.owner_dependency);
        Ok(())
    }

    pub fn read_space(&mut self, nv_index: u32, use_owner_authorization: bool) -> Result<Vec<u8>> {
        Ok(self
            .service()?
            .call(move |manager| manager.read_space(nv_index, use_owner_authorization))??)
    }
}
