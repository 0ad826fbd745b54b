//! Hardware-backed key operations behind one interface for TPM 1.2 and TPM 2.0.

use ambassador::delegatable_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::marshal::MarshalError;
use crate::proto::TpmVersion;

use self::common::TpmManagerError;
use self::pcr::PcrError;
use self::service::ServiceError;
use self::v1::tss::TssError;
use self::v2::authorization::AuthorizationError;
use self::v2::commands::Tpm2Error;

pub mod common;
#[cfg(feature = "tss-esapi")]
pub mod esapi;
pub mod local_data;
pub mod pcr;
pub mod service;
pub mod v1;
pub mod v2;

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("TPM utility is not initialized")]
    NotInitialized,
    #[error("{0} is not supported on {1}")]
    Unsupported(&'static str, TpmVersion),
    #[error("{0:?} keys are not supported for {1}")]
    UnsupportedKeyType(KeyType, &'static str),
    #[error("{0} is not available")]
    Unavailable(&'static str),
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("no {0} collaborator was provided")]
    MissingCollaborator(&'static str),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    Pcr(#[from] PcrError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    TpmManager(#[from] TpmManagerError),
    #[error(transparent)]
    Tss(#[from] TssError),
    #[error(transparent)]
    Tpm2(#[from] Tpm2Error),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ecc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyUsage {
    Sign,
    Decrypt,
}

/// A TPM-resident key certified by an identity key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CertifiedKey {
    pub key_blob: Vec<u8>,
    /// PKCS#1 `RSAPublicKey` for RSA keys, `SubjectPublicKeyInfo` for ECC keys.
    pub public_key_der: Vec<u8>,
    /// `TPM_PUBKEY` or `TPMT_PUBLIC`.
    pub public_key_tpm_format: Vec<u8>,
    /// The signed certification structure.
    pub key_info: Vec<u8>,
    pub proof: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PcrQuote {
    pub quoted_pcr_value: Vec<u8>,
    pub quoted_data: Vec<u8>,
    pub quote: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NvCertification {
    pub quoted_data: Vec<u8>,
    pub quote: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IdentityKey {
    pub identity_key_blob: Vec<u8>,
    /// PKCS#1 `RSAPublicKey`.
    pub identity_public_key_der: Vec<u8>,
    pub identity_public_key_tpm_format: Vec<u8>,
    /// TPM 1.2 `TPM_IDENTITY_CONTENTS` signature; TPM 2.0 identities have none.
    pub identity_binding: Option<Vec<u8>>,
}

/// Operations an attestation service needs from the platform TPM.
///
/// `initialize` must succeed before anything else is called. Key blobs are
/// opaque and only meaningful to the backend that produced them.
#[delegatable_trait]
pub trait TpmUtility {
    fn initialize(&mut self) -> crate::tpm::Result<()>;

    fn version(&self) -> crate::proto::TpmVersion;

    fn is_tpm_ready(&mut self) -> bool;

    /// Recovers a TPM 1.2 identity credential with the endorsement key.
    fn activate_identity(
        &mut self,
        identity_key_blob: &[u8],
        asym_ca_contents: &[u8],
        sym_ca_attestation: &[u8],
    ) -> crate::tpm::Result<Vec<u8>>;

    /// Recovers a TPM 2.0 identity credential with the endorsement key of `key_type`.
    /// `wrapped_credential` is the encrypted identity carried in the
    /// credential's `wrapped_certificate.wrapped_key`.
    fn activate_identity_for_tpm2(
        &mut self,
        key_type: crate::tpm::KeyType,
        identity_key_blob: &[u8],
        encrypted_seed: &[u8],
        credential_mac: &[u8],
        wrapped_credential: &[u8],
    ) -> crate::tpm::Result<Vec<u8>>;

    fn create_certified_key(
        &mut self,
        key_type: crate::tpm::KeyType,
        key_usage: crate::tpm::KeyUsage,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> crate::tpm::Result<crate::tpm::CertifiedKey>;

    fn seal_to_pcr0(&mut self, data: &[u8]) -> crate::tpm::Result<Vec<u8>>;

    fn unseal(&mut self, sealed_data: &[u8]) -> crate::tpm::Result<Vec<u8>>;

    /// Endorsement public key as a DER `SubjectPublicKeyInfo`.
    fn get_endorsement_public_key(
        &mut self,
        key_type: crate::tpm::KeyType,
    ) -> crate::tpm::Result<Vec<u8>>;

    fn get_endorsement_certificate(
        &mut self,
        key_type: crate::tpm::KeyType,
    ) -> crate::tpm::Result<Vec<u8>>;

    fn unbind(&mut self, key_blob: &[u8], bound_data: &[u8]) -> crate::tpm::Result<Vec<u8>>;

    /// Signature over SHA-256 of `data_to_sign`: RSASSA-PKCS1-v1_5 for RSA
    /// keys, DER-encoded ECDSA for ECC keys.
    fn sign(&mut self, key_blob: &[u8], data_to_sign: &[u8]) -> crate::tpm::Result<Vec<u8>>;

    fn quote_pcr(
        &mut self,
        pcr_index: u32,
        key_blob: &[u8],
    ) -> crate::tpm::Result<crate::tpm::PcrQuote>;

    /// Checks that `quoted_data` quotes exactly `pcr_index` holding
    /// `quoted_pcr_value`. The signature in `quote` is not verified here.
    fn is_quote_for_pcr(
        &self,
        quoted_pcr_value: &[u8],
        quoted_data: &[u8],
        quote: &[u8],
        pcr_index: u32,
    ) -> bool;

    fn read_pcr(&mut self, pcr_index: u32) -> crate::tpm::Result<Vec<u8>>;

    fn get_nv_data_size(&mut self, nv_index: u32) -> crate::tpm::Result<u16>;

    fn certify_nv(
        &mut self,
        nv_index: u32,
        nv_size: u16,
        key_blob: &[u8],
    ) -> crate::tpm::Result<crate::tpm::NvCertification>;

    /// Drops this subsystem's hold on the owner password. Succeeds when the
    /// dependency is already gone.
    fn remove_owner_dependency(&mut self) -> crate::tpm::Result<()>;

    fn get_endorsement_public_key_modulus(
        &mut self,
        key_type: crate::tpm::KeyType,
    ) -> crate::tpm::Result<Vec<u8>>;

    fn create_identity(
        &mut self,
        key_type: crate::tpm::KeyType,
    ) -> crate::tpm::Result<crate::tpm::IdentityKey>;

    fn get_rsu_device_id(&mut self) -> crate::tpm::Result<Vec<u8>>;
}

// After the trait: `#[derive(Delegate)]` needs the macros `#[delegatable_trait]` defines.
pub mod factory;

pub use factory::{AnyTpmUtility, Collaborators};
