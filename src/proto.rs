//! Wire messages exchanged with attestation peers.
//!
//! Field numbers are fixed; new fields get new tags.

use prost::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("failed to decode {0}: {1}")]
    Decode(&'static str, prost::DecodeError),
    #[error("unknown TPM version {0}")]
    UnknownVersion(i32),
    #[error("{0} identity credential is missing `{1}`")]
    MissingField(TpmVersion, &'static str),
    #[error("{0} identity credential carries fields of another TPM version")]
    MixedVersions(TpmVersion),
}

pub type Result<T, E = ProtoError> = core::result::Result<T, E>;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    prost::Enumeration,
    Serialize,
    Deserialize,
)]
#[repr(i32)]
pub enum TpmVersion {
    #[serde(rename = "tpm1.2")]
    Tpm12 = 1,
    #[serde(rename = "tpm2")]
    Tpm20 = 2,
}

impl std::fmt::Display for TpmVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TpmVersion::Tpm12 => f.write_str("TPM 1.2"),
            TpmVersion::Tpm20 => f.write_str("TPM 2.0"),
        }
    }
}

/// Authenticated envelope: `mac` is HMAC-SHA512 over `iv || encrypted_data`.
#[derive(Clone, PartialEq, Message)]
pub struct EncryptedData {
    #[prost(bytes = "vec", tag = "1")]
    pub wrapped_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub iv: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub mac: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub encrypted_data: Vec<u8>,
    #[prost(string, optional, tag = "5")]
    pub wrapping_key_id: Option<String>,
}

impl EncryptedData {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes).map_err(|e| ProtoError::Decode("EncryptedData", e))
    }
}

/// A credential encrypted to a TPM's endorsement key, bound to one of its
/// identity keys.
#[derive(Clone, PartialEq, Message)]
pub struct EncryptedIdentityCredential {
    #[prost(enumeration = "TpmVersion", tag = "1")]
    pub tpm_version: i32,
    /// TPM 1.2 `TPM_ASYM_CA_CONTENTS`, encrypted to the endorsement key.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub asym_ca_contents: Option<Vec<u8>>,
    /// TPM 1.2 `TPM_SYM_CA_ATTESTATION`.
    #[prost(bytes = "vec", optional, tag = "3")]
    pub sym_ca_attestation: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub encrypted_seed: Option<Vec<u8>>,
    /// TPM 2.0 integrity HMAC over the encrypted identity and the identity key name.
    #[prost(bytes = "vec", optional, tag = "5")]
    pub credential_mac: Option<Vec<u8>>,
    /// `wrapped_key` holds the encrypted identity; the remaining fields may
    /// carry a certificate wrapped under the recovered credential.
    #[prost(message, optional, tag = "6")]
    pub wrapped_certificate: Option<EncryptedData>,
}

/// Borrowed view of whichever variant a credential carries.
#[derive(Debug, PartialEq)]
pub enum IdentityCredential<'a> {
    Tpm12 {
        asym_ca_contents: &'a [u8],
        sym_ca_attestation: &'a [u8],
    },
    Tpm20 {
        encrypted_seed: &'a [u8],
        credential_mac: &'a [u8],
        wrapped_certificate: &'a EncryptedData,
    },
}

impl EncryptedIdentityCredential {
    pub fn tpm12(asym_ca_contents: Vec<u8>, sym_ca_attestation: Vec<u8>) -> Self {
        Self {
            tpm_version: TpmVersion::Tpm12 as i32,
            asym_ca_contents: Some(asym_ca_contents),
            sym_ca_attestation: Some(sym_ca_attestation),
            ..Default::default()
        }
    }

    pub fn tpm20(
        encrypted_seed: Vec<u8>,
        credential_mac: Vec<u8>,
        wrapped_certificate: EncryptedData,
    ) -> Self {
        Self {
            tpm_version: TpmVersion::Tpm20 as i32,
            encrypted_seed: Some(encrypted_seed),
            credential_mac: Some(credential_mac),
            wrapped_certificate: Some(wrapped_certificate),
            ..Default::default()
        }
    }

    /// Resolves the variant selected by `tpm_version`, rejecting credentials
    /// that carry missing or foreign fields.
    pub fn variant(&self) -> Result<IdentityCredential<'_>> {
        let version = TpmVersion::try_from(self.tpm_version)
            .map_err(|_| ProtoError::UnknownVersion(self.tpm_version))?;
        match version {
            TpmVersion::Tpm12 => {
                if self.encrypted_seed.is_some()
                    || self.credential_mac.is_some()
                    || self.wrapped_certificate.is_some()
                {
                    return Err(ProtoError::MixedVersions(version));
                }
                Ok(IdentityCredential::Tpm12 {
                    asym_ca_contents: self
                        .asym_ca_contents
                        .as_deref()
                        .ok_or(ProtoError::MissingField(version, "asym_ca_contents"))?,
                    sym_ca_attestation: self
                        .sym_ca_attestation
                        .as_deref()
                        .ok_or(ProtoError::MissingField(version, "sym_ca_attestation"))?,
                })
            }
            TpmVersion::Tpm20 => {
                if self.asym_ca_contents.is_some() || self.sym_ca_attestation.is_some() {
                    return Err(ProtoError::MixedVersions(version));
                }
                Ok(IdentityCredential::Tpm20 {
                    encrypted_seed: self
                        .encrypted_seed
                        .as_deref()
                        .ok_or(ProtoError::MissingField(version, "encrypted_seed"))?,
                    credential_mac: self
                        .credential_mac
                        .as_deref()
                        .ok_or(ProtoError::MissingField(version, "credential_mac"))?,
                    wrapped_certificate: self
                        .wrapped_certificate
                        .as_ref()
                        .ok_or(ProtoError::MissingField(version, "wrapped_certificate"))?,
                })
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let credential = Self::decode(bytes)
            .map_err(|e| ProtoError::Decode("EncryptedIdentityCredential", e))?;
        credential.variant()?;
        Ok(credential)
    }
}
