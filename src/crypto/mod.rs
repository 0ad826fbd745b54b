//! Envelope encryption, key sealing and identity credential helpers.

pub mod asymmetric;
pub mod credential;
pub mod primitives;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::marshal::MarshalError;
use crate::proto::{EncryptedData, EncryptedIdentityCredential, ProtoError, TpmVersion};
use crate::tpm::{TpmError, TpmUtility};

pub use asymmetric::{
    encrypt_for_unbind, get_rsa_public_key, get_rsa_subject_public_key_info, verify_signature,
    DigestAlgorithm,
};
pub use credential::{
    decrypt_identity_certificate_for_tpm2, encrypt_data_for_google,
    encrypt_identity_certificate_for_tpm2, encrypt_identity_credential,
};
pub use primitives::{
    aes_decrypt, aes_encrypt, get_random, hmac_sha256, hmac_sha512, tpm2_compatible_kdfa,
    AES_BLOCK_SIZE, AES_KEY_SIZE,
};

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("AES key must be 32 bytes, got {0}")]
    InvalidKeySize(usize),
    #[error("AES IV must be 16 bytes, got {0}")]
    InvalidIvSize(usize),
    #[error("input of {0} bytes is too large")]
    InputTooLarge(usize),
    #[error("invalid {0} length {1}")]
    InvalidLength(&'static str, usize),
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("random number generator failure: {0}")]
    Random(String),
    #[error("MAC verification failed")]
    MacMismatch,
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),
    #[error("malformed key: {0}")]
    MalformedKey(String),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error(transparent)]
    Rsa(#[from] rsa::Error),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("TPM operation failed: {0}")]
    Tpm(Box<TpmError>),
}

impl From<TpmError> for CryptoError {
    fn from(e: TpmError) -> Self {
        CryptoError::Tpm(Box::new(e))
    }
}

pub type Result<T, E = CryptoError> = core::result::Result<T, E>;

/// Key sealing and data protection on top of a [`TpmUtility`].
///
/// The envelope reuses the AES key as the HMAC-SHA512 key. Existing
/// envelopes depend on that derivation, so it is kept as is.
pub struct CryptoUtility<'a, T: TpmUtility + ?Sized> {
    tpm_utility: &'a mut T,
}

impl<'a, T: TpmUtility + ?Sized> CryptoUtility<'a, T> {
    pub fn new(tpm_utility: &'a mut T) -> Self {
        Self { tpm_utility }
    }

    /// Generates a random AES-256 key and seals it to the current PCR0.
    ///
    /// Returns the key and its sealed form.
    pub fn create_sealed_key(&mut self) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>)> {
        let aes_key = Zeroizing::new(get_random(AES_KEY_SIZE)?);
        let sealed_key = self.tpm_utility.seal_to_pcr0(&aes_key).map_err(|e| {
            log::error!("Failed to seal cipher key: {}", e);
            e
        })?;
        Ok((aes_key, sealed_key))
    }

    /// Encrypts `data` into a serialized [`EncryptedData`] carrying `sealed_key`.
    pub fn encrypt_data(&self, data: &[u8], aes_key: &[u8], sealed_key: &[u8]) -> Result<Vec<u8>> {
        let iv = get_random(AES_BLOCK_SIZE)?;
        let encrypted_data = aes_encrypt(data, aes_key, &iv)?;
        let mac = hmac_sha512(&[iv.as_slice(), &encrypted_data].concat(), aes_key)?;
        Ok(EncryptedData {
            wrapped_key: sealed_key.to_vec(),
            iv,
            mac,
            encrypted_data,
            wrapping_key_id: None,
        }
        .to_bytes())
    }

    /// Unseals the key protecting a serialized envelope.
    ///
    /// Returns the AES key and the sealed key it came from.
    pub fn unseal_key(&mut self, encrypted_data: &[u8]) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>)> {
        let envelope = EncryptedData::from_bytes(encrypted_data)?;
        let aes_key = Zeroizing::new(self.tpm_utility.unseal(&envelope.wrapped_key).map_err(
            |e| {
                log::error!("Failed to unseal cipher key: {}", e);
                e
            },
        )?);
        Ok((aes_key, envelope.wrapped_key))
    }

    /// Authenticates and decrypts a serialized envelope. The MAC is checked
    /// before any decryption happens.
    pub fn decrypt_data(&self, encrypted_data: &[u8], aes_key: &[u8]) -> Result<Vec<u8>> {
        let envelope = EncryptedData::from_bytes(encrypted_data)?;
        let expected_mac = hmac_sha512(
            &[envelope.iv.as_slice(), &envelope.encrypted_data].concat(),
            aes_key,
        )?;
        primitives::verify_mac(&expected_mac, &envelope.mac).map_err(|e| {
            log::error!("Failed to authenticate encrypted data");
            e
        })?;
        aes_decrypt(&envelope.encrypted_data, aes_key, &envelope.iv)
    }

    pub fn get_random(&self, num_bytes: usize) -> Result<Vec<u8>> {
        get_random(num_bytes)
    }

    pub fn encrypt_identity_credential(
        &self,
        tpm_version: TpmVersion,
        credential: &[u8],
        ek_public_key_info: &[u8],
        aik_public_key: &[u8],
    ) -> Result<EncryptedIdentityCredential> {
        encrypt_identity_credential(tpm_version, credential, ek_public_key_info, aik_public_key)
    }

    pub fn decrypt_identity_certificate_for_tpm2(
        &self,
        credential: &[u8],
        encrypted_certificate: &EncryptedData,
    ) -> Result<Vec<u8>> {
        decrypt_identity_certificate_for_tpm2(credential, encrypted_certificate)
    }
}
