use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, Pkcs1v15Sign, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::{CryptoError, Result};

/// OAEP encoding parameter TPM 1.2 uses for bound and identity data.
pub const TPM_OAEP_LABEL: &str = "TCPA";
/// OAEP labels TPM 2.0 uses for credential seeds and session salts.
pub const TPM2_IDENTITY_LABEL: &str = "IDENTITY\0";
pub const TPM2_SECRET_LABEL: &str = "SECRET\0";

pub const RSA_PUBLIC_EXPONENT: u32 = 65537;

/// `TPM_BOUND_DATA` header: version 1.1.0.0 followed by `TPM_PT_BIND`.
const BOUND_DATA_HEADER: [u8; 5] = [1, 1, 0, 0, 2];

/// DER prefix of a PKCS#1 `DigestInfo` carrying a SHA-256 digest.
const SHA256_DIGEST_INFO_PREFIX: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

pub fn parse_rsa_public_key_info(public_key_info: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(public_key_info).map_err(|e| {
        log::error!("Failed to decode SubjectPublicKeyInfo: {}", e);
        CryptoError::MalformedKey(e.to_string())
    })
}

pub fn parse_rsa_public_key(public_key: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_der(public_key).map_err(|e| {
        log::error!("Failed to decode RSAPublicKey: {}", e);
        CryptoError::MalformedKey(e.to_string())
    })
}

pub fn encode_rsa_public_key(key: &RsaPublicKey) -> Result<Vec<u8>> {
    Ok(key
        .to_pkcs1_der()
        .map_err(|e| CryptoError::MalformedKey(e.to_string()))?
        .as_bytes()
        .to_vec())
}

pub fn encode_rsa_public_key_info(key: &RsaPublicKey) -> Result<Vec<u8>> {
    Ok(key
        .to_public_key_der()
        .map_err(|e| CryptoError::MalformedKey(e.to_string()))?
        .as_bytes()
        .to_vec())
}

/// Converts a PKCS#1 `RSAPublicKey` into an X.509 `SubjectPublicKeyInfo`.
pub fn get_rsa_subject_public_key_info(public_key: &[u8]) -> Result<Vec<u8>> {
    encode_rsa_public_key_info(&parse_rsa_public_key(public_key)?)
}

/// Converts an X.509 `SubjectPublicKeyInfo` into a PKCS#1 `RSAPublicKey`.
pub fn get_rsa_public_key(public_key_info: &[u8]) -> Result<Vec<u8>> {
    encode_rsa_public_key(&parse_rsa_public_key_info(public_key_info)?)
}

/// Builds a public key from a big-endian modulus and the default exponent.
pub fn rsa_public_key_from_modulus(modulus: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from(RSA_PUBLIC_EXPONENT),
    )
    .map_err(|e| CryptoError::MalformedKey(e.to_string()))
}

pub fn get_rsa_public_key_from_modulus(modulus_hex: &str) -> Result<RsaPublicKey> {
    let modulus = hex::decode(modulus_hex.trim())
        .map_err(|e| CryptoError::MalformedKey(format!("modulus is not hex: {}", e)))?;
    rsa_public_key_from_modulus(&modulus)
}

pub fn rsa_modulus(key: &RsaPublicKey) -> Vec<u8> {
    key.n().to_bytes_be()
}

/// RSA-OAEP with SHA-1 and the TPM 1.2 "TCPA" encoding parameter.
pub fn tpm_compatible_oaep_encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    Ok(key.encrypt(&mut OsRng, Oaep::new_with_label::<Sha1, _>(TPM_OAEP_LABEL), data)?)
}

/// RSA-OAEP with SHA-1 and an empty label.
pub fn oaep_sha1_encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    Ok(key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), data)?)
}

/// RSA-OAEP with SHA-256 and a TPM 2.0 label such as [`TPM2_IDENTITY_LABEL`].
pub fn oaep_sha256_encrypt(key: &RsaPublicKey, label: &str, data: &[u8]) -> Result<Vec<u8>> {
    Ok(key.encrypt(
        &mut OsRng,
        Oaep::new_with_label::<Sha256, _>(label.to_owned()),
        data,
    )?)
}

/// Encrypts data the way a TPM 1.2 `Unbind` expects it: a `TPM_BOUND_DATA`
/// structure under OAEP-"TCPA".
pub fn encrypt_for_unbind(public_key_info: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let key = parse_rsa_public_key_info(public_key_info)?;
    let mut bound_data = Vec::with_capacity(BOUND_DATA_HEADER.len() + data.len());
    bound_data.extend_from_slice(&BOUND_DATA_HEADER);
    bound_data.extend_from_slice(data);
    tpm_compatible_oaep_encrypt(&key, &bound_data)
}

/// `DigestInfo` for SHA-256, the input a TPM 1.2 signing key with the
/// `TPM_SS_RSASSAPKCS1v15_DER` scheme signs.
pub fn digest_info_sha256(data: &[u8]) -> Vec<u8> {
    let mut digest_info = SHA256_DIGEST_INFO_PREFIX.to_vec();
    digest_info.extend_from_slice(&Sha256::digest(data));
    digest_info
}

/// RSASSA-PKCS1-v1_5 verification. Malformed keys and bad signatures both
/// verify as `false`.
pub fn verify_signature(
    digest_algorithm: DigestAlgorithm,
    public_key_info: &[u8],
    data: &[u8],
    signature: &[u8],
) -> bool {
    let key = match parse_rsa_public_key_info(public_key_info) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let result = match digest_algorithm {
        DigestAlgorithm::Sha1 => key.verify(
            Pkcs1v15Sign::new::<Sha1>(),
            &sha1::Sha1::digest(data),
            signature,
        ),
        DigestAlgorithm::Sha256 => {
            key.verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data), signature)
        }
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            log::info!("Signature verification failed: {}", e);
            false
        }
    }
}

/// SubjectPublicKeyInfo for an uncompressed P-256 point.
pub fn ecc_p256_public_key_info(x: &[u8], y: &[u8]) -> Result<Vec<u8>> {
    let mut point = Vec::with_capacity(1 + x.len() + y.len());
    point.push(0x04);
    point.extend_from_slice(x);
    point.extend_from_slice(y);
    let key = p256::PublicKey::from_sec1_bytes(&point)
        .map_err(|e| CryptoError::MalformedKey(format!("invalid P-256 point: {}", e)))?;
    Ok(key
        .to_public_key_der()
        .map_err(|e| CryptoError::MalformedKey(e.to_string()))?
        .as_bytes()
        .to_vec())
}
