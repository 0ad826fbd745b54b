//! Identity credential constructions for both TPM generations and the
//! certificate envelopes that travel with them.

use zeroize::Zeroizing;

use super::asymmetric::{
    get_rsa_public_key_from_modulus, oaep_sha1_encrypt, oaep_sha256_encrypt,
    parse_rsa_public_key_info, tpm_compatible_oaep_encrypt, TPM2_IDENTITY_LABEL,
};
use super::primitives::{
    aes128_cfb_encrypt, aes_decrypt, aes_encrypt, get_random, hmac_sha256, hmac_sha512, sha1,
    sha256, tpm2_compatible_kdfa, tss_compatible_decrypt, tss_compatible_encrypt, verify_mac,
    AES_BLOCK_SIZE, AES_KEY_SIZE,
};
use super::{CryptoError, Result};
use crate::marshal::{self, Marshal, MarshalError, Reader, Unmarshal, Writer};
use crate::proto::{EncryptedData, EncryptedIdentityCredential, TpmVersion};

/// TPM 1.2 `TPM_ALG_AES256`.
pub const TPM12_ALG_AES256: u32 = 0x0000_0009;
/// TPM 1.2 `TPM_SYM_MODE_CBC`.
pub const TPM12_SYM_MODE_CBC: u16 = 0x0002;
/// TPM 1.2 `TPM_SS_NONE`.
pub const TPM12_SS_NONE: u16 = 0x0001;

/// `TPM_ALG_SHA256`, the name algorithm of every object this crate creates.
pub const TPM2_ALG_SHA256: u16 = 0x000B;
const TPM2_SEED_SIZE: usize = 32;
const TPM2_MAX_CREDENTIAL_SIZE: usize = 64;

const HASH_HEADER_ENCRYPT: &[u8] = b"ENCRYPT";
const HASH_HEADER_MAC: &[u8] = b"MAC";

/// TPM 1.2 `TPM_SYMMETRIC_KEY`.
#[derive(Clone, PartialEq)]
pub struct Tpm12SymmetricKey {
    pub algorithm: u32,
    pub encryption_scheme: u16,
    pub key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for Tpm12SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tpm12SymmetricKey")
            .field("algorithm", &self.algorithm)
            .field("encryption_scheme", &self.encryption_scheme)
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .finish()
    }
}

impl Tpm12SymmetricKey {
    pub fn aes256_cbc(key: Zeroizing<Vec<u8>>) -> Self {
        Self {
            algorithm: TPM12_ALG_AES256,
            encryption_scheme: TPM12_SYM_MODE_CBC,
            key,
        }
    }
}

impl Marshal for Tpm12SymmetricKey {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        buf.put_u32(self.algorithm);
        buf.put_u16(self.encryption_scheme);
        buf.put_tpm2b(&self.key)
    }
}

impl Unmarshal for Tpm12SymmetricKey {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        Ok(Self {
            algorithm: buf.get_u32()?,
            encryption_scheme: buf.get_u16()?,
            key: Zeroizing::new(buf.get_tpm2b()?),
        })
    }
}

/// TPM 1.2 `TPM_ASYM_CA_CONTENTS`, the plaintext the endorsement key protects.
#[derive(Debug, Clone, PartialEq)]
pub struct Tpm12AsymCaContents {
    pub session_key: Tpm12SymmetricKey,
    /// SHA-1 of the identity key's `TPM_PUBKEY`.
    pub id_digest: Vec<u8>,
}

impl Marshal for Tpm12AsymCaContents {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        self.session_key.marshal(buf)?;
        buf.put_bytes(&self.id_digest);
        Ok(())
    }
}

impl Unmarshal for Tpm12AsymCaContents {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        Ok(Self {
            session_key: Tpm12SymmetricKey::unmarshal(buf)?,
            id_digest: buf.get_bytes(20)?,
        })
    }
}

/// TPM 1.2 `TPM_SYM_CA_ATTESTATION` with its `TPM_KEY_PARMS` carrying no
/// algorithm parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Tpm12SymCaAttestation {
    pub algorithm: u32,
    pub encryption_scheme: u16,
    pub signature_scheme: u16,
    /// `iv || AES-256-CBC(credential)`
    pub credential: Vec<u8>,
}

impl Marshal for Tpm12SymCaAttestation {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        let size = u32::try_from(self.credential.len())
            .map_err(|_| MarshalError::TooLong(self.credential.len(), 32))?;
        buf.put_u32(size);
        buf.put_u32(self.algorithm);
        buf.put_u16(self.encryption_scheme);
        buf.put_u16(self.signature_scheme);
        buf.put_sized_u32(&[])?;
        buf.put_bytes(&self.credential);
        Ok(())
    }
}

impl Unmarshal for Tpm12SymCaAttestation {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        let size = buf.get_u32()? as usize;
        let algorithm = buf.get_u32()?;
        let encryption_scheme = buf.get_u16()?;
        let signature_scheme = buf.get_u16()?;
        let parms = buf.get_sized_u32()?;
        if !parms.is_empty() {
            return Err(MarshalError::Unexpected {
                field: "parmSize",
                value: parms.len() as u64,
            });
        }
        Ok(Self {
            algorithm,
            encryption_scheme,
            signature_scheme,
            credential: buf.get_bytes(size)?,
        })
    }
}

/// Recovers the credential from a `TPM_SYM_CA_ATTESTATION` with the session
/// key the TPM released from the matching `TPM_ASYM_CA_CONTENTS`.
pub fn decrypt_sym_ca_attestation(
    session_key: &Tpm12SymmetricKey,
    sym_ca_attestation: &[u8],
) -> Result<Vec<u8>> {
    if session_key.algorithm != TPM12_ALG_AES256
        || session_key.encryption_scheme != TPM12_SYM_MODE_CBC
    {
        return Err(CryptoError::UnsupportedAlgorithm(format!(
            "TPM 1.2 session key algorithm {:#x} scheme {:#x}",
            session_key.algorithm, session_key.encryption_scheme
        )));
    }
    let attestation = Tpm12SymCaAttestation::from_bytes(sym_ca_attestation)?;
    if attestation.algorithm != session_key.algorithm
        || attestation.encryption_scheme != session_key.encryption_scheme
    {
        return Err(CryptoError::MalformedEnvelope(
            "attestation algorithm does not match the session key",
        ));
    }
    tss_compatible_decrypt(&attestation.credential, &session_key.key)
}

/// TPM 2.0 object name: `nameAlg || H(TPMT_PUBLIC)`.
pub fn tpm2_object_name(public_area: &[u8]) -> Vec<u8> {
    let mut name = TPM2_ALG_SHA256.to_be_bytes().to_vec();
    name.extend_from_slice(&sha256(public_area));
    name
}

/// `TPM2B_ID_OBJECT` body for `TPM2_ActivateCredential`: the sized integrity
/// HMAC followed by the encrypted identity.
pub fn tpm2_id_object(credential_mac: &[u8], encrypted_identity: &[u8]) -> Result<Vec<u8>> {
    let mut id_object = Writer::new();
    id_object.put_tpm2b(credential_mac)?;
    id_object.put_bytes(encrypted_identity);
    Ok(id_object.into_vec())
}

pub fn encrypt_identity_credential(
    tpm_version: TpmVersion,
    credential: &[u8],
    ek_public_key_info: &[u8],
    aik_public_key: &[u8],
) -> Result<EncryptedIdentityCredential> {
    match tpm_version {
        TpmVersion::Tpm12 => {
            encrypt_tpm12_identity_credential(credential, ek_public_key_info, aik_public_key)
        }
        TpmVersion::Tpm20 => {
            encrypt_tpm2_identity_credential(credential, ek_public_key_info, aik_public_key)
        }
    }
}

fn encrypt_tpm12_identity_credential(
    credential: &[u8],
    ek_public_key_info: &[u8],
    aik_public_key: &[u8],
) -> Result<EncryptedIdentityCredential> {
    let ek = parse_rsa_public_key_info(ek_public_key_info)?;
    let session_key = Tpm12SymmetricKey::aes256_cbc(Zeroizing::new(get_random(AES_KEY_SIZE)?));

    let attestation = Tpm12SymCaAttestation {
        algorithm: session_key.algorithm,
        encryption_scheme: session_key.encryption_scheme,
        signature_scheme: TPM12_SS_NONE,
        credential: tss_compatible_encrypt(credential, &session_key.key)?,
    };
    let contents = Zeroizing::new(
        Tpm12AsymCaContents {
            session_key,
            id_digest: sha1(aik_public_key),
        }
        .to_bytes()?,
    );
    Ok(EncryptedIdentityCredential::tpm12(
        tpm_compatible_oaep_encrypt(&ek, &contents)?,
        attestation.to_bytes()?,
    ))
}

/// TPM 2.0 `MakeCredential` for an RSA endorsement key with an AES-128
/// storage scheme.
fn encrypt_tpm2_identity_credential(
    credential: &[u8],
    ek_public_key_info: &[u8],
    aik_public_key: &[u8],
) -> Result<EncryptedIdentityCredential> {
    if credential.len() > TPM2_MAX_CREDENTIAL_SIZE {
        return Err(CryptoError::InvalidLength("credential", credential.len()));
    }
    let ek = parse_rsa_public_key_info(ek_public_key_info)?;
    let seed = Zeroizing::new(get_random(TPM2_SEED_SIZE)?);
    let encrypted_seed = oaep_sha256_encrypt(&ek, TPM2_IDENTITY_LABEL, &seed)?;
    let name = tpm2_object_name(aik_public_key);

    let symmetric_key = Zeroizing::new(tpm2_compatible_kdfa(&seed, "STORAGE", &name, 128)?);
    let mut enc_identity = Writer::new();
    enc_identity.put_tpm2b(credential)?;
    let mut enc_identity = enc_identity.into_vec();
    aes128_cfb_encrypt(&symmetric_key, &[0u8; AES_BLOCK_SIZE], &mut enc_identity)?;

    let hmac_key = Zeroizing::new(tpm2_compatible_kdfa(&seed, "INTEGRITY", &[], 256)?);
    let mut integrity_input = enc_identity.clone();
    integrity_input.extend_from_slice(&name);
    let integrity = hmac_sha256(&integrity_input, &hmac_key)?;

    Ok(EncryptedIdentityCredential::tpm20(
        encrypted_seed,
        integrity,
        EncryptedData {
            wrapped_key: enc_identity,
            ..Default::default()
        },
    ))
}

fn certificate_keys(credential: &[u8]) -> (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>) {
    let with_header = |header: &[u8]| {
        let mut input = Zeroizing::new(header.to_vec());
        input.extend_from_slice(credential);
        Zeroizing::new(sha256(&input))
    };
    (with_header(HASH_HEADER_ENCRYPT), with_header(HASH_HEADER_MAC))
}

/// Wraps an identity certificate under keys derived from the credential the
/// TPM recovers in `ActivateIdentityForTpm2`.
pub fn encrypt_identity_certificate_for_tpm2(
    credential: &[u8],
    certificate: &[u8],
) -> Result<EncryptedData> {
    let (aes_key, hmac_key) = certificate_keys(credential);
    let iv = get_random(AES_BLOCK_SIZE)?;
    let encrypted_data = aes_encrypt(certificate, &aes_key, &iv)?;
    let mac = hmac_sha512(&[iv.as_slice(), &encrypted_data].concat(), &hmac_key)?;
    Ok(EncryptedData {
        iv,
        encrypted_data,
        mac,
        ..Default::default()
    })
}

pub fn decrypt_identity_certificate_for_tpm2(
    credential: &[u8],
    encrypted_certificate: &EncryptedData,
) -> Result<Vec<u8>> {
    let (aes_key, hmac_key) = certificate_keys(credential);
    let expected_mac = hmac_sha512(
        &[
            encrypted_certificate.iv.as_slice(),
            &encrypted_certificate.encrypted_data,
        ]
        .concat(),
        &hmac_key,
    )?;
    verify_mac(&expected_mac, &encrypted_certificate.mac)?;
    aes_decrypt(
        &encrypted_certificate.encrypted_data,
        &aes_key,
        &encrypted_certificate.iv,
    )
}

/// Hybrid envelope for a recipient identified only by its RSA modulus.
pub fn encrypt_data_for_google(
    data: &[u8],
    public_key_modulus_hex: &str,
    wrapping_key_id: &str,
) -> Result<EncryptedData> {
    let key = get_rsa_public_key_from_modulus(public_key_modulus_hex)?;
    let aes_key = Zeroizing::new(get_random(AES_KEY_SIZE)?);
    let iv = get_random(AES_BLOCK_SIZE)?;
    let encrypted_data = aes_encrypt(data, &aes_key, &iv)?;
    let mac = hmac_sha512(&[iv.as_slice(), &encrypted_data].concat(), &aes_key)?;
    Ok(EncryptedData {
        wrapped_key: oaep_sha1_encrypt(&key, &aes_key)?,
        iv,
        mac,
        encrypted_data,
        wrapping_key_id: Some(wrapping_key_id.to_owned()),
    })
}
