//! The TPM 1.2 software stack as seen by [`super::TpmUtilityV1`], and the
//! TPM 1.2 structures it exchanges.

use rsa::{BigUint, RsaPublicKey};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::asymmetric::RSA_PUBLIC_EXPONENT;
use crate::crypto::primitives::sha1;
use crate::marshal::{self, Marshal, MarshalError, Reader, Unmarshal, Writer};
use crate::tpm::KeyUsage;

#[derive(Error, Debug)]
pub enum TssError {
    #[error("failed to connect to the TPM: {0}")]
    Connect(String),
    #[error("{command} failed: {message} ({code:#010x})")]
    Command {
        command: &'static str,
        code: u32,
        message: String,
    },
}

pub type Result<T, E = TssError> = core::result::Result<T, E>;

pub type TssKeyHandle = u32;

/// `TPM_ALG_RSA`
pub const TPM_ALG_RSA: u32 = 0x0000_0001;
/// `TPM_TAG_QUOTE_INFO2`
pub const TPM_TAG_QUOTE_INFO2: u16 = 0x0036;
pub const QUOTE_INFO2_FIXED: &[u8; 4] = b"QUT2";
pub const TPM_NONCE_SIZE: usize = 20;

/// `TCG_TAG_PCCLIENT_STORED_CERT`
const TAG_STORED_CERT: u16 = 0x1001;
/// `TCG_TAG_PCCLIENT_FULL_CERT`
const TAG_FULL_CERT: u16 = 0x1002;

/// How a connection authenticates to the TPM.
pub enum Authorization {
    User,
    Owner(Zeroizing<Vec<u8>>),
    Delegate {
        blob: Vec<u8>,
        secret: Zeroizing<Vec<u8>>,
    },
}

impl Authorization {
    pub fn describe(&self) -> &'static str {
        match self {
            Authorization::User => "user",
            Authorization::Owner(_) => "owner",
            Authorization::Delegate { .. } => "delegate",
        }
    }
}

pub struct MadeIdentity {
    pub identity_key_blob: Vec<u8>,
    pub identity_binding: Vec<u8>,
}

/// Opens TSS contexts with a given authorization.
pub trait TssConnector: Send {
    fn connect(&mut self, authorization: &Authorization) -> Result<Box<dyn TssContext>>;
}

/// An open TSS context. Keys loaded through it are released when it is dropped.
pub trait TssContext {
    /// Loads a wrapped key under the storage root key.
    fn load_key(&mut self, key_blob: &[u8]) -> Result<TssKeyHandle>;

    fn read_pcr(&mut self, pcr_index: u32) -> Result<Vec<u8>>;

    /// Seals `data` to the given `(index, value)` PCR pairs under the SRK.
    fn seal(&mut self, data: &[u8], pcr_values: &[(u32, Vec<u8>)]) -> Result<Vec<u8>>;

    fn unseal(&mut self, sealed_data: &[u8]) -> Result<Vec<u8>>;

    /// `TPM_ActivateIdentity`: returns the `TPM_SYMMETRIC_KEY` released from
    /// `asym_ca_contents`.
    fn activate_identity(
        &mut self,
        identity_key: TssKeyHandle,
        asym_ca_contents: &[u8],
    ) -> Result<Vec<u8>>;

    /// Creates a non-migratable 2048-bit RSA key under the SRK.
    fn create_key(&mut self, usage: KeyUsage) -> Result<Vec<u8>>;

    /// The key's `TPM_PUBKEY`.
    fn get_public_key(&mut self, key: TssKeyHandle) -> Result<Vec<u8>>;

    /// `TPM_CertifyKey`: returns the `TPM_CERTIFY_INFO` and its signature.
    fn certify_key(
        &mut self,
        key: TssKeyHandle,
        certifier: TssKeyHandle,
        anti_replay: &[u8; TPM_NONCE_SIZE],
    ) -> Result<(Vec<u8>, Vec<u8>)>;

    /// `TPM_Quote2` over `pcr_select`: returns the `TPM_QUOTE_INFO2` and its signature.
    fn quote2(
        &mut self,
        identity_key: TssKeyHandle,
        pcr_select: &[u8],
        anti_replay: &[u8; TPM_NONCE_SIZE],
    ) -> Result<(Vec<u8>, Vec<u8>)>;

    /// The endorsement key's `TPM_PUBKEY`; needs owner or delegate authorization.
    fn get_endorsement_public_key(&mut self) -> Result<Vec<u8>>;

    fn nv_data_size(&mut self, nv_index: u32) -> Result<u32>;

    fn unbind(&mut self, key: TssKeyHandle, bound_data: &[u8]) -> Result<Vec<u8>>;

    /// Signs a DER `DigestInfo` with a `TPM_SS_RSASSAPKCS1v15_DER` key.
    fn sign(&mut self, key: TssKeyHandle, digest_info: &[u8]) -> Result<Vec<u8>>;

    /// `TPM_MakeIdentity`; needs owner or delegate authorization.
    fn make_identity(&mut self) -> Result<MadeIdentity>;
}

/// `TPM_PUBKEY` for an RSA key.
#[derive(Debug, Clone, PartialEq)]
pub struct Tpm12PublicKey {
    pub algorithm: u32,
    pub encryption_scheme: u16,
    pub signature_scheme: u16,
    pub key_length: u32,
    pub num_primes: u32,
    /// Empty means the default exponent.
    pub exponent: Vec<u8>,
    pub modulus: Vec<u8>,
}

impl Tpm12PublicKey {
    pub fn from_rsa(
        key: &RsaPublicKey,
        encryption_scheme: u16,
        signature_scheme: u16,
    ) -> Tpm12PublicKey {
        use rsa::traits::PublicKeyParts;
        let exponent = match key.e() == &BigUint::from(RSA_PUBLIC_EXPONENT) {
            true => Vec::new(),
            false => key.e().to_bytes_be(),
        };
        Tpm12PublicKey {
            algorithm: TPM_ALG_RSA,
            encryption_scheme,
            signature_scheme,
            key_length: (key.size() * 8) as u32,
            num_primes: 2,
            exponent,
            modulus: key.n().to_bytes_be(),
        }
    }

    pub fn to_rsa(&self) -> crate::crypto::Result<RsaPublicKey> {
        let exponent = match self.exponent.is_empty() {
            true => BigUint::from(RSA_PUBLIC_EXPONENT),
            false => BigUint::from_bytes_be(&self.exponent),
        };
        Ok(RsaPublicKey::new(
            BigUint::from_bytes_be(&self.modulus),
            exponent,
        )?)
    }
}

impl Marshal for Tpm12PublicKey {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        let mut parms = Writer::new();
        parms.put_u32(self.key_length);
        parms.put_u32(self.num_primes);
        parms.put_sized_u32(&self.exponent)?;

        buf.put_u32(self.algorithm);
        buf.put_u16(self.encryption_scheme);
        buf.put_u16(self.signature_scheme);
        buf.put_sized_u32(parms.as_bytes())?;
        buf.put_sized_u32(&self.modulus)
    }
}

impl Unmarshal for Tpm12PublicKey {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        let algorithm = buf.get_u32()?;
        if algorithm != TPM_ALG_RSA {
            return Err(MarshalError::Unexpected {
                field: "algorithmID",
                value: algorithm.into(),
            });
        }
        let encryption_scheme = buf.get_u16()?;
        let signature_scheme = buf.get_u16()?;
        let parms = buf.get_sized_u32()?;
        let mut parms = Reader::new(&parms);
        let key_length = parms.get_u32()?;
        let num_primes = parms.get_u32()?;
        let exponent = parms.get_sized_u32()?;
        parms.finish()?;
        Ok(Self {
            algorithm,
            encryption_scheme,
            signature_scheme,
            key_length,
            num_primes,
            exponent,
            modulus: buf.get_sized_u32()?,
        })
    }
}

/// `TPM_QUOTE_INFO2`
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteInfo2 {
    pub external_data: [u8; TPM_NONCE_SIZE],
    pub pcr_select: Vec<u8>,
    pub locality_at_release: u8,
    pub digest_at_release: [u8; 20],
}

impl Marshal for QuoteInfo2 {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        buf.put_u16(TPM_TAG_QUOTE_INFO2);
        buf.put_bytes(QUOTE_INFO2_FIXED);
        buf.put_bytes(&self.external_data);
        buf.put_tpm2b(&self.pcr_select)?;
        buf.put_u8(self.locality_at_release);
        buf.put_bytes(&self.digest_at_release);
        Ok(())
    }
}

impl Unmarshal for QuoteInfo2 {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        buf.expect_u16("TPM_QUOTE_INFO2 tag", TPM_TAG_QUOTE_INFO2)?;
        if buf.get_slice(4)? != QUOTE_INFO2_FIXED {
            return Err(MarshalError::Unexpected {
                field: "TPM_QUOTE_INFO2 fixed",
                value: 0,
            });
        }
        let mut external_data = [0u8; TPM_NONCE_SIZE];
        external_data.copy_from_slice(buf.get_slice(TPM_NONCE_SIZE)?);
        let pcr_select = buf.get_tpm2b()?;
        let locality_at_release = buf.get_u8()?;
        let mut digest_at_release = [0u8; 20];
        digest_at_release.copy_from_slice(buf.get_slice(20)?);
        Ok(Self {
            external_data,
            pcr_select,
            locality_at_release,
            digest_at_release,
        })
    }
}

/// SHA-1 of the `TPM_PCR_COMPOSITE` for a single selected PCR.
pub fn pcr_composite_digest(pcr_select: &[u8], pcr_value: &[u8]) -> marshal::Result<Vec<u8>> {
    let mut composite = Writer::new();
    composite.put_tpm2b(pcr_select)?;
    composite.put_sized_u32(pcr_value)?;
    Ok(sha1(composite.as_bytes()))
}

/// Strips the `TCG_PCCLIENT_STORED_CERT` and `TCG_FULL_CERT` headers from
/// endorsement certificate NV data.
pub fn parse_stored_certificate(nv_data: &[u8]) -> marshal::Result<Vec<u8>> {
    let mut buf = Reader::new(nv_data);
    buf.expect_u16("stored certificate tag", TAG_STORED_CERT)?;
    let cert_type = buf.get_u8()?;
    if cert_type != 0 {
        return Err(MarshalError::Unexpected {
            field: "certType",
            value: cert_type.into(),
        });
    }
    let size = buf.get_u16()? as usize;
    if size < 2 {
        return Err(MarshalError::Unexpected {
            field: "certSize",
            value: size as u64,
        });
    }
    buf.expect_u16("full certificate tag", TAG_FULL_CERT)?;
    // NV spaces are usually larger than the certificate; the tail is padding.
    buf.get_bytes(size - 2)
}

/// Inverse of [`parse_stored_certificate`].
pub fn encode_stored_certificate(certificate: &[u8]) -> marshal::Result<Vec<u8>> {
    let size = u16::try_from(certificate.len() + 2)
        .map_err(|_| MarshalError::TooLong(certificate.len(), 16))?;
    let mut buf = Writer::new();
    buf.put_u16(TAG_STORED_CERT);
    buf.put_u8(0);
    buf.put_u16(size);
    buf.put_u16(TAG_FULL_CERT);
    buf.put_bytes(certificate);
    Ok(buf.into_vec())
}
