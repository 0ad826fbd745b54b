//! TPM 2.0 structures exchanged with [`super::commands::Tpm2Commands`] and
//! handed to callers as key blobs, public areas and attestations.

use rsa::{BigUint, RsaPublicKey};

use super::commands::cc;
use crate::crypto::asymmetric::{ecc_p256_public_key_info, RSA_PUBLIC_EXPONENT};
use crate::crypto::credential::{tpm2_object_name, TPM2_ALG_SHA256};
use crate::crypto::primitives::sha256;
use crate::marshal::{self, Marshal, MarshalError, Reader, Unmarshal, Writer};
use crate::tpm::pcr::pcr_select;

pub const TPM_ALG_RSA: u16 = 0x0001;
pub const TPM_ALG_AES: u16 = 0x0006;
pub const TPM_ALG_KEYEDHASH: u16 = 0x0008;
pub const TPM_ALG_SHA256: u16 = TPM2_ALG_SHA256;
pub const TPM_ALG_NULL: u16 = 0x0010;
pub const TPM_ALG_RSASSA: u16 = 0x0014;
pub const TPM_ALG_ECDSA: u16 = 0x0018;
pub const TPM_ALG_ECC: u16 = 0x0023;
pub const TPM_ALG_CFB: u16 = 0x0043;

pub const TPM_ECC_NIST_P256: u16 = 0x0003;

pub const TPM_GENERATED_VALUE: u32 = 0xff54_4347;
pub const TPM_ST_ATTEST_NV: u16 = 0x8014;
pub const TPM_ST_ATTEST_CERTIFY: u16 = 0x8017;
pub const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;

pub const SHA256_DIGEST_SIZE: usize = 32;

/// `TPMA_OBJECT` bits.
pub mod attributes {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const ADMIN_WITH_POLICY: u32 = 1 << 7;
    pub const NO_DA: u32 = 1 << 10;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN: u32 = 1 << 18;
}

/// `PolicySecret(TPM_RH_ENDORSEMENT)`, the policy of the TCG default
/// endorsement key templates.
pub const ENDORSEMENT_KEY_POLICY: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xb3, 0xf8, 0x1a, 0x90, 0xcc, 0x8d, 0x46, 0xa5, 0xd7, 0x24,
    0xfd, 0x52, 0xd7, 0x6e, 0x06, 0x52, 0x0b, 0x64, 0xf2, 0xa1, 0xda, 0x1b, 0x33, 0x14, 0x69, 0xaa,
];

const ENDORSEMENT_KEY_ATTRIBUTES: u32 = attributes::FIXED_TPM
    | attributes::FIXED_PARENT
    | attributes::SENSITIVE_DATA_ORIGIN
    | attributes::ADMIN_WITH_POLICY
    | attributes::RESTRICTED
    | attributes::DECRYPT;

/// `TPML_PCR_SELECTION` holding one SHA-256 bank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcrSelection {
    pub hash: u16,
    pub select: Vec<u8>,
}

impl PcrSelection {
    pub fn sha256(pcr_index: u32) -> crate::tpm::pcr::Result<Self> {
        Ok(Self {
            hash: TPM_ALG_SHA256,
            select: pcr_select(pcr_index)?,
        })
    }

    /// Selected PCR indices in ascending order.
    pub fn indices(&self) -> Vec<u32> {
        let mut indices = Vec::new();
        for (byte_index, byte) in self.select.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    indices.push((byte_index * 8 + bit) as u32);
                }
            }
        }
        indices
    }
}

impl Marshal for PcrSelection {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        let size = u8::try_from(self.select.len())
            .map_err(|_| MarshalError::TooLong(self.select.len(), 8))?;
        buf.put_u32(1);
        buf.put_u16(self.hash);
        buf.put_u8(size);
        buf.put_bytes(&self.select);
        Ok(())
    }
}

impl Unmarshal for PcrSelection {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        buf.expect_u32("TPML_PCR_SELECTION count", 1)?;
        let hash = buf.get_u16()?;
        let size = buf.get_u8()? as usize;
        Ok(Self {
            hash,
            select: buf.get_bytes(size)?,
        })
    }
}

/// Extends `policy_digest` the way `TPM2_PolicyPCR` does.
pub fn policy_pcr_digest(
    policy_digest: &[u8],
    pcrs: &PcrSelection,
    pcr_digest: &[u8],
) -> marshal::Result<Vec<u8>> {
    let mut input = Writer::new();
    input.put_bytes(policy_digest);
    input.put_u32(cc::POLICY_PCR);
    pcrs.marshal(&mut input)?;
    input.put_bytes(pcr_digest);
    Ok(sha256(input.as_bytes()))
}

/// Extends `policy_digest` the way `TPM2_PolicySecret` does with an empty
/// `policyRef`.
pub fn policy_secret_digest(policy_digest: &[u8], auth_name: &[u8]) -> Vec<u8> {
    let mut input = policy_digest.to_vec();
    input.extend_from_slice(&cc::POLICY_SECRET.to_be_bytes());
    input.extend_from_slice(auth_name);
    sha256(&sha256(&input))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureScheme {
    RsassaSha256,
    EcdsaSha256,
    Null,
}

impl SignatureScheme {
    fn marshal(&self, buf: &mut Writer) {
        match self {
            SignatureScheme::RsassaSha256 => {
                buf.put_u16(TPM_ALG_RSASSA);
                buf.put_u16(TPM_ALG_SHA256);
            }
            SignatureScheme::EcdsaSha256 => {
                buf.put_u16(TPM_ALG_ECDSA);
                buf.put_u16(TPM_ALG_SHA256);
            }
            SignatureScheme::Null => buf.put_u16(TPM_ALG_NULL),
        }
    }

    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        match buf.get_u16()? {
            TPM_ALG_NULL => Ok(SignatureScheme::Null),
            scheme @ (TPM_ALG_RSASSA | TPM_ALG_ECDSA) => {
                buf.expect_u16("scheme hash", TPM_ALG_SHA256)?;
                Ok(match scheme {
                    TPM_ALG_RSASSA => SignatureScheme::RsassaSha256,
                    _ => SignatureScheme::EcdsaSha256,
                })
            }
            other => Err(MarshalError::Unexpected {
                field: "scheme",
                value: other.into(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicParameters {
    KeyedHash,
    Rsa {
        /// AES-128-CFB for storage keys.
        symmetric: bool,
        scheme: SignatureScheme,
        key_bits: u16,
        exponent: u32,
    },
    Ecc {
        symmetric: bool,
        scheme: SignatureScheme,
        curve: u16,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unique {
    KeyedHash(Vec<u8>),
    Rsa(Vec<u8>),
    Ecc { x: Vec<u8>, y: Vec<u8> },
}

/// `TPMT_PUBLIC` for the object types this crate creates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TpmtPublic {
    pub name_alg: u16,
    pub object_attributes: u32,
    pub auth_policy: Vec<u8>,
    pub parameters: PublicParameters,
    pub unique: Unique,
}

fn marshal_symmetric(buf: &mut Writer, symmetric: bool) {
    match symmetric {
        true => {
            buf.put_u16(TPM_ALG_AES);
            buf.put_u16(128);
            buf.put_u16(TPM_ALG_CFB);
        }
        false => buf.put_u16(TPM_ALG_NULL),
    }
}

fn unmarshal_symmetric(buf: &mut Reader) -> marshal::Result<bool> {
    match buf.get_u16()? {
        TPM_ALG_NULL => Ok(false),
        TPM_ALG_AES => {
            buf.expect_u16("symmetric key bits", 128)?;
            buf.expect_u16("symmetric mode", TPM_ALG_CFB)?;
            Ok(true)
        }
        other => Err(MarshalError::Unexpected {
            field: "symmetric",
            value: other.into(),
        }),
    }
}

impl TpmtPublic {
    pub fn rsa_endorsement_key() -> Self {
        Self {
            name_alg: TPM_ALG_SHA256,
            object_attributes: ENDORSEMENT_KEY_ATTRIBUTES,
            auth_policy: ENDORSEMENT_KEY_POLICY.to_vec(),
            parameters: PublicParameters::Rsa {
                symmetric: true,
                scheme: SignatureScheme::Null,
                key_bits: 2048,
                exponent: 0,
            },
            unique: Unique::Rsa(vec![0; 256]),
        }
    }

    pub fn ecc_endorsement_key() -> Self {
        Self {
            name_alg: TPM_ALG_SHA256,
            object_attributes: ENDORSEMENT_KEY_ATTRIBUTES,
            auth_policy: ENDORSEMENT_KEY_POLICY.to_vec(),
            parameters: PublicParameters::Ecc {
                symmetric: true,
                scheme: SignatureScheme::Null,
                curve: TPM_ECC_NIST_P256,
            },
            unique: Unique::Ecc {
                x: vec![0; 32],
                y: vec![0; 32],
            },
        }
    }

    /// Restricted RSASSA-SHA256 signing key used as an attestation identity.
    pub fn identity_key() -> Self {
        Self {
            name_alg: TPM_ALG_SHA256,
            object_attributes: attributes::FIXED_TPM
                | attributes::FIXED_PARENT
                | attributes::SENSITIVE_DATA_ORIGIN
                | attributes::USER_WITH_AUTH
                | attributes::NO_DA
                | attributes::RESTRICTED
                | attributes::SIGN,
            auth_policy: Vec::new(),
            parameters: PublicParameters::Rsa {
                symmetric: false,
                scheme: SignatureScheme::RsassaSha256,
                key_bits: 2048,
                exponent: 0,
            },
            unique: Unique::Rsa(Vec::new()),
        }
    }

    /// Unrestricted key for [`crate::tpm::TpmUtility::create_certified_key`].
    pub fn certified_key(key_type: crate::tpm::KeyType, key_usage: crate::tpm::KeyUsage) -> Self {
        use crate::tpm::{KeyType, KeyUsage};
        let usage = match key_usage {
            KeyUsage::Sign => attributes::SIGN,
            KeyUsage::Decrypt => attributes::DECRYPT,
        };
        let (parameters, unique) = match key_type {
            KeyType::Rsa => (
                PublicParameters::Rsa {
                    symmetric: false,
                    scheme: SignatureScheme::Null,
                    key_bits: 2048,
                    exponent: 0,
                },
                Unique::Rsa(Vec::new()),
            ),
            KeyType::Ecc => (
                PublicParameters::Ecc {
                    symmetric: false,
                    scheme: SignatureScheme::Null,
                    curve: TPM_ECC_NIST_P256,
                },
                Unique::Ecc {
                    x: Vec::new(),
                    y: Vec::new(),
                },
            ),
        };
        Self {
            name_alg: TPM_ALG_SHA256,
            object_attributes: attributes::FIXED_TPM
                | attributes::FIXED_PARENT
                | attributes::SENSITIVE_DATA_ORIGIN
                | attributes::USER_WITH_AUTH
                | attributes::NO_DA
                | usage,
            auth_policy: Vec::new(),
            parameters,
            unique,
        }
    }

    /// Data object only releasable through `policy_digest`.
    pub fn sealed_data(policy_digest: Vec<u8>) -> Self {
        Self {
            name_alg: TPM_ALG_SHA256,
            object_attributes: attributes::FIXED_TPM
                | attributes::FIXED_PARENT
                | attributes::ADMIN_WITH_POLICY
                | attributes::NO_DA,
            auth_policy: policy_digest,
            parameters: PublicParameters::KeyedHash,
            unique: Unique::KeyedHash(Vec::new()),
        }
    }

    pub fn object_type(&self) -> u16 {
        match self.parameters {
            PublicParameters::KeyedHash => TPM_ALG_KEYEDHASH,
            PublicParameters::Rsa { .. } => TPM_ALG_RSA,
            PublicParameters::Ecc { .. } => TPM_ALG_ECC,
        }
    }

    pub fn has_attribute(&self, attribute: u32) -> bool {
        self.object_attributes & attribute == attribute
    }

    pub fn name(&self) -> marshal::Result<Vec<u8>> {
        Ok(tpm2_object_name(&self.to_bytes()?))
    }

    pub fn rsa_public_key(&self) -> crate::crypto::Result<RsaPublicKey> {
        match (&self.parameters, &self.unique) {
            (PublicParameters::Rsa { exponent, .. }, Unique::Rsa(modulus)) => {
                let exponent = match exponent {
                    0 => RSA_PUBLIC_EXPONENT,
                    e => *e,
                };
                Ok(RsaPublicKey::new(
                    BigUint::from_bytes_be(modulus),
                    BigUint::from(exponent),
                )?)
            }
            _ => Err(crate::crypto::CryptoError::UnsupportedAlgorithm(format!(
                "public area of type {:#x} is not RSA",
                self.object_type()
            ))),
        }
    }

    /// `SubjectPublicKeyInfo` DER for RSA and NIST P-256 keys.
    pub fn public_key_info(&self) -> crate::crypto::Result<Vec<u8>> {
        match &self.unique {
            Unique::Ecc { x, y } => ecc_p256_public_key_info(x, y),
            _ => crate::crypto::asymmetric::encode_rsa_public_key_info(&self.rsa_public_key()?),
        }
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        buf.put_u16(self.object_type());
        buf.put_u16(self.name_alg);
        buf.put_u32(self.object_attributes);
        buf.put_tpm2b(&self.auth_policy)?;
        match &self.parameters {
            PublicParameters::KeyedHash => buf.put_u16(TPM_ALG_NULL),
            PublicParameters::Rsa {
                symmetric,
                scheme,
                key_bits,
                exponent,
            } => {
                marshal_symmetric(buf, *symmetric);
                scheme.marshal(buf);
                buf.put_u16(*key_bits);
                buf.put_u32(*exponent);
            }
            PublicParameters::Ecc {
                symmetric,
                scheme,
                curve,
            } => {
                marshal_symmetric(buf, *symmetric);
                scheme.marshal(buf);
                buf.put_u16(*curve);
                buf.put_u16(TPM_ALG_NULL);
            }
        }
        match &self.unique {
            Unique::KeyedHash(digest) => buf.put_tpm2b(digest),
            Unique::Rsa(modulus) => buf.put_tpm2b(modulus),
            Unique::Ecc { x, y } => {
                buf.put_tpm2b(x)?;
                buf.put_tpm2b(y)
            }
        }
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        let object_type = buf.get_u16()?;
        let name_alg = buf.get_u16()?;
        let object_attributes = buf.get_u32()?;
        let auth_policy = buf.get_tpm2b()?;
        let (parameters, unique) = match object_type {
            TPM_ALG_KEYEDHASH => {
                buf.expect_u16("keyedhash scheme", TPM_ALG_NULL)?;
                (PublicParameters::KeyedHash, Unique::KeyedHash(buf.get_tpm2b()?))
            }
            TPM_ALG_RSA => {
                let symmetric = unmarshal_symmetric(buf)?;
                let scheme = SignatureScheme::unmarshal(buf)?;
                let key_bits = buf.get_u16()?;
                let exponent = buf.get_u32()?;
                (
                    PublicParameters::Rsa {
                        symmetric,
                        scheme,
                        key_bits,
                        exponent,
                    },
                    Unique::Rsa(buf.get_tpm2b()?),
                )
            }
            TPM_ALG_ECC => {
                let symmetric = unmarshal_symmetric(buf)?;
                let scheme = SignatureScheme::unmarshal(buf)?;
                let curve = buf.get_u16()?;
                buf.expect_u16("ecc kdf", TPM_ALG_NULL)?;
                let x = buf.get_tpm2b()?;
                let y = buf.get_tpm2b()?;
                (
                    PublicParameters::Ecc {
                        symmetric,
                        scheme,
                        curve,
                    },
                    Unique::Ecc { x, y },
                )
            }
            other => {
                return Err(MarshalError::Unexpected {
                    field: "TPMT_PUBLIC type",
                    value: other.into(),
                })
            }
        };
        Ok(Self {
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// Serialized form of a TPM 2.0 key handed to callers:
/// `TPM2B_PUBLIC || TPM2B_PRIVATE`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyBlob {
    pub public_area: Vec<u8>,
    pub private_area: Vec<u8>,
}

impl Marshal for KeyBlob {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        buf.put_tpm2b(&self.public_area)?;
        buf.put_tpm2b(&self.private_area)
    }
}

impl Unmarshal for KeyBlob {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        Ok(Self {
            public_area: buf.get_tpm2b()?,
            private_area: buf.get_tpm2b()?,
        })
    }
}

/// `TPMS_NV_PUBLIC`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NvPublic {
    pub nv_index: u32,
    pub name_alg: u16,
    pub attributes: u32,
    pub auth_policy: Vec<u8>,
    pub data_size: u16,
}

impl NvPublic {
    pub fn name(&self) -> marshal::Result<Vec<u8>> {
        Ok(tpm2_object_name(&self.to_bytes()?))
    }
}

impl Marshal for NvPublic {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        buf.put_u32(self.nv_index);
        buf.put_u16(self.name_alg);
        buf.put_u32(self.attributes);
        buf.put_tpm2b(&self.auth_policy)?;
        buf.put_u16(self.data_size);
        Ok(())
    }
}

impl Unmarshal for NvPublic {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        Ok(Self {
            nv_index: buf.get_u32()?,
            name_alg: buf.get_u16()?,
            attributes: buf.get_u32()?,
            auth_policy: buf.get_tpm2b()?,
            data_size: buf.get_u16()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attested {
    Quote {
        pcr_select: PcrSelection,
        pcr_digest: Vec<u8>,
    },
    Certify {
        name: Vec<u8>,
        qualified_name: Vec<u8>,
    },
    Nv {
        index_name: Vec<u8>,
        offset: u16,
        nv_contents: Vec<u8>,
    },
}

/// `TPMS_ATTEST`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attest {
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
    pub firmware_version: u64,
    pub attested: Attested,
}

impl Marshal for Attest {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        buf.put_u32(TPM_GENERATED_VALUE);
        buf.put_u16(match self.attested {
            Attested::Quote { .. } => TPM_ST_ATTEST_QUOTE,
            Attested::Certify { .. } => TPM_ST_ATTEST_CERTIFY,
            Attested::Nv { .. } => TPM_ST_ATTEST_NV,
        });
        buf.put_tpm2b(&self.qualified_signer)?;
        buf.put_tpm2b(&self.extra_data)?;
        buf.put_u64(self.clock);
        buf.put_u32(self.reset_count);
        buf.put_u32(self.restart_count);
        buf.put_u8(self.safe as u8);
        buf.put_u64(self.firmware_version);
        match &self.attested {
            Attested::Quote {
                pcr_select,
                pcr_digest,
            } => {
                pcr_select.marshal(buf)?;
                buf.put_tpm2b(pcr_digest)
            }
            Attested::Certify {
                name,
                qualified_name,
            } => {
                buf.put_tpm2b(name)?;
                buf.put_tpm2b(qualified_name)
            }
            Attested::Nv {
                index_name,
                offset,
                nv_contents,
            } => {
                buf.put_tpm2b(index_name)?;
                buf.put_u16(*offset);
                buf.put_tpm2b(nv_contents)
            }
        }
    }
}

impl Unmarshal for Attest {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        buf.expect_u32("TPMS_ATTEST magic", TPM_GENERATED_VALUE)?;
        let tag = buf.get_u16()?;
        let qualified_signer = buf.get_tpm2b()?;
        let extra_data = buf.get_tpm2b()?;
        let clock = buf.get_u64()?;
        let reset_count = buf.get_u32()?;
        let restart_count = buf.get_u32()?;
        let safe = buf.get_u8()? != 0;
        let firmware_version = buf.get_u64()?;
        let attested = match tag {
            TPM_ST_ATTEST_QUOTE => Attested::Quote {
                pcr_select: PcrSelection::unmarshal(buf)?,
                pcr_digest: buf.get_tpm2b()?,
            },
            TPM_ST_ATTEST_CERTIFY => Attested::Certify {
                name: buf.get_tpm2b()?,
                qualified_name: buf.get_tpm2b()?,
            },
            TPM_ST_ATTEST_NV => Attested::Nv {
                index_name: buf.get_tpm2b()?,
                offset: buf.get_u16()?,
                nv_contents: buf.get_tpm2b()?,
            },
            other => {
                return Err(MarshalError::Unexpected {
                    field: "TPMS_ATTEST type",
                    value: other.into(),
                })
            }
        };
        Ok(Self {
            qualified_signer,
            extra_data,
            clock,
            reset_count,
            restart_count,
            safe,
            firmware_version,
            attested,
        })
    }
}

/// `TPMT_SIGNATURE` for the schemes this crate requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signature {
    RsassaSha256(Vec<u8>),
    EcdsaSha256 { r: Vec<u8>, s: Vec<u8> },
}

impl Marshal for Signature {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        match self {
            Signature::RsassaSha256(signature) => {
                buf.put_u16(TPM_ALG_RSASSA);
                buf.put_u16(TPM_ALG_SHA256);
                buf.put_tpm2b(signature)
            }
            Signature::EcdsaSha256 { r, s } => {
                buf.put_u16(TPM_ALG_ECDSA);
                buf.put_u16(TPM_ALG_SHA256);
                buf.put_tpm2b(r)?;
                buf.put_tpm2b(s)
            }
        }
    }
}

impl Unmarshal for Signature {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        let algorithm = buf.get_u16()?;
        buf.expect_u16("signature hash", TPM_ALG_SHA256)?;
        match algorithm {
            TPM_ALG_RSASSA => Ok(Signature::RsassaSha256(buf.get_tpm2b()?)),
            TPM_ALG_ECDSA => Ok(Signature::EcdsaSha256 {
                r: buf.get_tpm2b()?,
                s: buf.get_tpm2b()?,
            }),
            other => Err(MarshalError::Unexpected {
                field: "sigAlg",
                value: other.into(),
            }),
        }
    }
}

impl Signature {
    /// The bytes callers verify: the raw RSA signature, or a DER ECDSA signature.
    pub fn to_signature_bytes(&self) -> crate::crypto::Result<Vec<u8>> {
        match self {
            Signature::RsassaSha256(signature) => Ok(signature.clone()),
            Signature::EcdsaSha256 { r, s } => {
                let field_bytes = |v: &[u8]| {
                    let mut padded = [0u8; 32];
                    let start = 32usize.saturating_sub(v.len());
                    padded[start..].copy_from_slice(&v[v.len().saturating_sub(32)..]);
                    p256::FieldBytes::clone_from_slice(&padded)
                };
                let signature =
                    p256::ecdsa::Signature::from_scalars(field_bytes(r), field_bytes(s))
                        .map_err(|e| crate::crypto::CryptoError::MalformedKey(e.to_string()))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
        }
    }
}

/// A `TPMS_ATTEST` together with the `TPMT_SIGNATURE` over it.
pub struct AttestWithSignature {
    pub attest: Vec<u8>,
    pub signature: Vec<u8>,
}
