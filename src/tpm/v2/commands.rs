//! The TPM 2.0 command capability [`super::TpmUtilityV2`] drives.
//!
//! Implementations own the transport and the command encoding. Every command
//! that carries an authorization area is handed an [`AuthorizationDelegate`];
//! the implementation calls it in this order:
//!
//! 1. `encrypt_command_parameter` on the first parameter, when the command
//!    has one that can be encrypted,
//! 2. `get_command_authorization` with the command parameter hash,
//! 3. `check_response_authorization` with the response parameter hash,
//! 4. `decrypt_response_parameter` on the first response parameter, when
//!    the response has one that can be encrypted.
//!
//! The crate ships no [`Tpm2Commands`] implementation. The `tss-esapi`
//! feature only provides the TPM state service, because ESAPI computes its
//! own session HMACs and cannot hand the authorization area to a delegate.
//! Callers supply a raw command transport (a TPM2 SAPI binding or a
//! resource-manager socket) through [`Tpm2CommandsFactory`].

use thiserror::Error;

use super::authorization::{AuthorizationDelegate, AuthorizationError};
use super::structures::{AttestWithSignature, NvPublic, PcrSelection, SignatureScheme};
use crate::crypto::primitives::sha256;

#[derive(Error, Debug)]
pub enum Tpm2Error {
    #[error("failed to open the TPM: {0}")]
    Transport(String),
    #[error("{command} failed with response code {code:#x}")]
    Command { command: &'static str, code: u32 },
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
}

pub type Result<T, E = Tpm2Error> = core::result::Result<T, E>;

pub type TpmHandle = u32;

pub const TPM_RH_OWNER: TpmHandle = 0x4000_0001;
pub const TPM_RH_NULL: TpmHandle = 0x4000_0007;
pub const TPM_RS_PW: TpmHandle = 0x4000_0009;
pub const TPM_RH_ENDORSEMENT: TpmHandle = 0x4000_000B;

pub const STORAGE_ROOT_KEY: TpmHandle = 0x8100_0001;
pub const RSA_ENDORSEMENT_KEY: TpmHandle = 0x8101_0001;
pub const ECC_ENDORSEMENT_KEY: TpmHandle = 0x8101_0002;

/// Command codes that appear in policy digests or parameter hashes.
pub mod cc {
    pub const CREATE_PRIMARY: u32 = 0x0000_0131;
    pub const EVICT_CONTROL: u32 = 0x0000_0120;
    pub const NV_CERTIFY: u32 = 0x0000_0184;
    pub const ACTIVATE_CREDENTIAL: u32 = 0x0000_0147;
    pub const CERTIFY: u32 = 0x0000_0148;
    pub const CREATE: u32 = 0x0000_0153;
    pub const LOAD: u32 = 0x0000_0157;
    pub const QUOTE: u32 = 0x0000_0158;
    pub const RSA_DECRYPT: u32 = 0x0000_0159;
    pub const SIGN: u32 = 0x0000_015D;
    pub const UNSEAL: u32 = 0x0000_015E;
    pub const POLICY_SECRET: u32 = 0x0000_0151;
    pub const POLICY_PCR: u32 = 0x0000_017F;
}

/// Response codes the backend reacts to.
pub mod rc {
    pub const SUCCESS: u32 = 0x000;
    pub const HANDLE: u32 = 0x08B;
    pub const AUTH_FAIL: u32 = 0x08E;
    pub const POLICY_FAIL: u32 = 0x09D;
    pub const SCHEME: u32 = 0x092;
    pub const INTEGRITY: u32 = 0x09F;
    pub const VALUE: u32 = 0x084;
    pub const ATTRIBUTES: u32 = 0x082;
    pub const AUTH_MISSING: u32 = 0x125;
    pub const AUTH_UNAVAILABLE: u32 = 0x12F;
    pub const OBJECT_MEMORY: u32 = 0x902;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionType {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

pub struct StartedSession {
    pub handle: TpmHandle,
    pub nonce_tpm: Vec<u8>,
}

pub struct LoadedObject {
    pub handle: TpmHandle,
    pub name: Vec<u8>,
}

pub struct CreatedPrimary {
    pub handle: TpmHandle,
    /// `TPMT_PUBLIC`
    pub public_area: Vec<u8>,
}

pub struct CreatedObject {
    /// `TPM2B_PRIVATE` body.
    pub private_area: Vec<u8>,
    /// `TPMT_PUBLIC`
    pub public_area: Vec<u8>,
}

pub struct PublicArea {
    /// `TPMT_PUBLIC`
    pub public_area: Vec<u8>,
    pub name: Vec<u8>,
}

/// TPM 2.0 commands, one method per command this crate issues.
///
/// Implementations are created and used on a single worker thread.
pub trait Tpm2Commands {
    /// Starts a session with `TPM_ALG_SHA256` as its hash and AES-128-CFB as
    /// its parameter encryption algorithm. `tpm_key` is `TPM_RH_NULL` for an
    /// unsalted session.
    fn start_auth_session(
        &mut self,
        tpm_key: TpmHandle,
        nonce_caller: &[u8],
        encrypted_salt: &[u8],
        session_type: SessionType,
    ) -> Result<StartedSession>;

    fn flush_context(&mut self, handle: TpmHandle) -> Result<()>;

    fn read_public(&mut self, object: TpmHandle) -> Result<PublicArea>;

    fn create_primary(
        &mut self,
        hierarchy: TpmHandle,
        template: &[u8],
        auth: &mut dyn AuthorizationDelegate,
    ) -> Result<CreatedPrimary>;

    /// `sensitive_data` is the first parameter and may be encrypted.
    fn create(
        &mut self,
        parent: TpmHandle,
        sensitive_data: &[u8],
        template: &[u8],
        auth: &mut dyn AuthorizationDelegate,
    ) -> Result<CreatedObject>;

    fn load(
        &mut self,
        parent: TpmHandle,
        private_area: &[u8],
        public_area: &[u8],
        auth: &mut dyn AuthorizationDelegate,
    ) -> Result<LoadedObject>;

    fn evict_control(
        &mut self,
        auth_handle: TpmHandle,
        object: TpmHandle,
        persistent_handle: TpmHandle,
        auth: &mut dyn AuthorizationDelegate,
    ) -> Result<()>;

    /// An empty `pcr_digest` asserts the current PCR values.
    fn policy_pcr(
        &mut self,
        policy_session: TpmHandle,
        pcr_digest: &[u8],
        pcrs: &PcrSelection,
    ) -> Result<()>;

    fn policy_secret(
        &mut self,
        auth_handle: TpmHandle,
        policy_session: TpmHandle,
        auth: &mut dyn AuthorizationDelegate,
    ) -> Result<()>;

    fn policy_get_digest(&mut self, policy_session: TpmHandle) -> Result<Vec<u8>>;

    /// The returned data is the first response parameter and may be encrypted.
    fn unseal(&mut self, item: TpmHandle, auth: &mut dyn AuthorizationDelegate) -> Result<Vec<u8>>;

    /// `credential_blob` is the `TPM2B_ID_OBJECT` body and `secret` the
    /// encrypted seed. Returns the recovered credential.
    fn activate_credential(
        &mut self,
        activate_handle: TpmHandle,
        key_handle: TpmHandle,
        credential_blob: &[u8],
        secret: &[u8],
        auth: &mut dyn AuthorizationDelegate,
    ) -> Result<Vec<u8>>;

    fn quote(
        &mut self,
        sign_handle: TpmHandle,
        qualifying_data: &[u8],
        scheme: SignatureScheme,
        pcrs: &PcrSelection,
        auth: &mut dyn AuthorizationDelegate,
    ) -> Result<AttestWithSignature>;

    /// Needs two authorizations: `object` first, then `sign_handle`.
    fn certify(
        &mut self,
        object: TpmHandle,
        sign_handle: TpmHandle,
        qualifying_data: &[u8],
        scheme: SignatureScheme,
        auth: &mut dyn AuthorizationDelegate,
    ) -> Result<AttestWithSignature>;

    /// Needs two authorizations: `sign_handle` first, then `auth_handle`.
    #[allow(clippy::too_many_arguments)]
    fn nv_certify(
        &mut self,
        sign_handle: TpmHandle,
        auth_handle: TpmHandle,
        nv_index: u32,
        qualifying_data: &[u8],
        scheme: SignatureScheme,
        size: u16,
        offset: u16,
        auth: &mut dyn AuthorizationDelegate,
    ) -> Result<AttestWithSignature>;

    fn nv_read_public(&mut self, nv_index: u32) -> Result<NvPublic>;

    /// Values of the selected PCRs, concatenated in index order.
    fn pcr_read(&mut self, pcrs: &PcrSelection) -> Result<Vec<u8>>;

    /// Returns the `TPMT_SIGNATURE`.
    fn sign(
        &mut self,
        key: TpmHandle,
        digest: &[u8],
        scheme: SignatureScheme,
        auth: &mut dyn AuthorizationDelegate,
    ) -> Result<Vec<u8>>;

    /// RSA-OAEP with SHA-256 and an empty label.
    fn rsa_decrypt(
        &mut self,
        key: TpmHandle,
        ciphertext: &[u8],
        auth: &mut dyn AuthorizationDelegate,
    ) -> Result<Vec<u8>>;

    /// Vendor capability holding the RSU device id.
    fn rsu_device_id(&mut self) -> Result<Vec<u8>>;
}

/// Opens the caller-provided command transport on the worker thread.
pub type Tpm2CommandsFactory = Box<dyn FnOnce() -> Result<Box<dyn Tpm2Commands>> + Send>;

/// `cpHash`: SHA-256 over the command code, the names of the authorized
/// handles and the parameter area as sent.
pub fn command_parameter_hash(command_code: u32, names: &[&[u8]], parameters: &[u8]) -> Vec<u8> {
    let mut input = command_code.to_be_bytes().to_vec();
    for name in names {
        input.extend_from_slice(name);
    }
    input.extend_from_slice(parameters);
    sha256(&input)
}

/// `rpHash` of a successful response.
pub fn response_parameter_hash(command_code: u32, parameters: &[u8]) -> Vec<u8> {
    let mut input = rc::SUCCESS.to_be_bytes().to_vec();
    input.extend_from_slice(&command_code.to_be_bytes());
    input.extend_from_slice(parameters);
    sha256(&input)
}

/// Name of a permanent or NV-less handle: the handle itself.
pub fn handle_name(handle: TpmHandle) -> Vec<u8> {
    handle.to_be_bytes().to_vec()
}

pub fn is_persistent(handle: TpmHandle) -> bool {
    handle >> 24 == 0x81
}

pub fn command_error(command: &'static str, code: u32) -> Tpm2Error {
    Tpm2Error::Command { command, code }
}
