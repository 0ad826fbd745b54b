//! Authorization areas for TPM 2.0 commands.
//!
//! A delegate produces the `TPMS_AUTH_COMMAND` entries for one command and
//! validates the matching `TPMS_AUTH_RESPONSE` entries. Sessions that encrypt
//! parameters use AES-128-CFB keyed through KDFa with the session nonces.

use thiserror::Error;
use zeroize::Zeroizing;

use super::commands::{TpmHandle, TPM_RS_PW};
use crate::crypto::primitives::{
    aes128_cfb_decrypt, aes128_cfb_encrypt, get_random, hmac_sha256, tpm2_compatible_kdfa,
    verify_mac,
};
use crate::crypto::CryptoError;
use crate::marshal::{self, Marshal, MarshalError, Reader, Unmarshal, Writer};

#[derive(Error, Debug)]
pub enum AuthorizationError {
    #[error("malformed authorization area: {0}")]
    Malformed(#[from] MarshalError),
    #[error("response HMAC of session {0:#x} does not verify")]
    ResponseHmac(TpmHandle),
    #[error("session {0:#x} returned attributes {1:#04x}")]
    UnexpectedAttributes(TpmHandle, u8),
    #[error("password authorization returned a non-empty nonce or HMAC")]
    UnexpectedPasswordResponse,
    #[error("{0} bytes follow the last response authorization")]
    TrailingBytes(usize),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type Result<T, E = AuthorizationError> = core::result::Result<T, E>;

/// `TPMA_SESSION` bits.
pub mod session_attributes {
    pub const CONTINUE_SESSION: u8 = 0x01;
    pub const DECRYPT: u8 = 0x20;
    pub const ENCRYPT: u8 = 0x40;
}

use session_attributes::{CONTINUE_SESSION, DECRYPT, ENCRYPT};

/// Size of the caller nonces this crate generates.
pub const NONCE_SIZE: usize = 16;

/// `TPMS_AUTH_COMMAND`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthCommand {
    pub session_handle: TpmHandle,
    pub nonce: Vec<u8>,
    pub attributes: u8,
    pub hmac: Vec<u8>,
}

impl Marshal for AuthCommand {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        buf.put_u32(self.session_handle);
        buf.put_tpm2b(&self.nonce)?;
        buf.put_u8(self.attributes);
        buf.put_tpm2b(&self.hmac)
    }
}

impl Unmarshal for AuthCommand {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        Ok(Self {
            session_handle: buf.get_u32()?,
            nonce: buf.get_tpm2b()?,
            attributes: buf.get_u8()?,
            hmac: buf.get_tpm2b()?,
        })
    }
}

/// `TPMS_AUTH_RESPONSE`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthResponse {
    pub nonce: Vec<u8>,
    pub attributes: u8,
    pub hmac: Vec<u8>,
}

impl Marshal for AuthResponse {
    fn marshal(&self, buf: &mut Writer) -> marshal::Result<()> {
        buf.put_tpm2b(&self.nonce)?;
        buf.put_u8(self.attributes);
        buf.put_tpm2b(&self.hmac)
    }
}

impl Unmarshal for AuthResponse {
    fn unmarshal(buf: &mut Reader) -> marshal::Result<Self> {
        Ok(Self {
            nonce: buf.get_tpm2b()?,
            attributes: buf.get_u8()?,
            hmac: buf.get_tpm2b()?,
        })
    }
}

pub trait AuthorizationDelegate {
    /// Authorization area entries for a command with parameter hash `command_hash`.
    fn get_command_authorization(
        &mut self,
        command_hash: &[u8],
        is_command_parameter_encryption_possible: bool,
        is_response_parameter_encryption_possible: bool,
    ) -> Result<Vec<u8>>;

    /// Validates the response entries produced for the last command.
    fn check_response_authorization(
        &mut self,
        response_hash: &[u8],
        authorization: &[u8],
    ) -> Result<()>;

    fn encrypt_command_parameter(&mut self, parameter: &mut [u8]) -> Result<()>;

    fn decrypt_response_parameter(&mut self, parameter: &mut [u8]) -> Result<()>;
}

/// Plaintext password authorization through `TPM_RS_PW`.
pub struct PasswordAuthorization {
    password: Zeroizing<Vec<u8>>,
}

impl PasswordAuthorization {
    pub fn new(password: &[u8]) -> Self {
        Self {
            password: Zeroizing::new(password.to_vec()),
        }
    }

    pub fn empty() -> Self {
        Self::new(&[])
    }
}

impl AuthorizationDelegate for PasswordAuthorization {
    fn get_command_authorization(
        &mut self,
        _command_hash: &[u8],
        _is_command_parameter_encryption_possible: bool,
        _is_response_parameter_encryption_possible: bool,
    ) -> Result<Vec<u8>> {
        Ok(AuthCommand {
            session_handle: TPM_RS_PW,
            nonce: Vec::new(),
            attributes: CONTINUE_SESSION,
            hmac: self.password.to_vec(),
        }
        .to_bytes()?)
    }

    fn check_response_authorization(
        &mut self,
        _response_hash: &[u8],
        authorization: &[u8],
    ) -> Result<()> {
        let response = AuthResponse::from_bytes(authorization)?;
        if !response.nonce.is_empty()
            || !response.hmac.is_empty()
            || response.attributes != CONTINUE_SESSION
        {
            return Err(AuthorizationError::UnexpectedPasswordResponse);
        }
        Ok(())
    }

    fn encrypt_command_parameter(&mut self, _parameter: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn decrypt_response_parameter(&mut self, _parameter: &mut [u8]) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    Hmac,
    Policy,
}

/// An HMAC or policy session.
///
/// The HMAC key is the session key followed, for HMAC sessions, by the
/// authorized entity's auth value. A new caller nonce is drawn for every
/// command.
pub struct HmacAuthorization {
    session_handle: TpmHandle,
    kind: SessionKind,
    session_key: Zeroizing<Vec<u8>>,
    entity_auth: Zeroizing<Vec<u8>>,
    nonce_caller: Vec<u8>,
    nonce_tpm: Vec<u8>,
    parameter_encryption: bool,
    command_in_flight: bool,
    last_attributes: u8,
}

impl HmacAuthorization {
    pub fn new(
        session_handle: TpmHandle,
        kind: SessionKind,
        session_key: Zeroizing<Vec<u8>>,
        nonce_tpm: Vec<u8>,
    ) -> Self {
        Self {
            session_handle,
            kind,
            session_key,
            entity_auth: Zeroizing::default(),
            nonce_caller: Vec::new(),
            nonce_tpm,
            parameter_encryption: false,
            command_in_flight: false,
            last_attributes: CONTINUE_SESSION,
        }
    }

    pub fn handle(&self) -> TpmHandle {
        self.session_handle
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Auth value of the entity this session authorizes.
    pub fn set_entity_authorization_value(&mut self, auth_value: &[u8]) {
        self.entity_auth = Zeroizing::new(auth_value.to_vec());
    }

    pub fn set_parameter_encryption(&mut self, enabled: bool) {
        self.parameter_encryption = enabled;
    }

    fn begin_command(&mut self) -> Result<()> {
        if !self.command_in_flight {
            self.nonce_caller = get_random(NONCE_SIZE)?;
            self.command_in_flight = true;
        }
        Ok(())
    }

    fn hmac_key(&self) -> Zeroizing<Vec<u8>> {
        let mut key = Zeroizing::new(self.session_key.to_vec());
        if self.kind == SessionKind::Hmac {
            key.extend_from_slice(&self.entity_auth);
        }
        key
    }

    /// AES-128-CFB key and IV for one direction.
    fn cfb_key(&self, nonce_newer: &[u8], nonce_older: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let mut context = nonce_newer.to_vec();
        context.extend_from_slice(nonce_older);
        Ok(Zeroizing::new(tpm2_compatible_kdfa(
            &self.hmac_key(),
            "CFB",
            &context,
            256,
        )?))
    }

    fn compute_hmac(
        &self,
        parameter_hash: &[u8],
        nonce_newer: &[u8],
        nonce_older: &[u8],
        attributes: u8,
    ) -> Result<Vec<u8>> {
        let mut input = parameter_hash.to_vec();
        input.extend_from_slice(nonce_newer);
        input.extend_from_slice(nonce_older);
        input.push(attributes);
        Ok(hmac_sha256(&input, &self.hmac_key())?)
    }
}

impl AuthorizationDelegate for HmacAuthorization {
    fn get_command_authorization(
        &mut self,
        command_hash: &[u8],
        is_command_parameter_encryption_possible: bool,
        is_response_parameter_encryption_possible: bool,
    ) -> Result<Vec<u8>> {
        self.begin_command()?;
        let mut attributes = CONTINUE_SESSION;
        if self.parameter_encryption && is_command_parameter_encryption_possible {
            attributes |= DECRYPT;
        }
        if self.parameter_encryption && is_response_parameter_encryption_possible {
            attributes |= ENCRYPT;
        }
        self.last_attributes = attributes;
        let hmac =
            self.compute_hmac(command_hash, &self.nonce_caller, &self.nonce_tpm, attributes)?;
        Ok(AuthCommand {
            session_handle: self.session_handle,
            nonce: self.nonce_caller.clone(),
            attributes,
            hmac,
        }
        .to_bytes()?)
    }

    fn check_response_authorization(
        &mut self,
        response_hash: &[u8],
        authorization: &[u8],
    ) -> Result<()> {
        self.command_in_flight = false;
        let response = AuthResponse::from_bytes(authorization)?;
        if response.attributes != self.last_attributes {
            return Err(AuthorizationError::UnexpectedAttributes(
                self.session_handle,
                response.attributes,
            ));
        }
        let expected = self.compute_hmac(
            response_hash,
            &response.nonce,
            &self.nonce_caller,
            response.attributes,
        )?;
        verify_mac(&expected, &response.hmac)
            .map_err(|_| AuthorizationError::ResponseHmac(self.session_handle))?;
        self.nonce_tpm = response.nonce;
        Ok(())
    }

    fn encrypt_command_parameter(&mut self, parameter: &mut [u8]) -> Result<()> {
        if !self.parameter_encryption {
            return Ok(());
        }
        self.begin_command()?;
        let key = self.cfb_key(&self.nonce_caller, &self.nonce_tpm)?;
        aes128_cfb_encrypt(&key[..16], &key[16..], parameter)?;
        Ok(())
    }

    fn decrypt_response_parameter(&mut self, parameter: &mut [u8]) -> Result<()> {
        if self.last_attributes & ENCRYPT == 0 {
            return Ok(());
        }
        let key = self.cfb_key(&self.nonce_tpm, &self.nonce_caller)?;
        aes128_cfb_decrypt(&key[..16], &key[16..], parameter)?;
        Ok(())
    }
}

/// Authorizes commands that need several sessions, in handle order.
///
/// Response entries are split back out and every delegate must accept its
/// own entry.
#[derive(Default)]
pub struct MultipleAuthorizations<'a> {
    delegates: Vec<&'a mut dyn AuthorizationDelegate>,
}

impl<'a> MultipleAuthorizations<'a> {
    pub fn new() -> Self {
        Self {
            delegates: Vec::new(),
        }
    }

    pub fn add(mut self, delegate: &'a mut dyn AuthorizationDelegate) -> Self {
        self.delegates.push(delegate);
        self
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }
}

impl AuthorizationDelegate for MultipleAuthorizations<'_> {
    fn get_command_authorization(
        &mut self,
        command_hash: &[u8],
        is_command_parameter_encryption_possible: bool,
        is_response_parameter_encryption_possible: bool,
    ) -> Result<Vec<u8>> {
        let mut authorization = Vec::new();
        for delegate in self.delegates.iter_mut() {
            authorization.extend(delegate.get_command_authorization(
                command_hash,
                is_command_parameter_encryption_possible,
                is_response_parameter_encryption_possible,
            )?);
        }
        Ok(authorization)
    }

    fn check_response_authorization(
        &mut self,
        response_hash: &[u8],
        authorization: &[u8],
    ) -> Result<()> {
        let mut buf = Reader::new(authorization);
        for delegate in self.delegates.iter_mut() {
            let start = buf.position();
            AuthResponse::unmarshal(&mut buf)?;
            delegate.check_response_authorization(
                response_hash,
                &authorization[start..buf.position()],
            )?;
        }
        match buf.remaining() {
            0 => Ok(()),
            trailing => Err(AuthorizationError::TrailingBytes(trailing)),
        }
    }

    fn encrypt_command_parameter(&mut self, parameter: &mut [u8]) -> Result<()> {
        for delegate in self.delegates.iter_mut() {
            delegate.encrypt_command_parameter(parameter)?;
        }
        Ok(())
    }

    fn decrypt_response_parameter(&mut self, parameter: &mut [u8]) -> Result<()> {
        for delegate in self.delegates.iter_mut() {
            delegate.decrypt_response_parameter(parameter)?;
        }
        Ok(())
    }
}
