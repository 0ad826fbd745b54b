//! Session setup and transient handle lifetimes.

use std::ops::{Deref, DerefMut};

use rsa::RsaPublicKey;
use zeroize::Zeroizing;

use super::authorization::{HmacAuthorization, SessionKind, NONCE_SIZE};
use super::commands::{is_persistent, SessionType, Tpm2Commands, TpmHandle, TPM_RH_NULL};
use super::structures::TpmtPublic;
use crate::crypto::asymmetric::{oaep_sha256_encrypt, TPM2_SECRET_LABEL};
use crate::crypto::primitives::{get_random, tpm2_compatible_kdfa};
use crate::marshal::Unmarshal;
use crate::tpm::Result;

const SALT_SIZE: usize = 32;

/// Owns the transient objects and sessions loaded during one operation and
/// flushes them, newest first, when dropped.
///
/// Commands are issued through the scope itself.
pub struct HandleScope<'a> {
    tpm: &'a mut dyn Tpm2Commands,
    handles: Vec<TpmHandle>,
}

impl<'a> HandleScope<'a> {
    pub fn new(tpm: &'a mut dyn Tpm2Commands) -> Self {
        Self {
            tpm,
            handles: Vec::new(),
        }
    }

    /// Flushes `handle` when the scope ends. Persistent handles are left alone.
    pub fn track(&mut self, handle: TpmHandle) -> TpmHandle {
        if !is_persistent(handle) {
            self.handles.push(handle);
        }
        handle
    }

    /// Stops tracking `handle`; the caller takes over its lifetime.
    pub fn release(&mut self, handle: TpmHandle) -> TpmHandle {
        self.handles.retain(|h| *h != handle);
        handle
    }

    /// Flushes `handle` now.
    pub fn flush(&mut self, handle: TpmHandle) -> Result<()> {
        self.release(handle);
        self.tpm.flush_context(handle)?;
        Ok(())
    }
}

impl<'a> Deref for HandleScope<'a> {
    type Target = dyn Tpm2Commands + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.tpm
    }
}

impl<'a> DerefMut for HandleScope<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.tpm
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        let handles = std::mem::take(&mut self.handles);
        for handle in handles.into_iter().rev() {
            match self.tpm.flush_context(handle) {
                Ok(()) => log::trace!("Flushed handle {:#x}", handle),
                Err(e) => log::warn!("Failed to flush handle {:#x}: {}", handle, e),
            }
        }
    }
}

/// A loaded RSA storage key that salts sessions.
pub struct SaltingKey {
    pub handle: TpmHandle,
    public_key: RsaPublicKey,
}

impl SaltingKey {
    pub fn read(tpm: &mut dyn Tpm2Commands, handle: TpmHandle) -> Result<Self> {
        let public = tpm.read_public(handle)?;
        let public_key = TpmtPublic::from_bytes(&public.public_area)?.rsa_public_key()?;
        Ok(Self { handle, public_key })
    }
}

/// Starts a session tracked by `scope`.
///
/// With a salting key the session key is
/// `KDFa(salt, "ATH", nonceTPM || nonceCaller, 256)`; without one the
/// session is unsalted and its key is empty.
pub fn start_session(
    scope: &mut HandleScope,
    session_type: SessionType,
    salting_key: Option<&SaltingKey>,
) -> Result<HmacAuthorization> {
    let nonce_caller = get_random(NONCE_SIZE)?;
    let (tpm_key, salt, encrypted_salt) = match salting_key {
        Some(key) => {
            let salt = Zeroizing::new(get_random(SALT_SIZE)?);
            let encrypted_salt = oaep_sha256_encrypt(&key.public_key, TPM2_SECRET_LABEL, &salt)?;
            (key.handle, Some(salt), encrypted_salt)
        }
        None => (TPM_RH_NULL, None, Vec::new()),
    };
    let started = scope.start_auth_session(tpm_key, &nonce_caller, &encrypted_salt, session_type)?;
    scope.track(started.handle);

    let session_key = match salt {
        Some(salt) => {
            let mut context = started.nonce_tpm.clone();
            context.extend_from_slice(&nonce_caller);
            Zeroizing::new(tpm2_compatible_kdfa(&salt, "ATH", &context, 256)?)
        }
        None => Zeroizing::default(),
    };
    let kind = match session_type {
        SessionType::Hmac => SessionKind::Hmac,
        SessionType::Policy | SessionType::Trial => SessionKind::Policy,
    };
    log::debug!(
        "Started {:?} session {:#x}{}",
        session_type,
        started.handle,
        if salting_key.is_some() { " (salted)" } else { "" }
    );
    Ok(HmacAuthorization::new(
        started.handle,
        kind,
        session_key,
        started.nonce_tpm,
    ))
}
