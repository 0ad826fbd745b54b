//! TPM 2.0 backend.
//!
//! Commands run on a dedicated worker thread that owns the command layer.
//! Transient objects and sessions live only as long as the operation that
//! loaded them; endorsement keys are kept until the worker stops.

pub mod authorization;
pub mod commands;
pub mod session;
pub mod structures;

use std::collections::HashMap;

use zeroize::Zeroizing;

use self::authorization::{MultipleAuthorizations, PasswordAuthorization, NONCE_SIZE};
use self::commands::{
    is_persistent, rc, SessionType, Tpm2Commands, Tpm2CommandsFactory, Tpm2Error, TpmHandle,
    ECC_ENDORSEMENT_KEY, RSA_ENDORSEMENT_KEY, STORAGE_ROOT_KEY, TPM_RH_ENDORSEMENT, TPM_RH_OWNER,
};
use self::session::{start_session, HandleScope, SaltingKey};
use self::structures::{
    Attest, Attested, KeyBlob, PcrSelection, Signature, SignatureScheme, TpmtPublic,
    TPM_ALG_ECC, TPM_ALG_SHA256,
};
use super::common::{TpmManagerFactory, TpmUtilityCommon};
use super::pcr::check_single_selection;
use super::service::ServiceThread;
use super::{
    CertifiedKey, IdentityKey, KeyType, KeyUsage, NvCertification, PcrQuote, Result, TpmError,
    TpmUtility,
};
use crate::crypto::asymmetric::{encode_rsa_public_key, rsa_modulus};
use crate::crypto::credential::tpm2_id_object;
use crate::crypto::primitives::{get_random, sha256};
use crate::marshal::{Marshal, Unmarshal};
use crate::proto::TpmVersion;

/// Handles and NV indices the backend uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tpm2Settings {
    /// Parent of every key and sealed object, and the salting key of every
    /// session.
    pub salting_key_handle: TpmHandle,
    pub rsa_endorsement_certificate_index: u32,
    pub ecc_endorsement_certificate_index: u32,
}

impl Default for Tpm2Settings {
    fn default() -> Self {
        Self {
            salting_key_handle: STORAGE_ROOT_KEY,
            rsa_endorsement_certificate_index: 0x01c0_0002,
            ecc_endorsement_certificate_index: 0x01c0_000a,
        }
    }
}

fn persistent_endorsement_handle(key_type: KeyType) -> TpmHandle {
    match key_type {
        KeyType::Rsa => RSA_ENDORSEMENT_KEY,
        KeyType::Ecc => ECC_ENDORSEMENT_KEY,
    }
}

/// `TPM_RC_HANDLE` for any handle position.
fn is_handle_error(error: &Tpm2Error) -> bool {
    matches!(error, Tpm2Error::Command { code, .. } if code & 0x0bf == rc::HANDLE)
}

fn signature_bytes(signature: &[u8]) -> Result<Vec<u8>> {
    Ok(Signature::from_bytes(signature)?.to_signature_bytes()?)
}

fn load_key(scope: &mut HandleScope, parent: TpmHandle, key_blob: &[u8]) -> Result<TpmHandle> {
    let blob = KeyBlob::from_bytes(key_blob)?;
    let loaded = scope.load(
        parent,
        &blob.private_area,
        &blob.public_area,
        &mut PasswordAuthorization::empty(),
    )?;
    Ok(scope.track(loaded.handle))
}

/// A salted session with parameter encryption in both directions.
fn encrypted_session(
    scope: &mut HandleScope,
    session_type: SessionType,
    salting_key_handle: TpmHandle,
) -> Result<authorization::HmacAuthorization> {
    let salting_key = SaltingKey::read(&mut **scope, salting_key_handle)?;
    let mut session = start_session(scope, session_type, Some(&salting_key))?;
    session.set_parameter_encryption(true);
    Ok(session)
}

/// Worker-side state: the command layer and the endorsement keys loaded
/// through it.
struct Trunks {
    tpm: Box<dyn Tpm2Commands>,
    salting_key_handle: TpmHandle,
    endorsement_keys: HashMap<KeyType, TpmHandle>,
}

impl Drop for Trunks {
    fn drop(&mut self) {
        for (key_type, handle) in self.endorsement_keys.drain() {
            if is_persistent(handle) {
                continue;
            }
            match self.tpm.flush_context(handle) {
                Ok(()) => log::debug!("Flushed {:?} endorsement key {:#x}", key_type, handle),
                Err(e) => log::warn!("Failed to flush endorsement key {:#x}: {}", handle, e),
            }
        }
    }
}

impl Trunks {
    fn new(tpm: Box<dyn Tpm2Commands>, salting_key_handle: TpmHandle) -> Self {
        Self {
            tpm,
            salting_key_handle,
            endorsement_keys: HashMap::new(),
        }
    }

    /// The cached endorsement key, or the persistent one if it exists.
    fn find_endorsement_key(&mut self, key_type: KeyType) -> Result<Option<TpmHandle>> {
        if let Some(handle) = self.endorsement_keys.get(&key_type) {
            return Ok(Some(*handle));
        }
        let persistent = persistent_endorsement_handle(key_type);
        match self.tpm.read_public(persistent) {
            Ok(_) => {
                log::debug!("Using persistent {:?} endorsement key {:#x}", key_type, persistent);
                self.endorsement_keys.insert(key_type, persistent);
                Ok(Some(persistent))
            }
            Err(e) if is_handle_error(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the endorsement key under the endorsement hierarchy. With the
    /// owner password it is persisted at its well-known handle; otherwise the
    /// transient key is kept until the worker stops.
    fn create_endorsement_key(
        &mut self,
        key_type: KeyType,
        endorsement_password: &[u8],
        owner_password: Option<&[u8]>,
    ) -> Result<TpmHandle> {
        let template = match key_type {
            KeyType::Rsa => TpmtPublic::rsa_endorsement_key(),
            KeyType::Ecc => TpmtPublic::ecc_endorsement_key(),
        }
        .to_bytes()?;
        let mut scope = HandleScope::new(&mut *self.tpm);
        let salting_key = SaltingKey::read(&mut *scope, self.salting_key_handle)?;
        let mut session = start_session(&mut scope, SessionType::Hmac, Some(&salting_key))?;
        session.set_entity_authorization_value(endorsement_password);
        let created = scope.create_primary(TPM_RH_ENDORSEMENT, &template, &mut session)?;
        scope.track(created.handle);

        let handle = match owner_password {
            Some(owner_password) => {
                let persistent = persistent_endorsement_handle(key_type);
                session.set_entity_authorization_value(owner_password);
                scope.evict_control(TPM_RH_OWNER, created.handle, persistent, &mut session)?;
                log::info!("Persisted {:?} endorsement key at {:#x}", key_type, persistent);
                persistent
            }
            None => {
                log::info!(
                    "Owner password is gone; keeping a transient {:?} endorsement key",
                    key_type
                );
                scope.release(created.handle)
            }
        };
        drop(scope);
        self.endorsement_keys.insert(key_type, handle);
        Ok(handle)
    }

    fn read_public_area(&mut self, handle: TpmHandle) -> Result<TpmtPublic> {
        let public = self.tpm.read_public(handle)?;
        Ok(TpmtPublic::from_bytes(&public.public_area)?)
    }

    fn seal_to_pcr0(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let pcrs = PcrSelection::sha256(0)?;
        let salting_key_handle = self.salting_key_handle;
        let mut scope = HandleScope::new(&mut *self.tpm);
        let pcr0 = scope.pcr_read(&pcrs)?;

        let trial = start_session(&mut scope, SessionType::Trial, None)?;
        scope.policy_pcr(trial.handle(), &sha256(&pcr0), &pcrs)?;
        let policy_digest = scope.policy_get_digest(trial.handle())?;
        scope.flush(trial.handle())?;

        let mut session = encrypted_session(&mut scope, SessionType::Hmac, salting_key_handle)?;
        let template = TpmtPublic::sealed_data(policy_digest).to_bytes()?;
        let created = scope.create(salting_key_handle, data, &template, &mut session)?;
        Ok(KeyBlob {
            public_area: created.public_area,
            private_area: created.private_area,
        }
        .to_bytes()?)
    }

    fn unseal(&mut self, sealed_data: &[u8]) -> Result<Vec<u8>> {
        let pcrs = PcrSelection::sha256(0)?;
        let salting_key_handle = self.salting_key_handle;
        let mut scope = HandleScope::new(&mut *self.tpm);
        let item = load_key(&mut scope, salting_key_handle, sealed_data)?;
        let mut policy = encrypted_session(&mut scope, SessionType::Policy, salting_key_handle)?;
        scope.policy_pcr(policy.handle(), &[], &pcrs)?;
        Ok(scope.unseal(item, &mut policy)?)
    }

    fn activate_credential(
        &mut self,
        endorsement_key: TpmHandle,
        identity_key_blob: &[u8],
        encrypted_seed: &[u8],
        id_object: &[u8],
        endorsement_password: &[u8],
    ) -> Result<Vec<u8>> {
        let salting_key_handle = self.salting_key_handle;
        let mut scope = HandleScope::new(&mut *self.tpm);
        let identity_key = load_key(&mut scope, salting_key_handle, identity_key_blob)?;

        // The endorsement key only answers to PolicySecret(TPM_RH_ENDORSEMENT).
        let salting_key = SaltingKey::read(&mut *scope, salting_key_handle)?;
        let mut endorsement = start_session(&mut scope, SessionType::Hmac, Some(&salting_key))?;
        endorsement.set_entity_authorization_value(endorsement_password);
        let mut policy = start_session(&mut scope, SessionType::Policy, Some(&salting_key))?;
        scope.policy_secret(TPM_RH_ENDORSEMENT, policy.handle(), &mut endorsement)?;

        let mut identity_auth = PasswordAuthorization::empty();
        let mut auth = MultipleAuthorizations::new()
            .add(&mut identity_auth)
            .add(&mut policy);
        Ok(scope.activate_credential(
            identity_key,
            endorsement_key,
            id_object,
            encrypted_seed,
            &mut auth,
        )?)
    }

    /// Creates a key from `template`; returns its blob and public area.
    fn create_key(&mut self, template: &TpmtPublic) -> Result<(KeyBlob, TpmtPublic)> {
        let salting_key_handle = self.salting_key_handle;
        let mut scope = HandleScope::new(&mut *self.tpm);
        let mut session = encrypted_session(&mut scope, SessionType::Hmac, salting_key_handle)?;
        let created = scope.create(salting_key_handle, &[], &template.to_bytes()?, &mut session)?;
        let public = TpmtPublic::from_bytes(&created.public_area)?;
        Ok((
            KeyBlob {
                public_area: created.public_area,
                private_area: created.private_area,
            },
            public,
        ))
    }

    fn create_certified_key(
        &mut self,
        key_type: KeyType,
        key_usage: KeyUsage,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> Result<CertifiedKey> {
        let (blob, public) = self.create_key(&TpmtPublic::certified_key(key_type, key_usage))?;
        let key_blob = blob.to_bytes()?;

        let salting_key_handle = self.salting_key_handle;
        let mut scope = HandleScope::new(&mut *self.tpm);
        let key = load_key(&mut scope, salting_key_handle, &key_blob)?;
        let identity_key = load_key(&mut scope, salting_key_handle, identity_key_blob)?;
        let mut key_auth = PasswordAuthorization::empty();
        let mut identity_auth = PasswordAuthorization::empty();
        let mut auth = MultipleAuthorizations::new()
            .add(&mut key_auth)
            .add(&mut identity_auth);
        let certified = scope.certify(
            key,
            identity_key,
            external_data,
            SignatureScheme::RsassaSha256,
            &mut auth,
        )?;

        let public_key_der = match key_type {
            KeyType::Rsa => encode_rsa_public_key(&public.rsa_public_key()?)?,
            KeyType::Ecc => public.public_key_info()?,
        };
        Ok(CertifiedKey {
            key_blob,
            public_key_der,
            public_key_tpm_format: blob.public_area,
            key_info: certified.attest,
            proof: signature_bytes(&certified.signature)?,
        })
    }

    fn create_identity(&mut self) -> Result<IdentityKey> {
        let (blob, public) = self.create_key(&TpmtPublic::identity_key())?;
        Ok(IdentityKey {
            identity_key_blob: blob.to_bytes()?,
            identity_public_key_der: encode_rsa_public_key(&public.rsa_public_key()?)?,
            identity_public_key_tpm_format: blob.public_area,
            identity_binding: None,
        })
    }

    fn quote_pcr(&mut self, pcr_index: u32, key_blob: &[u8]) -> Result<PcrQuote> {
        let pcrs = PcrSelection::sha256(pcr_index)?;
        let nonce = get_random(NONCE_SIZE)?;
        let salting_key_handle = self.salting_key_handle;
        let mut scope = HandleScope::new(&mut *self.tpm);
        let key = load_key(&mut scope, salting_key_handle, key_blob)?;
        let quoted_pcr_value = scope.pcr_read(&pcrs)?;
        let quoted = scope.quote(
            key,
            &nonce,
            SignatureScheme::RsassaSha256,
            &pcrs,
            &mut PasswordAuthorization::empty(),
        )?;
        Ok(PcrQuote {
            quoted_pcr_value,
            quoted_data: quoted.attest,
            quote: signature_bytes(&quoted.signature)?,
        })
    }

    fn read_pcr(&mut self, pcr_index: u32) -> Result<Vec<u8>> {
        Ok(self.tpm.pcr_read(&PcrSelection::sha256(pcr_index)?)?)
    }

    fn nv_data_size(&mut self, nv_index: u32) -> Result<u16> {
        Ok(self.tpm.nv_read_public(nv_index)?.data_size)
    }

    fn certify_nv(
        &mut self,
        nv_index: u32,
        nv_size: u16,
        key_blob: &[u8],
    ) -> Result<NvCertification> {
        let salting_key_handle = self.salting_key_handle;
        let mut scope = HandleScope::new(&mut *self.tpm);
        let key = load_key(&mut scope, salting_key_handle, key_blob)?;
        let mut key_auth = PasswordAuthorization::empty();
        let mut nv_auth = PasswordAuthorization::empty();
        let mut auth = MultipleAuthorizations::new()
            .add(&mut key_auth)
            .add(&mut nv_auth);
        let certified = scope.nv_certify(
            key,
            nv_index,
            nv_index,
            &[],
            SignatureScheme::RsassaSha256,
            nv_size,
            0,
            &mut auth,
        )?;
        Ok(NvCertification {
            quoted_data: certified.attest,
            quote: signature_bytes(&certified.signature)?,
        })
    }

    fn unbind(&mut self, key_blob: &[u8], bound_data: &[u8]) -> Result<Vec<u8>> {
        let salting_key_handle = self.salting_key_handle;
        let mut scope = HandleScope::new(&mut *self.tpm);
        let key = load_key(&mut scope, salting_key_handle, key_blob)?;
        Ok(scope.rsa_decrypt(key, bound_data, &mut PasswordAuthorization::empty())?)
    }

    fn sign(&mut self, key_blob: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let blob = KeyBlob::from_bytes(key_blob)?;
        let scheme = match TpmtPublic::from_bytes(&blob.public_area)?.object_type() {
            TPM_ALG_ECC => SignatureScheme::EcdsaSha256,
            _ => SignatureScheme::RsassaSha256,
        };
        let salting_key_handle = self.salting_key_handle;
        let mut scope = HandleScope::new(&mut *self.tpm);
        let key = load_key(&mut scope, salting_key_handle, key_blob)?;
        let signature = scope.sign(
            key,
            &sha256(data),
            scheme,
            &mut PasswordAuthorization::empty(),
        )?;
        signature_bytes(&signature)
    }
}

pub struct TpmUtilityV2 {
    common: TpmUtilityCommon,
    tpm_factory: Option<Tpm2CommandsFactory>,
    trunks: Option<ServiceThread<Trunks>>,
    settings: Tpm2Settings,
}

impl TpmUtilityV2 {
    pub fn new(
        common: TpmUtilityCommon,
        tpm_factory: Tpm2CommandsFactory,
        settings: Tpm2Settings,
    ) -> Self {
        Self {
            common,
            tpm_factory: Some(tpm_factory),
            trunks: None,
            settings,
        }
    }

    pub fn with_manager(
        owner_dependency: &str,
        manager: TpmManagerFactory,
        tpm_factory: Tpm2CommandsFactory,
        settings: Tpm2Settings,
    ) -> Self {
        Self::new(
            TpmUtilityCommon::new(owner_dependency, manager),
            tpm_factory,
            settings,
        )
    }

    /// Runs `f` on the worker thread.
    fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Trunks) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.trunks
            .as_ref()
            .ok_or(TpmError::NotInitialized)?
            .call(f)?
    }

    fn endorsement_key(&mut self, key_type: KeyType) -> Result<TpmHandle> {
        if let Some(handle) = self.call(move |trunks| trunks.find_endorsement_key(key_type))? {
            return Ok(handle);
        }
        let endorsement_password = self.common.endorsement_password()?;
        let owner_password = match self.common.owner_password() {
            Ok(password) => Some(password),
            Err(TpmError::Unavailable(_)) => None,
            Err(e) => return Err(e),
        };
        self.call(move |trunks| {
            trunks.create_endorsement_key(
                key_type,
                &endorsement_password,
                owner_password.as_ref().map(|p| p.as_slice()),
            )
        })
    }

    fn endorsement_public_area(&mut self, key_type: KeyType) -> Result<TpmtPublic> {
        let handle = self.endorsement_key(key_type)?;
        self.call(move |trunks| trunks.read_public_area(handle))
    }

    fn check_quote(quoted_pcr_value: &[u8], quoted_data: &[u8], pcr_index: u32) -> Result<()> {
        let attest = Attest::from_bytes(quoted_data)?;
        let (pcr_select, pcr_digest) = match attest.attested {
            Attested::Quote {
                pcr_select,
                pcr_digest,
            } => (pcr_select, pcr_digest),
            _ => return Err(TpmError::Malformed("quote")),
        };
        if pcr_select.hash != TPM_ALG_SHA256 {
            return Err(TpmError::Malformed("quoted PCR bank"));
        }
        check_single_selection(&pcr_select.select, pcr_index)?;
        if pcr_digest != sha256(quoted_pcr_value) {
            return Err(TpmError::Malformed("quoted PCR digest"));
        }
        Ok(())
    }
}

impl TpmUtility for TpmUtilityV2 {
    fn initialize(&mut self) -> Result<()> {
        self.common.initialize()?;
        if self.trunks.is_none() {
            let factory = self
                .tpm_factory
                .take()
                .ok_or(TpmError::MissingCollaborator("TPM 2.0 command layer"))?;
            let salting_key_handle = self.settings.salting_key_handle;
            let trunks = ServiceThread::spawn("trunks", move || {
                factory().map(|tpm| Box::new(Trunks::new(tpm, salting_key_handle)))
            })
            .map_err(|e| {
                log::error!("Failed to open the TPM: {}", e);
                e
            })?;
            self.trunks = Some(trunks);
        }
        Ok(())
    }

    fn version(&self) -> TpmVersion {
        TpmVersion::Tpm20
    }

    fn is_tpm_ready(&mut self) -> bool {
        self.common.is_tpm_ready()
    }

    fn activate_identity(&mut self, _: &[u8], _: &[u8], _: &[u8]) -> Result<Vec<u8>> {
        Err(TpmError::Unsupported("ActivateIdentity", TpmVersion::Tpm20))
    }

    fn activate_identity_for_tpm2(
        &mut self,
        key_type: KeyType,
        identity_key_blob: &[u8],
        encrypted_seed: &[u8],
        credential_mac: &[u8],
        wrapped_credential: &[u8],
    ) -> Result<Vec<u8>> {
        let id_object = tpm2_id_object(credential_mac, wrapped_credential)?;
        let endorsement_key = self.endorsement_key(key_type)?;
        let endorsement_password = self.common.endorsement_password()?;
        let identity_key_blob = identity_key_blob.to_vec();
        let encrypted_seed = encrypted_seed.to_vec();
        self.call(move |trunks| {
            trunks.activate_credential(
                endorsement_key,
                &identity_key_blob,
                &encrypted_seed,
                &id_object,
                &endorsement_password,
            )
        })
    }

    fn create_certified_key(
        &mut self,
        key_type: KeyType,
        key_usage: KeyUsage,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> Result<CertifiedKey> {
        let identity_key_blob = identity_key_blob.to_vec();
        let external_data = external_data.to_vec();
        self.call(move |trunks| {
            trunks.create_certified_key(key_type, key_usage, &identity_key_blob, &external_data)
        })
    }

    fn seal_to_pcr0(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let data = Zeroizing::new(data.to_vec());
        self.call(move |trunks| trunks.seal_to_pcr0(&data))
    }

    fn unseal(&mut self, sealed_data: &[u8]) -> Result<Vec<u8>> {
        let sealed_data = sealed_data.to_vec();
        self.call(move |trunks| trunks.unseal(&sealed_data))
    }

    fn get_endorsement_public_key(&mut self, key_type: KeyType) -> Result<Vec<u8>> {
        Ok(self.endorsement_public_area(key_type)?.public_key_info()?)
    }

    fn get_endorsement_certificate(&mut self, key_type: KeyType) -> Result<Vec<u8>> {
        let nv_index = match key_type {
            KeyType::Rsa => self.settings.rsa_endorsement_certificate_index,
            KeyType::Ecc => self.settings.ecc_endorsement_certificate_index,
        };
        self.common.read_space(nv_index, false)
    }

    fn unbind(&mut self, key_blob: &[u8], bound_data: &[u8]) -> Result<Vec<u8>> {
        let key_blob = key_blob.to_vec();
        let bound_data = bound_data.to_vec();
        self.call(move |trunks| trunks.unbind(&key_blob, &bound_data))
    }

    fn sign(&mut self, key_blob: &[u8], data_to_sign: &[u8]) -> Result<Vec<u8>> {
        let key_blob = key_blob.to_vec();
        let data_to_sign = data_to_sign.to_vec();
        self.call(move |trunks| trunks.sign(&key_blob, &data_to_sign))
    }

    fn quote_pcr(&mut self, pcr_index: u32, key_blob: &[u8]) -> Result<PcrQuote> {
        let key_blob = key_blob.to_vec();
        self.call(move |trunks| trunks.quote_pcr(pcr_index, &key_blob))
    }

    fn is_quote_for_pcr(
        &self,
        quoted_pcr_value: &[u8],
        quoted_data: &[u8],
        _quote: &[u8],
        pcr_index: u32,
    ) -> bool {
        match Self::check_quote(quoted_pcr_value, quoted_data, pcr_index) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Quote does not match PCR {}: {}", pcr_index, e);
                false
            }
        }
    }

    fn read_pcr(&mut self, pcr_index: u32) -> Result<Vec<u8>> {
        self.call(move |trunks| trunks.read_pcr(pcr_index))
    }

    fn get_nv_data_size(&mut self, nv_index: u32) -> Result<u16> {
        self.call(move |trunks| trunks.nv_data_size(nv_index))
    }

    fn certify_nv(
        &mut self,
        nv_index: u32,
        nv_size: u16,
        key_blob: &[u8],
    ) -> Result<NvCertification> {
        let key_blob = key_blob.to_vec();
        self.call(move |trunks| trunks.certify_nv(nv_index, nv_size, &key_blob))
    }

    fn remove_owner_dependency(&mut self) -> Result<()> {
        self.common.remove_owner_dependency()
    }

    fn get_endorsement_public_key_modulus(&mut self, key_type: KeyType) -> Result<Vec<u8>> {
        if key_type != KeyType::Rsa {
            return Err(TpmError::UnsupportedKeyType(
                key_type,
                "GetEndorsementPublicKeyModulus",
            ));
        }
        Ok(rsa_modulus(
            &self.endorsement_public_area(key_type)?.rsa_public_key()?,
        ))
    }

    fn create_identity(&mut self, key_type: KeyType) -> Result<IdentityKey> {
        if key_type != KeyType::Rsa {
            return Err(TpmError::UnsupportedKeyType(key_type, "CreateIdentity"));
        }
        self.call(|trunks| trunks.create_identity())
    }

    fn get_rsu_device_id(&mut self) -> Result<Vec<u8>> {
        self.call(|trunks| Ok(trunks.tpm.rsu_device_id()?))
    }
}
