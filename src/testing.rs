//! In-process stand-ins for the TPM, its software stacks and the TPM state
//! service, plus the fixed RSA keys they hand out.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::asymmetric::{TPM2_IDENTITY_LABEL, TPM2_SECRET_LABEL, TPM_OAEP_LABEL};
use crate::crypto::credential::{tpm2_object_name, Tpm12AsymCaContents};
use crate::crypto::primitives::{
    self, aes128_cfb_decrypt, aes128_cfb_encrypt, get_random, hmac_sha256, sha256,
    tpm2_compatible_kdfa, verify_mac,
};
use crate::marshal::{Marshal, Reader, Unmarshal, Writer};
use crate::proto::TpmVersion;
use crate::tpm::common::{TpmManager, TpmManagerError, TpmManagerFactory, TpmStatus};
use crate::tpm::local_data::{LocalData, OwnerDelegate};
use crate::tpm::v1::tss::{
    pcr_composite_digest, Authorization, MadeIdentity, QuoteInfo2, Tpm12PublicKey, TssConnector,
    TssContext, TssError, TssKeyHandle, TPM_NONCE_SIZE,
};
use crate::tpm::v2::authorization::{
    session_attributes, AuthCommand, AuthResponse, AuthorizationDelegate, NONCE_SIZE,
};
use crate::tpm::v2::commands::{
    self, cc, command_error, command_parameter_hash, handle_name, rc, response_parameter_hash,
    CreatedObject, CreatedPrimary, LoadedObject, PublicArea, SessionType, StartedSession,
    Tpm2Commands, Tpm2CommandsFactory, TpmHandle, STORAGE_ROOT_KEY, TPM_RH_ENDORSEMENT,
    TPM_RH_NULL, TPM_RH_OWNER, TPM_RS_PW,
};
use crate::tpm::v2::structures::{
    attributes, policy_pcr_digest, policy_secret_digest, Attest, AttestWithSignature, Attested,
    NvPublic, PcrSelection, PublicParameters, Signature, SignatureScheme, TpmtPublic, Unique,
    TPM_ALG_SHA256,
};
use crate::tpm::{
    CertifiedKey, IdentityKey, KeyType, KeyUsage, NvCertification, PcrQuote, Result, TpmError,
    TpmUtility,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TestKey {
    Endorsement,
    StorageRoot,
    Aik,
    Google,
}

static TEST_KEYS: Lazy<HashMap<TestKey, RsaPrivateKey>> = Lazy::new(|| {
    [
        (TestKey::Endorsement, include_str!("../testdata/ek.pem")),
        (TestKey::StorageRoot, include_str!("../testdata/srk.pem")),
        (TestKey::Aik, include_str!("../testdata/aik.pem")),
        (TestKey::Google, include_str!("../testdata/pub2048.pem")),
    ]
    .into_iter()
    .map(|(key, pem)| (key, RsaPrivateKey::from_pkcs8_pem(pem).expect("test key")))
    .collect()
});

pub fn rsa_private_key(key: TestKey) -> RsaPrivateKey {
    TEST_KEYS[&key].clone()
}

/// Hands out the fixed test keys before generating fresh ones.
struct KeyPool(VecDeque<TestKey>);

impl Default for KeyPool {
    fn default() -> Self {
        Self(VecDeque::from([TestKey::Aik, TestKey::Google]))
    }
}

impl KeyPool {
    fn next(&mut self) -> RsaPrivateKey {
        match self.0.pop_front() {
            Some(key) => rsa_private_key(key),
            None => RsaPrivateKey::new(&mut OsRng, 2048).expect("RSA key generation"),
        }
    }
}

fn tpm2b(data: &[u8]) -> Vec<u8> {
    let mut buf = Writer::new();
    buf.put_tpm2b(data).expect("TPM2B");
    buf.into_vec()
}

/// The TPM side of `TPM2_ActivateCredential` for an RSA endorsement key.
fn recover_credential(
    endorsement_key: &RsaPrivateKey,
    name: &[u8],
    id_object: &[u8],
    encrypted_seed: &[u8],
) -> crate::crypto::Result<Vec<u8>> {
    let seed = Zeroizing::new(endorsement_key.decrypt(
        Oaep::new_with_label::<Sha256, _>(TPM2_IDENTITY_LABEL),
        encrypted_seed,
    )?);
    let mut buf = Reader::new(id_object);
    let integrity = buf.get_tpm2b()?;
    let mut enc_identity = buf.get_remaining().to_vec();

    let hmac_key = tpm2_compatible_kdfa(&seed, "INTEGRITY", &[], 256)?;
    let expected = hmac_sha256(&[enc_identity.as_slice(), name].concat(), &hmac_key)?;
    verify_mac(&expected, &integrity)?;

    let symmetric_key = tpm2_compatible_kdfa(&seed, "STORAGE", name, 128)?;
    aes128_cfb_decrypt(&symmetric_key, &[0u8; 16], &mut enc_identity)?;
    Ok(Reader::new(&enc_identity).get_tpm2b()?)
}

/// Recovers a TPM 2.0 identity credential with the test endorsement key.
pub fn tpm2_activate_credential(
    name: &[u8],
    id_object: &[u8],
    encrypted_seed: &[u8],
) -> crate::crypto::Result<Vec<u8>> {
    recover_credential(
        &rsa_private_key(TestKey::Endorsement),
        name,
        id_object,
        encrypted_seed,
    )
}

/// A [`TpmUtility`] that only seals, binding data to a software PCR0.
#[derive(Default)]
pub struct FakeTpmUtility {
    pub fail_seal: bool,
    pub pcr0: Vec<u8>,
}

impl FakeTpmUtility {
    pub fn extend_pcr0(&mut self, data: &[u8]) {
        self.pcr0 = sha256(&[self.pcr0.as_slice(), &sha256(data)].concat());
    }

    fn unsupported<T>(operation: &'static str) -> Result<T> {
        Err(TpmError::Unsupported(operation, TpmVersion::Tpm20))
    }
}

impl TpmUtility for FakeTpmUtility {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn version(&self) -> TpmVersion {
        TpmVersion::Tpm20
    }

    fn is_tpm_ready(&mut self) -> bool {
        true
    }

    fn activate_identity(&mut self, _: &[u8], _: &[u8], _: &[u8]) -> Result<Vec<u8>> {
        Self::unsupported("ActivateIdentity")
    }

    fn activate_identity_for_tpm2(
        &mut self,
        _: KeyType,
        _: &[u8],
        _: &[u8],
        _: &[u8],
        _: &[u8],
    ) -> Result<Vec<u8>> {
        Self::unsupported("ActivateIdentityForTpm2")
    }

    fn create_certified_key(
        &mut self,
        _: KeyType,
        _: KeyUsage,
        _: &[u8],
        _: &[u8],
    ) -> Result<CertifiedKey> {
        Self::unsupported("CreateCertifiedKey")
    }

    fn seal_to_pcr0(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.fail_seal {
            return Err(TpmError::Tpm2(command_error("TPM2_Create", rc::OBJECT_MEMORY)));
        }
        let mut buf = Writer::new();
        buf.put_tpm2b(&self.pcr0)?;
        buf.put_tpm2b(data)?;
        Ok(buf.into_vec())
    }

    fn unseal(&mut self, sealed_data: &[u8]) -> Result<Vec<u8>> {
        let mut buf = Reader::new(sealed_data);
        let pcr0 = buf.get_tpm2b()?;
        let data = buf.get_tpm2b()?;
        buf.finish()?;
        if pcr0 != self.pcr0 {
            return Err(TpmError::Tpm2(command_error("TPM2_Unseal", rc::POLICY_FAIL)));
        }
        Ok(data)
    }

    fn get_endorsement_public_key(&mut self, _: KeyType) -> Result<Vec<u8>> {
        Self::unsupported("GetEndorsementPublicKey")
    }

    fn get_endorsement_certificate(&mut self, _: KeyType) -> Result<Vec<u8>> {
        Self::unsupported("GetEndorsementCertificate")
    }

    fn unbind(&mut self, _: &[u8], _: &[u8]) -> Result<Vec<u8>> {
        Self::unsupported("Unbind")
    }

    fn sign(&mut self, _: &[u8], _: &[u8]) -> Result<Vec<u8>> {
        Self::unsupported("Sign")
    }

    fn quote_pcr(&mut self, _: u32, _: &[u8]) -> Result<PcrQuote> {
        Self::unsupported("QuotePCR")
    }

    fn is_quote_for_pcr(&self, _: &[u8], _: &[u8], _: &[u8], _: u32) -> bool {
        false
    }

    fn read_pcr(&mut self, pcr_index: u32) -> Result<Vec<u8>> {
        match pcr_index {
            0 => Ok(self.pcr0.clone()),
            _ => Self::unsupported("ReadPCR"),
        }
    }

    fn get_nv_data_size(&mut self, _: u32) -> Result<u16> {
        Self::unsupported("GetNVDataSize")
    }

    fn certify_nv(&mut self, _: u32, _: u16, _: &[u8]) -> Result<NvCertification> {
        Self::unsupported("CertifyNV")
    }

    fn remove_owner_dependency(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_endorsement_public_key_modulus(&mut self, _: KeyType) -> Result<Vec<u8>> {
        Self::unsupported("GetEndorsementPublicKeyModulus")
    }

    fn create_identity(&mut self, _: KeyType) -> Result<IdentityKey> {
        Self::unsupported("CreateIdentity")
    }

    fn get_rsu_device_id(&mut self) -> Result<Vec<u8>> {
        Self::unsupported("GetRsuDeviceId")
    }
}

/// What the fake TPM state service reports.
pub struct FakeTpmManagerState {
    pub enabled: bool,
    pub owned: bool,
    pub unavailable: bool,
    pub status_calls: usize,
    pub local_data: LocalData,
    pub nv_spaces: HashMap<u32, Vec<u8>>,
}

impl FakeTpmManagerState {
    /// An enabled, owned TPM with both passwords known and one owner dependency.
    pub fn ready() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            enabled: true,
            owned: true,
            unavailable: false,
            status_calls: 0,
            local_data: LocalData {
                owner_password: Zeroizing::new(b"owner".to_vec()),
                endorsement_password: Zeroizing::new(b"endorsement".to_vec()),
                owner_delegate: None,
                owner_dependency: vec!["attestation".to_string()],
            },
            nv_spaces: HashMap::new(),
        }))
    }

    pub fn set_delegate(&mut self, blob: &[u8], secret: &[u8]) {
        self.local_data.owner_delegate = Some(OwnerDelegate {
            blob: blob.to_vec(),
            secret: Zeroizing::new(secret.to_vec()),
        });
    }

    fn check_available(&self) -> Result<(), TpmManagerError> {
        match self.unavailable {
            true => Err(TpmManagerError::Unavailable("tpm_managerd is down".into())),
            false => Ok(()),
        }
    }
}

pub struct FakeTpmManager {
    state: Arc<Mutex<FakeTpmManagerState>>,
}

impl FakeTpmManager {
    pub fn factory(state: Arc<Mutex<FakeTpmManagerState>>) -> TpmManagerFactory {
        Box::new(move || Ok(Box::new(FakeTpmManager { state }) as Box<dyn TpmManager>))
    }
}

impl TpmManager for FakeTpmManager {
    fn get_tpm_status(&mut self) -> Result<TpmStatus, TpmManagerError> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        state.check_available()?;
        Ok(TpmStatus {
            enabled: state.enabled,
            owned: state.owned,
            local_data: state.local_data.clone(),
        })
    }

    fn remove_owner_dependency(&mut self, dependency: &str) -> Result<(), TpmManagerError> {
        let mut state = self.state.lock().unwrap();
        state.check_available()?;
        state.local_data.remove_owner_dependency(dependency);
        Ok(())
    }

    fn read_space(&mut self, nv_index: u32, _: bool) -> Result<Vec<u8>, TpmManagerError> {
        let state = self.state.lock().unwrap();
        state.check_available()?;
        state
            .nv_spaces
            .get(&nv_index)
            .cloned()
            .ok_or(TpmManagerError::NvSpaceMissing(nv_index))
    }
}

const TPM12_ES_NONE: u16 = 0x0001;
const TPM12_ES_RSAESOAEP_SHA1_MGF1: u16 = 0x0003;
const TPM12_SS_NONE: u16 = 0x0001;
const TPM12_SS_RSASSAPKCS1V15_SHA1: u16 = 0x0002;
const TPM12_SS_RSASSAPKCS1V15_DER: u16 = 0x0003;
const TPM12_KEY_SIGNING: u16 = 0x0010;
const TPM12_KEY_IDENTITY: u16 = 0x0012;
const TPM12_KEY_BIND: u16 = 0x0014;

const TPM12_AUTHFAIL: u32 = 0x0001;
const TPM12_BADINDEX: u32 = 0x0002;
const TPM12_BAD_PARAMETER: u32 = 0x0003;
const TPM12_INVALID_KEYHANDLE: u32 = 0x000C;
const TPM12_WRONGPCRVAL: u32 = 0x0018;
const TPM12_DECRYPT_ERROR: u32 = 0x0021;
const TPM12_INVALID_KEYUSAGE: u32 = 0x0024;

const KEY_BLOB_MAGIC: &[u8] = b"KEY12";
const SEALED_BLOB_MAGIC: &[u8] = b"SEAL12";

fn tss_error(command: &'static str, code: u32, message: impl Into<String>) -> TssError {
    TssError::Command {
        command,
        code,
        message: message.into(),
    }
}

fn encode_blob(magic: &[u8], id: usize) -> Vec<u8> {
    [magic, &(id as u32).to_be_bytes()].concat()
}

fn decode_blob(command: &'static str, magic: &[u8], blob: &[u8]) -> Result<usize, TssError> {
    blob.strip_prefix(magic)
        .and_then(|id| <[u8; 4]>::try_from(id).ok())
        .map(|id| u32::from_be_bytes(id) as usize)
        .ok_or_else(|| tss_error(command, TPM12_BAD_PARAMETER, "unrecognized blob"))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tpm12KeyUsage {
    Identity,
    Signing,
    Bind,
}

struct Tpm12Key {
    private: RsaPrivateKey,
    usage: Tpm12KeyUsage,
}

impl Tpm12Key {
    fn public_key(&self) -> Tpm12PublicKey {
        let (encryption_scheme, signature_scheme) = match self.usage {
            Tpm12KeyUsage::Identity => (TPM12_ES_NONE, TPM12_SS_RSASSAPKCS1V15_SHA1),
            Tpm12KeyUsage::Signing => (TPM12_ES_NONE, TPM12_SS_RSASSAPKCS1V15_DER),
            Tpm12KeyUsage::Bind => (TPM12_ES_RSAESOAEP_SHA1_MGF1, TPM12_SS_NONE),
        };
        Tpm12PublicKey::from_rsa(
            &self.private.to_public_key(),
            encryption_scheme,
            signature_scheme,
        )
    }

    fn public_key_bytes(&self, command: &'static str) -> Result<Vec<u8>, TssError> {
        self.public_key()
            .to_bytes()
            .map_err(|e| tss_error(command, TPM12_BAD_PARAMETER, e.to_string()))
    }

    fn sign_sha1(&self, command: &'static str, data: &[u8]) -> Result<Vec<u8>, TssError> {
        self.private
            .sign(Pkcs1v15Sign::new::<sha1::Sha1>(), &primitives::sha1(data))
            .map_err(|e| tss_error(command, TPM12_BAD_PARAMETER, e.to_string()))
    }
}

/// A software TPM 1.2 behind the TSS interface.
pub struct FakeTssState {
    pub unreachable: bool,
    pub last_authorization: Option<&'static str>,
    pub nv_sizes: HashMap<u32, u32>,
    pub owner_password: Vec<u8>,
    pcrs: Vec<Vec<u8>>,
    keys: Vec<Tpm12Key>,
    sealed: Vec<(Vec<(u32, Vec<u8>)>, Vec<u8>)>,
    key_pool: KeyPool,
}

impl FakeTssState {
    pub fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            unreachable: false,
            last_authorization: None,
            nv_sizes: HashMap::new(),
            owner_password: b"owner".to_vec(),
            pcrs: vec![vec![0u8; 20]; 24],
            keys: Vec::new(),
            sealed: Vec::new(),
            key_pool: KeyPool::default(),
        }))
    }

    pub fn extend_pcr(&mut self, pcr_index: u32, data: &[u8]) {
        let pcr = &mut self.pcrs[pcr_index as usize];
        *pcr = primitives::sha1(&[pcr.as_slice(), &primitives::sha1(data)].concat());
    }

    fn add_key(&mut self, usage: Tpm12KeyUsage) -> Vec<u8> {
        let private = self.key_pool.next();
        self.keys.push(Tpm12Key { private, usage });
        encode_blob(KEY_BLOB_MAGIC, self.keys.len() - 1)
    }
}

pub struct FakeTss {
    state: Arc<Mutex<FakeTssState>>,
}

impl FakeTss {
    pub fn new(state: Arc<Mutex<FakeTssState>>) -> Self {
        Self { state }
    }
}

impl TssConnector for FakeTss {
    fn connect(&mut self, authorization: &Authorization) -> Result<Box<dyn TssContext>, TssError> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(TssError::Connect("tcsd is not running".into()));
        }
        state.last_authorization = Some(authorization.describe());
        let privileged = match authorization {
            Authorization::User => false,
            Authorization::Owner(password) => password.as_slice() == state.owner_password,
            Authorization::Delegate { blob, secret } => !blob.is_empty() && !secret.is_empty(),
        };
        Ok(Box::new(FakeTssContext {
            state: self.state.clone(),
            privileged,
            loaded: HashMap::new(),
        }))
    }
}

struct FakeTssContext {
    state: Arc<Mutex<FakeTssState>>,
    privileged: bool,
    loaded: HashMap<TssKeyHandle, usize>,
}

impl FakeTssContext {
    fn require_privilege(&self, command: &'static str) -> Result<(), TssError> {
        match self.privileged {
            true => Ok(()),
            false => Err(tss_error(command, TPM12_AUTHFAIL, "owner authorization required")),
        }
    }

    fn key_id(&self, command: &'static str, handle: TssKeyHandle) -> Result<usize, TssError> {
        self.loaded
            .get(&handle)
            .copied()
            .ok_or_else(|| tss_error(command, TPM12_INVALID_KEYHANDLE, "key is not loaded"))
    }

    fn with_key<R>(
        &self,
        command: &'static str,
        handle: TssKeyHandle,
        usage: Tpm12KeyUsage,
        f: impl FnOnce(&Tpm12Key) -> Result<R, TssError>,
    ) -> Result<R, TssError> {
        let id = self.key_id(command, handle)?;
        let state = self.state.lock().unwrap();
        let key = &state.keys[id];
        if key.usage != usage {
            return Err(tss_error(command, TPM12_INVALID_KEYUSAGE, "wrong key usage"));
        }
        f(key)
    }
}

impl TssContext for FakeTssContext {
    fn load_key(&mut self, key_blob: &[u8]) -> Result<TssKeyHandle, TssError> {
        const COMMAND: &str = "Tspi_Key_LoadKey";
        let id = decode_blob(COMMAND, KEY_BLOB_MAGIC, key_blob)?;
        if id >= self.state.lock().unwrap().keys.len() {
            return Err(tss_error(COMMAND, TPM12_BAD_PARAMETER, "unknown key"));
        }
        let handle = 0x0100_0000 + self.loaded.len() as TssKeyHandle;
        self.loaded.insert(handle, id);
        Ok(handle)
    }

    fn read_pcr(&mut self, pcr_index: u32) -> Result<Vec<u8>, TssError> {
        self.state
            .lock()
            .unwrap()
            .pcrs
            .get(pcr_index as usize)
            .cloned()
            .ok_or_else(|| tss_error("Tspi_TPM_PcrRead", TPM12_BADINDEX, "no such PCR"))
    }

    fn seal(&mut self, data: &[u8], pcr_values: &[(u32, Vec<u8>)]) -> Result<Vec<u8>, TssError> {
        let mut state = self.state.lock().unwrap();
        state.sealed.push((pcr_values.to_vec(), data.to_vec()));
        Ok(encode_blob(SEALED_BLOB_MAGIC, state.sealed.len() - 1))
    }

    fn unseal(&mut self, sealed_data: &[u8]) -> Result<Vec<u8>, TssError> {
        const COMMAND: &str = "Tspi_Data_Unseal";
        let id = decode_blob(COMMAND, SEALED_BLOB_MAGIC, sealed_data)?;
        let state = self.state.lock().unwrap();
        let (pcr_values, data) = state
            .sealed
            .get(id)
            .ok_or_else(|| tss_error(COMMAND, TPM12_BAD_PARAMETER, "unknown sealed data"))?;
        for (index, value) in pcr_values {
            if state.pcrs[*index as usize] != *value {
                return Err(tss_error(COMMAND, TPM12_WRONGPCRVAL, "wrong PCR value"));
            }
        }
        Ok(data.clone())
    }

    fn activate_identity(
        &mut self,
        identity_key: TssKeyHandle,
        asym_ca_contents: &[u8],
    ) -> Result<Vec<u8>, TssError> {
        const COMMAND: &str = "Tspi_TPM_ActivateIdentity";
        self.require_privilege(COMMAND)?;
        self.with_key(COMMAND, identity_key, Tpm12KeyUsage::Identity, |key| {
            let contents = rsa_private_key(TestKey::Endorsement)
                .decrypt(
                    Oaep::new_with_label::<sha1::Sha1, _>(TPM_OAEP_LABEL),
                    asym_ca_contents,
                )
                .map_err(|e| tss_error(COMMAND, TPM12_DECRYPT_ERROR, e.to_string()))?;
            let contents = Tpm12AsymCaContents::from_bytes(&contents)
                .map_err(|e| tss_error(COMMAND, TPM12_BAD_PARAMETER, e.to_string()))?;
            if contents.id_digest != primitives::sha1(&key.public_key_bytes(COMMAND)?) {
                return Err(tss_error(COMMAND, TPM12_BAD_PARAMETER, "identity digest mismatch"));
            }
            contents
                .session_key
                .to_bytes()
                .map_err(|e| tss_error(COMMAND, TPM12_BAD_PARAMETER, e.to_string()))
        })
    }

    fn create_key(&mut self, usage: KeyUsage) -> Result<Vec<u8>, TssError> {
        let usage = match usage {
            KeyUsage::Sign => Tpm12KeyUsage::Signing,
            KeyUsage::Decrypt => Tpm12KeyUsage::Bind,
        };
        Ok(self.state.lock().unwrap().add_key(usage))
    }

    fn get_public_key(&mut self, key: TssKeyHandle) -> Result<Vec<u8>, TssError> {
        const COMMAND: &str = "Tspi_Key_GetPubKey";
        let id = self.key_id(COMMAND, key)?;
        self.state.lock().unwrap().keys[id].public_key_bytes(COMMAND)
    }

    fn certify_key(
        &mut self,
        key: TssKeyHandle,
        certifier: TssKeyHandle,
        anti_replay: &[u8; TPM_NONCE_SIZE],
    ) -> Result<(Vec<u8>, Vec<u8>), TssError> {
        const COMMAND: &str = "Tspi_Key_CertifyKey";
        let id = self.key_id(COMMAND, key)?;
        let (key_usage, public_key) = {
            let state = self.state.lock().unwrap();
            let key = &state.keys[id];
            let usage = match key.usage {
                Tpm12KeyUsage::Identity => TPM12_KEY_IDENTITY,
                Tpm12KeyUsage::Signing => TPM12_KEY_SIGNING,
                Tpm12KeyUsage::Bind => TPM12_KEY_BIND,
            };
            (usage, key.public_key_bytes(COMMAND)?)
        };
        // Abbreviated TPM_CERTIFY_INFO: version, key usage, flags, pubkey digest, nonce.
        let mut info = Writer::new();
        info.put_bytes(&[1, 1, 0, 0]);
        info.put_u16(key_usage);
        info.put_u32(0);
        info.put_bytes(&primitives::sha1(&public_key));
        info.put_bytes(anti_replay);
        info.put_u8(0);
        info.put_u32(0);
        let info = info.into_vec();
        let signature = self.with_key(COMMAND, certifier, Tpm12KeyUsage::Identity, |certifier| {
            certifier.sign_sha1(COMMAND, &info)
        })?;
        Ok((info, signature))
    }

    fn quote2(
        &mut self,
        identity_key: TssKeyHandle,
        pcr_select: &[u8],
        anti_replay: &[u8; TPM_NONCE_SIZE],
    ) -> Result<(Vec<u8>, Vec<u8>), TssError> {
        const COMMAND: &str = "Tspi_TPM_Quote2";
        let pcr_value = {
            let state = self.state.lock().unwrap();
            let mut value = Vec::new();
            for (byte, bits) in pcr_select.iter().enumerate() {
                for bit in 0..8 {
                    if bits & (1 << bit) != 0 {
                        value.extend_from_slice(&state.pcrs[byte * 8 + bit]);
                    }
                }
            }
            value
        };
        let digest = pcr_composite_digest(pcr_select, &pcr_value)
            .map_err(|e| tss_error(COMMAND, TPM12_BAD_PARAMETER, e.to_string()))?;
        let mut digest_at_release = [0u8; 20];
        digest_at_release.copy_from_slice(&digest);
        let info = QuoteInfo2 {
            external_data: *anti_replay,
            pcr_select: pcr_select.to_vec(),
            locality_at_release: 1,
            digest_at_release,
        }
        .to_bytes()
        .map_err(|e| tss_error(COMMAND, TPM12_BAD_PARAMETER, e.to_string()))?;
        let signature = self.with_key(COMMAND, identity_key, Tpm12KeyUsage::Identity, |key| {
            key.sign_sha1(COMMAND, &info)
        })?;
        Ok((info, signature))
    }

    fn get_endorsement_public_key(&mut self) -> Result<Vec<u8>, TssError> {
        const COMMAND: &str = "Tspi_TPM_GetPubEndorsementKey";
        self.require_privilege(COMMAND)?;
        Tpm12PublicKey::from_rsa(
            &rsa_private_key(TestKey::Endorsement).to_public_key(),
            TPM12_ES_RSAESOAEP_SHA1_MGF1,
            TPM12_SS_NONE,
        )
        .to_bytes()
        .map_err(|e| tss_error(COMMAND, TPM12_BAD_PARAMETER, e.to_string()))
    }

    fn nv_data_size(&mut self, nv_index: u32) -> Result<u32, TssError> {
        self.state
            .lock()
            .unwrap()
            .nv_sizes
            .get(&nv_index)
            .copied()
            .ok_or_else(|| tss_error("Tspi_NV_GetDataSize", TPM12_BADINDEX, "no such space"))
    }

    fn unbind(&mut self, key: TssKeyHandle, bound_data: &[u8]) -> Result<Vec<u8>, TssError> {
        const COMMAND: &str = "Tspi_Data_Unbind";
        self.with_key(COMMAND, key, Tpm12KeyUsage::Bind, |key| {
            let bound = key
                .private
                .decrypt(
                    Oaep::new_with_label::<sha1::Sha1, _>(TPM_OAEP_LABEL),
                    bound_data,
                )
                .map_err(|e| tss_error(COMMAND, TPM12_DECRYPT_ERROR, e.to_string()))?;
            bound
                .strip_prefix(&[1u8, 1, 0, 0, 2][..])
                .map(<[u8]>::to_vec)
                .ok_or_else(|| tss_error(COMMAND, TPM12_DECRYPT_ERROR, "not TPM_BOUND_DATA"))
        })
    }

    fn sign(&mut self, key: TssKeyHandle, digest_info: &[u8]) -> Result<Vec<u8>, TssError> {
        const COMMAND: &str = "Tspi_Hash_Sign";
        self.with_key(COMMAND, key, Tpm12KeyUsage::Signing, |key| {
            key.private
                .sign(Pkcs1v15Sign::new_unprefixed(), digest_info)
                .map_err(|e| tss_error(COMMAND, TPM12_BAD_PARAMETER, e.to_string()))
        })
    }

    fn make_identity(&mut self) -> Result<MadeIdentity, TssError> {
        const COMMAND: &str = "Tspi_TPM_CollateIdentityRequest";
        self.require_privilege(COMMAND)?;
        let mut state = self.state.lock().unwrap();
        let identity_key_blob = state.add_key(Tpm12KeyUsage::Identity);
        let key = state.keys.last().expect("identity key");
        let identity_binding = key.sign_sha1(COMMAND, &key.public_key_bytes(COMMAND)?)?;
        Ok(MadeIdentity {
            identity_key_blob,
            identity_binding,
        })
    }
}

#[derive(Clone)]
enum Sensitive {
    Rsa(RsaPrivateKey),
    Ecc(p256::SecretKey),
    Data(Vec<u8>),
}

#[derive(Clone)]
struct Object {
    public: TpmtPublic,
    public_area: Vec<u8>,
    sensitive: Sensitive,
}

impl Object {
    fn new(mut public: TpmtPublic, sensitive: Sensitive) -> Self {
        public.unique = match &sensitive {
            Sensitive::Rsa(key) => Unique::Rsa(key.n().to_bytes_be()),
            Sensitive::Ecc(key) => {
                let point = key.public_key().to_encoded_point(false);
                Unique::Ecc {
                    x: point.x().expect("x coordinate").to_vec(),
                    y: point.y().expect("y coordinate").to_vec(),
                }
            }
            Sensitive::Data(data) => Unique::KeyedHash(sha256(data)),
        };
        let public_area = public.to_bytes().expect("TPMT_PUBLIC");
        Self {
            public,
            public_area,
            sensitive,
        }
    }

    fn name(&self) -> Vec<u8> {
        tpm2_object_name(&self.public_area)
    }

    fn rsa(&self, command: &'static str) -> commands::Result<&RsaPrivateKey> {
        match &self.sensitive {
            Sensitive::Rsa(key) => Ok(key),
            _ => Err(command_error(command, rc::ATTRIBUTES)),
        }
    }
}

struct Session {
    session_type: SessionType,
    session_key: Vec<u8>,
    nonce_tpm: Vec<u8>,
    policy_digest: Vec<u8>,
}

struct StoredPrivate {
    parent: TpmHandle,
    public_area: Vec<u8>,
    sensitive: Sensitive,
}

struct NvSpace {
    public: NvPublic,
    data: Vec<u8>,
}

/// Who a command authorizes against, as the TPM sees it.
struct Entity {
    name: Vec<u8>,
    auth_value: Vec<u8>,
    auth_policy: Vec<u8>,
    user_with_auth: bool,
}

const TRANSIENT_FIRST: TpmHandle = 0x8000_0000;
const HMAC_SESSION_FIRST: TpmHandle = 0x0200_0000;
const POLICY_SESSION_FIRST: TpmHandle = 0x0300_0000;
const TPMA_NV_AUTHWRITE: u32 = 1 << 2;
const TPMA_NV_AUTHREAD: u32 = 1 << 18;

fn parameter_key(hmac_key: &[u8], nonce_newer: &[u8], nonce_older: &[u8]) -> Vec<u8> {
    tpm2_compatible_kdfa(hmac_key, "CFB", &[nonce_newer, nonce_older].concat(), 256)
        .expect("KDFa")
}

fn parse_auth_commands(area: &[u8]) -> crate::marshal::Result<Vec<AuthCommand>> {
    let mut buf = Reader::new(area);
    let mut auth_commands = Vec::new();
    while buf.remaining() > 0 {
        auth_commands.push(AuthCommand::unmarshal(&mut buf)?);
    }
    Ok(auth_commands)
}

/// A software TPM 2.0 that enforces password, HMAC and policy
/// authorization and AES-CFB parameter encryption the way a real one does.
pub struct FakeTpm2State {
    pub endorsement_password: Vec<u8>,
    pub owner_password: Vec<u8>,
    pub flushed: Vec<TpmHandle>,
    /// Command and response parameters that crossed the interface encrypted.
    pub encrypted_parameters: usize,
    pub create_primary_calls: usize,
    /// Fails the named command with `TPM_RC_OBJECT_MEMORY`.
    pub fail_command: Option<&'static str>,
    pub rsu_device_id: Option<Vec<u8>>,
    pcrs: Vec<Vec<u8>>,
    persistent: HashMap<TpmHandle, Object>,
    transient: HashMap<TpmHandle, Object>,
    sessions: HashMap<TpmHandle, Session>,
    private_store: Vec<StoredPrivate>,
    nv_spaces: HashMap<u32, NvSpace>,
    next_handle: u32,
    clock: u64,
    key_pool: KeyPool,
}

impl FakeTpm2State {
    pub fn new() -> Arc<Mutex<Self>> {
        let storage_root_key = Object::new(
            TpmtPublic {
                name_alg: TPM_ALG_SHA256,
                object_attributes: attributes::FIXED_TPM
                    | attributes::FIXED_PARENT
                    | attributes::SENSITIVE_DATA_ORIGIN
                    | attributes::USER_WITH_AUTH
                    | attributes::NO_DA
                    | attributes::RESTRICTED
                    | attributes::DECRYPT,
                auth_policy: Vec::new(),
                parameters: PublicParameters::Rsa {
                    symmetric: true,
                    scheme: SignatureScheme::Null,
                    key_bits: 2048,
                    exponent: 0,
                },
                unique: Unique::Rsa(Vec::new()),
            },
            Sensitive::Rsa(rsa_private_key(TestKey::StorageRoot)),
        );
        Arc::new(Mutex::new(Self {
            endorsement_password: b"endorsement".to_vec(),
            owner_password: b"owner".to_vec(),
            flushed: Vec::new(),
            encrypted_parameters: 0,
            create_primary_calls: 0,
            fail_command: None,
            rsu_device_id: Some(b"rsu device id".to_vec()),
            pcrs: vec![vec![0u8; 32]; 24],
            persistent: HashMap::from([(STORAGE_ROOT_KEY, storage_root_key)]),
            transient: HashMap::new(),
            sessions: HashMap::new(),
            private_store: Vec::new(),
            nv_spaces: HashMap::new(),
            next_handle: 0,
            clock: 1000,
            key_pool: KeyPool::default(),
        }))
    }

    /// Transient objects and sessions currently loaded.
    pub fn live_handles(&self) -> usize {
        self.transient.len() + self.sessions.len()
    }

    pub fn has_persistent(&self, handle: TpmHandle) -> bool {
        self.persistent.contains_key(&handle)
    }

    pub fn extend_pcr(&mut self, pcr_index: u32, data: &[u8]) {
        let pcr = &mut self.pcrs[pcr_index as usize];
        *pcr = sha256(&[pcr.as_slice(), &sha256(data)].concat());
    }

    pub fn define_nv_space(&mut self, nv_index: u32, data: &[u8]) {
        let public = NvPublic {
            nv_index,
            name_alg: TPM_ALG_SHA256,
            attributes: TPMA_NV_AUTHWRITE | TPMA_NV_AUTHREAD,
            auth_policy: Vec::new(),
            data_size: data.len() as u16,
        };
        self.nv_spaces.insert(
            nv_index,
            NvSpace {
                public,
                data: data.to_vec(),
            },
        );
    }

    fn begin(&self, command: &'static str) -> commands::Result<()> {
        match self.fail_command == Some(command) {
            true => Err(command_error(command, rc::OBJECT_MEMORY)),
            false => Ok(()),
        }
    }

    fn allocate(&mut self, first: TpmHandle) -> TpmHandle {
        self.next_handle += 1;
        first | self.next_handle
    }

    fn object(&self, command: &'static str, handle: TpmHandle) -> commands::Result<&Object> {
        self.transient
            .get(&handle)
            .or_else(|| self.persistent.get(&handle))
            .ok_or_else(|| command_error(command, rc::HANDLE))
    }

    fn read_pcrs(&self, pcrs: &PcrSelection) -> Vec<u8> {
        pcrs.indices()
            .into_iter()
            .flat_map(|index| self.pcrs[index as usize].clone())
            .collect()
    }

    fn entity(&self, command: &'static str, handle: TpmHandle) -> commands::Result<Entity> {
        let hierarchy = |auth_value: &[u8]| Entity {
            name: handle_name(handle),
            auth_value: auth_value.to_vec(),
            auth_policy: Vec::new(),
            user_with_auth: true,
        };
        match handle {
            TPM_RH_ENDORSEMENT => Ok(hierarchy(&self.endorsement_password)),
            TPM_RH_OWNER => Ok(hierarchy(&self.owner_password)),
            h if h >> 24 == 0x01 => {
                let space = self
                    .nv_spaces
                    .get(&h)
                    .ok_or_else(|| command_error(command, rc::HANDLE))?;
                Ok(Entity {
                    name: space.public.name().expect("NV name"),
                    auth_value: Vec::new(),
                    auth_policy: space.public.auth_policy.clone(),
                    user_with_auth: true,
                })
            }
            h => {
                let object = self.object(command, h)?;
                Ok(Entity {
                    name: object.name(),
                    auth_value: Vec::new(),
                    auth_policy: object.public.auth_policy.clone(),
                    user_with_auth: object.public.has_attribute(attributes::USER_WITH_AUTH),
                })
            }
        }
    }

    /// Checks one authorization; returns the session's HMAC key.
    fn check_authorization(
        &self,
        command: &'static str,
        command_hash: &[u8],
        request: &AuthCommand,
        entity: &Entity,
    ) -> commands::Result<Option<Vec<u8>>> {
        if request.session_handle == TPM_RS_PW {
            if !entity.user_with_auth {
                return Err(command_error(command, rc::AUTH_UNAVAILABLE));
            }
            if request.hmac != entity.auth_value {
                return Err(command_error(command, rc::AUTH_FAIL));
            }
            return Ok(None);
        }
        let session = self
            .sessions
            .get(&request.session_handle)
            .ok_or_else(|| command_error(command, rc::HANDLE))?;
        let mut key = session.session_key.clone();
        match session.session_type {
            SessionType::Trial => return Err(command_error(command, rc::ATTRIBUTES)),
            SessionType::Hmac => {
                if !entity.user_with_auth {
                    return Err(command_error(command, rc::AUTH_UNAVAILABLE));
                }
                key.extend_from_slice(&entity.auth_value);
            }
            SessionType::Policy => {
                if session.policy_digest != entity.auth_policy {
                    return Err(command_error(command, rc::POLICY_FAIL));
                }
            }
        }
        let expected = hmac_sha256(
            &[
                command_hash,
                &request.nonce,
                &session.nonce_tpm,
                &[request.attributes],
            ]
            .concat(),
            &key,
        )
        .expect("HMAC");
        if expected != request.hmac {
            return Err(command_error(command, rc::AUTH_FAIL));
        }
        Ok(Some(key))
    }

    /// Runs an authorized command end to end: the caller's side of the
    /// delegate protocol and the TPM's.
    ///
    /// `parameter` is the first command parameter when it can be encrypted.
    /// `action` receives it in plaintext and returns the first response
    /// parameter, which is returned to the caller after decryption.
    #[allow(clippy::too_many_arguments)]
    fn run_authorized<R>(
        &mut self,
        command: &'static str,
        command_code: u32,
        handles: &[TpmHandle],
        parameter: Option<&[u8]>,
        response_encryptable: bool,
        auth: &mut dyn AuthorizationDelegate,
        action: impl FnOnce(&mut Self, Vec<u8>) -> commands::Result<(Vec<u8>, R)>,
    ) -> commands::Result<(Vec<u8>, R)> {
        self.begin(command)?;
        let entities = handles
            .iter()
            .map(|handle| self.entity(command, *handle))
            .collect::<commands::Result<Vec<_>>>()?;

        let mut sent = parameter.map(<[u8]>::to_vec).unwrap_or_default();
        if parameter.is_some() {
            auth.encrypt_command_parameter(&mut sent)?;
        }
        let names: Vec<&[u8]> = entities.iter().map(|e| e.name.as_slice()).collect();
        let command_hash = command_parameter_hash(command_code, &names, &tpm2b(&sent));
        let area = auth.get_command_authorization(
            &command_hash,
            parameter.is_some(),
            response_encryptable,
        )?;

        let requests =
            parse_auth_commands(&area).map_err(|_| command_error(command, rc::AUTH_MISSING))?;
        if requests.len() != entities.len() {
            return Err(command_error(command, rc::AUTH_MISSING));
        }
        let mut keys = Vec::with_capacity(requests.len());
        for (request, entity) in requests.iter().zip(&entities) {
            keys.push(self.check_authorization(command, &command_hash, request, entity)?);
        }

        if let Some((request, Some(key))) = requests
            .iter()
            .zip(&keys)
            .find(|(r, _)| r.attributes & session_attributes::DECRYPT != 0)
        {
            let nonce_tpm = &self.sessions[&request.session_handle].nonce_tpm;
            let cfb = parameter_key(key, &request.nonce, nonce_tpm);
            aes128_cfb_decrypt(&cfb[..16], &cfb[16..], &mut sent).expect("CFB");
            self.encrypted_parameters += 1;
        }

        let (mut response, value) = action(self, sent)?;

        let nonces: Vec<Vec<u8>> = requests
            .iter()
            .map(|r| match r.session_handle {
                TPM_RS_PW => Vec::new(),
                _ => get_random(NONCE_SIZE).expect("nonce"),
            })
            .collect();
        if response_encryptable {
            if let Some(((request, Some(key)), nonce)) = requests
                .iter()
                .zip(&keys)
                .zip(&nonces)
                .find(|((r, _), _)| r.attributes & session_attributes::ENCRYPT != 0)
            {
                let cfb = parameter_key(key, nonce, &request.nonce);
                aes128_cfb_encrypt(&cfb[..16], &cfb[16..], &mut response).expect("CFB");
                self.encrypted_parameters += 1;
            }
        }

        let response_hash = response_parameter_hash(command_code, &tpm2b(&response));
        let mut response_area = Vec::new();
        for ((request, key), nonce) in requests.iter().zip(&keys).zip(nonces) {
            let entry = match key {
                None => AuthResponse {
                    nonce: Vec::new(),
                    attributes: request.attributes,
                    hmac: Vec::new(),
                },
                Some(key) => {
                    let hmac = hmac_sha256(
                        &[
                            response_hash.as_slice(),
                            &nonce,
                            &request.nonce,
                            &[request.attributes],
                        ]
                        .concat(),
                        key,
                    )
                    .expect("HMAC");
                    if let Some(session) = self.sessions.get_mut(&request.session_handle) {
                        session.nonce_tpm = nonce.clone();
                        if session.session_type == SessionType::Policy {
                            session.policy_digest = vec![0u8; 32];
                        }
                    }
                    AuthResponse {
                        nonce,
                        attributes: request.attributes,
                        hmac,
                    }
                }
            };
            response_area.extend(entry.to_bytes().expect("TPMS_AUTH_RESPONSE"));
        }

        auth.check_response_authorization(&response_hash, &response_area)?;
        if response_encryptable {
            auth.decrypt_response_parameter(&mut response)?;
        }
        Ok((response, value))
    }

    fn attest(
        &mut self,
        command: &'static str,
        signer: TpmHandle,
        extra_data: Vec<u8>,
        attested: Attested,
    ) -> commands::Result<Vec<u8>> {
        self.clock += 1;
        Attest {
            qualified_signer: self.object(command, signer)?.name(),
            extra_data,
            clock: self.clock,
            reset_count: 0,
            restart_count: 0,
            safe: true,
            firmware_version: 0x2018_0101,
            attested,
        }
        .to_bytes()
        .map_err(|_| command_error(command, rc::VALUE))
    }

    /// Returns the `TPMT_SIGNATURE` over `digest`.
    fn sign_digest(
        &self,
        command: &'static str,
        key: TpmHandle,
        scheme: SignatureScheme,
        digest: &[u8],
    ) -> commands::Result<Vec<u8>> {
        let object = self.object(command, key)?;
        if !object.public.has_attribute(attributes::SIGN) {
            return Err(command_error(command, rc::ATTRIBUTES));
        }
        let scheme = match (scheme, &object.public.parameters) {
            (SignatureScheme::Null, PublicParameters::Rsa { scheme, .. })
            | (SignatureScheme::Null, PublicParameters::Ecc { scheme, .. }) => *scheme,
            (scheme, _) => scheme,
        };
        let signature = match (&object.sensitive, scheme) {
            (Sensitive::Rsa(key), SignatureScheme::RsassaSha256) => Signature::RsassaSha256(
                key.sign(Pkcs1v15Sign::new::<Sha256>(), digest)
                    .map_err(|_| command_error(command, rc::VALUE))?,
            ),
            (Sensitive::Ecc(key), SignatureScheme::EcdsaSha256) => {
                let signature: p256::ecdsa::Signature = p256::ecdsa::SigningKey::from(key)
                    .sign_prehash(digest)
                    .map_err(|_| command_error(command, rc::VALUE))?;
                let (r, s) = signature.split_bytes();
                Signature::EcdsaSha256 {
                    r: r.to_vec(),
                    s: s.to_vec(),
                }
            }
            _ => return Err(command_error(command, rc::SCHEME)),
        };
        signature
            .to_bytes()
            .map_err(|_| command_error(command, rc::VALUE))
    }

    fn parse_template(command: &'static str, template: &[u8]) -> commands::Result<TpmtPublic> {
        TpmtPublic::from_bytes(template).map_err(|_| command_error(command, rc::VALUE))
    }
}

pub struct FakeTpm2 {
    state: Arc<Mutex<FakeTpm2State>>,
}

impl FakeTpm2 {
    pub fn new(state: Arc<Mutex<FakeTpm2State>>) -> Self {
        Self { state }
    }

    pub fn factory(state: Arc<Mutex<FakeTpm2State>>) -> Tpm2CommandsFactory {
        Box::new(move || Ok(Box::new(FakeTpm2::new(state)) as Box<dyn Tpm2Commands>))
    }
}

impl Tpm2Commands for FakeTpm2 {
    fn start_auth_session(
        &mut self,
        tpm_key: TpmHandle,
        nonce_caller: &[u8],
        encrypted_salt: &[u8],
        session_type: SessionType,
    ) -> commands::Result<StartedSession> {
        const COMMAND: &str = "TPM2_StartAuthSession";
        let mut tpm = self.state.lock().unwrap();
        tpm.begin(COMMAND)?;
        let nonce_tpm = get_random(NONCE_SIZE).expect("nonce");
        let session_key = match tpm_key {
            TPM_RH_NULL => Vec::new(),
            handle => {
                let salt = tpm
                    .object(COMMAND, handle)?
                    .rsa(COMMAND)?
                    .decrypt(
                        Oaep::new_with_label::<Sha256, _>(TPM2_SECRET_LABEL),
                        encrypted_salt,
                    )
                    .map_err(|_| command_error(COMMAND, rc::VALUE))?;
                let nonces = [nonce_tpm.as_slice(), nonce_caller].concat();
                tpm2_compatible_kdfa(&salt, "ATH", &nonces, 256).expect("KDFa")
            }
        };
        let handle = match session_type {
            SessionType::Hmac => tpm.allocate(HMAC_SESSION_FIRST),
            SessionType::Policy | SessionType::Trial => tpm.allocate(POLICY_SESSION_FIRST),
        };
        tpm.sessions.insert(
            handle,
            Session {
                session_type,
                session_key,
                nonce_tpm: nonce_tpm.clone(),
                policy_digest: vec![0u8; 32],
            },
        );
        Ok(StartedSession { handle, nonce_tpm })
    }

    fn flush_context(&mut self, handle: TpmHandle) -> commands::Result<()> {
        let mut tpm = self.state.lock().unwrap();
        let flushed =
            tpm.transient.remove(&handle).is_some() || tpm.sessions.remove(&handle).is_some();
        match flushed {
            true => {
                tpm.flushed.push(handle);
                Ok(())
            }
            false => Err(command_error("TPM2_FlushContext", rc::HANDLE)),
        }
    }

    fn read_public(&mut self, object: TpmHandle) -> commands::Result<PublicArea> {
        const COMMAND: &str = "TPM2_ReadPublic";
        let tpm = self.state.lock().unwrap();
        tpm.begin(COMMAND)?;
        let object = tpm.object(COMMAND, object)?;
        Ok(PublicArea {
            public_area: object.public_area.clone(),
            name: object.name(),
        })
    }

    fn create_primary(
        &mut self,
        hierarchy: TpmHandle,
        template: &[u8],
        auth: &mut dyn AuthorizationDelegate,
    ) -> commands::Result<CreatedPrimary> {
        const COMMAND: &str = "TPM2_CreatePrimary";
        if hierarchy != TPM_RH_ENDORSEMENT && hierarchy != TPM_RH_OWNER {
            return Err(command_error(COMMAND, rc::HANDLE));
        }
        let template = FakeTpm2State::parse_template(COMMAND, template)?;
        let mut tpm = self.state.lock().unwrap();
        let (public_area, object) = tpm.run_authorized(
            COMMAND,
            cc::CREATE_PRIMARY,
            &[hierarchy],
            None,
            false,
            auth,
            |tpm, _| {
                tpm.create_primary_calls += 1;
                // Primary keys derive from the hierarchy seed, so they repeat.
                let sensitive = match template.parameters {
                    PublicParameters::Rsa { .. } => {
                        Sensitive::Rsa(rsa_private_key(TestKey::Endorsement))
                    }
                    PublicParameters::Ecc { .. } => Sensitive::Ecc(
                        p256::SecretKey::from_slice(&sha256(b"endorsement primary seed"))
                            .expect("P-256 scalar"),
                    ),
                    PublicParameters::KeyedHash => {
                        return Err(command_error(COMMAND, rc::VALUE))
                    }
                };
                let object = Object::new(template, sensitive);
                Ok((object.public_area.clone(), object))
            },
        )?;
        let handle = tpm.allocate(TRANSIENT_FIRST);
        tpm.transient.insert(handle, object);
        Ok(CreatedPrimary {
            handle,
            public_area,
        })
    }

    fn create(
        &mut self,
        parent: TpmHandle,
        sensitive_data: &[u8],
        template: &[u8],
        auth: &mut dyn AuthorizationDelegate,
    ) -> commands::Result<CreatedObject> {
        const COMMAND: &str = "TPM2_Create";
        let template = FakeTpm2State::parse_template(COMMAND, template)?;
        let mut tpm = self.state.lock().unwrap();
        let (private_area, public_area) = tpm.run_authorized(
            COMMAND,
            cc::CREATE,
            &[parent],
            Some(sensitive_data),
            true,
            auth,
            |tpm, sensitive_data| {
                let sensitive = match template.parameters {
                    PublicParameters::KeyedHash => Sensitive::Data(sensitive_data),
                    PublicParameters::Rsa { .. } => Sensitive::Rsa(tpm.key_pool.next()),
                    PublicParameters::Ecc { .. } => {
                        Sensitive::Ecc(p256::SecretKey::random(&mut OsRng))
                    }
                };
                let object = Object::new(template, sensitive);
                tpm.private_store.push(StoredPrivate {
                    parent,
                    public_area: object.public_area.clone(),
                    sensitive: object.sensitive,
                });
                let private_area = ((tpm.private_store.len() - 1) as u32).to_be_bytes().to_vec();
                Ok((private_area, object.public_area))
            },
        )?;
        Ok(CreatedObject {
            private_area,
            public_area,
        })
    }

    fn load(
        &mut self,
        parent: TpmHandle,
        private_area: &[u8],
        public_area: &[u8],
        auth: &mut dyn AuthorizationDelegate,
    ) -> commands::Result<LoadedObject> {
        const COMMAND: &str = "TPM2_Load";
        let mut tpm = self.state.lock().unwrap();
        let (name, object) = tpm.run_authorized(
            COMMAND,
            cc::LOAD,
            &[parent],
            Some(private_area),
            true,
            auth,
            |tpm, private_area| {
                let integrity = || command_error(COMMAND, rc::INTEGRITY);
                let id = <[u8; 4]>::try_from(private_area.as_slice())
                    .map(u32::from_be_bytes)
                    .map_err(|_| integrity())?;
                let stored = tpm.private_store.get(id as usize).ok_or_else(integrity)?;
                if stored.parent != parent || stored.public_area != public_area {
                    return Err(integrity());
                }
                let object = Object {
                    public: FakeTpm2State::parse_template(COMMAND, public_area)?,
                    public_area: public_area.to_vec(),
                    sensitive: stored.sensitive.clone(),
                };
                Ok((object.name(), object))
            },
        )?;
        let handle = tpm.allocate(TRANSIENT_FIRST);
        tpm.transient.insert(handle, object);
        Ok(LoadedObject { handle, name })
    }

    fn evict_control(
        &mut self,
        auth_handle: TpmHandle,
        object: TpmHandle,
        persistent_handle: TpmHandle,
        auth: &mut dyn AuthorizationDelegate,
    ) -> commands::Result<()> {
        const COMMAND: &str = "TPM2_EvictControl";
        if auth_handle != TPM_RH_OWNER {
            return Err(command_error(COMMAND, rc::HANDLE));
        }
        let mut tpm = self.state.lock().unwrap();
        tpm.run_authorized(
            COMMAND,
            cc::EVICT_CONTROL,
            &[auth_handle],
            None,
            false,
            auth,
            |tpm, _| {
                let copy = tpm
                    .transient
                    .get(&object)
                    .cloned()
                    .ok_or_else(|| command_error(COMMAND, rc::HANDLE))?;
                if tpm.persistent.contains_key(&persistent_handle) {
                    return Err(command_error(COMMAND, rc::VALUE));
                }
                tpm.persistent.insert(persistent_handle, copy);
                Ok((Vec::new(), ()))
            },
        )?;
        Ok(())
    }

    fn policy_pcr(
        &mut self,
        policy_session: TpmHandle,
        pcr_digest: &[u8],
        pcrs: &PcrSelection,
    ) -> commands::Result<()> {
        const COMMAND: &str = "TPM2_PolicyPCR";
        let mut tpm = self.state.lock().unwrap();
        tpm.begin(COMMAND)?;
        let current = sha256(&tpm.read_pcrs(pcrs));
        let session = tpm
            .sessions
            .get_mut(&policy_session)
            .ok_or_else(|| command_error(COMMAND, rc::HANDLE))?;
        let digest = match (pcr_digest.is_empty(), session.session_type) {
            (true, _) => current,
            (false, SessionType::Trial) => pcr_digest.to_vec(),
            (false, _) if pcr_digest == current.as_slice() => current,
            (false, _) => return Err(command_error(COMMAND, rc::VALUE)),
        };
        session.policy_digest = policy_pcr_digest(&session.policy_digest, pcrs, &digest)
            .map_err(|_| command_error(COMMAND, rc::VALUE))?;
        Ok(())
    }

    fn policy_secret(
        &mut self,
        auth_handle: TpmHandle,
        policy_session: TpmHandle,
        auth: &mut dyn AuthorizationDelegate,
    ) -> commands::Result<()> {
        const COMMAND: &str = "TPM2_PolicySecret";
        let mut tpm = self.state.lock().unwrap();
        if !tpm.sessions.contains_key(&policy_session) {
            return Err(command_error(COMMAND, rc::HANDLE));
        }
        tpm.run_authorized(
            COMMAND,
            cc::POLICY_SECRET,
            &[auth_handle],
            None,
            false,
            auth,
            |tpm, _| {
                let name = tpm.entity(COMMAND, auth_handle)?.name;
                let session = tpm
                    .sessions
                    .get_mut(&policy_session)
                    .ok_or_else(|| command_error(COMMAND, rc::HANDLE))?;
                session.policy_digest = policy_secret_digest(&session.policy_digest, &name);
                Ok((Vec::new(), ()))
            },
        )?;
        Ok(())
    }

    fn policy_get_digest(&mut self, policy_session: TpmHandle) -> commands::Result<Vec<u8>> {
        const COMMAND: &str = "TPM2_PolicyGetDigest";
        let tpm = self.state.lock().unwrap();
        tpm.begin(COMMAND)?;
        tpm.sessions
            .get(&policy_session)
            .map(|session| session.policy_digest.clone())
            .ok_or_else(|| command_error(COMMAND, rc::HANDLE))
    }

    fn unseal(
        &mut self,
        item: TpmHandle,
        auth: &mut dyn AuthorizationDelegate,
    ) -> commands::Result<Vec<u8>> {
        const COMMAND: &str = "TPM2_Unseal";
        let mut tpm = self.state.lock().unwrap();
        let (data, ()) =
            tpm.run_authorized(COMMAND, cc::UNSEAL, &[item], None, true, auth, |tpm, _| {
                match &tpm.object(COMMAND, item)?.sensitive {
                    Sensitive::Data(data) => Ok((data.clone(), ())),
                    _ => Err(command_error(COMMAND, rc::ATTRIBUTES)),
                }
            })?;
        Ok(data)
    }

    fn activate_credential(
        &mut self,
        activate_handle: TpmHandle,
        key_handle: TpmHandle,
        credential_blob: &[u8],
        secret: &[u8],
        auth: &mut dyn AuthorizationDelegate,
    ) -> commands::Result<Vec<u8>> {
        const COMMAND: &str = "TPM2_ActivateCredential";
        let mut tpm = self.state.lock().unwrap();
        let (credential, ()) = tpm.run_authorized(
            COMMAND,
            cc::ACTIVATE_CREDENTIAL,
            &[activate_handle, key_handle],
            Some(credential_blob),
            true,
            auth,
            |tpm, credential_blob| {
                let name = tpm.object(COMMAND, activate_handle)?.name();
                let key = tpm.object(COMMAND, key_handle)?.rsa(COMMAND)?;
                let credential = recover_credential(key, &name, &credential_blob, secret)
                    .map_err(|_| command_error(COMMAND, rc::INTEGRITY))?;
                Ok((credential, ()))
            },
        )?;
        Ok(credential)
    }

    fn quote(
        &mut self,
        sign_handle: TpmHandle,
        qualifying_data: &[u8],
        scheme: SignatureScheme,
        pcrs: &PcrSelection,
        auth: &mut dyn AuthorizationDelegate,
    ) -> commands::Result<AttestWithSignature> {
        const COMMAND: &str = "TPM2_Quote";
        let mut tpm = self.state.lock().unwrap();
        let (attest, signature) = tpm.run_authorized(
            COMMAND,
            cc::QUOTE,
            &[sign_handle],
            Some(qualifying_data),
            true,
            auth,
            |tpm, qualifying_data| {
                let pcr_digest = sha256(&tpm.read_pcrs(pcrs));
                let attested = Attested::Quote {
                    pcr_select: pcrs.clone(),
                    pcr_digest,
                };
                let attest = tpm.attest(COMMAND, sign_handle, qualifying_data, attested)?;
                let signature = tpm.sign_digest(COMMAND, sign_handle, scheme, &sha256(&attest))?;
                Ok((attest, signature))
            },
        )?;
        Ok(AttestWithSignature { attest, signature })
    }

    fn certify(
        &mut self,
        object: TpmHandle,
        sign_handle: TpmHandle,
        qualifying_data: &[u8],
        scheme: SignatureScheme,
        auth: &mut dyn AuthorizationDelegate,
    ) -> commands::Result<AttestWithSignature> {
        const COMMAND: &str = "TPM2_Certify";
        let mut tpm = self.state.lock().unwrap();
        let (attest, signature) = tpm.run_authorized(
            COMMAND,
            cc::CERTIFY,
            &[object, sign_handle],
            Some(qualifying_data),
            true,
            auth,
            |tpm, qualifying_data| {
                let name = tpm.object(COMMAND, object)?.name();
                let attested = Attested::Certify {
                    qualified_name: name.clone(),
                    name,
                };
                let attest = tpm.attest(COMMAND, sign_handle, qualifying_data, attested)?;
                let signature = tpm.sign_digest(COMMAND, sign_handle, scheme, &sha256(&attest))?;
                Ok((attest, signature))
            },
        )?;
        Ok(AttestWithSignature { attest, signature })
    }

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
    ) -> commands::Result<AttestWithSignature> {
        const COMMAND: &str = "TPM2_NV_Certify";
        let mut tpm = self.state.lock().unwrap();
        let (attest, signature) = tpm.run_authorized(
            COMMAND,
            cc::NV_CERTIFY,
            &[sign_handle, auth_handle],
            Some(qualifying_data),
            true,
            auth,
            |tpm, qualifying_data| {
                let space = tpm
                    .nv_spaces
                    .get(&nv_index)
                    .ok_or_else(|| command_error(COMMAND, rc::HANDLE))?;
                let range = offset as usize..offset as usize + size as usize;
                let nv_contents = space
                    .data
                    .get(range)
                    .ok_or_else(|| command_error(COMMAND, rc::VALUE))?
                    .to_vec();
                let attested = Attested::Nv {
                    index_name: space.public.name().expect("NV name"),
                    offset,
                    nv_contents,
                };
                let attest = tpm.attest(COMMAND, sign_handle, qualifying_data, attested)?;
                let signature = tpm.sign_digest(COMMAND, sign_handle, scheme, &sha256(&attest))?;
                Ok((attest, signature))
            },
        )?;
        Ok(AttestWithSignature { attest, signature })
    }

    fn nv_read_public(&mut self, nv_index: u32) -> commands::Result<NvPublic> {
        const COMMAND: &str = "TPM2_NV_ReadPublic";
        let tpm = self.state.lock().unwrap();
        tpm.begin(COMMAND)?;
        tpm.nv_spaces
            .get(&nv_index)
            .map(|space| space.public.clone())
            .ok_or_else(|| command_error(COMMAND, rc::HANDLE))
    }

    fn pcr_read(&mut self, pcrs: &PcrSelection) -> commands::Result<Vec<u8>> {
        let tpm = self.state.lock().unwrap();
        tpm.begin("TPM2_PCR_Read")?;
        Ok(tpm.read_pcrs(pcrs))
    }

    fn sign(
        &mut self,
        key: TpmHandle,
        digest: &[u8],
        scheme: SignatureScheme,
        auth: &mut dyn AuthorizationDelegate,
    ) -> commands::Result<Vec<u8>> {
        const COMMAND: &str = "TPM2_Sign";
        let mut tpm = self.state.lock().unwrap();
        let (_, signature) = tpm.run_authorized(
            COMMAND,
            cc::SIGN,
            &[key],
            Some(digest),
            false,
            auth,
            |tpm, digest| Ok((Vec::new(), tpm.sign_digest(COMMAND, key, scheme, &digest)?)),
        )?;
        Ok(signature)
    }

    fn rsa_decrypt(
        &mut self,
        key: TpmHandle,
        ciphertext: &[u8],
        auth: &mut dyn AuthorizationDelegate,
    ) -> commands::Result<Vec<u8>> {
        const COMMAND: &str = "TPM2_RSA_Decrypt";
        let mut tpm = self.state.lock().unwrap();
        let (message, ()) = tpm.run_authorized(
            COMMAND,
            cc::RSA_DECRYPT,
            &[key],
            Some(ciphertext),
            true,
            auth,
            |tpm, ciphertext| {
                let object = tpm.object(COMMAND, key)?;
                if !object.public.has_attribute(attributes::DECRYPT)
                    || object.public.has_attribute(attributes::RESTRICTED)
                {
                    return Err(command_error(COMMAND, rc::ATTRIBUTES));
                }
                let message = object
                    .rsa(COMMAND)?
                    .decrypt(Oaep::new::<Sha256>(), &ciphertext)
                    .map_err(|_| command_error(COMMAND, rc::VALUE))?;
                Ok((message, ()))
            },
        )?;
        Ok(message)
    }

    fn rsu_device_id(&mut self) -> commands::Result<Vec<u8>> {
        const COMMAND: &str = "TPM2_GetCapability";
        let tpm = self.state.lock().unwrap();
        tpm.begin(COMMAND)?;
        tpm.rsu_device_id
            .clone()
            .ok_or_else(|| command_error(COMMAND, rc::VALUE))
    }
}
