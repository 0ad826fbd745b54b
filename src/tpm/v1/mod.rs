//! TPM 1.2 backend.

pub mod tss;

use crate::crypto::asymmetric::{
    digest_info_sha256, encode_rsa_public_key, encode_rsa_public_key_info,
};
use crate::crypto::credential::{decrypt_sym_ca_attestation, Tpm12SymmetricKey};
use crate::crypto::primitives::{get_random, sha1};
use crate::marshal::Unmarshal;
use crate::proto::TpmVersion;

use self::tss::{
    parse_stored_certificate, pcr_composite_digest, Authorization, QuoteInfo2, Tpm12PublicKey,
    TssConnector, TssContext, TPM_NONCE_SIZE,
};
use super::common::{TpmManagerFactory, TpmUtilityCommon};
use super::pcr::{check_single_selection, pcr_select};
use super::{
    CertifiedKey, IdentityKey, KeyType, KeyUsage, NvCertification, PcrQuote, Result, TpmError,
    TpmUtility,
};

pub struct TpmUtilityV1 {
    common: TpmUtilityCommon,
    connector: Box<dyn TssConnector>,
    endorsement_certificate_index: u32,
}

impl TpmUtilityV1 {
    pub fn new(
        common: TpmUtilityCommon,
        connector: Box<dyn TssConnector>,
        endorsement_certificate_index: u32,
    ) -> Self {
        Self {
            common,
            connector,
            endorsement_certificate_index,
        }
    }

    pub fn with_manager(
        owner_dependency: &str,
        manager: TpmManagerFactory,
        connector: Box<dyn TssConnector>,
        endorsement_certificate_index: u32,
    ) -> Self {
        Self::new(
            TpmUtilityCommon::new(owner_dependency, manager),
            connector,
            endorsement_certificate_index,
        )
    }

    fn connect(&mut self, authorization: Authorization) -> Result<Box<dyn TssContext>> {
        if !self.common.is_initialized() {
            return Err(TpmError::NotInitialized);
        }
        log::debug!("Connecting to the TPM as {}", authorization.describe());
        Ok(self.connector.connect(&authorization)?)
    }

    fn connect_as_user(&mut self) -> Result<Box<dyn TssContext>> {
        self.connect(Authorization::User)
    }

    /// Owner authorization when the owner password is still held, otherwise
    /// the owner delegate.
    fn connect_privileged(&mut self) -> Result<Box<dyn TssContext>> {
        let authorization = match self.common.owner_password() {
            Ok(password) => Authorization::Owner(password),
            Err(TpmError::Unavailable(_)) => {
                let delegate = self.common.delegate()?;
                Authorization::Delegate {
                    blob: delegate.blob,
                    secret: delegate.secret,
                }
            }
            Err(e) => return Err(e),
        };
        self.connect(authorization)
    }

    fn require_rsa(key_type: KeyType, operation: &'static str) -> Result<()> {
        match key_type {
            KeyType::Rsa => Ok(()),
            KeyType::Ecc => Err(TpmError::UnsupportedKeyType(key_type, operation)),
        }
    }

    fn endorsement_public_key(&mut self) -> Result<Tpm12PublicKey> {
        let mut context = self.connect_privileged()?;
        let public_key = context.get_endorsement_public_key()?;
        Ok(Tpm12PublicKey::from_bytes(&public_key)?)
    }

    fn random_nonce() -> Result<[u8; TPM_NONCE_SIZE]> {
        let mut nonce = [0u8; TPM_NONCE_SIZE];
        nonce.copy_from_slice(&get_random(TPM_NONCE_SIZE)?);
        Ok(nonce)
    }

    fn check_quote(quoted_pcr_value: &[u8], quoted_data: &[u8], pcr_index: u32) -> Result<()> {
        let info = QuoteInfo2::from_bytes(quoted_data)?;
        check_single_selection(&info.pcr_select, pcr_index)?;
        if pcr_composite_digest(&info.pcr_select, quoted_pcr_value)? != info.digest_at_release {
            return Err(TpmError::Malformed("quoted PCR digest"));
        }
        Ok(())
    }
}

impl TpmUtility for TpmUtilityV1 {
    fn initialize(&mut self) -> Result<()> {
        self.common.initialize()?;
        // Fail early when the TSS daemon cannot be reached.
        self.connect_as_user().map_err(|e| {
            log::error!("Failed to connect to the TPM: {}", e);
            e
        })?;
        Ok(())
    }

    fn version(&self) -> TpmVersion {
        TpmVersion::Tpm12
    }

    fn is_tpm_ready(&mut self) -> bool {
        self.common.is_tpm_ready()
    }

    fn activate_identity(
        &mut self,
        identity_key_blob: &[u8],
        asym_ca_contents: &[u8],
        sym_ca_attestation: &[u8],
    ) -> Result<Vec<u8>> {
        let mut context = self.connect_privileged()?;
        let identity_key = context.load_key(identity_key_blob)?;
        let session_key = context.activate_identity(identity_key, asym_ca_contents)?;
        let session_key = Tpm12SymmetricKey::from_bytes(&session_key)?;
        Ok(decrypt_sym_ca_attestation(&session_key, sym_ca_attestation)?)
    }

    fn activate_identity_for_tpm2(
        &mut self,
        _key_type: KeyType,
        _identity_key_blob: &[u8],
        _encrypted_seed: &[u8],
        _credential_mac: &[u8],
        _wrapped_credential: &[u8],
    ) -> Result<Vec<u8>> {
        Err(TpmError::Unsupported("ActivateIdentityForTpm2", TpmVersion::Tpm12))
    }

    fn create_certified_key(
        &mut self,
        key_type: KeyType,
        key_usage: KeyUsage,
        identity_key_blob: &[u8],
        external_data: &[u8],
    ) -> Result<CertifiedKey> {
        Self::require_rsa(key_type, "CreateCertifiedKey")?;
        let mut context = self.connect_as_user()?;
        let key_blob = context.create_key(key_usage)?;
        let key = context.load_key(&key_blob)?;
        let public_key_tpm_format = context.get_public_key(key)?;
        let public_key = Tpm12PublicKey::from_bytes(&public_key_tpm_format)?.to_rsa()?;

        let identity_key = context.load_key(identity_key_blob)?;
        let mut anti_replay = [0u8; TPM_NONCE_SIZE];
        anti_replay.copy_from_slice(&sha1(external_data));
        let (key_info, proof) = context.certify_key(key, identity_key, &anti_replay)?;
        Ok(CertifiedKey {
            key_blob,
            public_key_der: encode_rsa_public_key(&public_key)?,
            public_key_tpm_format,
            key_info,
            proof,
        })
    }

    fn seal_to_pcr0(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut context = self.connect_as_user()?;
        let pcr0 = context.read_pcr(0)?;
        Ok(context.seal(data, &[(0, pcr0)])?)
    }

    fn unseal(&mut self, sealed_data: &[u8]) -> Result<Vec<u8>> {
        let mut context = self.connect_as_user()?;
        Ok(context.unseal(sealed_data)?)
    }

    fn get_endorsement_public_key(&mut self, key_type: KeyType) -> Result<Vec<u8>> {
        Self::require_rsa(key_type, "GetEndorsementPublicKey")?;
        let public_key = self.endorsement_public_key()?.to_rsa()?;
        Ok(encode_rsa_public_key_info(&public_key)?)
    }

    fn get_endorsement_certificate(&mut self, key_type: KeyType) -> Result<Vec<u8>> {
        Self::require_rsa(key_type, "GetEndorsementCertificate")?;
        let nv_data = self
            .common
            .read_space(self.endorsement_certificate_index, true)?;
        Ok(parse_stored_certificate(&nv_data)?)
    }

    fn unbind(&mut self, key_blob: &[u8], bound_data: &[u8]) -> Result<Vec<u8>> {
        let mut context = self.connect_as_user()?;
        let key = context.load_key(key_blob)?;
        Ok(context.unbind(key, bound_data)?)
    }

    fn sign(&mut self, key_blob: &[u8], data_to_sign: &[u8]) -> Result<Vec<u8>> {
        let mut context = self.connect_as_user()?;
        let key = context.load_key(key_blob)?;
        Ok(context.sign(key, &digest_info_sha256(data_to_sign))?)
    }

    fn quote_pcr(&mut self, pcr_index: u32, key_blob: &[u8]) -> Result<PcrQuote> {
        let select = pcr_select(pcr_index)?;
        let anti_replay = Self::random_nonce()?;
        let mut context = self.connect_as_user()?;
        let identity_key = context.load_key(key_blob)?;
        let quoted_pcr_value = context.read_pcr(pcr_index)?;
        let (quoted_data, quote) = context.quote2(identity_key, &select, &anti_replay)?;
        Ok(PcrQuote {
            quoted_pcr_value,
            quoted_data,
            quote,
        })
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
                log::error!("Quote is not for PCR {}: {}", pcr_index, e);
                false
            }
        }
    }

    fn read_pcr(&mut self, pcr_index: u32) -> Result<Vec<u8>> {
        let mut context = self.connect_as_user()?;
        Ok(context.read_pcr(pcr_index)?)
    }

    fn get_nv_data_size(&mut self, nv_index: u32) -> Result<u16> {
        let mut context = self.connect_as_user()?;
        let size = context.nv_data_size(nv_index)?;
        u16::try_from(size).map_err(|_| TpmError::Malformed("NV data size"))
    }

    fn certify_nv(
        &mut self,
        _nv_index: u32,
        _nv_size: u16,
        _key_blob: &[u8],
    ) -> Result<NvCertification> {
        Err(TpmError::Unsupported("CertifyNV", TpmVersion::Tpm12))
    }

    fn remove_owner_dependency(&mut self) -> Result<()> {
        self.common.remove_owner_dependency()
    }

    fn get_endorsement_public_key_modulus(&mut self, key_type: KeyType) -> Result<Vec<u8>> {
        Self::require_rsa(key_type, "GetEndorsementPublicKeyModulus")?;
        Ok(self.endorsement_public_key()?.modulus)
    }

    fn create_identity(&mut self, key_type: KeyType) -> Result<IdentityKey> {
        Self::require_rsa(key_type, "CreateIdentity")?;
        let mut context = self.connect_privileged()?;
        let identity = context.make_identity()?;
        let key = context.load_key(&identity.identity_key_blob)?;
        let public_key_tpm_format = context.get_public_key(key)?;
        let public_key = Tpm12PublicKey::from_bytes(&public_key_tpm_format)?.to_rsa()?;
        Ok(IdentityKey {
            identity_key_blob: identity.identity_key_blob,
            identity_public_key_der: encode_rsa_public_key(&public_key)?,
            identity_public_key_tpm_format: public_key_tpm_format,
            identity_binding: Some(identity.identity_binding),
        })
    }

    fn get_rsu_device_id(&mut self) -> Result<Vec<u8>> {
        Err(TpmError::Unsupported("GetRsuDeviceId", TpmVersion::Tpm12))
    }
}
