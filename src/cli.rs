use crate::config::Config;
use crate::crypto::asymmetric::{encode_rsa_public_key_info, get_rsa_public_key_from_modulus};
use crate::crypto::{encrypt_data_for_google, tpm2_compatible_kdfa};
use crate::tpm::common::{TpmManagerFactory, TpmUtilityCommon};
use clap::{Parser, Subcommand};
use eyre::{eyre, Result};
use std::env;
use std::io::{self, Read, Write};
use std::path::PathBuf;

const TPM_ENV_VAR: &str = "TCTI";

// Spelled out so clap takes one value per argument instead of a `Vec` of them.
type HexBytes = std::vec::Vec<u8>;

fn parse_hex(value: &str) -> Result<HexBytes, hex::FromHexError> {
    hex::decode(value.trim())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, value_name = "FILE", env = "TPM_ATTESTATION_CONFIG")]
    config: Option<PathBuf>,

    /// TPM device specified in TCTI format, overrides the configured one
    #[arg(short = 'T', long, env = TPM_ENV_VAR)]
    tcti: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show whether the TPM is enabled and owned
    Status,
    /// Drop this service's claim on the TPM owner password
    RemoveOwnerDependency,
    /// Derive key material with the TPM 2.0 KDFa (HMAC-SHA256)
    Kdfa {
        /// Key, hex encoded
        #[arg(value_parser = parse_hex)]
        key: HexBytes,
        label: String,
        /// Context, hex encoded
        #[arg(value_parser = parse_hex)]
        context: HexBytes,
        #[arg(short, long, default_value_t = 256)]
        bits: u32,
    },
    /// Print the SubjectPublicKeyInfo of an RSA key given its modulus
    Spki {
        /// Modulus, hex encoded; the exponent is 65537
        modulus: String,
    },
    /// Encrypt stdin for a recipient known by its RSA modulus
    EncryptForGoogle {
        /// Recipient modulus, hex encoded
        #[arg(long)]
        modulus: String,
        /// Identifier of the recipient key
        #[arg(long)]
        key_id: String,
    },
}

impl Cli {
    pub fn new() -> Self {
        let cli = Cli::parse();
        if let Some(tcti) = &cli.tcti {
            env::set_var(TPM_ENV_VAR, tcti);
        }
        cli
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self);
        match &self.command {
            Commands::Status => self.show_status()?,
            Commands::RemoveOwnerDependency => self.remove_owner_dependency()?,
            Commands::Kdfa {
                key,
                label,
                context,
                bits,
            } => println!("{}", hex::encode(tpm2_compatible_kdfa(key, label, context, *bits)?)),
            Commands::Spki { modulus } => {
                let key = get_rsa_public_key_from_modulus(modulus)?;
                println!("{}", hex::encode(encode_rsa_public_key_info(&key)?));
            }
            Commands::EncryptForGoogle { modulus, key_id } => {
                let mut data = Vec::new();
                io::stdin().read_to_end(&mut data)?;
                let encrypted = encrypt_data_for_google(&data, modulus, key_id)?;
                io::stdout().write_all(&encrypted.to_bytes())?;
            }
        };
        Ok(self)
    }

    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_path(path)?,
            None => Config::default(),
        };
        if let Some(tcti) = &self.tcti {
            config.tcti = tcti.clone();
        }
        Ok(config)
    }

    fn tpm_common(&self) -> Result<TpmUtilityCommon> {
        let config = self.config()?;
        let mut common = TpmUtilityCommon::new(&config.owner_dependency, tpm_manager(&config)?);
        common.initialize()?;
        Ok(common)
    }

    fn show_status(&self) -> Result<()> {
        let mut common = self.tpm_common()?;
        common.cache_tpm_state()?;
        println!("TPM ready: {}", common.is_tpm_ready());
        Ok(())
    }

    fn remove_owner_dependency(&self) -> Result<()> {
        self.tpm_common()?.remove_owner_dependency()?;
        println!("Owner dependency removed");
        Ok(())
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "tss-esapi")]
fn tpm_manager(config: &Config) -> Result<TpmManagerFactory> {
    let local_data_path = config
        .local_data_path
        .clone()
        .ok_or_else(|| eyre!("local_data_path is not configured"))?;
    Ok(crate::tpm::esapi::EsapiTpmManager::factory(
        config.tcti.clone(),
        local_data_path,
    ))
}

#[cfg(not(feature = "tss-esapi"))]
fn tpm_manager(config: &Config) -> Result<TpmManagerFactory> {
    Err(eyre!(
        "no TPM state service for {}: built without the `tss-esapi` feature",
        config.tcti
    ))
}
