//! # Get Started
//!
//! Build a backend from the configuration and the connections it needs,
//! then initialize it:
//!
//! ```no_run
//! # fn connections() -> tpm_attestation::tpm::Collaborators { unimplemented!() }
//! use tpm_attestation::config::Config;
//! use tpm_attestation::crypto::CryptoUtility;
//! use tpm_attestation::tpm::{AnyTpmUtility, TpmUtility};
//!
//! # fn main() -> eyre::Result<()> {
//! let config = Config::from_path("/etc/tpm-attestation.yaml")?;
//! let mut tpm = AnyTpmUtility::from_config(&config, connections())?;
//! tpm.initialize()?;
//!
//! let mut crypto = CryptoUtility::new(&mut tpm);
//! let (aes_key, sealed_key) = crypto.create_sealed_key()?;
//! let envelope = crypto.encrypt_data(b"secret", &aes_key, &sealed_key)?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod crypto;
pub mod marshal;
pub mod proto;
pub mod tpm;

#[cfg(test)]
mod testing;
