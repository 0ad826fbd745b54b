use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cfb_mode::cipher::AsyncStreamCipher;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use super::{CryptoError, Result};

pub const AES_KEY_SIZE: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;

/// Largest buffer the cipher layer accepts; lengths travel as signed 32-bit values.
const MAX_CIPHER_INPUT: usize = i32::MAX as usize - AES_BLOCK_SIZE;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes128CfbEnc = cfb_mode::Encryptor<aes::Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<aes::Aes128>;

/// Returns `num_bytes` bytes from the operating system's CSPRNG.
pub fn get_random(num_bytes: usize) -> Result<Vec<u8>> {
    if num_bytes > i32::MAX as usize {
        return Err(CryptoError::InputTooLarge(num_bytes));
    }
    let mut buffer = vec![0u8; num_bytes];
    OsRng.try_fill_bytes(&mut buffer).map_err(|e| {
        log::error!("Failed to gather randomness: {}", e);
        CryptoError::Random(e.to_string())
    })?;
    Ok(buffer)
}

fn check_key_and_iv(key: &[u8], iv: &[u8], input_len: usize) -> Result<()> {
    if key.len() != AES_KEY_SIZE {
        return Err(CryptoError::InvalidKeySize(key.len()));
    }
    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::InvalidIvSize(iv.len()));
    }
    if input_len > MAX_CIPHER_INPUT {
        return Err(CryptoError::InputTooLarge(input_len));
    }
    Ok(())
}

/// AES-256-CBC with PKCS#5 padding.
pub fn aes_encrypt(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    check_key_and_iv(key, iv, data.len())?;
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
}

pub fn aes_decrypt(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    check_key_and_iv(key, iv, data.len())?;
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    cipher.decrypt_padded_vec_mut::<Pkcs7>(data).map_err(|e| {
        log::error!("AES decryption failed: {}", e);
        CryptoError::Cipher(e.to_string())
    })
}

/// TSS-compatible symmetric encryption: a fresh IV followed by the AES-256-CBC ciphertext.
pub fn tss_compatible_encrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let iv = get_random(AES_BLOCK_SIZE)?;
    let mut output = aes_encrypt(data, key, &iv)?;
    output.splice(0..0, iv);
    Ok(output)
}

pub fn tss_compatible_decrypt(input: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if input.len() < AES_BLOCK_SIZE {
        return Err(CryptoError::MalformedEnvelope("ciphertext shorter than an IV"));
    }
    let (iv, ciphertext) = input.split_at(AES_BLOCK_SIZE);
    aes_decrypt(ciphertext, key, iv)
}

/// AES-128-CFB as used for TPM 2.0 credential and parameter encryption.
pub fn aes128_cfb_encrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    let cipher =
        Aes128CfbEnc::new_from_slices(key, iv).map_err(|e| CryptoError::Cipher(e.to_string()))?;
    cipher.encrypt(data);
    Ok(())
}

pub fn aes128_cfb_decrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    let cipher =
        Aes128CfbDec::new_from_slices(key, iv).map_err(|e| CryptoError::Cipher(e.to_string()))?;
    cipher.decrypt(data);
    Ok(())
}

pub fn hmac_sha512(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn hmac_sha256(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn sha1(data: &[u8]) -> Vec<u8> {
    Sha1::digest(data).to_vec()
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Compares two MACs in constant time with respect to their contents.
pub fn verify_mac(expected: &[u8], actual: &[u8]) -> Result<()> {
    if expected.len() != actual.len() || !bool::from(expected.ct_eq(actual)) {
        return Err(CryptoError::MacMismatch);
    }
    Ok(())
}

/// The counter-mode KDF from TPM 2.0 Part 1 §11.4.10.2 with HMAC-SHA256.
///
/// Each block is `HMAC(key, counter || label || 0x00 || context || bits)`. When
/// `bits` is not a multiple of eight the unused high bits of the first octet are
/// cleared, so the output is exactly `bits` bits long.
pub fn tpm2_compatible_kdfa(key: &[u8], label: &str, context: &[u8], bits: u32) -> Result<Vec<u8>> {
    if bits == 0 {
        return Err(CryptoError::InvalidLength("KDFa output", 0));
    }
    let num_bytes = ((bits as usize) + 7) / 8;
    let mut output = Vec::with_capacity(num_bytes + 32);
    let mut counter: u32 = 1;
    while output.len() < num_bytes {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;
        mac.update(&counter.to_be_bytes());
        mac.update(label.as_bytes());
        mac.update(&[0x00]);
        mac.update(context);
        mac.update(&bits.to_be_bytes());
        output.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    output.truncate(num_bytes);
    if bits % 8 != 0 {
        output[0] &= (1u8 << (bits % 8)) - 1;
    }
    Ok(output)
}
