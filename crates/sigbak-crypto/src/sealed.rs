//! Encrypt-then-MAC CBC blobs
//!
//! ```text
//! [ iv (16) ][ AES-CBC(PKCS#7) ciphertext ][ HMAC(iv ‖ ciphertext) ]
//! ```
//!
//! Desktop attachments use the AES-256 / HMAC-SHA256 flavour with a 64-byte
//! base64 key (`aes key ‖ mac key`).

use aes::{Aes128, Aes256};
use base64::Engine;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use sigbak_core::{SigbakError, SigbakResult};
use zeroize::Zeroizing;

use crate::{IV_SIZE, KEY_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealedScheme {
    /// AES-128-CBC, 20-byte HMAC-SHA1
    Sha1Aes128,
    /// AES-256-CBC, 32-byte HMAC-SHA256
    Sha256Aes256,
}

impl SealedScheme {
    pub fn key_size(self) -> usize {
        match self {
            SealedScheme::Sha1Aes128 => 16,
            SealedScheme::Sha256Aes256 => 32,
        }
    }

    pub fn mac_size(self) -> usize {
        match self {
            SealedScheme::Sha1Aes128 => 20,
            SealedScheme::Sha256Aes256 => 32,
        }
    }
}

/// Verify the trailing MAC, then CBC-decrypt with the leading IV.
pub fn open(
    scheme: SealedScheme,
    cipher_key: &[u8],
    mac_key: &[u8],
    blob: &[u8],
) -> SigbakResult<Vec<u8>> {
    let mac_size = scheme.mac_size();
    if blob.len() < IV_SIZE + mac_size {
        return Err(SigbakError::ParseFailure(format!(
            "sealed blob of {} bytes is too short",
            blob.len()
        )));
    }
    let (authenticated, tag) = blob.split_at(blob.len() - mac_size);
    if !verify_mac(scheme, mac_key, authenticated, tag)? {
        return Err(SigbakError::AuthenticationFailure(
            "sealed blob MAC mismatch".into(),
        ));
    }

    let (iv, ciphertext) = authenticated.split_at(IV_SIZE);
    let plaintext = match scheme {
        SealedScheme::Sha1Aes128 => cbc::Decryptor::<Aes128>::new_from_slices(cipher_key, iv)
            .map_err(|e| SigbakError::DecryptionFailure(format!("AES-128-CBC init: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        SealedScheme::Sha256Aes256 => cbc::Decryptor::<Aes256>::new_from_slices(cipher_key, iv)
            .map_err(|e| SigbakError::DecryptionFailure(format!("AES-256-CBC init: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
    };
    plaintext.map_err(|_| SigbakError::DecryptionFailure("bad PKCS#7 padding".into()))
}

/// Inverse of [`open`].
pub fn seal(
    scheme: SealedScheme,
    cipher_key: &[u8],
    mac_key: &[u8],
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
) -> SigbakResult<Vec<u8>> {
    let ciphertext = match scheme {
        SealedScheme::Sha1Aes128 => cbc::Encryptor::<Aes128>::new_from_slices(cipher_key, iv)
            .map_err(|e| SigbakError::DecryptionFailure(format!("AES-128-CBC init: {e}")))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        SealedScheme::Sha256Aes256 => cbc::Encryptor::<Aes256>::new_from_slices(cipher_key, iv)
            .map_err(|e| SigbakError::DecryptionFailure(format!("AES-256-CBC init: {e}")))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
    };

    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len() + scheme.mac_size());
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext);
    let tag = compute_mac(scheme, mac_key, &out)?;
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Decrypt a desktop attachment file.
///
/// `key_b64` is the 64-byte key stored with the attachment row. When `size`
/// is known the plaintext is cut to it (newer files carry extra padding).
pub fn open_desktop_attachment(
    key_b64: &str,
    blob: &[u8],
    size: Option<usize>,
) -> SigbakResult<Vec<u8>> {
    let key = Zeroizing::new(
        base64::engine::general_purpose::STANDARD
            .decode(key_b64.trim())
            .map_err(|e| SigbakError::DecryptionFailure(format!("attachment key is not base64: {e}")))?,
    );
    if key.len() != 2 * KEY_SIZE {
        return Err(SigbakError::DecryptionFailure(format!(
            "attachment key has {} bytes, expected {}",
            key.len(),
            2 * KEY_SIZE
        )));
    }

    let mut plaintext = open(
        SealedScheme::Sha256Aes256,
        &key[..KEY_SIZE],
        &key[KEY_SIZE..],
        blob,
    )?;
    if let Some(size) = size {
        if size > plaintext.len() {
            tracing::warn!(
                size,
                available = plaintext.len(),
                "attachment shorter than its recorded size"
            );
        } else {
            plaintext.truncate(size);
        }
    }
    Ok(plaintext)
}

fn compute_mac(scheme: SealedScheme, key: &[u8], data: &[u8]) -> SigbakResult<Vec<u8>> {
    let setup = |e| SigbakError::Other(anyhow::anyhow!("HMAC key setup failed: {e}"));
    Ok(match scheme {
        SealedScheme::Sha1Aes128 => {
            let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).map_err(setup)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        SealedScheme::Sha256Aes256 => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(setup)?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    })
}

fn verify_mac(scheme: SealedScheme, key: &[u8], data: &[u8], tag: &[u8]) -> SigbakResult<bool> {
    let setup = |e| SigbakError::Other(anyhow::anyhow!("HMAC key setup failed: {e}"));
    Ok(match scheme {
        SealedScheme::Sha1Aes128 => {
            let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).map_err(setup)?;
            mac.update(data);
            mac.verify_slice(tag).is_ok()
        }
        SealedScheme::Sha256Aes256 => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(setup)?;
            mac.update(data);
            mac.verify_slice(tag).is_ok()
        }
    })
}
