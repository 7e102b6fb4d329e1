//! Backup key → cipher key + MAC key via HKDF-SHA256

use hkdf::Hkdf;
use sha2::Sha256;
use sigbak_core::{SigbakError, SigbakResult};
use zeroize::Zeroize;

use crate::kdf::BackupKey;
use crate::{HKDF_INFO, KEY_SIZE};

/// Cipher and MAC keys for one backup session. Zeroized on drop.
#[derive(Clone)]
pub struct CipherMaterial {
    cipher_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
}

impl CipherMaterial {
    pub fn from_parts(cipher_key: [u8; KEY_SIZE], mac_key: [u8; KEY_SIZE]) -> Self {
        Self {
            cipher_key,
            mac_key,
        }
    }

    pub fn cipher_key(&self) -> &[u8; KEY_SIZE] {
        &self.cipher_key
    }

    pub fn mac_key(&self) -> &[u8; KEY_SIZE] {
        &self.mac_key
    }
}

impl Drop for CipherMaterial {
    fn drop(&mut self) {
        self.cipher_key.zeroize();
        self.mac_key.zeroize();
    }
}

impl std::fmt::Debug for CipherMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherMaterial")
            .field("cipher_key", &"[REDACTED]")
            .field("mac_key", &"[REDACTED]")
            .finish()
    }
}

/// Expand the backup key into 64 bytes and split it: the first half keys
/// AES, the second half keys HMAC.
pub fn derive_cipher_material(key: &BackupKey) -> SigbakResult<CipherMaterial> {
    // An all-zero salt of hash length is what HKDF uses when none is given.
    let hkdf = Hkdf::<Sha256>::new(None, key.as_bytes());
    let mut okm = [0u8; 2 * KEY_SIZE];
    hkdf.expand(HKDF_INFO, &mut okm)
        .map_err(|e| SigbakError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;

    let mut cipher_key = [0u8; KEY_SIZE];
    let mut mac_key = [0u8; KEY_SIZE];
    cipher_key.copy_from_slice(&okm[..KEY_SIZE]);
    mac_key.copy_from_slice(&okm[KEY_SIZE..]);
    okm.zeroize();

    Ok(CipherMaterial::from_parts(cipher_key, mac_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_deterministic() {
        let key = BackupKey::from_bytes([42u8; KEY_SIZE]);
        let m1 = derive_cipher_material(&key).unwrap();
        let m2 = derive_cipher_material(&key).unwrap();
        assert_eq!(m1.cipher_key(), m2.cipher_key());
        assert_eq!(m1.mac_key(), m2.mac_key());
    }

    #[test]
    fn test_cipher_and_mac_keys_differ() {
        let key = BackupKey::from_bytes([42u8; KEY_SIZE]);
        let material = derive_cipher_material(&key).unwrap();
        assert_ne!(
            material.cipher_key(),
            material.mac_key(),
            "the two halves of the HKDF output must differ"
        );
    }

    #[test]
    fn test_zero_salt_equals_no_salt() {
        let key = BackupKey::from_bytes([3u8; KEY_SIZE]);
        let material = derive_cipher_material(&key).unwrap();

        let explicit = Hkdf::<Sha256>::new(Some(&[0u8; 32]), key.as_bytes());
        let mut okm = [0u8; 64];
        explicit.expand(b"Backup Export", &mut okm).unwrap();

        assert_eq!(material.cipher_key().as_slice(), &okm[..32]);
        assert_eq!(material.mac_key().as_slice(), &okm[32..]);
    }

    #[test]
    fn test_different_backup_keys() {
        let m1 = derive_cipher_material(&BackupKey::from_bytes([1u8; KEY_SIZE])).unwrap();
        let m2 = derive_cipher_material(&BackupKey::from_bytes([2u8; KEY_SIZE])).unwrap();
        assert_ne!(m1.cipher_key(), m2.cipher_key());
    }
}
