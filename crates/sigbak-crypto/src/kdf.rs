//! Key derivation: 30-digit passphrase → backup key
//!
//! ```text
//! sha512.update(salt)                 -- first round only; finalize resets
//! hash = pass
//! repeat rounds:
//!     sha512.update(hash)             -- the pass itself on round 0
//!     hash = sha512.finalize(pass)
//! key = hash[..32]
//! ```
//!
//! Round 0 therefore feeds the pass twice. Keys only interoperate with
//! backups written by the phone app when this is reproduced exactly.

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha512};
use sigbak_core::{SigbakError, SigbakResult};
use zeroize::{Zeroize, Zeroizing};

use crate::{KEY_SIZE, PASSPHRASE_DIGITS};

/// The 256-bit root key of a backup, derived from the passphrase.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct BackupKey {
    bytes: [u8; KEY_SIZE],
}

impl BackupKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for BackupKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Iteration parameters for the backup KDF
#[derive(Debug, Clone)]
pub struct BackupKdfParams {
    /// SHA-512 rounds (default: 250000, fixed by the backup format)
    pub rounds: u32,
}

impl Default for BackupKdfParams {
    fn default() -> Self {
        Self { rounds: 250_000 }
    }
}

/// Reduce a passphrase to its 30 ASCII digits.
///
/// Spaces, dashes and any other filler are dropped wherever they appear.
/// Anything other than exactly 30 digits is rejected.
pub fn normalize_passphrase(passphrase: &str) -> SigbakResult<Zeroizing<Vec<u8>>> {
    let mut digits = Zeroizing::new(Vec::with_capacity(PASSPHRASE_DIGITS));
    for b in passphrase.bytes() {
        if !b.is_ascii_digit() {
            continue;
        }
        if digits.len() == PASSPHRASE_DIGITS {
            return Err(SigbakError::InvalidPassphrase(format!(
                "more than {PASSPHRASE_DIGITS} digits"
            )));
        }
        digits.push(b);
    }

    if digits.len() != PASSPHRASE_DIGITS {
        return Err(SigbakError::InvalidPassphrase(format!(
            "expected {PASSPHRASE_DIGITS} digits, got {}",
            digits.len()
        )));
    }
    Ok(digits)
}

/// Derive the backup key from a passphrase and the salt carried in the
/// backup header. An empty salt is simply not fed.
pub fn derive_backup_key(
    passphrase: &SecretString,
    salt: &[u8],
    params: &BackupKdfParams,
) -> SigbakResult<BackupKey> {
    if params.rounds == 0 {
        return Err(SigbakError::Other(anyhow::anyhow!(
            "backup KDF needs at least one round"
        )));
    }

    let pass = normalize_passphrase(passphrase.expose_secret())?;

    let mut hasher = Sha512::new();
    if !salt.is_empty() {
        hasher.update(salt);
    }

    let mut hash = Zeroizing::new(pass.to_vec());
    for _ in 0..params.rounds {
        hasher.update(hash.as_slice());
        hasher.update(pass.as_slice());
        let out = hasher.finalize_reset();
        hash.clear();
        hash.extend_from_slice(&out);
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&hash[..KEY_SIZE]);
    tracing::debug!(rounds = params.rounds, salted = !salt.is_empty(), "derived backup key");
    Ok(BackupKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASS: &str = "12345 67890 12345 67890 12345 67890";

    fn fast() -> BackupKdfParams {
        BackupKdfParams { rounds: 16 }
    }

    #[test]
    fn test_normalize_strips_filler() {
        let digits = normalize_passphrase(PASS).unwrap();
        assert_eq!(digits.as_slice(), b"123456789012345678901234567890");

        let dashed = normalize_passphrase("-12345-67890-12345-67890-12345-67890-").unwrap();
        assert_eq!(digits.as_slice(), dashed.as_slice());
    }

    #[test]
    fn test_normalize_rejects_wrong_digit_count() {
        assert!(matches!(
            normalize_passphrase("12345 67890"),
            Err(SigbakError::InvalidPassphrase(_))
        ));
        assert!(matches!(
            normalize_passphrase(&format!("{PASS} 1")),
            Err(SigbakError::InvalidPassphrase(_))
        ));
        assert!(normalize_passphrase("").is_err());
    }

    #[test]
    fn test_kdf_deterministic() {
        let passphrase = SecretString::from(PASS);
        let salt = [7u8; 32];

        let key1 = derive_backup_key(&passphrase, &salt, &fast()).unwrap();
        let key2 = derive_backup_key(&passphrase, &salt, &fast()).unwrap();

        assert_eq!(
            key1.as_bytes(),
            key2.as_bytes(),
            "KDF must be deterministic"
        );
    }

    #[test]
    fn test_kdf_filler_does_not_matter() {
        let salt = [7u8; 32];
        let spaced = derive_backup_key(&SecretString::from(PASS), &salt, &fast()).unwrap();
        let packed = derive_backup_key(
            &SecretString::from("123456789012345678901234567890"),
            &salt,
            &fast(),
        )
        .unwrap();
        assert_eq!(spaced.as_bytes(), packed.as_bytes());
    }

    #[test]
    fn test_kdf_one_digit_avalanche() {
        let salt = [7u8; 32];
        let key1 = derive_backup_key(&SecretString::from(PASS), &salt, &fast()).unwrap();
        let key2 = derive_backup_key(
            &SecretString::from("12345 67890 12345 67890 12345 67891"),
            &salt,
            &fast(),
        )
        .unwrap();

        let differing_bits: u32 = key1
            .as_bytes()
            .iter()
            .zip(key2.as_bytes())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        assert!(
            differing_bits > 64,
            "one digit must flip a large share of the 256 key bits, got {differing_bits}"
        );
    }

    #[test]
    fn test_kdf_different_salts() {
        let passphrase = SecretString::from(PASS);
        let key1 = derive_backup_key(&passphrase, &[1u8; 32], &fast()).unwrap();
        let key2 = derive_backup_key(&passphrase, &[2u8; 32], &fast()).unwrap();
        let unsalted = derive_backup_key(&passphrase, &[], &fast()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes(), "different salts must produce different keys");
        assert_ne!(key1.as_bytes(), unsalted.as_bytes());
    }

    #[test]
    fn test_kdf_round_zero_double_feed() {
        // One round must equal SHA-512(salt ‖ pass ‖ pass)[..32].
        let salt = [9u8; 32];
        let key = derive_backup_key(
            &SecretString::from(PASS),
            &salt,
            &BackupKdfParams { rounds: 1 },
        )
        .unwrap();

        let pass = b"123456789012345678901234567890";
        let mut hasher = Sha512::new();
        hasher.update(salt);
        hasher.update(pass);
        hasher.update(pass);
        let expected = hasher.finalize();

        assert_eq!(key.as_bytes().as_slice(), &expected[..KEY_SIZE]);
    }

    #[test]
    fn test_kdf_salt_fed_once() {
        // Round 1 must not see the salt again.
        let salt = [9u8; 32];
        let key = derive_backup_key(
            &SecretString::from(PASS),
            &salt,
            &BackupKdfParams { rounds: 2 },
        )
        .unwrap();

        let pass = b"123456789012345678901234567890";
        let round0 = Sha512::new()
            .chain_update(salt)
            .chain_update(pass)
            .chain_update(pass)
            .finalize();
        let round1 = Sha512::new()
            .chain_update(round0)
            .chain_update(pass)
            .finalize();

        assert_eq!(key.as_bytes().as_slice(), &round1[..KEY_SIZE]);
    }

    #[test]
    fn test_zero_rounds_rejected() {
        let result = derive_backup_key(
            &SecretString::from(PASS),
            &[],
            &BackupKdfParams { rounds: 0 },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = BackupKey::from_bytes([0xAB; KEY_SIZE]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }
}
