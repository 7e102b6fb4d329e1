//! SQLCipher page decryption for desktop databases
//!
//! ```text
//! page 1:  [ salt (16) ][ E(data) ][ iv (16) ][ hmac ][ pad ]
//! page n:             [ E(data) ][ iv (16) ][ hmac ][ pad ]
//!
//! hmac = HMAC-<digest>(hmac_key, E(data) ‖ iv ‖ n:u32le)
//! E    = AES-256-CBC, no padding
//! ```
//!
//! The page key is either given raw (`x'..'` keys) or derived with
//! PBKDF2-HMAC-<digest> from a passphrase and the salt. The HMAC key is
//! always PBKDF2(page key, salt ^ 0x3a, 2 rounds).

use std::path::Path;

use aes::Aes256;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use sha2::Sha512;
use sigbak_core::{SigbakError, SigbakResult};
use zeroize::Zeroizing;

use crate::{IV_SIZE, KEY_SIZE};

/// Size of the per-database salt at the start of page 1
pub const SALT_SIZE: usize = 16;

/// First 16 bytes of every plain SQLite database
pub const SQLITE_HEADER: &[u8; SALT_SIZE] = b"SQLite format 3\0";

const HMAC_SALT_MASK: u8 = 0x3a;
const HMAC_KDF_ITERATIONS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlCipherDigest {
    Sha1,
    Sha512,
}

impl SqlCipherDigest {
    pub fn size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha512 => 64,
        }
    }

    fn pbkdf2(self, password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]) {
        match self {
            Self::Sha1 => pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, rounds, out),
            Self::Sha512 => pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, rounds, out),
        }
    }
}

/// Page layout and KDF settings of one SQLCipher compatibility version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlCipherParams {
    pub digest: SqlCipherDigest,
    pub page_size: usize,
    pub kdf_iterations: u32,
}

impl SqlCipherParams {
    pub fn for_version(version: u32) -> SigbakResult<Self> {
        let (digest, page_size, kdf_iterations) = match version {
            1 | 2 => (SqlCipherDigest::Sha1, 1024, 4_000),
            3 => (SqlCipherDigest::Sha1, 1024, 64_000),
            4 => (SqlCipherDigest::Sha512, 4096, 256_000),
            other => {
                return Err(SigbakError::Config(format!(
                    "unsupported SQLCipher version {other}"
                )))
            }
        };
        Ok(Self {
            digest,
            page_size,
            kdf_iterations,
        })
    }

    /// IV + HMAC rounded up to a whole AES block
    pub fn reserve_size(&self) -> usize {
        let digest = self.digest.size();
        let padding = (((digest - 1) | 15) + 1) - digest;
        IV_SIZE + digest + padding
    }
}

/// Database key as found in the desktop config.
pub enum SqlCipherKey {
    Raw([u8; KEY_SIZE]),
    Passphrase(SecretString),
}

impl SqlCipherKey {
    /// Parse a 64-hex-digit raw key.
    pub fn from_hex(hex_key: &str) -> SigbakResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(hex_key.trim())
                .map_err(|e| SigbakError::DecryptionFailure(format!("database key is not hex: {e}")))?,
        );
        let raw: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            SigbakError::DecryptionFailure(format!(
                "database key has {} bytes, expected {KEY_SIZE}",
                bytes.len()
            ))
        })?;
        Ok(Self::Raw(raw))
    }
}

impl Drop for SqlCipherKey {
    fn drop(&mut self) {
        if let Self::Raw(bytes) = self {
            zeroize::Zeroize::zeroize(bytes);
        }
    }
}

impl std::fmt::Debug for SqlCipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw(_) => f.write_str("SqlCipherKey::Raw([REDACTED])"),
            Self::Passphrase(_) => f.write_str("SqlCipherKey::Passphrase([REDACTED])"),
        }
    }
}

pub struct SqlCipherDecryptor {
    params: SqlCipherParams,
    page_key: Zeroizing<[u8; KEY_SIZE]>,
    hmac_key: Zeroizing<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for SqlCipherDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlCipherDecryptor")
            .field("params", &self.params)
            .field("page_key", &"[REDACTED]")
            .field("hmac_key", &"[REDACTED]")
            .finish()
    }
}

impl SqlCipherDecryptor {
    pub fn new(key: &SqlCipherKey, salt: &[u8; SALT_SIZE], version: u32) -> SigbakResult<Self> {
        Ok(Self::with_params(key, salt, SqlCipherParams::for_version(version)?))
    }

    pub fn with_params(key: &SqlCipherKey, salt: &[u8; SALT_SIZE], params: SqlCipherParams) -> Self {
        let mut page_key = Zeroizing::new([0u8; KEY_SIZE]);
        match key {
            SqlCipherKey::Raw(raw) => page_key.copy_from_slice(raw),
            SqlCipherKey::Passphrase(pass) => params.digest.pbkdf2(
                pass.expose_secret().as_bytes(),
                salt,
                params.kdf_iterations,
                page_key.as_mut_slice(),
            ),
        }

        let mut hmac_salt = *salt;
        for b in hmac_salt.iter_mut() {
            *b ^= HMAC_SALT_MASK;
        }
        let mut hmac_key = Zeroizing::new([0u8; KEY_SIZE]);
        params.digest.pbkdf2(
            page_key.as_slice(),
            &hmac_salt,
            HMAC_KDF_ITERATIONS,
            hmac_key.as_mut_slice(),
        );

        Self {
            params,
            page_key,
            hmac_key,
        }
    }

    /// Build a decryptor for `bytes`, taking the salt from its first page.
    pub fn for_database(key: &SqlCipherKey, bytes: &[u8], version: u32) -> SigbakResult<Self> {
        let salt: [u8; SALT_SIZE] = bytes
            .get(..SALT_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                SigbakError::ParseFailure("database is shorter than its salt".into())
            })?;
        Self::new(key, &salt, version)
    }

    pub fn params(&self) -> &SqlCipherParams {
        &self.params
    }

    /// Decrypt a whole database image into a plain SQLite file image.
    pub fn decrypt(&self, bytes: &[u8]) -> SigbakResult<Vec<u8>> {
        let page_size = self.params.page_size;
        if bytes.len() % page_size != 0 {
            return Err(SigbakError::ParseFailure(format!(
                "database size {} is not a multiple of the {page_size}-byte page size",
                bytes.len()
            )));
        }

        let mut out = Vec::with_capacity(bytes.len());
        for (index, page) in bytes.chunks_exact(page_size).enumerate() {
            let pgno = u32::try_from(index + 1).map_err(|_| {
                SigbakError::ParseFailure("database has more pages than fit a u32".into())
            })?;
            self.decrypt_page(pgno, page, &mut out)?;
        }
        tracing::debug!(pages = bytes.len() / page_size, "decrypted SQLCipher database");
        Ok(out)
    }

    /// Decrypt the database at `input` and write the plain image to `output`.
    /// Returns the number of pages written.
    pub fn decrypt_file(
        key: &SqlCipherKey,
        version: u32,
        input: &Path,
        output: &Path,
    ) -> SigbakResult<usize> {
        let bytes = std::fs::read(input)?;
        let decryptor = Self::for_database(key, &bytes, version)?;
        let plain = decryptor.decrypt(&bytes)?;
        std::fs::write(output, &plain)?;
        Ok(plain.len() / decryptor.params.page_size)
    }

    fn decrypt_page(&self, pgno: u32, page: &[u8], out: &mut Vec<u8>) -> SigbakResult<()> {
        let digest = self.params.digest.size();
        let reserve = self.params.reserve_size();
        let start = if pgno == 1 { SALT_SIZE } else { 0 };
        let hashed_end = page.len() - reserve + IV_SIZE;

        let hashed = &page[start..hashed_end];
        let stored_mac = &page[hashed_end..hashed_end + digest];
        if !self.verify_page_mac(hashed, pgno, stored_mac)? {
            return Err(SigbakError::AuthenticationFailure(format!(
                "SQLCipher page {pgno} HMAC mismatch"
            )));
        }

        let (ciphertext, iv) = hashed.split_at(hashed.len() - IV_SIZE);
        let mut plain = ciphertext.to_vec();
        cbc::Decryptor::<Aes256>::new_from_slices(self.page_key.as_slice(), iv)
            .map_err(|e| SigbakError::DecryptionFailure(format!("AES-256-CBC init: {e}")))?
            .decrypt_padded_mut::<NoPadding>(&mut plain)
            .map_err(|_| {
                SigbakError::DecryptionFailure(format!("page {pgno} is not block aligned"))
            })?;

        if pgno == 1 {
            out.extend_from_slice(SQLITE_HEADER);
        }
        out.extend_from_slice(&plain);
        out.resize(out.len() + reserve, 0);
        Ok(())
    }

    fn verify_page_mac(&self, hashed: &[u8], pgno: u32, tag: &[u8]) -> SigbakResult<bool> {
        let setup = |e| SigbakError::Other(anyhow::anyhow!("HMAC key setup failed: {e}"));
        let pgno = pgno.to_le_bytes();
        Ok(match self.params.digest {
            SqlCipherDigest::Sha1 => {
                let mut mac =
                    <Hmac<Sha1> as Mac>::new_from_slice(self.hmac_key.as_slice()).map_err(setup)?;
                mac.update(hashed);
                mac.update(&pgno);
                mac.verify_slice(tag).is_ok()
            }
            SqlCipherDigest::Sha512 => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(self.hmac_key.as_slice())
                    .map_err(setup)?;
                mac.update(hashed);
                mac.update(&pgno);
                mac.verify_slice(tag).is_ok()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockEncryptMut;

    const SALT: [u8; SALT_SIZE] = [0x51; SALT_SIZE];

    /// Encrypt a plain image the way SQLCipher lays pages out.
    fn encrypt_image(dec: &SqlCipherDecryptor, plain: &[u8]) -> Vec<u8> {
        let params = dec.params();
        let digest = params.digest.size();
        let reserve = params.reserve_size();
        let mut out = Vec::new();

        for (index, page) in plain.chunks_exact(params.page_size).enumerate() {
            let pgno = index as u32 + 1;
            let start = if pgno == 1 { SALT_SIZE } else { 0 };
            let data_end = params.page_size - reserve;
            let iv = [pgno as u8 ^ 0xA5; IV_SIZE];

            let mut data = page[start..data_end].to_vec();
            let len = data.len();
            cbc::Encryptor::<Aes256>::new_from_slices(dec.page_key.as_slice(), &iv)
                .unwrap()
                .encrypt_padded_mut::<NoPadding>(&mut data, len)
                .unwrap();

            let mut hashed = data.clone();
            hashed.extend_from_slice(&iv);
            let tag = match params.digest {
                SqlCipherDigest::Sha1 => {
                    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(dec.hmac_key.as_slice()).unwrap();
                    mac.update(&hashed);
                    mac.update(&pgno.to_le_bytes());
                    mac.finalize().into_bytes().to_vec()
                }
                SqlCipherDigest::Sha512 => {
                    let mut mac =
                        <Hmac<Sha512> as Mac>::new_from_slice(dec.hmac_key.as_slice()).unwrap();
                    mac.update(&hashed);
                    mac.update(&pgno.to_le_bytes());
                    mac.finalize().into_bytes().to_vec()
                }
            };

            if pgno == 1 {
                out.extend_from_slice(&SALT);
            }
            out.extend_from_slice(&hashed);
            out.extend_from_slice(&tag);
            out.resize(out.len() + reserve - IV_SIZE - digest, 0);
        }
        out
    }

    fn plain_image(params: &SqlCipherParams, pages: usize) -> Vec<u8> {
        let reserve = params.reserve_size();
        let mut image = Vec::new();
        for n in 0..pages {
            let mut page: Vec<u8> = (0..params.page_size).map(|i| (i * 7 + n) as u8).collect();
            if n == 0 {
                page[..SALT_SIZE].copy_from_slice(SQLITE_HEADER);
            }
            let len = page.len();
            page[len - reserve..].fill(0);
            image.extend_from_slice(&page);
        }
        image
    }

    #[test]
    fn test_version_params() {
        let v4 = SqlCipherParams::for_version(4).unwrap();
        assert_eq!(v4.page_size, 4096);
        assert_eq!(v4.kdf_iterations, 256_000);
        assert_eq!(v4.reserve_size(), 80);

        let v3 = SqlCipherParams::for_version(3).unwrap();
        assert_eq!(v3.digest, SqlCipherDigest::Sha1);
        assert_eq!(v3.reserve_size(), 48);

        assert_eq!(SqlCipherParams::for_version(2).unwrap().kdf_iterations, 4_000);
        assert!(SqlCipherParams::for_version(5).is_err());
    }

    #[test]
    fn test_raw_key_v4_roundtrip() {
        let key = SqlCipherKey::Raw([0x42; KEY_SIZE]);
        let dec = SqlCipherDecryptor::new(&key, &SALT, 4).unwrap();
        let plain = plain_image(dec.params(), 3);
        let encrypted = encrypt_image(&dec, &plain);

        assert_eq!(&encrypted[..SALT_SIZE], &SALT);
        let decrypted = dec.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, plain);
        assert!(decrypted.starts_with(SQLITE_HEADER));
    }

    #[test]
    fn test_passphrase_key_v3_roundtrip() {
        let key = SqlCipherKey::Passphrase(SecretString::from("desktop passphrase"));
        let params = SqlCipherParams {
            kdf_iterations: 10,
            ..SqlCipherParams::for_version(3).unwrap()
        };
        let dec = SqlCipherDecryptor::with_params(&key, &SALT, params);
        let plain = plain_image(dec.params(), 2);
        let encrypted = encrypt_image(&dec, &plain);

        let again = SqlCipherDecryptor::with_params(&key, &SALT, dec.params().clone());
        assert_eq!(again.decrypt(&encrypted).unwrap(), plain);
    }

    #[test]
    fn test_tampered_page_names_page_number() {
        let key = SqlCipherKey::Raw([0x42; KEY_SIZE]);
        let dec = SqlCipherDecryptor::new(&key, &SALT, 4).unwrap();
        let mut encrypted = encrypt_image(&dec, &plain_image(dec.params(), 2));
        encrypted[4096 + 100] ^= 0x01;

        match dec.decrypt(&encrypted) {
            Err(SigbakError::AuthenticationFailure(msg)) => assert!(msg.contains("page 2")),
            other => panic!("expected page 2 authentication failure, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_key_fails_page_one() {
        let dec = SqlCipherDecryptor::new(&SqlCipherKey::Raw([1; KEY_SIZE]), &SALT, 4).unwrap();
        let encrypted = encrypt_image(&dec, &plain_image(dec.params(), 1));
        let wrong = SqlCipherDecryptor::new(&SqlCipherKey::Raw([2; KEY_SIZE]), &SALT, 4).unwrap();
        assert!(matches!(
            wrong.decrypt(&encrypted),
            Err(SigbakError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn test_partial_page_rejected() {
        let dec = SqlCipherDecryptor::new(&SqlCipherKey::Raw([1; KEY_SIZE]), &SALT, 4).unwrap();
        let mut encrypted = encrypt_image(&dec, &plain_image(dec.params(), 1));
        encrypted.extend_from_slice(&[0u8; 100]);
        assert!(matches!(
            dec.decrypt(&encrypted),
            Err(SigbakError::ParseFailure(_))
        ));
    }

    #[test]
    fn test_decrypt_file() {
        let key = SqlCipherKey::from_hex(&"42".repeat(KEY_SIZE)).unwrap();
        let dec = SqlCipherDecryptor::new(&key, &SALT, 4).unwrap();
        let plain = plain_image(dec.params(), 2);

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("db.sqlite");
        let output = dir.path().join("plain.sqlite");
        std::fs::write(&input, encrypt_image(&dec, &plain)).unwrap();

        let pages = SqlCipherDecryptor::decrypt_file(&key, 4, &input, &output).unwrap();
        assert_eq!(pages, 2);
        assert_eq!(std::fs::read(&output).unwrap(), plain);
    }

    #[test]
    fn test_key_from_hex_rejects_bad_input() {
        assert!(SqlCipherKey::from_hex("abcd").is_err());
        assert!(SqlCipherKey::from_hex(&"zz".repeat(32)).is_err());
    }
}
