//! sigbak-crypto: key derivation and ciphers for encrypted messenger backups
//!
//! Key chain for the framed backup stream:
//! ```text
//! passphrase (30 digits)
//!   └── Backup Key (32 bytes, 250k rounds SHA-512 over salt ‖ pass)
//!       └── HKDF-SHA256(info = "Backup Export") → 64 bytes
//!           ├── cipher key [0..32]  AES-256-CTR, counter IV per frame/attachment
//!           └── mac key   [32..64]  HMAC-SHA256, truncated to 10 bytes
//! ```
//!
//! Desktop databases use a separate scheme (SQLCipher pages, see [`sqlcipher`]),
//! whose key may itself be wrapped by the OS safe storage ([`safe_storage`]).

pub mod codec;
pub mod kdf;
pub mod keys;
pub mod safe_storage;
pub mod sealed;
pub mod sqlcipher;

pub use codec::{open_attachment, seal_attachment, FrameCodec, OpenedFrame};
pub use kdf::{derive_backup_key, normalize_passphrase, BackupKdfParams, BackupKey};
pub use keys::{derive_cipher_material, CipherMaterial};
pub use safe_storage::{decrypt_database_key, SafeStoragePlatform};
pub use sealed::{open_desktop_attachment, SealedScheme};
pub use sqlcipher::{SqlCipherDecryptor, SqlCipherKey, SqlCipherParams};

/// Size of the backup key and of each derived key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES block / IV
pub const IV_SIZE: usize = 16;

/// Bytes of HMAC-SHA256 kept on frames and attachments
pub const MAC_SIZE: usize = 10;

/// Size of the big-endian length prefix in front of every frame
pub const LENGTH_SIZE: usize = 4;

/// Digits in a normalized backup passphrase
pub const PASSPHRASE_DIGITS: usize = 30;

/// HKDF info string for the cipher/mac key split
pub const HKDF_INFO: &[u8] = b"Backup Export";
