//! sigbak-secrets: OS secret-store access
//!
//! The desktop client wraps its database key with a secret held by the OS
//! keychain. Lookup order used by the CLI:
//!   1. `--secret` flag / `SIGBAK_SAFE_STORAGE_SECRET` env var
//!   2. keychain entry `[desktop] secret_service` / `secret_account`

pub mod keychain;

pub use keychain::{fetch_secret, SafeStorageSecret, SAFE_STORAGE_SECRET_LEN};
