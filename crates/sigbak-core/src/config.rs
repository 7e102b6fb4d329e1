use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigbakConfig {
    pub logging: LoggingConfig,
    pub backup: BackupConfig,
    pub export: ExportConfig,
    pub desktop: DesktopConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Reading and ingesting encrypted backup files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// SHA-512 rounds for the passphrase KDF (default: 250000)
    pub kdf_rounds: u32,
    /// Largest frame accepted before the stream is considered desynced
    pub max_frame_size: u32,
    /// Record and skip frames that fail authentication instead of aborting
    pub skip_bad_frames: bool,
    /// Authenticate every attachment payload while ingesting
    pub verify_attachments: bool,
    /// Bytes to scan forward for the next valid frame after a framing error (0 = off)
    pub resync_window: u64,
}

/// Writing re-encrypted backups
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Header version written on export (default: keep the input's)
    pub format_version: Option<u32>,
    /// Compact primary keys before export
    pub compact_ids: bool,
    /// Drop in-memory attachments with no matching part row before export
    pub clean_attachments: bool,
    /// Move messages that duplicate an older one's thread, sender and date
    /// sent to the next free millisecond
    pub separate_dates: bool,
}

/// Desktop database unwrap
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DesktopConfig {
    /// Desktop profile directory holding config.json and sql/db.sqlite
    pub config_dir: Option<PathBuf>,
    /// SQLCipher compatibility version of the database (default: 4)
    pub sqlcipher_version: u32,
    /// Keychain service holding the safe-storage secret
    pub secret_service: String,
    /// Keychain account holding the safe-storage secret
    pub secret_account: String,
    /// Safe-storage flavour: "linux" or "macos"
    pub platform: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            kdf_rounds: 250_000,
            max_frame_size: 3 * 1024 * 1024,
            skip_bad_frames: true,
            verify_attachments: true,
            resync_window: 0,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format_version: None,
            compact_ids: false,
            clean_attachments: true,
            separate_dates: false,
        }
    }
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            config_dir: None,
            sqlcipher_version: 4,
            secret_service: "Signal Safe Storage".into(),
            secret_account: "Signal Key".into(),
            platform: if cfg!(target_os = "macos") {
                "macos".into()
            } else {
                "linux".into()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[logging]
level = "debug"
format = "json"

[backup]
kdf_rounds = 1000
max_frame_size = 1048576
skip_bad_frames = false
verify_attachments = false
resync_window = 4096

[export]
format_version = 1
compact_ids = true
clean_attachments = false
separate_dates = true

[desktop]
config_dir = "/home/user/.config/Signal"
sqlcipher_version = 3
platform = "macos"
"#;
        let config: SigbakConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.backup.kdf_rounds, 1000);
        assert_eq!(config.backup.max_frame_size, 1048576);
        assert!(!config.backup.skip_bad_frames);
        assert!(!config.backup.verify_attachments);
        assert_eq!(config.backup.resync_window, 4096);
        assert_eq!(config.export.format_version, Some(1));
        assert!(config.export.compact_ids);
        assert!(!config.export.clean_attachments);
        assert!(config.export.separate_dates);
        assert_eq!(
            config.desktop.config_dir,
            Some(PathBuf::from("/home/user/.config/Signal"))
        );
        assert_eq!(config.desktop.sqlcipher_version, 3);
        assert_eq!(config.desktop.platform, "macos");
    }

    #[test]
    fn test_parse_defaults() {
        let config: SigbakConfig = toml::from_str("").unwrap();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.backup.kdf_rounds, 250_000);
        assert_eq!(config.backup.max_frame_size, 3 * 1024 * 1024);
        assert!(config.backup.skip_bad_frames);
        assert!(config.backup.verify_attachments);
        assert_eq!(config.backup.resync_window, 0);
        assert_eq!(config.export.format_version, None);
        assert!(config.export.clean_attachments);
        assert!(!config.export.separate_dates);
        assert_eq!(config.desktop.sqlcipher_version, 4);
        assert_eq!(config.desktop.secret_service, "Signal Safe Storage");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[backup]
resync_window = 65536
"#;
        let config: SigbakConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.backup.resync_window, 65536);
        // Defaults
        assert_eq!(config.backup.kdf_rounds, 250_000);
        assert!(config.backup.skip_bad_frames);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = SigbakConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: SigbakConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.backup.kdf_rounds, parsed.backup.kdf_rounds);
        assert_eq!(config.desktop.secret_account, parsed.desktop.secret_account);
        assert_eq!(config.logging.format, parsed.logging.format);
    }
}
