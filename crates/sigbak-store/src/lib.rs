//! sigbak-store: a decrypted backup as a mutable relational model
//!
//! ```text
//! BackupReader ──load──▶ SignalBackup { store, attachments, stickers, avatars, prefs }
//!                              │  compact_ids / offset_ids / remap_recipient
//!                              │  drop_bad_frames / clean_attachments
//!                              ▼
//!                        export ──▶ BackupWriter
//! ```
//!
//! Row ids are only ever changed through the link registry ([`links`]), so
//! every referencing column and every attachment/sticker payload key moves
//! together with the row it points at.

pub mod backup;
pub mod compact;
pub mod dates;
pub mod desktop;
pub mod export;
pub mod ingest;
pub mod links;
pub mod prune;
pub mod remap;
pub mod schema;
pub mod store;

pub use backup::{LoadOptions, LoadStats, OrphanedPayloads, SignalBackup};
pub use dates::MAX_DATE_PROBES;
pub use desktop::{resolve_database_key, unwrap_database, DesktopConfigFile};
pub use export::{insert_statement, ExportStats};
pub use links::{table_link, LinkedColumn, TableLink, VersionRange, TABLE_LINKS};
pub use schema::ColumnNames;
pub use store::{QueryResults, RelationalStore, SchemaObject, SqlValue, SqliteStore};
