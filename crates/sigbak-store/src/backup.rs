//! A decoded backup held in memory: relational rows plus payload frames
//!
//! ```text
//! SignalBackup
//!   store          rows from Statement frames
//!   attachments    (rowId, uniqueId) -> Attachment frame   mirrors part rows
//!   stickers       rowId -> Sticker frame                   mirrors sticker rows
//!   avatars        [(recipient, Avatar frame)]
//!   preferences, key values, bad attachment keys
//! ```
//!
//! Every operation that renumbers `part` or `sticker` rows re-keys the maps
//! in the same step; an attachment whose key no longer names a row is lost
//! on export.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use sigbak_core::config::BackupConfig;
use sigbak_core::{AttachmentKey, SigbakError, SigbakResult};
use sigbak_frames::{
    AttachmentFrame, AvatarFrame, HeaderFrame, KeyValueFrame, SharedPrefFrame, StickerFrame,
};

use crate::schema::ColumnNames;
use crate::store::{RelationalStore, SqliteStore};

/// In-memory payloads that no longer name a row, see
/// [`SignalBackup::check_attachment_invariant`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanedPayloads {
    pub attachments: Vec<AttachmentKey>,
    pub stickers: Vec<u64>,
    /// Recipient ids of avatar frames
    pub avatars: Vec<String>,
}

impl OrphanedPayloads {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.attachments.len() + self.stickers.len() + self.avatars.len()
    }
}

/// How [`SignalBackup::load`] treats damaged input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Skip frames that fail authentication or parsing instead of aborting
    pub skip_bad_frames: bool,
    /// Authenticate each attachment payload while loading
    pub verify_attachments: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            skip_bad_frames: true,
            verify_attachments: true,
        }
    }
}

impl From<&BackupConfig> for LoadOptions {
    fn from(config: &BackupConfig) -> Self {
        Self {
            skip_bad_frames: config.skip_bad_frames,
            verify_attachments: config.verify_attachments,
        }
    }
}

/// Counters collected while loading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub frames: u64,
    pub statements: u64,
    pub skipped_statements: u64,
    pub failed_statements: u64,
    pub skipped_frames: u64,
    pub bad_payloads: u64,
}

pub struct SignalBackup<S: RelationalStore = SqliteStore> {
    pub(crate) store: S,
    pub(crate) header: Option<HeaderFrame>,
    pub(crate) database_version: Option<u32>,
    pub(crate) names: ColumnNames,
    pub(crate) attachments: BTreeMap<AttachmentKey, AttachmentFrame>,
    pub(crate) avatars: Vec<(String, AvatarFrame)>,
    pub(crate) stickers: BTreeMap<u64, StickerFrame>,
    pub(crate) shared_prefs: Vec<SharedPrefFrame>,
    pub(crate) key_values: Vec<KeyValueFrame>,
    pub(crate) bad_attachments: BTreeSet<AttachmentKey>,
    pub(crate) stats: LoadStats,
}

impl<S: RelationalStore> std::fmt::Debug for SignalBackup<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBackup")
            .field("database_version", &self.database_version)
            .field("attachments", &self.attachments.len())
            .field("avatars", &self.avatars.len())
            .field("stickers", &self.stickers.len())
            .field("shared_prefs", &self.shared_prefs.len())
            .field("key_values", &self.key_values.len())
            .field("bad_attachments", &self.bad_attachments.len())
            .finish()
    }
}

impl<S: RelationalStore> SignalBackup<S> {
    /// An empty session over `store`.
    pub fn new(store: S) -> Self {
        Self {
            store,
            header: None,
            database_version: None,
            names: ColumnNames::default(),
            attachments: BTreeMap::new(),
            avatars: Vec::new(),
            stickers: BTreeMap::new(),
            shared_prefs: Vec::new(),
            key_values: Vec::new(),
            bad_attachments: BTreeSet::new(),
            stats: LoadStats::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn header(&self) -> Option<&HeaderFrame> {
        self.header.as_ref()
    }

    pub fn database_version(&self) -> Option<u32> {
        self.database_version
    }

    pub fn set_database_version(&mut self, version: u32) {
        self.database_version = Some(version);
    }

    pub fn column_names(&self) -> &ColumnNames {
        &self.names
    }

    /// Re-detect table and column names after the schema changed.
    pub fn refresh_column_names(&mut self) -> SigbakResult<()> {
        self.names = ColumnNames::detect(&self.store)?;
        Ok(())
    }

    pub fn load_stats(&self) -> &LoadStats {
        &self.stats
    }

    pub fn attachments(&self) -> &BTreeMap<AttachmentKey, AttachmentFrame> {
        &self.attachments
    }

    pub fn attachment(&self, key: &AttachmentKey) -> Option<&AttachmentFrame> {
        self.attachments.get(key)
    }

    /// Add an attachment frame, keyed by its own row and attachment id.
    pub fn insert_attachment(&mut self, frame: AttachmentFrame) -> SigbakResult<AttachmentKey> {
        let key = attachment_key(&frame)?;
        self.attachments.insert(key, frame);
        Ok(key)
    }

    pub fn avatars(&self) -> &[(String, AvatarFrame)] {
        &self.avatars
    }

    pub fn insert_avatar(&mut self, frame: AvatarFrame) {
        let recipient = frame.recipient().unwrap_or_default().to_string();
        self.avatars.push((recipient, frame));
    }

    pub fn stickers(&self) -> &BTreeMap<u64, StickerFrame> {
        &self.stickers
    }

    pub fn insert_sticker(&mut self, frame: StickerFrame) -> SigbakResult<u64> {
        let row_id = frame.row_id.ok_or_else(|| {
            SigbakError::ParseFailure("sticker frame is missing its rowId".into())
        })?;
        self.stickers.insert(row_id, frame);
        Ok(row_id)
    }

    pub fn shared_preferences(&self) -> &[SharedPrefFrame] {
        &self.shared_prefs
    }

    pub fn key_values(&self) -> &[KeyValueFrame] {
        &self.key_values
    }

    /// Attachments whose payload failed authentication.
    pub fn bad_attachments(&self) -> &BTreeSet<AttachmentKey> {
        &self.bad_attachments
    }

    pub fn mark_bad_attachment(&mut self, key: AttachmentKey) {
        self.attachments.remove(&key);
        self.bad_attachments.insert(key);
    }

    /// Keys of `(rowid, unique id)` present in the part table.
    pub(crate) fn part_keys(&self) -> SigbakResult<HashSet<AttachmentKey>> {
        if !self.store.contains_table(self.names.part_table)? {
            return Ok(HashSet::new());
        }
        let results = self.store.query(
            &format!(
                "SELECT _id, {} AS unique_id FROM {}",
                self.names.part_unique_expr(),
                self.names.part_table
            ),
            &[],
        )?;
        Ok(results
            .rows()
            .filter_map(|row| match (row[0].as_i64(), row[1].as_i64()) {
                (Some(rowid), Some(unique)) => {
                    Some(AttachmentKey::new(rowid as u64, unique as u64))
                }
                _ => None,
            })
            .collect())
    }

    /// Payloads whose row is missing: attachments without a part row,
    /// stickers without a sticker row, avatars without a recipient row.
    ///
    /// Empty when every in-memory payload can be exported next to its row.
    /// Avatars are only checked once a `recipient` table exists; older
    /// schemas key them by phone number.
    pub fn check_attachment_invariant(&self) -> SigbakResult<OrphanedPayloads> {
        let rows = self.part_keys()?;
        let attachments = self
            .attachments
            .keys()
            .filter(|key| !rows.contains(key))
            .copied()
            .collect();

        let sticker_rows = self.row_ids("sticker")?;
        let stickers = self
            .stickers
            .keys()
            .filter(|row| !sticker_rows.contains(&(**row as i64)))
            .copied()
            .collect();

        let avatars = if self.store.contains_table("recipient")? {
            let recipients = self.row_ids("recipient")?;
            self.avatars
                .iter()
                .filter(|(recipient, _)| {
                    recipient
                        .parse::<i64>()
                        .is_ok_and(|id| !recipients.contains(&id))
                })
                .map(|(recipient, _)| recipient.clone())
                .collect()
        } else {
            Vec::new()
        };

        let orphans = OrphanedPayloads {
            attachments,
            stickers,
            avatars,
        };
        if !orphans.is_empty() {
            tracing::warn!(
                attachments = orphans.attachments.len(),
                stickers = orphans.stickers.len(),
                avatars = orphans.avatars.len(),
                "payloads without a row"
            );
        }
        Ok(orphans)
    }

    fn row_ids(&self, table: &str) -> SigbakResult<HashSet<i64>> {
        if !self.store.contains_table(table)? {
            return Ok(HashSet::new());
        }
        let results = self.store.query(&format!("SELECT _id FROM {table}"), &[])?;
        Ok(results.rows().filter_map(|row| row[0].as_i64()).collect())
    }

    /// Database version used to pick active links: the frame value when
    /// the backup carried one, otherwise inferred from the table names.
    pub(crate) fn schema_version(&self) -> u32 {
        self.database_version.unwrap_or(match (self.names.message_table, self.names.part_table) {
            ("message", "attachment") => 215,
            ("message", _) => 168,
            _ => 0,
        })
    }
}

pub(crate) fn attachment_key(frame: &AttachmentFrame) -> SigbakResult<AttachmentKey> {
    match (frame.row_id, frame.attachment_id) {
        (Some(row_id), Some(unique_id)) => Ok(AttachmentKey::new(row_id, unique_id)),
        _ => Err(SigbakError::ParseFailure(
            "attachment frame is missing rowId or attachmentId".into(),
        )),
    }
}
