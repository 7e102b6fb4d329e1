//! Writing a [`SignalBackup`] back out as an encrypted backup stream
//!
//! Frame order:
//!
//! ```text
//! DatabaseVersion
//! per table:  CREATE TABLE, INSERT per row (+ Attachment / Sticker frame)
//! CREATE INDEX ...
//! SharedPreference*  Avatar*  KeyValue*
//! End
//! ```

use std::io::Write;

use sigbak_core::{AttachmentKey, SigbakResult};
use sigbak_frames::{DatabaseVersionFrame, Frame, SqlParam, SqlStatementFrame};
use sigbak_stream::BackupWriter;

use crate::backup::SignalBackup;
use crate::ingest::is_fts_shadow;
use crate::store::{RelationalStore, SchemaObject};

/// Tables whose rows are never exported.
const SKIPPED_CONTENT: &[&str] = &["signed_prekeys", "one_time_prekeys", "sessions"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub tables: u64,
    pub rows: u64,
    pub attachments: u64,
    pub stickers: u64,
    pub missing_payloads: u64,
}

fn exports_rows(object: &SchemaObject) -> bool {
    object.kind == "table"
        && !object.name.starts_with("sqlite_")
        && !object.name.contains("_fts")
        && !SKIPPED_CONTENT.contains(&object.name.as_str())
}

/// `INSERT INTO table VALUES (?,?,...)` for one row.
pub fn insert_statement(table: &str, row: Vec<SqlParam>) -> SqlStatementFrame {
    let placeholders = vec!["?"; row.len()].join(",");
    SqlStatementFrame::new(format!("INSERT INTO {table} VALUES ({placeholders})"), row)
}

impl<S: RelationalStore> SignalBackup<S> {
    /// Emit every frame of this backup to `writer` and finish the stream.
    pub fn export<W: Write>(&self, mut writer: BackupWriter<W>) -> SigbakResult<(W, ExportStats)> {
        let mut stats = ExportStats::default();

        if let Some(version) = self.database_version {
            writer.write_frame(&Frame::DatabaseVersion(DatabaseVersionFrame {
                version: Some(version),
            }))?;
        }

        let schema = self.store.schema()?;
        for object in schema.iter().filter(|o| o.kind == "table") {
            let Some(sql) = &object.sql else { continue };
            if object.name.starts_with("sqlite_") || is_fts_shadow(&object.name) {
                continue;
            }
            writer.write_frame(&Frame::Statement(SqlStatementFrame::new(sql.clone(), vec![])))?;
            if exports_rows(object) {
                stats.tables += 1;
                self.export_rows(&mut writer, &object.name, &mut stats)?;
            }
        }

        for object in schema.iter().filter(|o| o.kind == "index") {
            if let Some(sql) = &object.sql {
                writer.write_frame(&Frame::Statement(SqlStatementFrame::new(sql.clone(), vec![])))?;
            }
        }

        for pref in &self.shared_prefs {
            writer.write_frame(&Frame::SharedPreference(pref.clone()))?;
        }
        for (_, avatar) in &self.avatars {
            writer.write_frame(&Frame::Avatar(avatar.clone()))?;
        }
        for kv in &self.key_values {
            writer.write_frame(&Frame::KeyValue(kv.clone()))?;
        }

        let inner = writer.finish()?;
        tracing::info!(
            tables = stats.tables,
            rows = stats.rows,
            attachments = stats.attachments,
            stickers = stats.stickers,
            missing = stats.missing_payloads,
            "exported backup"
        );
        Ok((inner, stats))
    }

    fn export_rows<W: Write>(
        &self,
        writer: &mut BackupWriter<W>,
        table: &str,
        stats: &mut ExportStats,
    ) -> SigbakResult<()> {
        let is_part = table == self.names.part_table;
        let is_sticker = table == "sticker";
        let unique_column = self.names.part_unique_id;

        let results = self.store.query(&format!("SELECT * FROM {table}"), &[])?;
        let id_idx = results.column_index("_id");
        let unique_idx = unique_column.and_then(|c| results.column_index(c));

        for row in results.rows() {
            let row_id = id_idx.and_then(|i| row[i].as_i64()).unwrap_or(0) as u64;
            let params = row.iter().cloned().map(SqlParam::from).collect();
            writer.write_frame(&Frame::Statement(insert_statement(table, params)))?;
            stats.rows += 1;

            if is_part {
                let unique_id = unique_idx.and_then(|i| row[i].as_i64()).unwrap_or(0) as u64;
                let key = AttachmentKey::new(row_id, unique_id);
                match self.attachments.get(&key) {
                    Some(frame) => {
                        writer.write_frame(&Frame::Attachment(frame.clone()))?;
                        stats.attachments += 1;
                    }
                    None => {
                        tracing::warn!(%key, "attachment data not found");
                        stats.missing_payloads += 1;
                    }
                }
            } else if is_sticker {
                match self.stickers.get(&row_id) {
                    Some(frame) => {
                        writer.write_frame(&Frame::Sticker(frame.clone()))?;
                        stats.stickers += 1;
                    }
                    None => {
                        tracing::warn!(row_id, "sticker data not found");
                        stats.missing_payloads += 1;
                    }
                }
            }
        }
        tracing::debug!(table, rows = results.len(), "exported table");
        Ok(())
    }
}
