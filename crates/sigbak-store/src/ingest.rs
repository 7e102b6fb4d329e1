//! Loading a backup stream into a [`SignalBackup`]

use std::io::{Read, Seek};

use sigbak_core::{SessionState, SigbakResult};
use sigbak_frames::{Frame, SqlStatementFrame};
use sigbak_stream::BackupReader;

use crate::backup::{attachment_key, LoadOptions, SignalBackup};
use crate::store::{RelationalStore, SqlValue};

/// Shadow tables of the full-text indexes; SQLite creates them itself.
pub(crate) fn is_fts_shadow(table: &str) -> bool {
    table.contains("_fts_")
}

impl<S: RelationalStore> SignalBackup<S> {
    /// Read every frame of `reader` into `store`.
    ///
    /// Frame-local failures (bad MAC, undecodable frame) are skipped when
    /// `options.skip_bad_frames` is set; a corrupt stream always aborts.
    /// Attachments whose payload cannot be authenticated end up in
    /// [`SignalBackup::bad_attachments`].
    pub fn load<R: Read + Seek>(
        store: S,
        reader: &mut BackupReader<R>,
        options: &LoadOptions,
    ) -> SigbakResult<Self> {
        let mut backup = Self::new(store);
        backup.header = Some(reader.header().clone());

        loop {
            let frame = match reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e)
                    if e.is_frame_local()
                        && options.skip_bad_frames
                        && reader.state() != SessionState::Corrupt =>
                {
                    tracing::warn!(error = %e, offset = reader.offset(), "skipping frame");
                    backup.stats.skipped_frames += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            backup.stats.frames += 1;
            if !backup.ingest_frame(frame, options)? {
                break;
            }
        }

        for bad in reader.bad_frames() {
            if let Frame::Attachment(frame) = &bad.frame {
                if let Ok(key) = attachment_key(frame) {
                    tracing::warn!(%key, reason = %bad.reason, "attachment frame failed authentication");
                    backup.mark_bad_attachment(key);
                }
            }
        }

        backup.refresh_column_names()?;
        tracing::info!(
            frames = backup.stats.frames,
            statements = backup.stats.statements,
            attachments = backup.attachments.len(),
            bad_attachments = backup.bad_attachments.len(),
            "loaded backup"
        );
        Ok(backup)
    }

    /// Returns false once the End frame is reached.
    fn ingest_frame(&mut self, frame: Frame, options: &LoadOptions) -> SigbakResult<bool> {
        match frame {
            Frame::End => return Ok(false),
            Frame::Header(_) => tracing::warn!("ignoring header frame inside the stream"),
            Frame::Statement(statement) => self.ingest_statement(&statement, options)?,
            Frame::DatabaseVersion(frame) => {
                if let Some(version) = frame.version {
                    self.store
                        .exec(&format!("PRAGMA user_version = {version}"), &[])?;
                    self.database_version = Some(version);
                    tracing::debug!(version, "database version");
                }
            }
            Frame::SharedPreference(pref) => self.shared_prefs.push(pref),
            Frame::KeyValue(kv) => self.key_values.push(kv),
            Frame::Attachment(frame) => {
                let key = attachment_key(&frame)?;
                if options.verify_attachments {
                    if let Err(e) = frame.payload.load() {
                        tracing::warn!(%key, error = %e, "attachment payload is unreadable");
                        self.stats.bad_payloads += 1;
                        self.mark_bad_attachment(key);
                        return Ok(true);
                    }
                }
                self.attachments.insert(key, frame);
            }
            Frame::Avatar(frame) => {
                if options.verify_attachments {
                    if let Err(e) = frame.payload.load() {
                        tracing::warn!(recipient = ?frame.recipient(), error = %e, "dropping unreadable avatar");
                        self.stats.bad_payloads += 1;
                        return Ok(true);
                    }
                }
                self.insert_avatar(frame);
            }
            Frame::Sticker(frame) => {
                if options.verify_attachments {
                    if let Err(e) = frame.payload.load() {
                        tracing::warn!(row_id = ?frame.row_id, error = %e, "dropping unreadable sticker");
                        self.stats.bad_payloads += 1;
                        return Ok(true);
                    }
                }
                self.insert_sticker(frame)?;
            }
            Frame::Unknown { field, .. } => {
                tracing::warn!(field, "ignoring frame of unknown type");
            }
        }
        Ok(true)
    }

    fn ingest_statement(
        &mut self,
        statement: &SqlStatementFrame,
        options: &LoadOptions,
    ) -> SigbakResult<()> {
        if statement.creates_internal_table()
            || statement.table_name().is_some_and(is_fts_shadow)
        {
            tracing::trace!(sql = %statement.statement, "skipping statement");
            self.stats.skipped_statements += 1;
            return Ok(());
        }

        let params: Vec<SqlValue> = statement.parameters.iter().map(SqlValue::from).collect();
        match self.store.exec(&statement.statement, &params) {
            Ok(_) => self.stats.statements += 1,
            Err(e) if options.skip_bad_frames => {
                tracing::warn!(error = %e, sql = %statement.statement, "statement failed");
                self.stats.failed_statements += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}
