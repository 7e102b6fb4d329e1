//! Dropping payloads and rows that no longer belong together

use sigbak_core::{SigbakError, SigbakResult};

use crate::backup::SignalBackup;
use crate::compact::and_condition;
use crate::links::table_link;
use crate::store::RelationalStore;

impl<S: RelationalStore> SignalBackup<S> {
    /// Remove attachment frames whose `(rowid, unique id)` has no part row.
    /// Returns the number of frames dropped.
    pub fn clean_attachments(&mut self) -> SigbakResult<usize> {
        let rows = self.part_keys()?;
        let before = self.attachments.len();
        self.attachments.retain(|key, _| rows.contains(key));
        let dropped = before - self.attachments.len();
        if dropped > 0 {
            tracing::info!(dropped, kept = self.attachments.len(), "removed unused attachments");
        }
        Ok(dropped)
    }

    /// Delete every part row of a message that lost an attachment to a bad
    /// frame. A message left with neither parts nor body goes too, along
    /// with the rows that reference it.
    ///
    /// A bad key without a part row is logged and skipped. Returns the
    /// number of part rows deleted.
    pub fn drop_bad_frames(&mut self) -> SigbakResult<usize> {
        if self.bad_attachments.is_empty() {
            return Ok(0);
        }
        let part = self.names.part_table;
        let mid = self.names.part_message_id;
        let unique = self.names.part_unique_expr();
        let message = self.names.message_table;
        let has_body = self.store.table_contains_column(message, "body")?;

        tracing::info!(count = self.bad_attachments.len(), "removing bad frames from database");
        let mut deleted = 0;
        for key in std::mem::take(&mut self.bad_attachments) {
            let results = self.store.query(
                &format!("SELECT {mid} FROM {part} WHERE _id = ? AND {unique} = ?"),
                &[(key.row_id as i64).into(), (key.unique_id as i64).into()],
            )?;
            let Some(message_id) = results.scalar_i64() else {
                let e = SigbakError::ConsistencyViolation(format!(
                    "no {part} row for bad attachment {key}"
                ));
                tracing::warn!(error = %e, "cannot drop bad frame");
                continue;
            };

            let removed = self.store.exec(
                &format!("DELETE FROM {part} WHERE {mid} = ?"),
                &[message_id.into()],
            )?;
            tracing::debug!(message_id, parts = removed, "removed parts of message with bad frame");
            deleted += removed;

            if has_body {
                let emptied = self.store.exec(
                    &format!("DELETE FROM {message} WHERE _id = ? AND (body IS NULL OR body = '')"),
                    &[message_id.into()],
                )?;
                if emptied > 0 {
                    tracing::debug!(message_id, "removed message left without content");
                    self.delete_message_references(message_id)?;
                }
            }
        }

        self.clean_attachments()?;
        Ok(deleted)
    }

    /// Delete rows pointing at a removed message. Revisions pointing at it
    /// through the message table itself are detached instead.
    fn delete_message_references(&self, message_id: i64) -> SigbakResult<usize> {
        let message = self.names.message_table;
        let Some(link) = table_link(message) else {
            return Ok(0);
        };
        let mut removed = 0;
        for column in link.references_at(self.schema_version()) {
            let (t, c) = (column.table, column.column);
            if !self.store.table_contains_column(t, c)? {
                continue;
            }
            let cond = and_condition(column);
            let n = if t == message {
                self.store.exec(
                    &format!("UPDATE {t} SET {c} = NULL WHERE {c} = ?{cond}"),
                    &[message_id.into()],
                )?
            } else {
                self.store.exec(
                    &format!("DELETE FROM {t} WHERE {c} = ?{cond}"),
                    &[message_id.into()],
                )?
            };
            if n > 0 {
                tracing::trace!(table = t, column = c, rows = n, "dropped reference to removed message");
                removed += n;
            }
        }
        Ok(removed)
    }
}
