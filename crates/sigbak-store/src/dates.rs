//! Finding an unused `date_sent` for an inserted message
//!
//! Messages are deduplicated on (thread, sender, date sent), so an imported
//! message whose timestamp collides is nudged forward a millisecond at a
//! time.

use sigbak_core::SigbakResult;

use crate::backup::SignalBackup;
use crate::store::RelationalStore;

pub const MAX_DATE_PROBES: i64 = 1000;

impl<S: RelationalStore> SignalBackup<S> {
    /// Message tables with their date and sender columns; sms and mms named
    /// them differently.
    fn date_columns(&self) -> SigbakResult<Vec<(&'static str, &'static str, &'static str)>> {
        let mut tables = Vec::new();
        for table in self.names.message_tables() {
            if !self.store.contains_table(table)? {
                continue;
            }
            let date = if self.store.table_contains_column(table, self.names.message_date_sent)? {
                self.names.message_date_sent
            } else {
                "date_sent"
            };
            let recipient =
                if self.store.table_contains_column(table, self.names.message_recipient)? {
                    self.names.message_recipient
                } else {
                    "address"
                };
            tables.push((table, date, recipient));
        }
        Ok(tables)
    }

    /// First of `target, target + 1, ...` not yet used by a message from
    /// `from_recipient` in `thread_id`, or `None` after
    /// [`MAX_DATE_PROBES`] taken dates.
    pub fn get_free_date_for_message(
        &self,
        target: i64,
        thread_id: i64,
        from_recipient: i64,
    ) -> SigbakResult<Option<i64>> {
        let tables = self.date_columns()?;
        for step in 0..MAX_DATE_PROBES {
            let candidate = target + step;
            let mut taken = false;
            for (table, date, recipient) in &tables {
                let results = self.store.query(
                    &format!(
                        "SELECT 1 FROM {table} WHERE thread_id = ? AND {recipient} = ? AND {date} = ? LIMIT 1"
                    ),
                    &[thread_id.into(), from_recipient.into(), candidate.into()],
                )?;
                if !results.is_empty() {
                    taken = true;
                    break;
                }
            }
            if !taken {
                if step > 0 {
                    tracing::debug!(target, candidate, "moved message date");
                }
                return Ok(Some(candidate));
            }
        }
        tracing::warn!(target, thread_id, "no free date within {MAX_DATE_PROBES} ms");
        Ok(None)
    }

    /// Give every message that shares thread, sender and date sent with an
    /// older message the next free date. Returns the number of messages
    /// moved; one with no free date nearby is logged and left alone.
    pub fn separate_colliding_dates(&self) -> SigbakResult<usize> {
        let mut moved = 0;
        for (table, date, recipient) in self.date_columns()? {
            if !self.store.table_contains_column(table, "thread_id")? {
                continue;
            }
            let results = self.store.query(
                &format!(
                    "SELECT _id, thread_id, {recipient}, {date} FROM {table} AS m1 WHERE EXISTS \
                     (SELECT 1 FROM {table} AS m2 WHERE m2.thread_id = m1.thread_id \
                     AND m2.{recipient} = m1.{recipient} AND m2.{date} = m1.{date} AND m2._id < m1._id) \
                     ORDER BY _id"
                ),
                &[],
            )?;
            for row in results.rows() {
                let (Some(id), Some(thread_id), Some(sender), Some(sent)) =
                    (row[0].as_i64(), row[1].as_i64(), row[2].as_i64(), row[3].as_i64())
                else {
                    continue;
                };
                let Some(free) = self.get_free_date_for_message(sent, thread_id, sender)? else {
                    tracing::warn!(table, id, date = sent, "message date stays duplicated");
                    continue;
                };
                self.store.exec(
                    &format!("UPDATE {table} SET {date} = ? WHERE _id = ?"),
                    &[free.into(), id.into()],
                )?;
                moved += 1;
            }
        }
        if moved > 0 {
            tracing::info!(moved, "separated colliding message dates");
        }
        Ok(moved)
    }
}
