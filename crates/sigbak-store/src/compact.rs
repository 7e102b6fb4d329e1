//! Renumbering table ids while keeping every reference intact

use std::collections::{BTreeMap, BTreeSet};

use sigbak_core::{AttachmentKey, IdRemap, SigbakError, SigbakResult};

use crate::backup::SignalBackup;
use crate::links::{table_link, LinkedColumn, TableLink, SET_UNIQUELY};
use crate::store::{RelationalStore, SqlValue};

const GAP_QUERY: &str = "SELECT t1._id + 1 FROM {t} t1 LEFT OUTER JOIN {t} t2 ON t2._id = t1._id + 1 \
                         WHERE t2._id IS NULL AND t1._id > 0 ORDER BY t1._id LIMIT 1";

pub(crate) fn and_condition(link: &LinkedColumn) -> String {
    link.condition
        .map(|c| format!(" AND ({c})"))
        .unwrap_or_default()
}

impl<S: RelationalStore> SignalBackup<S> {
    /// Close every gap in `table._id` above its smallest id by moving the
    /// next used id down, mirroring each move into all referencing columns
    /// and the in-memory payload maps. Returns the number of ids moved.
    pub fn compact_ids(&mut self, table: &str) -> SigbakResult<u64> {
        let link = table_link(table);
        if let Some(link) = link {
            if !link.compactable() {
                return Err(SigbakError::ConsistencyViolation(format!(
                    "ids of table {table} must not be compacted"
                )));
            }
        } else {
            tracing::debug!(table, "table has no registered links");
        }
        if !self.store.contains_table(table)? {
            return Ok(0);
        }

        let gap_query = GAP_QUERY.replace("{t}", table);
        let next_query = format!("SELECT MIN(_id) FROM {table} WHERE _id > ?");
        let update = format!("UPDATE {table} SET _id = ? WHERE _id = ?");

        let mut moved = 0u64;
        while let Some(free) = self.store.query(&gap_query, &[])?.scalar_i64() {
            let Some(used) = self.store.query(&next_query, &[free.into()])?.scalar_i64() else {
                break;
            };
            self.store.exec(&update, &[free.into(), used.into()])?;

            let remap = IdRemap::Replace { from: used, to: free };
            if let Some(link) = link {
                self.update_references(link, remap)?;
            }
            self.rekey_payloads(table, remap)?;
            moved += 1;
            tracing::trace!(table, from = used, to = free, "moved id");
        }

        tracing::debug!(table, moved, "compacted ids");
        Ok(moved)
    }

    /// Add `offset` to every id of `table` and to every reference to it.
    ///
    /// Used before merging two backups so their ids cannot collide.
    pub fn offset_ids(&mut self, table: &str, offset: i64) -> SigbakResult<()> {
        if offset == 0 || !self.store.contains_table(table)? {
            return Ok(());
        }
        let bounds = self
            .store
            .query(&format!("SELECT MIN(_id), MAX(_id) FROM {table}"), &[])?;
        if let Some(row) = bounds.row(0) {
            for id in row.iter().filter_map(|v| v.as_i64()) {
                IdRemap::Offset(offset).apply(id)?;
            }
        }
        // Negate first so the shifted ids never meet the unshifted ones.
        self.store.exec(
            &format!("UPDATE {table} SET _id = -(_id + ?)"),
            &[offset.into()],
        )?;
        self.store
            .exec(&format!("UPDATE {table} SET _id = -_id WHERE _id < 0"), &[])?;

        let remap = IdRemap::Offset(offset);
        if table == "recipient" {
            self.remap_recipient(remap)?;
        } else if let Some(link) = table_link(table) {
            self.update_references(link, remap)?;
        }
        self.rekey_payloads(table, remap)?;
        tracing::debug!(table, offset, "offset ids");
        Ok(())
    }

    /// Rewrite every column referencing `link` that exists in this schema.
    /// Returns the number of rows changed.
    pub(crate) fn update_references(
        &self,
        link: &TableLink,
        remap: IdRemap,
    ) -> SigbakResult<usize> {
        let version = self.schema_version();
        let mut changed = 0;
        for column in link.references_at(version) {
            if !self.store.table_contains_column(column.table, column.column)? {
                continue;
            }
            changed += self.update_column(column, remap)?;
        }
        Ok(changed)
    }

    fn update_column(&self, link: &LinkedColumn, remap: IdRemap) -> SigbakResult<usize> {
        let (t, c) = (link.table, link.column);
        let cond = and_condition(link);
        let unique = link.flags & SET_UNIQUELY != 0;

        let changed = match remap {
            IdRemap::Offset(offset) if unique => {
                let n = self.store.exec(
                    &format!(
                        "UPDATE {t} SET {c} = -({c} + ?) WHERE typeof({c}) = 'integer' AND {c} >= 0{cond}"
                    ),
                    &[offset.into()],
                )?;
                self.store.exec(
                    &format!("UPDATE {t} SET {c} = -{c} WHERE typeof({c}) = 'integer' AND {c} < 0{cond}"),
                    &[],
                )?;
                n
            }
            IdRemap::Offset(offset) => self.store.exec(
                &format!("UPDATE {t} SET {c} = {c} + ? WHERE typeof({c}) = 'integer'{cond}"),
                &[offset.into()],
            )?,
            IdRemap::Replace { from, to } if unique => {
                let n = self.store.exec(
                    &format!("UPDATE OR IGNORE {t} SET {c} = ? WHERE {c} = ?{cond}"),
                    &[to.into(), from.into()],
                )?;
                let dropped = self.store.exec(
                    &format!("DELETE FROM {t} WHERE {c} = ?{cond}"),
                    &[SqlValue::Integer(from)],
                )?;
                if dropped > 0 {
                    tracing::warn!(table = t, column = c, from, to, dropped, "dropped rows that would duplicate a unique value");
                }
                n
            }
            IdRemap::Replace { from, to } => self.store.exec(
                &format!("UPDATE {t} SET {c} = ? WHERE {c} = ?{cond}"),
                &[to.into(), from.into()],
            )?,
        };
        if changed > 0 {
            tracing::trace!(table = t, column = c, changed, "updated references");
        }
        Ok(changed)
    }

    /// Keep payload map keys in step with renumbered part or sticker rows.
    ///
    /// Every new key is computed before any map is touched, so a failed
    /// remap leaves the payloads as they were.
    fn rekey_payloads(&mut self, table: &str, remap: IdRemap) -> SigbakResult<()> {
        let remap_row = |row: u64| -> SigbakResult<u64> {
            let id = i64::try_from(row).map_err(|_| {
                SigbakError::ConsistencyViolation(format!("row id {row} does not fit an i64"))
            })?;
            let new = remap.apply(id)?;
            u64::try_from(new).map_err(|_| {
                SigbakError::ConsistencyViolation(format!("row id {row} remaps to negative {new}"))
            })
        };

        if table == self.names.part_table || table == "part" || table == "attachment" {
            let attachments = self
                .attachments
                .keys()
                .map(|key| Ok((*key, remap_row(key.row_id)?)))
                .collect::<SigbakResult<Vec<_>>>()?;
            let bad = self
                .bad_attachments
                .iter()
                .map(|key| Ok(AttachmentKey::new(remap_row(key.row_id)?, key.unique_id)))
                .collect::<SigbakResult<BTreeSet<_>>>()?;

            let mut old = std::mem::take(&mut self.attachments);
            for (key, row_id) in attachments {
                if let Some(mut frame) = old.remove(&key) {
                    frame.row_id = Some(row_id);
                    self.attachments
                        .insert(AttachmentKey::new(row_id, key.unique_id), frame);
                }
            }
            self.bad_attachments = bad;
        } else if table == "sticker" {
            let rows = self
                .stickers
                .keys()
                .map(|row| Ok((*row, remap_row(*row)?)))
                .collect::<SigbakResult<Vec<_>>>()?;
            let mut old = std::mem::take(&mut self.stickers);
            self.stickers = rows
                .into_iter()
                .filter_map(|(row, row_id)| {
                    let mut frame = old.remove(&row)?;
                    frame.row_id = Some(row_id);
                    Some((row_id, frame))
                })
                .collect::<BTreeMap<_, _>>();
        }
        Ok(())
    }
}
