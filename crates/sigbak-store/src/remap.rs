//! Recipient id rewrites inside text, blob and JSON columns
//!
//! Recipient ids live in plain integer columns (handled through the link
//! registry) and also embedded in values the registry cannot see:
//!
//! ```text
//! groups.members             "3,7,12"
//! message.reactions          ReactionList blob, author field
//! message.body (type 9)      "3,7|12"
//! thread.snippet_extras      {"individualRecipientId":"3"}
//! avatar frames              recipient string
//! ```

use sigbak_core::{IdRemap, SigbakResult};
use sigbak_frames::ReactionList;

use crate::backup::SignalBackup;
use crate::links::table_link;
use crate::store::{RelationalStore, SqlValue};

/// Message type of a group v1 → v2 migration notice.
pub const GV1_MIGRATION_TYPE: i64 = 9;

const GROUP_MEMBER_COLUMNS: &[&str] = &["members", "former_v1_members"];

/// Apply `remap` to each comma-separated id; non-numeric entries are kept.
pub fn remap_id_list(list: &str, remap: IdRemap) -> SigbakResult<String> {
    let items = list
        .split(',')
        .map(|item| match item.trim().parse::<i64>() {
            Ok(id) => remap.apply(id).map(|id| id.to_string()),
            Err(_) => Ok(item.to_string()),
        })
        .collect::<SigbakResult<Vec<_>>>()?;
    Ok(items.join(","))
}

/// Apply `remap` to every run of ASCII digits in `text`.
pub fn remap_digit_runs(text: &str, remap: IdRemap) -> SigbakResult<String> {
    let flush = |digits: &mut String, out: &mut String| -> SigbakResult<()> {
        if digits.is_empty() {
            return Ok(());
        }
        match digits.parse::<i64>() {
            Ok(id) => out.push_str(&remap.apply(id)?.to_string()),
            Err(_) => out.push_str(digits),
        }
        digits.clear();
        Ok(())
    };
    let mut out = String::with_capacity(text.len());
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            flush(&mut digits, &mut out)?;
            out.push(c);
        }
    }
    flush(&mut digits, &mut out)?;
    Ok(out)
}

impl<S: RelationalStore> SignalBackup<S> {
    /// Rewrite `groups.members` and `groups.former_v1_members`.
    pub fn update_group_members(&self, remap: IdRemap) -> SigbakResult<usize> {
        let mut changed = 0;
        for column in GROUP_MEMBER_COLUMNS {
            if !self.store.table_contains_column("groups", column)? {
                continue;
            }
            let results = self.store.query(
                &format!("SELECT _id, {column} FROM groups WHERE {column} IS NOT NULL"),
                &[],
            )?;
            for row in results.rows() {
                let (Some(id), Some(members)) = (row[0].as_i64(), row[1].as_str()) else {
                    continue;
                };
                let updated = remap_id_list(members, remap)?;
                if updated != members {
                    self.store.exec(
                        &format!("UPDATE groups SET {column} = ? WHERE _id = ?"),
                        &[updated.clone().into(), id.into()],
                    )?;
                    tracing::trace!(group = id, column, from = members, to = %updated, "updated members");
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            tracing::debug!(changed, "updated group members");
        }
        Ok(changed)
    }

    /// Rewrite the author of every reaction stored in message `reactions`
    /// blobs. Undecodable blobs are logged and left alone.
    pub fn update_reaction_authors(&self, remap: IdRemap) -> SigbakResult<usize> {
        let mut changed = 0;
        for table in self.names.message_tables() {
            if !self.store.table_contains_column(table, "reactions")? {
                continue;
            }
            let results = self.store.query(
                &format!("SELECT _id, reactions FROM {table} WHERE reactions IS NOT NULL"),
                &[],
            )?;
            for row in results.rows() {
                let (Some(id), Some(blob)) = (row[0].as_i64(), row[1].as_blob()) else {
                    continue;
                };
                let mut list = match ReactionList::decode(blob) {
                    Ok(list) => list,
                    Err(e) => {
                        tracing::warn!(table, id, error = %e, "cannot decode reactions");
                        continue;
                    }
                };
                let mut touched = false;
                for idx in 0..list.len() {
                    let Some(author) = list.author(idx) else { continue };
                    let new = remap.apply(author as i64)?;
                    if new != author as i64 {
                        list.set_author(idx, new as u64);
                        touched = true;
                    }
                }
                if touched {
                    self.store.exec(
                        &format!("UPDATE {table} SET reactions = ? WHERE _id = ?"),
                        &[SqlValue::Blob(list.encode()), id.into()],
                    )?;
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            tracing::debug!(changed, "updated reaction authors");
        }
        Ok(changed)
    }

    /// Rewrite the recipient of in-memory avatar frames.
    pub fn update_avatars(&mut self, remap: IdRemap) -> SigbakResult<usize> {
        let mut changed = 0;
        for (recipient, frame) in &mut self.avatars {
            let Ok(id) = recipient.parse::<i64>() else {
                continue;
            };
            if !remap.affects(id) {
                continue;
            }
            let new = remap.apply(id)?.to_string();
            frame.recipient_id = Some(new.clone());
            *recipient = new;
            changed += 1;
        }
        if changed > 0 {
            tracing::debug!(changed, "updated avatar recipients");
        }
        Ok(changed)
    }

    /// Rewrite the id lists in the body of group v1 migration messages.
    pub fn update_gv1_migration_message(&self, remap: IdRemap) -> SigbakResult<usize> {
        let table = self.names.sms_table.unwrap_or(self.names.message_table);
        let type_column = if self.store.table_contains_column(table, "type")? {
            "type"
        } else if self.store.table_contains_column(table, self.names.message_type)? {
            self.names.message_type
        } else {
            return Ok(0);
        };
        if !self.store.table_contains_column(table, "body")? {
            return Ok(0);
        }

        let results = self.store.query(
            &format!("SELECT _id, body FROM {table} WHERE {type_column} = ? AND body IS NOT NULL"),
            &[GV1_MIGRATION_TYPE.into()],
        )?;
        let mut changed = 0;
        for row in results.rows() {
            let (Some(id), Some(body)) = (row[0].as_i64(), row[1].as_str()) else {
                continue;
            };
            let updated = remap_digit_runs(body, remap)?;
            if updated != body {
                self.store.exec(
                    &format!("UPDATE {table} SET body = ? WHERE _id = ?"),
                    &[updated.into(), id.into()],
                )?;
                changed += 1;
            }
        }
        if changed > 0 {
            tracing::debug!(table, changed, "updated gv1 migration bodies");
        }
        Ok(changed)
    }

    /// Rewrite `individualRecipientId` inside `thread.snippet_extras`.
    pub fn update_snippet_extras_recipient(&self, remap: IdRemap) -> SigbakResult<usize> {
        if !self.store.table_contains_column("thread", "snippet_extras")? {
            return Ok(0);
        }
        const PATH: &str = "'$.individualRecipientId'";
        let changed = match remap {
            IdRemap::Offset(offset) => self.store.exec(
                &format!(
                    "UPDATE thread SET snippet_extras = json_set(snippet_extras, {PATH}, \
                     CAST(json_extract(snippet_extras, {PATH}) + ? AS text)) \
                     WHERE CASE WHEN json_valid(snippet_extras) \
                     THEN json_extract(snippet_extras, {PATH}) IS NOT NULL ELSE 0 END"
                ),
                &[offset.into()],
            )?,
            IdRemap::Replace { from, to } => self.store.exec(
                &format!(
                    "UPDATE thread SET snippet_extras = json_set(snippet_extras, {PATH}, CAST(? AS text)) \
                     WHERE CASE WHEN json_valid(snippet_extras) \
                     THEN json_extract(snippet_extras, {PATH}) = CAST(? AS text) ELSE 0 END"
                ),
                &[to.into(), from.into()],
            )?,
        };
        if changed > 0 {
            tracing::debug!(changed, "updated snippet extras");
        }
        Ok(changed)
    }

    /// Apply `remap` to every place a recipient id can appear.
    pub fn remap_recipient(&mut self, remap: IdRemap) -> SigbakResult<usize> {
        let mut changed = match table_link("recipient") {
            Some(link) => self.update_references(link, remap)?,
            None => 0,
        };
        changed += self.update_group_members(remap)?;
        changed += self.update_reaction_authors(remap)?;
        changed += self.update_avatars(remap)?;
        changed += self.update_gv1_migration_message(remap)?;
        changed += self.update_snippet_extras_recipient(remap)?;
        tracing::info!(?remap, changed, "remapped recipient ids");
        Ok(changed)
    }
}
