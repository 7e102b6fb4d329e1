//! Table and column names that moved between database versions

use sigbak_core::SigbakResult;

use crate::store::RelationalStore;

/// Names resolved against the loaded schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnNames {
    /// `message` (current) or `mms`
    pub message_table: &'static str,
    /// `sms` when the database still splits messages in two
    pub sms_table: Option<&'static str>,
    /// `attachment` (current) or `part`
    pub part_table: &'static str,
    /// `message_id` on `attachment`, `mid` on `part`
    pub part_message_id: &'static str,
    /// Absent on recent attachment tables; frames then carry unique id 0
    pub part_unique_id: Option<&'static str>,
    pub message_date_sent: &'static str,
    pub message_recipient: &'static str,
    pub message_type: &'static str,
    pub thread_recipient: &'static str,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            message_table: "message",
            sms_table: None,
            part_table: "attachment",
            part_message_id: "message_id",
            part_unique_id: None,
            message_date_sent: "date_sent",
            message_recipient: "from_recipient_id",
            message_type: "type",
            thread_recipient: "recipient_id",
        }
    }
}

fn first_present<S: RelationalStore + ?Sized>(
    store: &S,
    table: &str,
    candidates: &[&'static str],
) -> SigbakResult<Option<&'static str>> {
    for candidate in candidates {
        if store.table_contains_column(table, candidate)? {
            return Ok(Some(*candidate));
        }
    }
    Ok(None)
}

impl ColumnNames {
    /// Probe the store, falling back to current names for anything absent.
    pub fn detect<S: RelationalStore + ?Sized>(store: &S) -> SigbakResult<Self> {
        let defaults = Self::default();

        let message_table = if store.contains_table("message")? {
            "message"
        } else if store.contains_table("mms")? {
            "mms"
        } else {
            defaults.message_table
        };
        let sms_table = store.contains_table("sms")?.then_some("sms");

        let (part_table, part_message_id) = if store.contains_table("attachment")? {
            ("attachment", "message_id")
        } else if store.contains_table("part")? {
            ("part", "mid")
        } else {
            (defaults.part_table, defaults.part_message_id)
        };

        let names = Self {
            message_table,
            sms_table,
            part_table,
            part_message_id,
            part_unique_id: first_present(store, part_table, &["unique_id"])?,
            message_date_sent: first_present(store, message_table, &["date_sent", "date"])?
                .unwrap_or(defaults.message_date_sent),
            message_recipient: first_present(
                store,
                message_table,
                &["from_recipient_id", "recipient_id", "address"],
            )?
            .unwrap_or(defaults.message_recipient),
            message_type: first_present(store, message_table, &["type", "msg_box"])?
                .unwrap_or(defaults.message_type),
            thread_recipient: first_present(
                store,
                "thread",
                &["recipient_id", "thread_recipient_id", "recipient_ids"],
            )?
            .unwrap_or(defaults.thread_recipient),
        };
        tracing::debug!(?names, "detected column names");
        Ok(names)
    }

    /// SQL expression yielding a part row's unique id.
    pub fn part_unique_expr(&self) -> &'static str {
        self.part_unique_id.unwrap_or("0")
    }

    /// Tables that carry message rows, current schema first.
    pub fn message_tables(&self) -> Vec<&'static str> {
        let mut tables = vec![self.message_table];
        tables.extend(self.sms_table);
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[test]
    fn test_detect_current_schema() {
        let store = SqliteStore::in_memory().unwrap();
        for sql in [
            "CREATE TABLE message (_id INTEGER PRIMARY KEY, date_sent INTEGER, from_recipient_id INTEGER, type INTEGER)",
            "CREATE TABLE attachment (_id INTEGER PRIMARY KEY, message_id INTEGER)",
            "CREATE TABLE thread (_id INTEGER PRIMARY KEY, recipient_id INTEGER)",
        ] {
            store.exec(sql, &[]).unwrap();
        }
        let names = ColumnNames::detect(&store).unwrap();
        assert_eq!(names, ColumnNames::default());
        assert_eq!(names.message_tables(), ["message"]);
        assert_eq!(names.part_unique_expr(), "0");
    }

    #[test]
    fn test_detect_legacy_schema() {
        let store = SqliteStore::in_memory().unwrap();
        for sql in [
            "CREATE TABLE sms (_id INTEGER PRIMARY KEY, address INTEGER, date INTEGER, type INTEGER)",
            "CREATE TABLE mms (_id INTEGER PRIMARY KEY, address INTEGER, date INTEGER, msg_box INTEGER)",
            "CREATE TABLE part (_id INTEGER PRIMARY KEY, mid INTEGER, unique_id INTEGER)",
            "CREATE TABLE thread (_id INTEGER PRIMARY KEY, recipient_ids TEXT)",
        ] {
            store.exec(sql, &[]).unwrap();
        }
        let names = ColumnNames::detect(&store).unwrap();
        assert_eq!(names.message_table, "mms");
        assert_eq!(names.sms_table, Some("sms"));
        assert_eq!(names.part_table, "part");
        assert_eq!(names.part_message_id, "mid");
        assert_eq!(names.part_unique_expr(), "unique_id");
        assert_eq!(names.message_date_sent, "date");
        assert_eq!(names.message_recipient, "address");
        assert_eq!(names.message_type, "msg_box");
        assert_eq!(names.thread_recipient, "recipient_ids");
        assert_eq!(names.message_tables(), ["mms", "sms"]);
    }
}
