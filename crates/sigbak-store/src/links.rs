//! Static registry of id references between tables
//!
//! Each [`TableLink`] names a key column and every column elsewhere that
//! stores values of that key. Renumbering a key (compaction, offsets,
//! recipient remaps) must rewrite all of them.
//!
//! The message tables were renamed over time:
//!
//! ```text
//! db version   < 168        >= 168
//! messages     sms + mms    message
//! attachments  part (< 215) attachment (>= 215)
//! ```

/// Never renumber this table's ids.
pub const NO_COMPACT: u32 = 1 << 0;
/// The referencing column is UNIQUE: updates must not collide mid-statement.
pub const SET_UNIQUELY: u32 = 1 << 1;

/// Database versions `[min, max)` a link applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: u32,
    pub max: u32,
}

impl VersionRange {
    pub const ANY: VersionRange = VersionRange { min: 0, max: u32::MAX };

    pub const fn until(max: u32) -> Self {
        Self { min: 0, max }
    }

    pub const fn since(min: u32) -> Self {
        Self { min, max: u32::MAX }
    }

    pub fn contains(&self, version: u32) -> bool {
        (self.min..self.max).contains(&version)
    }
}

/// A column holding ids of some [`TableLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedColumn {
    pub table: &'static str,
    pub column: &'static str,
    /// Extra SQL predicate, e.g. `is_mms IS 1`
    pub condition: Option<&'static str>,
    pub flags: u32,
    pub versions: VersionRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLink {
    pub table: &'static str,
    pub column: &'static str,
    pub flags: u32,
    pub referenced_by: &'static [LinkedColumn],
}

impl TableLink {
    pub fn compactable(&self) -> bool {
        self.flags & NO_COMPACT == 0
    }

    /// References that exist at `version`.
    pub fn references_at(&self, version: u32) -> impl Iterator<Item = &'static LinkedColumn> {
        let refs: &'static [LinkedColumn] = self.referenced_by;
        refs.iter().filter(move |l| l.versions.contains(version))
    }
}

const fn link(table: &'static str, column: &'static str) -> LinkedColumn {
    LinkedColumn {
        table,
        column,
        condition: None,
        flags: 0,
        versions: VersionRange::ANY,
    }
}

const fn legacy(table: &'static str, column: &'static str) -> LinkedColumn {
    LinkedColumn {
        versions: VersionRange::until(168),
        ..link(table, column)
    }
}

const fn current(table: &'static str, column: &'static str) -> LinkedColumn {
    LinkedColumn {
        versions: VersionRange::since(168),
        ..link(table, column)
    }
}

const fn when(column: LinkedColumn, condition: &'static str) -> LinkedColumn {
    LinkedColumn {
        condition: Some(condition),
        ..column
    }
}

const fn table(
    table: &'static str,
    flags: u32,
    referenced_by: &'static [LinkedColumn],
) -> TableLink {
    TableLink {
        table,
        column: "_id",
        flags,
        referenced_by,
    }
}

const THREAD_REFS: &[LinkedColumn] = &[
    legacy("sms", "thread_id"),
    legacy("mms", "thread_id"),
    current("message", "thread_id"),
    link("drafts", "thread_id"),
    link("mention", "thread_id"),
];

const SMS_REFS: &[LinkedColumn] = &[
    when(legacy("msl_message", "message_id"), "is_mms IS NOT 1"),
    when(legacy("reaction", "message_id"), "is_mms IS NOT 1"),
];

const MMS_REFS: &[LinkedColumn] = &[
    legacy("part", "mid"),
    legacy("group_receipts", "mms_id"),
    legacy("mention", "message_id"),
    when(legacy("msl_message", "message_id"), "is_mms IS 1"),
    when(legacy("reaction", "message_id"), "is_mms IS 1"),
];

const MESSAGE_REFS: &[LinkedColumn] = &[
    LinkedColumn {
        versions: VersionRange { min: 168, max: 215 },
        ..link("part", "mid")
    },
    LinkedColumn {
        versions: VersionRange::since(215),
        ..link("attachment", "message_id")
    },
    current("group_receipts", "mms_id"),
    current("mention", "message_id"),
    current("msl_message", "message_id"),
    current("reaction", "message_id"),
    current("message", "original_message_id"),
    current("message", "latest_revision_id"),
];

const RECIPIENT_REFS: &[LinkedColumn] = &[
    legacy("sms", "address"),
    legacy("mms", "address"),
    legacy("mms", "quote_author"),
    current("message", "from_recipient_id"),
    current("message", "to_recipient_id"),
    current("message", "recipient_id"),
    current("message", "quote_author"),
    link("sessions", "address"),
    link("group_receipts", "address"),
    link("thread", "recipient_ids"),
    link("thread", "thread_recipient_id"),
    link("thread", "recipient_id"),
    link("groups", "recipient_id"),
    link("remapped_recipients", "old_id"),
    link("remapped_recipients", "new_id"),
    link("mention", "recipient_id"),
    link("msl_recipient", "recipient_id"),
    link("reaction", "author_id"),
    link("notification_profile_allowed_members", "recipient_id"),
    link("payments", "recipient"),
    LinkedColumn {
        flags: SET_UNIQUELY,
        ..link("identities", "address")
    },
];

const MSL_PAYLOAD_REFS: &[LinkedColumn] = &[
    link("msl_recipient", "payload_id"),
    link("msl_message", "payload_id"),
];

const NOTIFICATION_PROFILE_REFS: &[LinkedColumn] = &[
    link("notification_profile_allowed_members", "notification_profile_id"),
    link("notification_profile_schedule", "notification_profile_id"),
];

pub static TABLE_LINKS: &[TableLink] = &[
    table("thread", NO_COMPACT, THREAD_REFS),
    table("sms", 0, SMS_REFS),
    table("mms", 0, MMS_REFS),
    table("message", 0, MESSAGE_REFS),
    table("part", 0, &[]),
    table("attachment", 0, &[]),
    table("recipient", NO_COMPACT, RECIPIENT_REFS),
    table("groups", 0, &[]),
    table("identities", 0, &[]),
    table("group_receipts", 0, &[]),
    table("drafts", 0, &[]),
    table("sticker", 0, &[]),
    table("msl_payload", 0, MSL_PAYLOAD_REFS),
    table("msl_recipient", 0, &[]),
    table("msl_message", 0, &[]),
    table("mention", 0, &[]),
    table("reaction", 0, &[]),
    table("remapped_recipients", 0, &[]),
    table("remapped_threads", 0, &[]),
    table("notification_profile", 0, NOTIFICATION_PROFILE_REFS),
    table("notification_profile_allowed_members", 0, &[]),
    table("notification_profile_schedule", 0, &[]),
    table("payments", 0, &[]),
];

pub fn table_link(name: &str) -> Option<&'static TableLink> {
    TABLE_LINKS.iter().find(|l| l.table == name)
}
