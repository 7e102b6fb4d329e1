//! Property tests for id compaction over arbitrary id sets.

use std::collections::BTreeSet;

use proptest::prelude::*;
use sigbak_frames::{AttachmentFrame, Payload};
use sigbak_store::{RelationalStore, SignalBackup, SqliteStore};

/// Messages with the given ids, each with one part whose `_id` is drawn
/// from `part_ids` and whose payload is the message body.
fn backup(message_ids: &BTreeSet<i64>, part_ids: &BTreeSet<i64>) -> SignalBackup {
    let store = SqliteStore::in_memory().unwrap();
    store
        .exec("CREATE TABLE mms (_id INTEGER PRIMARY KEY, body TEXT)", &[])
        .unwrap();
    store
        .exec(
            "CREATE TABLE part (_id INTEGER PRIMARY KEY, mid INTEGER, unique_id INTEGER)",
            &[],
        )
        .unwrap();
    let mut backup = SignalBackup::new(store);
    backup.set_database_version(100);

    for (mid, pid) in message_ids.iter().zip(part_ids) {
        backup
            .store()
            .exec(
                "INSERT INTO mms VALUES (?, ?)",
                &[(*mid).into(), format!("m{mid}").into()],
            )
            .unwrap();
        backup
            .store()
            .exec(
                "INSERT INTO part VALUES (?, ?, ?)",
                &[(*pid).into(), (*mid).into(), (pid * 7).into()],
            )
            .unwrap();
        backup
            .insert_attachment(AttachmentFrame {
                row_id: Some(*pid as u64),
                attachment_id: Some((pid * 7) as u64),
                length: None,
                payload: Payload::Inline(format!("m{mid}").into_bytes()),
            })
            .unwrap();
    }
    backup.refresh_column_names().unwrap();
    backup
}

fn column(backup: &SignalBackup, sql: &str) -> Vec<i64> {
    backup
        .store()
        .query(sql, &[])
        .unwrap()
        .rows()
        .map(|r| r[0].as_i64().unwrap())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_compaction_keeps_rows_and_payloads_together(
        message_ids in prop::collection::btree_set(1i64..400, 1..25),
        part_ids in prop::collection::btree_set(1i64..400, 25),
    ) {
        let mut b = backup(&message_ids, &part_ids);
        b.compact_ids("mms").unwrap();
        b.compact_ids("part").unwrap();

        let min = *message_ids.iter().next().unwrap();
        let expected: Vec<i64> = (min..min + message_ids.len() as i64).collect();
        prop_assert_eq!(column(&b, "SELECT _id FROM mms ORDER BY _id"), expected);

        let part_min = *part_ids.iter().next().unwrap();
        let part_count = message_ids.len() as i64;
        prop_assert_eq!(
            column(&b, "SELECT _id FROM part ORDER BY _id"),
            (part_min..part_min + part_count).collect::<Vec<_>>()
        );

        prop_assert!(b.check_attachment_invariant().unwrap().is_empty());

        // Every part still points at its message and carries its payload.
        let rows = b
            .store()
            .query(
                "SELECT part._id, part.unique_id, mms.body FROM part JOIN mms ON mms._id = part.mid",
                &[],
            )
            .unwrap();
        prop_assert_eq!(rows.len(), message_ids.len());
        for row in rows.rows() {
            let key = sigbak_core::AttachmentKey::new(
                row[0].as_i64().unwrap() as u64,
                row[1].as_i64().unwrap() as u64,
            );
            let payload = b.attachment(&key).unwrap().payload.load().unwrap();
            prop_assert_eq!(payload, row[2].as_str().unwrap().as_bytes().to_vec());
        }
    }
}
