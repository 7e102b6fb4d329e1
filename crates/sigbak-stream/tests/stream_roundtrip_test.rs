//! Write backups with `BackupWriter`, read them back with `BackupReader`.

use std::io::Cursor;
use std::sync::Arc;

use secrecy::SecretString;
use sigbak_core::{SessionState, SigbakError};
use sigbak_crypto::{derive_backup_key, derive_cipher_material, BackupKdfParams, FrameCodec};
use sigbak_frames::{
    AttachmentFrame, AvatarFrame, DatabaseVersionFrame, Frame, Payload, SqlParam,
    SqlStatementFrame,
};
use sigbak_stream::{BackupReader, BackupWriter, ReaderOptions};

const PASS: &str = "000001 111112 222223 333334 444445";
const IV: [u8; 16] = [0, 0, 0, 7, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9];

fn params() -> BackupKdfParams {
    BackupKdfParams { rounds: 8 }
}

fn pass() -> SecretString {
    SecretString::from(PASS)
}

fn statements() -> Vec<SqlStatementFrame> {
    vec![
        SqlStatementFrame::new("CREATE TABLE sms (_id INTEGER PRIMARY KEY, body TEXT)", vec![]),
        SqlStatementFrame::new(
            "INSERT INTO sms VALUES (?,?)",
            vec![SqlParam::Integer(1), SqlParam::Text("hello".into())],
        ),
    ]
}

fn write_backup(version: u32, frames: &[Frame]) -> Vec<u8> {
    let mut writer =
        BackupWriter::create(Vec::new(), &pass(), &[0x5A; 32], IV, version, &params()).unwrap();
    for frame in frames {
        writer.write_frame(frame).unwrap();
    }
    writer.finish().unwrap()
}

fn open(bytes: Vec<u8>) -> BackupReader<Cursor<Vec<u8>>> {
    BackupReader::from_reader(Cursor::new(bytes), &pass(), &params(), ReaderOptions::default())
        .unwrap()
}

fn attachment(row_id: u64, unique_id: u64, data: &[u8]) -> Frame {
    Frame::Attachment(AttachmentFrame {
        row_id: Some(row_id),
        attachment_id: Some(unique_id),
        length: Some(data.len() as u32),
        payload: Payload::Inline(data.to_vec()),
    })
}

#[test]
fn test_header_two_statements_end() {
    for version in [0, 1] {
        let frames: Vec<Frame> = statements().into_iter().map(Frame::Statement).collect();
        let bytes = write_backup(version, &frames);

        let mut reader = open(bytes);
        assert_eq!(reader.state(), SessionState::StreamOpen);
        assert_eq!(reader.format_version(), version);

        let mut decoded = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            match frame {
                Frame::Statement(s) => decoded.push(s),
                Frame::End => {}
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(decoded, statements(), "version {version} statements must round-trip");
        assert_eq!(reader.state(), SessionState::End);
        assert_eq!(reader.remaining_bytes(), 0, "no trailing bytes after End");
        assert!(reader.next_frame().unwrap().is_none());
    }
}

#[test]
fn test_attachment_payloads_are_deferred() {
    let frames = vec![
        Frame::DatabaseVersion(DatabaseVersionFrame { version: Some(200) }),
        attachment(1, 1000, b"first attachment"),
        Frame::Avatar(AvatarFrame {
            recipient_id: Some("3".into()),
            length: Some(6),
            payload: Payload::Inline(b"avatar".to_vec()),
            ..Default::default()
        }),
        attachment(2, 2000, &[0xEE; 70_000]),
    ];
    let bytes = write_backup(1, &frames);

    let read: Vec<Frame> = open(bytes).collect::<Result<_, _>>().unwrap();
    assert_eq!(read.len(), 5);
    assert!(matches!(read[4], Frame::End));

    match read[1].payload() {
        Some(Payload::Deferred(source)) => assert_eq!(source.len(), 16),
        other => panic!("expected deferred payload, got {other:?}"),
    }
    assert_eq!(read[1].payload().unwrap().load().unwrap(), b"first attachment");
    assert_eq!(read[2].payload().unwrap().load().unwrap(), b"avatar");
    assert_eq!(read[3].payload().unwrap().load().unwrap(), vec![0xEE; 70_000]);
}

#[test]
fn test_file_backed_reader() {
    let bytes = write_backup(1, &[attachment(4, 44, b"on disk")]);
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), &bytes).unwrap();

    let mut reader =
        BackupReader::open(file.path(), &pass(), &params(), ReaderOptions::default()).unwrap();
    let frame = reader.next_frame().unwrap().unwrap();
    assert_eq!(frame.payload().unwrap().load().unwrap(), b"on disk");
    assert!(matches!(reader.next_frame().unwrap(), Some(Frame::End)));
}

#[test]
fn test_offset_tracks_frames_through_mut_reference() {
    fn offsets<R: std::io::Read + std::io::Seek>(reader: &mut BackupReader<R>) -> Vec<u64> {
        let mut seen = vec![reader.offset()];
        while let Some(frame) = reader.next_frame().unwrap() {
            seen.push(reader.offset());
            if matches!(frame, Frame::End) {
                break;
            }
        }
        seen
    }

    let bytes = write_backup(1, &[attachment(1, 10, b"payload")]);
    let total = bytes.len() as u64;
    let mut reader = open(bytes);
    let seen = offsets(&mut reader);
    assert_eq!(seen.len(), 3, "header, attachment and End");
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "offset only moves forward");
    assert_eq!(*seen.last().unwrap(), total);
}

#[test]
fn test_wrong_passphrase_fails_first_frame() {
    let bytes = write_backup(1, &[Frame::Statement(statements().remove(0))]);
    let mut reader = BackupReader::from_reader(
        Cursor::new(bytes),
        &SecretString::from("999999999999999999999999999999"),
        &params(),
        ReaderOptions::default(),
    )
    .unwrap();
    // With the wrong key the encrypted length decodes to garbage.
    assert!(!matches!(reader.next_frame(), Ok(Some(_))));
}

#[test]
fn test_bad_frame_mac_is_skipped() {
    let frames: Vec<Frame> = statements().into_iter().map(Frame::Statement).collect();
    let mut bytes = write_backup(0, &frames);

    // Corrupt the last ciphertext byte of the first statement (version 0:
    // clear length, so the frame boundary is known).
    let header_len = 4 + u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
    let first_len = u32::from_be_bytes(bytes[header_len..header_len + 4].try_into().unwrap()) as usize;
    bytes[header_len + 4 + first_len - 11] ^= 0x80;

    let mut reader = open(bytes);
    assert!(matches!(
        reader.next_frame(),
        Err(SigbakError::AuthenticationFailure(_))
    ));
    match reader.next_frame().unwrap() {
        Some(Frame::Statement(s)) => assert_eq!(s, statements()[1]),
        other => panic!("reader must continue after a bad frame, got {other:?}"),
    }
    assert!(matches!(reader.next_frame().unwrap(), Some(Frame::End)));
}

#[test]
fn test_bad_attachment_frame_recorded_and_payload_skipped() {
    let frames = vec![
        attachment(1, 10, b"payload one"),
        attachment(2, 20, b"payload two"),
    ];
    let mut bytes = write_backup(0, &frames);

    let header_len = 4 + u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
    let first_len = u32::from_be_bytes(bytes[header_len..header_len + 4].try_into().unwrap()) as usize;
    // Flip a MAC bit: the frame still decrypts and parses.
    bytes[header_len + 4 + first_len - 1] ^= 0x01;

    let mut reader = open(bytes);
    assert!(reader.next_frame().is_err());
    assert_eq!(reader.bad_frames().len(), 1);
    assert!(matches!(
        &reader.bad_frames()[0].frame,
        Frame::Attachment(AttachmentFrame { row_id: Some(1), attachment_id: Some(10), .. })
    ));

    let second = reader.next_frame().unwrap().unwrap();
    assert_eq!(second.payload().unwrap().load().unwrap(), b"payload two");
}

#[test]
fn test_invalid_payload_frame_skips_its_payload() {
    // The writer refuses frames without an attachmentId, so seal the stream by hand.
    let empty = write_backup(1, &[]);
    let header_len = 4 + u32::from_be_bytes(empty[..4].try_into().unwrap()) as usize;
    let key = derive_backup_key(&pass(), &[0x5A; 32], &params()).unwrap();
    let mut codec = FrameCodec::new(Arc::new(derive_cipher_material(&key).unwrap()), IV, 1);

    let invalid = Frame::Attachment(AttachmentFrame {
        row_id: Some(1),
        attachment_id: None,
        length: Some(6),
        payload: Payload::Inline(b"orphan".to_vec()),
    });
    let mut bytes = empty[..header_len].to_vec();
    bytes.extend(codec.encrypt_frame(&invalid.encode()).unwrap());
    bytes.extend(codec.encrypt_attachment(b"orphan").unwrap());
    bytes.extend(codec.encrypt_frame(&attachment(2, 20, b"second").encode()).unwrap());
    bytes.extend(codec.encrypt_attachment(b"second").unwrap());
    bytes.extend(codec.encrypt_frame(&Frame::End.encode()).unwrap());

    let mut reader = open(bytes);
    assert!(matches!(reader.next_frame(), Err(SigbakError::ParseFailure(_))));
    assert_eq!(reader.bad_frames().len(), 1, "the invalid frame is kept for pruning");

    let second = reader.next_frame().unwrap().unwrap();
    assert_eq!(
        second.payload().unwrap().load().unwrap(),
        b"second",
        "payload bytes and counter of the invalid frame must be skipped"
    );
    assert!(matches!(reader.next_frame().unwrap(), Some(Frame::End)));
}

#[test]
fn test_truncated_backup_ends_cleanly() {
    let frames: Vec<Frame> = statements().into_iter().map(Frame::Statement).collect();
    let mut bytes = write_backup(1, &frames);
    // Drop the End frame and half of the last statement.
    bytes.truncate(bytes.len() - 30);

    let mut reader = open(bytes);
    assert!(matches!(reader.next_frame().unwrap(), Some(Frame::Statement(_))));
    assert!(reader.next_frame().unwrap().is_none());
    assert_eq!(reader.state(), SessionState::End);
}

#[test]
fn test_out_of_range_length_corrupts_without_resync() {
    let frames: Vec<Frame> = statements().into_iter().map(Frame::Statement).collect();
    let mut bytes = write_backup(0, &frames);
    let header_len = 4 + u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
    bytes[header_len..header_len + 4].copy_from_slice(&u32::MAX.to_be_bytes());

    let mut reader = open(bytes);
    assert!(matches!(
        reader.next_frame(),
        Err(SigbakError::ParseFailure(_))
    ));
    assert_eq!(reader.state(), SessionState::Corrupt);
    assert!(reader.next().is_none(), "iteration stops once corrupt");
}

#[test]
fn test_resync_skips_garbage() {
    let frames: Vec<Frame> = statements().into_iter().map(Frame::Statement).collect();
    let clean = write_backup(0, &frames);
    let header_len = 4 + u32::from_be_bytes(clean[..4].try_into().unwrap()) as usize;

    // Insert junk between the header and the first frame.
    let mut bytes = clean[..header_len].to_vec();
    bytes.extend_from_slice(&[0xFF; 7]);
    bytes.extend_from_slice(&clean[header_len..]);

    let options = ReaderOptions {
        resync_window: 64,
        ..ReaderOptions::default()
    };
    let mut reader =
        BackupReader::from_reader(Cursor::new(bytes), &pass(), &params(), options).unwrap();
    match reader.next_frame().unwrap() {
        Some(Frame::Statement(s)) => assert_eq!(s, statements()[0]),
        other => panic!("expected first statement after resync, got {other:?}"),
    }
}

#[test]
fn test_writer_rejects_length_mismatch() {
    let mut writer =
        BackupWriter::create(Vec::new(), &pass(), &[1; 32], IV, 1, &params()).unwrap();
    let bad = Frame::Attachment(AttachmentFrame {
        row_id: Some(1),
        attachment_id: Some(1),
        length: Some(99),
        payload: Payload::Inline(vec![0; 3]),
    });
    assert!(matches!(
        writer.write_frame(&bad),
        Err(SigbakError::ConsistencyViolation(_))
    ));
    assert_eq!(writer.frames_written(), 0);
    assert!(writer.write_frame(&Frame::End).is_err());
}

#[test]
fn test_random_header_differs() {
    let a = BackupWriter::create_random(Vec::new(), &pass(), 1, &params()).unwrap();
    let b = BackupWriter::create_random(Vec::new(), &pass(), 1, &params()).unwrap();
    assert_ne!(a.header().iv, b.header().iv);
    assert_ne!(a.header().salt, b.header().salt);
}
