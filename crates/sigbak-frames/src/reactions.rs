//! Packed reaction lists stored in the `reactions` column of message rows
//!
//! ```text
//! ReactionList { reactions = 1 (repeated Reaction) }
//! Reaction     { emoji = 1, author = 2, sentTime = 3, receivedTime = 4 }
//! ```
//!
//! Fields this module does not know are carried through unchanged.

use sigbak_core::{SigbakError, SigbakResult};

use crate::wire::{fields, FieldWriter};

const LIST_REACTION: u32 = 1;

const EMOJI: u32 = 1;
const AUTHOR: u32 = 2;
const SENT_TIME: u32 = 3;
const RECEIVED_TIME: u32 = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reaction {
    pub emoji: Option<String>,
    pub author: Option<u64>,
    pub sent_time: Option<u64>,
    pub received_time: Option<u64>,
    unknown: Vec<u8>,
}

impl Reaction {
    fn decode(buf: &[u8]) -> SigbakResult<Self> {
        let mut reaction = Self::default();
        for field in fields(buf) {
            let field = field?;
            match (field.number, field.value.as_u64()) {
                (EMOJI, _) if field.value.as_bytes().is_some() => {
                    reaction.emoji = field.value.as_string();
                }
                (AUTHOR, Some(v)) => reaction.author = Some(v),
                (SENT_TIME, Some(v)) => reaction.sent_time = Some(v),
                (RECEIVED_TIME, Some(v)) => reaction.received_time = Some(v),
                _ => reaction.unknown.extend_from_slice(field.raw),
            }
        }
        Ok(reaction)
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        if let Some(emoji) = &self.emoji {
            w.string(EMOJI, emoji);
        }
        if let Some(author) = self.author {
            w.varint(AUTHOR, author);
        }
        if let Some(sent) = self.sent_time {
            w.varint(SENT_TIME, sent);
        }
        if let Some(received) = self.received_time {
            w.varint(RECEIVED_TIME, received);
        }
        w.raw(&self.unknown);
        w.finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactionList {
    reactions: Vec<Reaction>,
    unknown: Vec<u8>,
}

impl ReactionList {
    pub fn decode(buf: &[u8]) -> SigbakResult<Self> {
        let mut list = Self::default();
        for field in fields(buf) {
            let field = field?;
            match (field.number, field.value.as_bytes()) {
                (LIST_REACTION, Some(bytes)) => list.reactions.push(Reaction::decode(bytes)?),
                (LIST_REACTION, None) => {
                    return Err(SigbakError::ParseFailure(
                        "reaction entry is not length-delimited".into(),
                    ))
                }
                _ => list.unknown.extend_from_slice(field.raw),
            }
        }
        Ok(list)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        for reaction in &self.reactions {
            w.bytes(LIST_REACTION, &reaction.encode());
        }
        w.raw(&self.unknown);
        w.finish()
    }

    pub fn len(&self) -> usize {
        self.reactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty()
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    pub fn author(&self, idx: usize) -> Option<u64> {
        self.reactions.get(idx).and_then(|r| r.author)
    }

    /// Returns false when `idx` is out of range.
    pub fn set_author(&mut self, idx: usize, author: u64) -> bool {
        match self.reactions.get_mut(idx) {
            Some(reaction) => {
                reaction.author = Some(author);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reaction(emoji: &str, author: u64, sent: u64) -> Vec<u8> {
        let mut w = FieldWriter::new();
        w.string(EMOJI, emoji)
            .varint(AUTHOR, author)
            .varint(SENT_TIME, sent)
            .varint(RECEIVED_TIME, sent + 5);
        w.finish()
    }

    fn list(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut w = FieldWriter::new();
        for e in entries {
            w.bytes(LIST_REACTION, e);
        }
        w.finish()
    }

    #[test]
    fn test_decode_and_reencode_identical() {
        let buf = list(&[reaction("👍", 3, 1000), reaction("❤️", 7, 2000)]);
        let decoded = ReactionList::decode(&buf).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.reactions()[0].emoji.as_deref(), Some("👍"));
        assert_eq!(decoded.author(1), Some(7));
        assert_eq!(decoded.encode(), buf, "untouched list must re-encode byte-for-byte");
    }

    #[test]
    fn test_set_author() {
        let buf = list(&[reaction("x", 3, 1)]);
        let mut decoded = ReactionList::decode(&buf).unwrap();
        assert!(decoded.set_author(0, 42));
        assert!(!decoded.set_author(1, 42));

        let again = ReactionList::decode(&decoded.encode()).unwrap();
        assert_eq!(again.author(0), Some(42));
        assert_eq!(again.reactions()[0].sent_time, Some(1));
        assert_eq!(again.reactions()[0].received_time, Some(6));
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let mut entry = reaction("x", 3, 1);
        let mut extra = FieldWriter::new();
        extra.string(9, "future");
        entry.extend_from_slice(&extra.finish());

        let mut buf = list(&[entry]);
        let mut tail = FieldWriter::new();
        tail.varint(15, 99);
        buf.extend_from_slice(&tail.finish());

        let mut decoded = ReactionList::decode(&buf).unwrap();
        assert_eq!(decoded.encode(), buf);

        decoded.set_author(0, 4);
        let reencoded = decoded.encode();
        let again = ReactionList::decode(&reencoded).unwrap();
        assert_eq!(again.author(0), Some(4));
        assert_eq!(again.encode(), reencoded);
        assert!(reencoded.ends_with(&[0x78, 99]), "trailing unknown field kept");
    }

    #[test]
    fn test_empty_and_malformed() {
        assert!(ReactionList::decode(&[]).unwrap().is_empty());
        // field 1 as varint
        assert!(ReactionList::decode(&[0x08, 0x01]).is_err());
        // truncated entry
        assert!(ReactionList::decode(&[0x0A, 0x09, 0x0A]).is_err());
    }
}
