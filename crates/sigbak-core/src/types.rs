use serde::{Deserialize, Serialize};

use crate::error::{SigbakError, SigbakResult};

/// Identity of an attachment payload held in memory.
///
/// Row ids are reused across merges and renumbering, so the unique id is
/// part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttachmentKey {
    pub row_id: u64,
    pub unique_id: u64,
}

impl AttachmentKey {
    pub fn new(row_id: u64, unique_id: u64) -> Self {
        Self { row_id, unique_id }
    }
}

impl std::fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.row_id, self.unique_id)
    }
}

/// An id rewrite applied across tables, blobs and in-memory frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdRemap {
    /// Add a constant to every id
    Offset(i64),
    /// Replace one id with another, leave the rest alone
    Replace { from: i64, to: i64 },
}

impl IdRemap {
    /// The rewritten id. An offset that leaves the `i64` range is a
    /// `ConsistencyViolation`.
    pub fn apply(&self, id: i64) -> SigbakResult<i64> {
        match *self {
            IdRemap::Offset(offset) => id.checked_add(offset).ok_or_else(|| {
                SigbakError::ConsistencyViolation(format!("id {id} overflows when offset by {offset}"))
            }),
            IdRemap::Replace { from, to } if id == from => Ok(to),
            IdRemap::Replace { .. } => Ok(id),
        }
    }

    /// Whether `id` is changed by this remap.
    pub fn affects(&self, id: i64) -> bool {
        match *self {
            IdRemap::Offset(offset) => offset != 0,
            IdRemap::Replace { from, to } => id == from && from != to,
        }
    }
}

/// Lifecycle of a backup codec session.
///
/// ```text
/// Uninitialized → KeysDerived → StreamOpen → Decoding ─┬→ End
///                                          │            └→ Corrupt
///                                          └→ Encoding ──→ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Uninitialized,
    KeysDerived,
    StreamOpen,
    Decoding,
    Encoding,
    /// Terminal: End frame seen (or a clean truncation)
    End,
    /// Terminal: stream cannot be continued
    Corrupt,
    /// Terminal: writer finished
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::End | SessionState::Corrupt | SessionState::Closed
        )
    }

    fn allows(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Uninitialized, KeysDerived) => true,
            (KeysDerived, StreamOpen) => true,
            (StreamOpen, Decoding) | (StreamOpen, Encoding) => true,
            (Decoding, Decoding) | (Decoding, End) => true,
            (Encoding, Encoding) | (Encoding, Closed) => true,
            (s, Corrupt) => !s.is_terminal(),
            _ => false,
        }
    }

    /// Move to `next`, rejecting transitions the session lifecycle forbids.
    pub fn advance(&mut self, next: SessionState) -> SigbakResult<()> {
        if !self.allows(next) {
            return Err(SigbakError::Other(anyhow::anyhow!(
                "invalid session transition {self:?} -> {next:?}"
            )));
        }
        tracing::trace!(from = ?self, to = ?next, "session state");
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_offset() {
        let remap = IdRemap::Offset(10);
        assert_eq!(remap.apply(1).unwrap(), 11);
        assert_eq!(remap.apply(-3).unwrap(), 7);
        assert!(remap.affects(42));
        assert!(!IdRemap::Offset(0).affects(42));
    }

    #[test]
    fn test_remap_replace() {
        let remap = IdRemap::Replace { from: 4, to: 9 };
        assert_eq!(remap.apply(4).unwrap(), 9);
        assert_eq!(remap.apply(5).unwrap(), 5, "non-matching ids must be untouched");
        assert!(remap.affects(4));
        assert!(!remap.affects(5));
    }

    #[test]
    fn test_remap_offset_overflow() {
        assert!(matches!(
            IdRemap::Offset(1).apply(i64::MAX),
            Err(SigbakError::ConsistencyViolation(_))
        ));
        assert!(IdRemap::Offset(-1).apply(i64::MIN).is_err());
        assert_eq!(IdRemap::Offset(-1).apply(i64::MAX).unwrap(), i64::MAX - 1);
        assert_eq!(
            IdRemap::Replace { from: i64::MAX, to: 1 }.apply(i64::MAX).unwrap(),
            1,
            "replacement never does arithmetic"
        );
    }

    #[test]
    fn test_decode_lifecycle() {
        let mut state = SessionState::Uninitialized;
        state.advance(SessionState::KeysDerived).unwrap();
        state.advance(SessionState::StreamOpen).unwrap();
        state.advance(SessionState::Decoding).unwrap();
        state.advance(SessionState::Decoding).unwrap();
        state.advance(SessionState::End).unwrap();
        assert!(state.is_terminal());
        assert!(state.advance(SessionState::Decoding).is_err());
        assert!(state.advance(SessionState::Corrupt).is_err());
    }

    #[test]
    fn test_encode_lifecycle() {
        let mut state = SessionState::Uninitialized;
        state.advance(SessionState::KeysDerived).unwrap();
        state.advance(SessionState::StreamOpen).unwrap();
        state.advance(SessionState::Encoding).unwrap();
        assert!(state.advance(SessionState::End).is_err(), "writers close, they do not end");
        state.advance(SessionState::Closed).unwrap();
    }

    #[test]
    fn test_cannot_skip_key_derivation() {
        let mut state = SessionState::Uninitialized;
        assert!(state.advance(SessionState::StreamOpen).is_err());
        assert_eq!(state, SessionState::Uninitialized);
    }

    #[test]
    fn test_attachment_key_ordering() {
        let a = AttachmentKey::new(1, 500);
        let b = AttachmentKey::new(2, 100);
        assert!(a < b, "keys order by row id first");
        assert_eq!(a.to_string(), "1:500");
    }
}
