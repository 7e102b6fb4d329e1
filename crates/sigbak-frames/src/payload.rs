//! Binary payloads of attachment, avatar and sticker frames

use std::fmt;
use std::sync::Arc;

use sigbak_core::SigbakResult;

/// Something that can produce a payload's plaintext on demand.
///
/// The stream reader implements this over the backup file so that scanning
/// a backup does not pull every attachment into memory.
pub trait PayloadSource: Send + Sync + fmt::Debug {
    /// Read, authenticate and decrypt the payload.
    fn load(&self) -> SigbakResult<Vec<u8>>;

    /// Plaintext length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Inline(Vec<u8>),
    Deferred(Arc<dyn PayloadSource>),
}

impl Payload {
    pub fn load(&self) -> SigbakResult<Vec<u8>> {
        match self {
            Payload::Empty => Ok(Vec::new()),
            Payload::Inline(bytes) => Ok(bytes.clone()),
            Payload::Deferred(source) => source.load(),
        }
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, Payload::Empty)
    }

    /// Replace a deferred payload with its loaded bytes.
    pub fn materialize(&mut self) -> SigbakResult<()> {
        if let Payload::Deferred(source) = self {
            *self = Payload::Inline(source.load()?);
        }
        Ok(())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => f.write_str("Empty"),
            Payload::Inline(bytes) => write!(f, "Inline({} bytes)", bytes.len()),
            Payload::Deferred(source) => write!(f, "Deferred({} bytes)", source.len()),
        }
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Payload::Empty, Payload::Empty) => true,
            (Payload::Inline(a), Payload::Inline(b)) => a == b,
            (Payload::Deferred(a), Payload::Deferred(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Counting {
        loads: AtomicUsize,
    }

    impl PayloadSource for Counting {
        fn load(&self) -> SigbakResult<Vec<u8>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1, 2, 3])
        }

        fn len(&self) -> u64 {
            3
        }
    }

    #[test]
    fn test_deferred_loads_on_demand() {
        let source = Arc::new(Counting {
            loads: AtomicUsize::new(0),
        });
        let mut payload = Payload::Deferred(source.clone());
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);

        assert_eq!(payload.load().unwrap(), vec![1, 2, 3]);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        payload.materialize().unwrap();
        assert_eq!(payload, Payload::Inline(vec![1, 2, 3]));
        payload.load().unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2, "inline payload must not reload");
    }

    #[test]
    fn test_debug_shows_size_not_bytes() {
        assert_eq!(format!("{:?}", Payload::Inline(vec![0; 10])), "Inline(10 bytes)");
        assert_eq!(format!("{:?}", Payload::Empty), "Empty");
    }
}
