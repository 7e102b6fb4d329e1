//! Deferred attachment payloads
//!
//! The reader records where an attachment envelope sits and which counter
//! IV it was sealed under, then moves on. Decryption happens on `load()`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use sigbak_core::SigbakResult;
use sigbak_crypto::{open_attachment, CipherMaterial, IV_SIZE, MAC_SIZE};
use sigbak_frames::PayloadSource;

/// Attachment envelope still on disk.
#[derive(Debug)]
pub struct FilePayload {
    path: Arc<PathBuf>,
    offset: u64,
    length: u32,
    iv: [u8; IV_SIZE],
    material: Arc<CipherMaterial>,
}

impl FilePayload {
    pub fn new(
        path: Arc<PathBuf>,
        offset: u64,
        length: u32,
        iv: [u8; IV_SIZE],
        material: Arc<CipherMaterial>,
    ) -> Self {
        Self {
            path,
            offset,
            length,
            iv,
            material,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl PayloadSource for FilePayload {
    fn load(&self) -> SigbakResult<Vec<u8>> {
        let mut file = File::open(self.path.as_path())?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut envelope = vec![0u8; self.length as usize + MAC_SIZE];
        file.read_exact(&mut envelope)?;
        open_attachment(&self.material, &self.iv, &envelope)
    }

    fn len(&self) -> u64 {
        u64::from(self.length)
    }
}

/// Attachment envelope already read into memory, decrypted on demand.
#[derive(Debug)]
pub struct BufferedPayload {
    envelope: Vec<u8>,
    iv: [u8; IV_SIZE],
    material: Arc<CipherMaterial>,
}

impl BufferedPayload {
    pub fn new(envelope: Vec<u8>, iv: [u8; IV_SIZE], material: Arc<CipherMaterial>) -> Self {
        Self {
            envelope,
            iv,
            material,
        }
    }
}

impl PayloadSource for BufferedPayload {
    fn load(&self) -> SigbakResult<Vec<u8>> {
        open_attachment(&self.material, &self.iv, &self.envelope)
    }

    fn len(&self) -> u64 {
        self.envelope.len().saturating_sub(MAC_SIZE) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigbak_crypto::seal_attachment;
    use std::io::Write;

    fn material() -> Arc<CipherMaterial> {
        Arc::new(CipherMaterial::from_parts([1; 32], [2; 32]))
    }

    #[test]
    fn test_file_payload_reads_at_offset() {
        let iv = [9u8; IV_SIZE];
        let envelope = seal_attachment(&material(), &iv, b"attachment body").unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"prefix bytes").unwrap();
        file.write_all(&envelope).unwrap();
        file.flush().unwrap();

        let payload = FilePayload::new(
            Arc::new(file.path().to_path_buf()),
            12,
            15,
            iv,
            material(),
        );
        assert_eq!(payload.len(), 15);
        assert_eq!(payload.load().unwrap(), b"attachment body");
    }

    #[test]
    fn test_buffered_payload_wrong_iv_fails() {
        let envelope = seal_attachment(&material(), &[9u8; IV_SIZE], b"abc").unwrap();
        let good = BufferedPayload::new(envelope.clone(), [9u8; IV_SIZE], material());
        assert_eq!(good.load().unwrap(), b"abc");
        let bad = BufferedPayload::new(envelope, [8u8; IV_SIZE], material());
        assert!(bad.load().is_err());
    }
}
