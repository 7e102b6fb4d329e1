//! Streaming backup writer

use std::io::Write;
use std::sync::Arc;

use rand::RngCore;
use secrecy::SecretString;
use sigbak_core::{SessionState, SigbakError, SigbakResult};
use sigbak_crypto::{
    derive_backup_key, derive_cipher_material, BackupKdfParams, FrameCodec, IV_SIZE,
};
use sigbak_frames::{Frame, HeaderFrame};

/// Salt length written by [`BackupWriter::create_random`]
pub const SALT_SIZE: usize = 32;

pub struct BackupWriter<W: Write> {
    inner: W,
    codec: FrameCodec,
    header: HeaderFrame,
    state: SessionState,
    frames_written: u64,
    bytes_written: u64,
}

impl<W: Write> std::fmt::Debug for BackupWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupWriter")
            .field("state", &self.state)
            .field("frames_written", &self.frames_written)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

impl<W: Write> BackupWriter<W> {
    /// Derive keys and write the clear header frame.
    pub fn create(
        mut inner: W,
        passphrase: &SecretString,
        salt: &[u8],
        iv: [u8; IV_SIZE],
        version: u32,
        params: &BackupKdfParams,
    ) -> SigbakResult<Self> {
        let mut state = SessionState::Uninitialized;
        let key = derive_backup_key(passphrase, salt, params)?;
        let material = Arc::new(derive_cipher_material(&key)?);
        state.advance(SessionState::KeysDerived)?;

        let header = HeaderFrame {
            iv: Some(iv.to_vec()),
            salt: Some(salt.to_vec()),
            version: Some(version),
        };
        let encoded = Frame::Header(header.clone()).encode();
        let len = u32::try_from(encoded.len())
            .map_err(|_| SigbakError::Other(anyhow::anyhow!("header frame too large")))?;
        inner.write_all(&len.to_be_bytes())?;
        inner.write_all(&encoded)?;
        state.advance(SessionState::StreamOpen)?;
        state.advance(SessionState::Encoding)?;
        tracing::debug!(version, "wrote backup header");

        Ok(Self {
            inner,
            codec: FrameCodec::new(material, iv, version),
            header,
            state,
            frames_written: 0,
            bytes_written: 4 + encoded.len() as u64,
        })
    }

    /// Like [`BackupWriter::create`] with a fresh random salt and IV.
    pub fn create_random(
        inner: W,
        passphrase: &SecretString,
        version: u32,
        params: &BackupKdfParams,
    ) -> SigbakResult<Self> {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_SIZE];
        let mut iv = [0u8; IV_SIZE];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut iv);
        Self::create(inner, passphrase, &salt, iv, version, params)
    }

    pub fn header(&self) -> &HeaderFrame {
        &self.header
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Encrypt and write one frame, followed by its payload if it has one.
    pub fn write_frame(&mut self, frame: &Frame) -> SigbakResult<()> {
        if self.state != SessionState::Encoding {
            return Err(SigbakError::Other(anyhow::anyhow!(
                "cannot write frames in state {:?}",
                self.state
            )));
        }
        match frame {
            Frame::Header(_) => {
                return Err(SigbakError::Other(anyhow::anyhow!(
                    "the header is written by create()"
                )))
            }
            Frame::End => {
                return Err(SigbakError::Other(anyhow::anyhow!(
                    "the end frame is written by finish()"
                )))
            }
            _ => {}
        }
        frame.validate()?;

        let payload = match (frame.payload_length(), frame.payload()) {
            (Some(length), Some(payload)) => {
                let data = payload.load()?;
                if data.len() != length as usize {
                    return Err(SigbakError::ConsistencyViolation(format!(
                        "{} frame declares {length} bytes but its payload has {}",
                        frame.name(),
                        data.len()
                    )));
                }
                Some(data)
            }
            _ => None,
        };

        let envelope = self.codec.encrypt_frame(&frame.encode())?;
        self.write(&envelope)?;
        if let Some(data) = payload {
            let envelope = self.codec.encrypt_attachment(&data)?;
            self.write(&envelope)?;
        }

        self.frames_written += 1;
        self.state.advance(SessionState::Encoding)?;
        Ok(())
    }

    /// Write the End frame, flush and hand back the sink.
    pub fn finish(mut self) -> SigbakResult<W> {
        let envelope = self.codec.encrypt_frame(&Frame::End.encode())?;
        self.write(&envelope)?;
        self.inner.flush()?;
        self.state.advance(SessionState::Closed)?;
        tracing::debug!(
            frames = self.frames_written,
            bytes = self.bytes_written,
            "finished backup"
        );
        Ok(self.inner)
    }

    fn write(&mut self, bytes: &[u8]) -> SigbakResult<()> {
        self.inner.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}
