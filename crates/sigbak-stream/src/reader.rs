//! Streaming backup reader
//!
//! ```text
//! [ len:u32be ][ header frame ]          clear
//! [ frame envelope ]                     counter c
//! [ attachment envelope ]                counter c+1  (after payload frames)
//! [ frame envelope ]                     ...
//! [ End frame envelope ]
//! ```

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::SecretString;
use sigbak_core::config::BackupConfig;
use sigbak_core::{SessionState, SigbakError, SigbakResult};
use sigbak_crypto::{
    derive_backup_key, derive_cipher_material, BackupKdfParams, CipherMaterial, FrameCodec,
    IV_SIZE, LENGTH_SIZE, MAC_SIZE,
};
use sigbak_frames::{parse_frame, Frame, HeaderFrame, Payload};

use crate::payload::{BufferedPayload, FilePayload};

/// Smallest valid length field: one byte of frame plus the MAC.
const MIN_FRAME_LENGTH: u32 = MAC_SIZE as u32 + 1;

/// Counter values tried at each candidate offset while resynchronising.
const RESYNC_COUNTER_SPAN: u32 = 3;

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub max_frame_size: u32,
    /// Bytes to scan for the next valid frame after a framing error (0 = off)
    pub resync_window: u64,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_frame_size: 3 * 1024 * 1024,
            resync_window: 0,
        }
    }
}

impl From<&BackupConfig> for ReaderOptions {
    fn from(config: &BackupConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            resync_window: config.resync_window,
        }
    }
}

/// A frame that failed authentication, kept so its rows can be pruned.
#[derive(Debug, Clone)]
pub struct BadFrame {
    /// Stream offset of the frame envelope
    pub offset: u64,
    pub frame: Frame,
    pub reason: String,
}

pub struct BackupReader<R = BufReader<File>> {
    inner: R,
    path: Option<Arc<PathBuf>>,
    codec: FrameCodec,
    header: HeaderFrame,
    state: SessionState,
    options: ReaderOptions,
    position: u64,
    stream_len: u64,
    frames_read: u64,
    bad_frames: Vec<BadFrame>,
}

impl<R> std::fmt::Debug for BackupReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupReader")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("position", &self.position)
            .field("stream_len", &self.stream_len)
            .field("frames_read", &self.frames_read)
            .field("bad_frames", &self.bad_frames.len())
            .finish()
    }
}

impl BackupReader<BufReader<File>> {
    /// Open a backup file. Attachment payloads stay on disk until loaded.
    pub fn open(
        path: impl AsRef<Path>,
        passphrase: &SecretString,
        params: &BackupKdfParams,
        options: ReaderOptions,
    ) -> SigbakResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut reader = Self::from_reader(BufReader::new(file), passphrase, params, options)?;
        reader.path = Some(Arc::new(path));
        Ok(reader)
    }
}

impl<R: Read + Seek> BackupReader<R> {
    /// Read from any seekable source. Attachment envelopes are buffered in
    /// memory and decrypted when loaded.
    pub fn from_reader(
        mut inner: R,
        passphrase: &SecretString,
        params: &BackupKdfParams,
        options: ReaderOptions,
    ) -> SigbakResult<Self> {
        let stream_len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;

        let mut state = SessionState::Uninitialized;
        let (header, header_len) = read_header(&mut inner, stream_len)?;
        let salt = header.salt.clone().unwrap_or_default();
        let iv: [u8; IV_SIZE] = header
            .iv
            .as_deref()
            .and_then(|iv| iv.try_into().ok())
            .ok_or_else(|| SigbakError::ParseFailure("header carries no 16-byte IV".into()))?;
        let version = header.version.unwrap_or(0);

        let key = derive_backup_key(passphrase, &salt, params)?;
        let material = Arc::new(derive_cipher_material(&key)?);
        state.advance(SessionState::KeysDerived)?;

        let codec = FrameCodec::new(material, iv, version);
        state.advance(SessionState::StreamOpen)?;
        tracing::debug!(version, stream_len, "opened backup stream");

        Ok(Self {
            inner,
            path: None,
            codec,
            header,
            state,
            options,
            position: header_len,
            stream_len,
            frames_read: 0,
            bad_frames: Vec::new(),
        })
    }

    pub fn header(&self) -> &HeaderFrame {
        &self.header
    }

    pub fn format_version(&self) -> u32 {
        self.codec.format_version()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn material(&self) -> &Arc<CipherMaterial> {
        self.codec.material()
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Stream offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.position
    }

    pub fn stream_len(&self) -> u64 {
        self.stream_len
    }

    pub fn bad_frames(&self) -> &[BadFrame] {
        &self.bad_frames
    }

    /// Bytes left unread after the last frame.
    pub fn remaining_bytes(&self) -> u64 {
        self.stream_len.saturating_sub(self.position)
    }

    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Corrupt;
        }
    }

    /// Decrypt and parse the next frame.
    ///
    /// `Ok(None)` once the End frame has been returned or the stream ran
    /// out. An `AuthenticationFailure` leaves the reader positioned after
    /// the bad frame (and its payload), so the caller may continue.
    pub fn next_frame(&mut self) -> SigbakResult<Option<Frame>> {
        match self.state {
            SessionState::End | SessionState::Closed => return Ok(None),
            SessionState::Corrupt => {
                return Err(SigbakError::Other(anyhow::anyhow!(
                    "backup reader is corrupt at offset {}",
                    self.position
                )))
            }
            SessionState::StreamOpen => self.state.advance(SessionState::Decoding)?,
            _ => {}
        }

        loop {
            let start = self.position;
            let mut prefix = [0u8; LENGTH_SIZE];
            if !self.read_full(&mut prefix)? {
                self.truncated(start);
                return Ok(None);
            }

            let length = self.codec.peek_frame_length(prefix);
            if !(MIN_FRAME_LENGTH..=self.options.max_frame_size).contains(&length) {
                if self.resync(start)? {
                    continue;
                }
                self.state.advance(SessionState::Corrupt)?;
                return Err(SigbakError::ParseFailure(format!(
                    "frame length {length} at offset {start} is out of range"
                )));
            }

            let mut envelope = vec![0u8; LENGTH_SIZE + length as usize];
            envelope[..LENGTH_SIZE].copy_from_slice(&prefix);
            if !self.read_full(&mut envelope[LENGTH_SIZE..])? {
                self.truncated(start);
                return Ok(None);
            }
            return self.finish_frame(start, &envelope);
        }
    }

    fn finish_frame(&mut self, start: u64, envelope: &[u8]) -> SigbakResult<Option<Frame>> {
        let counter = self.codec.counter();
        let opened = self.codec.open_frame(envelope)?;
        let parsed = parse_frame(&opened.plaintext, 0);

        if !opened.authenticated() {
            let reason = if opened.mac_ok {
                "length mismatch"
            } else {
                "MAC mismatch"
            };
            tracing::warn!(offset = start, counter, reason, "bad frame");
            if let Some((frame, _)) = parsed {
                if let Some(len) = frame.payload_length() {
                    self.codec.next_iv();
                    self.skip(u64::from(len) + MAC_SIZE as u64)?;
                    self.bad_frames.push(BadFrame {
                        offset: start,
                        frame,
                        reason: reason.to_string(),
                    });
                }
            }
            return Err(SigbakError::AuthenticationFailure(format!(
                "frame at offset {start} (counter {counter}): {reason}"
            )));
        }

        let Some((mut frame, end)) = parsed else {
            return Err(SigbakError::ParseFailure(format!(
                "authenticated frame at offset {start} does not decode"
            )));
        };
        if end != opened.plaintext.len() {
            tracing::debug!(
                offset = start,
                unused = opened.plaintext.len() - end,
                "frame has trailing bytes"
            );
        }

        if matches!(frame, Frame::End) {
            self.state.advance(SessionState::End)?;
            tracing::debug!(frames = self.frames_read, "reached end frame");
            return Ok(Some(frame));
        }

        if frame.has_payload() {
            if let Err(e) = frame.validate() {
                // The payload envelope still follows and still consumes a counter.
                if let Some(len) = frame.payload_length() {
                    self.codec.next_iv();
                    self.skip(u64::from(len) + MAC_SIZE as u64)?;
                }
                tracing::warn!(offset = start, counter, error = %e, "invalid payload frame");
                self.bad_frames.push(BadFrame {
                    offset: start,
                    frame,
                    reason: e.to_string(),
                });
                return Err(e);
            }
            let length = frame.payload_length().unwrap_or(0);
            let payload = self.defer_payload(length)?;
            frame.set_payload(payload);
        }

        self.frames_read += 1;
        tracing::trace!(offset = start, kind = frame.name(), "frame");
        Ok(Some(frame))
    }

    fn defer_payload(&mut self, length: u32) -> SigbakResult<Payload> {
        let iv = self.codec.next_iv();
        let offset = self.position;
        let envelope_len = u64::from(length) + MAC_SIZE as u64;
        if offset + envelope_len > self.stream_len {
            return Err(SigbakError::ParseFailure(format!(
                "attachment of {length} bytes at offset {offset} runs past the end of the stream"
            )));
        }

        let source: Arc<dyn sigbak_frames::PayloadSource> = match self.path.clone() {
            Some(path) => {
                self.skip(envelope_len)?;
                Arc::new(FilePayload::new(
                    path,
                    offset,
                    length,
                    iv,
                    self.codec.material().clone(),
                ))
            }
            None => {
                let mut envelope = vec![0u8; envelope_len as usize];
                if !self.read_full(&mut envelope)? {
                    return Err(SigbakError::ParseFailure("attachment envelope truncated".into()));
                }
                Arc::new(BufferedPayload::new(envelope, iv, self.codec.material().clone()))
            }
        };
        Ok(Payload::Deferred(source))
    }

    /// Scan forward from `start` for an offset and counter at which a frame
    /// authenticates. On success the reader is positioned there.
    fn resync(&mut self, start: u64) -> SigbakResult<bool> {
        if self.options.resync_window == 0 {
            return Ok(false);
        }
        let base_counter = self.codec.counter();
        let last = (start + self.options.resync_window).min(self.stream_len);
        tracing::warn!(offset = start, window = self.options.resync_window, "resynchronising");

        for candidate in start + 1..last {
            for step in 0..RESYNC_COUNTER_SPAN {
                let counter = base_counter.wrapping_add(step);
                if self.try_frame_at(candidate, counter)? {
                    tracing::info!(
                        skipped = candidate - start,
                        counter,
                        "resynchronised"
                    );
                    self.seek_to(candidate)?;
                    self.codec.set_counter(counter);
                    return Ok(true);
                }
            }
        }

        self.codec.set_counter(base_counter);
        Ok(false)
    }

    fn try_frame_at(&mut self, offset: u64, counter: u32) -> SigbakResult<bool> {
        self.seek_to(offset)?;
        let mut prefix = [0u8; LENGTH_SIZE];
        if !self.read_full(&mut prefix)? {
            return Ok(false);
        }
        self.codec.set_counter(counter);
        let length = self.codec.peek_frame_length(prefix);
        if !(MIN_FRAME_LENGTH..=self.options.max_frame_size).contains(&length)
            || offset + LENGTH_SIZE as u64 + u64::from(length) > self.stream_len
        {
            return Ok(false);
        }

        let mut envelope = vec![0u8; LENGTH_SIZE + length as usize];
        envelope[..LENGTH_SIZE].copy_from_slice(&prefix);
        if !self.read_full(&mut envelope[LENGTH_SIZE..])? {
            return Ok(false);
        }
        let opened = self.codec.open_frame(&envelope)?;
        Ok(opened.authenticated() && parse_frame(&opened.plaintext, 0).is_some())
    }

    fn truncated(&mut self, start: u64) {
        tracing::warn!(
            offset = start,
            frames = self.frames_read,
            "backup ends without an End frame, treating as truncated"
        );
        self.state = SessionState::End;
    }

    fn seek_to(&mut self, offset: u64) -> SigbakResult<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(())
    }

    fn skip(&mut self, len: u64) -> SigbakResult<()> {
        let target = self.position + len;
        self.seek_to(target)
    }

    /// Fill `buf` entirely; false when the stream ends first.
    fn read_full(&mut self, buf: &mut [u8]) -> SigbakResult<bool> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.position = self.stream_len;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<R: Read + Seek> Iterator for BackupReader<R> {
    type Item = SigbakResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == SessionState::Corrupt {
            return None;
        }
        self.next_frame().transpose()
    }
}

fn read_header<R: Read>(inner: &mut R, stream_len: u64) -> SigbakResult<(HeaderFrame, u64)> {
    let mut prefix = [0u8; LENGTH_SIZE];
    inner.read_exact(&mut prefix).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => SigbakError::ParseFailure("backup is too short for a header".into()),
        _ => e.into(),
    })?;
    let len = u32::from_be_bytes(prefix) as u64;
    if len == 0 || len + LENGTH_SIZE as u64 > stream_len {
        return Err(SigbakError::ParseFailure(format!(
            "header length {len} does not fit a {stream_len}-byte stream"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    inner.read_exact(&mut buf)?;
    match parse_frame(&buf, 0) {
        Some((Frame::Header(header), _)) => {
            Frame::Header(header.clone()).validate()?;
            Ok((header, LENGTH_SIZE as u64 + len))
        }
        Some((other, _)) => Err(SigbakError::ParseFailure(format!(
            "first frame is {} instead of a header",
            other.name()
        ))),
        None => Err(SigbakError::ParseFailure("header frame does not decode".into())),
    }
}
