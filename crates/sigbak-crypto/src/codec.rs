//! Frame and attachment envelopes of the backup stream
//!
//! Every frame after the header, and every attachment payload, consumes one
//! counter value. The counter is written big-endian into the first four IV
//! bytes before use.
//!
//! Frame envelope:
//! ```text
//! version >= 1: [ E(len:u32be ‖ frame) ][ mac10 ]   mac = HMAC(E(len) ‖ E(frame))
//! version == 0: [ len:u32be ][ E(frame) ][ mac10 ]   mac = HMAC(E(frame))
//!               len = |E(frame)| + 10
//! ```
//!
//! Attachment envelope (length announced by the preceding frame):
//! ```text
//! [ E(data) ][ mac10 ]   mac = HMAC(iv ‖ E(data))
//! ```
//!
//! E is AES-256-CTR (128-bit big-endian counter block), HMAC is HMAC-SHA256.

use std::sync::Arc;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sigbak_core::{SigbakError, SigbakResult};

use crate::keys::CipherMaterial;
use crate::{IV_SIZE, KEY_SIZE, LENGTH_SIZE, MAC_SIZE};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Result of opening a frame without insisting on authenticity.
#[derive(Debug)]
pub struct OpenedFrame {
    pub plaintext: Vec<u8>,
    /// Truncated HMAC matched
    pub mac_ok: bool,
    /// Decrypted length prefix agreed with the envelope size
    pub length_ok: bool,
}

impl OpenedFrame {
    pub fn authenticated(&self) -> bool {
        self.mac_ok && self.length_ok
    }
}

/// Encrypt/decrypt state for one backup stream.
#[derive(Debug)]
pub struct FrameCodec {
    material: Arc<CipherMaterial>,
    iv: [u8; IV_SIZE],
    counter: u32,
    version: u32,
}

impl FrameCodec {
    /// `iv` is the header IV; its first four bytes seed the counter.
    pub fn new(material: Arc<CipherMaterial>, iv: [u8; IV_SIZE], format_version: u32) -> Self {
        let counter = u32::from_be_bytes([iv[0], iv[1], iv[2], iv[3]]);
        Self {
            material,
            iv,
            counter,
            version: format_version,
        }
    }

    pub fn material(&self) -> &Arc<CipherMaterial> {
        &self.material
    }

    pub fn format_version(&self) -> u32 {
        self.version
    }

    /// Counter value the next frame or attachment will use.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Reposition the counter, e.g. after scanning past damaged bytes.
    pub fn set_counter(&mut self, counter: u32) {
        self.counter = counter;
    }

    /// IV of the most recent operation (the header IV before the first one).
    pub fn last_iv(&self) -> [u8; IV_SIZE] {
        self.iv
    }

    /// Claim the next counter value and return the IV that goes with it.
    pub fn next_iv(&mut self) -> [u8; IV_SIZE] {
        self.iv[..4].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self.counter.wrapping_add(1);
        self.iv
    }

    fn iv_for(&self, counter: u32) -> [u8; IV_SIZE] {
        let mut iv = self.iv;
        iv[..4].copy_from_slice(&counter.to_be_bytes());
        iv
    }

    /// Decode the 4-byte length prefix of the next frame without consuming
    /// its counter value.
    pub fn peek_frame_length(&self, prefix: [u8; LENGTH_SIZE]) -> u32 {
        let mut bytes = prefix;
        if self.version >= 1 {
            let iv = self.iv_for(self.counter);
            ctr_cipher(self.material.cipher_key(), &iv).apply_keystream(&mut bytes);
        }
        u32::from_be_bytes(bytes)
    }

    /// Encrypt a serialized frame into a complete envelope, length prefix included.
    pub fn encrypt_frame(&mut self, plaintext: &[u8]) -> SigbakResult<Vec<u8>> {
        let length = u32::try_from(plaintext.len() + MAC_SIZE).map_err(|_| {
            SigbakError::Other(anyhow::anyhow!(
                "frame of {} bytes does not fit a 32-bit length",
                plaintext.len()
            ))
        })?;
        let iv = self.next_iv();

        let mut out = Vec::with_capacity(LENGTH_SIZE + plaintext.len() + MAC_SIZE);
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(plaintext);

        let mut cipher = ctr_cipher(self.material.cipher_key(), &iv);
        let mut mac = new_mac(self.material.mac_key())?;
        if self.version >= 1 {
            cipher.apply_keystream(&mut out);
            mac.update(&out);
        } else {
            cipher.apply_keystream(&mut out[LENGTH_SIZE..]);
            mac.update(&out[LENGTH_SIZE..]);
        }
        let tag = mac.finalize().into_bytes();
        out.extend_from_slice(&tag[..MAC_SIZE]);
        Ok(out)
    }

    /// Decrypt an envelope and report whether it authenticated.
    ///
    /// Consumes one counter value whatever the outcome, so the stream stays
    /// aligned after a bad frame.
    pub fn open_frame(&mut self, envelope: &[u8]) -> SigbakResult<OpenedFrame> {
        let iv = self.next_iv();
        if envelope.len() < LENGTH_SIZE + MAC_SIZE {
            return Err(SigbakError::ParseFailure(format!(
                "frame envelope of {} bytes is shorter than its prefix and MAC",
                envelope.len()
            )));
        }

        let (body, their_mac) = envelope.split_at(envelope.len() - MAC_SIZE);
        let mut mac = new_mac(self.material.mac_key())?;
        if self.version >= 1 {
            mac.update(body);
        } else {
            mac.update(&body[LENGTH_SIZE..]);
        }
        let mac_ok = mac.verify_truncated_left(their_mac).is_ok();

        let mut plaintext = body.to_vec();
        let mut cipher = ctr_cipher(self.material.cipher_key(), &iv);
        if self.version >= 1 {
            cipher.apply_keystream(&mut plaintext);
        } else {
            cipher.apply_keystream(&mut plaintext[LENGTH_SIZE..]);
        }
        let length = u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
        let length_ok = length as usize == envelope.len() - LENGTH_SIZE;
        plaintext.drain(..LENGTH_SIZE);

        Ok(OpenedFrame {
            plaintext,
            mac_ok,
            length_ok,
        })
    }

    /// Inverse of [`FrameCodec::encrypt_frame`]. Any MAC or length mismatch
    /// is an `AuthenticationFailure`.
    pub fn decrypt_frame(&mut self, envelope: &[u8]) -> SigbakResult<Vec<u8>> {
        let counter = self.counter;
        let opened = self.open_frame(envelope)?;
        if !opened.mac_ok {
            return Err(SigbakError::AuthenticationFailure(format!(
                "frame MAC mismatch (counter {counter})"
            )));
        }
        if !opened.length_ok {
            return Err(SigbakError::AuthenticationFailure(format!(
                "frame length prefix does not match envelope (counter {counter})"
            )));
        }
        Ok(opened.plaintext)
    }

    pub fn encrypt_attachment(&mut self, data: &[u8]) -> SigbakResult<Vec<u8>> {
        let iv = self.next_iv();
        seal_attachment(&self.material, &iv, data)
    }

    pub fn decrypt_attachment(&mut self, envelope: &[u8]) -> SigbakResult<Vec<u8>> {
        let iv = self.next_iv();
        open_attachment(&self.material, &iv, envelope)
    }
}

/// Encrypt an attachment payload under an explicit IV: `E(data) ‖ mac10`.
pub fn seal_attachment(
    material: &CipherMaterial,
    iv: &[u8; IV_SIZE],
    data: &[u8],
) -> SigbakResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + MAC_SIZE);
    out.extend_from_slice(data);
    ctr_cipher(material.cipher_key(), iv).apply_keystream(&mut out);

    let mut mac = new_mac(material.mac_key())?;
    mac.update(iv);
    mac.update(&out);
    let tag = mac.finalize().into_bytes();
    out.extend_from_slice(&tag[..MAC_SIZE]);
    Ok(out)
}

/// Verify and decrypt an attachment envelope produced under `iv`.
pub fn open_attachment(
    material: &CipherMaterial,
    iv: &[u8; IV_SIZE],
    envelope: &[u8],
) -> SigbakResult<Vec<u8>> {
    if envelope.len() < MAC_SIZE {
        return Err(SigbakError::ParseFailure(format!(
            "attachment envelope of {} bytes is shorter than its MAC",
            envelope.len()
        )));
    }
    let (ciphertext, their_mac) = envelope.split_at(envelope.len() - MAC_SIZE);

    let mut mac = new_mac(material.mac_key())?;
    mac.update(iv);
    mac.update(ciphertext);
    mac.verify_truncated_left(their_mac).map_err(|_| {
        SigbakError::AuthenticationFailure(format!(
            "attachment MAC mismatch (counter {})",
            u32::from_be_bytes([iv[0], iv[1], iv[2], iv[3]])
        ))
    })?;

    let mut data = ciphertext.to_vec();
    ctr_cipher(material.cipher_key(), iv).apply_keystream(&mut data);
    Ok(data)
}

fn ctr_cipher(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Aes256Ctr {
    Aes256Ctr::new(key.into(), iv.into())
}

fn new_mac(key: &[u8; KEY_SIZE]) -> SigbakResult<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| SigbakError::Other(anyhow::anyhow!("HMAC key setup failed: {e}")))
}
