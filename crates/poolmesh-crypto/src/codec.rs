//! Streaming, seekable AEAD codec (spec.md §4.2)
//!
//! Every ciphertext blob begins with a fixed 24-byte header: 8 bytes
//! little-endian key-id, followed by a 16-byte IV. The payload is AES-CTR
//! keyed by `AES-128-key = MD5(SHA-256(value))` where `value` is the
//! keystore entry for that key-id. Readers/writers are additionally
//! wrapped with a Blake2b-256 hash of the *plaintext* side, matching the
//! `hash` field signed in a feed entry's head.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use digest::Digest;
use md5::Md5;
use poolmesh_core::{KeyId, PoolError, Result};
use sha2::Sha256;
use std::io::{self, Read, Seek, SeekFrom, Write};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
/// Blake2b with a 256-bit (32-byte) digest, matching spec.md's `hash` field.
pub type Blake2b256 = blake2::Blake2b<digest::consts::U32>;

/// Length of the fixed codec header, in bytes.
pub const HEADER_LEN: usize = 24;
const IV_LEN: usize = 16;

/// A function that resolves a key-id to its 32-byte symmetric value.
/// Returns `None` for an unknown key-id ("UnknownKey" in spec.md §7).
pub trait KeyFn {
    /// Look up the value for `key_id`.
    fn lookup(&self, key_id: KeyId) -> Option<[u8; 32]>;
}

impl<F: Fn(KeyId) -> Option<[u8; 32]>> KeyFn for F {
    fn lookup(&self, key_id: KeyId) -> Option<[u8; 32]> {
        self(key_id)
    }
}

/// Derive the AES-128 stream key for a keystore value:
/// `MD5(SHA-256(value))` (spec.md §4.2).
pub fn derive_stream_key(value: &[u8; 32]) -> [u8; 16] {
    let sha = Sha256::digest(value);
    let digest = Md5::digest(sha);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

fn build_header(key_id: KeyId, iv: &[u8; IV_LEN]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..8].copy_from_slice(&key_id.0.to_le_bytes());
    header[8..24].copy_from_slice(iv);
    header
}

fn parse_header(bytes: &[u8; HEADER_LEN]) -> (KeyId, [u8; IV_LEN]) {
    let mut key_bytes = [0u8; 8];
    key_bytes.copy_from_slice(&bytes[0..8]);
    let key_id = KeyId(u64::from_le_bytes(key_bytes));
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&bytes[8..24]);
    (key_id, iv)
}

/// One-shot encrypt: produce `header || ciphertext` plus the plaintext's
/// Blake2b-256 hash, matching spec.md §4.4 "Publish" steps 2/5.
pub fn encrypt(key_id: KeyId, keyfn: &dyn KeyFn, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; 32])> {
    let value = keyfn
        .lookup(key_id)
        .ok_or_else(|| PoolError::unknown_key(format!("no value for {key_id}")))?;
    let stream_key = derive_stream_key(&value);

    let mut iv = [0u8; IV_LEN];
    use rand::RngCore;
    rand::thread_rng().fill_bytes(&mut iv);

    let mut cipher = Aes128Ctr::new((&stream_key).into(), (&iv).into());
    let mut buf = plaintext.to_vec();
    cipher.apply_keystream(&mut buf);

    let mut out = Vec::with_capacity(HEADER_LEN + buf.len());
    out.extend_from_slice(&build_header(key_id, &iv));
    out.extend_from_slice(&buf);

    let hash: [u8; 32] = Blake2b256::digest(plaintext).into();
    Ok((out, hash))
}

/// One-shot decrypt of a `header || ciphertext` blob; returns the
/// plaintext and its Blake2b-256 hash. Callers compare the returned hash
/// to the declared `hash` field to detect `IntegrityError` (spec.md §4.4
/// "Fetch").
pub fn decrypt(keyfn: &dyn KeyFn, blob: &[u8]) -> Result<(Vec<u8>, [u8; 32])> {
    if blob.len() < HEADER_LEN {
        return Err(PoolError::invalid_id("ciphertext shorter than codec header"));
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&blob[..HEADER_LEN]);
    let (key_id, iv) = parse_header(&header);

    let value = keyfn
        .lookup(key_id)
        .ok_or_else(|| PoolError::unknown_key(format!("no value for {key_id}")))?;
    let stream_key = derive_stream_key(&value);

    let mut cipher = Aes128Ctr::new((&stream_key).into(), (&iv).into());
    let mut buf = blob[HEADER_LEN..].to_vec();
    cipher.apply_keystream(&mut buf);

    let hash: [u8; 32] = Blake2b256::digest(&buf).into();
    Ok((buf, hash))
}

/// A `Read + Seek` wrapper that encrypts an underlying plaintext source on
/// the fly, emitting the 24-byte header before any payload bytes.
///
/// `seek` operates in payload-offset coordinates: `SeekStart(0)` lands just
/// past the header, and `SeekEnd` is resolved against the inner source's
/// length (the header offset is added transparently), matching spec.md
/// §4.2 "exposes seek in payload-offset coordinates".
pub struct EncryptingReader<R> {
    inner: R,
    cipher: Aes128Ctr,
    header: [u8; HEADER_LEN],
    header_pos: usize,
}

impl<R: Read + Seek> EncryptingReader<R> {
    /// Wrap `inner` so it is encrypted under `key_id`'s value, as looked up
    /// through `keyfn`.
    pub fn new(inner: R, key_id: KeyId, keyfn: &dyn KeyFn) -> Result<Self> {
        let value = keyfn
            .lookup(key_id)
            .ok_or_else(|| PoolError::unknown_key(format!("no value for {key_id}")))?;
        let stream_key = derive_stream_key(&value);
        let mut iv = [0u8; IV_LEN];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut iv);
        let cipher = Aes128Ctr::new((&stream_key).into(), (&iv).into());
        Ok(Self { inner, cipher, header: build_header(key_id, &iv), header_pos: 0 })
    }
}

impl<R: Read> Read for EncryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        if self.header_pos < HEADER_LEN {
            let remaining = &self.header[self.header_pos..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.header_pos += n;
            written += n;
            if written == buf.len() {
                return Ok(written);
            }
        }
        let n = self.inner.read(&mut buf[written..])?;
        self.cipher.apply_keystream(&mut buf[written..written + n]);
        Ok(written + n)
    }
}

impl<R: Read + Seek> Seek for EncryptingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let payload_pos = match pos {
            SeekFrom::Start(offset) => {
                let inner_pos = self.inner.seek(SeekFrom::Start(offset))?;
                self.header_pos = HEADER_LEN;
                inner_pos
            }
            SeekFrom::End(offset) => {
                let inner_pos = self.inner.seek(SeekFrom::End(offset))?;
                self.header_pos = HEADER_LEN;
                inner_pos
            }
            SeekFrom::Current(offset) => {
                let inner_pos = self.inner.seek(SeekFrom::Current(offset))?;
                inner_pos
            }
        };
        self.cipher
            .try_seek(payload_pos)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(payload_pos)
    }
}

/// A `Write` wrapper that decrypts ciphertext written to it, forwarding
/// plaintext to an inner sink. Stateful: it accumulates the first 24
/// header bytes before it can construct the cipher (spec.md §4.2 "A
/// decrypting writer is stateful").
pub struct DecryptingWriter<'a, W> {
    inner: W,
    keyfn: &'a dyn KeyFn,
    header_buf: Vec<u8>,
    cipher: Option<Aes128Ctr>,
}

impl<'a, W: Write> DecryptingWriter<'a, W> {
    /// Wrap `inner`, resolving the stream key via `keyfn` once the header
    /// arrives.
    pub fn new(inner: W, keyfn: &'a dyn KeyFn) -> Self {
        Self { inner, keyfn, header_buf: Vec::with_capacity(HEADER_LEN), cipher: None }
    }

    /// Consume the writer, returning the inner sink.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<'a, W: Write> Write for DecryptingWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let total = buf.len();
        let mut offset = 0;

        if self.cipher.is_none() {
            let need = HEADER_LEN - self.header_buf.len();
            let take = need.min(buf.len());
            self.header_buf.extend_from_slice(&buf[..take]);
            offset += take;
            if self.header_buf.len() < HEADER_LEN {
                return Ok(total);
            }
            let mut header = [0u8; HEADER_LEN];
            header.copy_from_slice(&self.header_buf);
            let (key_id, iv) = parse_header(&header);
            let value = self.keyfn.lookup(key_id).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, format!("unknown key {key_id}"))
            })?;
            let stream_key = derive_stream_key(&value);
            self.cipher = Some(Aes128Ctr::new((&stream_key).into(), (&iv).into()));
        }

        if offset < buf.len() {
            let mut chunk = buf[offset..].to_vec();
            self.cipher.as_mut().expect("cipher initialized above").apply_keystream(&mut chunk);
            self.inner.write_all(&chunk)?;
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
