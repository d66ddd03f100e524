//! Pluggable stream ciphers for the encrypted tunnel outbound.
//!
//! A [`CipherCodec`] turns plaintext into framed ciphertext and back; the
//! [`CipherStream`] adapter runs any codec over any async byte stream. Codecs
//! are looked up by name in a [`CipherRegistry`], which ships with the
//! Shadowsocks AEAD ciphers (`aes-128-gcm`, `aes-256-gcm`) and can be extended.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hkdf::Hkdf;
use md5::{Digest, Md5};
use rand::RngCore;
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{DispatchError, Result};

/// Frame-level encryption for one connection. Each instance owns the state of
/// both directions of exactly one stream.
pub trait CipherCodec: Send + Sync {
    /// Appends the ciphertext for `plain` to `out`, preceded by any
    /// per-session preamble on the first call.
    fn seal(&mut self, plain: &[u8], out: &mut BytesMut) -> io::Result<()>;

    /// Consumes one complete frame from the front of `input`.
    /// `Ok(None)` means more input is needed.
    fn open(&mut self, input: &mut BytesMut) -> io::Result<Option<Bytes>>;

    /// Largest plaintext a single `seal` call accepts.
    fn max_chunk(&self) -> usize;
}

pub type CipherConstructor = Arc<dyn Fn(&str) -> Box<dyn CipherCodec> + Send + Sync>;

/// Name -> codec constructor.
#[derive(Clone)]
pub struct CipherRegistry {
    ciphers: HashMap<String, CipherConstructor>,
}

impl Default for CipherRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("aes-128-gcm", |password| {
            Box::new(AeadCodec::new(AeadKind::Aes128Gcm, password))
        });
        registry.register("aes-256-gcm", |password| {
            Box::new(AeadCodec::new(AeadKind::Aes256Gcm, password))
        });
        registry
    }
}

impl fmt::Debug for CipherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.ciphers.keys().collect();
        names.sort();
        f.debug_struct("CipherRegistry").field("ciphers", &names).finish()
    }
}

impl CipherRegistry {
    pub fn empty() -> Self {
        Self {
            ciphers: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&str) -> Box<dyn CipherCodec> + Send + Sync + 'static,
    {
        self.ciphers
            .insert(name.to_ascii_lowercase(), Arc::new(constructor));
    }

    pub fn constructor(&self, name: &str) -> Result<CipherConstructor> {
        self.ciphers
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| DispatchError::config(format!("unknown cipher {name}")))
    }

    pub fn build(&self, name: &str, password: &str) -> Result<Box<dyn CipherCodec>> {
        let constructor = self.constructor(name)?;
        Ok(constructor(password))
    }
}

const AEAD_TAG_LEN: usize = 16;
const AEAD_NONCE_LEN: usize = 12;
const AEAD_MAX_PAYLOAD: usize = 0x3FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadKind {
    Aes128Gcm,
    Aes256Gcm,
}

impl AeadKind {
    fn key_len(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm => 32,
        }
    }
}

enum AeadCipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

impl AeadCipher {
    fn new(kind: AeadKind, key: &[u8]) -> io::Result<Self> {
        let bad_key = |_| io::Error::new(io::ErrorKind::InvalidInput, "invalid AEAD key length");
        Ok(match kind {
            AeadKind::Aes128Gcm => Self::Aes128(Aes128Gcm::new_from_slice(key).map_err(bad_key)?),
            AeadKind::Aes256Gcm => Self::Aes256(Aes256Gcm::new_from_slice(key).map_err(bad_key)?),
        })
    }

    fn encrypt(&self, nonce: &[u8; AEAD_NONCE_LEN], msg: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload { msg, aad: &[] };
        let result = match self {
            Self::Aes128(c) => c.encrypt(nonce, payload),
            Self::Aes256(c) => c.encrypt(nonce, payload),
        };
        result.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "AEAD encrypt failed"))
    }

    fn decrypt(&self, nonce: &[u8; AEAD_NONCE_LEN], msg: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload { msg, aad: &[] };
        let result = match self {
            Self::Aes128(c) => c.decrypt(nonce, payload),
            Self::Aes256(c) => c.decrypt(nonce, payload),
        };
        result.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "AEAD authentication failed"))
    }
}

/// One direction's subkey plus its little-endian nonce counter.
struct AeadDirection {
    cipher: AeadCipher,
    nonce: [u8; AEAD_NONCE_LEN],
}

impl AeadDirection {
    fn new(kind: AeadKind, master_key: &[u8], salt: &[u8]) -> io::Result<Self> {
        let subkey = derive_subkey(master_key, salt, kind.key_len())?;
        Ok(Self {
            cipher: AeadCipher::new(kind, &subkey)?,
            nonce: [0u8; AEAD_NONCE_LEN],
        })
    }

    fn next_nonce(&mut self) -> [u8; AEAD_NONCE_LEN] {
        let current = self.nonce;
        for byte in self.nonce.iter_mut() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
        current
    }

    fn seal(&mut self, msg: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher.encrypt(&nonce, msg)
    }

    fn open(&mut self, msg: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher.decrypt(&nonce, msg)
    }
}

/// Shadowsocks AEAD framing: `salt | [len+tag | payload+tag]*`.
pub struct AeadCodec {
    kind: AeadKind,
    master_key: Vec<u8>,
    encrypt: Option<AeadDirection>,
    decrypt: Option<AeadDirection>,
    pending_len: Option<usize>,
}

impl AeadCodec {
    pub fn new(kind: AeadKind, password: &str) -> Self {
        Self {
            kind,
            master_key: evp_bytes_to_key(password.as_bytes(), kind.key_len()),
            encrypt: None,
            decrypt: None,
            pending_len: None,
        }
    }
}

impl CipherCodec for AeadCodec {
    fn seal(&mut self, plain: &[u8], out: &mut BytesMut) -> io::Result<()> {
        if self.encrypt.is_none() {
            let mut salt = vec![0u8; self.kind.key_len()];
            rand::thread_rng().fill_bytes(&mut salt);
            out.put_slice(&salt);
            self.encrypt = Some(AeadDirection::new(self.kind, &self.master_key, &salt)?);
        }
        let Some(encrypt) = self.encrypt.as_mut() else {
            return Ok(());
        };
        for chunk in plain.chunks(AEAD_MAX_PAYLOAD) {
            out.put_slice(&encrypt.seal(&(chunk.len() as u16).to_be_bytes())?);
            out.put_slice(&encrypt.seal(chunk)?);
        }
        Ok(())
    }

    fn open(&mut self, input: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if self.decrypt.is_none() {
            let salt_len = self.kind.key_len();
            if input.len() < salt_len {
                return Ok(None);
            }
            let salt = input.split_to(salt_len);
            self.decrypt = Some(AeadDirection::new(self.kind, &self.master_key, &salt)?);
        }
        let Some(decrypt) = self.decrypt.as_mut() else {
            return Ok(None);
        };

        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if input.len() < 2 + AEAD_TAG_LEN {
                    return Ok(None);
                }
                let header = decrypt.open(&input.split_to(2 + AEAD_TAG_LEN))?;
                let len = (u16::from_be_bytes([header[0], header[1]]) as usize) & AEAD_MAX_PAYLOAD;
                self.pending_len = Some(len);
                len
            }
        };

        if input.len() < len + AEAD_TAG_LEN {
            return Ok(None);
        }
        let payload = decrypt.open(&input.split_to(len + AEAD_TAG_LEN))?;
        self.pending_len = None;
        Ok(Some(Bytes::from(payload)))
    }

    fn max_chunk(&self) -> usize {
        AEAD_MAX_PAYLOAD
    }
}

/// OpenSSL's EVP_BytesToKey with MD5 and no salt, as used for Shadowsocks passwords.
fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

fn derive_subkey(master_key: &[u8], salt: &[u8], len: usize) -> io::Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; len];
    hk.expand(b"ss-subkey", &mut subkey)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "HKDF output too long"))?;
    Ok(subkey)
}

/// Runs a [`CipherCodec`] over an inner stream.
pub struct CipherStream<S> {
    inner: S,
    codec: Box<dyn CipherCodec>,
    read_buf: BytesMut,
    plain: Bytes,
    write_buf: BytesMut,
    eof: bool,
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, codec: Box<dyn CipherCodec>) -> Self {
        Self {
            inner,
            codec,
            read_buf: BytesMut::with_capacity(16 * 1024),
            plain: Bytes::new(),
            write_buf: BytesMut::with_capacity(16 * 1024),
            eof: false,
        }
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plain.is_empty() {
                let n = buf.remaining().min(this.plain.len());
                buf.put_slice(&this.plain[..n]);
                this.plain.advance(n);
                return Poll::Ready(Ok(()));
            }
            if let Some(plain) = this.codec.open(&mut this.read_buf)? {
                this.plain = plain;
                continue;
            }
            if this.eof {
                if this.read_buf.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside an encrypted frame",
                )));
            }

            let mut chunk = [0u8; 8 * 1024];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                this.eof = true;
            } else {
                this.read_buf.extend_from_slice(chunk_buf.filled());
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        let n = data.len().min(this.codec.max_chunk());
        this.codec.seal(&data[..n], &mut this.write_buf)?;
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair(cipher: &str) -> (
        CipherStream<tokio::io::DuplexStream>,
        CipherStream<tokio::io::DuplexStream>,
    ) {
        let registry = CipherRegistry::default();
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            CipherStream::new(a, registry.build(cipher, "secret").unwrap()),
            CipherStream::new(b, registry.build(cipher, "secret").unwrap()),
        )
    }

    #[test]
    fn test_evp_bytes_to_key_known_vector() {
        // MD5("foobar") = 3858f62230ac3c915f300c664312c63f
        let key = evp_bytes_to_key(b"foobar", 16);
        assert_eq!(
            key,
            [
                0x38, 0x58, 0xf6, 0x22, 0x30, 0xac, 0x3c, 0x91, 0x5f, 0x30, 0x0c, 0x66, 0x43,
                0x12, 0xc6, 0x3f
            ]
        );
        assert_eq!(evp_bytes_to_key(b"foobar", 32)[..16], key[..]);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = CipherRegistry::default();
        assert!(registry.constructor("AES-256-GCM").is_ok());
        assert!(registry.constructor("aes-128-gcm").is_ok());
        assert!(registry.constructor("rc4-md5").is_err());
        assert!(matches!(
            registry.build("rc4-md5", "x"),
            Err(DispatchError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_seal_emits_salt_once() {
        let mut codec = AeadCodec::new(AeadKind::Aes128Gcm, "pw");
        let mut out = BytesMut::new();
        codec.seal(b"abc", &mut out).unwrap();
        assert_eq!(out.len(), 16 + (2 + 16) + (3 + 16));

        let mut out = BytesMut::new();
        codec.seal(b"abc", &mut out).unwrap();
        assert_eq!(out.len(), (2 + 16) + (3 + 16));
    }

    #[test]
    fn test_open_waits_for_complete_frame() {
        let mut sealer = AeadCodec::new(AeadKind::Aes256Gcm, "pw");
        let mut opener = AeadCodec::new(AeadKind::Aes256Gcm, "pw");
        let mut wire = BytesMut::new();
        sealer.seal(b"hello world", &mut wire).unwrap();

        let mut input = BytesMut::new();
        let total = wire.len();
        input.extend_from_slice(&wire[..total - 1]);
        assert!(opener.open(&mut input).unwrap().is_none());
        input.extend_from_slice(&wire[total - 1..]);
        assert_eq!(opener.open(&mut input).unwrap().unwrap(), &b"hello world"[..]);
        assert!(input.is_empty());
    }

    #[test]
    fn test_wrong_password_fails_authentication() {
        let mut sealer = AeadCodec::new(AeadKind::Aes256Gcm, "right");
        let mut opener = AeadCodec::new(AeadKind::Aes256Gcm, "wrong");
        let mut wire = BytesMut::new();
        sealer.seal(b"data", &mut wire).unwrap();
        let err = opener.open(&mut wire).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_stream_both_directions() {
        let (mut client, mut server) = pair("aes-256-gcm");

        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong!").await.unwrap();
        server.flush().await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");
    }

    #[tokio::test]
    async fn test_stream_large_payload_is_chunked() {
        let (mut client, mut server) = pair("aes-128-gcm");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
        });
        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }
}
