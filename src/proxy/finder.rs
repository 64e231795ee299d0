use std::io;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use lru::LruCache;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::common::ProxyStream;
use crate::proxy::aead::AeadStream;
use crate::proxy::crypto::{derive_subkey, AeadCipher};
use crate::proxy::replay::ReplayGuard;
use crate::proxy::{CipherEntry, KeySet};

const CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no access keys configured on this port")]
    EmptyKeySet,
    #[error("no configured key matches the client handshake")]
    NoValidKey,
    #[error("I/O error while probing: {0}")]
    Io(#[from] io::Error),
}

/// Most-recently-successful key id per client IP. Probe order is a pure
/// optimization: a cache hit moves that key to the front of the trial
/// sequence, making the common reconnect a single AEAD verification.
pub struct KeyCache {
    inner: Mutex<LruCache<IpAddr, String>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
        }
    }

    pub fn get(&self, ip: IpAddr) -> Option<String> {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(&ip).cloned()
    }

    pub fn remember(&self, ip: IpAddr, id: &str) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(ip, id.to_string());
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The handshake bytes a probe consumed, handed back to the framed
/// reader ahead of the live stream. The selected cipher must decode the
/// very bytes it was authenticated against, so the probe's buffer is
/// drained first and the wire is never re-read.
struct ReplayedHandshake {
    handshake: Bytes,
    inner: ProxyStream,
}

impl ReplayedHandshake {
    fn new(handshake: Vec<u8>, inner: ProxyStream) -> Self {
        Self {
            handshake: Bytes::from(handshake),
            inner,
        }
    }
}

impl AsyncRead for ReplayedHandshake {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.handshake.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        let n = this.handshake.len().min(buf.remaining());
        buf.put_slice(&this.handshake.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ReplayedHandshake {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Identify which access key a client stream is encrypted under.
///
/// The Shadowsocks wire carries no key id, so the key is found by trial:
/// for each candidate, enough bytes for its salt plus the first length
/// frame are read (at most once from the wire, retained in a replay
/// buffer) and the frame's tag is verified. Tag verification proves
/// possession of the candidate's secret. On success the replay buffer is
/// re-attached in front of the stream, so the framed reader consumes the
/// very same bytes the probe authenticated.
///
/// A single-entry key set is selected without probing; a wrong secret then
/// surfaces on the first framed read. EOF during a trial fails only that
/// candidate; any other I/O error poisons the stream and aborts the probe.
pub async fn identify(
    mut stream: ProxyStream,
    keys: &KeySet,
    replay: Option<Arc<ReplayGuard>>,
    cache: &KeyCache,
    client_ip: IpAddr,
) -> Result<(Arc<CipherEntry>, AeadStream), ProbeError> {
    if keys.is_empty() {
        return Err(ProbeError::EmptyKeySet);
    }
    if let Some(entry) = keys.single() {
        return Ok((entry.clone(), AeadStream::new(stream, entry.clone(), replay)));
    }

    let mut order: Vec<Arc<CipherEntry>> = keys.entries().to_vec();
    if let Some(hit) = cache.get(client_ip) {
        if let Some(pos) = order.iter().position(|e| e.id == hit) {
            order.swap(0, pos);
        }
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut eof = false;

    for entry in &order {
        let need = entry.kind.salt_len() + 2 + entry.kind.tag_len();
        while buf.len() < need && !eof {
            let mut chunk = [0u8; 64];
            let want = (need - buf.len()).min(chunk.len());
            let n = stream.read(&mut chunk[..want]).await?;
            if n == 0 {
                eof = true;
            } else {
                buf.extend_from_slice(&chunk[..n]);
            }
        }
        if buf.len() < need {
            // Stream ended before this candidate's handshake could exist.
            continue;
        }

        let salt_len = entry.kind.salt_len();
        let Ok(subkey) = derive_subkey(&entry.master_key, &buf[..salt_len], entry.kind.key_len())
        else {
            continue;
        };
        let mut trial = AeadCipher::new(entry.kind, subkey);
        if trial.decrypt(&buf[salt_len..need]).is_ok() {
            cache.remember(client_ip, &entry.id);
            let wrapped = AeadStream::new(
                Box::new(ReplayedHandshake::new(buf, stream)),
                entry.clone(),
                replay,
            );
            return Ok((entry.clone(), wrapped));
        }
    }

    Err(ProbeError::NoValidKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MeteredStream;
    use crate::config::AccessKey;
    use crate::proxy::crypto::CipherKind;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::AsyncWriteExt;

    fn key(id: &str, cipher: &str, secret: &str) -> AccessKey {
        AccessKey {
            id: id.to_string(),
            port: 9000,
            cipher: cipher.to_string(),
            secret: secret.to_string(),
        }
    }

    fn client_ip() -> IpAddr {
        "198.51.100.7".parse().unwrap()
    }

    /// Client handshake bytes for one entry: salt plus framed chunks.
    fn client_wire(entry: &CipherEntry, chunks: &[&[u8]]) -> Vec<u8> {
        let mut salt = vec![0u8; entry.kind.salt_len()];
        rand::Rng::fill(&mut rand::thread_rng(), &mut salt[..]);
        let subkey = derive_subkey(&entry.master_key, &salt, entry.kind.key_len()).unwrap();
        let mut encoder = AeadCipher::new(entry.kind, subkey);
        let mut wire = salt;
        for chunk in chunks {
            wire.extend_from_slice(&encoder.encrypt(&(chunk.len() as u16).to_be_bytes()).unwrap());
            wire.extend_from_slice(&encoder.encrypt(chunk).unwrap());
        }
        wire
    }

    fn two_tenant_keyset() -> KeySet {
        KeySet::from_keys(&[
            key("k1", "aes-128-gcm", "secret1"),
            key("k2", "chacha20-ietf-poly1305", "secret2"),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn selects_second_tenant_and_preserves_bytes() {
        let keys = two_tenant_keyset();
        let cache = KeyCache::new();
        let wire = client_wire(&keys.entries()[1].clone(), &[b"payload bytes"]);

        let (near, mut far) = tokio::io::duplex(4096);
        far.write_all(&wire).await.unwrap();
        far.shutdown().await.unwrap();

        let (entry, mut stream) = identify(Box::new(near), &keys, None, &cache, client_ip())
            .await
            .unwrap();
        assert_eq!(entry.id, "k2");

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload bytes");
    }

    #[tokio::test]
    async fn unknown_key_fails_with_bounded_reads() {
        let keys = two_tenant_keyset();
        let cache = KeyCache::new();
        let intruder = CipherEntry::new("x", "aes-256-gcm", "not-in-set").unwrap();
        let wire = client_wire(&intruder, &[b"whatever"]);

        let (near, mut far) = tokio::io::duplex(4096);
        far.write_all(&wire).await.unwrap();
        far.shutdown().await.unwrap();

        let consumed = Arc::new(AtomicU64::new(0));
        let metered = MeteredStream::new(
            Box::new(near),
            consumed.clone(),
            Arc::new(AtomicU64::new(0)),
        );

        let err = identify(Box::new(metered), &keys, None, &cache, client_ip())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NoValidKey));

        // The probe never reads past the largest candidate handshake.
        let max_need = keys
            .entries()
            .iter()
            .map(|e| e.kind.salt_len() + 2 + e.kind.tag_len())
            .max()
            .unwrap() as u64;
        assert!(consumed.load(Ordering::Relaxed) <= max_need);
    }

    #[tokio::test]
    async fn empty_keyset_fails_without_reading() {
        let keys = KeySet::from_keys(&[]).unwrap();
        let cache = KeyCache::new();
        let (near, _far) = tokio::io::duplex(64);
        // _far never writes: identify must not block on reads.
        let err = identify(Box::new(near), &keys, None, &cache, client_ip())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::EmptyKeySet));
    }

    #[tokio::test]
    async fn single_key_selected_without_probe() {
        let keys = KeySet::from_keys(&[key("only", "aes-128-gcm", "right")]).unwrap();
        let cache = KeyCache::new();
        // Nothing written yet: with one key there is no trial read.
        let (near, mut far) = tokio::io::duplex(4096);
        let (entry, mut stream) = identify(Box::new(near), &keys, None, &cache, client_ip())
            .await
            .unwrap();
        assert_eq!(entry.id, "only");

        // A wrong-secret client only fails at the first framed read.
        let wrong = CipherEntry::new("w", "aes-128-gcm", "wrong").unwrap();
        far.write_all(&client_wire(&wrong, &[b"data"])).await.unwrap();
        let mut out = [0u8; 1];
        assert!(stream.read_exact(&mut out).await.is_err());
    }

    /// Serves its canned bytes, then fails every further read with a
    /// hard I/O error (not EOF).
    struct FaultyStream {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for FaultyStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if this.pos >= this.data.len() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )));
            }
            let n = (this.data.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.data[this.pos..this.pos + n]);
            this.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for FaultyStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn io_error_aborts_probe_instead_of_next_candidate() {
        let keys = two_tenant_keyset();
        let cache = KeyCache::new();
        // 40 garbage bytes cover the first candidate's trial, which
        // fails its tag check and correctly moves on; the second
        // candidate's fill then hits a real I/O error. That must abort
        // the whole probe, not read as one more failed candidate.
        let stream = FaultyStream {
            data: vec![0x5Au8; 40],
            pos: 0,
        };

        let err = identify(Box::new(stream), &keys, None, &cache, client_ip())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Io(_)));
        assert!(cache.get(client_ip()).is_none());
    }

    #[tokio::test]
    async fn io_error_on_first_read_aborts_probe() {
        let keys = two_tenant_keyset();
        let cache = KeyCache::new();
        let stream = FaultyStream {
            data: Vec::new(),
            pos: 0,
        };

        let err = identify(Box::new(stream), &keys, None, &cache, client_ip())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Io(_)));
    }

    #[tokio::test]
    async fn replayed_handshake_drains_probe_bytes_then_live_stream() {
        let (near, mut far) = tokio::io::duplex(64);
        far.write_all(b" live").await.unwrap();
        far.shutdown().await.unwrap();

        let mut stream = ReplayedHandshake::new(b"probe".to_vec(), Box::new(near));
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"probe live");
    }

    #[tokio::test]
    async fn eof_mid_handshake_is_no_valid_key() {
        let keys = two_tenant_keyset();
        let cache = KeyCache::new();
        let (near, mut far) = tokio::io::duplex(4096);
        far.write_all(&[0u8; 7]).await.unwrap();
        far.shutdown().await.unwrap();

        let err = identify(Box::new(near), &keys, None, &cache, client_ip())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NoValidKey));
    }

    #[tokio::test]
    async fn cache_reorders_but_does_not_change_result() {
        let keys = two_tenant_keyset();
        let cache = KeyCache::new();
        cache.remember(client_ip(), "k2");

        let wire = client_wire(&keys.entries()[0].clone(), &[b"hi"]);
        let (near, mut far) = tokio::io::duplex(4096);
        far.write_all(&wire).await.unwrap();
        far.shutdown().await.unwrap();

        // Cached k2 is tried first and fails; k1 still matches.
        let (entry, _stream) = identify(Box::new(near), &keys, None, &cache, client_ip())
            .await
            .unwrap();
        assert_eq!(entry.id, "k1");
        assert_eq!(cache.get(client_ip()).unwrap(), "k1");
    }

    #[test]
    fn key_cache_evicts_least_recently_used() {
        let cache = KeyCache::new();
        cache.remember(client_ip(), "a");
        cache.remember(client_ip(), "b");
        assert_eq!(cache.get(client_ip()).unwrap(), "b");
        assert!(cache.get("203.0.113.9".parse().unwrap()).is_none());
    }
}
