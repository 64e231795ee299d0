use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::ProxyStream;
use crate::proxy::crypto::{derive_subkey, AeadCipher};
use crate::proxy::replay::ReplayGuard;
use crate::proxy::CipherEntry;

/// Maximum plaintext chunk size permitted by the framing (14 bits).
pub const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

enum ReadState {
    Salt { salt_buf: Vec<u8>, salt_read: usize },
    Length { len_buf: Vec<u8>, len_read: usize },
    Payload { payload_buf: Vec<u8>, payload_read: usize },
}

enum WriteState {
    Ready,
    Writing {
        data: Vec<u8>,
        written: usize,
        original_len: usize,
    },
}

/// Server-side framed AEAD stream: reads decrypt the client's
/// salt-prefixed chunk sequence, writes produce a fresh server salt
/// followed by encrypted chunks. Both salts are handled lazily, so the
/// stream can sit over a replay buffer holding bytes a probe already
/// consumed, and nothing is written until there is data to send.
pub struct AeadStream {
    inner: ProxyStream,
    entry: Arc<CipherEntry>,
    replay: Option<Arc<ReplayGuard>>,
    decoder: Option<AeadCipher>,
    encoder: Option<AeadCipher>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_state: ReadState,
    write_state: WriteState,
}

impl std::fmt::Debug for AeadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadStream").finish_non_exhaustive()
    }
}

impl AeadStream {
    pub fn new(inner: ProxyStream, entry: Arc<CipherEntry>, replay: Option<Arc<ReplayGuard>>) -> Self {
        let salt_len = entry.kind.salt_len();
        Self {
            inner,
            entry,
            replay,
            decoder: None,
            encoder: None,
            read_buf: Vec::new(),
            read_pos: 0,
            read_state: ReadState::Salt {
                salt_buf: vec![0u8; salt_len],
                salt_read: 0,
            },
            write_state: WriteState::Ready,
        }
    }
}

impl AsyncRead for AeadStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.read_pos < this.read_buf.len() {
                let remaining = &this.read_buf[this.read_pos..];
                let to_copy = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..to_copy]);
                this.read_pos += to_copy;
                if this.read_pos >= this.read_buf.len() {
                    this.read_buf.clear();
                    this.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match &mut this.read_state {
                ReadState::Salt { salt_buf, salt_read } => {
                    while *salt_read < salt_buf.len() {
                        let mut rb = ReadBuf::new(&mut salt_buf[*salt_read..]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                            Poll::Ready(Ok(())) => {
                                let n = rb.filled().len();
                                if n == 0 {
                                    if *salt_read == 0 {
                                        // Peer closed without sending anything.
                                        return Poll::Ready(Ok(()));
                                    }
                                    return Poll::Ready(Err(std::io::Error::new(
                                        std::io::ErrorKind::UnexpectedEof,
                                        "connection closed while reading salt",
                                    )));
                                }
                                *salt_read += n;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    if let Some(replay) = &this.replay {
                        if !replay.check_and_remember(salt_buf) {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "replayed salt",
                            )));
                        }
                    }

                    let subkey = derive_subkey(
                        &this.entry.master_key,
                        salt_buf,
                        this.entry.kind.key_len(),
                    )
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                    this.decoder = Some(AeadCipher::new(this.entry.kind, subkey));

                    let tag_len = this.entry.kind.tag_len();
                    this.read_state = ReadState::Length {
                        len_buf: vec![0u8; 2 + tag_len],
                        len_read: 0,
                    };
                }
                ReadState::Length { len_buf, len_read } => {
                    while *len_read < len_buf.len() {
                        let mut rb = ReadBuf::new(&mut len_buf[*len_read..]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                            Poll::Ready(Ok(())) => {
                                let n = rb.filled().len();
                                if n == 0 {
                                    if *len_read == 0 {
                                        // EOF at a chunk boundary is a clean
                                        // close; propagate it for half-close.
                                        return Poll::Ready(Ok(()));
                                    }
                                    return Poll::Ready(Err(std::io::Error::new(
                                        std::io::ErrorKind::UnexpectedEof,
                                        "connection closed inside length frame",
                                    )));
                                }
                                *len_read += n;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    let Some(decoder) = this.decoder.as_mut() else {
                        return Poll::Ready(Err(std::io::Error::other(
                            "length frame before salt",
                        )));
                    };
                    let len_plain = decoder
                        .decrypt(len_buf)
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                    if len_plain.len() < 2 {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "invalid length frame",
                        )));
                    }

                    let payload_len = u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize;
                    if payload_len > MAX_PAYLOAD_SIZE {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!(
                                "payload length {} exceeds maximum {}",
                                payload_len, MAX_PAYLOAD_SIZE
                            ),
                        )));
                    }

                    let tag_len = this.entry.kind.tag_len();
                    this.read_state = ReadState::Payload {
                        payload_buf: vec![0u8; payload_len + tag_len],
                        payload_read: 0,
                    };
                }
                ReadState::Payload {
                    payload_buf,
                    payload_read,
                } => {
                    while *payload_read < payload_buf.len() {
                        let mut rb = ReadBuf::new(&mut payload_buf[*payload_read..]);
                        match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                            Poll::Ready(Ok(())) => {
                                let n = rb.filled().len();
                                if n == 0 {
                                    return Poll::Ready(Err(std::io::Error::new(
                                        std::io::ErrorKind::UnexpectedEof,
                                        "connection closed inside payload frame",
                                    )));
                                }
                                *payload_read += n;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    let Some(decoder) = this.decoder.as_mut() else {
                        return Poll::Ready(Err(std::io::Error::other(
                            "payload frame before salt",
                        )));
                    };
                    let payload = decoder
                        .decrypt(payload_buf)
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                    this.read_buf = payload;
                    this.read_pos = 0;

                    let tag_len = this.entry.kind.tag_len();
                    this.read_state = ReadState::Length {
                        len_buf: vec![0u8; 2 + tag_len],
                        len_read: 0,
                    };
                }
            }
        }
    }
}

impl AsyncWrite for AeadStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match &mut this.write_state {
                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }

                    let mut data = Vec::new();
                    let encoder = match this.encoder.as_mut() {
                        Some(encoder) => encoder,
                        None => {
                            // First write: a fresh server salt precedes the
                            // first encrypted chunk.
                            let mut salt = vec![0u8; this.entry.kind.salt_len()];
                            rand::thread_rng().fill(&mut salt[..]);
                            let subkey = derive_subkey(
                                &this.entry.master_key,
                                &salt,
                                this.entry.kind.key_len(),
                            )
                            .map_err(|e| std::io::Error::other(e.to_string()))?;
                            data = salt;
                            this.encoder.insert(AeadCipher::new(this.entry.kind, subkey))
                        }
                    };

                    let chunk_len = buf.len().min(MAX_PAYLOAD_SIZE);
                    let chunk = &buf[..chunk_len];
                    let encrypted_len = encoder
                        .encrypt(&(chunk_len as u16).to_be_bytes())
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                    let encrypted_payload = encoder
                        .encrypt(chunk)
                        .map_err(|e| std::io::Error::other(e.to_string()))?;

                    data.reserve(encrypted_len.len() + encrypted_payload.len());
                    data.extend_from_slice(&encrypted_len);
                    data.extend_from_slice(&encrypted_payload);

                    this.write_state = WriteState::Writing {
                        data,
                        written: 0,
                        original_len: chunk_len,
                    };
                }
                WriteState::Writing {
                    data,
                    written,
                    original_len,
                } => {
                    while *written < data.len() {
                        match Pin::new(&mut this.inner).poll_write(cx, &data[*written..]) {
                            Poll::Ready(Ok(n)) => {
                                if n == 0 {
                                    return Poll::Ready(Err(std::io::Error::new(
                                        std::io::ErrorKind::WriteZero,
                                        "write returned 0",
                                    )));
                                }
                                *written += n;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    let n = *original_len;
                    this.write_state = WriteState::Ready;
                    return Poll::Ready(Ok(n));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
