use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::Address;
use crate::metrics::{MetricsSink, UdpDirection};
use crate::proxy::crypto::{open_datagram, seal_datagram};
use crate::proxy::finder::KeyCache;
use crate::proxy::{CipherEntry, KeySet};

const MAX_DATAGRAM: usize = 64 * 1024;

/// One NAT entry: a client address mapped to a dedicated outbound socket.
/// The key selected on the forward path also encrypts the return path.
struct Session {
    entry: Arc<CipherEntry>,
    outbound: Arc<UdpSocket>,
    cancel: CancellationToken,
    last_active: AtomicI64,
    ttl_ms: i64,
}

impl Session {
    fn new(entry: Arc<CipherEntry>, outbound: UdpSocket, ttl: Duration) -> Self {
        Self {
            entry,
            outbound: Arc::new(outbound),
            cancel: CancellationToken::new(),
            last_active: AtomicI64::new(now_millis()),
            ttl_ms: ttl.as_millis() as i64,
        }
    }

    fn touch(&self) {
        self.last_active.store(now_millis(), Ordering::Relaxed);
    }

    fn is_expired(&self) -> bool {
        now_millis() - self.last_active.load(Ordering::Relaxed) >= self.ttl_ms
    }
}

type SessionTable = Arc<Mutex<HashMap<SocketAddr, Arc<Session>>>>;

/// Per-port UDP pump: receive encrypted client datagrams on the port's
/// main socket, forward decrypted payloads through per-client NAT
/// sessions, and run one return-path task per session.
pub(crate) async fn run(
    socket: Arc<UdpSocket>,
    keys: Arc<RwLock<Arc<KeySet>>>,
    metrics: Arc<dyn MetricsSink>,
    cache: Arc<KeyCache>,
    session_ttl: Duration,
    cancel: CancellationToken,
    port: u16,
) {
    let sessions: SessionTable = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(port = port, "udp pump shutting down");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                let (n, client) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(port = port, error = %e, "udp recv failed");
                        continue;
                    }
                };
                let keyset = keys.read().unwrap_or_else(|e| e.into_inner()).clone();
                handle_datagram(
                    &buf[..n],
                    client,
                    &keyset,
                    &socket,
                    &sessions,
                    &metrics,
                    &cache,
                    session_ttl,
                    port,
                )
                .await;
            }
        }
    }

    // Stop every return-path task with the pump.
    for session in sessions.lock().await.values() {
        session.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_datagram(
    packet: &[u8],
    client: SocketAddr,
    keyset: &Arc<KeySet>,
    socket: &Arc<UdpSocket>,
    sessions: &SessionTable,
    metrics: &Arc<dyn MetricsSink>,
    cache: &Arc<KeyCache>,
    session_ttl: Duration,
    port: u16,
) {
    let existing = sessions
        .lock()
        .await
        .get(&client)
        .filter(|s| !s.is_expired())
        .cloned();
    let hint = existing.as_ref().map(|s| &s.entry);

    let Some((entry, plaintext)) = open_with_keyset(keyset, packet, hint, cache, client.ip())
    else {
        metrics.add_udp_decrypt_failure();
        debug!(port = port, peer = %client, "udp datagram failed to decrypt, dropped");
        return;
    };

    let (target, consumed) = match Address::parse_from_slice(&plaintext) {
        Ok(v) => v,
        Err(e) => {
            debug!(port = port, peer = %client, error = %e, "bad udp target address, dropped");
            return;
        }
    };
    let payload = &plaintext[consumed..];

    let dest = match target.resolve().await {
        Ok(d) => d,
        Err(e) => {
            debug!(port = port, peer = %client, target = %target, error = %e, "udp target resolve failed");
            return;
        }
    };

    let session = match existing {
        Some(session) if session.entry.id == entry.id => session,
        stale => {
            if let Some(old) = stale {
                // Key changed under the same client address: retire the
                // old mapping and its return task.
                old.cancel.cancel();
            }
            let bind_addr = if dest.is_ipv4() {
                SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
            } else {
                SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0)
            };
            let outbound = match UdpSocket::bind(bind_addr).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(port = port, peer = %client, error = %e, "udp outbound bind failed");
                    return;
                }
            };
            let session = Arc::new(Session::new(entry.clone(), outbound, session_ttl));
            sessions.lock().await.insert(client, session.clone());
            debug!(port = port, peer = %client, key = entry.id.as_str(), "udp session opened");
            tokio::spawn(return_pump(
                client,
                session.clone(),
                socket.clone(),
                sessions.clone(),
                metrics.clone(),
                port,
            ));
            session
        }
    };

    session.touch();
    match session.outbound.send_to(payload, dest).await {
        Ok(n) => metrics.add_udp_packet(&entry.id, UdpDirection::ClientToTarget, n),
        Err(e) => {
            warn!(port = port, peer = %client, target = %dest, error = %e, "udp forward failed");
            session.cancel.cancel();
            remove_session(sessions, client, &session).await;
        }
    }
}

/// Return path for one session: datagrams from the outbound socket are
/// sealed under the session's key, prefixed with their source address and
/// sent back through the port's main socket. The task exits on idle
/// expiry, error, or pump shutdown, retiring the NAT entry.
async fn return_pump(
    client: SocketAddr,
    session: Arc<Session>,
    main_socket: Arc<UdpSocket>,
    sessions: SessionTable,
    metrics: Arc<dyn MetricsSink>,
    port: u16,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let idle = Duration::from_millis(session.ttl_ms.max(1) as u64);

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            result = tokio::time::timeout(idle, session.outbound.recv_from(&mut buf)) => {
                match result {
                    Err(_) => {
                        // Idle on the return path; the forward path may
                        // still be refreshing the session.
                        if session.is_expired() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        debug!(port = port, peer = %client, error = %e, "udp return recv failed");
                        break;
                    }
                    Ok(Ok((n, source))) => {
                        session.touch();
                        let mut plain = BytesMut::with_capacity(19 + n);
                        Address::from(source).encode(&mut plain);
                        plain.extend_from_slice(&buf[..n]);
                        match seal_datagram(session.entry.kind, &session.entry.master_key, &plain) {
                            Ok(packet) => {
                                if let Err(e) = main_socket.send_to(&packet, client).await {
                                    debug!(port = port, peer = %client, error = %e, "udp return send failed");
                                    break;
                                }
                                metrics.add_udp_packet(
                                    &session.entry.id,
                                    UdpDirection::TargetToClient,
                                    n,
                                );
                            }
                            Err(e) => {
                                debug!(port = port, peer = %client, error = %e, "udp return seal failed");
                            }
                        }
                    }
                }
            }
        }
    }

    remove_session(&sessions, client, &session).await;
    debug!(port = port, peer = %client, "udp session closed");
}

async fn remove_session(sessions: &SessionTable, client: SocketAddr, session: &Arc<Session>) {
    let mut table = sessions.lock().await;
    if let Some(current) = table.get(&client) {
        if Arc::ptr_eq(current, session) {
            table.remove(&client);
        }
    }
}

/// Trial-decrypt a datagram against the key set. Unlike TCP, every
/// datagram is independent, so a hint (the session's key, then the
/// client-IP cache) is tried before the full scan.
fn open_with_keyset(
    keys: &KeySet,
    packet: &[u8],
    hint: Option<&Arc<CipherEntry>>,
    cache: &KeyCache,
    ip: IpAddr,
) -> Option<(Arc<CipherEntry>, Vec<u8>)> {
    if let Some(entry) = hint {
        if let Ok(plain) = open_datagram(entry.kind, &entry.master_key, packet) {
            return Some((entry.clone(), plain));
        }
    }

    let hinted = hint.map(|e| e.id.clone());
    let cached = cache.get(ip).filter(|id| Some(id) != hinted.as_ref());
    if let Some(id) = &cached {
        if let Some(entry) = keys.entries().iter().find(|e| &e.id == id) {
            if let Ok(plain) = open_datagram(entry.kind, &entry.master_key, packet) {
                return Some((entry.clone(), plain));
            }
        }
    }

    for entry in keys.entries() {
        if Some(&entry.id) == hinted.as_ref() || Some(&entry.id) == cached.as_ref() {
            continue;
        }
        if let Ok(plain) = open_datagram(entry.kind, &entry.master_key, packet) {
            cache.remember(ip, &entry.id);
            return Some((entry.clone(), plain));
        }
    }
    None
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
