use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::{socket, Address, MeteredStream, ProxyStream};
use crate::metrics::{ByteCounts, ConnStatus, MetricsSink};
use crate::proxy::finder::{self, KeyCache};
use crate::proxy::relay::relay;
use crate::proxy::replay::ReplayGuard;
use crate::proxy::{udp, KeySet};

/// One listening endpoint: a TCP listener and a UDP socket bound to the
/// same port number, sharing a live KeySet. Stopping the port ends the
/// accept loop and the UDP pump; handlers already running finish on
/// their own.
pub struct Port {
    number: u16,
    keys: Arc<RwLock<Arc<KeySet>>>,
    cancel: CancellationToken,
}

impl Port {
    pub async fn start(
        number: u16,
        initial_keys: Arc<KeySet>,
        metrics: Arc<dyn MetricsSink>,
        udp_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", number))
            .await
            .with_context(|| format!("tcp bind failed on port {}", number))?;
        let udp_socket = UdpSocket::bind(("0.0.0.0", number))
            .await
            .with_context(|| format!("udp bind failed on port {}", number))?;

        let keys = Arc::new(RwLock::new(initial_keys));
        let cancel = CancellationToken::new();
        let cache = Arc::new(KeyCache::new());
        let replay = Arc::new(ReplayGuard::default());

        tokio::spawn(accept_loop(
            listener,
            keys.clone(),
            metrics.clone(),
            cache.clone(),
            replay,
            cancel.clone(),
            number,
        ));
        tokio::spawn(udp::run(
            Arc::new(udp_socket),
            keys.clone(),
            metrics,
            cache,
            udp_timeout,
            cancel.clone(),
            number,
        ));

        info!(port = number, "port started");
        Ok(Self {
            number,
            keys,
            cancel,
        })
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Swap in a new key set. Only connections accepted afterwards see
    /// it; in-flight handlers keep the snapshot they authenticated
    /// against.
    pub fn replace_keys(&self, new_keys: Arc<KeySet>) {
        *self.keys.write().unwrap_or_else(|e| e.into_inner()) = new_keys;
        debug!(port = self.number, "key set replaced");
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        info!(port = self.number, "port stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    keys: Arc<RwLock<Arc<KeySet>>>,
    metrics: Arc<dyn MetricsSink>,
    cache: Arc<KeyCache>,
    replay: Arc<ReplayGuard>,
    cancel: CancellationToken,
    number: u16,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(port = number, "accept loop shutting down");
                break;
            }
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(port = number, error = %e, "accept failed");
                        continue;
                    }
                };
                let keyset = keys.read().unwrap_or_else(|e| e.into_inner()).clone();
                spawn_handler(
                    stream,
                    peer,
                    keyset,
                    metrics.clone(),
                    cache.clone(),
                    replay.clone(),
                );
            }
        }
    }
}

#[derive(Clone)]
struct ConnCounters {
    client_rx: Arc<AtomicU64>,
    client_tx: Arc<AtomicU64>,
    target_rx: Arc<AtomicU64>,
    target_tx: Arc<AtomicU64>,
}

impl ConnCounters {
    fn new() -> Self {
        Self {
            client_rx: Arc::new(AtomicU64::new(0)),
            client_tx: Arc::new(AtomicU64::new(0)),
            target_rx: Arc::new(AtomicU64::new(0)),
            target_tx: Arc::new(AtomicU64::new(0)),
        }
    }

    fn snapshot(&self) -> ByteCounts {
        ByteCounts {
            client_to_proxy: self.client_rx.load(Ordering::Relaxed),
            proxy_to_client: self.client_tx.load(Ordering::Relaxed),
            proxy_to_target: self.target_tx.load(Ordering::Relaxed),
            target_to_proxy: self.target_rx.load(Ordering::Relaxed),
        }
    }
}

fn spawn_handler(
    stream: TcpStream,
    peer: SocketAddr,
    keys: Arc<KeySet>,
    metrics: Arc<dyn MetricsSink>,
    cache: Arc<KeyCache>,
    replay: Arc<ReplayGuard>,
) {
    tokio::spawn(async move {
        metrics.add_open_tcp_connection();
        let started = Instant::now();
        let counters = ConnCounters::new();

        // The handler runs in its own task so a panic is contained:
        // the join error is observed here, the connection is still
        // accounted for, and the accept loop never notices.
        let inner = tokio::spawn(handle_connection(
            stream,
            peer,
            keys,
            cache,
            replay,
            counters.clone(),
        ));
        let (key_id, status) = match inner.await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_panic() {
                    error!(peer = %peer, "connection handler panicked");
                }
                (String::new(), ConnStatus::ErrRelay)
            }
        };

        debug!(
            peer = %peer,
            key = key_id.as_str(),
            status = status.as_str(),
            "connection closed"
        );
        metrics.add_closed_tcp_connection(&key_id, status, counters.snapshot(), started.elapsed());
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    keys: Arc<KeySet>,
    cache: Arc<KeyCache>,
    replay: Arc<ReplayGuard>,
    counters: ConnCounters,
) -> (String, ConnStatus) {
    if let Err(e) = socket::enable_keepalive(&stream) {
        debug!(peer = %peer, error = %e, "client keepalive setup failed");
    }

    // Ciphertext accounting wraps the raw socket, so handshake and probe
    // bytes are counted too.
    let metered: ProxyStream = Box::new(MeteredStream::new(
        Box::new(stream),
        counters.client_rx.clone(),
        counters.client_tx.clone(),
    ));

    let (entry, mut client) =
        match finder::identify(metered, &keys, Some(replay), &cache, peer.ip()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(peer = %peer, error = %e, "access key identification failed");
                return (String::new(), ConnStatus::ErrCipher);
            }
        };
    let key_id = entry.id.clone();

    let target = match Address::read_from(&mut client).await {
        Ok(t) => t,
        Err(e) => {
            warn!(peer = %peer, key = key_id.as_str(), error = %e, "target address read failed");
            return (key_id, ConnStatus::ErrReadAddress);
        }
    };

    let upstream = match dial(&target).await {
        Ok(s) => s,
        Err(e) => {
            warn!(peer = %peer, key = key_id.as_str(), target = %target, error = %e, "target dial failed");
            return (key_id, ConnStatus::ErrConnect);
        }
    };
    if let Err(e) = socket::enable_keepalive(&upstream) {
        debug!(peer = %peer, error = %e, "target keepalive setup failed");
    }
    let mut upstream: ProxyStream = Box::new(MeteredStream::new(
        Box::new(upstream),
        counters.target_rx.clone(),
        counters.target_tx.clone(),
    ));

    debug!(peer = %peer, key = key_id.as_str(), target = %target, "relaying");
    match relay(&mut client, &mut upstream).await {
        Ok(_) => (key_id, ConnStatus::Ok),
        Err(e) => {
            debug!(peer = %peer, key = key_id.as_str(), error = %e, "relay failed");
            (key_id, ConnStatus::ErrRelay)
        }
    }
}

async fn dial(target: &Address) -> Result<TcpStream> {
    let addr = target.resolve().await?;
    Ok(TcpStream::connect(addr).await?)
}
