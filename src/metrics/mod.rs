pub mod http;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Terminal status of one TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnStatus {
    Ok,
    ErrCipher,
    ErrReadAddress,
    ErrConnect,
    ErrRelay,
}

impl ConnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnStatus::Ok => "OK",
            ConnStatus::ErrCipher => "ERR_CIPHER",
            ConnStatus::ErrReadAddress => "ERR_READ_ADDRESS",
            ConnStatus::ErrConnect => "ERR_CONNECT",
            ConnStatus::ErrRelay => "ERR_RELAY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UdpDirection {
    ClientToTarget,
    TargetToClient,
}

impl UdpDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            UdpDirection::ClientToTarget => "client_target",
            UdpDirection::TargetToClient => "target_client",
        }
    }
}

/// Byte counters for one TCP connection. The client leg counts ciphertext
/// on the wire; the target leg counts plaintext to and from the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounts {
    pub client_to_proxy: u64,
    pub proxy_to_client: u64,
    pub proxy_to_target: u64,
    pub target_to_proxy: u64,
}

/// Counters the proxy core reports into. Implementations must be safe for
/// concurrent use from many connection tasks.
pub trait MetricsSink: Send + Sync {
    fn add_open_tcp_connection(&self);
    fn add_closed_tcp_connection(
        &self,
        key_id: &str,
        status: ConnStatus,
        counts: ByteCounts,
        duration: Duration,
    );
    fn add_udp_packet(&self, key_id: &str, direction: UdpDirection, bytes: usize);
    fn add_udp_decrypt_failure(&self);
    fn set_num_access_keys(&self, keys: usize, ports: usize);
}

/// Atomic in-process metrics, rendered in Prometheus text exposition format.
pub struct Metrics {
    open_tcp: AtomicU64,
    closed_tcp: Mutex<HashMap<(String, ConnStatus), u64>>,
    tcp_client_rx: AtomicU64,
    tcp_client_tx: AtomicU64,
    tcp_target_tx: AtomicU64,
    tcp_target_rx: AtomicU64,
    tcp_duration_ms: AtomicU64,
    udp_packets: Mutex<HashMap<(String, UdpDirection), u64>>,
    udp_bytes: Mutex<HashMap<UdpDirection, u64>>,
    udp_decrypt_failures: AtomicU64,
    access_keys: AtomicU64,
    ports: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            open_tcp: AtomicU64::new(0),
            closed_tcp: Mutex::new(HashMap::new()),
            tcp_client_rx: AtomicU64::new(0),
            tcp_client_tx: AtomicU64::new(0),
            tcp_target_tx: AtomicU64::new(0),
            tcp_target_rx: AtomicU64::new(0),
            tcp_duration_ms: AtomicU64::new(0),
            udp_packets: Mutex::new(HashMap::new()),
            udp_bytes: Mutex::new(HashMap::new()),
            udp_decrypt_failures: AtomicU64::new(0),
            access_keys: AtomicU64::new(0),
            ports: AtomicU64::new(0),
        }
    }

    pub fn open_tcp_connections(&self) -> u64 {
        self.open_tcp.load(Ordering::Relaxed)
    }

    pub fn closed_tcp_connections(&self, key_id: &str, status: ConnStatus) -> u64 {
        let closed = self.closed_tcp.lock().unwrap_or_else(|e| e.into_inner());
        closed
            .get(&(key_id.to_string(), status))
            .copied()
            .unwrap_or(0)
    }

    pub fn udp_decrypt_failures(&self) -> u64 {
        self.udp_decrypt_failures.load(Ordering::Relaxed)
    }

    /// Render all counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE keyport_tcp_open_connections gauge\n");
        let _ = writeln!(
            out,
            "keyport_tcp_open_connections {}",
            self.open_tcp.load(Ordering::Relaxed)
        );

        out.push_str("# TYPE keyport_tcp_connections_closed_total counter\n");
        {
            let closed = self.closed_tcp.lock().unwrap_or_else(|e| e.into_inner());
            let mut entries: Vec<_> = closed.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for ((key_id, status), count) in entries {
                let _ = writeln!(
                    out,
                    "keyport_tcp_connections_closed_total{{key=\"{}\",status=\"{}\"}} {}",
                    key_id,
                    status.as_str(),
                    count
                );
            }
        }

        out.push_str("# TYPE keyport_tcp_bytes_total counter\n");
        for (dir, value) in [
            ("client_proxy", &self.tcp_client_rx),
            ("proxy_client", &self.tcp_client_tx),
            ("proxy_target", &self.tcp_target_tx),
            ("target_proxy", &self.tcp_target_rx),
        ] {
            let _ = writeln!(
                out,
                "keyport_tcp_bytes_total{{dir=\"{}\"}} {}",
                dir,
                value.load(Ordering::Relaxed)
            );
        }

        out.push_str("# TYPE keyport_tcp_connection_duration_seconds_total counter\n");
        let _ = writeln!(
            out,
            "keyport_tcp_connection_duration_seconds_total {:.3}",
            self.tcp_duration_ms.load(Ordering::Relaxed) as f64 / 1000.0
        );

        out.push_str("# TYPE keyport_udp_packets_total counter\n");
        {
            let packets = self.udp_packets.lock().unwrap_or_else(|e| e.into_inner());
            let mut entries: Vec<_> = packets.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for ((key_id, dir), count) in entries {
                let _ = writeln!(
                    out,
                    "keyport_udp_packets_total{{key=\"{}\",dir=\"{}\"}} {}",
                    key_id,
                    dir.as_str(),
                    count
                );
            }
        }

        out.push_str("# TYPE keyport_udp_bytes_total counter\n");
        {
            let bytes = self.udp_bytes.lock().unwrap_or_else(|e| e.into_inner());
            let mut entries: Vec<_> = bytes.iter().collect();
            entries.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
            for (dir, count) in entries {
                let _ = writeln!(
                    out,
                    "keyport_udp_bytes_total{{dir=\"{}\"}} {}",
                    dir.as_str(),
                    count
                );
            }
        }

        out.push_str("# TYPE keyport_udp_decrypt_failures_total counter\n");
        let _ = writeln!(
            out,
            "keyport_udp_decrypt_failures_total {}",
            self.udp_decrypt_failures.load(Ordering::Relaxed)
        );

        out.push_str("# TYPE keyport_access_keys gauge\n");
        let _ = writeln!(
            out,
            "keyport_access_keys {}",
            self.access_keys.load(Ordering::Relaxed)
        );
        out.push_str("# TYPE keyport_ports gauge\n");
        let _ = writeln!(out, "keyport_ports {}", self.ports.load(Ordering::Relaxed));

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for Metrics {
    fn add_open_tcp_connection(&self) {
        self.open_tcp.fetch_add(1, Ordering::Relaxed);
    }

    fn add_closed_tcp_connection(
        &self,
        key_id: &str,
        status: ConnStatus,
        counts: ByteCounts,
        duration: Duration,
    ) {
        self.open_tcp.fetch_sub(1, Ordering::Relaxed);
        self.tcp_client_rx
            .fetch_add(counts.client_to_proxy, Ordering::Relaxed);
        self.tcp_client_tx
            .fetch_add(counts.proxy_to_client, Ordering::Relaxed);
        self.tcp_target_tx
            .fetch_add(counts.proxy_to_target, Ordering::Relaxed);
        self.tcp_target_rx
            .fetch_add(counts.target_to_proxy, Ordering::Relaxed);
        self.tcp_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        let mut closed = self.closed_tcp.lock().unwrap_or_else(|e| e.into_inner());
        *closed.entry((key_id.to_string(), status)).or_insert(0) += 1;
    }

    fn add_udp_packet(&self, key_id: &str, direction: UdpDirection, bytes: usize) {
        {
            let mut packets = self.udp_packets.lock().unwrap_or_else(|e| e.into_inner());
            *packets
                .entry((key_id.to_string(), direction))
                .or_insert(0) += 1;
        }
        let mut total = self.udp_bytes.lock().unwrap_or_else(|e| e.into_inner());
        *total.entry(direction).or_insert(0) += bytes as u64;
    }

    fn add_udp_decrypt_failure(&self) {
        self.udp_decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn set_num_access_keys(&self, keys: usize, ports: usize) {
        self.access_keys.store(keys as u64, Ordering::Relaxed);
        self.ports.store(ports as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_pairs_balance_the_gauge() {
        let metrics = Metrics::new();
        metrics.add_open_tcp_connection();
        metrics.add_open_tcp_connection();
        assert_eq!(metrics.open_tcp_connections(), 2);

        metrics.add_closed_tcp_connection(
            "user-1",
            ConnStatus::Ok,
            ByteCounts::default(),
            Duration::from_millis(10),
        );
        assert_eq!(metrics.open_tcp_connections(), 1);
        assert_eq!(metrics.closed_tcp_connections("user-1", ConnStatus::Ok), 1);
        assert_eq!(
            metrics.closed_tcp_connections("user-1", ConnStatus::ErrRelay),
            0
        );
    }

    #[test]
    fn render_contains_all_families() {
        let metrics = Metrics::new();
        metrics.add_open_tcp_connection();
        metrics.add_closed_tcp_connection(
            "k",
            ConnStatus::ErrCipher,
            ByteCounts {
                client_to_proxy: 100,
                proxy_to_client: 0,
                proxy_to_target: 0,
                target_to_proxy: 0,
            },
            Duration::from_millis(5),
        );
        metrics.add_udp_packet("k", UdpDirection::ClientToTarget, 64);
        metrics.add_udp_decrypt_failure();
        metrics.set_num_access_keys(3, 2);

        let text = metrics.render();
        assert!(text.contains("keyport_tcp_open_connections 0"));
        assert!(text
            .contains("keyport_tcp_connections_closed_total{key=\"k\",status=\"ERR_CIPHER\"} 1"));
        assert!(text.contains("keyport_tcp_bytes_total{dir=\"client_proxy\"} 100"));
        assert!(text.contains("keyport_udp_packets_total{key=\"k\",dir=\"client_target\"} 1"));
        assert!(text.contains("keyport_udp_bytes_total{dir=\"client_target\"} 64"));
        assert!(text.contains("keyport_udp_decrypt_failures_total 1"));
        assert!(text.contains("keyport_access_keys 3"));
        assert!(text.contains("keyport_ports 2"));
    }

    #[test]
    fn status_labels_are_stable() {
        assert_eq!(ConnStatus::Ok.as_str(), "OK");
        assert_eq!(ConnStatus::ErrCipher.as_str(), "ERR_CIPHER");
        assert_eq!(ConnStatus::ErrReadAddress.as_str(), "ERR_READ_ADDRESS");
        assert_eq!(ConnStatus::ErrConnect.as_str(), "ERR_CONNECT");
        assert_eq!(ConnStatus::ErrRelay.as_str(), "ERR_RELAY");
    }
}
