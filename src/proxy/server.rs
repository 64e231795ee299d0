use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::config::{self, AccessKey};
use crate::metrics::MetricsSink;
use crate::proxy::port::Port;
use crate::proxy::KeySet;

/// Owns the listening-port fleet and applies configuration snapshots to
/// it. `run` blocks until a termination signal.
pub struct Server {
    ports: HashMap<u16, Port>,
    metrics: Arc<dyn MetricsSink>,
    udp_timeout: Duration,
}

impl Server {
    pub fn new(metrics: Arc<dyn MetricsSink>, udp_timeout: Duration) -> Self {
        Self {
            ports: HashMap::new(),
            metrics,
            udp_timeout,
        }
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Reconcile the port fleet with a snapshot: stop ports no longer
    /// configured, start new ones, swap key sets on the rest.
    ///
    /// Every key set for the snapshot is built up front, so a bad cipher
    /// rejects the whole snapshot before any port is touched. Bind
    /// failures are reported in the returned error but do not stop the
    /// remaining mutations; already-running ports always stay up.
    pub async fn apply(&mut self, keys: &[AccessKey]) -> Result<()> {
        let mut grouped: HashMap<u16, Vec<AccessKey>> = HashMap::new();
        for key in keys {
            grouped.entry(key.port).or_default().push(key.clone());
        }

        let mut desired: Vec<(u16, Arc<KeySet>)> = Vec::with_capacity(grouped.len());
        for (number, port_keys) in grouped {
            let keyset = KeySet::from_keys(&port_keys)
                .with_context(|| format!("invalid key set for port {}", number))?;
            desired.push((number, Arc::new(keyset)));
        }
        desired.sort_by_key(|(number, _)| *number);

        let current: Vec<u16> = self.ports.keys().copied().collect();
        for number in current {
            if !desired.iter().any(|(n, _)| *n == number) {
                if let Some(port) = self.ports.remove(&number) {
                    port.stop();
                }
            }
        }

        let mut failed_binds: Vec<u16> = Vec::new();
        for (number, keyset) in desired {
            match self.ports.get(&number) {
                Some(port) => port.replace_keys(keyset),
                None => match Port::start(
                    number,
                    keyset,
                    self.metrics.clone(),
                    self.udp_timeout,
                )
                .await
                {
                    Ok(port) => {
                        self.ports.insert(number, port);
                    }
                    Err(e) => {
                        error!(port = number, error = %e, "failed to start port");
                        failed_binds.push(number);
                    }
                },
            }
        }

        let total_keys: usize = self.ports.values().map(|p| p.key_count()).sum();
        self.metrics.set_num_access_keys(total_keys, self.ports.len());
        info!(
            keys = total_keys,
            ports = self.ports.len(),
            "configuration applied"
        );

        if !failed_binds.is_empty() {
            anyhow::bail!("failed to bind port(s): {:?}", failed_binds);
        }
        Ok(())
    }

    /// Load the config, apply it, then serve until SIGINT/SIGTERM.
    /// SIGHUP reloads the config file and re-applies; a reload that
    /// fails to parse keeps the previous configuration running.
    pub async fn run(&mut self, config_path: &str) -> Result<()> {
        let snapshot = config::load_config(config_path)?;
        self.apply(&snapshot.keys)
            .await
            .context("initial configuration apply failed")?;

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("received SIGHUP, reloading configuration");
                    match config::load_config(config_path) {
                        Ok(snapshot) => {
                            if let Err(e) = self.apply(&snapshot.keys).await {
                                error!(error = %e, "reload applied incompletely");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "config reload failed, keeping previous configuration");
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received interrupt, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Stop all ports. In-flight connections run to completion; only
    /// the accept loops and UDP pumps end here.
    pub fn shutdown(&mut self) {
        for (_, port) in self.ports.drain() {
            port.stop();
        }
    }
}
