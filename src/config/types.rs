use std::collections::HashSet;

use anyhow::Result;
use serde::Deserialize;

use crate::proxy::crypto::CipherKind;

/// One provisioned access key: a named secret bound to a listening port.
/// Multiple keys may share a port (multi-tenant).
#[derive(Debug, Clone, Deserialize)]
pub struct AccessKey {
    pub id: String,
    pub port: u16,
    pub cipher: String,
    pub secret: String,
}

/// A configuration snapshot: the ordered access-key fleet.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub keys: Vec<AccessKey>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<(u16, &str)> = HashSet::new();
        for (idx, key) in self.keys.iter().enumerate() {
            if key.id.is_empty() {
                anyhow::bail!("key #{}: 'id' must not be empty", idx);
            }
            if key.port == 0 {
                anyhow::bail!("key '{}': port must be in 1..65535", key.id);
            }
            CipherKind::parse(&key.cipher)
                .map_err(|e| anyhow::anyhow!("key '{}': {}", key.id, e))?;
            if !seen.insert((key.port, key.id.as_str())) {
                tracing::warn!(
                    id = key.id.as_str(),
                    port = key.port,
                    "duplicate key id on port, later entry wins"
                );
            }
        }
        Ok(())
    }
}
