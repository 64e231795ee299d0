pub mod aead;
pub mod crypto;
pub mod finder;
pub mod port;
pub mod relay;
pub mod replay;
pub mod server;
pub mod udp;

use std::sync::Arc;

use anyhow::Result;

use crate::config::AccessKey;
use crypto::{evp_bytes_to_key, CipherKind};

/// A named AEAD cipher bound to one access-key id. The master key is
/// derived from the configured secret once, at construction.
#[derive(Debug)]
pub struct CipherEntry {
    pub id: String,
    pub kind: CipherKind,
    pub master_key: Vec<u8>,
}

impl CipherEntry {
    pub fn new(id: &str, cipher: &str, secret: &str) -> Result<Self> {
        let kind = CipherKind::parse(cipher)?;
        Ok(Self {
            id: id.to_string(),
            kind,
            master_key: evp_bytes_to_key(secret.as_bytes(), kind.key_len()),
        })
    }
}

/// The set of access keys live on one port. Immutable once built; a Port
/// replaces its whole KeySet on reconfiguration, and every connection keeps
/// the snapshot it was accepted under.
pub struct KeySet {
    entries: Vec<Arc<CipherEntry>>,
}

impl KeySet {
    /// Build a key set from the access keys configured for one port.
    /// A later entry with an id already present overwrites the earlier one.
    pub fn from_keys(keys: &[AccessKey]) -> Result<Self> {
        let mut entries: Vec<Arc<CipherEntry>> = Vec::with_capacity(keys.len());
        for key in keys {
            let entry = Arc::new(CipherEntry::new(&key.id, &key.cipher, &key.secret)?);
            match entries.iter_mut().find(|e| e.id == key.id) {
                Some(slot) => {
                    tracing::warn!(id = key.id.as_str(), "duplicate key id, later entry wins");
                    *slot = entry;
                }
                None => entries.push(entry),
            }
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Arc<CipherEntry>] {
        &self.entries
    }

    /// The only entry, when exactly one key is provisioned.
    pub fn single(&self) -> Option<&Arc<CipherEntry>> {
        if self.entries.len() == 1 {
            self.entries.first()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, cipher: &str, secret: &str) -> AccessKey {
        AccessKey {
            id: id.to_string(),
            port: 9000,
            cipher: cipher.to_string(),
            secret: secret.to_string(),
        }
    }

    #[test]
    fn cipher_entry_derives_master_key() {
        let entry = CipherEntry::new("u", "aes-128-gcm", "test").unwrap();
        assert_eq!(entry.kind, CipherKind::Aes128Gcm);
        // EVP_BytesToKey("test") begins with MD5("test").
        assert_eq!(entry.master_key[..4], [0x09, 0x8f, 0x6b, 0xcd]);
    }

    #[test]
    fn cipher_entry_rejects_stream_cipher() {
        assert!(CipherEntry::new("u", "aes-256-cfb", "s").is_err());
    }

    #[test]
    fn keyset_preserves_declaration_order() {
        let keys = vec![
            key("a", "aes-128-gcm", "s1"),
            key("b", "aes-256-gcm", "s2"),
            key("c", "chacha20-ietf-poly1305", "s3"),
        ];
        let set = KeySet::from_keys(&keys).unwrap();
        let ids: Vec<&str> = set.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn keyset_later_duplicate_overwrites() {
        let keys = vec![
            key("a", "aes-128-gcm", "old"),
            key("b", "aes-128-gcm", "other"),
            key("a", "aes-256-gcm", "new"),
        ];
        let set = KeySet::from_keys(&keys).unwrap();
        assert_eq!(set.len(), 2);
        let a = set.entries().iter().find(|e| e.id == "a").unwrap();
        assert_eq!(a.kind, CipherKind::Aes256Gcm);
    }

    #[test]
    fn keyset_single() {
        let set = KeySet::from_keys(&[key("only", "aes-128-gcm", "s")]).unwrap();
        assert_eq!(set.single().unwrap().id, "only");

        let set = KeySet::from_keys(&[
            key("a", "aes-128-gcm", "s"),
            key("b", "aes-128-gcm", "t"),
        ])
        .unwrap();
        assert!(set.single().is_none());
        assert!(KeySet::from_keys(&[]).unwrap().is_empty());
    }

    #[test]
    fn keyset_propagates_cipher_errors() {
        assert!(KeySet::from_keys(&[key("a", "rc4-md5", "s")]).is_err());
    }
}
