use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aes::Aes192;
use aes_gcm::{AeadInPlace, Aes128Gcm, Aes256Gcm, AesGcm, KeyInit};
use anyhow::{bail, Result};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest as Md5Digest, Md5};
use rand::Rng;
use sha1::Sha1;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// AEAD cipher methods accepted in access keys. Stream ciphers and the
/// SS2022 family are rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-192-gcm" => Ok(CipherKind::Aes192Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            other => bail!("unsupported cipher '{}': only AEAD methods are accepted", other),
        }
    }

    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes192Gcm => 24,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// Salt length in bytes (same as key length).
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    /// AEAD tag length in bytes (16 for every supported method).
    pub fn tag_len(&self) -> usize {
        16
    }
}

/// Derive the master key from a password using EVP_BytesToKey (OpenSSL
/// compatible): D_0 = MD5(password), D_i = MD5(D_{i-1} || password),
/// concatenated until key_len bytes are available.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev_hash: Option<Vec<u8>> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(ref prev) = prev_hash {
            hasher.update(prev);
        }
        hasher.update(password);
        let hash = hasher.finalize().to_vec();
        key.extend_from_slice(&hash);
        prev_hash = Some(hash);
    }

    key.truncate(key_len);
    key
}

/// Derive the per-session subkey: HKDF-SHA1 with info = b"ss-subkey".
pub fn derive_subkey(key: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(b"ss-subkey", &mut subkey)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {}", e))?;
    Ok(subkey)
}

fn seal_in_place<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8; 12],
    buf: &mut Vec<u8>,
) -> Result<()> {
    let cipher = C::new(GenericArray::from_slice(key));
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), b"", buf)
        .map_err(|e| anyhow::anyhow!("AEAD encrypt failed: {}", e))?;
    buf.extend_from_slice(tag.as_slice());
    Ok(())
}

fn open_in_place<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8; 12],
    buf: &mut Vec<u8>,
    tag: &[u8],
) -> Result<()> {
    let cipher = C::new(GenericArray::from_slice(key));
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            buf,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| anyhow::anyhow!("AEAD authentication failed"))
}

/// AEAD cipher with the Shadowsocks nonce counter: a 12-byte little-endian
/// counter starting at zero, incremented once per sealed or opened chunk.
pub struct AeadCipher {
    kind: CipherKind,
    key: Vec<u8>,
    nonce: u64,
}

impl AeadCipher {
    pub fn new(kind: CipherKind, subkey: Vec<u8>) -> Self {
        Self {
            kind,
            key: subkey,
            nonce: 0,
        }
    }

    fn nonce_bytes_and_increment(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce += 1;
        nonce
    }

    /// Encrypt a plaintext chunk, returning ciphertext with the tag appended.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce_bytes_and_increment();
        let mut buf = plaintext.to_vec();
        match self.kind {
            CipherKind::Aes128Gcm => seal_in_place::<Aes128Gcm>(&self.key, &nonce, &mut buf)?,
            CipherKind::Aes192Gcm => seal_in_place::<Aes192Gcm>(&self.key, &nonce, &mut buf)?,
            CipherKind::Aes256Gcm => seal_in_place::<Aes256Gcm>(&self.key, &nonce, &mut buf)?,
            CipherKind::ChaCha20Poly1305 => {
                seal_in_place::<ChaCha20Poly1305>(&self.key, &nonce, &mut buf)?
            }
        }
        Ok(buf)
    }

    /// Decrypt a ciphertext chunk with its appended tag, returning plaintext.
    /// Fails on tag mismatch without consuming the nonce ordering guarantee:
    /// the counter still advances, matching the sender's framing.
    pub fn decrypt(&mut self, ciphertext_with_tag: &[u8]) -> Result<Vec<u8>> {
        let tag_len = self.kind.tag_len();
        if ciphertext_with_tag.len() < tag_len {
            bail!(
                "ciphertext too short: {} bytes, need at least {} for tag",
                ciphertext_with_tag.len(),
                tag_len
            );
        }

        let nonce = self.nonce_bytes_and_increment();
        let ct_len = ciphertext_with_tag.len() - tag_len;
        let mut buf = ciphertext_with_tag[..ct_len].to_vec();
        let tag = &ciphertext_with_tag[ct_len..];
        match self.kind {
            CipherKind::Aes128Gcm => open_in_place::<Aes128Gcm>(&self.key, &nonce, &mut buf, tag)?,
            CipherKind::Aes192Gcm => open_in_place::<Aes192Gcm>(&self.key, &nonce, &mut buf, tag)?,
            CipherKind::Aes256Gcm => open_in_place::<Aes256Gcm>(&self.key, &nonce, &mut buf, tag)?,
            CipherKind::ChaCha20Poly1305 => {
                open_in_place::<ChaCha20Poly1305>(&self.key, &nonce, &mut buf, tag)?
            }
        }
        Ok(buf)
    }
}

/// Seal a single UDP datagram: fresh random salt, then one chunk encrypted
/// with the salt-derived subkey at nonce zero.
pub fn seal_datagram(kind: CipherKind, master_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut packet = vec![0u8; kind.salt_len()];
    rand::thread_rng().fill(&mut packet[..]);
    let subkey = derive_subkey(master_key, &packet, kind.key_len())?;
    let sealed = AeadCipher::new(kind, subkey).encrypt(plaintext)?;
    packet.extend_from_slice(&sealed);
    Ok(packet)
}

/// Open a single UDP datagram sealed by `seal_datagram`.
pub fn open_datagram(kind: CipherKind, master_key: &[u8], packet: &[u8]) -> Result<Vec<u8>> {
    let salt_len = kind.salt_len();
    if packet.len() < salt_len + kind.tag_len() {
        bail!("datagram too short: {} bytes", packet.len());
    }
    let subkey = derive_subkey(master_key, &packet[..salt_len], kind.key_len())?;
    AeadCipher::new(kind, subkey).decrypt(&packet[salt_len..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_kind_parse() {
        assert_eq!(
            CipherKind::parse("aes-128-gcm").unwrap(),
            CipherKind::Aes128Gcm
        );
        assert_eq!(
            CipherKind::parse("aes-192-gcm").unwrap(),
            CipherKind::Aes192Gcm
        );
        assert_eq!(
            CipherKind::parse("AES-256-GCM").unwrap(),
            CipherKind::Aes256Gcm
        );
        assert_eq!(
            CipherKind::parse("chacha20-ietf-poly1305").unwrap(),
            CipherKind::ChaCha20Poly1305
        );
        assert!(CipherKind::parse("aes-128-cfb").is_err());
        assert!(CipherKind::parse("rc4-md5").is_err());
        assert!(CipherKind::parse("2022-blake3-aes-128-gcm").is_err());
    }

    #[test]
    fn cipher_kind_lengths() {
        assert_eq!(CipherKind::Aes128Gcm.key_len(), 16);
        assert_eq!(CipherKind::Aes192Gcm.key_len(), 24);
        assert_eq!(CipherKind::Aes256Gcm.key_len(), 32);
        assert_eq!(CipherKind::ChaCha20Poly1305.key_len(), 32);

        assert_eq!(CipherKind::Aes128Gcm.salt_len(), 16);
        assert_eq!(CipherKind::Aes192Gcm.salt_len(), 24);
        assert_eq!(CipherKind::ChaCha20Poly1305.salt_len(), 32);

        assert_eq!(CipherKind::Aes192Gcm.tag_len(), 16);
    }

    #[test]
    fn evp_bytes_to_key_known_vector() {
        // MD5("test") = 098f6bcd4621d373cade4e832627b4f6
        let key = evp_bytes_to_key(b"test", 16);
        assert_eq!(
            key,
            [
                0x09, 0x8f, 0x6b, 0xcd, 0x46, 0x21, 0xd3, 0x73, 0xca, 0xde, 0x4e, 0x83, 0x26, 0x27,
                0xb4, 0xf6
            ]
        );
    }

    #[test]
    fn evp_bytes_to_key_longer_than_digest() {
        let key = evp_bytes_to_key(b"password", 32);
        assert_eq!(key.len(), 32);
        // First digest block must match the 16-byte derivation.
        assert_eq!(key[..16], evp_bytes_to_key(b"password", 16)[..]);
    }

    #[test]
    fn derive_subkey_depends_on_salt() {
        let key = vec![0x42u8; 32];
        let a = derive_subkey(&key, &[1u8; 32], 32).unwrap();
        let b = derive_subkey(&key, &[2u8; 32], 32).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn aead_roundtrip_all_kinds() {
        for kind in [
            CipherKind::Aes128Gcm,
            CipherKind::Aes192Gcm,
            CipherKind::Aes256Gcm,
            CipherKind::ChaCha20Poly1305,
        ] {
            let subkey = vec![0x42u8; kind.key_len()];
            let mut enc = AeadCipher::new(kind, subkey.clone());
            let mut dec = AeadCipher::new(kind, subkey);

            let plaintext = b"hello world";
            let ciphertext = enc.encrypt(plaintext).unwrap();
            assert_eq!(ciphertext.len(), plaintext.len() + kind.tag_len());
            assert_eq!(dec.decrypt(&ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn aead_nonce_advances_per_chunk() {
        let subkey = vec![0x42u8; 16];
        let mut enc = AeadCipher::new(CipherKind::Aes128Gcm, subkey.clone());
        let mut dec = AeadCipher::new(CipherKind::Aes128Gcm, subkey);

        let c1 = enc.encrypt(b"first").unwrap();
        let c2 = enc.encrypt(b"second").unwrap();
        assert_eq!(dec.decrypt(&c1).unwrap(), b"first");
        assert_eq!(dec.decrypt(&c2).unwrap(), b"second");
    }

    #[test]
    fn aead_out_of_order_chunk_fails() {
        let subkey = vec![0x42u8; 16];
        let mut enc = AeadCipher::new(CipherKind::Aes128Gcm, subkey.clone());
        let mut dec = AeadCipher::new(CipherKind::Aes128Gcm, subkey);

        let _c1 = enc.encrypt(b"first").unwrap();
        let c2 = enc.encrypt(b"second").unwrap();
        // Decrypting chunk 2 at nonce 0 must fail.
        assert!(dec.decrypt(&c2).is_err());
    }

    #[test]
    fn aead_wrong_key_fails() {
        let mut enc = AeadCipher::new(CipherKind::Aes256Gcm, vec![1u8; 32]);
        let mut dec = AeadCipher::new(CipherKind::Aes256Gcm, vec![2u8; 32]);
        let ciphertext = enc.encrypt(b"secret").unwrap();
        assert!(dec.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn aead_decrypt_too_short() {
        let mut cipher = AeadCipher::new(CipherKind::Aes128Gcm, vec![0x42u8; 16]);
        assert!(cipher.decrypt(&[0u8; 10]).is_err());
    }

    #[test]
    fn datagram_roundtrip() {
        let master = evp_bytes_to_key(b"hunter2", 32);
        let packet =
            seal_datagram(CipherKind::ChaCha20Poly1305, &master, b"dns query").unwrap();
        assert_eq!(packet.len(), 32 + 9 + 16);
        let plain = open_datagram(CipherKind::ChaCha20Poly1305, &master, &packet).unwrap();
        assert_eq!(plain, b"dns query");
    }

    #[test]
    fn datagram_tamper_detected() {
        let master = evp_bytes_to_key(b"hunter2", 16);
        let mut packet = seal_datagram(CipherKind::Aes128Gcm, &master, b"payload").unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0x01;
        assert!(open_datagram(CipherKind::Aes128Gcm, &master, &packet).is_err());
    }

    #[test]
    fn datagram_wrong_key_rejected() {
        let packet =
            seal_datagram(CipherKind::Aes128Gcm, &evp_bytes_to_key(b"a", 16), b"x").unwrap();
        assert!(open_datagram(CipherKind::Aes128Gcm, &evp_bytes_to_key(b"b", 16), &packet).is_err());
    }

    #[test]
    fn datagram_too_short_rejected() {
        let master = evp_bytes_to_key(b"a", 16);
        assert!(open_datagram(CipherKind::Aes128Gcm, &master, &[0u8; 20]).is_err());
    }
}
