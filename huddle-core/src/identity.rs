//! Peer identity and crypto: keypairs, peer IDs, link keys, wire encryption.

use std::fmt;
use std::hash::{Hash, Hasher};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// X25519 public key (32 bytes). Travels in announces and invitation frames.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Stable peer token: first 16 bytes of SHA-256 of the public key.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PeerId([u8; 16]);

impl PeerId {
    /// Derive a peer ID from a public key (same derivation `Keypair` uses).
    pub fn from_public_key(public: &PublicKey) -> Self {
        let digest = Sha256::digest(public.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PeerId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short hex prefix; enough to tell peers apart in logs.
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// A participant as shown to the application: token plus display name.
/// Equality and hashing go by `id` only; the display name is advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub display_name: String,
}

impl PeerIdentity {
    pub fn new(id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// X25519 keypair. The secret never leaves this struct; peers see only the
/// public key and the derived ID.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    id: PeerId,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let id = PeerId::from_public_key(&public);
        Self { secret, public, id }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    /// The local participant under a chosen display name.
    pub fn identity(&self, display_name: impl Into<String>) -> PeerIdentity {
        PeerIdentity::new(self.id, display_name)
    }

    /// Raw ECDH shared secret with another peer's public key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(*other_public.as_bytes());
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Which end of the invitation handshake this link is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Sent the `Invite` frame.
    Initiator,
    /// Accepted the `Invite` frame.
    Responder,
}

/// Per-link directional keys. Each direction encrypts under its own key so
/// the 64-bit counter nonces never collide between the two directions.
pub struct LinkKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
}

/// Derive both directions' keys from the ECDH shared secret.
pub fn derive_link_keys(shared_secret: &[u8; 32], role: LinkRole) -> LinkKeys {
    let initiator_to_responder = derive_key(shared_secret, b"i2r");
    let responder_to_initiator = derive_key(shared_secret, b"r2i");
    match role {
        LinkRole::Initiator => LinkKeys {
            send: initiator_to_responder,
            recv: responder_to_initiator,
        },
        LinkRole::Responder => LinkKeys {
            send: responder_to_initiator,
            recv: initiator_to_responder,
        },
    }
}

fn derive_key(shared_secret: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"huddle-link-v1");
    hasher.update(label);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// One direction of wire encryption: ChaCha20-Poly1305 with a 96-bit nonce
/// whose low 64 bits are a record counter. Records must be opened in the
/// order they were sealed, which TCP guarantees per link.
pub struct WireCipher {
    cipher: ChaCha20Poly1305,
    next_nonce: u64,
}

impl WireCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(&chacha20poly1305::Key::from(*key)),
            next_nonce: 0,
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        let nonce = counter_nonce(self.next_nonce);
        let out = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| WireCryptoError::Encrypt)?;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        Ok(out)
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        let nonce = counter_nonce(self.next_nonce);
        let out = self
            .cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| WireCryptoError::Decrypt)?;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        Ok(out)
    }
}

fn counter_nonce(counter: u64) -> chacha20poly1305::Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    chacha20poly1305::Nonce::from(bytes)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_matches_keypair_derivation() {
        let kp = Keypair::generate();
        assert_eq!(PeerId::from_public_key(kp.public_key()), kp.peer_id());
    }

    #[test]
    fn ecdh_is_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(a.shared_secret(b.public_key()), b.shared_secret(a.public_key()));
    }

    #[test]
    fn link_keys_pair_up_across_roles() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let ka = derive_link_keys(&a.shared_secret(b.public_key()), LinkRole::Initiator);
        let kb = derive_link_keys(&b.shared_secret(a.public_key()), LinkRole::Responder);
        assert_eq!(ka.send, kb.recv);
        assert_eq!(ka.recv, kb.send);
        assert_ne!(ka.send, ka.recv);
    }

    #[test]
    fn seal_open_in_order() {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let mut tx = WireCipher::new(&key);
        let mut rx = WireCipher::new(&key);

        let first = tx.seal(b"hello").unwrap();
        let second = tx.seal(b"hello").unwrap();
        assert_ne!(first, second, "counter nonce must change per record");
        assert_eq!(rx.open(&first).unwrap(), b"hello");
        assert_eq!(rx.open(&second).unwrap(), b"hello");
    }

    #[test]
    fn open_rejects_tampered_record() {
        let key = [7u8; 32];
        let mut tx = WireCipher::new(&key);
        let mut rx = WireCipher::new(&key);
        let mut sealed = tx.seal(b"payload").unwrap();
        sealed[0] ^= 0xff;
        assert!(rx.open(&sealed).is_err());
    }

    #[test]
    fn open_rejects_out_of_order_record() {
        let key = [9u8; 32];
        let mut tx = WireCipher::new(&key);
        let mut rx = WireCipher::new(&key);
        let _first = tx.seal(b"one").unwrap();
        let second = tx.seal(b"two").unwrap();
        assert!(rx.open(&second).is_err(), "skipping a record desyncs the counter");
    }

    #[test]
    fn identity_equality_ignores_display_name() {
        let kp = Keypair::generate();
        let a = kp.identity("Office iPad");
        let b = kp.identity("Renamed");
        assert_eq!(a, b);
        assert_ne!(a, Keypair::generate().identity("Office iPad"));
    }
}
