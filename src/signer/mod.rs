//! Signer capability (§4.S) — the only place this crate touches raw Nostr
//! signing/encryption primitives. Consumed as a port: the core never assumes
//! a particular key-storage strategy, only this trait.

use crate::error::{BridgeError, BridgeResult};
use crate::event::{Event, UnsignedEvent};
use async_trait::async_trait;

#[async_trait]
pub trait Signer: Send + Sync {
    fn get_public_key(&self) -> String;

    async fn sign_event(&self, template: UnsignedEvent) -> BridgeResult<Event>;

    async fn nip04_encrypt(&self, peer_pubkey: &str, plaintext: &str) -> BridgeResult<String>;
    async fn nip04_decrypt(&self, peer_pubkey: &str, ciphertext: &str) -> BridgeResult<String>;

    async fn nip44_encrypt(&self, peer_pubkey: &str, plaintext: &str) -> BridgeResult<String>;
    async fn nip44_decrypt(&self, peer_pubkey: &str, ciphertext: &str) -> BridgeResult<String>;
}

/// A signer backed by an in-memory secp256k1 keypair via the `nostr` crate.
/// This is the only `Signer` implementation the core ships; remote-signer
/// (NIP-46) backends are an external collaborator per §1.
pub struct PrivateKeySigner {
    keys: nostr::Keys,
}

impl PrivateKeySigner {
    pub fn generate() -> Self {
        Self {
            keys: nostr::Keys::generate(),
        }
    }

    pub fn from_hex(secret_hex: &str) -> BridgeResult<Self> {
        let keys = nostr::Keys::parse(secret_hex).map_err(|e| BridgeError::Signer(e.to_string()))?;
        Ok(Self { keys })
    }
}

#[async_trait]
impl Signer for PrivateKeySigner {
    fn get_public_key(&self) -> String {
        self.keys.public_key().to_hex()
    }

    async fn sign_event(&self, template: UnsignedEvent) -> BridgeResult<Event> {
        let id = template.id_hex();
        let message = nostr::secp256k1::Message::from_digest_slice(
            &hex::decode(&id).map_err(|e| BridgeError::Signer(e.to_string()))?,
        )
        .map_err(|e| BridgeError::Signer(e.to_string()))?;
        let sig = self
            .keys
            .sign_schnorr(&message)
            .map_err(|e| BridgeError::Signer(e.to_string()))?;
        Ok(Event {
            id,
            pubkey: template.pubkey,
            created_at: template.created_at,
            kind: template.kind,
            tags: template.tags,
            content: template.content,
            sig: sig.to_string(),
        })
    }

    async fn nip04_encrypt(&self, peer_pubkey: &str, plaintext: &str) -> BridgeResult<String> {
        let pk = nostr::PublicKey::from_hex(peer_pubkey).map_err(|e| BridgeError::Signer(e.to_string()))?;
        nostr::nips::nip04::encrypt(self.keys.secret_key(), &pk, plaintext)
            .map_err(|e| BridgeError::Signer(e.to_string()))
    }

    async fn nip04_decrypt(&self, peer_pubkey: &str, ciphertext: &str) -> BridgeResult<String> {
        let pk = nostr::PublicKey::from_hex(peer_pubkey).map_err(|e| BridgeError::Signer(e.to_string()))?;
        nostr::nips::nip04::decrypt(self.keys.secret_key(), &pk, ciphertext)
            .map_err(|_| BridgeError::DecryptFailed)
    }

    async fn nip44_encrypt(&self, peer_pubkey: &str, plaintext: &str) -> BridgeResult<String> {
        let pk = nostr::PublicKey::from_hex(peer_pubkey).map_err(|e| BridgeError::Signer(e.to_string()))?;
        nostr::nips::nip44::encrypt(
            self.keys.secret_key(),
            &pk,
            plaintext,
            nostr::nips::nip44::Version::V2,
        )
        .map_err(|e| BridgeError::Signer(e.to_string()))
    }

    async fn nip44_decrypt(&self, peer_pubkey: &str, ciphertext: &str) -> BridgeResult<String> {
        let pk = nostr::PublicKey::from_hex(peer_pubkey).map_err(|e| BridgeError::Signer(e.to_string()))?;
        nostr::nips::nip44::decrypt(self.keys.secret_key(), &pk, ciphertext)
            .map_err(|_| BridgeError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signs_event_with_deterministic_id() {
        let signer = PrivateKeySigner::generate();
        let template = UnsignedEvent {
            pubkey: signer.get_public_key(),
            created_at: 1_700_000_000,
            kind: crate::event::KIND_APPLICATION_MESSAGE,
            tags: vec![],
            content: "{}".to_string(),
        };
        let expected_id = template.id_hex();
        let signed = signer.sign_event(template).await.unwrap();
        assert_eq!(signed.id, expected_id);
        assert_eq!(signed.sig.len(), 128);
    }

    #[tokio::test]
    async fn nip04_round_trips() {
        let alice = PrivateKeySigner::generate();
        let bob = PrivateKeySigner::generate();
        let ct = alice
            .nip04_encrypt(&bob.get_public_key(), "hello")
            .await
            .unwrap();
        let pt = bob.nip04_decrypt(&alice.get_public_key(), &ct).await.unwrap();
        assert_eq!(pt, "hello");
    }

    #[tokio::test]
    async fn nip44_round_trips() {
        let alice = PrivateKeySigner::generate();
        let bob = PrivateKeySigner::generate();
        let ct = alice
            .nip44_encrypt(&bob.get_public_key(), "hello nip44")
            .await
            .unwrap();
        let pt = bob.nip44_decrypt(&alice.get_public_key(), &ct).await.unwrap();
        assert_eq!(pt, "hello nip44");
    }
}
