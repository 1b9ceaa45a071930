//! Nostr event model and validation.

use anyhow::Result;
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Kind of profile metadata events, replaceable per pubkey.
pub const KIND_SET_METADATA: u32 = 0;
/// Kind of plain text notes.
pub const KIND_TEXT_NOTE: u32 = 1;
/// Kind of relay recommendations, replaceable per (pubkey, content).
pub const KIND_RECOMMEND_SERVER: u32 = 2;
/// Kind of contact lists, replaceable per pubkey.
pub const KIND_CONTACT_LIST: u32 = 3;
/// Kind of encrypted direct messages, gated behind AUTH on read.
pub const KIND_ENCRYPTED_DIRECT_MESSAGE: u32 = 4;
/// Kind of deletion requests targeting other events via `e` tags.
pub const KIND_DELETION: u32 = 5;
/// Kind of NIP-42 client authentication events.
pub const KIND_CLIENT_AUTHENTICATION: u32 = 22242;

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, i.e. the first field.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// Tag value, i.e. the second field.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(|s| s.as_str())
    }
}

/// Core Nostr event received from clients and served to subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Why an event failed id or signature validation.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("invalid: event id is computed incorrectly")]
    IdMismatch,
    #[error("invalid: signature is invalid")]
    BadSignature,
    #[error("error: failed to verify signature")]
    Malformed(#[source] anyhow::Error),
}

impl Event {
    /// Recompute the event hash from the canonical serialization.
    pub fn hash(&self) -> Result<[u8; 32]> {
        let arr =
            serde_json::json!([0, self.pubkey, self.created_at, self.kind, self.tags, self.content]);
        let data = serde_json::to_vec(&arr)?;
        let hash = Sha256::digest(&data);
        Ok(hash.into())
    }

    /// Verify the event's id and Schnorr signature.
    pub fn verify(&self) -> Result<(), VerifyError> {
        let hash = self.hash().map_err(VerifyError::Malformed)?;
        if hex::encode(hash) != self.id {
            return Err(VerifyError::IdMismatch);
        }
        let sig_bytes = hex::decode(&self.sig).map_err(|e| VerifyError::Malformed(e.into()))?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|e| VerifyError::Malformed(e.into()))?;
        let pk_bytes = hex::decode(&self.pubkey).map_err(|e| VerifyError::Malformed(e.into()))?;
        let pk =
            XOnlyPublicKey::from_slice(&pk_bytes).map_err(|e| VerifyError::Malformed(e.into()))?;
        let msg = Message::from_digest_slice(&hash).map_err(|e| VerifyError::Malformed(e.into()))?;
        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &msg, &pk)
            .map_err(|_| VerifyError::BadSignature)
    }

    /// True for kinds that are broadcast but never stored (`20000..30000`).
    pub fn is_ephemeral(&self) -> bool {
        (20000..30000).contains(&self.kind)
    }

    /// True for kinds where one event per (pubkey, kind) survives.
    pub fn is_replaceable(&self) -> bool {
        self.kind == KIND_SET_METADATA
            || self.kind == KIND_CONTACT_LIST
            || (10000..20000).contains(&self.kind)
    }

    /// True for kinds where one event per (pubkey, kind, `d` tag) survives.
    pub fn is_parameterized_replaceable(&self) -> bool {
        (30000..40000).contains(&self.kind)
    }

    /// True for deletion requests.
    pub fn is_deletion(&self) -> bool {
        self.kind == KIND_DELETION
    }

    /// Value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(|t| t.value())
    }

    /// Values of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(|t| t.value())
    }
}
