//! Intent Signing
//!
//! The core validates signatures over a canonical field encoding; the wire
//! scheme (EIP-712 or otherwise) lives with the transport layer and plugs in
//! through `SignatureVerifier`.

use sha3::{Digest, Keccak256};

use crate::models::order::{CancelIntent, OrderIntent};

/// Domain separation tag mixed into every digest.
const DOMAIN_TAG: &[u8] = b"memeperp-core/v1";

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("signature does not verify for trader {0}")]
    Invalid(String),

    #[error("signature blob malformed: {0}")]
    Malformed(String),
}

/// Canonical digest of an order intent. Field order is part of the contract;
/// changing it invalidates every outstanding signature.
pub fn order_digest(intent: &OrderIntent) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(DOMAIN_TAG);
    hasher.update(b"order");
    hasher.update(intent.trader.as_bytes());
    hasher.update(intent.symbol.as_bytes());
    hasher.update([intent.side.direction() as u8]);
    hasher.update(intent.order_type.to_string().as_bytes());
    hasher.update(intent.size.to_be_bytes());
    hasher.update(intent.leverage_bp.to_be_bytes());
    hasher.update(intent.price.to_be_bytes());
    hasher.update(intent.trigger_price.unwrap_or(0).to_be_bytes());
    hasher.update(intent.deadline.to_be_bytes());
    hasher.update(intent.nonce.to_be_bytes());
    hasher.finalize().into()
}

/// Canonical digest of a cancel intent.
pub fn cancel_digest(intent: &CancelIntent) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(DOMAIN_TAG);
    hasher.update(b"cancel");
    hasher.update(intent.trader.as_bytes());
    hasher.update(intent.order_id.as_bytes());
    hasher.finalize().into()
}

/// Pluggable signature scheme.
pub trait SignatureVerifier: Send + Sync {
    fn verify_order(&self, intent: &OrderIntent) -> Result<(), SignatureError>;
    fn verify_cancel(&self, intent: &CancelIntent) -> Result<(), SignatureError>;
}

/// Accepts every intent. For development and tests only; production wires a
/// real scheme through the transport layer.
pub struct AllowAllVerifier;

impl SignatureVerifier for AllowAllVerifier {
    fn verify_order(&self, _intent: &OrderIntent) -> Result<(), SignatureError> {
        Ok(())
    }

    fn verify_cancel(&self, _intent: &CancelIntent) -> Result<(), SignatureError> {
        Ok(())
    }
}

/// Commitment scheme used by local tooling: the signature blob is the hex
/// canonical digest. Proves the signer saw the exact canonical fields.
pub struct DigestCommitVerifier;

impl SignatureVerifier for DigestCommitVerifier {
    fn verify_order(&self, intent: &OrderIntent) -> Result<(), SignatureError> {
        let expected = hex::encode(order_digest(intent));
        if intent.signature == expected {
            Ok(())
        } else {
            Err(SignatureError::Invalid(intent.trader.clone()))
        }
    }

    fn verify_cancel(&self, intent: &CancelIntent) -> Result<(), SignatureError> {
        let expected = hex::encode(cancel_digest(intent));
        if intent.signature == expected {
            Ok(())
        } else {
            Err(SignatureError::Invalid(intent.trader.clone()))
        }
    }
}
