//! Venue Error Types
//!
//! Intent-level failures carry a machine-readable rejection code and never
//! mutate state. Resource failures (ledger, mirror) are retried internally
//! and surfaced as operator alerts, not to the caller.

use serde::Serialize;
use uuid::Uuid;

/// Coarse error classification for observability and propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    State,
    Policy,
    Resource,
    Invariant,
}

/// Rejection codes returned to intent submitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Expired,
    BadNonce,
    BadSignature,
    InsufficientFunds,
    PostOnlyWouldCross,
    FokUnfillable,
    ReduceOnlyNoPosition,
    ReduceOnlyWrongSide,
    SymbolUnknown,
    SizeBelowMinimum,
    MaxLeverageExceeded,
    TpslInvalid,
    VenueDegraded,
}

impl RejectReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RejectReason::Expired
            | RejectReason::BadNonce
            | RejectReason::BadSignature
            | RejectReason::SymbolUnknown
            | RejectReason::SizeBelowMinimum => ErrorKind::Validation,
            RejectReason::PostOnlyWouldCross
            | RejectReason::FokUnfillable
            | RejectReason::InsufficientFunds
            | RejectReason::MaxLeverageExceeded
            | RejectReason::TpslInvalid
            | RejectReason::VenueDegraded => ErrorKind::Policy,
            RejectReason::ReduceOnlyNoPosition | RejectReason::ReduceOnlyWrongSide => {
                ErrorKind::State
            }
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::Expired => "expired",
            RejectReason::BadNonce => "bad_nonce",
            RejectReason::BadSignature => "bad_signature",
            RejectReason::InsufficientFunds => "insufficient_funds",
            RejectReason::PostOnlyWouldCross => "post_only_would_cross",
            RejectReason::FokUnfillable => "fok_unfillable",
            RejectReason::ReduceOnlyNoPosition => "reduce_only_no_position",
            RejectReason::ReduceOnlyWrongSide => "reduce_only_wrong_side",
            RejectReason::SymbolUnknown => "symbol_unknown",
            RejectReason::SizeBelowMinimum => "size_below_minimum",
            RejectReason::MaxLeverageExceeded => "max_leverage_exceeded",
            RejectReason::TpslInvalid => "tpsl_invalid",
            RejectReason::VenueDegraded => "venue_degraded",
        };
        write!(f, "{}", s)
    }
}

/// Venue-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("intent rejected: {0}")]
    Rejected(RejectReason),

    #[error("order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("pair not found: {0}")]
    PairNotFound(Uuid),

    #[error("pair not active: {0}")]
    PairNotActive(Uuid),

    #[error("not the owner of {0}")]
    NotOwner(Uuid),

    #[error("order not cancelable: {0}")]
    NotCancelable(Uuid),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("mirror unavailable: {0}")]
    MirrorUnavailable(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl From<RejectReason> for CoreError {
    fn from(reason: RejectReason) -> Self {
        CoreError::Rejected(reason)
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Rejected(reason) => reason.kind(),
            CoreError::OrderNotFound(_)
            | CoreError::PairNotFound(_)
            | CoreError::PairNotActive(_)
            | CoreError::NotOwner(_)
            | CoreError::NotCancelable(_)
            | CoreError::SymbolNotFound(_) => ErrorKind::State,
            CoreError::LedgerUnavailable(_) | CoreError::MirrorUnavailable(_) => {
                ErrorKind::Resource
            }
            CoreError::Invariant(_) => ErrorKind::Invariant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_reason_kinds() {
        assert_eq!(RejectReason::BadNonce.kind(), ErrorKind::Validation);
        assert_eq!(RejectReason::FokUnfillable.kind(), ErrorKind::Policy);
        assert_eq!(RejectReason::ReduceOnlyNoPosition.kind(), ErrorKind::State);
    }

    #[test]
    fn test_core_error_kinds() {
        assert_eq!(
            CoreError::Rejected(RejectReason::Expired).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            CoreError::LedgerUnavailable("down".into()).kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            CoreError::Invariant("oi mismatch".into()).kind(),
            ErrorKind::Invariant
        );
    }

    #[test]
    fn test_reject_reason_display() {
        assert_eq!(
            RejectReason::PostOnlyWouldCross.to_string(),
            "post_only_would_cross"
        );
        assert_eq!(RejectReason::FokUnfillable.to_string(), "fok_unfillable");
    }
}
