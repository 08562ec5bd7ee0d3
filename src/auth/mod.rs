pub mod signature;

pub use signature::{
    AllowAllVerifier, DigestCommitVerifier, SignatureError, SignatureVerifier,
};
