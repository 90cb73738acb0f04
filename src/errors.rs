//! Core error taxonomy for the resolution path.

use thiserror::Error;

/// Every failure in the codec / store / dispatcher path collapses into one of
/// these kinds. The dispatcher maps them onto DNS response codes; the admin
/// service maps them onto HTTP statuses. No error is ever surfaced to a UDP
/// client as a transport failure.
#[derive(Debug, Error)]
pub enum DnsError {
    /// Decode failure: short read, oversize packet, compression jump loop.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The local store had no matching records.
    #[error("not found: {0}")]
    NotFound(String),

    /// No upstream is configured, or the forwarded exchange failed.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Encoder overflow or another invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}
