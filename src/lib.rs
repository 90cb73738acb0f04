//! relaydns — a small caching and forwarding DNS resolver with an HTTP
//! admin API for programmatic record management.
//!
//! End-user queries arrive over UDP and are answered from an in-memory,
//! TTL-expiring record store; on a miss the original packet is forwarded to
//! a configured upstream resolver and any answers it returns are cached.
//! The admin service registers records and issues lookups through the same
//! resolution path.
//!
//! Known limitation: a stored CNAME answers queries of any type for its
//! name, but the CNAME target is never chased.

pub mod admin;
pub mod config;
pub mod dns_server;
pub mod errors;
pub mod metrics;
pub mod packet;
pub mod resolver;
pub mod store;
pub mod upstream;
