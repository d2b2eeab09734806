//! Asynchronous recursive DNS resolver.
//!
//! Resolves A/AAAA and PTR records over UDP against a configured set of
//! nameservers with per-query timeouts, a retry budget, spoofing guards
//! (randomized query case, source address checks) and a TTL cache. The
//! resolver backs the gateway's outbound HTTP client.

mod error;
mod nameserver;
mod resolver;
pub mod wire;

pub use error::DnsError;
pub use resolver::{Resolver, ResolverConfig};
pub use wire::RecordType;
