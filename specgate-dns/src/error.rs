//! DNS error codes.

use thiserror::Error;

/// Failures a DNS request can end with.
///
/// `Format`, `ServerFail`, `NotImpl` and `Refused` mirror the RFC 1035
/// response codes; the rest are local conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// The server could not interpret the query (rcode 1)
    #[error("DNS format error")]
    Format,

    /// The server failed to process the query (rcode 2)
    #[error("DNS server failure")]
    ServerFail,

    /// The name does not exist (rcode 3)
    #[error("DNS name does not exist")]
    NotExist,

    /// The server does not support the query type (rcode 4)
    #[error("DNS query not implemented")]
    NotImpl,

    /// The server refused the query (rcode 5)
    #[error("DNS query refused")]
    Refused,

    /// Unrecognized rcode
    #[error("unknown DNS response code {0}")]
    Unknown(u8),

    /// The request deadline elapsed
    #[error("DNS request timed out")]
    Timeout,

    /// No nameserver accepted the query
    #[error("no DNS servers available")]
    NoServer,

    /// The resolver is shutting down
    #[error("DNS resolver shut down")]
    Shutdown,

    /// A malformed packet or name
    #[error("DNS parse error: {0}")]
    Parse(String),
}

impl DnsError {
    /// Construct from an RFC 1035 response code; `None` means success.
    pub fn from_rcode(rcode: u8) -> Option<DnsError> {
        match rcode {
            0 => None,
            1 => Some(DnsError::Format),
            2 => Some(DnsError::ServerFail),
            3 => Some(DnsError::NotExist),
            4 => Some(DnsError::NotImpl),
            5 => Some(DnsError::Refused),
            other => Some(DnsError::Unknown(other)),
        }
    }

    /// True for errors that count against a nameserver's health.
    ///
    /// `NotExist` is an authoritative answer, not a server fault.
    pub fn is_server_failure(&self) -> bool {
        !matches!(self, DnsError::NotExist)
    }
}
