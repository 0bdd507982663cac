//! SIP registrar/proxy with an integrated DHCP server, built for IP phone
//! test labs.
//!
//! The crate ships two UDP services sharing one configuration value:
//!
//! * [`sip::SipServer`]: a digest-authenticating registrar that forwards
//!   dialog-forming and in-dialog requests between registered endpoints,
//!   either as a stateful proxy (Record-Route insertion, Via rewriting) or
//!   as a redirect server answering `302 Moved Temporarily`.
//! * [`dhcp::DhcpServer`]: a lease-allocating DHCP responder with a
//!   persistent lease file and optional boot-file options (66/67) so that
//!   phones can be auto-provisioned.
//!
//! Each service owns its socket and runs as a single worker task; datagrams
//! are processed sequentially within a service. There is deliberately no
//! RFC 3261 transaction layer: no retransmission, no timers, no
//! `100 Trying`. That keeps behavior predictable when exercising a SIP user
//! agent against the appliance.

pub mod config;
pub mod dhcp;
pub mod logging;
pub mod sip;

mod error;
pub use error::{Error, Result};

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, the clock used for registration and lease
/// expiry.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
