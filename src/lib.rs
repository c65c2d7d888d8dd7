//! bridge64, a stateful NAT64 gateway.
//!
//! Bridges an IPv6-only network segment with an IPv4-only one by rewriting
//! IP packets in both directions: stateful translation per RFC 6146, header
//! translation per RFC 7915, and the RFC 6052 address format (well-known
//! prefix `64:ff9b::/96`).
//!
//! # Architecture
//!
//! ```text
//! IPv6 Client                      NAT64 Gateway                 IPv4 Host
//!     │                                  │                            │
//!     │  IPv6 packet to                  │                            │
//!     │  64:ff9b::192.0.2.1              │                            │
//!     ├─────────────────────────────────>│                            │
//!     │                                  │  IPv4 packet to 192.0.2.1  │
//!     │                                  │  (source = gateway:port)   │
//!     │                                  ├───────────────────────────>│
//!     │                                  │                            │
//!     │                                  │  IPv4 response             │
//!     │  IPv6 response from              │<───────────────────────────┤
//!     │  64:ff9b::192.0.2.1              │                            │
//!     │<─────────────────────────────────┤                            │
//! ```
//!
//! The datapath is two tunnel endpoints feeding a bounded channel and a
//! worker pool ([`gateway`]); translation state lives in a bidirectionally
//! indexed session table ([`session`]) reaped on a fixed tick. The
//! translator itself ([`translator`], [`packet`], [`checksum`], [`addr`])
//! is pure code over borrowed buffers.

pub mod addr;
pub mod checksum;
pub mod config;
pub mod dns64;
pub mod error;
pub mod gateway;
pub mod packet;
pub mod session;
pub mod stats;
pub mod translator;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenience
pub use addr::Nat64Prefix;
pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use gateway::Gateway;
pub use session::{SessionSnapshot, SessionTable};
pub use stats::StatsSnapshot;
