//! Gateway configuration types.
//!
//! The configuration is frozen once the gateway starts; nothing here is
//! mutated at runtime. Invalid configuration is fatal: `validate()` runs
//! before any tunnel is opened.

use std::net::Ipv4Addr;

use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};

use crate::addr::Nat64Prefix;

/// Default MTU for the tunnel devices.
pub const DEFAULT_MTU: u16 = 1500;

/// NAT64 gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// NAT64 prefix used to synthesize and recognize IPv6 forms of IPv4
    /// addresses. Must be a /96; the RFC 6052 well-known prefix by default.
    #[serde(default = "default_prefix")]
    pub nat64_prefix: Ipv6Net,

    /// The gateway's external IPv4 address, used as the translated source
    /// of every outbound packet.
    #[serde(default = "default_gateway_v4")]
    pub gateway_v4: Ipv4Addr,

    /// Idle timeout for TCP sessions, seconds.
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,

    /// Idle timeout for UDP sessions, seconds.
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,

    /// Idle timeout for ICMP sessions, seconds.
    #[serde(default = "default_icmp_timeout")]
    pub icmp_timeout_secs: u64,

    /// Inclusive source-port (and ICMP identifier) allocation range.
    #[serde(default = "default_port_range")]
    pub port_range: (u16, u16),

    /// Seconds between session-table cleanup sweeps.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Number of translation workers. 0 means one per CPU.
    #[serde(default)]
    pub worker_count: usize,

    /// Capacity of the bounded packet channel between the tunnel readers
    /// and the workers. A full channel drops the packet; backpressure is a
    /// datagram drop, never a stall.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// MTU for the tunnel devices.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Name hint for the IPv6-facing tunnel device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun6_name: Option<String>,

    /// Name hint for the IPv4-facing tunnel device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun4_name: Option<String>,
}

impl GatewayConfig {
    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - the NAT64 prefix is not a /96
    /// - the port range is inverted or dips into privileged ports
    /// - the channel capacity is zero
    pub fn validate(&self) -> Result<(), String> {
        Nat64Prefix::from_net(&self.nat64_prefix)?;

        let (min, max) = self.port_range;
        if min > max {
            return Err(format!("port range {}-{} is inverted", min, max));
        }
        if min < 1024 {
            return Err(format!(
                "port range starts at {} inside the well-known/registered split",
                min
            ));
        }

        if self.channel_capacity == 0 {
            return Err("channel_capacity must be at least 1".to_string());
        }

        if self.gateway_v4.is_unspecified() {
            return Err("gateway_v4 must be a concrete address".to_string());
        }

        Ok(())
    }

    /// The validated prefix. Call after `validate()`.
    pub fn prefix(&self) -> Result<Nat64Prefix, String> {
        Nat64Prefix::from_net(&self.nat64_prefix)
    }

    /// Worker count with the 0-means-CPUs default applied.
    pub fn effective_workers(&self) -> usize {
        if self.worker_count > 0 {
            self.worker_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            nat64_prefix: default_prefix(),
            gateway_v4: default_gateway_v4(),
            tcp_timeout_secs: default_tcp_timeout(),
            udp_timeout_secs: default_udp_timeout(),
            icmp_timeout_secs: default_icmp_timeout(),
            port_range: default_port_range(),
            cleanup_interval_secs: default_cleanup_interval(),
            worker_count: 0,
            channel_capacity: default_channel_capacity(),
            mtu: default_mtu(),
            tun6_name: None,
            tun4_name: None,
        }
    }
}

// Default value functions for serde
fn default_prefix() -> Ipv6Net {
    "64:ff9b::/96".parse().expect("well-known prefix parses")
}

fn default_gateway_v4() -> Ipv4Addr {
    Ipv4Addr::new(10, 64, 0, 1)
}

fn default_tcp_timeout() -> u64 {
    300
}

fn default_udp_timeout() -> u64 {
    60
}

fn default_icmp_timeout() -> u64 {
    60
}

fn default_port_range() -> (u16, u16) {
    (10000, 65000)
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}
