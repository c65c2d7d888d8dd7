//! bridge64
//!
//! Stateful NAT64 gateway: bridges an IPv6-only segment with the IPv4
//! internet through two TUN devices.
//!
//! Usage:
//!   Run the gateway:  bridge64 run --gateway-v4 10.64.0.1
//!   With a config:    bridge64 run --config bridge64.json
//!   DNS64 synthesis:  bridge64 dns64 example.com

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipnet::Ipv6Net;
use std::sync::Arc;

use bridge64::config::GatewayConfig;
use bridge64::gateway::Gateway;
use bridge64::tunnel::create_tun;
use bridge64::{dns64, Nat64Prefix};

#[derive(Parser)]
#[command(name = "bridge64")]
#[command(version)]
#[command(about = "Stateful NAT64 gateway (RFC 6146 / RFC 7915 / RFC 6052)")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway until interrupted
    Run {
        /// Path to a JSON configuration file; flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// NAT64 prefix (must be a /96)
        #[arg(long)]
        prefix: Option<Ipv6Net>,

        /// External IPv4 address used as the translated source
        #[arg(long)]
        gateway_v4: Option<Ipv4Addr>,

        /// Name hint for the IPv6-facing TUN device
        #[arg(long)]
        tun6: Option<String>,

        /// Name hint for the IPv4-facing TUN device
        #[arg(long)]
        tun4: Option<String>,

        /// Number of translation workers (default: one per CPU)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Resolve domains and print NAT64-synthesized AAAA addresses
    Dns64 {
        /// Domains to resolve
        #[arg(required = true)]
        domains: Vec<String>,

        /// NAT64 prefix to synthesize under (must be a /96)
        #[arg(long)]
        prefix: Option<Ipv6Net>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match args.command {
        Command::Run {
            config,
            prefix,
            gateway_v4,
            tun6,
            tun4,
            workers,
        } => {
            let mut config = match config {
                Some(path) => {
                    let data = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading config {}", path.display()))?;
                    serde_json::from_str::<GatewayConfig>(&data)
                        .with_context(|| format!("parsing config {}", path.display()))?
                }
                None => GatewayConfig::default(),
            };
            if let Some(prefix) = prefix {
                config.nat64_prefix = prefix;
            }
            if let Some(gateway_v4) = gateway_v4 {
                config.gateway_v4 = gateway_v4;
            }
            if let Some(tun6) = tun6 {
                config.tun6_name = Some(tun6);
            }
            if let Some(tun4) = tun4 {
                config.tun4_name = Some(tun4);
            }
            if let Some(workers) = workers {
                config.worker_count = workers;
            }
            run_gateway(config).await
        }
        Command::Dns64 { domains, prefix } => {
            let prefix = match prefix {
                Some(net) => Nat64Prefix::from_net(&net).map_err(anyhow::Error::msg)?,
                None => Nat64Prefix::WELL_KNOWN,
            };
            run_dns64(domains, prefix).await
        }
    }
}

async fn run_gateway(config: GatewayConfig) -> Result<()> {
    let mtu = config.mtu;
    let tun6_name = config.tun6_name.clone();
    let tun4_name = config.tun4_name.clone();

    let gateway = Arc::new(Gateway::new(config).context("invalid configuration")?);

    let v6 = create_tun(tun6_name.as_deref(), mtu).context("creating IPv6-facing tunnel")?;
    let v4 = create_tun(tun4_name.as_deref(), mtu).context("creating IPv4-facing tunnel")?;
    log::info!(
        "Route the NAT64 prefix into {}; external IPv4 traffic flows via {}",
        v6.name,
        v4.name
    );

    {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Interrupt received, shutting down");
                gateway.shutdown();
            }
        });
    }

    gateway.run(v6, v4).await?;

    let stats = gateway.stats_snapshot();
    log::info!(
        "Final counters: {} packets v6->v4, {} packets v4->v6, {} parse drops",
        stats.v4_packets_out,
        stats.v6_packets_out,
        stats.drops.parse
    );
    Ok(())
}

async fn run_dns64(domains: Vec<String>, prefix: Nat64Prefix) -> Result<()> {
    println!("{:<30} {:<20} {:<45}", "DOMAIN", "IPV4 ADDRESS", "SYNTHESIZED IPV6 ADDRESS");
    for domain in domains {
        match dns64::resolve(&domain, &prefix).await {
            Ok(resolution) => {
                if resolution.v4.is_empty() {
                    println!("{:<30} {:<20} {:<45}", domain, "no A records", "-");
                    continue;
                }
                for (i, (v4, v6)) in resolution
                    .v4
                    .iter()
                    .zip(&resolution.synthesized)
                    .enumerate()
                {
                    let label = if i == 0 { domain.as_str() } else { "" };
                    println!("{:<30} {:<20} {:<45}", label, v4, v6);
                }
                for native in &resolution.native_v6 {
                    log::debug!("{} also has native AAAA {}", domain, native);
                }
            }
            Err(err) => {
                log::error!("Failed to resolve {}: {}", domain, err);
                println!("{:<30} {:<20} {:<45}", domain, "resolution failed", "-");
            }
        }
    }
    Ok(())
}
