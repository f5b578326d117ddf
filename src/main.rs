#![warn(clippy::all)]

mod config;
mod connector;
mod doh;
mod domain_filter;
mod error;
mod forward;
mod fragment;
mod packet;
mod proxy;
mod relay;
mod stats;
mod tunnel;

use std::io::ErrorKind;

use clap::Parser;
use tracing::info;

use crate::config::{Args, ProxyConfig};
use crate::proxy::Proxy;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level())),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = ProxyConfig::from_args(&args)?;
    let stats_interval = config.stats_interval;
    let fragment = config.fragment.clone();

    let proxy = Proxy::new(config)?;

    if let Some(interval) = stats_interval {
        proxy.stats().spawn_reporter(interval);
    }

    info!(
        "ClientHello split: offset={} sni={} window={} delay={:?}",
        fragment.split_offset, fragment.split_sni, fragment.chunk_size, fragment.delay
    );

    if let Err(e) = proxy.start().await {
        let in_use = e
            .chain()
            .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
            .any(|io| io.kind() == ErrorKind::AddrInUse);

        if in_use {
            eprintln!("\nPORT {} ALREADY IN USE\n", args.port);
            eprintln!("   Find the owner: lsof -i:{} -P -n", args.port);
            eprintln!("   Or run with a different port: --port {}\n", args.port.wrapping_add(1));
            std::process::exit(1);
        }
        return Err(e);
    }

    Ok(())
}
