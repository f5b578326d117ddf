use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::doh::upstream_authority;
use crate::domain_filter::DomainFilter;
use crate::fragment::FragmentPolicy;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    pub addr: IpAddr,

    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// DoH upstream, e.g. `1.1.1.1` or `https://dns.google/dns-query`
    #[arg(long)]
    pub doh: Option<String>,

    /// Also ask DoH for AAAA records
    #[arg(long)]
    pub ipv6: bool,

    /// Seconds to wait for a destination to accept
    #[arg(long, default_value_t = 3)]
    pub timeout_connect: u64,

    /// Seconds a tunnel may sit idle before it is closed (0 = never)
    #[arg(long, default_value_t = 120)]
    pub timeout_idle: u64,

    /// Byte offset of the first ClientHello cut
    #[arg(long, default_value_t = 1)]
    pub split_offset: usize,

    /// Cut the rest of the ClientHello into pieces of this many bytes (0 = off)
    #[arg(long, default_value_t = 0)]
    pub window_size: usize,

    /// Milliseconds to wait between ClientHello pieces
    #[arg(long, default_value_t = 0)]
    pub fragment_delay_ms: u64,

    /// Do not cut through the SNI host name
    #[arg(long)]
    pub no_sni_split: bool,

    /// Domains tunneled without fragmentation, one per line
    #[arg(long)]
    pub direct_list: Option<PathBuf>,

    /// Seconds between statistics lines (0 = off)
    #[arg(long, default_value_t = 60)]
    pub stats_interval: u64,

    #[arg(long, short = 'q')]
    pub quiet: bool,

    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn log_level(&self) -> &str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }
}

#[derive(Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub doh_upstream: Option<String>,
    pub ipv6: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub client_hello_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub fragment: FragmentPolicy,
    pub direct_list: Option<Arc<DomainFilter>>,
    pub stats_interval: Option<Duration>,
}

impl ProxyConfig {
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        if args.timeout_connect == 0 {
            anyhow::bail!("--timeout-connect must be at least 1 second");
        }

        let doh_upstream = args.doh.clone().filter(|d| !d.trim().is_empty());
        if let Some(ref upstream) = doh_upstream {
            if upstream_authority(upstream).is_none() {
                anyhow::bail!("--doh {:?} has no host", upstream);
            }
        }

        let direct_list = match args.direct_list {
            Some(ref path) => {
                let filter = DomainFilter::load(path).context("Failed to load --direct-list")?;
                if filter.is_empty() {
                    tracing::warn!("Direct list {:?} has no usable rules", path);
                }
                Some(Arc::new(filter))
            }
            None => None,
        };

        Ok(Self {
            listen: SocketAddr::new(args.addr, args.port),
            doh_upstream,
            ipv6: args.ipv6,
            connect_timeout: Duration::from_secs(args.timeout_connect),
            request_timeout: REQUEST_TIMEOUT,
            client_hello_timeout: CLIENT_HELLO_TIMEOUT,
            idle_timeout: non_zero_secs(args.timeout_idle),
            fragment: FragmentPolicy {
                split_offset: args.split_offset,
                split_sni: !args.no_sni_split,
                chunk_size: args.window_size,
                delay: Duration::from_millis(args.fragment_delay_ms),
            },
            direct_list,
            stats_interval: non_zero_secs(args.stats_interval),
        })
    }

    pub fn is_direct(&self, host: &str) -> bool {
        self.direct_list
            .as_ref()
            .is_some_and(|list| list.contains(host))
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            doh_upstream: None,
            ipv6: false,
            connect_timeout: Duration::from_secs(3),
            request_timeout: REQUEST_TIMEOUT,
            client_hello_timeout: CLIENT_HELLO_TIMEOUT,
            idle_timeout: Some(Duration::from_secs(120)),
            fragment: FragmentPolicy::default(),
            direct_list: None,
            stats_interval: Some(Duration::from_secs(60)),
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("sni-split-proxy").chain(argv.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        let config = ProxyConfig::from_args(&args).unwrap();

        assert_eq!(config.listen, "127.0.0.1:8080".parse().unwrap());
        assert!(config.doh_upstream.is_none());
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.fragment, FragmentPolicy::default());
        assert!(!config.is_direct("example.com"));
        assert_eq!(args.log_level(), "info");
    }

    #[test]
    fn test_fragment_flags() {
        let args = parse(&[
            "--split-offset",
            "3",
            "--window-size",
            "40",
            "--fragment-delay-ms",
            "5",
            "--no-sni-split",
        ]);
        let config = ProxyConfig::from_args(&args).unwrap();

        assert_eq!(
            config.fragment,
            FragmentPolicy {
                split_offset: 3,
                split_sni: false,
                chunk_size: 40,
                delay: Duration::from_millis(5),
            }
        );
    }

    #[test]
    fn test_zero_disables_timers() {
        let args = parse(&["--timeout-idle", "0", "--stats-interval", "0"]);
        let config = ProxyConfig::from_args(&args).unwrap();

        assert!(config.idle_timeout.is_none());
        assert!(config.stats_interval.is_none());
    }

    #[test]
    fn test_zero_connect_timeout_rejected() {
        let args = parse(&["--timeout-connect", "0"]);
        assert!(ProxyConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_log_level_flags() {
        assert_eq!(parse(&["-v"]).log_level(), "debug");
        assert_eq!(parse(&["-q", "-v"]).log_level(), "error");
        assert_eq!(parse(&["--log-level", "trace"]).log_level(), "trace");
    }

    #[test]
    fn test_doh_and_listen_flags() {
        let args = parse(&["--addr", "0.0.0.0", "--port", "9000", "--doh", "1.1.1.1", "--ipv6"]);
        let config = ProxyConfig::from_args(&args).unwrap();

        assert_eq!(config.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.doh_upstream.as_deref(), Some("1.1.1.1"));
        assert!(config.ipv6);
    }

    #[test]
    fn test_doh_without_host_rejected() {
        for upstream in ["https://", "https:///dns-query"] {
            let args = parse(&["--doh", upstream]);
            assert!(ProxyConfig::from_args(&args).is_err(), "{upstream}");
        }
    }
}
