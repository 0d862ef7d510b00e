//! Configuration module
//!
//! Command-line arguments and the TOML config file. The file maps
//! upstream rsyncd endpoints to the modules they serve; parsing is
//! pure, validation resolves every upstream address and rejects
//! duplicate module names before anything is installed.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use tokio::net::lookup_host;

use crate::components::router::RouteSnapshot;
use crate::error::{ProxyError, Result};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    name = "rsync-proxy",
    about = "Reverse proxy for the rsync daemon protocol",
    disable_version_flag = true
)]
pub struct Args {
    /// Path to config file
    #[arg(long, default_value = "/etc/rsync-proxy/config.toml")]
    pub config: PathBuf,

    /// Address to listen on for reverse proxy
    #[arg(long = "listen-addr", default_value = "0.0.0.0:9527")]
    pub listen_addr: String,

    /// Address to listen on for the HTTP API
    #[arg(long = "web-listen-addr", default_value = "127.0.0.1:9528")]
    pub web_listen_addr: String,

    /// Inform a running proxy to reload its config
    #[arg(long)]
    pub reload: bool,

    /// Print version information and exit
    #[arg(short = 'V', long)]
    pub version: bool,

    /// Number for the log level verbosity; higher is more verbose
    #[arg(short = 'v', default_value_t = 2, value_name = "LEVEL")]
    pub verbosity: u8,
}

/// `[proxy]` section of the config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxySettings {
    /// Rsync listener address; used only on the first load and only
    /// when no CLI override was given.
    #[serde(default)]
    pub listen: String,
    /// HTTP listener address; same first-load-only semantics.
    #[serde(default)]
    pub listen_http: String,
    #[serde(default)]
    pub motd: String,
    /// Access log path; empty discards.
    #[serde(default)]
    pub access_log: String,
    /// Error log path; empty discards.
    #[serde(default)]
    pub error_log: String,
}

/// One `[upstreams.<name>]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct Upstream {
    /// host:port of the backend rsyncd
    pub address: String,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub use_proxy_protocol: bool,
}

/// Whole config file
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub upstreams: HashMap<String, Upstream>,
}

impl Config {
    /// Parse a TOML document. Pure; no validation beyond the schema.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Validate the config and build the routing snapshot it
    /// describes. Nothing is installed here; the caller swaps the
    /// snapshot in only after every check passed.
    pub async fn build_snapshot(&self) -> Result<RouteSnapshot> {
        if self.upstreams.is_empty() {
            return Err(ProxyError::NoUpstreams);
        }

        let mut modules: HashMap<String, String> = HashMap::new();
        let mut proxy_protocol: HashMap<String, bool> = HashMap::new();

        for (upstream_name, upstream) in &self.upstreams {
            let mut addrs = lookup_host(&upstream.address).await.map_err(|source| {
                ProxyError::ResolveAddress {
                    upstream: upstream_name.clone(),
                    address: upstream.address.clone(),
                    source,
                }
            })?;
            if addrs.next().is_none() {
                return Err(ProxyError::ResolveAddress {
                    upstream: upstream_name.clone(),
                    address: upstream.address.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"),
                });
            }

            for module in &upstream.modules {
                if modules.contains_key(module) {
                    return Err(ProxyError::DuplicateModule {
                        module: module.clone(),
                        upstream: upstream_name.clone(),
                    });
                }
                modules.insert(module.clone(), upstream.address.clone());
            }
            proxy_protocol.insert(upstream.address.clone(), upstream.use_proxy_protocol);
        }

        Ok(RouteSnapshot::new(
            self.proxy.motd.clone(),
            modules,
            proxy_protocol,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
[proxy]
listen = "0.0.0.0:9527"
listen_http = "127.0.0.1:9528"
motd = "Welcome"
access_log = "/var/log/rsync-proxy/access.log"
error_log = "/var/log/rsync-proxy/error.log"

[upstreams.u1]
address = "127.0.0.1:1234"
modules = ["foo"]

[upstreams.u2]
address = "127.0.0.1:1235"
modules = ["bar", "baz"]
use_proxy_protocol = true
"#;
        let config = Config::parse(raw).unwrap();
        assert_eq!(config.proxy.listen, "0.0.0.0:9527");
        assert_eq!(config.proxy.motd, "Welcome");
        assert_eq!(config.upstreams.len(), 2);
        assert!(config.upstreams["u2"].use_proxy_protocol);
        assert!(!config.upstreams["u1"].use_proxy_protocol);
        assert_eq!(config.upstreams["u2"].modules, vec!["bar", "baz"]);
    }

    #[test]
    fn test_parse_defaults() {
        let raw = r#"
[upstreams.u1]
address = "127.0.0.1:1234"
modules = ["foo"]
"#;
        let config = Config::parse(raw).unwrap();
        assert!(config.proxy.listen.is_empty());
        assert!(config.proxy.motd.is_empty());
        assert!(config.proxy.access_log.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed_toml() {
        assert!(Config::parse("[proxy\nlisten=").is_err());
    }

    #[tokio::test]
    async fn test_snapshot_requires_upstreams() {
        let config = Config::parse("").unwrap();
        match config.build_snapshot().await {
            Err(ProxyError::NoUpstreams) => {}
            other => panic!("expected NoUpstreams, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_rejects_unresolvable_address() {
        let raw = r#"
[upstreams.u1]
address = "127.0.0.1:notaport"
modules = ["foo"]
"#;
        let config = Config::parse(raw).unwrap();
        match config.build_snapshot().await {
            Err(ProxyError::ResolveAddress { upstream, .. }) => assert_eq!(upstream, "u1"),
            other => panic!("expected ResolveAddress, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_rejects_duplicate_modules() {
        let raw = r#"
[upstreams.u1]
address = "127.0.0.1:1234"
modules = ["foo"]

[upstreams.u2]
address = "127.0.0.1:1235"
modules = ["foo"]
"#;
        let config = Config::parse(raw).unwrap();
        match config.build_snapshot().await {
            Err(ProxyError::DuplicateModule { module, .. }) => assert_eq!(module, "foo"),
            other => panic!("expected DuplicateModule, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_maps_modules_to_addresses() {
        let raw = r#"
[proxy]
motd = "hi"

[upstreams.u1]
address = "127.0.0.1:1234"
modules = ["foo"]

[upstreams.u2]
address = "127.0.0.1:1235"
modules = ["bar"]
use_proxy_protocol = true
"#;
        let config = Config::parse(raw).unwrap();
        let snapshot = config.build_snapshot().await.unwrap();

        assert_eq!(snapshot.motd, "hi");
        assert_eq!(snapshot.module_names(), &["bar", "foo"]);

        let foo = snapshot.lookup("foo").unwrap();
        assert_eq!(foo.address, "127.0.0.1:1234");
        assert!(!foo.use_proxy_protocol);

        let bar = snapshot.lookup("bar").unwrap();
        assert!(bar.use_proxy_protocol);
    }
}
