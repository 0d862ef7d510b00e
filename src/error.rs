//! Error handling module
//!
//! Defines the error types for the proxy with a policy split between
//! fatal startup errors, reload errors surfaced to the control plane,
//! and per-connection relay errors that only terminate one worker.

use thiserror::Error;

/// Main error type for the rsync proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    // Configuration errors
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("no upstream found")]
    NoUpstreams,

    #[error("resolve address: {source}, upstream={upstream}, address={address}")]
    ResolveAddress {
        upstream: String,
        address: String,
        source: std::io::Error,
    },

    #[error("duplicate module name: {module}, upstream={upstream}")]
    DuplicateModule { module: String, upstream: String },

    #[error("config error: {0}")]
    Config(String),

    // Startup errors
    #[error("create {name} listener on {addr}: {source}")]
    Bind {
        name: &'static str,
        addr: String,
        source: std::io::Error,
    },

    #[error("accept rsync connection: {0}")]
    Accept(std::io::Error),

    // Relay errors; each one terminates a single worker
    #[error("read version from client {peer}: {source}")]
    ClientGreeting {
        peer: String,
        source: std::io::Error,
    },

    #[error("unknown version from client {peer}: {greeting:?}")]
    ClientVersion { peer: String, greeting: String },

    #[error("empty request from client {peer}")]
    EmptyRequest { peer: String },

    #[error("send to client {peer}: {source}")]
    ClientWrite {
        peer: String,
        source: std::io::Error,
    },

    #[error("read module from client {peer}: {source}")]
    ClientRequest {
        peer: String,
        source: std::io::Error,
    },

    #[error("dial to upstream: {upstream}: {source}")]
    UpstreamDial {
        upstream: String,
        source: std::io::Error,
    },

    #[error("send to upstream {upstream}: {source}")]
    UpstreamWrite {
        upstream: String,
        source: std::io::Error,
    },

    #[error("read version from upstream {upstream}: {source}")]
    UpstreamGreeting {
        upstream: String,
        source: std::io::Error,
    },

    #[error("unknown version from upstream {upstream}: {greeting:?}")]
    UpstreamVersion { upstream: String, greeting: String },

    // Control plane errors
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("reload request to {addr} failed: {reason}")]
    ReloadRequest { addr: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, ProxyError>;
