//! rsync-proxy
//!
//! A reverse proxy for the rsync daemon protocol. The proxy answers
//! the rsyncd handshake itself, routes the requested module to one of
//! many backend rsyncd instances, and then turns into a transparent
//! byte relay for the rest of the session. Module routing reloads at
//! runtime without touching established transfers.

pub mod components;
pub mod config;
pub mod error;

pub use components::control::send_reload_request;
pub use components::{
    BufferPool, ConnInfo, ConnectionRegistry, FileSink, ModuleTarget, RelayEngine, RouteSnapshot,
    RouteTable,
};
pub use config::{Args, Config};
pub use error::{ProxyError, Result};

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info};

use components::control;

/// State shared between the accept loop, the relay workers and the
/// control plane: everything a reload touches, and nothing a reload
/// must not touch.
pub struct ServerCore {
    pub(crate) routes: Arc<RouteTable>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) access_log: Arc<FileSink>,
    pub(crate) error_log: Arc<FileSink>,
    config_path: RwLock<PathBuf>,
}

impl ServerCore {
    fn new(config_path: PathBuf) -> Self {
        Self {
            routes: Arc::new(RouteTable::new()),
            registry: Arc::new(ConnectionRegistry::new()),
            access_log: Arc::new(FileSink::new()),
            error_log: Arc::new(FileSink::new()),
            config_path: RwLock::new(config_path),
        }
    }

    fn config_path(&self) -> PathBuf {
        match self.config_path.read() {
            Ok(path) => path.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Read, validate and install the config file: build the new
    /// snapshot off to the side, re-point the log sinks, then swap
    /// the snapshot atom. Active connections are never touched.
    pub(crate) async fn install_from_file(&self) -> Result<Config> {
        let path = self.config_path();
        info!(path = %path.display(), "loading config");

        let raw = tokio::fs::read_to_string(&path).await?;
        let config = Config::parse(&raw)?;
        let snapshot = config.build_snapshot().await?;

        self.access_log.set_file(&config.proxy.access_log)?;
        self.error_log.set_file(&config.proxy.error_log)?;
        self.routes.install(snapshot);
        Ok(config)
    }
}

/// Broadcast handle that stops the proxy's accept loops. In-flight
/// workers run to natural completion.
#[derive(Clone)]
pub struct ShutdownHandle(broadcast::Sender<()>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(());
    }
}

struct Listeners {
    rsync: TcpListener,
    http: TcpListener,
}

/// The proxy server: one rsync-facing listener, one HTTP control
/// listener, and the shared core both feed from.
pub struct ProxyServer {
    /// Rsync listener address. Empty means: take it from the config
    /// file on the first load.
    pub listen_addr: String,
    /// HTTP listener address; same first-load semantics.
    pub http_listen_addr: String,
    /// Per-operation handshake deadlines. Zero disables them.
    pub read_timeout: Duration,
    pub write_timeout: Duration,

    core: Arc<ServerCore>,
    listeners: Option<Listeners>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            listen_addr: String::new(),
            http_listen_addr: String::new(),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            core: Arc::new(ServerCore::new(config_path.into())),
            listeners: None,
            shutdown_tx,
        }
    }

    /// First config load. Listen addresses left empty by the caller
    /// are filled from the config file; reloads never change them,
    /// the sockets are already bound by then.
    pub async fn load_config(&mut self) -> Result<()> {
        let config = self.core.install_from_file().await?;
        if self.listen_addr.is_empty() {
            self.listen_addr = config.proxy.listen.clone();
        }
        if self.http_listen_addr.is_empty() {
            self.http_listen_addr = config.proxy.listen_http.clone();
        }
        Ok(())
    }

    /// Bind both listeners. After this the address fields carry the
    /// actual bound addresses, which matters when port 0 was asked
    /// for.
    pub async fn bind(&mut self) -> Result<()> {
        let rsync = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                name: "tcp",
                addr: self.listen_addr.clone(),
                source,
            })?;
        self.listen_addr = rsync.local_addr()?.to_string();

        let http = TcpListener::bind(&self.http_listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                name: "http",
                addr: self.http_listen_addr.clone(),
                source,
            })?;
        self.http_listen_addr = http.local_addr()?.to_string();

        info!("rsync proxy listening on {}", self.listen_addr);
        info!("HTTP server listening on {}", self.http_listen_addr);

        self.listeners = Some(Listeners { rsync, http });
        Ok(())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Active connection count, as the control plane reports it.
    pub fn active_connection_count(&self) -> i64 {
        self.core.registry.active_count()
    }

    /// Run both accept loops until shutdown. An accept error on the
    /// rsync listener and any control plane failure are fatal; the
    /// shutdown signal is a clean stop.
    pub async fn run(&mut self) -> Result<()> {
        let Listeners { rsync, http } = self
            .listeners
            .take()
            .ok_or_else(|| ProxyError::Config("server is not bound".to_string()))?;

        let relay = Arc::new(RelayEngine::new(
            Arc::clone(&self.core.routes),
            Arc::clone(&self.core.registry),
            Arc::clone(&self.core.access_log),
            Arc::clone(&self.core.error_log),
            BufferPool::new(),
            self.read_timeout,
            self.write_timeout,
        ));

        let control = control::serve(http, Arc::clone(&self.core), self.shutdown_tx.subscribe());
        tokio::pin!(control);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = rsync.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer_addr = %peer_addr, "rsync connection accepted");
                            self.spawn_worker(Arc::clone(&relay), stream);
                        }
                        Err(e) => return Err(ProxyError::Accept(e)),
                    }
                }
                result = &mut control => {
                    // Ok only on shutdown; propagate control plane failures.
                    return result;
                }
                _ = shutdown_rx.recv() => {
                    info!("rsync proxy shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_worker(&self, relay: Arc<RelayEngine>, stream: TcpStream) {
        let registry = Arc::clone(&self.core.registry);
        tokio::spawn(async move {
            let _active = registry.enter();
            let index = registry.next_index();
            if let Err(err) = relay.run(index, stream).await {
                debug!(error = %err, "relay worker failed");
                relay.report(&err);
            }
        });
    }
}
