//! Relay engine
//!
//! One worker per accepted client connection. The worker impersonates
//! an rsyncd server for the handshake, resolves the requested module
//! against the current routing snapshot, dials the matching upstream,
//! replays the handshake to it, and then splices the two sockets into
//! a transparent byte relay until either side is done.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::components::netio::{read_line, write_with_timeout, BufferPool};
use crate::components::registry::{ConnInfo, ConnectionRegistry};
use crate::components::router::RouteTable;
use crate::components::sinks::FileSink;
use crate::error::{ProxyError, Result};

pub(crate) const RSYNCD_VERSION_PREFIX: &[u8] = b"@RSYNCD:";
pub(crate) const RSYNCD_SERVER_VERSION: &[u8] = b"@RSYNCD: 31.0\n";
pub(crate) const RSYNCD_EXIT: &[u8] = b"@RSYNCD: EXIT\n";

const LINE_FEED: u8 = b'\n';

/// Copy buffer size for the splice stage. The handshake pool buffers
/// are returned before this stage starts.
const SPLICE_BUFFER_SIZE: usize = 8192;

/// Shared per-connection state machine driver.
pub struct RelayEngine {
    routes: Arc<RouteTable>,
    registry: Arc<ConnectionRegistry>,
    access_log: Arc<FileSink>,
    error_log: Arc<FileSink>,
    pool: BufferPool,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl RelayEngine {
    pub fn new(
        routes: Arc<RouteTable>,
        registry: Arc<ConnectionRegistry>,
        access_log: Arc<FileSink>,
        error_log: Arc<FileSink>,
        pool: BufferPool,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            routes,
            registry,
            access_log,
            error_log,
            pool,
            read_timeout,
            write_timeout,
        }
    }

    /// Run the relay state machine for one accepted client.
    pub async fn run(&self, index: u32, mut client: TcpStream) -> Result<()> {
        let local_addr = client.local_addr()?;
        let remote_addr = client.peer_addr()?;

        let _registration = self.registry.register(ConnInfo {
            index,
            local_addr: local_addr.to_string(),
            remote_addr: remote_addr.to_string(),
            connected_at: whole_seconds(Utc::now()),
            module: String::new(),
        });

        let peer = remote_addr.to_string();
        let client_ip = remote_addr.ip().to_string();

        let mut buf = self.pool.acquire();

        // (1) client greeting, e.g. "@RSYNCD: 31.0\n"
        let n = read_line(&mut client, &mut buf, self.read_timeout)
            .await
            .map_err(|source| ProxyError::ClientGreeting {
                peer: peer.clone(),
                source,
            })?;
        if !buf[..n].starts_with(RSYNCD_VERSION_PREFIX) {
            return Err(ProxyError::ClientVersion {
                peer,
                greeting: String::from_utf8_lossy(&buf[..n]).into_owned(),
            });
        }
        // Kept verbatim; it is replayed to the upstream after dispatch.
        let client_greeting = buf[..n].to_vec();

        // (2) fixed server banner; no version negotiation
        write_with_timeout(&mut client, RSYNCD_SERVER_VERSION, self.write_timeout)
            .await
            .map_err(|source| ProxyError::ClientWrite {
                peer: peer.clone(),
                source,
            })?;

        // (3) request line: lone LF lists modules, anything else names one
        let n = read_line(&mut client, &mut buf, self.read_timeout)
            .await
            .map_err(|source| ProxyError::ClientRequest {
                peer: peer.clone(),
                source,
            })?;
        if n == 0 {
            return Err(ProxyError::EmptyRequest { peer });
        }

        let snapshot = self.routes.load();

        if !snapshot.motd.is_empty() {
            let mut motd = snapshot.motd.clone().into_bytes();
            if motd.last() != Some(&LINE_FEED) {
                motd.push(LINE_FEED);
            }
            write_with_timeout(&mut client, &motd, self.write_timeout)
                .await
                .map_err(|source| ProxyError::ClientWrite {
                    peer: peer.clone(),
                    source,
                })?;
        }

        if n == 1 {
            self.access_log
                .log(format_args!("client {peer} requests listing all modules"));
            let listing = build_module_listing(snapshot.module_names());
            let _ = write_with_timeout(&mut client, &listing, self.write_timeout).await;
            return Ok(());
        }

        let module = String::from_utf8_lossy(&buf[..n - 1]).into_owned();
        self.registry.set_module(index, &module);

        let target = match snapshot.lookup(&module) {
            Some(target) => target,
            None => {
                let reply = format!("unknown module: {module}\n");
                let _ = write_with_timeout(&mut client, reply.as_bytes(), self.write_timeout).await;
                let _ = write_with_timeout(&mut client, RSYNCD_EXIT, self.write_timeout).await;
                self.access_log.log(format_args!(
                    "client {client_ip} requests non-existing module {module}"
                ));
                return Ok(());
            }
        };

        // (4) dial the upstream this snapshot maps the module to
        let mut upstream = TcpStream::connect(&target.address).await.map_err(|source| {
            ProxyError::UpstreamDial {
                upstream: target.address.clone(),
                source,
            }
        })?;
        let upstream_addr = upstream.peer_addr()?;
        let upstream_ip = upstream_addr.ip().to_string();

        // (5) optional PROXY v1 prelude
        if target.use_proxy_protocol {
            let header = proxy_v1_header(remote_addr, upstream_addr);
            write_with_timeout(&mut upstream, header.as_bytes(), self.write_timeout)
                .await
                .map_err(|source| ProxyError::UpstreamWrite {
                    upstream: upstream_ip.clone(),
                    source,
                })?;
        }

        // (6) replay the client greeting byte-for-byte
        write_with_timeout(&mut upstream, &client_greeting, self.write_timeout)
            .await
            .map_err(|source| ProxyError::UpstreamWrite {
                upstream: upstream_ip.clone(),
                source,
            })?;

        // (7) upstream greeting; anything after its first LF is the
        // upstream's motd and belongs to the client
        let n = read_line(&mut upstream, &mut buf, self.read_timeout)
            .await
            .map_err(|source| ProxyError::UpstreamGreeting {
                upstream: upstream_ip.clone(),
                source,
            })?;
        if !buf[..n].starts_with(RSYNCD_VERSION_PREFIX) {
            return Err(ProxyError::UpstreamVersion {
                upstream: upstream_ip,
                greeting: String::from_utf8_lossy(&buf[..n]).into_owned(),
            });
        }
        let motd_start = buf[..n]
            .iter()
            .position(|&b| b == LINE_FEED)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        if motd_start < n {
            write_with_timeout(&mut client, &buf[motd_start..n], self.write_timeout)
                .await
                .map_err(|source| ProxyError::ClientWrite {
                    peer: client_ip.clone(),
                    source,
                })?;
        }

        // (9) forward the module request
        let request = format!("{module}\n");
        write_with_timeout(&mut upstream, request.as_bytes(), self.write_timeout)
            .await
            .map_err(|source| ProxyError::UpstreamWrite {
                upstream: upstream_ip.clone(),
                source,
            })?;

        self.access_log.log(format_args!(
            "client {client_ip} starts requesting module {module}"
        ));

        // The handshake buffer goes back to the pool before the splice;
        // the splice runs with its own buffers and no deadlines.
        drop(buf);

        let (sent, received) = splice(&mut client, &mut upstream).await;
        self.access_log.log(format_args!(
            "client {client_ip} finishes module {module} (sent: {sent}, received: {received})"
        ));
        Ok(())
    }

    /// Log a finished worker's error to the error sink.
    pub fn report(&self, err: &ProxyError) {
        self.error_log.log(format_args!("handle connection: {err}"));
    }
}

/// Sorted module names, one per line, terminated by the exit banner.
fn build_module_listing(names: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(names.iter().map(|n| n.len() + 1).sum::<usize>() + RSYNCD_EXIT.len());
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.push(LINE_FEED);
    }
    out.extend_from_slice(RSYNCD_EXIT);
    out
}

/// PROXY protocol v1 prelude: the downstream client endpoint and the
/// resolved upstream endpoint, family chosen by the client address.
fn proxy_v1_header(client: SocketAddr, upstream: SocketAddr) -> String {
    let client_ip = client.ip().to_string();
    let family = if client_ip.contains(':') { "TCP6" } else { "TCP4" };
    format!(
        "PROXY {family} {client_ip} {} {} {}\r\n",
        upstream.ip(),
        client.port(),
        upstream.port()
    )
}

/// Transparent two-direction byte relay. Returns (sent, received)
/// byte counts relative to the client.
///
/// When the client->upstream direction finishes first the upstream is
/// half-closed with SO_LINGER 0 so that an abandoned rsync session is
/// reset instead of lingering; when upstream->client finishes first
/// the client's read side is shut down. The remaining direction then
/// runs to completion.
async fn splice(client: &mut TcpStream, upstream: &mut TcpStream) -> (u64, u64) {
    let client_fd = client.as_raw_fd();
    let upstream_fd = upstream.as_raw_fd();

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let client_to_upstream = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; SPLICE_BUFFER_SIZE];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = upstream_write.write_all(&buf[..n]).await {
                        debug!(error = %e, "copy from downstream to upstream ended");
                        break;
                    }
                    total += n as u64;
                }
                Err(e) => {
                    debug!(error = %e, "copy from downstream to upstream ended");
                    break;
                }
            }
        }
        total
    };

    let upstream_to_client = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; SPLICE_BUFFER_SIZE];
        loop {
            match upstream_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = client_write.write_all(&buf[..n]).await {
                        debug!(error = %e, "copy from upstream to downstream ended");
                        break;
                    }
                    total += n as u64;
                }
                Err(e) => {
                    debug!(error = %e, "copy from upstream to downstream ended");
                    break;
                }
            }
        }
        total
    };

    tokio::pin!(client_to_upstream);
    tokio::pin!(upstream_to_client);

    tokio::select! {
        received = &mut client_to_upstream => {
            reset_read_side(upstream_fd, true);
            let sent = upstream_to_client.await;
            (sent, received)
        }
        sent = &mut upstream_to_client => {
            reset_read_side(client_fd, false);
            let received = client_to_upstream.await;
            (sent, received)
        }
    }
}

/// Shut down the read side of a live socket, optionally arming
/// SO_LINGER 0 first so the eventual close resets instead of waiting
/// out TIME_WAIT with a transfer session still open on the peer.
fn reset_read_side(fd: RawFd, linger_zero: bool) {
    // SAFETY: both streams are alive in `splice`'s scope for the whole
    // duration of this call; the fd cannot have been closed yet.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let sock = SockRef::from(&borrowed);
    if linger_zero {
        let _ = sock.set_linger(Some(Duration::from_secs(0)));
    }
    let _ = sock.shutdown(std::net::Shutdown::Read);
}

fn whole_seconds(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}
