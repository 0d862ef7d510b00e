//! Line-framed socket I/O
//!
//! The rsyncd handshake is a short exchange of LF-terminated lines.
//! These helpers read and write those lines with per-operation
//! deadlines and without any buffered-reader state, so that once the
//! handshake is over the splice stage sees the stream exactly where
//! the handshake left it.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the pooled handshake buffers. Large enough for the rsyncd
/// version line and any module name the proxy will accept.
pub const HANDSHAKE_BUFFER_SIZE: usize = 256;

const LINE_FEED: u8 = b'\n';

/// Write `data` in one full write. If `timeout` is non-zero the whole
/// write must complete within it; a stalled partial write fails with
/// `TimedOut`.
pub async fn write_with_timeout<W>(
    conn: &mut W,
    data: &[u8],
    timeout: Duration,
) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    if timeout.is_zero() {
        conn.write_all(data).await?;
        return Ok(data.len());
    }
    match tokio::time::timeout(timeout, conn.write_all(data)).await {
        Ok(res) => res.map(|_| data.len()),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}

/// Read into `buf` until the most recently received byte is LF, `buf`
/// is full, or the underlying read fails. Each read is gated by
/// `timeout` when non-zero. Returns the number of bytes consumed.
///
/// EOF before any byte of the current line is an `UnexpectedEof`
/// error; the caller treats it like any other handshake failure.
pub async fn read_line<R>(conn: &mut R, buf: &mut [u8], timeout: Duration) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0usize;
    while filled < buf.len() {
        let read = conn.read(&mut buf[filled..]);
        let n = if timeout.is_zero() {
            read.await?
        } else {
            match tokio::time::timeout(timeout, read).await {
                Ok(res) => res?,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
            }
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            ));
        }
        filled += n;
        if buf[filled - 1] == LINE_FEED {
            break;
        }
    }
    Ok(filled)
}

/// Pool of fixed-size handshake buffers reused across workers.
///
/// A worker borrows one buffer for the duration of its handshake and
/// must return it before entering the splice stage; the splice copies
/// with its own unbounded buffers and never touches the pool.
#[derive(Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Borrow a buffer; it returns to the pool when the guard drops.
    pub fn acquire(&self) -> PooledBuffer {
        let mut free = match self.free.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let buf = free.pop().unwrap_or_else(|| vec![0u8; HANDSHAKE_BUFFER_SIZE]);
        drop(free);
        PooledBuffer {
            buf,
            pool: Arc::clone(&self.free),
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard around a pooled buffer.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if let Ok(mut free) = self.pool.lock() {
            free.push(buf);
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}
