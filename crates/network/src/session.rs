//! Handle-addressed duplex streams.
//!
//! Sessions live in a slot arena. A [`Handle`] carries the slot index plus the
//! slot's generation at insert time; closing a session bumps the generation,
//! so a stale handle is rejected even after its index has been reused.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::proxy::host_port;
use crate::stream::MaybeTlsStream;
use crate::tls::TlsMode;

pub const MAX_SESSIONS: usize = 1 << 16;
const GENERATION_MASK: u16 = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    index: u16,
    generation: u16,
}

impl Handle {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    /// Packs the handle into a non-negative integer for C callers.
    pub fn as_raw(&self) -> i32 {
        (i32::from(self.generation & GENERATION_MASK) << 16) | i32::from(self.index)
    }

    /// Negative values are the "no connection" sentinel and never decode.
    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw < 0 {
            return None;
        }
        Some(Self {
            index: (raw & 0xFFFF) as u16,
            generation: ((raw >> 16) as u16) & GENERATION_MASK,
        })
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

/// Read-only view of a session's metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub handle: Handle,
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
    pub peer_addr: Option<SocketAddr>,
    pub age: Duration,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

pub struct Session {
    handle: Handle,
    stream: MaybeTlsStream,
    host: String,
    port: u16,
    tls: TlsMode,
    peer_addr: Option<SocketAddr>,
    /// Fixed at connect time; later config changes do not apply
    timeout: Duration,
    created_at: Instant,
    bytes_read: u64,
    bytes_written: u64,
}

impl Session {
    pub(crate) fn new(
        handle: Handle,
        stream: MaybeTlsStream,
        host: &str,
        port: u16,
        tls: TlsMode,
        timeout: Duration,
    ) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            handle,
            stream,
            host: host.to_string(),
            port,
            tls,
            peer_addr,
            timeout,
            created_at: Instant::now(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            handle: self.handle,
            host: self.host.clone(),
            port: self.port,
            tls: self.tls,
            peer_addr: self.peer_addr,
            age: self.created_at.elapsed(),
            bytes_read: self.bytes_read,
            bytes_written: self.bytes_written,
        }
    }

    pub(crate) fn target(&self) -> String {
        host_port(&self.host, self.port)
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn stream_mut(&mut self) -> &mut MaybeTlsStream {
        &mut self.stream
    }

    /// Returns 0 once the peer has closed its side. A TLS peer that drops the
    /// connection without close_notify counts as closed.
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.timeout;
        let result = tokio::time::timeout(timeout, self.stream.read(buf)).await;
        match result {
            Err(_) => Err(TunnelError::timeout(
                format!("reading from session {} ({})", self.handle, self.target()),
                timeout,
            )),
            Ok(Err(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof
                    && matches!(self.stream, MaybeTlsStream::Tls(_)) =>
            {
                debug!("{} closed without TLS close_notify", self.target());
                Ok(0)
            }
            Ok(Err(e)) => Err(TunnelError::Io(format!(
                "read from {} failed: {}",
                self.target(),
                e
            ))),
            Ok(Ok(n)) => {
                self.bytes_read += n as u64;
                Ok(n)
            }
        }
    }

    /// Writes every byte of `data` or fails; never reports a short write.
    pub(crate) async fn write_all(&mut self, data: &[u8]) -> Result<usize> {
        let timeout = self.timeout;
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(data).await?;
            stream.flush().await
        };
        let result = tokio::time::timeout(timeout, write).await;
        match result {
            Err(_) => Err(TunnelError::timeout(
                format!("writing to session {} ({})", self.handle, self.target()),
                timeout,
            )),
            Ok(Err(e)) => Err(TunnelError::Io(format!(
                "write to {} failed: {}",
                self.target(),
                e
            ))),
            Ok(Ok(())) => {
                self.bytes_written += data.len() as u64;
                Ok(data.len())
            }
        }
    }

    /// TLS close_notify (if any) then transport shutdown. Errors from a peer
    /// that already went away are not reported.
    pub(crate) async fn close(&mut self) {
        match tokio::time::timeout(self.timeout, self.stream.shutdown()).await {
            Ok(Ok(())) => debug!("Session {} closed", self.handle),
            Ok(Err(e)) => debug!("Session {} shutdown: {}", self.handle, e),
            Err(_) => debug!("Session {} shutdown timed out", self.handle),
        }
    }
}

pub(crate) type SharedSession = Arc<Mutex<Session>>;

struct Slot {
    generation: u16,
    session: Option<SharedSession>,
}

#[derive(Default)]
pub(crate) struct SessionTable {
    slots: Vec<Slot>,
    free: Vec<u16>,
    open: usize,
}

impl SessionTable {
    pub fn insert_with(&mut self, make: impl FnOnce(Handle) -> Session) -> Result<Handle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= MAX_SESSIONS {
                    return Err(TunnelError::SessionLimit(MAX_SESSIONS));
                }
                self.slots.push(Slot {
                    generation: 0,
                    session: None,
                });
                (self.slots.len() - 1) as u16
            }
        };

        let slot = &mut self.slots[usize::from(index)];
        let handle = Handle {
            index,
            generation: slot.generation,
        };
        slot.session = Some(Arc::new(Mutex::new(make(handle))));
        self.open += 1;
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Result<SharedSession> {
        self.slots
            .get(usize::from(handle.index))
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.clone())
            .ok_or(TunnelError::InvalidHandle(handle))
    }

    pub fn remove(&mut self, handle: Handle) -> Result<SharedSession> {
        let slot = self
            .slots
            .get_mut(usize::from(handle.index))
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(TunnelError::InvalidHandle(handle))?;
        let session = slot
            .session
            .take()
            .ok_or(TunnelError::InvalidHandle(handle))?;

        slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK;
        self.free.push(handle.index);
        self.open -= 1;
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.open
    }

    #[cfg(test)]
    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.session.is_some())
            .map(|(i, slot)| Handle {
                index: i as u16,
                generation: slot.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn plain_session(handle: Handle) -> Session {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        Session::new(
            handle,
            MaybeTlsStream::Plain(stream),
            "127.0.0.1",
            addr.port(),
            TlsMode::Disabled,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_raw_roundtrip() {
        let handle = Handle {
            index: 7,
            generation: 3,
        };
        assert!(handle.as_raw() >= 0);
        assert_eq!(Handle::from_raw(handle.as_raw()), Some(handle));
        assert_eq!(Handle::from_raw(-1), None);

        let max = Handle {
            index: u16::MAX,
            generation: GENERATION_MASK,
        };
        assert!(max.as_raw() >= 0);
        assert_eq!(Handle::from_raw(max.as_raw()), Some(max));
    }

    #[tokio::test]
    async fn test_stale_handle_rejected_after_reuse() {
        let mut table = SessionTable::default();
        let first_session = plain_session(Handle::from_raw(0).unwrap()).await;
        let first = table.insert_with(|_| first_session).unwrap();
        assert_eq!(table.len(), 1);

        table.remove(first).unwrap();
        assert!(matches!(table.get(first), Err(TunnelError::InvalidHandle(_))));
        assert!(matches!(table.remove(first), Err(TunnelError::InvalidHandle(_))));

        let second_session = plain_session(Handle::from_raw(0).unwrap()).await;
        let second = table.insert_with(|_| second_session).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);
        assert!(table.get(first).is_err());
        assert!(table.get(second).is_ok());
        assert_eq!(table.handles(), vec![second]);
    }

    #[test]
    fn test_unknown_handle() {
        let table = SessionTable::default();
        let handle = Handle::from_raw(42).unwrap();
        assert!(matches!(table.get(handle), Err(TunnelError::InvalidHandle(h)) if h == handle));
    }
}
