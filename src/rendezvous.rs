//! One-shot host/guest rendezvous over TCP.
//!
//! The host binds an ephemeral port before the installer image is built so
//! the guest knows where to call back. After the unattended install finishes
//! the guest connects once and sends a single status byte: `0` means the
//! post-install step (setting the display resolution) failed, anything else
//! means it succeeded.

use anyhow::Result;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::ProvisionError;

/// Status reported by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestStatus {
    Success,
    Failure,
}

impl GuestStatus {
    pub fn from_byte(byte: u8) -> Self {
        if byte == 0 {
            GuestStatus::Failure
        } else {
            GuestStatus::Success
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GuestStatus::Success)
    }
}

/// What the guest told us, and how long it took to say it.
#[derive(Debug, Clone)]
pub struct GuestReport {
    pub status: GuestStatus,
    pub peer: SocketAddr,
    pub waited: Duration,
}

/// A bound, listening socket waiting for exactly one guest callback.
pub struct RendezvousListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RendezvousListener {
    /// Bind `host` on an OS-assigned port with a backlog of one.
    pub fn bind(host: IpAddr) -> Result<Self> {
        let bind = || -> std::io::Result<(TcpListener, SocketAddr)> {
            let socket = match host {
                IpAddr::V4(_) => TcpSocket::new_v4()?,
                IpAddr::V6(_) => TcpSocket::new_v6()?,
            };
            socket.bind(SocketAddr::new(host, 0))?;
            let listener = socket.listen(1)?;
            let local_addr = listener.local_addr()?;
            Ok((listener, local_addr))
        };

        let (listener, local_addr) = bind().map_err(|e| {
            ProvisionError::Rendezvous(format!("failed to listen on {}: {}", host, e))
        })?;
        debug!("Rendezvous listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the guest, bounded by `limit` if set.
    #[cfg(test)]
    pub async fn wait(self, limit: Option<Duration>) -> Result<GuestReport> {
        self.wait_or_interrupt(limit, std::future::pending()).await
    }

    /// Accept one connection and read its status byte.
    ///
    /// `limit` bounds the whole exchange. If `interrupt` completes first the
    /// listener is dropped and [`ProvisionError::Interrupted`] is returned.
    /// The listener is consumed either way.
    pub async fn wait_or_interrupt<F>(
        self,
        limit: Option<Duration>,
        interrupt: F,
    ) -> Result<GuestReport>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let exchange = receive_status(&self.listener);

        let outcome = tokio::select! {
            outcome = async {
                match limit {
                    Some(limit) => match timeout(limit, exchange).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ProvisionError::InstallTimedOut { waited: limit }),
                    },
                    None => exchange.await,
                }
            } => outcome,
            _ = interrupt => Err(ProvisionError::Interrupted),
        };

        let (status, peer) = outcome?;
        let waited = started.elapsed();
        info!("Guest {} reported {:?} after {}s", peer, status, waited.as_secs());

        Ok(GuestReport {
            status,
            peer,
            waited,
        })
    }
}

async fn receive_status(
    listener: &TcpListener,
) -> std::result::Result<(GuestStatus, SocketAddr), ProvisionError> {
    let (mut stream, peer) = listener
        .accept()
        .await
        .map_err(|e| ProvisionError::Rendezvous(format!("accept failed: {}", e)))?;
    debug!("Guest connected from {}", peer);

    let mut byte = [0u8; 1];
    match stream.read_exact(&mut byte).await {
        Ok(_) => Ok((GuestStatus::from_byte(byte[0]), peer)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProvisionError::GuestDisconnected)
        }
        Err(e) => Err(ProvisionError::Rendezvous(format!(
            "failed to read status from {}: {}",
            peer, e
        ))),
    }
}

/// Connect to a rendezvous listener and send one status byte, as the guest
/// bootstrap does.
#[cfg(test)]
pub async fn send_status(addr: SocketAddr, status: u8) -> Result<()> {
    use anyhow::Context;
    use tokio::io::AsyncWriteExt;

    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    stream.write_all(&[status]).await?;
    stream.flush().await?;
    Ok(())
}
