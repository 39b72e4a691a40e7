//! Loopback listener that relays one local connection through the tunnel.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::tunnel_stats::{TransferTotals, TunnelStats};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("unable to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("unable to accept local connection: {0}")]
    Accept(#[source] io::Error),
    #[error("no local connection within {0:?}")]
    AcceptTimeout(Duration),
    #[error("the tool exited without connecting to the bridge")]
    NoPeer,
    #[error("bridge still forwarding {0:?} after the tool exited")]
    DrainTimeout(Duration),
}

/// How one forwarding direction ended
#[derive(Debug)]
pub enum DirectionEnd {
    /// Source reached end-of-stream
    Eof,
    /// Stopped because the opposite direction finished first
    Stopped,
    IdleTimeout,
    Failed(io::Error),
}

#[derive(Debug)]
pub struct BridgeReport {
    pub local_peer: SocketAddr,
    pub totals: TransferTotals,
    pub local_to_tunnel: DirectionEnd,
    pub tunnel_to_local: DirectionEnd,
}

/// Cheap handle telling whether the bridge has accepted its peer
#[derive(Debug, Clone, Default)]
pub struct BridgeProgress {
    accepted: Arc<AtomicBool>,
}

impl BridgeProgress {
    pub fn has_peer(&self) -> bool {
        self.accepted.load(Ordering::Acquire)
    }
}

/// Bound listener; its port is known before anything connects
pub struct BridgeListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: BridgeConfig,
    progress: BridgeProgress,
}

impl BridgeListener {
    pub async fn bind(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let addr = SocketAddr::new(config.bind_address, 0);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Listen { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BridgeError::Listen { addr, source })?;
        debug!(%local_addr, "bridge listening");

        Ok(Self {
            listener,
            local_addr,
            config: config.clone(),
            progress: BridgeProgress::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn progress(&self) -> BridgeProgress {
        self.progress.clone()
    }

    /// Accept exactly one local connection and relay it through `tunnel`
    /// until both directions have finished.
    ///
    /// The listener is closed as soon as the peer is accepted, so a second
    /// connection attempt is refused.
    pub async fn serve<T>(self, tunnel: &mut T) -> Result<BridgeReport, BridgeError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let accepted = match self.config.accept_timeout {
            Some(limit) => tokio::time::timeout(limit, self.listener.accept())
                .await
                .map_err(|_| BridgeError::AcceptTimeout(limit))?,
            None => self.listener.accept().await,
        };
        let (local, local_peer) = accepted.map_err(BridgeError::Accept)?;
        drop(self.listener);
        self.progress.accepted.store(true, Ordering::Release);
        info!(%local_peer, "local peer connected to bridge");

        if let Err(err) = local.set_nodelay(true) {
            debug!(error = %err, "unable to set TCP_NODELAY on local peer");
        }

        let stats = TunnelStats::new();
        let (local_to_tunnel, tunnel_to_local) =
            relay(tunnel, local, &self.config, &stats).await;

        let report = BridgeReport {
            local_peer,
            totals: stats.snapshot(),
            local_to_tunnel,
            tunnel_to_local,
        };
        for (direction, end) in [
            ("local->tunnel", &report.local_to_tunnel),
            ("tunnel->local", &report.tunnel_to_local),
        ] {
            match end {
                DirectionEnd::Failed(err) => warn!(direction, error = %err, "forwarding failed"),
                DirectionEnd::IdleTimeout => warn!(direction, "forwarding idle timeout"),
                end => debug!(direction, ?end, "forwarding finished"),
            }
        }
        info!(totals = %report.totals, "bridge finished");
        Ok(report)
    }
}

/// Run both directions concurrently.
///
/// When the local side reaches EOF the tunnel->local direction is stopped and
/// the local connection closed; when the tunnel reaches EOF only the local
/// write side is shut down, so the tool can still finish sending. With an
/// idle timeout, both directions end together once no bytes moved either way
/// for that long.
async fn relay<T>(
    tunnel: &mut T,
    local: TcpStream,
    config: &BridgeConfig,
    stats: &TunnelStats,
) -> (DirectionEnd, DirectionEnd)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut tunnel_rd, mut tunnel_wr) = tokio::io::split(tunnel);
    let (mut local_rd, mut local_wr) = local.into_split();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let local_to_tunnel = async {
        let end = pump(&mut local_rd, &mut tunnel_wr, config.chunk_size, |n| {
            stats.record_to_tunnel(n)
        })
        .await;
        let _ = stop_tx.send(());
        end
    };

    let tunnel_to_local = async {
        let end = tokio::select! {
            end = pump(&mut tunnel_rd, &mut local_wr, config.chunk_size, |n| {
                stats.record_from_tunnel(n)
            }) => end,
            _ = &mut stop_rx => DirectionEnd::Stopped,
        };
        if let Err(err) = local_wr.shutdown().await {
            debug!(error = %err, "closing local peer");
        }
        end
    };

    let both = async { tokio::join!(local_to_tunnel, tunnel_to_local) };
    match config.idle_timeout {
        None => both.await,
        Some(limit) => tokio::select! {
            ends = both => ends,
            _ = idle_watchdog(stats, limit) => {
                // Dropping the halves closes the local connection.
                (DirectionEnd::IdleTimeout, DirectionEnd::IdleTimeout)
            }
        },
    }
}

/// Completes once `stats` saw no traffic in either direction for `limit`.
async fn idle_watchdog(stats: &TunnelStats, limit: Duration) {
    loop {
        let idle = stats.idle_for();
        if idle >= limit {
            return;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

/// Copy `reader` into `writer` chunk by chunk until EOF or error.
async fn pump<R, W, F>(reader: &mut R, writer: &mut W, chunk_size: usize, record: F) -> DirectionEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(usize),
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return DirectionEnd::Eof,
            Ok(n) => n,
            Err(err) => return DirectionEnd::Failed(err),
        };

        if let Err(err) = writer.write_all(&buf[..n]).await {
            return DirectionEnd::Failed(err);
        }
        if let Err(err) = writer.flush().await {
            return DirectionEnd::Failed(err);
        }
        record(n);
    }
}
