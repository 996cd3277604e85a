//! Relay side: accepts producer connections, queues their pose updates and
//! re-emits each one as an OSC datagram.
//!
//! All connections feed one bounded queue. When it is full the incoming
//! update is dropped (drop-newest) and counted; the producer is not told.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::dispatch::PacketSink;
use crate::error::{RelayError, Result};
use crate::logging::Logger;
use crate::osc::RelayEncoder;
use crate::protocol::{self, ClientMessage, ServerMessage};
use crate::{log, vlog};

/// Counters shared by the connection handlers and the worker
#[derive(Debug, Default)]
pub struct RelayStats {
    pub connections: AtomicU64,
    pub received: AtomicU64,
    pub dropped: AtomicU64,
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
}

impl RelayStats {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Pause after a failed accept (fd exhaustion, aborted handshake)
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub type PoseSender = mpsc::Sender<Vec<f32>>;
pub type PoseReceiver = mpsc::Receiver<Vec<f32>>;

pub fn ingress_queue(capacity: usize) -> (PoseSender, PoseReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Queue one update without waiting. `Ok(false)` when it was dropped.
pub fn enqueue(tx: &PoseSender, values: Vec<f32>, stats: &RelayStats) -> Result<bool> {
    stats.received.fetch_add(1, Ordering::Relaxed);
    match tx.try_send(values) {
        Ok(()) => Ok(true),
        Err(mpsc::error::TrySendError::Full(_)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            Ok(false)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(RelayError::Channel("relay worker stopped".into()))
        }
    }
}

// ---------------------------------------------------------------------------
// Encoder + dispatcher worker
// ---------------------------------------------------------------------------

pub struct RelayWorker<D> {
    encoder: RelayEncoder,
    dispatcher: D,
    stats: Arc<RelayStats>,
    logger: Logger,
}

impl<D: PacketSink> RelayWorker<D> {
    pub fn new(encoder: RelayEncoder, dispatcher: D, stats: Arc<RelayStats>, logger: Logger) -> Self {
        Self { encoder, dispatcher, stats, logger }
    }

    /// Encode and send one vector. Errors are counted, never retried.
    pub async fn relay_one(&self, values: &[f32]) -> Result<()> {
        let packet = match self.encoder.encode(values) {
            Ok(p) => p,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        match self.dispatcher.send_packet(&packet).await {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Drain the queue until every sender is gone. Per-packet failures are
    /// logged and the loop moves on to the next update.
    pub async fn run(self, mut rx: PoseReceiver) {
        let mut window_start = Instant::now();
        let mut last = (0u64, 0u64, 0u64);

        while let Some(values) = rx.recv().await {
            if let Err(e) = self.relay_one(&values).await {
                log!(self.logger, "[udp] {e}");
            } else {
                vlog!(self.logger, "[udp] sent {} values", values.len());
            }

            if window_start.elapsed() >= Duration::from_secs(1) {
                let sent = RelayStats::get(&self.stats.sent);
                let failed = RelayStats::get(&self.stats.failed);
                let dropped = RelayStats::get(&self.stats.dropped);
                log!(
                    self.logger,
                    "[fps] {} (failed={} dropped={})",
                    sent - last.0,
                    failed - last.1,
                    dropped - last.2
                );
                last = (sent, failed, dropped);
                window_start = Instant::now();
            }
        }
        log!(self.logger, "[udp] queue closed, worker stopping");
    }
}

// ---------------------------------------------------------------------------
// TCP side
// ---------------------------------------------------------------------------

/// Source of incoming producer connections
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

#[derive(Clone)]
pub struct RelayServer {
    greeting: String,
    tx: PoseSender,
    stats: Arc<RelayStats>,
    logger: Logger,
}

impl RelayServer {
    pub fn new(greeting: impl Into<String>, tx: PoseSender, stats: Arc<RelayStats>, logger: Logger) -> Self {
        Self {
            greeting: greeting.into(),
            tx,
            stats,
            logger,
        }
    }

    /// Accept forever. Each connection runs on its own task; one failing
    /// connection, or a failed accept, never affects the others.
    pub async fn serve<A: Acceptor>(&self, listener: A) {
        loop {
            let (tcp, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log!(self.logger, "[tcp] accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            let _ = tcp.set_nodelay(true);
            self.stats.connections.fetch_add(1, Ordering::Relaxed);
            log!(self.logger, "[tcp] client connected: {}", addr);

            let conn = self.clone();
            tokio::spawn(async move {
                match conn.handle_connection(tcp, addr).await {
                    Ok(()) => log!(conn.logger, "[tcp] client disconnected: {}", addr),
                    Err(e) => log!(conn.logger, "[tcp] client {} dropped: {}", addr, e),
                }
            });
        }
    }

    /// Greet, then feed every pose update into the queue until the peer
    /// closes. `Ok` on a clean close.
    pub async fn handle_connection(&self, tcp: TcpStream, addr: SocketAddr) -> Result<()> {
        let mut stream = protocol::message_stream(tcp);
        protocol::send_message(
            &mut stream,
            &ServerMessage::Greeting { hello: self.greeting.clone() },
        )
        .await?;

        while let Some(frame) = stream.next().await {
            let bytes = frame.map_err(|e| RelayError::Channel(format!("receive failed: {e}")))?;
            match protocol::decode_message::<ClientMessage>(&bytes)? {
                ClientMessage::PoseUpdate { values } => {
                    if !enqueue(&self.tx, values, &self.stats)? {
                        vlog!(self.logger, "[tcp] queue full, dropped update from {}", addr);
                    }
                }
                ClientMessage::PointerMove { x, y } => {
                    vlog!(self.logger, "[tcp] pointer from {}: ({:.3}, {:.3})", addr, x, y);
                }
            }
        }
        Ok(())
    }
}
