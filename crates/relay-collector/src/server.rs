//! Ingest server.
//!
//! Accepts client connections on a TCP listener and runs one task per connection.
//! Each task decodes records with [`RecordCodec`] and merges them into the shared
//! [`Aggregator`]. A malformed record is skipped; a transport error closes only the
//! connection it happened on.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use error_stack::ResultExt;
use futures::StreamExt;
use relay_protocol::RecordCodec;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::aggregator::Aggregator;
use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::error::CollectorResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    /// connections accepted since start
    pub connections: u64,
    /// connections currently open
    pub active_connections: u64,
    /// records skipped because their payload did not decode
    pub malformed: u64,
    /// observations folded into the aggregate
    pub merged: u64,
    /// observations the aggregator refused
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    active_connections: AtomicU64,
    malformed: AtomicU64,
}

/// Running ingest listener.
pub struct CollectorServer {
    local_addr: SocketAddr,
    aggregator: Arc<Aggregator>,
    counters: Arc<Counters>,
    token: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl CollectorServer {
    /// Binds the ingest listener and starts accepting connections.
    ///
    /// # Errors
    ///
    /// - [`CollectorError::Bind`] if the ingest address cannot be bound
    #[instrument(skip(config, aggregator), fields(addr = %config.ingest_addr))]
    pub async fn start(config: &CollectorConfig, aggregator: Arc<Aggregator>) -> CollectorResult<Self> {
        let bind_error = || CollectorError::Bind {
            addr: config.ingest_addr.clone(),
        };
        let listener = TcpListener::bind(&config.ingest_addr)
            .await
            .change_context_lazy(bind_error)?;
        let local_addr = listener.local_addr().change_context_lazy(bind_error)?;
        info!(addr = %local_addr, "Collector listening for observations");

        let codec = RecordCodec::new().with_max_frame_length(config.max_frame_length);
        let counters = Arc::new(Counters::default());
        let token = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            codec,
            Arc::clone(&aggregator),
            Arc::clone(&counters),
            token.clone(),
        ));

        Ok(Self {
            local_addr,
            aggregator,
            counters,
            token,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn stats(&self) -> CollectorStats {
        let aggregated = self.aggregator.stats();
        CollectorStats {
            connections: self.counters.connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            merged: aggregated.merged,
            rejected: aggregated.rejected,
        }
    }

    /// Token cancelled by [`CollectorServer::shutdown`]. Useful to stop sibling services.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stops accepting, closes every connection and waits for their tasks to finish.
    ///
    /// Returns the stats once every connection task has drained.
    pub async fn shutdown(mut self) -> CollectorStats {
        self.token.cancel();
        if let Err(e) = (&mut self.accept_task).await {
            warn!("Accept loop ended abnormally: {e}");
        }
        info!(addr = %self.local_addr, "Collector stopped");
        self.stats()
    }
}

async fn accept_loop(
    listener: TcpListener,
    codec: RecordCodec,
    aggregator: Arc<Aggregator>,
    counters: Arc<Counters>,
    token: CancellationToken,
) {
    let tracker = TaskTracker::new();
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                counters.connections.fetch_add(1, Ordering::Relaxed);
                tracker.spawn(handle_connection(
                    stream,
                    peer,
                    codec,
                    Arc::clone(&aggregator),
                    Arc::clone(&counters),
                    token.clone(),
                ));
            }
            Err(e) => warn!("Failed to accept connection: {e}"),
        }
    }
    tracker.close();
    tracker.wait().await;
}

#[instrument(skip_all, fields(peer = %peer))]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    codec: RecordCodec,
    aggregator: Arc<Aggregator>,
    counters: Arc<Counters>,
    token: CancellationToken,
) {
    counters.active_connections.fetch_add(1, Ordering::Relaxed);
    debug!("Client connected");

    let mut records = FramedRead::new(stream, codec);
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = records.next() => next,
        };
        match next {
            Some(Ok(Ok(observation))) => {
                let name = observation.name.clone();
                if let Err(e) = aggregator.merge(observation) {
                    warn!(name = %name, "Discarding observation: {e}");
                }
            }
            Some(Ok(Err(malformed))) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Skipping record: {malformed}");
            }
            Some(Err(e)) => {
                warn!("Closing connection: {e}");
                break;
            }
            None => {
                debug!("Client disconnected");
                break;
            }
        }
    }

    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
}
