//! Poem integration: the scrape endpoint.
//!
//! * `GET /metrics` renders the current aggregate in the Prometheus text format.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use poem::listener::TcpListener;
//! use poem::Server;
//! use relay_collector::poem::create_routes;
//! use relay_collector::Aggregator;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let aggregator = Arc::new(Aggregator::default());
//!     Server::new(TcpListener::bind("0.0.0.0:9395"))
//!         .run(create_routes(aggregator))
//!         .await
//! }
//! ```

use std::sync::Arc;

use error_stack::ResultExt;
use poem::endpoint::make;
use poem::get;
use poem::listener::TcpListener;
pub use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::instrument;

use crate::aggregator::Aggregator;
use crate::error::CollectorError;
use crate::error::CollectorResult;
use crate::exposition;

/// Create the scrape `Route` for `aggregator`.
pub fn create_routes(aggregator: Arc<Aggregator>) -> Route {
    let metrics_ep = make(move |_req: poem::Request| {
        let aggregator = Arc::clone(&aggregator);
        async move {
            let body = exposition::render(&aggregator.snapshot());
            Ok::<poem::Response, poem::Error>(
                poem::Response::builder()
                    .content_type(exposition::CONTENT_TYPE)
                    .body(body),
            )
        }
    });

    Route::new().at("/metrics", get(metrics_ep))
}

/// Serves the scrape routes on `addr` until `token` is cancelled.
///
/// # Errors
///
/// - [`CollectorError::Scrape`] if the listener cannot be bound or the server fails
#[instrument(skip(aggregator, token))]
pub async fn serve(addr: String, aggregator: Arc<Aggregator>, token: CancellationToken) -> CollectorResult<()> {
    info!(addr = %addr, "Serving /metrics");
    Server::new(TcpListener::bind(addr.clone()))
        .run_with_graceful_shutdown(create_routes(aggregator), token.cancelled_owned(), None)
        .await
        .change_context(CollectorError::Scrape { addr })
}
