//! The HTTP trigger.
//!
//! Two routes are served, `/emit-logs` and `/emit-gauges`. Both take one or
//! more `sourceIDs` query parameters and respond only once every source ID
//! has been fully emitted for.
//!
//! ## Metrics
//!
//! `requests_received`: Total requests received, labelled by path
//! `connection.limit`: Configured maximum concurrent connections
//! `connection.current`: Connections currently being served
//!

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http::{StatusCode, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Request, Response, service::Service};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::{counter, gauge};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    pin,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::{emit::emit, envelope::Kind, ingress::Connector, signals::Watcher};

/// Route that emits log envelopes.
pub const EMIT_LOGS_PATH: &str = "/emit-logs";
/// Route that emits gauge envelopes.
pub const EMIT_GAUGES_PATH: &str = "/emit-gauges";

const SOURCE_IDS_REQUIRED: &str = "sourceIDs are required\n";
const NOT_FOUND: &str = "404 page not found\n";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Errors produced by [`Server`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Query string accepted by both emit routes.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
struct EmitQuery {
    #[serde(rename = "sourceIDs", default)]
    source_ids: Vec<String>,
}

/// Extract every `sourceIDs` value, in order. `None` if the key is absent.
///
/// A key that is present with an empty value yields an empty source ID,
/// which is emitted for like any other.
fn source_ids(query: Option<&str>) -> Option<Vec<String>> {
    let query = query?;
    match serde_html_form::from_str::<EmitQuery>(query) {
        Ok(q) if q.source_ids.is_empty() => None,
        Ok(q) => Some(q.source_ids),
        Err(err) => {
            debug!("Unable to parse query {query:?}: {err}");
            None
        }
    }
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(TEXT_PLAIN));
    response
}

/// Routes requests to [`emit`].
#[derive(Debug)]
struct EmitHandler<C> {
    connector: Arc<C>,
}

impl<C> Clone for EmitHandler<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
        }
    }
}

impl<C> EmitHandler<C>
where
    C: Connector,
{
    /// Handle one request. The body, if any, is ignored.
    async fn handle<B>(
        self,
        req: Request<B>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let (parts, _) = req.into_parts();
        let uri = parts.uri;
        let kind = match uri.path() {
            EMIT_LOGS_PATH => Kind::Logs,
            EMIT_GAUGES_PATH => Kind::Gauges,
            _ => return Ok(text_response(StatusCode::NOT_FOUND, NOT_FOUND)),
        };
        counter!("requests_received", "path" => uri.path().to_string()).increment(1);

        let Some(source_ids) = source_ids(uri.query()) else {
            return Ok(text_response(StatusCode::BAD_REQUEST, SOURCE_IDS_REQUIRED));
        };

        // The emission runs in its own task so that a caller hanging up does
        // not cut it short. Only the wait is tied to this request.
        let emission = tokio::spawn(emit(Arc::clone(&self.connector), kind, source_ids));
        match emission.await {
            Ok(summaries) => {
                debug!("{kind} emission complete for {} source IDs", summaries.len());
            }
            Err(err) => error!("Could not join the {kind} emission task: {err}"),
        }

        Ok(Response::new(full(Bytes::new())))
    }
}

/// The HTTP trigger server.
#[derive(Debug)]
pub struct Server<C> {
    addr: SocketAddr,
    concurrency_limit: usize,
    connector: Arc<C>,
    shutdown: Watcher,
}

impl<C> Server<C>
where
    C: Connector,
{
    /// Create a new [`Server`] instance.
    #[must_use]
    pub fn new(
        addr: SocketAddr,
        concurrency_limit: usize,
        connector: C,
        shutdown: Watcher,
    ) -> Self {
        Self {
            addr,
            concurrency_limit,
            connector: Arc::new(connector),
            shutdown,
        }
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Function will return an error if the address cannot be bound.
    pub async fn run(self) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Listening on: {}", listener.local_addr()?);
        self.serve(listener).await;
        Ok(())
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener) {
        let handler = EmitHandler {
            connector: self.connector,
        };
        run_httpd(
            listener,
            self.concurrency_limit,
            self.shutdown,
            move || {
                let handler = handler.clone();
                hyper::service::service_fn(move |req| handler.clone().handle(req))
            },
        )
        .await;
    }
}

async fn run_httpd<SF, S>(
    listener: TcpListener,
    concurrency_limit: usize,
    shutdown: Watcher,
    make_service: SF,
) where
    // "service factory"
    SF: Send + Sync + 'static + Clone + Fn() -> S,
    S: Service<
            Request<hyper::body::Incoming>,
            Response = Response<BoxBody<Bytes, hyper::Error>>,
            Error = hyper::Error,
        > + Send
        + 'static,
    S::Future: Send + 'static,
{
    let sem = Arc::new(Semaphore::new(concurrency_limit));
    let mut join_set = JoinSet::new();

    gauge!("connection.limit").set(concurrency_limit as f64);

    let shutdown_fut = shutdown.clone().recv();
    pin!(shutdown_fut);
    loop {
        let claimed_permits = concurrency_limit - sem.available_permits();
        gauge!("connection.current").set(claimed_permits as f64);

        tokio::select! {
            () = &mut shutdown_fut => {
                info!("Shutdown signal received, stopping accept loop.");
                break;
            }

            incoming = listener.accept() => {
                let (stream, addr) = match incoming {
                    Ok(sa) => sa,
                    Err(e) => {
                        error!("Error accepting connection: {e}");
                        continue;
                    }
                };
                debug!("Accepted connection from {addr}");

                let sem = Arc::clone(&sem);
                let service_factory = make_service.clone();
                let conn_shutdown = shutdown.clone();

                join_set.spawn(async move {
                    let permit = match sem.try_acquire() {
                        Ok(p) => p,
                        Err(TryAcquireError::Closed) => {
                            error!("Semaphore closed");
                            return;
                        }
                        Err(TryAcquireError::NoPermits) => {
                            warn!("httpd over connection capacity, load shedding");
                            drop(stream);
                            return;
                        }
                    };

                    let builder = auto::Builder::new(TokioExecutor::new());
                    let conn = builder.serve_connection(
                        TokioIo::new(stream),
                        service_factory(),
                    );
                    pin!(conn);
                    let conn_shutdown = conn_shutdown.recv();
                    pin!(conn_shutdown);

                    // On shutdown idle connections close at once and busy ones
                    // close after their in-flight request.
                    let res = tokio::select! {
                        res = conn.as_mut() => res,
                        () = &mut conn_shutdown => {
                            conn.as_mut().graceful_shutdown();
                            conn.as_mut().await
                        }
                    };
                    if let Err(e) = res {
                        error!("Error serving {addr}: {e}");
                    }
                    drop(permit);
                });
            }
        }

        // Reap finished connections so the set does not grow without bound.
        while join_set.try_join_next().is_some() {}
    }

    drop(listener);
    while join_set.join_next().await.is_some() {}
}
