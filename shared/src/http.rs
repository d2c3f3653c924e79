use http::header::{CONTENT_TYPE, HeaderValue};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

pub type BoxedResponse = Response<BoxBody<Bytes, Infallible>>;

/// Accepts connections on `host:port` and serves them with `service` until
/// `shutdown` resolves. In-flight connections are left to finish on their own.
pub async fn run_http_service<S, E, F>(
    host: &str,
    port: u16,
    service: S,
    shutdown: F,
) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = BoxedResponse, Error = E> + Send + Sync + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    let service_arc = Arc::new(service);
    tokio::pin!(shutdown);

    tracing::info!(host, port, "HTTP listener started");

    loop {
        let (stream, _peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                tracing::info!(host, port, "HTTP listener shutting down");
                return Ok(());
            }
        };
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        tokio::spawn(async move {
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!(error = %e, "connection closed with error");
            }
        });
    }
}

pub fn make_boxed_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> BoxedResponse {
    let mut res = Response::new(Full::new(body).boxed());
    *res.status_mut() = status;
    res.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    res
}

pub fn make_boxed_error_response(status: StatusCode) -> BoxedResponse {
    let reason = status.canonical_reason().unwrap_or("error");
    make_boxed_response(status, "text/plain", Bytes::from(format!("{reason}\n")))
}
