use crate::http::{BoxedResponse, make_boxed_error_response, make_boxed_response};
use hyper::body::Bytes;
use hyper::service::Service;
use hyper::{Request, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

pub const HEALTH_PATH: &str = "/health";
pub const READY_PATH: &str = "/ready";
pub const EXPORT_PATH: &str = "/export/eval_cache/json";

/// Serves the liveness and readiness checks plus the JSON export of the
/// evaluation cache, which sidecar deployments poll as their flag source.
pub struct AdminService<F, X, E> {
    is_ready: F,
    export: X,
    _error: PhantomData<E>,
}

impl<F, X, E> AdminService<F, X, E>
where
    F: Fn() -> bool,
    X: Fn() -> Option<Bytes>,
{
    pub fn new(is_ready: F, export: X) -> Self {
        Self {
            is_ready,
            export,
            _error: PhantomData,
        }
    }
}

impl<F, X, E, B> Service<Request<B>> for AdminService<F, X, E>
where
    F: Fn() -> bool,
    X: Fn() -> Option<Bytes>,
    E: Send + 'static,
{
    type Response = BoxedResponse;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let ok_body = || make_boxed_response(StatusCode::OK, "text/plain", Bytes::from("ok\n"));

        // Everything is computed before the future so it stays 'static.
        let res = match req.uri().path() {
            HEALTH_PATH => ok_body(),
            READY_PATH => match (self.is_ready)() {
                true => ok_body(),
                false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
            },
            EXPORT_PATH => match (self.export)() {
                Some(body) => make_boxed_response(StatusCode::OK, "application/json", body),
                None => make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR),
            },
            _ => make_boxed_error_response(StatusCode::NOT_FOUND),
        };

        Box::pin(async move { Ok(res) })
    }
}
