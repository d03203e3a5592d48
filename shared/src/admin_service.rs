use crate::http::{make_boxed_error_response, make_json_response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Liveness, readiness and status endpoints for the worker process.
///
/// - `/health` always answers `ok` while the process is serving.
/// - `/ready` answers `ok` once `is_ready` reports true, 503 before that.
/// - `/status` renders the JSON produced by `status`.
pub struct AdminService<F, S, E> {
    is_ready: F,
    status: S,
    _error: PhantomData<E>,
}

impl<F, S, E> AdminService<F, S, E>
where
    F: Fn() -> bool,
    S: Fn() -> serde_json::Value,
{
    pub fn new(is_ready: F, status: S) -> Self {
        Self {
            is_ready,
            status,
            _error: PhantomData,
        }
    }
}

impl<F, S, E> Service<Request<Incoming>> for AdminService<F, S, E>
where
    F: Fn() -> bool + Send + 'static,
    S: Fn() -> serde_json::Value + Send + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = route(req.uri().path(), &self.is_ready, &self.status);
        Box::pin(async move { Ok(res) })
    }
}

fn route(
    path: &str,
    is_ready: impl Fn() -> bool,
    status: impl Fn() -> serde_json::Value,
) -> Response<BoxBody<Bytes, Infallible>> {
    let ok_body = || Full::new(Bytes::from("ok\n")).boxed();

    match path {
        "/health" => Response::new(ok_body()),
        "/ready" => match is_ready() {
            true => Response::new(ok_body()),
            false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        },
        "/status" => make_json_response(&status()),
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}
