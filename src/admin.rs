use crate::metrics::Metrics;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// A small side listener exposing `/health` and `/metrics`, separate from
/// the proxy listeners and not reachable by proxy clients. Unlike the
/// proxy listeners it has no byte-exact response requirement, so it keeps
/// the convenience of a general-purpose HTTP server implementation.
pub async fn run(listen: &str, metrics: Metrics) -> anyhow::Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let tcp_listener = TcpListener::bind(addr).await?;
    info!("admin: listening, addr={}", addr);

    loop {
        let (stream, _) = tcp_listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let metrics = metrics.clone();
                async move { handle(req, metrics) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("admin: connection error: {}", e);
                }
            }
        });
    }
}

fn handle(req: Request<Incoming>, metrics: Metrics) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/metrics" => {
            let body = metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
