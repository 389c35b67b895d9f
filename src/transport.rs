use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

pub type Request = hyper::Request<BoxBody<Bytes, hyper::Error>>;
pub type Response = hyper::Response<hyper::body::Incoming>;

/// Outbound connection pool and round-tripper for absolute-URI forward
/// requests. Does not originate TLS: forward requests are relayed with
/// whatever scheme the client declared, and CONNECT tunnels carry
/// end-to-end-encrypted bytes untouched, so the transport only ever needs a
/// plain TCP connector.
#[derive(Clone)]
pub struct ForwardTransport {
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
}

impl ForwardTransport {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_keepalive(Some(Duration::from_secs(10)));
        connector.set_connect_timeout(Some(Duration::from_secs(5)));
        connector.enforce_http(false);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(32)
            .build(connector);

        Self { client }
    }

    /// Issues the request and streams the response; the body is never
    /// buffered in full.
    pub async fn round_trip(
        &self,
        req: Request,
    ) -> Result<Response, hyper_util::client::legacy::Error> {
        self.client.request(req).await
    }
}

impl Default for ForwardTransport {
    fn default() -> Self {
        Self::new()
    }
}
