use crate::acl::Acl;
use crate::config::ListenerConfig;
use crate::dispatcher;
use crate::error::ProxyError;
use crate::rate_limit::RateLimiter;
use crate::transport::ForwardTransport;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener as TokioTcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// One bound HTTP forward-proxy listener: accept loop, admission chain
/// (global rate -> per-host rate -> ACL), and per-connection dispatch.
/// Independent of every other listener — no shared state across instances.
pub struct Listener {
    bind: String,
    acl: Acl,
    rate_limiter: Arc<RateLimiter>,
    transport: ForwardTransport,
    cancel: CancellationToken,
    in_flight: Arc<AtomicI64>,
}

impl Listener {
    pub fn new(cfg: &ListenerConfig) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(
            cfg.rate_limit.global_rps,
            cfg.rate_limit.per_host_rps,
        ));
        rate_limiter.start_gc();

        Self {
            bind: cfg.listen.clone(),
            acl: Acl::from_config(cfg),
            rate_limiter,
            transport: ForwardTransport::new(),
            cancel: CancellationToken::new(),
            in_flight: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Binds the listen socket and spawns the accept loop. Returns once the
    /// socket is bound; the accept loop itself runs in a background task.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let addr: std::net::SocketAddr = self
            .bind
            .parse()
            .map_err(|_| ProxyError::Bind(self.bind.clone(), std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad address")))?;

        let tcp_listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Bind(self.bind.clone(), e))?;

        info!("listener: bound, addr={}", addr);

        let rate_limiter = self.rate_limiter.clone();
        let acl = self.acl.clone();
        let transport = self.transport.clone();
        let cancel = self.cancel.clone();
        let in_flight = self.in_flight.clone();
        let bind = self.bind.clone();

        tokio::spawn(async move {
            accept_loop(tcp_listener, rate_limiter, acl, transport, cancel, in_flight, bind).await;
        });

        Ok(())
    }

    /// Signals the accept loop and every in-flight connection to stop, then
    /// waits up to a fixed grace period for in-flight work to drain.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.in_flight.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let remaining = self.in_flight.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!(
                "listener: drain timeout, addr={}, still active={}",
                self.bind, remaining
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    tcp_listener: TokioTcpListener,
    rate_limiter: Arc<RateLimiter>,
    acl: Acl,
    transport: ForwardTransport,
    cancel: CancellationToken,
    in_flight: Arc<AtomicI64>,
    bind: String,
) {
    loop {
        let accepted = tokio::select! {
            result = tcp_listener.accept() => result,
            _ = cancel.cancelled() => {
                info!("listener: stop accepting new connections, addr={}", bind);
                return;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                warn!("listener: accept failed, addr={}: {}", bind, e);
                continue;
            }
        };

        let remote_ip = peer_addr.ip();
        metrics::counter!("gatehouse_connections_total").increment(1);

        if !rate_limiter.allow_global().await {
            info!("listener: globally rate limited, peer={}", peer_addr);
            metrics::counter!("gatehouse_admission_rejected_total", "reason" => "global_rate").increment(1);
            continue;
        }

        if !rate_limiter.allow_host(remote_ip).await {
            info!("listener: per-IP rate limited, peer={}", peer_addr);
            metrics::counter!("gatehouse_admission_rejected_total", "reason" => "host_rate").increment(1);
            continue;
        }

        if !acl.check(remote_ip) {
            info!("listener: ACL failure, peer={}", peer_addr);
            metrics::counter!("gatehouse_admission_rejected_total", "reason" => "acl").increment(1);
            continue;
        }

        let transport = transport.clone();
        let cancel = cancel.clone();
        let in_flight = in_flight.clone();
        in_flight.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("gatehouse_connections_active").increment(1.0);

        tokio::spawn(async move {
            dispatcher::serve_connection(stream, peer_addr, transport, cancel).await;
            in_flight.fetch_sub(1, Ordering::Relaxed);
            metrics::gauge!("gatehouse_connections_active").decrement(1.0);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    fn cfg(bind: &str) -> ListenerConfig {
        ListenerConfig {
            listen: bind.to_string(),
            allow: vec![],
            deny: vec![],
            rate_limit: RateLimitConfig::default(),
        }
    }

    #[tokio::test]
    async fn start_binds_and_stop_completes_promptly() {
        let listener = Listener::new(&cfg("127.0.0.1:18732"));
        listener.start().await.unwrap();
        listener.stop().await;
    }
}
