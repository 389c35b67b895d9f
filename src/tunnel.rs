use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Tuning for a single tunnel. Defaults mirror the values used for CONNECT
/// tunnels: a 16 KiB buffer per direction, a 10s read deadline and a 15s
/// write deadline, both sliding (refreshed on every iteration).
#[derive(Debug, Clone, Copy)]
pub struct TunnelOptions {
    pub buf_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            buf_size: 16 * 1024,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelResult {
    pub left_to_right: u64,
    pub right_to_left: u64,
}

/// Copies bytes between `left` and `right` concurrently until either side
/// hits EOF or a fatal error, or `cancel` fires. Each direction is an
/// independent task with its own buffer; there is no shared buffer between
/// directions and no ordering guarantee across them.
///
/// Peer-closed conditions (EOF, ECONNRESET, EPIPE, connection-aborted) are
/// normal termination, not errors — the direction simply stops.
///
/// Cancellation force-closes both halves: a cancelled read or write
/// unblocks immediately rather than waiting out its deadline.
pub async fn run(left: TcpStream, right: TcpStream, cancel: CancellationToken) -> TunnelResult {
    run_with_options(left, right, cancel, TunnelOptions::default()).await
}

pub async fn run_with_options(
    left: TcpStream,
    right: TcpStream,
    cancel: CancellationToken,
    opts: TunnelOptions,
) -> TunnelResult {
    let (left_read, left_write) = left.into_split();
    let (right_read, right_write) = right.into_split();

    let left_to_right = tokio::spawn(copy_direction(
        left_read,
        right_write,
        cancel.clone(),
        opts,
    ));
    let right_to_left = tokio::spawn(copy_direction(
        right_read,
        left_write,
        cancel.clone(),
        opts,
    ));

    let (a, b) = tokio::join!(left_to_right, right_to_left);

    TunnelResult {
        left_to_right: a.ok().and_then(|r| r.ok()).unwrap_or(0),
        right_to_left: b.ok().and_then(|r| r.ok()).unwrap_or(0),
    }
}

/// A single half-duplex byte pump: read from `src`, write to `dst`, until
/// EOF, a fatal error, or cancellation. Half-closes `dst`'s write side once
/// `src` reaches EOF so the peer sees the direction end without waiting for
/// the whole tunnel to tear down.
async fn copy_direction(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    cancel: CancellationToken,
    opts: TunnelOptions,
) -> io::Result<u64> {
    let mut buf = vec![0u8; opts.buf_size];
    let mut total: u64 = 0;

    // The result is carried out of the loop rather than returned directly
    // from inside it so that `dst.shutdown()` below runs on every exit —
    // cancellation, a fatal error, a deadline timeout, or graceful EOF
    // alike. Skipping the half-close on anything but EOF would leave the
    // peer direction never seeing a FIN.
    let result: io::Result<u64> = loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(total),
            r = tokio::time::timeout(opts.read_timeout, src.read(&mut buf)) => {
                match r {
                    Ok(Ok(0)) => break Ok(total),
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) if is_peer_closed(&e) => break Ok(total),
                    Ok(Err(e)) => break Err(e),
                    Err(_elapsed) => {
                        break Err(io::Error::new(io::ErrorKind::TimedOut, "tunnel read deadline exceeded"))
                    }
                }
            }
        };

        let write_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(total),
            r = tokio::time::timeout(opts.write_timeout, dst.write_all(&buf[..n])) => r,
        };

        match write_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) if is_peer_closed(&e) => break Ok(total),
            Ok(Err(e)) => break Err(e),
            Err(_elapsed) => {
                break Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "tunnel write deadline exceeded",
                ))
            }
        }

        total += n as u64;
    };

    let _ = dst.shutdown().await;
    drop(src);
    result
}

fn is_peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (connect, accept) = tokio::join!(connect, accept);
        (connect.unwrap(), accept.unwrap().0)
    }

    #[tokio::test]
    async fn copies_bytes_in_both_directions() {
        let (client_side, left) = loopback_pair().await;
        let (upstream_side, right) = loopback_pair().await;

        let cancel = CancellationToken::new();
        let copier = tokio::spawn(run(left, right, cancel));

        let mut client_side = client_side;
        let mut upstream_side = upstream_side;

        client_side.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        upstream_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        upstream_side.write_all(b"xyz").await.unwrap();
        let mut buf2 = [0u8; 3];
        client_side.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"xyz");

        drop(client_side);
        drop(upstream_side);
        let result = copier.await.unwrap();
        assert_eq!(result.left_to_right, 3);
        assert_eq!(result.right_to_left, 3);
    }

    #[tokio::test]
    async fn cancellation_unblocks_both_directions() {
        let (_client_side, left) = loopback_pair().await;
        let (_upstream_side, right) = loopback_pair().await;

        let cancel = CancellationToken::new();
        let copier = tokio::spawn(run(left, right, cancel.clone()));

        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), copier)
            .await
            .expect("tunnel did not terminate promptly on cancellation")
            .unwrap();
        let _ = result;
    }
}
