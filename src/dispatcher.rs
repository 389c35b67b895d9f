use crate::headers;
use crate::transport::ForwardTransport;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads one HTTP/1.1 request head directly off the raw stream, deciding
/// between the CONNECT tunnel path and the absolute-URI forward path.
///
/// This never hands the socket to a general-purpose response writer: a
/// library that owns response encoding cannot emit the byte-exact
/// `HTTP/1.0 200 OK\r\n\r\n` a CONNECT reply requires, since it always
/// writes its own status line. Parsing the request head by hand keeps
/// full control of every byte written back to the client.
pub async fn serve_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    transport: ForwardTransport,
    cancel: CancellationToken,
) {
    let head = match read_head(&mut stream).await {
        Ok(h) => h,
        Err(e) => {
            tracing::debug!("dispatcher: failed to read request head, peer={}: {}", peer_addr, e);
            return;
        }
    };

    let mut headers_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers_buf);
    let parse_result = match parsed.parse(&head.buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            tracing::debug!("dispatcher: incomplete request head, peer={}", peer_addr);
            return;
        }
        Err(e) => {
            tracing::debug!("dispatcher: malformed request, peer={}: {}", peer_addr, e);
            let _ = write_plain_error(&mut stream, 400, "Bad Request").await;
            return;
        }
    };

    let method = parsed.method.unwrap_or("").to_string();
    let target = parsed.path.unwrap_or("").to_string();
    let leftover = head.buf[parse_result..].to_vec();

    let header_pairs: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();

    if method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(stream, &target, leftover, cancel).await;
        return;
    }

    handle_forward(
        stream,
        peer_addr,
        &method,
        &target,
        header_pairs,
        leftover,
        transport,
        cancel,
    )
    .await;
}

struct Head {
    buf: Vec<u8>,
}

/// Buffers bytes from `stream` until a full `\r\n\r\n` header terminator is
/// seen, bounded by `MAX_HEAD_SIZE`. Any bytes read past the terminator
/// (pipelined request body, or — for CONNECT — pipelined tunnel bytes) stay
/// in the returned buffer for the caller to use.
async fn read_head(stream: &mut TcpStream) -> std::io::Result<Head> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(pos) = find_header_end(&buf) {
            let _ = pos;
            return Ok(Head { buf });
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head completed",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// CONNECT path: dial the target, reply with the literal byte-exact
/// `HTTP/1.0 200 OK\r\n\r\n`, then tunnel raw bytes until either side
/// closes.
async fn handle_connect(
    mut client: TcpStream,
    target: &str,
    leftover: Vec<u8>,
    cancel: CancellationToken,
) {
    let host_port = extract_host(target);

    let dial = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&host_port)).await;
    let mut upstream = match dial {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            tracing::info!("dispatcher: connect dial failed, target={}: {}", host_port, e);
            let _ = write_plain_error(&mut client, 500, &format!("can't connect to {}", host_port)).await;
            return;
        }
        Err(_) => {
            tracing::info!("dispatcher: connect dial timed out, target={}", host_port);
            let _ = write_plain_error(&mut client, 500, &format!("can't connect to {}", host_port)).await;
            return;
        }
    };

    if !leftover.is_empty() {
        if upstream.write_all(&leftover).await.is_err() {
            return;
        }
    }

    if client.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.is_err() {
        return;
    }

    let result = crate::tunnel::run(client, upstream, cancel).await;
    tracing::debug!(
        "dispatcher: connect tunnel closed, target={}, up={}b, down={}b",
        host_port,
        result.left_to_right,
        result.right_to_left
    );
}

/// Host extraction for a CONNECT target. A missing port defaults to `:80`
/// even though CONNECT targets conventionally always carry a port — this
/// matches forward-URL host extraction and is a deliberate, documented
/// quirk rather than an oversight.
fn extract_host(target: &str) -> String {
    match target.rfind(':') {
        Some(_) => target.to_string(),
        None => format!("{}:80", target),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_forward(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    method: &str,
    target: &str,
    header_pairs: Vec<(String, String)>,
    leftover: Vec<u8>,
    transport: ForwardTransport,
    cancel: CancellationToken,
) {
    let uri: http::Uri = match target.parse() {
        Ok(u) if u.scheme().is_some() && u.authority().is_some() => u,
        _ => {
            let _ = write_plain_error(&mut client, 500, "No support for non-proxy requests").await;
            return;
        }
    };

    let started = Instant::now();

    let mut req_headers = http::HeaderMap::new();
    for (name, value) in &header_pairs {
        if let (Ok(name), Ok(value)) = (
            name.parse::<http::HeaderName>(),
            http::HeaderValue::from_str(value),
        ) {
            req_headers.append(name, value);
        }
    }
    headers::scrub(&mut req_headers);

    let content_length: u64 = header_pairs
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0);

    let is_chunked = header_pairs.iter().any(|(n, v)| {
        n.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked")
    });

    if is_chunked {
        let _ =
            write_plain_error(&mut client, 500, "chunked request bodies are not supported").await;
        return;
    }

    let body: BoxBody<Bytes, hyper::Error> = if content_length == 0 {
        Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
    } else {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = client.shutdown().await;
                return;
            }
            r = read_fixed_body(&mut client, leftover, content_length) => r,
        };
        match read {
            Ok(bytes) => Full::new(bytes).map_err(|never| match never {}).boxed(),
            Err(e) => {
                tracing::info!("dispatcher: failed to read request body, peer={}: {}", peer_addr, e);
                return;
            }
        }
    };

    let mut builder = hyper::Request::builder()
        .method(method)
        .uri(uri.clone())
        .version(http::Version::HTTP_11);
    for (name, value) in req_headers.iter() {
        builder = builder.header(name, value);
    }
    let request = match builder.body(body) {
        Ok(r) => r,
        Err(e) => {
            let _ = write_plain_error(&mut client, 500, &e.to_string()).await;
            return;
        }
    };

    let upstream_start = Instant::now();
    let round_trip_result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let _ = client.shutdown().await;
            return;
        }
        r = transport.round_trip(request) => r,
    };
    let response = match round_trip_result {
        Ok(r) => r,
        Err(e) => {
            let _ = write_plain_error(&mut client, 500, &e.to_string()).await;
            return;
        }
    };
    let upstream_elapsed = upstream_start.elapsed();

    let status = response.status();
    let mut resp_headers = response.headers().clone();

    let announced_trailers: Vec<String> = resp_headers
        .get_all(http::header::TRAILER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(',').map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect();

    headers::scrub(&mut resp_headers);

    let use_chunked = !announced_trailers.is_empty();
    let content_length_hdr = resp_headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut out = Vec::with_capacity(256);
    write_status_line(&mut out, status);
    if use_chunked {
        out.extend_from_slice(b"Trailer: ");
        out.extend_from_slice(announced_trailers.join(", ").as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in resp_headers.iter() {
            if name == http::header::CONTENT_LENGTH {
                continue;
            }
            write_header_line(&mut out, name.as_str(), value.as_bytes());
        }
        out.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");
    } else {
        for (name, value) in resp_headers.iter() {
            write_header_line(&mut out, name.as_str(), value.as_bytes());
        }
        if content_length_hdr.is_none() {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }

    if client.write_all(&out).await.is_err() {
        return;
    }

    let mut body_bytes: u64 = 0;
    let mut actual_trailers: Vec<(http::HeaderName, http::HeaderValue)> = Vec::new();
    let mut incoming = response.into_body();

    loop {
        let next_frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = client.shutdown().await;
                return;
            }
            f = incoming.frame() => f,
        };

        match next_frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    body_bytes += data.len() as u64;
                    let chunk_result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            let _ = client.shutdown().await;
                            return;
                        }
                        r = async {
                            if use_chunked {
                                write_chunk(&mut client, data).await
                            } else {
                                client.write_all(data).await
                            }
                        } => r,
                    };
                    if chunk_result.is_err() {
                        return;
                    }
                } else if let Some(trailers) = frame.trailers_ref() {
                    for (name, value) in trailers.iter() {
                        actual_trailers.push((name.clone(), value.clone()));
                    }
                }
            }
            Some(Err(e)) => {
                tracing::info!("dispatcher: response body error, peer={}: {}", peer_addr, e);
                break;
            }
            None => break,
        }
    }

    if use_chunked {
        let mut trailer_out = Vec::with_capacity(64);
        trailer_out.extend_from_slice(b"0\r\n");
        for (name, value) in &actual_trailers {
            write_header_line(&mut trailer_out, name.as_str(), value.as_bytes());
        }
        trailer_out.extend_from_slice(b"\r\n");
        let _ = client.write_all(&trailer_out).await;
    } else if content_length_hdr.is_none() {
        let _ = client.shutdown().await;
    }

    let total_elapsed = started.elapsed();
    log_access(
        &uri,
        status.as_u16(),
        body_bytes,
        upstream_elapsed,
        total_elapsed.saturating_sub(upstream_elapsed),
    );
}

async fn read_fixed_body(
    stream: &mut TcpStream,
    leftover: Vec<u8>,
    content_length: u64,
) -> std::io::Result<Bytes> {
    let mut buf = leftover;
    let target_len = content_length as usize;
    buf.truncate(target_len.min(buf.len()));

    while (buf.len() as u64) < content_length {
        let mut chunk = [0u8; 8192];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request body completed",
            ));
        }
        let remaining = (content_length - buf.len() as u64) as usize;
        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }

    Ok(Bytes::from(buf))
}

fn write_status_line(out: &mut Vec<u8>, status: http::StatusCode) {
    out.extend_from_slice(b"HTTP/1.1 ");
    let mut itoabuf = itoa::Buffer::new();
    out.extend_from_slice(itoabuf.format(status.as_u16()).as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn write_header_line(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

async fn write_chunk(stream: &mut TcpStream, data: &Bytes) -> std::io::Result<()> {
    let size_line = format!("{:x}\r\n", data.len());
    stream.write_all(size_line.as_bytes()).await?;
    stream.write_all(data).await?;
    stream.write_all(b"\r\n").await
}

async fn write_plain_error(stream: &mut TcpStream, status: u16, msg: &str) -> std::io::Result<()> {
    let body = msg.as_bytes();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason_phrase(status),
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(body).await
}

fn reason_phrase(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

/// Renders a duration the way the access log expects: sub-millisecond
/// values as `%3.3d us`, everything else as `%d.%3.3d ms`.
fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1000 {
        format!("{:03} us", micros)
    } else {
        let millis = micros / 1000;
        let frac = micros % 1000;
        format!("{}.{:03} ms", millis, frac)
    }
}

/// Writes the one-line-per-request access log directly to stdout. This is
/// deliberately NOT routed through the `tracing` JSON layer installed by
/// `logging::init` — the access log's format is a fixed contract of its
/// own (`time=... url=... status=... bytes=... upstream=... downstream=...`),
/// not an operational log event, and wrapping it in JSON would break any
/// tooling that parses this exact line shape.
fn log_access(uri: &http::Uri, status: u16, bytes: u64, upstream: Duration, downstream: Duration) {
    let now = chrono_now_rfc3339();
    println!(
        "time={} url=\"{}\" status=\"{}\" bytes=\"{}\" upstream={} downstream={}",
        now,
        uri,
        status,
        bytes,
        format_duration(upstream),
        format_duration(downstream),
    );
}

/// Minimal RFC 3339 timestamp, built from `SystemTime` without a date/time
/// crate dependency beyond what the workspace already carries.
fn chrono_now_rfc3339() -> String {
    let now = std::time::SystemTime::now();
    let secs = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    humantime::format_rfc3339(std::time::UNIX_EPOCH + Duration::from_secs(secs)).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_host_defaults_missing_port_to_80() {
        assert_eq!(extract_host("example.com"), "example.com:80");
        assert_eq!(extract_host("example.com:443"), "example.com:443");
    }

    #[test]
    fn duration_formatting_sub_millisecond() {
        assert_eq!(format_duration(Duration::from_micros(42)), "042 us");
        assert_eq!(format_duration(Duration::from_micros(999)), "999 us");
    }

    #[test]
    fn duration_formatting_milliseconds_and_above() {
        assert_eq!(format_duration(Duration::from_millis(1)), "1.000 ms");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.500 ms");
        assert_eq!(format_duration(Duration::from_secs(2)), "2000.000 ms");
    }

    #[test]
    fn find_header_end_locates_terminator() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody-bytes".to_vec();
        let end = find_header_end(&buf).unwrap();
        assert_eq!(&buf[end..], b"body-bytes");
    }
}
