//! HTTP/1.x branch of the mixed inbound: CONNECT tunneling and a forward
//! proxy. The request head is parsed directly off the buffered stream, so
//! the byte the sniffer peeked is the first byte of the request line.

use std::io::{self, ErrorKind};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use http::{Method, Uri};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::core::router::{DefaultRouter, Dialer};

const MAX_LINE: usize = 8192;
const MAX_HEADERS: usize = 128;

struct RequestHead {
    method: Method,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub(crate) async fn serve<S>(router: Arc<DefaultRouter>, mut stream: BufReader<S>, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let head = match read_request_head(&mut stream).await {
        Ok(head) => head,
        Err(err) => {
            debug!("bad http request from {}: {}", peer, err);
            return;
        }
    };
    let dialer = match router.get_default_dialer() {
        Ok(dialer) => dialer,
        Err(err) => {
            warn!("cannot serve http from {}: {}", peer, err);
            let _ = write_simple_response(&mut stream, 503, "Service Unavailable").await;
            return;
        }
    };
    let result = if head.method == Method::CONNECT {
        handle_connect(dialer, stream, head, peer).await
    } else {
        handle_forward(dialer, stream, head, peer).await
    };
    if let Err(err) = result {
        debug!("http proxy error from {}: {}", peer, err);
    }
}

async fn handle_connect<S>(
    dialer: Arc<dyn Dialer>,
    mut stream: BufReader<S>,
    head: RequestHead,
    peer: SocketAddr,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let target = authority_with_port(&head.target, 443)?;
    let mut upstream = match dialer.dial_context("tcp", &target).await {
        Ok(upstream) => upstream,
        Err(err) => {
            let _ = write_simple_response(&mut stream, 502, "Bad Gateway").await;
            return Err(err);
        }
    };
    stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
    stream.flush().await?;

    match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((up, down)) => debug!(
            "connect {} -> {} finished: {} bytes up, {} bytes down",
            peer, target, up, down
        ),
        Err(err) => debug!("connect {} splice ended: {}", peer, err),
    }
    Ok(())
}

async fn handle_forward<S>(
    dialer: Arc<dyn Dialer>,
    mut stream: BufReader<S>,
    head: RequestHead,
    peer: SocketAddr,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (host, port, origin_form) = split_target(&head)?;
    let target = if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let mut upstream = match dialer.dial_context("tcp", &target).await {
        Ok(upstream) => upstream,
        Err(err) => {
            let _ = write_simple_response(&mut stream, 502, "Bad Gateway").await;
            return Err(err);
        }
    };

    // Rebuild the request in origin form. Proxy hop-by-hop headers stop
    // here; everything else, multi-valued headers included, passes through.
    let mut request = format!("{} {} {}\r\n", head.method, origin_form, head.version);
    let mut has_host = false;
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("proxy-connection")
            || name.eq_ignore_ascii_case("proxy-authorization")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    if !has_host {
        request.push_str("Host: ");
        request.push_str(&host);
        request.push_str("\r\n");
    }
    request.push_str("Connection: close\r\n\r\n");
    upstream.write_all(request.as_bytes()).await?;
    upstream.flush().await?;

    // The response streams back verbatim: status line, every header and the
    // body, until the upstream closes.
    let result = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    debug!("forward {} -> {} done ({:?})", peer, target, result.is_ok());
    Ok(())
}

fn authority_with_port(target: &str, default_port: u16) -> io::Result<String> {
    let (host, port) = crate::util::parse_endpoint(target, default_port)?;
    if host.parse::<Ipv6Addr>().is_ok() {
        Ok(format!("[{}]:{}", host, port))
    } else {
        Ok(format!("{}:{}", host, port))
    }
}

fn split_target(head: &RequestHead) -> io::Result<(String, u16, String)> {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        let uri: Uri = head.target.parse().map_err(|err| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("bad request target: {}", err),
            )
        })?;
        let host = uri
            .host()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "request target has no host"))?
            .trim_matches(['[', ']'])
            .to_string();
        let default_port = if uri.scheme_str() == Some("https") {
            443
        } else {
            80
        };
        let port = uri.port_u16().unwrap_or(default_port);
        let origin_form = uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());
        return Ok((host, port, origin_form));
    }
    // Origin-form request: the Host header names the upstream.
    let host_header = head.header("host").ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            "origin-form request without a Host header",
        )
    })?;
    let (host, port) = crate::util::parse_endpoint(host_header, 80)?;
    Ok((host, port, head.target.clone()))
}

async fn write_simple_response<S>(
    stream: &mut BufReader<S>,
    status: u16,
    reason: &str,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\n\r\n",
        status, reason
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

async fn read_request_head<S>(stream: &mut BufReader<S>) -> io::Result<RequestHead>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request_line = read_line(stream).await?;
    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("").to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();
    let method = method.parse::<Method>().map_err(|_| {
        io::Error::new(ErrorKind::InvalidData, format!("bad method '{}'", method))
    })?;
    if target.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "request line has no target",
        ));
    }

    let mut headers = Vec::new();
    loop {
        let line = read_line(stream).await?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(io::Error::new(ErrorKind::InvalidData, "too many headers"));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "malformed header line",
            ));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

async fn read_line<S>(stream: &mut BufReader<S>) -> io::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut raw = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        raw.push(byte);
        if raw.len() > MAX_LINE {
            return Err(io::Error::new(ErrorKind::InvalidData, "header line too long"));
        }
    }
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    String::from_utf8(raw)
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "request is not valid utf-8"))
}
