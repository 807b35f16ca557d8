//! SOCKS5 branch of the mixed inbound: CONNECT only, no authentication,
//! outbound connections through the router's published dialer.

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::core::router::{DefaultRouter, Dialer};

pub(crate) const SOCKS_VERSION: u8 = 0x05;
const RESERVED: u8 = 0x00;

mod auth_methods {
    pub const NO_AUTH: u8 = 0x00;
    pub const NO_METHODS: u8 = 0xff;
}

mod command {
    pub const CONNECT: u8 = 0x01;
}

mod address_type {
    pub const IPV4: u8 = 0x01;
    pub const DOMAIN: u8 = 0x03;
    pub const IPV6: u8 = 0x04;
}

mod reply {
    pub const SUCCESS: u8 = 0x00;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
}

pub(crate) async fn serve<S>(router: Arc<DefaultRouter>, mut stream: BufReader<S>, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Without a published dialer the connection is aborted outright; the
    // client never gets a method selection.
    let dialer = match router.get_default_dialer() {
        Ok(dialer) => dialer,
        Err(err) => {
            warn!("cannot serve socks5 from {}: {}", peer, err);
            return;
        }
    };
    if let Err(err) = serve_conn(dialer, &mut stream, peer).await {
        if err.kind() == ErrorKind::UnexpectedEof {
            debug!("socks5 connection from {} ended during negotiation", peer);
        } else {
            warn!("socks5 error from {}: {}", peer, err);
        }
    }
}

async fn serve_conn<S>(
    dialer: Arc<dyn Dialer>,
    stream: &mut BufReader<S>,
    peer: SocketAddr,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("unsupported socks version {}", head[0]),
        ));
    }
    let method_count = head[1] as usize;
    if method_count == 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "empty method list",
        ));
    }
    let mut methods = vec![0u8; method_count];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&auth_methods::NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, auth_methods::NO_METHODS])
            .await?;
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "client offers no supported auth method",
        ));
    }
    stream
        .write_all(&[SOCKS_VERSION, auth_methods::NO_AUTH])
        .await?;

    let mut request = [0u8; 3];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("unsupported socks version {}", request[0]),
        ));
    }
    if request[2] != RESERVED {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "invalid reserved byte",
        ));
    }
    let address = read_target_address(stream).await?;
    if request[1] != command::CONNECT {
        stream
            .write_all(&reply_bytes(reply::COMMAND_NOT_SUPPORTED))
            .await?;
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("unsupported socks command {}", request[1]),
        ));
    }

    let mut upstream = match dialer.dial_context("tcp", &address).await {
        Ok(upstream) => upstream,
        Err(err) => {
            stream
                .write_all(&reply_bytes(reply::HOST_UNREACHABLE))
                .await?;
            return Err(err);
        }
    };
    stream.write_all(&reply_bytes(reply::SUCCESS)).await?;
    stream.flush().await?;

    match tokio::io::copy_bidirectional(stream, &mut upstream).await {
        Ok((up, down)) => debug!(
            "socks5 {} -> {} finished: {} bytes up, {} bytes down",
            peer, address, up, down
        ),
        Err(err) => debug!("socks5 {} splice ended: {}", peer, err),
    }
    Ok(())
}

fn reply_bytes(code: u8) -> [u8; 10] {
    [
        SOCKS_VERSION,
        code,
        RESERVED,
        address_type::IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

async fn read_target_address<S>(stream: &mut BufReader<S>) -> io::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut kind = [0u8; 1];
    stream.read_exact(&mut kind).await?;
    match kind[0] {
        address_type::IPV4 => {
            let mut raw = [0u8; 6];
            stream.read_exact(&mut raw).await?;
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            Ok(format!("{}:{}", ip, port))
        }
        address_type::IPV6 => {
            let mut raw = [0u8; 18];
            stream.read_exact(&mut raw).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            Ok(format!("[{}]:{}", ip, port))
        }
        address_type::DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let len = len[0] as usize;
            let mut raw = vec![0u8; len + 2];
            stream.read_exact(&mut raw).await?;
            let host = std::str::from_utf8(&raw[..len]).map_err(|_| {
                io::Error::new(ErrorKind::InvalidData, "target hostname is not valid utf-8")
            })?;
            let port = u16::from_be_bytes([raw[len], raw[len + 1]]);
            Ok(format!("{}:{}", host, port))
        }
        other => Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("unknown address type {}", other),
        )),
    }
}
