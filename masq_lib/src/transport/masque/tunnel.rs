//! CONNECT-IP session establishment and the tunnel packet connection.
//!
//! IP datagrams ride QUIC datagrams carrying the request stream's quarter
//! stream ID followed by context ID zero. Capsules arriving on the request
//! stream are drained and ignored; the stream finishing in either direction
//! ends the tunnel.

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace};
use quinn_proto::crypto::rustls::QuicClientConfig;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::profile::Profile;
use crate::core::packet::PacketConn;
use crate::transport::masque::{h3, tls, ACCESS_DENIED, CONNECT_PROTOCOL, H3_SETTING_CONNECT_IP};

const ACCESS_DENIED_ALERT: u8 = 49;
const DATAGRAM_BUFFER: usize = 128 * 1024;

pub(crate) async fn connect_tunnel(
    remote: SocketAddr,
    host: &str,
    sni: &str,
    keepalive: Duration,
    initial_packet_size: u16,
    profile: &Profile,
) -> io::Result<Arc<MasqueConn>> {
    let tls_config =
        tls::build_client_config(&profile.private_key_der, &profile.peer_public_key_der)?;

    let bind: SocketAddr = if remote.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let endpoint = quinn::Endpoint::client(bind)?;

    let quic_config = QuicClientConfig::try_from(tls_config).map_err(|err| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("tls configuration rejected: {}", err),
        )
    })?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_config));
    let mut transport_config = quinn_proto::TransportConfig::default();
    transport_config
        .keep_alive_interval(Some(keepalive))
        .initial_mtu(initial_packet_size)
        .datagram_receive_buffer_size(Some(DATAGRAM_BUFFER))
        .datagram_send_buffer_size(DATAGRAM_BUFFER);
    client_config.transport_config(Arc::new(transport_config));

    let connecting = endpoint
        .connect_with(client_config, remote, sni)
        .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err.to_string()))?;
    let conn = match connecting.await {
        Ok(conn) => conn,
        Err(err) => {
            endpoint.close(quinn::VarInt::from_u32(0), b"");
            return Err(map_connection_error(err));
        }
    };

    match connect_ip(&conn, host, remote.port()).await {
        Ok(session) => Ok(Arc::new(MasqueConn::new(endpoint, conn, session))),
        Err(err) => {
            conn.close(quinn::VarInt::from_u32(0), b"");
            endpoint.close(quinn::VarInt::from_u32(0), b"");
            Err(err)
        }
    }
}

struct ConnectIpSession {
    request_send: quinn::SendStream,
    request_recv: quinn::RecvStream,
    control_send: quinn::SendStream,
    qpack_encoder: quinn::SendStream,
    qpack_decoder: quinn::SendStream,
    quarter_stream_id: u64,
}

async fn connect_ip(
    conn: &quinn::Connection,
    host: &str,
    port: u16,
) -> io::Result<ConnectIpSession> {
    // Control stream first, with the settings the edge requires.
    let mut control_send = conn.open_uni().await.map_err(map_connection_error)?;
    let mut head = BytesMut::new();
    h3::put_varint(&mut head, h3::STREAM_TYPE_CONTROL);
    head.extend_from_slice(&h3::settings_frame(&[
        (h3::SETTING_QPACK_MAX_TABLE_CAPACITY, 0),
        (h3::SETTING_QPACK_BLOCKED_STREAMS, 0),
        (h3::SETTING_ENABLE_CONNECT_PROTOCOL, 1),
        (h3::SETTING_H3_DATAGRAM, 1),
        (H3_SETTING_CONNECT_IP, 1),
    ]));
    control_send.write_all(&head).await.map_err(map_write_error)?;

    // Both qpack streams are announced even though the dynamic table stays
    // empty for the whole session.
    let mut qpack_encoder = conn.open_uni().await.map_err(map_connection_error)?;
    write_stream_type(&mut qpack_encoder, h3::STREAM_TYPE_QPACK_ENCODER).await?;
    let mut qpack_decoder = conn.open_uni().await.map_err(map_connection_error)?;
    write_stream_type(&mut qpack_decoder, h3::STREAM_TYPE_QPACK_DECODER).await?;

    // The server's control and qpack streams carry nothing this client acts
    // on; drain them so flow control keeps moving.
    let drain_conn = conn.clone();
    tokio::spawn(drain_uni_streams(drain_conn));

    let (mut request_send, mut request_recv) =
        conn.open_bi().await.map_err(map_connection_error)?;
    let quarter_stream_id = request_send.id().index();

    let authority = format_authority(host);
    let path = format!("/.well-known/masque/udp/{}/", port);
    let fields = [
        (":method", "CONNECT"),
        (":protocol", CONNECT_PROTOCOL),
        (":scheme", "https"),
        (":authority", authority.as_str()),
        (":path", path.as_str()),
        ("capsule-protocol", "?1"),
        ("user-agent", ""),
    ];
    request_send
        .write_all(&h3::headers_frame(&fields))
        .await
        .map_err(map_write_error)?;

    let status = loop {
        let (kind, payload) = h3::read_frame(&mut request_recv).await?;
        match kind {
            h3::FRAME_HEADERS => {
                let fields = h3::decode_field_section(payload)?;
                let status = fields
                    .iter()
                    .find(|(name, _)| name.as_str() == ":status")
                    .and_then(|(_, value)| value.parse::<u16>().ok())
                    .ok_or_else(|| {
                        io::Error::new(
                            ErrorKind::InvalidData,
                            "connect-ip response carries no status",
                        )
                    })?;
                break status;
            }
            h3::FRAME_DATA => {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    "unexpected data frame before response headers",
                ))
            }
            other => trace!("ignoring http/3 frame type {:#x}", other),
        }
    };
    if status != 200 {
        return Err(io::Error::new(
            ErrorKind::ConnectionRefused,
            format!("tunnel connection failed with status {}", status),
        ));
    }
    debug!(
        "connect-ip session established on stream {}",
        quarter_stream_id * 4
    );

    Ok(ConnectIpSession {
        request_send,
        request_recv,
        control_send,
        qpack_encoder,
        qpack_decoder,
        quarter_stream_id,
    })
}

async fn write_stream_type(stream: &mut quinn::SendStream, kind: u64) -> io::Result<()> {
    let mut buf = BytesMut::new();
    h3::put_varint(&mut buf, kind);
    stream.write_all(&buf).await.map_err(map_write_error)
}

async fn drain_uni_streams(conn: quinn::Connection) {
    loop {
        let mut stream = match conn.accept_uni().await {
            Ok(stream) => stream,
            Err(_) => return,
        };
        tokio::spawn(async move {
            let mut sink = [0u8; 2048];
            while let Ok(Some(_)) = stream.read(&mut sink).await {}
        });
    }
}

fn format_authority(host: &str) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Established tunnel. Exclusive owner of the QUIC connection, its UDP
/// socket and the CONNECT-IP request stream.
pub(crate) struct MasqueConn {
    endpoint: quinn::Endpoint,
    conn: quinn::Connection,
    request_send: Mutex<Option<quinn::SendStream>>,
    // Held so the streams are not reset while the session lives.
    _control_send: quinn::SendStream,
    _qpack_encoder: quinn::SendStream,
    _qpack_decoder: quinn::SendStream,
    quarter_stream_id: u64,
    datagram_prefix: Bytes,
    closed: CancellationToken,
}

impl MasqueConn {
    fn new(endpoint: quinn::Endpoint, conn: quinn::Connection, session: ConnectIpSession) -> Self {
        let mut prefix = BytesMut::new();
        h3::put_varint(&mut prefix, session.quarter_stream_id);
        h3::put_varint(&mut prefix, 0); // context ID: unfragmented IP payload

        let closed = CancellationToken::new();
        let drain_closed = closed.clone();
        let mut request_recv = session.request_recv;
        tokio::spawn(async move {
            // Capsules (address assignment, route advertisements) are not
            // interpreted; a FIN or reset here means the session is over.
            let mut sink = [0u8; 2048];
            loop {
                match request_recv.read(&mut sink).await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
            drain_closed.cancel();
        });

        MasqueConn {
            endpoint,
            conn,
            request_send: Mutex::new(Some(session.request_send)),
            _control_send: session.control_send,
            _qpack_encoder: session.qpack_encoder,
            _qpack_decoder: session.qpack_decoder,
            quarter_stream_id: session.quarter_stream_id,
            datagram_prefix: prefix.freeze(),
            closed,
        }
    }
}

#[async_trait]
impl PacketConn for MasqueConn {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut datagram = tokio::select! {
                _ = self.closed.cancelled() => return Ok(0),
                result = self.conn.read_datagram() => match result {
                    Ok(datagram) => datagram,
                    Err(quinn::ConnectionError::LocallyClosed) => return Ok(0),
                    Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(0),
                    Err(err) => return Err(map_connection_error(err)),
                },
            };
            let Ok(quarter_id) = h3::get_varint(&mut datagram) else {
                continue;
            };
            if quarter_id != self.quarter_stream_id {
                continue;
            }
            let Ok(context_id) = h3::get_varint(&mut datagram) else {
                continue;
            };
            if context_id != 0 {
                // ICMP and compression contexts are outside the forwarding
                // contract.
                trace!("dropping datagram with context id {}", context_id);
                continue;
            }
            if datagram.len() > buf.len() {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    "tunnel packet exceeds read buffer",
                ));
            }
            buf[..datagram.len()].copy_from_slice(&datagram);
            return Ok(datagram.len());
        }
    }

    async fn write_packet(&self, pkt: &[u8]) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "tunnel is closed"));
        }
        let mut datagram = BytesMut::with_capacity(self.datagram_prefix.len() + pkt.len());
        datagram.put_slice(&self.datagram_prefix);
        datagram.put_slice(pkt);
        self.conn
            .send_datagram(datagram.freeze())
            .map_err(|err| match err {
                quinn::SendDatagramError::TooLarge => io::Error::new(
                    ErrorKind::InvalidData,
                    "packet exceeds the connection's datagram size",
                ),
                other => io::Error::new(ErrorKind::BrokenPipe, other.to_string()),
            })
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.is_cancelled() {
            // Idempotent: the first close already tore everything down.
            let _ = self.request_send.lock().await.take();
            return Ok(());
        }
        self.closed.cancel();
        // CONNECT-IP session first, then the connection and its socket.
        if let Some(mut send) = self.request_send.lock().await.take() {
            let _ = send.finish();
        }
        self.conn.close(quinn::VarInt::from_u32(0), b"");
        self.endpoint.close(quinn::VarInt::from_u32(0), b"");
        Ok(())
    }
}

pub(crate) fn map_connection_error(err: quinn::ConnectionError) -> io::Error {
    if let quinn::ConnectionError::TransportError(ref transport) = err {
        if transport.code == quinn_proto::TransportErrorCode::crypto(ACCESS_DENIED_ALERT) {
            return io::Error::new(ErrorKind::PermissionDenied, ACCESS_DENIED);
        }
    }
    io::Error::new(ErrorKind::ConnectionReset, err.to_string())
}

fn map_write_error(err: quinn::WriteError) -> io::Error {
    match err {
        quinn::WriteError::ConnectionLost(err) => map_connection_error(err),
        other => io::Error::new(ErrorKind::BrokenPipe, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_brackets_ipv6_hosts() {
        assert_eq!(format_authority("162.159.198.1"), "162.159.198.1");
        assert_eq!(format_authority("2606:4700:103::1"), "[2606:4700:103::1]");
        assert_eq!(format_authority("edge.example.com"), "edge.example.com");
    }

    #[test]
    fn access_denied_is_reported_distinctly() {
        let denied = quinn::ConnectionError::TransportError(quinn_proto::TransportError {
            code: quinn_proto::TransportErrorCode::crypto(ACCESS_DENIED_ALERT),
            frame: None,
            reason: "tls: access denied".to_string(),
        });
        let err = map_connection_error(denied);
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(err.to_string(), ACCESS_DENIED);

        let timeout = map_connection_error(quinn::ConnectionError::TimedOut);
        assert_ne!(timeout.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn datagram_prefix_is_quarter_stream_then_context_zero() {
        let mut prefix = BytesMut::new();
        h3::put_varint(&mut prefix, 0);
        h3::put_varint(&mut prefix, 0);
        assert_eq!(prefix.as_ref(), &[0x00, 0x00]);

        let mut datagram = BytesMut::new();
        h3::put_varint(&mut datagram, 7);
        h3::put_varint(&mut datagram, 0);
        datagram.put_slice(&[0x45, 0x00]);
        let mut bytes = datagram.freeze();
        assert_eq!(h3::get_varint(&mut bytes).unwrap(), 7);
        assert_eq!(h3::get_varint(&mut bytes).unwrap(), 0);
        assert_eq!(bytes.as_ref(), &[0x45, 0x00]);
    }
}
