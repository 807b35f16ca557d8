//! In-process TCP/IP stack.
//!
//! The wire side is a [`PacketConn`] exchanging raw IP datagrams with the
//! tunnel; the top side is a [`Dialer`] that opens synthetic TCP connections
//! inside the stack. A single dataplane task owns the smoltcp interface and
//! every virtual socket; the rest of the process talks to it through bounded
//! channels.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::{CancellationToken, PollSender};

use crate::core::io::AsyncProxyStream;
use crate::core::packet::PacketConn;
use crate::core::router::Dialer;

const WIRE_CHANNEL_SIZE: usize = 512;
const STREAM_CHANNEL_SIZE: usize = 64;
const CONN_CHANNEL_SIZE: usize = 128;
const TCP_SOCKET_BUF: usize = 256 * 1024;
const PENDING_BYTES_MAX: usize = 256 * 1024;
const WIRE_PENDING_MAX: usize = 128;
const LOCAL_PORT_START: u16 = 40000;
const LOCAL_PORT_END: u16 = 65000;
const POLL_TICK_MAX: Duration = Duration::from_millis(100);

fn now() -> smoltcp::time::Instant {
    let millis = std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    smoltcp::time::Instant::from_millis(millis)
}

pub struct NetStack;

impl NetStack {
    /// Builds the stack bound to the profile's tunnel addresses and MTU and
    /// spawns its dataplane. Returns the wire-side packet connection and the
    /// dialer that synthesizes TCP connections inside the stack.
    pub fn new(
        ipv4: Ipv4Addr,
        ipv6: Ipv6Addr,
        mtu: usize,
    ) -> io::Result<(Arc<NetstackConn>, Arc<NetDialer>)> {
        let mut device = VirtualDevice::new(mtu);
        let mut iface = Interface::new(Config::new(HardwareAddress::Ip), &mut device, now());
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(ipv4), 32));
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv6(ipv6), 128));
        });
        // Point-to-point link: the gateway address is never resolved, it only
        // has to exist so the route table forwards everything outward.
        iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Addr::new(0, 0, 0, 1))
            .map_err(|_| io::Error::other("route table full"))?;
        iface
            .routes_mut()
            .add_default_ipv6_route(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1))
            .map_err(|_| io::Error::other("route table full"))?;

        let (wire_in_tx, wire_in_rx) = mpsc::channel(WIRE_CHANNEL_SIZE);
        let (wire_out_tx, wire_out_rx) = mpsc::channel(WIRE_CHANNEL_SIZE);
        let (conn_req_tx, conn_req_rx) = mpsc::channel(CONN_CHANNEL_SIZE);
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let dataplane = Dataplane {
            iface,
            device,
            sockets: SocketSet::new(vec![]),
            conns: Vec::new(),
            wire_in_rx,
            wire_out_tx,
            wire_pending: VecDeque::new(),
            conn_req_rx,
            conn_reqs_open: true,
            notify: notify.clone(),
            cancel: cancel.clone(),
            ipv4,
            ipv6,
            next_port: LOCAL_PORT_START,
        };
        tokio::spawn(dataplane.run());

        Ok((
            Arc::new(NetstackConn {
                wire_in_tx: Mutex::new(Some(wire_in_tx)),
                wire_out_rx: Mutex::new(wire_out_rx),
                cancel,
                mtu,
            }),
            Arc::new(NetDialer {
                conn_req_tx,
                notify,
            }),
        ))
    }
}

/// Wire side of the stack: one IP datagram per call.
pub struct NetstackConn {
    wire_in_tx: Mutex<Option<Sender<Vec<u8>>>>,
    wire_out_rx: Mutex<Receiver<Vec<u8>>>,
    cancel: CancellationToken,
    mtu: usize,
}

#[async_trait]
impl PacketConn for NetstackConn {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.wire_out_rx.lock().await.recv().await {
            Some(pkt) => {
                if pkt.len() > buf.len() {
                    return Err(io::Error::new(
                        ErrorKind::InvalidData,
                        "packet exceeds read buffer",
                    ));
                }
                buf[..pkt.len()].copy_from_slice(&pkt);
                Ok(pkt.len())
            }
            None => Ok(0),
        }
    }

    async fn write_packet(&self, pkt: &[u8]) -> io::Result<()> {
        if pkt.is_empty() || pkt.len() > self.mtu {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("invalid packet length {}", pkt.len()),
            ));
        }
        let tx = self.wire_in_tx.lock().await.clone();
        let Some(tx) = tx else {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "netstack is closed"));
        };
        tx.send(pkt.to_vec())
            .await
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "netstack dataplane stopped"))
    }

    async fn close(&self) -> io::Result<()> {
        self.wire_in_tx.lock().await.take();
        self.wire_out_rx.lock().await.close();
        self.cancel.cancel();
        Ok(())
    }
}

/// Dialer published to the router while the stack is up.
pub struct NetDialer {
    conn_req_tx: Sender<ConnRequest>,
    notify: Arc<Notify>,
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial_context(
        &self,
        network: &str,
        address: &str,
    ) -> io::Result<Box<dyn AsyncProxyStream>> {
        if network != "tcp" {
            return Err(io::Error::new(
                ErrorKind::Unsupported,
                format!("netstack dialer does not support '{}'", network),
            ));
        }
        let target = resolve_preferring_v4(address).await?;
        let (to_client_tx, to_client_rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let (from_client_tx, from_client_rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let (connected_tx, connected_rx) = oneshot::channel();
        self.conn_req_tx
            .send(ConnRequest {
                target,
                to_client_tx,
                from_client_rx,
                connected_tx,
            })
            .await
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "netstack is closed"))?;
        self.notify.notify_one();
        match connected_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(io::Error::new(
                    ErrorKind::BrokenPipe,
                    "netstack dropped the connection",
                ))
            }
        }
        Ok(Box::new(NetstackStream {
            rx: to_client_rx,
            chunk: Bytes::new(),
            tx: PollSender::new(from_client_tx),
            notify: self.notify.clone(),
        }))
    }
}

/// The stack has no resolver of its own; names go through the host's.
/// IPv4 results are preferred because most deployments only route v4.
async fn resolve_preferring_v4(address: &str) -> io::Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let mut first = None;
    for addr in tokio::net::lookup_host(address).await? {
        if addr.is_ipv4() {
            return Ok(addr);
        }
        first.get_or_insert(addr);
    }
    first.ok_or_else(|| {
        io::Error::new(
            ErrorKind::NotFound,
            format!("no addresses for '{}'", address),
        )
    })
}

/// Synthetic TCP connection backed by the dataplane's per-socket queues.
struct NetstackStream {
    rx: Receiver<Bytes>,
    chunk: Bytes,
    tx: PollSender<Bytes>,
    notify: Arc<Notify>,
}

impl AsyncRead for NetstackStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.chunk.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.chunk = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let len = this.chunk.len().min(buf.remaining());
        buf.put_slice(&this.chunk.split_to(len));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for NetstackStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(io::Error::new(
                    ErrorKind::BrokenPipe,
                    "connection reset by netstack",
                )))
            }
            Poll::Pending => return Poll::Pending,
        }
        if this.tx.send_item(Bytes::copy_from_slice(data)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "connection reset by netstack",
            )));
        }
        this.notify.notify_one();
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.tx.close();
        this.notify.notify_one();
        Poll::Ready(Ok(()))
    }
}

struct ConnRequest {
    target: SocketAddr,
    to_client_tx: Sender<Bytes>,
    from_client_rx: Receiver<Bytes>,
    connected_tx: oneshot::Sender<io::Result<()>>,
}

struct ConnEntry {
    handle: SocketHandle,
    /// Dropped once the remote finished sending, which surfaces EOF to the
    /// client side of the stream.
    to_client: Option<Sender<Bytes>>,
    from_client: Receiver<Bytes>,
    connected_tx: Option<oneshot::Sender<io::Result<()>>>,
    pending_to_remote: VecDeque<Bytes>,
    pending_to_client: VecDeque<Bytes>,
    pending_remote_bytes: usize,
    pending_client_bytes: usize,
    client_done: bool,
}

enum Wake {
    Cancelled,
    WireIn(Option<Vec<u8>>),
    ConnReq(Option<ConnRequest>),
    Notified,
    Tick,
}

struct Dataplane {
    iface: Interface,
    device: VirtualDevice,
    sockets: SocketSet<'static>,
    conns: Vec<ConnEntry>,
    wire_in_rx: Receiver<Vec<u8>>,
    wire_out_tx: Sender<Vec<u8>>,
    wire_pending: VecDeque<Vec<u8>>,
    conn_req_rx: Receiver<ConnRequest>,
    conn_reqs_open: bool,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    ipv4: Ipv4Addr,
    ipv6: Ipv6Addr,
    next_port: u16,
}

impl Dataplane {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            while let Ok(req) = self.conn_req_rx.try_recv() {
                self.add_connection(req);
            }
            for _ in 0..WIRE_CHANNEL_SIZE {
                match self.wire_in_rx.try_recv() {
                    Ok(pkt) => self.device.inbound.push_back(pkt),
                    Err(_) => break,
                }
            }

            let timestamp = now();
            let _ = self
                .iface
                .poll(timestamp, &mut self.device, &mut self.sockets);

            while let Some(pkt) = self.device.outbound.pop_front() {
                self.wire_pending.push_back(pkt);
            }
            self.flush_wire();

            self.process_connections();

            if !self.device.inbound.is_empty() || !self.device.outbound.is_empty() {
                tokio::task::yield_now().await;
                continue;
            }

            let delay = self
                .iface
                .poll_delay(timestamp, &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(POLL_TICK_MAX)
                .min(POLL_TICK_MAX);

            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Cancelled,
                pkt = self.wire_in_rx.recv() => Wake::WireIn(pkt),
                req = self.conn_req_rx.recv(), if self.conn_reqs_open => Wake::ConnReq(req),
                _ = self.notify.notified() => Wake::Notified,
                _ = tokio::time::sleep(delay) => Wake::Tick,
            };
            match wake {
                Wake::Cancelled => break,
                Wake::WireIn(Some(pkt)) => self.device.inbound.push_back(pkt),
                // The wire writer is gone: the stack was closed.
                Wake::WireIn(None) => break,
                Wake::ConnReq(Some(req)) => self.add_connection(req),
                Wake::ConnReq(None) => self.conn_reqs_open = false,
                Wake::Notified | Wake::Tick => {}
            }
        }
        debug!("netstack dataplane stopped");
    }

    fn flush_wire(&mut self) {
        while let Some(pkt) = self.wire_pending.pop_front() {
            match self.wire_out_tx.try_send(pkt) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(pkt)) => {
                    self.wire_pending.push_front(pkt);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.wire_pending.clear();
                    return;
                }
            }
        }
        // The wire is a lossy datagram path; under sustained backpressure the
        // oldest packets are shed instead of stalling every socket.
        while self.wire_pending.len() > WIRE_PENDING_MAX {
            self.wire_pending.pop_front();
            trace!("netstack shed one outbound packet");
        }
    }

    fn add_connection(&mut self, req: ConnRequest) {
        let local_addr = match req.target {
            SocketAddr::V4(_) => IpAddress::Ipv4(self.ipv4),
            SocketAddr::V6(_) => IpAddress::Ipv6(self.ipv6),
        };
        let remote = IpEndpoint::new(ip_to_smoltcp(req.target.ip()), req.target.port());
        let local = IpListenEndpoint {
            addr: Some(local_addr),
            port: self.alloc_port(),
        };
        let mut sock = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
            tcp::SocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
        );
        match sock.connect(self.iface.context(), remote, local) {
            Ok(()) => {
                let handle = self.sockets.add(sock);
                self.conns.push(ConnEntry {
                    handle,
                    to_client: Some(req.to_client_tx),
                    from_client: req.from_client_rx,
                    connected_tx: Some(req.connected_tx),
                    pending_to_remote: VecDeque::new(),
                    pending_to_client: VecDeque::new(),
                    pending_remote_bytes: 0,
                    pending_client_bytes: 0,
                    client_done: false,
                });
            }
            Err(err) => {
                let _ = req.connected_tx.send(Err(io::Error::new(
                    ErrorKind::AddrNotAvailable,
                    format!("virtual connect failed: {}", err),
                )));
            }
        }
    }

    fn alloc_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if self.next_port >= LOCAL_PORT_END {
            LOCAL_PORT_START
        } else {
            self.next_port + 1
        };
        port
    }

    fn process_connections(&mut self) {
        let mut index = 0;
        while index < self.conns.len() {
            let entry = &mut self.conns[index];
            let sock = self.sockets.get_mut::<tcp::Socket>(entry.handle);
            let mut drop_conn = false;

            if let Some(tx) = entry.connected_tx.take() {
                if sock.may_send() {
                    let _ = tx.send(Ok(()));
                } else if sock.state() == tcp::State::Closed {
                    let _ = tx.send(Err(io::Error::new(
                        ErrorKind::ConnectionRefused,
                        "connection refused",
                    )));
                    drop_conn = true;
                } else {
                    entry.connected_tx = Some(tx);
                }
            }

            // remote -> client
            while !drop_conn && sock.can_recv() && entry.pending_client_bytes < PENDING_BYTES_MAX {
                let mut chunk = [0u8; 4096];
                match sock.recv_slice(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        entry.pending_client_bytes += n;
                        entry.pending_to_client.push_back(Bytes::copy_from_slice(&chunk[..n]));
                    }
                    Err(_) => break,
                }
            }
            while !drop_conn {
                let Some(to_client) = entry.to_client.as_ref() else {
                    break;
                };
                let Some(front) = entry.pending_to_client.pop_front() else {
                    break;
                };
                let len = front.len();
                match to_client.try_send(front) {
                    Ok(()) => entry.pending_client_bytes -= len,
                    Err(mpsc::error::TrySendError::Full(front)) => {
                        entry.pending_to_client.push_front(front);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        sock.abort();
                        drop_conn = true;
                    }
                }
            }
            if !drop_conn
                && entry.connected_tx.is_none()
                && !sock.may_recv()
                && entry.pending_to_client.is_empty()
            {
                // Remote FIN fully delivered; EOF the client side.
                entry.to_client = None;
            }

            // client -> remote
            while !drop_conn && !entry.client_done && entry.pending_remote_bytes < PENDING_BYTES_MAX
            {
                match entry.from_client.try_recv() {
                    Ok(data) => {
                        entry.pending_remote_bytes += data.len();
                        entry.pending_to_remote.push_back(data);
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        entry.client_done = true;
                    }
                }
            }
            while !drop_conn && sock.can_send() {
                let Some(front) = entry.pending_to_remote.front_mut() else {
                    break;
                };
                match sock.send_slice(front.as_ref()) {
                    Ok(0) => break,
                    Ok(n) if n == front.len() => {
                        entry.pending_remote_bytes -= n;
                        entry.pending_to_remote.pop_front();
                    }
                    Ok(n) => {
                        entry.pending_remote_bytes -= n;
                        let rest = front.slice(n..);
                        *front = rest;
                        break;
                    }
                    Err(_) => {
                        drop_conn = true;
                        break;
                    }
                }
            }
            if !drop_conn && entry.client_done && entry.pending_to_remote.is_empty() {
                sock.close();
            }

            if drop_conn || (!sock.is_open() && entry.pending_to_client.is_empty()) {
                let entry = self.conns.swap_remove(index);
                self.sockets.remove(entry.handle);
                continue;
            }
            index += 1;
        }
    }
}

fn ip_to_smoltcp(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(a) => IpAddress::Ipv4(a),
        IpAddr::V6(a) => IpAddress::Ipv6(a),
    }
}

// Virtual phy feeding smoltcp from the wire queues.
struct VirtualDevice {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    caps: DeviceCapabilities,
}

impl VirtualDevice {
    fn new(mtu: usize) -> Self {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = mtu;
        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            caps,
        }
    }
}

struct VirtRxToken(Vec<u8>);

impl RxToken for VirtRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

struct VirtTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl<'a> TxToken for VirtTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.0.push_back(buf);
        result
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtRxToken;
    type TxToken<'a> = VirtTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.inbound
            .pop_front()
            .map(|pkt| (VirtRxToken(pkt), VirtTxToken(&mut self.outbound)))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(VirtTxToken(&mut self.outbound))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn dialing_emits_a_syn_toward_the_wire() {
        let (conn, dialer) =
            NetStack::new(Ipv4Addr::new(10, 0, 0, 2), "fd00::2".parse().unwrap(), 1280).unwrap();

        // The dial blocks until the handshake completes, which never happens
        // here; only the SYN on the wire matters.
        let dial = tokio::spawn(async move {
            let _ = dialer.dial_context("tcp", "10.0.0.1:80").await;
        });

        let mut buf = [0u8; 1600];
        let n = timeout(READ_TIMEOUT, conn.read_packet(&mut buf))
            .await
            .expect("no packet emitted")
            .unwrap();
        assert!(n >= 40);
        assert_eq!(buf[0] >> 4, 4, "not an IPv4 packet");
        assert_eq!(buf[9], 6, "not TCP");
        assert_eq!(&buf[16..20], &[10, 0, 0, 1], "wrong destination address");
        let header_len = ((buf[0] & 0x0f) as usize) * 4;
        let dst_port = u16::from_be_bytes([buf[header_len + 2], buf[header_len + 3]]);
        assert_eq!(dst_port, 80);
        let flags = buf[header_len + 13];
        assert_eq!(flags & 0x02, 0x02, "SYN flag missing");

        conn.close().await.unwrap();
        dial.abort();
    }

    #[tokio::test]
    async fn rejects_non_tcp_networks() {
        let (conn, dialer) =
            NetStack::new(Ipv4Addr::new(10, 0, 0, 2), "fd00::2".parse().unwrap(), 1280).unwrap();
        let err = match dialer.dial_context("udp", "10.0.0.1:53").await {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_ends_the_wire_side() {
        let (conn, _dialer) =
            NetStack::new(Ipv4Addr::new(10, 0, 0, 2), "fd00::2".parse().unwrap(), 1280).unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();

        let mut buf = [0u8; 1600];
        let n = timeout(READ_TIMEOUT, conn.read_packet(&mut buf))
            .await
            .expect("read did not end")
            .unwrap();
        assert_eq!(n, 0);
        assert!(conn.write_packet(&[0x45, 0, 0, 20]).await.is_err());
    }

    #[tokio::test]
    async fn oversized_writes_are_rejected() {
        let (conn, _dialer) =
            NetStack::new(Ipv4Addr::new(10, 0, 0, 2), "fd00::2".parse().unwrap(), 1280).unwrap();
        let oversized = vec![0u8; 2000];
        let err = conn.write_packet(&oversized).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        conn.close().await.unwrap();
    }
}
