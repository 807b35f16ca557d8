use std::sync::Arc;

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::core::packet::PacketConn;

/// Extra room on top of the interface MTU so encapsulation slack never
/// truncates a datagram.
const BUFFER_HEADROOM: usize = 220;

/// One direction of a tunnel: read a packet from `src`, write it to `dst`,
/// repeat. The shared token is the rendezvous point; the first failure in
/// either direction cancels it and the sibling pump observes that promptly
/// instead of blocking in a read forever.
pub(crate) async fn pump(
    src: Arc<dyn PacketConn>,
    dst: Arc<dyn PacketConn>,
    cancel: CancellationToken,
    direction: &'static str,
    mtu: usize,
) {
    let mut buf = vec![0u8; mtu + BUFFER_HEADROOM];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = src.read_packet(&mut buf) => match result {
                Ok(0) => {
                    debug!("tunnel {} closed", direction);
                    break;
                }
                Ok(n) => n,
                Err(err) => {
                    if !cancel.is_cancelled() {
                        warn!("tunnel {} read error: {}", direction, err);
                    }
                    break;
                }
            },
        };
        if let Err(err) = dst.write_packet(&buf[..n]).await {
            if !cancel.is_cancelled() {
                warn!("tunnel {} write error: {}", direction, err);
            }
            break;
        }
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::memory;
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn forwards_packets_in_order_without_merging() {
        let (local_inner, local_outer) = memory::pair();
        let (remote_inner, remote_outer) = memory::pair();
        let cancel = CancellationToken::new();
        tokio::spawn(pump(
            Arc::new(local_inner),
            Arc::new(remote_inner),
            cancel.clone(),
            "uplink",
            1280,
        ));

        let packets: [&[u8]; 3] = [&[0x45, 0x00, 0x00, 0x1c], &[0x60, 0x01], &[0x45, 0xff]];
        for pkt in packets {
            local_outer.write_packet(pkt).await.unwrap();
        }

        let mut buf = [0u8; 1500];
        for pkt in packets {
            let n = timeout(TEST_TIMEOUT, remote_outer.read_packet(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], pkt);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn source_close_cancels_the_shared_token() {
        let (local_inner, local_outer) = memory::pair();
        let (remote_inner, _remote_outer) = memory::pair();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(
            Arc::new(local_inner),
            Arc::new(remote_inner),
            cancel.clone(),
            "uplink",
            1280,
        ));

        local_outer.close().await.unwrap();
        timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_pump() {
        let (local_inner, _local_outer) = memory::pair();
        let (remote_inner, _remote_outer) = memory::pair();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(
            Arc::new(local_inner),
            Arc::new(remote_inner),
            cancel.clone(),
            "uplink",
            1280,
        ));

        cancel.cancel();
        timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
    }
}
