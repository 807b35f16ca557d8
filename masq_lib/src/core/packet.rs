use std::io;

use async_trait::async_trait;

/// A packet-level connection: a TUN device, the user-space stack's wire side
/// or a remote tunnel. No framing is added or stripped by this layer; each
/// call moves exactly one IP datagram and packet boundaries are preserved
/// across adapters.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Reads one datagram into `buf` and returns its length. `Ok(0)` means
    /// the channel closed normally; any other error is fatal for the calling
    /// direction.
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes one datagram atomically. Short writes are not permitted.
    async fn write_packet(&self, pkt: &[u8]) -> io::Result<()>;

    /// Idempotent. Afterwards reads return `Ok(0)` and writes fail.
    async fn close(&self) -> io::Result<()>;
}

#[cfg(test)]
pub(crate) mod memory {
    use std::io::{self, ErrorKind};

    use async_trait::async_trait;
    use tokio::sync::mpsc::{channel, Receiver, Sender};
    use tokio::sync::Mutex;

    use super::PacketConn;

    /// In-memory packet pipe standing in for a tunnel in tests.
    pub(crate) struct MemoryPacketConn {
        tx: Mutex<Option<Sender<Vec<u8>>>>,
        rx: Mutex<Receiver<Vec<u8>>>,
    }

    pub(crate) fn pair() -> (MemoryPacketConn, MemoryPacketConn) {
        let (left_tx, right_rx) = channel(64);
        let (right_tx, left_rx) = channel(64);
        (
            MemoryPacketConn {
                tx: Mutex::new(Some(left_tx)),
                rx: Mutex::new(left_rx),
            },
            MemoryPacketConn {
                tx: Mutex::new(Some(right_tx)),
                rx: Mutex::new(right_rx),
            },
        )
    }

    #[async_trait]
    impl PacketConn for MemoryPacketConn {
        async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.rx.lock().await.recv().await {
                Some(pkt) => {
                    if pkt.len() > buf.len() {
                        return Err(io::Error::new(
                            ErrorKind::InvalidData,
                            "packet larger than read buffer",
                        ));
                    }
                    buf[..pkt.len()].copy_from_slice(&pkt);
                    Ok(pkt.len())
                }
                None => Ok(0),
            }
        }

        async fn write_packet(&self, pkt: &[u8]) -> io::Result<()> {
            let tx = self.tx.lock().await;
            let Some(tx) = tx.as_ref() else {
                return Err(io::Error::new(
                    ErrorKind::BrokenPipe,
                    "write on closed packet conn",
                ));
            };
            tx.send(pkt.to_vec())
                .await
                .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "peer closed"))
        }

        async fn close(&self) -> io::Result<()> {
            self.tx.lock().await.take();
            self.rx.lock().await.close();
            Ok(())
        }
    }

    #[tokio::test]
    async fn pair_preserves_packet_boundaries() {
        let (left, right) = pair();
        left.write_packet(&[1, 2, 3]).await.unwrap();
        left.write_packet(&[4]).await.unwrap();

        let mut buf = [0u8; 16];
        let n = right.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        let n = right.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[4]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_reads() {
        let (left, right) = pair();
        left.close().await.unwrap();
        left.close().await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(right.read_packet(&mut buf).await.unwrap(), 0);
        assert!(left.write_packet(&[1]).await.is_err());
    }
}
