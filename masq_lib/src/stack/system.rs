//! Kernel TUN device adapter. Exposes the same packet contract as the
//! user-space stack but provides no dialer, so stream inbounds stay dark
//! while this stack is selected.

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
mod native {
    use std::io::{self, ErrorKind};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use log::warn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
    use tokio::sync::Mutex;

    use crate::core::packet::PacketConn;

    pub struct SystemStack {
        read: Mutex<ReadHalf<tun::AsyncDevice>>,
        write: Mutex<WriteHalf<tun::AsyncDevice>>,
        closed: AtomicBool,
    }

    impl SystemStack {
        pub fn new(name: &str, mtu: u16, ipv4: Ipv4Addr, ipv6: Ipv6Addr) -> io::Result<SystemStack> {
            crate::util::check_ifname(name)?;
            let mut config = tun::Configuration::default();
            config
                .tun_name(name)
                .address(ipv4)
                .netmask(Ipv4Addr::new(255, 255, 255, 255))
                .mtu(mtu.into())
                .up();
            let device = tun::create_as_async(&config).map_err(|err| {
                io::Error::new(
                    ErrorKind::Other,
                    format!("failed to create tun device '{}': {}", name, err),
                )
            })?;
            configure_ipv6(name, ipv6);
            let (read, write) = tokio::io::split(device);
            Ok(SystemStack {
                read: Mutex::new(read),
                write: Mutex::new(write),
                closed: AtomicBool::new(false),
            })
        }
    }

    // The tun crate only knows IPv4; the /128 goes through iproute2. Losing
    // v6 connectivity degrades the tunnel but does not break it.
    #[cfg(target_os = "linux")]
    fn configure_ipv6(name: &str, ipv6: Ipv6Addr) {
        let status = std::process::Command::new("ip")
            .args(["-6", "addr", "add", &format!("{}/128", ipv6), "dev", name])
            .status();
        match status {
            Ok(code) if code.success() => {}
            Ok(code) => warn!("'ip -6 addr add' exited with {}", code),
            Err(err) => warn!("cannot assign the IPv6 address via iproute2: {}", err),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn configure_ipv6(name: &str, ipv6: Ipv6Addr) {
        warn!(
            "assign {} to interface '{}' manually; automatic IPv6 setup is linux-only",
            ipv6, name
        );
    }

    #[async_trait]
    impl PacketConn for SystemStack {
        async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            // One read syscall returns exactly one packet on a TUN device.
            self.read.lock().await.read(buf).await
        }

        async fn write_packet(&self, pkt: &[u8]) -> io::Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "tun device is closed"));
            }
            let n = self.write.lock().await.write(pkt).await?;
            if n != pkt.len() {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "short write to tun device",
                ));
            }
            Ok(())
        }

        async fn close(&self) -> io::Result<()> {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let _ = self.write.lock().await.shutdown().await;
            Ok(())
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
mod native {
    use std::io::{self, ErrorKind};
    use std::net::{Ipv4Addr, Ipv6Addr};

    use async_trait::async_trait;

    use crate::core::packet::PacketConn;

    pub struct SystemStack;

    impl SystemStack {
        pub fn new(
            _name: &str,
            _mtu: u16,
            _ipv4: Ipv4Addr,
            _ipv6: Ipv6Addr,
        ) -> io::Result<SystemStack> {
            Err(io::Error::new(
                ErrorKind::Unsupported,
                "native tun is not supported on this platform",
            ))
        }
    }

    #[async_trait]
    impl PacketConn for SystemStack {
        async fn read_packet(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        async fn write_packet(&self, _pkt: &[u8]) -> io::Result<()> {
            Err(io::Error::new(ErrorKind::Unsupported, "no tun device"))
        }

        async fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }
}

pub use native::SystemStack;
