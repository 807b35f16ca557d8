use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream handed out by a dialer. Object safe so proxy handlers can
/// splice without knowing which stack produced the connection.
pub trait AsyncProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncProxyStream for T {}
