use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// The outbound half of a transport, as seen by the protocol engine: a byte sink. Supplied by
///  the socket layer for direct connections, or by the HTTP tunnel. Introduced as a trait to
///  facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportWriter: Send + Sync + 'static {
    async fn write(&self, buf: &[u8]) -> anyhow::Result<usize>;
}

#[async_trait]
impl TransportWriter for Mutex<OwnedWriteHalf> {
    async fn write(&self, buf: &[u8]) -> anyhow::Result<usize> {
        let mut half = self.lock().await;
        half.write_all(buf).await?;
        Ok(buf.len())
    }
}
