use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The inbound half of a peer connection, introduced to keep the connection
///  core independent of the concrete transport and to allow mocking the I/O
///  away for testing. `Ok(0)` signals an orderly end of stream.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerReader: Send + 'static {
    async fn read_into(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;
}

/// The outbound half of a peer connection. One call transmits one framed
///  packet in a single transport-level write - for WebSocket that means one
///  message, preserving message boundaries.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerWriter: Send + 'static {
    async fn write_packet(&mut self, packet: &[u8]) -> anyhow::Result<()>;
}

/// Adapter for byte-stream transports (TCP, KCP, in-memory pipes in tests).
pub struct StreamReader<R>(pub R);

#[async_trait]
impl<R> PeerReader for StreamReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read_into(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        Ok(self.0.read(buf).await?)
    }
}

pub struct StreamWriter<W>(pub W);

#[async_trait]
impl<W> PeerWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_packet(&mut self, packet: &[u8]) -> anyhow::Result<()> {
        self.0.write_all(packet).await?;
        Ok(())
    }
}

pub mod ws {
    use async_trait::async_trait;
    use futures_util::stream::{SplitSink, SplitStream};
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    use super::{PeerReader, PeerWriter};

    /// Read half of a WebSocket peer. WebSocket delivers whole messages while
    ///  the assembler consumes a byte stream, so a message larger than the
    ///  caller's buffer is carried over across `read_into` calls.
    pub struct WsReader<S> {
        stream: SplitStream<WebSocketStream<S>>,
        pending: Vec<u8>,
        offset: usize,
    }

    pub struct WsWriter<S> {
        sink: SplitSink<WebSocketStream<S>, Message>,
    }

    /// Split a freshly accepted WebSocket stream into the two peer halves.
    pub fn split<S>(stream: WebSocketStream<S>) -> (WsReader<S>, WsWriter<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = stream.split();
        (
            WsReader {
                stream,
                pending: Vec::new(),
                offset: 0,
            },
            WsWriter { sink },
        )
    }

    #[async_trait]
    impl<S> PeerReader for WsReader<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        async fn read_into(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
            loop {
                if self.offset < self.pending.len() {
                    let n = buf.len().min(self.pending.len() - self.offset);
                    buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
                    self.offset += n;
                    return Ok(n);
                }

                match self.stream.next().await {
                    None => return Ok(0),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Binary(data))) => {
                        self.pending = data;
                        self.offset = 0;
                    }
                    Some(Ok(Message::Text(text))) => {
                        self.pending = text.into_bytes();
                        self.offset = 0;
                    }
                    Some(Ok(Message::Close(_))) => return Ok(0),
                    // ping/pong are handled by the protocol layer
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    #[async_trait]
    impl<S> PeerWriter for WsWriter<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        async fn write_packet(&mut self, packet: &[u8]) -> anyhow::Result<()> {
            self.sink.send(Message::Binary(packet.to_vec())).await?;
            Ok(())
        }
    }
}
