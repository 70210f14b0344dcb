use async_trait::async_trait;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::debug;

use super::Connection;
use super::Connector;
use crate::constants::DEFAULT_MAX_FRAME_SIZE;
use crate::proto;
use crate::ClientFrame;
use crate::Result;
use crate::ServerFrame;
use crate::SystemError;

/// Length-delimited codec shared by both ends of a TCP connection
pub(crate) fn frame_codec(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_size)
        .new_codec()
}

/// Opens TCP connections speaking bincode frames
#[derive(Clone, Debug)]
pub struct TcpConnector {
    max_frame_size: usize,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl TcpConnector {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &str,
    ) -> Result<Box<dyn Connection>> {
        debug!("tcp connect, addr = {:?}", address);
        let stream = TcpStream::connect(address).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                SystemError::Unreachable(address.to_string())
            } else {
                SystemError::Io(e)
            }
        })?;
        stream.set_nodelay(true)?;

        Ok(Box::new(TcpConnection {
            framed: Framed::new(stream, frame_codec(self.max_frame_size)),
        }))
    }
}

pub struct TcpConnection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(
        &mut self,
        frame: ClientFrame,
    ) -> Result<()> {
        let bytes = proto::encode(&frame)?;
        self.framed.send(bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ServerFrame>> {
        match self.framed.next().await {
            Some(Ok(bytes)) => Ok(Some(proto::decode(&bytes)?)),
            Some(Err(e)) => Err(SystemError::Io(e).into()),
            None => Ok(None),
        }
    }
}
