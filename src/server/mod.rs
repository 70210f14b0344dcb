//! TCP front end for the reference coordination service.
//!
//! Each accepted socket gets its own task that decodes [`ClientFrame`]s into the shared
//! [`MemoryEnsemble`] and writes whatever the service queues for it back to the socket.
//! A reaper task expires silent sessions on a fixed interval.


use std::net::SocketAddr;
use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::metrics::OPEN_CONNECTIONS;
use crate::network::frame_codec;
use crate::proto;
use crate::utils::async_task::spawn_task;
use crate::ClientFrame;
use crate::MemoryEnsemble;
use crate::Result;
use crate::ServerFrame;
use crate::ServerSettings;
use crate::SystemError;

pub struct Server {
    listener: TcpListener,
    ensemble: MemoryEnsemble,
    settings: ServerSettings,
}

impl Server {
    /// Binds `settings.listen_addr`; the ensemble may be shared with in-process clients
    pub async fn bind(
        settings: ServerSettings,
        ensemble: MemoryEnsemble,
    ) -> Result<Self> {
        settings.validate()?;
        let listener = TcpListener::bind(&settings.listen_addr).await?;
        info!(addr = %listener.local_addr()?, "coordination service listening");
        Ok(Self {
            listener,
            ensemble,
            settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    /// Accepts connections until `shutdown` fires
    pub async fn serve(
        self,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<()> {
        let reaper = spawn_task(
            "session_reaper",
            reap_sessions(
                self.ensemble.clone(),
                self.settings.reaper_interval(),
                shutdown.clone(),
            ),
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("coordination service shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            spawn_task(
                                "connection",
                                serve_connection(
                                    stream,
                                    self.ensemble.clone(),
                                    self.settings.max_frame_size,
                                    shutdown.clone(),
                                ),
                            );
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
            }
        }

        reaper.await.map_err(SystemError::from)?;
        Ok(())
    }
}

async fn reap_sessions(
    ensemble: MemoryEnsemble,
    period: Duration,
    mut shutdown: watch::Receiver<()>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = ticker.tick() => {
                let expired = ensemble.reap();
                if expired > 0 {
                    debug!(expired, "reaper expired silent sessions");
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    ensemble: MemoryEnsemble,
    max_frame_size: usize,
    shutdown: watch::Receiver<()>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let framed = Framed::new(stream, frame_codec(max_frame_size));
    let (tx, outbound) = mpsc::unbounded_channel();
    let connection_id = ensemble.attach(tx);
    OPEN_CONNECTIONS.inc();

    let result = pump(connection_id, framed, outbound, &ensemble, shutdown).await;

    ensemble.detach(connection_id);
    OPEN_CONNECTIONS.dec();
    debug!(connection_id, "connection finished");
    result
}

async fn pump(
    connection_id: u64,
    mut framed: Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
    mut outbound: mpsc::UnboundedReceiver<ServerFrame>,
    ensemble: &MemoryEnsemble,
    mut shutdown: watch::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            inbound = framed.next() => {
                let Some(bytes) = inbound.transpose()? else {
                    trace!(connection_id, "peer closed the connection");
                    return Ok(());
                };
                let frame: ClientFrame = proto::decode(&bytes)?;
                trace!(connection_id, ?frame, "inbound frame");
                if ensemble.handle(connection_id, frame).is_err() {
                    return Ok(());
                }
            }
            queued = outbound.recv() => {
                // the service dropped this connection
                let Some(frame) = queued else {
                    return Ok(());
                };
                framed.send(proto::encode(&frame)?).await?;
            }
        }
    }
}
