//! Session lifecycle for local proxy clients
//!
//! Every accepted connection goes through the same steps:
//!
//! ```text
//! Accepted -> InitialRead -> StreamOpened -> Relaying -> Closed
//! ```
//!
//! All flows share one session. It is created on first use and replaced once
//! it reports closed. Concurrent flows that find no usable session wait for
//! a single bootstrap rather than starting their own.

use super::ProxyError;
use crate::bootstrap::SessionFactory;
use crate::tunnel::SessionHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

/// Size of the buffer for a flow's first read
pub const INITIAL_READ_BUF: usize = 10 * 1024;

/// Pause after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Serves local connections over a shared session
pub struct SessionManager<F: SessionFactory> {
    factory: F,
    current: Mutex<Option<Arc<F::Session>>>,
}

impl<F: SessionFactory> SessionManager<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            current: Mutex::new(None),
        }
    }

    /// The live session, bootstrapping a new one if there is none
    ///
    /// The lock is held for the whole bootstrap, so at most one runs and
    /// every waiter gets its result.
    pub async fn current_session(&self) -> Result<Arc<F::Session>, ProxyError> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            debug!("Current session is closed, replacing it");
            *current = None;
        }

        let session = Arc::new(self.factory.establish().await?);
        *current = Some(session.clone());
        Ok(session)
    }

    /// Run one local flow to completion
    pub async fn handle_connection<L>(&self, mut local: L) -> Result<(), ProxyError>
    where
        L: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let session = self.current_session().await?;

        let mut data = vec![0u8; INITIAL_READ_BUF];
        let n = match local.read(&mut data).await {
            Ok(0) => {
                debug!("Proxy client closed before sending anything");
                let _ = local.shutdown().await;
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => {
                let _ = local.shutdown().await;
                return Err(e.into());
            }
        };

        let mut stream = match session.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = local.shutdown().await;
                return Err(e.into());
            }
        };

        if let Err(e) = stream.write_all(&data[..n]).await {
            let _ = local.shutdown().await;
            let _ = stream.shutdown().await;
            return Err(e.into());
        }
        drop(data);

        relay(local, stream).await;
        Ok(())
    }

    /// Accept proxy clients forever, one task per connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    trace!("Accepted proxy client {}", peer);
                    socket.set_nodelay(true).ok();
                    let manager = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.handle_connection(socket).await {
                            warn!("Flow from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept proxy client: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Close the current session, if any
    pub async fn shutdown(&self) {
        if let Some(session) = self.current.lock().await.take() {
            session.close().await;
            info!("Closed current session");
        }
    }
}

/// Copy both ways until either direction ends, then shut down both sides
async fn relay<L, S>(local: L, stream: S)
where
    L: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);

    tokio::select! {
        result = tokio::io::copy(&mut local_rd, &mut stream_wr) => {
            trace!("Client to tunnel finished: {:?}", result);
        }
        result = tokio::io::copy(&mut stream_rd, &mut local_wr) => {
            trace!("Tunnel to client finished: {:?}", result);
        }
    }

    let _ = stream_wr.shutdown().await;
    let _ = local_wr.shutdown().await;
}
