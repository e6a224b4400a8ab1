//! CRI runtime client over a Unix domain socket

use super::{RuntimeError, RuntimeHandler};
use crate::proto::{RuntimeServiceClient, StopContainerRequest};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::OnceCell;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

/// Placeholder authority; the connector ignores it and dials the socket
const CRI_AUTHORITY: &str = "http://[::]:50051";

pub struct CriRuntimeHandler {
    socket: PathBuf,
    request_timeout: Duration,
    channel: OnceCell<Channel>,
}

impl CriRuntimeHandler {
    pub fn new(socket: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            request_timeout,
            channel: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<RuntimeServiceClient<Channel>, RuntimeError> {
        let channel = self
            .channel
            .get_or_try_init(|| async {
                let socket = self.socket.clone();
                let endpoint = Endpoint::try_from(CRI_AUTHORITY)
                    .map_err(|source| RuntimeError::Connect {
                        endpoint: self.socket.display().to_string(),
                        source,
                    })?
                    .timeout(self.request_timeout)
                    .connect_timeout(self.request_timeout);
                debug!(socket = %socket.display(), "Creating CRI channel");
                Ok::<_, RuntimeError>(endpoint.connect_with_connector_lazy(service_fn(
                    move |_: Uri| UnixStream::connect(socket.clone()),
                )))
            })
            .await?;
        Ok(RuntimeServiceClient::new(channel.clone()))
    }
}

#[async_trait]
impl RuntimeHandler for CriRuntimeHandler {
    async fn stop_container(&self, container_id: &str, timeout_secs: i64) -> Result<(), RuntimeError> {
        let mut client = self.client().await?;
        client
            .stop_container(StopContainerRequest {
                container_id: container_id.to_string(),
                timeout: timeout_secs,
            })
            .await
            .map_err(|source| RuntimeError::Stop {
                container_id: container_id.to_string(),
                source,
            })?;
        debug!(container_id, timeout_secs, "Stopped container");
        Ok(())
    }
}
