// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use imageflash_types::HelperEvent;
use tokio::net::UnixStream;
use zbus::proxy::CacheProperties;
use zbus::{Connection, MessageStream, proxy};

use super::error::ClientError;
use crate::protocol::decode_event;

/// Proxy for the privileged helper interface
#[proxy(
    interface = "org.imageflash.Helper1",
    default_service = "org.imageflash.Helper",
    default_path = "/org/imageflash/Helper"
)]
pub trait HelperInterface {
    /// Start a raw image write onto a whole disk
    async fn write_image(
        &self,
        source: &str,
        device: &str,
        credential: &[u8],
    ) -> zbus::Result<bool>;

    /// Start a Windows installer write onto a whole disk
    async fn write_windows_image(
        &self,
        source: &str,
        device: &str,
        label: &str,
        credential: &[u8],
    ) -> zbus::Result<bool>;

    /// Cancel the running job
    async fn cancel_write(&self, credential: &[u8]) -> zbus::Result<bool>;

    /// Unmount and eject a disk
    async fn eject(&self, device: &str, credential: &[u8]) -> zbus::Result<bool>;

    /// Helper version, compared by the front end to decide on reinstalling
    async fn get_version(&self) -> zbus::Result<String>;

    /// Become the event receiver; returns whether a job is running
    async fn subscribe(&self, credential: &[u8]) -> zbus::Result<bool>;

    /// Terminate the helper process
    async fn stop(&self, credential: &[u8]) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn status_changed(&self, status: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn progress_changed(&self, percentage: f64) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn finished(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn failed(&self, error: u32) -> zbus::Result<()>;
}

/// Client for a helper listening on a Unix socket
pub struct HelperClient {
    connection: Connection,
    proxy: HelperInterfaceProxy<'static>,
}

impl HelperClient {
    /// Connect to the helper socket at `socket_path`
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let socket_path = socket_path.as_ref();
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ClientError::HelperNotAvailable
            } else {
                ClientError::Connection(format!(
                    "Failed to connect to {}: {e}",
                    socket_path.display()
                ))
            }
        })?;

        let connection = zbus::connection::Builder::unix_stream(stream)
            .p2p()
            .build()
            .await?;

        Self::from_connection(connection).await
    }

    /// Wrap an already established peer-to-peer connection
    pub async fn from_connection(connection: Connection) -> Result<Self, ClientError> {
        let proxy = HelperInterfaceProxy::builder(&connection)
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        Ok(Self { connection, proxy })
    }

    /// Stream of events the helper pushes to this connection
    ///
    /// Create the stream before subscribing so no event is missed.
    pub fn events(&self) -> BoxStream<'static, HelperEvent> {
        MessageStream::from(&self.connection)
            .filter_map(|message| async move { message.ok().and_then(|m| decode_event(&m)) })
            .boxed()
    }

    pub async fn version(&self) -> Result<String, ClientError> {
        Ok(self.proxy.get_version().await?)
    }

    pub async fn subscribe(&self, credential: &[u8]) -> Result<bool, ClientError> {
        Ok(self.proxy.subscribe(credential).await?)
    }

    pub async fn write_image(
        &self,
        source: &str,
        device: &str,
        credential: &[u8],
    ) -> Result<bool, ClientError> {
        Ok(self.proxy.write_image(source, device, credential).await?)
    }

    pub async fn write_windows_image(
        &self,
        source: &str,
        device: &str,
        label: &str,
        credential: &[u8],
    ) -> Result<bool, ClientError> {
        Ok(self
            .proxy
            .write_windows_image(source, device, label, credential)
            .await?)
    }

    pub async fn cancel_write(&self, credential: &[u8]) -> Result<bool, ClientError> {
        Ok(self.proxy.cancel_write(credential).await?)
    }

    pub async fn eject(&self, device: &str, credential: &[u8]) -> Result<bool, ClientError> {
        Ok(self.proxy.eject(device, credential).await?)
    }

    pub async fn stop(&self, credential: &[u8]) -> Result<(), ClientError> {
        Ok(self.proxy.stop(credential).await?)
    }
}
