// SPDX-License-Identifier: GPL-3.0-only

//! D-Bus surface of the helper
//!
//! Clients connect to a Unix socket and speak peer-to-peer D-Bus; there is no
//! bus daemon in between. Each connection gets its own interface object and
//! its own signal forwarder.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use imageflash_contracts::HELPER_PATH;
use imageflash_types::HelperEvent;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zbus::object_server::SignalEmitter;
use zbus::{Guid, MessageStream, fdo, interface};

use crate::error::{Result, ServiceError};
use crate::service::{ConnectionId, HelperHandle, Subscriber};

/// Per-connection interface object
pub struct HelperInterface {
    handle: HelperHandle,
    connection: ConnectionId,
    events: mpsc::UnboundedSender<HelperEvent>,
}

#[interface(name = "org.imageflash.Helper1")]
impl HelperInterface {
    /// Start writing the image at `source` (path or file URL) to whole disk `device`
    async fn write_image(&self, source: String, device: String, credential: Vec<u8>) -> bool {
        self.handle.write_image(&source, &device, &credential).await
    }

    /// Start turning `device` into Windows installer media from the ISO at `source`
    async fn write_windows_image(
        &self,
        source: String,
        device: String,
        label: String,
        credential: Vec<u8>,
    ) -> bool {
        self.handle
            .write_windows_image(&source, &device, &label, &credential)
            .await
    }

    async fn cancel_write(&self, credential: Vec<u8>) -> bool {
        self.handle.cancel_write(&credential).await
    }

    async fn eject(&self, device: String, credential: Vec<u8>) -> bool {
        self.handle.eject(&device, &credential).await
    }

    async fn get_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Route job events to this connection; returns whether a job is running
    async fn subscribe(&self, credential: Vec<u8>) -> fdo::Result<bool> {
        let subscriber = Subscriber {
            connection: self.connection,
            events: self.events.clone(),
        };
        self.handle
            .subscribe(subscriber, &credential)
            .await
            .ok_or_else(|| ServiceError::AuthorizationFailed("subscribe".to_string()).into())
    }

    async fn stop(&self, credential: Vec<u8>) -> fdo::Result<()> {
        if self.handle.stop(&credential).await {
            Ok(())
        } else {
            Err(ServiceError::AuthorizationFailed("stop".to_string()).into())
        }
    }

    #[zbus(signal)]
    async fn status_changed(emitter: &SignalEmitter<'_>, status: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn progress_changed(emitter: &SignalEmitter<'_>, percentage: f64) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn finished(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn failed(emitter: &SignalEmitter<'_>, error: u32) -> zbus::Result<()>;
}

/// Emit queued events as signals, in order, until the connection breaks.
async fn forward_events(
    emitter: SignalEmitter<'static>,
    mut events: mpsc::UnboundedReceiver<HelperEvent>,
) {
    while let Some(event) = events.recv().await {
        let sent = match &event {
            HelperEvent::StatusChanged(status) => {
                HelperInterface::status_changed(&emitter, status).await
            }
            HelperEvent::ProgressChanged(percentage) => {
                HelperInterface::progress_changed(&emitter, *percentage).await
            }
            HelperEvent::Finished => HelperInterface::finished(&emitter).await,
            HelperEvent::Failed(kind) => HelperInterface::failed(&emitter, kind.code()).await,
        };
        if let Err(e) = sent {
            warn!("Dropping subscriber: {e}");
            break;
        }
    }
}

/// Serve one client until it disconnects.
pub async fn serve_connection(
    stream: UnixStream,
    handle: HelperHandle,
    connection_id: ConnectionId,
) -> Result<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let iface = HelperInterface {
        handle: handle.clone(),
        connection: connection_id,
        events: events_tx,
    };

    let connection = zbus::connection::Builder::unix_stream(stream)
        .server(Guid::generate())?
        .p2p()
        .serve_at(HELPER_PATH, iface)?
        .build()
        .await?;
    debug!("Connection {connection_id} established");

    let emitter = SignalEmitter::new(&connection, HELPER_PATH)?.into_owned();
    let forwarder = tokio::spawn(forward_events(emitter, events_rx));

    let mut incoming = MessageStream::from(&connection);
    while let Some(message) = incoming.next().await {
        if message.is_err() {
            break;
        }
    }

    forwarder.abort();
    handle.disconnected(connection_id);
    debug!("Connection {connection_id} closed");
    Ok(())
}

fn prepare_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    // Any local user may connect; every call is authorized on its own.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    Ok(listener)
}

/// Accept clients on `socket_path` until `shutdown` fires.
pub async fn listen(
    socket_path: PathBuf,
    handle: HelperHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    check_socket_path(&socket_path)?;
    let listener = prepare_socket(&socket_path)?;
    info!("Listening on {}", socket_path.display());

    let mut next_id: ConnectionId = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    next_id += 1;
                    let connection_id = next_id;
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, handle, connection_id).await {
                            warn!("Connection {connection_id} failed: {e}");
                        }
                    });
                }
                Err(e) => warn!("Failed to accept connection: {e}"),
            },
        }
    }

    if let Err(e) = std::fs::remove_file(&socket_path) {
        debug!("Could not remove {}: {e}", socket_path.display());
    }
    Ok(())
}

fn check_socket_path(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(ServiceError::InvalidArgument(format!(
            "socket path {} must be absolute",
            path.display()
        )));
    }
    Ok(())
}
