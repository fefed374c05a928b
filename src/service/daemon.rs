use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    config::Settings,
    network::protocol::{AcceptAction, PeerAddress, TransferKey},
    service::file_transfer::{FileTransferManager, SessionEvent, TransferHandle, TransferOptions},
    transfer::{
        DownloadDirChooser, NoopOpener, PlatformOpener, SaveLocationChooser, SaveTargetManager,
        SystemOpener, TokioFileBackend, TransferRole,
    },
    transport::{select_binding, Binding, HostBus, LocalHub, Transport},
    utils::format_file_size,
    DccError, Result,
};

/// Command-line front end over one transfer session.
pub struct TransferDaemon {
    settings: Arc<Settings>,
    handle: TransferHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl TransferDaemon {
    pub async fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let settings = Arc::new(settings);

        let transport = Self::build_transport(&settings).await?;
        let save_targets = Self::build_save_targets(&settings);
        let (handle, events) =
            FileTransferManager::start(transport, save_targets, TransferOptions::from(&settings.transfer));

        Ok(Self {
            settings,
            handle,
            events,
        })
    }

    async fn build_transport(settings: &Settings) -> Result<Arc<dyn Transport>> {
        let binding = select_binding(settings.network.binding, |key| std::env::var(key).ok());
        info!("Using {} binding", binding);

        match binding {
            Binding::Host => {
                let bus = HostBus::bind(
                    settings.get_bind_address(),
                    &settings.network.host,
                    settings.link_timeouts(),
                )
                .await?;
                Ok(Arc::new(bus))
            }
            Binding::Local => {
                warn!("Local binding: only peers inside this process are reachable");
                let hub = LocalHub::new();
                let address = PeerAddress::new(settings.network.host.clone(), settings.network.port);
                Ok(Arc::new(hub.join(address)))
            }
        }
    }

    fn build_save_targets(settings: &Settings) -> SaveTargetManager {
        let opener: Arc<dyn PlatformOpener> = if settings.transfer.auto_open {
            Arc::new(SystemOpener)
        } else {
            Arc::new(NoopOpener)
        };

        SaveTargetManager::new(
            settings.scratch_dir(),
            Arc::new(TokioFileBackend),
            Arc::new(DownloadDirChooser::new(settings.transfer.download_dir.clone())),
            opener,
        )
    }

    pub fn handle(&self) -> &TransferHandle {
        &self.handle
    }

    pub fn local_address(&self) -> &PeerAddress {
        self.handle.local_address()
    }

    /// Serves inbound offers until the session ends. Without an
    /// `auto_accept` action every offer is declined.
    pub async fn listen(mut self, auto_accept: Option<AcceptAction>) -> Result<()> {
        info!("Device Name: {}", self.settings.device.name);
        info!("Listening as {}", self.local_address());
        match auto_accept {
            Some(action) => info!("Auto-accepting offers ({:?})", action),
            None => info!("Offers will be declined; use --auto-accept to receive"),
        }

        while let Some(event) = self.events.recv().await {
            match event {
                SessionEvent::OfferReceived { key, size } => {
                    self.on_offer(&key, size, auto_accept).await;
                }
                SessionEvent::Progress {
                    key,
                    role: TransferRole::Receiver,
                    bytes_transferred,
                    bytes_total,
                } => {
                    debug!(
                        "{}: {} / {}",
                        key,
                        format_file_size(bytes_transferred),
                        format_file_size(bytes_total)
                    );
                }
                SessionEvent::Completed {
                    key,
                    role: TransferRole::Receiver,
                    path,
                } => {
                    let body = match path {
                        Some(path) => format!("Received {} -> {}", key.name, path.display()),
                        None => format!("Received {}", key.name),
                    };
                    show_transfer_notification(body).await;
                }
                SessionEvent::PlaybackReady { key, data } => {
                    self.on_playback(&key, &data).await;
                }
                SessionEvent::Failed { key, error } => {
                    error!("❌ Transfer {} failed: {}", key, error);
                }
                SessionEvent::Canceled { key } => {
                    info!("Transfer {} canceled", key);
                }
                other => debug!("Session event: {:?}", other),
            }
        }

        info!("Transfer session ended");
        Ok(())
    }

    async fn on_offer(&self, key: &TransferKey, size: u64, auto_accept: Option<AcceptAction>) {
        info!(
            "Incoming file '{}' ({}) from {}",
            key.name,
            format_file_size(size),
            key.peer
        );

        let result = match auto_accept {
            Some(action) => self.handle.accept_offer(key, action).await,
            None => self.handle.decline_offer(key).await,
        };
        if let Err(e) = result {
            error!("Failed to answer offer {}: {}", key, e);
        }
    }

    /// `play` receives have no presentation layer here, so the bytes are
    /// written next to the other downloads.
    async fn on_playback(&self, key: &TransferKey, data: &[u8]) {
        let chooser = DownloadDirChooser::new(self.settings.transfer.download_dir.clone());
        match write_playback(&chooser, &key.name, data).await {
            Ok(path) => info!("Wrote playback buffer for {} to {:?}", key, path),
            Err(e) => warn!("Could not write playback buffer for {}: {}", key, e),
        }
    }

    /// Offers `path` to `peer` and waits for the transfer to finish.
    pub async fn send_file(mut self, peer: PeerAddress, path: &Path) -> Result<()> {
        info!("Sending {:?} to {}", path, peer);
        let key = self.handle.offer_file(peer, path).await?;

        while let Some(event) = self.events.recv().await {
            if event.key() != &key {
                continue;
            }
            match event {
                SessionEvent::Accepted { action, .. } => {
                    info!("{} accepted ({:?})", key.peer, action);
                }
                SessionEvent::Progress {
                    bytes_transferred,
                    bytes_total,
                    ..
                } => {
                    debug!(
                        "{} / {}",
                        format_file_size(bytes_transferred),
                        format_file_size(bytes_total)
                    );
                }
                SessionEvent::Completed { .. } => {
                    show_transfer_notification(format!("Sent {} to {}", key.name, key.peer)).await;
                    return Ok(());
                }
                SessionEvent::Canceled { .. } => {
                    return Err(DccError::Transport(format!("{} canceled the transfer", key.peer)));
                }
                SessionEvent::Failed { error, .. } => {
                    return Err(DccError::Transport(error));
                }
                _ => {}
            }
        }

        Err(DccError::SessionClosed)
    }
}

/// Writes a `play` buffer to a fresh path from `chooser`; existing files
/// are never overwritten.
async fn write_playback(chooser: &dyn SaveLocationChooser, name: &str, data: &[u8]) -> Result<PathBuf> {
    let path = chooser
        .choose(name)
        .await
        .ok_or_else(|| DccError::SaveTargetUnavailable(format!("no location for '{}'", name)))?;
    tokio::fs::write(&path, data)
        .await
        .map_err(|e| DccError::FileOperation(format!("Failed to write {:?}: {}", path, e)))?;
    Ok(path)
}

async fn show_transfer_notification(body: String) {
    info!("✅ {}", body);

    let shown = tokio::task::spawn_blocking(move || {
        notify_rust::Notification::new()
            .summary("File Transfer Complete")
            .body(&body)
            .timeout(notify_rust::Timeout::Milliseconds(5000))
            .show()
            .map(|_| ())
    })
    .await;

    match shown {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Notification error: {}", e),
        Err(e) => debug!("Notification task failed: {}", e),
    }
}
