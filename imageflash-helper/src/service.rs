// SPDX-License-Identifier: GPL-3.0-only

//! The helper's request loop
//!
//! [`HelperService`] owns the job slot and the subscriber and processes one
//! message at a time. Connections talk to it through a [`HelperHandle`],
//! which authorizes and validates every call before it reaches the loop.

use std::sync::Arc;

use imageflash_types::{DeviceId, FlashRequest, HelperEvent, Permission, parse_source};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthorizationGate;
use crate::writer::{FlashEnvironment, FlashOrchestrator, WorkerEvent};

pub type ConnectionId = u64;

/// The caller that receives job events
pub struct Subscriber {
    pub connection: ConnectionId,
    pub events: mpsc::UnboundedSender<HelperEvent>,
}

enum Command {
    Write {
        request: FlashRequest,
        reply: oneshot::Sender<bool>,
    },
    Cancel,
    Subscribe {
        subscriber: Subscriber,
        reply: oneshot::Sender<bool>,
    },
    Disconnected(ConnectionId),
    Eject {
        device: DeviceId,
        reply: oneshot::Sender<bool>,
    },
}

pub struct HelperService {
    orchestrator: FlashOrchestrator,
    subscriber: Option<Subscriber>,
    commands: mpsc::UnboundedReceiver<Command>,
    worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    shutdown: CancellationToken,
}

impl HelperService {
    pub fn new(
        env: Arc<FlashEnvironment>,
        gate: AuthorizationGate,
        shutdown: CancellationToken,
    ) -> (Self, HelperHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();

        let service = Self {
            orchestrator: FlashOrchestrator::new(env, worker_tx),
            subscriber: None,
            commands: command_rx,
            worker_events: worker_rx,
            shutdown: shutdown.clone(),
        };
        let handle = HelperHandle {
            commands: command_tx,
            gate: Arc::new(gate),
            shutdown,
        };
        (service, handle)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(event) = self.worker_events.recv() => self.handle_worker_event(event),
            }
        }

        if self.orchestrator.cancel() {
            info!("Cancelled the running job on shutdown");
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Write { request, reply } => {
                let _ = reply.send(self.orchestrator.start(request));
            }
            Command::Cancel => {
                self.orchestrator.cancel();
            }
            Command::Subscribe { subscriber, reply } => {
                if let Some(previous) = &self.subscriber
                    && previous.connection != subscriber.connection
                {
                    info!(
                        "Connection {} replaces connection {} as subscriber",
                        subscriber.connection, previous.connection
                    );
                }
                self.subscriber = Some(subscriber);
                let _ = reply.send(self.orchestrator.is_flashing());
            }
            Command::Disconnected(connection) => {
                if self
                    .subscriber
                    .as_ref()
                    .is_some_and(|s| s.connection == connection)
                {
                    self.subscriber_lost("disconnected");
                }
            }
            Command::Eject { device, reply } => self.eject(device, reply),
        }
    }

    fn eject(&self, device: DeviceId, reply: oneshot::Sender<bool>) {
        if self.orchestrator.active_target() == Some(&device) {
            warn!("Refusing to eject {device} while writing to it");
            let _ = reply.send(false);
            return;
        }

        let claims = Arc::clone(&self.orchestrator.env().claims);
        tokio::task::spawn_blocking(move || {
            let ejected = if claims.walker().is_protected_root(&device) {
                warn!("Refusing to eject {device}: it holds the running system");
                false
            } else {
                claims.eject(&device)
            };
            if ejected {
                info!("Ejected {device}");
            }
            let _ = reply.send(ejected);
        });
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Phase { job, phase } => self.orchestrator.set_phase(job, phase),
            WorkerEvent::Report(event) => self.publish(event),
            WorkerEvent::Exited { job, result } => {
                // The slot is free before the caller hears about the outcome.
                self.orchestrator.finish(job);
                self.publish(match result {
                    Ok(()) => HelperEvent::Finished,
                    Err(kind) => HelperEvent::Failed(kind),
                });
            }
        }
    }

    fn publish(&mut self, event: HelperEvent) {
        let Some(subscriber) = &self.subscriber else {
            return;
        };
        if subscriber.events.send(event).is_err() {
            self.subscriber_lost("stopped receiving events");
        }
    }

    fn subscriber_lost(&mut self, why: &str) {
        if let Some(subscriber) = self.subscriber.take() {
            warn!("Subscriber on connection {} {why}", subscriber.connection);
        }
        if self.orchestrator.cancel() {
            info!("Cancelling the running job: nobody is listening");
        }
    }
}

/// Entry point for connections; cheap to clone
#[derive(Clone)]
pub struct HelperHandle {
    commands: mpsc::UnboundedSender<Command>,
    gate: Arc<AuthorizationGate>,
    shutdown: CancellationToken,
}

impl HelperHandle {
    fn send(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            debug!("Request loop has stopped");
            return false;
        }
        true
    }

    async fn request(&self, command: impl FnOnce(oneshot::Sender<bool>) -> Command) -> bool {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)) && response.await.unwrap_or(false)
    }

    /// Start a byte-for-byte copy of `source` onto `device`.
    pub async fn write_image(&self, source: &str, device: &str, credential: &[u8]) -> bool {
        if !self.gate.check(credential, Permission::Write).await {
            return false;
        }
        let Some((source, target)) = validate_target(source, device) else {
            return false;
        };
        let request = FlashRequest::direct(source, target);
        self.request(|reply| Command::Write { request, reply }).await
    }

    /// Start building Windows installer media from `source` onto `device`.
    pub async fn write_windows_image(
        &self,
        source: &str,
        device: &str,
        label: &str,
        credential: &[u8],
    ) -> bool {
        if !self.gate.check(credential, Permission::Write).await {
            return false;
        }
        let Some((source, target)) = validate_target(source, device) else {
            return false;
        };
        let request = FlashRequest::windows(source, target, label);
        self.request(|reply| Command::Write { request, reply }).await
    }

    pub async fn cancel_write(&self, credential: &[u8]) -> bool {
        if !self.gate.check(credential, Permission::Cancel).await {
            return false;
        }
        self.send(Command::Cancel)
    }

    /// Make `subscriber` the receiver of job events.
    ///
    /// `None` when the credential is refused, otherwise whether a job is running.
    pub async fn subscribe(&self, subscriber: Subscriber, credential: &[u8]) -> Option<bool> {
        if !self.gate.check(credential, Permission::Subscribe).await {
            return None;
        }
        Some(
            self.request(|reply| Command::Subscribe { subscriber, reply })
                .await,
        )
    }

    pub fn disconnected(&self, connection: ConnectionId) {
        self.send(Command::Disconnected(connection));
    }

    /// Unmount and eject `device` once the platform completes it.
    pub async fn eject(&self, device: &str, credential: &[u8]) -> bool {
        if !self.gate.check(credential, Permission::Eject).await {
            return false;
        }
        let device = match DeviceId::whole_disk(device) {
            Ok(device) => device,
            Err(e) => {
                warn!("Rejecting eject: {e}");
                return false;
            }
        };
        self.request(|reply| Command::Eject { device, reply }).await
    }

    /// Shut the helper down; `false` when the credential is refused.
    pub async fn stop(&self, credential: &[u8]) -> bool {
        if !self.gate.check(credential, Permission::Stop).await {
            return false;
        }
        info!("Stop requested");
        self.shutdown.cancel();
        true
    }
}

fn validate_target(source: &str, device: &str) -> Option<(std::path::PathBuf, DeviceId)> {
    let target = match DeviceId::whole_disk(device) {
        Ok(target) => target,
        Err(e) => {
            warn!("Rejecting write: {e}");
            return None;
        }
    };
    match parse_source(source) {
        Ok(source) => Some((source, target)),
        Err(e) => {
            warn!("Rejecting write: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::fake::Call;
    use crate::auth::testing::VALID;
    use crate::testing::TestHelper;
    use imageflash_types::HelperErrorKind;

    async fn subscribe(
        h: &TestHelper,
        connection: ConnectionId,
    ) -> (Option<bool>, mpsc::UnboundedReceiver<HelperEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let accepted = h
            .handle
            .subscribe(Subscriber { connection, events }, &VALID)
            .await;
        (accepted, rx)
    }

    async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<HelperEvent>) -> Vec<HelperEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    async fn until_writing(rx: &mut mpsc::UnboundedReceiver<HelperEvent>) {
        while let Some(event) = rx.recv().await {
            if event == HelperEvent::StatusChanged("Writing to disk...".into()) {
                return;
            }
        }
        panic!("subscriber channel closed before writing started");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscriber_sees_a_full_job() {
        let h = TestHelper::start(&Permission::ALL);
        let (accepted, mut rx) = subscribe(&h, 1).await;
        assert_eq!(accepted, Some(false));

        let image = h.image(2048);
        assert!(h.handle.write_image(&image, "disk4", &VALID).await);

        let events = until_terminal(&mut rx).await;
        assert!(matches!(events.first(), Some(HelperEvent::ProgressChanged(p)) if p.is_nan()));
        assert_eq!(
            events.get(1),
            Some(&HelperEvent::StatusChanged("Claiming disk...".into()))
        );
        assert_eq!(events.last(), Some(&HelperEvent::Finished));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        // The slot is free again by the time Finished arrives.
        assert!(h.handle.write_image(&image, "disk4", &VALID).await);
        until_terminal(&mut rx).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refused_credentials_change_nothing() {
        let h = TestHelper::start(&[Permission::Subscribe]);
        let image = h.image(2048);

        assert!(!h.handle.write_image(&image, "disk4", &VALID).await);
        assert!(!h.handle.write_image(&image, "disk4", &[1u8; 16]).await);
        assert!(!h.handle.cancel_write(&VALID).await);
        assert!(!h.handle.eject("disk4", &VALID).await);
        assert!(!h.handle.stop(&VALID).await);
        assert!(!h.shutdown.is_cancelled());

        let (accepted, _rx) = subscribe(&h, 1).await;
        assert_eq!(accepted, Some(false));
        assert!(h.fake.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribe_without_right_is_refused() {
        let h = TestHelper::start(&[Permission::Write]);
        let (accepted, _rx) = subscribe(&h, 1).await;
        assert_eq!(accepted, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_requests_are_rejected_before_claiming() {
        let h = TestHelper::start(&Permission::ALL);
        let image = h.image(2048);

        assert!(!h.handle.write_image(&image, "disk1s1", &VALID).await);
        assert!(!h.handle.write_image(&image, "/dev/disk1", &VALID).await);
        assert!(!h.handle.write_image("https://example.com/a.iso", "disk4", &VALID).await);
        assert!(!h.handle.write_image("relative.img", "disk4", &VALID).await);
        assert!(!h.handle.write_windows_image(&image, "disk", "WIN", &VALID).await);
        assert!(!h.handle.eject("disk4s1", &VALID).await);
        assert!(h.fake.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lost_subscriber_cancels_the_job() {
        let h = TestHelper::start(&Permission::ALL);
        let image = h.endless_write("disk4");

        let (_, mut rx) = subscribe(&h, 7).await;
        let image = image.to_str().expect("utf-8 path");
        assert!(h.handle.write_image(image, "disk4", &VALID).await);
        until_writing(&mut rx).await;

        h.handle.disconnected(7);
        h.wait_for_release("disk4").await;

        assert_eq!(h.fake.count(&Call::Unclaim("disk4".into())), 1);
        assert_eq!(h.fake.count(&Call::Mount("disk4".into())), 0);

        // The subscriber's channel is closed without a terminal event.
        let mut rest = Vec::new();
        while let Some(event) = rx.recv().await {
            rest.push(event);
        }
        assert!(!rest.iter().any(HelperEvent::is_terminal));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eject_refuses_the_disk_being_written() {
        let h = TestHelper::start(&Permission::ALL);
        let image = h.endless_write("disk4");

        let (_, mut rx) = subscribe(&h, 1).await;
        let image = image.to_str().expect("utf-8 path");
        assert!(h.handle.write_image(image, "disk4", &VALID).await);

        assert!(!h.handle.eject("disk4", &VALID).await);
        assert!(h.handle.eject("disk5", &VALID).await);
        assert_eq!(h.fake.count(&Call::Eject("disk5".into())), 1);

        assert!(h.handle.cancel_write(&VALID).await);
        let events = until_terminal(&mut rx).await;
        assert_eq!(
            events.last(),
            Some(&HelperEvent::Failed(HelperErrorKind::Cancelled))
        );
        assert_eq!(h.fake.count(&Call::Eject("disk4".into())), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eject_refuses_the_boot_disk() {
        let h = TestHelper::start(&Permission::ALL);
        assert!(!h.handle.eject("disk0", &VALID).await);
        assert!(h.fake.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_triggers_shutdown() {
        let h = TestHelper::start(&Permission::ALL);
        assert!(h.handle.stop(&VALID).await);
        assert!(h.shutdown.is_cancelled());
    }
}
