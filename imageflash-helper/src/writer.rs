// SPDX-License-Identifier: GPL-3.0-only

//! Flashing jobs
//!
//! [`FlashOrchestrator`] owns the single job slot. Each accepted job runs on
//! its own thread and reports back through [`WorkerEvent`]s; the service loop
//! feeds those back into the orchestrator and on to the subscriber.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use imageflash_sys::{
    CopyObserver, SysError, Tools, copy_bytes, copy_tree, detect_windows_image,
    flash_boot_image, load_boot_image, source_size,
};
use imageflash_types::{
    DEVICE_DIR, DeviceId, FlashMode, FlashRequest, HelperErrorKind, HelperEvent, INDETERMINATE,
    JobId, bytes_to_pretty,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, error, info, info_span, warn};

use crate::claim::{ClaimCoordinator, DeviceClaim};

/// Outcome of a job as reported to the subscriber
pub type JobResult = std::result::Result<(), HelperErrorKind>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Claiming,
    Unmounting,
    Writing,
    Finalizing,
}

pub struct RunningJob {
    pub id: JobId,
    pub request: FlashRequest,
    pub phase: Phase,
    cancel: CancellationToken,
}

pub enum JobState {
    Idle,
    Running(RunningJob),
}

/// Messages from a job thread to the service loop
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Phase { job: JobId, phase: Phase },
    Report(HelperEvent),
    Exited { job: JobId, result: JobResult },
}

/// Everything a job needs besides its request
pub struct FlashEnvironment {
    pub claims: Arc<ClaimCoordinator>,
    pub tools: Tools,
    /// UEFI bootloader payload for Windows installer media
    pub boot_image: PathBuf,
    device_dir: PathBuf,
}

impl FlashEnvironment {
    pub fn new(claims: Arc<ClaimCoordinator>, tools: Tools, boot_image: PathBuf) -> Self {
        Self {
            claims,
            tools,
            boot_image,
            device_dir: PathBuf::from(DEVICE_DIR),
        }
    }

    #[cfg(test)]
    pub fn with_device_dir(mut self, device_dir: impl Into<PathBuf>) -> Self {
        self.device_dir = device_dir.into();
        self
    }

    fn raw_node(&self, device: &DeviceId) -> PathBuf {
        device.raw_node_in(&self.device_dir)
    }
}

pub struct FlashOrchestrator {
    env: Arc<FlashEnvironment>,
    events: UnboundedSender<WorkerEvent>,
    state: JobState,
}

impl FlashOrchestrator {
    pub fn new(env: Arc<FlashEnvironment>, events: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            env,
            events,
            state: JobState::Idle,
        }
    }

    pub fn env(&self) -> &Arc<FlashEnvironment> {
        &self.env
    }

    pub fn is_flashing(&self) -> bool {
        matches!(self.state, JobState::Running(_))
    }

    pub fn active_target(&self) -> Option<&DeviceId> {
        match &self.state {
            JobState::Running(job) => Some(&job.request.target),
            JobState::Idle => None,
        }
    }

    /// Start a job unless one is already running.
    pub fn start(&mut self, request: FlashRequest) -> bool {
        if let JobState::Running(job) = &self.state {
            warn!(
                "Rejecting {} -> {}: job {} is still writing {}",
                request.source.display(),
                request.target,
                job.id,
                job.request.target
            );
            return false;
        }

        let id = JobId::new();
        let cancel = CancellationToken::new();
        let worker = JobWorker {
            env: Arc::clone(&self.env),
            id,
            request: request.clone(),
            cancel: cancel.clone(),
            reporter: JobReporter {
                job: id,
                events: self.events.clone(),
                last_progress: 0.0,
            },
        };

        let spawned = std::thread::Builder::new()
            .name(format!("flash-{}", request.target))
            .spawn(move || worker.run());
        if let Err(e) = spawned {
            error!("Cannot start job thread: {e}");
            return false;
        }

        info!(
            "Accepted job {id}: {} -> {}",
            request.source.display(),
            request.target
        );
        self.state = JobState::Running(RunningJob {
            id,
            request,
            phase: Phase::Claiming,
            cancel,
        });
        true
    }

    /// Signal the running job to stop; it keeps the slot until it exits.
    pub fn cancel(&self) -> bool {
        match &self.state {
            JobState::Running(job) => {
                info!("Cancelling job {} in phase {:?}", job.id, job.phase);
                job.cancel.cancel();
                true
            }
            JobState::Idle => {
                debug!("Cancel requested with no job running");
                false
            }
        }
    }

    pub fn set_phase(&mut self, job: JobId, phase: Phase) {
        if let JobState::Running(running) = &mut self.state
            && running.id == job
        {
            running.phase = phase;
        }
    }

    /// Free the slot once `job`'s thread has exited.
    pub fn finish(&mut self, job: JobId) -> bool {
        match &self.state {
            JobState::Running(running) if running.id == job => {
                self.state = JobState::Idle;
                true
            }
            _ => {
                warn!("Exit of unknown job {job}");
                false
            }
        }
    }
}

/// Sends a job's status and progress to the service loop
///
/// Progress is kept monotonic and at most 100; indeterminate values pass
/// through untouched.
struct JobReporter {
    job: JobId,
    events: UnboundedSender<WorkerEvent>,
    last_progress: f64,
}

impl JobReporter {
    fn send(&self, event: WorkerEvent) {
        // Only fails while the helper shuts down.
        let _ = self.events.send(event);
    }

    fn phase(&self, phase: Phase) {
        debug!("Entering {phase:?}");
        self.send(WorkerEvent::Phase {
            job: self.job,
            phase,
        });
    }

    fn exited(&self, result: JobResult) {
        self.send(WorkerEvent::Exited {
            job: self.job,
            result,
        });
    }
}

impl CopyObserver for JobReporter {
    fn status(&mut self, text: &str) {
        self.send(WorkerEvent::Report(HelperEvent::StatusChanged(
            text.to_string(),
        )));
    }

    fn progress(&mut self, percentage: f64) {
        let percentage = if percentage.is_nan() {
            percentage
        } else {
            self.last_progress = percentage.max(self.last_progress).min(100.0);
            self.last_progress
        };
        self.send(WorkerEvent::Report(HelperEvent::ProgressChanged(percentage)));
    }
}

/// Unmounts an attached image on every exit path
struct AttachedImage<'a> {
    tools: &'a Tools,
    mount_point: PathBuf,
    attached: bool,
}

impl AttachedImage<'_> {
    fn detach(mut self) {
        self.attached = false;
        if let Err(e) = self.tools.detach_image(&self.mount_point) {
            warn!("{e}");
        }
    }
}

impl Drop for AttachedImage<'_> {
    fn drop(&mut self) {
        if self.attached {
            self.attached = false;
            if let Err(e) = self.tools.detach_image(&self.mount_point) {
                warn!("{e}");
            }
        }
    }
}

fn job_span(id: &JobId, target: &DeviceId) -> Span {
    info_span!("job", job = %id, device = %target)
}

struct JobWorker {
    env: Arc<FlashEnvironment>,
    id: JobId,
    request: FlashRequest,
    cancel: CancellationToken,
    reporter: JobReporter,
}

fn failure_kind(e: SysError) -> HelperErrorKind {
    if !matches!(e, SysError::Cancelled) {
        warn!("{e}");
    }
    e.kind()
}

impl JobWorker {
    fn run(mut self) {
        let span = job_span(&self.id, &self.request.target);
        let _entered = span.enter();

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.execute()))
            .unwrap_or_else(|_| {
                error!("Job thread panicked");
                Err(HelperErrorKind::Unknown)
            });

        match result {
            Ok(()) => info!("Finished writing {}", self.request.target),
            Err(HelperErrorKind::Cancelled) => info!("Job cancelled"),
            Err(kind) => warn!("Job failed: {kind}"),
        }
        self.reporter.exited(result);
    }

    fn check_cancelled(&self) -> JobResult {
        if self.cancel.is_cancelled() {
            return Err(HelperErrorKind::Cancelled);
        }
        Ok(())
    }

    fn execute(&mut self) -> JobResult {
        self.reporter.progress(INDETERMINATE);
        self.reporter.status("Claiming disk...");
        self.reporter.phase(Phase::Claiming);

        self.precheck()?;
        self.check_cancelled()?;

        let env = Arc::clone(&self.env);
        let mut claim = env
            .claims
            .claim(&self.request.target)
            .ok_or(HelperErrorKind::ClaimError)?;

        let outcome = match self.request.mode.clone() {
            FlashMode::Direct => self.flash_direct(&mut claim),
            FlashMode::WindowsInstaller { label } => self.flash_windows(&label),
        };

        claim.release();
        outcome
    }

    /// Checks that need no claim: readable source, not the boot disk, fits the media.
    fn precheck(&self) -> JobResult {
        let source = &self.request.source;
        let target = &self.request.target;

        if let Err(e) = std::fs::File::open(source) {
            warn!("Cannot read {}: {e}", source.display());
            return Err(HelperErrorKind::ReadError);
        }

        if self.env.claims.walker().is_protected_root(target) {
            error!("Refusing to write {target}: it holds the running system");
            return Err(HelperErrorKind::ClaimError);
        }

        if let (Some(image_size), Some(media_size)) =
            (source_size(source), self.env.claims.media_size(target))
            && image_size > media_size
        {
            warn!(
                "Image is {} but {target} holds only {}",
                bytes_to_pretty(&image_size, true),
                bytes_to_pretty(&media_size, true)
            );
            return Err(HelperErrorKind::OutOfSpace);
        }

        if self.request.mode == FlashMode::Direct
            && matches!(detect_windows_image(source), Ok(true))
        {
            info!("Image looks like Windows installation media; a raw copy may not boot on UEFI");
        }

        Ok(())
    }

    fn flash_direct(&mut self, claim: &mut DeviceClaim) -> JobResult {
        let target = self.request.target.clone();

        self.reporter.phase(Phase::Unmounting);
        self.reporter.status("Unmounting disk...");
        if !claim.prevent_mount() {
            return Err(HelperErrorKind::ClaimError);
        }
        if !self.env.claims.unmount(&target) {
            return Err(HelperErrorKind::ClaimError);
        }
        self.check_cancelled()?;

        self.reporter.phase(Phase::Writing);
        let raw_node = self.env.raw_node(&target);
        copy_bytes(&self.request.source, &raw_node, &self.cancel, &mut self.reporter)
            .map_err(failure_kind)?;
        self.check_cancelled()?;

        self.reporter.phase(Phase::Finalizing);
        self.reporter.progress(INDETERMINATE);
        self.reporter.status("Remounting disk...");
        claim.allow_mount();
        self.env.claims.remount(&target);
        Ok(())
    }

    fn flash_windows(&mut self, label: &str) -> JobResult {
        let env = Arc::clone(&self.env);
        let target = self.request.target.clone();

        self.reporter.phase(Phase::Unmounting);
        self.reporter.status("Unmounting disk...");
        if !env.claims.unmount(&target) {
            return Err(HelperErrorKind::ClaimError);
        }
        self.check_cancelled()?;

        self.reporter.phase(Phase::Writing);
        self.reporter.status("Partitioning disk...");
        env.tools.partition_device(&target, label).map_err(failure_kind)?;

        let data_slice = target.slice(2);
        let Some(volume) = env.claims.volume_path(&data_slice) else {
            warn!("Data partition {data_slice} did not mount");
            return Err(HelperErrorKind::ClaimError);
        };
        self.check_cancelled()?;

        self.reporter.status("Mounting image...");
        let image = AttachedImage {
            tools: &env.tools,
            mount_point: env
                .tools
                .attach_image(&self.request.source)
                .map_err(failure_kind)?,
            attached: true,
        };
        let image_size = source_size(&self.request.source).ok_or(HelperErrorKind::ReadError)?;
        self.check_cancelled()?;

        self.reporter.status("Copying files...");
        copy_tree(
            &image.mount_point,
            &volume,
            image_size,
            &self.cancel,
            &mut self.reporter,
        )
        .map_err(failure_kind)?;

        self.reporter.phase(Phase::Finalizing);
        self.reporter.status("Unmounting image...");
        self.reporter.progress(INDETERMINATE);
        image.detach();
        self.check_cancelled()?;

        self.reporter.status("Flashing bootloader...");
        let payload = load_boot_image(&env.boot_image).map_err(failure_kind)?;
        let boot_node = env.raw_node(&target.slice(1));
        flash_boot_image(&payload, &boot_node, &self.cancel).map_err(failure_kind)?;
        Ok(())
    }
}
