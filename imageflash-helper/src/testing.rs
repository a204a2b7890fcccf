// SPDX-License-Identifier: GPL-3.0-only

//! A helper wired to the recording arbitration backend, for tests

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use imageflash_sys::Tools;
use imageflash_types::Permission;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::arbitration::fake::{Call, FakeArbitration};
use crate::auth::AuthorizationGate;
use crate::auth::testing::StaticAuthority;
use crate::claim::ClaimCoordinator;
use crate::service::{HelperHandle, HelperService};
use crate::writer::FlashEnvironment;

pub struct TestHelper {
    pub fake: Arc<FakeArbitration>,
    pub handle: HelperHandle,
    pub shutdown: CancellationToken,
    pub scratch: tempfile::TempDir,
}

impl TestHelper {
    /// Start a request loop whose callers hold `granted`.
    pub fn start(granted: &[Permission]) -> Self {
        let scratch = tempfile::tempdir().expect("scratch dir");
        let devices = scratch.path().join("dev");
        std::fs::create_dir_all(&devices).expect("device dir");
        // Tests write to disk4.
        std::fs::File::create(devices.join("rdisk4")).expect("raw node");

        let fake = FakeArbitration::new();
        let claims = Arc::new(ClaimCoordinator::new(
            fake.clone(),
            Handle::current(),
            Duration::from_secs(2),
        ));
        let tools =
            Tools::resolve(Path::new("/bin/false"), Path::new("/bin/false")).expect("tools");
        let env = FlashEnvironment::new(claims, tools, scratch.path().join("uefi-ntfs.img"))
            .with_device_dir(&devices);
        let gate = AuthorizationGate::new(
            StaticAuthority::granting(granted),
            "org.imageflash.helper",
        );

        let shutdown = CancellationToken::new();
        let (service, handle) = HelperService::new(Arc::new(env), gate, shutdown.clone());
        tokio::spawn(service.run());

        Self {
            fake,
            handle,
            shutdown,
            scratch,
        }
    }

    /// Small image as a `file://` URL.
    pub fn image(&self, len: usize) -> String {
        let path = self.scratch.path().join("ubuntu.img");
        std::fs::write(&path, vec![9u8; len]).expect("write image");
        format!("file://{}", path.display())
    }

    /// Sparse image written to a raw node that discards everything, so
    /// the copy runs long enough to be interrupted.
    pub fn endless_write(&self, device: &str) -> PathBuf {
        let path = self.scratch.path().join("huge.img");
        std::fs::File::create(&path)
            .and_then(|f| f.set_len(16 * 1024 * 1024 * 1024))
            .expect("sparse image");
        let raw_node = self.scratch.path().join(format!("dev/r{device}"));
        let _ = std::fs::remove_file(&raw_node);
        std::os::unix::fs::symlink("/dev/null", &raw_node).expect("raw node");
        path
    }

    /// Wait until `device` has been unclaimed, up to five seconds.
    pub async fn wait_for_release(&self, device: &str) {
        let call = Call::Unclaim(device.to_string());
        for _ in 0..500 {
            if self.fake.count(&call) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
