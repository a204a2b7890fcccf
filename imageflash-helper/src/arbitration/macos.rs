// SPDX-License-Identifier: GPL-3.0-only

//! DiskArbitration and IOKit backend
//!
//! One arbitration session is scheduled on a dedicated run loop thread.
//! Requests are issued from any thread and complete through a oneshot
//! channel whose sender travels through the callback context pointer.

use std::ffi::{CStr, CString, c_char, c_void};
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use imageflash_types::{DeviceId, DeviceNode};
use objc2_core_foundation::{
    CFBoolean, CFDictionary, CFMutableDictionary, CFNumber, CFRetained, CFRunLoop, CFString,
    CFURL, kCFRunLoopDefaultMode,
};
use objc2_disk_arbitration::{
    DADisk, DADissenter, DARegisterDiskMountApprovalCallback, DASession,
    kDADiskDescriptionMediaSizeKey, kDADiskDescriptionVolumePathKey, kDADiskMountOptionWhole,
    kDADiskOptionDefault, kDADiskUnmountOptionForce, kDADiskUnmountOptionWhole,
};
use objc2_io_kit::{
    IOBSDNameMatching, IOIteratorNext, IOObjectConformsTo, IOObjectRelease,
    IORegistryEntryCreateCFProperties, IORegistryEntryGetChildIterator,
    IORegistryEntryGetParentEntry, IOServiceGetMatchingService, io_object_t, kIOMainPortDefault,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{ArbitrationError, DiskArbitration, MountApproval, Result};

/// `kDAReturnNotPermitted`
const DA_RETURN_NOT_PERMITTED: i32 = 0xF8DA_000D_u32 as i32;

const SERVICE_PLANE: &CStr = c"IOService";
const MEDIA_CLASS: &CStr = c"IOMedia";
const MAX_REGISTRY_DEPTH: usize = 32;

type Completion = oneshot::Sender<std::result::Result<(), i32>>;
type PolicySlot = RwLock<Option<Arc<dyn MountApproval>>>;

struct Session(CFRetained<DASession>);

// SAFETY: a scheduled DASession accepts requests from any thread; its
// callbacks only run on the session's run loop thread.
unsafe impl Send for Session {}
unsafe impl Sync for Session {}

pub struct MacDiskArbitration {
    session: Arc<Session>,
    policy: Arc<PolicySlot>,
}

impl MacDiskArbitration {
    /// Create the session and start its run loop thread.
    pub fn start() -> Result<Self> {
        let session = unsafe { DASession::new(None) }
            .ok_or_else(|| ArbitrationError::Session("DASessionCreate failed".to_string()))?;
        let session = Arc::new(Session(session));
        let policy: Arc<PolicySlot> = Arc::new(RwLock::new(None));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread_session = Arc::clone(&session);
        let thread_policy = Arc::clone(&policy);
        std::thread::Builder::new()
            .name("disk-arbitration".to_string())
            .spawn(move || run_session(thread_session, thread_policy, ready_tx))
            .map_err(|e| ArbitrationError::Session(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| ArbitrationError::Session("run loop thread exited".to_string()))??;
        info!("Disk arbitration session started");

        Ok(Self { session, policy })
    }

    fn disk(&self, device: &DeviceId) -> Result<CFRetained<DADisk>> {
        let not_found = || ArbitrationError::DeviceNotFound(device.to_string());
        let name = CString::new(device.as_str()).map_err(|_| not_found())?;
        let name = NonNull::new(name.as_ptr().cast_mut()).ok_or_else(not_found)?;
        unsafe { DADisk::from_bsd_name(None, &self.session.0, name) }.ok_or_else(not_found)
    }

    /// Issue a request and return the channel its completion arrives on.
    fn submit(
        &self,
        device: &DeviceId,
        issue: impl FnOnce(&DADisk, *mut c_void),
    ) -> Result<oneshot::Receiver<std::result::Result<(), i32>>> {
        let disk = self.disk(device)?;
        let (tx, rx) = oneshot::channel();
        let context: *mut Completion = Box::into_raw(Box::new(tx));
        issue(&disk, context.cast());
        Ok(rx)
    }

    async fn complete(
        operation: &'static str,
        device: &DeviceId,
        completion: oneshot::Receiver<std::result::Result<(), i32>>,
    ) -> Result<()> {
        match completion.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(status)) => Err(ArbitrationError::Dissented {
                operation,
                device: device.to_string(),
                reason: format!("status {status:#x}"),
            }),
            Err(_) => Err(ArbitrationError::Session(format!(
                "{operation} of {device} was never answered"
            ))),
        }
    }

    fn description(&self, device: &DeviceId) -> Result<CFRetained<CFDictionary>> {
        let disk = self.disk(device)?;
        unsafe { disk.description() }
            .ok_or_else(|| ArbitrationError::DeviceNotFound(device.to_string()))
    }
}

fn run_session(session: Arc<Session>, policy: Arc<PolicySlot>, ready: std::sync::mpsc::Sender<Result<()>>) {
    let Some(run_loop) = CFRunLoop::current() else {
        let _ = ready.send(Err(ArbitrationError::Session(
            "no run loop for arbitration thread".to_string(),
        )));
        return;
    };
    let Some(mode) = (unsafe { kCFRunLoopDefaultMode }) else {
        let _ = ready.send(Err(ArbitrationError::Session(
            "default run loop mode unavailable".to_string(),
        )));
        return;
    };

    unsafe {
        session.0.schedule_with_run_loop(&run_loop, mode);
        // The slot lives as long as the process; the approval callback reads
        // whatever policy is installed at the time of each mount.
        DARegisterDiskMountApprovalCallback(
            &session.0,
            None,
            Some(approve_mount),
            Arc::into_raw(policy).cast_mut().cast(),
        );
    }
    let _ = ready.send(Ok(()));

    loop {
        CFRunLoop::run_in_mode(Some(mode), 3600.0, false);
    }
}

unsafe extern "C-unwind" fn request_completed(
    _disk: NonNull<DADisk>,
    dissenter: *const DADissenter,
    context: *mut c_void,
) {
    let completion = unsafe { Box::from_raw(context.cast::<Completion>()) };
    let outcome = if dissenter.is_null() {
        Ok(())
    } else {
        Err(unsafe { (*dissenter).status() })
    };
    // The requester may have given up after its timeout.
    let _ = completion.send(outcome);
}

unsafe extern "C-unwind" fn approve_mount(
    disk: NonNull<DADisk>,
    context: *mut c_void,
) -> *const DADissenter {
    let slot = unsafe { &*(context as *const PolicySlot) };
    let policy = slot
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    let Some(policy) = policy else {
        return ptr::null();
    };

    let Some(name) = bsd_name(unsafe { disk.as_ref() }) else {
        return ptr::null();
    };
    let lineage = media_lineage(&name);

    match policy.review(&lineage) {
        None => ptr::null(),
        Some(reason) => {
            info!("Refusing mount of {name}: {reason}");
            let reason = CFString::from_str(&reason);
            let dissenter =
                unsafe { DADissenter::new(None, DA_RETURN_NOT_PERMITTED, Some(&reason)) };
            CFRetained::into_raw(dissenter).as_ptr()
        }
    }
}

fn bsd_name(disk: &DADisk) -> Option<String> {
    let name: *const c_char = unsafe { disk.bsd_name() };
    if name.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(name) }.to_str().ok().map(str::to_string)
}

/// Owned IOKit object reference
struct IoObject(io_object_t);

impl Drop for IoObject {
    fn drop(&mut self) {
        if self.0 != 0 {
            unsafe { IOObjectRelease(self.0) };
        }
    }
}

fn media_service(name: &str) -> Option<IoObject> {
    let c_name = CString::new(name).ok()?;
    unsafe {
        let matching = IOBSDNameMatching(kIOMainPortDefault, 0, c_name.as_ptr())?;
        let service = IOServiceGetMatchingService(
            kIOMainPortDefault,
            Some(CFRetained::cast_unchecked(matching)),
        );
        (service != 0).then_some(IoObject(service))
    }
}

fn is_media(entry: io_object_t) -> bool {
    unsafe { IOObjectConformsTo(entry, MEDIA_CLASS.as_ptr()) != 0 }
}

fn parent_of(entry: io_object_t) -> Option<IoObject> {
    let mut parent: io_object_t = 0;
    let kr = unsafe { IORegistryEntryGetParentEntry(entry, SERVICE_PLANE.as_ptr(), &mut parent) };
    (kr == 0 && parent != 0).then_some(IoObject(parent))
}

fn children_of(entry: io_object_t) -> Vec<IoObject> {
    let mut iterator: io_object_t = 0;
    let kr = unsafe {
        IORegistryEntryGetChildIterator(entry, SERVICE_PLANE.as_ptr(), &mut iterator)
    };
    if kr != 0 {
        return Vec::new();
    }
    let iterator = IoObject(iterator);

    let mut children = Vec::new();
    loop {
        let child = unsafe { IOIteratorNext(iterator.0) };
        if child == 0 {
            break;
        }
        children.push(IoObject(child));
    }
    children
}

/// `BSD Name` and `Whole` of an IOMedia entry
fn media_properties(entry: io_object_t) -> Option<(String, bool)> {
    let mut props: *mut CFMutableDictionary = ptr::null_mut();
    let kr = unsafe { IORegistryEntryCreateCFProperties(entry, &mut props, None, 0) };
    let props = NonNull::new(props).filter(|_| kr == 0)?;
    let props = unsafe { CFRetained::<CFMutableDictionary>::from_raw(props) };
    let dict: &CFDictionary = &props;

    let name = unsafe { dict_string(dict, &CFString::from_static_str("BSD Name")) }?;
    let whole = unsafe { dict_bool(dict, &CFString::from_static_str("Whole")) }.unwrap_or(false);
    Some((name, whole))
}

/// `name` followed by the BSD names of the media it sits on.
fn media_lineage(name: &str) -> Vec<String> {
    let mut lineage = vec![name.to_string()];
    let Some(mut current) = media_service(name) else {
        return lineage;
    };

    for _ in 0..MAX_REGISTRY_DEPTH {
        let Some(parent) = parent_of(current.0) else {
            break;
        };
        if is_media(parent.0)
            && let Some((parent_name, _)) = media_properties(parent.0)
        {
            lineage.push(parent_name);
        }
        current = parent;
    }
    lineage
}

fn registry_node(entry: io_object_t, depth: usize) -> DeviceNode {
    let children = if depth < MAX_REGISTRY_DEPTH {
        children_of(entry)
            .iter()
            .map(|child| registry_node(child.0, depth + 1))
            .collect()
    } else {
        Vec::new()
    };

    if is_media(entry)
        && let Some((name, whole)) = media_properties(entry)
        && let Ok(device) = DeviceId::parse(&name)
    {
        return DeviceNode::media(device, whole, children);
    }
    DeviceNode::passthrough(children)
}

unsafe fn dict_value<T>(dict: &CFDictionary, key: &CFString) -> Option<&T> {
    let raw = unsafe { dict.value((key as *const CFString).cast()) };
    if raw.is_null() {
        return None;
    }
    Some(unsafe { &*(raw as *const T) })
}

unsafe fn dict_string(dict: &CFDictionary, key: &CFString) -> Option<String> {
    unsafe { dict_value::<CFString>(dict, key) }.map(|s| s.to_string())
}

unsafe fn dict_bool(dict: &CFDictionary, key: &CFString) -> Option<bool> {
    unsafe { dict_value::<CFBoolean>(dict, key) }.map(|b| b.as_bool())
}

#[async_trait]
impl DiskArbitration for MacDiskArbitration {
    async fn claim(&self, device: &DeviceId) -> Result<()> {
        let completion = self.submit(device, |disk, context| unsafe {
            // No release callback: release requests from other processes are refused.
            disk.claim(
                kDADiskOptionDefault,
                None,
                ptr::null_mut(),
                Some(request_completed),
                context,
            )
        })?;
        Self::complete("claim", device, completion).await
    }

    fn unclaim(&self, device: &DeviceId) {
        match self.disk(device) {
            Ok(disk) => unsafe { disk.unclaim() },
            Err(e) => debug!("Nothing to unclaim: {e}"),
        }
    }

    async fn unmount(&self, device: &DeviceId) -> Result<()> {
        let completion = self.submit(device, |disk, context| unsafe {
            disk.unmount(
                kDADiskUnmountOptionForce | kDADiskUnmountOptionWhole,
                Some(request_completed),
                context,
            )
        })?;
        Self::complete("unmount", device, completion).await
    }

    async fn mount(&self, device: &DeviceId) -> Result<()> {
        let completion = self.submit(device, |disk, context| unsafe {
            disk.mount(None, kDADiskMountOptionWhole, Some(request_completed), context)
        })?;
        Self::complete("mount", device, completion).await
    }

    async fn eject(&self, device: &DeviceId) -> Result<()> {
        let completion = self.submit(device, |disk, context| unsafe {
            disk.eject(kDADiskOptionDefault, Some(request_completed), context)
        })?;
        Self::complete("eject", device, completion).await
    }

    fn device_tree(&self, device: &DeviceId) -> Result<DeviceNode> {
        let service = media_service(device.as_str())
            .ok_or_else(|| ArbitrationError::DeviceNotFound(device.to_string()))?;
        Ok(registry_node(service.0, 0))
    }

    fn lineage(&self, device: &DeviceId) -> Result<Vec<String>> {
        Ok(media_lineage(device.as_str()))
    }

    fn boot_device(&self) -> Result<DeviceId> {
        let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statfs(c"/".as_ptr(), &mut stat) } != 0 {
            return Err(ArbitrationError::Session(format!(
                "statfs(/) failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let source = unsafe { CStr::from_ptr(stat.f_mntfromname.as_ptr()) }.to_string_lossy();
        let name = source.strip_prefix("/dev/").unwrap_or(&source);
        DeviceId::parse(name).map_err(|e| ArbitrationError::DeviceNotFound(e.to_string()))
    }

    fn volume_path(&self, device: &DeviceId) -> Result<Option<PathBuf>> {
        let description = self.description(device)?;
        let url = unsafe { dict_value::<CFURL>(&description, kDADiskDescriptionVolumePathKey) };
        Ok(url.and_then(|url| url.to_file_path()))
    }

    fn media_size(&self, device: &DeviceId) -> Result<Option<u64>> {
        let description = self.description(device)?;
        let size = unsafe { dict_value::<CFNumber>(&description, kDADiskDescriptionMediaSizeKey) };
        Ok(size.and_then(|n| n.as_i64()).and_then(|n| u64::try_from(n).ok()))
    }

    fn register_mount_approval(&self, policy: Arc<dyn MountApproval>) -> Result<()> {
        let mut slot = self
            .policy
            .write()
            .map_err(|_| ArbitrationError::Session("mount policy lock poisoned".to_string()))?;
        if slot.is_some() {
            warn!("Replacing an installed mount policy");
        }
        *slot = Some(policy);
        Ok(())
    }

    fn unregister_mount_approval(&self) {
        let mut slot = self
            .policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }
}
