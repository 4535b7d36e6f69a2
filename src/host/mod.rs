//! Host services - the callback surface the tracker runtime calls into
//!
//! Design: one `HostServices` object per bridge, registered with the tracker
//! runtime's coordinator. It is stateless apart from the published runtime
//! implementation handle; every request is forwarded to `RuntimeImports`.
//! Reference counting is not tracked: the owner keeps it alive for as long as
//! the coordinator may call it.

use crate::abi::{
    write_interface, ComPtr, Guid, HResult, IReferenceTrackerHost, IReferenceTrackerHostVtbl,
    IReferenceTrackerTarget, IUnknown, IUnknownVtbl, Interface,
};
use crate::error::{TrackerError, TrackerResult};
use crate::logging::{debug, trace, warn};
use crate::runtime::{
    CreateComInterfaceFlags, CreateObjectFlags, DisconnectFlags, GcRequest, ObjectHandle,
    RuntimeImports,
};
use core::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;


static HOST_SERVICES_VTBL: IReferenceTrackerHostVtbl = IReferenceTrackerHostVtbl {
    base: IUnknownVtbl {
        query_interface: raw::query_interface,
        add_ref: raw::add_ref,
        release: raw::release,
    },
    disconnect_unused_reference_sources: raw::disconnect_unused_reference_sources,
    release_disconnected_reference_sources: raw::release_disconnected_reference_sources,
    notify_end_of_reference_tracking_on_thread: raw::notify_end_of_reference_tracking_on_thread,
    get_tracker_target: raw::get_tracker_target,
    add_memory_pressure: raw::add_memory_pressure,
    remove_memory_pressure: raw::remove_memory_pressure,
};

/// Capabilities answered by `QueryInterface` on the host object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostCapability {
    Unknown,
    TrackerHost,
}

impl HostCapability {
    fn from_iid(iid: &Guid) -> Option<Self> {
        if *iid == IReferenceTrackerHost::IID {
            Some(Self::TrackerHost)
        } else if *iid == IUnknown::IID {
            Some(Self::Unknown)
        } else {
            None
        }
    }
}

/// Managed-side implementation of `IReferenceTrackerHost`
#[repr(C)]
pub struct HostServices {
    vtbl: *const IReferenceTrackerHostVtbl,
    runtime_impl: AtomicPtr<c_void>,
    runtime: Arc<dyn RuntimeImports>,
}

// Safety: the vtable is an immutable static; all other state is atomic or Sync
unsafe impl Send for HostServices {}
unsafe impl Sync for HostServices {}

impl HostServices {
    pub fn new(runtime: Arc<dyn RuntimeImports>) -> Self {
        Self {
            vtbl: &HOST_SERVICES_VTBL,
            runtime_impl: AtomicPtr::new(core::ptr::null_mut()),
            runtime,
        }
    }

    /// The object viewed through its interface
    #[inline]
    pub fn as_interface(&self) -> &IReferenceTrackerHost {
        // Safety: `#[repr(C)]` with the vtable pointer as the first field
        unsafe { &*(self as *const Self as *const IReferenceTrackerHost) }
    }

    /// Publish `candidate` iff the current handle equals `current`
    ///
    /// Single compare-exchange; callers decide whether to retry.
    pub fn try_set_runtime_impl(&self, candidate: ObjectHandle, current: ObjectHandle) -> bool {
        let published = self
            .runtime_impl
            .compare_exchange(current.as_raw(), candidate.as_raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        debug!(
            target: "host",
            candidate = ?candidate,
            expected = ?current,
            published,
            "runtime implementation publish attempt"
        );

        published
    }

    /// Currently published runtime implementation, if any
    #[inline]
    pub fn runtime_impl(&self) -> Option<ObjectHandle> {
        let handle = ObjectHandle::from_raw(self.runtime_impl.load(Ordering::Acquire));
        (!handle.is_null()).then_some(handle)
    }

    fn query_capability(&self, iid: &Guid) -> Option<*mut c_void> {
        HostCapability::from_iid(iid).map(|capability| {
            trace!(target: "host", ?capability, "query interface");
            self as *const Self as *mut c_void
        })
    }

    /// Request a collection; a suspend-time disconnect gets a blocking one.
    pub fn disconnect_unused_reference_sources(&self, flags: DisconnectFlags) -> TrackerResult<()> {
        let request = if flags.contains(DisconnectFlags::SUSPEND) {
            GcRequest::Blocking
        } else {
            GcRequest::Default
        };

        debug!(target: "host", flags = flags.0, ?request, "disconnect unused reference sources");
        self.runtime.request_garbage_collection(request)
    }

    pub fn release_disconnected_reference_sources(&self) -> TrackerResult<()> {
        debug!(target: "host", "waiting for finalizer");
        self.runtime.wait_for_finalizer()
    }

    pub fn notify_end_of_reference_tracking_on_thread(&self) -> TrackerResult<()> {
        let runtime_impl = self.runtime_impl().ok_or(TrackerError::NotConfigured)?;
        self.runtime.release_external_objects_from_current_thread(runtime_impl)
    }

    /// Find or create the proxy that lets the tracker runtime reference `obj`
    pub fn get_tracker_target(&self, obj: &IUnknown) -> TrackerResult<ComPtr<IReferenceTrackerTarget>> {
        let runtime_impl = self.runtime_impl().ok_or(TrackerError::NotConfigured)?;

        let identity = obj.query::<IUnknown>()?;
        let target = self.runtime.get_or_create_tracker_target(
            runtime_impl,
            &identity,
            CreateObjectFlags::TRACKER_OBJECT,
            CreateComInterfaceFlags::TRACKER_SUPPORT,
        )?;

        trace!(target: "host", identity = ?identity.as_ptr(), proxy = ?target.as_ptr(), "tracker target resolved");
        target.query::<IReferenceTrackerTarget>()
    }

    pub fn add_memory_pressure(&self, bytes: u64) -> TrackerResult<()> {
        trace!(target: "host", bytes, "add memory pressure");
        self.runtime.add_memory_pressure(bytes)
    }

    pub fn remove_memory_pressure(&self, bytes: u64) -> TrackerResult<()> {
        trace!(target: "host", bytes, "remove memory pressure");
        self.runtime.remove_memory_pressure(bytes)
    }
}

/// `extern "system"` entry points installed in the vtable
mod raw {
    use super::*;
    use crate::abi::IReferenceTrackerTarget;

    #[inline(always)]
    unsafe fn host<'a>(this: *mut c_void) -> &'a HostServices {
        &*(this as *const HostServices)
    }

    pub(super) unsafe extern "system" fn query_interface(
        this: *mut c_void,
        iid: *const Guid,
        out: *mut *mut c_void,
    ) -> HResult {
        let resolved = iid.as_ref().and_then(|iid| host(this).query_capability(iid));
        write_interface(out, resolved)
    }

    // Lifetime is owned by the bridge, not by reference counts
    pub(super) unsafe extern "system" fn add_ref(_this: *mut c_void) -> u32 {
        1
    }

    pub(super) unsafe extern "system" fn release(_this: *mut c_void) -> u32 {
        1
    }

    pub(super) unsafe extern "system" fn disconnect_unused_reference_sources(
        this: *mut c_void,
        flags: u32,
    ) -> HResult {
        host(this).disconnect_unused_reference_sources(DisconnectFlags(flags)).into()
    }

    pub(super) unsafe extern "system" fn release_disconnected_reference_sources(this: *mut c_void) -> HResult {
        host(this).release_disconnected_reference_sources().into()
    }

    pub(super) unsafe extern "system" fn notify_end_of_reference_tracking_on_thread(
        this: *mut c_void,
    ) -> HResult {
        host(this).notify_end_of_reference_tracking_on_thread().into()
    }

    pub(super) unsafe extern "system" fn get_tracker_target(
        this: *mut c_void,
        obj: *mut IUnknown,
        out: *mut *mut IReferenceTrackerTarget,
    ) -> HResult {
        if obj.is_null() || out.is_null() {
            warn!(target: "host", "get_tracker_target called with null argument");
            return HResult::E_INVALIDARG;
        }

        match host(this).get_tracker_target(&*obj) {
            Ok(target) => {
                *out = target.into_raw();
                HResult::S_OK
            }
            Err(err) => {
                *out = core::ptr::null_mut();
                err.into()
            }
        }
    }

    pub(super) unsafe extern "system" fn add_memory_pressure(this: *mut c_void, bytes: u64) -> HResult {
        host(this).add_memory_pressure(bytes).into()
    }

    pub(super) unsafe extern "system" fn remove_memory_pressure(this: *mut c_void, bytes: u64) -> HResult {
        host(this).remove_memory_pressure(bytes).into()
    }
}
