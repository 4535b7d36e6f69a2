//! Runtime imports - primitives the collector side provides to the bridge
//!
//! Two seams:
//! 1. `RuntimeImports` - process-wide services (GC requests, finalizer wait,
//!    wrapper lookup/creation, memory accounting)
//! 2. `CollectionPass` - one collection pause: enumerates external object
//!    contexts and accumulates discovered edges

use crate::abi::{ComPtr, IReferenceTracker, IReferenceTrackerTarget, IUnknown};
use crate::error::TrackerResult;
use core::ffi::c_void;
use core::ptr::NonNull;

/// Opaque managed-side handle (GC handle, wrapper context, runtime implementation)
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(*mut c_void);

impl ObjectHandle {
    pub const NULL: Self = Self(core::ptr::null_mut());

    #[inline]
    pub const fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    /// Handle from an integer token (tests, diagnostics)
    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr as *mut c_void)
    }

    #[inline]
    pub const fn as_raw(self) -> *mut c_void {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Default for ObjectHandle {
    fn default() -> Self {
        Self::NULL
    }
}

// Safety: the handle is an opaque token; it is never dereferenced by this crate
unsafe impl Send for ObjectHandle {}
unsafe impl Sync for ObjectHandle {}

/// Kind of collection requested on behalf of the tracker runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRequest {
    /// Best-effort collection
    Default,
    /// Expensive blocking collection
    Blocking,
}

/// `XAML_REFERENCETRACKER_DISCONNECT` flags passed to `DisconnectUnusedReferenceSources`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectFlags(pub u32);

impl DisconnectFlags {
    /// Disconnect happens during a suspend; a blocking collection is acceptable
    pub const SUSPEND: Self = Self(0x0000_0001);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Flags describing how an external object is wrapped on the managed side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateObjectFlags(pub i32);

impl CreateObjectFlags {
    pub const NONE: Self = Self(0);
    pub const TRACKER_OBJECT: Self = Self(1);
}

/// Flags describing which interfaces a managed object wrapper exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateComInterfaceFlags(pub i32);

impl CreateComInterfaceFlags {
    pub const NONE: Self = Self(0);
    pub const TRACKER_SUPPORT: Self = Self(4);
}

/// Services the managed runtime exposes to the bridge
///
/// Every method may be called from arbitrary native threads.
pub trait RuntimeImports: Send + Sync {
    /// Schedule (or run) a collection
    fn request_garbage_collection(&self, request: GcRequest) -> TrackerResult<()>;

    /// Block until pending finalization has drained
    fn wait_for_finalizer(&self) -> TrackerResult<()>;

    /// Release external objects registered against the calling thread
    fn release_external_objects_from_current_thread(&self, runtime_impl: ObjectHandle) -> TrackerResult<()>;

    /// Find or create the managed object wrapper for an external identity
    fn get_or_create_tracker_target(
        &self,
        runtime_impl: ObjectHandle,
        identity: &IUnknown,
        object_flags: CreateObjectFlags,
        interface_flags: CreateComInterfaceFlags,
    ) -> TrackerResult<ComPtr<IUnknown>>;

    fn add_memory_pressure(&self, bytes: u64) -> TrackerResult<()>;

    fn remove_memory_pressure(&self, bytes: u64) -> TrackerResult<()>;

    /// Map a target reported by the tracker runtime back to the managed object it
    /// wraps. `None` when the target was not produced by this runtime.
    fn map_tracker_target(&self, target: &IReferenceTrackerTarget) -> Option<ObjectHandle>;
}

/// One collection pause as seen by the reference walk
pub trait CollectionPass {
    /// Next external object context, `None` once exhausted
    fn next_object(&mut self) -> TrackerResult<Option<ExternalObjectContext>>;

    /// Record that `source` keeps `target` alive through external references
    fn found_reference_path(&mut self, source: ObjectHandle, target: ObjectHandle) -> TrackerResult<()>;
}

/// Per-external-object record owned by the wrapper subsystem
///
/// The walk only reads it; it never acquires or releases the tracker.
#[derive(Debug, Clone, Copy)]
pub struct ExternalObjectContext {
    runtime_context: ObjectHandle,
    tracker: Option<NonNull<IReferenceTracker>>,
}

impl ExternalObjectContext {
    /// # Safety
    /// `tracker` must be null or stay valid for as long as this context is
    /// reachable from the collection pass that yields it.
    #[inline]
    pub unsafe fn new(runtime_context: ObjectHandle, tracker: *mut IReferenceTracker) -> Self {
        Self {
            runtime_context,
            tracker: NonNull::new(tracker),
        }
    }

    /// Context for an external object without tracking capability
    #[inline]
    pub fn untracked(runtime_context: ObjectHandle) -> Self {
        Self {
            runtime_context,
            tracker: None,
        }
    }

    /// Managed handle the context was created for; the source of reported edges
    #[inline]
    pub fn runtime_context(&self) -> ObjectHandle {
        self.runtime_context
    }

    #[inline]
    pub fn reference_tracker(&self) -> Option<&IReferenceTracker> {
        self.tracker.map(|tracker| unsafe { &*tracker.as_ptr() })
    }
}
