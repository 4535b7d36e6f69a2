//! Interface layouts and typed client wrappers
//!
//! Slot order and IIDs match `windows.ui.xaml.hosting.referencetracker.h`.
//! An interface struct is never constructed by value: a `&IFoo` always points
//! at a live object whose first field is the `IFoo` vtable pointer, so the
//! wrappers below are safe to call on any reference handed out by this crate.

use super::{ComPtr, Guid, HResult};
use crate::error::{TrackerError, TrackerResult};
use core::ffi::c_void;
use core::ptr;

/// A COM-style interface: an object whose first field points at `Self::Vtbl`
///
/// # Safety
/// Implementors must be `#[repr(C)]` with the vtable pointer as the only
/// field, and `Vtbl` must begin with `IUnknownVtbl`.
pub unsafe trait Interface: Sized {
    const IID: Guid;
    type Vtbl;

    /// Raw vtable pointer stored in the object header
    fn raw_vtbl(&self) -> *const Self::Vtbl;

    #[inline]
    fn vtbl(&self) -> &Self::Vtbl {
        unsafe { &*self.raw_vtbl() }
    }

    #[inline]
    fn unknown_vtbl(&self) -> &IUnknownVtbl {
        unsafe { &*(self.raw_vtbl() as *const IUnknownVtbl) }
    }

    /// `this` pointer passed as the first argument of every slot
    #[inline]
    fn as_raw(&self) -> *mut c_void {
        self as *const Self as *mut c_void
    }

    /// Ask the object for another capability; the result owns one reference.
    fn query<U: Interface>(&self) -> TrackerResult<ComPtr<U>> {
        let mut out = ptr::null_mut();
        HResult::ok(unsafe { (self.unknown_vtbl().query_interface)(self.as_raw(), &U::IID, &mut out) })?;
        let owned = unsafe { ComPtr::from_raw(out.cast::<U>()) };
        owned.ok_or(TrackerError::NullPointer)
    }
}

macro_rules! com_interface {
    ($(#[$meta:meta])* $name:ident, $vtbl:ident, $iid:expr) => {
        $(#[$meta])*
        #[repr(C)]
        pub struct $name {
            vtbl: *const $vtbl,
        }

        unsafe impl Interface for $name {
            const IID: Guid = Guid::from_u128($iid);
            type Vtbl = $vtbl;

            #[inline]
            fn raw_vtbl(&self) -> *const $vtbl {
                self.vtbl
            }
        }
    };
}

// ============================================================================
// Vtables
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IUnknownVtbl {
    pub query_interface:
        unsafe extern "system" fn(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> HResult,
    pub add_ref: unsafe extern "system" fn(this: *mut c_void) -> u32,
    pub release: unsafe extern "system" fn(this: *mut c_void) -> u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IReferenceTrackerTargetVtbl {
    pub base: IUnknownVtbl,
    pub add_ref_from_reference_tracker: unsafe extern "system" fn(this: *mut c_void) -> u32,
    pub release_from_reference_tracker: unsafe extern "system" fn(this: *mut c_void) -> u32,
    pub peg: unsafe extern "system" fn(this: *mut c_void) -> HResult,
    pub unpeg: unsafe extern "system" fn(this: *mut c_void) -> HResult,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IReferenceTrackerVtbl {
    pub base: IUnknownVtbl,
    pub connect_from_tracker_source: unsafe extern "system" fn(this: *mut c_void) -> HResult,
    pub disconnect_from_tracker_source: unsafe extern "system" fn(this: *mut c_void) -> HResult,
    pub find_tracker_targets: unsafe extern "system" fn(
        this: *mut c_void,
        callback: *mut IFindReferenceTargetsCallback,
    ) -> HResult,
    pub get_reference_tracker_manager: unsafe extern "system" fn(
        this: *mut c_void,
        out: *mut *mut IReferenceTrackerManager,
    ) -> HResult,
    pub add_ref_from_tracker_source: unsafe extern "system" fn(this: *mut c_void) -> HResult,
    pub release_from_tracker_source: unsafe extern "system" fn(this: *mut c_void) -> HResult,
    pub peg_from_tracker_source: unsafe extern "system" fn(this: *mut c_void) -> HResult,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IReferenceTrackerManagerVtbl {
    pub base: IUnknownVtbl,
    pub reference_tracking_started: unsafe extern "system" fn(this: *mut c_void) -> HResult,
    /// `find_failed` is a MIDL `boolean` (one byte)
    pub find_tracker_targets_completed:
        unsafe extern "system" fn(this: *mut c_void, find_failed: u8) -> HResult,
    pub reference_tracking_completed: unsafe extern "system" fn(this: *mut c_void) -> HResult,
    pub set_reference_tracker_host:
        unsafe extern "system" fn(this: *mut c_void, host: *mut IReferenceTrackerHost) -> HResult,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IReferenceTrackerHostVtbl {
    pub base: IUnknownVtbl,
    pub disconnect_unused_reference_sources:
        unsafe extern "system" fn(this: *mut c_void, flags: u32) -> HResult,
    pub release_disconnected_reference_sources: unsafe extern "system" fn(this: *mut c_void) -> HResult,
    pub notify_end_of_reference_tracking_on_thread:
        unsafe extern "system" fn(this: *mut c_void) -> HResult,
    pub get_tracker_target: unsafe extern "system" fn(
        this: *mut c_void,
        obj: *mut IUnknown,
        out: *mut *mut IReferenceTrackerTarget,
    ) -> HResult,
    pub add_memory_pressure: unsafe extern "system" fn(this: *mut c_void, bytes: u64) -> HResult,
    pub remove_memory_pressure: unsafe extern "system" fn(this: *mut c_void, bytes: u64) -> HResult,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IFindReferenceTargetsCallbackVtbl {
    pub base: IUnknownVtbl,
    pub found_tracker_target:
        unsafe extern "system" fn(this: *mut c_void, target: *mut IReferenceTrackerTarget) -> HResult,
}

// ============================================================================
// Interfaces
// ============================================================================

com_interface!(
    /// Identity interface every object answers
    IUnknown,
    IUnknownVtbl,
    0x00000000_0000_0000_c000_000000000046
);

com_interface!(
    /// Managed-side wrapper as seen by the tracker runtime
    IReferenceTrackerTarget,
    IReferenceTrackerTargetVtbl,
    0x64bd43f8_bfee_4ec4_b7eb_2935158dae21
);

com_interface!(
    /// Per-object tracking capability of an external object
    IReferenceTracker,
    IReferenceTrackerVtbl,
    0x11d3b13a_180e_4789_a8be_7712882893e6
);

com_interface!(
    /// The tracker runtime's coordinator
    IReferenceTrackerManager,
    IReferenceTrackerManagerVtbl,
    0x3cf184b4_7ccb_4dda_8455_7e6ce99a3298
);

com_interface!(
    /// Host services implemented on the managed side
    IReferenceTrackerHost,
    IReferenceTrackerHostVtbl,
    0x29a71c6a_3c42_4416_a39d_e2825a07a773
);

com_interface!(
    /// Per-walk edge sink implemented on the managed side
    IFindReferenceTargetsCallback,
    IFindReferenceTargetsCallbackVtbl,
    0x04b3486c_4687_4229_8d14_505ab584dd88
);

impl IReferenceTrackerTarget {
    #[inline]
    pub fn add_ref_from_reference_tracker(&self) -> u32 {
        unsafe { (self.vtbl().add_ref_from_reference_tracker)(self.as_raw()) }
    }

    #[inline]
    pub fn release_from_reference_tracker(&self) -> u32 {
        unsafe { (self.vtbl().release_from_reference_tracker)(self.as_raw()) }
    }

    #[inline]
    pub fn peg(&self) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().peg)(self.as_raw()) })
    }

    #[inline]
    pub fn unpeg(&self) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().unpeg)(self.as_raw()) })
    }
}

impl IReferenceTracker {
    /// Announce that a managed-side source now refers to this object
    #[inline]
    pub fn connect_from_tracker_source(&self) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().connect_from_tracker_source)(self.as_raw()) })
    }

    #[inline]
    pub fn disconnect_from_tracker_source(&self) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().disconnect_from_tracker_source)(self.as_raw()) })
    }

    /// Run the object's own edge enumeration, reporting into `callback`
    ///
    /// # Safety
    /// `callback` must point at a live callback object for the whole call.
    #[inline]
    pub unsafe fn find_tracker_targets(
        &self,
        callback: *mut IFindReferenceTargetsCallback,
    ) -> TrackerResult<()> {
        HResult::ok((self.vtbl().find_tracker_targets)(self.as_raw(), callback))
    }

    pub fn get_reference_tracker_manager(&self) -> TrackerResult<ComPtr<IReferenceTrackerManager>> {
        let mut out = ptr::null_mut();
        HResult::ok(unsafe { (self.vtbl().get_reference_tracker_manager)(self.as_raw(), &mut out) })?;
        let owned = unsafe { ComPtr::from_raw(out) };
        owned.ok_or(TrackerError::NullPointer)
    }

    #[inline]
    pub fn add_ref_from_tracker_source(&self) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().add_ref_from_tracker_source)(self.as_raw()) })
    }

    #[inline]
    pub fn release_from_tracker_source(&self) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().release_from_tracker_source)(self.as_raw()) })
    }

    #[inline]
    pub fn peg_from_tracker_source(&self) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().peg_from_tracker_source)(self.as_raw()) })
    }
}

impl IReferenceTrackerManager {
    #[inline]
    pub fn reference_tracking_started(&self) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().reference_tracking_started)(self.as_raw()) })
    }

    #[inline]
    pub fn find_tracker_targets_completed(&self, find_failed: bool) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().find_tracker_targets_completed)(self.as_raw(), find_failed as u8) })
    }

    #[inline]
    pub fn reference_tracking_completed(&self) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().reference_tracking_completed)(self.as_raw()) })
    }

    #[inline]
    pub fn set_reference_tracker_host(&self, host: &IReferenceTrackerHost) -> TrackerResult<()> {
        let host = host as *const IReferenceTrackerHost as *mut IReferenceTrackerHost;
        HResult::ok(unsafe { (self.vtbl().set_reference_tracker_host)(self.as_raw(), host) })
    }
}

impl IReferenceTrackerHost {
    #[inline]
    pub fn disconnect_unused_reference_sources(&self, flags: u32) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().disconnect_unused_reference_sources)(self.as_raw(), flags) })
    }

    #[inline]
    pub fn release_disconnected_reference_sources(&self) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().release_disconnected_reference_sources)(self.as_raw()) })
    }

    #[inline]
    pub fn notify_end_of_reference_tracking_on_thread(&self) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().notify_end_of_reference_tracking_on_thread)(self.as_raw()) })
    }

    pub fn get_tracker_target(&self, obj: &IUnknown) -> TrackerResult<ComPtr<IReferenceTrackerTarget>> {
        let mut out = ptr::null_mut();
        let obj = obj as *const IUnknown as *mut IUnknown;
        HResult::ok(unsafe { (self.vtbl().get_tracker_target)(self.as_raw(), obj, &mut out) })?;
        let owned = unsafe { ComPtr::from_raw(out) };
        owned.ok_or(TrackerError::NullPointer)
    }

    #[inline]
    pub fn add_memory_pressure(&self, bytes: u64) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().add_memory_pressure)(self.as_raw(), bytes) })
    }

    #[inline]
    pub fn remove_memory_pressure(&self, bytes: u64) -> TrackerResult<()> {
        HResult::ok(unsafe { (self.vtbl().remove_memory_pressure)(self.as_raw(), bytes) })
    }
}

impl IFindReferenceTargetsCallback {
    /// Report one outgoing edge; `target` may be null (rejected by the callee)
    ///
    /// # Safety
    /// `target` must be null or point at a live object.
    #[inline]
    pub unsafe fn found_tracker_target(&self, target: *mut IReferenceTrackerTarget) -> TrackerResult<()> {
        HResult::ok((self.vtbl().found_tracker_target)(self.as_raw(), target))
    }
}
