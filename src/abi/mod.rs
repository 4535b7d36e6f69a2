//! Binary interface - COM-style capability interfaces shared with the tracker runtime
//!
//! Design: Layout-exact mirror of the external runtime's calling convention:
//! - `guid.rs` - interface identifiers (IIDs)
//! - `hresult.rs` - status codes and conversion to/from `TrackerResult`
//! - `interfaces.rs` - `#[repr(C)]` vtables and typed client wrappers
//! - `com_ptr.rs` - scope-bound owning interface pointer
//!
//! Every object crossing the boundary starts with a pointer to its vtable, and
//! every vtable starts with the three `IUnknown` slots.

mod com_ptr;
mod guid;
mod hresult;
mod interfaces;


pub use com_ptr::ComPtr;
pub use guid::Guid;
pub use hresult::HResult;
pub use interfaces::{
    IFindReferenceTargetsCallback, IFindReferenceTargetsCallbackVtbl, IReferenceTracker,
    IReferenceTrackerHost, IReferenceTrackerHostVtbl, IReferenceTrackerManager,
    IReferenceTrackerManagerVtbl, IReferenceTrackerTarget, IReferenceTrackerTargetVtbl,
    IReferenceTrackerVtbl, IUnknown, IUnknownVtbl, Interface,
};

use core::ffi::c_void;

/// Answer a `QueryInterface` call for an object whose reference count is not tracked.
///
/// `resolved` is the outcome of the object's own capability lookup for the
/// requested IID. Null out-params are rejected before anything is written.
///
/// # Safety
/// `out` must be null or valid for a pointer-sized write.
pub unsafe fn write_interface(out: *mut *mut c_void, resolved: Option<*mut c_void>) -> HResult {
    if out.is_null() {
        return HResult::E_POINTER;
    }

    match resolved {
        Some(ptr) => {
            *out = ptr;
            HResult::S_OK
        }
        None => {
            *out = core::ptr::null_mut();
            HResult::E_NOINTERFACE
        }
    }
}
