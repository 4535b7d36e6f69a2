//! Owning interface pointer
//!
//! Holds exactly one reference on the pointee and releases it on drop, so every
//! early return out of a call path gives back what it acquired.

use super::Interface;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;

/// Owned reference to a COM-style object
pub struct ComPtr<T: Interface> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

impl<T: Interface> ComPtr<T> {
    /// Take ownership of a reference the caller already holds
    ///
    /// # Safety
    /// `ptr` must be null or point at a live object carrying one reference
    /// that is transferred to the returned value.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut T) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self {
            ptr,
            _marker: PhantomData,
        })
    }

    /// Acquire a new reference on a borrowed object
    ///
    /// # Safety
    /// `ptr` must be null or point at a live object.
    #[inline]
    pub unsafe fn from_borrowed(ptr: *mut T) -> Option<Self> {
        let owned = Self::from_raw(ptr)?;
        owned.add_ref();
        Some(owned)
    }

    /// Get raw pointer
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Convert to raw pointer, consuming self without releasing
    #[inline]
    pub fn into_raw(self) -> *mut T {
        let ptr = self.ptr.as_ptr();
        core::mem::forget(self);
        ptr
    }

    #[inline]
    fn add_ref(&self) -> u32 {
        unsafe { (self.unknown_vtbl().add_ref)(self.as_raw()) }
    }
}

impl<T: Interface> Clone for ComPtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        self.add_ref();
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: Interface> Drop for ComPtr<T> {
    #[inline]
    fn drop(&mut self) {
        unsafe {
            (self.unknown_vtbl().release)(self.as_raw());
        }
    }
}

impl<T: Interface> Deref for ComPtr<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Interface> fmt::Debug for ComPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComPtr({:p})", self.ptr)
    }
}
