//! Status codes used on every call across the binary interface

use crate::error::{Status, TrackerError, TrackerResult};
use core::fmt;

/// 32-bit status code; negative values are failures
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HResult(pub i32);

impl HResult {
    pub const S_OK: Self = Self(0);
    pub const S_FALSE: Self = Self(1);
    pub const E_NOINTERFACE: Self = Self(0x8000_4002_u32 as i32);
    pub const E_POINTER: Self = Self(0x8000_4003_u32 as i32);
    pub const E_FAIL: Self = Self(0x8000_4005_u32 as i32);
    pub const E_INVALIDARG: Self = Self(0x8007_0057_u32 as i32);
    /// `HRESULT_FROM_WIN32(ERROR_NOT_FOUND)`
    pub const E_NOT_SET: Self = Self(0x8007_0490_u32 as i32);

    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// Convert to a result, discarding the success flavour
    #[inline]
    pub fn ok(self) -> TrackerResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(TrackerError::from(self))
        }
    }
}

impl fmt::Debug for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HResult({:#010x})", self.0 as u32)
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}

impl From<TrackerError> for HResult {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::InvalidArgument => Self::E_INVALIDARG,
            TrackerError::NullPointer => Self::E_POINTER,
            TrackerError::NoInterface => Self::E_NOINTERFACE,
            TrackerError::NotConfigured => Self::E_NOT_SET,
            TrackerError::External(hr) => hr,
        }
    }
}

impl From<TrackerResult<()>> for HResult {
    #[inline]
    fn from(result: TrackerResult<()>) -> Self {
        match result {
            Ok(()) => Self::S_OK,
            Err(err) => err.into(),
        }
    }
}

impl From<TrackerResult<Status>> for HResult {
    #[inline]
    fn from(result: TrackerResult<Status>) -> Self {
        match result {
            Ok(Status::Applied) => Self::S_OK,
            Ok(Status::NotApplicable) => Self::S_FALSE,
            Err(err) => err.into(),
        }
    }
}
