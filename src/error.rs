//! Error types shared by the registry, the walk and the host responder
//!
//! Failures form a closed set; anything the external runtime reports that is
//! not one of the named kinds is carried through as `External`.

use crate::abi::HResult;
use core::fmt;

/// Successful outcome of an operation that may not apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation ran
    Applied,
    /// Nothing to do (no coordinator published, no active walk)
    NotApplicable,
}

/// Failure kinds surfaced by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerError {
    /// Null or otherwise unusable argument
    InvalidArgument,
    /// Required pointer was null
    NullPointer,
    /// Object does not expose the requested interface
    NoInterface,
    /// No runtime implementation has been published for host services
    NotConfigured,
    /// Any other failure status reported across the boundary
    External(HResult),
}

impl From<HResult> for TrackerError {
    fn from(hr: HResult) -> Self {
        debug_assert!(!hr.is_success(), "success status is not an error");

        match hr {
            HResult::E_INVALIDARG => Self::InvalidArgument,
            HResult::E_POINTER => Self::NullPointer,
            HResult::E_NOINTERFACE => Self::NoInterface,
            HResult::E_NOT_SET => Self::NotConfigured,
            other => Self::External(other),
        }
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::NullPointer => write!(f, "Null pointer"),
            Self::NoInterface => write!(f, "Interface not supported"),
            Self::NotConfigured => write!(f, "Runtime implementation not configured"),
            Self::External(hr) => write!(f, "External call failed with status {}", hr),
        }
    }
}

impl std::error::Error for TrackerError {}

/// Result alias used throughout the crate
pub type TrackerResult<T = Status> = Result<T, TrackerError>;
