//! Tracker Bridge - cross-collector reference tracking
//!
//! Lets a tracing garbage collector and an external reference-counted object
//! model (the tracker runtime) collect cycles that span both. The bridge:
//! 1. Discovers the tracker runtime's coordinator exactly once
//! 2. Brackets every collection with a begin/end tracking handshake
//! 3. Walks tracker objects and reports edges back into the managed heap
//! 4. Serves the host callbacks the tracker runtime calls into

pub mod abi;
pub mod error;
pub mod host;
pub mod logging;
pub mod manager;
pub mod runtime;
mod stats;
mod walk;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export core types
pub use error::{Status, TrackerError, TrackerResult};
pub use host::HostServices;
pub use manager::TrackerObjectManager;
pub use runtime::{
    CollectionPass, CreateComInterfaceFlags, CreateObjectFlags, DisconnectFlags,
    ExternalObjectContext, GcRequest, ObjectHandle, RuntimeImports,
};
pub use stats::TrackerStats;
