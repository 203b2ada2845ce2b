//! # RPC Runtime Core
//!
//! A user-space RPC runtime for high-performance computing clusters: the
//! client-side RPC state machine, its server-side mirror, and a pluggable
//! network abstraction offering two-sided short messages plus one-sided
//! transfers against registered memory, all driven by an explicit progress
//! loop.

pub mod bulk;
pub mod error;
pub mod handler;
pub mod header;
pub mod na;
pub mod proc;
pub mod request;
pub mod rpc;

pub use bulk::{BulkEngine, TransferDirection};
pub use error::{error_to_string, ReturnCode};
pub use handler::ServerHandle;
pub use na::{Addr, MemAttr, MemHandle, NaClass, NaContext, Tag};
pub use proc::{Proc, ProcHash, ProcOp};
pub use request::{RequestClass, RequestFuture};
pub use rpc::{hash_string, OutputSlot, ProcCb, RpcRequest, Runtime};

/// The current version of the RPC runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Report the runtime version as (major, minor, patch).
pub fn version_get() -> (u32, u32, u32) {
    let mut parts = VERSION.split('.').map(|part| part.parse().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Version word carried in request headers: `major << 16 | minor << 8 | patch`.
pub(crate) fn protocol_version_word() -> u32 {
    let (major, minor, patch) = version_get();
    (major << 16) | (minor << 8) | patch
}

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default timeout for waiting on a forwarded request
    pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default timeout for a single progress call
    pub const PROGRESS_TIMEOUT: Duration = Duration::from_millis(100);

    /// Default protocol selector
    pub const PROTOCOL: &str = "tcp";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_get_matches_manifest() {
        let (major, minor, patch) = version_get();
        assert_eq!(format!("{}.{}.{}", major, minor, patch), VERSION);
    }
}
