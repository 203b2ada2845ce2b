//! # Bulk Transfer Layer
//!
//! A thin façade over the transport's memory registration and one-sided
//! put/get. The bulk layer owns the mapping from application-visible bulk
//! handles to registered regions, serializes handles into their wire form,
//! and executes transfers that report completion through the same
//! completion path as every other transport operation.
//!
//! ## Ownership Between Engines
//!
//! Initialization of the process-global engine is reference-counted against
//! the RPC engine: [`init`] is idempotent, and the RPC engine records
//! whether it was the initializer. If it was, it calls [`finalize`] during
//! its own teardown; otherwise the application that initialized the bulk
//! layer keeps that responsibility.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, ReturnCode};
use crate::na::{Addr, Callback, MemAttr, MemHandle, NaClass, NaContext, OpRef};
use crate::request::RequestClass;
use std::time::Duration;

/// Direction of a bulk transfer, relative to the local origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Write local bytes into the remote region (put).
    Push,
    /// Read remote bytes into the local region (get).
    Pull,
}

/// Bulk engine bound to one transport class and progress context.
pub struct BulkEngine {
    na: Arc<dyn NaClass>,
    context: Arc<NaContext>,
    request_class: Arc<RequestClass>,
}

impl BulkEngine {
    /// Create an engine over an initialized transport.
    pub fn new(na: Arc<dyn NaClass>, context: Arc<NaContext>) -> Arc<BulkEngine> {
        let progress_na = na.clone();
        let progress_ctx = context.clone();
        let trigger_ctx = context.clone();
        let request_class = RequestClass::new(
            Box::new(move |timeout| progress_na.progress(&progress_ctx, timeout)),
            Box::new(move |timeout| trigger_ctx.trigger(timeout, 1).map(|n| n > 0)),
        );
        Arc::new(BulkEngine {
            na,
            context,
            request_class,
        })
    }

    /// Transport this engine operates on.
    pub fn na(&self) -> &Arc<dyn NaClass> {
        &self.na
    }

    /// Register a local buffer and produce an owned bulk handle.
    ///
    /// The buffer must stay valid and in place until [`handle_free`]
    /// deregisters it; a read-write registration additionally asserts that
    /// the caller owns the bytes exclusively for that lifetime.
    ///
    /// [`handle_free`]: BulkEngine::handle_free
    pub fn handle_create(&self, buf: &[u8], attr: MemAttr) -> Result<MemHandle> {
        let mut handle = self.na.mem_handle_create(buf, attr)?;
        self.na.mem_register(&mut handle)?;
        Ok(handle)
    }

    /// Deregister and release a handle.
    pub fn handle_free(&self, handle: MemHandle) -> Result<()> {
        self.na.mem_handle_free(handle)
    }

    /// Size of a handle's serialized form for the active transport.
    pub fn handle_get_serialize_size(&self) -> usize {
        self.na.mem_handle_get_serialize_size()
    }

    /// Serialize a handle into its wire form.
    pub fn handle_serialize(&self, buf: &mut [u8], handle: &MemHandle) -> Result<()> {
        self.na.mem_handle_serialize(buf, handle)
    }

    /// Reconstruct a remote-view handle from its wire form.
    pub fn handle_deserialize(&self, buf: &[u8]) -> Result<MemHandle> {
        self.na.mem_handle_deserialize(buf)
    }

    /// Start a bulk transfer between a local and a remote handle.
    ///
    /// Completion is reported through the transport completion path; the
    /// callback runs at trigger time.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer(
        &self,
        direction: TransferDirection,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        addr: &Addr,
        callback: Callback,
    ) -> Result<OpRef> {
        match direction {
            TransferDirection::Push => self.na.put(
                &self.context,
                callback,
                local,
                local_offset,
                remote,
                remote_offset,
                length,
                addr,
            ),
            TransferDirection::Pull => self.na.get(
                &self.context,
                callback,
                local,
                local_offset,
                remote,
                remote_offset,
                length,
                addr,
            ),
        }
    }

    /// Run a bulk transfer to completion, driving progress as needed.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_wait(
        &self,
        direction: TransferDirection,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        addr: &Addr,
        timeout: Duration,
    ) -> Result<()> {
        let future = self.request_class.request();
        let status: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
        let cb_future = future.clone();
        let cb_status = status.clone();
        self.transfer(
            direction,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            addr,
            Box::new(move |info| {
                *cb_status.lock() = Some(info.result);
                cb_future.complete();
            }),
        )?;
        if !self.request_class.wait(&future, timeout)? {
            return Err(ReturnCode::Timeout);
        }
        let result = status.lock().take().unwrap_or(Err(ReturnCode::Fail));
        result
    }
}

static BULK_ENGINE: Mutex<Option<Arc<BulkEngine>>> = Mutex::new(None);

/// Initialize the process-global bulk engine. Idempotent: a second call
/// leaves the existing engine in place.
pub fn init(na: Arc<dyn NaClass>, context: Arc<NaContext>) -> Result<()> {
    let mut slot = BULK_ENGINE.lock();
    if slot.is_none() {
        *slot = Some(BulkEngine::new(na, context));
    }
    Ok(())
}

/// Whether the process-global bulk engine is initialized.
pub fn initialized() -> bool {
    BULK_ENGINE.lock().is_some()
}

/// Access the process-global bulk engine.
pub fn engine() -> Result<Arc<BulkEngine>> {
    BULK_ENGINE.lock().clone().ok_or(ReturnCode::Fail)
}

/// Tear down the process-global bulk engine. Outstanding handles are the
/// caller's bug; the transport diagnoses them when it is finalized.
pub fn finalize() -> Result<()> {
    BULK_ENGINE
        .lock()
        .take()
        .map(|_| ())
        .ok_or(ReturnCode::Fail)
}

/// Register a buffer with the process-global engine.
pub fn handle_create(buf: &[u8], attr: MemAttr) -> Result<MemHandle> {
    engine()?.handle_create(buf, attr)
}

/// Release a handle created through the process-global engine.
pub fn handle_free(handle: MemHandle) -> Result<()> {
    engine()?.handle_free(handle)
}

/// Serialized handle size for the process-global engine's transport.
pub fn handle_get_serialize_size() -> Result<usize> {
    Ok(engine()?.handle_get_serialize_size())
}

/// Serialize a handle using the process-global engine.
pub fn handle_serialize(buf: &mut [u8], handle: &MemHandle) -> Result<()> {
    engine()?.handle_serialize(buf, handle)
}

/// Deserialize a handle using the process-global engine.
pub fn handle_deserialize(buf: &[u8]) -> Result<MemHandle> {
    engine()?.handle_deserialize(buf)
}

/// Start a transfer through the process-global engine.
#[allow(clippy::too_many_arguments)]
pub fn transfer(
    direction: TransferDirection,
    local: &MemHandle,
    local_offset: u64,
    remote: &MemHandle,
    remote_offset: u64,
    length: u64,
    addr: &Addr,
    callback: Callback,
) -> Result<OpRef> {
    engine()?.transfer(
        direction,
        local,
        local_offset,
        remote,
        remote_offset,
        length,
        addr,
        callback,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::na;

    #[test]
    fn test_self_transfer_round_trip_via_serialized_handle() {
        let class = na::initialize("tcp", None, false).unwrap();
        let context = class.context_create().unwrap();
        let engine = BulkEngine::new(class, context);
        let addr = engine.na().addr_self().unwrap();

        let src: Vec<u8> = (0..128u8).collect();
        let dst = vec![0u8; 128];
        let local = engine.handle_create(&src, MemAttr::ReadOnly).unwrap();
        let target = engine.handle_create(&dst, MemAttr::ReadWrite).unwrap();

        let mut wire = vec![0u8; engine.handle_get_serialize_size()];
        engine.handle_serialize(&mut wire, &target).unwrap();
        let remote = engine.handle_deserialize(&wire).unwrap();

        engine
            .transfer_wait(
                TransferDirection::Push,
                &local,
                0,
                &remote,
                0,
                128,
                &addr,
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(dst, src);

        engine.handle_free(local).unwrap();
        engine.handle_free(target).unwrap();
    }

    #[test]
    fn test_pull_with_offsets() {
        let class = na::initialize("tcp", None, false).unwrap();
        let context = class.context_create().unwrap();
        let engine = BulkEngine::new(class, context);
        let addr = engine.na().addr_self().unwrap();

        let src: Vec<u8> = (0..64u8).collect();
        let dst = vec![0u8; 64];
        let exported = engine.handle_create(&src, MemAttr::ReadOnly).unwrap();
        let local = engine.handle_create(&dst, MemAttr::ReadWrite).unwrap();

        let mut wire = vec![0u8; engine.handle_get_serialize_size()];
        engine.handle_serialize(&mut wire, &exported).unwrap();
        let remote = engine.handle_deserialize(&wire).unwrap();

        engine
            .transfer_wait(
                TransferDirection::Pull,
                &local,
                16,
                &remote,
                32,
                16,
                &addr,
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(&dst[16..32], &src[32..48]);
        assert!(dst[..16].iter().all(|&b| b == 0));

        engine.handle_free(exported).unwrap();
        engine.handle_free(local).unwrap();
    }
}
