//! # Network Abstraction Layer
//!
//! This module defines the narrow, portable interface the runtime uses to
//! talk to a connection-oriented messaging transport. It provides the core
//! trait, the shared data structures, and the factory used to select a
//! concrete transport by protocol name.
//!
//! ## Key Design Principles
//!
//! - **Unified Interface**: every transport implements the same [`NaClass`]
//!   trait, so the RPC and bulk layers never name a concrete transport
//! - **Explicit Progress**: there is no background runtime; the transport is
//!   driven by [`NaClass::progress`] and completions are delivered by
//!   [`NaContext::trigger`] on the calling thread
//! - **Two-Sided and One-Sided**: short unexpected/expected messages plus
//!   put/get against registered memory regions share one completion path
//! - **Typed Operation State**: each posted operation carries a discriminated
//!   state value; variants never share fields
//!
//! ## Message Taxonomy
//!
//! Every short message carries a 32-bit framing word split
//! `{expect:1 (LSB), tag:31}` followed by the payload. Unexpected sends
//! target a peer without pre-coordination and are matched process-wide in
//! FIFO order; expected sends must match a receive posted with the same
//! `(source address, tag)` pair, matched per-address in FIFO order.
//!
//! ## Operation Lifecycle
//!
//! Posting allocates an operation, attaches the user callback, and hands the
//! operation to the transport. Completion (immediate or from the progress
//! loop) pushes the operation and its callback information onto the owning
//! context's completion queue; `trigger` dequeues and invokes callbacks on
//! the triggering thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ReturnCode};

pub mod tcp;

/// Application message tag. 31 bits are usable; tags above the transport's
/// reported maximum are reserved for transport-internal bulk framing.
pub type Tag = u32;

/// Access rights of a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAttr {
    /// Region may only be read by remote peers (valid get source).
    ReadOnly,
    /// Region may be read and written by remote peers.
    ReadWrite,
}

impl MemAttr {
    fn to_u8(self) -> u8 {
        match self {
            MemAttr::ReadOnly => 0,
            MemAttr::ReadWrite => 1,
        }
    }

    fn from_u8(v: u8) -> Result<MemAttr> {
        match v {
            0 => Ok(MemAttr::ReadOnly),
            1 => Ok(MemAttr::ReadWrite),
            _ => Err(ReturnCode::ProtocolError),
        }
    }
}

/// Fixed wire layout of a memory handle: base (8) | length (8) | attr (1),
/// all little-endian via bincode's fixed-int encoding.
#[derive(Serialize, Deserialize)]
struct MemHandleDescriptor {
    base: u64,
    len: u64,
    attr: u8,
}

/// Serialized size of a memory handle descriptor.
pub const MEM_HANDLE_SERIALIZE_SIZE: usize = 17;

/// Describes a contiguous registered memory region.
///
/// A handle created locally references memory owned by the caller, which
/// must stay valid (and must not move) until the handle is deregistered. A
/// handle obtained from [`NaClass::mem_handle_deserialize`] is a remote
/// view: usable as the target of put/get, not registrable again.
#[derive(Debug, Clone)]
pub struct MemHandle {
    pub(crate) base: u64,
    pub(crate) len: u64,
    pub(crate) attr: MemAttr,
    pub(crate) registered: bool,
    pub(crate) remote: bool,
}

impl MemHandle {
    /// Length of the described region in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Access rights of the region.
    pub fn attr(&self) -> MemAttr {
        self.attr
    }

    /// Whether this handle is a deserialized remote view.
    pub fn is_remote(&self) -> bool {
        self.remote
    }
}

/// Per-address queues for expected-message matching.
#[derive(Default)]
pub(crate) struct AddrQueues {
    /// Posted expected receives awaiting matching sends, FIFO.
    pub(crate) rxs: VecDeque<OpRef>,
    /// Expected payloads that arrived before a matching post, FIFO.
    pub(crate) early: VecDeque<EarlyMsg>,
}

/// An expected payload staged before its receive was posted.
pub(crate) struct EarlyMsg {
    pub(crate) tag: Tag,
    pub(crate) data: Vec<u8>,
}

pub(crate) struct AddrInner {
    /// Slot into the transport's connection table, if connected.
    pub(crate) conn: Mutex<Option<usize>>,
    /// Resolved peer URI; populated on lookup and on self addresses.
    pub(crate) uri: Mutex<Option<String>>,
    /// Expected-matching queues; one mutex covers both so the scan-then-
    /// insert sequences on post and arrival cannot interleave.
    pub(crate) queues: Mutex<AddrQueues>,
    /// Address was synthesized from an unexpected receive; the transport
    /// owns it and the holder must not free it.
    pub(crate) unexpected: bool,
    /// Loopback address of the local endpoint.
    pub(crate) is_self: bool,
}

/// Opaque peer identity produced by name resolution or by the transport.
///
/// Cloning is cheap; all clones refer to the same underlying address state.
#[derive(Clone)]
pub struct Addr(pub(crate) Arc<AddrInner>);

impl Addr {
    pub(crate) fn new(unexpected: bool, is_self: bool) -> Addr {
        Addr(Arc::new(AddrInner {
            conn: Mutex::new(None),
            uri: Mutex::new(None),
            queues: Mutex::new(AddrQueues::default()),
            unexpected,
            is_self,
        }))
    }

    /// Whether this is the local endpoint's loopback address.
    pub fn is_self(&self) -> bool {
        self.0.is_self
    }

    /// Whether the transport synthesized this address from an unexpected
    /// receive (in which case the holder must not free it).
    pub fn is_unexpected(&self) -> bool {
        self.0.unexpected
    }
}

impl PartialEq for Addr {
    fn eq(&self, other: &Addr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Addr {}

impl std::fmt::Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Addr")
            .field("uri", &*self.0.uri.lock())
            .field("unexpected", &self.0.unexpected)
            .field("is_self", &self.0.is_self)
            .finish()
    }
}

/// Operation type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Lookup,
    SendUnexpected,
    RecvUnexpected,
    SendExpected,
    RecvExpected,
    Put,
    Get,
}

/// Per-operation state. One variant per operation type; variants do not
/// share fields even where layouts would coincide.
pub(crate) enum OpState {
    Lookup {
        addr: Addr,
    },
    SendUnexpected,
    RecvUnexpected {
        buf: Option<Vec<u8>>,
    },
    SendExpected,
    RecvExpected {
        buf: Option<Vec<u8>>,
        tag: Tag,
        source: Addr,
    },
    Put {
        xfer_id: u64,
    },
    Get {
        xfer_id: u64,
        local_base: u64,
        local_offset: u64,
        length: u64,
    },
}

/// One posted operation. Owns the user callback until completion.
pub struct Op {
    pub(crate) ty: OpType,
    pub(crate) completed: AtomicBool,
    pub(crate) callback: Mutex<Option<Callback>>,
    pub(crate) state: Mutex<OpState>,
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Op")
            .field("ty", &self.ty)
            .field("completed", &self.completed)
            .finish()
    }
}

impl Op {
    pub(crate) fn new(ty: OpType, callback: Callback, state: OpState) -> OpRef {
        Arc::new(Op {
            ty,
            completed: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
            state: Mutex::new(state),
        })
    }

    /// Operation type.
    pub fn op_type(&self) -> OpType {
        self.ty
    }

    /// Whether the operation has completed (its callback may not have been
    /// triggered yet).
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Shared reference to a posted operation.
pub type OpRef = Arc<Op>;

/// Completion payload handed to an operation's callback.
pub enum CbInfoKind {
    /// Address resolution finished.
    Lookup { addr: Addr },
    /// Unexpected send released its buffer.
    SendUnexpected,
    /// Expected send released its buffer.
    SendExpected,
    /// Unexpected receive matched a message. The posted buffer is returned
    /// with `actual_size` valid bytes; truncation is permitted and reported
    /// through the shorter size.
    RecvUnexpected {
        buf: Vec<u8>,
        actual_size: usize,
        source: Addr,
        tag: Tag,
    },
    /// Expected receive matched a message.
    RecvExpected { buf: Vec<u8>, actual_size: usize },
    /// One-sided put finished.
    Put,
    /// One-sided get finished.
    Get,
}

/// Callback information: the operation outcome plus per-type payload.
pub struct CbInfo {
    pub result: Result<()>,
    pub kind: CbInfoKind,
}

/// Completion callback attached to a posted operation.
pub type Callback = Box<dyn FnOnce(CbInfo) + Send + 'static>;

struct Completion {
    /// Kept so the operation outlives its callback, mirroring the release
    /// order of the completion queue.
    _op: OpRef,
    callback: Option<Callback>,
    info: CbInfo,
}

/// Progress domain: owns the completion queue fed by the transport.
///
/// Multiple contexts may exist per process, but each transport class holds
/// one active context at a time in this core.
pub struct NaContext {
    queue: Mutex<VecDeque<Completion>>,
    cond: Condvar,
}

impl Default for NaContext {
    fn default() -> Self {
        NaContext::new()
    }
}

impl NaContext {
    pub fn new() -> NaContext {
        NaContext {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Whether completions are waiting to be triggered.
    pub fn has_pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Mark an operation complete and queue its callback.
    pub(crate) fn complete(&self, op: &OpRef, info: CbInfo) {
        op.completed.store(true, Ordering::Release);
        let callback = op.callback.lock().take();
        let mut queue = self.queue.lock();
        queue.push_back(Completion {
            _op: op.clone(),
            callback,
            info,
        });
        self.cond.notify_all();
    }

    /// Dequeue and invoke up to `max_count` completion callbacks on the
    /// calling thread, waiting up to `timeout` for the first one.
    ///
    /// Returns the number of callbacks invoked (possibly zero).
    pub fn trigger(&self, timeout: Duration, max_count: u32) -> Result<u32> {
        let deadline = Instant::now() + timeout;
        let mut count = 0u32;
        while count < max_count {
            let completion = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(c) = queue.pop_front() {
                        break Some(c);
                    }
                    // Only wait for the first callback of a drain.
                    if count > 0 {
                        break None;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break None;
                    }
                    let _ = self.cond.wait_for(&mut queue, deadline - now);
                }
            };
            match completion {
                Some(c) => {
                    if let Some(cb) = c.callback {
                        cb(c.info);
                    }
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

/// Capability set implemented by each concrete transport.
///
/// Buffer ownership follows the completion model: sends take a shared
/// `Arc<Vec<u8>>` the transport drops once the bytes are on the wire;
/// receives take the buffer by value and return it through [`CbInfo`] at
/// completion, including error and cancellation completions.
pub trait NaClass: Send + Sync {
    /// Transport name (the protocol selector it was created under).
    fn name(&self) -> &'static str;

    /// Release transport resources. Posted-but-unmatched operations are
    /// diagnosed; outstanding registered regions are the caller's bug.
    fn finalize(&self) -> Result<()>;

    /// Create a progress domain for this class.
    fn context_create(&self) -> Result<Arc<NaContext>> {
        Ok(Arc::new(NaContext::new()))
    }

    /// Resolve a peer name (URI) into an address. The returned operation
    /// completes with the address through the completion queue; the resolved
    /// URI is recorded on the address.
    fn addr_lookup(&self, context: &Arc<NaContext>, callback: Callback, name: &str)
        -> Result<OpRef>;

    /// Release an address obtained from lookup or `addr_self`. Addresses
    /// synthesized from unexpected receives are owned by the transport and
    /// must not be freed by the holder.
    fn addr_free(&self, addr: Addr) -> Result<()>;

    /// Loopback address of this endpoint.
    fn addr_self(&self) -> Result<Addr>;

    /// Whether the address refers to this endpoint.
    fn addr_is_self(&self, addr: &Addr) -> bool;

    /// Printable URI of the address.
    fn addr_to_string(&self, addr: &Addr) -> Result<String>;

    /// Maximum payload of an unexpected message.
    fn msg_get_max_unexpected_size(&self) -> usize;

    /// Maximum payload of an expected message.
    fn msg_get_max_expected_size(&self) -> usize;

    /// Largest application tag; higher values are transport-internal.
    fn msg_get_max_tag(&self) -> Tag;

    /// Post an unexpected send.
    fn msg_send_unexpected(
        &self,
        context: &Arc<NaContext>,
        callback: Callback,
        buf: Arc<Vec<u8>>,
        dest: &Addr,
        tag: Tag,
    ) -> Result<OpRef>;

    /// Post an unexpected receive (any source).
    fn msg_recv_unexpected(
        &self,
        context: &Arc<NaContext>,
        callback: Callback,
        buf: Vec<u8>,
    ) -> Result<OpRef>;

    /// Post an expected send.
    fn msg_send_expected(
        &self,
        context: &Arc<NaContext>,
        callback: Callback,
        buf: Arc<Vec<u8>>,
        dest: &Addr,
        tag: Tag,
    ) -> Result<OpRef>;

    /// Post an expected receive matched on `(source, tag)`.
    fn msg_recv_expected(
        &self,
        context: &Arc<NaContext>,
        callback: Callback,
        buf: Vec<u8>,
        source: &Addr,
        tag: Tag,
    ) -> Result<OpRef>;

    /// Describe a local memory region. The region must stay valid and in
    /// place until the handle is deregistered and freed.
    fn mem_handle_create(&self, buf: &[u8], attr: MemAttr) -> Result<MemHandle>;

    /// Release a handle. Registered handles must be deregistered first.
    fn mem_handle_free(&self, handle: MemHandle) -> Result<()>;

    /// Register the region with the transport, making it a valid put/get
    /// target. Remote-view handles cannot be registered.
    fn mem_register(&self, handle: &mut MemHandle) -> Result<()>;

    /// Remove the region from the transport's registration table.
    fn mem_deregister(&self, handle: &mut MemHandle) -> Result<()>;

    /// Size of the serialized handle descriptor.
    fn mem_handle_get_serialize_size(&self) -> usize {
        MEM_HANDLE_SERIALIZE_SIZE
    }

    /// Serialize a handle into `buf` using the fixed descriptor layout.
    fn mem_handle_serialize(&self, buf: &mut [u8], handle: &MemHandle) -> Result<()> {
        if buf.len() < MEM_HANDLE_SERIALIZE_SIZE {
            return Err(ReturnCode::SizeError);
        }
        let descriptor = MemHandleDescriptor {
            base: handle.base,
            len: handle.len,
            attr: handle.attr.to_u8(),
        };
        let bytes = bincode::serialize(&descriptor).map_err(|_| ReturnCode::ProtocolError)?;
        debug_assert_eq!(bytes.len(), MEM_HANDLE_SERIALIZE_SIZE);
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    /// Deserialize a descriptor into a remote-view handle.
    fn mem_handle_deserialize(&self, buf: &[u8]) -> Result<MemHandle> {
        if buf.len() < MEM_HANDLE_SERIALIZE_SIZE {
            return Err(ReturnCode::SizeError);
        }
        let descriptor: MemHandleDescriptor =
            bincode::deserialize(&buf[..MEM_HANDLE_SERIALIZE_SIZE])
                .map_err(|_| ReturnCode::ProtocolError)?;
        Ok(MemHandle {
            base: descriptor.base,
            len: descriptor.len,
            attr: MemAttr::from_u8(descriptor.attr)?,
            registered: false,
            remote: true,
        })
    }

    /// One-sided write from a local region into a remote region. The remote
    /// handle must be read-write; violations fail with `PERMISSION_ERROR`
    /// before any transfer is initiated. Zero-length transfers complete
    /// successfully and move nothing.
    #[allow(clippy::too_many_arguments)]
    fn put(
        &self,
        context: &Arc<NaContext>,
        callback: Callback,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        addr: &Addr,
    ) -> Result<OpRef>;

    /// One-sided read from a remote region into a local region.
    #[allow(clippy::too_many_arguments)]
    fn get(
        &self,
        context: &Arc<NaContext>,
        callback: Callback,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        addr: &Addr,
    ) -> Result<OpRef>;

    /// Poll the transport for up to `timeout`, dispatching events. Returns
    /// `Ok(())` the first time any event was handled, `Err(TIMEOUT)` if the
    /// deadline elapsed with no events.
    fn progress(&self, context: &Arc<NaContext>, timeout: Duration) -> Result<()>;

    /// Best-effort abort. Posted receives not yet matched are removed from
    /// their queue and completed with an error; in-flight sends and
    /// one-sided transfers fail with `PROTOCOL_ERROR`.
    fn cancel(&self, context: &Arc<NaContext>, op: &OpRef) -> Result<()>;
}

/// Check whether a protocol name is backed by a transport in this build.
pub fn check_protocol(protocol: &str) -> bool {
    protocol == tcp::PROTOCOL_NAME
}

/// Instantiate the transport selected by `protocol`.
///
/// `listen_addr` names the local endpoint (e.g. `"127.0.0.1:0"`); when
/// `listen` is false an ephemeral local endpoint is still created so the
/// peer can route replies, but no inbound connections are expected.
pub fn initialize(
    protocol: &str,
    listen_addr: Option<&str>,
    listen: bool,
) -> Result<Arc<dyn NaClass>> {
    match protocol {
        tcp::PROTOCOL_NAME => Ok(Arc::new(tcp::TcpClass::initialize(listen_addr, listen)?)),
        _ => {
            tracing::error!(protocol, "requested transport is not available");
            Err(ReturnCode::InvalidParam)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_protocol() {
        assert!(check_protocol("tcp"));
        assert!(!check_protocol("verbs"));
    }

    #[test]
    fn test_mem_handle_descriptor_size() {
        let descriptor = MemHandleDescriptor {
            base: u64::MAX,
            len: u64::MAX,
            attr: 1,
        };
        let bytes = bincode::serialize(&descriptor).unwrap();
        assert_eq!(bytes.len(), MEM_HANDLE_SERIALIZE_SIZE);
    }

    #[test]
    fn test_trigger_timeout_zero_returns_immediately() {
        let context = NaContext::new();
        let count = context.trigger(Duration::ZERO, u32::MAX).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_trigger_drains_exactly_queued_completions() {
        let context = NaContext::new();
        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        for _ in 0..3 {
            let fired = fired.clone();
            let op = Op::new(
                OpType::SendUnexpected,
                Box::new(move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
                OpState::SendUnexpected,
            );
            context.complete(
                &op,
                CbInfo {
                    result: Ok(()),
                    kind: CbInfoKind::SendUnexpected,
                },
            );
        }
        let count = context.trigger(Duration::ZERO, u32::MAX).unwrap();
        assert_eq!(count, 3);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(!context.has_pending());
    }
}
