//! # RPC Engine
//!
//! The client-side RPC state machine: procedure registration, request
//! framing, tag correlation, and the forward/wait/free lifecycle.
//!
//! ## Key Components
//!
//! - **Runtime**: explicit object bundling the transport class, progress
//!   context, request utility, procedure table, tag allocator, and bulk
//!   engine. Every entry point is a method; a thin thread-safe accessor at
//!   the bottom of the module serves call sites that want process-global
//!   state.
//! - **Procedure table**: maps `hash(name)` to the pair of proc functions
//!   driving input and output traversal. The same function runs in Encode,
//!   Decode and Free modes, so traversal stays symmetric by construction.
//! - **Request lifecycle**: `forward` encodes the payload (escalating to a
//!   registered overflow region when it outgrows the inline buffer),
//!   pre-posts the expected receive, then posts the unexpected send, both
//!   under one generated tag. Completion callbacks resolve the request's
//!   two futures; `wait` observes them; `free` releases everything.
//!
//! ## Request State Machine
//!
//! ```text
//!    [created] -- forward --> [in_flight] -- send_cb ----> [recv_pending]
//!                                         -- recv_cb ----> [send_pending]
//!    [recv_pending|send_pending] -- other_cb --> [completed]
//!    [completed] -- wait --> [completed, consumed] -- free --> [destroyed]
//! ```
//!
//! The two callbacks may arrive in either order; both fire exactly once
//! before `wait` can report success.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace};

use crate::bulk::{self, BulkEngine};
use crate::error::{Result, ReturnCode};
use crate::handler::HandlerState;
use crate::header;
use crate::na::{Addr, CbInfo, CbInfoKind, MemAttr, NaClass, NaContext, Tag};
use crate::proc::{self, Proc, ProcHash, ProcOp};
use crate::request::RequestClass;

/// Proc function driving one structure through Encode, Decode and Free.
pub type ProcCb = fn(&mut Proc<'_>, &mut dyn Any) -> Result<()>;

/// Shared slot for a call's output structure. The engine decodes into it on
/// the trigger thread; the caller reads it back after `wait` succeeds.
pub type OutputSlot = Arc<Mutex<Box<dyn Any + Send>>>;

/// Registered procedure: input proc (encoded by the caller, decoded by the
/// target) and output proc (encoded by the target, decoded by the caller).
#[derive(Clone)]
pub(crate) struct ProcInfo {
    pub(crate) name: String,
    pub(crate) in_proc: Option<ProcCb>,
    pub(crate) out_proc: Option<ProcCb>,
}

struct ReqState {
    send_buf: Option<Arc<Vec<u8>>>,
    extra_send_buf: Option<Vec<u8>>,
    extra_send_handle: Option<crate::na::MemHandle>,
    out_struct: Option<OutputSlot>,
    send_error: Option<ReturnCode>,
    recv_error: Option<ReturnCode>,
}

struct RequestInner {
    id: u32,
    state: Mutex<ReqState>,
    send_request: Mutex<Option<crate::request::RequestFuture>>,
    recv_request: Mutex<Option<crate::request::RequestFuture>>,
}

/// An in-flight (or completed) RPC call. Exclusively owned by the engine
/// between `forward` and `request_free`.
pub struct RpcRequest {
    inner: Arc<RequestInner>,
}

impl RpcRequest {
    /// Procedure id this request targets.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Whether the send buffer has been released by the transport.
    pub fn send_buf_released(&self) -> bool {
        self.inner.state.lock().send_buf.is_none()
    }

    /// Whether the overflow buffer (if any) is still held.
    pub fn has_extra_buf(&self) -> bool {
        self.inner.state.lock().extra_send_buf.is_some()
    }
}

/// Stable string hash used to derive procedure ids (djb2 over the bytes).
pub fn hash_string(name: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in name.bytes() {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(byte as u32);
    }
    hash
}

/// Explicit runtime object bundling all engine state.
pub struct Runtime {
    pub(crate) na: Arc<dyn NaClass>,
    pub(crate) context: Arc<NaContext>,
    pub(crate) request_class: Arc<RequestClass>,
    pub(crate) bulk: Arc<BulkEngine>,
    bulk_initialized_internal: bool,
    pub(crate) proc_table: RwLock<HashMap<u32, ProcInfo>>,
    pub(crate) handler_state: HandlerState,
    /// Back-reference so completion closures can hold the runtime alive.
    pub(crate) weak_self: Weak<Runtime>,
    tag: AtomicU32,
    max_tag: Tag,
}

impl Runtime {
    /// Initialize a runtime with its own private bulk engine.
    pub fn init(na: Arc<dyn NaClass>) -> Result<Arc<Runtime>> {
        let context = na.context_create()?;
        let engine = BulkEngine::new(na.clone(), context.clone());
        Runtime::build(na, context, engine, false)
    }

    /// Initialize a runtime sharing an existing bulk engine.
    pub fn with_bulk(na: Arc<dyn NaClass>, engine: Arc<BulkEngine>) -> Result<Arc<Runtime>> {
        let context = na.context_create()?;
        Runtime::build(na, context, engine, false)
    }

    fn build(
        na: Arc<dyn NaClass>,
        context: Arc<NaContext>,
        engine: Arc<BulkEngine>,
        bulk_initialized_internal: bool,
    ) -> Result<Arc<Runtime>> {
        let progress_na = na.clone();
        let progress_ctx = context.clone();
        let trigger_ctx = context.clone();
        let request_class = RequestClass::new(
            Box::new(move |timeout| progress_na.progress(&progress_ctx, timeout)),
            Box::new(move |timeout| trigger_ctx.trigger(timeout, 1).map(|n| n > 0)),
        );
        let max_tag = na.msg_get_max_tag();
        Ok(Arc::new_cyclic(|weak_self| Runtime {
            na,
            context,
            request_class,
            bulk: engine,
            bulk_initialized_internal,
            proc_table: RwLock::new(HashMap::new()),
            handler_state: HandlerState::default(),
            weak_self: weak_self.clone(),
            tag: AtomicU32::new(0),
            max_tag,
        }))
    }

    /// Strong handle to this runtime, for closures that outlive the caller.
    pub(crate) fn arc(&self) -> Result<Arc<Runtime>> {
        self.weak_self.upgrade().ok_or(ReturnCode::Fail)
    }

    /// Transport class this runtime drives.
    pub fn na(&self) -> &Arc<dyn NaClass> {
        &self.na
    }

    /// Progress context of this runtime.
    pub fn context(&self) -> &Arc<NaContext> {
        &self.context
    }

    /// Bulk engine of this runtime.
    pub fn bulk(&self) -> &Arc<BulkEngine> {
        &self.bulk
    }

    /// Tear down runtime-held transport state: cancel the handler's posted
    /// receive and drain staged completions. The transport itself stays
    /// alive; finalizing it is its creator's responsibility.
    pub fn finalize(&self) -> Result<()> {
        self.handler_state.shutdown(self);
        self.context.trigger(Duration::ZERO, u32::MAX)?;
        if self.bulk_initialized_internal {
            bulk::finalize()?;
        }
        Ok(())
    }

    /// Register a named procedure and derive its stable id.
    ///
    /// Re-registering the same name replaces its proc pair. A different
    /// name whose hash collides with an existing registration fails with
    /// `INVALID_PARAM`: the id is the on-wire discriminator and must stay
    /// unambiguous.
    pub fn register(
        &self,
        name: &str,
        in_proc: Option<ProcCb>,
        out_proc: Option<ProcCb>,
    ) -> Result<u32> {
        let id = hash_string(name);
        let mut table = self.proc_table.write();
        if let Some(existing) = table.get(&id) {
            if existing.name != name {
                error!(
                    name,
                    existing = %existing.name,
                    id,
                    "procedure name hash collision"
                );
                return Err(ReturnCode::InvalidParam);
            }
        }
        table.insert(
            id,
            ProcInfo {
                name: name.to_string(),
                in_proc,
                out_proc,
            },
        );
        trace!(name, id, "registered procedure");
        Ok(id)
    }

    /// Whether a name is registered, and under which id.
    pub fn registered(&self, name: &str) -> (bool, u32) {
        let id = hash_string(name);
        let found = self
            .proc_table
            .read()
            .get(&id)
            .map_or(false, |info| info.name == name);
        (found, if found { id } else { 0 })
    }

    pub(crate) fn proc_info(&self, id: u32) -> Option<ProcInfo> {
        self.proc_table.read().get(&id).cloned()
    }

    /// Draw the next request tag: wraps to 0 past the transport's maximum,
    /// never leaving `[0, max_tag]`.
    fn gen_request_tag(&self) -> Tag {
        loop {
            let current = self.tag.load(Ordering::Relaxed);
            let next = if current == self.max_tag { 0 } else { current + 1 };
            if self
                .tag
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return next;
            }
        }
    }

    /// Encode the input structure into the request's send buffer,
    /// escalating to a registered overflow region when it does not fit.
    fn set_input(
        &self,
        send_buf: &mut [u8],
        header_size: usize,
        id: u32,
        in_struct: Option<&mut dyn Any>,
    ) -> Result<(Option<Vec<u8>>, Option<crate::na::MemHandle>)> {
        let in_struct = match in_struct {
            Some(s) => s,
            None => return Ok((None, None)),
        };
        let info = self.proc_info(id).ok_or(ReturnCode::NoMatch)?;
        let mut proc = Proc::create(&mut send_buf[header_size..], ProcOp::Encode, ProcHash::Crc64);
        if let Some(in_proc) = info.in_proc {
            in_proc(&mut proc, in_struct)?;
        }
        proc.flush()?;
        if !proc.has_extra() {
            return Ok((None, None));
        }
        // Payload outgrew the inline buffer: hand the overflow to the bulk
        // layer so the target can pull it.
        let extra = proc.take_extra_buf();
        let handle = self.bulk.handle_create(&extra, MemAttr::ReadOnly)?;
        debug!(id, extra_size = extra.len(), "input overflowed inline buffer");
        Ok((Some(extra), Some(handle)))
    }

    /// Decode a response buffer into the caller's output slot.
    fn decode_response(&self, state: &mut ReqState, id: u32, mut buf: Vec<u8>) -> Result<()> {
        let header_size = header::response_get_size();
        if buf.len() < header_size {
            return Err(ReturnCode::ProtocolError);
        }
        let response = header::response_decode(&buf[..header_size])?;
        header::response_verify(&response)?;
        if response.return_code != ReturnCode::Success {
            return Err(response.return_code);
        }
        let out = match &state.out_struct {
            Some(out) => out.clone(),
            None => return Ok(()),
        };
        let info = self.proc_info(id).ok_or(ReturnCode::NoMatch)?;
        if let Some(out_proc) = info.out_proc {
            let mut proc = Proc::create(&mut buf[header_size..], ProcOp::Decode, ProcHash::Crc64);
            let mut guard = out.lock();
            out_proc(&mut proc, &mut **guard)?;
            proc.flush()?;
        }
        Ok(())
    }

    /// Initiate a call: encode, pre-post the expected receive, post the
    /// unexpected send, both under one fresh tag.
    pub fn forward(
        &self,
        addr: &Addr,
        id: u32,
        in_struct: Option<&mut dyn Any>,
        out_struct: Option<OutputSlot>,
    ) -> Result<RpcRequest> {
        let send_buf_size = self.na.msg_get_max_unexpected_size();
        let recv_buf_size = self.na.msg_get_max_expected_size();
        let header_size = header::request_get_size(self.na.as_ref());

        let mut send_buf = proc::buf_alloc(send_buf_size);
        let recv_buf = proc::buf_alloc(recv_buf_size);

        // Encode the payload first so the header can carry the overflow
        // handle if one was needed.
        let (extra_send_buf, extra_send_handle) =
            self.set_input(&mut send_buf, header_size, id, in_struct)?;

        let request_header = header::request_init(id, extra_send_handle.as_ref());
        if let Err(e) = header::request_encode(&mut send_buf, &request_header, self.na.as_ref()) {
            if let Some(handle) = extra_send_handle {
                let _ = self.bulk.handle_free(handle);
            }
            return Err(e);
        }

        let send_buf = Arc::new(send_buf);
        let send_done = self.request_class.request();
        let recv_done = self.request_class.request();
        let inner = Arc::new(RequestInner {
            id,
            state: Mutex::new(ReqState {
                send_buf: Some(send_buf.clone()),
                extra_send_buf,
                extra_send_handle,
                out_struct,
                send_error: None,
                recv_error: None,
            }),
            send_request: Mutex::new(Some(send_done.clone())),
            recv_request: Mutex::new(Some(recv_done.clone())),
        });

        let tag = self.gen_request_tag();
        trace!(id, tag, "forwarding request");

        // Pre-post the expected receive for the response.
        let recv_inner = inner.clone();
        let recv_runtime = self.arc()?;
        let recv_op = self.na.msg_recv_expected(
            &self.context,
            Box::new(move |info: CbInfo| {
                let mut state = recv_inner.state.lock();
                // The response implies the target is done with the overflow
                // region; release it and its handle now.
                if let Some(handle) = state.extra_send_handle.take() {
                    let _ = recv_runtime.bulk.handle_free(handle);
                }
                state.extra_send_buf = None;
                match info.result {
                    Ok(()) => {
                        if let CbInfoKind::RecvExpected { buf, actual_size } = info.kind {
                            let mut buf = buf;
                            buf.truncate(actual_size);
                            if let Err(e) =
                                recv_runtime.decode_response(&mut state, recv_inner.id, buf)
                            {
                                state.recv_error = Some(e);
                            }
                        }
                    }
                    Err(e) => state.recv_error = Some(e),
                }
                drop(state);
                recv_done.complete();
            }),
            recv_buf,
            addr,
            tag,
        )?;

        // Post the request itself.
        let send_inner = inner.clone();
        let send_result = self.na.msg_send_unexpected(
            &self.context,
            Box::new(move |info: CbInfo| {
                let mut state = send_inner.state.lock();
                match info.result {
                    // The transport released the buffer; drop our clone.
                    Ok(()) => state.send_buf = None,
                    // Failure leaves the buffer in place for request_free.
                    Err(e) => state.send_error = Some(e),
                }
                drop(state);
                send_done.complete();
            }),
            send_buf,
            addr,
            tag,
        );
        if let Err(e) = send_result {
            error!(id, tag, code = %e, "unexpected send failed to post");
            let _ = self.na.cancel(&self.context, &recv_op);
            let mut state = inner.state.lock();
            if let Some(handle) = state.extra_send_handle.take() {
                let _ = self.bulk.handle_free(handle);
            }
            state.extra_send_buf = None;
            return Err(e);
        }

        Ok(RpcRequest { inner })
    }

    /// Wait for both halves of a request, decaying the timeout across the
    /// pair. Reports `Ok(true)` once both completed successfully; recorded
    /// callback failures surface here.
    pub fn wait(&self, request: &RpcRequest, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;

        let send_future = request.inner.send_request.lock().clone();
        if let Some(future) = send_future {
            let flag = self.request_class.wait(&future, timeout)?;
            if flag {
                *request.inner.send_request.lock() = None;
            }
        }

        let recv_future = request.inner.recv_request.lock().clone();
        if let Some(future) = recv_future {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let flag = self.request_class.wait(&future, remaining)?;
            if flag {
                *request.inner.recv_request.lock() = None;
            }
        }

        let done = request.inner.send_request.lock().is_none()
            && request.inner.recv_request.lock().is_none();
        if done {
            let state = request.inner.state.lock();
            if let Some(e) = state.send_error.or(state.recv_error) {
                return Err(e);
            }
        }
        Ok(done)
    }

    /// Wait on a batch of requests. The full timeout applies to each
    /// request in sequence, matching the engine's historical behavior.
    pub fn wait_all(&self, requests: &[RpcRequest], timeout: Duration) -> Vec<Result<bool>> {
        requests
            .iter()
            .map(|request| self.wait(request, timeout))
            .collect()
    }

    /// Release a completed, consumed request. Runs the output proc in Free
    /// mode to release heap memory decoded into the caller's structure.
    pub fn request_free(&self, request: RpcRequest) -> Result<()> {
        if request.inner.send_request.lock().is_some()
            || request.inner.recv_request.lock().is_some()
        {
            error!("attempted to free an uncompleted request");
            return Err(ReturnCode::Fail);
        }
        let mut state = request.inner.state.lock();
        if let Some(out) = state.out_struct.take() {
            if let Some(info) = self.proc_info(request.inner.id) {
                if let Some(out_proc) = info.out_proc {
                    let mut empty: [u8; 0] = [];
                    let mut proc = Proc::create(&mut empty, ProcOp::Free, ProcHash::NoHash);
                    let mut guard = out.lock();
                    out_proc(&mut proc, &mut **guard)?;
                }
            }
        }
        // Any buffer a failed send left behind is released here.
        state.send_buf = None;
        if let Some(handle) = state.extra_send_handle.take() {
            let _ = self.bulk.handle_free(handle);
        }
        state.extra_send_buf = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Thin process-global accessor for backwards-compatible call sites.
// ---------------------------------------------------------------------------

static RUNTIME: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);

pub(crate) fn global_runtime() -> Result<Arc<Runtime>> {
    RUNTIME.lock().clone().ok_or(ReturnCode::Fail)
}

fn runtime() -> Result<Arc<Runtime>> {
    global_runtime()
}

/// Wrap a concrete output structure into the shared slot `forward` expects.
pub fn output_slot<T: Any + Send>(value: T) -> OutputSlot {
    Arc::new(Mutex::new(Box::new(value) as Box<dyn Any + Send>))
}

/// Initialize the process-global runtime over an initialized transport.
///
/// The global bulk engine is initialized here if the application has not
/// done so already; in that case it is finalized again by [`finalize`].
pub fn init(na: Arc<dyn NaClass>) -> Result<()> {
    let mut slot = RUNTIME.lock();
    if slot.is_some() {
        error!("already initialized");
        return Err(ReturnCode::Fail);
    }
    let context = na.context_create()?;
    let bulk_internal = !bulk::initialized();
    if bulk_internal {
        bulk::init(na.clone(), context.clone())?;
    }
    let engine = bulk::engine()?;
    *slot = Some(Runtime::build(na, context, engine, bulk_internal)?);
    Ok(())
}

/// Tear down the process-global runtime.
pub fn finalize() -> Result<()> {
    let runtime = RUNTIME.lock().take().ok_or_else(|| {
        error!("already finalized");
        ReturnCode::Fail
    })?;
    runtime.finalize()
}

/// Whether the process-global runtime is initialized, and over which class.
pub fn initialized() -> (bool, Option<Arc<dyn NaClass>>) {
    match RUNTIME.lock().as_ref() {
        Some(runtime) => (true, Some(runtime.na.clone())),
        None => (false, None),
    }
}

/// Register a procedure with the process-global runtime.
pub fn register(name: &str, in_proc: Option<ProcCb>, out_proc: Option<ProcCb>) -> Result<u32> {
    runtime()?.register(name, in_proc, out_proc)
}

/// Query a registration on the process-global runtime.
pub fn registered(name: &str) -> Result<(bool, u32)> {
    Ok(runtime()?.registered(name))
}

/// Forward a call through the process-global runtime.
pub fn forward(
    addr: &Addr,
    id: u32,
    in_struct: Option<&mut dyn Any>,
    out_struct: Option<OutputSlot>,
) -> Result<RpcRequest> {
    runtime()?.forward(addr, id, in_struct, out_struct)
}

/// Wait on a request through the process-global runtime.
pub fn wait(request: &RpcRequest, timeout: Duration) -> Result<bool> {
    runtime()?.wait(request, timeout)
}

/// Wait on a batch of requests through the process-global runtime.
pub fn wait_all(requests: &[RpcRequest], timeout: Duration) -> Result<Vec<Result<bool>>> {
    Ok(runtime()?.wait_all(requests, timeout))
}

/// Free a request through the process-global runtime.
pub fn request_free(request: RpcRequest) -> Result<()> {
    runtime()?.request_free(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::na;

    fn test_runtime() -> Arc<Runtime> {
        let class = na::initialize("tcp", None, false).unwrap();
        Runtime::init(class).unwrap()
    }

    #[test]
    fn test_hash_string_is_stable() {
        // djb2 reference values.
        assert_eq!(hash_string(""), 5381);
        assert_eq!(hash_string("a"), 5381u32.wrapping_mul(33).wrapping_add(97));
        assert_eq!(hash_string("noop"), hash_string("noop"));
        assert_ne!(hash_string("noop"), hash_string("echo"));
    }

    #[test]
    fn test_register_and_query() {
        let runtime = test_runtime();
        let id = runtime.register("noop", None, None).unwrap();
        assert_eq!(id, hash_string("noop"));
        assert_eq!(runtime.registered("noop"), (true, id));
        assert_eq!(runtime.registered("missing"), (false, 0));
    }

    #[test]
    fn test_same_name_reregistration_replaces() {
        let runtime = test_runtime();
        let first = runtime.register("echo", None, None).unwrap();
        let second = runtime.register("echo", None, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_colliding_distinct_name_is_rejected() {
        let runtime = test_runtime();
        // Plant an entry under the hash of a *different* name, as a true
        // hash collision would.
        let id = hash_string("collider");
        runtime.proc_table.write().insert(
            id,
            ProcInfo {
                name: "original".to_string(),
                in_proc: None,
                out_proc: None,
            },
        );
        assert_eq!(
            runtime.register("collider", None, None).unwrap_err(),
            ReturnCode::InvalidParam
        );
    }

    #[test]
    fn test_tag_wraps_at_max() {
        let runtime = test_runtime();
        let max = runtime.na.msg_get_max_tag();
        runtime.tag.store(max - 1, Ordering::Relaxed);
        assert_eq!(runtime.gen_request_tag(), max);
        assert_eq!(runtime.gen_request_tag(), 0);
        assert_eq!(runtime.gen_request_tag(), 1);
    }

    #[test]
    fn test_tags_stay_in_range() {
        let runtime = test_runtime();
        let max = runtime.na.msg_get_max_tag();
        runtime.tag.store(max - 2, Ordering::Relaxed);
        for _ in 0..8 {
            assert!(runtime.gen_request_tag() <= max);
        }
    }
}
