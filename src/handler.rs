//! # Request Handler
//!
//! The server half of the call lifecycle, symmetric to the client engine in
//! `rpc`: a handler registry keyed by procedure id, a processing loop that
//! keeps one unexpected receive posted, and a per-request [`ServerHandle`]
//! through which a handler retrieves its decoded input and posts the
//! response.
//!
//! Processing is explicit, like everything else in the runtime: a server
//! thread calls [`Runtime::handler_process`] in a loop; each call drives
//! progress until one request has been dispatched or the timeout passes.
//! Input payloads that overflowed the inline buffer are pulled from the
//! caller's registered region before decoding; the response travels as an
//! expected send back to the request's source under the request's tag.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::bulk::TransferDirection;
use crate::error::{Result, ReturnCode};
use crate::header;
use crate::na::{Addr, CbInfoKind, MemAttr, MemHandle, OpRef, Tag};
use crate::proc::{self, Proc, ProcHash, ProcOp};
use crate::rpc::{hash_string, Runtime};

/// Bound on one progress call inside the processing loop.
const PROGRESS_SLICE: Duration = Duration::from_millis(100);

/// Budget for pulling an overflowed input payload from its source.
const BULK_PULL_TIMEOUT: Duration = Duration::from_secs(30);

type HandlerCb = dyn Fn(&mut ServerHandle) -> Result<()> + Send + Sync;

/// A request received but not yet dispatched.
struct IncomingRequest {
    buf: Vec<u8>,
    actual_size: usize,
    source: Addr,
    tag: Tag,
}

/// Server-mirror state carried by the runtime.
#[derive(Default)]
pub(crate) struct HandlerState {
    handlers: RwLock<HashMap<u32, Arc<HandlerCb>>>,
    posted: Mutex<Option<OpRef>>,
    ready: Mutex<VecDeque<IncomingRequest>>,
}

impl HandlerState {
    /// Cancel the posted receive and drop undispatched requests.
    pub(crate) fn shutdown(&self, runtime: &Runtime) {
        let posted = self.posted.lock().take();
        if let Some(op) = posted {
            let _ = runtime.na().cancel(runtime.context(), &op);
        }
        self.ready.lock().clear();
    }
}

/// Per-request context handed to a registered handler.
pub struct ServerHandle {
    runtime: Arc<Runtime>,
    source: Addr,
    tag: Tag,
    id: u32,
    request_buf: Vec<u8>,
    header_size: usize,
    extra_handle: Option<MemHandle>,
    responded: bool,
}

impl ServerHandle {
    /// Procedure id of the request.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Address the request came from.
    pub fn source(&self) -> &Addr {
        &self.source
    }

    /// Decode the request's input structure into `out`.
    ///
    /// If the caller escalated its payload to a bulk region, the region is
    /// pulled here before decoding, so by the time this returns the caller's
    /// overflow buffer is no longer needed.
    pub fn get_input(&mut self, out: &mut dyn Any) -> Result<()> {
        let info = self.runtime.proc_info(self.id).ok_or(ReturnCode::NoMatch)?;
        let extra = match &self.extra_handle {
            Some(remote) => {
                let length = remote.len();
                let pull_buf = proc::buf_alloc(length as usize);
                let local = self
                    .runtime
                    .bulk()
                    .handle_create(&pull_buf, MemAttr::ReadWrite)?;
                debug!(id = self.id, length, "pulling overflowed input");
                let pulled = self.runtime.bulk().transfer_wait(
                    TransferDirection::Pull,
                    &local,
                    0,
                    remote,
                    0,
                    length,
                    &self.source,
                    BULK_PULL_TIMEOUT,
                );
                self.runtime.bulk().handle_free(local)?;
                pulled?;
                Some(pull_buf)
            }
            None => None,
        };

        let payload = &mut self.request_buf[self.header_size..];
        let mut proc = match extra {
            Some(extra) => Proc::create_with_extra(payload, extra, ProcOp::Decode, ProcHash::Crc64),
            None => Proc::create(payload, ProcOp::Decode, ProcHash::Crc64),
        };
        if let Some(in_proc) = info.in_proc {
            in_proc(&mut proc, out)?;
        }
        proc.flush()
    }

    /// Encode and post the response for this request.
    pub fn start_response(&mut self, out_struct: Option<&mut dyn Any>) -> Result<()> {
        self.respond(ReturnCode::Success, out_struct)
    }

    fn respond(&mut self, code: ReturnCode, out_struct: Option<&mut dyn Any>) -> Result<()> {
        if self.responded {
            return Err(ReturnCode::ProtocolError);
        }
        let mut buf = proc::buf_alloc(self.runtime.na().msg_get_max_expected_size());
        let header_size = header::response_get_size();
        if let Some(out) = out_struct {
            let info = self.runtime.proc_info(self.id).ok_or(ReturnCode::NoMatch)?;
            if let Some(out_proc) = info.out_proc {
                let mut proc =
                    Proc::create(&mut buf[header_size..], ProcOp::Encode, ProcHash::Crc64);
                out_proc(&mut proc, out)?;
                proc.flush()?;
                // Responses have no overflow path; outputs must fit inline.
                if proc.has_extra() {
                    return Err(ReturnCode::SizeError);
                }
            }
        }
        header::response_encode(&mut buf, &header::response_init(code))?;
        self.runtime.na().msg_send_expected(
            self.runtime.context(),
            Box::new(|_| {}),
            Arc::new(buf),
            &self.source,
            self.tag,
        )?;
        self.responded = true;
        trace!(id = self.id, tag = self.tag, code = %code, "response posted");
        Ok(())
    }
}

impl Runtime {
    /// Register a handler for a named procedure. The procedure's proc pair
    /// is registered separately (usually by the same call site that
    /// registers it on the client side).
    pub fn register_handler<F>(&self, name: &str, handler: F) -> Result<u32>
    where
        F: Fn(&mut ServerHandle) -> Result<()> + Send + Sync + 'static,
    {
        let id = hash_string(name);
        self.handler_state
            .handlers
            .write()
            .insert(id, Arc::new(handler));
        trace!(name, id, "registered handler");
        Ok(id)
    }

    /// Keep one unexpected receive posted for incoming requests.
    fn handler_post_recv(&self) -> Result<()> {
        let mut posted = self.handler_state.posted.lock();
        if posted.is_some() {
            return Ok(());
        }
        let buf = proc::buf_alloc(self.na().msg_get_max_unexpected_size());
        let weak = self.weak_self.clone();
        let op = self.na().msg_recv_unexpected(
            self.context(),
            Box::new(move |info| {
                let runtime = match weak.upgrade() {
                    Some(r) => r,
                    None => return,
                };
                *runtime.handler_state.posted.lock() = None;
                match info.result {
                    Ok(()) => {
                        if let CbInfoKind::RecvUnexpected {
                            buf,
                            actual_size,
                            source,
                            tag,
                        } = info.kind
                        {
                            runtime
                                .handler_state
                                .ready
                                .lock()
                                .push_back(IncomingRequest {
                                    buf,
                                    actual_size,
                                    source,
                                    tag,
                                });
                        }
                    }
                    // The cancel path at shutdown completes with FAIL.
                    Err(ReturnCode::Fail) => {}
                    Err(e) => warn!(code = %e, "request receive failed"),
                }
            }),
            buf,
        )?;
        *posted = Some(op);
        Ok(())
    }

    /// Decode one received request and invoke its handler.
    fn handler_dispatch(&self, incoming: IncomingRequest) -> Result<()> {
        let header_size = header::request_get_size(self.na().as_ref());
        if incoming.actual_size < header_size {
            warn!(size = incoming.actual_size, "runt request message");
            return Err(ReturnCode::ProtocolError);
        }
        let mut buf = incoming.buf;
        buf.truncate(incoming.actual_size);
        let request_header = header::request_decode(&buf[..header_size], self.na().as_ref())?;

        let handler = self
            .handler_state
            .handlers
            .read()
            .get(&request_header.id)
            .cloned();
        let mut handle = ServerHandle {
            runtime: self.arc()?,
            source: incoming.source,
            tag: incoming.tag,
            id: request_header.id,
            request_buf: buf,
            header_size,
            extra_handle: request_header.extra_handle,
            responded: false,
        };

        match handler {
            Some(callback) => {
                if let Err(e) = callback(&mut handle) {
                    warn!(id = handle.id, code = %e, "handler failed");
                    if !handle.responded {
                        handle.respond(e, None)?;
                    }
                } else if !handle.responded {
                    warn!(id = handle.id, "handler returned without responding");
                    handle.respond(ReturnCode::Fail, None)?;
                }
            }
            None => {
                warn!(id = handle.id, "no handler registered for procedure");
                handle.respond(ReturnCode::NoMatch, None)?;
            }
        }
        Ok(())
    }

    /// Drive the server side until one request has been dispatched or the
    /// timeout passes.
    pub fn handler_process(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.handler_post_recv()?;
            let incoming = self.handler_state.ready.lock().pop_front();
            if let Some(incoming) = incoming {
                return self.handler_dispatch(incoming);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReturnCode::Timeout);
            }
            let slice = (deadline - now).min(PROGRESS_SLICE);
            match self.na().progress(self.context(), slice) {
                Ok(()) | Err(ReturnCode::Timeout) => {}
                Err(e) => return Err(e),
            }
            self.context().trigger(Duration::ZERO, u32::MAX)?;
        }
    }
}

/// Register a handler with the process-global runtime.
pub fn register<F>(name: &str, handler: F) -> Result<u32>
where
    F: Fn(&mut ServerHandle) -> Result<()> + Send + Sync + 'static,
{
    crate::rpc::global_runtime()?.register_handler(name, handler)
}

/// Process one request on the process-global runtime.
pub fn process(timeout: Duration) -> Result<()> {
    crate::rpc::global_runtime()?.handler_process(timeout)
}
