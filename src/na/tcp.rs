//! # TCP Transport
//!
//! Connection-oriented transport implementing the [`NaClass`] capability set
//! over non-blocking TCP streams. It provides the full message taxonomy
//! (unexpected and expected short messages), registered-memory put/get, and
//! the explicit progress loop.
//!
//! ## Wire Protocol
//!
//! The byte stream is delimited into frames:
//!
//! ```text
//! [u32 LE frame length] [u32 LE framing word {expect:1 (LSB), tag:31}] [payload]
//! ```
//!
//! The frame length covers the framing word and the payload. Short-message
//! payloads are capped at 8 KiB; one-sided transfers travel as larger frames
//! under reserved tags above `max_tag` and never enter the short-message
//! matching paths.
//!
//! ## One-Sided Emulation
//!
//! Put and get are emulated over the messaging layer: the initiator sends a
//! transfer descriptor (remote base, offset, length, transfer id) under a
//! reserved tag, the target validates the descriptor against its
//! registration table and answers with an ack (put) or the data (get). The
//! initiator completes the operation when the answer arrives. Loopback
//! transfers shortcut to a validated copy between local regions.
//!
//! ## Progress
//!
//! `progress` polls, in order: pending inbound connections, readable bytes
//! (frame reassembly and dispatch), and writable backlogs (send completion).
//! Callbacks never run inside the poll; completions are staged on the
//! context queue and fire at `trigger` time.

use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use tracing::{debug, error, trace, warn};

use super::{
    Addr, Callback, CbInfo, CbInfoKind, EarlyMsg, MemAttr, MemHandle, NaClass, NaContext, Op,
    OpRef, OpState, OpType, Tag,
};
use crate::error::{Result, ReturnCode};

/// Protocol selector for this transport.
pub const PROTOCOL_NAME: &str = "tcp";

/// Short-message payload cap (unexpected and expected).
const MAX_MSG_SIZE: usize = 8192;

/// Largest application tag; everything above is transport-internal.
pub(crate) const MAX_TAG: Tag = (1 << 30) - 1;

// Reserved tags for one-sided emulation over the messaging layer.
const RMA_PUT_TAG: Tag = MAX_TAG + 1;
const RMA_GET_TAG: Tag = MAX_TAG + 2;
const RMA_ACK_TAG: Tag = MAX_TAG + 3;
const RMA_DATA_TAG: Tag = MAX_TAG + 4;

/// Transfer descriptor: remote base, remote offset, length, transfer id.
const RMA_DESC_SIZE: usize = 32;

/// Transfer answer prefix: transfer id, status.
const RMA_ANSWER_SIZE: usize = 12;

/// Upper bound on a single frame; larger lengths indicate stream corruption.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn frame_word(expect: bool, tag: Tag) -> u32 {
    (tag << 1) | expect as u32
}

fn frame_expect(word: u32) -> bool {
    word & 1 == 1
}

fn frame_tag(word: u32) -> Tag {
    word >> 1
}

/// A queued outbound frame; `op` (if any) completes when the last byte of
/// the frame reaches the socket.
struct OutChunk {
    data: Vec<u8>,
    written: usize,
    op: Option<OpRef>,
}

struct Conn {
    stream: TcpStream,
    addr: Addr,
    inbox: Vec<u8>,
    outbox: VecDeque<OutChunk>,
    closed: bool,
}

/// A registered memory region. The registration table is the only place raw
/// pointers are dereferenced; every access is bounds-checked against it.
struct Region {
    ptr: *mut u8,
    len: u64,
    attr: MemAttr,
}

// Regions reference caller-owned memory that the caller keeps valid for the
// registration lifetime; access is serialized through the table mutex.
unsafe impl Send for Region {}

struct UnexpectedMsg {
    data: Vec<u8>,
    source: Addr,
    tag: Tag,
}

/// TCP endpoint implementing [`NaClass`].
pub struct TcpClass {
    listener: Option<TcpListener>,
    self_uri: String,
    self_addr: Addr,
    conns: Mutex<Vec<Option<Conn>>>,
    /// Unexpected payloads buffered while no receive is posted, FIFO.
    unexpected_msg_queue: Mutex<VecDeque<UnexpectedMsg>>,
    /// Posted unexpected receives awaiting a payload, FIFO.
    unexpected_op_queue: Mutex<VecDeque<OpRef>>,
    /// Reserved (kept for matching-path diagnostics).
    #[allow(dead_code)]
    test_unexpected_mutex: Mutex<()>,
    regions: Mutex<HashMap<u64, Region>>,
    rma_pending: Mutex<HashMap<u64, OpRef>>,
    next_xfer_id: AtomicU64,
    /// Serializes poll iterations; progress may be called from any thread.
    progress_lock: Mutex<()>,
}

impl TcpClass {
    /// Create an endpoint. A local listener is always bound (ephemeral port
    /// when `listen_addr` is `None`) so the endpoint has a routable URI;
    /// `listen` only controls whether inbound connections are expected.
    pub fn initialize(listen_addr: Option<&str>, listen: bool) -> Result<TcpClass> {
        let bind = listen_addr.unwrap_or("127.0.0.1:0");
        let bind_addr: SocketAddr = bind.parse().map_err(|_| {
            error!(addr = bind, "invalid listen address");
            ReturnCode::InvalidParam
        })?;

        let socket = Socket::new(Domain::for_address(bind_addr), Type::STREAM, None)
            .map_err(io_error("socket"))?;
        socket.set_reuse_address(true).map_err(io_error("reuse"))?;
        socket.bind(&bind_addr.into()).map_err(io_error("bind"))?;
        socket.listen(128).map_err(io_error("listen"))?;
        socket.set_nonblocking(true).map_err(io_error("nonblocking"))?;
        let listener: TcpListener = socket.into();

        let local = listener.local_addr().map_err(io_error("local_addr"))?;
        let self_uri = format!("tcp://{}", local);
        let self_addr = Addr::new(false, true);
        *self_addr.0.uri.lock() = Some(self_uri.clone());
        debug!(uri = %self_uri, listen, "opened endpoint");

        Ok(TcpClass {
            listener: Some(listener),
            self_uri,
            self_addr,
            conns: Mutex::new(Vec::new()),
            unexpected_msg_queue: Mutex::new(VecDeque::new()),
            unexpected_op_queue: Mutex::new(VecDeque::new()),
            test_unexpected_mutex: Mutex::new(()),
            regions: Mutex::new(HashMap::new()),
            rma_pending: Mutex::new(HashMap::new()),
            next_xfer_id: AtomicU64::new(1),
            progress_lock: Mutex::new(()),
        })
    }

    /// URI of this endpoint.
    pub fn uri(&self) -> &str {
        &self.self_uri
    }

    fn insert_conn(&self, conn: Conn) -> usize {
        let mut conns = self.conns.lock();
        for (slot, entry) in conns.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(conn);
                return slot;
            }
        }
        conns.push(Some(conn));
        conns.len() - 1
    }

    fn conn_slot(&self, addr: &Addr) -> Result<usize> {
        addr.0.conn.lock().ok_or(ReturnCode::ProtocolError)
    }

    fn build_frame(word: u32, parts: &[&[u8]]) -> Vec<u8> {
        let payload_len: usize = parts.iter().map(|p| p.len()).sum();
        let frame_len = 4 + payload_len;
        let mut frame = Vec::with_capacity(4 + frame_len);
        frame.extend_from_slice(&(frame_len as u32).to_le_bytes());
        frame.extend_from_slice(&word.to_le_bytes());
        for part in parts {
            frame.extend_from_slice(part);
        }
        frame
    }

    /// Queue a frame on a connection and flush opportunistically. A fully
    /// flushed frame completes its send operation right away (through the
    /// completion queue, like any other completion).
    fn post_frame(
        &self,
        context: &Arc<NaContext>,
        slot: usize,
        frame: Vec<u8>,
        op: Option<OpRef>,
    ) -> Result<()> {
        let mut done = Vec::new();
        {
            let mut conns = self.conns.lock();
            let conn = conns
                .get_mut(slot)
                .and_then(|c| c.as_mut())
                .ok_or(ReturnCode::ProtocolError)?;
            if conn.closed {
                return Err(ReturnCode::ProtocolError);
            }
            conn.outbox.push_back(OutChunk {
                data: frame,
                written: 0,
                op,
            });
            Self::flush_conn(conn, &mut done);
        }
        for (op, result) in done {
            self.complete_send(context, &op, result);
        }
        Ok(())
    }

    /// Drain a connection's outbox as far as the socket allows, collecting
    /// the operations whose frames finished (or failed).
    fn flush_conn(conn: &mut Conn, done: &mut Vec<(OpRef, Result<()>)>) {
        while let Some(front) = conn.outbox.front_mut() {
            match conn.stream.write(&front.data[front.written..]) {
                Ok(n) => {
                    front.written += n;
                    if front.written == front.data.len() {
                        let chunk = conn.outbox.pop_front().expect("front exists");
                        if let Some(op) = chunk.op {
                            done.push((op, Ok(())));
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "send failed, closing connection");
                    conn.closed = true;
                    while let Some(chunk) = conn.outbox.pop_front() {
                        if let Some(op) = chunk.op {
                            done.push((op, Err(ReturnCode::ProtocolError)));
                        }
                    }
                    break;
                }
            }
        }
    }

    fn complete_send(&self, context: &Arc<NaContext>, op: &OpRef, result: Result<()>) {
        let kind = match op.ty {
            OpType::SendExpected => CbInfoKind::SendExpected,
            _ => CbInfoKind::SendUnexpected,
        };
        context.complete(op, CbInfo { result, kind });
    }

    fn unexpected_op_pop(&self) -> Option<OpRef> {
        self.unexpected_op_queue.lock().pop_front()
    }

    /// Hand an unexpected payload to a posted receive. Truncation is
    /// permitted; the shorter length is reported.
    fn deliver_unexpected(
        &self,
        context: &Arc<NaContext>,
        op: OpRef,
        data: &[u8],
        source: Addr,
        tag: Tag,
    ) {
        let mut buf = match &mut *op.state.lock() {
            OpState::RecvUnexpected { buf } => buf.take().expect("buffer posted"),
            _ => unreachable!("unexpected op with wrong state"),
        };
        let actual_size = buf.len().min(data.len());
        buf[..actual_size].copy_from_slice(&data[..actual_size]);
        context.complete(
            &op,
            CbInfo {
                result: Ok(()),
                kind: CbInfoKind::RecvUnexpected {
                    buf,
                    actual_size,
                    source,
                    tag,
                },
            },
        );
    }

    /// Hand an expected payload to a matched receive. A payload longer than
    /// the posted buffer truncates, reports the shorter length, and
    /// completes with `SIZE_ERROR`; the message is consumed either way.
    fn deliver_expected(&self, context: &Arc<NaContext>, op: OpRef, data: &[u8]) {
        let mut buf = match &mut *op.state.lock() {
            OpState::RecvExpected { buf, .. } => buf.take().expect("buffer posted"),
            _ => unreachable!("expected op with wrong state"),
        };
        let actual_size = buf.len().min(data.len());
        buf[..actual_size].copy_from_slice(&data[..actual_size]);
        let result = if data.len() > actual_size {
            Err(ReturnCode::SizeError)
        } else {
            Ok(())
        };
        context.complete(
            &op,
            CbInfo {
                result,
                kind: CbInfoKind::RecvExpected { buf, actual_size },
            },
        );
    }

    /// Match an inbound unexpected payload process-wide.
    fn route_unexpected(&self, context: &Arc<NaContext>, data: &[u8], source: Addr, tag: Tag) {
        match self.unexpected_op_pop() {
            Some(op) => self.deliver_unexpected(context, op, data, source, tag),
            None => {
                trace!(tag, len = data.len(), "buffering unexpected message");
                self.unexpected_msg_queue.lock().push_back(UnexpectedMsg {
                    data: data.to_vec(),
                    source,
                    tag,
                });
            }
        }
    }

    /// Match an inbound expected payload against the address's posted
    /// receives, or stage it on the early list.
    fn route_expected(&self, context: &Arc<NaContext>, addr: &Addr, data: &[u8], tag: Tag) {
        let matched = {
            let mut queues = addr.0.queues.lock();
            let pos = queues.rxs.iter().position(|op| {
                matches!(&*op.state.lock(), OpState::RecvExpected { tag: t, .. } if *t == tag)
            });
            match pos {
                Some(pos) => queues.rxs.remove(pos),
                None => {
                    trace!(tag, len = data.len(), "staging early expected message");
                    queues.early.push_back(EarlyMsg {
                        tag,
                        data: data.to_vec(),
                    });
                    None
                }
            }
        };
        if let Some(op) = matched {
            self.deliver_expected(context, op, data);
        }
    }

    fn region_read(&self, base: u64, offset: u64, length: u64) -> Result<Vec<u8>> {
        let regions = self.regions.lock();
        let region = regions.get(&base).ok_or(ReturnCode::InvalidParam)?;
        if offset.checked_add(length).map_or(true, |end| end > region.len) {
            return Err(ReturnCode::InvalidParam);
        }
        let mut out = vec![0u8; length as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(
                region.ptr.add(offset as usize),
                out.as_mut_ptr(),
                length as usize,
            );
        }
        Ok(out)
    }

    fn region_write(&self, base: u64, offset: u64, data: &[u8], require_rw: bool) -> Result<()> {
        let regions = self.regions.lock();
        let region = regions.get(&base).ok_or(ReturnCode::InvalidParam)?;
        if require_rw && region.attr != MemAttr::ReadWrite {
            return Err(ReturnCode::PermissionError);
        }
        let length = data.len() as u64;
        if offset.checked_add(length).map_or(true, |end| end > region.len) {
            return Err(ReturnCode::InvalidParam);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                region.ptr.add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// One poll iteration: accept, read + dispatch frames, flush writers.
    /// Returns whether any event was handled.
    fn poll_once(&self, context: &Arc<NaContext>) -> Result<bool> {
        let mut progressed = false;

        // Inbound connections (CONNECT_REQUEST / ACCEPT).
        if let Some(listener) = &self.listener {
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream
                            .set_nodelay(true)
                            .and_then(|_| stream.set_nonblocking(true))
                        {
                            warn!(error = %e, "failed to configure accepted stream");
                            continue;
                        }
                        let addr = Addr::new(true, false);
                        *addr.0.uri.lock() = Some(format!("tcp://{}", peer));
                        let slot = self.insert_conn(Conn {
                            stream,
                            addr: addr.clone(),
                            inbox: Vec::new(),
                            outbox: VecDeque::new(),
                            closed: false,
                        });
                        *addr.0.conn.lock() = Some(slot);
                        debug!(peer = %peer, slot, "accepted connection");
                        progressed = true;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        }

        // Readable bytes and writable backlogs.
        let mut frames: Vec<(Addr, u32, Vec<u8>)> = Vec::new();
        let mut sends_done: Vec<(OpRef, Result<()>)> = Vec::new();
        let mut dead_rxs: Vec<OpRef> = Vec::new();
        {
            let mut conns = self.conns.lock();
            for entry in conns.iter_mut() {
                let conn = match entry {
                    Some(c) if !c.closed => c,
                    _ => continue,
                };

                let mut tmp = [0u8; 16384];
                loop {
                    match conn.stream.read(&mut tmp) {
                        Ok(0) => {
                            debug!(addr = ?conn.addr, "peer closed connection");
                            conn.closed = true;
                            break;
                        }
                        Ok(n) => conn.inbox.extend_from_slice(&tmp[..n]),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(error = %e, "recv failed, closing connection");
                            conn.closed = true;
                            break;
                        }
                    }
                }

                loop {
                    if conn.inbox.len() < 4 {
                        break;
                    }
                    let frame_len =
                        u32::from_le_bytes(conn.inbox[0..4].try_into().expect("4 bytes")) as usize;
                    if !(4..=MAX_FRAME_SIZE).contains(&frame_len) {
                        error!(frame_len, "bad frame length, closing connection");
                        conn.closed = true;
                        break;
                    }
                    if conn.inbox.len() < 4 + frame_len {
                        break;
                    }
                    let word = u32::from_le_bytes(conn.inbox[4..8].try_into().expect("4 bytes"));
                    let payload = conn.inbox[8..4 + frame_len].to_vec();
                    conn.inbox.drain(..4 + frame_len);
                    frames.push((conn.addr.clone(), word, payload));
                }

                Self::flush_conn(conn, &mut sends_done);
            }

            // Reap closed connections; their posted receives fail now.
            for entry in conns.iter_mut() {
                let closed = matches!(entry, Some(c) if c.closed);
                if closed {
                    let conn = entry.take().expect("checked above");
                    *conn.addr.0.conn.lock() = None;
                    let mut queues = conn.addr.0.queues.lock();
                    dead_rxs.extend(queues.rxs.drain(..));
                    progressed = true;
                }
            }
        }

        for (op, result) in sends_done {
            self.complete_send(context, &op, result);
            progressed = true;
        }
        for op in dead_rxs {
            self.deliver_failed_recv(context, op, ReturnCode::ProtocolError);
        }
        for (source, word, payload) in frames {
            self.handle_frame(context, source, word, payload);
            progressed = true;
        }

        Ok(progressed)
    }

    fn deliver_failed_recv(&self, context: &Arc<NaContext>, op: OpRef, code: ReturnCode) {
        let info = match &mut *op.state.lock() {
            OpState::RecvExpected { buf, .. } => CbInfo {
                result: Err(code),
                kind: CbInfoKind::RecvExpected {
                    buf: buf.take().unwrap_or_default(),
                    actual_size: 0,
                },
            },
            OpState::RecvUnexpected { buf } => CbInfo {
                result: Err(code),
                kind: CbInfoKind::RecvUnexpected {
                    buf: buf.take().unwrap_or_default(),
                    actual_size: 0,
                    source: self.self_addr.clone(),
                    tag: 0,
                },
            },
            _ => return,
        };
        context.complete(&op, info);
    }

    /// Demultiplex one inbound frame (the RECV event path).
    fn handle_frame(&self, context: &Arc<NaContext>, source: Addr, word: u32, payload: Vec<u8>) {
        let tag = frame_tag(word);
        if frame_expect(word) {
            if tag > MAX_TAG {
                self.handle_rma(context, source, tag, payload);
            } else {
                self.route_expected(context, &source, &payload, tag);
            }
        } else {
            self.route_unexpected(context, &payload, source, tag);
        }
    }

    /// Serve or finish a one-sided transfer carried over reserved tags.
    fn handle_rma(&self, context: &Arc<NaContext>, source: Addr, tag: Tag, payload: Vec<u8>) {
        match tag {
            RMA_PUT_TAG => {
                if payload.len() < RMA_DESC_SIZE {
                    warn!("short put request, dropping");
                    return;
                }
                let (base, offset, length, xfer_id) = parse_rma_desc(&payload);
                let data = &payload[RMA_DESC_SIZE..];
                let status = if data.len() as u64 != length {
                    Err(ReturnCode::ProtocolError)
                } else {
                    self.region_write(base, offset, data, true)
                };
                if let Err(code) = &status {
                    warn!(code = %code, base, "rejecting put request");
                }
                self.answer_rma(context, &source, RMA_ACK_TAG, xfer_id, status, &[]);
            }
            RMA_GET_TAG => {
                if payload.len() < RMA_DESC_SIZE {
                    warn!("short get request, dropping");
                    return;
                }
                let (base, offset, length, xfer_id) = parse_rma_desc(&payload);
                match self.region_read(base, offset, length) {
                    Ok(data) => {
                        self.answer_rma(context, &source, RMA_DATA_TAG, xfer_id, Ok(()), &data)
                    }
                    Err(code) => {
                        warn!(code = %code, base, "rejecting get request");
                        self.answer_rma(context, &source, RMA_DATA_TAG, xfer_id, Err(code), &[]);
                    }
                }
            }
            RMA_ACK_TAG => {
                if payload.len() < RMA_ANSWER_SIZE {
                    return;
                }
                let (xfer_id, status) = parse_rma_answer(&payload);
                if let Some(op) = self.rma_pending.lock().remove(&xfer_id) {
                    debug_assert!(matches!(
                        &*op.state.lock(),
                        OpState::Put { xfer_id: id } if *id == xfer_id
                    ));
                    context.complete(
                        &op,
                        CbInfo {
                            result: status,
                            kind: CbInfoKind::Put,
                        },
                    );
                }
            }
            RMA_DATA_TAG => {
                if payload.len() < RMA_ANSWER_SIZE {
                    return;
                }
                let (xfer_id, status) = parse_rma_answer(&payload);
                let op = match self.rma_pending.lock().remove(&xfer_id) {
                    Some(op) => op,
                    None => return,
                };
                let result = status.and_then(|_| {
                    let (local_base, local_offset, length) = match &*op.state.lock() {
                        OpState::Get {
                            xfer_id: id,
                            local_base,
                            local_offset,
                            length,
                        } if *id == xfer_id => (*local_base, *local_offset, *length),
                        _ => return Err(ReturnCode::ProtocolError),
                    };
                    let data = &payload[RMA_ANSWER_SIZE..];
                    if data.len() as u64 != length {
                        return Err(ReturnCode::ProtocolError);
                    }
                    self.region_write(local_base, local_offset, data, false)
                });
                context.complete(
                    &op,
                    CbInfo {
                        result,
                        kind: CbInfoKind::Get,
                    },
                );
            }
            _ => warn!(tag, "unhandled reserved tag"),
        }
    }

    fn answer_rma(
        &self,
        context: &Arc<NaContext>,
        dest: &Addr,
        tag: Tag,
        xfer_id: u64,
        status: Result<()>,
        data: &[u8],
    ) {
        let code = match status {
            Ok(()) => ReturnCode::Success,
            Err(c) => c,
        };
        let frame = Self::build_frame(
            frame_word(true, tag),
            &[&xfer_id.to_le_bytes(), &code.to_u32().to_le_bytes(), data],
        );
        let slot = match self.conn_slot(dest) {
            Ok(slot) => slot,
            Err(_) => {
                warn!("cannot answer transfer, peer has no connection");
                return;
            }
        };
        if let Err(e) = self.post_frame(context, slot, frame, None) {
            warn!(code = %e, "failed to answer transfer request");
        }
    }
}

fn parse_rma_desc(payload: &[u8]) -> (u64, u64, u64, u64) {
    let field = |i: usize| u64::from_le_bytes(payload[i * 8..i * 8 + 8].try_into().expect("8"));
    (field(0), field(1), field(2), field(3))
}

fn parse_rma_answer(payload: &[u8]) -> (u64, Result<()>) {
    let xfer_id = u64::from_le_bytes(payload[0..8].try_into().expect("8"));
    let code = ReturnCode::from_u32(u32::from_le_bytes(payload[8..12].try_into().expect("4")));
    let status = match code {
        ReturnCode::Success => Ok(()),
        other => Err(other),
    };
    (xfer_id, status)
}

fn io_error(stage: &'static str) -> impl Fn(std::io::Error) -> ReturnCode {
    move |e| {
        error!(stage, error = %e, "endpoint setup failed");
        ReturnCode::ProtocolError
    }
}

impl NaClass for TcpClass {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn finalize(&self) -> Result<()> {
        let mut ret = Ok(());
        if !self.unexpected_op_queue.lock().is_empty() {
            warn!("unexpected op queue should be empty");
            ret = Err(ReturnCode::ProtocolError);
        }
        if !self.unexpected_msg_queue.lock().is_empty() {
            warn!("unexpected msg queue should be empty");
            ret = Err(ReturnCode::ProtocolError);
        }
        if !self.regions.lock().is_empty() {
            warn!("memory regions still registered at finalize");
        }
        self.conns.lock().clear();
        ret
    }

    fn addr_lookup(
        &self,
        context: &Arc<NaContext>,
        callback: Callback,
        name: &str,
    ) -> Result<OpRef> {
        let target = name.strip_prefix("tcp://").unwrap_or(name);
        let sock_addr: SocketAddr = target.parse().map_err(|_| {
            error!(name, "invalid peer name");
            ReturnCode::InvalidParam
        })?;
        let uri = format!("tcp://{}", sock_addr);

        let addr = if uri == self.self_uri {
            self.self_addr.clone()
        } else {
            let stream = TcpStream::connect_timeout(&sock_addr, CONNECT_TIMEOUT).map_err(|e| {
                error!(peer = %sock_addr, error = %e, "connect failed");
                ReturnCode::ProtocolError
            })?;
            stream
                .set_nodelay(true)
                .and_then(|_| stream.set_nonblocking(true))
                .map_err(io_error("configure"))?;
            let addr = Addr::new(false, false);
            *addr.0.uri.lock() = Some(uri);
            let slot = self.insert_conn(Conn {
                stream,
                addr: addr.clone(),
                inbox: Vec::new(),
                outbox: VecDeque::new(),
                closed: false,
            });
            *addr.0.conn.lock() = Some(slot);
            debug!(peer = %sock_addr, slot, "connected");
            addr
        };

        let op = Op::new(OpType::Lookup, callback, OpState::Lookup { addr });
        let resolved = match &*op.state.lock() {
            OpState::Lookup { addr } => addr.clone(),
            _ => unreachable!("lookup op with wrong state"),
        };
        context.complete(
            &op,
            CbInfo {
                result: Ok(()),
                kind: CbInfoKind::Lookup { addr: resolved },
            },
        );
        Ok(op)
    }

    fn addr_free(&self, addr: Addr) -> Result<()> {
        if addr.0.unexpected {
            error!("attempted to free a transport-owned address");
            return Err(ReturnCode::InvalidParam);
        }
        // Detach first: the poll loop takes the table lock before the
        // per-address lock, so never hold both here.
        let slot = addr.0.conn.lock().take();
        if let Some(slot) = slot {
            if let Some(entry) = self.conns.lock().get_mut(slot) {
                entry.take();
            }
        }
        Ok(())
    }

    fn addr_self(&self) -> Result<Addr> {
        Ok(self.self_addr.clone())
    }

    fn addr_is_self(&self, addr: &Addr) -> bool {
        addr.0.is_self
    }

    fn addr_to_string(&self, addr: &Addr) -> Result<String> {
        addr.0.uri.lock().clone().ok_or(ReturnCode::ProtocolError)
    }

    fn msg_get_max_unexpected_size(&self) -> usize {
        MAX_MSG_SIZE
    }

    fn msg_get_max_expected_size(&self) -> usize {
        MAX_MSG_SIZE
    }

    fn msg_get_max_tag(&self) -> Tag {
        MAX_TAG
    }

    fn msg_send_unexpected(
        &self,
        context: &Arc<NaContext>,
        callback: Callback,
        buf: Arc<Vec<u8>>,
        dest: &Addr,
        tag: Tag,
    ) -> Result<OpRef> {
        if tag > MAX_TAG || buf.len() > MAX_MSG_SIZE {
            return Err(ReturnCode::InvalidParam);
        }
        let op = Op::new(OpType::SendUnexpected, callback, OpState::SendUnexpected);
        if dest.0.is_self {
            self.route_unexpected(context, &buf, self.self_addr.clone(), tag);
            self.complete_send(context, &op, Ok(()));
            return Ok(op);
        }
        let slot = self.conn_slot(dest)?;
        let frame = Self::build_frame(frame_word(false, tag), &[&buf]);
        self.post_frame(context, slot, frame, Some(op.clone()))?;
        Ok(op)
    }

    fn msg_recv_unexpected(
        &self,
        context: &Arc<NaContext>,
        callback: Callback,
        buf: Vec<u8>,
    ) -> Result<OpRef> {
        let staged = self.unexpected_msg_queue.lock().pop_front();
        match staged {
            Some(msg) => {
                let op = Op::new(
                    OpType::RecvUnexpected,
                    callback,
                    OpState::RecvUnexpected { buf: Some(buf) },
                );
                self.deliver_unexpected(context, op.clone(), &msg.data, msg.source, msg.tag);
                Ok(op)
            }
            None => {
                let op = Op::new(
                    OpType::RecvUnexpected,
                    callback,
                    OpState::RecvUnexpected { buf: Some(buf) },
                );
                self.unexpected_op_queue.lock().push_back(op.clone());
                Ok(op)
            }
        }
    }

    fn msg_send_expected(
        &self,
        context: &Arc<NaContext>,
        callback: Callback,
        buf: Arc<Vec<u8>>,
        dest: &Addr,
        tag: Tag,
    ) -> Result<OpRef> {
        if tag > MAX_TAG || buf.len() > MAX_MSG_SIZE {
            return Err(ReturnCode::InvalidParam);
        }
        let op = Op::new(OpType::SendExpected, callback, OpState::SendExpected);
        if dest.0.is_self {
            self.route_expected(context, dest, &buf, tag);
            self.complete_send(context, &op, Ok(()));
            return Ok(op);
        }
        let slot = self.conn_slot(dest)?;
        let frame = Self::build_frame(frame_word(true, tag), &[&buf]);
        self.post_frame(context, slot, frame, Some(op.clone()))?;
        Ok(op)
    }

    fn msg_recv_expected(
        &self,
        context: &Arc<NaContext>,
        callback: Callback,
        buf: Vec<u8>,
        source: &Addr,
        tag: Tag,
    ) -> Result<OpRef> {
        if tag > MAX_TAG {
            return Err(ReturnCode::InvalidParam);
        }
        let op = Op::new(
            OpType::RecvExpected,
            callback,
            OpState::RecvExpected {
                buf: Some(buf),
                tag,
                source: source.clone(),
            },
        );

        // Drain the early list first: the payload may already be here.
        let staged = {
            let mut queues = source.0.queues.lock();
            match queues.early.iter().position(|m| m.tag == tag) {
                Some(pos) => queues.early.remove(pos),
                None => {
                    queues.rxs.push_back(op.clone());
                    None
                }
            }
        };
        if let Some(msg) = staged {
            self.deliver_expected(context, op.clone(), &msg.data);
        }
        Ok(op)
    }

    fn mem_handle_create(&self, buf: &[u8], attr: MemAttr) -> Result<MemHandle> {
        Ok(MemHandle {
            base: buf.as_ptr() as u64,
            len: buf.len() as u64,
            attr,
            registered: false,
            remote: false,
        })
    }

    fn mem_handle_free(&self, mut handle: MemHandle) -> Result<()> {
        if handle.registered {
            self.mem_deregister(&mut handle)?;
        }
        Ok(())
    }

    fn mem_register(&self, handle: &mut MemHandle) -> Result<()> {
        if handle.remote || handle.registered {
            return Err(ReturnCode::InvalidParam);
        }
        let mut regions = self.regions.lock();
        if regions.contains_key(&handle.base) {
            error!(base = handle.base, "region already registered");
            return Err(ReturnCode::InvalidParam);
        }
        regions.insert(
            handle.base,
            Region {
                ptr: handle.base as *mut u8,
                len: handle.len,
                attr: handle.attr,
            },
        );
        handle.registered = true;
        Ok(())
    }

    fn mem_deregister(&self, handle: &mut MemHandle) -> Result<()> {
        if !handle.registered {
            return Err(ReturnCode::InvalidParam);
        }
        if self.regions.lock().remove(&handle.base).is_none() {
            return Err(ReturnCode::InvalidParam);
        }
        handle.registered = false;
        Ok(())
    }

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
    ) -> Result<OpRef> {
        if remote.attr != MemAttr::ReadWrite {
            error!("put requires a read-write remote region");
            return Err(ReturnCode::PermissionError);
        }
        if local.remote || !local.registered {
            return Err(ReturnCode::InvalidParam);
        }
        let op = Op::new(OpType::Put, callback, OpState::Put { xfer_id: 0 });
        if length == 0 {
            context.complete(
                &op,
                CbInfo {
                    result: Ok(()),
                    kind: CbInfoKind::Put,
                },
            );
            return Ok(op);
        }
        let data = self.region_read(local.base, local_offset, length)?;
        if addr.0.is_self {
            let result = self.region_write(remote.base, remote_offset, &data, true);
            context.complete(
                &op,
                CbInfo {
                    result,
                    kind: CbInfoKind::Put,
                },
            );
            return Ok(op);
        }
        let slot = self.conn_slot(addr)?;
        let xfer_id = self.next_xfer_id.fetch_add(1, Ordering::Relaxed);
        *op.state.lock() = OpState::Put { xfer_id };
        self.rma_pending.lock().insert(xfer_id, op.clone());
        let frame = Self::build_frame(
            frame_word(true, RMA_PUT_TAG),
            &[
                &remote.base.to_le_bytes(),
                &remote_offset.to_le_bytes(),
                &length.to_le_bytes(),
                &xfer_id.to_le_bytes(),
                &data,
            ],
        );
        if let Err(e) = self.post_frame(context, slot, frame, None) {
            self.rma_pending.lock().remove(&xfer_id);
            return Err(e);
        }
        Ok(op)
    }

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
    ) -> Result<OpRef> {
        if local.remote || !local.registered {
            return Err(ReturnCode::InvalidParam);
        }
        let op = Op::new(
            OpType::Get,
            callback,
            OpState::Get {
                xfer_id: 0,
                local_base: local.base,
                local_offset,
                length,
            },
        );
        if length == 0 {
            context.complete(
                &op,
                CbInfo {
                    result: Ok(()),
                    kind: CbInfoKind::Get,
                },
            );
            return Ok(op);
        }
        if addr.0.is_self {
            let result = self
                .region_read(remote.base, remote_offset, length)
                .and_then(|data| self.region_write(local.base, local_offset, &data, false));
            context.complete(
                &op,
                CbInfo {
                    result,
                    kind: CbInfoKind::Get,
                },
            );
            return Ok(op);
        }
        let slot = self.conn_slot(addr)?;
        let xfer_id = self.next_xfer_id.fetch_add(1, Ordering::Relaxed);
        *op.state.lock() = OpState::Get {
            xfer_id,
            local_base: local.base,
            local_offset,
            length,
        };
        self.rma_pending.lock().insert(xfer_id, op.clone());
        let frame = Self::build_frame(
            frame_word(true, RMA_GET_TAG),
            &[
                &remote.base.to_le_bytes(),
                &remote_offset.to_le_bytes(),
                &length.to_le_bytes(),
                &xfer_id.to_le_bytes(),
            ],
        );
        if let Err(e) = self.post_frame(context, slot, frame, None) {
            self.rma_pending.lock().remove(&xfer_id);
            return Err(e);
        }
        Ok(op)
    }

    fn progress(&self, context: &Arc<NaContext>, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let progressed = {
                let _poll = self.progress_lock.lock();
                self.poll_once(context)?
            };
            if progressed {
                return Ok(());
            }
            // Completions staged at post time count as handled events.
            if context.has_pending() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReturnCode::Timeout);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn cancel(&self, context: &Arc<NaContext>, op: &OpRef) -> Result<()> {
        if op.is_completed() {
            return Err(ReturnCode::ProtocolError);
        }
        match op.ty {
            OpType::RecvUnexpected => {
                let removed = {
                    let mut queue = self.unexpected_op_queue.lock();
                    match queue.iter().position(|o| Arc::ptr_eq(o, op)) {
                        Some(pos) => queue.remove(pos),
                        None => None,
                    }
                };
                match removed {
                    Some(op) => {
                        self.deliver_failed_recv(context, op, ReturnCode::Fail);
                        Ok(())
                    }
                    None => Err(ReturnCode::ProtocolError),
                }
            }
            OpType::RecvExpected => {
                let source = match &*op.state.lock() {
                    OpState::RecvExpected { source, .. } => source.clone(),
                    _ => return Err(ReturnCode::ProtocolError),
                };
                let removed = {
                    let mut queues = source.0.queues.lock();
                    match queues.rxs.iter().position(|o| Arc::ptr_eq(o, op)) {
                        Some(pos) => queues.rxs.remove(pos),
                        None => None,
                    }
                };
                match removed {
                    Some(op) => {
                        self.deliver_failed_recv(context, op, ReturnCode::Fail);
                        Ok(())
                    }
                    None => Err(ReturnCode::ProtocolError),
                }
            }
            _ => Err(ReturnCode::ProtocolError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn noop_cb() -> Callback {
        Box::new(|_| {})
    }

    fn endpoint() -> (Arc<TcpClass>, Arc<NaContext>) {
        let class = Arc::new(TcpClass::initialize(None, true).unwrap());
        let context = class.context_create().unwrap();
        (class, context)
    }

    #[test]
    fn test_early_expected_receive_is_delivered_synchronously() {
        let (class, context) = endpoint();
        let addr = class.addr_self().unwrap();

        // Message with tag 7 arrives before any receive is posted.
        let payload = Arc::new(b"hello-expected".to_vec());
        class
            .msg_send_expected(&context, noop_cb(), payload.clone(), &addr, 7)
            .unwrap();
        context.trigger(Duration::ZERO, u32::MAX).unwrap();

        let seen: Arc<PlMutex<Option<Vec<u8>>>> = Arc::new(PlMutex::new(None));
        let seen2 = seen.clone();
        let op = class
            .msg_recv_expected(
                &context,
                Box::new(move |info| {
                    assert!(info.result.is_ok());
                    if let CbInfoKind::RecvExpected { buf, actual_size } = info.kind {
                        *seen2.lock() = Some(buf[..actual_size].to_vec());
                    }
                }),
                vec![0u8; 64],
                &addr,
                7,
            )
            .unwrap();

        assert!(op.is_completed());
        context.trigger(Duration::ZERO, u32::MAX).unwrap();
        assert_eq!(seen.lock().as_deref(), Some(&b"hello-expected"[..]));
    }

    #[test]
    fn test_early_match_truncates_to_posted_buffer() {
        let (class, context) = endpoint();
        let addr = class.addr_self().unwrap();

        class
            .msg_send_expected(&context, noop_cb(), Arc::new(vec![0xaa; 32]), &addr, 3)
            .unwrap();

        let seen: Arc<PlMutex<Option<(usize, Result<()>)>>> = Arc::new(PlMutex::new(None));
        let seen2 = seen.clone();
        class
            .msg_recv_expected(
                &context,
                Box::new(move |info| {
                    if let CbInfoKind::RecvExpected { actual_size, .. } = info.kind {
                        *seen2.lock() = Some((actual_size, info.result));
                    }
                }),
                vec![0u8; 8],
                &addr,
                3,
            )
            .unwrap();
        context.trigger(Duration::ZERO, u32::MAX).unwrap();

        let (actual, result) = seen.lock().take().unwrap();
        assert_eq!(actual, 8);
        assert_eq!(result, Err(ReturnCode::SizeError));
    }

    #[test]
    fn test_unexpected_messages_drain_fifo() {
        let (class, context) = endpoint();
        let addr = class.addr_self().unwrap();

        for byte in [1u8, 2] {
            class
                .msg_send_unexpected(&context, noop_cb(), Arc::new(vec![byte; 4]), &addr, 9)
                .unwrap();
        }

        let order: Arc<PlMutex<Vec<u8>>> = Arc::new(PlMutex::new(Vec::new()));
        for _ in 0..2 {
            let order2 = order.clone();
            class
                .msg_recv_unexpected(
                    &context,
                    Box::new(move |info| {
                        if let CbInfoKind::RecvUnexpected { buf, .. } = info.kind {
                            order2.lock().push(buf[0]);
                        }
                    }),
                    vec![0u8; 16],
                )
                .unwrap();
        }
        context.trigger(Duration::ZERO, u32::MAX).unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn test_put_into_read_only_region_is_rejected() {
        let (class, context) = endpoint();
        let addr = class.addr_self().unwrap();

        let src = vec![1u8; 32];
        let dst = vec![0u8; 32];
        let mut local = class.mem_handle_create(&src, MemAttr::ReadOnly).unwrap();
        class.mem_register(&mut local).unwrap();
        let remote = class.mem_handle_create(&dst, MemAttr::ReadOnly).unwrap();

        let err = class
            .put(&context, noop_cb(), &local, 0, &remote, 0, 32, &addr)
            .unwrap_err();
        assert_eq!(err, ReturnCode::PermissionError);
        // Rejected before any transfer: nothing was queued or completed.
        assert!(!context.has_pending());

        class.mem_handle_free(local).unwrap();
    }

    #[test]
    fn test_zero_length_transfer_is_a_successful_noop() {
        let (class, context) = endpoint();
        let addr = class.addr_self().unwrap();

        let src = vec![7u8; 8];
        let dst = vec![0u8; 8];
        let mut local = class.mem_handle_create(&src, MemAttr::ReadOnly).unwrap();
        class.mem_register(&mut local).unwrap();
        let mut remote_reg = class.mem_handle_create(&dst, MemAttr::ReadWrite).unwrap();
        class.mem_register(&mut remote_reg).unwrap();

        let op = class
            .put(&context, noop_cb(), &local, 0, &remote_reg, 0, 0, &addr)
            .unwrap();
        assert!(op.is_completed());
        context.trigger(Duration::ZERO, u32::MAX).unwrap();
        assert_eq!(dst, vec![0u8; 8]);

        class.mem_handle_free(local).unwrap();
        class.mem_handle_free(remote_reg).unwrap();
    }

    #[test]
    fn test_handle_serialization_round_trips_as_transfer_target() {
        let (class, context) = endpoint();
        let addr = class.addr_self().unwrap();

        let src: Vec<u8> = (0..64u8).collect();
        let dst = vec![0u8; 64];
        let mut local = class.mem_handle_create(&src, MemAttr::ReadOnly).unwrap();
        class.mem_register(&mut local).unwrap();
        let mut target = class.mem_handle_create(&dst, MemAttr::ReadWrite).unwrap();
        class.mem_register(&mut target).unwrap();

        // Ship the target handle through its wire form, as a peer would see it.
        let mut bytes = vec![0u8; class.mem_handle_get_serialize_size()];
        class.mem_handle_serialize(&mut bytes, &target).unwrap();
        let remote_view = class.mem_handle_deserialize(&bytes).unwrap();
        assert!(remote_view.is_remote());

        class
            .put(&context, noop_cb(), &local, 0, &remote_view, 0, 64, &addr)
            .unwrap();
        context.trigger(Duration::ZERO, u32::MAX).unwrap();
        assert_eq!(dst, src);

        class.mem_handle_free(local).unwrap();
        class.mem_handle_free(target).unwrap();
    }

    #[test]
    fn test_cancel_unmatched_expected_receive() {
        let (class, context) = endpoint();
        let addr = class.addr_self().unwrap();

        let failed: Arc<PlMutex<Option<Result<()>>>> = Arc::new(PlMutex::new(None));
        let failed2 = failed.clone();
        let op = class
            .msg_recv_expected(
                &context,
                Box::new(move |info| {
                    *failed2.lock() = Some(info.result);
                }),
                vec![0u8; 8],
                &addr,
                11,
            )
            .unwrap();

        class.cancel(&context, &op).unwrap();
        context.trigger(Duration::ZERO, u32::MAX).unwrap();
        assert_eq!(failed.lock().take(), Some(Err(ReturnCode::Fail)));

        // A second cancel finds nothing to abort.
        assert_eq!(class.cancel(&context, &op), Err(ReturnCode::ProtocolError));
    }
}
