//! The request table and the state machine of point-to-point operations
//!
//! Every operation lives in a slot of the request table of its [`Context`] and is named by a
//! [`RequestHandle`] carrying the slot index and the generation of the slot. A request moves
//! through the states
//!
//! ```text
//! Inactive --start--> Active --transport--> Complete --wait/test--> (destroyed | Inactive)
//!                       \--cancel--> Cancelled --wait/test--> (destroyed | Inactive)
//! ```
//!
//! where `Inactive` exists only for persistent requests. A send packs its message into a private
//! payload when it is started; a receive lands in a private staging area and is unpacked into the
//! user buffer when the transport reports its completion.

use std::cell::{RefCell, RefMut};
use std::fmt;
use std::hint;
use std::ops::Range;
use std::rc::Rc;

use conv::ConvUtil;
use log::{debug, trace, warn};

use crate::bsend::BufferPool;
use crate::datatype::pack;
use crate::datatype::{Datatype, Pointer, PointerMut};
use crate::environment::{Config, Lifecycle};
use crate::error::{Error, ErrorKind, Result};
use crate::point_to_point::Status;
use crate::raw::RequestHandle;
use crate::topology::{ContextId, Group, Rank, ANY_SOURCE, ANY_TAG, PROC_NULL};
use crate::transport::{SendMode, Transport, TransportHandle};
use crate::{Count, Tag};

/// Start and reach of a user buffer
///
/// Only created from a borrowed buffer; the request holding it keeps the borrow alive.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RawBuffer {
    ptr: *mut u8,
    span: usize,
}

impl RawBuffer {
    pub(crate) fn from_buffer<B: ?Sized + Pointer>(buffer: &B) -> RawBuffer {
        RawBuffer {
            ptr: buffer.pointer() as *mut u8,
            span: buffer.span(),
        }
    }

    pub(crate) fn from_buffer_mut<B: ?Sized + Pointer + PointerMut>(buffer: &mut B) -> RawBuffer {
        let span = buffer.span();
        RawBuffer {
            ptr: buffer.pointer_mut(),
            span,
        }
    }
}

/// Arguments of an operation as given by the caller, before validation
pub(crate) struct Params {
    pub(crate) peer: Rank,
    pub(crate) tag: Tag,
    pub(crate) context: ContextId,
    pub(crate) group: Rc<Group>,
    pub(crate) count: Count,
    pub(crate) datatype: Datatype,
    pub(crate) buffer: RawBuffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Peer {
    Null,
    Any,
    Global(Rank),
}

/// A validated operation
struct Transfer {
    peer: Peer,
    tag: Tag,
    context: ContextId,
    group: Rc<Group>,
    count: usize,
    datatype: Datatype,
    buffer: RawBuffer,
}

enum Operation {
    ImmediateSend(Transfer, SendMode),
    ImmediateReceive(Transfer),
    PersistentSend(Transfer, SendMode),
    PersistentReceive(Transfer),
}

impl Operation {
    fn is_persistent(&self) -> bool {
        matches!(
            self,
            Operation::PersistentSend(..) | Operation::PersistentReceive(..)
        )
    }

    fn transfer(&self) -> &Transfer {
        match self {
            Operation::ImmediateSend(t, _)
            | Operation::ImmediateReceive(t)
            | Operation::PersistentSend(t, _)
            | Operation::PersistentReceive(t) => t,
        }
    }

    fn transfer_mut(&mut self) -> &mut Transfer {
        match self {
            Operation::ImmediateSend(t, _)
            | Operation::ImmediateReceive(t)
            | Operation::PersistentSend(t, _)
            | Operation::PersistentReceive(t) => t,
        }
    }

    /// `None` for receives
    fn mode(&self) -> Option<SendMode> {
        match self {
            Operation::ImmediateSend(_, mode) | Operation::PersistentSend(_, mode) => Some(*mode),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, t) = match self {
            Operation::ImmediateSend(t, _) => ("immediate send", t),
            Operation::ImmediateReceive(t) => ("immediate receive", t),
            Operation::PersistentSend(t, _) => ("persistent send", t),
            Operation::PersistentReceive(t) => ("persistent receive", t),
        };
        write!(f, "{} ({:?}, tag {}, context {})", kind, t.peer, t.tag, t.context)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Inactive,
    Active(TransportHandle),
    Complete,
    Cancelled,
}

struct Entry {
    op: Operation,
    state: State,
    status: Status,
    staging: Vec<u8>,
    // Freed by the user while in flight, destroyed on completion.
    detached: bool,
}

impl Entry {
    fn new(op: Operation) -> Entry {
        Entry {
            op,
            state: State::Inactive,
            status: Status::empty(),
            staging: Vec::new(),
            detached: false,
        }
    }

    fn complete(&mut self, status: Status) {
        self.state = State::Complete;
        self.status = status;
    }

    fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct RequestTable {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
}

fn invalid_request(detail: &str) -> Error {
    Error::with_detail(ErrorKind::InvalidRequest, detail)
}

impl RequestTable {
    fn insert(&mut self, entry: Entry) -> Result<RequestHandle> {
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return Ok(RequestHandle {
                index,
                generation: slot.generation,
            });
        }
        let index: u32 = self
            .slots
            .len()
            .value_as::<u32>()
            .ok()
            .filter(|&i| i != RequestHandle::NULL.index)
            .ok_or_else(|| Error::with_detail(ErrorKind::Internal, "request table is full"))?;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        Ok(RequestHandle {
            index,
            generation: 0,
        })
    }

    /// The entry named by `handle`, including detached ones
    fn slot_mut(&mut self, handle: RequestHandle) -> Option<&mut Entry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn get_mut(&mut self, handle: RequestHandle) -> Result<&mut Entry> {
        if handle.is_null() {
            return Err(invalid_request("null request handle"));
        }
        match self.slot_mut(handle) {
            Some(entry) if !entry.detached => Ok(entry),
            _ => Err(invalid_request("stale request handle")),
        }
    }

    fn remove(&mut self, handle: RequestHandle) -> Option<Entry> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(handle.index);
        Some(entry)
    }

    fn handles(&self) -> Vec<RequestHandle> {
        self.handles_where(|_| true)
    }

    fn detached(&self) -> Vec<RequestHandle> {
        self.handles_where(|entry| entry.detached)
    }

    fn handles_where<F: Fn(&Entry) -> bool>(&self, f: F) -> Vec<RequestHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.as_ref().map_or(false, &f))
            .map(|(index, slot)| RequestHandle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }
}

/// The parts of the engine that talk to the transport
struct Wire {
    transport: Box<dyn Transport>,
    config: Config,
    pool: BufferPool,
    // Buffered sends handed to the transport, with the pool range holding their payload.
    bsend_inflight: Vec<(TransportHandle, Range<usize>)>,
}

impl Wire {
    /// Issues the operation of `entry` to the transport.
    ///
    /// Only buffer exhaustion is reported as an `Err`; the request is left untouched then. A
    /// transport refusing the operation completes the request with the error in its status.
    fn begin(&mut self, entry: &mut Entry) -> Result<()> {
        if entry.op.transfer().peer == Peer::Null {
            trace!("{} completes at once", entry.op);
            entry.complete(Status::null_peer());
            return Ok(());
        }
        match entry.op.mode() {
            Some(mode) => self.begin_send(entry, mode),
            None => self.begin_receive(entry),
        }
    }

    fn begin_send(&mut self, entry: &mut Entry, mode: SendMode) -> Result<()> {
        let t = entry.op.transfer();
        let dest = match t.peer {
            Peer::Global(rank) => rank,
            _ => return Err(Error::with_detail(ErrorKind::Internal, "send without a destination")),
        };
        let bytes = pack::data_bytes(t.count, &t.datatype)?;
        let mut payload = vec![0; bytes];
        // Safety: the layout was checked against the buffer when the operation was created and
        // the request borrows the buffer until it completes.
        unsafe { pack::gather(t.buffer.ptr, t.count, &t.datatype, &mut payload) };
        let (tag, context) = (t.tag, t.context);

        if mode == SendMode::Buffered {
            let range = self.pool.claim(bytes + self.config.bsend_overhead)?;
            let issued = match self.pool.region_mut(range.start..range.start + bytes) {
                Some(region) => {
                    region.copy_from_slice(&payload);
                    self.transport.issue_send(dest, tag, context, region, mode)
                }
                None => Err(Error::with_detail(ErrorKind::Internal, "claimed range outside of region")),
            };
            match issued {
                Ok(handle) => {
                    debug!("{} buffered as {:?}, {} bytes", entry.op, handle, bytes);
                    self.bsend_inflight.push((handle, range));
                    entry.complete(Status::completed(ANY_SOURCE, ANY_TAG, bytes, None));
                }
                Err(err) => {
                    debug!("{} refused: {}", entry.op, err);
                    self.pool.release(range);
                    entry.complete(Status::from_error(err.kind()));
                }
            }
            return Ok(());
        }

        match self.transport.issue_send(dest, tag, context, &payload, mode) {
            Ok(handle) => {
                debug!("{} issued as {:?}, {} bytes", entry.op, handle, bytes);
                entry.state = State::Active(handle);
            }
            Err(err) => {
                debug!("{} refused: {}", entry.op, err);
                entry.complete(Status::from_error(err.kind()));
            }
        }
        Ok(())
    }

    fn begin_receive(&mut self, entry: &mut Entry) -> Result<()> {
        let t = entry.op.transfer();
        let capacity = pack::data_bytes(t.count, &t.datatype)?;
        let source = match t.peer {
            Peer::Global(rank) => Some(rank),
            _ => None,
        };
        let tag = if t.tag == ANY_TAG { None } else { Some(t.tag) };
        let context = t.context;
        entry.staging.clear();
        entry.staging.resize(capacity, 0);
        match self.transport.issue_receive(source, tag, context, capacity) {
            Ok(handle) => {
                debug!("{} issued as {:?}, capacity {}", entry.op, handle, capacity);
                entry.state = State::Active(handle);
            }
            Err(err) => {
                debug!("{} refused: {}", entry.op, err);
                entry.complete(Status::from_error(err.kind()));
            }
        }
        Ok(())
    }

    /// Asks the transport whether the operation of an active `entry` has completed.
    fn poll(&mut self, entry: &mut Entry) {
        let handle = match entry.state {
            State::Active(handle) => handle,
            _ => return,
        };
        trace!("polling {:?}", handle);
        let done = match self.transport.progress_probe(handle, &mut entry.staging) {
            Some(done) => done,
            None => return,
        };
        let status = if entry.op.mode().is_some() {
            Status::completed(ANY_SOURCE, ANY_TAG, done.bytes, done.error)
        } else {
            let t = entry.op.transfer();
            let bytes = done.bytes.min(entry.staging.len());
            let size = t.datatype.size();
            // A trailing partial element is not unpacked; the status keeps the full byte count,
            // so `Status::count` reports UNDEFINED for it.
            let elements = if size == 0 { 0 } else { (bytes / size).min(t.count) };
            // Safety: the layout was checked against the buffer when the operation was created,
            // the request borrows the buffer until it completes and the staging area holds
            // `elements * size` bytes.
            unsafe {
                pack::scatter(
                    &entry.staging[..elements * size],
                    t.buffer.ptr,
                    elements,
                    &t.datatype,
                )
            };
            let source = t
                .group
                .translate_global_to_local(done.source)
                .unwrap_or(done.source);
            Status::completed(source, done.tag, bytes, done.error)
        };
        debug!("{} completed: {:?}", entry.op, status);
        entry.complete(status);
    }

    /// Polls an active `entry` and, if it is still in flight, tries to withdraw it.
    fn cancel(&mut self, entry: &mut Entry) {
        self.poll(entry);
        if let State::Active(handle) = entry.state {
            if self.transport.progress_cancel(handle) {
                debug!("{} cancelled", entry.op);
                entry.state = State::Cancelled;
                entry.status = Status::cancelled();
            } else {
                debug!("{} could not be cancelled", entry.op);
            }
        }
    }

    /// Releases the pool ranges of buffered sends the transport has delivered.
    fn progress_buffered(&mut self) {
        let mut i = 0;
        while i < self.bsend_inflight.len() {
            let (handle, _) = self.bsend_inflight[i];
            match self.transport.progress_probe(handle, &mut []) {
                Some(done) => {
                    let (_, range) = self.bsend_inflight.swap_remove(i);
                    self.pool.release(range);
                    if let Some(kind) = done.error {
                        warn!("buffered send {:?} failed after completing locally: {}", handle, kind);
                    }
                }
                None => i += 1,
            }
        }
    }

    fn drain_buffered(&mut self) {
        self.progress_buffered();
        while !self.bsend_inflight.is_empty() {
            hint::spin_loop();
            self.progress_buffered();
        }
    }
}

/// The request engine
pub(crate) struct Engine {
    wire: Wire,
    table: RequestTable,
    lifecycle: Lifecycle,
    next_context_id: ContextId,
}

impl Engine {
    fn check_live(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Initialized => Ok(()),
            Lifecycle::Uninitialized => Err(Error::new(ErrorKind::NotInitialized)),
            Lifecycle::Finalized => Err(Error::new(ErrorKind::AlreadyFinalized)),
        }
    }

    pub(crate) fn initialize(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Uninitialized => {
                self.lifecycle = Lifecycle::Initialized;
                Ok(())
            }
            Lifecycle::Initialized => Err(Error::with_detail(
                ErrorKind::Internal,
                "engine is already initialized",
            )),
            Lifecycle::Finalized => Err(Error::new(ErrorKind::AlreadyFinalized)),
        }
    }

    pub(crate) fn config(&self) -> Config {
        self.wire.config
    }

    /// Checks the arguments of an operation in a fixed order: count, commit state, tag, peer and
    /// finally whether the layout fits into the buffer.
    fn validate(&self, params: Params, receive: bool) -> Result<Transfer> {
        self.check_live()?;
        let count = pack::element_count(params.count)?;
        if !params.datatype.is_committed() {
            return Err(Error::new(ErrorKind::UncommittedType));
        }
        let tag_ok = (0..=self.wire.config.tag_ub).contains(&params.tag)
            || (receive && params.tag == ANY_TAG);
        if !tag_ok {
            return Err(Error::with_detail(
                ErrorKind::InvalidTag,
                format!("tag {} outside of 0..={}", params.tag, self.wire.config.tag_ub),
            ));
        }
        let peer = match params.peer {
            PROC_NULL => Peer::Null,
            ANY_SOURCE if receive => Peer::Any,
            rank => match params.group.translate_local_to_global(rank) {
                Some(global) => Peer::Global(global),
                None => {
                    return Err(Error::with_detail(
                        ErrorKind::InvalidRank,
                        format!("rank {} in a group of {}", rank, params.group.size()),
                    ))
                }
            },
        };
        pack::check_buffer(params.buffer.span, count, &params.datatype)?;
        Ok(Transfer {
            peer,
            tag: params.tag,
            context: params.context,
            group: params.group,
            count,
            datatype: params.datatype,
            buffer: params.buffer,
        })
    }

    fn create(&mut self, op: Operation) -> Result<RequestHandle> {
        let mut entry = Entry::new(op);
        if !entry.op.is_persistent() {
            self.wire.begin(&mut entry)?;
        }
        let handle = self.table.insert(entry)?;
        trace!("created {:?}", handle);
        Ok(handle)
    }

    pub(crate) fn issue_send(&mut self, params: Params, mode: SendMode) -> Result<RequestHandle> {
        let transfer = self.validate(params, false)?;
        self.create(Operation::ImmediateSend(transfer, mode))
    }

    pub(crate) fn issue_receive(&mut self, params: Params) -> Result<RequestHandle> {
        let transfer = self.validate(params, true)?;
        self.create(Operation::ImmediateReceive(transfer))
    }

    pub(crate) fn send_init(&mut self, params: Params, mode: SendMode) -> Result<RequestHandle> {
        let transfer = self.validate(params, false)?;
        self.create(Operation::PersistentSend(transfer, mode))
    }

    pub(crate) fn receive_init(&mut self, params: Params) -> Result<RequestHandle> {
        let transfer = self.validate(params, true)?;
        self.create(Operation::PersistentReceive(transfer))
    }

    /// Starts an inactive persistent request, optionally pointing it at a fresh borrow of its
    /// buffer.
    pub(crate) fn start(&mut self, handle: RequestHandle, buffer: Option<RawBuffer>) -> Result<()> {
        self.check_live()?;
        let entry = self.table.get_mut(handle)?;
        if !entry.op.is_persistent() {
            return Err(invalid_request("only persistent requests can be started"));
        }
        match entry.state {
            State::Active(_) => Err(Error::new(ErrorKind::RequestAlreadyActive)),
            State::Complete | State::Cancelled => Err(Error::with_detail(
                ErrorKind::RequestAlreadyComplete,
                "the previous run has not been waited for",
            )),
            State::Inactive => {
                if let Some(buffer) = buffer {
                    entry.op.transfer_mut().buffer = buffer;
                }
                self.wire.begin(entry)
            }
        }
    }

    /// Drives buffered sends and detached requests.
    pub(crate) fn progress(&mut self) {
        self.wire.progress_buffered();
        for handle in self.table.detached() {
            let done = match self.table.slot_mut(handle) {
                Some(entry) => {
                    self.wire.poll(entry);
                    !entry.is_active()
                }
                None => false,
            };
            if done {
                if let Some(entry) = self.table.remove(handle) {
                    match entry.status.error() {
                        Some(kind) => warn!("freed {} completed with error: {}", entry.op, kind),
                        None => debug!("freed {} completed", entry.op),
                    }
                }
            }
        }
    }

    /// Completes `handle` if its operation is done.
    ///
    /// Immediate requests are destroyed and `handle` becomes null, persistent requests become
    /// inactive. An inactive persistent request yields an empty status.
    pub(crate) fn test(&mut self, handle: &mut RequestHandle) -> Result<Option<Status>> {
        self.check_live()?;
        let entry = self.table.get_mut(*handle)?;
        self.wire.poll(entry);
        let state = entry.state;
        match state {
            State::Inactive => Ok(Some(Status::empty())),
            State::Active(_) => {
                self.progress();
                Ok(None)
            }
            State::Complete | State::Cancelled => {
                let status = entry.status;
                if entry.op.is_persistent() {
                    entry.state = State::Inactive;
                } else {
                    self.table.remove(*handle);
                    *handle = RequestHandle::NULL;
                }
                Ok(Some(status))
            }
        }
    }

    pub(crate) fn wait(&mut self, handle: &mut RequestHandle) -> Result<Status> {
        loop {
            if let Some(status) = self.test(handle)? {
                return Ok(status);
            }
            hint::spin_loop();
        }
    }

    /// The status of `handle` if its operation is done, without completing the request.
    pub(crate) fn get_status(&mut self, handle: RequestHandle) -> Result<Option<Status>> {
        if handle.is_null() {
            return Ok(Some(Status::empty()));
        }
        self.check_live()?;
        let entry = self.table.get_mut(handle)?;
        self.wire.poll(entry);
        let state = entry.state;
        match state {
            State::Inactive => Ok(Some(Status::empty())),
            State::Active(_) => {
                self.progress();
                Ok(None)
            }
            State::Complete | State::Cancelled => Ok(Some(entry.status)),
        }
    }

    pub(crate) fn cancel(&mut self, handle: RequestHandle) -> Result<()> {
        self.check_live()?;
        let entry = self.table.get_mut(handle)?;
        match entry.state {
            State::Inactive => Err(invalid_request("cannot cancel an inactive persistent request")),
            State::Complete | State::Cancelled => Ok(()),
            State::Active(_) => {
                self.wire.cancel(entry);
                Ok(())
            }
        }
    }

    /// Frees `handle`, which becomes null.
    ///
    /// An immediate request still in flight is detached and destroyed once it completes. A
    /// persistent request can only be freed while inactive.
    pub(crate) fn free(&mut self, handle: &mut RequestHandle) -> Result<()> {
        self.check_live()?;
        let entry = self.table.get_mut(*handle)?;
        if entry.op.is_persistent() {
            if entry.state != State::Inactive {
                return Err(Error::with_detail(
                    ErrorKind::RequestAlreadyActive,
                    "a persistent request can only be freed while inactive",
                ));
            }
            self.table.remove(*handle);
        } else if entry.is_active() {
            debug!("detaching {}", entry.op);
            entry.detached = true;
        } else if let Some(entry) = self.table.remove(*handle) {
            if let Some(kind) = entry.status.error() {
                warn!("freed {} without observing its error: {}", entry.op, kind);
            }
        }
        *handle = RequestHandle::NULL;
        Ok(())
    }

    /// Whether a persistent request is inactive, i.e. its buffer may be touched.
    pub(crate) fn is_inactive(&mut self, handle: RequestHandle) -> Result<bool> {
        Ok(self.table.get_mut(handle)?.state == State::Inactive)
    }

    pub(crate) fn allocate_context_id(&mut self) -> ContextId {
        self.next_context_id += 1;
        self.next_context_id
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.wire.pool.capacity()
    }

    pub(crate) fn attach_buffer(&mut self, buffer: Vec<u8>) -> Result<()> {
        self.check_live()?;
        self.wire.pool.attach(buffer)
    }

    pub(crate) fn detach_buffer(&mut self) -> Result<Vec<u8>> {
        self.check_live()?;
        self.wire.drain_buffered();
        Ok(self.wire.pool.detach())
    }

    pub(crate) fn free_datatype(&self, datatype: Datatype) -> Result<()> {
        if datatype.is_predefined() && self.lifecycle != Lifecycle::Finalized {
            return Err(Error::new(ErrorKind::CannotFreePermanent));
        }
        trace!("freeing {:?}", datatype);
        drop(datatype);
        Ok(())
    }

    /// Cancels what is still in flight, drains buffered sends and moves to `Finalized`.
    pub(crate) fn finalize(&mut self) -> Result<()> {
        self.check_live()?;
        debug!("finalizing with {} requests", self.table.len());
        for handle in self.table.handles() {
            if let Some(entry) = self.table.slot_mut(handle) {
                self.wire.cancel(entry);
                self.wire.poll(entry);
                if entry.is_active() {
                    warn!("abandoning {} which could not be cancelled", entry.op);
                }
            }
        }
        for handle in self.table.detached() {
            self.table.remove(handle);
        }
        self.wire.drain_buffered();
        self.lifecycle = Lifecycle::Finalized;
        Ok(())
    }
}

/// A handle to a request engine
///
/// Cloning a `Context` yields another handle to the same engine. All communicators obtained from
/// a [`Universe`](crate::Universe) share its context.
#[derive(Clone)]
pub struct Context(Rc<RefCell<Engine>>);

impl Context {
    pub(crate) fn new(transport: Box<dyn Transport>, config: Config) -> Context {
        Context(Rc::new(RefCell::new(Engine {
            wire: Wire {
                transport,
                config,
                pool: BufferPool::new(),
                bsend_inflight: Vec::new(),
            },
            table: RequestTable::default(),
            lifecycle: Lifecycle::Uninitialized,
            next_context_id: 0,
        })))
    }

    pub(crate) fn engine(&self) -> RefMut<'_, Engine> {
        self.0.borrow_mut()
    }

    /// Whether `self` and `other` are handles to the same engine
    pub fn same_engine(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn allocate_context_id(&self) -> ContextId {
        self.engine().allocate_context_id()
    }

    /// Where the engine is in its life
    pub fn lifecycle(&self) -> Lifecycle {
        self.0.borrow().lifecycle
    }

    /// Number of live requests, including freed requests still in flight
    pub fn live_requests(&self) -> usize {
        self.0.borrow().table.len()
    }

    /// Give the transport a chance to complete outstanding operations.
    ///
    /// Completes freed requests and returns the regions of delivered buffered sends to the pool.
    pub fn progress(&self) {
        self.engine().progress()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(engine) => f
                .debug_struct("Context")
                .field("lifecycle", &engine.lifecycle)
                .field("requests", &engine.table.len())
                .finish(),
            Err(_) => f.write_str("Context { <busy> }"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Equivalence;
    use crate::transport::loopback::Loopback;

    fn context() -> Context {
        let context = Context::new(Box::new(Loopback::single()), Config::default());
        context.engine().initialize().unwrap();
        context
    }

    fn params<T: Equivalence>(buffer: &mut [T], peer: Rank, tag: Tag) -> Params {
        Params {
            peer,
            tag,
            context: 0,
            group: Rc::new(Group::world(1)),
            count: buffer.len() as Count,
            datatype: T::equivalent_datatype(),
            buffer: RawBuffer::from_buffer_mut(buffer),
        }
    }

    #[test]
    fn handles_go_stale_after_reuse() {
        let context = context();
        let mut engine = context.engine();
        let mut buf = [0i32; 1];
        let mut first = engine.issue_send(params(&mut buf, PROC_NULL, 0), SendMode::Standard).unwrap();
        let stale = first;
        engine.wait(&mut first).unwrap();
        assert!(first.is_null());

        let second = engine.issue_send(params(&mut buf, PROC_NULL, 0), SendMode::Standard).unwrap();
        assert_eq!(second.index, stale.index);
        assert_ne!(second.generation, stale.generation);
        assert_eq!(
            engine.cancel(stale).unwrap_err().kind(),
            ErrorKind::InvalidRequest
        );
    }

    #[test]
    fn validation_order() {
        let context = context();
        let mut engine = context.engine();
        let mut buf = [0i32; 2];

        let mut p = params(&mut buf, 5, -3);
        p.count = -1;
        assert_eq!(
            engine.issue_send(p, SendMode::Standard).unwrap_err().kind(),
            ErrorKind::InvalidCount
        );

        let mut p = params(&mut buf, 5, -3);
        p.datatype = Datatype::contiguous(1, &i32::equivalent_datatype()).unwrap();
        assert_eq!(
            engine.issue_send(p, SendMode::Standard).unwrap_err().kind(),
            ErrorKind::UncommittedType
        );

        let p = params(&mut buf, 5, -3);
        assert_eq!(
            engine.issue_send(p, SendMode::Standard).unwrap_err().kind(),
            ErrorKind::InvalidTag
        );

        let p = params(&mut buf, 5, 0);
        assert_eq!(
            engine.issue_send(p, SendMode::Standard).unwrap_err().kind(),
            ErrorKind::InvalidRank
        );

        let mut p = params(&mut buf, 0, 0);
        p.count = 3;
        assert_eq!(
            engine.issue_send(p, SendMode::Standard).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(engine.table.len(), 0);
    }

    #[test]
    fn receives_accept_wildcards() {
        let context = context();
        let mut engine = context.engine();
        let mut buf = [0i32; 1];
        let mut recv = engine.issue_receive(params(&mut buf, ANY_SOURCE, ANY_TAG)).unwrap();
        assert_eq!(engine.test(&mut recv).unwrap(), None);
        assert_eq!(
            engine
                .issue_send(params(&mut buf, ANY_SOURCE, 0), SendMode::Standard)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidRank
        );
        engine.cancel(recv).unwrap();
        assert!(engine.wait(&mut recv).unwrap().test_cancelled());
    }

    #[test]
    fn detached_requests_are_destroyed_on_completion() {
        let context = context();
        let mut engine = context.engine();
        let mut out = [7i32];
        let mut recv = engine.issue_receive(params(&mut out, 0, 3)).unwrap();
        engine.free(&mut recv).unwrap();
        assert!(recv.is_null());
        assert_eq!(engine.table.len(), 1);

        let mut msg = [9i32];
        let mut send = engine.issue_send(params(&mut msg, 0, 3), SendMode::Standard).unwrap();
        engine.wait(&mut send).unwrap();
        engine.progress();
        assert_eq!(engine.table.len(), 0);
        assert_eq!(out, [9]);
    }

    #[test]
    fn persistent_lifecycle_errors() {
        let context = context();
        let mut engine = context.engine();
        let mut buf = [0i32; 1];
        let mut req = engine.receive_init(params(&mut buf, 0, 1)).unwrap();
        assert_eq!(
            engine.cancel(req).unwrap_err().kind(),
            ErrorKind::InvalidRequest
        );
        engine.start(req, None).unwrap();
        assert_eq!(
            engine.start(req, None).unwrap_err().kind(),
            ErrorKind::RequestAlreadyActive
        );
        assert_eq!(
            engine.free(&mut req).unwrap_err().kind(),
            ErrorKind::RequestAlreadyActive
        );
        engine.cancel(req).unwrap();
        assert_eq!(
            engine.start(req, None).unwrap_err().kind(),
            ErrorKind::RequestAlreadyComplete
        );
        assert!(engine.wait(&mut req).unwrap().test_cancelled());
        assert!(!req.is_null());
        engine.free(&mut req).unwrap();
        assert!(req.is_null());
    }

    #[test]
    fn finalize_cancels_pending_receives() {
        let context = context();
        let mut engine = context.engine();
        let mut buf = [0i32; 1];
        let mut recv = engine.issue_receive(params(&mut buf, 0, 1)).unwrap();
        engine.finalize().unwrap();
        assert_eq!(engine.lifecycle, Lifecycle::Finalized);
        assert_eq!(
            engine.wait(&mut recv).unwrap_err().kind(),
            ErrorKind::AlreadyFinalized
        );
        assert_eq!(
            engine.finalize().unwrap_err().kind(),
            ErrorKind::AlreadyFinalized
        );
    }
}
