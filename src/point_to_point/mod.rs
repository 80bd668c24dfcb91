//! Point to point communication
//!
//! Endpoints of communication are mostly described by types that implement the `Source` and
//! `Destination` trait. Communication operations are implemented as default methods on those
//! traits.
//!
//! Every operation is validated before anything reaches the transport: a negative count, an
//! uncommitted datatype, a tag outside of `0..=tag_ub`, a rank outside of the communicator or a
//! datatype reaching outside of the buffer are reported synchronously. Errors that occur while an
//! operation is in flight end up in its completion [`Status`]; the blocking forms turn them into
//! an `Err`.
//!
//! Communication with the null process (`PROC_NULL`) succeeds at once without touching the
//! transport. A receive from it yields a status with source `PROC_NULL`, tag `ANY_TAG` and a
//! count of zero.

use conv::ConvUtil;
use log::debug;

use crate::datatype::traits::*;
use crate::datatype::Datatype;
use crate::engine::{Params, RawBuffer};
use crate::error::{Error, ErrorKind, Result, SUCCESS};
use crate::raw::RequestHandle;
use crate::request::{PersistentRequest, Request, Scope};
use crate::topology::traits::*;
use crate::topology::{AnyProcess, Process, Rank, ANY_SOURCE, ANY_TAG, PROC_NULL, UNDEFINED};
use crate::transport::SendMode;
use crate::{Count, Tag};

/// Point to point communication traits
pub mod traits {
    pub use super::{Destination, Source};
}

/// Describes the result of a point to point operation.
///
/// # Standard section(s)
///
/// 3.2.5
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    source: Rank,
    tag: Tag,
    error: i32,
    bytes: usize,
    cancelled: bool,
}

impl Status {
    /// The empty status: any source, any tag, no error and no data
    ///
    /// Returned for null handles and inactive persistent requests.
    pub fn empty() -> Status {
        Status {
            source: ANY_SOURCE,
            tag: ANY_TAG,
            error: SUCCESS,
            bytes: 0,
            cancelled: false,
        }
    }

    /// An empty status recording the error `kind`
    pub fn from_error(kind: ErrorKind) -> Status {
        Status {
            error: kind.code(),
            ..Status::empty()
        }
    }

    pub(crate) fn completed(source: Rank, tag: Tag, bytes: usize, error: Option<ErrorKind>) -> Status {
        Status {
            source,
            tag,
            error: error.map_or(SUCCESS, ErrorKind::code),
            bytes,
            cancelled: false,
        }
    }

    pub(crate) fn null_peer() -> Status {
        Status {
            source: PROC_NULL,
            ..Status::empty()
        }
    }

    pub(crate) fn cancelled() -> Status {
        Status {
            cancelled: true,
            ..Status::empty()
        }
    }

    /// The rank of the message source
    pub fn source_rank(&self) -> Rank {
        self.source
    }

    /// The message tag
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// The error the operation completed with, if any
    pub fn error(&self) -> Option<ErrorKind> {
        ErrorKind::from_code(self.error)
    }

    /// The error class of the operation, `SUCCESS` if it succeeded
    pub fn error_code(&self) -> i32 {
        self.error
    }

    /// Number of bytes transferred
    pub fn byte_count(&self) -> usize {
        self.bytes
    }

    /// Number of instances of the type contained in the message
    ///
    /// `UNDEFINED` if the bytes transferred are not a whole number of instances. A datatype of
    /// size zero counts `0` for an empty message and `UNDEFINED` otherwise.
    ///
    /// # Standard section(s)
    ///
    /// 3.2.5
    pub fn count(&self, datatype: &Datatype) -> Count {
        let size = datatype.size();
        if size == 0 {
            return if self.bytes == 0 { 0 } else { UNDEFINED };
        }
        if self.bytes % size != 0 {
            return UNDEFINED;
        }
        (self.bytes / size).value_as().unwrap_or(UNDEFINED)
    }

    /// Whether the operation was cancelled rather than completed
    ///
    /// # Standard section(s)
    ///
    /// 3.8.4
    pub fn test_cancelled(&self) -> bool {
        self.cancelled
    }

    /// `Ok(self)` if the operation succeeded, the recorded error otherwise
    pub fn result(self) -> Result<Status> {
        match self.error() {
            Some(kind) => Err(Error::from_status(kind, self)),
            None => Ok(self),
        }
    }
}

fn send_params<C, Buf>(comm: &C, dest: Rank, buf: &Buf, tag: Tag) -> Params
where
    C: Communicator,
    Buf: ?Sized + Buffer,
{
    Params {
        peer: dest,
        tag,
        context: comm.context_id(),
        group: comm.group().clone(),
        count: buf.count(),
        datatype: buf.as_datatype(),
        buffer: RawBuffer::from_buffer(buf),
    }
}

fn receive_params<C, Buf>(comm: &C, source: Rank, buf: &mut Buf, tag: Tag) -> Params
where
    C: Communicator,
    Buf: ?Sized + BufferMut,
{
    Params {
        peer: source,
        tag,
        context: comm.context_id(),
        group: comm.group().clone(),
        count: buf.count(),
        datatype: buf.as_datatype(),
        buffer: RawBuffer::from_buffer_mut(buf),
    }
}

fn issue_send<C, Buf>(comm: &C, dest: Rank, buf: &Buf, tag: Tag, mode: SendMode) -> Result<RequestHandle>
where
    C: Communicator,
    Buf: ?Sized + Buffer,
{
    let params = send_params(comm, dest, buf, tag);
    comm.context().engine().issue_send(params, mode)
}

fn issue_receive<C, Buf>(comm: &C, source: Rank, buf: &mut Buf, tag: Tag) -> Result<RequestHandle>
where
    C: Communicator,
    Buf: ?Sized + BufferMut,
{
    let params = receive_params(comm, source, buf, tag);
    comm.context().engine().issue_receive(params)
}

fn blocking_send<C, Buf>(comm: &C, dest: Rank, buf: &Buf, tag: Tag, mode: SendMode) -> Result<()>
where
    C: Communicator,
    Buf: ?Sized + Buffer,
{
    let mut request = issue_send(comm, dest, buf, tag, mode)?;
    comm.context().wait(&mut request)?.result().map(|_| ())
}

fn immediate_send<'a, C, Sc, Buf>(
    comm: &C,
    scope: Sc,
    dest: Rank,
    buf: &'a Buf,
    tag: Tag,
    mode: SendMode,
) -> Result<Request<'a, Sc>>
where
    C: Communicator,
    Sc: Scope<'a>,
    Buf: 'a + ?Sized + Buffer,
{
    let request = issue_send(comm, dest, buf, tag, mode)?;
    // Safety: `buf` is borrowed for `'a` and the request is registered with a scope of `'a`.
    Ok(unsafe { Request::from_raw(request, comm.context().clone(), scope) })
}

/// Something that can be used as the source in a point to point receive operation
///
/// # Examples
///
/// - A `Process` used as a source for a receive operation will receive data only from the
///   identified process.
/// - A communicator can also be used as a source via the `AnyProcess` identifier.
///
/// # Standard section(s)
///
/// 3.2.3
pub trait Source: AsCommunicator {
    /// `Rank` that identifies the source
    fn source_rank(&self) -> Rank;

    /// Receive a message containing a single instance of type `Msg`.
    ///
    /// Receive a message from `Source` `&self` tagged `tag` containing a single instance of type
    /// `Msg`.
    ///
    /// # Standard section(s)
    ///
    /// 3.2.4
    fn receive_with_tag<Msg>(&self, tag: Tag) -> Result<(Msg, Status)>
    where
        Msg: Equivalence + Default,
    {
        let mut res = Msg::default();
        let status = self.receive_into_with_tag(&mut res, tag)?;
        Ok((res, status))
    }

    /// Receive a message containing a single instance of type `Msg`.
    ///
    /// Receive a message from `Source` `&self` containing a single instance of type `Msg`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mpi_p2p::traits::*;
    /// use mpi_p2p::transport::loopback::Loopback;
    ///
    /// let universe = mpi_p2p::initialize(Loopback::single()).unwrap();
    /// let world = universe.world();
    ///
    /// world.this_process().send_with_tag(&42u32, 5).unwrap();
    /// let (msg, status) = world.any_process().receive::<u32>().unwrap();
    /// assert_eq!(msg, 42);
    /// assert_eq!(status.tag(), 5);
    /// ```
    ///
    /// # Standard section(s)
    ///
    /// 3.2.4
    fn receive<Msg>(&self) -> Result<(Msg, Status)>
    where
        Msg: Equivalence + Default,
    {
        self.receive_with_tag(ANY_TAG)
    }

    /// Receive a message into a `Buffer`.
    ///
    /// Receive a message from `Source` `&self` tagged `tag` into `Buffer` `buf`. An error that
    /// occurred while the message was in flight, e.g. `MessageTruncated`, is returned as an
    /// `Err` carrying the completion status.
    ///
    /// # Standard section(s)
    ///
    /// 3.2.4
    fn receive_into_with_tag<Buf>(&self, buf: &mut Buf, tag: Tag) -> Result<Status>
    where
        Buf: ?Sized + BufferMut,
    {
        let comm = self.as_communicator();
        let mut request = issue_receive(comm, self.source_rank(), buf, tag)?;
        comm.context().wait(&mut request)?.result()
    }

    /// Receive a message into a `Buffer`.
    ///
    /// Receive a message from `Source` `&self` into `Buffer` `buf`.
    ///
    /// # Standard section(s)
    ///
    /// 3.2.4
    fn receive_into<Buf>(&self, buf: &mut Buf) -> Result<Status>
    where
        Buf: ?Sized + BufferMut,
    {
        self.receive_into_with_tag(buf, ANY_TAG)
    }

    /// Initiate an immediate (non-blocking) receive operation.
    ///
    /// Initiate receiving a message matching `tag` into `buf`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_receive_into_with_tag<'a, Sc, Buf>(
        &self,
        scope: Sc,
        buf: &'a mut Buf,
        tag: Tag,
    ) -> Result<Request<'a, Sc>>
    where
        Buf: 'a + ?Sized + BufferMut,
        Sc: Scope<'a>,
    {
        let comm = self.as_communicator();
        let request = issue_receive(comm, self.source_rank(), buf, tag)?;
        // Safety: `buf` is borrowed for `'a` and the request is registered with a scope of `'a`.
        Ok(unsafe { Request::from_raw(request, comm.context().clone(), scope) })
    }

    /// Initiate an immediate (non-blocking) receive operation.
    ///
    /// Initiate receiving a message into `buf`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_receive_into<'a, Sc, Buf>(&self, scope: Sc, buf: &'a mut Buf) -> Result<Request<'a, Sc>>
    where
        Buf: 'a + ?Sized + BufferMut,
        Sc: Scope<'a>,
    {
        self.immediate_receive_into_with_tag(scope, buf, ANY_TAG)
    }

    /// Create a persistent receive into `buf` matching `tag`.
    ///
    /// The request is inactive until it is started.
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn receive_init_with_tag<'a, Buf>(&self, buf: &'a mut Buf, tag: Tag) -> Result<PersistentRequest<'a, Buf>>
    where
        Buf: 'a + ?Sized + BufferMut,
    {
        let comm = self.as_communicator();
        let params = receive_params(comm, self.source_rank(), buf, tag);
        let request = comm.context().engine().receive_init(params)?;
        Ok(PersistentRequest::receive(request, comm.context().clone(), buf))
    }

    /// Create a persistent receive into `buf`.
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn receive_init<'a, Buf>(&self, buf: &'a mut Buf) -> Result<PersistentRequest<'a, Buf>>
    where
        Buf: 'a + ?Sized + BufferMut,
    {
        self.receive_init_with_tag(buf, ANY_TAG)
    }
}

impl<'a, C: 'a + Communicator> Source for AnyProcess<'a, C> {
    fn source_rank(&self) -> Rank {
        ANY_SOURCE
    }
}

impl<'a, C: 'a + Communicator> Source for Process<'a, C> {
    fn source_rank(&self) -> Rank {
        self.rank()
    }
}

/// Something that can be used as the destination in a point to point send operation
///
/// # Examples
///
/// - Using a `Process` as the destination will send data to that specific process.
///
/// # Standard section(s)
///
/// 3.2.3
pub trait Destination: AsCommunicator {
    /// `Rank` that identifies the destination
    fn destination_rank(&self) -> Rank;

    /// Blocking standard mode send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self` and tag it.
    ///
    /// # Standard section(s)
    ///
    /// 3.2.1
    fn send_with_tag<Buf>(&self, buf: &Buf, tag: Tag) -> Result<()>
    where
        Buf: ?Sized + Buffer,
    {
        blocking_send(self.as_communicator(), self.destination_rank(), buf, tag, SendMode::Standard)
    }

    /// Blocking standard mode send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mpi_p2p::traits::*;
    /// use mpi_p2p::transport::loopback::Loopback;
    ///
    /// let universe = mpi_p2p::initialize(Loopback::single()).unwrap();
    /// let world = universe.world();
    ///
    /// let v = vec![1.0f64, 2.0, 3.0];
    /// world.process_at_rank(0).send(&v[..]).unwrap();
    /// world.null_process().send(&v[..]).unwrap();
    /// ```
    ///
    /// # Standard section(s)
    ///
    /// 3.2.1
    fn send<Buf>(&self, buf: &Buf) -> Result<()>
    where
        Buf: ?Sized + Buffer,
    {
        self.send_with_tag(buf, Tag::default())
    }

    /// Blocking buffered mode send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self` and tag it. The message is
    /// copied into the attached buffered-send region; fails with `BufferExhausted` if it does
    /// not fit.
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn buffered_send_with_tag<Buf>(&self, buf: &Buf, tag: Tag) -> Result<()>
    where
        Buf: ?Sized + Buffer,
    {
        blocking_send(self.as_communicator(), self.destination_rank(), buf, tag, SendMode::Buffered)
    }

    /// Blocking buffered mode send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self`.
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn buffered_send<Buf>(&self, buf: &Buf) -> Result<()>
    where
        Buf: ?Sized + Buffer,
    {
        self.buffered_send_with_tag(buf, Tag::default())
    }

    /// Blocking synchronous mode send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self` and tag it.
    ///
    /// Completes only once the matching receive operation has started.
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn synchronous_send_with_tag<Buf>(&self, buf: &Buf, tag: Tag) -> Result<()>
    where
        Buf: ?Sized + Buffer,
    {
        blocking_send(
            self.as_communicator(),
            self.destination_rank(),
            buf,
            tag,
            SendMode::Synchronous,
        )
    }

    /// Blocking synchronous mode send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self`.
    ///
    /// Completes only once the matching receive operation has started.
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn synchronous_send<Buf>(&self, buf: &Buf) -> Result<()>
    where
        Buf: ?Sized + Buffer,
    {
        self.synchronous_send_with_tag(buf, Tag::default())
    }

    /// Blocking ready mode send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self` and tag it.
    ///
    /// Fails if the matching receive operation has not been posted.
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn ready_send_with_tag<Buf>(&self, buf: &Buf, tag: Tag) -> Result<()>
    where
        Buf: ?Sized + Buffer,
    {
        blocking_send(self.as_communicator(), self.destination_rank(), buf, tag, SendMode::Ready)
    }

    /// Blocking ready mode send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self`.
    ///
    /// Fails if the matching receive operation has not been posted.
    ///
    /// # Standard section(s)
    ///
    /// 3.4
    fn ready_send<Buf>(&self, buf: &Buf) -> Result<()>
    where
        Buf: ?Sized + Buffer,
    {
        self.ready_send_with_tag(buf, Tag::default())
    }

    /// Initiate an immediate (non-blocking) standard mode send operation.
    ///
    /// Initiate sending the data in `buf` in standard mode and tag it.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_send_with_tag<'a, Sc, Buf>(&self, scope: Sc, buf: &'a Buf, tag: Tag) -> Result<Request<'a, Sc>>
    where
        Buf: 'a + ?Sized + Buffer,
        Sc: Scope<'a>,
    {
        immediate_send(
            self.as_communicator(),
            scope,
            self.destination_rank(),
            buf,
            tag,
            SendMode::Standard,
        )
    }

    /// Initiate an immediate (non-blocking) standard mode send operation.
    ///
    /// Initiate sending the data in `buf` in standard mode.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_send<'a, Sc, Buf>(&self, scope: Sc, buf: &'a Buf) -> Result<Request<'a, Sc>>
    where
        Buf: 'a + ?Sized + Buffer,
        Sc: Scope<'a>,
    {
        self.immediate_send_with_tag(scope, buf, Tag::default())
    }

    /// Initiate an immediate (non-blocking) buffered mode send operation.
    ///
    /// Initiate sending the data in `buf` in buffered mode and tag it. The request is complete as
    /// soon as the message has been copied into the buffered-send region.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_buffered_send_with_tag<'a, Sc, Buf>(
        &self,
        scope: Sc,
        buf: &'a Buf,
        tag: Tag,
    ) -> Result<Request<'a, Sc>>
    where
        Buf: 'a + ?Sized + Buffer,
        Sc: Scope<'a>,
    {
        immediate_send(
            self.as_communicator(),
            scope,
            self.destination_rank(),
            buf,
            tag,
            SendMode::Buffered,
        )
    }

    /// Initiate an immediate (non-blocking) buffered mode send operation.
    ///
    /// Initiate sending the data in `buf` in buffered mode.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_buffered_send<'a, Sc, Buf>(&self, scope: Sc, buf: &'a Buf) -> Result<Request<'a, Sc>>
    where
        Buf: 'a + ?Sized + Buffer,
        Sc: Scope<'a>,
    {
        self.immediate_buffered_send_with_tag(scope, buf, Tag::default())
    }

    /// Initiate an immediate (non-blocking) synchronous mode send operation.
    ///
    /// Initiate sending the data in `buf` in synchronous mode and tag it.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_synchronous_send_with_tag<'a, Sc, Buf>(
        &self,
        scope: Sc,
        buf: &'a Buf,
        tag: Tag,
    ) -> Result<Request<'a, Sc>>
    where
        Buf: 'a + ?Sized + Buffer,
        Sc: Scope<'a>,
    {
        immediate_send(
            self.as_communicator(),
            scope,
            self.destination_rank(),
            buf,
            tag,
            SendMode::Synchronous,
        )
    }

    /// Initiate an immediate (non-blocking) synchronous mode send operation.
    ///
    /// Initiate sending the data in `buf` in synchronous mode.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_synchronous_send<'a, Sc, Buf>(&self, scope: Sc, buf: &'a Buf) -> Result<Request<'a, Sc>>
    where
        Buf: 'a + ?Sized + Buffer,
        Sc: Scope<'a>,
    {
        self.immediate_synchronous_send_with_tag(scope, buf, Tag::default())
    }

    /// Initiate an immediate (non-blocking) ready mode send operation.
    ///
    /// Initiate sending the data in `buf` in ready mode and tag it. A missing matching receive is
    /// reported in the status of the request.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_ready_send_with_tag<'a, Sc, Buf>(
        &self,
        scope: Sc,
        buf: &'a Buf,
        tag: Tag,
    ) -> Result<Request<'a, Sc>>
    where
        Buf: 'a + ?Sized + Buffer,
        Sc: Scope<'a>,
    {
        immediate_send(
            self.as_communicator(),
            scope,
            self.destination_rank(),
            buf,
            tag,
            SendMode::Ready,
        )
    }

    /// Initiate an immediate (non-blocking) ready mode send operation.
    ///
    /// Initiate sending the data in `buf` in ready mode.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.2
    fn immediate_ready_send<'a, Sc, Buf>(&self, scope: Sc, buf: &'a Buf) -> Result<Request<'a, Sc>>
    where
        Buf: 'a + ?Sized + Buffer,
        Sc: Scope<'a>,
    {
        self.immediate_ready_send_with_tag(scope, buf, Tag::default())
    }

    /// Create a persistent send of `buf` in `mode`, tagged `tag`.
    ///
    /// The message is packed anew from `buf` every time the request is started.
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn send_init_with_mode<'a, Buf>(&self, buf: &'a Buf, tag: Tag, mode: SendMode) -> Result<PersistentRequest<'a, Buf>>
    where
        Buf: 'a + ?Sized + Buffer,
    {
        let comm = self.as_communicator();
        let params = send_params(comm, self.destination_rank(), buf, tag);
        let request = comm.context().engine().send_init(params, mode)?;
        Ok(PersistentRequest::send(request, comm.context().clone(), buf))
    }

    /// Create a persistent standard mode send of `buf`, tagged `tag`.
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn send_init_with_tag<'a, Buf>(&self, buf: &'a Buf, tag: Tag) -> Result<PersistentRequest<'a, Buf>>
    where
        Buf: 'a + ?Sized + Buffer,
    {
        self.send_init_with_mode(buf, tag, SendMode::Standard)
    }

    /// Create a persistent standard mode send of `buf`.
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    fn send_init<'a, Buf>(&self, buf: &'a Buf) -> Result<PersistentRequest<'a, Buf>>
    where
        Buf: 'a + ?Sized + Buffer,
    {
        self.send_init_with_tag(buf, Tag::default())
    }
}

impl<'a, C: 'a + Communicator> Destination for Process<'a, C> {
    fn destination_rank(&self) -> Rank {
        self.rank()
    }
}

/// Sends `msg` to `destination` tagging it `sendtag` and simultaneously receives an
/// instance of `R` tagged `receivetag` from `source`.
///
/// # Standard section(s)
///
/// 3.10
pub fn send_receive_with_tags<M, D, R, S>(
    msg: &M,
    destination: &D,
    sendtag: Tag,
    source: &S,
    receivetag: Tag,
) -> Result<(R, Status)>
where
    M: ?Sized + Buffer,
    D: Destination,
    R: Equivalence + Default,
    S: Source,
{
    let mut res = R::default();
    let status = send_receive_into_with_tags(msg, destination, sendtag, &mut res, source, receivetag)?;
    Ok((res, status))
}

/// Sends `msg` to `destination` and simultaneously receives an instance of `R` from
/// `source`.
///
/// # Standard section(s)
///
/// 3.10
pub fn send_receive<R, M, D, S>(msg: &M, destination: &D, source: &S) -> Result<(R, Status)>
where
    M: ?Sized + Buffer,
    D: Destination,
    R: Equivalence + Default,
    S: Source,
{
    send_receive_with_tags(msg, destination, Tag::default(), source, ANY_TAG)
}

/// Sends the contents of `msg` to `destination` tagging it `sendtag` and
/// simultaneously receives a message tagged `receivetag` from `source` into
/// `buf`.
///
/// Posts the receive, then the send, and waits for both. Returns the status of the receive; the
/// first operation that failed is reported as an `Err` carrying its status. `source` and
/// `destination` must belong to the same communicator, otherwise the call fails with
/// `InvalidCommunicator`.
///
/// # Standard section(s)
///
/// 3.10
pub fn send_receive_into_with_tags<M, D, B, S>(
    msg: &M,
    destination: &D,
    sendtag: Tag,
    buf: &mut B,
    source: &S,
    receivetag: Tag,
) -> Result<Status>
where
    M: ?Sized + Buffer,
    D: Destination,
    B: ?Sized + BufferMut,
    S: Source,
{
    let (rcomm, scomm) = (source.as_communicator(), destination.as_communicator());
    if !rcomm.context().same_engine(scomm.context()) || rcomm.context_id() != scomm.context_id() {
        return Err(Error::with_detail(
            ErrorKind::InvalidCommunicator,
            "source and destination belong to different communicators",
        ));
    }
    let context = rcomm.context();
    let mut requests = [RequestHandle::NULL; 2];
    requests[0] = issue_receive(rcomm, source.source_rank(), buf, receivetag)?;
    requests[1] = match issue_send(scomm, destination.destination_rank(), msg, sendtag, SendMode::Standard) {
        Ok(request) => request,
        Err(err) => {
            // The receive still points into `buf`, it must be gone before returning.
            if let Err(cancel_err) = context.cancel(requests[0]) {
                debug!("send_receive: cancel of {:?} failed: {}", requests[0], cancel_err);
            }
            if let Err(wait_err) = context.wait(&mut requests[0]) {
                debug!("send_receive: wait for {:?} failed: {}", requests[0], wait_err);
            }
            if !requests[0].is_null() {
                if let Err(free_err) = context.request_free(&mut requests[0]) {
                    debug!("send_receive: free of {:?} failed: {}", requests[0], free_err);
                }
            }
            return Err(err);
        }
    };
    match context.wait_all(&mut requests) {
        Ok(statuses) => Ok(statuses[0]),
        Err(err) => {
            let failed = err
                .statuses()
                .iter()
                .find_map(|&(_, status)| status.error().map(|kind| (kind, status)));
            match failed {
                Some((kind, status)) => Err(Error::from_status(kind, status)),
                None => Err(err),
            }
        }
    }
}

/// Sends the contents of `msg` to `destination` and
/// simultaneously receives a message from `source` into
/// `buf`.
///
/// # Examples
///
/// ```
/// use mpi_p2p::point_to_point::send_receive_into;
/// use mpi_p2p::traits::*;
/// use mpi_p2p::transport::loopback::Loopback;
///
/// let universe = mpi_p2p::initialize(Loopback::single()).unwrap();
/// let world = universe.world();
/// let me = world.this_process();
///
/// let mut buf = [0u8; 4];
/// let status = send_receive_into(&b"ping"[..], &me, &mut buf[..], &me).unwrap();
/// assert_eq!(&buf, b"ping");
/// assert_eq!(status.source_rank(), 0);
/// ```
///
/// # Standard section(s)
///
/// 3.10
pub fn send_receive_into<M, D, B, S>(msg: &M, destination: &D, buf: &mut B, source: &S) -> Result<Status>
where
    M: ?Sized + Buffer,
    D: Destination,
    B: ?Sized + BufferMut,
    S: Source,
{
    send_receive_into_with_tags(msg, destination, Tag::default(), buf, source, ANY_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Equivalence;

    #[test]
    fn count_of_zero_size_types() {
        let marker = Datatype::lower_bound_marker();
        assert_eq!(marker.size(), 0);
        let mut status = Status::empty();
        assert_eq!(status.count(&marker), 0);
        status.bytes = 8;
        assert_eq!(status.count(&marker), UNDEFINED);
    }

    #[test]
    fn count_requires_whole_instances() {
        let status = Status::completed(1, 2, 12, None);
        assert_eq!(status.count(&i32::equivalent_datatype()), 3);
        assert_eq!(status.count(&f64::equivalent_datatype()), UNDEFINED);
        assert_eq!(status.count(&u8::equivalent_datatype()), 12);
    }

    #[test]
    fn error_round_trips_through_code() {
        let status = Status::completed(0, 0, 3, Some(ErrorKind::MessageTruncated));
        assert_eq!(status.error(), Some(ErrorKind::MessageTruncated));
        assert_eq!(status.error_code(), ErrorKind::MessageTruncated.code());
        let err = status.result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MessageTruncated);
        assert_eq!(err.statuses(), &[(0, status)]);

        assert_eq!(Status::empty().error_code(), SUCCESS);
        assert!(Status::empty().result().is_ok());
    }

    #[test]
    fn special_statuses() {
        let null = Status::null_peer();
        assert_eq!(null.source_rank(), PROC_NULL);
        assert_eq!(null.tag(), ANY_TAG);
        assert_eq!(null.count(&i32::equivalent_datatype()), 0);

        let cancelled = Status::cancelled();
        assert!(cancelled.test_cancelled());
        assert!(cancelled.error().is_none());
    }
}
