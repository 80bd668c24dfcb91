//! Persistent requests
//!
//! A persistent request binds the arguments of a send or receive once and can then be started
//! any number of times. Each start issues the operation anew; completing it with `wait` or `test`
//! makes the request inactive again, ready for the next start. The buffer stays borrowed for the
//! life of the request and can be accessed in between runs.
//!
//! # Standard section(s)
//!
//! 3.9

use std::fmt;

use log::debug;

use crate::datatype::{Pointer, PointerMut};
use crate::engine::{Context, RawBuffer};
use crate::error::Result;
use crate::point_to_point::Status;
use crate::raw::RequestHandle;

enum Binding<'a, B: ?Sized> {
    Send(&'a B),
    // The function re-derives the raw buffer from the exclusive borrow on every start.
    Receive(&'a mut B, fn(&mut B) -> RawBuffer),
}

/// A persistent send or receive bound to a buffer of type `B`
///
/// Created by [`Destination::send_init`](crate::point_to_point::Destination::send_init) and
/// [`Source::receive_init`](crate::point_to_point::Source::receive_init). Dropping an active
/// request cancels and waits for it, then the request is freed.
///
/// # Examples
///
/// ```
/// use mpi_p2p::traits::*;
/// use mpi_p2p::transport::loopback::Loopback;
///
/// let universe = mpi_p2p::initialize(Loopback::single()).unwrap();
/// let world = universe.world();
/// let me = world.this_process();
///
/// let mut incoming = [0i64; 2];
/// let mut recv = me.receive_init(&mut incoming[..]).unwrap();
/// for round in 0..3i64 {
///     recv.start().unwrap();
///     me.send(&[round, -round][..]).unwrap();
///     recv.wait();
///     assert_eq!(recv.buffer().unwrap(), &[round, -round][..]);
/// }
/// recv.free().unwrap();
/// ```
///
/// # Standard section(s)
///
/// 3.9
pub struct PersistentRequest<'a, B: ?Sized + Pointer> {
    request: RequestHandle,
    context: Context,
    binding: Binding<'a, B>,
}

impl<'a, B: ?Sized + Pointer> PersistentRequest<'a, B> {
    pub(crate) fn send(request: RequestHandle, context: Context, buffer: &'a B) -> Self {
        PersistentRequest {
            request,
            context,
            binding: Binding::Send(buffer),
        }
    }

    pub(crate) fn receive(request: RequestHandle, context: Context, buffer: &'a mut B) -> Self
    where
        B: PointerMut,
    {
        PersistentRequest {
            request,
            context,
            binding: Binding::Receive(buffer, RawBuffer::from_buffer_mut::<B>),
        }
    }

    /// Start the bound operation.
    ///
    /// Fails with `RequestAlreadyActive` while a previous start is in flight and with
    /// `RequestAlreadyComplete` if a finished run has not been completed with `wait` or `test`.
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    pub fn start(&mut self) -> Result<()> {
        let buffer = match self.binding {
            Binding::Send(buffer) => RawBuffer::from_buffer(buffer),
            Binding::Receive(ref mut buffer, to_raw) => to_raw(&mut **buffer),
        };
        self.context.engine().start(self.request, Some(buffer))
    }

    /// Wait for the current run to finish; the request becomes inactive.
    ///
    /// An inactive request yields an empty status at once. A failure of the operation is reported
    /// in the returned status.
    pub fn wait(&mut self) -> Status {
        let mut request = self.request;
        self.context
            .wait(&mut request)
            .unwrap_or_else(|err| Status::from_error(err.kind()))
    }

    /// Test whether the current run has finished; if so the request becomes inactive.
    pub fn test(&mut self) -> Option<Status> {
        let mut request = self.request;
        self.context
            .test(&mut request)
            .unwrap_or_else(|err| Some(Status::from_error(err.kind())))
    }

    /// Initiate cancellation of the current run.
    ///
    /// Fails with `InvalidRequest` if the request is inactive.
    pub fn cancel(&self) -> Result<()> {
        self.context.cancel(self.request)
    }

    /// Whether a run has been started and not yet completed
    pub fn is_active(&self) -> bool {
        let inactive = self.context.engine().is_inactive(self.request);
        !inactive.unwrap_or(true)
    }

    /// The bound buffer, while the request is inactive
    pub fn buffer(&self) -> Option<&B> {
        if self.is_active() {
            return None;
        }
        match self.binding {
            Binding::Send(buffer) => Some(buffer),
            Binding::Receive(ref buffer, _) => Some(&**buffer),
        }
    }

    /// The bound receive buffer, while the request is inactive
    ///
    /// `None` for send requests.
    pub fn buffer_mut(&mut self) -> Option<&mut B> {
        if self.is_active() {
            return None;
        }
        match self.binding {
            Binding::Send(_) => None,
            Binding::Receive(ref mut buffer, _) => Some(&mut **buffer),
        }
    }

    /// Free the request.
    ///
    /// Fails with `RequestAlreadyActive` while a run is in flight; the request is then cleaned up
    /// when it is dropped.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn free(mut self) -> Result<()> {
        self.context.request_free(&mut self.request)
    }
}

/// Start every request of `requests`.
///
/// Every request is started even if an earlier one fails; the first error is returned.
///
/// # Standard section(s)
///
/// 3.9
pub fn start_all<B: ?Sized + Pointer>(requests: &mut [PersistentRequest<'_, B>]) -> Result<()> {
    let mut first = Ok(());
    for request in requests.iter_mut() {
        if let Err(err) = request.start() {
            debug!("start_all: {:?} failed to start: {}", request.request, err);
            if first.is_ok() {
                first = Err(err);
            }
        }
    }
    first
}

impl<'a, B: ?Sized + Pointer> Drop for PersistentRequest<'a, B> {
    fn drop(&mut self) {
        if self.request.is_null() {
            return;
        }
        let inactive = self.context.engine().is_inactive(self.request);
        if let Ok(false) = inactive {
            if let Err(err) = self.context.cancel(self.request) {
                debug!("cancel on drop of {:?} failed: {}", self.request, err);
            }
            let mut request = self.request;
            if let Err(err) = self.context.wait(&mut request) {
                debug!("wait on drop of {:?} failed: {}", self.request, err);
            }
        }
        if let Err(err) = self.context.request_free(&mut self.request) {
            debug!("free on drop of {:?} failed: {}", self.request, err);
        }
    }
}

impl<'a, B: ?Sized + Pointer> fmt::Debug for PersistentRequest<'a, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.binding {
            Binding::Send(_) => "send",
            Binding::Receive(..) => "receive",
        };
        f.debug_struct("PersistentRequest")
            .field("request", &self.request)
            .field("kind", &kind)
            .finish()
    }
}
