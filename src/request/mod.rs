//! Request objects for non-blocking operations
//!
//! Non-blocking operations such as `immediate_send()` return request objects that borrow any
//! buffers involved in the operation so as to ensure proper access restrictions. In order to
//! release the borrowed buffers from the request objects, a completion operation such as
//! [`wait()`](AsyncRequest::wait) or [`test()`](AsyncRequest::test) must be used on the request
//! object.
//!
//! **Note:** If the `Request` is dropped (as opposed to calling `wait` or `test` explicitly), the
//! program will panic.
//!
//! To enforce this rule, every request object must be registered to some pre-existing
//! [`Scope`].  At the end of a `Scope`, all its remaining requests will be waited for until
//! completion.  Scopes can be created using either [`scope`] or [`StaticScope`].
//!
//! To handle request completion in an RAII style, a request can be wrapped in either
//! [`WaitGuard`] or [`CancelGuard`], which will follow the respective policy for completing the
//! operation.  When the guard is dropped, the request will be automatically unregistered from its
//! `Scope`.
//!
//! Below the safe wrappers, a [`Context`] completes plain [`RequestHandle`]s. The batch forms
//! (`wait_any`, `test_all`, ...) skip null handles, never stop at the first failed operation and
//! report failures as `ErrorInStatus` carrying the status of every operation they completed.
//!
//! # Standard section(s)
//!
//! 3.7, 3.8.4

use std::cell::Cell;
use std::hint;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;

use log::debug;
use smallvec::SmallVec;

use crate::engine::{Context, Engine};
use crate::error::{Error, ErrorKind, Result};
use crate::point_to_point::Status;
use crate::raw::traits::*;
use crate::raw::RequestHandle;

pub mod persistent;

pub use self::persistent::{start_all, PersistentRequest};

/// Request traits
pub mod traits {
    pub use super::{AsyncRequest, CollectRequests};
}

/// Result type for `test_any`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestAny {
    /// Indicates that there are no active requests in the `requests` slice.
    NoneActive,
    /// Indicates that, while there are active requests in the `requests` slice, none of them were
    /// completed.
    NoneComplete,
    /// Indicates which request in the `requests` slice was completed.
    Completed(usize, Status),
}

enum Probe {
    Skip,
    Pending,
    Done(Status),
}

// A stale handle counts as an operation that completed with `InvalidRequest`, so that one bad
// entry does not keep a batch from completing.
fn probe(engine: &mut Engine, request: &mut RequestHandle, skip_inactive: bool) -> Result<Probe> {
    if request.is_null() {
        return Ok(Probe::Skip);
    }
    if skip_inactive && matches!(engine.is_inactive(*request), Ok(true)) {
        return Ok(Probe::Skip);
    }
    match engine.test(request) {
        Ok(Some(status)) => Ok(Probe::Done(status)),
        Ok(None) => Ok(Probe::Pending),
        Err(err) if err.kind() == ErrorKind::InvalidRequest => {
            debug!("batch entry {:?} is stale", request);
            *request = RequestHandle::NULL;
            Ok(Probe::Done(Status::from_error(ErrorKind::InvalidRequest)))
        }
        Err(err) => Err(err),
    }
}

fn failed_in(completed: &[(usize, Status)]) -> bool {
    completed.iter().any(|(_, status)| status.error().is_some())
}

/// Completion of plain request handles
impl Context {
    /// Wait for the operation of `request` to finish.
    ///
    /// An immediate request is destroyed and `request` becomes null. A persistent request becomes
    /// inactive and keeps its handle. Fails with `InvalidRequest` for a null or stale handle.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn wait(&self, request: &mut RequestHandle) -> Result<Status> {
        self.engine().wait(request)
    }

    /// Test whether the operation of `request` has finished.
    ///
    /// Returns `None` while the operation is in flight, otherwise behaves like `wait`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn test(&self, request: &mut RequestHandle) -> Result<Option<Status>> {
        self.engine().test(request)
    }

    /// Initiate cancellation of the operation of `request`.
    ///
    /// Cancellation is best effort; a later completion reports through
    /// [`Status::test_cancelled`] whether the operation was cancelled or completed normally,
    /// never both. Cancelling an operation that has already completed has no effect.
    ///
    /// # Standard section(s)
    ///
    /// 3.8.4
    pub fn cancel(&self, request: RequestHandle) -> Result<()> {
        self.engine().cancel(request)
    }

    /// Release `request`, which becomes null.
    ///
    /// An immediate operation still in flight runs to completion and is destroyed then. A
    /// persistent request can only be freed while it is inactive.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn request_free(&self, request: &mut RequestHandle) -> Result<()> {
        self.engine().free(request)
    }

    /// The status of `request` if its operation has finished, without completing the request.
    ///
    /// A null handle yields an empty status.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn request_get_status(&self, request: RequestHandle) -> Result<Option<Status>> {
        self.engine().get_status(request)
    }

    /// Complete one operation of `requests` if any has finished.
    ///
    /// Null handles and inactive persistent requests are skipped. An operation that completed
    /// with an error is reported as `ErrorInStatus` carrying its index and status.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_any(&self, requests: &mut [RequestHandle]) -> Result<TestAny> {
        let mut engine = self.engine();
        let mut active = false;
        for (i, request) in requests.iter_mut().enumerate() {
            match probe(&mut engine, request, true)? {
                Probe::Skip => {}
                Probe::Pending => active = true,
                Probe::Done(status) => {
                    if status.error().is_some() {
                        return Err(Error::in_status(vec![(i, status)]));
                    }
                    return Ok(TestAny::Completed(i, status));
                }
            }
        }
        Ok(if active {
            TestAny::NoneComplete
        } else {
            TestAny::NoneActive
        })
    }

    /// Wait for one operation of `requests` to finish.
    ///
    /// Returns `None` if no handle names an active request.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_any(&self, requests: &mut [RequestHandle]) -> Result<Option<(usize, Status)>> {
        loop {
            match self.test_any(requests)? {
                TestAny::NoneActive => return Ok(None),
                TestAny::Completed(i, status) => return Ok(Some((i, status))),
                TestAny::NoneComplete => hint::spin_loop(),
            }
        }
    }

    /// Wait for all operations of `requests` to finish.
    ///
    /// The statuses are in the order of `requests`; null handles and inactive persistent requests
    /// yield empty statuses. If any operation failed, the result is `ErrorInStatus` carrying all
    /// statuses.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_all(&self, requests: &mut [RequestHandle]) -> Result<Vec<Status>> {
        let mut statuses: SmallVec<[Option<Status>; 8]> = requests
            .iter()
            .map(|request| {
                if request.is_null() {
                    Some(Status::empty())
                } else {
                    None
                }
            })
            .collect();
        loop {
            let mut pending = false;
            {
                let mut engine = self.engine();
                for (request, slot) in requests.iter_mut().zip(statuses.iter_mut()) {
                    if slot.is_some() {
                        continue;
                    }
                    match probe(&mut engine, request, false)? {
                        Probe::Skip => *slot = Some(Status::empty()),
                        Probe::Pending => pending = true,
                        Probe::Done(status) => *slot = Some(status),
                    }
                }
            }
            if !pending {
                break;
            }
            hint::spin_loop();
        }
        let statuses: Vec<Status> = statuses
            .into_iter()
            .map(|status| status.unwrap_or_else(Status::empty))
            .collect();
        if statuses.iter().any(|status| status.error().is_some()) {
            return Err(Error::in_status(statuses.into_iter().enumerate().collect()));
        }
        Ok(statuses)
    }

    /// Complete all operations of `requests` if all of them have finished.
    ///
    /// Returns `None`, completing nothing, while any operation is in flight.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_all(&self, requests: &mut [RequestHandle]) -> Result<Option<Vec<Status>>> {
        {
            let mut engine = self.engine();
            for &request in requests.iter() {
                match engine.get_status(request) {
                    Ok(Some(_)) => {}
                    Ok(None) => return Ok(None),
                    Err(err) if err.kind() == ErrorKind::InvalidRequest => {}
                    Err(err) => return Err(err),
                }
            }
        }
        self.wait_all(requests).map(Some)
    }

    /// Complete every operation of `requests` that has finished.
    ///
    /// Returns the indices and statuses of the completed operations, possibly none, or `None` if
    /// no handle names an active request.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_some(&self, requests: &mut [RequestHandle]) -> Result<Option<Vec<(usize, Status)>>> {
        let mut engine = self.engine();
        let mut active = false;
        let mut completed = Vec::new();
        for (i, request) in requests.iter_mut().enumerate() {
            match probe(&mut engine, request, true)? {
                Probe::Skip => {}
                Probe::Pending => active = true,
                Probe::Done(status) => completed.push((i, status)),
            }
        }
        if failed_in(&completed) {
            return Err(Error::in_status(completed));
        }
        if completed.is_empty() && !active {
            return Ok(None);
        }
        Ok(Some(completed))
    }

    /// Wait for at least one operation of `requests` to finish and complete all that have.
    ///
    /// Returns `None` if no handle names an active request.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_some(&self, requests: &mut [RequestHandle]) -> Result<Option<Vec<(usize, Status)>>> {
        loop {
            match self.test_some(requests)? {
                Some(completed) if completed.is_empty() => hint::spin_loop(),
                result => return Ok(result),
            }
        }
    }
}

/// A request object for a non-blocking operation registered with a `Scope` of lifetime `'a`
///
/// The `Scope` is needed to ensure that all buffers associated request will outlive the request
/// itself, even if the destructor of the request fails to run.
///
/// # Panics
///
/// Panics if the request object is dropped.  To prevent this, call `wait` or `test`.
/// Alternatively, wrap the request inside a `WaitGuard` or `CancelGuard`.
///
/// # Standard section(s)
///
/// 3.7.1
pub trait AsyncRequest<'a, S: Scope<'a>>: AsRaw<Raw = RequestHandle> + Sized {
    /// Unregister the request object from its scope and deconstruct it into its raw parts.
    ///
    /// # Safety
    ///
    /// The request may outlive its associated buffers.
    unsafe fn into_raw(self) -> (RequestHandle, Context, S);

    /// The request engine the request belongs to
    fn context(&self) -> &Context;

    /// Wait for an operation to finish.
    ///
    /// Will block execution of the calling thread until the associated operation has finished.
    /// A failure of the operation is reported in the returned status.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    fn wait(self) -> Status {
        let (mut request, context, _) = unsafe { self.into_raw() };
        context
            .wait(&mut request)
            .unwrap_or_else(|err| Status::from_error(err.kind()))
    }

    /// Test whether an operation has finished.
    ///
    /// If the operation has finished, `Status` is returned.  Otherwise returns the unfinished
    /// `Request`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    fn test(self) -> std::result::Result<Status, Self> {
        let mut request = self.as_raw();
        let tested = self.context().test(&mut request);
        match tested {
            Ok(None) => Err(self),
            Ok(Some(status)) => {
                unsafe { self.into_raw() };
                Ok(status)
            }
            Err(err) => {
                unsafe { self.into_raw() };
                Ok(Status::from_error(err.kind()))
            }
        }
    }

    /// Initiate cancellation of the request.
    ///
    /// The operation may still complete normally; `Status::test_cancelled` on the status
    /// returned by `wait` tells which happened.
    ///
    /// # Standard section(s)
    ///
    /// 3.8.4
    fn cancel(&self) -> Result<()> {
        self.context().cancel(self.as_raw())
    }

    /// The status of the operation if it has finished, without completing the request
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    fn get_status(&self) -> Result<Option<Status>> {
        self.context().request_get_status(self.as_raw())
    }

    /// Reduce the scope of a request.
    fn shrink_scope_to<'b, S2>(self, scope: S2) -> Request<'b, S2>
    where
        'a: 'b,
        S2: Scope<'b>,
    {
        unsafe {
            let (request, context, _) = self.into_raw();
            Request::from_raw(request, context, scope)
        }
    }
}

/// A request object for a non-blocking operation registered with a `Scope` of lifetime `'a`
///
/// The `Scope` is needed to ensure that all buffers associated request will outlive the request
/// itself, even if the destructor of the request fails to run.
///
/// # Panics
///
/// Panics if the request object is dropped.  To prevent this, call `wait` or `test`.
/// Alternatively, wrap the request inside a `WaitGuard` or `CancelGuard`.
///
/// # Standard section(s)
///
/// 3.7.1
#[must_use]
#[derive(Debug)]
pub struct Request<'a, S: Scope<'a> = StaticScope> {
    request: RequestHandle,
    context: Context,
    scope: S,
    phantom: PhantomData<Cell<&'a ()>>,
}

impl<'a, S: Scope<'a>> AsRaw for Request<'a, S> {
    type Raw = RequestHandle;
    fn as_raw(&self) -> Self::Raw {
        self.request
    }
}

impl<'a, S: Scope<'a>> Drop for Request<'a, S> {
    fn drop(&mut self) {
        panic!("request was dropped without being completed");
    }
}

impl<'a, S: Scope<'a>> Request<'a, S> {
    /// Construct a request object from a raw handle.
    ///
    /// # Safety
    ///
    /// - The request names an immediate operation of `context`.  It must not be null.
    /// - All buffers associated with the request must outlive `'a`.
    /// - The request must not be registered with the given scope.
    pub unsafe fn from_raw(request: RequestHandle, context: Context, scope: S) -> Self {
        debug_assert!(!request.is_null());
        scope.register();
        Self {
            request,
            context,
            scope,
            phantom: Default::default(),
        }
    }
}

impl Request<'static, StaticScope> {
    /// Release the request object, letting the operation finish on its own.
    ///
    /// Only possible for requests whose buffers live forever, the completion is never observed.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn free(self) -> Result<()> {
        let (mut request, context, _) = unsafe { self.into_raw() };
        context.request_free(&mut request)
    }
}

impl<'a, S: Scope<'a>> AsyncRequest<'a, S> for Request<'a, S> {
    unsafe fn into_raw(self) -> (RequestHandle, Context, S) {
        let this = ManuallyDrop::new(self);
        let request = this.request;
        let context = ptr::read(&this.context);
        let scope = ptr::read(&this.scope);
        scope.unregister();
        (request, context, scope)
    }

    fn context(&self) -> &Context {
        &self.context
    }
}

/// Collects an iterator of `Request` objects into a `RequestCollection` object
pub trait CollectRequests<'a, S: Scope<'a>>: IntoIterator<Item = Request<'a, S>> {
    /// Consumes and converts an iterator of `Request` objects into a `RequestCollection` object.
    fn collect_requests<'b, S2: Scope<'b>>(self, scope: S2) -> RequestCollection<'b, S2>
    where
        'a: 'b;
}

impl<'a, S: Scope<'a>, T: IntoIterator<Item = Request<'a, S>>> CollectRequests<'a, S> for T {
    fn collect_requests<'b, S2: Scope<'b>>(self, scope: S2) -> RequestCollection<'b, S2>
    where
        'a: 'b,
    {
        RequestCollection::from_request_iter(self, scope)
    }
}

/// A collection of request objects for a non-blocking operation registered with a `Scope` of
/// lifetime `'a`.
///
/// All requests of a collection belong to the same [`Context`]. Completed entries are set to the
/// null handle and stay in place, so indices reported by the completion methods always refer to
/// the position at which a request was pushed.
///
/// # Panics
///
/// Panics if the collection is dropped while it contains outstanding requests.
/// To prevent this, call `wait_all` or repeatedly call `wait_some`, `wait_any`, `test_any`,
/// `test_some`, or `test_all` until all requests are reported as complete.
///
/// # Standard section(s)
///
/// 3.7.5
#[must_use]
#[derive(Debug)]
pub struct RequestCollection<'a, S: Scope<'a> = StaticScope> {
    // Number of non-null handles in `requests`.
    outstanding: usize,
    requests: Vec<RequestHandle>,
    context: Option<Context>,
    scope: S,
    phantom: PhantomData<Cell<&'a ()>>,
}

impl<'a, S: Scope<'a>> Drop for RequestCollection<'a, S> {
    fn drop(&mut self) {
        if self.outstanding != 0 {
            panic!("RequestCollection was dropped with outstanding requests not completed.");
        }
    }
}

impl<'a, S: Scope<'a>> RequestCollection<'a, S> {
    /// Constructs a `RequestCollection` from raw handles of `context` and a scope object.
    /// `requests` are allowed to be null, but they must not be persistent requests.
    pub fn from_raw(requests: Vec<RequestHandle>, context: Context, scope: S) -> Self {
        let outstanding = requests.iter().filter(|request| !request.is_null()).count();
        scope.register_many(outstanding);
        Self {
            outstanding,
            requests,
            context: Some(context),
            scope,
            phantom: Default::default(),
        }
    }

    /// Constructs a new, empty `RequestCollection` object.
    pub fn new(scope: S) -> Self {
        Self::with_capacity(scope, 0)
    }

    /// Constructs a new, empty `RequestCollection` with reserved space for `capacity` requests.
    pub fn with_capacity(scope: S, capacity: usize) -> Self {
        RequestCollection {
            outstanding: 0,
            requests: Vec::with_capacity(capacity),
            context: None,
            scope,
            phantom: Default::default(),
        }
    }

    fn from_request_iter<'b: 'a, T, S2: Scope<'b>>(iter: T, scope: S) -> Self
    where
        T: IntoIterator<Item = Request<'b, S2>>,
    {
        let iter = iter.into_iter();
        let (lbound, ubound) = iter.size_hint();
        let mut collection = RequestCollection::with_capacity(scope, ubound.unwrap_or(lbound));
        for request in iter {
            collection.push(request);
        }
        collection
    }

    /// Pushes a new request into the collection. The request is removed from its previous scope and
    /// attached to the new scope. Therefore, the request's scope must be greater than or equal to
    /// the collection's scope.
    ///
    /// # Panics
    ///
    /// Panics if the request belongs to a different `Context` than the requests already in the
    /// collection.
    pub fn push<'b: 'a, S2: Scope<'b>>(&mut self, request: Request<'b, S2>) {
        let (request, context, _) = unsafe { request.into_raw() };
        match self.context {
            Some(ref own) => assert!(
                own.same_engine(&context),
                "Cannot mix requests of different contexts in a RequestCollection."
            ),
            None => self.context = Some(context),
        }
        self.requests.push(request);
        self.scope.register();
        self.outstanding += 1;
    }

    /// Reduce the scope of a request.
    pub fn shrink_scope_to<'b, S2>(self, scope: S2) -> RequestCollection<'b, S2>
    where
        'a: 'b,
        S2: Scope<'b>,
    {
        unsafe {
            let (requests, context, _) = self.into_raw();
            match context {
                Some(context) => RequestCollection::from_raw(requests, context, scope),
                None => RequestCollection::with_capacity(scope, requests.capacity()),
            }
        }
    }

    // Re-counts the non-null handles after a completion call and releases the completed ones
    // from the scope.
    fn sync_outstanding(&mut self) {
        let outstanding = self.requests.iter().filter(|request| !request.is_null()).count();
        debug_assert!(outstanding <= self.outstanding);
        let completed = self.outstanding.saturating_sub(outstanding);
        unsafe { self.scope.unregister_many(completed) };
        self.outstanding = outstanding;
    }

    fn complete_with<T, F>(&mut self, nothing: T, f: F) -> Result<T>
    where
        F: FnOnce(&Context, &mut [RequestHandle]) -> Result<T>,
    {
        let result = match self.context.clone() {
            Some(context) => f(&context, &mut self.requests[..]),
            None => Ok(nothing),
        };
        self.sync_outstanding();
        result
    }

    /// `outstanding` returns the number of requests in the collection that haven't been completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Returns the number of request slots in the Collection.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the collection has no request slots
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Returns the underlying handles, their context and the attached scope.
    ///
    /// # Safety
    ///
    /// The requests may outlive their associated buffers.
    pub unsafe fn into_raw(self) -> (Vec<RequestHandle>, Option<Context>, S) {
        let mut this = ManuallyDrop::new(self);
        let requests = std::mem::take(&mut this.requests);
        let context = ptr::read(&this.context);
        let scope = ptr::read(&this.scope);
        scope.unregister_many(this.outstanding);
        (requests, context, scope)
    }

    /// `shrink` removes all deallocated requests from the collection. It does not shrink the size
    /// of the underlying array, allowing the `RequestCollection` to be efficiently re-used for
    /// another set of requests without needing additional allocations.
    pub fn shrink(&mut self) {
        self.requests.retain(|request| !request.is_null())
    }

    /// `wait_any` blocks until any active request in the collection completes. It returns
    /// immediately if all requests in the collection are deallocated.
    ///
    /// If there are any active requests in the collection, then it returns `Some((idx, status))`,
    /// where `idx` is the index of the completed request in the collection and `status` is the
    /// status of the completed request. The request at `idx` will be set to null.
    /// `outstanding()` will be reduced by 1.
    ///
    /// Returns `None` if there are no active requests. `outstanding()` is 0.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_any(&mut self) -> Result<Option<(usize, Status)>> {
        self.complete_with(None, |context, requests| context.wait_any(requests))
    }

    /// `test_any` checks if any requests in the collection are completed. It does not block.
    ///
    /// If there are no active requests in the collection, it returns `TestAny::NoneActive`.
    /// If none of the active requests in the collection are completed, it returns
    /// `TestAny::NoneComplete`. Otherwise, `test_any` picks one of the completed requests,
    /// deallocates it, and returns `Completed(idx, status)`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_any(&mut self) -> Result<TestAny> {
        self.complete_with(TestAny::NoneActive, |context, requests| {
            context.test_any(requests)
        })
    }

    /// `wait_all` blocks until all requests in the collection are deallocated. Upon return,
    /// `outstanding()` will be equal to 0. The returned statuses match the indices of the
    /// requests; the status for entries deallocated earlier is empty.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_all(&mut self) -> Result<Vec<Status>> {
        self.complete_with(Vec::new(), |context, requests| context.wait_all(requests))
    }

    /// `wait_all_into` behaves like `wait_all` but writes the statuses into `statuses`, also when
    /// the result is `ErrorInStatus`.
    ///
    /// # Panics
    ///
    /// Panics if `statuses.len()` is less than `self.len()`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_all_into(&mut self, statuses: &mut [Status]) -> Result<()> {
        assert!(
            statuses.len() >= self.requests.len(),
            "statuses must have room for every request of the collection"
        );
        match self.wait_all() {
            Ok(done) => {
                statuses[..done.len()].copy_from_slice(&done);
                Ok(())
            }
            Err(err) => {
                for &(i, status) in err.statuses() {
                    statuses[i] = status;
                }
                Err(err)
            }
        }
    }

    /// `test_all` checks if all requests are completed.
    ///
    /// Returns `Some(statuses)` if all the requests are complete. The completed requests are
    /// deallocated. Returns `None` if not all active requests are complete; `outstanding()`
    /// will be unchanged.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_all(&mut self) -> Result<Option<Vec<Status>>> {
        self.complete_with(Some(Vec::new()), |context, requests| {
            context.test_all(requests)
        })
    }

    /// `test_all_into` behaves like `test_all` but writes the statuses into `statuses`.
    ///
    /// Returns `true` if all requests were complete.
    ///
    /// # Panics
    ///
    /// Panics if `statuses.len()` is less than `self.len()`.
    pub fn test_all_into(&mut self, statuses: &mut [Status]) -> Result<bool> {
        assert!(
            statuses.len() >= self.requests.len(),
            "statuses must have room for every request of the collection"
        );
        match self.test_all() {
            Ok(Some(done)) => {
                statuses[..done.len()].copy_from_slice(&done);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => {
                for &(i, status) in err.statuses() {
                    statuses[i] = status;
                }
                Err(err)
            }
        }
    }

    /// `wait_some` blocks until a request is completed.
    ///
    /// Returns `Some(completed)` if there are any active requests in the collection, where
    /// `completed` holds the index and status of every request that was completed.
    ///
    /// Returns `None` if all requests in the collection have already been deallocated.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn wait_some(&mut self) -> Result<Option<Vec<(usize, Status)>>> {
        self.complete_with(None, |context, requests| context.wait_some(requests))
    }

    /// `wait_some_into` behaves like `wait_some` but writes the indices and statuses into
    /// `indices[0..count]` and `statuses[0..count]`, returning `Some(count)`.
    ///
    /// # Panics
    ///
    /// Panics if `indices` or `statuses` have less room than `self.len()`.
    pub fn wait_some_into(
        &mut self,
        indices: &mut [usize],
        statuses: &mut [Status],
    ) -> Result<Option<usize>> {
        let completed = self.wait_some()?;
        Ok(completed.map(|completed| scatter_some(&completed, indices, statuses)))
    }

    /// `test_some` deallocates all active, completed requests.
    ///
    /// Returns `Some(completed)` if there are any active requests in the collection, where
    /// `completed` holds the index and status of every request that was completed, possibly none.
    ///
    /// Returns `None` if all requests in the collection have already been deallocated.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.5
    pub fn test_some(&mut self) -> Result<Option<Vec<(usize, Status)>>> {
        self.complete_with(None, |context, requests| context.test_some(requests))
    }

    /// `test_some_into` behaves like `test_some` but writes the indices and statuses into
    /// `indices[0..count]` and `statuses[0..count]`, returning `Some(count)`.
    ///
    /// # Panics
    ///
    /// Panics if `indices` or `statuses` have less room than `self.len()`.
    pub fn test_some_into(
        &mut self,
        indices: &mut [usize],
        statuses: &mut [Status],
    ) -> Result<Option<usize>> {
        let completed = self.test_some()?;
        Ok(completed.map(|completed| scatter_some(&completed, indices, statuses)))
    }
}

fn scatter_some(completed: &[(usize, Status)], indices: &mut [usize], statuses: &mut [Status]) -> usize {
    for (k, &(i, status)) in completed.iter().enumerate() {
        indices[k] = i;
        statuses[k] = status;
    }
    completed.len()
}

/// Guard object that waits for the completion of an operation when it is dropped
///
/// The guard can be constructed or deconstructed using the `From` and `Into` traits.
#[derive(Debug)]
pub struct WaitGuard<'a, S: Scope<'a> = StaticScope>(Option<Request<'a, S>>);

impl<'a, S: Scope<'a>> Drop for WaitGuard<'a, S> {
    fn drop(&mut self) {
        if let Some(request) = self.0.take() {
            request.wait();
        }
    }
}

impl<'a, S: Scope<'a>> AsRaw for WaitGuard<'a, S> {
    type Raw = RequestHandle;
    fn as_raw(&self) -> Self::Raw {
        self.0
            .as_ref()
            .map_or(RequestHandle::NULL, |request| request.as_raw())
    }
}

impl<'a, S: Scope<'a>> From<WaitGuard<'a, S>> for Request<'a, S> {
    fn from(mut guard: WaitGuard<'a, S>) -> Self {
        match guard.0.take() {
            Some(request) => request,
            None => unreachable!("a WaitGuard only gives up its request when converted or dropped"),
        }
    }
}

impl<'a, S: Scope<'a>> From<Request<'a, S>> for WaitGuard<'a, S> {
    fn from(req: Request<'a, S>) -> Self {
        WaitGuard(Some(req))
    }
}

impl<'a, S: Scope<'a>> WaitGuard<'a, S> {
    fn cancel(&self) {
        if let Some(ref req) = self.0 {
            if let Err(err) = req.cancel() {
                debug!("cancel on drop of {:?} failed: {}", req.as_raw(), err);
            }
        }
    }
}

/// Guard object that tries to cancel and waits for the completion of an operation when it is
/// dropped
///
/// The guard can be constructed or deconstructed using the `From` and `Into` traits.
#[derive(Debug)]
pub struct CancelGuard<'a, S: Scope<'a> = StaticScope>(WaitGuard<'a, S>);

impl<'a, S: Scope<'a>> Drop for CancelGuard<'a, S> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl<'a, S: Scope<'a>> From<CancelGuard<'a, S>> for WaitGuard<'a, S> {
    fn from(guard: CancelGuard<'a, S>) -> Self {
        let guard = ManuallyDrop::new(guard);
        unsafe { ptr::read(&guard.0) }
    }
}

impl<'a, S: Scope<'a>> From<WaitGuard<'a, S>> for CancelGuard<'a, S> {
    fn from(guard: WaitGuard<'a, S>) -> Self {
        CancelGuard(guard)
    }
}

impl<'a, S: Scope<'a>> From<Request<'a, S>> for CancelGuard<'a, S> {
    fn from(req: Request<'a, S>) -> Self {
        CancelGuard(WaitGuard::from(req))
    }
}

/// A common interface for [`LocalScope`] and [`StaticScope`] used internally by the `request`
/// module.
///
/// This trait is an implementation detail.  You shouldn’t have to use or implement this trait.
///
/// # Safety
///
/// Implementations must not let requests registered with them outlive their buffers.
pub unsafe trait Scope<'a> {
    /// Registers a request with the scope.
    fn register(&self) {
        self.register_many(1)
    }

    /// Registers multiple requests with the scope.
    fn register_many(&self, count: usize);

    /// Unregisters a request from the scope.
    ///
    /// # Safety
    ///
    /// The request must have been registered before.
    unsafe fn unregister(&self) {
        self.unregister_many(1)
    }

    /// Unregisters multiple requests from the scope.
    ///
    /// # Safety
    ///
    /// The requests must have been registered before.
    unsafe fn unregister_many(&self, count: usize);
}

/// The scope that lasts as long as the entire execution of the program
///
/// Unlike `LocalScope<'a>`, `StaticScope` does not require any bookkeeping on the requests as every
/// request associated with a `StaticScope` can live as long as they please.
///
/// A `StaticScope` can be created simply by calling the `StaticScope` constructor.
///
/// # Invariant
///
/// For any `Request` registered with a `StaticScope`, its associated buffers must be `'static`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StaticScope;

unsafe impl Scope<'static> for StaticScope {
    fn register_many(&self, _count: usize) {}
    unsafe fn unregister_many(&self, _count: usize) {}
}

/// A temporary scope that lasts no more than the lifetime `'a`
///
/// Use `LocalScope` for to perform requests with temporary buffers.
///
/// To obtain a `LocalScope`, use the [`scope`] function.
///
/// # Invariant
///
/// For any `Request` registered with a `LocalScope<'a>`, its associated buffers must outlive `'a`.
///
/// # Panics
///
/// When `LocalScope` is dropped, it will panic if there are any lingering `Requests` that have not
/// yet been completed.
#[derive(Debug)]
pub struct LocalScope<'a> {
    num_requests: Cell<usize>,
    phantom: PhantomData<Cell<&'a ()>>, // Cell needed to ensure 'a is invariant
}

impl<'a> Drop for LocalScope<'a> {
    fn drop(&mut self) {
        if self.num_requests.get() != 0 {
            panic!("at least one request was dropped without being completed");
        }
    }
}

unsafe impl<'a, 'b> Scope<'a> for &'b LocalScope<'a> {
    fn register_many(&self, count: usize) {
        self.num_requests.set(self.num_requests.get() + count)
    }

    unsafe fn unregister_many(&self, count: usize) {
        match self.num_requests.get().checked_sub(count) {
            Some(remaining) => self.num_requests.set(remaining),
            None => panic!("unregister has been called more times than register"),
        }
    }
}

/// Used to create a [`LocalScope`]
///
/// The function creates a `LocalScope` and then passes it into the given
/// closure as an argument.
///
/// For safety reasons, all variables and buffers associated with a request
/// must exist *outside* the scope with which the request is registered.
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
/// let mut received = [0u16; 3];
/// mpi_p2p::request::scope(|scope| {
///     let recv = me.immediate_receive_into(scope, &mut received[..]).unwrap();
///     me.send(&[1u16, 2, 3][..]).unwrap();
///     let status = recv.wait();
///     assert_eq!(status.byte_count(), 6);
/// });
/// assert_eq!(received, [1, 2, 3]);
/// ```
pub fn scope<'a, F, R>(f: F) -> R
where
    F: FnOnce(&LocalScope<'a>) -> R,
{
    f(&LocalScope {
        num_requests: Default::default(),
        phantom: Default::default(),
    })
}
