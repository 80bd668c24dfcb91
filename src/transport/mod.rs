//! The boundary between the request engine and whatever moves bytes between processes
//!
//! The request engine never touches the network. It packs outgoing messages into contiguous
//! payloads, hands them to a [`Transport`] and polls the transport for completion. Ranks on this
//! boundary are global ranks, wildcards are expressed as `None`.

use crate::error::{ErrorKind, Result};
use crate::topology::{ContextId, Rank};
use crate::Tag;

pub mod loopback;

/// Identifies an operation issued to a transport
///
/// Only meaningful to the transport that returned it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u64);

/// The four send modes
///
/// # Standard section(s)
///
/// 3.4
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SendMode {
    /// Completes when the payload may be reused, possibly before a matching receive is posted.
    Standard,
    /// Completes locally after copying into the attached buffered-send region.
    Buffered,
    /// Completes only once a matching receive has started.
    Synchronous,
    /// Erroneous unless a matching receive is already posted.
    Ready,
}

/// Outcome of an operation, as reported by the transport
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportStatus {
    /// Global rank of the sender of a received message
    pub source: Rank,
    /// Tag of a received message
    pub tag: Tag,
    /// Number of payload bytes delivered
    pub bytes: usize,
    /// Error detected while the operation was in flight
    pub error: Option<ErrorKind>,
}

impl TransportStatus {
    /// A successful send completion
    pub fn sent(bytes: usize) -> TransportStatus {
        TransportStatus {
            source: crate::topology::ANY_SOURCE,
            tag: crate::topology::ANY_TAG,
            bytes,
            error: None,
        }
    }

    /// A completion that failed with `error`
    pub fn failed(error: ErrorKind) -> TransportStatus {
        TransportStatus {
            source: crate::topology::ANY_SOURCE,
            tag: crate::topology::ANY_TAG,
            bytes: 0,
            error: Some(error),
        }
    }
}

/// Moves messages between processes on behalf of the request engine
///
/// Messages sent from one process to another with the same tag and context must be matched in
/// the order they were sent.
pub trait Transport {
    /// Global rank of this process
    fn world_rank(&self) -> Rank;

    /// Number of processes reachable through this transport
    fn world_size(&self) -> Rank;

    /// Start sending `payload` to `dest`.
    ///
    /// The transport takes its own copy of `payload`. An `Err` means the operation was never
    /// started; the engine records it in the status of the request.
    fn issue_send(
        &mut self,
        dest: Rank,
        tag: Tag,
        context: ContextId,
        payload: &[u8],
        mode: SendMode,
    ) -> Result<TransportHandle>;

    /// Start receiving a message of at most `capacity` bytes.
    ///
    /// `None` for `source` or `tag` matches any value.
    fn issue_receive(
        &mut self,
        source: Option<Rank>,
        tag: Option<Tag>,
        context: ContextId,
        capacity: usize,
    ) -> Result<TransportHandle>;

    /// Poll an operation for completion without blocking.
    ///
    /// Returns `None` while the operation is in flight. On completion of a receive, the delivered
    /// bytes are copied to the front of `buffer`. A handle is retired once its completion has
    /// been reported.
    fn progress_probe(
        &mut self,
        handle: TransportHandle,
        buffer: &mut [u8],
    ) -> Option<TransportStatus>;

    /// Try to withdraw an operation that has not completed.
    ///
    /// Returns `true` if the operation was withdrawn; the handle is retired and will never
    /// complete. Returns `false` if the operation already completed or cannot be withdrawn.
    fn progress_cancel(&mut self, handle: TransportHandle) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn world_rank(&self) -> Rank {
        (**self).world_rank()
    }

    fn world_size(&self) -> Rank {
        (**self).world_size()
    }

    fn issue_send(
        &mut self,
        dest: Rank,
        tag: Tag,
        context: ContextId,
        payload: &[u8],
        mode: SendMode,
    ) -> Result<TransportHandle> {
        (**self).issue_send(dest, tag, context, payload, mode)
    }

    fn issue_receive(
        &mut self,
        source: Option<Rank>,
        tag: Option<Tag>,
        context: ContextId,
        capacity: usize,
    ) -> Result<TransportHandle> {
        (**self).issue_receive(source, tag, context, capacity)
    }

    fn progress_probe(
        &mut self,
        handle: TransportHandle,
        buffer: &mut [u8],
    ) -> Option<TransportStatus> {
        (**self).progress_probe(handle, buffer)
    }

    fn progress_cancel(&mut self, handle: TransportHandle) -> bool {
        (**self).progress_cancel(handle)
    }
}
