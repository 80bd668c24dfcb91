//! An in-process transport
//!
//! All endpoints created by one call to [`Loopback::world`] share a fabric and can exchange
//! messages with each other from the same thread. Standard and buffered sends are eager: the
//! payload is copied into the fabric and the send completes at once. Synchronous sends complete
//! when they are matched. Ready sends fail unless a matching receive is already posted.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use conv::ConvUtil;
use log::trace;

use super::{SendMode, Transport, TransportHandle, TransportStatus};
use crate::error::{Error, ErrorKind, Result};
use crate::topology::{ContextId, Rank};
use crate::Tag;

struct Envelope {
    send: u64,
    source: Rank,
    tag: Tag,
    context: ContextId,
    payload: Vec<u8>,
    synchronous: bool,
}

struct Posted {
    recv: u64,
    source: Option<Rank>,
    tag: Option<Tag>,
    context: ContextId,
    capacity: usize,
}

impl Posted {
    fn matches(&self, source: Rank, tag: Tag, context: ContextId) -> bool {
        self.context == context
            && self.source.map_or(true, |s| s == source)
            && self.tag.map_or(true, |t| t == tag)
    }
}

enum Op {
    Pending,
    Done {
        status: TransportStatus,
        data: Vec<u8>,
    },
}

#[derive(Default)]
struct Fabric {
    size: Rank,
    next_id: u64,
    ops: HashMap<u64, Op>,
    // Messages that arrived before a matching receive, per destination, in arrival order.
    unexpected: HashMap<Rank, VecDeque<Envelope>>,
    // Receives waiting for a message, per receiving rank, in posting order.
    posted: HashMap<Rank, VecDeque<Posted>>,
}

impl Fabric {
    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank < 0 || rank >= self.size {
            Err(Error::with_detail(
                ErrorKind::InvalidRank,
                format!("rank {} outside of a world of {}", rank, self.size),
            ))
        } else {
            Ok(())
        }
    }

    fn deliver(&mut self, recv: u64, capacity: usize, envelope: Envelope) {
        let Envelope {
            send,
            source,
            tag,
            mut payload,
            synchronous,
            ..
        } = envelope;
        let error = if payload.len() > capacity {
            payload.truncate(capacity);
            Some(ErrorKind::MessageTruncated)
        } else {
            None
        };
        let status = TransportStatus {
            source,
            tag,
            bytes: payload.len(),
            error,
        };
        trace!("loopback: op {} matched op {} ({} bytes)", recv, send, status.bytes);
        if synchronous {
            self.ops.insert(
                send,
                Op::Done {
                    status: TransportStatus::sent(status.bytes),
                    data: Vec::new(),
                },
            );
        }
        self.ops.insert(
            recv,
            Op::Done {
                status,
                data: payload,
            },
        );
    }
}

/// One endpoint of an in-process fabric
pub struct Loopback {
    rank: Rank,
    fabric: Rc<RefCell<Fabric>>,
}

impl Loopback {
    /// Creates `size` connected endpoints, the endpoint at index `i` has rank `i`.
    pub fn world(size: usize) -> Vec<Loopback> {
        let fabric = Rc::new(RefCell::new(Fabric {
            size: size.value_as().unwrap_or(Rank::MAX),
            ..Default::default()
        }));
        (0..size)
            .filter_map(|rank| rank.value_as::<Rank>().ok())
            .map(|rank| Loopback {
                rank,
                fabric: fabric.clone(),
            })
            .collect()
    }

    /// A single endpoint talking only to itself
    pub fn single() -> Loopback {
        Loopback {
            rank: 0,
            fabric: Rc::new(RefCell::new(Fabric {
                size: 1,
                ..Default::default()
            })),
        }
    }

    /// Number of messages sent to this endpoint that no receive has matched yet
    pub fn unexpected_count(&self) -> usize {
        self.fabric
            .borrow()
            .unexpected
            .get(&self.rank)
            .map_or(0, VecDeque::len)
    }
}

impl Transport for Loopback {
    fn world_rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> Rank {
        self.fabric.borrow().size
    }

    fn issue_send(
        &mut self,
        dest: Rank,
        tag: Tag,
        context: ContextId,
        payload: &[u8],
        mode: SendMode,
    ) -> Result<TransportHandle> {
        let mut fabric = self.fabric.borrow_mut();
        fabric.check_rank(dest)?;
        let id = fabric.allocate();
        let envelope = Envelope {
            send: id,
            source: self.rank,
            tag,
            context,
            payload: payload.to_vec(),
            synchronous: mode == SendMode::Synchronous,
        };

        let posted = fabric.posted.entry(dest).or_default();
        let matched = posted
            .iter()
            .position(|p| p.matches(self.rank, tag, context))
            .and_then(|index| posted.remove(index));

        match matched {
            Some(receive) => {
                fabric.deliver(receive.recv, receive.capacity, envelope);
                if mode != SendMode::Synchronous {
                    fabric.ops.insert(
                        id,
                        Op::Done {
                            status: TransportStatus::sent(payload.len()),
                            data: Vec::new(),
                        },
                    );
                }
            }
            None => {
                if mode == SendMode::Ready {
                    return Err(Error::with_detail(
                        ErrorKind::Internal,
                        format!("ready send to rank {} without a posted receive", dest),
                    ));
                }
                let op = if mode == SendMode::Synchronous {
                    Op::Pending
                } else {
                    Op::Done {
                        status: TransportStatus::sent(payload.len()),
                        data: Vec::new(),
                    }
                };
                fabric.ops.insert(id, op);
                fabric.unexpected.entry(dest).or_default().push_back(envelope);
            }
        }
        trace!("loopback: rank {} issued send op {} to {}", self.rank, id, dest);
        Ok(TransportHandle(id))
    }

    fn issue_receive(
        &mut self,
        source: Option<Rank>,
        tag: Option<Tag>,
        context: ContextId,
        capacity: usize,
    ) -> Result<TransportHandle> {
        let mut fabric = self.fabric.borrow_mut();
        if let Some(source) = source {
            fabric.check_rank(source)?;
        }
        let id = fabric.allocate();
        let posted = Posted {
            recv: id,
            source,
            tag,
            context,
            capacity,
        };

        let unexpected = fabric.unexpected.entry(self.rank).or_default();
        let matched = unexpected
            .iter()
            .position(|e| posted.matches(e.source, e.tag, e.context))
            .and_then(|index| unexpected.remove(index));

        match matched {
            Some(envelope) => fabric.deliver(id, capacity, envelope),
            None => {
                fabric.ops.insert(id, Op::Pending);
                fabric.posted.entry(self.rank).or_default().push_back(posted);
            }
        }
        trace!("loopback: rank {} issued receive op {}", self.rank, id);
        Ok(TransportHandle(id))
    }

    fn progress_probe(
        &mut self,
        handle: TransportHandle,
        buffer: &mut [u8],
    ) -> Option<TransportStatus> {
        let mut fabric = self.fabric.borrow_mut();
        if matches!(fabric.ops.get(&handle.0), Some(Op::Pending)) {
            return None;
        }
        match fabric.ops.remove(&handle.0) {
            Some(Op::Done { status, data }) => {
                let n = data.len().min(buffer.len());
                buffer[..n].copy_from_slice(&data[..n]);
                Some(status)
            }
            // retired or unknown handle
            _ => Some(TransportStatus::failed(ErrorKind::Internal)),
        }
    }

    fn progress_cancel(&mut self, handle: TransportHandle) -> bool {
        let mut fabric = self.fabric.borrow_mut();
        if !matches!(fabric.ops.get(&handle.0), Some(Op::Pending)) {
            return false;
        }
        let mut withdrawn = false;
        for queue in fabric.posted.values_mut() {
            if let Some(index) = queue.iter().position(|p| p.recv == handle.0) {
                queue.remove(index);
                withdrawn = true;
                break;
            }
        }
        if !withdrawn {
            for queue in fabric.unexpected.values_mut() {
                if let Some(index) = queue.iter().position(|e| e.send == handle.0) {
                    queue.remove(index);
                    withdrawn = true;
                    break;
                }
            }
        }
        if withdrawn {
            fabric.ops.remove(&handle.0);
            trace!("loopback: op {} withdrawn", handle.0);
        }
        withdrawn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Loopback, Loopback) {
        let mut world = Loopback::world(2).into_iter();
        (world.next().unwrap(), world.next().unwrap())
    }

    fn receive(endpoint: &mut Loopback, handle: TransportHandle, capacity: usize) -> (TransportStatus, Vec<u8>) {
        let mut buffer = vec![0u8; capacity];
        let status = endpoint
            .progress_probe(handle, &mut buffer)
            .expect("receive should have completed");
        buffer.truncate(status.bytes);
        (status, buffer)
    }

    #[test]
    fn eager_send_then_receive() {
        let (mut a, mut b) = pair();
        let s = a.issue_send(1, 7, 0, b"hello", SendMode::Standard).unwrap();
        assert!(a.progress_probe(s, &mut []).is_some());
        assert_eq!(b.unexpected_count(), 1);

        let r = b.issue_receive(Some(0), Some(7), 0, 16).unwrap();
        let (status, data) = receive(&mut b, r, 16);
        assert_eq!(status.source, 0);
        assert_eq!(status.tag, 7);
        assert_eq!(status.error, None);
        assert_eq!(data, b"hello");
    }

    #[test]
    fn messages_match_in_send_order() {
        let (mut a, mut b) = pair();
        for payload in [b"one", b"two"] {
            a.issue_send(1, 3, 0, payload, SendMode::Standard).unwrap();
        }
        let first = b.issue_receive(None, None, 0, 8).unwrap();
        let second = b.issue_receive(None, Some(3), 0, 8).unwrap();
        assert_eq!(receive(&mut b, first, 8).1, b"one");
        assert_eq!(receive(&mut b, second, 8).1, b"two");
    }

    #[test]
    fn contexts_and_tags_separate_traffic() {
        let (mut a, mut b) = pair();
        let r = b.issue_receive(Some(0), Some(1), 5, 8).unwrap();
        a.issue_send(1, 1, 0, b"ctx0", SendMode::Standard).unwrap();
        a.issue_send(1, 2, 5, b"tag2", SendMode::Standard).unwrap();
        assert!(b.progress_probe(r, &mut [0; 8]).is_none());
        a.issue_send(1, 1, 5, b"mine", SendMode::Standard).unwrap();
        assert_eq!(receive(&mut b, r, 8).1, b"mine");
        assert_eq!(b.unexpected_count(), 2);
    }

    #[test]
    fn truncation_is_reported() {
        let (mut a, mut b) = pair();
        a.issue_send(1, 0, 0, b"too long", SendMode::Standard).unwrap();
        let r = b.issue_receive(Some(0), None, 0, 3).unwrap();
        let (status, data) = receive(&mut b, r, 3);
        assert_eq!(status.error, Some(ErrorKind::MessageTruncated));
        assert_eq!(data, b"too");
    }

    #[test]
    fn synchronous_send_completes_on_match() {
        let (mut a, mut b) = pair();
        let s = a.issue_send(1, 0, 0, b"sync", SendMode::Synchronous).unwrap();
        assert!(a.progress_probe(s, &mut []).is_none());
        let r = b.issue_receive(None, None, 0, 4).unwrap();
        assert!(a.progress_probe(s, &mut []).is_some());
        assert_eq!(receive(&mut b, r, 4).1, b"sync");
    }

    #[test]
    fn ready_send_needs_posted_receive() {
        let (mut a, mut b) = pair();
        let err = a.issue_send(1, 0, 0, b"x", SendMode::Ready).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        let r = b.issue_receive(Some(0), Some(0), 0, 1).unwrap();
        a.issue_send(1, 0, 0, b"x", SendMode::Ready).unwrap();
        assert_eq!(receive(&mut b, r, 1).1, b"x");
    }

    #[test]
    fn cancel_withdraws_only_pending_operations() {
        let (mut a, mut b) = pair();
        let r = b.issue_receive(None, None, 0, 4).unwrap();
        assert!(b.progress_cancel(r));
        a.issue_send(1, 0, 0, b"late", SendMode::Standard).unwrap();
        assert_eq!(b.unexpected_count(), 1);

        let s = a.issue_send(1, 0, 0, b"sync", SendMode::Synchronous).unwrap();
        assert!(a.progress_cancel(s));
        assert_eq!(b.unexpected_count(), 1);

        let eager = a.issue_send(1, 0, 0, b"done", SendMode::Standard).unwrap();
        assert!(!a.progress_cancel(eager));
    }

    #[test]
    fn invalid_ranks_are_rejected() {
        let (mut a, _b) = pair();
        assert_eq!(
            a.issue_send(2, 0, 0, b"", SendMode::Standard).unwrap_err().kind(),
            ErrorKind::InvalidRank
        );
        assert_eq!(
            a.issue_receive(Some(-4), None, 0, 0).unwrap_err().kind(),
            ErrorKind::InvalidRank
        );
    }
}
