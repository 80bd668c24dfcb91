//! Groups, communicators and process identifiers
//!
//! A communicator pairs a [`Group`] of processes with a context id that separates its traffic
//! from the traffic of every other communicator. Ranks used with a communicator are local to its
//! group; the request engine translates them to the global ranks understood by the transport.
//!
//! Communicators are created in the same order on every process taking part in them, which keeps
//! the context ids allocated for them in agreement without any exchange.

use std::rc::Rc;

use conv::ConvUtil;

use crate::engine::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::{Count, Tag};

/// Topology traits
pub mod traits {
    pub use super::{AsCommunicator, Communicator};
}

/// Identifies a certain process within a communicator.
pub type Rank = i32;

/// Identifies the communication context of a communicator on the transport
pub type ContextId = u32;

/// Wildcard source rank that matches a message from any process
pub const ANY_SOURCE: Rank = -2;
/// The null process: communication with it succeeds immediately and moves no data
pub const PROC_NULL: Rank = -1;
/// Wildcard tag that matches a message with any tag
pub const ANY_TAG: Tag = -1;
/// Returned by count queries whose result is not a whole number of elements
pub const UNDEFINED: Count = -32766;

/// An ordered set of processes, identified by their global ranks
///
/// The position of a process in the group is its local rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    ranks: Vec<Rank>,
}

impl Group {
    /// A group of the given global ranks, in local rank order.
    ///
    /// Fails with `InvalidRank` if a rank is negative or appears twice.
    pub fn new(ranks: Vec<Rank>) -> Result<Group> {
        for (i, &rank) in ranks.iter().enumerate() {
            if rank < 0 {
                return Err(Error::with_detail(
                    ErrorKind::InvalidRank,
                    format!("negative global rank {} at position {}", rank, i),
                ));
            }
            if ranks[..i].contains(&rank) {
                return Err(Error::with_detail(
                    ErrorKind::InvalidRank,
                    format!("global rank {} appears twice", rank),
                ));
            }
        }
        Ok(Group { ranks })
    }

    /// The group of the global ranks `0..size`
    pub fn world(size: Rank) -> Group {
        Group {
            ranks: (0..size.max(0)).collect(),
        }
    }

    /// Number of processes in the group
    pub fn size(&self) -> Rank {
        self.ranks.len().value_as().unwrap_or(Rank::MAX)
    }

    /// Global rank of the process with local rank `rank`
    pub fn translate_local_to_global(&self, rank: Rank) -> Option<Rank> {
        let index: usize = rank.value_as().ok()?;
        self.ranks.get(index).copied()
    }

    /// Local rank of the process with global rank `global`
    pub fn translate_global_to_local(&self, global: Rank) -> Option<Rank> {
        self.ranks
            .iter()
            .position(|&r| r == global)
            .and_then(|index| index.value_as().ok())
    }
}

/// Something that has a communicator associated with it
pub trait AsCommunicator {
    /// The type of the associated communicator
    type Out: Communicator;
    /// Returns the associated communicator.
    fn as_communicator(&self) -> &Self::Out;
}

/// Communicators are contexts for communication
pub trait Communicator {
    /// The request engine this communicator issues its operations to
    fn context(&self) -> &Context;

    /// Separates the traffic of this communicator from other communicators.
    fn context_id(&self) -> ContextId;

    /// The group of processes taking part in this communicator
    fn group(&self) -> &Rc<Group>;

    /// Rank of the calling process within this communicator
    fn rank(&self) -> Rank;

    /// Number of processes in this communicator
    fn size(&self) -> Rank {
        self.group().size()
    }

    /// Global rank of the process with local rank `rank`
    fn translate_local_to_global(&self, rank: Rank) -> Option<Rank> {
        self.group().translate_local_to_global(rank)
    }

    /// The process with local rank `r`
    ///
    /// The rank is checked when an operation is issued to the process, `PROC_NULL` names the null
    /// process.
    fn process_at_rank(&self, r: Rank) -> Process<Self>
    where
        Self: Sized,
    {
        Process::by_rank_unchecked(self, r)
    }

    /// The null process of this communicator
    fn null_process(&self) -> Process<Self>
    where
        Self: Sized,
    {
        Process::by_rank_unchecked(self, PROC_NULL)
    }

    /// An arbitrary process of this communicator, for use as a wildcard source.
    fn any_process(&self) -> AnyProcess<Self>
    where
        Self: Sized,
    {
        AnyProcess(self)
    }

    /// The `Process` of the calling process
    fn this_process(&self) -> Process<Self>
    where
        Self: Sized,
    {
        let rank = self.rank();
        Process::by_rank_unchecked(self, rank)
    }
}

/// A communicator backed by an explicit group
#[derive(Clone, Debug)]
pub struct SimpleCommunicator {
    context: Context,
    id: ContextId,
    group: Rc<Group>,
    rank: Rank,
}

impl SimpleCommunicator {
    /// The communicator of all processes of the transport, context id `0`.
    pub(crate) fn world(context: Context, rank: Rank, size: Rank) -> SimpleCommunicator {
        SimpleCommunicator {
            context,
            id: 0,
            group: Rc::new(Group::world(size)),
            rank,
        }
    }

    /// A communicator with the same group and a fresh context.
    ///
    /// Messages sent on the duplicate never match receives posted on the original and vice versa.
    pub fn duplicate(&self) -> SimpleCommunicator {
        SimpleCommunicator {
            context: self.context.clone(),
            id: self.context.allocate_context_id(),
            group: self.group.clone(),
            rank: self.rank,
        }
    }

    /// A communicator over `group`, a subset of the processes of this communicator given by
    /// global rank.
    ///
    /// Returns `None` on processes that are not a member of `group`. A fresh context id is
    /// allocated on every process.
    pub fn create(&self, group: Group) -> Result<Option<SimpleCommunicator>> {
        for (i, &global) in group.ranks.iter().enumerate() {
            if self.group.translate_global_to_local(global).is_none() {
                return Err(Error::with_detail(
                    ErrorKind::InvalidRank,
                    format!("rank {} at position {} is not part of the communicator", global, i),
                ));
            }
        }
        let id = self.context.allocate_context_id();
        let own_global = match self.group.translate_local_to_global(self.rank) {
            Some(global) => global,
            None => return Ok(None),
        };
        Ok(group
            .translate_global_to_local(own_global)
            .map(|rank| SimpleCommunicator {
                context: self.context.clone(),
                id,
                group: Rc::new(group),
                rank,
            }))
    }
}

impl Communicator for SimpleCommunicator {
    fn context(&self) -> &Context {
        &self.context
    }

    fn context_id(&self) -> ContextId {
        self.id
    }

    fn group(&self) -> &Rc<Group> {
        &self.group
    }

    fn rank(&self) -> Rank {
        self.rank
    }
}

impl AsCommunicator for SimpleCommunicator {
    type Out = SimpleCommunicator;
    fn as_communicator(&self) -> &Self::Out {
        self
    }
}

/// Identifies a process by its `Rank` within a certain communicator.
#[derive(Copy, Clone, Debug)]
pub struct Process<'a, C>
where
    C: 'a + Communicator,
{
    comm: &'a C,
    rank: Rank,
}

impl<'a, C> Process<'a, C>
where
    C: 'a + Communicator,
{
    fn by_rank_unchecked(c: &'a C, r: Rank) -> Self {
        Process { comm: c, rank: r }
    }

    /// The process rank
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Whether this is the null process
    pub fn is_null(&self) -> bool {
        self.rank == PROC_NULL
    }
}

impl<'a, C> AsCommunicator for Process<'a, C>
where
    C: 'a + Communicator,
{
    type Out = C;
    fn as_communicator(&self) -> &Self::Out {
        self.comm
    }
}

/// Identifies an arbitrary process that is a member of a certain communicator, e.g. for use as a
/// `Source` in point to point communication.
#[derive(Copy, Clone, Debug)]
pub struct AnyProcess<'a, C>(&'a C)
where
    C: 'a + Communicator;

impl<'a, C> AsCommunicator for AnyProcess<'a, C>
where
    C: 'a + Communicator,
{
    type Out = C;
    fn as_communicator(&self) -> &Self::Out {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_translation() {
        let group = Group::new(vec![4, 2, 7]).unwrap();
        assert_eq!(group.size(), 3);
        assert_eq!(group.translate_local_to_global(1), Some(2));
        assert_eq!(group.translate_local_to_global(3), None);
        assert_eq!(group.translate_local_to_global(PROC_NULL), None);
        assert_eq!(group.translate_global_to_local(7), Some(2));
        assert_eq!(group.translate_global_to_local(0), None);
    }

    #[test]
    fn group_rejects_duplicates_and_negative_ranks() {
        assert_eq!(
            Group::new(vec![0, 1, 0]).unwrap_err().kind(),
            ErrorKind::InvalidRank
        );
        assert_eq!(
            Group::new(vec![-3]).unwrap_err().kind(),
            ErrorKind::InvalidRank
        );
    }

    #[test]
    fn world_group_is_identity() {
        let group = Group::world(4);
        for r in 0..4 {
            assert_eq!(group.translate_local_to_global(r), Some(r));
        }
    }
}
