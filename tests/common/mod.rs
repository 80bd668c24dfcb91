#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use mpi_p2p::topology::{ContextId, Rank};
use mpi_p2p::transport::loopback::Loopback;
use mpi_p2p::transport::{SendMode, Transport, TransportHandle, TransportStatus};
use mpi_p2p::{Error, ErrorKind, Result, Tag, Universe};

/// What the engine asked of a [`Scripted`] transport, and how it should misbehave
#[derive(Debug, Default)]
pub struct Script {
    pub sends: usize,
    pub receives: usize,
    pub probes: usize,
    pub cancels: usize,
    /// Sends with these indices, counted from 0, are refused at issue time.
    pub refuse_sends: Vec<usize>,
    /// Probes report every operation as still in flight.
    pub stall: bool,
}

impl Script {
    pub fn calls(&self) -> usize {
        self.sends + self.receives + self.probes + self.cancels
    }
}

/// A loopback endpoint that counts calls and injects failures
pub struct Scripted {
    inner: Loopback,
    script: Rc<RefCell<Script>>,
}

impl Scripted {
    pub fn new(inner: Loopback) -> (Scripted, Rc<RefCell<Script>>) {
        let script = Rc::new(RefCell::new(Script::default()));
        (
            Scripted {
                inner,
                script: script.clone(),
            },
            script,
        )
    }
}

impl Transport for Scripted {
    fn world_rank(&self) -> Rank {
        self.inner.world_rank()
    }

    fn world_size(&self) -> Rank {
        self.inner.world_size()
    }

    fn issue_send(
        &mut self,
        dest: Rank,
        tag: Tag,
        context: ContextId,
        payload: &[u8],
        mode: SendMode,
    ) -> Result<TransportHandle> {
        let index = {
            let mut script = self.script.borrow_mut();
            script.sends += 1;
            script.sends - 1
        };
        if self.script.borrow().refuse_sends.contains(&index) {
            return Err(Error::with_detail(ErrorKind::Internal, "refused by script"));
        }
        self.inner.issue_send(dest, tag, context, payload, mode)
    }

    fn issue_receive(
        &mut self,
        source: Option<Rank>,
        tag: Option<Tag>,
        context: ContextId,
        capacity: usize,
    ) -> Result<TransportHandle> {
        self.script.borrow_mut().receives += 1;
        self.inner.issue_receive(source, tag, context, capacity)
    }

    fn progress_probe(
        &mut self,
        handle: TransportHandle,
        buffer: &mut [u8],
    ) -> Option<TransportStatus> {
        self.script.borrow_mut().probes += 1;
        if self.script.borrow().stall {
            return None;
        }
        self.inner.progress_probe(handle, buffer)
    }

    fn progress_cancel(&mut self, handle: TransportHandle) -> bool {
        self.script.borrow_mut().cancels += 1;
        self.inner.progress_cancel(handle)
    }
}

/// A single-process universe on a scripted transport
pub fn scripted_universe() -> (Universe, Rc<RefCell<Script>>) {
    let (transport, script) = Scripted::new(Loopback::single());
    let universe = mpi_p2p::initialize(transport).expect("initialize");
    (universe, script)
}

/// Two universes connected by a loopback fabric
pub fn pair() -> (Universe, Universe) {
    let mut endpoints = Loopback::world(2).into_iter();
    let first = endpoints.next().expect("rank 0");
    let second = endpoints.next().expect("rank 1");
    (
        mpi_p2p::initialize(first).expect("initialize rank 0"),
        mpi_p2p::initialize(second).expect("initialize rank 1"),
    )
}
