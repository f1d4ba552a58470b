//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees) addressed by
//! `(source, destination, tag)`. Receives are size-agnostic: a completed receive
//! hands back the whole message. Messages with equal addressing are delivered
//! in the order they were sent.
//!
//! All handles are **pollable** through [`Wait::test`] and **waitable** through
//! [`Wait::wait`]; the async stage polls many handles and only calls `wait`
//! once `test` reported completion.

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::Arc;

/// Non-blocking point-to-point communication interface (minimal by design).
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle;

    /// Rank of the calling process.
    fn rank(&self) -> usize;
    /// Number of processes in the communicator.
    fn size(&self) -> usize;
}

/// Anything that can be polled and waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
    /// Check for completion without blocking.
    fn test(&mut self) -> bool;
}

/// Typed message tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(v: u16) -> Self {
        Self(v)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    pub const fn base(self) -> u16 {
        self.0
    }
    /// Tag `k` slots above this one.
    pub const fn offset(self, k: u16) -> Self {
        Self(self.0.wrapping_add(k))
    }
}

/// A pair of tags used by a two-phase message: the first chunk travels on
/// `first`, the remainder (if any) on `second`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TagPair {
    pub first: CommTag,
    pub second: CommTag,
}

impl TagPair {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            first: base,
            second: base.offset(1),
        }
    }
}

/// Tags used by one balancing pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CascadeCommTags {
    /// Work summaries exchanged while combining children.
    pub info: TagPair,
    /// Load shipments.
    pub load: TagPair,
    /// All-reduce of the global load.
    pub reduce: CommTag,
}

impl CascadeCommTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            info: TagPair::from_base(base),
            load: TagPair::from_base(base.offset(2)),
            reduce: base.offset(4),
        }
    }
}

impl Default for CascadeCommTags {
    fn default() -> Self {
        Self::from_base(CommTag::new(0x5A00))
    }
}

/// Compile-time no-op comm for pure serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
    fn test(&mut self) -> bool {
        true
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16) {}

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// --- RayonComm: intra-process / one thread per rank ---
type Key = (usize, usize, u16); // (src, dst, tag)

/// Shared queues of in-flight messages, one FIFO per `(src, dst, tag)`.
#[derive(Debug, Default)]
pub struct Mailbox {
    queues: DashMap<Key, VecDeque<Bytes>>,
}

impl Mailbox {
    fn push(&self, key: Key, data: Bytes) {
        self.queues.entry(key).or_default().push_back(data);
    }

    fn pop(&self, key: &Key) -> Option<Bytes> {
        self.queues.get_mut(key).and_then(|mut q| q.pop_front())
    }

    /// Number of delivered but not yet received messages.
    pub fn in_flight(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }
}

static MAILBOX: Lazy<Arc<Mailbox>> = Lazy::new(|| Arc::new(Mailbox::default()));

pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
    data: Option<Bytes>,
}

impl Wait for LocalHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        while !self.test() {
            std::thread::yield_now();
        }
        self.data.take().map(|b| b.to_vec())
    }

    fn test(&mut self) -> bool {
        if self.data.is_none() {
            self.data = self.mailbox.pop(&self.key);
        }
        self.data.is_some()
    }
}

/// Intra-process communicator: every rank runs on its own thread and messages
/// travel through a shared [`Mailbox`]. Sends complete immediately.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl RayonComm {
    /// Rank `rank` of `size` on the process-global mailbox.
    pub fn new(rank: usize, size: usize) -> Self {
        Self {
            rank,
            size,
            mailbox: Arc::clone(&MAILBOX),
        }
    }

    /// A complete world of `size` ranks sharing a private mailbox.
    pub fn world(size: usize) -> Vec<Self> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.mailbox
            .push((self.rank, peer, tag), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle {
        LocalHandle {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
            data: None,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use crate::cascade_error::{CascadeError, CommError};
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    struct MpiWorld {
        world: SimpleCommunicator,
        // Finalizes MPI when the last handle goes away.
        _universe: Universe,
    }

    /// MPI communicator over `MPI_COMM_WORLD`.
    ///
    /// Sends use standard-mode `MPI_Send` and are complete when `isend`
    /// returns; every exchange issued by the balancer posts the matching
    /// receive before it waits, so this cannot deadlock. Receives probe for a
    /// matching message and pull it with a matched receive.
    #[derive(Clone)]
    pub struct MpiComm {
        inner: Arc<MpiWorld>,
        pub rank: usize,
        pub size: usize,
    }

    impl MpiComm {
        pub fn new() -> Result<Self, CascadeError> {
            let universe = mpi::initialize().ok_or_else(|| CascadeError::CommError {
                neighbor: 0,
                source: Box::new(CommError("MPI already initialized".into())),
            })?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                inner: Arc::new(MpiWorld {
                    world,
                    _universe: universe,
                }),
                rank,
                size,
            })
        }
    }

    pub struct MpiRecvHandle {
        inner: Arc<MpiWorld>,
        peer: i32,
        tag: i32,
        data: Option<Vec<u8>>,
    }

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if self.data.is_none() {
                let (msg, _status) = self
                    .inner
                    .world
                    .process_at_rank(self.peer)
                    .matched_probe_with_tag(self.tag);
                let (data, _status) = msg.matched_receive_vec::<u8>();
                self.data = Some(data);
            }
            self.data.take()
        }

        fn test(&mut self) -> bool {
            if self.data.is_none() {
                if let Some((msg, _status)) = self
                    .inner
                    .world
                    .process_at_rank(self.peer)
                    .immediate_matched_probe_with_tag(self.tag)
                {
                    let (data, _status) = msg.matched_receive_vec::<u8>();
                    self.data = Some(data);
                }
            }
            self.data.is_some()
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = ();
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
            self.inner
                .world
                .process_at_rank(peer as i32)
                .send_with_tag(buf, tag as i32);
        }

        fn irecv(&self, peer: usize, tag: u16) -> MpiRecvHandle {
            MpiRecvHandle {
                inner: Arc::clone(&self.inner),
                peer: peer as i32,
                tag: tag as i32,
                data: None,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
