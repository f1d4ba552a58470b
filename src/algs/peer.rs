//! Point-to-point stage member: one peer, one two-phase message at a time.
//!
//! A [`CommPeer`] sends or receives a byte message of any length. The first
//! chunk carries a [`WireChunkHdr`] plus up to `first_data_len` payload bytes
//! on the first tag of its [`TagPair`]; anything beyond that travels as a
//! second chunk on the second tag. Senders post both chunks at once, receivers
//! post the second receive only after the header says one is coming.
//!
//! The member does not own its request handles. They live in the slots the
//! [`AsyncCommStage`](crate::algs::stage::AsyncCommStage) reserved for it and
//! are handed in by the stage whenever the member needs to post or finish one.

use crate::algs::communicator::{CommTag, Communicator, TagPair, Wait};
use crate::algs::wire::WireChunkHdr;
use crate::cascade_error::{CascadeError, CommError};

/// Default limit on the payload carried by a first chunk.
pub const DEFAULT_FIRST_DATA_LEN: usize = 1024;

/// A request handle stored in a stage slot.
pub(crate) enum Request<C: Communicator> {
    Send(C::SendHandle),
    Recv(C::RecvHandle),
}

impl<C: Communicator> Request<C> {
    pub(crate) fn test(&mut self) -> bool {
        match self {
            Request::Send(h) => h.test(),
            Request::Recv(h) => h.test(),
        }
    }

    /// Retire a completed request, returning received bytes for receives.
    pub(crate) fn finish(self) -> Option<Vec<u8>> {
        match self {
            Request::Send(h) => {
                h.wait();
                None
            }
            Request::Recv(h) => h.wait(),
        }
    }

    pub(crate) fn is_recv(&self) -> bool {
        matches!(self, Request::Recv(_))
    }
}

/// Kind of operation a peer carries out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeerOp {
    Send,
    Recv,
}

/// Where a peer is in its current operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// No operation in flight.
    Idle,
    /// One or two chunks posted.
    Sending,
    /// Waiting for the header chunk.
    ReceivingFirst,
    /// Header seen, waiting for the remainder of a `total`-byte message.
    ReceivingSecond { total: usize },
}

pub struct CommPeer<H> {
    handler: H,
    peer_rank: Option<usize>,
    tags: TagPair,
    first_data_len: usize,
    state: PeerState,
    completed_op: Option<PeerOp>,
    recv_buf: Vec<u8>,
    recv_total: usize,
}

impl<H> CommPeer<H> {
    /// Request slots every peer reserves on its stage.
    pub const NUM_REQUESTS: usize = 2;

    pub fn new(handler: H) -> Self {
        Self {
            handler,
            peer_rank: None,
            tags: TagPair::from_base(CommTag::new(0)),
            first_data_len: DEFAULT_FIRST_DATA_LEN,
            state: PeerState::Idle,
            completed_op: None,
            recv_buf: Vec::new(),
            recv_total: 0,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
    pub fn set_handler(&mut self, handler: H) {
        self.handler = handler;
    }

    pub fn peer_rank(&self) -> Option<usize> {
        self.peer_rank
    }
    pub fn set_peer_rank(&mut self, rank: usize) {
        self.peer_rank = Some(rank);
    }

    pub fn tags(&self) -> TagPair {
        self.tags
    }
    pub fn set_tags(&mut self, tags: TagPair) {
        self.tags = tags;
    }

    /// Limit how many payload bytes ride along with the header chunk.
    /// A limit of zero is raised to one byte.
    pub fn limit_first_data_length(&mut self, len: usize) {
        self.first_data_len = len.max(1);
    }
    pub fn first_data_length(&self) -> usize {
        self.first_data_len
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Whether the whole operation, follow-up chunks included, is finished.
    pub fn is_done(&self) -> bool {
        self.state == PeerState::Idle
    }

    /// The last operation this peer completed.
    pub fn completed_op(&self) -> Option<PeerOp> {
        self.completed_op
    }

    /// Bytes of the last completed receive.
    pub fn recv_data(&self) -> &[u8] {
        &self.recv_buf
    }
    pub fn recv_size(&self) -> usize {
        self.recv_buf.len()
    }

    fn require_peer(&self) -> usize {
        self.peer_rank
            .expect("CommPeer: peer rank must be set before communicating")
    }

    fn comm_error(&self, msg: String) -> CascadeError {
        CascadeError::CommError {
            neighbor: self.peer_rank.unwrap_or(usize::MAX),
            source: Box::new(CommError(msg)),
        }
    }

    pub(crate) fn begin_send<C: Communicator>(
        &mut self,
        comm: &C,
        reqs: &mut [Option<Request<C>>],
        data: &[u8],
    ) {
        debug_assert!(self.is_done());
        let peer = self.require_peer();
        let first_len = data.len().min(self.first_data_len);

        let hdr = WireChunkHdr::new(first_len, data.len());
        let mut first = Vec::with_capacity(WireChunkHdr::SIZE + first_len);
        first.extend_from_slice(bytemuck::bytes_of(&hdr));
        first.extend_from_slice(&data[..first_len]);
        reqs[0] = Some(Request::Send(comm.isend(
            peer,
            self.tags.first.as_u16(),
            &first,
        )));
        if first_len < data.len() {
            reqs[1] = Some(Request::Send(comm.isend(
                peer,
                self.tags.second.as_u16(),
                &data[first_len..],
            )));
        }
        self.completed_op = None;
        self.state = PeerState::Sending;
    }

    pub(crate) fn begin_recv<C: Communicator>(
        &mut self,
        comm: &C,
        reqs: &mut [Option<Request<C>>],
    ) {
        debug_assert!(self.is_done());
        let peer = self.require_peer();
        self.recv_buf.clear();
        self.recv_total = 0;
        reqs[0] = Some(Request::Recv(comm.irecv(peer, self.tags.first.as_u16())));
        self.completed_op = None;
        self.state = PeerState::ReceivingFirst;
    }

    /// Absorb the data of a request that just completed in slot `offset`.
    pub(crate) fn accept_chunk(
        &mut self,
        offset: usize,
        was_recv: bool,
        data: Option<Vec<u8>>,
    ) -> Result<(), CascadeError> {
        if !was_recv {
            return Ok(());
        }
        let data = data.ok_or_else(|| self.comm_error("receive completed without data".into()))?;
        match (self.state, offset) {
            (PeerState::ReceivingFirst, 0) => {
                let (hdr, payload) = WireChunkHdr::parse(&data).map_err(|e| self.comm_error(e))?;
                self.recv_total = hdr.total_len();
                self.recv_buf.clear();
                self.recv_buf.reserve(self.recv_total);
                self.recv_buf.extend_from_slice(payload);
                Ok(())
            }
            (PeerState::ReceivingSecond { total }, 1) => {
                let expected = total - self.recv_buf.len();
                crate::algs::wire::expect_exact_len(data.len(), expected)
                    .map_err(|e| self.comm_error(e))?;
                self.recv_buf.extend_from_slice(&data);
                Ok(())
            }
            (state, offset) => Err(self.comm_error(format!(
                "unexpected chunk in slot {offset} while {state:?}"
            ))),
        }
    }

    /// Called once none of this member's requests is pending. Posts any
    /// follow-up request and reports whether the operation is now complete.
    pub(crate) fn proceed_to_next_wait<C: Communicator>(
        &mut self,
        comm: &C,
        reqs: &mut [Option<Request<C>>],
    ) -> bool {
        match self.state {
            PeerState::Idle => true,
            PeerState::Sending => {
                self.finish(PeerOp::Send);
                true
            }
            PeerState::ReceivingFirst if self.recv_buf.len() < self.recv_total => {
                let peer = self.require_peer();
                reqs[1] = Some(Request::Recv(
                    comm.irecv(peer, self.tags.second.as_u16()),
                ));
                self.state = PeerState::ReceivingSecond {
                    total: self.recv_total,
                };
                false
            }
            PeerState::ReceivingFirst | PeerState::ReceivingSecond { .. } => {
                self.finish(PeerOp::Recv);
                true
            }
        }
    }

    fn finish(&mut self, op: PeerOp) {
        self.state = PeerState::Idle;
        self.completed_op = Some(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::RayonComm;

    fn drive<C: Communicator>(
        peer: &mut CommPeer<()>,
        comm: &C,
        reqs: &mut [Option<Request<C>>],
    ) -> bool {
        loop {
            for (i, slot) in reqs.iter_mut().enumerate() {
                if let Some(req) = slot.as_mut() {
                    if req.test() {
                        let req = slot.take().unwrap();
                        let was_recv = req.is_recv();
                        peer.accept_chunk(i, was_recv, req.finish()).unwrap();
                    }
                }
            }
            if reqs.iter().all(Option::is_none) && peer.proceed_to_next_wait(comm, reqs) {
                return true;
            }
        }
    }

    #[test]
    fn long_message_travels_in_two_chunks() {
        let world = RayonComm::world(2);
        let tags = TagPair::from_base(CommTag::new(0x40));
        let payload: Vec<u8> = (0..100u8).collect();

        let mut sender = CommPeer::new(());
        sender.set_peer_rank(1);
        sender.set_tags(tags);
        sender.limit_first_data_length(10);
        let mut sreqs: Vec<Option<Request<RayonComm>>> = vec![None, None];
        sender.begin_send(&world[0], &mut sreqs, &payload);
        assert!(sreqs.iter().all(Option::is_some));
        assert!(drive(&mut sender, &world[0], &mut sreqs));
        assert_eq!(sender.completed_op(), Some(PeerOp::Send));

        let mut receiver = CommPeer::new(());
        receiver.set_peer_rank(0);
        receiver.set_tags(tags);
        let mut rreqs: Vec<Option<Request<RayonComm>>> = vec![None, None];
        receiver.begin_recv(&world[1], &mut rreqs);
        assert!(drive(&mut receiver, &world[1], &mut rreqs));
        assert_eq!(receiver.recv_data(), payload.as_slice());
        assert_eq!(receiver.completed_op(), Some(PeerOp::Recv));
    }

    #[test]
    fn empty_message_is_one_chunk() {
        let world = RayonComm::world(2);
        let mut sender = CommPeer::new(());
        sender.set_peer_rank(1);
        let mut sreqs: Vec<Option<Request<RayonComm>>> = vec![None, None];
        sender.begin_send(&world[0], &mut sreqs, &[]);
        assert!(sreqs[1].is_none());

        let mut receiver = CommPeer::new(());
        receiver.set_peer_rank(0);
        let mut rreqs: Vec<Option<Request<RayonComm>>> = vec![None, None];
        receiver.begin_recv(&world[1], &mut rreqs);
        assert!(drive(&mut receiver, &world[1], &mut rreqs));
        assert_eq!(receiver.recv_size(), 0);
    }

    #[test]
    fn garbage_header_is_a_comm_error() {
        let world = RayonComm::world(2);
        world[0].isend(1, 0, &[1, 2, 3]);
        let mut receiver = CommPeer::new(());
        receiver.set_peer_rank(0);
        let mut rreqs: Vec<Option<Request<RayonComm>>> = vec![None, None];
        receiver.begin_recv(&world[1], &mut rreqs);
        let req = rreqs[0].take().unwrap();
        let err = receiver.accept_chunk(0, true, req.finish()).unwrap_err();
        assert!(matches!(err, CascadeError::CommError { neighbor: 0, .. }));
    }
}
