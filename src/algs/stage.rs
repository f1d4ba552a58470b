//! Stage many non-blocking peer communications so that waiting code can
//! advance them in whatever order the transport completes them.
//!
//! An [`AsyncCommStage`] is a registry of [`CommPeer`] members. Each member
//! reserves a fixed run of request slots in one shared array, so a single
//! sweep over that array covers every member on the stage no matter how many
//! independent exchanges are in flight. When all of a member's requests have
//! finished the member gets to post its follow-up requests; it only counts as
//! completed once its whole operation is done.
//!
//! Completion order is **not** deterministic. Code built on the stage must
//! only rely on each tagged message being delivered exactly once.
//!
//! All progress happens inside the `advance_*` calls on the calling thread;
//! there is no background progress.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::algs::communicator::Communicator;
use crate::algs::peer::{CommPeer, Request};
use crate::cascade_error::CascadeError;
use crate::debug_invariants::{DebugInvariants, ensure};

/// Handle to a member registered on a stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemberId {
    index: usize,
    generation: u32,
}

impl MemberId {
    /// Index of the member's slot on its stage.
    pub fn index(&self) -> usize {
        self.index
    }
}

struct Slot<H> {
    member: Option<CommPeer<H>>,
    generation: u32,
    first_req: usize,
    nreq: usize,
}

pub struct AsyncCommStage<'c, C: Communicator, H = ()> {
    comm: &'c C,
    slots: Vec<Slot<H>>,
    /// Request slots shared by all members.
    requests: Vec<Option<Request<C>>>,
    req_to_member: Vec<usize>,
    /// Detached slots available for reuse, keyed by their request count.
    vacant: HashMap<usize, Vec<usize>>,
    member_count: usize,
    completed: VecDeque<MemberId>,
    cursor: usize,
    wait_time: Duration,
}

impl<'c, C: Communicator, H> AsyncCommStage<'c, C, H> {
    pub fn new(comm: &'c C) -> Self {
        Self {
            comm,
            slots: Vec::new(),
            requests: Vec::new(),
            req_to_member: Vec::new(),
            vacant: HashMap::new(),
            member_count: 0,
            completed: VecDeque::new(),
            cursor: 0,
            wait_time: Duration::ZERO,
        }
    }

    pub fn comm(&self) -> &'c C {
        self.comm
    }

    /// Register a new peer member carrying `handler`.
    pub fn add_peer(&mut self, handler: H) -> MemberId {
        self.stage_member(CommPeer::new(handler), CommPeer::<H>::NUM_REQUESTS)
    }

    fn stage_member(&mut self, member: CommPeer<H>, nreq: usize) -> MemberId {
        self.member_count += 1;
        if let Some(index) = self.vacant.get_mut(&nreq).and_then(Vec::pop) {
            let slot = &mut self.slots[index];
            debug_assert!(slot.member.is_none());
            slot.member = Some(member);
            return MemberId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len();
        let first_req = self.requests.len();
        self.requests.extend((0..nreq).map(|_| None));
        self.req_to_member
            .extend(std::iter::repeat(index).take(nreq));
        self.slots.push(Slot {
            member: Some(member),
            generation: 0,
            first_req,
            nreq,
        });
        MemberId {
            index,
            generation: 0,
        }
    }

    /// Detach a member from the stage, recycling its request slots.
    pub fn remove_member(&mut self, id: MemberId) -> Result<CommPeer<H>, CascadeError> {
        self.check(id)?;
        if self.member_has_pending(id.index) {
            return Err(CascadeError::MemberBusy(id.index));
        }
        let slot = &mut self.slots[id.index];
        let member = slot.member.take().ok_or(CascadeError::UnknownMember(id.index))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.entry(slot.nreq).or_default().push(id.index);
        self.member_count -= 1;
        self.completed.retain(|&c| c != id);
        Ok(member)
    }

    fn check(&self, id: MemberId) -> Result<(), CascadeError> {
        match self.slots.get(id.index) {
            Some(slot) if slot.generation == id.generation && slot.member.is_some() => Ok(()),
            _ => Err(CascadeError::UnknownMember(id.index)),
        }
    }

    pub fn peer(&self, id: MemberId) -> Result<&CommPeer<H>, CascadeError> {
        self.check(id)?;
        self.slots[id.index]
            .member
            .as_ref()
            .ok_or(CascadeError::UnknownMember(id.index))
    }

    pub fn peer_mut(&mut self, id: MemberId) -> Result<&mut CommPeer<H>, CascadeError> {
        self.check(id)?;
        self.slots[id.index]
            .member
            .as_mut()
            .ok_or(CascadeError::UnknownMember(id.index))
    }

    /// Iterate over the ids of all registered members.
    pub fn member_ids(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, s)| {
            s.member.as_ref().map(|_| MemberId {
                index,
                generation: s.generation,
            })
        })
    }

    fn idle_member(
        &mut self,
        id: MemberId,
    ) -> Result<(&mut CommPeer<H>, &mut [Option<Request<C>>]), CascadeError> {
        self.check(id)?;
        if self.member_has_pending(id.index) {
            return Err(CascadeError::MemberBusy(id.index));
        }
        let slot = &mut self.slots[id.index];
        let reqs = &mut self.requests[slot.first_req..slot.first_req + slot.nreq];
        let member = slot
            .member
            .as_mut()
            .ok_or(CascadeError::UnknownMember(id.index))?;
        Ok((member, reqs))
    }

    /// Start sending `data` to the member's peer.
    pub fn begin_send(&mut self, id: MemberId, data: &[u8]) -> Result<(), CascadeError> {
        let comm = self.comm;
        let (member, reqs) = self.idle_member(id)?;
        member.begin_send(comm, reqs, data);
        Ok(())
    }

    /// Start receiving one message from the member's peer.
    pub fn begin_recv(&mut self, id: MemberId) -> Result<(), CascadeError> {
        let comm = self.comm;
        let (member, reqs) = self.idle_member(id)?;
        member.begin_recv(comm, reqs);
        Ok(())
    }

    fn member_has_pending(&self, index: usize) -> bool {
        let slot = &self.slots[index];
        self.requests[slot.first_req..slot.first_req + slot.nreq]
            .iter()
            .any(Option::is_some)
    }

    /// Retire request `r` and let its member move on. Returns the member if
    /// its whole operation is now complete.
    fn complete_request(
        &mut self,
        r: usize,
        req: Request<C>,
    ) -> Result<Option<MemberId>, CascadeError> {
        let index = self.req_to_member[r];
        let was_recv = req.is_recv();
        let data = req.finish();
        let slot = &mut self.slots[index];
        let reqs = &mut self.requests[slot.first_req..slot.first_req + slot.nreq];
        let member = slot
            .member
            .as_mut()
            .ok_or(CascadeError::UnknownMember(index))?;
        member.accept_chunk(r - slot.first_req, was_recv, data)?;
        if reqs.iter().any(Option::is_some) {
            return Ok(None);
        }
        if member.proceed_to_next_wait(self.comm, reqs) {
            Ok(Some(MemberId {
                index,
                generation: slot.generation,
            }))
        } else {
            Ok(None)
        }
    }

    /// One pass over every request slot, starting at the fairness cursor.
    fn sweep(&mut self, stop_after_first: bool) -> Result<Vec<MemberId>, CascadeError> {
        let n = self.requests.len();
        let mut done = Vec::new();
        for k in 0..n {
            let r = (self.cursor + k) % n;
            let finished = self.requests[r].as_mut().is_some_and(|req| req.test());
            if !finished {
                continue;
            }
            let Some(req) = self.requests[r].take() else {
                continue;
            };
            if let Some(id) = self.complete_request(r, req)? {
                done.push(id);
                if stop_after_first {
                    self.cursor = (r + 1) % n;
                    break;
                }
            }
        }
        Ok(done)
    }

    /// Advance until any one member completes its operation and return it.
    /// Returns `None` when nothing on the stage is pending.
    ///
    /// The completed member is also appended to the completion queue.
    pub fn advance_any(&mut self) -> Result<Option<MemberId>, CascadeError> {
        let start = Instant::now();
        let result = loop {
            if !self.has_pending_requests() {
                break None;
            }
            if let Some(&id) = self.sweep(true)?.first() {
                self.completed.push_back(id);
                break Some(id);
            }
            std::thread::yield_now();
        };
        self.wait_time += start.elapsed();
        Ok(result)
    }

    /// Advance until at least one member completes, collecting every member
    /// that completed along the way. Less prone to starvation than repeated
    /// [`advance_any`](Self::advance_any) calls.
    pub fn advance_some(&mut self) -> Result<Vec<MemberId>, CascadeError> {
        let start = Instant::now();
        let mut done = Vec::new();
        while done.is_empty() && self.has_pending_requests() {
            done = self.sweep(false)?;
            if done.is_empty() {
                std::thread::yield_now();
            }
        }
        self.completed.extend(done.iter().copied());
        self.wait_time += start.elapsed();
        Ok(done)
    }

    /// Advance until no member has pending communication.
    pub fn advance_all(&mut self) -> Result<Vec<MemberId>, CascadeError> {
        let mut done = Vec::new();
        while self.has_pending_requests() {
            done.extend(self.advance_some()?);
        }
        Ok(done)
    }

    /// Next completed member: from the completion queue if it is not empty,
    /// otherwise by advancing the stage.
    pub fn next_completed(&mut self) -> Result<Option<MemberId>, CascadeError> {
        if self.completed.is_empty() {
            self.advance_any()?;
        }
        Ok(self.completed.pop_front())
    }

    pub fn pop_completion_queue(&mut self) -> Option<MemberId> {
        self.completed.pop_front()
    }

    pub fn clear_completion_queue(&mut self) {
        self.completed.clear();
    }

    pub fn number_of_completed_members(&self) -> usize {
        self.completed.len()
    }

    pub fn number_of_members(&self) -> usize {
        self.member_count
    }

    pub fn number_of_pending_members(&self) -> usize {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].member.is_some() && self.member_has_pending(i))
            .count()
    }

    pub fn number_of_pending_requests(&self) -> usize {
        self.requests.iter().filter(|r| r.is_some()).count()
    }

    pub fn has_pending_requests(&self) -> bool {
        self.requests.iter().any(Option::is_some)
    }

    /// Time spent waiting inside `advance_*`, including the time members
    /// spent handling their completed chunks.
    pub fn wait_time(&self) -> Duration {
        self.wait_time
    }
}

impl<C: Communicator, H> DebugInvariants for AsyncCommStage<'_, C, H> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "AsyncCommStage");
    }

    fn validate_invariants(&self) -> Result<(), CascadeError> {
        ensure(self.requests.len() == self.req_to_member.len(), || {
            "request and request-to-member maps differ in length".into()
        })?;
        let live = self.slots.iter().filter(|s| s.member.is_some()).count();
        ensure(live == self.member_count, || {
            format!("member count {} but {live} live slots", self.member_count)
        })?;
        for (index, slot) in self.slots.iter().enumerate() {
            let range = slot.first_req..slot.first_req + slot.nreq;
            ensure(range.end <= self.requests.len(), || {
                format!("slot {index} reaches past the request array")
            })?;
            ensure(
                self.req_to_member[range.clone()].iter().all(|&m| m == index),
                || format!("slot {index} requests are mapped to another member"),
            )?;
            ensure(
                slot.member.is_some() || self.requests[range].iter().all(Option::is_none),
                || format!("vacant slot {index} holds a pending request"),
            )?;
        }
        let vacant: usize = self.vacant.values().map(Vec::len).sum();
        ensure(vacant + self.member_count == self.slots.len(), || {
            "vacant list does not cover the detached slots".into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{CommTag, RayonComm, TagPair};
    use crate::algs::peer::PeerOp;

    #[test]
    fn empty_stage_has_nothing_to_advance() {
        let world = RayonComm::world(1);
        let mut stage: AsyncCommStage<'_, RayonComm> = AsyncCommStage::new(&world[0]);
        assert_eq!(stage.advance_any().unwrap(), None);
        assert!(stage.advance_all().unwrap().is_empty());
        assert_eq!(stage.number_of_members(), 0);
    }

    #[test]
    fn detached_slots_are_reused() {
        let world = RayonComm::world(1);
        let mut stage: AsyncCommStage<'_, RayonComm, u8> = AsyncCommStage::new(&world[0]);
        let a = stage.add_peer(1);
        let b = stage.add_peer(2);
        stage.remove_member(a).unwrap();
        assert!(matches!(stage.peer(a), Err(CascadeError::UnknownMember(_))));
        let c = stage.add_peer(3);
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert_eq!(*stage.peer(c).unwrap().handler(), 3);
        assert_eq!(*stage.peer(b).unwrap().handler(), 2);
        assert_eq!(stage.number_of_members(), 2);
        stage.validate_invariants().unwrap();
    }

    #[test]
    fn busy_member_cannot_restart_or_detach() {
        let world = RayonComm::world(2);
        let mut stage: AsyncCommStage<'_, RayonComm> = AsyncCommStage::new(&world[0]);
        let id = stage.add_peer(());
        stage.peer_mut(id).unwrap().set_peer_rank(1);
        stage.begin_recv(id).unwrap();
        assert!(matches!(stage.begin_recv(id), Err(CascadeError::MemberBusy(_))));
        assert!(matches!(stage.remove_member(id), Err(CascadeError::MemberBusy(_))));
        assert_eq!(stage.number_of_pending_members(), 1);
    }

    #[test]
    fn members_complete_in_any_order() {
        let world = RayonComm::world(3);
        let tags = TagPair::from_base(CommTag::new(0x20));
        let mut stage: AsyncCommStage<'_, RayonComm, usize> = AsyncCommStage::new(&world[0]);
        let from1 = stage.add_peer(1);
        let from2 = stage.add_peer(2);
        for id in [from1, from2] {
            let p = stage.peer_mut(id).unwrap();
            let src = *p.handler();
            p.set_peer_rank(src);
            p.set_tags(tags);
            p.limit_first_data_length(4);
            stage.begin_recv(id).unwrap();
        }

        // Rank 2 answers first, with a message long enough to need two chunks.
        let mut s2: AsyncCommStage<'_, RayonComm> = AsyncCommStage::new(&world[2]);
        let to0 = s2.add_peer(());
        s2.peer_mut(to0).unwrap().set_peer_rank(0);
        s2.peer_mut(to0).unwrap().set_tags(tags);
        s2.peer_mut(to0).unwrap().limit_first_data_length(4);
        s2.begin_send(to0, b"from rank two").unwrap();
        assert_eq!(s2.advance_all().unwrap(), vec![to0]);

        let first = stage.advance_any().unwrap().unwrap();
        assert_eq!(first, from2);
        assert_eq!(stage.peer(first).unwrap().recv_data(), b"from rank two");
        assert_eq!(stage.peer(first).unwrap().completed_op(), Some(PeerOp::Recv));
        assert_eq!(stage.pop_completion_queue(), Some(from2));

        let mut s1: AsyncCommStage<'_, RayonComm> = AsyncCommStage::new(&world[1]);
        let to0 = s1.add_peer(());
        s1.peer_mut(to0).unwrap().set_peer_rank(0);
        s1.peer_mut(to0).unwrap().set_tags(tags);
        s1.begin_send(to0, b"one").unwrap();
        s1.advance_all().unwrap();

        assert_eq!(stage.next_completed().unwrap(), Some(from1));
        assert_eq!(stage.peer(from1).unwrap().recv_data(), b"one");
        assert!(!stage.has_pending_requests());
        assert_eq!(stage.next_completed().unwrap(), None);
        stage.validate_invariants().unwrap();
    }
}
