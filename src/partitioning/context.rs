//! State shared by every step of one balancing pass.
//!
//! The tree algorithms take a `&mut BalanceContext` instead of reaching back
//! into the partitioner: it owns the communication stage and the shipment
//! being assembled, and borrows the local load and the parameters.

use log::{debug, warn};

use crate::algs::communicator::{CascadeCommTags, Communicator};
use crate::algs::stage::{AsyncCommStage, MemberId};
use crate::algs::wire::WireGroupSummary;
use crate::cascade_error::{CascadeError, CommError};
use crate::partitioning::load::LoadCollection;
use crate::partitioning::metrics::BalanceStats;
use crate::partitioning::params::CascadeParams;

/// What a stage member is currently doing; doubles as its handler label.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exchange {
    Idle,
    /// Receiving the work summary of the far group from contact `slot`.
    SummaryRecv { slot: usize },
    SummarySend { slot: usize },
    /// Receiving a load shipment from contact `slot`.
    ShipmentRecv { slot: usize },
    ShipmentSend,
}

/// Members 0 and 1 receive from the two possible contacts, 2 and 3 send.
const NUM_PEERS: usize = 4;
const SEND_OFFSET: usize = 2;

pub struct BalanceContext<'a, C: Communicator, L: LoadCollection> {
    pub(crate) rank: usize,
    pub(crate) nprocs: usize,
    pub(crate) global_avg: f64,
    pub(crate) params: &'a CascadeParams,
    tags: CascadeCommTags,
    pub(crate) local_load: &'a mut L,
    /// Work picked for the next outgoing shipment.
    pub(crate) shipment: L,
    pub(crate) stage: AsyncCommStage<'a, C, Exchange>,
    peers: [MemberId; NUM_PEERS],
    pub(crate) stats: BalanceStats,
}

impl<'a, C: Communicator, L: LoadCollection> BalanceContext<'a, C, L> {
    pub fn new(
        comm: &'a C,
        params: &'a CascadeParams,
        local_load: &'a mut L,
        global_avg: f64,
    ) -> Self {
        let mut stage = AsyncCommStage::new(comm);
        let peers = std::array::from_fn(|_| stage.add_peer(Exchange::Idle));
        Self {
            rank: comm.rank(),
            nprocs: comm.size(),
            global_avg,
            params,
            tags: params.tags(),
            local_load,
            shipment: L::default(),
            stage,
            peers,
            stats: BalanceStats::default(),
        }
    }

    pub fn tol(&self) -> f64 {
        self.params.load_comparison_tol
    }

    /// Half-width of the window `adjust_load` may land in.
    pub fn flex(&self) -> f64 {
        self.params.flexible_load_tol * self.global_avg
    }

    fn setup(
        &mut self,
        member: usize,
        exchange: Exchange,
        peer_rank: usize,
        first_len: usize,
        load: bool,
    ) -> Result<MemberId, CascadeError> {
        let id = self.peers[member];
        let tags = if load { self.tags.load } else { self.tags.info };
        let p = self.stage.peer_mut(id)?;
        p.set_handler(exchange);
        p.set_peer_rank(peer_rank);
        p.set_tags(tags);
        p.limit_first_data_length(first_len);
        Ok(id)
    }

    /// Swap work summaries with contact `slot`: post the receive of the far
    /// group's summary and the send of ours.
    pub(crate) fn begin_summary_exchange(
        &mut self,
        slot: usize,
        contact: usize,
        summary: &WireGroupSummary,
    ) -> Result<(), CascadeError> {
        let len = WireGroupSummary::SIZE;
        let recv = self.setup(slot, Exchange::SummaryRecv { slot }, contact, len, false)?;
        self.stage.begin_recv(recv)?;
        let send = self.setup(
            SEND_OFFSET + slot,
            Exchange::SummarySend { slot },
            contact,
            len,
            false,
        )?;
        self.stage.begin_send(send, &summary.to_bytes())
    }

    /// Decode the summary a completed member received, if it was a summary
    /// receive. Returns the contact slot it came from.
    pub(crate) fn received_summary(
        &self,
        id: MemberId,
    ) -> Result<Option<(usize, WireGroupSummary)>, CascadeError> {
        let p = self.stage.peer(id)?;
        let Exchange::SummaryRecv { slot } = *p.handler() else {
            return Ok(None);
        };
        let summary = WireGroupSummary::from_bytes(p.recv_data()).map_err(|e| {
            CascadeError::CommError {
                neighbor: p.peer_rank().unwrap_or(usize::MAX),
                source: Box::new(CommError(e)),
            }
        })?;
        Ok(Some((slot, summary)))
    }

    /// Post the receive of a shipment from contact `slot`.
    pub(crate) fn expect_shipment(&mut self, slot: usize, from: usize) -> Result<(), CascadeError> {
        let first = self.params.first_data_len;
        let id = self.setup(slot, Exchange::ShipmentRecv { slot }, from, first, true)?;
        debug!("rank {}: expecting shipment from {from}", self.rank);
        self.stage.begin_recv(id)
    }

    /// Pack the current shipment, send it to `taker` and clear it.
    pub(crate) fn send_shipment(&mut self, taker: usize) -> Result<(), CascadeError> {
        let amount = self.shipment.sum_load();
        let bytes = self.shipment.pack()?;
        let first = self.params.first_data_len;
        let id = self.setup(SEND_OFFSET, Exchange::ShipmentSend, taker, first, true)?;
        self.stage.begin_send(id, &bytes)?;
        debug!(
            "rank {}: shipped {amount:.6} work to {taker} ({} bytes)",
            self.rank,
            bytes.len()
        );
        self.stats.shipments_sent += 1;
        self.stats.work_sent += amount;
        self.shipment.clear();
        Ok(())
    }

    /// Wait for every posted shipment receive and merge its work into the
    /// local load.
    pub(crate) fn receive_and_unpack_supplied_load(&mut self) -> Result<(), CascadeError> {
        while let Some(id) = self.stage.next_completed()? {
            let p = self.stage.peer(id)?;
            if !matches!(p.handler(), Exchange::ShipmentRecv { .. }) {
                continue;
            }
            let from = p.peer_rank().unwrap_or(usize::MAX);
            self.shipment = L::unpack(p.recv_data())?;
            let amount = self.shipment.sum_load();
            self.local_load.insert_all(&self.shipment);
            self.shipment.clear();
            debug!("rank {}: unpacked {amount:.6} work from {from}", self.rank);
            self.stats.shipments_received += 1;
            self.stats.work_received += amount;
        }
        Ok(())
    }

    /// Finish everything still in flight and forget completed members.
    pub(crate) fn settle(&mut self) -> Result<(), CascadeError> {
        self.stage.advance_all()?;
        self.stage.clear_completion_queue();
        Ok(())
    }

    pub(crate) fn shipment_is_empty(&self) -> bool {
        self.shipment.is_empty()
    }

    /// Close the pass and hand back its statistics.
    pub fn finish(mut self) -> BalanceStats {
        if self.stage.has_pending_requests() {
            warn!(
                "rank {}: {} requests still pending at the end of the pass",
                self.rank,
                self.stage.number_of_pending_requests()
            );
        }
        self.stats.comm_wait = self.stage.wait_time();
        self.stats
    }
}
