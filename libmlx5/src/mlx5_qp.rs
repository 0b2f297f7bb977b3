use std::sync::Arc;

use bytes::BytesMut;
use derivative::Derivative;
use likely_stable::unlikely;
use nix::errno::Errno;
use nix::Error;
use parking_lot::Mutex;
use tracing::trace;

use crate::mlx5_cqe::Mlx5InlineScatter;
use crate::mlx5_srq::Mlx5Srq;
use crate::mlx5_verbs::{WcOpcode, WcStatus};

/// Work queue bookkeeping: which WR sits in which WQE slot.
///
/// Send queues are indexed by WQE basic block (`cur_post`), receive queues by
/// WR ordinal (`head`).
#[derive(Debug, Derivative)]
#[derivative(Default)]
pub struct Mlx5Wq {
    wrid: Vec<u64>,
    /// WR ordinal of the WQE starting at each slot
    wqe_head: Vec<u32>,
    /// opcode recorded at post time for WQEs the cqe cannot describe
    wr_data: Vec<WcOpcode>,
    bufs: Vec<BytesMut>,
    wqe_cnt: u32,
    head: u32,
    tail: u32,
    cur_post: u32,
}

impl Mlx5Wq {
    pub fn new(wqe_cnt: u32) -> Result<Self, Error> {
        if !wqe_cnt.is_power_of_two() {
            return Err(Errno::EINVAL);
        }
        let n = wqe_cnt as usize;
        Ok(Self {
            wrid: vec![0; n],
            wqe_head: vec![0; n],
            wr_data: vec![WcOpcode::default(); n],
            bufs: vec![BytesMut::new(); n],
            wqe_cnt,
            ..Default::default()
        })
    }

    pub fn wqe_cnt(&self) -> u32 {
        self.wqe_cnt
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.wqe_cnt - 1
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Outstanding WRs
    pub fn outstanding(&self) -> u32 {
        self.head.wrapping_sub(self.tail)
    }

    /// Record a send WR spanning `nwqebb` basic blocks and return the wqe
    /// counter the device will report for it.
    pub fn post_send(
        &mut self,
        wr_id: u64,
        opcode: WcOpcode,
        nwqebb: u32,
        buf: Option<BytesMut>,
    ) -> Result<u16, Error> {
        if nwqebb == 0 || nwqebb > self.wqe_cnt {
            return Err(Errno::EINVAL);
        }
        if unlikely(self.outstanding() >= self.wqe_cnt) {
            return Err(Errno::ENOMEM);
        }
        let idx = (self.cur_post & self.mask()) as usize;
        self.wrid[idx] = wr_id;
        self.wqe_head[idx] = self.head;
        self.wr_data[idx] = opcode;
        self.bufs[idx] = buf.unwrap_or_default();
        let counter = self.cur_post as u16;
        trace!(
            "post send wr_id {} idx {} head {} nwqebb {}",
            wr_id,
            idx,
            self.head,
            nwqebb
        );
        self.cur_post = self.cur_post.wrapping_add(nwqebb);
        self.head = self.head.wrapping_add(1);
        Ok(counter)
    }

    /// Record a receive WR in the next slot
    pub fn post_recv(&mut self, wr_id: u64, buf: Option<BytesMut>) -> Result<(), Error> {
        if unlikely(self.outstanding() >= self.wqe_cnt) {
            return Err(Errno::ENOMEM);
        }
        let idx = (self.head & self.mask()) as usize;
        self.wrid[idx] = wr_id;
        self.bufs[idx] = buf.unwrap_or_default();
        self.head = self.head.wrapping_add(1);
        Ok(())
    }

    /// Retire the oldest receive WR
    #[inline]
    pub fn advance_tail(&mut self) {
        self.tail = self.tail.wrapping_add(1);
    }

    #[inline]
    pub fn set_tail(&mut self, tail: u32) {
        self.tail = tail;
    }

    #[inline]
    pub fn wr_id_at(&self, idx: u32) -> u64 {
        self.wrid[(idx & self.mask()) as usize]
    }

    #[inline]
    pub fn recorded_opcode_at(&self, idx: u32) -> WcOpcode {
        self.wr_data[(idx & self.mask()) as usize]
    }

    #[inline]
    pub fn wqe_head_at(&self, idx: u32) -> u32 {
        self.wqe_head[(idx & self.mask()) as usize]
    }

    /// Scatter buffer of the WQE at `idx`
    pub fn buf_at(&self, idx: u32) -> &[u8] {
        &self.bufs[(idx & self.mask()) as usize]
    }

    /// Deliver inline payload into the WQE buffer
    pub fn copy_to_wqe(&mut self, idx: u32, scatter: &Mlx5InlineScatter, len: usize) -> WcStatus {
        let mask = self.mask();
        let buf = &mut self.bufs[(idx & mask) as usize];
        if unlikely(len > buf.len()) {
            return WcStatus::LocLenErr;
        }
        scatter.copy_into(buf, len);
        WcStatus::Success
    }
}

#[derive(Debug, Clone, Derivative)]
#[derivative(Default)]
pub struct Mlx5QpInitAttr {
    /// Requested qpn, allocated by the context when unset
    pub qp_num: Option<u32>,
    #[derivative(Default(value = "64"))]
    pub sq_wqe_cnt: u32,
    #[derivative(Default(value = "64"))]
    pub rq_wqe_cnt: u32,
    /// Receives land in this SRQ instead of the QP's own RQ
    pub srq: Option<Arc<Mlx5Srq>>,
    /// Device validates L3/L4 checksums of received packets
    pub rx_csum: bool,
}

#[derive(Debug)]
pub struct Mlx5Qp {
    qpn: u32,
    uidx: u32,
    /// qpn or user index depending on the cqe format
    rsn: u32,
    pub sq: Mutex<Mlx5Wq>,
    pub rq: Mutex<Mlx5Wq>,
    srq: Option<Arc<Mlx5Srq>>,
    rx_csum_valid: bool,
}

impl Mlx5Qp {
    pub(crate) fn new(
        qpn: u32,
        uidx: u32,
        rsn: u32,
        attr: &Mlx5QpInitAttr,
    ) -> Result<Self, Error> {
        Ok(Self {
            qpn,
            uidx,
            rsn,
            sq: Mutex::new(Mlx5Wq::new(attr.sq_wqe_cnt)?),
            rq: Mutex::new(Mlx5Wq::new(attr.rq_wqe_cnt)?),
            srq: attr.srq.clone(),
            rx_csum_valid: attr.rx_csum,
        })
    }

    pub fn qp_num(&self) -> u32 {
        self.qpn
    }

    pub fn uidx(&self) -> u32 {
        self.uidx
    }

    pub fn rsn(&self) -> u32 {
        self.rsn
    }

    pub fn srq(&self) -> Option<&Arc<Mlx5Srq>> {
        self.srq.as_ref()
    }

    pub fn rx_csum_valid(&self) -> bool {
        self.rx_csum_valid
    }
}

/// Receive work queue, used for RSS style receive only objects
#[derive(Debug)]
pub struct Mlx5Rwq {
    wqn: u32,
    rsn: u32,
    pub rq: Mutex<Mlx5Wq>,
}

impl Mlx5Rwq {
    pub(crate) fn new(wqn: u32, rsn: u32, wqe_cnt: u32) -> Result<Self, Error> {
        Ok(Self {
            wqn,
            rsn,
            rq: Mutex::new(Mlx5Wq::new(wqe_cnt)?),
        })
    }

    pub fn wq_num(&self) -> u32 {
        self.wqn
    }

    pub fn rsn(&self) -> u32 {
        self.rsn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_send_indexing_by_wqebb() {
        let mut sq = Mlx5Wq::new(8).unwrap();
        assert_eq!(sq.post_send(10, WcOpcode::Send, 1, None).unwrap(), 0);
        // a two block WQE moves cur_post by two
        assert_eq!(sq.post_send(11, WcOpcode::Driver2, 2, None).unwrap(), 1);
        assert_eq!(sq.post_send(12, WcOpcode::Send, 1, None).unwrap(), 3);
        assert_eq!(sq.wr_id_at(1), 11);
        assert_eq!(sq.recorded_opcode_at(1), WcOpcode::Driver2);
        assert_eq!(sq.wqe_head_at(3), 2);
        assert_eq!(sq.outstanding(), 3);
        // completing the WQE at block 3 retires all three WRs
        sq.set_tail(sq.wqe_head_at(3) + 1);
        assert_eq!(sq.outstanding(), 0);
    }

    #[test]
    fn check_recv_ring_full() {
        let mut rq = Mlx5Wq::new(2).unwrap();
        rq.post_recv(1, None).unwrap();
        rq.post_recv(2, None).unwrap();
        assert_eq!(rq.post_recv(3, None).unwrap_err(), Errno::ENOMEM);
        assert_eq!(rq.wr_id_at(rq.tail()), 1);
        rq.advance_tail();
        assert_eq!(rq.wr_id_at(rq.tail()), 2);
        rq.post_recv(3, None).unwrap();
        assert_eq!(rq.wr_id_at(2), 3);
    }

    #[test]
    fn check_wq_geometry() {
        assert_eq!(Mlx5Wq::new(3).unwrap_err(), Errno::EINVAL);
        let mut sq = Mlx5Wq::new(4).unwrap();
        assert_eq!(
            sq.post_send(1, WcOpcode::Send, 0, None).unwrap_err(),
            Errno::EINVAL
        );
    }
}
