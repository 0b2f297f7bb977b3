use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use derivative::Derivative;
use likely_stable::unlikely;
use nix::errno::Errno;
use nix::Error;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::mlx5_cqe::Mlx5InlineScatter;
use crate::mlx5_qp::Mlx5Qp;
use crate::mlx5_verbs::{WcOpcode, WcStatus};

/// Tag posted to the device matching list
#[derive(Debug, Clone, Default)]
pub struct Mlx5TagEntry {
    /// completions still owed for this tag, the tag is busy while non zero
    pub(crate) expect_cqe: u32,
    pub(crate) wr_id: u64,
    pub(crate) buf: BytesMut,
    pub(crate) size: usize,
    pub(crate) phase_cnt: u32,
}

impl Mlx5TagEntry {
    pub fn expect_cqe(&self) -> u32 {
        self.expect_cqe
    }

    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn phase_cnt(&self) -> u32 {
        self.phase_cnt
    }
}

/// Pending matching list operation, completed by a NO_PACKET cqe
#[derive(Debug, Clone, Copy, Default)]
pub struct Mlx5SrqOp {
    pub(crate) tag: Option<u32>,
    pub(crate) wr_id: u64,
    /// WR ordinal of the command on the command QP send queue
    pub(crate) wqe_head: u32,
}

#[derive(Debug, Derivative)]
#[derivative(Default)]
pub struct Mlx5SrqState {
    wrid: Vec<u64>,
    bufs: Vec<BytesMut>,
    /// free list threaded through the WQE slots
    next_wqe: Vec<u32>,
    head: u32,
    tail: u32,
    wqe_cnt: u32,
    outstanding: u32,

    tm_list: Vec<Mlx5TagEntry>,
    free_tags: VecDeque<u32>,
    op: Vec<Mlx5SrqOp>,
    op_head: u32,
    op_tail: u32,
    pub(crate) unexp_in: u64,
    pub(crate) unexp_out: u64,
}

impl Mlx5SrqState {
    fn new(wqe_cnt: u32, max_num_tags: u32, max_ops: u32) -> Self {
        let mask = wqe_cnt - 1;
        Self {
            wrid: vec![0; wqe_cnt as usize],
            bufs: vec![BytesMut::new(); wqe_cnt as usize],
            next_wqe: (0..wqe_cnt).map(|i| (i + 1) & mask).collect(),
            head: 0,
            tail: wqe_cnt - 1,
            wqe_cnt,
            tm_list: vec![Mlx5TagEntry::default(); max_num_tags as usize],
            free_tags: (0..max_num_tags).collect(),
            op: vec![Mlx5SrqOp::default(); max_ops as usize],
            ..Default::default()
        }
    }

    fn post_recv(&mut self, wr_id: u64, buf: Option<BytesMut>) -> Result<u32, Error> {
        if unlikely(self.head == self.tail) {
            return Err(Errno::ENOMEM);
        }
        let ind = self.head;
        self.head = self.next_wqe[ind as usize];
        self.wrid[ind as usize] = wr_id;
        self.bufs[ind as usize] = buf.unwrap_or_default();
        self.outstanding += 1;
        Ok(ind)
    }

    fn push_free(&mut self, ind: u32) {
        let ind = ind & (self.wqe_cnt - 1);
        let tail = self.tail as usize;
        self.next_wqe[tail] = ind;
        self.tail = ind;
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Return WQE `ind` to the free list after its completion
    #[inline]
    pub fn free_slot(&mut self, ind: u32) {
        self.push_free(ind);
    }

    /// Requeue a WQE whose receive hit a page fault. The WR id stays in
    /// place, a later post may overwrite it.
    pub fn complete_odp_fault(&mut self, ind: u32) {
        debug!("srq requeue page faulted wqe {}", ind);
        self.push_free(ind);
    }

    #[inline]
    pub fn wr_id_at(&self, ind: u32) -> u64 {
        self.wrid[(ind & (self.wqe_cnt - 1)) as usize]
    }

    pub fn buf_at(&self, ind: u32) -> &[u8] {
        &self.bufs[(ind & (self.wqe_cnt - 1)) as usize]
    }

    pub fn copy_to_wqe(&mut self, ind: u32, scatter: &Mlx5InlineScatter, len: usize) -> WcStatus {
        let buf = &mut self.bufs[(ind & (self.wqe_cnt - 1)) as usize];
        if unlikely(len > buf.len()) {
            return WcStatus::LocLenErr;
        }
        scatter.copy_into(buf, len);
        WcStatus::Success
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn tag_at(&self, idx: u32) -> Option<&Mlx5TagEntry> {
        self.tm_list.get(idx as usize)
    }

    pub(crate) fn tag_at_mut(&mut self, idx: u32) -> Option<&mut Mlx5TagEntry> {
        self.tm_list.get_mut(idx as usize)
    }

    /// Drop one expected completion of tag `idx`, freeing it at zero
    pub(crate) fn release_tag(&mut self, idx: u32) {
        let Some(tag) = self.tm_list.get_mut(idx as usize) else {
            return;
        };
        if tag.expect_cqe == 0 {
            return;
        }
        tag.expect_cqe -= 1;
        if tag.expect_cqe == 0 {
            trace!("tag {} back to free list", idx);
            self.free_tags.push_back(idx);
        }
    }

    pub fn free_tags(&self) -> usize {
        self.free_tags.len()
    }

    pub fn op_head(&self) -> u32 {
        self.op_head
    }

    pub fn op_tail(&self) -> u32 {
        self.op_tail
    }

    /// Oldest pending matching list operation
    pub(crate) fn pop_op(&mut self) -> Option<Mlx5SrqOp> {
        if self.op_head == self.op_tail || self.op.is_empty() {
            return None;
        }
        let mask = self.op.len() as u32 - 1;
        let op = self.op[(self.op_head & mask) as usize];
        self.op_head = self.op_head.wrapping_add(1);
        Some(op)
    }

    fn push_op(&mut self, op: Mlx5SrqOp) -> Result<(), Error> {
        let len = self.op.len() as u32;
        if unlikely(len == 0 || self.op_tail.wrapping_sub(self.op_head) >= len) {
            return Err(Errno::ENOMEM);
        }
        let idx = (self.op_tail & (len - 1)) as usize;
        self.op[idx] = op;
        self.op_tail = self.op_tail.wrapping_add(1);
        if let Some(tag) = op.tag.and_then(|t| self.tm_list.get_mut(t as usize)) {
            tag.expect_cqe += 1;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Derivative)]
#[derivative(Default)]
pub struct Mlx5SrqInitAttr {
    #[derivative(Default(value = "64"))]
    pub wqe_cnt: u32,
    /// Tag matching list size, zero for a plain SRQ
    pub max_num_tags: u32,
    /// Command QP send queue depth, bounds pending list operations
    #[derivative(Default(value = "16"))]
    pub max_ops: u32,
}

/// Shared receive queue, optionally with a tag matching list.
#[derive(Debug)]
pub struct Mlx5Srq {
    srqn: u32,
    rsn: u32,
    state: Mutex<Mlx5SrqState>,
    cmd_qp: Option<Arc<Mlx5Qp>>,
}

impl Mlx5Srq {
    pub(crate) fn new(
        srqn: u32,
        rsn: u32,
        attr: &Mlx5SrqInitAttr,
        cmd_qp: Option<Arc<Mlx5Qp>>,
    ) -> Result<Self, Error> {
        if !attr.wqe_cnt.is_power_of_two() || attr.wqe_cnt < 2 {
            return Err(Errno::EINVAL);
        }
        let max_ops = match &cmd_qp {
            Some(_) if !attr.max_ops.is_power_of_two() => return Err(Errno::EINVAL),
            Some(_) => attr.max_ops,
            None => 0,
        };
        Ok(Self {
            srqn,
            rsn,
            state: Mutex::new(Mlx5SrqState::new(
                attr.wqe_cnt,
                attr.max_num_tags,
                max_ops,
            )),
            cmd_qp,
        })
    }

    pub fn srq_num(&self) -> u32 {
        self.srqn
    }

    pub fn rsn(&self) -> u32 {
        self.rsn
    }

    pub fn cmd_qp(&self) -> Option<&Arc<Mlx5Qp>> {
        self.cmd_qp.as_ref()
    }

    pub fn lock(&self) -> MutexGuard<'_, Mlx5SrqState> {
        self.state.lock()
    }

    /// Post a receive WR, returning the WQE index the device will report
    pub fn post_recv(&self, wr_id: u64, buf: Option<BytesMut>) -> Result<u32, Error> {
        self.state.lock().post_recv(wr_id, buf)
    }

    pub fn free_slot(&self, ind: u32) {
        self.state.lock().free_slot(ind)
    }

    pub fn complete_odp_fault(&self, ind: u32) {
        self.state.lock().complete_odp_fault(ind)
    }

    pub fn wr_id_at(&self, ind: u32) -> u64 {
        self.state.lock().wr_id_at(ind)
    }

    pub fn tag_at(&self, idx: u32) -> Option<Mlx5TagEntry> {
        self.state.lock().tag_at(idx).cloned()
    }

    pub fn op_head(&self) -> u32 {
        self.state.lock().op_head()
    }

    pub fn op_tail(&self) -> u32 {
        self.state.lock().op_tail()
    }

    fn post_cmd(
        &self,
        state: &mut Mlx5SrqState,
        opcode: WcOpcode,
        tag: Option<u32>,
        cmd_wr_id: Option<u64>,
    ) -> Result<(), Error> {
        let cmd_qp = self.cmd_qp.as_ref().ok_or(Errno::EOPNOTSUPP)?;
        let mut sq = cmd_qp.sq.lock();
        let wqe_head = sq.head();
        sq.post_send(cmd_wr_id.unwrap_or_default(), opcode, 1, None)?;
        if let Some(wr_id) = cmd_wr_id {
            state.push_op(Mlx5SrqOp {
                tag,
                wr_id,
                wqe_head,
            })?;
        }
        Ok(())
    }

    /// Append a tag to the matching list. `cmd_wr_id` requests a completion
    /// for the command itself. Returns the tag handle.
    pub fn tm_add_tag(
        &self,
        recv_wr_id: u64,
        buf: BytesMut,
        unexpected_cnt: u32,
        cmd_wr_id: Option<u64>,
    ) -> Result<u32, Error> {
        let mut state = self.state.lock();
        let idx = *state.free_tags.front().ok_or(Errno::ENOMEM)?;
        {
            let tag = state.tag_at_mut(idx).ok_or(Errno::EINVAL)?;
            tag.expect_cqe = 1;
            tag.wr_id = recv_wr_id;
            tag.size = buf.len();
            tag.buf = buf;
            tag.phase_cnt = unexpected_cnt;
        }
        if let Err(e) = self.post_cmd(&mut state, WcOpcode::TmAdd, Some(idx), cmd_wr_id) {
            if let Some(tag) = state.tag_at_mut(idx) {
                tag.expect_cqe = 0;
            }
            return Err(e);
        }
        state.free_tags.pop_front();
        debug!("srq {} add tag {} wr_id {}", self.srqn, idx, recv_wr_id);
        Ok(idx)
    }

    /// Remove a tag from the matching list. The command always completes.
    pub fn tm_del_tag(&self, handle: u32, cmd_wr_id: u64) -> Result<(), Error> {
        let mut state = self.state.lock();
        match state.tag_at(handle) {
            Some(tag) if tag.expect_cqe > 0 => {}
            _ => return Err(Errno::EINVAL),
        }
        self.post_cmd(&mut state, WcOpcode::TmDel, Some(handle), Some(cmd_wr_id))?;
        debug!("srq {} del tag {}", self.srqn, handle);
        Ok(())
    }

    /// Resynchronize the unexpected message count with the device
    pub fn tm_sync(&self, unexpected_cnt: u32, cmd_wr_id: u64) -> Result<(), Error> {
        let mut state = self.state.lock();
        self.post_cmd(&mut state, WcOpcode::TmSync, None, Some(cmd_wr_id))?;
        state.unexp_out = unexpected_cnt as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlx5_qp::Mlx5QpInitAttr;

    fn tm_srq(max_num_tags: u32) -> Mlx5Srq {
        let cmd_qp = Arc::new(Mlx5Qp::new(1, 1, 1, &Mlx5QpInitAttr::default()).unwrap());
        let attr = Mlx5SrqInitAttr {
            wqe_cnt: 8,
            max_num_tags,
            max_ops: 8,
        };
        Mlx5Srq::new(2, 2, &attr, Some(cmd_qp)).unwrap()
    }

    #[test]
    fn check_srq_free_list() {
        let srq = Mlx5Srq::new(1, 1, &Mlx5SrqInitAttr::default(), None).unwrap();
        let mut posted = Vec::new();
        // one slot is kept as the list terminator
        for wr_id in 0..63 {
            posted.push(srq.post_recv(wr_id, None).unwrap());
        }
        assert_eq!(srq.post_recv(99, None).unwrap_err(), Errno::ENOMEM);
        assert_eq!(posted[..4], [0, 1, 2, 3]);
        srq.free_slot(posted[5]);
        // the old terminator is handed out, the freed slot becomes the new one
        assert_eq!(srq.post_recv(100, None).unwrap(), 63);
        assert_eq!(srq.post_recv(101, None).unwrap_err(), Errno::ENOMEM);
        srq.free_slot(posted[6]);
        assert_eq!(srq.post_recv(101, None).unwrap(), 5);
        assert_eq!(srq.wr_id_at(5), 101);
    }

    #[test]
    fn check_odp_fault_requeue_keeps_wr_id() {
        let srq = Mlx5Srq::new(1, 1, &Mlx5SrqInitAttr::default(), None).unwrap();
        let ind = srq.post_recv(7, None).unwrap();
        srq.complete_odp_fault(ind);
        assert_eq!(srq.wr_id_at(ind), 7);
        assert_eq!(srq.lock().outstanding(), 0);
    }

    #[test]
    fn check_tm_add_del_accounting() {
        let srq = tm_srq(4);
        let idx = srq
            .tm_add_tag(5, BytesMut::zeroed(64), 0, None)
            .unwrap();
        assert_eq!(idx, 0);
        assert_eq!(srq.tag_at(idx).unwrap().expect_cqe(), 1);
        // unsignaled add queues no operation
        assert_eq!(srq.op_tail(), 0);

        srq.tm_del_tag(idx, 77).unwrap();
        assert_eq!(srq.tag_at(idx).unwrap().expect_cqe(), 2);
        assert_eq!(srq.op_tail(), 1);

        let mut state = srq.lock();
        let op = state.pop_op().unwrap();
        assert_eq!(op.tag, Some(idx));
        assert_eq!(op.wr_id, 77);
        // second command on the command QP
        assert_eq!(op.wqe_head, 1);
        assert!(state.pop_op().is_none());
        assert_eq!(state.free_tags(), 3);
        state.release_tag(idx);
        state.release_tag(idx);
        assert_eq!(state.free_tags(), 4);
        // an idle tag is not listed twice
        state.release_tag(idx);
        assert_eq!(state.tag_at(idx).unwrap().expect_cqe(), 0);
        assert_eq!(state.free_tags(), 4);
    }

    #[test]
    fn check_tm_tag_exhaustion() {
        let srq = tm_srq(1);
        srq.tm_add_tag(1, BytesMut::new(), 0, Some(1)).unwrap();
        assert_eq!(
            srq.tm_add_tag(2, BytesMut::new(), 0, None).unwrap_err(),
            Errno::ENOMEM
        );
        assert_eq!(srq.tm_del_tag(3, 1).unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn check_plain_srq_has_no_tm() {
        let srq = Mlx5Srq::new(1, 1, &Mlx5SrqInitAttr::default(), None).unwrap();
        assert_eq!(srq.tm_sync(0, 1).unwrap_err(), Errno::EOPNOTSUPP);
    }
}
