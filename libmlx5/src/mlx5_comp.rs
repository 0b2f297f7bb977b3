use std::sync::Arc;

use enumflags2::make_bitflags;
use libmlx5_sys::{
    mlx5_cqe_app_op::*, mlx5_cqe_opcode::*, mlx5_opcode::*, MLX5_CQE_APP_TAG_MATCHING,
    MLX5_CQE_L3_HDR_TYPE_IPV4, MLX5_CQE_L3_OK, MLX5_CQE_L4_OK,
};
use likely_stable::unlikely;
use nix::errno::Errno;
use nix::Error;
use tracing::{debug, trace, warn};

use crate::mlx5_cq::{CqFlag, CqFlags, Mlx5CqState};
use crate::mlx5_cqe::{Mlx5Cqe, Mlx5InlineScatter};
use crate::mlx5_err::{is_odp_pfault_err, mlx5_handle_error_cqe, mlx5_handle_sig_err, report_error_cqe};
use crate::mlx5_qp::{Mlx5Qp, Mlx5Rwq, Mlx5Wq};
use crate::mlx5_rsc::{Mlx5Resolver, Mlx5Rsc};
use crate::mlx5_srq::Mlx5Srq;
use crate::mlx5_tm::mlx5_handle_tag_matching;
use crate::mlx5_verbs::{Mlx5Wc, WcFlag, WcFlags, WcOpcode, WcStatus};

/// Flags that describe only the current cqe
const LAZY_FLAGS: CqFlags = make_bitflags!(CqFlag::{RxCsumValid | TmSyncReq | RawWqe});

enum Mlx5Parse {
    /// a completion was produced
    Done,
    /// the cqe was absorbed, decode the next one
    Again,
}

/// Where a receive completion is retired
enum Mlx5RecvTarget {
    Srq(Arc<Mlx5Srq>),
    Rq(Arc<Mlx5Qp>),
    Rwq(Arc<Mlx5Rwq>),
}

/// `IpCsumOk` when the device validated both L3 and L4 of an IPv4 packet
#[inline]
pub fn get_csum_ok(cqe: &Mlx5Cqe) -> WcFlags {
    let ok = MLX5_CQE_L4_OK | MLX5_CQE_L3_OK;
    if cqe.hds_ip_ext() & ok == ok && cqe.l3_hdr_type() == MLX5_CQE_L3_HDR_TYPE_IPV4 {
        WcFlag::IpCsumOk.into()
    } else {
        WcFlags::empty()
    }
}

/// Work completion opcode of a requester cqe. `cached` is the opcode recorded
/// at post time, used for WQEs the cqe cannot describe.
#[inline]
fn req_opcode(sop: u8, cached: WcOpcode) -> WcOpcode {
    match sop {
        MLX5_OPCODE_RDMA_WRITE_IMM | MLX5_OPCODE_RDMA_WRITE => WcOpcode::RdmaWrite,
        MLX5_OPCODE_SEND_IMM | MLX5_OPCODE_SEND | MLX5_OPCODE_SEND_INVAL => WcOpcode::Send,
        MLX5_OPCODE_RDMA_READ => WcOpcode::RdmaRead,
        MLX5_OPCODE_ATOMIC_CS => WcOpcode::CompSwap,
        MLX5_OPCODE_ATOMIC_FA => WcOpcode::FetchAdd,
        MLX5_OPCODE_TSO => WcOpcode::Tso,
        MLX5_OPCODE_UMR | MLX5_OPCODE_SET_PSV | MLX5_OPCODE_NOP | MLX5_OPCODE_MMO => cached,
        _ => {
            trace!("unknown send opcode {:#x} in cqe", sop);
            WcOpcode::default()
        }
    }
}

/// Bytes of inline payload a requester completion carries
#[inline]
fn req_scatter_len(sop: u8, cqe: &Mlx5Cqe) -> Option<u32> {
    match sop {
        MLX5_OPCODE_RDMA_READ => Some(cqe.byte_cnt()),
        MLX5_OPCODE_ATOMIC_CS | MLX5_OPCODE_ATOMIC_FA => Some(8),
        _ => None,
    }
}

/// Byte count a work completion reports for `cqe`. Requester completions
/// only carry a length for reads and atomics.
pub fn read_wc_byte_len(cqe: &Mlx5Cqe) -> u32 {
    match cqe.opcode() {
        MLX5_CQE_REQ => req_scatter_len(cqe.sop_opcode(), cqe).unwrap_or(0),
        _ => cqe.byte_cnt(),
    }
}

/// Opcode of `cqe` as a work completion would report it.
pub fn read_wc_opcode(cqe: &Mlx5Cqe, flags: CqFlags, cached: WcOpcode) -> WcOpcode {
    match cqe.opcode() {
        MLX5_CQE_RESP_WR_IMM => WcOpcode::RecvRdmaWithImm,
        MLX5_CQE_RESP_SEND | MLX5_CQE_RESP_SEND_IMM | MLX5_CQE_RESP_SEND_INV => {
            if unlikely(cqe.app() == MLX5_CQE_APP_TAG_MATCHING) {
                match cqe.app_op() {
                    MLX5_CQE_APP_OP_TM_CONSUMED_MSG_SW_RDNV
                    | MLX5_CQE_APP_OP_TM_CONSUMED_MSG
                    | MLX5_CQE_APP_OP_TM_CONSUMED_SW_RDNV
                    | MLX5_CQE_APP_OP_TM_EXPECTED
                    | MLX5_CQE_APP_OP_TM_UNEXPECTED => return WcOpcode::TmRecv,
                    MLX5_CQE_APP_OP_TM_NO_TAG => return WcOpcode::TmNoTag,
                    _ => {}
                }
            }
            WcOpcode::Recv
        }
        MLX5_CQE_NO_PACKET => match cqe.app_op() {
            MLX5_CQE_APP_OP_TM_REMOVE => WcOpcode::TmDel,
            MLX5_CQE_APP_OP_TM_APPEND => WcOpcode::TmAdd,
            MLX5_CQE_APP_OP_TM_NOOP => WcOpcode::TmSync,
            MLX5_CQE_APP_OP_TM_CONSUMED => WcOpcode::TmRecv,
            op => {
                trace!("unexpected tm opcode {:#x} in no packet cqe", op);
                WcOpcode::default()
            }
        },
        MLX5_CQE_REQ => {
            if unlikely(flags.contains(CqFlag::RawWqe)) {
                WcOpcode::Driver2
            } else {
                req_opcode(cqe.sop_opcode(), cached)
            }
        }
        _ => WcOpcode::default(),
    }
}

/// Work completion flags of `cqe`
pub fn read_wc_flags(cqe: &Mlx5Cqe, flags: CqFlags) -> WcFlags {
    let mut wc_flags = WcFlags::empty();
    if flags.contains(CqFlag::RxCsumValid) {
        wc_flags |= get_csum_ok(cqe);
    }
    match cqe.opcode() {
        MLX5_CQE_RESP_WR_IMM | MLX5_CQE_RESP_SEND_IMM => wc_flags |= WcFlag::WithImm,
        MLX5_CQE_RESP_SEND_INV => wc_flags |= WcFlag::WithInv,
        _ => {}
    }
    if flags.contains(CqFlag::TmSyncReq) {
        wc_flags |= WcFlag::TmSyncReq;
    }
    if unlikely(cqe.app() == MLX5_CQE_APP_TAG_MATCHING) {
        match cqe.app_op() {
            MLX5_CQE_APP_OP_TM_CONSUMED_MSG_SW_RDNV
            | MLX5_CQE_APP_OP_TM_CONSUMED_MSG
            | MLX5_CQE_APP_OP_TM_MSG_COMPLETION_CANCELED => {
                wc_flags |= WcFlag::TmMatch | WcFlag::TmDataValid;
            }
            MLX5_CQE_APP_OP_TM_CONSUMED_SW_RDNV | MLX5_CQE_APP_OP_TM_CONSUMED => {
                wc_flags |= WcFlag::TmMatch;
            }
            MLX5_CQE_APP_OP_TM_EXPECTED => wc_flags |= WcFlag::TmDataValid,
            _ => {}
        }
    }
    if cqe.grh() {
        wc_flags |= WcFlag::Grh;
    }
    wc_flags
}

/// Retire the oldest WR of a receive queue
fn recv_from_wq(
    rq: &mut Mlx5Wq,
    scatter: Option<Mlx5InlineScatter>,
    byte_len: u32,
    wc: &mut Mlx5Wc,
) -> WcStatus {
    let idx = rq.tail();
    wc.wr_id = rq.wr_id_at(idx);
    rq.advance_tail();
    scatter.map_or(WcStatus::Success, |s| {
        rq.copy_to_wqe(idx, &s, byte_len as usize)
    })
}

impl Mlx5CqState {
    /// Decode the next completion into `wc`. `Ok(false)` when the ring holds
    /// no more completions.
    ///
    /// `V1` selects the user index cqe format. `LAZY` leaves everything but
    /// the WR id and status in the cqe for the batch readers.
    pub(crate) fn poll_one<R, const V1: bool, const LAZY: bool>(
        &mut self,
        rsl: &R,
        wc: &mut Mlx5Wc,
    ) -> Result<bool, Error>
    where
        R: Mlx5Resolver + ?Sized,
    {
        loop {
            let Some(cqe) = self.next_cqe() else {
                return Ok(false);
            };
            match self.parse_cqe::<R, V1, LAZY>(cqe, rsl, wc)? {
                Mlx5Parse::Done => return Ok(true),
                Mlx5Parse::Again => {}
            }
        }
    }

    fn parse_cqe<R, const V1: bool, const LAZY: bool>(
        &mut self,
        cqe: Mlx5Cqe,
        rsl: &R,
        wc: &mut Mlx5Wc,
    ) -> Result<Mlx5Parse, Error>
    where
        R: Mlx5Resolver + ?Sized,
    {
        if LAZY {
            self.cur_cqe = Some(cqe);
            self.flags.remove(LAZY_FLAGS);
        } else {
            *wc = Mlx5Wc {
                qp_num: cqe.qpn(),
                ..Default::default()
            };
        }

        match cqe.opcode() {
            MLX5_CQE_REQ => self.handle_req::<R, V1, LAZY>(&cqe, rsl, wc)?,
            MLX5_CQE_RESP_WR_IMM
            | MLX5_CQE_RESP_SEND
            | MLX5_CQE_RESP_SEND_IMM
            | MLX5_CQE_RESP_SEND_INV => self.handle_responder::<R, V1, LAZY>(&cqe, rsl, wc)?,
            MLX5_CQE_NO_PACKET => {
                if unlikely(cqe.app() != MLX5_CQE_APP_TAG_MATCHING) {
                    warn!("cqn {:#x} no packet cqe outside tag matching", self.cqn);
                    return Err(Errno::EINVAL);
                }
                let Mlx5RecvTarget::Srq(srq) = self.resolve_recv::<R, V1>(&cqe, rsl)? else {
                    return Err(Errno::EINVAL);
                };
                self.handle_tm::<LAZY>(&cqe, &srq, wc)?;
            }
            MLX5_CQE_SIG_ERR => {
                mlx5_handle_sig_err(&cqe, rsl.mkey_table())?;
                return Ok(Mlx5Parse::Again);
            }
            MLX5_CQE_RESIZE_CQ => {
                debug!("cqn {:#x} stray resize cqe", self.cqn);
                return Ok(Mlx5Parse::Again);
            }
            MLX5_CQE_REQ_ERR | MLX5_CQE_RESP_ERR => {
                return self.handle_error_cqe::<R, V1, LAZY>(&cqe, rsl, wc);
            }
            opcode => {
                warn!("cqn {:#x} unknown cqe opcode {:#x}", self.cqn, opcode);
                return Err(Errno::EINVAL);
            }
        }
        Ok(Mlx5Parse::Done)
    }

    /// QP whose send queue produced a requester cqe
    fn resolve_req<R, const V1: bool>(&mut self, cqe: &Mlx5Cqe, rsl: &R) -> Result<Arc<Mlx5Qp>, Error>
    where
        R: Mlx5Resolver + ?Sized,
    {
        let qp = if V1 {
            match self.cache.get_rsc(rsl, cqe.srqn_uidx()) {
                Some(Mlx5Rsc::Qp(qp)) => Some(qp),
                _ => None,
            }
        } else {
            self.cache.get_qp(rsl, cqe.qpn())
        };
        qp.ok_or_else(|| {
            debug!(
                "cqn {:#x} no qp for qpn {:#x} uidx {:#x}",
                self.cqn,
                cqe.qpn(),
                cqe.srqn_uidx()
            );
            Errno::EINVAL
        })
    }

    /// Queue a responder cqe retires a WR from
    fn resolve_recv<R, const V1: bool>(
        &mut self,
        cqe: &Mlx5Cqe,
        rsl: &R,
    ) -> Result<Mlx5RecvTarget, Error>
    where
        R: Mlx5Resolver + ?Sized,
    {
        let target = if V1 {
            match self.cache.get_rsc(rsl, cqe.srqn_uidx()) {
                Some(Mlx5Rsc::Qp(qp)) => match qp.srq().cloned() {
                    Some(srq) => {
                        self.cache.set_srq(srq.clone());
                        Some(Mlx5RecvTarget::Srq(srq))
                    }
                    None => Some(Mlx5RecvTarget::Rq(qp)),
                },
                Some(Mlx5Rsc::Xsrq(srq)) => {
                    self.cache.set_srq(srq.clone());
                    Some(Mlx5RecvTarget::Srq(srq))
                }
                Some(Mlx5Rsc::Rwq(rwq)) => Some(Mlx5RecvTarget::Rwq(rwq)),
                None => None,
            }
        } else {
            let srqn = cqe.srqn_uidx();
            if srqn != 0 {
                self.cache.get_srq(rsl, srqn).map(Mlx5RecvTarget::Srq)
            } else {
                self.cache.get_qp(rsl, cqe.qpn()).map(Mlx5RecvTarget::Rq)
            }
        };
        target.ok_or_else(|| {
            debug!(
                "cqn {:#x} no receive queue for qpn {:#x} srqn/uidx {:#x}",
                self.cqn,
                cqe.qpn(),
                cqe.srqn_uidx()
            );
            Errno::EINVAL
        })
    }

    fn handle_req<R, const V1: bool, const LAZY: bool>(
        &mut self,
        cqe: &Mlx5Cqe,
        rsl: &R,
        wc: &mut Mlx5Wc,
    ) -> Result<(), Error>
    where
        R: Mlx5Resolver + ?Sized,
    {
        let qp = self.resolve_req::<R, V1>(cqe, rsl)?;
        let mut sq = qp.sq.lock();
        let wqe_ctr = cqe.wqe_counter() as u32;
        let idx = wqe_ctr & (sq.wqe_cnt() - 1);
        let recorded = sq.recorded_opcode_at(idx);
        let sop = cqe.sop_opcode();
        let scatter_len = req_scatter_len(sop, cqe);

        let mut status = WcStatus::Success;
        if let (Some(len), Some(scatter)) = (scatter_len, cqe.inline_scatter()) {
            status = sq.copy_to_wqe(wqe_ctr, &scatter, len as usize);
        }

        let raw_wqe = unlikely(recorded == WcOpcode::Driver2);
        if LAZY {
            if matches!(
                sop,
                MLX5_OPCODE_UMR | MLX5_OPCODE_SET_PSV | MLX5_OPCODE_NOP | MLX5_OPCODE_MMO
            ) {
                self.cached_opcode = recorded;
            }
            if raw_wqe {
                self.flags |= CqFlag::RawWqe;
            }
        } else {
            wc.opcode = if raw_wqe {
                WcOpcode::Driver2
            } else {
                req_opcode(sop, recorded)
            };
            if matches!(sop, MLX5_OPCODE_RDMA_WRITE_IMM | MLX5_OPCODE_SEND_IMM) {
                wc.wc_flags |= WcFlag::WithImm;
            }
            wc.byte_len = scatter_len.unwrap_or(0);
        }

        wc.wr_id = sq.wr_id_at(idx);
        wc.status = status;
        let tail = sq.wqe_head_at(idx).wrapping_add(1);
        sq.set_tail(tail);
        Ok(())
    }

    fn handle_responder<R, const V1: bool, const LAZY: bool>(
        &mut self,
        cqe: &Mlx5Cqe,
        rsl: &R,
        wc: &mut Mlx5Wc,
    ) -> Result<(), Error>
    where
        R: Mlx5Resolver + ?Sized,
    {
        let target = self.resolve_recv::<R, V1>(cqe, rsl)?;
        if unlikely(cqe.app() == MLX5_CQE_APP_TAG_MATCHING) {
            let Mlx5RecvTarget::Srq(srq) = target else {
                warn!("cqn {:#x} tag matching cqe on a queue without srq", self.cqn);
                return Err(Errno::EINVAL);
            };
            return self.handle_tm::<LAZY>(cqe, &srq, wc);
        }

        let byte_len = cqe.byte_cnt();
        let scatter = cqe.inline_scatter();
        let mut csum = false;
        let status = match &target {
            Mlx5RecvTarget::Srq(srq) => {
                let wqe_ctr = cqe.wqe_counter() as u32;
                let mut state = srq.lock();
                wc.wr_id = state.wr_id_at(wqe_ctr);
                state.free_slot(wqe_ctr);
                scatter.map_or(WcStatus::Success, |s| {
                    state.copy_to_wqe(wqe_ctr, &s, byte_len as usize)
                })
            }
            Mlx5RecvTarget::Rq(qp) => {
                csum = qp.rx_csum_valid();
                recv_from_wq(&mut qp.rq.lock(), scatter, byte_len, wc)
            }
            Mlx5RecvTarget::Rwq(rwq) => recv_from_wq(&mut rwq.rq.lock(), scatter, byte_len, wc),
        };
        wc.status = status;

        if LAZY {
            if csum {
                self.flags |= CqFlag::RxCsumValid;
            }
            return Ok(());
        }

        wc.byte_len = byte_len;
        if unlikely(status != WcStatus::Success) {
            return Ok(());
        }
        let flags = if csum {
            CqFlag::RxCsumValid.into()
        } else {
            CqFlags::empty()
        };
        wc.opcode = read_wc_opcode(cqe, flags, WcOpcode::default());
        wc.wc_flags |= read_wc_flags(cqe, flags);
        if wc.wc_flags.intersects(WcFlag::WithImm | WcFlag::WithInv) {
            wc.imm_data = cqe.imm_inval_pkey();
        }
        wc.slid = cqe.slid();
        wc.sl = cqe.sl();
        wc.src_qp = cqe.src_qp();
        wc.dlid_path_bits = cqe.dlid_path_bits();
        wc.pkey_index = (cqe.imm_inval_pkey() & 0xffff) as u16;
        Ok(())
    }

    fn handle_tm<const LAZY: bool>(
        &mut self,
        cqe: &Mlx5Cqe,
        srq: &Mlx5Srq,
        wc: &mut Mlx5Wc,
    ) -> Result<(), Error> {
        let comp = mlx5_handle_tag_matching(cqe, srq)?;
        wc.wr_id = comp.wr_id;
        wc.status = comp.status;
        let flags = if comp.sync_req {
            CqFlag::TmSyncReq.into()
        } else {
            CqFlags::empty()
        };
        if LAZY {
            self.flags |= flags;
        } else {
            wc.opcode = read_wc_opcode(cqe, flags, WcOpcode::default());
            wc.wc_flags |= read_wc_flags(cqe, flags);
            wc.byte_len = cqe.byte_cnt();
        }
        Ok(())
    }

    fn handle_error_cqe<R, const V1: bool, const LAZY: bool>(
        &mut self,
        cqe: &Mlx5Cqe,
        rsl: &R,
        wc: &mut Mlx5Wc,
    ) -> Result<Mlx5Parse, Error>
    where
        R: Mlx5Resolver + ?Sized,
    {
        wc.status = mlx5_handle_error_cqe(cqe.syndrome());
        if !LAZY {
            wc.vendor_err = cqe.vendor_err_synd() as u32;
        }
        report_error_cqe(self.cqn, cqe, self.fault_observer.as_deref());

        if cqe.opcode() == MLX5_CQE_REQ_ERR {
            let qp = self.resolve_req::<R, V1>(cqe, rsl)?;
            let mut sq = qp.sq.lock();
            let idx = cqe.wqe_counter() as u32 & (sq.wqe_cnt() - 1);
            wc.wr_id = sq.wr_id_at(idx);
            let tail = sq.wqe_head_at(idx).wrapping_add(1);
            sq.set_tail(tail);
            return Ok(Mlx5Parse::Done);
        }

        match self.resolve_recv::<R, V1>(cqe, rsl)? {
            Mlx5RecvTarget::Srq(srq) => {
                let wqe_ctr = cqe.wqe_counter() as u32;
                if unlikely(is_odp_pfault_err(cqe)) {
                    srq.complete_odp_fault(wqe_ctr);
                    return Ok(Mlx5Parse::Again);
                }
                let mut state = srq.lock();
                wc.wr_id = state.wr_id_at(wqe_ctr);
                state.free_slot(wqe_ctr);
            }
            Mlx5RecvTarget::Rq(qp) => {
                let mut rq = qp.rq.lock();
                wc.wr_id = rq.wr_id_at(rq.tail());
                rq.advance_tail();
            }
            Mlx5RecvTarget::Rwq(rwq) => {
                let mut rq = rwq.rq.lock();
                wc.wr_id = rq.wr_id_at(rq.tail());
                rq.advance_tail();
            }
        }
        if !LAZY {
            trace!("cqn {:#x} error completion wr_id {} {}", self.cqn, wc.wr_id, wc.status);
        }
        Ok(Mlx5Parse::Done)
    }
}
