use libmlx5_sys::{mlx5_cqe_app_op::*, mlx5_cqe_app_op_tm_is_complete, MLX5_TMC_SUCCESS, MLX5_TM_MAX_SYNC_DIFF};
use likely_stable::unlikely;
use nix::errno::Errno;
use nix::Error;
use tracing::{debug, trace};

use crate::mlx5_cqe::Mlx5Cqe;
use crate::mlx5_srq::{Mlx5Srq, Mlx5SrqState};
use crate::mlx5_verbs::WcStatus;

/// What a tag matching cqe resolved to
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Mlx5TmCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    /// software must resynchronize its unexpected message count
    pub sync_req: bool,
}

/// Consume a tag matching cqe against `srq`.
///
/// Lock order is srq then the command QP send queue; the caller already holds
/// the CQ lock. A cqe naming a tag or list operation software never posted is
/// a protocol error.
pub fn mlx5_handle_tag_matching(cqe: &Mlx5Cqe, srq: &Mlx5Srq) -> Result<Mlx5TmCompletion, Error> {
    let mut comp = Mlx5TmCompletion::default();
    let app_op = cqe.app_op();
    let mut state = srq.lock();
    match app_op {
        MLX5_CQE_APP_OP_TM_CONSUMED_MSG_SW_RDNV
        | MLX5_CQE_APP_OP_TM_CONSUMED_SW_RDNV
        | MLX5_CQE_APP_OP_TM_MSG_COMPLETION_CANCELED
        | MLX5_CQE_APP_OP_TM_CONSUMED_MSG
        | MLX5_CQE_APP_OP_TM_CONSUMED
        | MLX5_CQE_APP_OP_TM_EXPECTED => {
            if matches!(
                app_op,
                MLX5_CQE_APP_OP_TM_CONSUMED_MSG_SW_RDNV
                    | MLX5_CQE_APP_OP_TM_CONSUMED_SW_RDNV
                    | MLX5_CQE_APP_OP_TM_MSG_COMPLETION_CANCELED
            ) {
                comp.status = WcStatus::TmRndvIncomplete;
            }
            handle_tag_consumed(cqe, &mut state, app_op, &mut comp)?;
        }
        MLX5_CQE_APP_OP_TM_REMOVE | MLX5_CQE_APP_OP_TM_APPEND | MLX5_CQE_APP_OP_TM_NOOP => {
            if app_op == MLX5_CQE_APP_OP_TM_REMOVE && cqe.tm_success() & MLX5_TMC_SUCCESS == 0 {
                comp.status = WcStatus::TmErr;
            }
            handle_list_op(cqe, srq, &mut state, app_op, &mut comp)?;
        }
        MLX5_CQE_APP_OP_TM_UNEXPECTED | MLX5_CQE_APP_OP_TM_NO_TAG => {
            if app_op == MLX5_CQE_APP_OP_TM_UNEXPECTED {
                state.unexp_in += 1;
                if state.unexp_in.wrapping_sub(state.unexp_out) > MLX5_TM_MAX_SYNC_DIFF {
                    comp.sync_req = true;
                }
            }
            let wqe_ctr = cqe.wqe_counter() as u32;
            comp.wr_id = state.wr_id_at(wqe_ctr);
            state.free_slot(wqe_ctr);
            if let Some(scatter) = cqe.inline_scatter() {
                comp.status = state.copy_to_wqe(wqe_ctr, &scatter, cqe.byte_cnt() as usize);
            }
        }
        _ => {
            debug!("srq {} unexpected tm opcode {:#x} in cqe", srq.srq_num(), app_op);
        }
    }
    Ok(comp)
}

fn handle_tag_consumed(
    cqe: &Mlx5Cqe,
    state: &mut Mlx5SrqState,
    app_op: u8,
    comp: &mut Mlx5TmCompletion,
) -> Result<(), Error> {
    let idx = cqe.app_info() as u32;
    let expected = state.tag_at(idx).map_or(0, |tag| tag.expect_cqe());
    if unlikely(expected == 0) {
        debug!("got tag idx {} which wasn't added", idx);
        comp.status = WcStatus::GeneralErr;
        return Err(Errno::EINVAL);
    }
    let Some(tag) = state.tag_at_mut(idx) else {
        return Err(Errno::EINVAL);
    };
    comp.wr_id = tag.wr_id;
    // inline scatter 32 is never used for tag matching
    if let Some(scatter) = cqe.inline_scatter_64() {
        let len = cqe.byte_cnt() as usize;
        if len > tag.size {
            comp.status = WcStatus::LocLenErr;
        } else {
            scatter.copy_into(&mut tag.buf, len);
        }
    }
    if mlx5_cqe_app_op_tm_is_complete(app_op) {
        state.release_tag(idx);
    }
    trace!("tag {} consumed app_op {:#x}", idx, app_op);
    Ok(())
}

fn handle_list_op(
    cqe: &Mlx5Cqe,
    srq: &Mlx5Srq,
    state: &mut Mlx5SrqState,
    app_op: u8,
    comp: &mut Mlx5TmCompletion,
) -> Result<(), Error> {
    let Some(op) = state.pop_op() else {
        debug!("srq {} got unexpected list op cqe", srq.srq_num());
        comp.status = WcStatus::GeneralErr;
        return Err(Errno::EINVAL);
    };
    if let Some(idx) = op.tag {
        state.release_tag(idx);
        // a removed tag will never see its consumption cqe
        if app_op == MLX5_CQE_APP_OP_TM_REMOVE && comp.status == WcStatus::Success {
            state.release_tag(idx);
        }
        let phase_cnt = state.tag_at(idx).map_or(0, |tag| tag.phase_cnt());
        if cqe.tm_hw_phase_cnt() as u32 != phase_cnt {
            comp.sync_req = true;
        }
    }
    let cmd_qp = srq.cmd_qp().ok_or(Errno::EINVAL)?;
    cmd_qp.sq.lock().set_tail(op.wqe_head.wrapping_add(1));
    comp.wr_id = op.wr_id;
    Ok(())
}
