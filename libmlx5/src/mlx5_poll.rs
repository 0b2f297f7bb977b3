use libmlx5_sys::{mlx5dv_clock_info, mlx5dv_ts_to_ns};
use nix::errno::Errno;
use nix::Error;
use thiserror::Error as ThisError;
use tracing::trace;

use crate::mlx5_comp::{read_wc_byte_len, read_wc_flags, read_wc_opcode};
use crate::mlx5_context::Mlx5CqeVersion;
use crate::mlx5_cq::{CqFlag, CqFlags, Mlx5Cq, Mlx5CqState, Mlx5SpinGuard};
use crate::mlx5_cqe::Mlx5Cqe;
use crate::mlx5_rsc::Mlx5Resolver;
use crate::mlx5_stall::Mlx5StallMode;
use crate::mlx5_verbs::{Mlx5TmInfo, Mlx5Wc, WcExFlag, WcFlags, WcOpcode, WcStatus};

/// `poll_cq` hit a cqe it could not decode. The first `npolled` entries of
/// the output hold valid completions.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
#[error("poll cq failed after {npolled} completions: {errno}")]
pub struct Mlx5PollError {
    pub npolled: usize,
    pub errno: Errno,
}

impl From<Mlx5PollError> for Error {
    fn from(e: Mlx5PollError) -> Self {
        e.errno
    }
}

impl Mlx5CqState {
    #[inline]
    fn poll_next<R, const LAZY: bool>(
        &mut self,
        version: Mlx5CqeVersion,
        rsl: &R,
        wc: &mut Mlx5Wc,
    ) -> Result<bool, Error>
    where
        R: Mlx5Resolver + ?Sized,
    {
        match version {
            Mlx5CqeVersion::V0 => self.poll_one::<R, false, LAZY>(rsl, wc),
            Mlx5CqeVersion::V1 => self.poll_one::<R, true, LAZY>(rsl, wc),
        }
    }
}

impl Mlx5Cq {
    /// Fill `wc` with up to `wc.len()` completions and return how many were
    /// produced. The consumer index reaches the device once per call.
    pub fn poll_cq<R>(&self, rsl: &R, wc: &mut [Mlx5Wc]) -> Result<usize, Mlx5PollError>
    where
        R: Mlx5Resolver + ?Sized,
    {
        self.stall.pre_poll();
        let mut st = self
            .lock()
            .map_err(|errno| Mlx5PollError { npolled: 0, errno })?;
        st.cache.clear();

        let mut npolled = 0;
        let mut hit_empty = false;
        let mut err = None;
        for slot in wc.iter_mut() {
            match st.poll_next::<R, false>(self.ops().version, rsl, slot) {
                Ok(true) => npolled += 1,
                Ok(false) => {
                    hit_empty = true;
                    break;
                }
                Err(errno) => {
                    err = Some(errno);
                    break;
                }
            }
        }
        st.flush_ci();
        drop(st);

        let drained = match self.stall.mode() {
            Mlx5StallMode::Adaptive => npolled < wc.len(),
            _ => hit_empty,
        };
        self.stall.on_batch(npolled > 0, drained);

        match err {
            Some(errno) => Err(Mlx5PollError { npolled, errno }),
            None => Ok(npolled),
        }
    }

    /// Open a lazy poll batch positioned on the first completion, `None`
    /// when the ring is empty. The CQ stays locked until the batch ends.
    pub fn start_poll<'a, R>(&'a self, rsl: &'a R) -> Result<Option<Mlx5PollBatch<'a, R>>, Error>
    where
        R: Mlx5Resolver + ?Sized,
    {
        self.stall.pre_poll();
        let mut guard = self.lock()?;
        guard.cache.clear();

        let mut wc = Mlx5Wc::default();
        let found = match guard.poll_next::<R, true>(self.ops().version, rsl, &mut wc) {
            Ok(found) => found,
            Err(e) => {
                guard.flags.remove(CqFlag::FoundCqes);
                drop(guard);
                self.stall.on_error();
                return Err(e);
            }
        };
        if !found {
            guard.flush_ci();
            drop(guard);
            self.stall.on_batch(false, true);
            return Ok(None);
        }
        guard.flags |= CqFlag::FoundCqes;

        let mut clock = None;
        if self.ops().clock_update {
            match rsl.clock_info() {
                Ok(info) => {
                    guard.last_clock_info = Some(info);
                    clock = Some(info);
                }
                Err(e) => {
                    guard.flags.remove(CqFlag::FoundCqes);
                    guard.flush_ci();
                    drop(guard);
                    self.stall.on_error();
                    return Err(e);
                }
            }
        }
        let Some(cqe) = guard.cur_cqe else {
            return Err(Errno::EINVAL);
        };
        trace!("cqn {:#x} start poll wr_id {}", self.cqn(), wc.wr_id);
        let flags = guard.flags;
        let cached_opcode = guard.cached_opcode;
        Ok(Some(Mlx5PollBatch {
            cq: self,
            rsl,
            guard: Some(guard),
            wc,
            cqe,
            flags,
            cached_opcode,
            clock,
        }))
    }
}

/// Completions read one at a time, fields decoded on demand.
///
/// Readers for fields not requested in the CQ's `wc_flags` return `None`.
/// Dropping the batch publishes the consumer index and releases the CQ.
pub struct Mlx5PollBatch<'a, R: Mlx5Resolver + ?Sized> {
    cq: &'a Mlx5Cq,
    rsl: &'a R,
    guard: Option<Mlx5SpinGuard<'a>>,
    wc: Mlx5Wc,
    cqe: Mlx5Cqe,
    flags: CqFlags,
    cached_opcode: WcOpcode,
    clock: Option<mlx5dv_clock_info>,
}

impl<'a, R: Mlx5Resolver + ?Sized> Mlx5PollBatch<'a, R> {
    /// Advance to the next completion, `Ok(false)` when none is left.
    pub fn next_poll(&mut self) -> Result<bool, Error> {
        let Some(guard) = self.guard.as_mut() else {
            return Err(Errno::EINVAL);
        };
        if !guard.poll_next::<R, true>(self.cq.ops().version, self.rsl, &mut self.wc)? {
            guard.flags |= CqFlag::EmptyDuringPoll;
            return Ok(false);
        }
        if let Some(cqe) = guard.cur_cqe {
            self.cqe = cqe;
        }
        self.flags = guard.flags;
        self.cached_opcode = guard.cached_opcode;
        Ok(true)
    }

    /// End the batch
    pub fn end_poll(self) {}

    fn finish(&mut self) {
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        guard.flush_ci();
        let flags = guard.flags;
        guard
            .flags
            .remove(CqFlag::FoundCqes | CqFlag::EmptyDuringPoll);
        drop(guard);

        let found = flags.contains(CqFlag::FoundCqes);
        let drained = match self.cq.stall.mode() {
            Mlx5StallMode::Adaptive => flags.contains(CqFlag::EmptyDuringPoll),
            _ => !found,
        };
        self.cq.stall.on_batch(found, drained);
    }

    pub fn wr_id(&self) -> u64 {
        self.wc.wr_id
    }

    pub fn status(&self) -> WcStatus {
        self.wc.status
    }

    pub fn read_opcode(&self) -> WcOpcode {
        read_wc_opcode(&self.cqe, self.flags, self.cached_opcode)
    }

    pub fn read_vendor_err(&self) -> u32 {
        self.cqe.vendor_err_synd() as u32
    }

    pub fn read_wc_flags(&self) -> WcFlags {
        read_wc_flags(&self.cqe, self.flags)
    }

    #[inline]
    fn wants(&self, flag: WcExFlag) -> bool {
        self.cq.wc_flags().contains(flag)
    }

    pub fn read_byte_len(&self) -> Option<u32> {
        self.wants(WcExFlag::ByteLen)
            .then(|| read_wc_byte_len(&self.cqe))
    }

    /// Immediate data, or the invalidated rkey, in host order
    pub fn read_imm_data(&self) -> Option<u32> {
        self.wants(WcExFlag::Imm).then(|| self.cqe.imm_inval_pkey())
    }

    pub fn read_qp_num(&self) -> Option<u32> {
        self.wants(WcExFlag::QpNum).then(|| self.cqe.qpn())
    }

    pub fn read_src_qp(&self) -> Option<u32> {
        self.wants(WcExFlag::SrcQp).then(|| self.cqe.src_qp())
    }

    pub fn read_slid(&self) -> Option<u16> {
        self.wants(WcExFlag::Slid).then(|| self.cqe.slid())
    }

    pub fn read_sl(&self) -> Option<u8> {
        self.wants(WcExFlag::Sl).then(|| self.cqe.sl())
    }

    pub fn read_dlid_path_bits(&self) -> Option<u8> {
        self.wants(WcExFlag::DlidPathBits)
            .then(|| self.cqe.dlid_path_bits())
    }

    /// Raw device timestamp
    pub fn read_completion_ts(&self) -> Option<u64> {
        self.wants(WcExFlag::CompletionTimestamp)
            .then(|| self.cqe.timestamp())
    }

    /// Timestamp in wall clock nanoseconds
    pub fn read_completion_wallclock_ns(&self) -> Option<u64> {
        if !self.wants(WcExFlag::CompletionTimestampWallclock) {
            return None;
        }
        let ts = self.cqe.timestamp();
        if self.cq.ops().clock_update {
            self.clock.as_ref().map(|clock| mlx5dv_ts_to_ns(clock, ts))
        } else {
            Some(ts)
        }
    }

    pub fn read_cvlan(&self) -> Option<u16> {
        self.wants(WcExFlag::Cvlan).then(|| self.cqe.vlan_info())
    }

    pub fn read_flow_tag(&self) -> Option<u32> {
        self.wants(WcExFlag::FlowTag).then(|| self.cqe.flow_tag())
    }

    pub fn read_tm_info(&self) -> Option<Mlx5TmInfo> {
        self.wants(WcExFlag::TmInfo).then(|| Mlx5TmInfo {
            tag: self.cqe.tmh_tag(),
            priv_: self.cqe.tmh_app_ctx(),
        })
    }
}

impl<R: Mlx5Resolver + ?Sized> Drop for Mlx5PollBatch<'_, R> {
    fn drop(&mut self) {
        self.finish();
    }
}
