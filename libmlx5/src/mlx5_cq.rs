use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use derivative::Derivative;
use enumflags2::{bitflags, BitFlags};
use libmlx5_sys::{
    mlx5_cqe_opcode::*, mlx5dv_clock_info, MLX5_CQ_DB_REQ_NOT, MLX5_CQ_DB_REQ_NOT_SOL,
    MLX5_CQ_DOORBELL,
};
use likely_stable::{likely, unlikely};
use nix::errno::Errno;
use nix::Error;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use tracing::{debug, error, trace};

use crate::mlx5_buf::{alloc_cq_buf, Mlx5Buf, Mlx5DbRec};
use crate::mlx5_context::{Mlx5Config, Mlx5Context, Mlx5CqeVersion, Mlx5Uar};
use crate::mlx5_cqe::Mlx5Cqe;
use crate::mlx5_err::{Mlx5FaultObserver, Mlx5FreezeOnError};
use crate::mlx5_rsc::{Mlx5Resolver, Mlx5RscCache};
use crate::mlx5_srq::Mlx5Srq;
use crate::mlx5_stall::{Mlx5Stall, Mlx5StallMode};
use crate::mlx5_verbs::{WcExFlag, WcExFlags, WcOpcode};

/// Largest ring the device accepts
pub const MLX5_MAX_CQ_NENT: u32 = 1 << 22;

/// Per CQ state bits
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqFlag {
    FoundCqes = 1 << 0,
    EmptyDuringPoll = 1 << 1,
    /// QP of the current cqe validates rx checksums
    RxCsumValid = 1 << 2,
    TmSyncReq = 1 << 3,
    /// current cqe completes a raw WQE
    RawWqe = 1 << 4,
}

pub type CqFlags = BitFlags<CqFlag>;

#[derive(Derivative, Clone)]
#[derivative(Debug, Default)]
pub struct Mlx5CqInitAttr {
    /// Minimum number of entries, rounded up to a power of two above it
    #[derivative(Default(value = "64"))]
    pub cqe: u32,
    /// 64 or 128 byte slots
    #[derivative(Default(value = "64"))]
    pub cqe_sz: u32,
    pub wc_flags: WcExFlags,
    /// Caller guarantees a single polling thread, no lock is taken
    pub single_threaded: bool,
    #[derivative(Debug = "ignore")]
    pub fault_observer: Option<Arc<dyn Mlx5FaultObserver>>,
}

/// Poll path variant, chosen once at creation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Mlx5PollOps {
    pub version: Mlx5CqeVersion,
    pub single_threaded: bool,
    pub stall: Mlx5StallMode,
    /// translate timestamps through the clock info page
    pub clock_update: bool,
}

impl Mlx5PollOps {
    pub fn select<R: Mlx5Resolver + ?Sized>(
        attr: &Mlx5CqInitAttr,
        config: &Mlx5Config,
        rsl: &R,
    ) -> Result<Self, Error> {
        let mut clock_update = false;
        if attr
            .wc_flags
            .contains(WcExFlag::CompletionTimestampWallclock)
        {
            let raw_is_wallclock =
                rsl.real_time_ts() && !attr.wc_flags.contains(WcExFlag::CompletionTimestamp);
            if !raw_is_wallclock {
                if rsl.clock_info().is_err() {
                    return Err(Errno::EOPNOTSUPP);
                }
                clock_update = true;
            }
        }
        Ok(Self {
            version: config.cqe_version,
            single_threaded: attr.single_threaded,
            stall: config.stall_mode(),
            clock_update,
        })
    }
}

/// CQ lock. A real mutex, or only a reentrance check when the CQ was
/// created single threaded.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Mlx5Spinlock {
    #[derivative(Debug = "ignore")]
    raw: RawMutex,
    in_use: AtomicBool,
    need_lock: bool,
}

impl Mlx5Spinlock {
    pub fn new(need_lock: bool) -> Self {
        Self {
            raw: RawMutex::INIT,
            in_use: AtomicBool::new(false),
            need_lock,
        }
    }

    pub fn lock(&self) -> Result<(), Error> {
        if likely(self.need_lock) {
            self.raw.lock();
            return Ok(());
        }
        if unlikely(self.in_use.swap(true, Ordering::Acquire)) {
            error!(
                "*** ERROR: multithreading violation ***\n\
                 You are running a multithreaded application but\n\
                 you created the CQ single threaded."
            );
            return Err(Errno::EBUSY);
        }
        Ok(())
    }

    /// # Safety
    /// The lock must be held by the caller.
    pub unsafe fn unlock(&self) {
        if likely(self.need_lock) {
            self.raw.unlock();
        } else {
            self.in_use.store(false, Ordering::Release);
        }
    }
}

/// Ring state, only reachable through [`Mlx5SpinGuard`]
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Mlx5CqState {
    pub(crate) cqn: u32,
    pub(crate) buf: Arc<Mlx5Buf>,
    pub(crate) cons_index: u32,
    pub(crate) flags: CqFlags,
    pub(crate) cache: Mlx5RscCache,
    pub(crate) cur_cqe: Option<Mlx5Cqe>,
    pub(crate) cached_opcode: WcOpcode,
    pub(crate) last_clock_info: Option<mlx5dv_clock_info>,
    #[derivative(Debug = "ignore")]
    pub(crate) fault_observer: Option<Arc<dyn Mlx5FaultObserver>>,
}

#[inline]
fn sw_ownership_bit(n: u32, nent: u32) -> u8 {
    u8::from(n & nent != 0)
}

#[inline]
fn is_hw(cqe: &Mlx5Cqe, n: u32, nent: u32) -> bool {
    cqe.owner() != sw_ownership_bit(n, nent)
}

#[inline]
fn is_responder(opcode: u8) -> bool {
    matches!(
        opcode,
        MLX5_CQE_RESP_WR_IMM
            | MLX5_CQE_RESP_SEND
            | MLX5_CQE_RESP_SEND_IMM
            | MLX5_CQE_RESP_SEND_INV
            | MLX5_CQE_RESP_ERR
    )
}

/// Does the cqe belong to resource `rsn`; if so release its SRQ WQE
fn free_res_cqe(cqe: &Mlx5Cqe, rsn: u32, srq: Option<&Mlx5Srq>, version: Mlx5CqeVersion) -> bool {
    match version {
        Mlx5CqeVersion::V1 => {
            if cqe.srqn_uidx() != rsn {
                return false;
            }
            if let Some(srq) = srq {
                if is_responder(cqe.opcode()) {
                    srq.free_slot(cqe.wqe_counter() as u32);
                }
            }
        }
        Mlx5CqeVersion::V0 => {
            if cqe.qpn() != rsn {
                return false;
            }
            if let Some(srq) = srq {
                if cqe.srqn_uidx() != 0 {
                    srq.free_slot(cqe.wqe_counter() as u32);
                }
            }
        }
    }
    true
}

impl Mlx5CqState {
    pub fn cons_index(&self) -> u32 {
        self.cons_index
    }

    pub fn buf(&self) -> &Arc<Mlx5Buf> {
        &self.buf
    }

    pub fn flags(&self) -> CqFlags {
        self.flags
    }

    /// Slot `n` if software owns it
    #[inline]
    fn sw_cqe(&self, n: u32) -> Option<Mlx5Cqe> {
        let cqe = self.buf.get_cqe(n);
        if cqe.opcode() == MLX5_CQE_INVALID || is_hw(&cqe, n, self.buf.nent()) {
            return None;
        }
        Some(cqe)
    }

    /// Take the slot at the consumer index if software owns it. The only
    /// place the consumer index moves forward while polling.
    #[inline]
    pub(crate) fn next_cqe(&mut self) -> Option<Mlx5Cqe> {
        let cqe = self.sw_cqe(self.cons_index)?;
        self.cons_index = self.cons_index.wrapping_add(1);
        // the body must not be read before the owner bit
        udma_from_device_barrier!();
        trace!("cqn {:#x} cqe:\n{}", self.cqn, cqe.dump());
        Some(cqe)
    }

    /// Drop every cqe of resource `rsn`, compacting the rest towards the
    /// producer. Returns the number of slots freed.
    fn clean_rsc(&mut self, rsn: u32, srq: Option<&Mlx5Srq>, version: Mlx5CqeVersion) -> u32 {
        let ci = self.cons_index;
        let mask = self.buf.nent() - 1;
        let mut prod = ci;
        while self.sw_cqe(prod).is_some() {
            if prod == ci.wrapping_add(mask) {
                break;
            }
            prod = prod.wrapping_add(1);
        }

        let mut nfreed = 0u32;
        while prod != ci {
            prod = prod.wrapping_sub(1);
            let cqe = self.buf.get_cqe(prod);
            if free_res_cqe(&cqe, rsn, srq, version) {
                nfreed += 1;
            } else if nfreed > 0 {
                let dest = self.buf.get_cqe(prod.wrapping_add(nfreed));
                let owner = dest.owner();
                // SAFETY: distinct slots of the same ring, both software owned
                unsafe { dest.copy_from(&cqe) };
                dest.set_owner(owner);
            }
        }
        self.cons_index = self.cons_index.wrapping_add(nfreed);
        nfreed
    }

    /// Move the cqes queued before the resize marker into `dst`
    fn resize_copy_cqes(&mut self, dst: &Mlx5Buf) -> Result<(), Error> {
        let src = self.buf.clone();
        let start = self.cons_index;
        let mut i = start;
        let mut scqe = src.get_cqe(i);
        if is_hw(&scqe, i, src.nent()) {
            error!("cqn {:#x} expected cqe in sw ownership", self.cqn);
            return Err(Errno::EIO);
        }
        while scqe.opcode() != MLX5_CQE_RESIZE_CQ {
            let n = i.wrapping_add(1);
            let dcqe = dst.get_cqe(n);
            // SAFETY: the slots live in different rings
            unsafe { dcqe.copy_from(&scqe) };
            dcqe.set_owner(sw_ownership_bit(n, dst.nent()));

            i = n;
            scqe = src.get_cqe(i);
            if is_hw(&scqe, i, src.nent()) {
                error!("cqn {:#x} expected cqe in sw ownership", self.cqn);
                return Err(Errno::EIO);
            }
            if i.wrapping_sub(start) & (src.nent() - 1) == 0 {
                error!("cqn {:#x} resize CQ failed to get resize CQE", self.cqn);
                return Err(Errno::EIO);
            }
        }
        self.cons_index = self.cons_index.wrapping_add(1);
        Ok(())
    }
}

/// Completion queue
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Mlx5Cq {
    cqn: u32,
    lock: Mlx5Spinlock,
    #[derivative(Debug = "ignore")]
    state: UnsafeCell<Mlx5CqState>,
    dbrec: Mlx5DbRec,
    uar: Arc<dyn Mlx5Uar>,
    arm_sn: AtomicU32,
    pub(crate) stall: Mlx5Stall,
    ops: Mlx5PollOps,
    wc_flags: WcExFlags,
}

unsafe impl Send for Mlx5Cq {}

unsafe impl Sync for Mlx5Cq {}

impl Mlx5Cq {
    /// Create a CQ of at least `attr.cqe` entries.
    ///
    /// `EINVAL` for a zero or oversized ring or a bad slot size,
    /// `EOPNOTSUPP` when wall clock timestamps were requested but the device
    /// cannot translate them.
    pub fn create(ctx: &Mlx5Context, attr: &Mlx5CqInitAttr) -> Result<Self, Error> {
        if attr.cqe == 0 || attr.cqe >= MLX5_MAX_CQ_NENT {
            return Err(Errno::EINVAL);
        }
        let nent = (attr.cqe + 1).next_power_of_two();
        let ops = Mlx5PollOps::select(attr, ctx.config(), ctx)?;
        let buf = alloc_cq_buf(nent, attr.cqe_sz)?;
        let cqn = ctx.alloc_cqn();
        let fault_observer = attr.fault_observer.clone().or_else(|| {
            ctx.config()
                .freeze_on_error
                .then(|| Arc::new(Mlx5FreezeOnError) as Arc<dyn Mlx5FaultObserver>)
        });
        debug!(
            "create cq {:#x} nent {} cqe_sz {} ops {:?}",
            cqn, nent, attr.cqe_sz, ops
        );
        Ok(Self {
            cqn,
            lock: Mlx5Spinlock::new(!attr.single_threaded),
            state: UnsafeCell::new(Mlx5CqState {
                cqn,
                buf: Arc::new(buf),
                cons_index: 0,
                flags: CqFlags::empty(),
                cache: Mlx5RscCache::default(),
                cur_cqe: None,
                cached_opcode: WcOpcode::default(),
                last_clock_info: None,
                fault_observer,
            }),
            dbrec: Mlx5DbRec::new(),
            uar: ctx.uar().clone(),
            arm_sn: AtomicU32::new(0),
            stall: Mlx5Stall::new(ops.stall, ctx.config().tuning.clone()),
            ops,
            wc_flags: attr.wc_flags,
        })
    }

    pub fn cqn(&self) -> u32 {
        self.cqn
    }

    pub fn ops(&self) -> &Mlx5PollOps {
        &self.ops
    }

    pub fn wc_flags(&self) -> WcExFlags {
        self.wc_flags
    }

    pub fn stall(&self) -> &Mlx5Stall {
        &self.stall
    }

    pub fn dbrec(&self) -> &Mlx5DbRec {
        &self.dbrec
    }

    pub fn arm_sn(&self) -> u32 {
        self.arm_sn.load(Ordering::Relaxed)
    }

    pub fn lock(&self) -> Result<Mlx5SpinGuard<'_>, Error> {
        self.lock.lock()?;
        Ok(Mlx5SpinGuard { cq: self })
    }

    /// The ring as the device sees it. Writes through it bypass the CQ lock,
    /// as device writes do.
    pub fn hw_ring(&self) -> Result<Arc<Mlx5Buf>, Error> {
        Ok(self.lock()?.buf.clone())
    }

    /// Request an event for the next completion, or the next solicited one.
    pub fn arm_cq(&self, solicited: bool) -> Result<(), Error> {
        let sn = self.arm_sn.load(Ordering::Relaxed) & 3;
        let ci = self.lock()?.cons_index & 0xffffff;
        let cmd = if solicited {
            MLX5_CQ_DB_REQ_NOT_SOL
        } else {
            MLX5_CQ_DB_REQ_NOT
        };
        let val = sn << 28 | cmd | ci;
        self.dbrec.update_arm(val);

        // the doorbell record must be visible before the MMIO doorbell
        mmio_wc_start!();
        let doorbell = (val as u64) << 32 | self.cqn as u64;
        self.uar.write64_be(MLX5_CQ_DOORBELL, doorbell);
        mmio_flush_writes!();
        trace!("arm cq {:#x} sn {} ci {} solicited {}", self.cqn, sn, ci, solicited);
        Ok(())
    }

    /// Account a delivered completion event
    pub fn cq_event(&self) {
        self.arm_sn.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove all cqes of resource `rsn` (qpn or user index, matching the
    /// cqe format). WQEs they hold in `srq` are released.
    pub fn clean(&self, rsn: u32, srq: Option<&Mlx5Srq>) -> Result<(), Error> {
        let mut st = self.lock()?;
        let nfreed = st.clean_rsc(rsn, srq, self.ops.version);
        if nfreed > 0 {
            // compaction stores must land before the new consumer index
            udma_to_device_barrier!();
            st.flush_ci();
            debug!("clean cq {:#x} rsn {:#x} freed {}", self.cqn, rsn, nfreed);
        }
        Ok(())
    }

    /// Grow or shrink the ring to at least `cqe` entries. `modify` issues the
    /// device command that makes hardware switch rings and post a resize
    /// marker in the old one. On failure the old ring stays active.
    pub fn resize<F>(&self, cqe: u32, modify: F) -> Result<(), Error>
    where
        F: FnOnce(&Mlx5Buf) -> Result<(), Error>,
    {
        if cqe == 0 || cqe >= MLX5_MAX_CQ_NENT {
            return Err(Errno::EINVAL);
        }
        let nent = (cqe + 1).next_power_of_two();
        let mut st = self.lock()?;
        if nent == st.buf.nent() {
            return Ok(());
        }
        let new_buf = alloc_cq_buf(nent, st.buf.cqe_sz())?;
        modify(&new_buf)?;
        st.resize_copy_cqes(&new_buf)?;
        st.buf = Arc::new(new_buf);
        st.cur_cqe = None;
        st.flush_ci();
        debug!("resize cq {:#x} to {} entries", self.cqn, nent);
        Ok(())
    }
}

/// Held CQ lock
#[derive(Debug)]
pub struct Mlx5SpinGuard<'a> {
    cq: &'a Mlx5Cq,
}

impl<'a> Mlx5SpinGuard<'a> {
    pub fn cq(&self) -> &'a Mlx5Cq {
        self.cq
    }

    /// Publish the consumer index to the doorbell record
    #[inline]
    pub fn flush_ci(&self) {
        self.cq.dbrec.update_ci(self.cons_index);
    }
}

impl Deref for Mlx5SpinGuard<'_> {
    type Target = Mlx5CqState;

    fn deref(&self) -> &Mlx5CqState {
        // SAFETY: the guard holds the CQ lock
        unsafe { &*self.cq.state.get() }
    }
}

impl DerefMut for Mlx5SpinGuard<'_> {
    fn deref_mut(&mut self) -> &mut Mlx5CqState {
        // SAFETY: the guard holds the CQ lock
        unsafe { &mut *self.cq.state.get() }
    }
}

impl Drop for Mlx5SpinGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: created by a successful lock
        unsafe { self.cq.lock.unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlx5_cqe::Mlx5CqeImage;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct RecordUar {
        writes: Mutex<Vec<(usize, u64)>>,
    }

    impl Mlx5Uar for RecordUar {
        fn write64_be(&self, offset: usize, val: u64) {
            self.writes.lock().push((offset, val));
        }
    }

    fn context(version: Mlx5CqeVersion) -> (Mlx5Context, Arc<RecordUar>) {
        let uar = Arc::new(RecordUar::default());
        let config = Mlx5Config {
            cqe_version: version,
            ..Default::default()
        };
        (Mlx5Context::new(config, uar.clone()), uar)
    }

    fn cq_of(ctx: &Mlx5Context, cqe: u32, cqe_sz: u32) -> Mlx5Cq {
        ctx.create_cq(&Mlx5CqInitAttr {
            cqe,
            cqe_sz,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn check_create_geometry() {
        let (ctx, _) = context(Mlx5CqeVersion::V1);
        let cq = cq_of(&ctx, 7, 64);
        assert_eq!(cq.hw_ring().unwrap().nent(), 8);
        let cq = cq_of(&ctx, 8, 128);
        assert_eq!(cq.hw_ring().unwrap().nent(), 16);
        for (cqe, cqe_sz) in [(0, 64), (MLX5_MAX_CQ_NENT, 64), (4, 32)] {
            let attr = Mlx5CqInitAttr {
                cqe,
                cqe_sz,
                ..Default::default()
            };
            assert_eq!(ctx.create_cq(&attr).unwrap_err(), Errno::EINVAL);
        }
    }

    #[test]
    fn check_wallclock_needs_clock_source() {
        let (ctx, _) = context(Mlx5CqeVersion::V1);
        let attr = Mlx5CqInitAttr {
            wc_flags: WcExFlag::CompletionTimestampWallclock.into(),
            ..Default::default()
        };
        assert_eq!(ctx.create_cq(&attr).unwrap_err(), Errno::EOPNOTSUPP);
        ctx.set_clock_info(mlx5dv_clock_info::default());
        assert!(ctx.create_cq(&attr).unwrap().ops().clock_update);

        let rt = Mlx5Context::new(
            Mlx5Config {
                real_time_ts: true,
                ..Default::default()
            },
            Arc::new(RecordUar::default()),
        );
        assert!(!rt.create_cq(&attr).unwrap().ops().clock_update);
    }

    #[test]
    fn check_ownership_parity() {
        let (ctx, _) = context(Mlx5CqeVersion::V1);
        let cq = cq_of(&ctx, 1, 64);
        let ring = cq.hw_ring().unwrap();
        let mut st = cq.lock().unwrap();
        assert!(st.next_cqe().is_none());

        // written with the owner bit of the next pass
        Mlx5CqeImage::new(MLX5_CQE_REQ).post(&ring, 2);
        assert!(st.next_cqe().is_none());
        assert!(st.next_cqe().is_none());
        assert_eq!(st.cons_index(), 0);

        Mlx5CqeImage::new(MLX5_CQE_REQ).post(&ring, 0);
        Mlx5CqeImage::new(MLX5_CQE_REQ).post(&ring, 1);
        assert!(st.next_cqe().is_some());
        assert!(st.next_cqe().is_some());
        assert!(st.next_cqe().is_none());
        // second pass expects owner 1
        Mlx5CqeImage::new(MLX5_CQE_REQ).post(&ring, 2);
        assert!(st.next_cqe().is_some());
        assert_eq!(st.cons_index(), 3);
    }

    #[test]
    fn check_single_threaded_reentry() {
        let (ctx, _) = context(Mlx5CqeVersion::V1);
        let cq = ctx
            .create_cq(&Mlx5CqInitAttr {
                single_threaded: true,
                ..Default::default()
            })
            .unwrap();
        let guard = cq.lock().unwrap();
        assert_eq!(cq.lock().unwrap_err(), Errno::EBUSY);
        drop(guard);
        assert!(cq.lock().is_ok());
    }

    #[test]
    fn check_arm_doorbell() {
        let (ctx, uar) = context(Mlx5CqeVersion::V1);
        let cq = cq_of(&ctx, 3, 64);
        let ring = cq.hw_ring().unwrap();
        for i in 0..3 {
            Mlx5CqeImage::new(MLX5_CQE_REQ).post(&ring, i);
        }
        {
            let mut st = cq.lock().unwrap();
            while st.next_cqe().is_some() {}
        }
        cq.cq_event();
        cq.arm_cq(true).unwrap();
        let expected = 1 << 28 | MLX5_CQ_DB_REQ_NOT_SOL | 3;
        assert_eq!(cq.dbrec().arm(), expected);
        let writes = uar.writes.lock();
        assert_eq!(
            writes.as_slice(),
            &[(MLX5_CQ_DOORBELL, (expected as u64) << 32 | cq.cqn() as u64)]
        );
    }

    #[test]
    fn check_clean_compacts() {
        let (ctx, _) = context(Mlx5CqeVersion::V0);
        let cq = cq_of(&ctx, 7, 64);
        let ring = cq.hw_ring().unwrap();
        let qpns = [1u32, 2, 1, 3, 2];
        for (i, qpn) in qpns.iter().enumerate() {
            Mlx5CqeImage::new(MLX5_CQE_REQ)
                .qpn(*qpn)
                .wqe_counter(i as u16)
                .post(&ring, i as u32);
        }
        cq.clean(2, None).unwrap();
        let mut st = cq.lock().unwrap();
        assert_eq!(st.cons_index(), 2);
        st.flush_ci();
        assert_eq!(cq.dbrec().ci(), 2);
        let mut left = vec![];
        while let Some(cqe) = st.next_cqe() {
            left.push((cqe.qpn(), cqe.wqe_counter()));
        }
        assert_eq!(left, vec![(1, 0), (1, 2), (3, 3)]);
    }

    #[test]
    fn check_resize_copies_to_marker() {
        let (ctx, _) = context(Mlx5CqeVersion::V1);
        let cq = cq_of(&ctx, 3, 64);
        let old = cq.hw_ring().unwrap();
        Mlx5CqeImage::new(MLX5_CQE_REQ).wqe_counter(10).post(&old, 0);
        Mlx5CqeImage::new(MLX5_CQE_REQ).wqe_counter(11).post(&old, 1);
        {
            let mut st = cq.lock().unwrap();
            st.next_cqe().unwrap();
        }
        Mlx5CqeImage::new(MLX5_CQE_RESIZE_CQ).post(&old, 2);

        cq.resize(15, |_| Ok(())).unwrap();
        let new = cq.hw_ring().unwrap();
        assert_eq!(new.nent(), 16);
        let mut st = cq.lock().unwrap();
        assert_eq!(st.cons_index(), 2);
        let cqe = new.get_cqe(2);
        assert_eq!(cqe.wqe_counter(), 11);
        assert_eq!(&cqe.to_bytes()[..63], &old.get_cqe(1).to_bytes()[..63]);
        assert_eq!(st.next_cqe().unwrap().wqe_counter(), 11);
        assert!(st.next_cqe().is_none());
    }

    #[test]
    fn check_resize_without_marker_keeps_ring() {
        let (ctx, _) = context(Mlx5CqeVersion::V1);
        let cq = cq_of(&ctx, 3, 64);
        let old = cq.hw_ring().unwrap();
        for i in 0..4 {
            Mlx5CqeImage::new(MLX5_CQE_REQ).post(&old, i);
        }
        assert_eq!(cq.resize(15, |_| Ok(())).unwrap_err(), Errno::EIO);
        assert!(Arc::ptr_eq(&cq.hw_ring().unwrap(), &old));
        assert_eq!(cq.lock().unwrap().cons_index(), 0);

        assert_eq!(
            cq.resize(15, |_| Err(Errno::ENOMEM)).unwrap_err(),
            Errno::ENOMEM
        );
        // same size is a no-op
        cq.resize(3, |_| Err(Errno::EINVAL)).unwrap();
    }
}
