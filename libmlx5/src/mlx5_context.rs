use std::fmt::Debug;
use std::ptr::NonNull;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use derivative::Derivative;
use fxhash::FxHashMap;
use libmlx5_sys::mlx5dv_clock_info;
use nix::errno::Errno;
use nix::Error;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::mlx5_cq::{Mlx5Cq, Mlx5CqInitAttr};
use crate::mlx5_mr::{Mlx5Mkey, Mlx5MkeyTable, Mlx5SigErr};
use crate::mlx5_qp::{Mlx5Qp, Mlx5QpInitAttr, Mlx5Rwq};
use crate::mlx5_rsc::{Mlx5Resolver, Mlx5Rsc};
use crate::mlx5_srq::{Mlx5Srq, Mlx5SrqInitAttr};
use crate::mlx5_stall::{Mlx5StallMode, Mlx5StallTuning};

/// Identifier carried in `srqn_uidx`: srqn in the legacy format, the user
/// index of the owning resource otherwise
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Mlx5CqeVersion {
    V0,
    #[default]
    V1,
}

#[derive(Debug, Clone, Derivative)]
#[derivative(Default)]
pub struct Mlx5Config {
    pub cqe_version: Mlx5CqeVersion,
    pub stall_enable: bool,
    pub stall_adaptive: bool,
    pub tuning: Arc<Mlx5StallTuning>,
    /// Park the polling thread on unexpected error cqes
    pub freeze_on_error: bool,
    /// Device timestamps are already wall clock nanoseconds
    pub real_time_ts: bool,
}

fn parse_env<T: FromStr>(key: &str, val: &str) -> Option<T> {
    match val.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignore {}={:?}, not a number", key, val);
            None
        }
    }
}

impl Mlx5Config {
    /// Defaults overlaid with the `MLX5_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, get: F) {
        if let Some(val) = get("MLX5_STALL_CQ_POLL") {
            self.stall_enable = val != "0";
        }
        if let Some(val) = get("MLX5_STALL_NUM_LOOP") {
            if let Some(num_loop) = parse_env::<i64>("MLX5_STALL_NUM_LOOP", &val) {
                if num_loop < 0 {
                    self.stall_adaptive = true;
                } else {
                    self.tuning.set_num_loop(num_loop.min(u32::MAX as i64) as u32);
                }
            }
        }
        let knobs: [(&str, fn(&Mlx5StallTuning, u32)); 4] = [
            ("MLX5_STALL_CQ_POLL_MIN", Mlx5StallTuning::set_poll_min),
            ("MLX5_STALL_CQ_POLL_MAX", Mlx5StallTuning::set_poll_max),
            ("MLX5_STALL_CQ_INC_STEP", Mlx5StallTuning::set_inc_step),
            ("MLX5_STALL_CQ_DEC_STEP", Mlx5StallTuning::set_dec_step),
        ];
        for (key, set) in knobs {
            if let Some(v) = get(key).and_then(|val| parse_env::<u32>(key, &val)) {
                set(&self.tuning, v);
            }
        }
        if let Some(val) = get("MLX5_FREEZE_ON_ERROR_CQE") {
            self.freeze_on_error = val != "0";
        }
    }

    pub fn stall_mode(&self) -> Mlx5StallMode {
        match (self.stall_enable, self.stall_adaptive) {
            (false, _) => Mlx5StallMode::NoStall,
            (true, false) => Mlx5StallMode::Stall,
            (true, true) => Mlx5StallMode::Adaptive,
        }
    }
}

/// Doorbell page of the device
pub trait Mlx5Uar: Send + Sync + Debug {
    /// 64 bit big endian store at `offset` into the page
    fn write64_be(&self, offset: usize, val: u64);
}

/// UAR page mapped from the device
#[derive(Debug)]
pub struct Mlx5MmioUar {
    base: NonNull<u8>,
}

impl Mlx5MmioUar {
    /// # Safety
    /// `base` must map a UAR page that outlives the returned value.
    pub unsafe fn new(base: *mut u8) -> Result<Self, Error> {
        let base = NonNull::new(base).ok_or(Errno::EINVAL)?;
        Ok(Self { base })
    }
}

impl Mlx5Uar for Mlx5MmioUar {
    fn write64_be(&self, offset: usize, val: u64) {
        // SAFETY: offset is a doorbell register inside the mapped page
        unsafe {
            std::ptr::write_volatile(self.base.as_ptr().add(offset) as *mut u64, val.to_be());
        }
    }
}

unsafe impl Send for Mlx5MmioUar {}

unsafe impl Sync for Mlx5MmioUar {}

/// Device context: resource tables shared by every CQ
#[derive(Debug)]
pub struct Mlx5Context {
    config: Mlx5Config,
    uar: Arc<dyn Mlx5Uar>,

    // resource pool
    // Queue Pair Pool, key = qpn
    qp_pool: RwLock<FxHashMap<u32, Arc<Mlx5Qp>>>,
    // User index pool, key = uidx
    uidx_pool: RwLock<FxHashMap<u32, Mlx5Rsc>>,
    // SRQ pool, key = srqn
    srq_pool: RwLock<FxHashMap<u32, Arc<Mlx5Srq>>>,
    // Memory key table, key = lkey >> 8
    mkey_table: Mutex<Mlx5MkeyTable>,
    clock_info: Mutex<Option<mlx5dv_clock_info>>,

    next_cqn: AtomicU32,
    next_qpn: AtomicU32,
    next_srqn: AtomicU32,
    next_uidx: AtomicU32,
}

impl Mlx5Context {
    pub fn new(config: Mlx5Config, uar: Arc<dyn Mlx5Uar>) -> Self {
        debug!(
            "open context cqe version {:?} stall {:?}",
            config.cqe_version,
            config.stall_mode()
        );
        Self {
            config,
            uar,
            qp_pool: RwLock::new(FxHashMap::default()),
            uidx_pool: RwLock::new(FxHashMap::default()),
            srq_pool: RwLock::new(FxHashMap::default()),
            mkey_table: Mutex::new(Mlx5MkeyTable::default()),
            clock_info: Mutex::new(None),
            next_cqn: AtomicU32::new(1),
            next_qpn: AtomicU32::new(0x100),
            // srqn 0 means "no srq" in legacy cqes
            next_srqn: AtomicU32::new(1),
            next_uidx: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> &Mlx5Config {
        &self.config
    }

    pub fn uar(&self) -> &Arc<dyn Mlx5Uar> {
        &self.uar
    }

    pub(crate) fn alloc_cqn(&self) -> u32 {
        self.next_cqn.fetch_add(1, Ordering::Relaxed)
    }

    fn rsn(&self, num: u32, uidx: u32) -> u32 {
        match self.config.cqe_version {
            Mlx5CqeVersion::V0 => num,
            Mlx5CqeVersion::V1 => uidx,
        }
    }

    pub fn create_cq(&self, attr: &Mlx5CqInitAttr) -> Result<Mlx5Cq, Error> {
        Mlx5Cq::create(self, attr)
    }

    pub fn create_qp(&self, attr: &Mlx5QpInitAttr) -> Result<Arc<Mlx5Qp>, Error> {
        let qpn = match attr.qp_num {
            Some(qpn) => qpn & 0xffffff,
            None => self.next_qpn.fetch_add(1, Ordering::Relaxed) & 0xffffff,
        };
        let mut qp_pool = self.qp_pool.write();
        if qp_pool.contains_key(&qpn) {
            return Err(Errno::EEXIST);
        }
        let uidx = self.next_uidx.fetch_add(1, Ordering::Relaxed) & 0xffffff;
        let qp = Arc::new(Mlx5Qp::new(qpn, uidx, self.rsn(qpn, uidx), attr)?);
        qp_pool.insert(qpn, qp.clone());
        self.uidx_pool.write().insert(uidx, Mlx5Rsc::Qp(qp.clone()));
        debug!("create qp {:#x} uidx {}", qpn, uidx);
        Ok(qp)
    }

    pub fn destroy_qp(&self, qpn: u32) -> Result<(), Error> {
        let qp = self.qp_pool.write().remove(&qpn).ok_or(Errno::ENOENT)?;
        self.uidx_pool.write().remove(&qp.uidx());
        debug!("destroy qp {:#x}", qpn);
        Ok(())
    }

    /// Create an SRQ. A tag matching SRQ gets a private command QP whose send
    /// queue carries the matching list operations.
    pub fn create_srq(&self, attr: &Mlx5SrqInitAttr) -> Result<Arc<Mlx5Srq>, Error> {
        let cmd_qp = if attr.max_num_tags > 0 {
            let qp_attr = Mlx5QpInitAttr {
                sq_wqe_cnt: attr.max_ops,
                rq_wqe_cnt: 1,
                ..Default::default()
            };
            let qpn = self.next_qpn.fetch_add(1, Ordering::Relaxed) & 0xffffff;
            Some(Arc::new(Mlx5Qp::new(qpn, 0, qpn, &qp_attr)?))
        } else {
            None
        };
        let srqn = self.next_srqn.fetch_add(1, Ordering::Relaxed) & 0xffffff;
        let uidx = self.next_uidx.fetch_add(1, Ordering::Relaxed) & 0xffffff;
        let srq = Arc::new(Mlx5Srq::new(srqn, self.rsn(srqn, uidx), attr, cmd_qp)?);
        self.srq_pool.write().insert(srqn, srq.clone());
        self.uidx_pool.write().insert(uidx, Mlx5Rsc::Xsrq(srq.clone()));
        debug!("create srq {} uidx {} tags {}", srqn, uidx, attr.max_num_tags);
        Ok(srq)
    }

    pub fn destroy_srq(&self, srqn: u32) -> Result<(), Error> {
        let srq = self.srq_pool.write().remove(&srqn).ok_or(Errno::ENOENT)?;
        self.uidx_pool
            .write()
            .retain(|_, rsc| !matches!(rsc, Mlx5Rsc::Xsrq(s) if Arc::ptr_eq(s, &srq)));
        Ok(())
    }

    /// Receive work queue, only resolvable with user index cqes
    pub fn create_rwq(&self, wqe_cnt: u32) -> Result<Arc<Mlx5Rwq>, Error> {
        let wqn = self.next_qpn.fetch_add(1, Ordering::Relaxed) & 0xffffff;
        let uidx = self.next_uidx.fetch_add(1, Ordering::Relaxed) & 0xffffff;
        let rwq = Arc::new(Mlx5Rwq::new(wqn, self.rsn(wqn, uidx), wqe_cnt)?);
        self.uidx_pool.write().insert(uidx, Mlx5Rsc::Rwq(rwq.clone()));
        Ok(rwq)
    }

    pub fn mlx5_pool_count_qp(&self) -> usize {
        self.qp_pool.read().len()
    }

    pub fn mlx5_pool_count_srq(&self) -> usize {
        self.srq_pool.read().len()
    }

    pub fn create_mkey(&self, lkey: u32, with_sig: bool) -> Result<(), Error> {
        self.mkey_table.lock().insert(Mlx5Mkey::new(lkey, with_sig))
    }

    pub fn destroy_mkey(&self, lkey: u32) -> Result<(), Error> {
        self.mkey_table
            .lock()
            .remove(lkey)
            .map(|_| ())
            .ok_or(Errno::ENOENT)
    }

    /// Fetch and clear the pending signature error of a memory key
    pub fn mkey_check(&self, lkey: u32) -> Result<Option<Mlx5SigErr>, Error> {
        self.mkey_table
            .lock()
            .find_mut(lkey >> 8)
            .ok_or(Errno::EINVAL)?
            .check_sig()
    }

    /// Publish new clock translation parameters
    pub fn set_clock_info(&self, info: mlx5dv_clock_info) {
        *self.clock_info.lock() = Some(info);
    }
}

impl Mlx5Resolver for Mlx5Context {
    fn find_qp(&self, qpn: u32) -> Option<Arc<Mlx5Qp>> {
        self.qp_pool.read().get(&qpn).cloned()
    }

    fn find_uidx(&self, uidx: u32) -> Option<Mlx5Rsc> {
        self.uidx_pool.read().get(&uidx).cloned()
    }

    fn find_srq(&self, srqn: u32) -> Option<Arc<Mlx5Srq>> {
        self.srq_pool.read().get(&srqn).cloned()
    }

    fn mkey_table(&self) -> &Mutex<Mlx5MkeyTable> {
        &self.mkey_table
    }

    fn clock_info(&self) -> Result<mlx5dv_clock_info, Error> {
        self.clock_info.lock().ok_or(Errno::EOPNOTSUPP)
    }

    fn real_time_ts(&self) -> bool {
        self.config.real_time_ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlx5_rsc::Mlx5RscCache;
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    struct NullUar;

    impl Mlx5Uar for NullUar {
        fn write64_be(&self, _offset: usize, _val: u64) {}
    }

    fn context(version: Mlx5CqeVersion) -> Mlx5Context {
        let config = Mlx5Config {
            cqe_version: version,
            ..Default::default()
        };
        Mlx5Context::new(config, Arc::new(NullUar))
    }

    #[test]
    fn check_config_from_env() {
        let env: HashMap<&str, &str> = [
            ("MLX5_STALL_CQ_POLL", "1"),
            ("MLX5_STALL_NUM_LOOP", "-1"),
            ("MLX5_STALL_CQ_POLL_MIN", "20"),
            ("MLX5_STALL_CQ_POLL_MAX", "junk"),
            ("MLX5_STALL_CQ_INC_STEP", "7"),
            ("MLX5_FREEZE_ON_ERROR_CQE", "0"),
        ]
        .into_iter()
        .collect();
        let mut config = Mlx5Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.stall_mode(), Mlx5StallMode::Adaptive);
        assert_eq!(config.tuning.poll_min(), 20);
        assert_eq!(config.tuning.poll_max(), 100000);
        assert_eq!(config.tuning.inc_step(), 7);
        assert_eq!(config.tuning.num_loop(), 60);
        assert!(!config.freeze_on_error);
        assert_eq!(config.cqe_version, Mlx5CqeVersion::V1);

        let mut fixed = Mlx5Config::default();
        fixed.apply_env(|key| match key {
            "MLX5_STALL_CQ_POLL" => Some("yes".into()),
            "MLX5_STALL_NUM_LOOP" => Some("5".into()),
            _ => None,
        });
        assert_eq!(fixed.stall_mode(), Mlx5StallMode::Stall);
        assert_eq!(fixed.tuning.num_loop(), 5);
        assert_eq!(Mlx5Config::default().stall_mode(), Mlx5StallMode::NoStall);
    }

    #[test]
    fn check_resource_pools() {
        let ctx = context(Mlx5CqeVersion::V1);
        let qp = ctx
            .create_qp(&Mlx5QpInitAttr {
                qp_num: Some(7),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(qp.qp_num(), 7);
        assert_eq!(qp.rsn(), qp.uidx());
        assert_eq!(
            ctx.create_qp(&Mlx5QpInitAttr {
                qp_num: Some(7),
                ..Default::default()
            })
            .unwrap_err(),
            Errno::EEXIST
        );
        let srq = ctx.create_srq(&Mlx5SrqInitAttr::default()).unwrap();
        let rwq = ctx.create_rwq(8).unwrap();
        assert_eq!(ctx.mlx5_pool_count_qp(), 1);
        assert_eq!(ctx.mlx5_pool_count_srq(), 1);
        assert!(matches!(ctx.find_uidx(qp.uidx()), Some(Mlx5Rsc::Qp(_))));
        assert!(matches!(ctx.find_uidx(srq.rsn()), Some(Mlx5Rsc::Xsrq(_))));
        assert!(matches!(ctx.find_uidx(rwq.rsn()), Some(Mlx5Rsc::Rwq(_))));
        assert!(ctx.find_srq(srq.srq_num()).is_some());

        ctx.destroy_qp(7).unwrap();
        ctx.destroy_srq(srq.srq_num()).unwrap();
        assert!(ctx.find_qp(7).is_none());
        assert!(ctx.find_uidx(qp.uidx()).is_none());
        assert!(ctx.find_uidx(srq.rsn()).is_none());
        assert_eq!(ctx.destroy_qp(7).unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn check_rsc_cache_tracks_identifier() {
        let ctx = context(Mlx5CqeVersion::V0);
        let qp_a = ctx.create_qp(&Mlx5QpInitAttr::default()).unwrap();
        let qp_b = ctx.create_qp(&Mlx5QpInitAttr::default()).unwrap();
        assert_eq!(qp_a.rsn(), qp_a.qp_num());
        let mut cache = Mlx5RscCache::default();
        let got = cache.get_qp(&ctx, qp_a.qp_num()).unwrap();
        assert!(Arc::ptr_eq(&got, &qp_a));
        // a different qpn must not hit the cached entry
        let got = cache.get_qp(&ctx, qp_b.qp_num()).unwrap();
        assert!(Arc::ptr_eq(&got, &qp_b));
        assert_eq!(cache.cur_rsc().unwrap().rsn(), qp_b.qp_num());
        // the cache keeps a destroyed qp alive until the identifier changes
        ctx.destroy_qp(qp_b.qp_num()).unwrap();
        assert!(cache.get_qp(&ctx, qp_b.qp_num()).is_some());
        cache.clear();
        assert!(cache.get_qp(&ctx, qp_b.qp_num()).is_none());
        assert!(cache.get_qp(&ctx, 0xdead).is_none());

        let srq = ctx.create_srq(&Mlx5SrqInitAttr::default()).unwrap();
        assert_eq!(srq.rsn(), srq.srq_num());
        let got = cache.get_srq(&ctx, srq.srq_num()).unwrap();
        assert!(Arc::ptr_eq(&got, &srq));
    }

    #[test]
    fn check_mkey_check() {
        let ctx = context(Mlx5CqeVersion::V1);
        ctx.create_mkey(0x500, true).unwrap();
        assert_eq!(ctx.mkey_check(0x500).unwrap(), None);
        assert_eq!(ctx.mkey_check(0x900).unwrap_err(), Errno::EINVAL);
        ctx.destroy_mkey(0x500).unwrap();
        assert_eq!(ctx.destroy_mkey(0x500).unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn check_clock_info() {
        let ctx = context(Mlx5CqeVersion::V1);
        assert_eq!(ctx.clock_info().unwrap_err(), Errno::EOPNOTSUPP);
        let info = mlx5dv_clock_info {
            nsec: 5,
            mult: 1,
            mask: u64::MAX,
            ..Default::default()
        };
        ctx.set_clock_info(info);
        assert_eq!(ctx.clock_info().unwrap(), info);
        assert!(!ctx.real_time_ts());
    }

    #[test]
    fn check_mmio_uar_byte_order() {
        let mut page = vec![0u64; 8];
        let uar = unsafe { Mlx5MmioUar::new(page.as_mut_ptr() as *mut u8).unwrap() };
        uar.write64_be(0x20, 0x0102_0304_0506_0708);
        assert_eq!(page[4].to_ne_bytes(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
