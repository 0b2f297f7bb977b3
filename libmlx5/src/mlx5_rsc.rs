use std::sync::Arc;

use libmlx5_sys::mlx5dv_clock_info;
use nix::Error;
use parking_lot::Mutex;

use crate::mlx5_mr::Mlx5MkeyTable;
use crate::mlx5_qp::{Mlx5Qp, Mlx5Rwq};
use crate::mlx5_srq::Mlx5Srq;

/// Object a completion can belong to
#[derive(Debug, Clone)]
pub enum Mlx5Rsc {
    Qp(Arc<Mlx5Qp>),
    Rwq(Arc<Mlx5Rwq>),
    /// SRQ addressed by user index
    Xsrq(Arc<Mlx5Srq>),
}

impl Mlx5Rsc {
    /// Resource serial number: qpn for legacy cqes, user index otherwise
    pub fn rsn(&self) -> u32 {
        match self {
            Mlx5Rsc::Qp(qp) => qp.rsn(),
            Mlx5Rsc::Rwq(rwq) => rwq.rsn(),
            Mlx5Rsc::Xsrq(srq) => srq.rsn(),
        }
    }
}

/// Lookups the decoder needs from the owning device context
pub trait Mlx5Resolver {
    fn find_qp(&self, qpn: u32) -> Option<Arc<Mlx5Qp>>;

    fn find_uidx(&self, uidx: u32) -> Option<Mlx5Rsc>;

    fn find_srq(&self, srqn: u32) -> Option<Arc<Mlx5Srq>>;

    fn mkey_table(&self) -> &Mutex<Mlx5MkeyTable>;

    /// Clock translation page, `EOPNOTSUPP` when the device exports none
    fn clock_info(&self) -> Result<mlx5dv_clock_info, Error>;

    /// Device stamps cqes with real time nanoseconds
    fn real_time_ts(&self) -> bool {
        false
    }
}

/// Last resources a poll batch resolved. Consecutive completions usually
/// target the same queue, so most lookups stop here.
#[derive(Debug, Default)]
pub struct Mlx5RscCache {
    cur_rsc: Option<Mlx5Rsc>,
    cur_srq: Option<Arc<Mlx5Srq>>,
}

impl Mlx5RscCache {
    pub fn clear(&mut self) {
        self.cur_rsc = None;
        self.cur_srq = None;
    }

    /// Resolve by qpn, legacy format
    pub fn get_qp<R: Mlx5Resolver + ?Sized>(&mut self, rsl: &R, qpn: u32) -> Option<Arc<Mlx5Qp>> {
        if let Some(Mlx5Rsc::Qp(qp)) = &self.cur_rsc {
            if qp.rsn() == qpn {
                return Some(qp.clone());
            }
        }
        let qp = rsl.find_qp(qpn)?;
        self.cur_rsc = Some(Mlx5Rsc::Qp(qp.clone()));
        Some(qp)
    }

    /// Resolve by user index
    pub fn get_rsc<R: Mlx5Resolver + ?Sized>(&mut self, rsl: &R, uidx: u32) -> Option<Mlx5Rsc> {
        match &self.cur_rsc {
            Some(rsc) if rsc.rsn() == uidx => Some(rsc.clone()),
            _ => {
                let rsc = rsl.find_uidx(uidx)?;
                self.cur_rsc = Some(rsc.clone());
                Some(rsc)
            }
        }
    }

    /// Resolve an SRQ by number, legacy format
    pub fn get_srq<R: Mlx5Resolver + ?Sized>(
        &mut self,
        rsl: &R,
        srqn: u32,
    ) -> Option<Arc<Mlx5Srq>> {
        match &self.cur_srq {
            Some(srq) if srq.srq_num() == srqn => Some(srq.clone()),
            _ => {
                let srq = rsl.find_srq(srqn)?;
                self.cur_srq = Some(srq.clone());
                Some(srq)
            }
        }
    }

    pub fn cur_rsc(&self) -> Option<&Mlx5Rsc> {
        self.cur_rsc.as_ref()
    }

    pub(crate) fn set_srq(&mut self, srq: Arc<Mlx5Srq>) {
        self.cur_srq = Some(srq);
    }
}
