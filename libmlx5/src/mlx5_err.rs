use std::fmt;
use std::thread;
use std::time::Duration;

use libmlx5_sys::{mlx5_cqe_syndrome::*, MLX5_CQE_VENDOR_SYNDROME_ODP_PFAULT};
use likely_stable::likely;
use nix::errno::Errno;
use nix::Error;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::mlx5_cqe::Mlx5Cqe;
use crate::mlx5_mr::{Mlx5MkeyTable, Mlx5SigErr};
use crate::mlx5_verbs::WcStatus;

/// Map an error cqe syndrome to a completion status
pub fn mlx5_handle_error_cqe(syndrome: u8) -> WcStatus {
    match syndrome {
        MLX5_CQE_SYNDROME_LOCAL_LENGTH_ERR => WcStatus::LocLenErr,
        MLX5_CQE_SYNDROME_LOCAL_QP_OP_ERR => WcStatus::LocQpOpErr,
        MLX5_CQE_SYNDROME_LOCAL_PROT_ERR => WcStatus::LocProtErr,
        MLX5_CQE_SYNDROME_WR_FLUSH_ERR => WcStatus::WrFlushErr,
        MLX5_CQE_SYNDROME_MW_BIND_ERR => WcStatus::MwBindErr,
        MLX5_CQE_SYNDROME_BAD_RESP_ERR => WcStatus::BadRespErr,
        MLX5_CQE_SYNDROME_LOCAL_ACCESS_ERR => WcStatus::LocAccessErr,
        MLX5_CQE_SYNDROME_REMOTE_INVAL_REQ_ERR => WcStatus::RemInvReqErr,
        MLX5_CQE_SYNDROME_REMOTE_ACCESS_ERR => WcStatus::RemAccessErr,
        MLX5_CQE_SYNDROME_REMOTE_OP_ERR => WcStatus::RemOpErr,
        MLX5_CQE_SYNDROME_TRANSPORT_RETRY_EXC_ERR => WcStatus::RetryExcErr,
        MLX5_CQE_SYNDROME_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExcErr,
        MLX5_CQE_SYNDROME_REMOTE_ABORTED_ERR => WcStatus::RemAbortErr,
        _ => WcStatus::GeneralErr,
    }
}

/// Receive hit a non present page, the device will retry the WQE
#[inline]
pub fn is_odp_pfault_err(cqe: &Mlx5Cqe) -> bool {
    cqe.syndrome() == MLX5_CQE_SYNDROME_REMOTE_ABORTED_ERR
        && cqe.vendor_err_synd() == MLX5_CQE_VENDOR_SYNDROME_ODP_PFAULT
}

/// Flushes and retry exhaustion are routine during teardown
#[inline]
pub fn is_benign_err(cqe: &Mlx5Cqe) -> bool {
    let syndrome = cqe.syndrome();
    syndrome == MLX5_CQE_SYNDROME_WR_FLUSH_ERR
        || syndrome == MLX5_CQE_SYNDROME_TRANSPORT_RETRY_EXC_ERR
        || is_odp_pfault_err(cqe)
}

pub fn get_sig_err_info(cqe: &Mlx5Cqe) -> Mlx5SigErr {
    Mlx5SigErr {
        syndrome: cqe.sig_syndrome(),
        expected: (cqe.sig_expected_trans_sig() as u64) << 32 | cqe.sig_expected_ref_tag() as u64,
        actual: (cqe.sig_actual_trans_sig() as u64) << 32 | cqe.sig_actual_ref_tag() as u64,
        offset: cqe.sig_err_offset(),
        sig_type: cqe.sig_type(),
        domain: cqe.sig_domain(),
    }
}

/// Record a signature error cqe on its memory key
pub fn mlx5_handle_sig_err(cqe: &Mlx5Cqe, mkey_table: &Mutex<Mlx5MkeyTable>) -> Result<(), Error> {
    let mkey_idx = cqe.sig_mkey() >> 8;
    let mut table = mkey_table.lock();
    let Some(sig) = table.find_mut(mkey_idx).and_then(|mkey| mkey.sig_mut()) else {
        error!("sig err cqe on unknown mkey index {:#x}", mkey_idx);
        return Err(Errno::EINVAL);
    };
    sig.err_exists = true;
    sig.err_count += 1;
    sig.err_count_updated = true;
    sig.err_info = get_sig_err_info(cqe);
    debug!(
        "mkey index {:#x} sig err syndrome {:#x} count {}",
        mkey_idx, sig.err_info.syndrome, sig.err_count
    );
    Ok(())
}

/// Error cqe handed to a [`Mlx5FaultObserver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mlx5ErrCqeReport {
    pub cqn: u32,
    pub qpn: u32,
    pub syndrome: u8,
    pub vendor_err: u8,
    pub hw_err_synd: u8,
    pub wqe_counter: u16,
    pub dump: String,
}

impl Mlx5ErrCqeReport {
    pub(crate) fn new(cqn: u32, cqe: &Mlx5Cqe) -> Self {
        Self {
            cqn,
            qpn: cqe.qpn(),
            syndrome: cqe.syndrome(),
            vendor_err: cqe.vendor_err_synd(),
            hw_err_synd: cqe.hw_err_synd(),
            wqe_counter: cqe.wqe_counter(),
            dump: cqe.dump(),
        }
    }
}

impl fmt::Display for Mlx5ErrCqeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cqn {:#x} qpn {:#x} syndrome {:#x} vendor {:#x} hw {:#x} wqe_counter {}",
            self.cqn, self.qpn, self.syndrome, self.vendor_err, self.hw_err_synd, self.wqe_counter
        )?;
        write!(f, "{}", self.dump)
    }
}

/// Hook invoked for every non benign error cqe, before the completion is
/// handed back to the caller.
pub trait Mlx5FaultObserver: Send + Sync {
    fn on_error_cqe(&self, report: &Mlx5ErrCqeReport);
}

/// Park the polling thread forever so the device state can be inspected
#[derive(Debug, Default, Clone, Copy)]
pub struct Mlx5FreezeOnError;

impl Mlx5FaultObserver for Mlx5FreezeOnError {
    fn on_error_cqe(&self, report: &Mlx5ErrCqeReport) {
        error!("freezing at poll cq on cqn {:#x}", report.cqn);
        loop {
            thread::sleep(Duration::from_secs(10));
        }
    }
}

/// Log an unexpected error cqe and notify the observer
pub(crate) fn report_error_cqe(
    cqn: u32,
    cqe: &Mlx5Cqe,
    observer: Option<&dyn Mlx5FaultObserver>,
) {
    if likely(is_benign_err(cqe)) {
        return;
    }
    let report = Mlx5ErrCqeReport::new(cqn, cqe);
    error!("got completion with error:\n{}", report);
    if let Some(observer) = observer {
        observer.on_error_cqe(&report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlx5_buf::alloc_cq_buf;
    use crate::mlx5_cqe::Mlx5CqeImage;
    use crate::mlx5_mr::Mlx5Mkey;
    use libmlx5_sys::mlx5_cqe_opcode::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn check_syndrome_table() {
        let table = [
            (0x01, WcStatus::LocLenErr),
            (0x02, WcStatus::LocQpOpErr),
            (0x04, WcStatus::LocProtErr),
            (0x05, WcStatus::WrFlushErr),
            (0x06, WcStatus::MwBindErr),
            (0x10, WcStatus::BadRespErr),
            (0x11, WcStatus::LocAccessErr),
            (0x12, WcStatus::RemInvReqErr),
            (0x13, WcStatus::RemAccessErr),
            (0x14, WcStatus::RemOpErr),
            (0x15, WcStatus::RetryExcErr),
            (0x16, WcStatus::RnrRetryExcErr),
            (0x22, WcStatus::RemAbortErr),
            (0x03, WcStatus::GeneralErr),
            (0xff, WcStatus::GeneralErr),
        ];
        for (syndrome, status) in table {
            assert_eq!(mlx5_handle_error_cqe(syndrome), status, "{:#x}", syndrome);
        }
    }

    #[test]
    fn check_odp_pfault_detect() {
        let buf = alloc_cq_buf(4, 64).unwrap();
        Mlx5CqeImage::new(MLX5_CQE_RESP_ERR)
            .syndrome(MLX5_CQE_SYNDROME_REMOTE_ABORTED_ERR, MLX5_CQE_VENDOR_SYNDROME_ODP_PFAULT)
            .post(&buf, 0);
        Mlx5CqeImage::new(MLX5_CQE_RESP_ERR)
            .syndrome(MLX5_CQE_SYNDROME_REMOTE_ABORTED_ERR, 0)
            .post(&buf, 1);
        assert!(is_odp_pfault_err(&buf.get_cqe(0)));
        assert!(is_benign_err(&buf.get_cqe(0)));
        assert!(!is_odp_pfault_err(&buf.get_cqe(1)));
        assert!(!is_benign_err(&buf.get_cqe(1)));
    }

    #[test]
    fn check_sig_err_record() {
        let table = Mutex::new(Mlx5MkeyTable::default());
        table.lock().insert(Mlx5Mkey::new(0xabcd_0012, true)).unwrap();
        table.lock().insert(Mlx5Mkey::new(0x0000_0134, false)).unwrap();
        let err = Mlx5SigErr {
            syndrome: 0x4,
            expected: 0x1111_2222_3333_4444,
            actual: 0x5555_6666_7777_8888,
            offset: 0x1000,
            sig_type: 1,
            domain: 2,
        };
        let buf = alloc_cq_buf(4, 64).unwrap();
        Mlx5CqeImage::new(MLX5_CQE_SIG_ERR)
            .sig_err(0xabcd_0012, &err)
            .post(&buf, 0);
        mlx5_handle_sig_err(&buf.get_cqe(0), &table).unwrap();
        mlx5_handle_sig_err(&buf.get_cqe(0), &table).unwrap();
        {
            let guard = table.lock();
            let sig = guard.find(0xab_cd00).unwrap().sig().unwrap();
            assert!(sig.err_exists);
            assert!(sig.err_count_updated);
            assert_eq!(sig.err_count, 2);
            assert_eq!(sig.err_info, err);
        }

        // key without signature context, then no key at all
        Mlx5CqeImage::new(MLX5_CQE_SIG_ERR)
            .sig_err(0x0000_0134, &err)
            .post(&buf, 1);
        assert_eq!(mlx5_handle_sig_err(&buf.get_cqe(1), &table).unwrap_err(), Errno::EINVAL);
        Mlx5CqeImage::new(MLX5_CQE_SIG_ERR)
            .sig_err(0x7700_0000, &err)
            .post(&buf, 2);
        assert_eq!(mlx5_handle_sig_err(&buf.get_cqe(2), &table).unwrap_err(), Errno::EINVAL);
    }

    struct Counter(AtomicUsize);

    impl Mlx5FaultObserver for Counter {
        fn on_error_cqe(&self, report: &Mlx5ErrCqeReport) {
            assert_eq!(report.syndrome, MLX5_CQE_SYNDROME_LOCAL_PROT_ERR);
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn check_observer_skips_benign() {
        let buf = alloc_cq_buf(2, 64).unwrap();
        Mlx5CqeImage::new(MLX5_CQE_REQ_ERR)
            .syndrome(MLX5_CQE_SYNDROME_WR_FLUSH_ERR, 0)
            .post(&buf, 0);
        Mlx5CqeImage::new(MLX5_CQE_REQ_ERR)
            .syndrome(MLX5_CQE_SYNDROME_LOCAL_PROT_ERR, 0x33)
            .qpn(9)
            .post(&buf, 1);
        let counter = Counter(AtomicUsize::new(0));
        report_error_cqe(1, &buf.get_cqe(0), Some(&counter));
        assert_eq!(counter.0.load(Ordering::Relaxed), 0);
        report_error_cqe(1, &buf.get_cqe(1), Some(&counter));
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
        let report = Mlx5ErrCqeReport::new(1, &buf.get_cqe(1));
        assert_eq!(report.qpn, 9);
        assert_eq!(report.vendor_err, 0x33);
    }
}
