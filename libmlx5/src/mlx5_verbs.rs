use std::fmt;

use enumflags2::{bitflags, BitFlags};

// completion definitions from rdma-core/libibverbs/verbs.h

#[repr(u32)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    #[default]
    Success = 0,
    LocLenErr,
    LocQpOpErr,
    LocEecOpErr,
    LocProtErr,
    WrFlushErr,
    MwBindErr,
    BadRespErr,
    LocAccessErr,
    RemInvReqErr,
    RemAccessErr,
    RemOpErr,
    RetryExcErr,
    RnrRetryExcErr,
    LocRddViolErr,
    RemInvRdReqErr,
    RemAbortErr,
    InvEecnErr,
    InvEecStateErr,
    FatalErr,
    RespTimeoutErr,
    GeneralErr,
    TmErr,
    TmRndvIncomplete,
}

impl PartialEq<u32> for WcStatus {
    fn eq(&self, other: &u32) -> bool {
        *self as u32 == *other
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WcStatus::Success => "success",
            WcStatus::LocLenErr => "local length error",
            WcStatus::LocQpOpErr => "local QP operation error",
            WcStatus::LocEecOpErr => "local EE context operation error",
            WcStatus::LocProtErr => "local protection error",
            WcStatus::WrFlushErr => "Work Request Flushed Error",
            WcStatus::MwBindErr => "memory management operation error",
            WcStatus::BadRespErr => "bad response error",
            WcStatus::LocAccessErr => "local access error",
            WcStatus::RemInvReqErr => "remote invalid request error",
            WcStatus::RemAccessErr => "remote access error",
            WcStatus::RemOpErr => "remote operation error",
            WcStatus::RetryExcErr => "transport retry counter exceeded",
            WcStatus::RnrRetryExcErr => "RNR retry counter exceeded",
            WcStatus::LocRddViolErr => "local RDD violation error",
            WcStatus::RemInvRdReqErr => "remote invalid RD request",
            WcStatus::RemAbortErr => "aborted error",
            WcStatus::InvEecnErr => "invalid EE context number",
            WcStatus::InvEecStateErr => "invalid EE context state",
            WcStatus::FatalErr => "fatal error",
            WcStatus::RespTimeoutErr => "response timeout error",
            WcStatus::GeneralErr => "general error",
            WcStatus::TmErr => "TM error",
            WcStatus::TmRndvIncomplete => "TM software rendezvous",
        };
        write!(f, "{}", s)
    }
}

#[repr(u32)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    #[default]
    Send = 0,
    RdmaWrite = 1,
    RdmaRead = 2,
    CompSwap = 3,
    FetchAdd = 4,
    BindMw = 5,
    LocalInv = 6,
    Tso = 7,
    Recv = 1 << 7,
    RecvRdmaWithImm,
    TmAdd,
    TmDel,
    TmSync,
    TmRecv,
    TmNoTag,
    Driver1,
    Driver2,
    Driver3,
}

impl WcOpcode {
    /// Receive side opcodes have bit 7 set
    pub fn is_recv(&self) -> bool {
        (*self as u32) & (1 << 7) != 0
    }
}

/// Per completion flags
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcFlag {
    Grh = 1 << 0,
    WithImm = 1 << 1,
    IpCsumOk = 1 << 2,
    WithInv = 1 << 3,
    TmSyncReq = 1 << 4,
    TmMatch = 1 << 5,
    TmDataValid = 1 << 6,
}

pub type WcFlags = BitFlags<WcFlag>;

/// Completion fields requested at CQ creation, each one enables a lazy reader
#[bitflags]
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcExFlag {
    ByteLen = 1 << 0,
    Imm = 1 << 1,
    QpNum = 1 << 2,
    SrcQp = 1 << 3,
    Slid = 1 << 4,
    Sl = 1 << 5,
    DlidPathBits = 1 << 6,
    CompletionTimestamp = 1 << 7,
    Cvlan = 1 << 8,
    FlowTag = 1 << 9,
    TmInfo = 1 << 10,
    CompletionTimestampWallclock = 1 << 11,
}

pub type WcExFlags = BitFlags<WcExFlag>;

/// Work completion as returned by `poll_cq`
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mlx5Wc {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub vendor_err: u32,
    pub byte_len: u32,
    /// Immediate data, or the invalidated rkey for `WithInv`, in host order
    pub imm_data: u32,
    pub qp_num: u32,
    pub src_qp: u32,
    pub wc_flags: WcFlags,
    pub pkey_index: u16,
    pub slid: u16,
    pub sl: u8,
    pub dlid_path_bits: u8,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mlx5TmInfo {
    pub tag: u64,
    pub priv_: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_wc_opcode_value() {
        assert_eq!(WcOpcode::Recv as u32, 128);
        assert_eq!(WcOpcode::RecvRdmaWithImm as u32, 129);
        assert_eq!(WcOpcode::TmNoTag as u32, 134);
        assert!(WcOpcode::TmRecv.is_recv());
        assert!(!WcOpcode::FetchAdd.is_recv());
    }

    #[test]
    fn check_wc_status_value() {
        assert_eq!(WcStatus::WrFlushErr, 5);
        assert_eq!(WcStatus::GeneralErr, 21);
        assert_eq!(WcStatus::TmRndvIncomplete, 23);
        assert_eq!(format!("{}", WcStatus::WrFlushErr), "Work Request Flushed Error");
    }

    #[test]
    fn check_wc_flag_bits() {
        let flags = WcFlag::Grh | WcFlag::TmDataValid;
        assert_eq!(flags.bits(), 0x41);
        assert!(!flags.contains(WcFlag::WithImm));
    }
}
