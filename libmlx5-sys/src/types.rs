use std::fmt::Debug;

// mlx5 completion queue entry layouts, all multi-byte fields are big endian

/// First 32 bytes of a responder/requester cqe
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct mlx5_cqe64_ib {
    pub rsvd0: [u8; 2],
    pub wqe_id: u16,
    pub rsvd4: [u8; 13],
    pub ml_path: u8,
    pub rsvd18: [u8; 4],
    pub slid: u16,
    pub flags_rqpn: u32,
    pub hds_ip_ext: u8,
    pub l4_hdr_type_etc: u8,
    pub vlan_info: u16,
}

/// Tag matching list operation result, overlays the cqe header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct mlx5_tm_cqe {
    pub success: u32,
    pub hw_phase_cnt: u16,
    pub rsvd0: [u8; 12],
}

/// Tag matching header of the matched message, overlays the cqe header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ibv_tmh {
    pub opcode: u8,
    pub reserved: [u8; 3],
    pub app_ctx: u32,
    pub tag: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union mlx5_cqe64_hdr {
    pub ib: mlx5_cqe64_ib,
    pub tm_cqe: mlx5_tm_cqe,
    pub tmh: ibv_tmh,
    pub rsvd: [u8; 32],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct mlx5_cqe64 {
    pub hdr: mlx5_cqe64_hdr,
    pub srqn_uidx: u32,
    pub imm_inval_pkey: u32,
    pub app: u8,
    pub app_op: u8,
    pub app_info: u16,
    pub byte_cnt: u32,
    pub timestamp: u64,
    pub sop_drop_qpn: u32,
    pub wqe_counter: u16,
    pub signature: u8,
    pub op_own: u8,
}

impl Default for mlx5_cqe64 {
    // like malloc and memset to 0
    fn default() -> Self {
        let mut s = ::std::mem::MaybeUninit::<Self>::uninit();
        unsafe {
            ::std::ptr::write_bytes(s.as_mut_ptr(), 0, 1);
            s.assume_init()
        }
    }
}

impl Debug for mlx5_cqe64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("mlx5_cqe64")
            .field("srqn_uidx", &u32::from_be(self.srqn_uidx))
            .field("byte_cnt", &u32::from_be(self.byte_cnt))
            .field("sop_drop_qpn", &u32::from_be(self.sop_drop_qpn))
            .field("wqe_counter", &u16::from_be(self.wqe_counter))
            .field("op_own", &self.op_own)
            .finish()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct mlx5_err_cqe {
    pub rsvd0: [u8; 32],
    pub srqn: u32,
    pub rsvd1: [u8; 16],
    pub hw_err_synd: u8,
    pub hw_synd_type: u8,
    pub vendor_err_synd: u8,
    pub syndrome: u8,
    pub s_wqe_opcode_qpn: u32,
    pub wqe_counter: u16,
    pub signature: u8,
    pub op_own: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct mlx5_sigerr_cqe {
    pub rsvd0: [u8; 16],
    pub expected_trans_sig: u32,
    pub actual_trans_sig: u32,
    pub expected_ref_tag: u32,
    pub actual_ref_tag: u32,
    pub syndrome: u16,
    pub sig_type: u8,
    pub domain: u8,
    pub mkey: u32,
    pub sig_err_offset: u64,
    pub rsvd30: [u8; 14],
    pub signature: u8,
    pub op_own: u8,
}

/// Device clock translation parameters exported by the kernel
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct mlx5dv_clock_info {
    pub nsec: u64,
    pub last_cycles: u64,
    pub frac: u64,
    pub mult: u32,
    pub shift: u32,
    pub mask: u64,
}
