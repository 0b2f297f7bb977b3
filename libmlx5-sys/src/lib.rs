#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
//! Hardware ABI of the mlx5 completion path: cqe layouts, opcodes, syndromes
//! and doorbell constants.

mod types;
pub use types::*;

pub mod mlx5_cqe_opcode {
    pub const MLX5_CQE_REQ: u8 = 0;
    pub const MLX5_CQE_RESP_WR_IMM: u8 = 1;
    pub const MLX5_CQE_RESP_SEND: u8 = 2;
    pub const MLX5_CQE_RESP_SEND_IMM: u8 = 3;
    pub const MLX5_CQE_RESP_SEND_INV: u8 = 4;
    pub const MLX5_CQE_RESIZE_CQ: u8 = 5;
    pub const MLX5_CQE_NO_PACKET: u8 = 6;
    pub const MLX5_CQE_SIG_ERR: u8 = 12;
    pub const MLX5_CQE_REQ_ERR: u8 = 13;
    pub const MLX5_CQE_RESP_ERR: u8 = 14;
    pub const MLX5_CQE_INVALID: u8 = 15;
}

pub mod mlx5_cqe_syndrome {
    pub const MLX5_CQE_SYNDROME_LOCAL_LENGTH_ERR: u8 = 0x01;
    pub const MLX5_CQE_SYNDROME_LOCAL_QP_OP_ERR: u8 = 0x02;
    pub const MLX5_CQE_SYNDROME_LOCAL_PROT_ERR: u8 = 0x04;
    pub const MLX5_CQE_SYNDROME_WR_FLUSH_ERR: u8 = 0x05;
    pub const MLX5_CQE_SYNDROME_MW_BIND_ERR: u8 = 0x06;
    pub const MLX5_CQE_SYNDROME_BAD_RESP_ERR: u8 = 0x10;
    pub const MLX5_CQE_SYNDROME_LOCAL_ACCESS_ERR: u8 = 0x11;
    pub const MLX5_CQE_SYNDROME_REMOTE_INVAL_REQ_ERR: u8 = 0x12;
    pub const MLX5_CQE_SYNDROME_REMOTE_ACCESS_ERR: u8 = 0x13;
    pub const MLX5_CQE_SYNDROME_REMOTE_OP_ERR: u8 = 0x14;
    pub const MLX5_CQE_SYNDROME_TRANSPORT_RETRY_EXC_ERR: u8 = 0x15;
    pub const MLX5_CQE_SYNDROME_RNR_RETRY_EXC_ERR: u8 = 0x16;
    pub const MLX5_CQE_SYNDROME_REMOTE_ABORTED_ERR: u8 = 0x22;
}

pub const MLX5_CQE_VENDOR_SYNDROME_ODP_PFAULT: u8 = 0x93;

/// Send WQE opcodes reported in the top byte of `sop_drop_qpn`
pub mod mlx5_opcode {
    pub const MLX5_OPCODE_NOP: u8 = 0x00;
    pub const MLX5_OPCODE_SEND_INVAL: u8 = 0x01;
    pub const MLX5_OPCODE_RDMA_WRITE: u8 = 0x08;
    pub const MLX5_OPCODE_RDMA_WRITE_IMM: u8 = 0x09;
    pub const MLX5_OPCODE_SEND: u8 = 0x0a;
    pub const MLX5_OPCODE_SEND_IMM: u8 = 0x0b;
    pub const MLX5_OPCODE_TSO: u8 = 0x0e;
    pub const MLX5_OPCODE_RDMA_READ: u8 = 0x10;
    pub const MLX5_OPCODE_ATOMIC_CS: u8 = 0x11;
    pub const MLX5_OPCODE_ATOMIC_FA: u8 = 0x12;
    pub const MLX5_OPCODE_SET_PSV: u8 = 0x20;
    pub const MLX5_OPCODE_UMR: u8 = 0x25;
    pub const MLX5_OPCODE_MMO: u8 = 0x2f;
}

pub const MLX5_CQE_APP_TAG_MATCHING: u8 = 1;

pub mod mlx5_cqe_app_op {
    pub const MLX5_CQE_APP_OP_TM_CONSUMED: u8 = 0x1;
    pub const MLX5_CQE_APP_OP_TM_EXPECTED: u8 = 0x2;
    pub const MLX5_CQE_APP_OP_TM_UNEXPECTED: u8 = 0x3;
    pub const MLX5_CQE_APP_OP_TM_NO_TAG: u8 = 0x4;
    pub const MLX5_CQE_APP_OP_TM_APPEND: u8 = 0x5;
    pub const MLX5_CQE_APP_OP_TM_REMOVE: u8 = 0x6;
    pub const MLX5_CQE_APP_OP_TM_NOOP: u8 = 0x7;
    pub const MLX5_CQE_APP_OP_TM_CONSUMED_SW_RDNV: u8 = 0x9;
    pub const MLX5_CQE_APP_OP_TM_CONSUMED_MSG: u8 = 0xA;
    pub const MLX5_CQE_APP_OP_TM_CONSUMED_MSG_SW_RDNV: u8 = 0xB;
    pub const MLX5_CQE_APP_OP_TM_MSG_COMPLETION_CANCELED: u8 = 0xC;
}

/// Matching and data transfer are distinct completions for rendezvous and
/// large messages; only the final one retires the tag.
#[inline]
pub fn mlx5_cqe_app_op_tm_is_complete(op: u8) -> bool {
    op != mlx5_cqe_app_op::MLX5_CQE_APP_OP_TM_CONSUMED
        && op != mlx5_cqe_app_op::MLX5_CQE_APP_OP_TM_CONSUMED_SW_RDNV
}

pub const MLX5_TMC_SUCCESS: u32 = 0x8000_0000;
pub const MLX5_TM_MAX_SYNC_DIFF: u64 = 0x3fff;

pub const MLX5_CQE_OWNER_MASK: u8 = 1;
pub const MLX5_INLINE_SCATTER_32: u8 = 0x4;
pub const MLX5_INLINE_SCATTER_64: u8 = 0x8;

pub const MLX5_CQE_L2_OK: u8 = 1 << 0;
pub const MLX5_CQE_L3_OK: u8 = 1 << 1;
pub const MLX5_CQE_L4_OK: u8 = 1 << 2;

pub const MLX5_CQE_L3_HDR_TYPE_NONE: u8 = 0x0;
pub const MLX5_CQE_L3_HDR_TYPE_IPV6: u8 = 0x1;
pub const MLX5_CQE_L3_HDR_TYPE_IPV4: u8 = 0x2;

pub const MLX5_FLOW_TAG_MASK: u32 = 0x00ff_ffff;

// doorbell record words
pub const MLX5_CQ_SET_CI: usize = 0;
pub const MLX5_CQ_ARM_DB: usize = 1;

pub const MLX5_CQ_DB_REQ_NOT_SOL: u32 = 1 << 24;
pub const MLX5_CQ_DB_REQ_NOT: u32 = 0;
/// Offset of the CQ doorbell register in the UAR page
pub const MLX5_CQ_DOORBELL: usize = 0x20;

#[inline]
pub fn mlx5dv_get_cqe_owner(op_own: u8) -> u8 {
    op_own & MLX5_CQE_OWNER_MASK
}

#[inline]
pub fn mlx5dv_get_cqe_opcode(op_own: u8) -> u8 {
    op_own >> 4
}

/// Translate a raw device timestamp into nanoseconds of wall clock.
pub fn mlx5dv_ts_to_ns(clock_info: &mlx5dv_clock_info, device_timestamp: u64) -> u64 {
    let mut delta = device_timestamp.wrapping_sub(clock_info.last_cycles) & clock_info.mask;
    let mut nsec = clock_info.nsec;

    // the timestamp may be older than the last clock update
    if delta > clock_info.mask / 2 {
        delta = clock_info.last_cycles.wrapping_sub(device_timestamp) & clock_info.mask;
        nsec = nsec.wrapping_sub(
            delta
                .wrapping_mul(clock_info.mult as u64)
                .wrapping_sub(clock_info.frac)
                >> clock_info.shift,
        );
    } else {
        nsec = nsec.wrapping_add(
            delta
                .wrapping_mul(clock_info.mult as u64)
                .wrapping_add(clock_info.frac)
                >> clock_info.shift,
        );
    }
    nsec
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn check_cqe_layout_size() {
        assert_eq!(
            size_of::<mlx5_cqe64>(),
            64usize,
            concat!("Size of: ", stringify!(mlx5_cqe64))
        );
        assert_eq!(
            size_of::<mlx5_err_cqe>(),
            64usize,
            concat!("Size of: ", stringify!(mlx5_err_cqe))
        );
        assert_eq!(
            size_of::<mlx5_sigerr_cqe>(),
            64usize,
            concat!("Size of: ", stringify!(mlx5_sigerr_cqe))
        );
        assert_eq!(
            size_of::<mlx5_cqe64_hdr>(),
            32usize,
            concat!("Size of: ", stringify!(mlx5_cqe64_hdr))
        );
    }

    #[test]
    fn check_cqe_field_offset() {
        assert_eq!(offset_of!(mlx5_cqe64_ib, ml_path), 17);
        assert_eq!(offset_of!(mlx5_cqe64_ib, slid), 22);
        assert_eq!(offset_of!(mlx5_cqe64_ib, flags_rqpn), 24);
        assert_eq!(offset_of!(mlx5_cqe64_ib, vlan_info), 30);
        assert_eq!(offset_of!(mlx5_cqe64, srqn_uidx), 32);
        assert_eq!(offset_of!(mlx5_cqe64, app_info), 42);
        assert_eq!(offset_of!(mlx5_cqe64, byte_cnt), 44);
        assert_eq!(offset_of!(mlx5_cqe64, timestamp), 48);
        assert_eq!(offset_of!(mlx5_cqe64, sop_drop_qpn), 56);
        assert_eq!(offset_of!(mlx5_cqe64, wqe_counter), 60);
        assert_eq!(offset_of!(mlx5_cqe64, op_own), 63);
        assert_eq!(offset_of!(mlx5_err_cqe, vendor_err_synd), 54);
        assert_eq!(offset_of!(mlx5_err_cqe, syndrome), 55);
        assert_eq!(offset_of!(mlx5_sigerr_cqe, syndrome), 32);
        assert_eq!(offset_of!(mlx5_sigerr_cqe, mkey), 36);
        assert_eq!(offset_of!(mlx5_sigerr_cqe, sig_err_offset), 40);
        assert_eq!(offset_of!(ibv_tmh, tag), 8);
    }

    #[test]
    fn check_tm_is_complete() {
        use mlx5_cqe_app_op::*;
        assert!(!mlx5_cqe_app_op_tm_is_complete(MLX5_CQE_APP_OP_TM_CONSUMED));
        assert!(!mlx5_cqe_app_op_tm_is_complete(
            MLX5_CQE_APP_OP_TM_CONSUMED_SW_RDNV
        ));
        assert!(mlx5_cqe_app_op_tm_is_complete(MLX5_CQE_APP_OP_TM_EXPECTED));
        assert!(mlx5_cqe_app_op_tm_is_complete(
            MLX5_CQE_APP_OP_TM_CONSUMED_MSG
        ));
    }

    #[test]
    fn check_ts_to_ns() {
        let clock = mlx5dv_clock_info {
            nsec: 1_000_000,
            last_cycles: 1000,
            frac: 0,
            mult: 2,
            shift: 1,
            mask: u64::MAX >> 16,
        };
        // one cycle per nanosecond with mult/shift = 2/2
        assert_eq!(mlx5dv_ts_to_ns(&clock, 1500), 1_000_500);
        // timestamp taken before the last clock update
        assert_eq!(mlx5dv_ts_to_ns(&clock, 400), 999_400);
    }
}
