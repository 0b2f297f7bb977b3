use std::fmt::Write;
use std::mem::offset_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, Ordering};

use libmlx5_sys::{
    ibv_tmh, mlx5_cqe64, mlx5_cqe64_ib, mlx5_cqe_opcode::MLX5_CQE_INVALID, mlx5_err_cqe,
    mlx5_sigerr_cqe, mlx5_tm_cqe, mlx5dv_get_cqe_opcode, mlx5dv_get_cqe_owner,
    MLX5_CQE_OWNER_MASK, MLX5_FLOW_TAG_MASK, MLX5_INLINE_SCATTER_32, MLX5_INLINE_SCATTER_64,
};

use crate::mlx5_buf::Mlx5Buf;
use crate::mlx5_mr::Mlx5SigErr;

/// Byte offsets inside the 64 byte hardware record
pub mod cqe_off {
    use super::*;

    const HDR: usize = offset_of!(mlx5_cqe64, hdr);

    pub const ML_PATH: usize = HDR + offset_of!(mlx5_cqe64_ib, ml_path);
    pub const SLID: usize = HDR + offset_of!(mlx5_cqe64_ib, slid);
    pub const FLAGS_RQPN: usize = HDR + offset_of!(mlx5_cqe64_ib, flags_rqpn);
    pub const HDS_IP_EXT: usize = HDR + offset_of!(mlx5_cqe64_ib, hds_ip_ext);
    pub const L4_HDR_TYPE_ETC: usize = HDR + offset_of!(mlx5_cqe64_ib, l4_hdr_type_etc);
    pub const VLAN_INFO: usize = HDR + offset_of!(mlx5_cqe64_ib, vlan_info);
    pub const TM_SUCCESS: usize = HDR + offset_of!(mlx5_tm_cqe, success);
    pub const TM_HW_PHASE_CNT: usize = HDR + offset_of!(mlx5_tm_cqe, hw_phase_cnt);
    pub const TMH_APP_CTX: usize = HDR + offset_of!(ibv_tmh, app_ctx);
    pub const TMH_TAG: usize = HDR + offset_of!(ibv_tmh, tag);
    pub const SRQN_UIDX: usize = offset_of!(mlx5_cqe64, srqn_uidx);
    pub const IMM_INVAL_PKEY: usize = offset_of!(mlx5_cqe64, imm_inval_pkey);
    pub const APP: usize = offset_of!(mlx5_cqe64, app);
    pub const APP_OP: usize = offset_of!(mlx5_cqe64, app_op);
    pub const APP_INFO: usize = offset_of!(mlx5_cqe64, app_info);
    pub const BYTE_CNT: usize = offset_of!(mlx5_cqe64, byte_cnt);
    pub const TIMESTAMP: usize = offset_of!(mlx5_cqe64, timestamp);
    pub const SOP_DROP_QPN: usize = offset_of!(mlx5_cqe64, sop_drop_qpn);
    pub const WQE_COUNTER: usize = offset_of!(mlx5_cqe64, wqe_counter);
    pub const OP_OWN: usize = offset_of!(mlx5_cqe64, op_own);

    pub const HW_ERR_SYND: usize = offset_of!(mlx5_err_cqe, hw_err_synd);
    pub const HW_SYND_TYPE: usize = offset_of!(mlx5_err_cqe, hw_synd_type);
    pub const VENDOR_ERR_SYND: usize = offset_of!(mlx5_err_cqe, vendor_err_synd);
    pub const SYNDROME: usize = offset_of!(mlx5_err_cqe, syndrome);

    pub const SIG_EXPECTED_TRANS_SIG: usize = offset_of!(mlx5_sigerr_cqe, expected_trans_sig);
    pub const SIG_ACTUAL_TRANS_SIG: usize = offset_of!(mlx5_sigerr_cqe, actual_trans_sig);
    pub const SIG_EXPECTED_REF_TAG: usize = offset_of!(mlx5_sigerr_cqe, expected_ref_tag);
    pub const SIG_ACTUAL_REF_TAG: usize = offset_of!(mlx5_sigerr_cqe, actual_ref_tag);
    pub const SIG_SYNDROME: usize = offset_of!(mlx5_sigerr_cqe, syndrome);
    pub const SIG_TYPE: usize = offset_of!(mlx5_sigerr_cqe, sig_type);
    pub const SIG_DOMAIN: usize = offset_of!(mlx5_sigerr_cqe, domain);
    pub const SIG_MKEY: usize = offset_of!(mlx5_sigerr_cqe, mkey);
    pub const SIG_ERR_OFFSET: usize = offset_of!(mlx5_sigerr_cqe, sig_err_offset);
}

use cqe_off::*;

const CQE64_SIZE: usize = std::mem::size_of::<mlx5_cqe64>();

/// Read only view of one ring slot.
///
/// Every field access is a volatile big endian read of device memory. The only
/// store path on a software owned slot is [`Mlx5Cqe::set_owner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mlx5Cqe {
    /// slot start, 128 byte slots carry inline data in front of the record
    slot: NonNull<u8>,
    cqe64: NonNull<u8>,
}

impl Mlx5Cqe {
    /// # Safety
    /// `slot` must point to `cqe_sz` bytes of ring memory that outlive the view.
    pub(crate) unsafe fn from_slot(slot: *mut u8, cqe_sz: u32) -> Self {
        let slot = NonNull::new_unchecked(slot);
        let cqe64 = NonNull::new_unchecked(slot.as_ptr().add(cqe_sz as usize - CQE64_SIZE));
        Self { slot, cqe64 }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.slot.as_ptr()
    }

    pub fn cqe_sz(&self) -> usize {
        self.cqe64.as_ptr() as usize - self.slot.as_ptr() as usize + CQE64_SIZE
    }

    #[inline]
    fn read_u8(&self, off: usize) -> u8 {
        unsafe { ptr::read_volatile(self.cqe64.as_ptr().add(off)) }
    }

    #[inline]
    fn read_be16(&self, off: usize) -> u16 {
        u16::from_be(unsafe { ptr::read_volatile(self.cqe64.as_ptr().add(off) as *const u16) })
    }

    #[inline]
    fn read_be32(&self, off: usize) -> u32 {
        u32::from_be(unsafe { ptr::read_volatile(self.cqe64.as_ptr().add(off) as *const u32) })
    }

    #[inline]
    fn read_be64(&self, off: usize) -> u64 {
        u64::from_be(unsafe { ptr::read_volatile(self.cqe64.as_ptr().add(off) as *const u64) })
    }

    #[inline]
    pub fn op_own(&self) -> u8 {
        self.read_u8(OP_OWN)
    }

    #[inline]
    pub fn opcode(&self) -> u8 {
        mlx5dv_get_cqe_opcode(self.op_own())
    }

    #[inline]
    pub fn owner(&self) -> u8 {
        mlx5dv_get_cqe_owner(self.op_own())
    }

    /// Local qpn, low 24 bits of `sop_drop_qpn`
    #[inline]
    pub fn qpn(&self) -> u32 {
        self.read_be32(SOP_DROP_QPN) & 0xffffff
    }

    /// Send WQE opcode of a requester cqe
    #[inline]
    pub fn sop_opcode(&self) -> u8 {
        (self.read_be32(SOP_DROP_QPN) >> 24) as u8
    }

    pub fn flow_tag(&self) -> u32 {
        self.read_be32(SOP_DROP_QPN) & MLX5_FLOW_TAG_MASK
    }

    /// srqn for the legacy format, user index otherwise
    #[inline]
    pub fn srqn_uidx(&self) -> u32 {
        self.read_be32(SRQN_UIDX) & 0xffffff
    }

    pub fn imm_inval_pkey(&self) -> u32 {
        self.read_be32(IMM_INVAL_PKEY)
    }

    #[inline]
    pub fn app(&self) -> u8 {
        self.read_u8(APP)
    }

    #[inline]
    pub fn app_op(&self) -> u8 {
        self.read_u8(APP_OP)
    }

    pub fn app_info(&self) -> u16 {
        self.read_be16(APP_INFO)
    }

    #[inline]
    pub fn byte_cnt(&self) -> u32 {
        self.read_be32(BYTE_CNT)
    }

    pub fn timestamp(&self) -> u64 {
        self.read_be64(TIMESTAMP)
    }

    #[inline]
    pub fn wqe_counter(&self) -> u16 {
        self.read_be16(WQE_COUNTER)
    }

    pub fn ml_path(&self) -> u8 {
        self.read_u8(ML_PATH)
    }

    pub fn dlid_path_bits(&self) -> u8 {
        self.ml_path() & 0x7f
    }

    pub fn slid(&self) -> u16 {
        self.read_be16(SLID)
    }

    pub fn flags_rqpn(&self) -> u32 {
        self.read_be32(FLAGS_RQPN)
    }

    pub fn sl(&self) -> u8 {
        ((self.flags_rqpn() >> 24) & 0xf) as u8
    }

    pub fn src_qp(&self) -> u32 {
        self.flags_rqpn() & 0xffffff
    }

    /// GRH present
    pub fn grh(&self) -> bool {
        (self.flags_rqpn() >> 28) & 3 != 0
    }

    pub fn hds_ip_ext(&self) -> u8 {
        self.read_u8(HDS_IP_EXT)
    }

    pub fn l3_hdr_type(&self) -> u8 {
        (self.read_u8(L4_HDR_TYPE_ETC) >> 2) & 0x3
    }

    pub fn vlan_info(&self) -> u16 {
        self.read_be16(VLAN_INFO)
    }

    pub fn tm_success(&self) -> u32 {
        self.read_be32(TM_SUCCESS)
    }

    pub fn tm_hw_phase_cnt(&self) -> u16 {
        self.read_be16(TM_HW_PHASE_CNT)
    }

    pub fn tmh_tag(&self) -> u64 {
        self.read_be64(TMH_TAG)
    }

    pub fn tmh_app_ctx(&self) -> u32 {
        self.read_be32(TMH_APP_CTX)
    }

    pub fn hw_err_synd(&self) -> u8 {
        self.read_u8(HW_ERR_SYND)
    }

    pub fn hw_synd_type(&self) -> u8 {
        self.read_u8(HW_SYND_TYPE)
    }

    pub fn vendor_err_synd(&self) -> u8 {
        self.read_u8(VENDOR_ERR_SYND)
    }

    pub fn syndrome(&self) -> u8 {
        self.read_u8(SYNDROME)
    }

    pub fn sig_expected_trans_sig(&self) -> u32 {
        self.read_be32(SIG_EXPECTED_TRANS_SIG)
    }

    pub fn sig_actual_trans_sig(&self) -> u32 {
        self.read_be32(SIG_ACTUAL_TRANS_SIG)
    }

    pub fn sig_expected_ref_tag(&self) -> u32 {
        self.read_be32(SIG_EXPECTED_REF_TAG)
    }

    pub fn sig_actual_ref_tag(&self) -> u32 {
        self.read_be32(SIG_ACTUAL_REF_TAG)
    }

    pub fn sig_syndrome(&self) -> u16 {
        self.read_be16(SIG_SYNDROME)
    }

    pub fn sig_type(&self) -> u8 {
        self.read_u8(SIG_TYPE)
    }

    pub fn sig_domain(&self) -> u8 {
        self.read_u8(SIG_DOMAIN)
    }

    pub fn sig_mkey(&self) -> u32 {
        self.read_be32(SIG_MKEY)
    }

    pub fn sig_err_offset(&self) -> u64 {
        self.read_be64(SIG_ERR_OFFSET)
    }

    /// Payload scattered into the cqe by the device, if any
    pub fn inline_scatter(&self) -> Option<Mlx5InlineScatter> {
        let op_own = self.op_own();
        if op_own & MLX5_INLINE_SCATTER_32 != 0 {
            Some(Mlx5InlineScatter {
                ptr: self.cqe64.as_ptr(),
                max: 32,
            })
        } else if op_own & MLX5_INLINE_SCATTER_64 != 0 {
            self.inline_scatter_64()
        } else {
            None
        }
    }

    /// 64 bytes in front of the record, only present in 128 byte slots
    pub fn inline_scatter_64(&self) -> Option<Mlx5InlineScatter> {
        if self.op_own() & MLX5_INLINE_SCATTER_64 == 0 || self.slot == self.cqe64 {
            return None;
        }
        Some(Mlx5InlineScatter {
            ptr: self.slot.as_ptr(),
            max: 64,
        })
    }

    pub(crate) fn stamp_invalid(&self) {
        self.set_op_own(MLX5_CQE_INVALID << 4);
    }

    #[inline]
    fn set_op_own(&self, op_own: u8) {
        unsafe { ptr::write_volatile(self.cqe64.as_ptr().add(OP_OWN), op_own) }
    }

    /// Rewrite the owner bit, leaving every other bit of the slot untouched.
    #[inline]
    pub(crate) fn set_owner(&self, owner: u8) {
        let op_own = self.op_own();
        self.set_op_own((op_own & !MLX5_CQE_OWNER_MASK) | (owner & MLX5_CQE_OWNER_MASK));
    }

    /// Copy the content of `src` over this slot. Slots of different sizes
    /// share their trailing bytes, so the record always lands on the record.
    ///
    /// # Safety
    /// The two slots must not overlap and the caller must own both.
    pub(crate) unsafe fn copy_from(&self, src: &Mlx5Cqe) {
        let len = self.cqe_sz().min(src.cqe_sz());
        let s = src.cqe64.as_ptr().add(CQE64_SIZE - len);
        let d = self.cqe64.as_ptr().add(CQE64_SIZE - len);
        ptr::copy_nonoverlapping(s, d, len);
    }

    /// Raw slot bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        (0..self.cqe_sz())
            .map(|i| unsafe { ptr::read_volatile(self.slot.as_ptr().add(i)) })
            .collect()
    }

    /// Hex dump of the record, four big endian words per line
    pub fn dump(&self) -> String {
        let mut out = String::with_capacity(160);
        for i in (0..CQE64_SIZE).step_by(16) {
            let _ = writeln!(
                out,
                "{:08x} {:08x} {:08x} {:08x}",
                self.read_be32(i),
                self.read_be32(i + 4),
                self.read_be32(i + 8),
                self.read_be32(i + 12)
            );
        }
        out
    }
}

unsafe impl Send for Mlx5Cqe {}

unsafe impl Sync for Mlx5Cqe {}

/// Inline payload location inside a slot
#[derive(Debug, Clone, Copy)]
pub struct Mlx5InlineScatter {
    ptr: *const u8,
    max: usize,
}

impl Mlx5InlineScatter {
    /// Bytes available in the cqe
    pub fn max(&self) -> usize {
        self.max
    }

    /// Copy `len` bytes of payload to the front of `dst`, bounded by what the
    /// cqe can carry. `dst` must hold at least `len` bytes.
    pub fn copy_into(&self, dst: &mut [u8], len: usize) -> usize {
        let n = len.min(self.max).min(dst.len());
        // SAFETY: n is within both the scatter area and dst
        unsafe { ptr::copy_nonoverlapping(self.ptr, dst.as_mut_ptr(), n) };
        n
    }
}

/// Cqe content as the device would write it.
///
/// Built field by field and published into a ring with [`Mlx5CqeImage::post`],
/// which follows the device protocol: body first, owner byte last.
#[derive(Clone)]
pub struct Mlx5CqeImage {
    // [0..64] inline scatter 64 area, [64..128] the record
    bytes: [u8; 128],
}

impl Mlx5CqeImage {
    pub fn new(opcode: u8) -> Self {
        let mut img = Self { bytes: [0; 128] };
        img.bytes[CQE64_SIZE + OP_OWN] = opcode << 4;
        img
    }

    fn put_u8(mut self, off: usize, v: u8) -> Self {
        self.bytes[CQE64_SIZE + off] = v;
        self
    }

    fn put_be16(mut self, off: usize, v: u16) -> Self {
        self.bytes[CQE64_SIZE + off..CQE64_SIZE + off + 2].copy_from_slice(&v.to_be_bytes());
        self
    }

    fn put_be32(mut self, off: usize, v: u32) -> Self {
        self.bytes[CQE64_SIZE + off..CQE64_SIZE + off + 4].copy_from_slice(&v.to_be_bytes());
        self
    }

    fn put_be64(mut self, off: usize, v: u64) -> Self {
        self.bytes[CQE64_SIZE + off..CQE64_SIZE + off + 8].copy_from_slice(&v.to_be_bytes());
        self
    }

    fn get_be32(&self, off: usize) -> u32 {
        let mut w = [0u8; 4];
        w.copy_from_slice(&self.bytes[CQE64_SIZE + off..CQE64_SIZE + off + 4]);
        u32::from_be_bytes(w)
    }

    pub fn qpn(self, qpn: u32) -> Self {
        let v = (self.get_be32(SOP_DROP_QPN) & 0xff00_0000) | (qpn & 0xffffff);
        self.put_be32(SOP_DROP_QPN, v)
    }

    pub fn sop_opcode(self, opcode: u8) -> Self {
        let v = (self.get_be32(SOP_DROP_QPN) & 0xffffff) | ((opcode as u32) << 24);
        self.put_be32(SOP_DROP_QPN, v)
    }

    pub fn srqn_uidx(self, v: u32) -> Self {
        self.put_be32(SRQN_UIDX, v & 0xffffff)
    }

    pub fn wqe_counter(self, v: u16) -> Self {
        self.put_be16(WQE_COUNTER, v)
    }

    pub fn byte_cnt(self, v: u32) -> Self {
        self.put_be32(BYTE_CNT, v)
    }

    pub fn imm_inval_pkey(self, v: u32) -> Self {
        self.put_be32(IMM_INVAL_PKEY, v)
    }

    pub fn flags_rqpn(self, v: u32) -> Self {
        self.put_be32(FLAGS_RQPN, v)
    }

    pub fn slid(self, v: u16) -> Self {
        self.put_be16(SLID, v)
    }

    pub fn ml_path(self, v: u8) -> Self {
        self.put_u8(ML_PATH, v)
    }

    pub fn hds_ip_ext(self, v: u8) -> Self {
        self.put_u8(HDS_IP_EXT, v)
    }

    pub fn l3_hdr_type(self, v: u8) -> Self {
        self.put_u8(L4_HDR_TYPE_ETC, (v & 0x3) << 2)
    }

    pub fn vlan_info(self, v: u16) -> Self {
        self.put_be16(VLAN_INFO, v)
    }

    pub fn timestamp(self, v: u64) -> Self {
        self.put_be64(TIMESTAMP, v)
    }

    pub fn app(self, app: u8, app_op: u8, app_info: u16) -> Self {
        self.put_u8(APP, app)
            .put_u8(APP_OP, app_op)
            .put_be16(APP_INFO, app_info)
    }

    pub fn tm_cqe(self, success: u32, hw_phase_cnt: u16) -> Self {
        self.put_be32(TM_SUCCESS, success)
            .put_be16(TM_HW_PHASE_CNT, hw_phase_cnt)
    }

    pub fn tmh(self, tag: u64, app_ctx: u32) -> Self {
        self.put_be32(TMH_APP_CTX, app_ctx).put_be64(TMH_TAG, tag)
    }

    pub fn syndrome(self, syndrome: u8, vendor_err: u8) -> Self {
        self.put_u8(SYNDROME, syndrome)
            .put_u8(VENDOR_ERR_SYND, vendor_err)
    }

    pub fn hw_err(self, hw_err_synd: u8, hw_synd_type: u8) -> Self {
        self.put_u8(HW_ERR_SYND, hw_err_synd)
            .put_u8(HW_SYND_TYPE, hw_synd_type)
    }

    pub fn sig_err(self, mkey: u32, err: &Mlx5SigErr) -> Self {
        self.put_be32(SIG_EXPECTED_TRANS_SIG, (err.expected >> 32) as u32)
            .put_be32(SIG_EXPECTED_REF_TAG, err.expected as u32)
            .put_be32(SIG_ACTUAL_TRANS_SIG, (err.actual >> 32) as u32)
            .put_be32(SIG_ACTUAL_REF_TAG, err.actual as u32)
            .put_be16(SIG_SYNDROME, err.syndrome)
            .put_u8(SIG_TYPE, err.sig_type)
            .put_u8(SIG_DOMAIN, err.domain)
            .put_be32(SIG_MKEY, mkey)
            .put_be64(SIG_ERR_OFFSET, err.offset)
    }

    /// Up to 32 bytes of payload inside the record itself
    pub fn inline32(mut self, data: &[u8]) -> Self {
        let n = data.len().min(32);
        self.bytes[CQE64_SIZE..CQE64_SIZE + n].copy_from_slice(&data[..n]);
        self.bytes[CQE64_SIZE + OP_OWN] |= MLX5_INLINE_SCATTER_32;
        self.byte_cnt(data.len() as u32)
    }

    /// Up to 64 bytes of payload in front of the record, 128 byte slots only
    pub fn inline64(mut self, data: &[u8]) -> Self {
        let n = data.len().min(64);
        self.bytes[..n].copy_from_slice(&data[..n]);
        self.bytes[CQE64_SIZE + OP_OWN] |= MLX5_INLINE_SCATTER_64;
        self.byte_cnt(data.len() as u32)
    }

    /// Publish into slot `index` of `buf` with the owner bit of that pass.
    pub fn post(&self, buf: &Mlx5Buf, index: u32) {
        let cqe = buf.get_cqe(index);
        let sz = buf.cqe_sz() as usize;
        let src = &self.bytes[self.bytes.len() - sz..];
        let owner = u8::from(index & buf.nent() != 0);
        let slot = cqe.as_ptr();
        for (i, b) in src[..sz - 1].iter().enumerate() {
            unsafe { ptr::write_volatile(slot.add(i), *b) };
        }
        fence(Ordering::Release);
        let op_own = (src[sz - 1] & !MLX5_CQE_OWNER_MASK) | owner;
        unsafe { ptr::write_volatile(slot.add(sz - 1), op_own) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlx5_buf::alloc_cq_buf;
    use libmlx5_sys::{mlx5_cqe_opcode::*, mlx5_opcode::*};

    #[test]
    fn check_cqe_field_decode() {
        let buf = alloc_cq_buf(4, 64).unwrap();
        Mlx5CqeImage::new(MLX5_CQE_RESP_SEND_IMM)
            .qpn(0x12_3456)
            .srqn_uidx(0xab_cdef)
            .wqe_counter(0x1234)
            .byte_cnt(4096)
            .imm_inval_pkey(0xdead_beef)
            .flags_rqpn(0x3a00_0042)
            .slid(0x55)
            .ml_path(0xff)
            .timestamp(0x0102_0304_0506_0708)
            .post(&buf, 0);

        let cqe = buf.get_cqe(0);
        assert_eq!(cqe.opcode(), MLX5_CQE_RESP_SEND_IMM);
        assert_eq!(cqe.owner(), 0);
        assert_eq!(cqe.qpn(), 0x12_3456);
        assert_eq!(cqe.srqn_uidx(), 0xab_cdef);
        assert_eq!(cqe.wqe_counter(), 0x1234);
        assert_eq!(cqe.byte_cnt(), 4096);
        assert_eq!(cqe.imm_inval_pkey(), 0xdead_beef);
        assert_eq!(cqe.src_qp(), 0x42);
        assert_eq!(cqe.sl(), 0xa);
        assert!(cqe.grh());
        assert_eq!(cqe.slid(), 0x55);
        assert_eq!(cqe.dlid_path_bits(), 0x7f);
        assert_eq!(cqe.timestamp(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn check_cqe_golden_bytes() {
        let buf = alloc_cq_buf(2, 64).unwrap();
        Mlx5CqeImage::new(MLX5_CQE_REQ)
            .sop_opcode(MLX5_OPCODE_SEND)
            .qpn(7)
            .wqe_counter(3)
            .post(&buf, 2);
        let bytes = buf.get_cqe(0).to_bytes();
        // sop_drop_qpn, wqe_counter, signature, op_own with owner of pass 1
        assert_eq!(&bytes[56..64], &[0x0a, 0x00, 0x00, 0x07, 0x00, 0x03, 0x00, 0x01]);
        assert_eq!(buf.get_cqe(0).sop_opcode(), MLX5_OPCODE_SEND);
    }

    #[test]
    fn check_set_owner_only_touches_owner() {
        let buf = alloc_cq_buf(2, 64).unwrap();
        Mlx5CqeImage::new(MLX5_CQE_RESP_SEND)
            .inline32(&[0xaa; 8])
            .post(&buf, 0);
        let cqe = buf.get_cqe(0);
        let before = cqe.to_bytes();
        cqe.set_owner(1);
        let after = cqe.to_bytes();
        assert_eq!(&before[..63], &after[..63]);
        assert_eq!(after[63], before[63] | 1);
        assert_eq!(cqe.opcode(), MLX5_CQE_RESP_SEND);
    }

    #[test]
    fn check_inline_scatter() {
        let buf = alloc_cq_buf(2, 128).unwrap();
        let payload: Vec<u8> = (0..40).collect();
        Mlx5CqeImage::new(MLX5_CQE_RESP_SEND)
            .inline64(&payload)
            .post(&buf, 0);
        let cqe = buf.get_cqe(0);
        let scatter = cqe.inline_scatter().unwrap();
        assert_eq!(scatter.max(), 64);
        let mut dst = [0u8; 64];
        assert_eq!(scatter.copy_into(&mut dst, cqe.byte_cnt() as usize), 40);
        assert_eq!(&dst[..40], &payload[..]);

        // 64 byte slots have no room in front of the record
        let small = alloc_cq_buf(2, 64).unwrap();
        Mlx5CqeImage::new(MLX5_CQE_RESP_SEND)
            .inline64(&payload)
            .post(&small, 0);
        assert!(small.get_cqe(0).inline_scatter().is_none());
    }

    #[test]
    fn check_dump_format() {
        let buf = alloc_cq_buf(2, 64).unwrap();
        Mlx5CqeImage::new(MLX5_CQE_REQ_ERR)
            .syndrome(0x04, 0x51)
            .post(&buf, 0);
        let dump = buf.get_cqe(0).dump();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], "00000000 00005104 00000000 000000d0");
    }
}
