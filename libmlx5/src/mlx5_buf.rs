use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use libmlx5_sys::{MLX5_CQ_ARM_DB, MLX5_CQ_SET_CI};
use nix::errno::Errno;
use nix::Error;
use tracing::debug;

use crate::mlx5_cqe::Mlx5Cqe;

const MLX5_DEFAULT_PAGE_SIZE: usize = 4096;

fn page_size() -> usize {
    // SAFETY: ffi, sysconf has no preconditions
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        MLX5_DEFAULT_PAGE_SIZE
    } else {
        sz as usize
    }
}

#[inline]
fn align(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Page aligned cqe ring shared with the device
#[derive(Debug)]
pub struct Mlx5Buf {
    ptr: NonNull<u8>,
    layout: Layout,
    nent: u32,
    cqe_sz: u32,
}

impl Mlx5Buf {
    fn alloc(nent: u32, cqe_sz: u32) -> Result<Self, Error> {
        let page = page_size();
        let length = align(nent as usize * cqe_sz as usize, page);
        let layout = Layout::from_size_align(length, page).map_err(|_| Errno::EINVAL)?;
        // SAFETY: layout has a non zero size
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(Errno::ENOMEM)?;
        Ok(Self {
            ptr,
            layout,
            nent,
            cqe_sz,
        })
    }

    /// Base address handed to the device
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Number of slots, always a power of two
    pub fn nent(&self) -> u32 {
        self.nent
    }

    pub fn cqe_sz(&self) -> u32 {
        self.cqe_sz
    }

    /// View of slot `n & (nent - 1)`. The view does not borrow the ring, the
    /// caller keeps the ring alive for as long as the view is read.
    #[inline]
    pub(crate) fn get_cqe(&self, n: u32) -> Mlx5Cqe {
        let off = (n & (self.nent - 1)) as usize * self.cqe_sz as usize;
        // SAFETY: off is within the allocation and slots are cqe_sz bytes
        unsafe { Mlx5Cqe::from_slot(self.ptr.as_ptr().add(off), self.cqe_sz) }
    }

    /// Copy of the raw bytes of slot `n & (nent - 1)`
    pub fn slot_bytes(&self, n: u32) -> Vec<u8> {
        self.get_cqe(n).to_bytes()
    }
}

impl Drop for Mlx5Buf {
    fn drop(&mut self) {
        // SAFETY: allocated in `Mlx5Buf::alloc` with the same layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

unsafe impl Sync for Mlx5Buf {}

unsafe impl Send for Mlx5Buf {}

/// Allocate a cq ring of `nent` slots with every slot stamped invalid, so
/// nothing can pass the ownership check before hardware writes it.
pub fn alloc_cq_buf(nent: u32, cqe_sz: u32) -> Result<Mlx5Buf, Error> {
    if !nent.is_power_of_two() || (cqe_sz != 64 && cqe_sz != 128) {
        return Err(Errno::EINVAL);
    }
    let buf = Mlx5Buf::alloc(nent, cqe_sz)?;
    for i in 0..nent {
        buf.get_cqe(i).stamp_invalid();
    }
    debug!("alloc cq buf nent {} cqe_sz {}", nent, cqe_sz);
    Ok(buf)
}

/// Doorbell record, both words hold big endian values read by the device
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct Mlx5DbRec {
    words: [AtomicU32; 2],
}

impl Mlx5DbRec {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn update_ci(&self, cons_index: u32) {
        self.words[MLX5_CQ_SET_CI].store((cons_index & 0xffffff).to_be(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn update_arm(&self, val: u32) {
        self.words[MLX5_CQ_ARM_DB].store(val.to_be(), Ordering::Release);
    }

    /// Consumer index as last published to the device
    pub fn ci(&self) -> u32 {
        u32::from_be(self.words[MLX5_CQ_SET_CI].load(Ordering::Acquire))
    }

    /// Last arm request word
    pub fn arm(&self) -> u32 {
        u32::from_be(self.words[MLX5_CQ_ARM_DB].load(Ordering::Acquire))
    }

    pub fn as_ptr(&self) -> *const u32 {
        self.words.as_ptr() as *const u32
    }
}
