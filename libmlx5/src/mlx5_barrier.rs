//! Device memory ordering primitives used on the completion path.

/// Order the doorbell record store before a write-combined MMIO doorbell.
macro_rules! mmio_wc_start {
    () => {
        mmio_flush_writes!()
    };
}

/// Drain the write-combining buffer after an MMIO doorbell.
macro_rules! mmio_flush_writes {
    () => {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_sfence();
        }
        #[cfg(target_arch = "x86")]
        unsafe {
            std::arch::x86::_mm_sfence();
        }
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dsb st", options(nostack, preserves_flags));
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
        {
            std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        }
    };
}

/// Issued after the owner bit check so the cqe body is read after it.
macro_rules! udma_from_device_barrier {
    () => {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dmb ld", options(nostack, preserves_flags));
        }
        // TSO keeps load-load order, only the compiler has to be fenced
        #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
        {
            std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::Acquire);
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
        {
            std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        }
    };
}

/// Issued between ring buffer stores and the consumer index publish.
macro_rules! udma_to_device_barrier {
    () => {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dmb oshst", options(nostack, preserves_flags));
        }
        #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
        {
            std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::Release);
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
        {
            std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        }
    };
}
