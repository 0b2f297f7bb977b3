use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use derivative::Derivative;

/// Live tunable stall parameters, shared by every CQ of a context
#[derive(Debug, Derivative)]
#[derivative(Default)]
pub struct Mlx5StallTuning {
    /// cycle counter reads per fixed stall
    #[derivative(Default(value = "AtomicU32::new(60)"))]
    num_loop: AtomicU32,
    #[derivative(Default(value = "AtomicU32::new(60)"))]
    poll_min: AtomicU32,
    #[derivative(Default(value = "AtomicU32::new(100000)"))]
    poll_max: AtomicU32,
    #[derivative(Default(value = "AtomicU32::new(100)"))]
    inc_step: AtomicU32,
    #[derivative(Default(value = "AtomicU32::new(10)"))]
    dec_step: AtomicU32,
}

macro_rules! tuning_field {
    ($get:ident, $set:ident) => {
        pub fn $get(&self) -> u32 {
            self.$get.load(Ordering::Relaxed)
        }

        pub fn $set(&self, val: u32) {
            self.$get.store(val, Ordering::Relaxed)
        }
    };
}

impl Mlx5StallTuning {
    tuning_field!(num_loop, set_num_loop);
    tuning_field!(poll_min, set_poll_min);
    tuning_field!(poll_max, set_poll_max);
    tuning_field!(inc_step, set_inc_step);
    tuning_field!(dec_step, set_dec_step);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Mlx5StallMode {
    #[default]
    NoStall,
    /// fixed busy loop after an empty poll
    Stall,
    /// cycle budget adjusted by the outcome of each batch
    Adaptive,
}

/// Monotonic cycle counter
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn get_cycles() -> u64 {
    // SAFETY: rdtsc has no preconditions on x86_64
    unsafe { std::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn get_cycles() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();
    // zero is reserved for "no pending stall"
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64 + 1
}

/// Per CQ stall state. Touched before the CQ lock is taken and after it is
/// released, so every field is atomic.
#[derive(Debug, Default)]
pub struct Mlx5Stall {
    mode: Mlx5StallMode,
    tuning: Arc<Mlx5StallTuning>,
    cycles: AtomicU32,
    last_count: AtomicU64,
    next_poll: AtomicBool,
}

impl Mlx5Stall {
    pub fn new(mode: Mlx5StallMode, tuning: Arc<Mlx5StallTuning>) -> Self {
        let cycles = AtomicU32::new(tuning.poll_min());
        Self {
            mode,
            tuning,
            cycles,
            ..Default::default()
        }
    }

    pub fn mode(&self) -> Mlx5StallMode {
        self.mode
    }

    pub fn tuning(&self) -> &Arc<Mlx5StallTuning> {
        &self.tuning
    }

    pub fn cycles(&self) -> u32 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn last_count(&self) -> u64 {
        self.last_count.load(Ordering::Relaxed)
    }

    pub fn next_poll(&self) -> bool {
        self.next_poll.load(Ordering::Relaxed)
    }

    /// Delay applied before touching the ring
    pub fn pre_poll(&self) {
        match self.mode {
            Mlx5StallMode::NoStall => {}
            Mlx5StallMode::Adaptive => {
                let last = self.last_count();
                if last != 0 {
                    let deadline = last + self.cycles() as u64;
                    while get_cycles() < deadline {
                        hint::spin_loop();
                    }
                }
            }
            Mlx5StallMode::Stall => {
                if self.next_poll.swap(false, Ordering::Relaxed) {
                    for _ in 0..self.tuning.num_loop() {
                        hint::black_box(get_cycles());
                    }
                }
            }
        }
    }

    fn shrink(&self) {
        let cycles = self
            .cycles()
            .saturating_sub(self.tuning.dec_step())
            .max(self.tuning.poll_min());
        self.cycles.store(cycles, Ordering::Relaxed);
    }

    fn grow(&self) {
        let cycles = self
            .cycles()
            .saturating_add(self.tuning.inc_step())
            .min(self.tuning.poll_max());
        self.cycles.store(cycles, Ordering::Relaxed);
    }

    /// Feed the outcome of a batch. `found` is set when at least one cqe was
    /// consumed, `drained` when the ring ran dry before the batch filled.
    pub fn on_batch(&self, found: bool, drained: bool) {
        match self.mode {
            Mlx5StallMode::NoStall => {}
            Mlx5StallMode::Adaptive => {
                if !found {
                    self.shrink();
                    self.last_count.store(get_cycles(), Ordering::Relaxed);
                } else if drained {
                    self.grow();
                    self.last_count.store(get_cycles(), Ordering::Relaxed);
                } else {
                    self.shrink();
                    self.last_count.store(0, Ordering::Relaxed);
                }
            }
            Mlx5StallMode::Stall => {
                if drained {
                    self.next_poll.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// Decode failure, the next poll runs without delay
    pub fn on_error(&self) {
        if self.mode == Mlx5StallMode::Adaptive {
            self.shrink();
            self.last_count.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_tuning_default() {
        let tuning = Mlx5StallTuning::default();
        assert_eq!(tuning.num_loop(), 60);
        assert_eq!(tuning.poll_min(), 60);
        assert_eq!(tuning.poll_max(), 100000);
        assert_eq!(tuning.inc_step(), 100);
        assert_eq!(tuning.dec_step(), 10);
    }

    #[test]
    fn check_adaptive_feedback() {
        let stall = Mlx5Stall::new(Mlx5StallMode::Adaptive, Arc::default());
        assert_eq!(stall.cycles(), 60);
        // partial batch grows the budget and arms the delay
        stall.on_batch(true, true);
        assert_eq!(stall.cycles(), 160);
        assert_ne!(stall.last_count(), 0);
        // full batch shrinks and disarms
        stall.on_batch(true, false);
        assert_eq!(stall.cycles(), 150);
        assert_eq!(stall.last_count(), 0);
        // empty batch shrinks but arms
        stall.on_batch(false, true);
        assert_eq!(stall.cycles(), 140);
        assert_ne!(stall.last_count(), 0);
        stall.pre_poll();
        stall.on_error();
        assert_eq!(stall.cycles(), 130);
        assert_eq!(stall.last_count(), 0);
    }

    #[test]
    fn check_adaptive_bounds() {
        let tuning = Arc::new(Mlx5StallTuning::default());
        tuning.set_poll_max(250);
        let stall = Mlx5Stall::new(Mlx5StallMode::Adaptive, tuning.clone());
        for _ in 0..10 {
            stall.on_batch(true, true);
        }
        assert_eq!(stall.cycles(), 250);
        for _ in 0..100 {
            stall.on_batch(true, false);
        }
        assert_eq!(stall.cycles(), 60);
        // live retune applies on the next update
        tuning.set_poll_min(100);
        stall.on_batch(false, true);
        assert_eq!(stall.cycles(), 100);
    }

    #[test]
    fn check_fixed_stall() {
        let stall = Mlx5Stall::new(Mlx5StallMode::Stall, Arc::default());
        stall.on_batch(true, false);
        assert!(!stall.next_poll());
        stall.on_batch(false, true);
        assert!(stall.next_poll());
        stall.pre_poll();
        assert!(!stall.next_poll());
        assert_eq!(stall.cycles(), 60);
    }

    #[test]
    fn check_no_stall_is_inert() {
        let stall = Mlx5Stall::new(Mlx5StallMode::NoStall, Arc::default());
        stall.on_batch(false, true);
        stall.on_error();
        stall.pre_poll();
        assert_eq!(stall.cycles(), 60);
        assert_eq!(stall.last_count(), 0);
        assert!(!stall.next_poll());
    }
}
