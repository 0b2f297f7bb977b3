//! Userspace completion queue engine for mlx5 devices.
//!
//! The device writes completion entries into a ring owned by the CQ, software
//! decodes them into work completions and publishes its consumer index
//! through a doorbell record.

#[macro_use]
mod mlx5_barrier;

pub mod mlx5_buf;
pub mod mlx5_comp;
pub mod mlx5_context;
pub mod mlx5_cq;
pub mod mlx5_cqe;
pub mod mlx5_err;
pub mod mlx5_mr;
pub mod mlx5_poll;
pub mod mlx5_qp;
pub mod mlx5_rsc;
pub mod mlx5_srq;
pub mod mlx5_stall;
pub mod mlx5_tm;
pub mod mlx5_verbs;
