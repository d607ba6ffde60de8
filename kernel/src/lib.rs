//! Demand-paged virtual memory for KidneyOS user processes.
//!
//! See [`vm`] for the paging core and [`mem::user`] for syscall access to
//! user memory.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod system;
pub mod vm;

pub use system::{VmConfig, VmSystem};
