#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod bitmap;
pub mod logger;
pub mod macros;
pub mod mem;
pub mod paging;
#[cfg(target_os = "none")]
pub mod serial;
pub mod sizes;
