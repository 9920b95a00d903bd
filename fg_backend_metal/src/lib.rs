//! Metal GPU Backend for fg_tensor (macOS only).
//!
//! Kernels are compiled once from Metal Shading Language source and dispatched
//! on a command queue; results are read back from shared-memory buffers after
//! each command buffer completes. On other platforms the crate is empty.

#[cfg(target_os = "macos")]
mod metal_impl;

#[cfg(target_os = "macos")]
pub use metal_impl::*;
