//! # Kernel Build Information
//!
//! Shared constants describing how the kernel image is laid out in physical
//! and virtual memory. The values mirror the linker script and are the single
//! source of truth for both: the kernel's `build.rs` feeds them to the linker,
//! and the address-space manager consumes them at run time.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod layout;

pub use layout::*;

/// Opaque boot-data blob handed over by the bootloader.
///
/// The address-space manager carries this pointer through bootstrap without
/// interpreting it; the bootloader parser (outside this workspace) does.
pub type BootDataPtr = *const core::ffi::c_void;
