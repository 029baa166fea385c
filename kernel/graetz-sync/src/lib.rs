//! # Kernel Synchronization Primitives
//!
//! The address-space manager itself defines a single-writer contract; the
//! [`SpinLock`] here is what the surrounding kernel wraps the kernel
//! address-space singleton in so that contract holds once more than one
//! CPU exists.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
