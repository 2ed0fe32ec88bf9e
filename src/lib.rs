// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! EL3 exception handling framework for RF-A.
//!
//! Lets EL3 delegate the handling of exceptions to lower ELs while keeping track of the EL3
//! priority levels active on each core, so that exceptions of equal or lower priority can't
//! preempt the delegated handling. See [`ehf::Ehf`].

#![cfg_attr(not(test), no_std)]

pub mod context;
pub mod debug;
pub mod ehf;
pub mod gicv3;
pub mod interrupt_mgmt;
pub mod logger;
pub mod priority;

/// Logs an error and then panics with the same message.
///
/// This is used for programming errors and platform misconfigurations, from which there is no
/// recovery.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::log::error!($($arg)+);
        ::core::panic!($($arg)+)
    }};
}
pub(crate) use fatal;
