//! Guest memory access for the IOS IPC core.
//!
//! The main CPU and the IOS coprocessor share two physical RAM banks: MEM1 (24 MiB at physical
//! `0x0000_0000`) and MEM2 (64 MiB at physical `0x1000_0000`). Guest software usually hands IOS
//! *effective* addresses (`0x8xxx_xxxx` cached / `0xCxxx_xxxx` uncached mirrors), so every access
//! goes through [`translate`] first.
//!
//! All multi-byte accesses are big-endian, matching the guest CPU.

#![forbid(unsafe_code)]

mod bus;
mod ram;

pub use bus::GuestMemory;
pub use ram::{translate, GuestRam, MEM1_BASE, MEM1_SIZE, MEM2_BASE, MEM2_SIZE};
