//! High-level emulation of the IOS inter-processor communication kernel.
//!
//! Guest software on the main CPU talks to IOS through 0x40-byte command blocks ("mailboxes")
//! in shared memory. This crate decodes those blocks, routes them to emulated devices through a
//! descriptor table, and schedules replies on a virtual clock so that reply timing and order are
//! deterministic.
//!
//! The entry point for embedders is [`Ios`], which owns guest memory, the event queue and the one
//! live [`Kernel`]. Reloading into a different IOS title replaces the kernel wholesale.

#![forbid(unsafe_code)]

pub mod boot;
pub mod config;
pub mod device;
pub mod fdtable;
pub mod fs;
pub mod iosc;
pub mod ipc;
pub mod kernel;
pub mod mailbox;
pub mod registry;
mod state;
pub mod system;

pub use boot::{BootError, BootRequest, BootState, GuestCpu, ProgramLoader};
pub use config::{ConfigError, IosConfig, IpcTimings};
pub use device::{Device, DeviceBase, DeviceContext, DeviceKind};
pub use fdtable::{DescriptorTable, Fd, FixedFd, IPC_MAX_FDS};
pub use ipc::{IpcCommand, IpcReply, OpenMode, Request};
pub use kernel::{Credentials, Kernel};
pub use mailbox::{IpcInterface, Mailbox, MailboxEvent};
pub use registry::{DeviceId, DeviceRegistry};
pub use system::{Ios, IosEvent};
