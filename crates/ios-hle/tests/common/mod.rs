//! Guest-side helpers for `ios-hle` integration tests: build command blocks in guest RAM, ring
//! the doorbell and read replies back.

#![allow(dead_code)]

use ios_hle::ipc::IpcCommand;
use ios_hle::{Ios, IosConfig, MailboxEvent};
use ios_mem::GuestMemory;

/// Command blocks are carved from here, 0x40 bytes apiece.
const BLOCK_BASE: u32 = 0x8010_0000;
/// Paths and buffers.
const DATA_BASE: u32 = 0x8020_0000;

/// Long enough for any reply or reload to land.
pub const SETTLE_TICKS: u64 = 40_000_000;

/// Route `tracing` output through the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Guest {
    pub ios: Ios,
    next_block: u32,
    next_data: u32,
}

impl Guest {
    pub fn new() -> Self {
        Self::with_config(IosConfig::default())
    }

    pub fn with_config(config: IosConfig) -> Self {
        init_tracing();
        Self {
            ios: Ios::new(config),
            next_block: BLOCK_BASE,
            next_data: DATA_BASE,
        }
    }

    pub fn mem(&mut self) -> &mut dyn GuestMemory {
        self.ios.memory()
    }

    fn block(&mut self, command: IpcCommand, fd: u32) -> u32 {
        let address = self.next_block;
        self.next_block += 0x40;
        let mem = self.mem();
        mem.fill(address, 0x40, 0);
        mem.write_u32(address, command as u32);
        mem.write_u32(address + 8, fd);
        address
    }

    /// Reserve `len` bytes of zeroed guest memory.
    pub fn alloc(&mut self, len: u32) -> u32 {
        let address = self.next_data;
        self.next_data += (len + 0x1F) & !0x1F;
        self.mem().fill(address, len as usize, 0);
        address
    }

    pub fn alloc_bytes(&mut self, data: &[u8]) -> u32 {
        let address = self.alloc(data.len() as u32);
        self.mem().copy_in(address, data);
        address
    }

    pub fn submit_open(&mut self, path: &str, mode: u32) -> u32 {
        let mut bytes = path.as_bytes().to_vec();
        bytes.push(0);
        let path_ptr = self.alloc_bytes(&bytes);
        let block = self.block(IpcCommand::Open, 0);
        let mem = self.mem();
        mem.write_u32(block + 0x0C, path_ptr);
        mem.write_u32(block + 0x10, mode);
        self.ios.enqueue_request(block);
        block
    }

    pub fn submit_close(&mut self, fd: u32) -> u32 {
        let block = self.block(IpcCommand::Close, fd);
        self.ios.enqueue_request(block);
        block
    }

    pub fn submit_raw(&mut self, command: u32, fd: u32) -> u32 {
        let block = self.block(IpcCommand::Close, fd);
        self.mem().write_u32(block, command);
        self.ios.enqueue_request(block);
        block
    }

    /// Read or Write with a guest-chosen `size`, which need not match any real buffer.
    pub fn submit_read_write(&mut self, command: IpcCommand, fd: u32, buffer: u32, size: u32) -> u32 {
        let block = self.block(command, fd);
        let mem = self.mem();
        mem.write_u32(block + 0x0C, buffer);
        mem.write_u32(block + 0x10, size);
        self.ios.enqueue_request(block);
        block
    }

    pub fn submit_ioctl(&mut self, fd: u32, command: u32, input: (u32, u32), output: (u32, u32)) -> u32 {
        let block = self.block(IpcCommand::Ioctl, fd);
        let mem = self.mem();
        mem.write_u32(block + 0x0C, command);
        mem.write_u32(block + 0x10, input.0);
        mem.write_u32(block + 0x14, input.1);
        mem.write_u32(block + 0x18, output.0);
        mem.write_u32(block + 0x1C, output.1);
        self.ios.enqueue_request(block);
        block
    }

    pub fn submit_ioctlv(&mut self, fd: u32, command: u32, ins: &[(u32, u32)], ios: &[(u32, u32)]) -> u32 {
        let table = self.alloc(((ins.len() + ios.len()) * 8) as u32);
        for (i, (address, size)) in ins.iter().chain(ios).enumerate() {
            let entry = table + (i as u32) * 8;
            self.mem().write_u32(entry, *address);
            self.mem().write_u32(entry + 4, *size);
        }
        let block = self.block(IpcCommand::Ioctlv, fd);
        let mem = self.mem();
        mem.write_u32(block + 0x0C, command);
        mem.write_u32(block + 0x10, ins.len() as u32);
        mem.write_u32(block + 0x14, ios.len() as u32);
        mem.write_u32(block + 0x18, table);
        self.ios.enqueue_request(block);
        block
    }

    /// The reply code written to `block`, if IOS has answered it.
    pub fn result(&mut self, block: u32) -> Option<i32> {
        let mem = self.mem();
        (mem.read_u32(block) == IpcCommand::Reply as u32).then(|| mem.read_u32(block + 4) as i32)
    }

    pub fn settle(&mut self) {
        self.ios.run_for(SETTLE_TICKS);
    }

    /// Submit through `submit`, run until everything lands and return the reply code.
    pub fn call(&mut self, submit: impl FnOnce(&mut Self) -> u32) -> i32 {
        let block = submit(self);
        self.settle();
        self.result(block).unwrap_or_else(|| panic!("block {block:#x} was never answered"))
    }

    pub fn open(&mut self, path: &str) -> i32 {
        self.call(|g| g.submit_open(path, 3))
    }

    pub fn close(&mut self, fd: i32) -> i32 {
        self.call(|g| g.submit_close(fd as u32))
    }

    /// Replied block addresses in the order the guest saw their interrupts.
    pub fn replies(&self) -> Vec<u32> {
        self.ios
            .mailbox()
            .history()
            .filter_map(|e| match e {
                MailboxEvent::Reply(address) => Some(*address),
                MailboxEvent::Ack(_) => None,
            })
            .collect()
    }

    pub fn acks(&self) -> Vec<u32> {
        self.ios
            .mailbox()
            .history()
            .filter_map(|e| match e {
                MailboxEvent::Ack(address) => Some(*address),
                MailboxEvent::Reply(_) => None,
            })
            .collect()
    }
}
