//! IPC wire protocol: command kinds, return codes and request decoding.
//!
//! A command block lives at a guest "mailbox" address. All fields are 32-bit big-endian:
//!
//! ```text
//! 0x00  command
//! 0x04  return value         (written by IOS on reply)
//! 0x08  fd                   (IOS echoes the command here on reply)
//! 0x0C  arguments...
//! ```
//!
//! Decoding only ever reads guest memory and never fails: garbage in a command block turns into
//! garbage fields that the kernel or the device rejects with an error code.

use bitflags::bitflags;
use ios_mem::GuestMemory;
use tracing::warn;

pub const IPC_SUCCESS: i32 = 0;
pub const IPC_EACCES: i32 = -1;
pub const IPC_EEXIST: i32 = -2;
pub const IPC_EINVAL: i32 = -4;
pub const IPC_EMAX: i32 = -5;
pub const IPC_ENOENT: i32 = -6;
pub const IPC_EQUEUEFULL: i32 = -8;
pub const IPC_EIO: i32 = -12;
pub const IPC_ENOMEM: i32 = -22;

pub const FS_EINVAL: i32 = -101;
pub const FS_EACCESS: i32 = -102;
pub const FS_ECORRUPT: i32 = -103;
pub const FS_EEXIST: i32 = -105;
pub const FS_ENOENT: i32 = -106;
pub const FS_ENFILE: i32 = -107;
pub const FS_EFBIG: i32 = -108;
pub const FS_EFDEXHAUSTED: i32 = -109;
pub const FS_ENAMELEN: i32 = -110;
pub const FS_EDIREXHAUSTED: i32 = -111;
pub const FS_EDIRDEPTH: i32 = -116;
pub const FS_EBUSY: i32 = -118;

pub const ES_EINVAL: i32 = -1017;
pub const ES_UNKNOWN_TITLE: i32 = -1026;

/// Maximum path length IOS accepts in an open request, including the terminator.
pub const MAX_PATH_LEN: usize = 64;

/// Sanity bound on the number of vectors decoded from one IOCtlV.
pub const MAX_IOCTLV_VECTORS: u32 = 256;

/// Largest guest buffer a device stages on the host. Nothing bigger fits in one RAM bank.
pub const MAX_GUEST_BUFFER: u32 = ios_mem::MEM2_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IpcCommand {
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    Seek = 5,
    Ioctl = 6,
    Ioctlv = 7,
    Reply = 8,
}

impl IpcCommand {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Open,
            2 => Self::Close,
            3 => Self::Read,
            4 => Self::Write,
            5 => Self::Seek,
            6 => Self::Ioctl,
            7 => Self::Ioctlv,
            8 => Self::Reply,
            _ => return None,
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenMode: u32 {
        const READ = 1;
        const WRITE = 2;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SeekMode {
    Set = 0,
    Current = 1,
    End = 2,
}

impl SeekMode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Set,
            1 => Self::Current,
            2 => Self::End,
            _ => return None,
        })
    }
}

/// Result of a device operation as seen by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcReply {
    pub return_value: i32,
    /// Ticks between dispatch and the reply becoming visible. `None` means "use the configured
    /// default".
    pub delay: Option<u64>,
}

impl IpcReply {
    pub fn new(return_value: i32) -> Self {
        Self {
            return_value,
            delay: None,
        }
    }

    pub fn with_delay(return_value: i32, delay: u64) -> Self {
        Self {
            return_value,
            delay: Some(delay),
        }
    }

    pub fn success() -> Self {
        Self::new(IPC_SUCCESS)
    }

    /// Reply for commands a device does not implement.
    pub fn unsupported() -> Self {
        Self::new(IPC_EINVAL)
    }
}

/// The part of a command block common to every command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub address: u32,
    /// Raw command word; see [`Request::command`].
    pub command: u32,
    pub fd: u32,
}

impl Request {
    pub fn decode(memory: &mut dyn GuestMemory, address: u32) -> Self {
        Self {
            address,
            command: memory.read_u32(address),
            fd: memory.read_u32(address.wrapping_add(8)),
        }
    }

    pub fn command(&self) -> Option<IpcCommand> {
        IpcCommand::from_u32(self.command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub request: Request,
    pub path: String,
    pub mode: OpenMode,
    /// Credentials of the guest, attached by the kernel rather than read from the block.
    pub uid: u32,
    pub gid: u16,
}

impl OpenRequest {
    /// Decode an open block. `fd` is the descriptor the kernel reserved for this open; it
    /// replaces whatever the guest left in the fd field.
    pub fn decode(
        memory: &mut dyn GuestMemory,
        request: &Request,
        fd: u32,
        uid: u32,
        gid: u16,
    ) -> Self {
        let path_ptr = memory.read_u32(request.address.wrapping_add(0x0C));
        let mode = memory.read_u32(request.address.wrapping_add(0x10));
        Self {
            request: Request { fd, ..*request },
            path: memory.read_cstring(path_ptr, MAX_PATH_LEN),
            mode: OpenMode::from_bits_truncate(mode),
            uid,
            gid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWriteRequest {
    pub request: Request,
    pub buffer: u32,
    pub size: u32,
}

impl ReadWriteRequest {
    pub fn decode(memory: &mut dyn GuestMemory, request: &Request) -> Self {
        Self {
            request: *request,
            buffer: memory.read_u32(request.address.wrapping_add(0x0C)),
            size: memory.read_u32(request.address.wrapping_add(0x10)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRequest {
    pub request: Request,
    pub offset: u32,
    /// Raw origin; see [`SeekRequest::seek_mode`].
    pub mode: u32,
}

impl SeekRequest {
    pub fn decode(memory: &mut dyn GuestMemory, request: &Request) -> Self {
        Self {
            request: *request,
            offset: memory.read_u32(request.address.wrapping_add(0x0C)),
            mode: memory.read_u32(request.address.wrapping_add(0x10)),
        }
    }

    pub fn seek_mode(&self) -> Option<SeekMode> {
        SeekMode::from_u32(self.mode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoctlRequest {
    pub request: Request,
    pub command: u32,
    pub buffer_in: u32,
    pub buffer_in_size: u32,
    /// May also carry input for some commands.
    pub buffer_out: u32,
    pub buffer_out_size: u32,
}

impl IoctlRequest {
    pub fn decode(memory: &mut dyn GuestMemory, request: &Request) -> Self {
        let a = request.address;
        Self {
            request: *request,
            command: memory.read_u32(a.wrapping_add(0x0C)),
            buffer_in: memory.read_u32(a.wrapping_add(0x10)),
            buffer_in_size: memory.read_u32(a.wrapping_add(0x14)),
            buffer_out: memory.read_u32(a.wrapping_add(0x18)),
            buffer_out_size: memory.read_u32(a.wrapping_add(0x1C)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVector {
    pub address: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlvRequest {
    pub request: Request,
    pub command: u32,
    pub in_vectors: Vec<IoVector>,
    pub io_vectors: Vec<IoVector>,
}

impl IoctlvRequest {
    pub fn decode(memory: &mut dyn GuestMemory, request: &Request) -> Self {
        let a = request.address;
        let command = memory.read_u32(a.wrapping_add(0x0C));
        let mut in_count = memory.read_u32(a.wrapping_add(0x10));
        let mut io_count = memory.read_u32(a.wrapping_add(0x14));
        let table = memory.read_u32(a.wrapping_add(0x18));

        if in_count.saturating_add(io_count) > MAX_IOCTLV_VECTORS {
            warn!(
                address = a,
                in_count,
                io_count,
                "clamping oversized ioctlv vector counts"
            );
            in_count = in_count.min(MAX_IOCTLV_VECTORS);
            io_count = io_count.min(MAX_IOCTLV_VECTORS - in_count);
        }

        let mut read_vec = |index: u32| IoVector {
            address: memory.read_u32(table.wrapping_add(index * 8)),
            size: memory.read_u32(table.wrapping_add(index * 8 + 4)),
        };
        let in_vectors = (0..in_count).map(&mut read_vec).collect();
        let io_vectors = (in_count..in_count + io_count).map(&mut read_vec).collect();

        Self {
            request: *request,
            command,
            in_vectors,
            io_vectors,
        }
    }

    pub fn in_vector(&self, index: usize) -> Option<&IoVector> {
        self.in_vectors.get(index)
    }

    pub fn io_vector(&self, index: usize) -> Option<&IoVector> {
        self.io_vectors.get(index)
    }

    /// True when the request carries exactly `ins` input and `ios` in/out vectors.
    pub fn has_vectors(&self, ins: usize, ios: usize) -> bool {
        self.in_vectors.len() == ins && self.io_vectors.len() == ios
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ios_mem::GuestRam;
    use pretty_assertions::assert_eq;

    const MAILBOX: u32 = 0x8000_4000;

    #[test]
    fn decodes_open_block_with_kernel_credentials() {
        let mut ram = GuestRam::new();
        ram.copy_in(0x8000_5000, b"/dev/fs\0");
        ram.write_u32(MAILBOX, IpcCommand::Open as u32);
        ram.write_u32(MAILBOX + 8, 0xFFFF_FFFF);
        ram.write_u32(MAILBOX + 0x0C, 0x8000_5000);
        ram.write_u32(MAILBOX + 0x10, 3);

        let req = Request::decode(&mut ram, MAILBOX);
        assert_eq!(req.command(), Some(IpcCommand::Open));
        let open = OpenRequest::decode(&mut ram, &req, 2, 0x1000, 1);
        assert_eq!(open.path, "/dev/fs");
        assert_eq!(open.mode, OpenMode::READ_WRITE);
        assert_eq!(open.request.fd, 2);
        assert_eq!((open.uid, open.gid), (0x1000, 1));
    }

    #[test]
    fn decodes_ioctlv_vectors_inputs_first() {
        let mut ram = GuestRam::new();
        ram.write_u32(MAILBOX, IpcCommand::Ioctlv as u32);
        ram.write_u32(MAILBOX + 0x0C, 0x21);
        ram.write_u32(MAILBOX + 0x10, 1);
        ram.write_u32(MAILBOX + 0x14, 2);
        ram.write_u32(MAILBOX + 0x18, 0x8000_6000);
        for (i, (addr, size)) in [(0x100, 8), (0x200, 4), (0x300, 0x20)].iter().enumerate() {
            ram.write_u32(0x8000_6000 + i as u32 * 8, *addr);
            ram.write_u32(0x8000_6004 + i as u32 * 8, *size);
        }

        let req = Request::decode(&mut ram, MAILBOX);
        let v = IoctlvRequest::decode(&mut ram, &req);
        assert_eq!(v.command, 0x21);
        assert!(v.has_vectors(1, 2));
        assert_eq!(v.in_vector(0), Some(&IoVector { address: 0x100, size: 8 }));
        assert_eq!(v.io_vector(1), Some(&IoVector { address: 0x300, size: 0x20 }));
        assert_eq!(v.io_vector(2), None);
    }

    #[test]
    fn absurd_vector_counts_are_clamped() {
        let mut ram = GuestRam::new();
        ram.write_u32(MAILBOX, IpcCommand::Ioctlv as u32);
        ram.write_u32(MAILBOX + 0x10, 0xFFFF_FFFF);
        ram.write_u32(MAILBOX + 0x14, 0xFFFF_FFFF);
        let req = Request::decode(&mut ram, MAILBOX);
        let v = IoctlvRequest::decode(&mut ram, &req);
        assert_eq!(v.in_vectors.len() + v.io_vectors.len(), MAX_IOCTLV_VECTORS as usize);
    }

    #[test]
    fn unknown_command_decodes_without_kind() {
        let mut ram = GuestRam::new();
        ram.write_u32(MAILBOX, 0x42);
        assert_eq!(Request::decode(&mut ram, MAILBOX).command(), None);
    }
}
