//! `/dev/fs`: the NAND filesystem front end.
//!
//! Opening `/dev/fs` yields a manager handle for namespace operations. Opening any other
//! absolute path (routed here by the kernel) yields a file handle. Handles are keyed by the
//! descriptor they were opened on.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use ios_snapshot::{ReadLeExt, SnapshotError, WriteLeExt};
use tracing::{debug, warn};

use super::{write_guest_buffer, Device, DeviceBase, DeviceContext};
use crate::fs::{FsError, NandStats, NodeKind, Owner, SharedFileSystem, MAX_FILE_SIZE};
use crate::ipc::{
    IoctlRequest, IpcReply, OpenMode, OpenRequest, ReadWriteRequest, SeekMode, SeekRequest,
    FS_EACCESS, FS_EINVAL, IPC_SUCCESS,
};

pub const DEVICE_NAME: &str = "/dev/fs";

pub const IOCTL_GET_STATS: u32 = 0x02;
pub const IOCTL_CREATE_DIR: u32 = 0x03;
pub const IOCTL_DELETE: u32 = 0x07;
pub const IOCTL_RENAME: u32 = 0x08;
pub const IOCTL_CREATE_FILE: u32 = 0x09;
pub const IOCTL_GET_FILE_STATS: u32 = 0x0B;

/// Size of a path field in ioctl buffers.
const PATH_FIELD: u32 = 0x40;
/// Attribute block for create ioctls: owner uid, gid, path, permissions, attribute.
const ATTR_PATH_OFFSET: u32 = 6;
const ATTR_BLOCK_SIZE: u32 = 0x4C;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Handle {
    Manager,
    File {
        path: String,
        mode: OpenMode,
        position: u32,
    },
}

pub struct FsDevice {
    base: DeviceBase,
    fs: SharedFileSystem,
    handles: BTreeMap<u32, Handle>,
}

impl FsDevice {
    pub fn new(fs: SharedFileSystem) -> Self {
        Self {
            base: DeviceBase::new(DEVICE_NAME),
            fs,
            handles: BTreeMap::new(),
        }
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn fs_result(result: Result<(), FsError>) -> IpcReply {
        match result {
            Ok(()) => IpcReply::success(),
            Err(err) => {
                debug!(%err, "fs operation failed");
                IpcReply::new(err.code())
            }
        }
    }

    fn manager_ioctl(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlRequest) -> IpcReply {
        let creds = ctx.credentials();
        let owner = Owner {
            uid: creds.uid,
            gid: creds.gid,
        };
        match request.command {
            IOCTL_GET_STATS => {
                if (request.buffer_out_size as usize) < NandStats::ENCODED_LEN {
                    return IpcReply::new(FS_EINVAL);
                }
                let stats = self.fs.borrow().stats();
                write_guest_buffer(
                    ctx.memory,
                    request.buffer_out,
                    request.buffer_out_size,
                    &stats.to_be_bytes(),
                );
                IpcReply::success()
            }
            IOCTL_CREATE_DIR | IOCTL_CREATE_FILE => {
                if request.buffer_in_size < ATTR_BLOCK_SIZE {
                    return IpcReply::new(FS_EINVAL);
                }
                let path = ctx
                    .memory
                    .read_cstring(request.buffer_in.wrapping_add(ATTR_PATH_OFFSET), PATH_FIELD as usize);
                let mut fs = self.fs.borrow_mut();
                let result = if request.command == IOCTL_CREATE_DIR {
                    fs.create_directory(&path, owner)
                } else {
                    fs.create_file(&path, owner)
                };
                Self::fs_result(result)
            }
            IOCTL_DELETE => {
                if request.buffer_in_size < PATH_FIELD {
                    return IpcReply::new(FS_EINVAL);
                }
                let path = ctx.memory.read_cstring(request.buffer_in, PATH_FIELD as usize);
                Self::fs_result(self.fs.borrow_mut().delete(&path))
            }
            IOCTL_RENAME => {
                if request.buffer_in_size < PATH_FIELD * 2 {
                    return IpcReply::new(FS_EINVAL);
                }
                let from = ctx.memory.read_cstring(request.buffer_in, PATH_FIELD as usize);
                let to = ctx
                    .memory
                    .read_cstring(request.buffer_in.wrapping_add(PATH_FIELD), PATH_FIELD as usize);
                let result = self.fs.borrow_mut().rename(&from, &to);
                if result.is_ok() {
                    self.retarget_handles(&from, &to);
                }
                Self::fs_result(result)
            }
            other => {
                warn!(command = other, "unknown fs manager ioctl");
                IpcReply::new(FS_EINVAL)
            }
        }
    }

    fn retarget_handles(&mut self, from: &str, to: &str) {
        for handle in self.handles.values_mut() {
            if let Handle::File { path, .. } = handle {
                if path == from {
                    *path = to.to_string();
                }
            }
        }
    }

    fn file_handle(&mut self, fd: u32) -> Result<(&str, OpenMode, &mut u32), IpcReply> {
        match self.handles.get_mut(&fd) {
            Some(Handle::File {
                path,
                mode,
                position,
            }) => Ok((path.as_str(), *mode, position)),
            _ => Err(IpcReply::new(FS_EINVAL)),
        }
    }
}

impl Device for FsDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn open(&mut self, _ctx: &mut DeviceContext<'_>, request: &OpenRequest) -> Option<IpcReply> {
        let handle = if request.path == DEVICE_NAME {
            Handle::Manager
        } else {
            match self.fs.borrow().metadata(&request.path) {
                Ok(meta) if meta.kind == NodeKind::File => Handle::File {
                    path: request.path.clone(),
                    mode: request.mode,
                    position: 0,
                },
                Ok(_) => return Some(IpcReply::new(FS_EACCESS)),
                Err(err) => return Some(IpcReply::new(err.code())),
            }
        };
        self.handles.insert(request.request.fd, handle);
        self.base.set_active(true);
        Some(IpcReply::success())
    }

    fn close(&mut self, _ctx: &mut DeviceContext<'_>, fd: u32) -> Option<IpcReply> {
        self.handles.remove(&fd);
        self.base.set_active(!self.handles.is_empty());
        Some(IpcReply::success())
    }

    fn seek(&mut self, _ctx: &mut DeviceContext<'_>, request: &SeekRequest) -> Option<IpcReply> {
        let fs = self.fs.clone();
        let (path, _, position) = match self.file_handle(request.request.fd) {
            Ok(h) => h,
            Err(reply) => return Some(reply),
        };
        let size = match fs.borrow().metadata(path) {
            Ok(meta) => i64::from(meta.size),
            Err(err) => return Some(IpcReply::new(err.code())),
        };
        let offset = i64::from(request.offset as i32);
        let target = match request.seek_mode() {
            Some(SeekMode::Set) => i64::from(request.offset),
            Some(SeekMode::Current) => i64::from(*position) + offset,
            Some(SeekMode::End) => size + offset,
            None => return Some(IpcReply::new(FS_EINVAL)),
        };
        if !(0..=size).contains(&target) {
            return Some(IpcReply::new(FS_EINVAL));
        }
        *position = target as u32;
        Some(IpcReply::new(target as i32))
    }

    fn read(&mut self, ctx: &mut DeviceContext<'_>, request: &ReadWriteRequest) -> Option<IpcReply> {
        let fs = self.fs.clone();
        let (path, mode, position) = match self.file_handle(request.request.fd) {
            Ok(h) => h,
            Err(reply) => return Some(reply),
        };
        if !mode.contains(OpenMode::READ) {
            return Some(IpcReply::new(FS_EACCESS));
        }
        if request.size as usize > MAX_FILE_SIZE {
            warn!(size = request.size, "read larger than any file");
            return Some(IpcReply::new(FS_EINVAL));
        }
        let mut buf = vec![0u8; request.size as usize];
        let read = match fs.borrow().read_at(path, *position, &mut buf) {
            Ok(n) => n,
            Err(err) => return Some(IpcReply::new(err.code())),
        };
        ctx.memory.copy_in(request.buffer, &buf[..read]);
        *position += read as u32;
        Some(IpcReply::new(read as i32))
    }

    fn write(&mut self, ctx: &mut DeviceContext<'_>, request: &ReadWriteRequest) -> Option<IpcReply> {
        let fs = self.fs.clone();
        let (path, mode, position) = match self.file_handle(request.request.fd) {
            Ok(h) => h,
            Err(reply) => return Some(reply),
        };
        if !mode.contains(OpenMode::WRITE) {
            return Some(IpcReply::new(FS_EACCESS));
        }
        if request.size as usize > MAX_FILE_SIZE {
            warn!(size = request.size, "write larger than any file");
            return Some(IpcReply::new(FS_EINVAL));
        }
        let data = ctx.memory.copy_out(request.buffer, request.size as usize);
        let written = match fs.borrow_mut().write_at(path, *position, &data) {
            Ok(n) => n,
            Err(err) => return Some(IpcReply::new(err.code())),
        };
        *position += written as u32;
        Some(IpcReply::new(written as i32))
    }

    fn ioctl(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlRequest) -> Option<IpcReply> {
        if matches!(self.handles.get(&request.request.fd), Some(Handle::Manager)) {
            return Some(self.manager_ioctl(ctx, request));
        }
        let reply = match self.handles.get(&request.request.fd) {
            Some(Handle::File { path, position, .. }) if request.command == IOCTL_GET_FILE_STATS => {
                if request.buffer_out_size < 8 {
                    return Some(IpcReply::new(FS_EINVAL));
                }
                let size = match self.fs.borrow().metadata(path) {
                    Ok(meta) => meta.size,
                    Err(err) => return Some(IpcReply::new(err.code())),
                };
                ctx.memory.write_u32(request.buffer_out, size);
                ctx.memory.write_u32(request.buffer_out.wrapping_add(4), *position);
                IpcReply::new(IPC_SUCCESS)
            }
            _ => IpcReply::new(FS_EINVAL),
        };
        Some(reply)
    }

    fn save_state(&self, w: &mut dyn Write) -> ios_snapshot::Result<()> {
        self.base.save_state(w)?;
        w.write_count_u32(self.handles.len())?;
        for (fd, handle) in &self.handles {
            w.write_u32_le(*fd)?;
            match handle {
                Handle::Manager => w.write_u8(0)?,
                Handle::File {
                    path,
                    mode,
                    position,
                } => {
                    w.write_u8(1)?;
                    w.write_string_u32(path)?;
                    w.write_u32_le(mode.bits())?;
                    w.write_u32_le(*position)?;
                }
            }
        }
        Ok(())
    }

    fn load_state(&mut self, r: &mut dyn Read) -> ios_snapshot::Result<()> {
        self.base.load_state(r)?;
        let count = r.read_u32_le()?;
        let mut handles = BTreeMap::new();
        for _ in 0..count {
            let fd = r.read_u32_le()?;
            let handle = match r.read_u8()? {
                0 => Handle::Manager,
                1 => Handle::File {
                    path: r.read_string_u32()?,
                    mode: OpenMode::from_bits_truncate(r.read_u32_le()?),
                    position: r.read_u32_le()?,
                },
                _ => return Err(SnapshotError::Corrupt("invalid fs handle tag")),
            };
            handles.insert(fd, handle);
        }
        self.handles = handles;
        Ok(())
    }
}
