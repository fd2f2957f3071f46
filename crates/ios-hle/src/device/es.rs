//! `/dev/es`: the eTicket service.
//!
//! Only the title-context subset is modelled: identifying the console, launching titles and
//! switching the guest's uid.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use ios_snapshot::{ReadLeExt, SnapshotError, WriteLeExt};
use tracing::{info, warn};

use super::{Device, DeviceBase, DeviceContext};
use crate::boot::{titles, BootRequest};
use crate::iosc::SharedKeyStore;
use crate::ipc::{IoctlvRequest, IpcReply, ES_EINVAL, ES_UNKNOWN_TITLE};

pub const DEVICE_NAME: &str = "/dev/es";

pub const IOCTLV_GET_DEVICE_ID: u32 = 0x07;
pub const IOCTLV_LAUNCH: u32 = 0x08;
pub const IOCTLV_GET_TITLE_ID: u32 = 0x20;
pub const IOCTLV_SET_UID: u32 = 0x21;

/// First uid handed out to non-system titles.
const FIRST_TITLE_UID: u32 = 0x1000;
const SYSTEM_MENU_UID: u32 = 0x1000;
const TITLE_GID: u16 = 0x0001;
const MAX_UID_ENTRIES: u32 = 0x1000;

pub struct EsDevice {
    base: DeviceBase,
    iosc: SharedKeyStore,
    active_title: u64,
    uids: BTreeMap<u64, u32>,
}

impl EsDevice {
    pub fn new(iosc: SharedKeyStore) -> Self {
        let mut uids = BTreeMap::new();
        uids.insert(titles::SYSTEM_MENU, SYSTEM_MENU_UID);
        Self {
            base: DeviceBase::new(DEVICE_NAME),
            iosc,
            active_title: titles::SYSTEM_MENU,
            uids,
        }
    }

    /// Title the guest CPU is currently running.
    pub fn active_title(&self) -> u64 {
        self.active_title
    }

    /// The uid assigned to `title_id`, allocating one if there is room.
    fn uid_for(&mut self, title_id: u64) -> Option<u32> {
        if let Some(uid) = self.uids.get(&title_id) {
            return Some(*uid);
        }
        if self.uids.len() >= MAX_UID_ENTRIES as usize {
            warn!(title_id, "ES uid table full");
            return None;
        }
        let uid = FIRST_TITLE_UID + self.uids.len() as u32;
        self.uids.insert(title_id, uid);
        Some(uid)
    }

    fn read_title_id(ctx: &mut DeviceContext<'_>, request: &IoctlvRequest) -> Option<u64> {
        let v = request.in_vector(0)?;
        (v.size == 8).then(|| ctx.memory.read_u64(v.address))
    }

    fn launch(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlvRequest) -> Option<IpcReply> {
        let Some(title_id) = Self::read_title_id(ctx, request) else {
            return Some(IpcReply::new(ES_EINVAL));
        };
        let target = match title_id {
            titles::BC | titles::MIOS => titles::MIOS,
            t if titles::is_ios(t) => t,
            t => {
                warn!(title_id = t, "launching non-IOS titles is not supported");
                return Some(IpcReply::new(ES_UNKNOWN_TITLE));
            }
        };
        info!(title_id, target, "ES launch requested reload");
        let mut boot = BootRequest::new(target);
        if target != titles::MIOS {
            boot.acknowledge = Some(request.request.address);
        }
        ctx.request_boot(boot);
        // The reload discards this request. It is acknowledged by the new kernel, never answered.
        None
    }
}

impl Device for EsDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn ioctlv(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlvRequest) -> Option<IpcReply> {
        let reply = match request.command {
            IOCTLV_GET_DEVICE_ID => match request.io_vector(0) {
                Some(out) if request.has_vectors(0, 1) && out.size >= 4 => {
                    let id = self.iosc.borrow().console_id();
                    ctx.memory.write_u32(out.address, id);
                    IpcReply::success()
                }
                _ => IpcReply::new(ES_EINVAL),
            },
            IOCTLV_LAUNCH => return self.launch(ctx, request),
            IOCTLV_GET_TITLE_ID => match request.io_vector(0) {
                Some(out) if request.has_vectors(0, 1) && out.size >= 8 => {
                    ctx.memory.write_u64(out.address, self.active_title);
                    IpcReply::success()
                }
                _ => IpcReply::new(ES_EINVAL),
            },
            IOCTLV_SET_UID => {
                if !request.has_vectors(1, 0) {
                    return Some(IpcReply::new(ES_EINVAL));
                }
                let Some(title_id) = Self::read_title_id(ctx, request) else {
                    return Some(IpcReply::new(ES_EINVAL));
                };
                let Some(uid) = self.uid_for(title_id) else {
                    return Some(IpcReply::new(ES_EINVAL));
                };
                ctx.set_uid(uid);
                ctx.set_gid(TITLE_GID);
                self.active_title = title_id;
                info!(title_id, uid, "ES set uid");
                IpcReply::success()
            }
            other => {
                warn!(command = other, "unsupported ES ioctlv");
                IpcReply::unsupported()
            }
        };
        Some(reply)
    }

    fn save_state(&self, w: &mut dyn Write) -> ios_snapshot::Result<()> {
        self.base.save_state(w)?;
        w.write_u64_le(self.active_title)?;
        w.write_count_u32(self.uids.len())?;
        for (title, uid) in &self.uids {
            w.write_u64_le(*title)?;
            w.write_u32_le(*uid)?;
        }
        Ok(())
    }

    fn load_state(&mut self, r: &mut dyn Read) -> ios_snapshot::Result<()> {
        self.base.load_state(r)?;
        self.active_title = r.read_u64_le()?;
        let count = r.read_u32_le()?;
        if count > MAX_UID_ENTRIES {
            return Err(SnapshotError::Corrupt("too many ES uid entries"));
        }
        let mut uids = BTreeMap::new();
        for _ in 0..count {
            let title = r.read_u64_le()?;
            uids.insert(title, r.read_u32_le()?);
        }
        self.uids = uids;
        Ok(())
    }
}
