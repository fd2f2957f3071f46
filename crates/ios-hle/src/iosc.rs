//! IOSC: the kernel's key store.
//!
//! Keys live in numbered handles. A handful of handles are pre-populated with console keys; the
//! rest are allocated on demand by ES and the crypto devices.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::rc::Rc;

use ios_snapshot::{expect_marker, write_marker, ReadLeExt, SnapshotError, WriteLeExt};
use thiserror::Error;

use crate::ipc::{ES_EINVAL, IPC_EACCES, IPC_EINVAL};

pub type SharedKeyStore = Rc<RefCell<Iosc>>;

pub const HANDLE_CONSOLE_KEY: u32 = 0;
pub const HANDLE_CONSOLE_ID: u32 = 1;
pub const HANDLE_COMMON_KEY: u32 = 4;
pub const HANDLE_SD_KEY: u32 = 5;
const FIRST_USER_HANDLE: u32 = 0x10;
const MAX_HANDLES: usize = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    SecretKey,
    PublicKey,
    Data,
}

impl ObjectType {
    fn to_u8(self) -> u8 {
        match self {
            Self::SecretKey => 0,
            Self::PublicKey => 1,
            Self::Data => 3,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::SecretKey),
            1 => Some(Self::PublicKey),
            3 => Some(Self::Data),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IoscError {
    #[error("invalid key handle {0}")]
    InvalidHandle(u32),
    #[error("key handle {0} is reserved")]
    Reserved(u32),
    #[error("no free key handles")]
    Exhausted,
    #[error("key handle {handle} holds {found:?}, expected {expected:?}")]
    WrongType {
        handle: u32,
        expected: ObjectType,
        found: ObjectType,
    },
}

impl IoscError {
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidHandle(_) | Self::WrongType { .. } => IPC_EINVAL,
            Self::Reserved(_) => IPC_EACCES,
            Self::Exhausted => ES_EINVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyEntry {
    object_type: ObjectType,
    data: Vec<u8>,
    owner_mask: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iosc {
    console_id: u32,
    keys: BTreeMap<u32, KeyEntry>,
}

impl Iosc {
    pub fn new(console_id: u32) -> Self {
        let mut keys = BTreeMap::new();
        let system = |object_type, data: Vec<u8>| KeyEntry {
            object_type,
            data,
            owner_mask: 0,
        };
        keys.insert(
            HANDLE_CONSOLE_KEY,
            system(ObjectType::SecretKey, derive_key(console_id, 0x30)),
        );
        keys.insert(
            HANDLE_CONSOLE_ID,
            system(ObjectType::Data, console_id.to_be_bytes().to_vec()),
        );
        keys.insert(
            HANDLE_COMMON_KEY,
            system(ObjectType::SecretKey, derive_key(0, 0x10)),
        );
        keys.insert(
            HANDLE_SD_KEY,
            system(ObjectType::SecretKey, derive_key(0x5344, 0x10)),
        );
        Self { console_id, keys }
    }

    pub fn into_shared(self) -> SharedKeyStore {
        Rc::new(RefCell::new(self))
    }

    pub fn console_id(&self) -> u32 {
        self.console_id
    }

    pub fn create_object(&mut self, object_type: ObjectType, owner_mask: u32) -> Result<u32, IoscError> {
        if self.keys.len() >= MAX_HANDLES {
            return Err(IoscError::Exhausted);
        }
        let handle = (FIRST_USER_HANDLE..)
            .find(|h| !self.keys.contains_key(h))
            .ok_or(IoscError::Exhausted)?;
        self.keys.insert(
            handle,
            KeyEntry {
                object_type,
                data: Vec::new(),
                owner_mask,
            },
        );
        Ok(handle)
    }

    pub fn import_secret_key(&mut self, handle: u32, key: &[u8]) -> Result<(), IoscError> {
        let entry = self.user_entry_mut(handle)?;
        if entry.object_type != ObjectType::SecretKey {
            return Err(IoscError::WrongType {
                handle,
                expected: ObjectType::SecretKey,
                found: entry.object_type,
            });
        }
        entry.data = key.to_vec();
        Ok(())
    }

    pub fn delete_object(&mut self, handle: u32) -> Result<(), IoscError> {
        self.user_entry_mut(handle)?;
        self.keys.remove(&handle);
        Ok(())
    }

    pub fn key(&self, handle: u32) -> Result<&[u8], IoscError> {
        self.keys
            .get(&handle)
            .map(|e| e.data.as_slice())
            .ok_or(IoscError::InvalidHandle(handle))
    }

    pub fn owner_mask(&self, handle: u32) -> Result<u32, IoscError> {
        self.keys
            .get(&handle)
            .map(|e| e.owner_mask)
            .ok_or(IoscError::InvalidHandle(handle))
    }

    fn user_entry_mut(&mut self, handle: u32) -> Result<&mut KeyEntry, IoscError> {
        if handle < FIRST_USER_HANDLE {
            return Err(IoscError::Reserved(handle));
        }
        self.keys
            .get_mut(&handle)
            .ok_or(IoscError::InvalidHandle(handle))
    }

    pub fn save_state(&self, w: &mut dyn Write) -> ios_snapshot::Result<()> {
        write_marker(w, "IOSC")?;
        w.write_u32_le(self.console_id)?;
        w.write_count_u32(self.keys.len())?;
        for (handle, entry) in &self.keys {
            w.write_u32_le(*handle)?;
            w.write_u8(entry.object_type.to_u8())?;
            w.write_u32_le(entry.owner_mask)?;
            w.write_len_prefixed_bytes_u32(&entry.data)?;
        }
        Ok(())
    }

    pub fn load_state(&mut self, r: &mut dyn Read) -> ios_snapshot::Result<()> {
        expect_marker(r, "IOSC")?;
        let console_id = r.read_u32_le()?;
        let count = r.read_u32_le()? as usize;
        if count > MAX_HANDLES {
            return Err(SnapshotError::Corrupt("too many IOSC handles"));
        }
        let mut keys = BTreeMap::new();
        for _ in 0..count {
            let handle = r.read_u32_le()?;
            let object_type = ObjectType::from_u8(r.read_u8()?)
                .ok_or(SnapshotError::Corrupt("invalid IOSC object type"))?;
            let owner_mask = r.read_u32_le()?;
            let data = r.read_len_prefixed_bytes_u32(0x200)?;
            keys.insert(
                handle,
                KeyEntry {
                    object_type,
                    data,
                    owner_mask,
                },
            );
        }
        self.console_id = console_id;
        self.keys = keys;
        Ok(())
    }
}

/// Deterministic stand-in key material; real console keys are never shipped.
fn derive_key(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed ^ 0x9E37_79B9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}
