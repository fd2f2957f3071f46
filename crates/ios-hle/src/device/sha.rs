//! `/dev/sha`: the SHA-1 engine.
//!
//! The guest owns a context block (five chaining words followed by a 64-bit bit count) and
//! feeds data in pieces. Whole 64-byte blocks are compressed as they arrive, so the context block
//! always holds the real chaining state; only a partial trailing block is buffered per context.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use ios_snapshot::{ReadLeExt, SnapshotError, WriteLeExt};
use sha1::compress;
use sha1::digest::generic_array::GenericArray;
use tracing::warn;

use super::{Device, DeviceBase, DeviceContext};
use crate::ipc::{IoctlvRequest, IpcReply, IPC_EINVAL, IPC_EQUEUEFULL};

pub const DEVICE_NAME: &str = "/dev/sha";

pub const IOCTLV_INIT_STATE: u32 = 0;
pub const IOCTLV_CONTRIBUTE_STATE: u32 = 1;
pub const IOCTLV_FINALIZE_STATE: u32 = 2;

pub const CONTEXT_SIZE: u32 = 28;
pub const DIGEST_SIZE: u32 = 20;
const INITIAL_STATE: [u32; 5] = [0x6745_2301, 0xEFCD_AB89, 0x98BA_DCFE, 0x1032_5476, 0xC3D2_E1F0];
const BLOCK_LEN: usize = 64;
const MAX_CONTEXTS: usize = 32;
/// Largest single contribution staged on the host.
pub const MAX_CONTRIBUTION: u32 = 0x0400_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShaContext {
    state: [u32; 5],
    length: u64,
    pending: Vec<u8>,
}

impl ShaContext {
    fn new() -> Self {
        Self {
            state: INITIAL_STATE,
            length: 0,
            pending: Vec::with_capacity(BLOCK_LEN),
        }
    }

    fn compress_block(&mut self, block: &[u8]) {
        compress(&mut self.state, &[GenericArray::clone_from_slice(block)]);
    }

    fn update(&mut self, mut data: &[u8]) {
        self.length = self.length.wrapping_add(data.len() as u64);
        if !self.pending.is_empty() {
            let take = (BLOCK_LEN - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() < BLOCK_LEN {
                return;
            }
            let block = std::mem::take(&mut self.pending);
            self.compress_block(&block);
        }
        let mut blocks = data.chunks_exact(BLOCK_LEN);
        for block in &mut blocks {
            self.compress_block(block);
        }
        self.pending.extend_from_slice(blocks.remainder());
    }

    fn finalize(&mut self) -> [u8; DIGEST_SIZE as usize] {
        let mut tail = std::mem::take(&mut self.pending);
        tail.push(0x80);
        while tail.len() % BLOCK_LEN != BLOCK_LEN - 8 {
            tail.push(0);
        }
        tail.extend_from_slice(&self.length.wrapping_mul(8).to_be_bytes());
        for block in tail.chunks_exact(BLOCK_LEN) {
            self.compress_block(block);
        }

        let mut digest = [0u8; DIGEST_SIZE as usize];
        for (out, word) in digest.chunks_exact_mut(4).zip(self.state) {
            out.copy_from_slice(&word.to_be_bytes());
        }
        digest
    }

    fn write_to_guest(&self, ctx: &mut DeviceContext<'_>, address: u32) {
        for (i, word) in self.state.iter().enumerate() {
            ctx.memory.write_u32(address.wrapping_add(i as u32 * 4), *word);
        }
        ctx.memory
            .write_u64(address.wrapping_add(20), self.length.wrapping_mul(8));
    }
}

pub struct ShaDevice {
    base: DeviceBase,
    contexts: BTreeMap<u32, ShaContext>,
}

impl Default for ShaDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaDevice {
    pub fn new() -> Self {
        Self {
            base: DeviceBase::new(DEVICE_NAME),
            contexts: BTreeMap::new(),
        }
    }
}

impl Device for ShaDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn ioctlv(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlvRequest) -> Option<IpcReply> {
        let Some(context) = request.io_vector(0).copied() else {
            return Some(IpcReply::new(IPC_EINVAL));
        };
        if context.size < CONTEXT_SIZE {
            return Some(IpcReply::new(IPC_EINVAL));
        }
        let input = request.in_vector(0).copied();
        if let Some(v) = input.filter(|v| v.size > MAX_CONTRIBUTION) {
            warn!(size = v.size, "SHA contribution too large");
            return Some(IpcReply::new(IPC_EINVAL));
        }
        let data = input
            .map(|v| ctx.memory.copy_out(v.address, v.size as usize))
            .unwrap_or_default();

        match request.command {
            IOCTLV_INIT_STATE => {
                if !self.contexts.contains_key(&context.address) && self.contexts.len() >= MAX_CONTEXTS {
                    return Some(IpcReply::new(IPC_EQUEUEFULL));
                }
                let fresh = ShaContext::new();
                fresh.write_to_guest(ctx, context.address);
                self.contexts.insert(context.address, fresh);
            }
            IOCTLV_CONTRIBUTE_STATE => {
                let Some(sha) = self.contexts.get_mut(&context.address) else {
                    return Some(IpcReply::new(IPC_EINVAL));
                };
                sha.update(&data);
                sha.write_to_guest(ctx, context.address);
            }
            IOCTLV_FINALIZE_STATE => {
                let out = match request.io_vector(1) {
                    Some(out) if out.size >= DIGEST_SIZE => *out,
                    _ => return Some(IpcReply::new(IPC_EINVAL)),
                };
                let Some(mut sha) = self.contexts.remove(&context.address) else {
                    return Some(IpcReply::new(IPC_EINVAL));
                };
                sha.update(&data);
                let digest = sha.finalize();
                sha.write_to_guest(ctx, context.address);
                ctx.memory.copy_in(out.address, &digest);
            }
            other => {
                warn!(command = other, "unsupported SHA ioctlv");
                return Some(IpcReply::unsupported());
            }
        }
        Some(IpcReply::success())
    }

    fn save_state(&self, w: &mut dyn Write) -> ios_snapshot::Result<()> {
        self.base.save_state(w)?;
        w.write_count_u32(self.contexts.len())?;
        for (address, sha) in &self.contexts {
            w.write_u32_le(*address)?;
            for word in sha.state {
                w.write_u32_le(word)?;
            }
            w.write_u64_le(sha.length)?;
            w.write_len_prefixed_bytes_u32(&sha.pending)?;
        }
        Ok(())
    }

    fn load_state(&mut self, r: &mut dyn Read) -> ios_snapshot::Result<()> {
        self.base.load_state(r)?;
        let count = r.read_u32_le()? as usize;
        if count > MAX_CONTEXTS {
            return Err(SnapshotError::Corrupt("too many SHA contexts"));
        }
        let mut contexts = BTreeMap::new();
        for _ in 0..count {
            let address = r.read_u32_le()?;
            let mut state = [0u32; 5];
            for word in &mut state {
                *word = r.read_u32_le()?;
            }
            let length = r.read_u64_le()?;
            let pending = r.read_len_prefixed_bytes_u32(BLOCK_LEN - 1)?;
            contexts.insert(
                address,
                ShaContext {
                    state,
                    length,
                    pending,
                },
            );
        }
        self.contexts = contexts;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::Harness;
    use ios_mem::GuestMemory;
    use crate::ipc::{IoVector, IpcCommand, Request};
    use pretty_assertions::assert_eq;
    use sha1::{Digest, Sha1};
    use std::io::Cursor;

    const CONTEXT: u32 = 0x8000_5000;
    const INPUT: u32 = 0x8000_6000;
    const OUTPUT: u32 = 0x8000_7000;

    fn ioctlv(command: u32, ins: Vec<IoVector>, ios: Vec<IoVector>) -> IoctlvRequest {
        IoctlvRequest {
            request: Request {
                address: 0,
                command: IpcCommand::Ioctlv as u32,
                fd: 0,
            },
            command,
            in_vectors: ins,
            io_vectors: ios,
        }
    }

    fn context() -> IoVector {
        IoVector {
            address: CONTEXT,
            size: CONTEXT_SIZE,
        }
    }

    fn contribute(h: &mut Harness, sha: &mut ShaDevice, data: &[u8]) -> Option<IpcReply> {
        h.ram.copy_in(INPUT, data);
        let input = IoVector {
            address: INPUT,
            size: data.len() as u32,
        };
        h.with_ctx(|ctx| sha.ioctlv(ctx, &ioctlv(IOCTLV_CONTRIBUTE_STATE, vec![input], vec![context()])))
    }

    #[test]
    fn piecewise_contributions_match_one_shot_digest() {
        let mut h = Harness::new();
        let mut sha = ShaDevice::new();
        let message: Vec<u8> = (0..200u32).map(|i| (i * 7) as u8).collect();

        h.with_ctx(|ctx| sha.ioctlv(ctx, &ioctlv(IOCTLV_INIT_STATE, vec![], vec![context()])));
        for piece in [&message[..10], &message[10..100], &message[100..190]] {
            assert_eq!(contribute(&mut h, &mut sha, piece), Some(IpcReply::success()));
        }
        // Two whole blocks compressed so far; the context block holds the chaining state.
        assert_ne!(h.ram.read_u32(CONTEXT), INITIAL_STATE[0]);
        assert_eq!(h.ram.read_u64(CONTEXT + 20), 190 * 8);

        h.ram.copy_in(INPUT, &message[190..]);
        let input = IoVector {
            address: INPUT,
            size: 10,
        };
        let out = IoVector {
            address: OUTPUT,
            size: DIGEST_SIZE,
        };
        let reply = h.with_ctx(|ctx| {
            sha.ioctlv(ctx, &ioctlv(IOCTLV_FINALIZE_STATE, vec![input], vec![context(), out]))
        });
        assert_eq!(reply, Some(IpcReply::success()));
        assert_eq!(
            h.ram.copy_out(OUTPUT, DIGEST_SIZE as usize),
            Sha1::digest(&message).to_vec()
        );
    }

    #[test]
    fn chaining_state_advances_per_block_not_per_call() {
        let mut h = Harness::new();
        let mut sha = ShaDevice::new();
        h.with_ctx(|ctx| sha.ioctlv(ctx, &ioctlv(IOCTLV_INIT_STATE, vec![], vec![context()])));

        contribute(&mut h, &mut sha, &[0xAB; 63]);
        assert_eq!(h.ram.read_u32(CONTEXT), INITIAL_STATE[0]);
        contribute(&mut h, &mut sha, &[0xAB; 1]);
        let mut expected = INITIAL_STATE;
        compress(&mut expected, &[GenericArray::clone_from_slice(&[0xAB; 64])]);
        assert_eq!(h.ram.read_u32(CONTEXT), expected[0]);
    }

    #[test]
    fn oversized_contribution_is_refused_before_copying() {
        let mut h = Harness::new();
        let mut sha = ShaDevice::new();
        h.with_ctx(|ctx| sha.ioctlv(ctx, &ioctlv(IOCTLV_INIT_STATE, vec![], vec![context()])));
        let input = IoVector {
            address: INPUT,
            size: u32::MAX,
        };
        let reply = h.with_ctx(|ctx| {
            sha.ioctlv(ctx, &ioctlv(IOCTLV_CONTRIBUTE_STATE, vec![input], vec![context()]))
        });
        assert_eq!(reply, Some(IpcReply::new(IPC_EINVAL)));
    }

    #[test]
    fn partial_block_survives_savestate() {
        let mut h = Harness::new();
        let mut sha = ShaDevice::new();
        h.with_ctx(|ctx| sha.ioctlv(ctx, &ioctlv(IOCTLV_INIT_STATE, vec![], vec![context()])));
        contribute(&mut h, &mut sha, &[1; 70]);

        let mut buf = Vec::new();
        sha.save_state(&mut buf).unwrap();
        let mut restored = ShaDevice::new();
        restored.load_state(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(restored.contexts, sha.contexts);
    }
}
