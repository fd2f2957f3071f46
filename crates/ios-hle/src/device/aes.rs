//! `/dev/aes`: the AES-128-CBC engine.
//!
//! IOCtlV layout for both directions: in[0] source, in[1] key, io[0] destination, io[1] IV.
//! The IV buffer receives the chaining value for the next call.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use tracing::warn;

use super::{Device, DeviceBase, DeviceContext};
use crate::ipc::{IoctlvRequest, IpcReply, IPC_EINVAL, MAX_GUEST_BUFFER};

pub const DEVICE_NAME: &str = "/dev/aes";

pub const IOCTLV_ENCRYPT: u32 = 2;
pub const IOCTLV_DECRYPT: u32 = 3;

const BLOCK: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// CBC over whole blocks. Returns the chaining value for the next call.
pub fn cbc(direction: Direction, key: &[u8; BLOCK], iv: [u8; BLOCK], data: &mut [u8]) -> [u8; BLOCK] {
    debug_assert_eq!(data.len() % BLOCK, 0);
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut chain = iv;
    for chunk in data.chunks_exact_mut(BLOCK) {
        match direction {
            Direction::Encrypt => {
                chunk.iter_mut().zip(chain).for_each(|(b, c)| *b ^= c);
                cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
                chain.copy_from_slice(chunk);
            }
            Direction::Decrypt => {
                let mut ciphertext = [0u8; BLOCK];
                ciphertext.copy_from_slice(chunk);
                cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
                chunk.iter_mut().zip(chain).for_each(|(b, c)| *b ^= c);
                chain = ciphertext;
            }
        }
    }
    chain
}

pub struct AesDevice {
    base: DeviceBase,
}

impl Default for AesDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AesDevice {
    pub fn new() -> Self {
        Self {
            base: DeviceBase::new(DEVICE_NAME),
        }
    }
}

impl Device for AesDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn ioctlv(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlvRequest) -> Option<IpcReply> {
        let direction = match request.command {
            IOCTLV_ENCRYPT => Direction::Encrypt,
            IOCTLV_DECRYPT => Direction::Decrypt,
            other => {
                warn!(command = other, "unsupported AES ioctlv");
                return Some(IpcReply::unsupported());
            }
        };
        if !request.has_vectors(2, 2) {
            return Some(IpcReply::new(IPC_EINVAL));
        }
        let (src, key, dst, iv) = (
            request.in_vectors[0],
            request.in_vectors[1],
            request.io_vectors[0],
            request.io_vectors[1],
        );
        if key.size as usize != BLOCK
            || iv.size as usize != BLOCK
            || src.size as usize % BLOCK != 0
            || src.size > MAX_GUEST_BUFFER
            || dst.size < src.size
        {
            return Some(IpcReply::new(IPC_EINVAL));
        }

        let mut key_bytes = [0u8; BLOCK];
        ctx.memory.read_bytes(key.address, &mut key_bytes);
        let mut iv_bytes = [0u8; BLOCK];
        ctx.memory.read_bytes(iv.address, &mut iv_bytes);
        let mut data = ctx.memory.copy_out(src.address, src.size as usize);

        let next_iv = cbc(direction, &key_bytes, iv_bytes, &mut data);
        ctx.memory.copy_in(dst.address, &data);
        ctx.memory.copy_in(iv.address, &next_iv);
        Some(IpcReply::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // FIPS-197 appendix C.1 single block, which is CBC with a zero IV.
    const KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];
    const PLAIN: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];
    const CIPHER: [u8; 16] = [
        0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4, 0xc5,
        0x5a,
    ];

    #[test]
    fn single_block_matches_reference_vector() {
        let mut data = PLAIN;
        let chain = cbc(Direction::Encrypt, &KEY, [0; 16], &mut data);
        assert_eq!(data, CIPHER);
        assert_eq!(chain, CIPHER);

        let chain = cbc(Direction::Decrypt, &KEY, [0; 16], &mut data);
        assert_eq!(data, PLAIN);
        assert_eq!(chain, CIPHER);
    }

    #[test]
    fn chaining_across_calls_matches_one_shot() {
        let iv = [0x5Au8; 16];
        let mut whole = [0u8; 64];
        whole.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        let mut split = whole;

        cbc(Direction::Encrypt, &KEY, iv, &mut whole);
        let next = cbc(Direction::Encrypt, &KEY, iv, &mut split[..32]);
        cbc(Direction::Encrypt, &KEY, next, &mut split[32..]);
        assert_eq!(whole, split);
    }
}
