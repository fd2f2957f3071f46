use crate::GuestMemory;

pub const MEM1_BASE: u32 = 0x0000_0000;
pub const MEM1_SIZE: u32 = 0x0180_0000;
pub const MEM2_BASE: u32 = 0x1000_0000;
pub const MEM2_SIZE: u32 = 0x0400_0000;

/// Strip the cached/uncached mirror bits from an effective address.
pub const fn translate(addr: u32) -> u32 {
    addr & 0x1FFF_FFFF
}

/// Flat MEM1 + MEM2 backing store.
///
/// Accesses outside both banks read as zero and drop writes, like open bus on the real
/// hardware. Accesses that straddle a bank boundary are split byte-wise.
#[derive(Clone)]
pub struct GuestRam {
    mem1: Vec<u8>,
    mem2: Vec<u8>,
}

impl std::fmt::Debug for GuestRam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRam")
            .field("mem1_len", &self.mem1.len())
            .field("mem2_len", &self.mem2.len())
            .finish()
    }
}

impl Default for GuestRam {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestRam {
    pub fn new() -> Self {
        Self {
            mem1: vec![0; MEM1_SIZE as usize],
            mem2: vec![0; MEM2_SIZE as usize],
        }
    }

    pub fn mem1(&self) -> &[u8] {
        &self.mem1
    }

    pub fn mem2(&self) -> &[u8] {
        &self.mem2
    }

    fn locate(&self, addr: u32) -> Option<(bool, usize)> {
        let phys = translate(addr);
        if phys < MEM1_BASE + MEM1_SIZE {
            return Some((false, (phys - MEM1_BASE) as usize));
        }
        if (MEM2_BASE..MEM2_BASE + MEM2_SIZE).contains(&phys) {
            return Some((true, (phys - MEM2_BASE) as usize));
        }
        None
    }

    /// Length of the contiguous mapped run starting at `addr`, capped at `want`.
    fn run_len(&self, addr: u32, want: usize) -> Option<(bool, usize, usize)> {
        let (is_mem2, offset) = self.locate(addr)?;
        let bank_len = if is_mem2 {
            self.mem2.len()
        } else {
            self.mem1.len()
        };
        Some((is_mem2, offset, want.min(bank_len - offset)))
    }
}

impl GuestMemory for GuestRam {
    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let cur = addr.wrapping_add(done as u32);
            match self.run_len(cur, buf.len() - done) {
                Some((is_mem2, offset, len)) => {
                    let bank = if is_mem2 { &self.mem2 } else { &self.mem1 };
                    buf[done..done + len].copy_from_slice(&bank[offset..offset + len]);
                    done += len;
                }
                None => {
                    buf[done] = 0;
                    done += 1;
                }
            }
        }
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let cur = addr.wrapping_add(done as u32);
            match self.run_len(cur, data.len() - done) {
                Some((is_mem2, offset, len)) => {
                    let bank = if is_mem2 {
                        &mut self.mem2
                    } else {
                        &mut self.mem1
                    };
                    bank[offset..offset + len].copy_from_slice(&data[done..done + len]);
                    done += len;
                }
                None => done += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_alias_the_same_bytes() {
        let mut ram = GuestRam::new();
        ram.write_u32(0x8000_3100, 0x0180_0000);
        assert_eq!(ram.read_u32(0xC000_3100), 0x0180_0000);
        assert_eq!(ram.read_u32(0x0000_3100), 0x0180_0000);

        ram.write_u16(0x9000_0800, 0xBEEF);
        assert_eq!(ram.read_u16(0xD000_0800), 0xBEEF);
        assert_eq!(&ram.mem2()[0x800..0x802], &[0xBE, 0xEF]);
    }

    #[test]
    fn unmapped_reads_zero_and_writes_are_dropped() {
        let mut ram = GuestRam::new();
        ram.write_u32(0x0800_0000, 0xFFFF_FFFF);
        assert_eq!(ram.read_u32(0x0800_0000), 0);
    }

    #[test]
    fn access_straddling_end_of_mem1_is_split() {
        let mut ram = GuestRam::new();
        let last = MEM1_SIZE - 2;
        ram.write_u32(last, 0x1122_3344);
        // Only the two in-range bytes land.
        assert_eq!(ram.read_u16(last), 0x1122);
        assert_eq!(ram.read_u32(last), 0x1122_0000);
    }
}
