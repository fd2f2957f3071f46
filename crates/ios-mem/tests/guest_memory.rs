use ios_mem::{GuestMemory, GuestRam, MEM1_SIZE};
use proptest::prelude::*;

#[test]
fn cstring_stops_at_nul_or_limit() {
    let mut ram = GuestRam::new();
    ram.copy_in(0x8000_1000, b"/dev/fs\0garbage");
    assert_eq!(ram.read_cstring(0x8000_1000, 64), "/dev/fs");

    ram.copy_in(0x8000_2000, b"abcdefgh");
    assert_eq!(ram.read_cstring(0x8000_2000, 4), "abcd");
}

#[test]
fn big_endian_layout() {
    let mut ram = GuestRam::new();
    ram.write_u64(0x8000_0040, 0x0000_0001_0000_003A);
    assert_eq!(ram.copy_out(0x8000_0040, 8), vec![0, 0, 0, 1, 0, 0, 0, 0x3A]);
    assert_eq!(ram.read_u32(0x8000_0044), 0x3A);
}

proptest! {
    #[test]
    fn write_then_read_in_mem1(offset in 0u32..(MEM1_SIZE - 64), data in proptest::collection::vec(any::<u8>(), 0..64)) {
        let mut ram = GuestRam::new();
        ram.copy_in(0x8000_0000 | offset, &data);
        prop_assert_eq!(ram.copy_out(0xC000_0000 | offset, data.len()), data);
    }
}
