/// Abstraction for guest memory access.
///
/// The IPC core reads command mailboxes and writes replies through this trait. Reads take
/// `&mut self` so implementations may track dirty pages or model side effects.
pub trait GuestMemory {
    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]);
    fn write_bytes(&mut self, addr: u32, data: &[u8]);

    fn read_u8(&mut self, addr: u32) -> u8 {
        let mut buf = [0u8; 1];
        self.read_bytes(addr, &mut buf);
        buf[0]
    }

    fn read_u16(&mut self, addr: u32) -> u16 {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf);
        u16::from_be_bytes(buf)
    }

    fn read_u32(&mut self, addr: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf);
        u32::from_be_bytes(buf)
    }

    fn read_u64(&mut self, addr: u32) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf);
        u64::from_be_bytes(buf)
    }

    fn write_u8(&mut self, addr: u32, val: u8) {
        self.write_bytes(addr, &[val]);
    }

    fn write_u16(&mut self, addr: u32, val: u16) {
        self.write_bytes(addr, &val.to_be_bytes());
    }

    fn write_u32(&mut self, addr: u32, val: u32) {
        self.write_bytes(addr, &val.to_be_bytes());
    }

    fn write_u64(&mut self, addr: u32, val: u64) {
        self.write_bytes(addr, &val.to_be_bytes());
    }

    /// Copy `len` bytes out of guest memory.
    fn copy_out(&mut self, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read_bytes(addr, &mut buf);
        buf
    }

    /// Copy host bytes into guest memory.
    fn copy_in(&mut self, addr: u32, data: &[u8]) {
        self.write_bytes(addr, data);
    }

    fn fill(&mut self, addr: u32, len: usize, value: u8) {
        self.write_bytes(addr, &vec![value; len]);
    }

    /// Read a NUL-terminated string of at most `max_len` bytes.
    ///
    /// Invalid UTF-8 is replaced lossily; IOS paths are plain ASCII.
    fn read_cstring(&mut self, addr: u32, max_len: usize) -> String {
        let mut out = Vec::new();
        for i in 0..max_len {
            let b = self.read_u8(addr.wrapping_add(i as u32));
            if b == 0 {
                break;
            }
            out.push(b);
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl<T: GuestMemory + ?Sized> GuestMemory for Box<T> {
    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) {
        (**self).read_bytes(addr, buf)
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        (**self).write_bytes(addr, data)
    }
}
