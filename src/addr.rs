//! DbAddress — 4-байтный индекс страницы. NULL = 0: страница 0 всегда занята
//! слотом кольца корней, поэтому 0 не бывает валидным адресом данных.

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::PAGE_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DbAddress(u32);

impl DbAddress {
    pub const NULL: DbAddress = DbAddress(0);

    #[inline]
    pub fn new(raw: u32) -> Self {
        DbAddress(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Байтовое смещение страницы в регионе.
    #[inline]
    pub fn file_offset(self) -> usize {
        self.0 as usize * PAGE_SIZE
    }

    #[inline]
    pub fn read(buf: &[u8]) -> Self {
        DbAddress(LittleEndian::read_u32(buf))
    }

    #[inline]
    pub fn write(self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.0);
    }
}

/// Операции над плотным списком 4-байтных адресов внутри тела страницы.
pub mod list {
    use super::*;

    #[inline]
    pub fn get(body: &[u8], idx: usize) -> DbAddress {
        DbAddress::read(&body[idx * 4..idx * 4 + 4])
    }

    #[inline]
    pub fn set(body: &mut [u8], idx: usize, addr: DbAddress) {
        addr.write(&mut body[idx * 4..idx * 4 + 4]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_roundtrip() {
        assert!(DbAddress::NULL.is_null());
        let mut buf = [0u8; 8];
        DbAddress::new(0x01020304).write(&mut buf[2..6]);
        assert_eq!(DbAddress::read(&buf[2..6]).raw(), 0x01020304);
    }

    #[test]
    fn list_get_set() {
        let mut body = vec![0u8; 64];
        list::set(&mut body, 3, DbAddress::new(42));
        assert_eq!(list::get(&body, 3), DbAddress::new(42));
        assert!(list::get(&body, 0).is_null());
    }
}
