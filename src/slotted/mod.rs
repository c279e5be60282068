//! SlottedArray — внутристраничная карта ключ/значение.
//!
//! Раскладка тела (body — срез слотовой области внутри страницы):
//!
//! ```text
//! [header 8: count u16, deleted u16, payload_low u16, dead_bytes u16]
//! [slot 0][slot 1] ...                      <- растут вперёд
//! ...            свободное место
//! ... [entry n-1] ... [entry 1][entry 0]    <- растут назад
//! ```
//!
//! Слот (4 байта): [offset u16 | флаги в старших битах][hash16 u16].
//! Запись: [klen varint][key][vlen varint][value].
//! Удаление — tombstone в слоте; место возвращает компакция.

pub mod iter;
pub mod ops;

pub use iter::{enumerate_all, enumerate_nibble, enumerate_two_nibbles, move_non_empty_keys_to, remove_keys_from};
pub use ops::{capacity_left, compact, contains, count, delete, get, init, try_set};

use byteorder::{ByteOrder, LittleEndian};

use crate::util::{read_varint, varint_len};

pub(crate) const HEADER_SIZE: usize = 8;
pub(crate) const SLOT_SIZE: usize = 4;

pub(crate) const OFFSET_MASK: u16 = 0x0FFF;
pub(crate) const FLAG_DELETED: u16 = 0x8000;

#[derive(Clone, Copy, Debug)]
pub(crate) struct Header {
    pub count: u16,
    pub deleted: u16,
    pub payload_low: u16,
    pub dead_bytes: u16,
}

pub(crate) fn read_header(body: &[u8]) -> Header {
    Header {
        count: LittleEndian::read_u16(&body[0..2]),
        deleted: LittleEndian::read_u16(&body[2..4]),
        payload_low: LittleEndian::read_u16(&body[4..6]),
        dead_bytes: LittleEndian::read_u16(&body[6..8]),
    }
}

pub(crate) fn write_header(body: &mut [u8], h: &Header) {
    LittleEndian::write_u16(&mut body[0..2], h.count);
    LittleEndian::write_u16(&mut body[2..4], h.deleted);
    LittleEndian::write_u16(&mut body[4..6], h.payload_low);
    LittleEndian::write_u16(&mut body[6..8], h.dead_bytes);
}

#[inline]
pub(crate) fn slot_pos(idx: usize) -> usize {
    HEADER_SIZE + idx * SLOT_SIZE
}

#[inline]
pub(crate) fn read_slot(body: &[u8], idx: usize) -> (u16, u16) {
    let p = slot_pos(idx);
    (
        LittleEndian::read_u16(&body[p..p + 2]),
        LittleEndian::read_u16(&body[p + 2..p + 4]),
    )
}

#[inline]
pub(crate) fn write_slot(body: &mut [u8], idx: usize, off_flags: u16, hash: u16) {
    let p = slot_pos(idx);
    LittleEndian::write_u16(&mut body[p..p + 2], off_flags);
    LittleEndian::write_u16(&mut body[p + 2..p + 4], hash);
}

#[inline]
pub(crate) fn slot_is_deleted(off_flags: u16) -> bool {
    off_flags & FLAG_DELETED != 0
}

/// 16-битный хэш ключа: перемешивание по ниблам, чувствительное к первым
/// ниблам, чтобы ключи, различающиеся рано, почти наверняка имели разные
/// хэши.
pub fn hash16(key: &[u8]) -> u16 {
    let mut h: u32 = 0x9E37;
    for &b in key {
        h = (h ^ (b >> 4) as u32).wrapping_mul(0x85EB_CA6B) ^ (h >> 13);
        h = (h ^ (b & 0x0F) as u32).wrapping_mul(0xC2B2_AE35) ^ (h >> 16);
    }
    (h ^ (h >> 16)) as u16
}

/// Разбор записи по смещению: (key, value, полный размер записи).
pub(crate) fn read_entry(body: &[u8], off: usize) -> (&[u8], &[u8], usize) {
    let (klen, kl) = read_varint(body, off);
    let kstart = off + kl;
    let kend = kstart + klen as usize;
    let (vlen, vl) = read_varint(body, kend);
    let vstart = kend + vl;
    let vend = vstart + vlen as usize;
    (&body[kstart..kend], &body[vstart..vend], vend - off)
}

/// Полный размер записи для пары длин.
#[inline]
pub(crate) fn entry_size(klen: usize, vlen: usize) -> usize {
    varint_len(klen as u16) + klen + varint_len(vlen as u16) + vlen
}

/// Линейный поиск живого слота по ключу. Возвращает (slot, offset записи).
pub(crate) fn find(body: &[u8], key: &[u8]) -> Option<(usize, usize)> {
    let h = read_header(body);
    let hk = hash16(key);
    for idx in 0..h.count as usize {
        let (off_flags, hash) = read_slot(body, idx);
        if slot_is_deleted(off_flags) || hash != hk {
            continue;
        }
        let off = (off_flags & OFFSET_MASK) as usize;
        let (k, _v, _sz) = read_entry(body, off);
        if k == key {
            return Some((idx, off));
        }
    }
    None
}
