//! NibblePath — полубайтовая адресация поверх байтового буфера.
//!
//! Путь — это view: срез данных, флаг нечётного старта (первый нибл — младшая
//! половина байта 0) и длина в ниблах. Равенство и хэш зависят только от
//! логической последовательности ниблов, не от расположения в буфере и не от
//! чётности. Добавление ниблов выполняется в явный рабочий буфер, без
//! аллокаций.

use std::fmt;
use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::consts::NIBBLES_PER_KECCAK;

/// Рабочий буфер для append-операций (64 нибла + 1 добавленный).
pub type WorkBuf = [u8; NIBBLES_PER_KECCAK / 2 + 1];

/// Чистый рабочий буфер (у массивов длиной 33 нет Default).
#[inline]
pub fn work_buf() -> WorkBuf {
    [0; NIBBLES_PER_KECCAK / 2 + 1]
}

#[derive(Clone, Copy)]
pub struct NibblePath<'a> {
    data: &'a [u8],
    odd: u8,
    len: u8,
}

impl<'a> NibblePath<'a> {
    /// Путь из целых байт, чётный старт.
    pub fn from_slice(data: &'a [u8]) -> Self {
        debug_assert!(data.len() * 2 <= u8::MAX as usize);
        Self {
            data,
            odd: 0,
            len: (data.len() * 2) as u8,
        }
    }

    /// Полный путь 64 нибла по 32-байтному хэшу.
    pub fn from_keccak(hash: &'a [u8; 32]) -> Self {
        Self {
            data: &hash[..],
            odd: 0,
            len: NIBBLES_PER_KECCAK as u8,
        }
    }

    pub fn new(data: &'a [u8], odd: u8, len: u8) -> Self {
        debug_assert!(odd <= 1);
        debug_assert!(
            data.len() * 2 >= odd as usize + len as usize,
            "nibble path out of buffer: {} bytes, odd={}, len={}",
            data.len(),
            odd,
            len
        );
        Self { data, odd, len }
    }

    pub fn empty() -> Self {
        Self {
            data: &[],
            odd: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_odd(&self) -> bool {
        self.odd == 1
    }

    /// Нибл с индекса i. Выход за длину — ошибка программирования.
    #[inline]
    pub fn nibble_at(&self, i: usize) -> u8 {
        debug_assert!(i < self.len as usize, "nibble index {} out of {}", i, self.len);
        let pos = self.odd as usize + i;
        let byte = self.data[pos / 2];
        if pos % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0F
        }
    }

    /// Префикс из n ниблов.
    pub fn slice_to(&self, n: usize) -> NibblePath<'a> {
        assert!(n <= self.len as usize, "slice_to {} of {}", n, self.len);
        NibblePath {
            data: self.data,
            odd: self.odd,
            len: n as u8,
        }
    }

    /// Суффикс, начиная с нибла n.
    pub fn slice_from(&self, n: usize) -> NibblePath<'a> {
        assert!(n <= self.len as usize, "slice_from {} of {}", n, self.len);
        let pos = self.odd as usize + n;
        NibblePath {
            data: &self.data[pos / 2..],
            odd: (pos % 2) as u8,
            len: self.len - n as u8,
        }
    }

    /// Число совпадающих начальных ниблов с other
    /// (индекс первого различающегося).
    pub fn first_different_nibble(&self, other: &NibblePath<'_>) -> usize {
        let n = (self.len as usize).min(other.len as usize);
        // Быстрый путь: обе стороны выровнены по байту — сравниваем байтами.
        if self.odd == 0 && other.odd == 0 {
            let bytes = n / 2;
            let mut i = 0;
            while i < bytes && self.data[i] == other.data[i] {
                i += 1;
            }
            let mut k = i * 2;
            while k < n && self.nibble_at(k) == other.nibble_at(k) {
                k += 1;
            }
            return k;
        }
        let mut k = 0;
        while k < n && self.nibble_at(k) == other.nibble_at(k) {
            k += 1;
        }
        k
    }

    /// true, если self начинается с prefix.
    pub fn starts_with(&self, prefix: &NibblePath<'_>) -> bool {
        prefix.len() <= self.len() && self.first_different_nibble(prefix) >= prefix.len()
    }

    /// Дописывает нибл, собирая результат в buf.
    pub fn append_nibble(&self, nibble: u8, buf: &'a mut WorkBuf) -> NibblePath<'a> {
        debug_assert!(nibble <= 0x0F);
        let total = self.len as usize + 1;
        debug_assert!(self.odd as usize + total <= buf.len() * 2);
        let used = (self.odd as usize + self.len as usize + 1) / 2;
        buf[..used].copy_from_slice(&self.data[..used]);
        let pos = self.odd as usize + self.len as usize;
        if pos % 2 == 0 {
            buf[pos / 2] = nibble << 4;
        } else {
            buf[pos / 2] = (buf[pos / 2] & 0xF0) | nibble;
        }
        NibblePath {
            data: &buf[..],
            odd: self.odd,
            len: total as u8,
        }
    }

    /// Конкатенация self ++ other в buf.
    pub fn append(&self, other: &NibblePath<'_>, buf: &'a mut WorkBuf) -> NibblePath<'a> {
        let total = self.len as usize + other.len as usize;
        debug_assert!(self.odd as usize + total <= buf.len() * 2);
        let used = (self.odd as usize + self.len as usize + 1) / 2;
        buf[..used].copy_from_slice(&self.data[..used]);
        // Граница может приходиться на середину байта: дописываем пониблово,
        // с байтовым быстрым путём, когда чётности сходятся.
        let mut pos = self.odd as usize + self.len as usize;
        let mut i = 0;
        if pos % 2 == 0 && other.odd == 0 {
            let whole = other.len as usize / 2;
            buf[pos / 2..pos / 2 + whole].copy_from_slice(&other.data[..whole]);
            pos += whole * 2;
            i += whole * 2;
        }
        while i < other.len as usize {
            let nib = other.nibble_at(i);
            if pos % 2 == 0 {
                buf[pos / 2] = nib << 4;
            } else {
                buf[pos / 2] = (buf[pos / 2] & 0xF0) | nib;
            }
            pos += 1;
            i += 1;
        }
        NibblePath {
            data: &buf[..],
            odd: self.odd,
            len: total as u8,
        }
    }

    /// Число байт wire-формы: байт длины + упакованные ниблы.
    pub fn wire_len(&self) -> usize {
        1 + (self.len as usize + 1) / 2
    }

    /// Сериализация: [len | odd<<7] ++ упакованные ниблы.
    ///
    /// Пишется всегда нормализованная форма (чётный старт, хвостовой нибл
    /// обнулён), поэтому равные пути дают побайтно одинаковый выход
    /// независимо от исходного буфера и чётности.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + self.wire_len(), 0);
        self.write_to_slice(&mut out[start..]);
    }

    /// То же, но в готовый срез. Возвращает число записанных байт.
    pub fn write_to_slice(&self, out: &mut [u8]) -> usize {
        debug_assert!(self.len < 0x80);
        out[0] = self.len;
        let mut w = 1;
        let mut i = 0;
        while i < self.len as usize {
            let hi = self.nibble_at(i);
            let lo = if i + 1 < self.len as usize {
                self.nibble_at(i + 1)
            } else {
                0
            };
            out[w] = (hi << 4) | lo;
            w += 1;
            i += 2;
        }
        w
    }

    /// Разбор wire-формы. Возвращает (путь, прочитано байт).
    /// Принимает и нечётную форму (старший бит байта длины).
    pub fn read_from(data: &'a [u8]) -> anyhow::Result<(NibblePath<'a>, usize)> {
        if data.is_empty() {
            anyhow::bail!("nibble path: empty input");
        }
        let b0 = data[0];
        let odd = b0 >> 7;
        let len = (b0 & 0x7F) as usize;
        let bytes = (odd as usize + len + 1) / 2;
        if data.len() < 1 + bytes {
            anyhow::bail!("nibble path: truncated ({} nibbles, {} bytes)", len, data.len());
        }
        Ok((
            NibblePath {
                data: &data[1..1 + bytes],
                odd,
                len: len as u8,
            },
            1 + bytes,
        ))
    }

    /// Стабильный хэш логической последовательности ниблов
    /// (инвариантен к чётности и мусору за длиной).
    pub fn hash(&self) -> u64 {
        let mut h = XxHash64::with_seed(0);
        h.write_u8(self.len);
        let mut i = 0;
        while i < self.len as usize {
            let hi = self.nibble_at(i);
            let lo = if i + 1 < self.len as usize {
                self.nibble_at(i + 1)
            } else {
                0
            };
            h.write_u8((hi << 4) | lo);
            i += 2;
        }
        h.finish()
    }
}

/// Небольшой владеющий путь (до 64 ниблов, чётный старт). Используется там,
/// где срезов исходного буфера недостаточно: склейки путей в узлах Меркла.
#[derive(Clone, Copy)]
pub struct NibbleBuf {
    bytes: [u8; NIBBLES_PER_KECCAK / 2 + 1],
    len: u8,
}

impl NibbleBuf {
    pub fn new() -> Self {
        NibbleBuf {
            bytes: [0u8; NIBBLES_PER_KECCAK / 2 + 1],
            len: 0,
        }
    }

    pub fn from_path(p: &NibblePath<'_>) -> Self {
        let mut out = Self::new();
        out.extend(p);
        out
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, nibble: u8) {
        debug_assert!(nibble <= 0x0F);
        let i = self.len as usize;
        debug_assert!(i < self.bytes.len() * 2);
        if i % 2 == 0 {
            self.bytes[i / 2] = nibble << 4;
        } else {
            self.bytes[i / 2] |= nibble;
        }
        self.len += 1;
    }

    pub fn pop(&mut self) {
        debug_assert!(self.len > 0);
        self.len -= 1;
        let i = self.len as usize;
        if i % 2 == 0 {
            self.bytes[i / 2] = 0;
        } else {
            self.bytes[i / 2] &= 0xF0;
        }
    }

    pub fn extend(&mut self, p: &NibblePath<'_>) {
        for i in 0..p.len() {
            self.push(p.nibble_at(i));
        }
    }

    pub fn truncate(&mut self, len: usize) {
        while self.len as usize > len {
            self.pop();
        }
    }

    pub fn as_path(&self) -> NibblePath<'_> {
        NibblePath {
            data: &self.bytes,
            odd: 0,
            len: self.len,
        }
    }
}

impl Default for NibbleBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NibbleBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_path().fmt(f)
    }
}

impl PartialEq for NibblePath<'_> {
    fn eq(&self, other: &Self) -> bool {
        if self.len != other.len {
            return false;
        }
        self.first_different_nibble(other) >= self.len as usize
    }
}

impl Eq for NibblePath<'_> {}

impl fmt::Debug for NibblePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NibblePath(")?;
        for i in 0..self.len as usize {
            write!(f, "{:x}", self.nibble_at(i))?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibble_at_even_and_odd() {
        let data = [0xAB, 0xCD];
        let even = NibblePath::from_slice(&data);
        assert_eq!(even.len(), 4);
        assert_eq!(
            (0..4).map(|i| even.nibble_at(i)).collect::<Vec<_>>(),
            vec![0xA, 0xB, 0xC, 0xD]
        );

        let odd = NibblePath::new(&data, 1, 3);
        assert_eq!(
            (0..3).map(|i| odd.nibble_at(i)).collect::<Vec<_>>(),
            vec![0xB, 0xC, 0xD]
        );
    }

    #[test]
    fn equality_ignores_parity_and_buffer() {
        let a = [0xAB, 0xCD];
        let b = [0x0A, 0xBC, 0xD0];
        let even = NibblePath::from_slice(&a);
        let odd = NibblePath::new(&b, 1, 4);
        assert_eq!(even, odd);
        assert_eq!(even.hash(), odd.hash());
    }

    #[test]
    fn slice_from_changes_parity() {
        let data = [0x12, 0x34, 0x56];
        let p = NibblePath::from_slice(&data);
        let s = p.slice_from(1);
        assert_eq!(s.len(), 5);
        assert_eq!(s.nibble_at(0), 0x2);
        assert_eq!(s.nibble_at(4), 0x6);
        let s2 = s.slice_from(1);
        assert_eq!(s2.nibble_at(0), 0x3);
    }

    #[test]
    fn first_different_all_parity_combinations() {
        let a = [0x12, 0x34];
        let b = [0x01, 0x23, 0x40];
        // even/even, even/odd, odd/even, odd/odd
        let pe = NibblePath::from_slice(&a);
        let po = NibblePath::new(&b, 1, 4);
        assert_eq!(pe.first_different_nibble(&po), 4);
        assert_eq!(po.first_different_nibble(&pe), 4);

        let c = [0x12, 0x44];
        let ce = NibblePath::from_slice(&c);
        assert_eq!(pe.first_different_nibble(&ce), 2);
        assert_eq!(po.first_different_nibble(&ce), 2);
    }

    #[test]
    fn append_nibble_roundtrip() {
        let data = [0x12, 0x34];
        for skip in 0..4 {
            let p = NibblePath::from_slice(&data).slice_from(skip);
            let mut buf = [0u8; 33];
            let appended = p.append_nibble(0xE, &mut buf);
            assert_eq!(appended.len(), p.len() + 1);
            assert_eq!(appended.slice_to(p.len()), p);
            assert_eq!(appended.nibble_at(p.len()), 0xE);
        }
    }

    #[test]
    fn append_mid_byte_boundary() {
        let a = [0xAB];
        let b = [0xCD];
        let pa = NibblePath::new(&a, 0, 1); // "a"
        let pb = NibblePath::from_slice(&b); // "cd"
        let mut buf = [0u8; 33];
        let joined = pa.append(&pb, &mut buf);
        assert_eq!(joined.len(), 3);
        assert_eq!(
            (0..3).map(|i| joined.nibble_at(i)).collect::<Vec<_>>(),
            vec![0xA, 0xC, 0xD]
        );
    }

    #[test]
    fn wire_roundtrip_identical_for_equal_paths() {
        let a = [0xAB, 0xCD];
        let b = [0x0A, 0xBC, 0xDF]; // мусор в хвосте за длиной
        let even = NibblePath::from_slice(&a);
        let odd = NibblePath::new(&b, 1, 4);

        let mut w1 = Vec::new();
        let mut w2 = Vec::new();
        even.write_to(&mut w1);
        odd.write_to(&mut w2);
        assert_eq!(w1, w2);

        let (parsed, used) = NibblePath::read_from(&w1).unwrap();
        assert_eq!(used, w1.len());
        assert_eq!(parsed, even);
    }

    #[test]
    fn empty_path_works() {
        let p = NibblePath::empty();
        let mut w = Vec::new();
        p.write_to(&mut w);
        assert_eq!(w, vec![0]);
        let (parsed, used) = NibblePath::read_from(&w).unwrap();
        assert_eq!(used, 1);
        assert!(parsed.is_empty());
        assert_eq!(parsed, p);
    }

    #[test]
    fn nibble_buf_push_extend_truncate() {
        let mut b = NibbleBuf::new();
        b.push(0xA);
        b.push(0xB);
        let tail = [0xCD, 0xEF];
        b.extend(&NibblePath::from_slice(&tail));
        assert_eq!(b.len(), 6);
        let data = [0xAB, 0xCD, 0xEF];
        assert_eq!(b.as_path(), NibblePath::from_slice(&data));
        b.truncate(3);
        assert_eq!(b.as_path(), NibblePath::from_slice(&data).slice_to(3));
        b.push(0x1);
        assert_eq!(b.as_path().nibble_at(3), 0x1);
    }

    #[test]
    fn full_keccak_path_at_any_offset() {
        let hash = [0x5Au8; 32];
        let p = NibblePath::from_keccak(&hash);
        assert_eq!(p.len(), 64);
        for skip in [0usize, 1, 2, 63] {
            let s = p.slice_from(skip);
            assert_eq!(s.len(), 64 - skip);
            let mut w = Vec::new();
            s.write_to(&mut w);
            let (back, _) = NibblePath::read_from(&w).unwrap();
            assert_eq!(back, s);
        }
    }
}
