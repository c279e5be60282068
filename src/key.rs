//! Логические ключи и их внутристраничная кодировка (StoreKey).
//!
//! Ключ — это (путь аккаунта, тип, путь storage). Кодировка:
//! [tag u8][часть пути][часть storage?]. Части — wire-форма NibblePath;
//! для путей длины 2 и 4 применяется плотная упаковка, когда каждый второй
//! нибл пары помещается в три бита (предикат воспроизводится точно и не
//! обобщается). Кодировка инъективна.
//!
//! Страницы маршрутизируют по "комбинированному потоку" ниблов
//! (путь ++ storage): срез на один нибл уменьшает путь, а когда тот
//! исчерпан — storage-часть. Так глубокие storage-поддеревья продолжают
//! делиться по ниблам слота.

use anyhow::{anyhow, Result};

use crate::nibble::NibblePath;

const TAG_TYPE_MASK: u8 = 0x03;
const TAG_STORAGE_MERKLE: u8 = 0x04;
/// Ключ хранится неотрезанным: путь короче числа ниблов, потребляемых
/// маршрутизацией корня.
const TAG_SHORT: u8 = 0x08;
const TAG_DENSE2: u8 = 0x10;
const TAG_DENSE4: u8 = 0x20;

/// Максимум байт кодировки: tag + путь(1+32) + storage(1+32).
pub const MAX_STORE_KEY_BYTES: usize = 67;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    Account = 0,
    StorageCell = 1,
    Merkle = 2,
}

impl KeyType {
    fn from_bits(bits: u8) -> Result<KeyType> {
        match bits {
            0 => Ok(KeyType::Account),
            1 => Ok(KeyType::StorageCell),
            2 => Ok(KeyType::Merkle),
            other => Err(anyhow!("store key: unknown type bits {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Key<'a> {
    pub ty: KeyType,
    /// Merkle-ключ storage-дерева (путь = аккаунт, storage = путь в дереве).
    pub storage_merkle: bool,
    pub path: NibblePath<'a>,
    pub storage: NibblePath<'a>,
}

impl<'a> Key<'a> {
    pub fn account(path: NibblePath<'a>) -> Self {
        Key {
            ty: KeyType::Account,
            storage_merkle: false,
            path,
            storage: NibblePath::empty(),
        }
    }

    pub fn storage_cell(account: NibblePath<'a>, slot: NibblePath<'a>) -> Self {
        Key {
            ty: KeyType::StorageCell,
            storage_merkle: false,
            path: account,
            storage: slot,
        }
    }

    /// Узел Merkle дерева состояния по префиксу пути.
    pub fn merkle(path: NibblePath<'a>) -> Self {
        Key {
            ty: KeyType::Merkle,
            storage_merkle: false,
            path,
            storage: NibblePath::empty(),
        }
    }

    /// Узел Merkle storage-дерева аккаунта.
    pub fn storage_merkle(account: NibblePath<'a>, path: NibblePath<'a>) -> Self {
        Key {
            ty: KeyType::Merkle,
            storage_merkle: true,
            path: account,
            storage: path,
        }
    }

    fn has_storage_part(&self) -> bool {
        self.ty == KeyType::StorageCell || self.storage_merkle
    }

    pub fn slice_path(mut self, n: usize) -> Key<'a> {
        self.path = self.path.slice_from(n);
        self
    }
}

/// Закодированный ключ на стеке.
#[derive(Clone, Copy)]
pub struct StoreKey {
    buf: [u8; MAX_STORE_KEY_BYTES],
    len: u8,
}

impl StoreKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }
}

impl std::ops::Deref for StoreKey {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreKey(")?;
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Предикат плотной упаковки: длина 2 или 4, каждый второй нибл < 8.
fn dense_kind(path: &NibblePath<'_>) -> u8 {
    match path.len() {
        2 if path.nibble_at(1) < 8 => TAG_DENSE2,
        4 if path.nibble_at(1) < 8 && path.nibble_at(3) < 8 => TAG_DENSE4,
        _ => 0,
    }
}

/// Кодирует ключ. `short` помечает ключ, сохранённый без отрезания
/// маршрутных ниблов (путь короче потребляемого корнем).
pub fn encode(key: &Key<'_>, short: bool) -> StoreKey {
    let mut buf = [0u8; MAX_STORE_KEY_BYTES];
    let mut tag = key.ty as u8;
    if key.storage_merkle {
        tag |= TAG_STORAGE_MERKLE;
    }
    if short {
        tag |= TAG_SHORT;
    }
    let dense = dense_kind(&key.path);
    tag |= dense;
    buf[0] = tag;
    let mut pos = 1;
    match dense {
        TAG_DENSE2 => {
            buf[pos] = (key.path.nibble_at(0) << 4) | key.path.nibble_at(1);
            pos += 1;
        }
        TAG_DENSE4 => {
            buf[pos] = (key.path.nibble_at(0) << 4) | key.path.nibble_at(1);
            buf[pos + 1] = (key.path.nibble_at(2) << 4) | key.path.nibble_at(3);
            pos += 2;
        }
        _ => {
            pos += key.path.write_to_slice(&mut buf[pos..]);
        }
    }
    if key.has_storage_part() {
        pos += key.storage.write_to_slice(&mut buf[pos..]);
    }
    StoreKey {
        buf,
        len: pos as u8,
    }
}

/// Раскодированный ключ с собственными буферами (ниблы нормализованы
/// к чётному старту).
#[derive(Clone, Copy)]
pub struct DecodedKey {
    pub ty: KeyType,
    pub storage_merkle: bool,
    pub short: bool,
    path_buf: [u8; 33],
    path_len: u8,
    storage_buf: [u8; 33],
    storage_len: u8,
}

impl DecodedKey {
    pub fn path(&self) -> NibblePath<'_> {
        NibblePath::new(&self.path_buf, 0, self.path_len)
    }

    pub fn storage(&self) -> NibblePath<'_> {
        NibblePath::new(&self.storage_buf, 0, self.storage_len)
    }

    pub fn as_key(&self) -> Key<'_> {
        Key {
            ty: self.ty,
            storage_merkle: self.storage_merkle,
            path: self.path(),
            storage: self.storage(),
        }
    }

    fn has_storage_part(&self) -> bool {
        self.ty == KeyType::StorageCell || self.storage_merkle
    }

    /// Длина комбинированного потока (путь ++ storage).
    pub fn stream_len(&self) -> usize {
        self.path_len as usize + self.storage_len as usize
    }

    pub fn stream_nibble(&self, i: usize) -> u8 {
        if i < self.path_len as usize {
            self.path().nibble_at(i)
        } else {
            self.storage().nibble_at(i - self.path_len as usize)
        }
    }

    /// Срез комбинированного потока на n ниблов спереди.
    pub fn slice_stream(&self, n: usize) -> DecodedKey {
        debug_assert!(n <= self.stream_len());
        let mut out = *self;
        let from_path = n.min(self.path_len as usize);
        let from_storage = n - from_path;
        out.path_len = pack_into(&self.path().slice_from(from_path), &mut out.path_buf);
        out.storage_len = pack_into(&self.storage().slice_from(from_storage), &mut out.storage_buf);
        out
    }

    pub fn encode(&self) -> StoreKey {
        encode(&self.as_key(), self.short)
    }
}

fn pack_into(p: &NibblePath<'_>, buf: &mut [u8; 33]) -> u8 {
    let mut scratch = [0u8; 34];
    let n = p.write_to_slice(&mut scratch);
    buf[..n - 1].copy_from_slice(&scratch[1..n]);
    p.len() as u8
}

pub fn decode(enc: &[u8]) -> Result<DecodedKey> {
    if enc.is_empty() {
        return Err(anyhow!("store key: empty"));
    }
    let tag = enc[0];
    let ty = KeyType::from_bits(tag & TAG_TYPE_MASK)?;
    let storage_merkle = tag & TAG_STORAGE_MERKLE != 0;
    if storage_merkle && ty != KeyType::Merkle {
        return Err(anyhow!("store key: storage-merkle bit on non-merkle key"));
    }
    let short = tag & TAG_SHORT != 0;

    let mut out = DecodedKey {
        ty,
        storage_merkle,
        short,
        path_buf: [0u8; 33],
        path_len: 0,
        storage_buf: [0u8; 33],
        storage_len: 0,
    };

    let mut pos = 1;
    match tag & (TAG_DENSE2 | TAG_DENSE4) {
        TAG_DENSE2 => {
            if enc.len() < 2 {
                return Err(anyhow!("store key: truncated dense2"));
            }
            out.path_buf[0] = enc[1];
            out.path_len = 2;
            pos += 1;
        }
        TAG_DENSE4 => {
            if enc.len() < 3 {
                return Err(anyhow!("store key: truncated dense4"));
            }
            out.path_buf[0] = enc[1];
            out.path_buf[1] = enc[2];
            out.path_len = 4;
            pos += 2;
        }
        0 => {
            let (p, used) = NibblePath::read_from(&enc[pos..])?;
            out.path_len = pack_into(&p, &mut out.path_buf);
            pos += used;
        }
        _ => return Err(anyhow!("store key: both dense bits set")),
    }

    if out.has_storage_part() {
        let (s, used) = NibblePath::read_from(&enc[pos..])?;
        out.storage_len = pack_into(&s, &mut out.storage_buf);
        pos += used;
    }
    if pos != enc.len() {
        return Err(anyhow!(
            "store key: trailing bytes ({} of {})",
            enc.len() - pos,
            enc.len()
        ));
    }
    Ok(out)
}

/// Первый нибл комбинированного потока закодированного ключа
/// (дёшево: без полного decode для обычных форм).
pub fn first_stream_nibble(enc: &[u8]) -> Option<u8> {
    let tag = *enc.first()?;
    if tag & (TAG_DENSE2 | TAG_DENSE4) != 0 {
        return Some(enc[1] >> 4);
    }
    let len_byte = enc[1];
    let len = (len_byte & 0x7F) as usize;
    if len > 0 {
        let odd = len_byte >> 7;
        return Some(if odd == 0 { enc[2] >> 4 } else { enc[2] & 0x0F });
    }
    // Путь пуст — первый нибл storage-части, если она есть.
    let ty = tag & TAG_TYPE_MASK;
    let has_storage = ty == KeyType::StorageCell as u8 || tag & TAG_STORAGE_MERKLE != 0;
    if !has_storage {
        return None;
    }
    let spos = 2; // tag + пустой байт длины пути
    let slen = (enc[spos] & 0x7F) as usize;
    if slen == 0 {
        return None;
    }
    let odd = enc[spos] >> 7;
    Some(if odd == 0 {
        enc[spos + 1] >> 4
    } else {
        enc[spos + 1] & 0x0F
    })
}

/// Первые два нибла потока (для enumerate_two_nibbles).
pub fn first_two_stream_nibbles(enc: &[u8]) -> (Option<u8>, Option<u8>) {
    match decode(enc) {
        Ok(dk) => {
            let n0 = (dk.stream_len() > 0).then(|| dk.stream_nibble(0));
            let n1 = (dk.stream_len() > 1).then(|| dk.stream_nibble(1));
            (n0, n1)
        }
        Err(_) => (None, None),
    }
}

/// Срез комбинированного потока закодированного ключа: decode -> slice ->
/// encode, чтобы байты совпадали с кодировкой, которую построил бы
/// маршрутизирующий слой для того же логического ключа.
pub fn slice_encoded(enc: &[u8], n: usize) -> Result<StoreKey> {
    Ok(decode(enc)?.slice_stream(n).encode())
}

/// Префиксное совпадение по комбинированному потоку. Тип не сравнивается:
/// префикс описывает поддерево, и выметаются все классы ключей под ним.
/// Сравнение корректно только в одной "рамке" среза: short-ключи хранятся
/// неотрезанными и сопоставляются лишь с short-префиксами (их точечную
/// зачистку делает маршрутизирующий слой).
pub fn matches_stream_prefix(enc: &[u8], prefix: &DecodedKey) -> bool {
    let Ok(dk) = decode(enc) else {
        return false;
    };
    if dk.short != prefix.short {
        return false;
    }
    let plen = prefix.stream_len();
    if dk.stream_len() < plen {
        return false;
    }
    (0..plen).all(|i| dk.stream_nibble(i) == prefix.stream_nibble(i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_predicate_exact() {
        // длина 2, второй нибл < 8 -> dense2
        let d = [0x17u8];
        let p = NibblePath::new(&d, 0, 2);
        assert_eq!(dense_kind(&p), TAG_DENSE2);
        // второй нибл >= 8 -> обычная форма
        let d = [0x18u8];
        let p = NibblePath::new(&d, 0, 2);
        assert_eq!(dense_kind(&p), 0);
        // длина 4: оба вторых нибла < 8
        let d = [0x17, 0x25];
        let p = NibblePath::new(&d, 0, 4);
        assert_eq!(dense_kind(&p), TAG_DENSE4);
        // длина 4, четвёртый нибл >= 8
        let d = [0x17, 0x2F];
        let p = NibblePath::new(&d, 0, 4);
        assert_eq!(dense_kind(&p), 0);
        // другие длины не пакуются
        let d = [0x11, 0x11, 0x11];
        let p = NibblePath::new(&d, 0, 6);
        assert_eq!(dense_kind(&p), 0);
    }

    #[test]
    fn encode_decode_roundtrip_all_kinds() {
        let acct = [0xABu8; 32];
        let slot = [0xCDu8; 32];
        let ap = NibblePath::from_keccak(&acct);
        let sp = NibblePath::from_keccak(&slot);

        let keys = [
            Key::account(ap),
            Key::storage_cell(ap, sp),
            Key::merkle(ap.slice_to(7)),
            Key::merkle(NibblePath::empty()),
            Key::storage_merkle(ap, sp.slice_to(3)),
        ];
        for key in &keys {
            let enc = encode(key, false);
            let dk = decode(&enc).unwrap();
            assert_eq!(dk.ty, key.ty);
            assert_eq!(dk.storage_merkle, key.storage_merkle);
            assert_eq!(dk.path(), key.path);
            assert_eq!(dk.storage(), key.storage);
            // reencode побайтно стабилен
            assert_eq!(dk.encode().as_bytes(), enc.as_bytes());
        }
    }

    #[test]
    fn dense_roundtrip() {
        let d = [0x17u8, 0x25];
        let p2 = NibblePath::new(&d, 0, 2);
        let p4 = NibblePath::new(&d, 0, 4);
        for (p, want_len) in [(p2, 2usize), (p4, 3usize)] {
            let key = Key::merkle(p);
            let enc = encode(&key, true);
            assert_eq!(enc.as_bytes().len(), want_len);
            let dk = decode(&enc).unwrap();
            assert!(dk.short);
            assert_eq!(dk.path(), p);
        }
    }

    #[test]
    fn injective_across_types() {
        let h = [0x11u8; 32];
        let p = NibblePath::from_keccak(&h);
        let a = encode(&Key::account(p), false);
        let m = encode(&Key::merkle(p), false);
        let sm = encode(&Key::storage_merkle(p, NibblePath::empty()), false);
        assert_ne!(a.as_bytes(), m.as_bytes());
        assert_ne!(m.as_bytes(), sm.as_bytes());
    }

    #[test]
    fn short_flag_distinguishes_unsliced() {
        let d = [0xA0u8];
        let p = NibblePath::new(&d, 0, 1);
        let short = encode(&Key::merkle(p), true);
        let normal = encode(&Key::merkle(p), false);
        assert_ne!(short.as_bytes(), normal.as_bytes());
    }

    #[test]
    fn stream_slicing_crosses_into_storage() {
        let acct = [0x12u8; 32];
        let slot = [0x34u8; 32];
        let key = Key::storage_cell(NibblePath::from_keccak(&acct), NibblePath::from_keccak(&slot));
        let enc = encode(&key, false);
        let dk = decode(&enc).unwrap();
        assert_eq!(dk.stream_len(), 128);
        // срез на весь путь + 2 нибла storage
        let sliced = dk.slice_stream(66);
        assert_eq!(sliced.path().len(), 0);
        assert_eq!(sliced.storage().len(), 62);
        assert_eq!(sliced.stream_nibble(0), 0x3);

        // пошаговый срез согласован с encode/slice_encoded
        let one = slice_encoded(&enc, 1).unwrap();
        let dk1 = decode(&one).unwrap();
        assert_eq!(dk1.path().len(), 63);
        assert_eq!(dk1.stream_nibble(0), 0x2);
    }

    #[test]
    fn first_stream_nibble_matches_decode() {
        let acct = [0x9Eu8; 32];
        let slot = [0x71u8; 32];
        let ap = NibblePath::from_keccak(&acct);
        let sp = NibblePath::from_keccak(&slot);
        let cases = [
            encode(&Key::account(ap), false),
            encode(&Key::storage_cell(ap, sp), false),
            encode(&Key::merkle(ap.slice_to(2)), false),
            encode(&Key::merkle(NibblePath::empty()), false),
            encode(&Key::storage_merkle(ap, sp.slice_to(5)), false),
        ];
        for enc in &cases {
            let dk = decode(enc).unwrap();
            let expect = (dk.stream_len() > 0).then(|| dk.stream_nibble(0));
            assert_eq!(first_stream_nibble(enc), expect, "{:?}", enc);
        }
    }

    #[test]
    fn prefix_matching_over_stream() {
        let acct = [0x12u8; 32];
        let slot_a = [0x34u8; 32];
        let mut slot_b = slot_a;
        slot_b[31] = 0x35; // отличается последним ниблом
        let ap = NibblePath::from_keccak(&acct);

        let cell_a = encode(&Key::storage_cell(ap, NibblePath::from_keccak(&slot_a)), false);
        let cell_b = encode(&Key::storage_cell(ap, NibblePath::from_keccak(&slot_b)), false);

        let prefix_key = Key::storage_merkle(ap, NibblePath::from_keccak(&slot_a).slice_to(63));
        let prefix = decode(&encode(&prefix_key, false)).unwrap();

        assert!(matches_stream_prefix(&cell_a, &prefix));
        assert!(matches_stream_prefix(&cell_b, &prefix));

        let other_acct = [0x21u8; 32];
        let cell_c = encode(
            &Key::storage_cell(
                NibblePath::from_keccak(&other_acct),
                NibblePath::from_keccak(&slot_a),
            ),
            false,
        );
        assert!(!matches_stream_prefix(&cell_c, &prefix));
    }

    #[test]
    fn account_key_is_compact() {
        let h = [0xFFu8; 32];
        let enc = encode(&Key::account(NibblePath::from_keccak(&h)), false);
        assert_eq!(enc.as_bytes().len(), 1 + 1 + 32);
    }
}
