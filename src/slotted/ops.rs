//! Базовые операции карты: init / try_set / get / delete / compact.

use crate::util::{varint_len, write_varint};

use super::{
    entry_size, find, read_entry, read_header, read_slot, slot_is_deleted, write_header,
    write_slot, Header, FLAG_DELETED, HEADER_SIZE, OFFSET_MASK, SLOT_SIZE,
};

pub fn init(body: &mut [u8]) {
    debug_assert!(body.len() > HEADER_SIZE && body.len() <= OFFSET_MASK as usize + 1);
    let h = Header {
        count: 0,
        deleted: 0,
        payload_low: body.len() as u16,
        dead_bytes: 0,
    };
    write_header(body, &h);
}

pub fn get<'a>(body: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let (_idx, off) = find(body, key)?;
    let (_k, v, _sz) = read_entry(body, off);
    Some(v)
}

pub fn contains(body: &[u8], key: &[u8]) -> bool {
    find(body, key).is_some()
}

/// Число живых записей.
pub fn count(body: &[u8]) -> usize {
    let h = read_header(body);
    (h.count - h.deleted) as usize
}

/// Свободное непрерывное место между слотами и payload.
pub fn capacity_left(body: &[u8]) -> usize {
    let h = read_header(body);
    let slots_end = HEADER_SIZE + h.count as usize * SLOT_SIZE;
    (h.payload_low as usize).saturating_sub(slots_end)
}

/// Помечает слот удалённым. Данные не двигаются.
pub fn delete(body: &mut [u8], key: &[u8]) -> bool {
    let Some((idx, off)) = find(body, key) else {
        return false;
    };
    let (_k, _v, sz) = read_entry(body, off);
    let (off_flags, hash) = read_slot(body, idx);
    write_slot(body, idx, off_flags | FLAG_DELETED, hash);
    let mut h = read_header(body);
    h.deleted += 1;
    h.dead_bytes += sz as u16;
    write_header(body, &h);
    true
}

/// Вставка/обновление. false — только если места не хватает даже после
/// одной компакции; карта при этом не меняется.
pub fn try_set(body: &mut [u8], key: &[u8], value: &[u8]) -> bool {
    let new_size = entry_size(key.len(), value.len());

    if let Some((idx, off)) = find(body, key) {
        let (_k, old_v, old_size) = read_entry(body, off);
        let old_vlen = old_v.len();
        // Хвост записи начиная с varint длины значения.
        let tail_off = off + varint_len(key.len() as u16) + key.len();
        let old_tail = varint_len(old_vlen as u16) + old_vlen;
        let new_tail = varint_len(value.len() as u16) + value.len();
        if new_tail <= old_tail {
            // Переписываем на месте (равный или меньший размер).
            let w = write_varint(body, tail_off, value.len() as u16);
            body[tail_off + w..tail_off + w + value.len()].copy_from_slice(value);
            if new_tail < old_tail {
                let mut h = read_header(body);
                h.dead_bytes += (old_tail - new_tail) as u16;
                write_header(body, &h);
            }
            return true;
        }

        // Новая запись больше: проверяем выполнимость до каких-либо правок.
        if !fits_after_rewrite(body, new_size, old_size, 0) {
            return false;
        }
        // Tombstone старой записи, затем вставка свежей (слот переиспользуется,
        // число слотов не растёт).
        let (off_flags, hash) = read_slot(body, idx);
        write_slot(body, idx, off_flags | FLAG_DELETED, hash);
        let mut h = read_header(body);
        h.deleted += 1;
        h.dead_bytes += old_size as u16;
        write_header(body, &h);
        let ok = insert_new(body, key, value);
        debug_assert!(ok, "feasibility check promised space");
        return ok;
    }

    // Новый ключ. Рост слотов считаем консервативно: компакция выбрасывает
    // tombstone-слоты, и вставка может потребовать свежий слот даже при
    // наличии переиспользуемого сейчас.
    if !fits_after_rewrite(body, new_size, 0, SLOT_SIZE) {
        return false;
    }
    let ok = insert_new(body, key, value);
    debug_assert!(ok, "feasibility check promised space");
    ok
}

/// Выполнимость вставки new_size с учётом того, что removed_size и все
/// мёртвые байты исчезнут после компакции, а слоты вырастут на slot_growth.
fn fits_after_rewrite(body: &[u8], new_size: usize, removed_size: usize, slot_growth: usize) -> bool {
    let h = read_header(body);
    let live_slots = (h.count - h.deleted) as usize;
    let slots_end = HEADER_SIZE + live_slots * SLOT_SIZE + slot_growth;
    let payload_used = body.len() - h.payload_low as usize;
    let live_payload = payload_used - h.dead_bytes as usize - removed_size;
    body.len() >= slots_end + live_payload + new_size
}

fn first_deleted_slot(body: &[u8], h: &Header) -> Option<usize> {
    if h.deleted == 0 {
        return None;
    }
    (0..h.count as usize).find(|&i| slot_is_deleted(read_slot(body, i).0))
}

/// Вставка записи, которой гарантированно хватает места (после возможной
/// компакции). Переиспользует первый tombstone-слот.
fn insert_new(body: &mut [u8], key: &[u8], value: &[u8]) -> bool {
    let new_size = entry_size(key.len(), value.len());
    let h = read_header(body);
    let reuse = first_deleted_slot(body, &h);
    let slots_end =
        HEADER_SIZE + (h.count as usize + if reuse.is_some() { 0 } else { 1 }) * SLOT_SIZE;
    let free = (h.payload_low as usize).saturating_sub(slots_end);
    if free < new_size {
        compact(body);
        // После компакции tombstone-слотов нет; слот будет новым.
        let h2 = read_header(body);
        let slots_end2 = HEADER_SIZE + (h2.count as usize + 1) * SLOT_SIZE;
        let free2 = (h2.payload_low as usize).saturating_sub(slots_end2);
        if free2 < new_size {
            return false;
        }
        return write_entry_and_slot(body, key, value, None);
    }
    write_entry_and_slot(body, key, value, reuse)
}

fn write_entry_and_slot(body: &mut [u8], key: &[u8], value: &[u8], reuse: Option<usize>) -> bool {
    let new_size = entry_size(key.len(), value.len());
    let mut h = read_header(body);
    let off = h.payload_low as usize - new_size;
    let mut pos = off;
    pos += write_varint(body, pos, key.len() as u16);
    body[pos..pos + key.len()].copy_from_slice(key);
    pos += key.len();
    pos += write_varint(body, pos, value.len() as u16);
    body[pos..pos + value.len()].copy_from_slice(value);

    let hash = super::hash16(key);
    match reuse {
        Some(idx) => {
            write_slot(body, idx, off as u16, hash);
            h.deleted -= 1;
        }
        None => {
            write_slot(body, h.count as usize, off as u16, hash);
            h.count += 1;
        }
    }
    h.payload_low = off as u16;
    write_header(body, &h);
    true
}

/// Полная перепаковка: живые записи переписываются подряд с хвоста,
/// tombstone-слоты выбрасываются, порядок живых слотов сохраняется.
pub fn compact(body: &mut [u8]) {
    let h = read_header(body);
    let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity((h.count - h.deleted) as usize);
    for idx in 0..h.count as usize {
        let (off_flags, _hash) = read_slot(body, idx);
        if slot_is_deleted(off_flags) {
            continue;
        }
        let off = (off_flags & OFFSET_MASK) as usize;
        let (k, v, _sz) = read_entry(body, off);
        pairs.push((k.to_vec(), v.to_vec()));
    }

    init(body);
    for (k, v) in pairs {
        let ok = write_entry_and_slot(body, &k, &v, None);
        debug_assert!(ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(n: usize) -> Vec<u8> {
        let mut b = vec![0u8; n];
        init(&mut b);
        b
    }

    #[test]
    fn set_get_roundtrip() {
        let mut b = body(512);
        assert!(try_set(&mut b, b"key-a", b"value-1"));
        assert!(try_set(&mut b, b"key-b", b"value-2"));
        assert_eq!(get(&b, b"key-a"), Some(&b"value-1"[..]));
        assert_eq!(get(&b, b"key-b"), Some(&b"value-2"[..]));
        assert_eq!(get(&b, b"key-c"), None);
        assert_eq!(count(&b), 2);
    }

    #[test]
    fn overwrite_same_size_in_place() {
        let mut b = body(256);
        assert!(try_set(&mut b, b"k", b"aaaa"));
        let left = capacity_left(&b);
        assert!(try_set(&mut b, b"k", b"bbbb"));
        assert_eq!(get(&b, b"k"), Some(&b"bbbb"[..]));
        assert_eq!(capacity_left(&b), left);
        assert_eq!(count(&b), 1);
    }

    #[test]
    fn overwrite_smaller_shrinks() {
        let mut b = body(256);
        assert!(try_set(&mut b, b"k", b"aaaaaaaa"));
        assert!(try_set(&mut b, b"k", b"bb"));
        assert_eq!(get(&b, b"k"), Some(&b"bb"[..]));
        assert_eq!(count(&b), 1);
    }

    #[test]
    fn overwrite_larger_does_not_grow_slot_count() {
        let mut b = body(256);
        assert!(try_set(&mut b, b"k", b"aa"));
        let h0 = read_header(&b);
        assert!(try_set(&mut b, b"k", b"aaaaaaaaaaaaaaaa"));
        assert_eq!(get(&b, b"k"), Some(&b"aaaaaaaaaaaaaaaa"[..]));
        let h1 = read_header(&b);
        assert_eq!(h0.count, h1.count);
    }

    #[test]
    fn delete_then_get_absent() {
        let mut b = body(256);
        assert!(try_set(&mut b, b"k", b"v"));
        assert!(delete(&mut b, b"k"));
        assert_eq!(get(&b, b"k"), None);
        assert!(!delete(&mut b, b"k"));
        assert_eq!(count(&b), 0);
    }

    #[test]
    fn empty_key_and_empty_value_are_valid() {
        let mut b = body(128);
        assert!(try_set(&mut b, b"", b"root"));
        assert_eq!(get(&b, b""), Some(&b"root"[..]));
        assert!(try_set(&mut b, b"zero", b""));
        assert_eq!(get(&b, b"zero"), Some(&b""[..]));
        assert_ne!(get(&b, b"zero"), None);
    }

    #[test]
    fn full_map_fails_cleanly_then_recovers_after_delete() {
        let mut b = body(96);
        let mut stored = Vec::new();
        for i in 0u32.. {
            let k = format!("key{}", i);
            if !try_set(&mut b, k.as_bytes(), b"0123456789") {
                break;
            }
            stored.push(k);
        }
        assert!(!stored.is_empty());
        // Все ранее вставленные живы (false не попортил карту).
        for k in &stored {
            assert_eq!(get(&b, k.as_bytes()), Some(&b"0123456789"[..]));
        }
        // После удаления место возвращается через компакцию.
        assert!(delete(&mut b, stored[0].as_bytes()));
        assert!(try_set(&mut b, b"fresh", b"0123456789"));
        assert_eq!(get(&b, b"fresh"), Some(&b"0123456789"[..]));
    }

    #[test]
    fn colliding_hash16_keys_both_retrievable() {
        // Подбираем две пары с коллизией hash16 перебором.
        let mut b = body(1024);
        let base = super::super::hash16(b"seed-0");
        let mut other = None;
        for i in 1u32..200_000 {
            let k = format!("seed-{}", i);
            if super::super::hash16(k.as_bytes()) == base {
                other = Some(k);
                break;
            }
        }
        let other = other.expect("collision must exist in 16-bit space");
        assert!(try_set(&mut b, b"seed-0", b"first"));
        assert!(try_set(&mut b, other.as_bytes(), b"second"));
        assert_eq!(get(&b, b"seed-0"), Some(&b"first"[..]));
        assert_eq!(get(&b, other.as_bytes()), Some(&b"second"[..]));
    }

    #[test]
    fn same_insert_twice_is_byte_stable() {
        let mut b1 = body(256);
        assert!(try_set(&mut b1, b"k", b"v"));
        let snapshot = b1.clone();
        assert!(try_set(&mut b1, b"k", b"v"));
        assert_eq!(b1, snapshot);
    }
}
