//! Обход живых записей и массовые перемещения по ниблам ключа.

use anyhow::{anyhow, Result};

use crate::key;

use super::{
    read_entry, read_header, read_slot, slot_is_deleted, try_set, write_header, write_slot,
    FLAG_DELETED, OFFSET_MASK,
};

/// Итератор живых (key, value) в порядке слотов.
pub struct Iter<'a> {
    body: &'a [u8],
    idx: usize,
    count: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.idx < self.count {
            let idx = self.idx;
            self.idx += 1;
            let (off_flags, _hash) = read_slot(self.body, idx);
            if slot_is_deleted(off_flags) {
                continue;
            }
            let off = (off_flags & OFFSET_MASK) as usize;
            let (k, v, _sz) = read_entry(self.body, off);
            return Some((k, v));
        }
        None
    }
}

pub fn enumerate_all(body: &[u8]) -> Iter<'_> {
    let h = read_header(body);
    Iter {
        body,
        idx: 0,
        count: h.count as usize,
    }
}

/// Только записи, чей первый нибл потока ключа равен n.
pub fn enumerate_nibble(body: &[u8], n: u8) -> impl Iterator<Item = (&[u8], &[u8])> {
    enumerate_all(body).filter(move |(k, _)| key::first_stream_nibble(k) == Some(n))
}

/// Только записи с первыми двумя ниблами (n0, n1).
pub fn enumerate_two_nibbles(body: &[u8], n0: u8, n1: u8) -> impl Iterator<Item = (&[u8], &[u8])> {
    enumerate_all(body).filter(move |(k, _)| {
        key::first_two_stream_nibbles(k) == (Some(n0), Some(n1))
    })
}

/// Сливает записи в назначения по маршрутизатору поверх байтов ключа.
/// None — запись остаётся на месте (в частности, ключ с пустым потоком).
/// respect_tombstones=true выбрасывает tombstone-ключи совсем; иначе они
/// воспроизводятся в назначении как tombstone.
///
/// Возвращает число перемещённых живых записей.
pub fn move_non_empty_keys_to(
    src: &mut [u8],
    dests: &mut [&mut [u8]],
    route: impl Fn(&[u8]) -> Option<usize>,
    respect_tombstones: bool,
) -> Result<usize> {
    // Сначала собираем план: страницу нельзя править под итерацией.
    let mut moves: Vec<(usize, Vec<u8>, Option<Vec<u8>>)> = Vec::new();
    {
        let h = read_header(src);
        for idx in 0..h.count as usize {
            let (off_flags, _hash) = read_slot(src, idx);
            let deleted = slot_is_deleted(off_flags);
            if deleted && respect_tombstones {
                continue;
            }
            let off = (off_flags & OFFSET_MASK) as usize;
            let (k, v, _sz) = read_entry(src, off);
            let Some(d) = route(k) else {
                continue;
            };
            if d >= dests.len() {
                return Err(anyhow!("move: route produced {} of {} dests", d, dests.len()));
            }
            moves.push((d, k.to_vec(), (!deleted).then(|| v.to_vec())));
        }
    }

    let mut moved = 0usize;
    for (d, k, v) in &moves {
        match v {
            Some(v) => {
                if !try_set(&mut *dests[*d], k, v) {
                    return Err(anyhow!("move: destination {} overflow", d));
                }
                moved += 1;
            }
            None => {
                // Воспроизводим tombstone: запись и немедленное удаление.
                if !try_set(&mut *dests[*d], k, &[]) {
                    return Err(anyhow!("move: destination {} overflow", d));
                }
                super::delete(&mut *dests[*d], k);
            }
        }
    }

    // Теперь вычищаем перемещённое из источника и уплотняем.
    for (_d, k, _v) in &moves {
        remove_any(src, k);
    }
    super::compact(src);
    Ok(moved)
}

/// Удаляет слот ключа независимо от tombstone-статуса.
fn remove_any(body: &mut [u8], target: &[u8]) {
    let h = read_header(body);
    for idx in 0..h.count as usize {
        let (off_flags, hash) = read_slot(body, idx);
        let off = (off_flags & OFFSET_MASK) as usize;
        let (k, _v, sz) = read_entry(body, off);
        if k != target {
            continue;
        }
        if !slot_is_deleted(off_flags) {
            let mut hh = read_header(body);
            hh.deleted += 1;
            hh.dead_bytes += sz as u16;
            write_header(body, &hh);
        }
        write_slot(body, idx, off_flags | FLAG_DELETED, hash);
        return;
    }
}

/// Удаляет из body все ключи, присутствующие (живыми) в other.
pub fn remove_keys_from(body: &mut [u8], other: &[u8]) -> usize {
    let keys: Vec<Vec<u8>> = enumerate_all(other).map(|(k, _)| k.to_vec()).collect();
    let mut removed = 0;
    for k in keys {
        if super::delete(body, &k) {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::super::{count, delete, get, init, try_set};
    use super::*;
    use crate::key::{encode, Key};
    use crate::nibble::NibblePath;

    fn body(n: usize) -> Vec<u8> {
        let mut b = vec![0u8; n];
        init(&mut b);
        b
    }

    fn merkle_key(hash: &[u8; 32], upto: usize) -> Vec<u8> {
        encode(&Key::merkle(NibblePath::from_keccak(hash).slice_to(upto)), false).to_vec()
    }

    #[test]
    fn enumerate_yields_permutation_of_live() {
        let mut b = body(512);
        let h1 = [0x10u8; 32];
        let h2 = [0x25u8; 32];
        let h3 = [0x3Au8; 32];
        let k1 = merkle_key(&h1, 10);
        let k2 = merkle_key(&h2, 10);
        let k3 = merkle_key(&h3, 10);
        assert!(try_set(&mut b, &k1, b"one"));
        assert!(try_set(&mut b, &k2, b"two"));
        assert!(try_set(&mut b, &k3, b"three"));
        assert!(delete(&mut b, &k2));

        let got: Vec<(Vec<u8>, Vec<u8>)> = enumerate_all(&b)
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        assert_eq!(got.len(), 2);
        assert!(got.contains(&(k1.clone(), b"one".to_vec())));
        assert!(got.contains(&(k3.clone(), b"three".to_vec())));
    }

    #[test]
    fn enumerate_nibble_filters() {
        let mut b = body(512);
        let h1 = [0x10u8; 32]; // первый нибл 1
        let h2 = [0x25u8; 32]; // первый нибл 2
        let k1 = merkle_key(&h1, 8);
        let k2 = merkle_key(&h2, 8);
        assert!(try_set(&mut b, &k1, b"a"));
        assert!(try_set(&mut b, &k2, b"b"));

        let only1: Vec<_> = enumerate_nibble(&b, 1).collect();
        assert_eq!(only1.len(), 1);
        assert_eq!(only1[0].1, b"a");

        let two: Vec<_> = enumerate_two_nibbles(&b, 2, 5).collect();
        assert_eq!(two.len(), 1);
        assert_eq!(two[0].1, b"b");
    }

    #[test]
    fn move_routes_every_nonempty_key_exactly_once() {
        let mut src = body(1024);
        let mut d0 = body(1024);
        let mut d1 = body(1024);

        let empty = encode(&Key::merkle(NibblePath::empty()), true).to_vec();
        assert!(try_set(&mut src, &empty, b"home"));

        let mut keys = Vec::new();
        for i in 0..8u8 {
            let h = [i << 4; 32];
            let k = merkle_key(&h, 6);
            assert!(try_set(&mut src, &k, b"payload"));
            keys.push(k);
        }

        let moved = {
            let mut dests: [&mut [u8]; 2] = [&mut d0, &mut d1];
            move_non_empty_keys_to(
                &mut src,
                &mut dests,
                |k| crate::key::first_stream_nibble(k).map(|n| (n % 2) as usize),
                true,
            )
            .unwrap()
        };
        assert_eq!(moved, 8);

        // Пустой ключ остался дома, остальные распределились по чётности.
        assert_eq!(count(&src), 1);
        assert_eq!(get(&src, &empty), Some(&b"home"[..]));
        assert_eq!(count(&d0) + count(&d1), 8);
        for k in &keys {
            let n = crate::key::first_stream_nibble(k).unwrap();
            let in0 = get(&d0, k).is_some();
            let in1 = get(&d1, k).is_some();
            assert!(in0 ^ in1);
            assert_eq!(in0, n % 2 == 0);
        }
    }

    #[test]
    fn remove_keys_from_other() {
        let mut a = body(512);
        let mut b = body(512);
        let h1 = [0x44u8; 32];
        let h2 = [0x55u8; 32];
        let k1 = merkle_key(&h1, 12);
        let k2 = merkle_key(&h2, 12);
        assert!(try_set(&mut a, &k1, b"x"));
        assert!(try_set(&mut a, &k2, b"y"));
        assert!(try_set(&mut b, &k1, b"whatever"));

        assert_eq!(remove_keys_from(&mut a, &b), 1);
        assert_eq!(get(&a, &k1), None);
        assert_eq!(get(&a, &k2), Some(&b"y"[..]));
    }
}
