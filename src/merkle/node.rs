//! Кодек узлов дерева: Leaf / Extension / Branch как тегированные байтовые
//! строки, хранимые значением Merkle-ключа.
//!
//! Заголовочный байт: старшие два бита — тип (00 лист, 01 расширение,
//! 10 ветка). У ветки младшие биты выбирают опциональные поля:
//! [hdr][children u16][keccak 32]?[memo: set u16 + 32*n]?[embedded: set u16 + пути]?

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::bits::NibbleSet;
use crate::consts::KECCAK_SIZE;
use crate::nibble::{NibbleBuf, NibblePath};

const KIND_MASK: u8 = 0xC0;
const KIND_LEAF: u8 = 0x00;
const KIND_EXTENSION: u8 = 0x40;
const KIND_BRANCH: u8 = 0x80;

const BRANCH_HAS_KECCAK: u8 = 0x01;
const BRANCH_HAS_MEMO: u8 = 0x02;
const BRANCH_HAS_EMBEDDED: u8 = 0x04;

#[derive(Clone, Debug)]
pub enum Node {
    Leaf { path: NibbleBuf },
    Extension { path: NibbleBuf },
    Branch(Branch),
}

/// Ветка: набор детей, мемоизированный keccak самой ветки, мемо хэшей
/// детей и встроенные короткие листья (path хранится на месте, без
/// отдельного Merkle-ключа). Инвариант: embedded_set и memo_set —
/// подмножества children.
#[derive(Clone, Debug, Default)]
pub struct Branch {
    pub children: NibbleSet,
    pub keccak: Option<[u8; KECCAK_SIZE]>,
    memo_set: NibbleSet,
    memo: Vec<[u8; KECCAK_SIZE]>,
    embedded_set: NibbleSet,
    embedded: Vec<NibbleBuf>,
}

impl Branch {
    pub fn memo_get(&self, nibble: u8) -> Option<&[u8; KECCAK_SIZE]> {
        if !self.memo_set.contains(nibble) {
            return None;
        }
        Some(&self.memo[self.memo_set.dense_index(nibble)])
    }

    /// Полная замена мемо (результат пересчёта).
    pub fn memo_replace(&mut self, entries: &[(u8, [u8; KECCAK_SIZE])]) {
        self.memo_set = NibbleSet::EMPTY;
        self.memo.clear();
        // entries приходят в порядке ниблов — плотная укладка совпадает.
        for (n, h) in entries {
            debug_assert!(self.children.contains(*n));
            self.memo_set.set(*n);
            self.memo.push(*h);
        }
    }

    pub fn memo_clear(&mut self, nibble: u8) {
        if self.memo_set.contains(nibble) {
            let i = self.memo_set.dense_index(nibble);
            self.memo.remove(i);
            self.memo_set.unset(nibble);
        }
    }

    /// Сбрасывает всю мемоизацию (keccak ветки и мемо ребёнка nibble).
    pub fn invalidate(&mut self, nibble: u8) {
        self.keccak = None;
        self.memo_clear(nibble);
    }

    pub fn embedded_get(&self, nibble: u8) -> Option<&NibbleBuf> {
        if !self.embedded_set.contains(nibble) {
            return None;
        }
        Some(&self.embedded[self.embedded_set.dense_index(nibble)])
    }

    pub fn embedded_contains(&self, nibble: u8) -> bool {
        self.embedded_set.contains(nibble)
    }

    pub fn embedded_set_leaf(&mut self, nibble: u8, path: NibbleBuf) {
        self.children.set(nibble);
        if self.embedded_set.contains(nibble) {
            let i = self.embedded_set.dense_index(nibble);
            self.embedded[i] = path;
        } else {
            self.embedded_set.set(nibble);
            let i = self.embedded_set.dense_index(nibble);
            self.embedded.insert(i, path);
        }
    }

    pub fn embedded_remove(&mut self, nibble: u8) {
        if self.embedded_set.contains(nibble) {
            let i = self.embedded_set.dense_index(nibble);
            self.embedded.remove(i);
            self.embedded_set.unset(nibble);
        }
    }

    /// Убирает ребёнка целиком (бит, мемо, embedded).
    pub fn remove_child(&mut self, nibble: u8) {
        self.children.unset(nibble);
        self.memo_clear(nibble);
        self.embedded_remove(nibble);
    }
}

impl Node {
    pub fn leaf(path: &NibblePath<'_>) -> Node {
        Node::Leaf {
            path: NibbleBuf::from_path(path),
        }
    }

    pub fn extension(path: &NibblePath<'_>) -> Node {
        Node::Extension {
            path: NibbleBuf::from_path(path),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match self {
            Node::Leaf { path } => {
                out.push(KIND_LEAF);
                path.as_path().write_to(&mut out);
            }
            Node::Extension { path } => {
                out.push(KIND_EXTENSION);
                path.as_path().write_to(&mut out);
            }
            Node::Branch(b) => {
                let mut hdr = KIND_BRANCH;
                if b.keccak.is_some() {
                    hdr |= BRANCH_HAS_KECCAK;
                }
                if !b.memo_set.is_empty() {
                    hdr |= BRANCH_HAS_MEMO;
                }
                if !b.embedded_set.is_empty() {
                    hdr |= BRANCH_HAS_EMBEDDED;
                }
                out.push(hdr);
                let mut u16buf = [0u8; 2];
                LittleEndian::write_u16(&mut u16buf, b.children.0);
                out.extend_from_slice(&u16buf);
                if let Some(k) = &b.keccak {
                    out.extend_from_slice(k);
                }
                if !b.memo_set.is_empty() {
                    LittleEndian::write_u16(&mut u16buf, b.memo_set.0);
                    out.extend_from_slice(&u16buf);
                    for h in &b.memo {
                        out.extend_from_slice(h);
                    }
                }
                if !b.embedded_set.is_empty() {
                    LittleEndian::write_u16(&mut u16buf, b.embedded_set.0);
                    out.extend_from_slice(&u16buf);
                    for p in &b.embedded {
                        p.as_path().write_to(&mut out);
                    }
                }
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Node> {
        if data.is_empty() {
            return Err(anyhow!("merkle node: empty encoding"));
        }
        let hdr = data[0];
        match hdr & KIND_MASK {
            KIND_LEAF => {
                let (p, _used) = NibblePath::read_from(&data[1..])?;
                Ok(Node::Leaf {
                    path: NibbleBuf::from_path(&p),
                })
            }
            KIND_EXTENSION => {
                let (p, _used) = NibblePath::read_from(&data[1..])?;
                Ok(Node::Extension {
                    path: NibbleBuf::from_path(&p),
                })
            }
            KIND_BRANCH => {
                let mut pos = 1usize;
                let need = |pos: usize, n: usize| -> Result<()> {
                    if pos + n > data.len() {
                        Err(anyhow!("merkle branch: truncated at {}", pos))
                    } else {
                        Ok(())
                    }
                };
                need(pos, 2)?;
                let children = NibbleSet(LittleEndian::read_u16(&data[pos..pos + 2]));
                pos += 2;
                let mut b = Branch {
                    children,
                    ..Branch::default()
                };
                if hdr & BRANCH_HAS_KECCAK != 0 {
                    need(pos, KECCAK_SIZE)?;
                    let mut k = [0u8; KECCAK_SIZE];
                    k.copy_from_slice(&data[pos..pos + KECCAK_SIZE]);
                    b.keccak = Some(k);
                    pos += KECCAK_SIZE;
                }
                if hdr & BRANCH_HAS_MEMO != 0 {
                    need(pos, 2)?;
                    b.memo_set = NibbleSet(LittleEndian::read_u16(&data[pos..pos + 2]));
                    pos += 2;
                    for _ in 0..b.memo_set.count() {
                        need(pos, KECCAK_SIZE)?;
                        let mut h = [0u8; KECCAK_SIZE];
                        h.copy_from_slice(&data[pos..pos + KECCAK_SIZE]);
                        b.memo.push(h);
                        pos += KECCAK_SIZE;
                    }
                }
                if hdr & BRANCH_HAS_EMBEDDED != 0 {
                    need(pos, 2)?;
                    b.embedded_set = NibbleSet(LittleEndian::read_u16(&data[pos..pos + 2]));
                    pos += 2;
                    for _ in 0..b.embedded_set.count() {
                        let (p, used) = NibblePath::read_from(&data[pos..])?;
                        b.embedded.push(NibbleBuf::from_path(&p));
                        pos += used;
                    }
                }
                if !(b.memo_set.0 & !b.children.0 == 0 && b.embedded_set.0 & !b.children.0 == 0) {
                    return Err(anyhow!("merkle branch: memo/embedded outside children"));
                }
                Ok(Node::Branch(b))
            }
            other => Err(anyhow!("merkle node: unknown kind {:02x}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(bytes: &[u8], len: u8) -> NibbleBuf {
        NibbleBuf::from_path(&NibblePath::new(bytes, 0, len))
    }

    #[test]
    fn leaf_extension_roundtrip() {
        for (node, kind) in [
            (Node::Leaf { path: path(&[0xAB, 0xC0], 3) }, KIND_LEAF),
            (Node::Extension { path: path(&[0x12], 2) }, KIND_EXTENSION),
        ] {
            let enc = node.encode();
            assert_eq!(enc[0] & KIND_MASK, kind);
            match (Node::decode(&enc).unwrap(), &node) {
                (Node::Leaf { path: a }, Node::Leaf { path: b }) => {
                    assert_eq!(a.as_path(), b.as_path())
                }
                (Node::Extension { path: a }, Node::Extension { path: b }) => {
                    assert_eq!(a.as_path(), b.as_path())
                }
                _ => panic!("kind mismatch"),
            }
        }
    }

    #[test]
    fn branch_roundtrip_with_all_options() {
        let mut b = Branch::default();
        b.children.set(1);
        b.children.set(7);
        b.children.set(0xF);
        b.keccak = Some([0x42; 32]);
        b.memo_replace(&[(1, [0x11; 32]), (7, [0x77; 32])]);
        b.embedded_set_leaf(0xF, path(&[0xDE, 0xAD], 4));

        let enc = Node::Branch(b.clone()).encode();
        let Node::Branch(back) = Node::decode(&enc).unwrap() else {
            panic!("not a branch");
        };
        assert_eq!(back.children, b.children);
        assert_eq!(back.keccak, Some([0x42; 32]));
        assert_eq!(back.memo_get(1), Some(&[0x11; 32]));
        assert_eq!(back.memo_get(7), Some(&[0x77; 32]));
        assert_eq!(back.memo_get(2), None);
        assert_eq!(
            back.embedded_get(0xF).unwrap().as_path(),
            path(&[0xDE, 0xAD], 4).as_path()
        );
    }

    #[test]
    fn invalidate_drops_keccak_and_child_memo() {
        let mut b = Branch::default();
        b.children.set(3);
        b.children.set(4);
        b.keccak = Some([1; 32]);
        b.memo_replace(&[(3, [3; 32]), (4, [4; 32])]);
        b.invalidate(3);
        assert!(b.keccak.is_none());
        assert_eq!(b.memo_get(3), None);
        assert_eq!(b.memo_get(4), Some(&[4; 32]));
    }

    #[test]
    fn remove_child_clears_everything() {
        let mut b = Branch::default();
        b.embedded_set_leaf(5, path(&[0x50], 1));
        b.memo_replace(&[(5, [5; 32])]);
        b.remove_child(5);
        assert!(b.children.is_empty());
        assert!(b.embedded_get(5).is_none());
        assert!(b.memo_get(5).is_none());
    }

    #[test]
    fn minimal_branch_is_compact() {
        let mut b = Branch::default();
        b.children.set(0);
        b.children.set(1);
        let enc = Node::Branch(b).encode();
        assert_eq!(enc.len(), 3); // hdr + children u16
    }
}
