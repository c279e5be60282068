//! Расчёт Keccak-корня по узлам дерева: RLP-кодирование Leaf/Extension/
//! Branch, правило встраивания (<32 байт — сам RLP, иначе его keccak),
//! мемоизация веток на выделенных глубинах и параллельный обход детей
//! корня.
//!
//! Сам расчёт читающий: обновления мемо собираются в список и применяются
//! после, поэтому параллельные воркеры не трогают общий коммит, а слияние
//! по порядку ниблов делает результат независимым от планировщика.

use anyhow::Result;
use log::debug;

use crate::account::Account;
use crate::consts::{KECCAK_SIZE, MEMOIZE_EVERY, MEMOIZE_MIN_LEVEL};
use crate::error::Error;
use crate::key::Key;
use crate::nibble::{NibbleBuf, NibblePath};
use crate::rlp;
use crate::util::{keccak256, EMPTY_TRIE_ROOT};

use super::node::{Branch, Node};
use super::{MerkleRead, NodeSource};

/// Режимы расчёта.
#[derive(Clone, Copy, Debug, Default)]
pub struct ComputeFlags {
    /// Игнорировать мемоизированные keccak и пересчитать всё с нуля.
    pub skip_cached: bool,
    /// Пересчитывать storage root листьев состояния вместо хранимого.
    pub force_storage_root_recalc: bool,
}

/// Результат кодирования поддерева: короткий RLP встраивается в родителя,
/// длинный заменяется 32-байтным хэшем.
#[derive(Clone, Debug)]
pub enum KeccakOrRlp {
    Keccak([u8; KECCAK_SIZE]),
    Rlp(Vec<u8>),
}

impl KeccakOrRlp {
    pub fn to_hash(&self) -> [u8; KECCAK_SIZE] {
        match self {
            KeccakOrRlp::Keccak(k) => *k,
            KeccakOrRlp::Rlp(r) => keccak256(r),
        }
    }

    fn append_as_item(&self, out: &mut Vec<u8>) {
        match self {
            KeccakOrRlp::Keccak(k) => rlp::encode_bytes(k, out),
            // Уже готовый RLP-элемент — вставляется дословно.
            KeccakOrRlp::Rlp(r) => out.extend_from_slice(r),
        }
    }
}

fn embed_or_hash(encoded: Vec<u8>) -> KeccakOrRlp {
    if encoded.len() < KECCAK_SIZE {
        KeccakOrRlp::Rlp(encoded)
    } else {
        KeccakOrRlp::Keccak(keccak256(&encoded))
    }
}

/// Hex-prefix кодирование пути (чётность в флаговом нибле, признак листа
/// в старшем бите флага).
pub fn hex_prefix(path: &NibblePath<'_>, leaf: bool) -> Vec<u8> {
    let flag = if leaf { 2u8 } else { 0u8 };
    let mut out = Vec::with_capacity(1 + path.len() / 2);
    if path.len() % 2 == 0 {
        out.push(flag << 4);
        let mut i = 0;
        while i < path.len() {
            out.push((path.nibble_at(i) << 4) | path.nibble_at(i + 1));
            i += 2;
        }
    } else {
        out.push(((flag | 1) << 4) | path.nibble_at(0));
        let mut i = 1;
        while i < path.len() {
            out.push((path.nibble_at(i) << 4) | path.nibble_at(i + 1));
            i += 2;
        }
    }
    out
}

/// Источник значений листьев конкретного дерева.
pub(crate) trait LeafValues: Sync {
    /// Значение дерева по полному пути: RLP аккаунта для состояния,
    /// RLP ячейки для storage. Лист кодирует его байтовой строкой.
    fn leaf_value(&self, full_path: &NibblePath<'_>) -> Result<Vec<u8>>;
}

/// Листья дерева состояния: упакованный аккаунт -> RLP аккаунта.
pub(crate) struct StateLeaves<'a, R: MerkleRead + ?Sized> {
    pub commit: &'a R,
    pub flags: ComputeFlags,
}

impl<R: MerkleRead + ?Sized> LeafValues for StateLeaves<'_, R> {
    fn leaf_value(&self, full_path: &NibblePath<'_>) -> Result<Vec<u8>> {
        let raw = self
            .commit
            .get_value(&Key::account(*full_path))?
            .ok_or_else(|| {
                Error::IntegrityViolation("state leaf without account record".into())
            })?;
        let mut account = Account::read_from(&raw)?;
        if self.flags.force_storage_root_recalc {
            let nodes = StorageNodes {
                commit: self.commit,
                account: *full_path,
            };
            let leaves = StorageLeaves {
                commit: self.commit,
                account: *full_path,
            };
            let mut updates = Vec::new();
            account.storage_root =
                compute_root(&nodes, &leaves, self.flags, false, &mut updates)?;
            // Обновления мемо здесь отбрасываются: пересчёт по требованию.
        }
        let mut out = Vec::with_capacity(Account::MAX_BYTE_COUNT + 8);
        account.rlp_encode(&mut out);
        Ok(out)
    }
}

/// Листья storage-дерева аккаунта: канонические байты ячейки -> RLP.
pub(crate) struct StorageLeaves<'a, R: MerkleRead + ?Sized> {
    pub commit: &'a R,
    pub account: NibblePath<'a>,
}

impl<R: MerkleRead + ?Sized> LeafValues for StorageLeaves<'_, R> {
    fn leaf_value(&self, full_path: &NibblePath<'_>) -> Result<Vec<u8>> {
        let raw = self
            .commit
            .get_value(&Key::storage_cell(self.account, *full_path))?
            .ok_or_else(|| {
                Error::IntegrityViolation("storage leaf without cell record".into())
            })?;
        let mut out = Vec::with_capacity(raw.len() + 1);
        rlp::encode_bytes(&raw, &mut out);
        Ok(out)
    }
}

/// Узлы дерева состояния.
pub(crate) struct StateNodes<'a, R: MerkleRead + ?Sized>(pub &'a R);

impl<R: MerkleRead + ?Sized> NodeSource for StateNodes<'_, R> {
    fn node(&self, prefix: &NibblePath<'_>) -> Result<Option<Vec<u8>>> {
        self.0.get_value(&Key::merkle(*prefix))
    }
}

/// Узлы storage-дерева аккаунта.
pub(crate) struct StorageNodes<'a, R: MerkleRead + ?Sized> {
    pub commit: &'a R,
    pub account: NibblePath<'a>,
}

impl<R: MerkleRead + ?Sized> NodeSource for StorageNodes<'_, R> {
    fn node(&self, prefix: &NibblePath<'_>) -> Result<Option<Vec<u8>>> {
        self.commit
            .get_value(&Key::storage_merkle(self.account, *prefix))
    }
}

/// Отложенная запись мемоизации: (префикс ветки, новая кодировка узла).
pub(crate) type MemoUpdate = (NibbleBuf, Vec<u8>);

/// Корень дерева. Пустое дерево даёт канонический EMPTY_TRIE_ROOT.
pub(crate) fn compute_root<N: NodeSource, L: LeafValues>(
    nodes: &N,
    leaves: &L,
    flags: ComputeFlags,
    parallel: bool,
    updates: &mut Vec<MemoUpdate>,
) -> Result<[u8; KECCAK_SIZE]> {
    let mut prefix = NibbleBuf::new();
    match nodes.node(&prefix.as_path())? {
        None => Ok(EMPTY_TRIE_ROOT),
        Some(bytes) => {
            let node = Node::decode(&bytes)?;
            let kr = match node {
                Node::Branch(b) if parallel => {
                    compute_branch_parallel(nodes, leaves, b, flags, updates)?
                }
                other => compute_decoded(nodes, leaves, other, &mut prefix, flags, updates)?,
            };
            Ok(kr.to_hash())
        }
    }
}

fn read_node<N: NodeSource>(
    nodes: &N,
    prefix: &NibblePath<'_>,
) -> Result<Node> {
    let bytes = nodes.node(prefix)?.ok_or_else(|| {
        Error::IntegrityViolation(format!(
            "missing merkle node at depth {}",
            prefix.len()
        ))
    })?;
    if bytes.is_empty() {
        return Err(
            Error::IntegrityViolation(format!("empty merkle node at depth {}", prefix.len()))
                .into(),
        );
    }
    Node::decode(&bytes)
}

fn compute_node<N: NodeSource, L: LeafValues>(
    nodes: &N,
    leaves: &L,
    prefix: &mut NibbleBuf,
    flags: ComputeFlags,
    updates: &mut Vec<MemoUpdate>,
) -> Result<KeccakOrRlp> {
    let node = read_node(nodes, &prefix.as_path())?;
    compute_decoded(nodes, leaves, node, prefix, flags, updates)
}

fn compute_decoded<N: NodeSource, L: LeafValues>(
    nodes: &N,
    leaves: &L,
    node: Node,
    prefix: &mut NibbleBuf,
    flags: ComputeFlags,
    updates: &mut Vec<MemoUpdate>,
) -> Result<KeccakOrRlp> {
    match node {
        Node::Leaf { path } => {
            let depth = prefix.len();
            prefix.extend(&path.as_path());
            let value = leaves.leaf_value(&prefix.as_path())?;
            prefix.truncate(depth);
            Ok(encode_leaf_rlp(&path.as_path(), &value))
        }
        Node::Extension { path } => {
            let depth = prefix.len();
            prefix.extend(&path.as_path());
            let child = compute_node(nodes, leaves, prefix, flags, updates)?;
            prefix.truncate(depth);
            let mut body = Vec::with_capacity(64);
            rlp::encode_bytes(&hex_prefix(&path.as_path(), false), &mut body);
            child.append_as_item(&mut body);
            let mut enc = Vec::with_capacity(body.len() + 4);
            rlp::encode_list(&body, &mut enc);
            Ok(embed_or_hash(enc))
        }
        Node::Branch(b) => compute_branch(nodes, leaves, b, prefix, flags, updates),
    }
}

/// Лист: [hex_prefix, value] — значение дерева входит байтовой строкой.
fn encode_leaf_rlp(path: &NibblePath<'_>, value: &[u8]) -> KeccakOrRlp {
    let mut body = Vec::with_capacity(40 + value.len());
    rlp::encode_bytes(&hex_prefix(path, true), &mut body);
    rlp::encode_bytes(value, &mut body);
    let mut enc = Vec::with_capacity(body.len() + 4);
    rlp::encode_list(&body, &mut enc);
    embed_or_hash(enc)
}

fn compute_branch<N: NodeSource, L: LeafValues>(
    nodes: &N,
    leaves: &L,
    mut b: Branch,
    prefix: &mut NibbleBuf,
    flags: ComputeFlags,
    updates: &mut Vec<MemoUpdate>,
) -> Result<KeccakOrRlp> {
    if !flags.skip_cached {
        if let Some(k) = b.keccak {
            return Ok(KeccakOrRlp::Keccak(k));
        }
    }

    let mut body = Vec::with_capacity(17 * 33);
    let mut memo_entries: Vec<(u8, [u8; KECCAK_SIZE])> = Vec::new();
    for nib in 0u8..16 {
        let item = branch_child_item(nodes, leaves, &b, nib, prefix, flags, updates)?;
        if let Some(kr) = item {
            if let KeccakOrRlp::Keccak(k) = &kr {
                memo_entries.push((nib, *k));
            }
            kr.append_as_item(&mut body);
        } else {
            body.push(0x80);
        }
    }
    body.push(0x80); // 17-й элемент: у веток фиксированной длины нет значения
    let mut enc = Vec::with_capacity(body.len() + 4);
    rlp::encode_list(&body, &mut enc);
    let result = embed_or_hash(enc);

    let depth = prefix.len();
    if depth >= MEMOIZE_MIN_LEVEL && depth % MEMOIZE_EVERY == 0 {
        if let KeccakOrRlp::Keccak(k) = &result {
            b.keccak = Some(*k);
            b.memo_replace(&memo_entries);
            updates.push((NibbleBuf::from_path(&prefix.as_path()), Node::Branch(b).encode()));
        }
    }
    Ok(result)
}

/// Элемент RLP для ребёнка nib; None — пустой слот.
fn branch_child_item<N: NodeSource, L: LeafValues>(
    nodes: &N,
    leaves: &L,
    b: &Branch,
    nib: u8,
    prefix: &mut NibbleBuf,
    flags: ComputeFlags,
    updates: &mut Vec<MemoUpdate>,
) -> Result<Option<KeccakOrRlp>> {
    if let Some(elp) = b.embedded_get(nib) {
        // Встроенный лист: считается на месте, без чтения узла.
        let depth = prefix.len();
        prefix.push(nib);
        prefix.extend(&elp.as_path());
        let value = leaves.leaf_value(&prefix.as_path())?;
        prefix.truncate(depth);
        return Ok(Some(encode_leaf_rlp(&elp.as_path(), &value)));
    }
    if !b.children.contains(nib) {
        return Ok(None);
    }
    if !flags.skip_cached {
        if let Some(h) = b.memo_get(nib) {
            return Ok(Some(KeccakOrRlp::Keccak(*h)));
        }
    }
    let depth = prefix.len();
    prefix.push(nib);
    let child = compute_node(nodes, leaves, prefix, flags, updates)?;
    prefix.truncate(depth);
    Ok(Some(child))
}

/// Параллельный корень: дети корневой ветки считаются независимыми
/// воркерами (каждый со своим списком обновлений), слияние — по порядку
/// ниблов, так что итог побайтно совпадает с последовательным.
fn compute_branch_parallel<N: NodeSource + Sync, L: LeafValues + Sync>(
    nodes: &N,
    leaves: &L,
    mut b: Branch,
    flags: ComputeFlags,
    updates: &mut Vec<MemoUpdate>,
) -> Result<KeccakOrRlp> {
    use rayon::prelude::*;

    if !flags.skip_cached {
        if let Some(k) = b.keccak {
            return Ok(KeccakOrRlp::Keccak(k));
        }
    }

    let results: Vec<(u8, Result<(Option<KeccakOrRlp>, Vec<MemoUpdate>)>)> = (0usize..16)
        .into_par_iter()
        .map(|nib| {
            let nib = nib as u8;
            let mut local_prefix = NibbleBuf::new();
            let mut local_updates = Vec::new();
            let item = branch_child_item(
                nodes,
                leaves,
                &b,
                nib,
                &mut local_prefix,
                flags,
                &mut local_updates,
            );
            (nib, item.map(|i| (i, local_updates)))
        })
        .collect();

    let mut body = Vec::with_capacity(17 * 33);
    let mut memo_entries: Vec<(u8, [u8; KECCAK_SIZE])> = Vec::new();
    for (nib, res) in results {
        let (item, local_updates) = res?;
        updates.extend(local_updates);
        match item {
            Some(kr) => {
                if let KeccakOrRlp::Keccak(k) = &kr {
                    memo_entries.push((nib, *k));
                }
                kr.append_as_item(&mut body);
            }
            None => body.push(0x80),
        }
    }
    body.push(0x80);
    let mut enc = Vec::with_capacity(body.len() + 4);
    rlp::encode_list(&body, &mut enc);
    let result = embed_or_hash(enc);
    debug!("merkle: parallel root computed over {} children", b.children.count());

    // Корень — глубина 0: мемо уровня не положено, но keccak ветки корня
    // можно хранить только если правила глубины это разрешают.
    if MEMOIZE_MIN_LEVEL == 0 {
        if let KeccakOrRlp::Keccak(k) = &result {
            b.keccak = Some(*k);
            b.memo_replace(&memo_entries);
            updates.push((NibbleBuf::new(), Node::Branch(b).encode()));
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_prefix_matches_reference_rules() {
        // Пустой путь, не лист: 0x00; лист: 0x20.
        assert_eq!(hex_prefix(&NibblePath::empty(), false), vec![0x00]);
        assert_eq!(hex_prefix(&NibblePath::empty(), true), vec![0x20]);
        // Нечётная длина: флаг|1 и первый нибл в первом байте.
        let d = [0xAB, 0xCD];
        let p = NibblePath::from_slice(&d).slice_to(3); // a b c
        assert_eq!(hex_prefix(&p, false), vec![0x1A, 0xBC]);
        assert_eq!(hex_prefix(&p, true), vec![0x3A, 0xBC]);
        // Чётная длина.
        let q = NibblePath::from_slice(&d); // a b c d
        assert_eq!(hex_prefix(&q, false), vec![0x00, 0xAB, 0xCD]);
        assert_eq!(hex_prefix(&q, true), vec![0x20, 0xAB, 0xCD]);
    }

    #[test]
    fn short_encoding_embeds() {
        match embed_or_hash(vec![0xC0]) {
            KeccakOrRlp::Rlp(r) => assert_eq!(r, vec![0xC0]),
            _ => panic!("short rlp must embed"),
        }
        match embed_or_hash(vec![0xAA; 32]) {
            KeccakOrRlp::Keccak(_) => {}
            _ => panic!("long rlp must hash"),
        }
    }
}
