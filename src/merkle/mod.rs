//! Merkle-подсистема: на коммите перестраивает узлы дерева по изменённым
//! ключам батча, пересчитывает storage-корни затронутых аккаунтов и
//! корневой Keccak состояния.
//!
//! Конвейер before_commit:
//! 1. обход storage-записей по аккаунтам через префиксованное представление;
//! 2. обход изменённых аккаунтов в дереве состояния;
//! 3. явное "касание" аккаунтов, у которых менялся только storage;
//! 4. расчёт storage-корней и запись их в аккаунты;
//! 5. расчёт корня состояния (дети корня — параллельно при use_parallel).

pub mod compute;
pub mod dirty;
pub mod node;

pub use compute::{ComputeFlags, KeccakOrRlp};
pub use dirty::{delete, mark_path_dirty, DeleteStatus};

use std::collections::BTreeMap;

use anyhow::Result;
use log::{debug, warn};

use crate::account::Account;
use crate::consts::KECCAK_SIZE;
use crate::key::Key;
use crate::nibble::NibblePath;

use compute::{MemoUpdate, StateLeaves, StateNodes, StorageLeaves, StorageNodes};

/// Чтение значений по логическим ключам. Sync — параллельный расчёт читает
/// коммит из нескольких воркеров.
pub trait MerkleRead: Sync {
    fn get_value(&self, key: &Key<'_>) -> Result<Option<Vec<u8>>>;
}

/// Читаемо-писомый коммит, через который движок перестраивает узлы.
pub trait MerkleCommit: MerkleRead {
    fn set_value(&mut self, key: &Key<'_>, value: &[u8]) -> Result<()>;
    fn remove_value(&mut self, key: &Key<'_>) -> Result<()>;
}

/// Источник байтов узлов конкретного дерева (состояние или storage
/// аккаунта).
pub(crate) trait NodeSource: Sync {
    fn node(&self, prefix: &NibblePath<'_>) -> Result<Option<Vec<u8>>>;
}

/// Изменения батча: вход конвейера.
#[derive(Default)]
pub struct ChangeSet {
    /// account hash -> удалён ли.
    pub accounts: BTreeMap<[u8; KECCAK_SIZE], bool>,
    /// account hash -> slot hash -> удалён ли.
    pub storage: BTreeMap<[u8; KECCAK_SIZE], BTreeMap<[u8; KECCAK_SIZE], bool>>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.storage.is_empty()
    }
}

/// Представление storage-дерева аккаунта как обычного дерева Merkle-ключей:
/// пути транслируются в storage_merkle под аккаунтом.
pub struct PrefixedCommit<'a, C: MerkleCommit + ?Sized> {
    inner: &'a mut C,
    account: NibblePath<'a>,
}

impl<'a, C: MerkleCommit + ?Sized> PrefixedCommit<'a, C> {
    pub fn new(inner: &'a mut C, account: NibblePath<'a>) -> Self {
        PrefixedCommit { inner, account }
    }
}

impl<C: MerkleCommit + ?Sized> MerkleRead for PrefixedCommit<'_, C> {
    fn get_value(&self, key: &Key<'_>) -> Result<Option<Vec<u8>>> {
        self.inner
            .get_value(&Key::storage_merkle(self.account, key.path))
    }
}

impl<C: MerkleCommit + ?Sized> MerkleCommit for PrefixedCommit<'_, C> {
    fn set_value(&mut self, key: &Key<'_>, value: &[u8]) -> Result<()> {
        self.inner
            .set_value(&Key::storage_merkle(self.account, key.path), value)
    }

    fn remove_value(&mut self, key: &Key<'_>) -> Result<()> {
        self.inner
            .remove_value(&Key::storage_merkle(self.account, key.path))
    }
}

/// Применяет отложенные обновления мемоизации в порядке ключей.
fn apply_state_updates<C: MerkleCommit + ?Sized>(
    commit: &mut C,
    mut updates: Vec<MemoUpdate>,
) -> Result<()> {
    updates.sort_by(|a, b| cmp_prefix(&a.0.as_path(), &b.0.as_path()));
    for (prefix, bytes) in updates {
        commit.set_value(&Key::merkle(prefix.as_path()), &bytes)?;
    }
    Ok(())
}

fn apply_storage_updates<C: MerkleCommit + ?Sized>(
    commit: &mut C,
    account: &NibblePath<'_>,
    mut updates: Vec<MemoUpdate>,
) -> Result<()> {
    updates.sort_by(|a, b| cmp_prefix(&a.0.as_path(), &b.0.as_path()));
    for (prefix, bytes) in updates {
        commit.set_value(&Key::storage_merkle(*account, prefix.as_path()), &bytes)?;
    }
    Ok(())
}

fn cmp_prefix(a: &NibblePath<'_>, b: &NibblePath<'_>) -> std::cmp::Ordering {
    let n = a.len().min(b.len());
    for i in 0..n {
        match a.nibble_at(i).cmp(&b.nibble_at(i)) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Корень storage-дерева аккаунта по текущему содержимому коммита.
pub fn compute_storage_root<C: MerkleCommit + ?Sized>(
    commit: &mut C,
    account: &NibblePath<'_>,
    flags: ComputeFlags,
) -> Result<[u8; KECCAK_SIZE]> {
    let mut updates = Vec::new();
    let root = {
        let nodes = StorageNodes {
            commit: &*commit,
            account: *account,
        };
        let leaves = StorageLeaves {
            commit: &*commit,
            account: *account,
        };
        compute::compute_root(&nodes, &leaves, flags, false, &mut updates)?
    };
    apply_storage_updates(commit, account, updates)?;
    Ok(root)
}

/// Корень состояния по текущему содержимому коммита.
pub fn compute_state_root<C: MerkleCommit + ?Sized>(
    commit: &mut C,
    flags: ComputeFlags,
    parallel: bool,
) -> Result<[u8; KECCAK_SIZE]> {
    let mut updates = Vec::new();
    let root = {
        let nodes = StateNodes(&*commit);
        let leaves = StateLeaves {
            commit: &*commit,
            flags,
        };
        compute::compute_root(&nodes, &leaves, flags, parallel, &mut updates)?
    };
    apply_state_updates(commit, updates)?;
    Ok(root)
}

/// Пред-коммитный конвейер. Возвращает корневой хэш состояния.
pub fn before_commit<C: MerkleCommit + ?Sized>(
    commit: &mut C,
    changes: &ChangeSet,
    use_parallel: bool,
) -> Result<[u8; KECCAK_SIZE]> {
    // 1. Storage-записи, аккаунт за аккаунтом.
    for (account, slots) in &changes.storage {
        let apath_bytes = *account;
        let apath = NibblePath::from_keccak(&apath_bytes);
        let mut view = PrefixedCommit::new(commit, apath);
        for (slot, deleted) in slots {
            let spath_bytes = *slot;
            let spath = NibblePath::from_keccak(&spath_bytes);
            if *deleted {
                let _ = dirty::delete(&mut view, &spath)?;
            } else {
                dirty::mark_path_dirty(&mut view, &spath)?;
            }
        }
    }

    // 2. Дерево состояния.
    for (account, deleted) in &changes.accounts {
        let apath_bytes = *account;
        let apath = NibblePath::from_keccak(&apath_bytes);
        if *deleted {
            let _ = dirty::delete(commit, &apath)?;
        } else {
            dirty::mark_path_dirty(commit, &apath)?;
        }
    }

    // 3. Касание аккаунтов со storage-изменениями без записи аккаунта.
    for account in changes.storage.keys() {
        if changes.accounts.contains_key(account) {
            continue;
        }
        let apath_bytes = *account;
        let apath = NibblePath::from_keccak(&apath_bytes);
        if commit.get_value(&Key::account(apath))?.is_some() {
            dirty::mark_path_dirty(commit, &apath)?;
        } else {
            warn!(
                "storage changed for missing account {:02x}{:02x}..",
                account[0], account[1]
            );
        }
    }

    // 4. Storage-корни затронутых аккаунтов.
    for account in changes.storage.keys() {
        if changes.accounts.get(account) == Some(&true) {
            continue; // аккаунт удалён вместе со своим storage
        }
        let apath_bytes = *account;
        let apath = NibblePath::from_keccak(&apath_bytes);
        let key = Key::account(apath);
        let Some(raw) = commit.get_value(&key)? else {
            continue;
        };
        let root = compute_storage_root(commit, &apath, ComputeFlags::default())?;
        let account_rec = Account::read_from(&raw)?.with_changed_storage_root(root);
        let mut out = Vec::with_capacity(Account::MAX_BYTE_COUNT);
        account_rec.write_to(&mut out);
        commit.set_value(&key, &out)?;
        debug!(
            "merkle: storage root refreshed for {:02x}{:02x}..",
            account[0], account[1]
        );
    }

    // 5. Корень состояния.
    compute_state_root(commit, ComputeFlags::default(), use_parallel)
}


#[cfg(test)]
mod tests {
    use super::testing::MapCommit;
    use super::*;
    use crate::merkle::node::Node;
    use crate::util::EMPTY_TRIE_ROOT;

    fn put_account(c: &mut MapCommit, hash: &[u8; 32], balance: u128) {
        let mut packed = Vec::new();
        Account::new_eoa(balance, 0).write_to(&mut packed);
        let path = NibblePath::from_keccak(hash);
        c.set_value(&Key::account(path), &packed).unwrap();
        dirty::mark_path_dirty(c, &path).unwrap();
    }

    #[test]
    fn empty_commit_computes_empty_trie_root() {
        let mut c = MapCommit::default();
        let root = compute_state_root(&mut c, ComputeFlags::default(), false).unwrap();
        assert_eq!(root, EMPTY_TRIE_ROOT);
    }

    #[test]
    fn memo_is_written_at_even_depths_and_invalidated_by_dirtying() {
        let mut c = MapCommit::default();
        // Три аккаунта с общими двумя ниблами: ветка на глубине 2 попадает
        // под правило мемоизации.
        let mut hashes = Vec::new();
        for third in [0x11u8, 0x55, 0x99] {
            let mut h = [0x12u8; 32];
            h[1] = third;
            hashes.push(h);
        }
        for h in &hashes {
            put_account(&mut c, h, 1);
        }

        let root1 = compute_state_root(&mut c, ComputeFlags::default(), false).unwrap();

        // Ветка глубины 2 теперь несёт мемоизированный keccak.
        let branch_path = NibblePath::from_keccak(&hashes[0]).slice_to(2);
        let bytes = c
            .get_value(&Key::merkle(branch_path))
            .unwrap()
            .expect("branch node");
        let Node::Branch(b) = Node::decode(&bytes).unwrap() else {
            panic!("expected a branch at depth 2");
        };
        assert!(b.keccak.is_some());

        // Повторный расчёт по мемо равен пересчёту с нуля.
        let memoized = compute_state_root(&mut c, ComputeFlags::default(), false).unwrap();
        let fresh = compute_state_root(
            &mut c,
            ComputeFlags {
                skip_cached: true,
                force_storage_root_recalc: false,
            },
            false,
        )
        .unwrap();
        assert_eq!(root1, memoized);
        assert_eq!(root1, fresh);

        // Дёргаем один путь — мемо на ветке сброшено.
        dirty::mark_path_dirty(&mut c, &NibblePath::from_keccak(&hashes[0])).unwrap();
        let bytes = c
            .get_value(&Key::merkle(branch_path))
            .unwrap()
            .expect("branch node");
        let Node::Branch(b) = Node::decode(&bytes).unwrap() else {
            panic!("expected a branch at depth 2");
        };
        assert!(b.keccak.is_none());
    }

    #[test]
    fn parallel_equals_serial_on_map_commit() {
        let mut serial = MapCommit::default();
        let mut parallel = MapCommit::default();
        for i in 0..40u64 {
            let h = crate::util::keccak256(&i.to_le_bytes());
            put_account(&mut serial, &h, i as u128 + 1);
            put_account(&mut parallel, &h, i as u128 + 1);
        }
        let a = compute_state_root(&mut serial, ComputeFlags::default(), false).unwrap();
        let b = compute_state_root(&mut parallel, ComputeFlags::default(), true).unwrap();
        assert_eq!(a, b);
    }
}
