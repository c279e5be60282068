//! PagedDb — база поверх региона страниц: кольцо корней глубины H,
//! сериализованные батчи записи, неблокирующие читатели с lease на корень,
//! отложенное переиспользование брошенных страниц.
//!
//! Маршрутизация ключей:
//! - состояние (Account и Merkle состояния) — фан-аут корня по первым двум
//!   ниблам пути, срез на два нибла; короткие Merkle-ключи хранятся
//!   неотрезанными с пометкой short;
//! - storage (ячейки и Merkle storage-деревьев) — трёхуровневый
//!   StorageFanOut по первым шести ниблам хэша аккаунта.

pub mod batch;
pub mod read;

pub use batch::{Batch, CommitOptions};
pub use read::ReadOnlyBatch;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{anyhow, Result};
use log::{debug, info};

use crate::addr::DbAddress;
use crate::consts::{
    KECCAK_SIZE, MIN_HISTORY_DEPTH, PAGE_TYPE_DATA, ROOT_CONSUMED_NIBBLES,
};
use crate::error::Error;
use crate::key::{self, Key, StoreKey};
use crate::nibble::NibblePath;
use crate::page::{self, fanout, root::RootPage, ReadCtx, WriteCtx};
use crate::pager::Region;

pub(crate) struct DbInner {
    pub(crate) region: Region,
    pub(crate) history: usize,
    /// Токен писателя: в любой момент не больше одного батча записи.
    writer_busy: Mutex<bool>,
    writer_cv: Condvar,
    /// Лизы читателей по batch_id + замок кольца корней: запись слота и
    /// копирование корня читателем сериализуются этим же мьютексом.
    pub(crate) leases: Mutex<BTreeMap<u32, usize>>,
    /// Последний закоммиченный batch_id.
    pub(crate) latest: Mutex<u32>,
    pub(crate) parallel: AtomicBool,
}

impl DbInner {
    pub(crate) fn root_slot(&self, batch_id: u32) -> DbAddress {
        DbAddress::new(batch_id % self.history as u32)
    }

    /// Минимальный batch_id среди живых лиз.
    pub(crate) fn min_lease(&self) -> Option<u32> {
        self.leases.lock().unwrap().keys().next().copied()
    }

    fn acquire_writer(&self) {
        let mut busy = self.writer_busy.lock().unwrap();
        while *busy {
            busy = self.writer_cv.wait(busy).unwrap();
        }
        *busy = true;
    }

    pub(crate) fn release_writer(&self) {
        *self.writer_busy.lock().unwrap() = false;
        self.writer_cv.notify_one();
    }
}

/// Лиза читателя на корень batch_id: пока жива, страницы, брошенные до
/// этого корня, не переиспользуются.
pub(crate) struct RootLease {
    db: Arc<DbInner>,
    id: u32,
}

impl RootLease {
    /// Берётся под замком кольца.
    pub(crate) fn acquire_locked(
        db: &Arc<DbInner>,
        leases: &mut BTreeMap<u32, usize>,
        id: u32,
    ) -> RootLease {
        *leases.entry(id).or_insert(0) += 1;
        RootLease {
            db: Arc::clone(db),
            id,
        }
    }
}

impl Drop for RootLease {
    fn drop(&mut self) {
        let mut leases = self.db.leases.lock().unwrap();
        if let Some(cnt) = leases.get_mut(&self.id) {
            *cnt -= 1;
            if *cnt == 0 {
                leases.remove(&self.id);
            }
        }
    }
}

#[derive(Clone)]
pub struct PagedDb {
    pub(crate) inner: Arc<DbInner>,
}

impl PagedDb {
    /// Открывает (или создаёт) файл-базу фиксированного размера.
    pub fn open(path: &Path, size_bytes: usize, history_depth: usize) -> Result<PagedDb> {
        let region = Region::open_file(path, size_bytes)?;
        Self::from_region(region, history_depth)
    }

    /// База в анонимной памяти.
    pub fn native_memory(size_bytes: usize, history_depth: usize) -> Result<PagedDb> {
        let region = Region::anon(size_bytes)?;
        Self::from_region(region, history_depth)
    }

    fn from_region(region: Region, history_depth: usize) -> Result<PagedDb> {
        if history_depth < MIN_HISTORY_DEPTH {
            return Err(anyhow!(
                "history depth must be >= {}, got {}",
                MIN_HISTORY_DEPTH,
                history_depth
            ));
        }
        if region.page_count() <= history_depth {
            return Err(anyhow!(
                "backing of {} pages cannot hold a root ring of {}",
                region.page_count(),
                history_depth
            ));
        }

        // Ищем последний валидный корень в кольце; свежий регион форматируем.
        let mut latest: Option<(u32, RootPage)> = None;
        for slot in 0..history_depth {
            let pg = region.page(DbAddress::new(slot as u32));
            if !RootPage::is_initialized(pg) {
                continue;
            }
            let root = RootPage::read_from(pg)?;
            if latest.as_ref().map_or(true, |(id, _)| root.batch_id > *id) {
                latest = Some((root.batch_id, root));
            }
        }

        let latest_id = match latest {
            Some((id, root)) => {
                if root.size_pages != region.page_count() as u64 {
                    return Err(anyhow!(
                        "root says {} pages, backing has {}",
                        root.size_pages,
                        region.page_count()
                    ));
                }
                info!("paged db: opened at batch {}", id);
                id
            }
            None => {
                let template = RootPage::new_initial(region.page_count() as u64, history_depth);
                template.write_to(region.page_mut(DbAddress::new(0)));
                region.flush_page(DbAddress::new(0))?;
                info!("paged db: formatted fresh backing");
                0
            }
        };

        Ok(PagedDb {
            inner: Arc::new(DbInner {
                region,
                history: history_depth,
                writer_busy: Mutex::new(false),
                writer_cv: Condvar::new(),
                leases: Mutex::new(BTreeMap::new()),
                latest: Mutex::new(latest_id),
                parallel: AtomicBool::new(false),
            }),
        })
    }

    /// Включает параллельный расчёт корневого хэша на коммите.
    pub fn set_parallel_compute(&self, on: bool) {
        self.inner.parallel.store(on, Ordering::Relaxed);
    }

    /// Эксклюзивный батч записи (блокируется, пока занят предыдущий).
    pub fn begin_next_batch(&self) -> Result<Batch> {
        self.inner.acquire_writer();
        let latest = *self.inner.latest.lock().unwrap();
        let slot = self.inner.root_slot(latest);
        let root = {
            let _ring = self.inner.leases.lock().unwrap();
            RootPage::read_from(self.inner.region.page(slot))?
        };
        Batch::new(self, root, latest + 1)
    }

    /// Читатель последнего закоммиченного корня.
    pub fn begin_read_only_batch(&self) -> Result<ReadOnlyBatch> {
        let mut leases = self.inner.leases.lock().unwrap();
        let latest = *self.inner.latest.lock().unwrap();
        let root = RootPage::read_from(self.inner.region.page(self.inner.root_slot(latest)))?;
        let lease = RootLease::acquire_locked(&self.inner, &mut leases, latest);
        Ok(ReadOnlyBatch::new(Arc::clone(&self.inner), root, lease))
    }

    /// Читатель корня с данным state hash; StateNotFound, если такого нет.
    pub fn begin_read_only_batch_at(&self, state_hash: &[u8; KECCAK_SIZE]) -> Result<ReadOnlyBatch> {
        let mut leases = self.inner.leases.lock().unwrap();
        for slot in 0..self.inner.history {
            let pg = self.inner.region.page(DbAddress::new(slot as u32));
            if !RootPage::is_initialized(pg) {
                continue;
            }
            let root = RootPage::read_from(pg)?;
            if &root.state_hash == state_hash {
                let lease = RootLease::acquire_locked(&self.inner, &mut leases, root.batch_id);
                return Ok(ReadOnlyBatch::new(Arc::clone(&self.inner), root, lease));
            }
        }
        Err(Error::StateNotFound.into())
    }

    /// Есть ли корень с таким state hash (O(H)-скан кольца).
    pub fn has_state(&self, state_hash: &[u8; KECCAK_SIZE]) -> bool {
        let _leases = self.inner.leases.lock().unwrap();
        (0..self.inner.history).any(|slot| {
            let pg = self.inner.region.page(DbAddress::new(slot as u32));
            RootPage::is_initialized(pg)
                && RootPage::read_from(pg)
                    .map(|r| &r.state_hash == state_hash)
                    .unwrap_or(false)
        })
    }

    /// Все валидные корни кольца, отсортированные по номеру блока
    /// (стабильно).
    pub fn snapshot_all(&self) -> Result<Vec<ReadOnlyBatch>> {
        let mut out = Vec::new();
        {
            let mut leases = self.inner.leases.lock().unwrap();
            for slot in 0..self.inner.history {
                let pg = self.inner.region.page(DbAddress::new(slot as u32));
                if !RootPage::is_initialized(pg) {
                    continue;
                }
                let root = RootPage::read_from(pg)?;
                let lease = RootLease::acquire_locked(&self.inner, &mut leases, root.batch_id);
                out.push(ReadOnlyBatch::new(Arc::clone(&self.inner), root, lease));
            }
        }
        out.sort_by_key(|b| b.metadata().0);
        Ok(out)
    }

    /// Читатель последнего финализованного корня.
    pub fn lease_latest_finalized(&self) -> Result<ReadOnlyBatch> {
        self.begin_read_only_batch()
    }

    /// Диагностика: сколько страниц уже занято (кольцо + аллокации).
    pub fn used_pages(&self) -> u64 {
        let latest = *self.inner.latest.lock().unwrap();
        let slot = self.inner.root_slot(latest);
        RootPage::read_from(self.inner.region.page(slot))
            .map(|r| r.next_free_page as u64)
            .unwrap_or(0)
    }

    /// Общий размер региона в страницах.
    pub fn total_pages(&self) -> u64 {
        self.inner.region.page_count() as u64
    }
}

// ---- Маршрутизация ключей, общая для батча и читателя ----

/// true — ключ живёт в storage-стороне (StorageFanOut).
pub(crate) fn storage_routed(key: &Key<'_>) -> bool {
    key.ty == key::KeyType::StorageCell || key.storage_merkle
}

/// Корзина фан-аута состояния и закодированный ключ.
pub(crate) fn encode_state(key: &Key<'_>) -> (usize, StoreKey) {
    let len = key.path.len();
    if len >= ROOT_CONSUMED_NIBBLES {
        let idx = (key.path.nibble_at(0) as usize) * 16 + key.path.nibble_at(1) as usize;
        (idx, key::encode(&key.slice_path(ROOT_CONSUMED_NIBBLES), false))
    } else {
        let n0 = if len > 0 { key.path.nibble_at(0) } else { 0 };
        ((n0 as usize) * 16, key::encode(key, true))
    }
}

/// Закодированный ключ storage-стороны (аккаунт срезан фан-аутом).
pub(crate) fn encode_storage(key: &Key<'_>) -> StoreKey {
    key::encode(&key.slice_path(crate::consts::STORAGE_CONSUMED_NIBBLES), false)
}

/// Чтение по логическому ключу относительно данного корня.
pub(crate) fn route_get<'c, C: ReadCtx>(
    ctx: &'c C,
    root: &RootPage,
    key: &Key<'_>,
) -> Result<Option<&'c [u8]>> {
    if storage_routed(key) {
        let enc = encode_storage(key);
        match fanout::route_read(ctx, root.storage_fanout_root, &key.path)? {
            None => Ok(None),
            Some(leaf) => page::tree_get(ctx, leaf, &enc),
        }
    } else {
        let (idx, enc) = encode_state(key);
        let subtree = root.state_fanout[idx];
        if subtree.is_null() {
            return Ok(None);
        }
        page::tree_get(ctx, subtree, &enc)
    }
}

/// Запись по логическому ключу; правит корневые указатели черновика.
pub(crate) fn route_set<C: WriteCtx>(
    ctx: &mut C,
    root: &mut RootPage,
    key: &Key<'_>,
    value: &[u8],
) -> Result<()> {
    if storage_routed(key) {
        let enc = encode_storage(key);
        let (l1, leaf) = fanout::route_write(ctx, root.storage_fanout_root, &key.path)?;
        root.storage_fanout_root = l1;
        let new_leaf = page::tree_set(ctx, leaf, &enc, value)?;
        if new_leaf != leaf {
            fanout::update_leaf(ctx, l1, &key.path, new_leaf)?;
        }
    } else {
        let (idx, enc) = encode_state(key);
        let subtree = {
            let existing = root.state_fanout[idx];
            if existing.is_null() {
                let fresh = ctx.get_new_page(PAGE_TYPE_DATA)?;
                page::data::init(ctx.page_mut(fresh)?);
                debug!("state bucket {:02x}: new subtree page {}", idx, fresh.raw());
                fresh
            } else {
                existing
            }
        };
        let new_subtree = page::tree_set(ctx, subtree, &enc, value)?;
        root.state_fanout[idx] = new_subtree;
    }
    Ok(())
}

/// Удаление по логическому ключу (tombstone в странице).
pub(crate) fn route_delete<C: WriteCtx>(
    ctx: &mut C,
    root: &mut RootPage,
    key: &Key<'_>,
) -> Result<bool> {
    if storage_routed(key) {
        let enc = encode_storage(key);
        match fanout::route_read(ctx, root.storage_fanout_root, &key.path)? {
            None => Ok(false),
            Some(_) => {
                // COW по пути до листа.
                let (l1, leaf) = fanout::route_write(ctx, root.storage_fanout_root, &key.path)?;
                root.storage_fanout_root = l1;
                let (new_leaf, found) = page::tree_delete(ctx, leaf, &enc)?;
                if new_leaf != leaf {
                    fanout::update_leaf(ctx, l1, &key.path, new_leaf)?;
                }
                Ok(found)
            }
        }
    } else {
        let (idx, enc) = encode_state(key);
        let subtree = root.state_fanout[idx];
        if subtree.is_null() {
            return Ok(false);
        }
        let (new_subtree, found) = page::tree_delete(ctx, subtree, &enc)?;
        root.state_fanout[idx] = new_subtree;
        Ok(found)
    }
}

/// Удаление по префиксу комбинированного потока. Возвращает число удалённых.
pub(crate) fn route_delete_by_prefix<C: WriteCtx>(
    ctx: &mut C,
    root: &mut RootPage,
    prefix: &Key<'_>,
) -> Result<usize> {
    if storage_routed(prefix) {
        if fanout::route_read(ctx, root.storage_fanout_root, &prefix.path)?.is_none() {
            return Ok(0);
        }
        let enc = encode_storage(prefix);
        let decoded = key::decode(&enc)?;
        let (l1, leaf) = fanout::route_write(ctx, root.storage_fanout_root, &prefix.path)?;
        root.storage_fanout_root = l1;
        let (new_leaf, removed) = page::tree_delete_by_prefix(ctx, leaf, &decoded)?;
        if new_leaf != leaf {
            fanout::update_leaf(ctx, l1, &prefix.path, new_leaf)?;
        }
        return Ok(removed);
    }

    // Сторона состояния: префикс может накрывать несколько корзин.
    let len = prefix.path.len();
    let mut removed = 0usize;
    let buckets: Vec<usize> = if len >= ROOT_CONSUMED_NIBBLES {
        vec![(prefix.path.nibble_at(0) as usize) * 16 + prefix.path.nibble_at(1) as usize]
    } else if len == 1 {
        let n0 = prefix.path.nibble_at(0) as usize;
        (n0 * 16..n0 * 16 + 16).collect()
    } else {
        (0..crate::consts::ROOT_FANOUT).collect()
    };
    for idx in buckets {
        let subtree = root.state_fanout[idx];
        if subtree.is_null() {
            continue;
        }
        let sliced = prefix.slice_path(len.min(ROOT_CONSUMED_NIBBLES));
        let enc = key::encode(&sliced, false);
        let decoded = key::decode(&enc)?;
        let (new_subtree, n) = page::tree_delete_by_prefix(ctx, subtree, &decoded)?;
        removed += n;
        root.state_fanout[idx] = new_subtree;
    }

    // Short-ключи (Merkle-пути короче двух ниблов) хранятся в другой рамке
    // среза и выметаются точечно: их не больше семнадцати.
    if prefix.ty == key::KeyType::Merkle && !prefix.storage_merkle && len < ROOT_CONSUMED_NIBBLES {
        if len == 0 && route_delete(ctx, root, &Key::merkle(NibblePath::empty()))? {
            removed += 1;
        }
        let mut nib_byte = [0u8; 1];
        for nib in 0u8..16 {
            if len == 1 && nib != prefix.path.nibble_at(0) {
                continue;
            }
            nib_byte[0] = nib << 4;
            let one = NibblePath::new(&nib_byte, 0, 1);
            if route_delete(ctx, root, &Key::merkle(one))? {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

