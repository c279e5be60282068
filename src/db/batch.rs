//! Батч записи: эксклюзивная мутация до commit, затем неизменяемый корень N.
//!
//! Жизненный цикл страницы внутри батча:
//! - get_new_page: адрес из пула переиспользования (брошенные страницы,
//!   вышедшие из окна истории и не пришпиленные читателями) или из
//!   next_free_page; заголовок штампуется текущим batch_id;
//! - ensure_writable: страница текущего батча возвращается как есть,
//!   старая копируется, прежний адрес регистрируется на переиспользование;
//! - commit: Merkle-хук, перенос брошенных адресов в цепочку
//!   AbandonedPage, запись черновика корня в слот batch_id mod H.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info, warn};

use crate::account::{storage_is_zero, storage_trim};
use crate::addr::DbAddress;
use crate::consts::{KECCAK_SIZE, PAGE_TYPE_ABANDONED};
use crate::error::Error;
use crate::key::Key;
use crate::merkle::{self, ChangeSet};
use crate::nibble::NibblePath;
use crate::page::{self, abandoned, root::RootPage, ReadCtx, WriteCtx};

use super::{route_delete, route_delete_by_prefix, route_get, route_set, DbInner, PagedDb};

/// Политика долговечности коммита.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOptions {
    /// Данные сброшены, долговечность корня отложена.
    FlushDataOnly,
    /// Сброшены и данные, и корневой слот.
    FlushDataAndRoot,
}

/// Контекст страничных операций батча; отделён от черновика корня, чтобы
/// страницы и корневые указатели можно было править одновременно.
pub(crate) struct BatchCtx {
    pub(crate) db: Arc<DbInner>,
    pub(crate) id: u32,
    pub(crate) next_free: u32,
    pub(crate) size_pages: u32,
    reuse_pool: Vec<DbAddress>,
    abandoned: Vec<DbAddress>,
    abandoned_set: HashSet<DbAddress>,
}

impl ReadCtx for BatchCtx {
    fn page(&self, addr: DbAddress) -> Result<&[u8]> {
        Ok(self.db.region.page(addr))
    }
}

impl WriteCtx for BatchCtx {
    fn batch_id(&self) -> u32 {
        self.id
    }

    fn page_mut(&mut self, addr: DbAddress) -> Result<&mut [u8]> {
        debug_assert_eq!(
            page::batch_id(self.db.region.page(addr)),
            self.id,
            "mutating a page not owned by this batch"
        );
        Ok(self.db.region.page_mut(addr))
    }

    fn get_new_page(&mut self, ty: u8) -> Result<DbAddress> {
        let addr = self.alloc_raw()?;
        page::init_page(self.db.region.page_mut(addr), self.id, ty);
        Ok(addr)
    }

    fn ensure_writable(&mut self, addr: DbAddress) -> Result<DbAddress> {
        if page::batch_id(self.db.region.page(addr)) == self.id {
            return Ok(addr);
        }
        let fresh = self.alloc_raw()?;
        let src = self.db.region.page(addr);
        self.db.region.page_mut(fresh).copy_from_slice(src);
        page::set_batch_id(self.db.region.page_mut(fresh), self.id);
        self.register_for_future_reuse(addr)?;
        Ok(fresh)
    }

    fn register_for_future_reuse(&mut self, addr: DbAddress) -> Result<()> {
        // Повторная регистрация одного адреса в батче — баг: падаем громко.
        assert!(
            self.abandoned_set.insert(addr),
            "page {} registered for reuse twice in batch {}",
            addr.raw(),
            self.id
        );
        self.abandoned.push(addr);
        Ok(())
    }
}

impl BatchCtx {
    fn alloc_raw(&mut self) -> Result<DbAddress> {
        if let Some(addr) = self.reuse_pool.pop() {
            return Ok(addr);
        }
        if self.next_free as usize >= self.size_pages as usize {
            return Err(Error::OutOfSpace.into());
        }
        let addr = DbAddress::new(self.next_free);
        self.next_free += 1;
        Ok(addr)
    }
}

pub struct Batch {
    pub(crate) ctx: BatchCtx,
    pub(crate) root: RootPage,
    changes: ChangeSet,
    committed: bool,
}

impl Batch {
    pub(crate) fn new(db: &PagedDb, prev_root: RootPage, id: u32) -> Result<Batch> {
        let mut root = prev_root;
        root.batch_id = id;
        let next_free = root.next_free_page;
        let size_pages = root.size_pages as u32;
        let mut batch = Batch {
            ctx: BatchCtx {
                db: Arc::clone(&db.inner),
                id,
                next_free,
                size_pages,
                reuse_pool: Vec::new(),
                abandoned: Vec::new(),
                abandoned_set: HashSet::new(),
            },
            root,
            changes: ChangeSet::default(),
            committed: false,
        };
        batch.collect_reusable()?;
        Ok(batch)
    }

    pub fn batch_id(&self) -> u32 {
        self.ctx.id
    }

    /// Собирает пригодный к переиспользованию хвост цепочки брошенных
    /// страниц: узлы, чей батч вышел из окна истории и не пришпилен
    /// читателями. Выжившая голова цепочки копируется (COW) с поправкой
    /// next-указателей.
    fn collect_reusable(&mut self) -> Result<()> {
        let mut nodes: Vec<(DbAddress, u32)> = Vec::new();
        let mut cursor = self.root.abandoned_head;
        while !cursor.is_null() {
            let pg = self.ctx.db.region.page(cursor);
            page::expect_type(pg, cursor, PAGE_TYPE_ABANDONED)?;
            nodes.push((cursor, page::batch_id(pg)));
            cursor = abandoned::next(pg);
        }
        if nodes.is_empty() {
            return Ok(());
        }

        let history = self.ctx.db.history as u32;
        let min_lease = self.ctx.db.min_lease();
        let reusable = |tag: u32| {
            self.ctx.id >= tag + history && min_lease.map_or(true, |m| m >= tag)
        };

        // Максимальный пригодный суффикс (цепочка идёт от новых к старым).
        let mut cut = nodes.len();
        while cut > 0 && reusable(nodes[cut - 1].1) {
            cut -= 1;
        }
        if cut == nodes.len() {
            return Ok(());
        }

        let mut drained_pages = 0usize;
        for (addr, tag) in &nodes[cut..] {
            let pg = self.ctx.db.region.page(*addr);
            for freed in abandoned::drain_all(pg) {
                self.ctx.reuse_pool.push(freed);
                drained_pages += 1;
            }
            debug!(
                "batch {}: drained abandoned node {} (tag {})",
                self.ctx.id,
                addr.raw(),
                tag
            );
        }

        if cut == 0 {
            self.root.abandoned_head = DbAddress::NULL;
        } else {
            // COW выжившего префикса с перешивкой next.
            let mut new_addrs: Vec<DbAddress> = Vec::with_capacity(cut);
            for (addr, _tag) in &nodes[..cut] {
                new_addrs.push(self.ctx.ensure_writable(*addr)?);
            }
            for i in 0..cut {
                let next = if i + 1 < cut {
                    new_addrs[i + 1]
                } else {
                    DbAddress::NULL
                };
                abandoned::set_next(self.ctx.db.region.page_mut(new_addrs[i]), next);
            }
            self.root.abandoned_head = new_addrs[0];
        }

        // Сами узлы-страницы уходят в свежую регистрацию: старые корни кольца
        // ещё ссылаются на них своими цепочками.
        for (addr, _tag) in &nodes[cut..] {
            self.ctx.register_for_future_reuse(*addr)?;
        }
        if drained_pages > 0 {
            info!(
                "batch {}: {} pages ready for reuse",
                self.ctx.id, drained_pages
            );
        }
        Ok(())
    }

    // ---- Публичные операции ----

    /// Записывает упакованный аккаунт; пустое значение удаляет аккаунт
    /// вместе с его storage.
    pub fn set_account(&mut self, account: &[u8; KECCAK_SIZE], packed: &[u8]) -> Result<()> {
        let path = NibblePath::from_keccak(account);
        if packed.is_empty() {
            route_delete(&mut self.ctx, &mut self.root, &Key::account(path))?;
            // Вычищаем storage-сторону аккаунта целиком.
            route_delete_by_prefix(
                &mut self.ctx,
                &mut self.root,
                &Key::storage_merkle(path, NibblePath::empty()),
            )?;
            self.changes.accounts.insert(*account, true);
            self.changes.storage.remove(account);
            return Ok(());
        }
        route_set(&mut self.ctx, &mut self.root, &Key::account(path), packed)?;
        self.changes.accounts.insert(*account, false);
        Ok(())
    }

    /// Записывает storage-ячейку (канонизируя значение); ноль удаляет её.
    pub fn set_storage(
        &mut self,
        account: &[u8; KECCAK_SIZE],
        slot: &[u8; KECCAK_SIZE],
        value: &[u8],
    ) -> Result<()> {
        let ap = NibblePath::from_keccak(account);
        let sp = NibblePath::from_keccak(slot);
        let key = Key::storage_cell(ap, sp);
        if value.is_empty() || storage_is_zero(value) {
            route_delete(&mut self.ctx, &mut self.root, &key)?;
            self.changes
                .storage
                .entry(*account)
                .or_default()
                .insert(*slot, true);
            return Ok(());
        }
        route_set(&mut self.ctx, &mut self.root, &key, storage_trim(value))?;
        self.changes
            .storage
            .entry(*account)
            .or_default()
            .insert(*slot, false);
        Ok(())
    }

    /// Сырая запись без регистрации в ChangeSet (Merkle её не видит).
    pub fn set_raw(&mut self, key: &Key<'_>, value: &[u8]) -> Result<()> {
        route_set(&mut self.ctx, &mut self.root, key, value)
    }

    /// Сырая зачистка поддерева по префиксу. Возвращает число удалённых.
    pub fn delete_by_prefix(&mut self, prefix: &Key<'_>) -> Result<usize> {
        route_delete_by_prefix(&mut self.ctx, &mut self.root, prefix)
    }

    pub fn try_get(&self, key: &Key<'_>) -> Result<Option<Vec<u8>>> {
        Ok(route_get(&self.ctx, &self.root, key)?.map(|v| v.to_vec()))
    }

    pub fn set_metadata(&mut self, block_number: u64, state_hash: &[u8; KECCAK_SIZE]) {
        self.root.block_number = block_number;
        self.root.state_hash = *state_hash;
    }

    pub fn metadata(&self) -> (u64, [u8; KECCAK_SIZE]) {
        (self.root.block_number, self.root.state_hash)
    }

    /// Коммит: Merkle-хук, цепочка брошенных, слот кольца, долговечность по
    /// опциям. Возвращает корневой хэш состояния (прежний, если изменений
    /// для Merkle не было).
    pub fn commit(mut self, options: CommitOptions) -> Result<[u8; KECCAK_SIZE]> {
        // 1. Merkle: реструктуризация и корневой хэш. Ошибка целостности
        // оставляет базу на прежнем корне — батч просто бросается.
        let state_root = if self.changes.is_empty() {
            self.root.state_hash
        } else {
            let changes = std::mem::take(&mut self.changes);
            let parallel = self.ctx.db.parallel.load(Ordering::Relaxed);
            merkle::before_commit(&mut self, &changes, parallel)?
        };

        // 2. Недоеденный пул переиспользования возвращается в учёт: эти
        // адреса уже выдернуты из цепочки и иначе утекли бы навсегда.
        let leftovers = std::mem::take(&mut self.ctx.reuse_pool);
        for addr in leftovers {
            self.ctx.register_for_future_reuse(addr)?;
        }

        // 3. Брошенные адреса батча — в голову цепочки, с меткой батча.
        let abandoned = std::mem::take(&mut self.ctx.abandoned);
        if !abandoned.is_empty() {
            debug!(
                "batch {}: {} pages abandoned",
                self.ctx.id,
                abandoned.len()
            );
            let mut head = self.root.abandoned_head;
            let mut pending = abandoned.as_slice();
            while !pending.is_empty() {
                let node = self.ctx.get_new_page(PAGE_TYPE_ABANDONED)?;
                let take = pending.len().min(abandoned::CAPACITY);
                {
                    let pg = self.ctx.db.region.page_mut(node);
                    abandoned::set_next(pg, head);
                    for addr in &pending[..take] {
                        let ok = abandoned::try_push(pg, *addr);
                        debug_assert!(ok);
                    }
                }
                head = node;
                pending = &pending[take..];
            }
            self.root.abandoned_head = head;
        }

        // 4. Черновик корня.
        self.root.next_free_page = self.ctx.next_free;
        self.root.batch_id = self.ctx.id;

        // 5. Долговечность данных до публикации корня.
        self.ctx.db.region.flush_data(self.ctx.db.history)?;

        // 6. Публикация корня в слот кольца (под замком кольца).
        let slot = self.ctx.db.root_slot(self.ctx.id);
        {
            let _ring = self.ctx.db.leases.lock().unwrap();
            self.root.write_to(self.ctx.db.region.page_mut(slot));
            *self.ctx.db.latest.lock().unwrap() = self.ctx.id;
        }
        if options == CommitOptions::FlushDataAndRoot {
            self.ctx.db.region.flush_page(slot)?;
        }

        info!(
            "batch {}: committed (root slot {}, state root {:02x}{:02x}..)",
            self.ctx.id,
            slot.raw(),
            state_root[0],
            state_root[1]
        );
        self.committed = true;
        self.ctx.db.release_writer();
        Ok(state_root)
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if !self.committed {
            // Аллокации не публиковались: черновик корня просто исчезает.
            warn!("batch {}: dropped without commit", self.ctx.id);
            self.ctx.db.release_writer();
        }
    }
}

// ---- Merkle-коммит поверх батча ----

impl merkle::MerkleRead for Batch {
    fn get_value(&self, key: &Key<'_>) -> Result<Option<Vec<u8>>> {
        self.try_get(key)
    }
}

impl merkle::MerkleCommit for Batch {
    fn set_value(&mut self, key: &Key<'_>, value: &[u8]) -> Result<()> {
        self.set_raw(key, value)
    }

    fn remove_value(&mut self, key: &Key<'_>) -> Result<()> {
        route_delete(&mut self.ctx, &mut self.root, key)?;
        Ok(())
    }
}

