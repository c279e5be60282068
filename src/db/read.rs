//! Читатели: снимок корня под lease. Читатель копирует корневой слот при
//! взятии лизы, поэтому перезапись слота новыми коммитами ему не мешает;
//! лиза лишь удерживает достижимые страницы от переиспользования.

use std::sync::Arc;

use anyhow::Result;

use crate::addr::DbAddress;
use crate::consts::KECCAK_SIZE;
use crate::key::Key;
use crate::page::{root::RootPage, ReadCtx};

use super::{route_get, DbInner, RootLease};

pub struct ReadOnlyBatch {
    db: Arc<DbInner>,
    root: RootPage,
    _lease: RootLease,
}

impl ReadCtx for ReadOnlyBatch {
    fn page(&self, addr: DbAddress) -> Result<&[u8]> {
        Ok(self.db.region.page(addr))
    }
}

impl ReadOnlyBatch {
    pub(crate) fn new(db: Arc<DbInner>, root: RootPage, lease: RootLease) -> ReadOnlyBatch {
        ReadOnlyBatch {
            db,
            root,
            _lease: lease,
        }
    }

    pub fn batch_id(&self) -> u32 {
        self.root.batch_id
    }

    /// (block_number, state_hash) снимка.
    pub fn metadata(&self) -> (u64, [u8; KECCAK_SIZE]) {
        (self.root.block_number, self.root.state_hash)
    }

    pub fn try_get(&self, key: &Key<'_>) -> Result<Option<Vec<u8>>> {
        Ok(route_get(self, &self.root, key)?.map(|v| v.to_vec()))
    }

    /// Зеро-копи вариант: срез живёт, пока жив читатель.
    pub fn try_get_ref(&self, key: &Key<'_>) -> Result<Option<&[u8]>> {
        route_get(self, &self.root, key)
    }
}
