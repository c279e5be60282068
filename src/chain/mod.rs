//! MultiHeadChain — конкурентный фасад над PagedDb: несколько голов с
//! in-memory оверлеями поверх общей базы, фоновый финализатор, который
//! сериализует предложенные батчи в PagedDb строго FIFO.
//!
//! Поток и каналы вместо async-рантайма; предложенный батч жив, пока его
//! Arc держит хоть один читатель, так что финализация не инвалидирует
//! уже выданные ридеры.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use crate::account::{storage_is_zero, storage_trim};
use crate::bits::BitMapFilter;
use crate::consts::KECCAK_SIZE;
use crate::db::{CommitOptions, PagedDb, ReadOnlyBatch};
use crate::key::{self, Key};
use crate::nibble::NibblePath;

/// Запись оверлея: логическая операция для реплея в PagedDb.
#[derive(Clone, Debug)]
enum WriteOp {
    Account([u8; KECCAK_SIZE], Vec<u8>),
    Storage([u8; KECCAK_SIZE], [u8; KECCAK_SIZE], Vec<u8>),
    Raw(Vec<u8>, Vec<u8>),
}

/// Замороженный оверлей головы, ожидающий финализации.
pub struct ProposedBatch {
    block_number: u64,
    state_hash: [u8; KECCAK_SIZE],
    parent_hash: [u8; KECCAK_SIZE],
    /// Канонически закодированный ключ -> значение (None = удаление).
    reads: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Быстрый отсев промахов перед поиском по дереву.
    filter: BitMapFilter,
    /// Операции в порядке применения.
    ops: Vec<WriteOp>,
}

impl ProposedBatch {
    pub fn state_hash(&self) -> [u8; KECCAK_SIZE] {
        self.state_hash
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    fn lookup(&self, canonical: &[u8]) -> Option<Option<&Vec<u8>>> {
        if !self.filter.may_contain(canonical) {
            return None;
        }
        self.reads.get(canonical).map(|v| v.as_ref())
    }
}

struct Shared {
    db: PagedDb,
    /// Предложенные, ещё не финализованные батчи (FIFO).
    proposed: Mutex<VecDeque<Arc<ProposedBatch>>>,
}

enum Msg {
    Finalize([u8; KECCAK_SIZE], Sender<Result<()>>),
    Shutdown,
}

pub struct MultiHeadChain {
    shared: Arc<Shared>,
    tx: Sender<Msg>,
    finalizer: Option<JoinHandle<()>>,
}

/// Будущее завершения финализации: блокирующее ожидание в стиле каналов.
pub struct FinalizeHandle {
    rx: Receiver<Result<()>>,
}

impl FinalizeHandle {
    /// Ждёт, пока цепочка до запрошенного state hash не окажется в PagedDb.
    pub fn wait(self) -> Result<()> {
        self.rx
            .recv()
            .map_err(|_| anyhow!("finalizer thread is gone"))?
    }
}

/// Читатель цепочки: оверлеи предложенных батчей поверх снапшота базы.
pub struct Reader {
    /// От новых к старым: цепочка предков до финализованного корня.
    overlays: Vec<Arc<ProposedBatch>>,
    base: Option<ReadOnlyBatch>,
}

impl Reader {
    pub fn try_get(&self, key: &Key<'_>) -> Result<Option<Vec<u8>>> {
        let canonical = key::encode(key, false).to_vec();
        for overlay in &self.overlays {
            if let Some(hit) = overlay.lookup(&canonical) {
                return Ok(hit.cloned());
            }
        }
        match &self.base {
            Some(base) => base.try_get(key),
            None => Ok(None),
        }
    }

    pub fn metadata(&self) -> (u64, [u8; KECCAK_SIZE]) {
        if let Some(first) = self.overlays.first() {
            (first.block_number, first.state_hash)
        } else if let Some(base) = &self.base {
            base.metadata()
        } else {
            (0, [0u8; KECCAK_SIZE])
        }
    }
}

/// Голова записи: изменяемый оверлей над родительским состоянием.
pub struct Head {
    shared: Arc<Shared>,
    parent_hash: [u8; KECCAK_SIZE],
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ops: Vec<WriteOp>,
}

impl Head {
    pub fn set_account(&mut self, account: &[u8; KECCAK_SIZE], packed: &[u8]) {
        let ap = NibblePath::from_keccak(account);
        let canonical = key::encode(&Key::account(ap), false).to_vec();
        let value = (!packed.is_empty()).then(|| packed.to_vec());
        self.pending.insert(canonical, value);
        self.ops.push(WriteOp::Account(*account, packed.to_vec()));
    }

    pub fn set_storage(
        &mut self,
        account: &[u8; KECCAK_SIZE],
        slot: &[u8; KECCAK_SIZE],
        value: &[u8],
    ) {
        let ap = NibblePath::from_keccak(account);
        let sp = NibblePath::from_keccak(slot);
        let canonical = key::encode(&Key::storage_cell(ap, sp), false).to_vec();
        let stored = (!value.is_empty() && !storage_is_zero(value))
            .then(|| storage_trim(value).to_vec());
        self.pending.insert(canonical, stored);
        self.ops.push(WriteOp::Storage(*account, *slot, value.to_vec()));
    }

    pub fn set_raw(&mut self, key: &Key<'_>, value: &[u8]) {
        let canonical = key::encode(key, false).to_vec();
        self.pending.insert(canonical.clone(), Some(value.to_vec()));
        self.ops.push(WriteOp::Raw(canonical, value.to_vec()));
    }

    /// Чтение: собственный оверлей -> предложенные предки -> база.
    pub fn try_get(&self, key: &Key<'_>) -> Result<Option<Vec<u8>>> {
        let canonical = key::encode(key, false).to_vec();
        if let Some(v) = self.pending.get(&canonical) {
            return Ok(v.clone());
        }
        self.shared.reader_at(&self.parent_hash)?.try_get(key)
    }

    /// Замораживает оверлей в предложенный батч и перевешивает голову на
    /// новый state hash.
    pub fn commit(&mut self, block_number: u64, state_hash: [u8; KECCAK_SIZE]) -> Result<()> {
        let reads = std::mem::take(&mut self.pending);
        let ops = std::mem::take(&mut self.ops);
        let mut filter = BitMapFilter::new(reads.len().max(64) * 8);
        for k in reads.keys() {
            filter.insert(k);
        }
        let proposed = Arc::new(ProposedBatch {
            block_number,
            state_hash,
            parent_hash: self.parent_hash,
            reads,
            filter,
            ops,
        });
        self.shared.proposed.lock().unwrap().push_back(proposed);
        debug!(
            "chain: head proposed block {} ({:02x}{:02x}..)",
            block_number, state_hash[0], state_hash[1]
        );
        self.parent_hash = state_hash;
        Ok(())
    }
}

impl Shared {
    /// Ридер состояния с данным хэшем: сперва предложенные батчи, затем
    /// кольцо корней базы.
    fn reader_at(&self, state_hash: &[u8; KECCAK_SIZE]) -> Result<Reader> {
        let proposed = self.proposed.lock().unwrap();
        if let Some(pos) = proposed.iter().position(|p| &p.state_hash == state_hash) {
            // Цепочка предков от pos вниз до финализованной базы.
            let mut overlays: Vec<Arc<ProposedBatch>> = Vec::with_capacity(pos + 1);
            let mut want = *state_hash;
            for p in proposed.iter().take(pos + 1).rev() {
                if p.state_hash == want {
                    overlays.push(Arc::clone(p));
                    want = p.parent_hash;
                }
            }
            drop(proposed);
            let base = match self.db.begin_read_only_batch_at(&want) {
                Ok(b) => Some(b),
                Err(_) => None, // предки до генезиса
            };
            return Ok(Reader { overlays, base });
        }
        drop(proposed);
        let base = self.db.begin_read_only_batch_at(state_hash)?;
        Ok(Reader {
            overlays: Vec::new(),
            base: Some(base),
        })
    }
}

/// Открывает цепочку с фоновым финализатором.
pub fn open_multi_head_chain(db: PagedDb) -> MultiHeadChain {
    let shared = Arc::new(Shared {
        db,
        proposed: Mutex::new(VecDeque::new()),
    });
    let (tx, rx) = channel::<Msg>();
    let worker = Arc::clone(&shared);
    let finalizer = std::thread::Builder::new()
        .name("paprika-finalizer".into())
        .spawn(move || finalizer_loop(worker, rx))
        .expect("spawn finalizer");
    info!("chain: finalizer started");
    MultiHeadChain {
        shared,
        tx,
        finalizer: Some(finalizer),
    }
}

fn finalizer_loop(shared: Arc<Shared>, rx: Receiver<Msg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Shutdown => break,
            Msg::Finalize(hash, done) => {
                let result = finalize_up_to(&shared, &hash);
                let _ = done.send(result);
            }
        }
    }
}

/// Сбрасывает предложенные батчи FIFO, пока не будет финализован hash.
fn finalize_up_to(shared: &Shared, hash: &[u8; KECCAK_SIZE]) -> Result<()> {
    // Хэш должен существовать среди предложенных или уже быть в базе.
    let known = {
        let proposed = shared.proposed.lock().unwrap();
        proposed.iter().any(|p| &p.state_hash == hash)
    };
    if !known {
        if shared.db.has_state(hash) {
            return Ok(());
        }
        return Err(anyhow!("finalize: unknown state hash"));
    }

    loop {
        let next = {
            let proposed = shared.proposed.lock().unwrap();
            proposed.front().cloned()
        };
        let Some(batch) = next else {
            return Err(anyhow!("finalize: proposed queue drained unexpectedly"));
        };

        let mut db_batch = shared.db.begin_next_batch()?;
        for op in &batch.ops {
            match op {
                WriteOp::Account(h, packed) => db_batch.set_account(h, packed)?,
                WriteOp::Storage(a, s, v) => db_batch.set_storage(a, s, v)?,
                WriteOp::Raw(canonical, v) => {
                    let decoded = key::decode(canonical)?;
                    db_batch.set_raw(&decoded.as_key(), v)?;
                }
            }
        }
        db_batch.set_metadata(batch.block_number, &batch.state_hash);
        db_batch.commit(CommitOptions::FlushDataAndRoot)?;
        info!(
            "chain: finalized block {} ({:02x}{:02x}..)",
            batch.block_number, batch.state_hash[0], batch.state_hash[1]
        );

        // Батч ушёл в базу: убираем из буфера. Arc остаётся живым у
        // читателей, которые его ещё держат.
        {
            let mut proposed = shared.proposed.lock().unwrap();
            let front = proposed.pop_front();
            debug_assert!(front.map_or(false, |f| Arc::ptr_eq(&f, &batch)));
        }

        if &batch.state_hash == hash {
            return Ok(());
        }
    }
}

impl MultiHeadChain {
    /// Новая голова поверх состояния parent_state_hash.
    pub fn begin(&self, parent_state_hash: &[u8; KECCAK_SIZE]) -> Result<Head> {
        // Родитель обязан быть известен: среди предложенных или в базе.
        let _probe = self.shared.reader_at(parent_state_hash)?;
        Ok(Head {
            shared: Arc::clone(&self.shared),
            parent_hash: *parent_state_hash,
            pending: BTreeMap::new(),
            ops: Vec::new(),
        })
    }

    /// Голова поверх последнего финализованного состояния.
    pub fn begin_at_latest(&self) -> Result<Head> {
        let (_, hash) = self.shared.db.begin_read_only_batch()?.metadata();
        Ok(Head {
            shared: Arc::clone(&self.shared),
            parent_hash: hash,
            pending: BTreeMap::new(),
            ops: Vec::new(),
        })
    }

    /// Финализация цепочки до state_hash включительно (FIFO).
    pub fn finalize(&self, state_hash: [u8; KECCAK_SIZE]) -> FinalizeHandle {
        let (done_tx, done_rx) = channel();
        if self.tx.send(Msg::Finalize(state_hash, done_tx)).is_err() {
            warn!("chain: finalizer unavailable");
        }
        FinalizeHandle { rx: done_rx }
    }

    /// Ридер состояния: предложенные батчи, затем кольцо корней.
    pub fn try_lease_reader(&self, state_hash: &[u8; KECCAK_SIZE]) -> Option<Reader> {
        self.shared.reader_at(state_hash).ok()
    }

    /// Ридер последнего финализованного корня.
    pub fn lease_latest_finalized(&self) -> Result<Reader> {
        Ok(Reader {
            overlays: Vec::new(),
            base: Some(self.shared.db.lease_latest_finalized()?),
        })
    }
}

impl Drop for MultiHeadChain {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(h) = self.finalizer.take() {
            let _ = h.join();
        }
    }
}
