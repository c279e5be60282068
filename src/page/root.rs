//! RootPage — слот кольца истории. В отличие от остальных страниц, у корня
//! нет общего PageHeader: страница начинается с собственной магии.
//!
//! Раскладка (LE, байтовые смещения):
//! ```text
//!   0  magic[4] = "PPRK"
//!   4  version u8 = 1
//!   5  reserved[3]
//!   8  size_pages u64
//!  16  block_number u64
//!  24  state_hash [32]
//!  56  next_free_page u32
//!  60  abandoned_head DbAddress
//!  64  storage_fanout_root DbAddress
//!  68  batch_id u32
//!  72  state fan-out: 256 * DbAddress
//! ```

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::addr::DbAddress;
use crate::consts::{KECCAK_SIZE, PAGE_SIZE, PAPRIKA_VERSION, ROOT_FANOUT, ROOT_MAGIC};
use crate::error::Error;

const OFF_VERSION: usize = 4;
const OFF_SIZE_PAGES: usize = 8;
const OFF_BLOCK_NUMBER: usize = 16;
const OFF_STATE_HASH: usize = 24;
const OFF_NEXT_FREE: usize = 56;
const OFF_ABANDONED: usize = 60;
const OFF_STORAGE_FANOUT: usize = 64;
const OFF_BATCH_ID: usize = 68;
const OFF_STATE_FANOUT: usize = 72;

/// Разобранная копия корневого слота; батч мутирует её как черновик и
/// сериализует при коммите.
#[derive(Clone, Debug)]
pub struct RootPage {
    pub batch_id: u32,
    pub size_pages: u64,
    pub block_number: u64,
    pub state_hash: [u8; KECCAK_SIZE],
    pub next_free_page: u32,
    pub abandoned_head: DbAddress,
    pub storage_fanout_root: DbAddress,
    pub state_fanout: [DbAddress; ROOT_FANOUT],
}

impl RootPage {
    pub fn new_initial(size_pages: u64, history_depth: usize) -> Self {
        RootPage {
            batch_id: 0,
            size_pages,
            block_number: 0,
            state_hash: [0u8; KECCAK_SIZE],
            next_free_page: history_depth as u32,
            abandoned_head: DbAddress::NULL,
            storage_fanout_root: DbAddress::NULL,
            state_fanout: [DbAddress::NULL; ROOT_FANOUT],
        }
    }

    /// Слот считается занятым, если в нём есть магия.
    pub fn is_initialized(page: &[u8]) -> bool {
        &page[0..4] == ROOT_MAGIC
    }

    pub fn read_from(page: &[u8]) -> Result<RootPage> {
        if page.len() < PAGE_SIZE {
            return Err(anyhow!("root page: buffer too small"));
        }
        if !Self::is_initialized(page) {
            return Err(anyhow!("root page: bad magic"));
        }
        let version = page[OFF_VERSION];
        if version != PAPRIKA_VERSION {
            return Err(Error::VersionMismatch {
                expected: PAPRIKA_VERSION,
                found: version,
            }
            .into());
        }
        let mut state_hash = [0u8; KECCAK_SIZE];
        state_hash.copy_from_slice(&page[OFF_STATE_HASH..OFF_STATE_HASH + KECCAK_SIZE]);
        let mut state_fanout = [DbAddress::NULL; ROOT_FANOUT];
        for (i, slot) in state_fanout.iter_mut().enumerate() {
            *slot = DbAddress::read(&page[OFF_STATE_FANOUT + i * 4..OFF_STATE_FANOUT + i * 4 + 4]);
        }
        Ok(RootPage {
            batch_id: LittleEndian::read_u32(&page[OFF_BATCH_ID..OFF_BATCH_ID + 4]),
            size_pages: LittleEndian::read_u64(&page[OFF_SIZE_PAGES..OFF_SIZE_PAGES + 8]),
            block_number: LittleEndian::read_u64(&page[OFF_BLOCK_NUMBER..OFF_BLOCK_NUMBER + 8]),
            state_hash,
            next_free_page: LittleEndian::read_u32(&page[OFF_NEXT_FREE..OFF_NEXT_FREE + 4]),
            abandoned_head: DbAddress::read(&page[OFF_ABANDONED..OFF_ABANDONED + 4]),
            storage_fanout_root: DbAddress::read(
                &page[OFF_STORAGE_FANOUT..OFF_STORAGE_FANOUT + 4],
            ),
            state_fanout,
        })
    }

    pub fn write_to(&self, page: &mut [u8]) {
        for b in page.iter_mut() {
            *b = 0;
        }
        page[0..4].copy_from_slice(ROOT_MAGIC);
        page[OFF_VERSION] = PAPRIKA_VERSION;
        LittleEndian::write_u64(&mut page[OFF_SIZE_PAGES..OFF_SIZE_PAGES + 8], self.size_pages);
        LittleEndian::write_u64(
            &mut page[OFF_BLOCK_NUMBER..OFF_BLOCK_NUMBER + 8],
            self.block_number,
        );
        page[OFF_STATE_HASH..OFF_STATE_HASH + KECCAK_SIZE].copy_from_slice(&self.state_hash);
        LittleEndian::write_u32(
            &mut page[OFF_NEXT_FREE..OFF_NEXT_FREE + 4],
            self.next_free_page,
        );
        self.abandoned_head
            .write(&mut page[OFF_ABANDONED..OFF_ABANDONED + 4]);
        self.storage_fanout_root
            .write(&mut page[OFF_STORAGE_FANOUT..OFF_STORAGE_FANOUT + 4]);
        LittleEndian::write_u32(&mut page[OFF_BATCH_ID..OFF_BATCH_ID + 4], self.batch_id);
        for (i, slot) in self.state_fanout.iter().enumerate() {
            slot.write(&mut page[OFF_STATE_FANOUT + i * 4..OFF_STATE_FANOUT + i * 4 + 4]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut r = RootPage::new_initial(1024, 2);
        r.batch_id = 9;
        r.block_number = 100;
        r.state_hash = [0xAB; 32];
        r.next_free_page = 77;
        r.abandoned_head = DbAddress::new(5);
        r.storage_fanout_root = DbAddress::new(6);
        r.state_fanout[0] = DbAddress::new(10);
        r.state_fanout[255] = DbAddress::new(11);

        let mut page = vec![0u8; PAGE_SIZE];
        r.write_to(&mut page);
        assert!(RootPage::is_initialized(&page));
        let back = RootPage::read_from(&page).unwrap();
        assert_eq!(back.batch_id, 9);
        assert_eq!(back.size_pages, 1024);
        assert_eq!(back.block_number, 100);
        assert_eq!(back.state_hash, [0xAB; 32]);
        assert_eq!(back.next_free_page, 77);
        assert_eq!(back.abandoned_head, DbAddress::new(5));
        assert_eq!(back.storage_fanout_root, DbAddress::new(6));
        assert_eq!(back.state_fanout[0], DbAddress::new(10));
        assert_eq!(back.state_fanout[255], DbAddress::new(11));
        assert_eq!(back.state_fanout[1], DbAddress::NULL);
    }

    #[test]
    fn version_mismatch_is_detected() {
        let r = RootPage::new_initial(16, 2);
        let mut page = vec![0u8; PAGE_SIZE];
        r.write_to(&mut page);
        page[OFF_VERSION] = 2;
        let err = RootPage::read_from(&page).unwrap_err();
        let kind = err.downcast_ref::<Error>().unwrap();
        assert_eq!(
            *kind,
            Error::VersionMismatch {
                expected: PAPRIKA_VERSION,
                found: 2
            }
        );
    }

    #[test]
    fn uninitialized_slot_is_not_a_root() {
        let page = vec![0u8; PAGE_SIZE];
        assert!(!RootPage::is_initialized(&page));
    }
}
