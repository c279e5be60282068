//! Region — плоская арена страниц поверх mmap: файл (MmapMut) или
//! анонимная память для native_memory. Один регион на базу, размер
//! фиксируется при открытии.
//!
//! Доступ к страницам — сырыми срезами по адресу. Безопасность разделения
//! обеспечивает дисциплина COW уровня базы: страница либо принадлежит
//! текущему батчу (эксклюзив писателя), либо старше и только читается;
//! писатель никогда не правит страницы, достижимые из корней читателей.

use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use log::info;
use memmap2::{MmapMut, MmapOptions};

use crate::addr::DbAddress;
use crate::consts::PAGE_SIZE;

enum Backing {
    File {
        mmap: MmapMut,
        // Дескриптор держит эксклюзивный lock до Drop.
        _file: File,
    },
    Anon(MmapMut),
}

pub struct Region {
    ptr: *mut u8,
    pages: usize,
    backing: Backing,
}

// SAFETY: регион делится между писателем и читателями; дизъюнктность
// доступа гарантирует COW-дисциплина (см. заголовок модуля).
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Открывает (или создаёт) файл-бэкенд фиксированного размера.
    pub fn open_file(path: &Path, size_bytes: usize) -> Result<Region> {
        if size_bytes == 0 || size_bytes % PAGE_SIZE != 0 {
            return Err(anyhow!(
                "backing size must be a non-zero multiple of {}, got {}",
                PAGE_SIZE,
                size_bytes
            ));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open backing {}", path.display()))?;
        file.try_lock_exclusive()
            .with_context(|| format!("lock backing {}", path.display()))?;
        let existing = file.metadata()?.len();
        if existing == 0 {
            file.set_len(size_bytes as u64)?;
        } else if existing != size_bytes as u64 {
            return Err(anyhow!(
                "backing {} has {} bytes, expected {}",
                path.display(),
                existing,
                size_bytes
            ));
        }
        let mut mmap = unsafe { MmapOptions::new().len(size_bytes).map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        info!(
            "region: mapped {} ({} pages)",
            path.display(),
            size_bytes / PAGE_SIZE
        );
        Ok(Region {
            ptr,
            pages: size_bytes / PAGE_SIZE,
            backing: Backing::File { mmap, _file: file },
        })
    }

    /// Анонимный регион в памяти.
    pub fn anon(size_bytes: usize) -> Result<Region> {
        if size_bytes == 0 || size_bytes % PAGE_SIZE != 0 {
            return Err(anyhow!(
                "backing size must be a non-zero multiple of {}, got {}",
                PAGE_SIZE,
                size_bytes
            ));
        }
        let mut mmap = MmapOptions::new().len(size_bytes).map_anon()?;
        let ptr = mmap.as_mut_ptr();
        Ok(Region {
            ptr,
            pages: size_bytes / PAGE_SIZE,
            backing: Backing::Anon(mmap),
        })
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages
    }

    #[inline]
    fn check(&self, addr: DbAddress) {
        assert!(
            (addr.raw() as usize) < self.pages,
            "page {} out of region ({} pages)",
            addr.raw(),
            self.pages
        );
    }

    /// Срез страницы на чтение.
    #[inline]
    pub fn page(&self, addr: DbAddress) -> &[u8] {
        self.check(addr);
        // SAFETY: адрес проверен; время жизни привязано к &self.
        unsafe { std::slice::from_raw_parts(self.ptr.add(addr.file_offset()), PAGE_SIZE) }
    }

    /// Срез страницы на запись. Вызывающий обязан владеть страницей
    /// (batch_id текущего батча) по COW-дисциплине.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn page_mut(&self, addr: DbAddress) -> &mut [u8] {
        self.check(addr);
        // SAFETY: адрес проверен; дизъюнктность с читателями — COW-дисциплина.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(addr.file_offset()), PAGE_SIZE) }
    }

    fn mmap(&self) -> &MmapMut {
        match &self.backing {
            Backing::File { mmap, .. } => mmap,
            Backing::Anon(mmap) => mmap,
        }
    }

    /// Сбрасывает страницы данных (всё после кольца корней).
    pub fn flush_data(&self, history_depth: usize) -> Result<()> {
        if let Backing::File { .. } = self.backing {
            let off = history_depth * PAGE_SIZE;
            self.mmap()
                .flush_range(off, self.pages * PAGE_SIZE - off)
                .context("flush data pages")?;
        }
        Ok(())
    }

    /// Сбрасывает один корневой слот.
    pub fn flush_page(&self, addr: DbAddress) -> Result<()> {
        if let Backing::File { .. } = self.backing {
            self.mmap()
                .flush_range(addr.file_offset(), PAGE_SIZE)
                .context("flush root slot")?;
        }
        Ok(())
    }
}
