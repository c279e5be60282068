//! Семейство типизированных страниц поверх общего 8-байтного заголовка.
//!
//! Заголовок: [batch_id u32][page_type u8][version u8][reserved u16].
//! Страница с batch_id текущего батча принадлежит писателю и правится на
//! месте; страница со старым batch_id разделена со снапшотами и перед
//! правкой копируется (ensure_writable).

pub mod abandoned;
pub mod bottom;
pub mod data;
pub mod fanout;
pub mod overflow;
pub mod root;

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};

use crate::addr::DbAddress;
use crate::consts::{
    PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_TYPE_BOTTOM, PAGE_TYPE_DATA, PAGE_TYPE_LEAF_OVERFLOW,
    PAPRIKA_VERSION,
};
use crate::error::Error;
use crate::key::DecodedKey;

#[derive(Clone, Copy, Debug)]
pub struct PageHeader {
    pub batch_id: u32,
    pub page_type: u8,
    pub version: u8,
}

pub fn read_header(page: &[u8]) -> PageHeader {
    PageHeader {
        batch_id: LittleEndian::read_u32(&page[0..4]),
        page_type: page[4],
        version: page[5],
    }
}

pub fn write_header(page: &mut [u8], h: &PageHeader) {
    LittleEndian::write_u32(&mut page[0..4], h.batch_id);
    page[4] = h.page_type;
    page[5] = h.version;
    page[6] = 0;
    page[7] = 0;
}

#[inline]
pub fn page_type(page: &[u8]) -> u8 {
    page[4]
}

#[inline]
pub fn batch_id(page: &[u8]) -> u32 {
    LittleEndian::read_u32(&page[0..4])
}

#[inline]
pub fn set_batch_id(page: &mut [u8], batch: u32) {
    LittleEndian::write_u32(&mut page[0..4], batch);
}

#[inline]
pub fn body(page: &[u8]) -> &[u8] {
    &page[PAGE_HEADER_SIZE..PAGE_SIZE]
}

#[inline]
pub fn body_mut(page: &mut [u8]) -> &mut [u8] {
    &mut page[PAGE_HEADER_SIZE..PAGE_SIZE]
}

/// Страница обязана иметь ожидаемый тип; иное — фатальная логическая ошибка.
pub fn expect_type(page: &[u8], addr: DbAddress, expected: u8) -> Result<()> {
    let found = page_type(page);
    if found != expected {
        return Err(Error::PageTypeMismatch {
            addr: addr.raw(),
            expected,
            found,
        }
        .into());
    }
    Ok(())
}

/// Инициализация свежей страницы: заголовок + обнулённое тело.
pub fn init_page(page: &mut [u8], batch: u32, ty: u8) {
    for b in page.iter_mut() {
        *b = 0;
    }
    write_header(
        page,
        &PageHeader {
            batch_id: batch,
            page_type: ty,
            version: PAPRIKA_VERSION,
        },
    );
}

/// Доступ на чтение к страницам батча или снапшота.
pub trait ReadCtx {
    fn page(&self, addr: DbAddress) -> Result<&[u8]>;
}

/// Контекст батча записи: COW-аллокация и учёт освобождённых страниц.
pub trait WriteCtx: ReadCtx {
    fn batch_id(&self) -> u32;
    fn page_mut(&mut self, addr: DbAddress) -> Result<&mut [u8]>;
    /// Новая страница из пула переиспользования или хвоста файла;
    /// заголовок проштампован текущим батчем.
    fn get_new_page(&mut self, ty: u8) -> Result<DbAddress>;
    /// COW: страница текущего батча возвращается как есть, старая
    /// копируется в новую, прежний адрес уходит в отложенное
    /// переиспользование.
    fn ensure_writable(&mut self, addr: DbAddress) -> Result<DbAddress>;
    fn register_for_future_reuse(&mut self, addr: DbAddress) -> Result<()>;
}

// ---- Диспетчеризация дерева страниц по типу ----

/// Вставка в поддерево. Возвращает (возможно новый после COW) адрес корня
/// поддерева: вызывающий обязан обновить свой указатель.
pub fn tree_set(
    ctx: &mut impl WriteCtx,
    addr: DbAddress,
    enc: &[u8],
    value: &[u8],
) -> Result<DbAddress> {
    let addr = ctx.ensure_writable(addr)?;
    match page_type(ctx.page(addr)?) {
        PAGE_TYPE_DATA => data::set(ctx, addr, enc, value),
        PAGE_TYPE_BOTTOM => bottom::set(ctx, addr, enc, value),
        PAGE_TYPE_LEAF_OVERFLOW => overflow::set(ctx, addr, enc, value),
        other => Err(Error::PageTypeMismatch {
            addr: addr.raw(),
            expected: PAGE_TYPE_DATA,
            found: other,
        }
        .into()),
    }
}

pub fn tree_get<'c>(
    ctx: &'c impl ReadCtx,
    addr: DbAddress,
    enc: &[u8],
) -> Result<Option<&'c [u8]>> {
    match page_type(ctx.page(addr)?) {
        PAGE_TYPE_DATA => data::get(ctx, addr, enc),
        PAGE_TYPE_BOTTOM => bottom::get(ctx, addr, enc),
        PAGE_TYPE_LEAF_OVERFLOW => overflow::get(ctx, addr, enc),
        other => Err(Error::PageTypeMismatch {
            addr: addr.raw(),
            expected: PAGE_TYPE_DATA,
            found: other,
        }
        .into()),
    }
}

/// Удаление (tombstone на месте, без ребалансировки).
pub fn tree_delete(
    ctx: &mut impl WriteCtx,
    addr: DbAddress,
    enc: &[u8],
) -> Result<(DbAddress, bool)> {
    let addr = ctx.ensure_writable(addr)?;
    match page_type(ctx.page(addr)?) {
        PAGE_TYPE_DATA => data::delete(ctx, addr, enc),
        PAGE_TYPE_BOTTOM => bottom::delete(ctx, addr, enc),
        PAGE_TYPE_LEAF_OVERFLOW => overflow::delete(ctx, addr, enc),
        other => Err(Error::PageTypeMismatch {
            addr: addr.raw(),
            expected: PAGE_TYPE_DATA,
            found: other,
        }
        .into()),
    }
}

/// Удаление всех ключей поддерева, чей комбинированный поток начинается с
/// префикса. Возвращает (адрес, число удалённых).
pub fn tree_delete_by_prefix(
    ctx: &mut impl WriteCtx,
    addr: DbAddress,
    prefix: &DecodedKey,
) -> Result<(DbAddress, usize)> {
    let addr = ctx.ensure_writable(addr)?;
    match page_type(ctx.page(addr)?) {
        PAGE_TYPE_DATA => data::delete_by_prefix(ctx, addr, prefix),
        PAGE_TYPE_BOTTOM => bottom::delete_by_prefix(ctx, addr, prefix),
        PAGE_TYPE_LEAF_OVERFLOW => overflow::delete_by_prefix(ctx, addr, prefix),
        other => Err(Error::PageTypeMismatch {
            addr: addr.raw(),
            expected: PAGE_TYPE_DATA,
            found: other,
        }
        .into()),
    }
}
