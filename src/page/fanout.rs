//! StorageFanOut: трёхуровневая адресация storage-поддеревьев по первым
//! шести ниблам хэша аккаунта. Каждый уровень — страница со списком из 256
//! фиксированных адресов; листовое поддерево добирает последние 16 "вёдер"
//! своим нибловым фан-аутом.

use anyhow::Result;

use crate::addr::{list, DbAddress};
use crate::consts::{FANOUT_ENTRIES, PAGE_TYPE_BOTTOM, PAGE_TYPE_FANOUT, STORAGE_CONSUMED_NIBBLES};
use crate::nibble::NibblePath;

use super::{body, body_mut, expect_type, ReadCtx, WriteCtx};

/// Индексы уровней из первых 24 бит (6 ниблов) пути аккаунта.
pub fn indices(account: &NibblePath<'_>) -> (usize, usize, usize) {
    debug_assert!(account.len() >= STORAGE_CONSUMED_NIBBLES);
    let mut raw = 0usize;
    for i in 0..STORAGE_CONSUMED_NIBBLES {
        raw = (raw << 4) | account.nibble_at(i) as usize;
    }
    (raw >> 16, (raw >> 8) & 0xFF, raw & 0xFF)
}

pub fn get_entry(page: &[u8], idx: usize) -> DbAddress {
    debug_assert!(idx < FANOUT_ENTRIES);
    list::get(body(page), idx)
}

pub fn set_entry(page: &mut [u8], idx: usize, addr: DbAddress) {
    debug_assert!(idx < FANOUT_ENTRIES);
    list::set(body_mut(page), idx, addr);
}

/// Читающая маршрутизация: адрес листового поддерева или None, если путь
/// ещё не прокладывался.
pub fn route_read(
    ctx: &impl ReadCtx,
    l1: DbAddress,
    account: &NibblePath<'_>,
) -> Result<Option<DbAddress>> {
    if l1.is_null() {
        return Ok(None);
    }
    let (i0, i1, i2) = indices(account);
    let p1 = ctx.page(l1)?;
    expect_type(p1, l1, PAGE_TYPE_FANOUT)?;
    let l2 = get_entry(p1, i0);
    if l2.is_null() {
        return Ok(None);
    }
    let p2 = ctx.page(l2)?;
    expect_type(p2, l2, PAGE_TYPE_FANOUT)?;
    let l3 = get_entry(p2, i1);
    if l3.is_null() {
        return Ok(None);
    }
    let p3 = ctx.page(l3)?;
    expect_type(p3, l3, PAGE_TYPE_FANOUT)?;
    let leaf = get_entry(p3, i2);
    Ok((!leaf.is_null()).then_some(leaf))
}

/// Пишущая маршрутизация: уровни и листовое поддерево создаются по мере
/// надобности, COW по дороге. Возвращает (новый адрес L1, адрес поддерева).
pub fn route_write(
    ctx: &mut impl WriteCtx,
    l1: DbAddress,
    account: &NibblePath<'_>,
) -> Result<(DbAddress, DbAddress)> {
    let (i0, i1, i2) = indices(account);

    let l1 = ensure_level(ctx, l1)?;
    let l2_old = get_entry(ctx.page(l1)?, i0);
    let l2 = ensure_level(ctx, l2_old)?;
    set_entry(ctx.page_mut(l1)?, i0, l2);
    let l3_old = get_entry(ctx.page(l2)?, i1);
    let l3 = ensure_level(ctx, l3_old)?;
    set_entry(ctx.page_mut(l2)?, i1, l3);

    let leaf = get_entry(ctx.page(l3)?, i2);
    let leaf = if leaf.is_null() {
        let fresh = ctx.get_new_page(PAGE_TYPE_BOTTOM)?;
        super::bottom::init(ctx.page_mut(fresh)?);
        fresh
    } else {
        leaf
    };
    set_entry(ctx.page_mut(l3)?, i2, leaf);
    Ok((l1, leaf))
}

fn ensure_level(ctx: &mut impl WriteCtx, addr: DbAddress) -> Result<DbAddress> {
    if addr.is_null() {
        let fresh = ctx.get_new_page(PAGE_TYPE_FANOUT)?;
        return Ok(fresh);
    }
    let addr = ctx.ensure_writable(addr)?;
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_FANOUT)?;
    Ok(addr)
}

/// Обновляет запись листового поддерева после set/delete ниже.
pub fn update_leaf(
    ctx: &mut impl WriteCtx,
    l1: DbAddress,
    account: &NibblePath<'_>,
    leaf: DbAddress,
) -> Result<()> {
    let (i0, i1, i2) = indices(account);
    let l2 = get_entry(ctx.page(l1)?, i0);
    let l3 = get_entry(ctx.page(l2)?, i1);
    set_entry(ctx.page_mut(l3)?, i2, leaf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_consume_six_nibbles() {
        let hash = [0x12, 0x34, 0x56, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let p = NibblePath::from_slice(&hash);
        let (i0, i1, i2) = indices(&p);
        assert_eq!(i0, 0x12);
        assert_eq!(i1, 0x34);
        assert_eq!(i2, 0x56);
    }
}
