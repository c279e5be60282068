//! DataPage: слотовая карта + до 16 детей по первому ниблу потока ключа и
//! отдельная overflow-страница для вытесненных записей с пустым потоком.
//!
//! Тело: [children 16*4][overflow 4][slotted ...].

use anyhow::{anyhow, Result};
use log::debug;

use crate::addr::{list, DbAddress};
use crate::consts::{BRANCH_FANOUT, PAGE_TYPE_DATA, PAGE_TYPE_LEAF_OVERFLOW};
use crate::key::{self, DecodedKey};
use crate::slotted;

use super::{body, body_mut, expect_type, tree_delete, tree_delete_by_prefix, tree_get, tree_set,
    ReadCtx, WriteCtx};

const OVERFLOW_SLOT: usize = BRANCH_FANOUT;
const SLOTTED_OFF: usize = (BRANCH_FANOUT + 1) * 4;

pub fn init(page: &mut [u8]) {
    slotted::init(&mut body_mut(page)[SLOTTED_OFF..]);
}

#[inline]
fn child(page: &[u8], n: usize) -> DbAddress {
    list::get(body(page), n)
}

#[inline]
fn set_child(page: &mut [u8], n: usize, addr: DbAddress) {
    list::set(body_mut(page), n, addr);
}

#[inline]
fn slotted_body(page: &[u8]) -> &[u8] {
    &body(page)[SLOTTED_OFF..]
}

#[inline]
fn slotted_body_mut(page: &mut [u8]) -> &mut [u8] {
    &mut body_mut(page)[SLOTTED_OFF..]
}

pub fn set(
    ctx: &mut impl WriteCtx,
    addr: DbAddress,
    enc: &[u8],
    value: &[u8],
) -> Result<DbAddress> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_DATA)?;

    if let Some(n0) = key::first_stream_nibble(enc) {
        let ch = child(ctx.page(addr)?, n0 as usize);
        if !ch.is_null() {
            let sliced = key::slice_encoded(enc, 1)?;
            let new_child = tree_set(ctx, ch, &sliced, value)?;
            if new_child != ch {
                set_child(ctx.page_mut(addr)?, n0 as usize, new_child);
            }
            return Ok(addr);
        }
    }

    if slotted::try_set(slotted_body_mut(ctx.page_mut(addr)?), enc, value) {
        return Ok(addr);
    }

    // Переполнение: выносим самый тяжёлый нибл в нового ребёнка и повторяем.
    loop {
        let heaviest = heaviest_nibble(slotted_body(ctx.page(addr)?));
        match heaviest {
            Some(n) => {
                debug_assert!(child(ctx.page(addr)?, n as usize).is_null());
                let child_addr = split_nibble(ctx, addr, n)?;
                set_child(ctx.page_mut(addr)?, n as usize, child_addr);
            }
            None => {
                // Маршрутизируемых записей нет: вытесняем пустопоточные
                // в overflow-страницу. Обновляемый ключ остаётся на месте,
                // иначе его старая копия пережила бы удаление.
                spill_to_overflow(ctx, addr, enc)?;
            }
        }

        // Ключ мог уйти в только что созданного ребёнка.
        if let Some(n0) = key::first_stream_nibble(enc) {
            let ch = child(ctx.page(addr)?, n0 as usize);
            if !ch.is_null() {
                let sliced = key::slice_encoded(enc, 1)?;
                let new_child = tree_set(ctx, ch, &sliced, value)?;
                if new_child != ch {
                    set_child(ctx.page_mut(addr)?, n0 as usize, new_child);
                }
                return Ok(addr);
            }
        }
        if slotted::try_set(slotted_body_mut(ctx.page_mut(addr)?), enc, value) {
            return Ok(addr);
        }
        if heaviest.is_none() {
            // Даже пустая страница не вместила запись.
            return Err(anyhow!(
                "data page {}: value of {} bytes does not fit",
                addr.raw(),
                value.len()
            ));
        }
    }
}

/// Нибл с наибольшим суммарным размером записей (None — нечего выносить).
fn heaviest_nibble(sbody: &[u8]) -> Option<u8> {
    let mut weight = [0usize; BRANCH_FANOUT];
    for (k, v) in slotted::enumerate_all(sbody) {
        if let Some(n) = key::first_stream_nibble(k) {
            weight[n as usize] += k.len() + v.len() + 4;
        }
    }
    let (best, w) = weight
        .iter()
        .enumerate()
        .max_by_key(|(_, w)| **w)
        .expect("non-empty array");
    (*w > 0).then_some(best as u8)
}

/// Выносит записи нибла n в свежего ребёнка-DataPage (ключи срезаются на
/// один нибл). Возвращает адрес ребёнка.
fn split_nibble(ctx: &mut impl WriteCtx, addr: DbAddress, n: u8) -> Result<DbAddress> {
    let moved: Vec<(Vec<u8>, Vec<u8>)> = slotted::enumerate_nibble(slotted_body(ctx.page(addr)?), n)
        .map(|(k, v)| (k.to_vec(), v.to_vec()))
        .collect();
    debug_assert!(!moved.is_empty());

    let child_addr = ctx.get_new_page(PAGE_TYPE_DATA)?;
    init(ctx.page_mut(child_addr)?);
    debug!(
        "data page {}: split nibble {:x} -> page {} ({} entries)",
        addr.raw(),
        n,
        child_addr.raw(),
        moved.len()
    );

    for (k, v) in &moved {
        let sliced = key::slice_encoded(k, 1)?;
        tree_set(ctx, child_addr, &sliced, v)?;
    }
    let sbody = slotted_body_mut(ctx.page_mut(addr)?);
    for (k, _v) in &moved {
        slotted::delete(sbody, k);
    }
    slotted::compact(sbody);
    Ok(child_addr)
}

/// Переносит записи с пустым потоком в overflow-страницу; exclude (ключ,
/// который сейчас переписывается) остаётся в странице.
fn spill_to_overflow(ctx: &mut impl WriteCtx, addr: DbAddress, exclude: &[u8]) -> Result<()> {
    let ovf = {
        let existing = list::get(body(ctx.page(addr)?), OVERFLOW_SLOT);
        if existing.is_null() {
            let fresh = ctx.get_new_page(PAGE_TYPE_LEAF_OVERFLOW)?;
            super::overflow::init(ctx.page_mut(fresh)?);
            list::set(body_mut(ctx.page_mut(addr)?), OVERFLOW_SLOT, fresh);
            fresh
        } else {
            ctx.ensure_writable(existing)?
        }
    };
    list::set(body_mut(ctx.page_mut(addr)?), OVERFLOW_SLOT, ovf);

    let moved: Vec<(Vec<u8>, Vec<u8>)> = slotted::enumerate_all(slotted_body(ctx.page(addr)?))
        .filter(|(k, _)| *k != exclude)
        .map(|(k, v)| (k.to_vec(), v.to_vec()))
        .collect();
    for (k, v) in &moved {
        super::overflow::set(ctx, ovf, k, v)?;
    }
    let sbody = slotted_body_mut(ctx.page_mut(addr)?);
    for (k, _v) in &moved {
        slotted::delete(sbody, k);
    }
    slotted::compact(sbody);
    Ok(())
}

pub fn get<'c>(ctx: &'c impl ReadCtx, addr: DbAddress, enc: &[u8]) -> Result<Option<&'c [u8]>> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_DATA)?;
    if let Some(n0) = key::first_stream_nibble(enc) {
        let ch = child(ctx.page(addr)?, n0 as usize);
        if !ch.is_null() {
            let sliced = key::slice_encoded(enc, 1)?;
            return tree_get(ctx, ch, &sliced);
        }
    }
    let page = ctx.page(addr)?;
    if let Some(v) = slotted::get(slotted_body(page), enc) {
        return Ok(Some(v));
    }
    let ovf = list::get(body(page), OVERFLOW_SLOT);
    if !ovf.is_null() {
        return super::overflow::get(ctx, ovf, enc);
    }
    Ok(None)
}

pub fn delete(ctx: &mut impl WriteCtx, addr: DbAddress, enc: &[u8]) -> Result<(DbAddress, bool)> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_DATA)?;
    if let Some(n0) = key::first_stream_nibble(enc) {
        let ch = child(ctx.page(addr)?, n0 as usize);
        if !ch.is_null() {
            let sliced = key::slice_encoded(enc, 1)?;
            let (new_child, found) = tree_delete(ctx, ch, &sliced)?;
            if new_child != ch {
                set_child(ctx.page_mut(addr)?, n0 as usize, new_child);
            }
            return Ok((addr, found));
        }
    }
    if slotted::delete(slotted_body_mut(ctx.page_mut(addr)?), enc) {
        return Ok((addr, true));
    }
    let ovf = list::get(body(ctx.page(addr)?), OVERFLOW_SLOT);
    if !ovf.is_null() {
        let new_ovf = ctx.ensure_writable(ovf)?;
        if new_ovf != ovf {
            list::set(body_mut(ctx.page_mut(addr)?), OVERFLOW_SLOT, new_ovf);
        }
        let (_, found) = super::overflow::delete(ctx, new_ovf, enc)?;
        return Ok((addr, found));
    }
    Ok((addr, false))
}

pub fn delete_by_prefix(
    ctx: &mut impl WriteCtx,
    addr: DbAddress,
    prefix: &DecodedKey,
) -> Result<(DbAddress, usize)> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_DATA)?;
    let mut removed = 0usize;

    if prefix.stream_len() >= 1 {
        let n0 = prefix.stream_nibble(0);
        let ch = child(ctx.page(addr)?, n0 as usize);
        if !ch.is_null() {
            let sliced = prefix.slice_stream(1);
            let (new_child, n) = tree_delete_by_prefix(ctx, ch, &sliced)?;
            removed += n;
            if new_child != ch {
                set_child(ctx.page_mut(addr)?, n0 as usize, new_child);
            }
        }
        removed += scan_delete_local(ctx, addr, prefix)?;
        return Ok((addr, removed));
    }

    // Пустой префикс: вычищаем всё поддерево.
    removed += scan_delete_local(ctx, addr, prefix)?;
    for n in 0..BRANCH_FANOUT {
        let ch = child(ctx.page(addr)?, n);
        if ch.is_null() {
            continue;
        }
        let (new_child, cnt) = tree_delete_by_prefix(ctx, ch, prefix)?;
        removed += cnt;
        if new_child != ch {
            set_child(ctx.page_mut(addr)?, n, new_child);
        }
    }
    Ok((addr, removed))
}

fn scan_delete_local(
    ctx: &mut impl WriteCtx,
    addr: DbAddress,
    prefix: &DecodedKey,
) -> Result<usize> {
    let matching: Vec<Vec<u8>> = slotted::enumerate_all(slotted_body(ctx.page(addr)?))
        .filter(|(k, _)| key::matches_stream_prefix(k, prefix))
        .map(|(k, _)| k.to_vec())
        .collect();
    let mut removed = 0;
    {
        let sbody = slotted_body_mut(ctx.page_mut(addr)?);
        for k in &matching {
            if slotted::delete(sbody, k) {
                removed += 1;
            }
        }
    }
    let ovf = list::get(body(ctx.page(addr)?), OVERFLOW_SLOT);
    if !ovf.is_null() {
        let new_ovf = ctx.ensure_writable(ovf)?;
        if new_ovf != ovf {
            list::set(body_mut(ctx.page_mut(addr)?), OVERFLOW_SLOT, new_ovf);
        }
        let (_, n) = super::overflow::delete_by_prefix(ctx, new_ovf, prefix)?;
        removed += n;
    }
    Ok(removed)
}
