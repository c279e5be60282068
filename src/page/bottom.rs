//! BottomPage: кайма дерева. Большая слотовая область и два ребёнка,
//! выбираемые старшим битом первого нибла (битовая маршрутизация нибла
//! не потребляет). При насыщении кластер собирается и перестраивается в
//! DataPage-поддерево.
//!
//! Тело: [child0 4][child1 4][slotted ...].

use anyhow::Result;
use log::debug;

use crate::addr::{list, DbAddress};
use crate::consts::{PAGE_TYPE_BOTTOM, PAGE_TYPE_DATA};
use crate::key::{self, DecodedKey};
use crate::slotted;

use super::{body, body_mut, expect_type, tree_delete, tree_delete_by_prefix, tree_get, tree_set,
    ReadCtx, WriteCtx};

const SLOTTED_OFF: usize = 2 * 4;

pub fn init(page: &mut [u8]) {
    slotted::init(&mut body_mut(page)[SLOTTED_OFF..]);
}

#[inline]
fn child(page: &[u8], half: usize) -> DbAddress {
    list::get(body(page), half)
}

#[inline]
fn set_child(page: &mut [u8], half: usize, addr: DbAddress) {
    list::set(body_mut(page), half, addr);
}

#[inline]
fn slotted_body(page: &[u8]) -> &[u8] {
    &body(page)[SLOTTED_OFF..]
}

#[inline]
fn slotted_body_mut(page: &mut [u8]) -> &mut [u8] {
    &mut body_mut(page)[SLOTTED_OFF..]
}

#[inline]
fn half_of(nibble: u8) -> usize {
    (nibble >> 3) as usize
}

pub fn set(
    ctx: &mut impl WriteCtx,
    addr: DbAddress,
    enc: &[u8],
    value: &[u8],
) -> Result<DbAddress> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_BOTTOM)?;

    if let Some(n0) = key::first_stream_nibble(enc) {
        let ch = child(ctx.page(addr)?, half_of(n0));
        if !ch.is_null() {
            let new_child = tree_set(ctx, ch, enc, value)?;
            if new_child != ch {
                set_child(ctx.page_mut(addr)?, half_of(n0), new_child);
            }
            return Ok(addr);
        }
    }

    if slotted::try_set(slotted_body_mut(ctx.page_mut(addr)?), enc, value) {
        return Ok(addr);
    }

    // Переполнение. Если записи делятся по старшему биту — битовый сплит,
    // иначе (однородная половина или дети уже есть) — промоушен в DataPage.
    let has_children =
        !child(ctx.page(addr)?, 0).is_null() || !child(ctx.page(addr)?, 1).is_null();
    if !has_children && halves_are_mixed(slotted_body(ctx.page(addr)?)) {
        split_halves(ctx, addr)?;
        if let Some(n0) = key::first_stream_nibble(enc) {
            let ch = child(ctx.page(addr)?, half_of(n0));
            if !ch.is_null() {
                let new_child = tree_set(ctx, ch, enc, value)?;
                if new_child != ch {
                    set_child(ctx.page_mut(addr)?, half_of(n0), new_child);
                }
                return Ok(addr);
            }
        }
        if slotted::try_set(slotted_body_mut(ctx.page_mut(addr)?), enc, value) {
            return Ok(addr);
        }
    }

    let promoted = promote(ctx, addr)?;
    tree_set(ctx, promoted, enc, value)
}

/// true, если в обеих половинах по старшему биту есть записи
/// (иначе сплит бесполезен).
fn halves_are_mixed(sbody: &[u8]) -> bool {
    let mut seen = [false; 2];
    for (k, _v) in slotted::enumerate_all(sbody) {
        if let Some(n) = key::first_stream_nibble(k) {
            seen[half_of(n)] = true;
        }
    }
    seen[0] && seen[1]
}

fn split_halves(ctx: &mut impl WriteCtx, addr: DbAddress) -> Result<()> {
    let left = ctx.get_new_page(PAGE_TYPE_BOTTOM)?;
    init(ctx.page_mut(left)?);
    let right = ctx.get_new_page(PAGE_TYPE_BOTTOM)?;
    init(ctx.page_mut(right)?);
    debug!(
        "bottom page {}: bit split -> {} / {}",
        addr.raw(),
        left.raw(),
        right.raw()
    );

    // Массовый слив обеих половин разом; ключи не срезаются (бит не нибл).
    // Страницы региона нельзя держать двумя &mut одновременно, поэтому
    // работаем на временных копиях тел и записываем их назад.
    let mut src_body = slotted_body(ctx.page(addr)?).to_vec();
    let mut left_body = slotted_body(ctx.page(left)?).to_vec();
    let mut right_body = slotted_body(ctx.page(right)?).to_vec();
    {
        let mut dests: [&mut [u8]; 2] = [&mut left_body, &mut right_body];
        slotted::move_non_empty_keys_to(
            &mut src_body,
            &mut dests,
            |k| key::first_stream_nibble(k).map(|n| half_of(n)),
            true,
        )?;
    }
    slotted_body_mut(ctx.page_mut(addr)?).copy_from_slice(&src_body);
    slotted_body_mut(ctx.page_mut(left)?).copy_from_slice(&left_body);
    slotted_body_mut(ctx.page_mut(right)?).copy_from_slice(&right_body);

    set_child(ctx.page_mut(addr)?, 0, left);
    set_child(ctx.page_mut(addr)?, 1, right);
    Ok(())
}

/// Собирает кластер (страница + дети) и перестраивает его как
/// DataPage-поддерево по тому же адресу позиции. Старые страницы уходят в
/// отложенное переиспользование; тип страницы за её жизнь не меняется.
fn promote(ctx: &mut impl WriteCtx, addr: DbAddress) -> Result<DbAddress> {
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut doomed: Vec<DbAddress> = Vec::new();

    collect_cluster(ctx, addr, &mut entries, &mut doomed)?;

    let data_addr = ctx.get_new_page(PAGE_TYPE_DATA)?;
    super::data::init(ctx.page_mut(data_addr)?);
    debug!(
        "bottom page {}: promote cluster of {} entries -> data page {}",
        addr.raw(),
        entries.len(),
        data_addr.raw()
    );
    for (k, v) in &entries {
        tree_set(ctx, data_addr, k, v)?;
    }
    for d in doomed {
        ctx.register_for_future_reuse(d)?;
    }
    Ok(data_addr)
}

fn collect_cluster(
    ctx: &mut impl WriteCtx,
    addr: DbAddress,
    entries: &mut Vec<(Vec<u8>, Vec<u8>)>,
    doomed: &mut Vec<DbAddress>,
) -> Result<()> {
    let page = ctx.page(addr)?;
    expect_type(page, addr, PAGE_TYPE_BOTTOM)?;
    for (k, v) in slotted::enumerate_all(slotted_body(page)) {
        entries.push((k.to_vec(), v.to_vec()));
    }
    let c0 = child(page, 0);
    let c1 = child(page, 1);
    doomed.push(addr);
    for ch in [c0, c1] {
        if !ch.is_null() {
            collect_cluster(ctx, ch, entries, doomed)?;
        }
    }
    Ok(())
}

pub fn get<'c>(ctx: &'c impl ReadCtx, addr: DbAddress, enc: &[u8]) -> Result<Option<&'c [u8]>> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_BOTTOM)?;
    if let Some(n0) = key::first_stream_nibble(enc) {
        let ch = child(ctx.page(addr)?, half_of(n0));
        if !ch.is_null() {
            return tree_get(ctx, ch, enc);
        }
    }
    Ok(slotted::get(slotted_body(ctx.page(addr)?), enc))
}

pub fn delete(ctx: &mut impl WriteCtx, addr: DbAddress, enc: &[u8]) -> Result<(DbAddress, bool)> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_BOTTOM)?;
    if let Some(n0) = key::first_stream_nibble(enc) {
        let ch = child(ctx.page(addr)?, half_of(n0));
        if !ch.is_null() {
            let (new_child, found) = tree_delete(ctx, ch, enc)?;
            if new_child != ch {
                set_child(ctx.page_mut(addr)?, half_of(n0), new_child);
            }
            return Ok((addr, found));
        }
    }
    let found = slotted::delete(slotted_body_mut(ctx.page_mut(addr)?), enc);
    Ok((addr, found))
}

pub fn delete_by_prefix(
    ctx: &mut impl WriteCtx,
    addr: DbAddress,
    prefix: &DecodedKey,
) -> Result<(DbAddress, usize)> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_BOTTOM)?;
    let mut removed = 0usize;

    let halves: Vec<usize> = if prefix.stream_len() >= 1 {
        vec![half_of(prefix.stream_nibble(0))]
    } else {
        vec![0, 1]
    };
    for half in halves {
        let ch = child(ctx.page(addr)?, half);
        if ch.is_null() {
            continue;
        }
        let (new_child, n) = tree_delete_by_prefix(ctx, ch, prefix)?;
        removed += n;
        if new_child != ch {
            set_child(ctx.page_mut(addr)?, half, new_child);
        }
    }

    let matching: Vec<Vec<u8>> = slotted::enumerate_all(slotted_body(ctx.page(addr)?))
        .filter(|(k, _)| key::matches_stream_prefix(k, prefix))
        .map(|(k, _)| k.to_vec())
        .collect();
    let sbody = slotted_body_mut(ctx.page_mut(addr)?);
    for k in &matching {
        if slotted::delete(sbody, k) {
            removed += 1;
        }
    }
    Ok((addr, removed))
}
