//! LeafOverflowPage: чистая слотовая карта без детей; принимает записи,
//! вытесненные из DataPage.

use anyhow::{anyhow, Result};

use crate::addr::DbAddress;
use crate::consts::PAGE_TYPE_LEAF_OVERFLOW;
use crate::key::{self, DecodedKey};
use crate::slotted;

use super::{body, body_mut, expect_type, ReadCtx, WriteCtx};

pub fn init(page: &mut [u8]) {
    slotted::init(body_mut(page));
}

pub fn set(
    ctx: &mut impl WriteCtx,
    addr: DbAddress,
    enc: &[u8],
    value: &[u8],
) -> Result<DbAddress> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_LEAF_OVERFLOW)?;
    if !slotted::try_set(body_mut(ctx.page_mut(addr)?), enc, value) {
        return Err(anyhow!("leaf overflow page {} is full", addr.raw()));
    }
    Ok(addr)
}

pub fn get<'c>(ctx: &'c impl ReadCtx, addr: DbAddress, enc: &[u8]) -> Result<Option<&'c [u8]>> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_LEAF_OVERFLOW)?;
    Ok(slotted::get(body(ctx.page(addr)?), enc))
}

pub fn delete(ctx: &mut impl WriteCtx, addr: DbAddress, enc: &[u8]) -> Result<(DbAddress, bool)> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_LEAF_OVERFLOW)?;
    let found = slotted::delete(body_mut(ctx.page_mut(addr)?), enc);
    Ok((addr, found))
}

pub fn delete_by_prefix(
    ctx: &mut impl WriteCtx,
    addr: DbAddress,
    prefix: &DecodedKey,
) -> Result<(DbAddress, usize)> {
    expect_type(ctx.page(addr)?, addr, PAGE_TYPE_LEAF_OVERFLOW)?;
    let matching: Vec<Vec<u8>> = slotted::enumerate_all(body(ctx.page(addr)?))
        .filter(|(k, _)| key::matches_stream_prefix(k, prefix))
        .map(|(k, _)| k.to_vec())
        .collect();
    let sbody = body_mut(ctx.page_mut(addr)?);
    let mut removed = 0;
    for k in &matching {
        if slotted::delete(sbody, k) {
            removed += 1;
        }
    }
    Ok((addr, removed))
}
