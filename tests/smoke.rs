use anyhow::Result;
use std::path::PathBuf;

use paprika::db::CommitOptions;
use paprika::key::Key;
use paprika::nibble::NibblePath;
use paprika::util::keccak256;
use paprika::{Account, PagedDb};

const MB: usize = 1024 * 1024;

#[test]
fn smoke_account_roundtrip() -> Result<()> {
    let db = PagedDb::native_memory(4 * MB, 2)?;

    let hash = keccak256(b"a");
    let account = Account::new_eoa(1, 1);
    let mut packed = Vec::new();
    account.write_to(&mut packed);

    // 1) писатель
    {
        let mut batch = db.begin_next_batch()?;
        batch.set_account(&hash, &packed)?;
        batch.commit(CommitOptions::FlushDataAndRoot)?;
    }

    // 2) читатель видит ровно то, что записано
    {
        let read = db.begin_read_only_batch()?;
        let got = read
            .try_get(&Key::account(NibblePath::from_keccak(&hash)))?
            .expect("account must exist");
        assert_eq!(got, packed);
        assert_eq!(Account::read_from(&got)?, account);
    }
    Ok(())
}

#[test]
fn smoke_storage_overwrite_within_batch() -> Result<()> {
    let db = PagedDb::native_memory(4 * MB, 2)?;
    let acct = keccak256(b"acct");
    let slot = keccak256(b"slot");

    {
        let mut batch = db.begin_next_batch()?;
        let mut packed = Vec::new();
        Account::new_eoa(5, 0).write_to(&mut packed);
        batch.set_account(&acct, &packed)?;
        batch.set_storage(&acct, &slot, &[0x2A])?;
        batch.set_storage(&acct, &slot, &[0x2B])?;
        batch.commit(CommitOptions::FlushDataAndRoot)?;
    }

    let read = db.begin_read_only_batch()?;
    let key = Key::storage_cell(
        NibblePath::from_keccak(&acct),
        NibblePath::from_keccak(&slot),
    );
    assert_eq!(read.try_get(&key)?, Some(vec![0x2B]));
    Ok(())
}

#[test]
fn smoke_delete_account_makes_it_absent() -> Result<()> {
    let db = PagedDb::native_memory(4 * MB, 2)?;
    let hash = keccak256(b"gone");
    let mut packed = Vec::new();
    Account::new_eoa(9, 9).write_to(&mut packed);

    {
        let mut batch = db.begin_next_batch()?;
        batch.set_account(&hash, &packed)?;
        batch.commit(CommitOptions::FlushDataAndRoot)?;
    }
    {
        let mut batch = db.begin_next_batch()?;
        batch.set_account(&hash, &[])?;
        batch.commit(CommitOptions::FlushDataAndRoot)?;
    }

    let read = db.begin_read_only_batch()?;
    assert_eq!(
        read.try_get(&Key::account(NibblePath::from_keccak(&hash)))?,
        None
    );
    Ok(())
}

#[test]
fn smoke_file_backed_reopen() -> Result<()> {
    let root = unique_root("smoke-file");
    std::fs::create_dir_all(&root)?;
    let path = root.join("paprika.db");

    let hash = keccak256(b"persist");
    let mut packed = Vec::new();
    Account::new_eoa(777, 3).write_to(&mut packed);

    let committed_root = {
        let db = PagedDb::open(&path, 4 * MB, 2)?;
        let mut batch = db.begin_next_batch()?;
        batch.set_account(&hash, &packed)?;
        batch.commit(CommitOptions::FlushDataAndRoot)?
    };

    // Переоткрытие видит последний корень.
    {
        let db = PagedDb::open(&path, 4 * MB, 2)?;
        let read = db.begin_read_only_batch()?;
        assert_eq!(
            read.try_get(&Key::account(NibblePath::from_keccak(&hash)))?,
            Some(packed.clone())
        );
        assert_ne!(committed_root, [0u8; 32]);
    }
    Ok(())
}

#[test]
fn zero_storage_value_is_deletion() -> Result<()> {
    let db = PagedDb::native_memory(4 * MB, 2)?;
    let acct = keccak256(b"z");
    let slot = keccak256(b"s");
    {
        let mut batch = db.begin_next_batch()?;
        let mut packed = Vec::new();
        Account::new_eoa(1, 0).write_to(&mut packed);
        batch.set_account(&acct, &packed)?;
        batch.set_storage(&acct, &slot, &[0x01])?;
        batch.set_storage(&acct, &slot, &[0x00])?;
        batch.commit(CommitOptions::FlushDataAndRoot)?;
    }
    let read = db.begin_read_only_batch()?;
    let key = Key::storage_cell(
        NibblePath::from_keccak(&acct),
        NibblePath::from_keccak(&slot),
    );
    assert_eq!(read.try_get(&key)?, None);
    Ok(())
}

#[test]
fn flush_data_only_commit_is_visible_in_memory() -> Result<()> {
    let db = PagedDb::native_memory(4 * MB, 2)?;
    let hash = keccak256(b"soft");
    let mut packed = Vec::new();
    Account::new_eoa(2, 2).write_to(&mut packed);

    {
        let mut batch = db.begin_next_batch()?;
        batch.set_account(&hash, &packed)?;
        batch.commit(CommitOptions::FlushDataOnly)?;
    }
    let read = db.begin_read_only_batch()?;
    assert_eq!(
        read.try_get(&Key::account(NibblePath::from_keccak(&hash)))?,
        Some(packed)
    );
    Ok(())
}

#[test]
fn out_of_space_is_a_typed_error() -> Result<()> {
    // Крошечный бэкенд: кольцо из двух корней и горстка страниц данных.
    let db = PagedDb::native_memory(8 * 4096, 2)?;
    let mut batch = db.begin_next_batch()?;
    let mut failed = None;
    for i in 0..64u64 {
        let mut packed = Vec::new();
        Account::new_eoa(i as u128, i).write_to(&mut packed);
        if let Err(e) = batch.set_account(&keccak256(&i.to_le_bytes()), &packed) {
            failed = Some(e);
            break;
        }
    }
    let err = failed.expect("tiny backing must run out of pages");
    assert_eq!(
        err.downcast_ref::<paprika::Error>(),
        Some(&paprika::Error::OutOfSpace)
    );
    Ok(())
}

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("paprika-{}-{}-{}", prefix, pid, t))
}
