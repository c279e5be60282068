//! Изоляция голов MultiHeadChain и FIFO-финализация.

use anyhow::Result;

use paprika::key::Key;
use paprika::nibble::NibblePath;
use paprika::util::keccak256;
use paprika::{open_multi_head_chain, Account, PagedDb};

const MB: usize = 1024 * 1024;

fn packed(a: &Account) -> Vec<u8> {
    let mut out = Vec::new();
    a.write_to(&mut out);
    out
}

#[test]
fn two_heads_are_isolated_until_finalization() -> Result<()> {
    let db = PagedDb::native_memory(16 * MB, 2)?;
    let genesis = db.begin_read_only_batch()?.metadata().1;
    let chain = open_multi_head_chain(db.clone());

    let acct_a = keccak256(b"head-a-account");
    let acct_b = keccak256(b"head-b-account");
    let hash_a = [0xAA; 32];
    let hash_b = [0xBB; 32];

    let mut head_a = chain.begin(&genesis)?;
    let mut head_b = chain.begin(&genesis)?;

    head_a.set_account(&acct_a, &packed(&Account::new_eoa(1, 1)));
    head_b.set_account(&acct_b, &packed(&Account::new_eoa(2, 2)));

    head_a.commit(1, hash_a)?;
    head_b.commit(1, hash_b)?;

    let key_a = Key::account(NibblePath::from_keccak(&acct_a));
    let key_b = Key::account(NibblePath::from_keccak(&acct_b));

    // Каждый видит только свои записи.
    let reader_a = chain.try_lease_reader(&hash_a).expect("proposed a");
    let reader_b = chain.try_lease_reader(&hash_b).expect("proposed b");
    assert!(reader_a.try_get(&key_a)?.is_some());
    assert_eq!(reader_a.try_get(&key_b)?, None);
    assert!(reader_b.try_get(&key_b)?.is_some());
    assert_eq!(reader_b.try_get(&key_a)?, None);

    // Финализуем первую ветку.
    chain.finalize(hash_a).wait()?;
    assert!(db.has_state(&hash_a));

    // Вторая всё ещё видна только через свой ридер.
    let reader_b2 = chain.try_lease_reader(&hash_b).expect("still proposed");
    assert!(reader_b2.try_get(&key_b)?.is_some());
    let finalized = chain.lease_latest_finalized()?;
    assert_eq!(finalized.try_get(&key_b)?, None);
    assert!(finalized.try_get(&key_a)?.is_some());
    Ok(())
}

#[test]
fn head_reads_fall_through_parent_chain() -> Result<()> {
    let db = PagedDb::native_memory(16 * MB, 2)?;
    let genesis = db.begin_read_only_batch()?.metadata().1;
    let chain = open_multi_head_chain(db);

    let acct = keccak256(b"layered");
    let slot = keccak256(b"slot");
    let h1 = [0x01; 32];
    let h2 = [0x02; 32];

    let mut head = chain.begin(&genesis)?;
    head.set_account(&acct, &packed(&Account::new_eoa(1, 0)));
    head.set_storage(&acct, &slot, &[0x2A]);
    head.commit(1, h1)?;

    // Голова перевесилась на h1; оверлей пуст, чтение падает в предка.
    let key_cell = Key::storage_cell(
        NibblePath::from_keccak(&acct),
        NibblePath::from_keccak(&slot),
    );
    assert_eq!(head.try_get(&key_cell)?, Some(vec![0x2A]));

    // Новая запись поверх видна немедленно, предковая — из буфера.
    head.set_storage(&acct, &slot, &[0x2B]);
    assert_eq!(head.try_get(&key_cell)?, Some(vec![0x2B]));
    head.commit(2, h2)?;

    let r2 = chain.try_lease_reader(&h2).expect("h2 proposed");
    assert_eq!(r2.try_get(&key_cell)?, Some(vec![0x2B]));
    let r1 = chain.try_lease_reader(&h1).expect("h1 proposed");
    assert_eq!(r1.try_get(&key_cell)?, Some(vec![0x2A]));
    Ok(())
}

#[test]
fn finalize_chain_of_two_blocks_is_fifo() -> Result<()> {
    let db = PagedDb::native_memory(16 * MB, 2)?;
    let genesis = db.begin_read_only_batch()?.metadata().1;
    let chain = open_multi_head_chain(db.clone());

    let acct = keccak256(b"fifo");
    let h1 = [0x31; 32];
    let h2 = [0x32; 32];

    let mut head = chain.begin(&genesis)?;
    head.set_account(&acct, &packed(&Account::new_eoa(1, 1)));
    head.commit(1, h1)?;
    head.set_account(&acct, &packed(&Account::new_eoa(2, 2)));
    head.commit(2, h2)?;

    // Финализация второго блока протаскивает первый (FIFO).
    chain.finalize(h2).wait()?;
    assert!(db.has_state(&h2));

    let read = db.begin_read_only_batch()?;
    let got = read
        .try_get(&Key::account(NibblePath::from_keccak(&acct)))?
        .expect("account");
    assert_eq!(Account::read_from(&got)?.nonce, 2);
    assert_eq!(read.metadata(), (2, h2));

    // Ридер уже финализованного состояния идёт через кольцо корней.
    let r1 = chain.try_lease_reader(&h1).expect("ring still holds h1");
    assert_eq!(
        Account::read_from(&r1.try_get(&Key::account(NibblePath::from_keccak(&acct)))?.unwrap())?
            .nonce,
        1
    );
    Ok(())
}

#[test]
fn reader_keeps_proposed_batch_alive_after_finalization() -> Result<()> {
    let db = PagedDb::native_memory(16 * MB, 2)?;
    let genesis = db.begin_read_only_batch()?.metadata().1;
    let chain = open_multi_head_chain(db);

    let acct = keccak256(b"alive");
    let h1 = [0x77; 32];

    let mut head = chain.begin(&genesis)?;
    head.set_account(&acct, &packed(&Account::new_eoa(5, 5)));
    head.commit(1, h1)?;

    let reader = chain.try_lease_reader(&h1).expect("proposed");
    chain.finalize(h1).wait()?;

    // Оверлей уже убран из буфера, но Arc ридера держит его данные.
    assert!(reader
        .try_get(&Key::account(NibblePath::from_keccak(&acct)))?
        .is_some());
    Ok(())
}
