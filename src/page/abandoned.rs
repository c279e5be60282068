//! AbandonedPage: LIFO-стек адресов, освобождённых батчем, со ссылкой на
//! следующую страницу цепочки. Голова цепочки хранится в корневой странице;
//! цепочка упорядочена по batch_id (новые в голове). batch_id страницы в её
//! заголовке и есть метка батча, освободившего адреса.
//!
//! Тело: [next 4][count u16][reserved 2][адреса по 4 байта].

use byteorder::{ByteOrder, LittleEndian};

use crate::addr::DbAddress;
use crate::consts::PAGE_BODY_SIZE;

use super::{body, body_mut};

const ENTRIES_OFF: usize = 8;

/// Максимум адресов на страницу.
pub const CAPACITY: usize = (PAGE_BODY_SIZE - ENTRIES_OFF) / 4;

pub fn next(page: &[u8]) -> DbAddress {
    DbAddress::read(&body(page)[0..4])
}

pub fn set_next(page: &mut [u8], addr: DbAddress) {
    addr.write(&mut body_mut(page)[0..4]);
}

pub fn count(page: &[u8]) -> usize {
    LittleEndian::read_u16(&body(page)[4..6]) as usize
}

fn set_count(page: &mut [u8], n: usize) {
    LittleEndian::write_u16(&mut body_mut(page)[4..6], n as u16);
}

pub fn is_empty(page: &[u8]) -> bool {
    count(page) == 0
}

pub fn try_push(page: &mut [u8], addr: DbAddress) -> bool {
    let n = count(page);
    if n == CAPACITY {
        return false;
    }
    addr.write(&mut body_mut(page)[ENTRIES_OFF + n * 4..ENTRIES_OFF + n * 4 + 4]);
    set_count(page, n + 1);
    true
}

pub fn try_pop(page: &mut [u8]) -> Option<DbAddress> {
    let n = count(page);
    if n == 0 {
        return None;
    }
    let addr = DbAddress::read(&body(page)[ENTRIES_OFF + (n - 1) * 4..ENTRIES_OFF + n * 4]);
    set_count(page, n - 1);
    Some(addr)
}

/// Все адреса страницы (для массового поглощения в пул переиспользования).
pub fn drain_all(page: &[u8]) -> Vec<DbAddress> {
    let n = count(page);
    (0..n)
        .map(|i| DbAddress::read(&body(page)[ENTRIES_OFF + i * 4..ENTRIES_OFF + i * 4 + 4]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{PAGE_SIZE, PAGE_TYPE_ABANDONED};
    use crate::page::init_page;

    #[test]
    fn push_pop_lifo() {
        let mut page = vec![0u8; PAGE_SIZE];
        init_page(&mut page, 7, PAGE_TYPE_ABANDONED);
        assert!(is_empty(&page));
        assert!(try_push(&mut page, DbAddress::new(10)));
        assert!(try_push(&mut page, DbAddress::new(11)));
        assert_eq!(count(&page), 2);
        assert_eq!(try_pop(&mut page), Some(DbAddress::new(11)));
        assert_eq!(try_pop(&mut page), Some(DbAddress::new(10)));
        assert_eq!(try_pop(&mut page), None);
    }

    #[test]
    fn capacity_is_respected() {
        let mut page = vec![0u8; PAGE_SIZE];
        init_page(&mut page, 1, PAGE_TYPE_ABANDONED);
        for i in 0..CAPACITY as u32 {
            assert!(try_push(&mut page, DbAddress::new(100 + i)));
        }
        assert!(!try_push(&mut page, DbAddress::new(1)));
        assert_eq!(drain_all(&page).len(), CAPACITY);
    }

    #[test]
    fn next_pointer_roundtrip() {
        let mut page = vec![0u8; PAGE_SIZE];
        init_page(&mut page, 1, PAGE_TYPE_ABANDONED);
        assert!(next(&page).is_null());
        set_next(&mut page, DbAddress::new(55));
        assert_eq!(next(&page), DbAddress::new(55));
    }
}
