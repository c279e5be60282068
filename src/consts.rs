// Общие константы формата Paprika.

/// Размер страницы. Весь файл — целое число страниц.
pub const PAGE_SIZE: usize = 4096;

/// Заголовок любой не-корневой страницы:
/// [batch_id u32][page_type u8][version u8][reserved u16]
pub const PAGE_HEADER_SIZE: usize = 8;
pub const PAGE_BODY_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

pub const KECCAK_SIZE: usize = 32;
pub const NIBBLES_PER_KECCAK: usize = 64;
pub const BRANCH_FANOUT: usize = 16;

/// Версия формата. Единственное определённое значение; другое значение
/// в корневой странице — жёсткая ошибка открытия (VersionMismatch).
pub const PAPRIKA_VERSION: u8 = 1;

// Корневая страница (слоты кольца истории, page 0..H-1)
pub const ROOT_MAGIC: &[u8; 4] = b"PPRK";

// Типы страниц (PageHeader.page_type)
pub const PAGE_TYPE_ROOT: u8 = 1;
pub const PAGE_TYPE_DATA: u8 = 2;
pub const PAGE_TYPE_BOTTOM: u8 = 3;
pub const PAGE_TYPE_LEAF_OVERFLOW: u8 = 4;
pub const PAGE_TYPE_ABANDONED: u8 = 5;
pub const PAGE_TYPE_FANOUT: u8 = 6;

/// Минимальная глубина кольца истории корней.
pub const MIN_HISTORY_DEPTH: usize = 2;

/// Фан-аут состояния в корневой странице: первые два нибла пути аккаунта.
/// 1024 фиксированных адресов физически не помещаются в страницу 4 KiB
/// вместе с заголовком корня, поэтому корень потребляет два нибла.
pub const ROOT_FANOUT: usize = 256;
pub const ROOT_CONSUMED_NIBBLES: usize = 2;

/// Storage fan-out: три уровня по 256 записей, шесть ниблов хэша аккаунта.
/// 16 "вёдер" последнего уровня — нибловый фан-аут листового поддерева.
pub const FANOUT_ENTRIES: usize = 256;
pub const STORAGE_CONSUMED_NIBBLES: usize = 6;

/// Мемоизация keccak веток Меркла: глубина >= MIN и кратна EVERY.
pub const MEMOIZE_MIN_LEVEL: usize = 2;
pub const MEMOIZE_EVERY: usize = 2;
