//! Типизированные классы ошибок. Остальная обвязка — anyhow с контекстом;
//! эти значения кладутся внутрь anyhow::Error и достаются downcast'ом там,
//! где вызывающему коду важен конкретный класс.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Аллокация вышла за пределы бэкенда. Батч остаётся валидным,
    /// но его следует бросить без коммита.
    #[error("out of space: allocation beyond backing size")]
    OutOfSpace,

    /// Байт версии корневой страницы не совпал при открытии.
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },

    /// В кольце корней нет корня с запрошенным state hash.
    #[error("state not found in the root ring")]
    StateNotFound,

    /// Страница по адресу имеет не тот тип в заголовке. Фатально для батча.
    #[error("page type mismatch at page {addr}: expected {expected}, found {found}")]
    PageTypeMismatch { addr: u32, expected: u8, found: u8 },

    /// Нарушение структурных инвариантов (например, пустой Merkle-узел там,
    /// где он обязан быть). Фатально: батч отбрасывается.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
}
