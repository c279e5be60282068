//! Paprika — персистентное copy-on-write страничное хранилище для
//! Ethereum-подобного аутентифицированного дерева состояния.
//!
//! Три кита:
//! - страничный COW-store с кольцом версионированных корней и отложенным
//!   переиспользованием брошенных страниц (db, pager, page);
//! - внутристраничная карта ключ/значение SlottedArray (slotted);
//! - Merkle-подсистема: перестройка узлов на коммите и Keccak-корень с
//!   мемоизацией (merkle).

// Базовые модули
pub mod consts;
pub mod error;
pub mod util;

// Примитивы данных
pub mod account;
pub mod addr;
pub mod bits;
pub mod key;
pub mod nibble;
pub mod rlp;

// Хранилище
pub mod db; // src/db/{mod,batch,read}.rs
pub mod page; // src/page/{mod,data,bottom,overflow,abandoned,fanout,root}.rs
pub mod pager; // src/pager/mod.rs
pub mod slotted; // src/slotted/{mod,ops,iter}.rs

// Merkle
pub mod merkle; // src/merkle/{mod,node,dirty,compute}.rs

// Конкурентный фасад
pub mod chain; // src/chain/mod.rs

// Удобные реэкспорты
pub use account::Account;
pub use chain::{open_multi_head_chain, MultiHeadChain};
pub use db::{Batch, CommitOptions, PagedDb, ReadOnlyBatch};
pub use error::Error;
pub use key::{Key, KeyType};
pub use merkle::{ChangeSet, ComputeFlags};
pub use nibble::NibblePath;
