//! Кодеки значений: аккаунт и ячейка storage.
//!
//! Аккаунт пакуется плотно: [b0][b1][balance BE][nonce BE][code_hash]?[storage_root]?
//! где b0 = длина balance (младшие 5 бит) | флаг контракта (бит 7),
//! b1 = длина nonce. EOA (пустой код и пустое дерево) не хранит хэшей вовсе.

use anyhow::{anyhow, Result};

use crate::rlp;
use crate::util::{EMPTY_CODE_HASH, EMPTY_TRIE_ROOT};

const CONTRACT_FLAG: u8 = 0x80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Account {
    pub balance: u128,
    pub nonce: u64,
    pub code_hash: [u8; 32],
    pub storage_root: [u8; 32],
}

impl Account {
    /// Худший случай: 2 байта заголовка + balance + nonce + два хэша.
    pub const MAX_BYTE_COUNT: usize = 2 + 16 + 8 + 64;

    pub fn new_eoa(balance: u128, nonce: u64) -> Self {
        Self {
            balance,
            nonce,
            code_hash: EMPTY_CODE_HASH,
            storage_root: EMPTY_TRIE_ROOT,
        }
    }

    pub fn is_eoa(&self) -> bool {
        self.code_hash == EMPTY_CODE_HASH && self.storage_root == EMPTY_TRIE_ROOT
    }

    /// Копия с новым storage root (хвост перекодируется при записи).
    pub fn with_changed_storage_root(mut self, root: [u8; 32]) -> Self {
        self.storage_root = root;
        self
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        let bal = self.balance.to_be_bytes();
        let bal_first = bal.iter().position(|b| *b != 0).unwrap_or(16);
        let bal_len = 16 - bal_first;
        let non = self.nonce.to_be_bytes();
        let non_first = non.iter().position(|b| *b != 0).unwrap_or(8);
        let non_len = 8 - non_first;

        let contract = !self.is_eoa();
        let mut b0 = bal_len as u8;
        if contract {
            b0 |= CONTRACT_FLAG;
        }
        out.push(b0);
        out.push(non_len as u8);
        out.extend_from_slice(&bal[bal_first..]);
        out.extend_from_slice(&non[non_first..]);
        if contract {
            out.extend_from_slice(&self.code_hash);
            out.extend_from_slice(&self.storage_root);
        }
    }

    pub fn read_from(data: &[u8]) -> Result<Account> {
        if data.len() < 2 {
            return Err(anyhow!("account: too short ({} bytes)", data.len()));
        }
        let contract = data[0] & CONTRACT_FLAG != 0;
        let bal_len = (data[0] & 0x1F) as usize;
        let non_len = data[1] as usize;
        if bal_len > 16 || non_len > 8 {
            return Err(anyhow!(
                "account: bad field lengths (balance {}, nonce {})",
                bal_len,
                non_len
            ));
        }
        let tail = if contract { 64 } else { 0 };
        if data.len() != 2 + bal_len + non_len + tail {
            return Err(anyhow!("account: length mismatch ({} bytes)", data.len()));
        }

        let mut bal = [0u8; 16];
        bal[16 - bal_len..].copy_from_slice(&data[2..2 + bal_len]);
        let mut non = [0u8; 8];
        non[8 - non_len..].copy_from_slice(&data[2 + bal_len..2 + bal_len + non_len]);

        let mut code_hash = EMPTY_CODE_HASH;
        let mut storage_root = EMPTY_TRIE_ROOT;
        if contract {
            let off = 2 + bal_len + non_len;
            code_hash.copy_from_slice(&data[off..off + 32]);
            storage_root.copy_from_slice(&data[off + 32..off + 64]);
        }

        Ok(Account {
            balance: u128::from_be_bytes(bal),
            nonce: u64::from_be_bytes(non),
            code_hash,
            storage_root,
        })
    }

    /// RLP аккаунта для листа дерева состояния:
    /// [nonce, balance, storage_root, code_hash].
    pub fn rlp_encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(Self::MAX_BYTE_COUNT + 8);
        rlp::encode_u64(self.nonce, &mut body);
        rlp::encode_u128(self.balance, &mut body);
        rlp::encode_bytes(&self.storage_root, &mut body);
        rlp::encode_bytes(&self.code_hash, &mut body);
        rlp::encode_list(&body, out);
    }
}

/// Каноническая форма значения storage-ячейки: big-endian без ведущих нулей,
/// ноль — единственный нулевой байт. Длину хранит слотовая запись.
pub fn storage_trim(value: &[u8]) -> &[u8] {
    let first = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    if first == value.len() {
        &value[value.len().saturating_sub(1)..]
    } else {
        &value[first..]
    }
}

/// true, если значение — ноль (удаление ячейки).
pub fn storage_is_zero(value: &[u8]) -> bool {
    value.iter().all(|b| *b == 0)
}
