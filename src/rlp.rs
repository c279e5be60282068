//! Минимальные примитивы RLP-кодирования, ровно те, что нужны узлам Меркла:
//! байтовые строки, готовые конкатенации как списки, числа без ведущих нулей.
//!
//! Правила:
//! - одиночный байт < 0x80 кодируется сам собой;
//! - строка до 55 байт: [0x80 + len] ++ payload;
//! - длиннее: [0xB7 + len(len)] ++ len BE ++ payload;
//! - список: те же пороги от 0xC0 / 0xF7 поверх уже сконкатенированных
//!   кодировок элементов.

fn encode_length(len: usize, offset: u8, out: &mut Vec<u8>) {
    if len < 56 {
        out.push(offset + len as u8);
    } else {
        let be = (len as u64).to_be_bytes();
        let first = be.iter().position(|b| *b != 0).unwrap_or(7);
        out.push(offset + 55 + (8 - first) as u8);
        out.extend_from_slice(&be[first..]);
    }
}

/// Кодирует байтовую строку.
pub fn encode_bytes(payload: &[u8], out: &mut Vec<u8>) {
    if payload.len() == 1 && payload[0] < 0x80 {
        out.push(payload[0]);
    } else {
        encode_length(payload.len(), 0x80, out);
        out.extend_from_slice(payload);
    }
}

/// Оборачивает уже сконкатенированные кодировки элементов в список.
pub fn encode_list(joined: &[u8], out: &mut Vec<u8>) {
    encode_length(joined.len(), 0xC0, out);
    out.extend_from_slice(joined);
}

/// Число как big-endian строка без ведущих нулей (0 -> пустая строка).
pub fn encode_u64(v: u64, out: &mut Vec<u8>) {
    let be = v.to_be_bytes();
    let first = be.iter().position(|b| *b != 0).unwrap_or(8);
    encode_bytes(&be[first..], out);
}

pub fn encode_u128(v: u128, out: &mut Vec<u8>) {
    let be = v.to_be_bytes();
    let first = be.iter().position(|b| *b != 0).unwrap_or(16);
    encode_bytes(&be[first..], out);
}
