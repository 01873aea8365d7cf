//! Frame layout:
//!
//! ```text
//! +-----+------+-----------+-----+-----+
//! | STX | code | data[0..] | ETX | sum |
//! +-----+------+-----------+-----+-----+
//! ```
//!
//! `sum` is the 8-bit sum of everything from `code` through `ETX`. There is
//! no length field and the data is not escaped, so an ETX value inside the
//! data is only told apart from the real ETX by the sum that follows it.

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Sum of every byte but the first (the STX), truncated to 8 bits.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .skip(1)
        .fold(0, |acc, b| acc.wrapping_add(*b))
}

/// Enclose `payload` (the code followed by any data) into a complete frame.
pub fn pack(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(STX);
    out.extend_from_slice(payload);
    out.push(ETX);
    out.push(checksum(&out));
    out
}

/// Look for a complete frame at the start of `buf`.
///
/// Returns the index of the checksum byte of the first frame found. Every
/// ETX value is tried in order and the first one followed by a matching sum
/// wins, even if a later ETX would also validate.
pub fn find_message(buf: &[u8]) -> Option<usize> {
    if buf.first() != Some(&STX) {
        return None;
    }
    let mut sum = 0u8;
    for (idx, &byte) in buf.iter().enumerate().skip(1) {
        sum = sum.wrapping_add(byte);
        if byte == ETX && buf.get(idx + 1) == Some(&sum) {
            return Some(idx + 1);
        }
    }
    None
}
