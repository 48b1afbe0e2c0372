//! Plot file header layout.
//!
//! The header is written once to the plot file's single stream and its
//! 80-byte table-pointer region is patched by the orchestrator after the
//! final tables land:
//!
//! ```text
//! +---------------------+
//! | magic               |  19 bytes, no NUL
//! +---------------------+
//! | plot id             |  32 bytes
//! +---------------------+
//! | k                   |  1 byte
//! +---------------------+
//! | fmt_desc_len (BE)   |  2 bytes
//! | fmt_desc            |  no NUL
//! +---------------------+
//! | memo_len (BE)       |  2 bytes
//! | memo                |
//! +---------------------+
//! | table pointers      |  80 bytes, zeroed
//! +---------------------+
//! ```

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::{Error, Result};

pub const K_POS_MAGIC: &str = "Proof of Space Plot";
pub const K_FORMAT_DESCRIPTION: &str = "v1.0";
pub const K: u8 = 32;
pub const PLOT_ID_SIZE: usize = 32;
pub const TABLE_POINTERS_SIZE: usize = 80;

/// Total header size for a memo of `memo_len` bytes.
pub fn header_size(memo_len: usize) -> usize {
    K_POS_MAGIC.len()
        + PLOT_ID_SIZE
        + 1
        + 2
        + K_FORMAT_DESCRIPTION.len()
        + 2
        + memo_len
        + TABLE_POINTERS_SIZE
}

/// Encodes the header, returning the bytes and the offset of the
/// table-pointer region for later patching.
pub fn encode_header(plot_id: &[u8; PLOT_ID_SIZE], memo: &[u8]) -> Result<(Vec<u8>, u64)> {
    if memo.len() > u16::MAX as usize {
        return Err(Error::InvalidInput(format!(
            "plot memo of {} bytes does not fit a 16-bit length",
            memo.len()
        )));
    }

    let mut header = Vec::with_capacity(header_size(memo.len()));

    header.extend_from_slice(K_POS_MAGIC.as_bytes());
    header.extend_from_slice(plot_id);
    header.push(K);

    header
        .write_u16::<BigEndian>(K_FORMAT_DESCRIPTION.len() as u16)
        .expect("vec write is infallible");
    header.extend_from_slice(K_FORMAT_DESCRIPTION.as_bytes());

    header
        .write_u16::<BigEndian>(memo.len() as u16)
        .expect("vec write is infallible");
    header.extend_from_slice(memo);

    let table_pointers_offset = header.len() as u64;
    header.resize(header.len() + TABLE_POINTERS_SIZE, 0);

    debug_assert_eq!(header.len(), header_size(memo.len()));
    Ok((header, table_pointers_offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_byte_exact() {
        let plot_id: [u8; 32] = std::array::from_fn(|i| i as u8);
        let memo = [0xAA, 0xBB];

        let (header, tables_offset) = encode_header(&plot_id, &memo).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(b"Proof of Space Plot");
        expected.extend_from_slice(&plot_id);
        expected.push(32);
        expected.extend_from_slice(&[0, 4]);
        expected.extend_from_slice(b"v1.0");
        expected.extend_from_slice(&[0, 2]);
        expected.extend_from_slice(&[0xAA, 0xBB]);
        expected.extend_from_slice(&[0u8; 80]);

        assert_eq!(header, expected);
        assert_eq!(header.len(), header_size(2));
        assert_eq!(tables_offset as usize, header.len() - 80);
    }

    #[test]
    fn test_empty_memo() {
        let (header, _) = encode_header(&[0u8; 32], &[]).unwrap();
        assert_eq!(header.len(), header_size(0));
    }

    #[test]
    fn test_oversized_memo_rejected() {
        let memo = vec![0u8; u16::MAX as usize + 1];
        assert!(encode_header(&[0u8; 32], &memo).is_err());
    }
}
