// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bit-packed big-endian integer fields of the on-disk format.
//!
//! Sequence numbers, file offsets and subtree sizes are 48-bit unsigned;
//! node entries pack a 12-bit key length and a 28-bit value length into
//! five bytes.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Largest key the node codec can express (12-bit length).
pub const MAX_KEY_SIZE: usize = (1 << 12) - 1;

/// Largest value the node codec can express (28-bit length).
pub const MAX_VALUE_SIZE: usize = (1 << 28) - 1;

/// Largest integer representable in 48 bits.
pub const MAX_U48: u64 = (1 << 48) - 1;

pub fn read_u48<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    reader.read_uint::<BigEndian>(6)
}

pub fn write_u48<W: Write>(writer: &mut W, value: u64) -> std::io::Result<()> {
    debug_assert!(value <= MAX_U48);
    writer.write_uint::<BigEndian>(value & MAX_U48, 6)
}

/// Packs a 12-bit key length and a 28-bit value length into five bytes.
pub fn write_kvlen<W: Write>(writer: &mut W, key_len: usize, value_len: usize) -> std::io::Result<()> {
    debug_assert!(key_len <= MAX_KEY_SIZE);
    debug_assert!(value_len <= MAX_VALUE_SIZE);

    let packed = ((key_len as u64) << 28) | (value_len as u64);
    writer.write_uint::<BigEndian>(packed, 5)
}

/// Unpacks a `(key_len, value_len)` pair written by [`write_kvlen`].
#[allow(clippy::cast_possible_truncation)]
pub fn read_kvlen<R: Read>(reader: &mut R) -> std::io::Result<(usize, usize)> {
    let packed = reader.read_uint::<BigEndian>(5)?;
    Ok(((packed >> 28) as usize, (packed & 0x0FFF_FFFF) as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use test_log::test;

    #[test]
    fn u48_raw() -> std::io::Result<()> {
        let mut buf = vec![];
        write_u48(&mut buf, 0x0000_1234_5678_9ABC)?;
        assert_eq!([0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC], *buf);
        assert_eq!(0x0000_1234_5678_9ABC, read_u48(&mut Cursor::new(buf))?);
        Ok(())
    }

    #[test]
    fn u48_max() -> std::io::Result<()> {
        let mut buf = vec![];
        write_u48(&mut buf, MAX_U48)?;
        assert_eq!([0xFF; 6], *buf);
        assert_eq!(MAX_U48, read_u48(&mut Cursor::new(buf))?);
        Ok(())
    }

    #[test]
    fn kvlen_raw() -> std::io::Result<()> {
        let mut buf = vec![];
        write_kvlen(&mut buf, 1, 10)?;

        // 12 bits of key length, 28 bits of value length
        assert_eq!([0x00, 0x10, 0x00, 0x00, 0x0A], *buf);

        let (klen, vlen) = read_kvlen(&mut Cursor::new(buf))?;
        assert_eq!((1, 10), (klen, vlen));
        Ok(())
    }

    #[test]
    fn kvlen_extremes() -> std::io::Result<()> {
        let mut buf = vec![];
        write_kvlen(&mut buf, MAX_KEY_SIZE, MAX_VALUE_SIZE)?;
        assert_eq!([0xFF; 5], *buf);

        let (klen, vlen) = read_kvlen(&mut Cursor::new(buf))?;
        assert_eq!((MAX_KEY_SIZE, MAX_VALUE_SIZE), (klen, vlen));
        Ok(())
    }
}
