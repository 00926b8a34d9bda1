// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Blocked chunk framing.
//!
//! The file is partitioned into 4096-byte blocks whose first byte is a type
//! prefix (`0x00` data, `0x01` header). Logical chunks span block boundaries;
//! the prefix bytes are inserted on write and stripped on read and are not
//! part of any chunk's contents.
//!
//! A chunk is framed as a 32-bit length (high bit flags a compressed
//! payload), the 32-bit CRC of the stored payload, then the payload itself.
//! Header chunks always start block-aligned, carry the header prefix in
//! their first block, and have the high length bit clear.

use crate::{
    compression::{compress, decompress, CompressionType},
    file::TreeFile,
    Checksum, Slice,
};
use byteorder::{BigEndian, ByteOrder};

/// Size of a file block.
pub const BLOCK_SIZE: u64 = 4_096;

/// Type prefix of a data block.
pub(crate) const BLOCK_DATA: u8 = 0x00;

/// Type prefix of a header block.
pub(crate) const BLOCK_HEADER: u8 = 0x01;

/// Length + CRC preceding every chunk payload.
const CHUNK_HEADER_LEN: u64 = 8;

/// High bit of the length word, flagging a compressed payload.
const COMPRESSED_FLAG: u32 = 0x8000_0000;

/// Result of appending a chunk.
#[derive(Copy, Clone, Debug)]
pub(crate) struct ChunkWrite {
    /// Offset the chunk starts at.
    pub offset: u64,

    /// Logical disk footprint of the chunk (frame plus stored payload),
    /// excluding position-dependent block prefixes.
    pub disk_size: u64,
}

/// Number of physical bytes that hold `len` logical bytes starting at
/// `offset`, accounting for block prefixes.
pub(crate) fn total_read_len(offset: u64, len: u64) -> u64 {
    if len == 0 {
        return 0;
    }

    let mut total = len;
    let mut block_offset = offset % BLOCK_SIZE;

    if block_offset == 0 {
        total += 1;
        block_offset = 1;
    }

    let left_in_block = BLOCK_SIZE - block_offset;
    if len > left_in_block {
        // Every subsequent block holds BLOCK_SIZE - 1 payload bytes
        total += (len - left_in_block).div_ceil(BLOCK_SIZE - 1);
    }

    total
}

/// Reads `len` logical bytes starting at `offset`, consuming block prefixes.
fn read_stripped(file: &TreeFile, offset: u64, len: usize) -> crate::Result<Vec<u8>> {
    let physical_len = total_read_len(offset, len as u64);

    if offset + physical_len > file.pos() {
        return Err(crate::Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("chunk at {offset} extends past end of file"),
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut raw = vec![0u8; physical_len as usize];
    file.pread_exact(&mut raw, offset)?;

    let mut out = Vec::with_capacity(len);
    let mut pos = offset;
    let mut i = 0usize;

    while out.len() < len {
        if pos % BLOCK_SIZE == 0 {
            i += 1;
            pos += 1;
            continue;
        }

        #[allow(clippy::cast_possible_truncation)]
        let room = (BLOCK_SIZE - pos % BLOCK_SIZE) as usize;
        let take = room.min(len - out.len());

        #[allow(clippy::indexing_slicing)]
        out.extend_from_slice(&raw[i..i + take]);

        i += take;
        pos += take as u64;
    }

    Ok(out)
}

/// Appends the concatenation of `parts` at end-of-file, inserting block
/// prefixes as boundaries are crossed. Returns the starting offset.
fn write_stripped(file: &mut TreeFile, first_prefix: u8, parts: &[&[u8]]) -> crate::Result<u64> {
    let start = file.pos();
    let total: usize = parts.iter().map(|p| p.len()).sum();

    #[allow(clippy::cast_possible_truncation)]
    let mut out = Vec::with_capacity(total + total / (BLOCK_SIZE as usize - 1) + 2);
    let mut pos = start;

    for part in parts {
        let mut i = 0usize;

        while i < part.len() {
            if pos % BLOCK_SIZE == 0 {
                out.push(if pos == start { first_prefix } else { BLOCK_DATA });
                pos += 1;
            }

            #[allow(clippy::cast_possible_truncation)]
            let room = (BLOCK_SIZE - pos % BLOCK_SIZE) as usize;
            let take = room.min(part.len() - i);

            #[allow(clippy::indexing_slicing)]
            out.extend_from_slice(&part[i..i + take]);

            i += take;
            pos += take as u64;
        }
    }

    file.append(&out)?;
    Ok(start)
}

fn chunk_frame(payload: &[u8], compressed: bool) -> [u8; 8] {
    #[allow(clippy::cast_possible_truncation)]
    let mut len_word = payload.len() as u32;
    if compressed {
        len_word |= COMPRESSED_FLAG;
    }

    let mut frame = [0u8; 8];
    BigEndian::write_u32(&mut frame, len_word);
    BigEndian::write_u32(
        &mut frame[4..],
        Checksum::from_bytes(payload).into_u32(),
    );
    frame
}

/// Appends a data chunk, compressing the payload if requested and worth it.
pub(crate) fn write_chunk(
    file: &mut TreeFile,
    payload: &[u8],
    compression: CompressionType,
) -> crate::Result<ChunkWrite> {
    match compress(payload, compression) {
        Some(compressed) => write_chunk_raw(file, &compressed, true),
        None => write_chunk_raw(file, payload, false),
    }
}

/// Appends a data chunk whose payload is already in stored form.
pub(crate) fn write_chunk_raw(
    file: &mut TreeFile,
    payload: &[u8],
    compressed: bool,
) -> crate::Result<ChunkWrite> {
    if payload.len() as u64 >= u64::from(COMPRESSED_FLAG) {
        return Err(crate::Error::InvalidArgument("chunk payload too large"));
    }

    let frame = chunk_frame(payload, compressed);
    let offset = write_stripped(file, BLOCK_DATA, &[&frame, payload])?;

    log::trace!("wrote chunk at {offset}, {} stored bytes", payload.len());

    Ok(ChunkWrite {
        offset,
        disk_size: CHUNK_HEADER_LEN + payload.len() as u64,
    })
}

/// Reads the stored payload of the data chunk at `offset` without
/// decompressing it. Returns the payload and its compressed flag.
pub(crate) fn read_chunk_raw(file: &TreeFile, offset: u64) -> crate::Result<(Slice, bool)> {
    let frame = read_stripped(file, offset, CHUNK_HEADER_LEN as usize)?;

    #[allow(clippy::indexing_slicing)]
    let len_word = BigEndian::read_u32(&frame[..4]);
    #[allow(clippy::indexing_slicing)]
    let expected = Checksum::from_raw(BigEndian::read_u32(&frame[4..]));

    let compressed = len_word & COMPRESSED_FLAG != 0;
    let len = len_word & !COMPRESSED_FLAG;

    let body_offset = offset + total_read_len(offset, CHUNK_HEADER_LEN);

    #[allow(clippy::cast_possible_truncation)]
    let payload = read_stripped(file, body_offset, len as usize)?;

    Checksum::from_bytes(&payload).check(expected)?;

    Ok((Slice::from(payload), compressed))
}

/// Reads and (if flagged) decompresses the data chunk at `offset`.
pub(crate) fn read_chunk(file: &TreeFile, offset: u64) -> crate::Result<Slice> {
    let (payload, compressed) = read_chunk_raw(file, offset)?;

    if compressed {
        Ok(Slice::from(decompress(&payload)?))
    } else {
        Ok(payload)
    }
}

/// Advances end-of-file to the next block boundary and appends a header
/// chunk there. Returns the aligned offset.
pub(crate) fn write_header_chunk(file: &mut TreeFile, payload: &[u8]) -> crate::Result<u64> {
    if payload.len() as u64 >= u64::from(COMPRESSED_FLAG) {
        return Err(crate::Error::InvalidArgument("header payload too large"));
    }

    let pad = (BLOCK_SIZE - file.pos() % BLOCK_SIZE) % BLOCK_SIZE;
    if pad > 0 {
        #[allow(clippy::cast_possible_truncation)]
        file.append(&vec![0u8; pad as usize])?;
    }

    let frame = chunk_frame(payload, false);
    write_stripped(file, BLOCK_HEADER, &[&frame, payload])
}

/// Reads the header chunk at the block-aligned `offset`.
pub(crate) fn read_header_chunk(file: &TreeFile, offset: u64) -> crate::Result<Slice> {
    if offset % BLOCK_SIZE != 0 {
        return Err(crate::Error::InvalidArgument(
            "header offset must be block-aligned",
        ));
    }

    let mut prefix = [0u8; 1];
    file.pread_exact(&mut prefix, offset)?;

    if prefix[0] != BLOCK_HEADER {
        return Err(crate::Error::NoHeader);
    }

    let frame = read_stripped(file, offset, CHUNK_HEADER_LEN as usize)?;

    #[allow(clippy::indexing_slicing)]
    let len_word = BigEndian::read_u32(&frame[..4]);
    #[allow(clippy::indexing_slicing)]
    let expected = Checksum::from_raw(BigEndian::read_u32(&frame[4..]));

    if len_word & COMPRESSED_FLAG != 0 {
        return Err(crate::Error::CorruptNode("compressed header chunk"));
    }

    let body_offset = offset + total_read_len(offset, CHUNK_HEADER_LEN);

    #[allow(clippy::cast_possible_truncation)]
    let payload = read_stripped(file, body_offset, len_word as usize)?;

    Checksum::from_bytes(&payload).check(expected)?;

    Ok(Slice::from(payload))
}

/// Whether the block starting at `offset` carries the header prefix.
pub(crate) fn is_header_block(file: &TreeFile, offset: u64) -> crate::Result<bool> {
    let mut prefix = [0u8; 1];
    file.pread_exact(&mut prefix, offset)?;
    Ok(prefix[0] == BLOCK_HEADER)
}
