// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    bitfield::{read_u48, write_u48},
    Slice,
};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// High bit of `content_meta`: the stored body is compressed.
pub const DOC_IS_COMPRESSED: u8 = 0x80;

/// Low nibble of `content_meta`: the body is valid JSON.
pub const DOC_IS_JSON: u8 = 0;

/// Low nibble of `content_meta`: the body was checked and is not valid JSON.
pub const DOC_INVALID_JSON: u8 = 1;

/// Low nibble of `content_meta`: the body contained reserved keys and was
/// not inserted as JSON.
pub const DOC_INVALID_JSON_KEY: u8 = 2;

/// Low nibble of `content_meta`: the body was not checked.
pub const DOC_NON_JSON: u8 = 3;

/// Namespace prefix every local document id must carry.
pub const LOCAL_DOC_PREFIX: &[u8] = b"_local/";

/// A document: an opaque id and an opaque body
#[derive(Clone, Debug)]
pub struct Document {
    /// Document id; non-empty, at most 4095 bytes
    pub id: Slice,

    /// Document body, stored as-is (or compressed on request)
    pub body: Slice,
}

impl Document {
    /// Creates a document.
    pub fn new(id: impl Into<Slice>, body: impl Into<Slice>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }
}

/// Index entry of a document: everything known about it except the body
#[derive(Clone, Debug)]
pub struct DocInfo {
    /// Document id
    pub id: Slice,

    /// Position of this update in the change stream; assigned by
    /// `save_docs`
    pub db_seq: u64,

    /// Per-document revision counter; assigned by the caller
    pub rev_seq: u64,

    /// Opaque application metadata attached to the revision
    pub rev_meta: Slice,

    /// Whether this revision is a deletion tombstone
    pub deleted: bool,

    /// Body classification flags (`DOC_*` constants)
    pub content_meta: u8,

    /// File offset of the body chunk; 0 if the document has no body
    pub body_pointer: u64,

    /// Disk footprint of the body chunk
    pub body_size: u32,
}

impl DocInfo {
    /// Creates an info for saving: id and revision from the caller, the
    /// rest filled in by `save_docs`.
    pub fn new(id: impl Into<Slice>, rev_seq: u64) -> Self {
        Self {
            id: id.into(),
            db_seq: 0,
            rev_seq,
            rev_meta: Slice::empty(),
            deleted: false,
            content_meta: DOC_NON_JSON,
            body_pointer: 0,
            body_size: 0,
        }
    }

    /// Marks the info as a deletion tombstone.
    #[must_use]
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }
}

/// A document in the local-docs namespace: not replicated, not versioned,
/// not enumerated by the change stream
#[derive(Clone, Debug)]
pub struct LocalDoc {
    /// Local id, including the `_local/` prefix
    pub id: Slice,

    /// Opaque body
    pub body: Slice,

    /// Set to remove the local document on save
    pub deleted: bool,
}

/// Encodes a by-seq key: the 48-bit big-endian sequence number.
pub(crate) fn seq_key(seq: u64) -> Slice {
    let mut buf = [0u8; 6];

    #[allow(clippy::expect_used)]
    write_u48(&mut &mut buf[..], seq).expect("cannot fail");

    Slice::from(buf)
}

pub(crate) fn decode_seq_key(key: &[u8]) -> crate::Result<u64> {
    if key.len() != 6 {
        return Err(crate::Error::CorruptNode("sequence key must be 6 bytes"));
    }

    let mut reader = key;
    Ok(read_u48(&mut reader)?)
}

/// by-id value: `u48 db_seq | u32 body_size | u48 body_pointer |
/// u8 deleted | u8 content_meta | u48 rev_seq | rev_meta`.
pub(crate) fn encode_id_value(info: &DocInfo) -> crate::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(24 + info.rev_meta.len());

    write_u48(&mut out, info.db_seq)?;
    out.write_u32::<BigEndian>(info.body_size)?;
    write_u48(&mut out, info.body_pointer)?;
    out.write_u8(u8::from(info.deleted))?;
    out.write_u8(info.content_meta)?;
    write_u48(&mut out, info.rev_seq)?;
    out.extend_from_slice(&info.rev_meta);

    Ok(out)
}

pub(crate) fn decode_id_value(id: Slice, value: &Slice) -> crate::Result<DocInfo> {
    if value.len() < 24 {
        return Err(crate::Error::CorruptNode("truncated by-id value"));
    }

    let mut reader = &value[..];
    let db_seq = read_u48(&mut reader)?;

    #[allow(clippy::indexing_slicing)]
    let body_size = BigEndian::read_u32(&value[6..10]);

    #[allow(clippy::indexing_slicing)]
    let mut reader = &value[10..];
    let body_pointer = read_u48(&mut reader)?;

    #[allow(clippy::indexing_slicing)]
    let deleted = value[16] != 0;

    #[allow(clippy::indexing_slicing)]
    let content_meta = value[17];

    #[allow(clippy::indexing_slicing)]
    let mut reader = &value[18..];
    let rev_seq = read_u48(&mut reader)?;

    Ok(DocInfo {
        id,
        db_seq,
        rev_seq,
        rev_meta: value.slice(24..),
        deleted,
        content_meta,
        body_pointer,
        body_size,
    })
}

/// by-seq value: `u32 body_size (high bit = deleted) | u48 body_pointer |
/// u8 content_meta | u48 rev_seq | u16 id_len | id | rev_meta`.
pub(crate) fn encode_seq_value(info: &DocInfo) -> crate::Result<Vec<u8>> {
    if info.body_size >= 0x8000_0000 {
        return Err(crate::Error::InvalidArgument("body too large"));
    }

    let mut out = Vec::with_capacity(19 + info.id.len() + info.rev_meta.len());

    let mut size_word = info.body_size;
    if info.deleted {
        size_word |= 0x8000_0000;
    }
    out.write_u32::<BigEndian>(size_word)?;

    write_u48(&mut out, info.body_pointer)?;
    out.write_u8(info.content_meta)?;
    write_u48(&mut out, info.rev_seq)?;

    #[allow(clippy::cast_possible_truncation)]
    out.write_u16::<BigEndian>(info.id.len() as u16)?;
    out.extend_from_slice(&info.id);
    out.extend_from_slice(&info.rev_meta);

    Ok(out)
}

pub(crate) fn decode_seq_value(db_seq: u64, value: &Slice) -> crate::Result<DocInfo> {
    if value.len() < 19 {
        return Err(crate::Error::CorruptNode("truncated by-seq value"));
    }

    #[allow(clippy::indexing_slicing)]
    let size_word = BigEndian::read_u32(&value[..4]);
    let deleted = size_word & 0x8000_0000 != 0;
    let body_size = size_word & 0x7FFF_FFFF;

    #[allow(clippy::indexing_slicing)]
    let mut reader = &value[4..];
    let body_pointer = read_u48(&mut reader)?;

    #[allow(clippy::indexing_slicing)]
    let content_meta = value[10];

    #[allow(clippy::indexing_slicing)]
    let mut reader = &value[11..];
    let rev_seq = read_u48(&mut reader)?;

    #[allow(clippy::indexing_slicing)]
    let id_len = usize::from(BigEndian::read_u16(&value[17..19]));

    if value.len() < 19 + id_len {
        return Err(crate::Error::CorruptNode("truncated by-seq value"));
    }

    Ok(DocInfo {
        id: value.slice(19..19 + id_len),
        db_seq,
        rev_seq,
        rev_meta: value.slice(19 + id_len..),
        deleted,
        content_meta,
        body_pointer,
        body_size,
    })
}
