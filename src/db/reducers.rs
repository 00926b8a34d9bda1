// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Built-in reductions of the two document indexes.
//!
//! by-id caches `(count, deleted_count, data_bytes)` per subtree, by-seq a
//! plain entry count; both give O(log n) range statistics and drive the
//! database-level document counters.

use super::doc::decode_id_value;
use crate::{
    bitfield::{read_u48, write_u48},
    btree::{KvPair, NodePointer, TreeOps},
    Slice,
};
use std::cmp::Ordering;

/// Decoded by-id reduction: `u48 count | u48 deleted_count | u48 data_bytes`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IdReduction {
    /// Number of live (non-deleted) documents in the subtree
    pub count: u64,

    /// Number of tombstones in the subtree
    pub deleted_count: u64,

    /// Total disk bytes of the document bodies in the subtree
    pub data_bytes: u64,
}

impl IdReduction {
    pub(crate) fn decode(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() != 18 {
            return Err(crate::Error::CorruptNode("malformed by-id reduction"));
        }

        let mut reader = bytes;
        Ok(Self {
            count: read_u48(&mut reader)?,
            deleted_count: read_u48(&mut reader)?,
            data_bytes: read_u48(&mut reader)?,
        })
    }

    pub(crate) fn encode(self) -> crate::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(18);
        write_u48(&mut out, self.count)?;
        write_u48(&mut out, self.deleted_count)?;
        write_u48(&mut out, self.data_bytes)?;
        Ok(out)
    }
}

pub(crate) fn decode_seq_count(bytes: &[u8]) -> crate::Result<u64> {
    if bytes.len() != 6 {
        return Err(crate::Error::CorruptNode("malformed by-seq reduction"));
    }

    let mut reader = bytes;
    Ok(read_u48(&mut reader)?)
}

/// Tree semantics of the by-id index.
pub(crate) struct IdTreeOps;

impl TreeOps for IdTreeOps {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn reduce(&self, items: &[KvPair]) -> crate::Result<Vec<u8>> {
        let mut acc = IdReduction::default();

        for (key, value) in items {
            let info = decode_id_value(key.clone(), value)?;
            if info.deleted {
                acc.deleted_count += 1;
            } else {
                acc.count += 1;
            }
            acc.data_bytes += u64::from(info.body_size);
        }

        acc.encode()
    }

    fn rereduce(&self, pointers: &[NodePointer]) -> crate::Result<Vec<u8>> {
        let mut acc = IdReduction::default();

        for pointer in pointers {
            let child = IdReduction::decode(&pointer.reduce_value)?;
            acc.count += child.count;
            acc.deleted_count += child.deleted_count;
            acc.data_bytes += child.data_bytes;
        }

        acc.encode()
    }
}

/// Tree semantics of the by-seq index. Keys are 48-bit big-endian
/// sequence numbers, so byte order is numeric order.
pub(crate) struct SeqTreeOps;

impl TreeOps for SeqTreeOps {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn reduce(&self, items: &[KvPair]) -> crate::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(6);
        write_u48(&mut out, items.len() as u64)?;
        Ok(out)
    }

    fn rereduce(&self, pointers: &[NodePointer]) -> crate::Result<Vec<u8>> {
        let mut total = 0u64;
        for pointer in pointers {
            total += decode_seq_count(&pointer.reduce_value)?;
        }

        let mut out = Vec::with_capacity(6);
        write_u48(&mut out, total)?;
        Ok(out)
    }
}

/// Tree semantics of the local-docs tree: plain ordering, no reduction.
pub(crate) struct LocalDocsOps;

impl TreeOps for LocalDocsOps {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}
