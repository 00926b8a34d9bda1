// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    modify::{Engine, FlushPolicy, NodeBuilder},
    NodePointer, TreeOps,
};
use crate::{file::TreeFile, Slice};
use std::cmp::Ordering;

/// Bulk-loads a tree bottom-up from an already-sorted stream.
///
/// Because input is sorted, every push extends the rightmost leaf and
/// flushing happens purely by size. Once the stream is consumed,
/// [`TreeBuilder::finish`] builds the KP levels from the accumulated
/// pointer list until a single root remains.
pub struct TreeBuilder<'a> {
    ops: &'a dyn TreeOps,
    engine: Engine<'a>,
    leaf: NodeBuilder,
    last_key: Option<Slice>,
}

impl<'a> TreeBuilder<'a> {
    /// Creates a builder writing in append-only (compaction) mode.
    #[must_use]
    pub fn new(ops: &'a dyn TreeOps) -> Self {
        let mut leaf = NodeBuilder::kv(true);
        leaf.modified = true;

        Self {
            ops,
            engine: Engine::new(ops, FlushPolicy::compaction(), None),
            leaf,
            last_key: None,
        }
    }

    /// Appends the next key/value pair. Keys must arrive in strictly
    /// ascending comparator order.
    pub fn push(&mut self, file: &mut TreeFile, key: Slice, value: Slice) -> crate::Result<()> {
        if let Some(last) = &self.last_key {
            if self.ops.compare(last, &key) != Ordering::Less {
                return Err(crate::Error::InvalidArgument(
                    "bulk input must be sorted and deduplicated",
                ));
            }
        }
        self.last_key = Some(key.clone());

        self.engine.push_kv(file, &mut self.leaf, key, value)
    }

    /// Flushes the tail node and collapses the pointer levels into a root.
    ///
    /// Returns `None` if nothing was pushed.
    pub fn finish(mut self, file: &mut TreeFile) -> crate::Result<Option<NodePointer>> {
        self.engine.flush(file, &mut self.leaf)?;

        let pointers = std::mem::take(&mut self.leaf.pointers);
        self.engine.complete_root(file, pointers)
    }
}

#[cfg(test)]
mod tests {
    use super::TreeBuilder;
    use crate::btree::{lookup::fold, Lexicographic};
    use crate::file::TreeFile;
    use crate::file_ops::MemoryFileOps;
    use std::ops::ControlFlow;
    use test_log::test;

    #[test]
    fn bulk_build_preserves_order() -> crate::Result<()> {
        let mut file = TreeFile::new(Box::new(MemoryFileOps::new()))?;
        let mut builder = TreeBuilder::new(&Lexicographic);

        for i in 0..10_000u32 {
            builder.push(
                &mut file,
                format!("key{i:08}").into(),
                format!("value{i}").into(),
            )?;
        }

        let root = builder.finish(&mut file)?.expect("root should exist");

        let mut count = 0u32;
        fold(&file, &Lexicographic, &root, b"", &mut |k, v| {
            assert_eq!(format!("key{count:08}").as_bytes(), &**k);
            assert_eq!(format!("value{count}").as_bytes(), &**v);
            count += 1;
            Ok(ControlFlow::Continue(()))
        })?;

        assert_eq!(10_000, count);
        Ok(())
    }

    #[test]
    fn bulk_build_empty_stream() -> crate::Result<()> {
        let mut file = TreeFile::new(Box::new(MemoryFileOps::new()))?;
        let builder = TreeBuilder::new(&Lexicographic);
        assert!(builder.finish(&mut file)?.is_none());
        Ok(())
    }

    #[test]
    fn bulk_build_rejects_unsorted_input() -> crate::Result<()> {
        let mut file = TreeFile::new(Box::new(MemoryFileOps::new()))?;
        let mut builder = TreeBuilder::new(&Lexicographic);

        builder.push(&mut file, "b".into(), "1".into())?;
        assert!(matches!(
            builder.push(&mut file, "a".into(), "2".into()),
            Err(crate::Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn subtree_sizes_add_up() -> crate::Result<()> {
        let mut file = TreeFile::new(Box::new(MemoryFileOps::new()))?;
        let mut builder = TreeBuilder::new(&Lexicographic);

        for i in 0..1_000u32 {
            builder.push(&mut file, format!("key{i:08}").into(), "x".into())?;
        }

        let root = builder.finish(&mut file)?.expect("root should exist");

        // Every byte the tree owns was appended to this file
        assert!(root.subtree_size <= file.pos());
        assert!(root.subtree_size > 0);
        Ok(())
    }
}
