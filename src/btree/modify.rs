// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    node::{
        decode_node, encode_kp_node, encode_kv_node, kp_entry_size, kv_entry_size, Node, NodeType,
    },
    KvPair, NodePointer, TreeOps, KP_CHUNK_THRESHOLD, KV_CHUNK_THRESHOLD, MAX_REDUCE_SIZE,
};
use crate::{
    arena::Arena, block, compression::CompressionType, file::TreeFile, Slice,
};
use std::cmp::Ordering;

/// Operation applied to one key
#[derive(Clone, Debug)]
pub enum Op {
    /// Report the current value through the fetch callback, without
    /// modifying the tree
    Fetch,

    /// Insert or replace the value for the key
    Insert(Slice),

    /// Remove the key; removing an absent key is ignored
    Remove,
}

/// One element of the sorted action stream consumed by [`modify_tree`]
#[derive(Clone, Debug)]
pub struct ModifyAction {
    /// Key the operation applies to
    pub key: Slice,

    /// The operation
    pub op: Op,
}

impl ModifyAction {
    /// Creates an insert action.
    #[must_use]
    pub fn insert(key: Slice, value: Slice) -> Self {
        Self {
            key,
            op: Op::Insert(value),
        }
    }

    /// Creates a remove action.
    #[must_use]
    pub fn remove(key: Slice) -> Self {
        Self {
            key,
            op: Op::Remove,
        }
    }

    /// Creates a fetch action.
    #[must_use]
    pub fn fetch(key: Slice) -> Self {
        Self {
            key,
            op: Op::Fetch,
        }
    }
}

/// Callback invoked for every [`Op::Fetch`] hit.
pub type FetchCallback<'a> = &'a mut dyn FnMut(&Slice, &Slice) -> crate::Result<()>;

/// Node sizing policy of one tree rewrite.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FlushPolicy {
    /// Compaction flushes earlier (at ~2/3 threshold) to leave slack for
    /// future inserts, and accepts two-item nodes
    pub compacting: bool,

    pub kv_threshold: usize,
    pub kp_threshold: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            compacting: false,
            kv_threshold: KV_CHUNK_THRESHOLD,
            kp_threshold: KP_CHUNK_THRESHOLD,
        }
    }
}

impl FlushPolicy {
    pub(crate) fn compaction() -> Self {
        Self {
            compacting: true,
            ..Self::default()
        }
    }
}

pub(crate) enum NodeItems {
    Kv(Vec<KvPair>),
    Kp(Vec<NodePointer>),
}

/// A node under construction, plus the pointers of nodes already flushed
/// at this level.
pub(crate) struct NodeBuilder {
    pub(crate) items: NodeItems,

    /// Running encoded-size estimate of the buffered items (excluding the
    /// node type byte)
    size: usize,

    /// Never flushed until something actually changed; an untouched node
    /// is left as-is on disk
    pub(crate) modified: bool,

    /// Collectors (the root level) buffer without flushing by size
    auto_flush: bool,

    pub(crate) pointers: Vec<NodePointer>,
}

impl NodeBuilder {
    pub(crate) fn kv(auto_flush: bool) -> Self {
        Self {
            items: NodeItems::Kv(Vec::new()),
            size: 0,
            modified: false,
            auto_flush,
            pointers: Vec::new(),
        }
    }

    pub(crate) fn kp(auto_flush: bool) -> Self {
        Self {
            items: NodeItems::Kp(Vec::new()),
            size: 0,
            modified: false,
            auto_flush,
            pointers: Vec::new(),
        }
    }

    fn count(&self) -> usize {
        match &self.items {
            NodeItems::Kv(items) => items.len(),
            NodeItems::Kp(pointers) => pointers.len(),
        }
    }

    fn node_type(&self) -> NodeType {
        match &self.items {
            NodeItems::Kv(_) => NodeType::Kv,
            NodeItems::Kp(_) => NodeType::Kp,
        }
    }
}

/// Shared machinery of tree rewrites: pushes items into node builders,
/// flushes nodes by the sizing policy and completes new roots.
pub(crate) struct Engine<'a> {
    ops: &'a dyn TreeOps,
    policy: FlushPolicy,
    on_fetch: Option<FetchCallback<'a>>,
    arena: Arena,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(
        ops: &'a dyn TreeOps,
        policy: FlushPolicy,
        on_fetch: Option<FetchCallback<'a>>,
    ) -> Self {
        Self {
            ops,
            policy,
            on_fetch,
            arena: Arena::new(0),
        }
    }

    pub(crate) fn push_kv(
        &mut self,
        file: &mut TreeFile,
        builder: &mut NodeBuilder,
        key: Slice,
        value: Slice,
    ) -> crate::Result<()> {
        builder.size += kv_entry_size(&key, &value);

        match &mut builder.items {
            NodeItems::Kv(items) => items.push((key, value)),
            NodeItems::Kp(_) => unreachable!("pushed pair into pointer builder"),
        }

        self.maybe_flush(file, builder)
    }

    pub(crate) fn push_kp(
        &mut self,
        file: &mut TreeFile,
        builder: &mut NodeBuilder,
        pointer: NodePointer,
    ) -> crate::Result<()> {
        builder.size += kp_entry_size(&pointer);

        match &mut builder.items {
            NodeItems::Kp(pointers) => pointers.push(pointer),
            NodeItems::Kv(_) => unreachable!("pushed pointer into pair builder"),
        }

        self.maybe_flush(file, builder)
    }

    fn maybe_flush(&mut self, file: &mut TreeFile, builder: &mut NodeBuilder) -> crate::Result<()> {
        if !builder.auto_flush || !builder.modified {
            return Ok(());
        }

        let threshold = match builder.node_type() {
            NodeType::Kv => self.policy.kv_threshold,
            NodeType::Kp => self.policy.kp_threshold,
        };

        let (limit, min_items) = if self.policy.compacting {
            (threshold * 2 / 3, 2)
        } else {
            (threshold, 3)
        };

        if builder.size >= limit && builder.count() >= min_items {
            self.flush(file, builder)?;
        }

        Ok(())
    }

    /// Serializes the buffered items as a node, writes it, and appends the
    /// resulting pointer to the builder's output.
    pub(crate) fn flush(&mut self, file: &mut TreeFile, builder: &mut NodeBuilder) -> crate::Result<()> {
        if builder.count() == 0 {
            return Ok(());
        }

        let encoded_size = 1 + builder.size;
        let mark = self.arena.mark();

        let write = {
            let buf = self.arena.alloc_unaligned(encoded_size);

            {
                let mut cursor = &mut buf[..];
                match &builder.items {
                    NodeItems::Kv(items) => encode_kv_node(&mut cursor, items)?,
                    NodeItems::Kp(pointers) => encode_kp_node(&mut cursor, pointers)?,
                }
                debug_assert!(cursor.is_empty(), "size estimate must be exact");
            }

            block::write_chunk(file, buf, CompressionType::None)?
        };

        let (reduce_value, children_size, key) = match &builder.items {
            NodeItems::Kv(items) => {
                let reduce_value = self.ops.reduce(items)?;

                #[allow(clippy::expect_used)]
                let (key, _) = items.last().expect("builder is non-empty");

                (reduce_value, 0, key.clone())
            }
            NodeItems::Kp(pointers) => {
                let reduce_value = self.ops.rereduce(pointers)?;
                let children_size = pointers.iter().map(|p| p.subtree_size).sum();

                #[allow(clippy::expect_used)]
                let key = pointers.last().expect("builder is non-empty").key.clone();

                (reduce_value, children_size, key)
            }
        };

        if reduce_value.len() > MAX_REDUCE_SIZE {
            return Err(crate::Error::ReductionTooLarge(reduce_value.len()));
        }

        builder.pointers.push(NodePointer {
            key,
            pointer: write.offset,
            subtree_size: write.disk_size + children_size,
            reduce_value: reduce_value.into(),
        });

        match &mut builder.items {
            NodeItems::Kv(items) => items.clear(),
            NodeItems::Kp(pointers) => pointers.clear(),
        }
        builder.size = 0;

        self.arena.rewind(mark);
        Ok(())
    }

    /// Collapses a pointer list bottom-up into a single root, writing new
    /// KP levels as long as more than one pointer remains.
    pub(crate) fn complete_root(
        &mut self,
        file: &mut TreeFile,
        mut pointers: Vec<NodePointer>,
    ) -> crate::Result<Option<NodePointer>> {
        loop {
            if pointers.len() <= 1 {
                return Ok(pointers.pop());
            }

            let mut level = NodeBuilder::kp(true);
            level.modified = true;

            for pointer in pointers {
                self.push_kp(file, &mut level, pointer)?;
            }
            self.flush(file, &mut level)?;

            pointers = level.pointers;
        }
    }

    /// Rewrites the subtree under `node` according to `actions`, appending
    /// the resulting pointers (the unchanged original, or one or more new
    /// nodes) to `dst`. Returns whether anything was modified.
    fn modify_node(
        &mut self,
        file: &mut TreeFile,
        node: Option<&NodePointer>,
        actions: &[ModifyAction],
        dst: &mut NodeBuilder,
    ) -> crate::Result<bool> {
        let decoded = match node {
            Some(pointer) => decode_node(&block::read_chunk(file, pointer.pointer)?)?,
            None => Node::Kv(Vec::new()),
        };

        let mut local = match decoded {
            Node::Kv(ref existing) => {
                let mut local = NodeBuilder::kv(true);
                self.merge_kv(file, existing, actions, &mut local)?;
                local
            }
            Node::Kp(ref children) => {
                let mut local = NodeBuilder::kp(true);
                let mut next_action = 0usize;

                for (i, child) in children.iter().enumerate() {
                    let end = if i + 1 == children.len() {
                        // Keys beyond the last child extend its subtree
                        actions.len()
                    } else {
                        #[allow(clippy::indexing_slicing)]
                        let in_range = actions[next_action..].partition_point(|action| {
                            self.ops.compare(&action.key, &child.key) != Ordering::Greater
                        });
                        next_action + in_range
                    };

                    if next_action == end {
                        self.push_kp(file, &mut local, child.clone())?;
                    } else {
                        #[allow(clippy::indexing_slicing)]
                        let modified =
                            self.modify_node(file, Some(child), &actions[next_action..end], &mut local)?;
                        if modified {
                            local.modified = true;
                        }
                        next_action = end;
                    }
                }

                local
            }
        };

        if !local.modified {
            if let Some(pointer) = node {
                self.push_kp(file, dst, pointer.clone())?;
            }
            return Ok(false);
        }

        self.flush(file, &mut local)?;
        for pointer in std::mem::take(&mut local.pointers) {
            self.push_kp(file, dst, pointer)?;
        }

        Ok(true)
    }

    /// Merges a leaf's entries with the pending actions. Equal keys within
    /// one batch are resolved in arrival order, so the last write wins.
    fn merge_kv(
        &mut self,
        file: &mut TreeFile,
        existing: &[KvPair],
        actions: &[ModifyAction],
        local: &mut NodeBuilder,
    ) -> crate::Result<()> {
        let mut e = 0usize;
        let mut a = 0usize;

        while let Some(action) = actions.get(a) {
            // Entries below the action key pass through untouched
            while let Some((k, v)) = existing.get(e) {
                if self.ops.compare(k, &action.key) != Ordering::Less {
                    break;
                }
                self.push_kv(file, local, k.clone(), v.clone())?;
                e += 1;
            }

            let mut current = match existing.get(e) {
                Some((k, v)) if self.ops.compare(k, &action.key) == Ordering::Equal => {
                    e += 1;
                    Some((k.clone(), v.clone()))
                }
                _ => None,
            };

            let mut changed = false;
            while let Some(run) = actions.get(a) {
                if self.ops.compare(&run.key, &action.key) != Ordering::Equal {
                    break;
                }

                match &run.op {
                    Op::Fetch => {
                        if let Some((k, v)) = &current {
                            if let Some(callback) = self.on_fetch.as_mut() {
                                callback(k, v)?;
                            }
                        }
                    }
                    Op::Insert(value) => {
                        current = Some((run.key.clone(), value.clone()));
                        changed = true;
                    }
                    Op::Remove => {
                        changed |= current.is_some();
                        current = None;
                    }
                }

                a += 1;
            }

            if changed {
                local.modified = true;
            }
            if let Some((k, v)) = current {
                self.push_kv(file, local, k, v)?;
            }
        }

        while let Some((k, v)) = existing.get(e) {
            self.push_kv(file, local, k.clone(), v.clone())?;
            e += 1;
        }

        Ok(())
    }
}

/// Applies a sorted action stream to the tree at `root`, producing a new
/// root.
///
/// Only the paths touched by actions are rebuilt; untouched subtrees are
/// referenced as-is. Nodes are appended to end-of-file; nothing is durable
/// (and the previous root stays authoritative) until the caller commits a
/// header referencing the returned pointer.
pub fn modify_tree<'a>(
    file: &mut TreeFile,
    ops: &'a dyn TreeOps,
    root: Option<&NodePointer>,
    actions: &[ModifyAction],
    on_fetch: Option<FetchCallback<'a>>,
) -> crate::Result<Option<NodePointer>> {
    debug_assert!(
        actions
            .windows(2)
            .all(|w| ops.compare(&w[0].key, &w[1].key) != Ordering::Greater),
        "actions must be sorted by the tree comparator",
    );

    if actions.is_empty() {
        return Ok(root.cloned());
    }

    let mut engine = Engine::new(ops, FlushPolicy::default(), on_fetch);
    let mut collector = NodeBuilder::kp(false);

    if !engine.modify_node(file, root, actions, &mut collector)? {
        return Ok(root.cloned());
    }

    let NodeItems::Kp(pointers) = collector.items else {
        unreachable!("collector is a pointer builder");
    };

    engine.complete_root(file, pointers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{lookup::lookup, Lexicographic};
    use crate::file_ops::MemoryFileOps;
    use std::ops::ControlFlow;
    use test_log::test;

    fn memory_file() -> crate::Result<TreeFile> {
        TreeFile::new(Box::new(MemoryFileOps::new()))
    }

    fn inserts(range: std::ops::Range<u32>) -> Vec<ModifyAction> {
        range
            .map(|i| ModifyAction::insert(format!("key{i:06}").into(), format!("v{i}").into()))
            .collect()
    }

    fn collect_all(
        file: &TreeFile,
        root: &NodePointer,
    ) -> crate::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = vec![];
        crate::btree::lookup::fold(file, &Lexicographic, root, b"", &mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(out)
    }

    #[test]
    fn insert_into_empty_tree() -> crate::Result<()> {
        let mut file = memory_file()?;

        let root = modify_tree(&mut file, &Lexicographic, None, &inserts(0..10), None)?
            .expect("root should exist");

        assert_eq!(10, collect_all(&file, &root)?.len());
        Ok(())
    }

    #[test]
    fn large_batch_builds_multiple_levels() -> crate::Result<()> {
        let mut file = memory_file()?;

        let root = modify_tree(&mut file, &Lexicographic, None, &inserts(0..5_000), None)?
            .expect("root should exist");

        // 5000 * ~22 bytes per entry cannot fit a single node
        assert!(root.subtree_size > 5_000 * 16);

        let all = collect_all(&file, &root)?;
        assert_eq!(5_000, all.len());
        assert_eq!(b"key000000", &*all[0].0);
        assert_eq!(b"key004999", &*all[4_999].0);
        Ok(())
    }

    #[test]
    fn update_and_remove() -> crate::Result<()> {
        let mut file = memory_file()?;

        let root = modify_tree(&mut file, &Lexicographic, None, &inserts(0..100), None)?
            .expect("root should exist");

        let actions = vec![
            ModifyAction::insert("key000007".into(), "updated".into()),
            ModifyAction::remove("key000042".into()),
            ModifyAction::remove("no-such-key".into()),
        ];
        let root = modify_tree(&mut file, &Lexicographic, Some(&root), &actions, None)?
            .expect("root should exist");

        let all = collect_all(&file, &root)?;
        assert_eq!(99, all.len());
        assert!(all.iter().all(|(k, _)| k != b"key000042"));

        let mut updated = vec![];
        lookup(&file, &Lexicographic, &root, &[b"key000007"], &mut |_, v| {
            updated.push(v.to_vec());
            Ok(())
        })?;
        assert_eq!(vec![b"updated".to_vec()], updated);
        Ok(())
    }

    #[test]
    fn untouched_root_is_returned_as_is() -> crate::Result<()> {
        let mut file = memory_file()?;

        let root = modify_tree(&mut file, &Lexicographic, None, &inserts(0..100), None)?
            .expect("root should exist");

        // Fetches and removes of absent keys modify nothing
        let actions = vec![
            ModifyAction::fetch("key000001".into()),
            ModifyAction::remove("not-present".into()),
        ];

        let mut fetched = 0;
        let mut on_fetch = |_: &Slice, _: &Slice| {
            fetched += 1;
            Ok(())
        };

        let same = modify_tree(
            &mut file,
            &Lexicographic,
            Some(&root),
            &actions,
            Some(&mut on_fetch),
        )?
        .expect("root should exist");

        assert_eq!(1, fetched);
        assert_eq!(root.pointer, same.pointer);
        Ok(())
    }

    #[test]
    fn fetch_reports_value() -> crate::Result<()> {
        let mut file = memory_file()?;

        let root = modify_tree(&mut file, &Lexicographic, None, &inserts(0..10), None)?
            .expect("root should exist");

        let actions = vec![
            ModifyAction::fetch("key000003".into()),
            ModifyAction::insert("key000003".into(), "replacement".into()),
        ];

        let mut old_value = None;
        let mut on_fetch = |_: &Slice, v: &Slice| {
            old_value = Some(v.to_vec());
            Ok(())
        };

        modify_tree(
            &mut file,
            &Lexicographic,
            Some(&root),
            &actions,
            Some(&mut on_fetch),
        )?;

        assert_eq!(Some(b"v3".to_vec()), old_value);
        Ok(())
    }

    #[test]
    fn equal_keys_resolve_in_arrival_order() -> crate::Result<()> {
        let mut file = memory_file()?;

        let actions = vec![
            ModifyAction::insert("dup".into(), "first".into()),
            ModifyAction::insert("dup".into(), "second".into()),
            ModifyAction::insert("dup".into(), "third".into()),
        ];
        let root = modify_tree(&mut file, &Lexicographic, None, &actions, None)?
            .expect("root should exist");

        let all = collect_all(&file, &root)?;
        assert_eq!(1, all.len());
        assert_eq!(b"third", &*all[0].1);
        Ok(())
    }

    #[test]
    fn removing_everything_drops_the_root() -> crate::Result<()> {
        let mut file = memory_file()?;

        let root = modify_tree(&mut file, &Lexicographic, None, &inserts(0..20), None)?
            .expect("root should exist");

        let removes = (0..20)
            .map(|i| ModifyAction::remove(format!("key{i:06}").into()))
            .collect::<Vec<_>>();

        let root = modify_tree(&mut file, &Lexicographic, Some(&root), &removes, None)?;
        assert!(root.is_none());
        Ok(())
    }

    #[test]
    fn incremental_batches_accumulate() -> crate::Result<()> {
        let mut file = memory_file()?;
        let mut root = None;

        for batch in 0..10u32 {
            let actions = inserts(batch * 200..(batch + 1) * 200);
            root = modify_tree(&mut file, &Lexicographic, root.as_ref(), &actions, None)?;
        }

        let root = root.expect("root should exist");
        assert_eq!(2_000, collect_all(&file, &root)?.len());
        Ok(())
    }
}
