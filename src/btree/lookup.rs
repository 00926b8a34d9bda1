// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    node::{decode_node, Node},
    KvPair, NodePointer, TreeOps,
};
use crate::{block, file::TreeFile, Slice};
use std::cmp::Ordering;
use std::ops::ControlFlow;

/// Visitor invoked with every key/value hit; the value reference is only
/// valid for the duration of the call.
pub type Visitor<'a> = &'a mut dyn FnMut(&Slice, &Slice) -> crate::Result<ControlFlow<()>>;

struct Walk<'a> {
    file: &'a TreeFile,
    ops: &'a dyn TreeOps,

    /// Lookup keys, in comparator order
    keys: &'a [&'a [u8]],
    idx: usize,

    fold: bool,
    in_fold: bool,
    stopped: bool,

    visit: Visitor<'a>,
}

/// Looks up a sorted set of keys in the tree at `root`.
///
/// `on_hit` is invoked in comparator order for every key found; missing
/// keys are silent.
pub fn lookup(
    file: &TreeFile,
    ops: &dyn TreeOps,
    root: &NodePointer,
    keys: &[&[u8]],
    on_hit: &mut dyn FnMut(&Slice, &Slice) -> crate::Result<()>,
) -> crate::Result<()> {
    debug_assert!(
        keys.windows(2)
            .all(|w| ops.compare(w[0], w[1]) != Ordering::Greater),
        "lookup keys must be sorted",
    );

    let mut visit = |key: &Slice, value: &Slice| {
        on_hit(key, value)?;
        Ok(ControlFlow::Continue(()))
    };

    let mut walk = Walk {
        file,
        ops,
        keys,
        idx: 0,
        fold: false,
        in_fold: false,
        stopped: false,
        visit: &mut visit,
    };

    walk.node(root.pointer)
}

/// Streams all entries with key `>= start_key` in comparator order, until
/// end-of-tree or until the visitor breaks.
pub fn fold(
    file: &TreeFile,
    ops: &dyn TreeOps,
    root: &NodePointer,
    start_key: &[u8],
    visit: Visitor<'_>,
) -> crate::Result<()> {
    let keys = [start_key];

    let mut walk = Walk {
        file,
        ops,
        keys: &keys,
        idx: 0,
        fold: true,
        in_fold: false,
        stopped: false,
        visit,
    };

    walk.node(root.pointer)
}

impl Walk<'_> {
    fn node(&mut self, offset: u64) -> crate::Result<()> {
        let chunk = block::read_chunk(self.file, offset)?;

        match decode_node(&chunk)? {
            Node::Kp(pointers) => self.descend(&pointers),
            Node::Kv(items) => {
                if self.fold {
                    self.scan_from_bound(&items)
                } else {
                    self.match_keys(&items)
                }
            }
        }
    }

    fn descend(&mut self, pointers: &[NodePointer]) -> crate::Result<()> {
        let mut child = 0;

        while !self.stopped && child < pointers.len() {
            if self.in_fold {
                #[allow(clippy::indexing_slicing)]
                self.node(pointers[child].pointer)?;
                child += 1;
                continue;
            }

            let Some(&key) = self.keys.get(self.idx) else {
                break;
            };

            // First child whose pointer key is >= the lookup key covers it
            #[allow(clippy::indexing_slicing)]
            let skip = pointers[child..]
                .partition_point(|p| self.ops.compare(&p.key, key) == Ordering::Less);
            child += skip;

            let Some(pointer) = pointers.get(child) else {
                // Key beyond the largest key of this subtree: silent miss
                break;
            };

            self.node(pointer.pointer)?;
            child += 1;
        }

        Ok(())
    }

    /// Point lookups: advance a cursor through the leaf, matching keys.
    fn match_keys(&mut self, items: &[KvPair]) -> crate::Result<()> {
        let mut item = 0;

        while !self.stopped && item < items.len() {
            let Some(&key) = self.keys.get(self.idx) else {
                break;
            };

            #[allow(clippy::indexing_slicing)]
            let (k, v) = &items[item];

            match self.ops.compare(key, k) {
                Ordering::Greater => item += 1,
                Ordering::Less => self.idx += 1,
                Ordering::Equal => {
                    if (self.visit)(k, v)?.is_break() {
                        self.stopped = true;
                    }
                    self.idx += 1;
                }
            }
        }

        Ok(())
    }

    /// Fold: emit every entry from the lower bound onward.
    fn scan_from_bound(&mut self, items: &[KvPair]) -> crate::Result<()> {
        let start = if self.in_fold {
            0
        } else {
            let Some(&bound) = self.keys.first() else {
                return Ok(());
            };
            items.partition_point(|(k, _)| self.ops.compare(k, bound) == Ordering::Less)
        };

        self.in_fold = true;

        #[allow(clippy::indexing_slicing)]
        for (k, v) in &items[start..] {
            if (self.visit)(k, v)?.is_break() {
                self.stopped = true;
                break;
            }
        }

        Ok(())
    }
}
