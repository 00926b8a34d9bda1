// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bump-region scratch allocator.
//!
//! The modify engine encodes nodes into arena space and rewinds to a mark
//! after every flush, so a whole tree rewrite reuses the same few chunks
//! instead of churning the global allocator.

/// Granularity of chunk sizes.
const PAGE_SIZE: usize = 4_096;

/// Chunk size used when none is given.
const DEFAULT_CHUNK_SIZE: usize = 32 * 1_024;

/// Alignment of [`Arena::alloc`] allocations.
const ALIGNMENT: usize = 8;

/// Saved position of an arena, used to discard allocations wholesale.
#[derive(Copy, Clone, Debug)]
pub struct ArenaPosition {
    chunk: usize,
    used: usize,
}

/// A bump-pointer region allocator with mark/rewind.
///
/// There is no per-allocation free; allocations made after a [`Arena::mark`]
/// are discarded together by [`Arena::rewind`].
pub struct Arena {
    chunks: Vec<Vec<u8>>,
    chunk_size: usize,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Arena {
    /// Creates a new arena.
    ///
    /// `chunk_size` is the size of the memory regions the arena sub-allocates;
    /// pass 0 for the default (32 KiB). Sizes are rounded up to a page
    /// multiple.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size.div_ceil(PAGE_SIZE) * PAGE_SIZE
        };

        Self {
            chunks: Vec::new(),
            chunk_size,
        }
    }

    /// Allocates a zeroed, word-aligned region.
    pub fn alloc(&mut self, size: usize) -> &mut [u8] {
        self.alloc_inner(size, true)
    }

    /// Allocates a zeroed region with no alignment padding.
    ///
    /// Saves a couple of bytes if the region does not need to be
    /// word-aligned.
    pub fn alloc_unaligned(&mut self, size: usize) -> &mut [u8] {
        self.alloc_inner(size, false)
    }

    /// Captures the current state of the arena.
    #[must_use]
    pub fn mark(&self) -> ArenaPosition {
        ArenaPosition {
            chunk: self.chunks.len().saturating_sub(1),
            used: self.chunks.last().map_or(0, Vec::len),
        }
    }

    /// Discards all allocations made since the corresponding [`Arena::mark`].
    ///
    /// The mark remains valid and can be used again.
    pub fn rewind(&mut self, position: ArenaPosition) {
        if self.chunks.is_empty() {
            return;
        }

        self.chunks.truncate(position.chunk + 1);

        if let Some(chunk) = self.chunks.get_mut(position.chunk) {
            chunk.truncate(position.used);
        }
    }

    /// Number of bytes currently allocated (excluding chunk slack).
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    fn alloc_inner(&mut self, size: usize, aligned: bool) -> &mut [u8] {
        let needs_chunk = match self.chunks.last() {
            Some(chunk) => {
                let used = if aligned {
                    chunk.len().div_ceil(ALIGNMENT) * ALIGNMENT
                } else {
                    chunk.len()
                };
                used + size > chunk.capacity()
            }
            None => true,
        };

        if needs_chunk {
            let capacity = self.chunk_size.max(size);
            self.chunks.push(Vec::with_capacity(capacity));
        }

        // A chunk was just pushed if none could fit the allocation
        #[allow(clippy::expect_used)]
        let chunk = self.chunks.last_mut().expect("chunk was just ensured");

        if aligned {
            let padded = chunk.len().div_ceil(ALIGNMENT) * ALIGNMENT;
            chunk.resize(padded, 0);
        }

        let start = chunk.len();
        chunk.resize(start + size, 0);

        #[allow(clippy::indexing_slicing)]
        let region = &mut chunk[start..start + size];
        region
    }
}
