// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, append-only, crash-safe document store.
//!
//! A single file holds an unordered set of documents, indexed by a pair of
//! copy-on-write B+-trees: *by-id* (opaque byte-string keys, ordered) and
//! *by-seq* (a monotonically increasing update sequence, the change
//! stream), plus a small *local-docs* tree for unreplicated metadata.
//!
//! Writes only ever append: new tree nodes and document bodies go to the
//! end of the file, and a commit is one block-aligned header write plus a
//! durability barrier. Readers traverse the immutable snapshot under the
//! newest valid header, so a crash at any point simply falls back to the
//! previous commit. Space held by superseded nodes and bodies is
//! reclaimed by offline [compaction](compaction::compact), which streams
//! all live documents into a fresh file.
//!
//! # Example usage
//!
//! ```
//! use sediment::{Database, DocInfo, Document, OpenOptions, SaveOptions};
//! #
//! # let dir = tempfile::tempdir()?;
//! let path = dir.path().join("example.db");
//!
//! let mut db = Database::open(
//!     &path,
//!     OpenOptions {
//!         create: true,
//!         ..Default::default()
//!     },
//! )?;
//!
//! let doc = Document::new("greeting", "hello world");
//! let mut info = DocInfo::new("greeting", 1);
//! db.save_doc(&doc, &mut info, SaveOptions::default())?;
//!
//! // Nothing is durable until the commit
//! db.commit()?;
//!
//! assert_eq!(b"hello world", &*db.open_doc(b"greeting")?.body);
//! assert_eq!(1, info.db_seq);
//! #
//! # Ok::<(), sediment::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![warn(clippy::indexing_slicing)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::option_if_let_else)]

mod arena;
mod bitfield;
mod block;

pub mod btree;

mod checksum;

pub mod compaction;
mod compression;

mod db;
mod error;
mod file;
mod file_ops;
mod slice;
mod sort;
mod tree_writer;

pub use {
    arena::{Arena, ArenaPosition},
    block::BLOCK_SIZE,
    btree::{KvPair, NodePointer, TreeOps},
    checksum::Checksum,
    compaction::{CompactHookDecision, CompactOptions},
    compression::CompressionType,
    db::{
        doc::{
            DocInfo, Document, LocalDoc, DOC_INVALID_JSON, DOC_INVALID_JSON_KEY,
            DOC_IS_COMPRESSED, DOC_IS_JSON, DOC_NON_JSON, LOCAL_DOC_PREFIX,
        },
        header::DiskVersion,
        Database, OpenOptions, SaveOptions,
    },
    error::{Error, Result},
    file::TreeFile,
    file_ops::{FileOps, MemoryFileOps, StdFileOps},
    slice::Slice,
    tree_writer::TreeWriter,
};
