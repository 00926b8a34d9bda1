// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Offline compaction: copy-forward of all live data into a fresh file.
//!
//! The source is streamed in by-seq order; bodies are re-appended to the
//! target, the by-seq tree is bulk-built in stream order, and by-id
//! records are spilled to an external sort and bulk-built afterwards.
//! Orphaned nodes and bodies of the source are simply never copied.

use crate::{
    block,
    btree::{builder::TreeBuilder, lookup::fold},
    db::{
        doc::{decode_seq_key, decode_seq_value, encode_id_value, encode_seq_value, seq_key, DocInfo},
        header::{DiskVersion, Header},
        reducers::{IdTreeOps, LocalDocsOps, SeqTreeOps},
        Database,
    },
    file::TreeFile,
    file_ops::StdFileOps,
    tree_writer::TreeWriter,
};
use std::ops::ControlFlow;
use std::path::Path;

/// Per-document verdict of a compaction hook
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompactHookDecision {
    /// Copy the document into the target
    Keep,

    /// Drop the document; the target's purge counter advances past its
    /// sequence number
    Drop,
}

/// Flags and hooks steering a compaction
#[derive(Default)]
pub struct CompactOptions<'a> {
    /// Filter out deletion tombstones
    pub drop_deletes: bool,

    /// Write the target in the current disk version even if the source is
    /// older
    pub upgrade_version: bool,

    /// Consulted per document before copying
    pub hook: Option<&'a mut dyn FnMut(&DocInfo) -> CompactHookDecision>,

    /// May rewrite revision metadata in flight (format upgrades)
    pub docinfo_hook: Option<&'a mut dyn FnMut(&mut DocInfo)>,
}

/// Compacts `source` into a fresh file at `target_path`.
///
/// The source is never modified and stays readable throughout; its header
/// is pinned at the snapshot observed on entry. Any failure removes the
/// partial target file.
pub fn compact(
    source: &Database,
    target_path: &Path,
    options: CompactOptions<'_>,
) -> crate::Result<()> {
    let result = compact_inner(source, target_path, options);

    if result.is_err() {
        // The target is garbage; the source stays untouched
        if let Err(e) = std::fs::remove_file(target_path) {
            log::warn!("could not remove partial compaction target: {e}");
        }
    }

    result
}

fn compact_inner(
    source: &Database,
    target_path: &Path,
    mut options: CompactOptions<'_>,
) -> crate::Result<()> {
    let target_version = if options.upgrade_version {
        DiskVersion::CURRENT
    } else {
        source.disk_version()
    };

    let target_file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(target_path)
        .map_err(crate::Error::OpenFile)?;

    let mut target = TreeFile::new(Box::new(StdFileOps::from_file(target_file)))?;

    log::debug!(
        "compacting into {target_path:?} (version {target_version}, source update_seq {})",
        source.update_seq(),
    );

    // Reserve offset 0 with a bare data-block prefix so a zero body
    // pointer can never alias a real chunk. No header chunk is written
    // until the terminal commit below: a target abandoned by a crash must
    // never expose a valid-looking snapshot.
    target.append(&[block::BLOCK_DATA])?;

    let mut header = Header::empty(target_version);
    header.update_seq = source.update_seq();
    header.purge_seq = source.purge_seq();

    let mut max_purged_seq = 0u64;
    let mut copied = 0u64;

    let mut id_writer = TreeWriter::new(&IdTreeOps)?;
    let mut seq_builder = TreeBuilder::new(&SeqTreeOps);

    if let Some(root) = &source.header().by_seq_root {
        let low_key = seq_key(0);

        fold(
            source.tree_file(),
            &SeqTreeOps,
            root,
            &low_key,
            &mut |key, value| {
                let seq = decode_seq_key(key)?;
                let mut info = decode_seq_value(seq, value)?;

                if options.drop_deletes && info.deleted {
                    max_purged_seq = max_purged_seq.max(seq);
                    return Ok(ControlFlow::Continue(()));
                }

                if let Some(hook) = options.hook.as_mut() {
                    if hook(&info) == CompactHookDecision::Drop {
                        max_purged_seq = max_purged_seq.max(seq);
                        return Ok(ControlFlow::Continue(()));
                    }
                }

                if let Some(rewrite) = options.docinfo_hook.as_mut() {
                    rewrite(&mut info);
                }

                // Bodies move verbatim in their stored form; no
                // decompress/recompress cycle
                if info.body_pointer != 0 {
                    let (payload, compressed) =
                        block::read_chunk_raw(source.tree_file(), info.body_pointer)?;
                    let write = block::write_chunk_raw(&mut target, &payload, compressed)?;

                    info.body_pointer = write.offset;
                }

                seq_builder.push(
                    &mut target,
                    seq_key(info.db_seq),
                    encode_seq_value(&info)?.into(),
                )?;
                id_writer.add(&info.id, &encode_id_value(&info)?)?;

                copied += 1;
                Ok(ControlFlow::Continue(()))
            },
        )?;
    }

    header.by_seq_root = seq_builder.finish(&mut target)?;

    id_writer.sort()?;
    header.by_id_root = id_writer.write(&mut target)?;

    if let Some(root) = &source.header().local_docs_root {
        let mut local_builder = TreeBuilder::new(&LocalDocsOps);

        fold(source.tree_file(), &LocalDocsOps, root, b"", &mut |k, v| {
            local_builder.push(&mut target, k.clone(), v.clone())?;
            Ok(ControlFlow::Continue(()))
        })?;

        header.local_docs_root = local_builder.finish(&mut target)?;
    }

    header.purge_seq = header.purge_seq.max(max_purged_seq);

    target.sync()?;
    header.write_to(&mut target)?;
    target.sync()?;

    log::debug!("compaction done: {copied} documents copied, purge_seq {}", header.purge_seq);

    Ok(())
}
