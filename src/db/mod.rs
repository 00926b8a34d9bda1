// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The database facade: documents, change stream, local docs, commit.

pub mod doc;
pub mod header;
pub(crate) mod reducers;

use crate::{
    bitfield::MAX_KEY_SIZE,
    block,
    btree::{
        lookup::{fold, lookup},
        modify::{modify_tree, ModifyAction},
    },
    compression::CompressionType,
    file::TreeFile,
    file_ops::{FileOps, StdFileOps},
    Slice,
};
use doc::{
    decode_id_value, decode_seq_key, decode_seq_value, encode_id_value, encode_seq_value, seq_key,
    DocInfo, Document, LocalDoc, DOC_IS_COMPRESSED, LOCAL_DOC_PREFIX,
};
use header::{DiskVersion, Header};
use reducers::{IdReduction, IdTreeOps, LocalDocsOps, SeqTreeOps};
use std::ops::ControlFlow;
use std::path::Path;

/// Flags for [`Database::open`]
#[derive(Copy, Clone, Debug, Default)]
pub struct OpenOptions {
    /// Create a new empty file if none exists
    pub create: bool,

    /// Open for reading only; writes fail with `InvalidArgument`
    pub read_only: bool,
}

/// Flags for [`Database::save_docs`]
#[derive(Copy, Clone, Debug, Default)]
pub struct SaveOptions {
    /// Compress document bodies whose `content_meta` carries the
    /// compressed flag
    pub compress_body: bool,
}

/// An open document store.
///
/// One handle is one snapshot plus (unless read-only) the single writer:
/// reads traverse the roots found at open time or produced by this
/// handle's own writes; nothing is durable until [`Database::commit`].
pub struct Database {
    file: TreeFile,
    header: Header,
    read_only: bool,
}

impl Database {
    /// Opens the document store at `path`.
    ///
    /// A missing file fails with `NoSuchFile` unless `create` is set; an
    /// existing file with no valid header fails with `NoHeader`.
    pub fn open(path: &Path, options: OpenOptions) -> crate::Result<Self> {
        let ops = StdFileOps::open(path, &options)?;
        let db = Self::open_with_ops(Box::new(ops), options)?;

        log::debug!(
            "opened {path:?}: update_seq={}, version={}",
            db.update_seq(),
            db.disk_version(),
        );

        Ok(db)
    }

    /// Opens a store over a custom block device.
    pub fn open_with_ops(ops: Box<dyn FileOps>, options: OpenOptions) -> crate::Result<Self> {
        let mut file = TreeFile::new(ops)?;

        let header = if file.pos() == 0 {
            if options.read_only || !options.create {
                return Err(crate::Error::NoHeader);
            }

            // Persist the empty header right away: block 0 is taken, so a
            // zero body pointer can never alias a real chunk, and the file
            // reopens cleanly even if nothing is ever saved
            let mut header = Header::empty(DiskVersion::CURRENT);
            header.position = header.write_to(&mut file)?;
            file.sync()?;
            header
        } else {
            Header::find_latest(&file)?
        };

        Ok(Self {
            file,
            header,
            read_only: options.read_only,
        })
    }

    /// Closes the store. Uncommitted appends are abandoned and become
    /// garbage for the next compaction.
    pub fn close(self) -> crate::Result<()> {
        Ok(())
    }

    /// Sequence number of the most recent update.
    #[must_use]
    pub fn update_seq(&self) -> u64 {
        self.header.update_seq
    }

    /// Highest sequence number ever purged by compaction.
    #[must_use]
    pub fn purge_seq(&self) -> u64 {
        self.header.purge_seq
    }

    /// On-disk format version of the file.
    #[must_use]
    pub fn disk_version(&self) -> DiskVersion {
        self.header.disk_version
    }

    /// Offset of the authoritative header.
    #[must_use]
    pub fn header_position(&self) -> u64 {
        self.header.position
    }

    /// Number of live (non-deleted) documents.
    pub fn doc_count(&self) -> crate::Result<u64> {
        Ok(self.id_reduction()?.count)
    }

    /// Number of deletion tombstones still in the index.
    pub fn deleted_doc_count(&self) -> crate::Result<u64> {
        Ok(self.id_reduction()?.deleted_count)
    }

    fn id_reduction(&self) -> crate::Result<IdReduction> {
        self.header.by_id_root.as_ref().map_or_else(
            || Ok(IdReduction::default()),
            |root| IdReduction::decode(&root.reduce_value),
        )
    }

    fn check_writable(&self) -> crate::Result<()> {
        if self.read_only {
            Err(crate::Error::InvalidArgument("handle is read-only"))
        } else {
            Ok(())
        }
    }

    /// Saves a batch of documents.
    ///
    /// `docs` and `infos` pair up index-by-index; the caller sets `id`,
    /// `rev_seq`, `rev_meta`, `deleted` and `content_meta`, and this call
    /// fills in `db_seq`, `body_pointer` and `body_size`. Sequence numbers
    /// are assigned in input order; duplicate ids within one batch resolve
    /// to the last write.
    ///
    /// To delete a document, pass its tombstone info with an empty body.
    pub fn save_docs(
        &mut self,
        docs: &[Document],
        infos: &mut [DocInfo],
        options: SaveOptions,
    ) -> crate::Result<()> {
        self.check_writable()?;

        if docs.len() != infos.len() {
            return Err(crate::Error::InvalidArgument(
                "docs and infos must have equal length",
            ));
        }
        if docs.is_empty() {
            return Ok(());
        }

        // Bodies first, to learn their offsets
        for (doc, info) in docs.iter().zip(infos.iter_mut()) {
            if doc.id.is_empty() || doc.id.len() > MAX_KEY_SIZE {
                return Err(crate::Error::InvalidArgument(
                    "document id length out of range",
                ));
            }
            info.id = doc.id.clone();

            if doc.body.is_empty() && info.deleted {
                info.body_pointer = 0;
                info.body_size = 0;
            } else {
                let compression =
                    if options.compress_body && info.content_meta & DOC_IS_COMPRESSED != 0 {
                        CompressionType::preferred()
                    } else {
                        CompressionType::None
                    };

                let write = block::write_chunk(&mut self.file, &doc.body, compression)?;
                info.body_pointer = write.offset;

                #[allow(clippy::cast_possible_truncation)]
                {
                    info.body_size = write.disk_size as u32;
                }
            }
        }

        let first_seq = self.header.update_seq;
        for (i, info) in infos.iter_mut().enumerate() {
            info.db_seq = first_seq + i as u64 + 1;
        }

        // Sort by id, stably, then keep only the last write per id
        let mut order = (0..infos.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| infos[a].id.cmp(&infos[b].id));

        let mut winners: Vec<usize> = Vec::with_capacity(order.len());
        for idx in order {
            if winners
                .last()
                .is_some_and(|&last| infos[last].id == infos[idx].id)
            {
                winners.pop();
            }
            winners.push(idx);
        }

        let mut id_actions = Vec::with_capacity(winners.len() * 2);
        for &idx in &winners {
            #[allow(clippy::indexing_slicing)]
            let info = &infos[idx];
            id_actions.push(ModifyAction::fetch(info.id.clone()));
            id_actions.push(ModifyAction::insert(
                info.id.clone(),
                encode_id_value(info)?.into(),
            ));
        }

        // The fetch leg reports documents that already exist; their old
        // sequence entries must leave by-seq in the same batch
        let mut removed_seqs = Vec::new();
        let mut on_fetch = |key: &Slice, value: &Slice| {
            let old = decode_id_value(key.clone(), value)?;
            removed_seqs.push(old.db_seq);
            Ok(())
        };

        let new_id_root = modify_tree(
            &mut self.file,
            &IdTreeOps,
            self.header.by_id_root.as_ref(),
            &id_actions,
            Some(&mut on_fetch),
        )?;
        self.header.by_id_root = new_id_root;

        let mut seq_actions = Vec::with_capacity(winners.len() + removed_seqs.len());
        for seq in removed_seqs {
            seq_actions.push(ModifyAction::remove(seq_key(seq)));
        }
        for &idx in &winners {
            #[allow(clippy::indexing_slicing)]
            let info = &infos[idx];
            seq_actions.push(ModifyAction::insert(
                seq_key(info.db_seq),
                encode_seq_value(info)?.into(),
            ));
        }
        seq_actions.sort_by(|a, b| a.key.cmp(&b.key));

        let new_seq_root = modify_tree(
            &mut self.file,
            &SeqTreeOps,
            self.header.by_seq_root.as_ref(),
            &seq_actions,
            None,
        )?;
        self.header.by_seq_root = new_seq_root;

        self.header.update_seq = first_seq + docs.len() as u64;

        log::trace!(
            "saved {} docs, update_seq now {}",
            docs.len(),
            self.header.update_seq,
        );

        Ok(())
    }

    /// Saves a single document. See [`Database::save_docs`].
    pub fn save_doc(
        &mut self,
        doc: &Document,
        info: &mut DocInfo,
        options: SaveOptions,
    ) -> crate::Result<()> {
        self.save_docs(
            std::slice::from_ref(doc),
            std::slice::from_mut(info),
            options,
        )
    }

    /// Retrieves a document body by id. Deleted and missing documents fail
    /// with `DocNotFound`.
    pub fn open_doc(&self, id: &[u8]) -> crate::Result<Document> {
        let info = self.docinfo_by_id(id)?;
        if info.deleted {
            return Err(crate::Error::DocNotFound);
        }
        self.open_doc_with_docinfo(&info)
    }

    /// Retrieves a document body through an already-fetched info.
    pub fn open_doc_with_docinfo(&self, info: &DocInfo) -> crate::Result<Document> {
        let body = if info.body_pointer == 0 {
            Slice::empty()
        } else {
            block::read_chunk(&self.file, info.body_pointer)?
        };

        Ok(Document {
            id: info.id.clone(),
            body,
        })
    }

    /// Looks up a document's index entry by id.
    pub fn docinfo_by_id(&self, id: &[u8]) -> crate::Result<DocInfo> {
        let root = self
            .header
            .by_id_root
            .as_ref()
            .ok_or(crate::Error::DocNotFound)?;

        let mut found = None;
        lookup(&self.file, &IdTreeOps, root, &[id], &mut |key, value| {
            found = Some(decode_id_value(key.clone(), value)?);
            Ok(())
        })?;

        found.ok_or(crate::Error::DocNotFound)
    }

    /// Looks up a document's index entry by sequence number.
    pub fn docinfo_by_sequence(&self, seq: u64) -> crate::Result<DocInfo> {
        let root = self
            .header
            .by_seq_root
            .as_ref()
            .ok_or(crate::Error::DocNotFound)?;

        let key = seq_key(seq);
        let mut found = None;
        lookup(&self.file, &SeqTreeOps, root, &[key.as_ref()], &mut |_, value| {
            found = Some(decode_seq_value(seq, value)?);
            Ok(())
        })?;

        found.ok_or(crate::Error::DocNotFound)
    }

    /// Streams every change after `since`, in sequence order, until
    /// end-of-stream or until the visitor breaks.
    pub fn changes_since(
        &self,
        since: u64,
        visit: &mut dyn FnMut(DocInfo) -> crate::Result<ControlFlow<()>>,
    ) -> crate::Result<()> {
        let Some(root) = &self.header.by_seq_root else {
            return Ok(());
        };

        let start = seq_key(since.saturating_add(1));
        fold(&self.file, &SeqTreeOps, root, &start, &mut |key, value| {
            let seq = decode_seq_key(key)?;
            visit(decode_seq_value(seq, value)?)
        })
    }

    /// Streams document infos in id order, starting at `start_id` (or the
    /// smallest id), tombstones included.
    pub fn all_docs(
        &self,
        start_id: Option<&[u8]>,
        visit: &mut dyn FnMut(DocInfo) -> crate::Result<ControlFlow<()>>,
    ) -> crate::Result<()> {
        let Some(root) = &self.header.by_id_root else {
            return Ok(());
        };

        let start = start_id.unwrap_or_default();
        fold(&self.file, &IdTreeOps, root, start, &mut |key, value| {
            visit(decode_id_value(key.clone(), value)?)
        })
    }

    /// Saves (or, with `deleted` set, removes) a local document. The id
    /// must carry the `_local/` prefix.
    pub fn save_local_doc(&mut self, doc: &LocalDoc) -> crate::Result<()> {
        self.check_writable()?;

        if !doc.id.starts_with(LOCAL_DOC_PREFIX) {
            return Err(crate::Error::InvalidArgument(
                "local doc id must start with _local/",
            ));
        }
        if doc.id.len() > MAX_KEY_SIZE {
            return Err(crate::Error::InvalidArgument(
                "document id length out of range",
            ));
        }

        let action = if doc.deleted {
            ModifyAction::remove(doc.id.clone())
        } else {
            ModifyAction::insert(doc.id.clone(), doc.body.clone())
        };

        let new_root = modify_tree(
            &mut self.file,
            &LocalDocsOps,
            self.header.local_docs_root.as_ref(),
            &[action],
            None,
        )?;
        self.header.local_docs_root = new_root;

        Ok(())
    }

    /// Retrieves a local document. The id must carry the `_local/` prefix.
    pub fn open_local_doc(&self, id: &[u8]) -> crate::Result<LocalDoc> {
        if !id.starts_with(LOCAL_DOC_PREFIX) {
            return Err(crate::Error::InvalidArgument(
                "local doc id must start with _local/",
            ));
        }

        let root = self
            .header
            .local_docs_root
            .as_ref()
            .ok_or(crate::Error::DocNotFound)?;

        let mut found = None;
        lookup(&self.file, &LocalDocsOps, root, &[id], &mut |key, value| {
            found = Some(LocalDoc {
                id: key.clone(),
                body: value.clone(),
                deleted: false,
            });
            Ok(())
        })?;

        found.ok_or(crate::Error::DocNotFound)
    }

    /// Makes all preceding writes durable: appended data is synced, a new
    /// header is written, and the file is synced again.
    ///
    /// Until this returns, readers opening the file see the previous
    /// snapshot; a failed commit leaves it authoritative.
    pub fn commit(&mut self) -> crate::Result<()> {
        self.check_writable()?;

        self.file.sync()?;
        let position = self.header.write_to(&mut self.file)?;
        self.file.sync()?;
        self.header.position = position;

        log::debug!("committed header at {position}");
        Ok(())
    }

    /// Compacts this store into a fresh file at `target_path`.
    ///
    /// See [`crate::compaction::compact`].
    pub fn compact_to(
        &self,
        target_path: &Path,
        options: crate::compaction::CompactOptions<'_>,
    ) -> crate::Result<()> {
        crate::compaction::compact(self, target_path, options)
    }

    pub(crate) fn tree_file(&self) -> &TreeFile {
        &self.file
    }

    pub(crate) fn header(&self) -> &Header {
        &self.header
    }
}
