// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    btree::{builder::TreeBuilder, NodePointer, TreeOps},
    file::TreeFile,
    sort::{read_record, write_record, ExternalSorter, SortedStream, SpillRecord},
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom};
use std::path::Path;

enum State<'a> {
    /// Accepting items into an unsorted scratch file
    Adding(BufWriter<File>),

    /// Sorted and ready to write
    Sorted(SortedStream<'a>),
}

/// Builds a tree from key/value pairs arriving in any order.
///
/// Items are accumulated into a scratch file, externally sorted with the
/// tree comparator, then bulk-loaded bottom-up. Used for initial builds
/// and for rebuilding the by-id index during compaction.
pub struct TreeWriter<'a> {
    ops: &'a dyn TreeOps,
    state: State<'a>,
}

impl<'a> TreeWriter<'a> {
    /// Creates an empty writer backed by an anonymous temp file.
    pub fn new(ops: &'a dyn TreeOps) -> crate::Result<Self> {
        let scratch = tempfile::tempfile().map_err(crate::Error::OpenFile)?;

        Ok(Self {
            ops,
            state: State::Adding(BufWriter::new(scratch)),
        })
    }

    /// Opens a writer over an existing file of unsorted records in the
    /// scratch format.
    pub fn open_unsorted(ops: &'a dyn TreeOps, path: &Path) -> crate::Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(crate::Error::OpenFile)?;

        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            ops,
            state: State::Adding(BufWriter::new(file)),
        })
    }

    /// Adds a key/value pair. Items may arrive in any order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        match &mut self.state {
            State::Adding(writer) => {
                write_record(
                    writer,
                    &SpillRecord::new(key.to_vec(), value.to_vec()),
                )?;
                Ok(())
            }
            State::Sorted(_) => Err(crate::Error::InvalidArgument(
                "tree writer is already sorted",
            )),
        }
    }

    /// Sorts the accumulated items.
    pub fn sort(&mut self) -> crate::Result<()> {
        if matches!(self.state, State::Sorted(_)) {
            return Err(crate::Error::InvalidArgument(
                "tree writer is already sorted",
            ));
        }

        let state = std::mem::replace(&mut self.state, State::Sorted(SortedStream::empty(self.ops)));
        let State::Adding(writer) = state else {
            unreachable!("state was checked above");
        };

        // into_inner flushes the scratch buffer
        let mut scratch = writer
            .into_inner()
            .map_err(std::io::IntoInnerError::into_error)?;
        scratch.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(scratch);

        let mut sorter = ExternalSorter::new(self.ops, None, false);
        while let Some(record) = read_record(&mut reader, false)? {
            sorter.add(record)?;
        }

        self.state = State::Sorted(sorter.finish()?);
        Ok(())
    }

    /// Writes the sorted items into `file` as a tree, returning the root.
    ///
    /// Items must have been sorted with [`TreeWriter::sort`] first.
    pub fn write(&mut self, file: &mut TreeFile) -> crate::Result<Option<NodePointer>> {
        let State::Sorted(stream) = &mut self.state else {
            return Err(crate::Error::InvalidArgument(
                "tree writer must be sorted before writing",
            ));
        };

        let mut builder = TreeBuilder::new(self.ops);

        while let Some(record) = stream.next_record()? {
            builder.push(file, record.key.into(), record.value.into())?;
        }

        builder.finish(file)
    }
}
