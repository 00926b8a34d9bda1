// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! External sort for key/value streams larger than memory.
//!
//! Records are buffered up to a cap, sorted with the tree comparator and
//! spilled as sorted runs; runs are then merged with a bounded fan-in,
//! in waves if necessary. Scratch files are anonymous temp files, so they
//! vanish on both success and failure.

use crate::btree::TreeOps;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use interval_heap::IntervalHeap;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

/// Bytes of buffered records per in-memory sort run.
pub(crate) const RUN_CAPACITY: usize = 64 << 20;

/// Maximum number of runs merged in one pass.
pub(crate) const MERGE_FAN_IN: usize = 16;

/// Rule collapsing two records with equal keys; receives them in arrival
/// order and returns the survivor.
pub(crate) type DedupFn<'a> = &'a dyn Fn(SpillRecord, SpillRecord) -> SpillRecord;

/// Record in an external-sort scratch file:
/// `u32 total_len | [u8 op] | u16 key_len | key | value`, big-endian.
///
/// The length field counts everything that follows it. Operation streams
/// carry the leading op byte; plain key/value streams do not.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SpillRecord {
    pub op: Option<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl SpillRecord {
    pub(crate) fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            op: None,
            key,
            value,
        }
    }

    fn encoded_size(&self) -> usize {
        4 + usize::from(self.op.is_some()) + 2 + self.key.len() + self.value.len()
    }
}

pub(crate) fn write_record<W: Write>(
    writer: &mut W,
    record: &SpillRecord,
) -> std::io::Result<()> {
    let total = usize::from(record.op.is_some()) + 2 + record.key.len() + record.value.len();

    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32::<BigEndian>(total as u32)?;

    if let Some(op) = record.op {
        writer.write_u8(op)?;
    }

    #[allow(clippy::cast_possible_truncation)]
    writer.write_u16::<BigEndian>(record.key.len() as u16)?;
    writer.write_all(&record.key)?;
    writer.write_all(&record.value)?;

    Ok(())
}

/// Reads the next record, or `None` at a clean end of stream.
pub(crate) fn read_record<R: Read>(
    reader: &mut R,
    with_op: bool,
) -> crate::Result<Option<SpillRecord>> {
    let total = match reader.read_u32::<BigEndian>() {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let header = usize::from(with_op) + 2;
    if total < header {
        return Err(crate::Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "spill record too short",
        )));
    }

    let op = if with_op {
        Some(reader.read_u8()?)
    } else {
        None
    };

    let key_len = usize::from(reader.read_u16::<BigEndian>()?);
    if total < header + key_len {
        return Err(crate::Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "spill record key exceeds record",
        )));
    }

    let mut key = vec![0u8; key_len];
    reader.read_exact(&mut key)?;

    let mut value = vec![0u8; total - header - key_len];
    reader.read_exact(&mut value)?;

    Ok(Some(SpillRecord { op, key, value }))
}

struct HeapEntry<'a> {
    record: SpillRecord,
    source: usize,
    ops: &'a dyn TreeOps,
}

impl HeapEntry<'_> {
    fn order(&self, other: &Self) -> Ordering {
        self.ops
            .compare(&self.record.key, &other.record.key)
            .then(self.source.cmp(&other.source))
    }
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.order(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.order(other))
    }
}

impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order(other)
    }
}

/// Streaming, merged view over a set of sorted runs.
pub(crate) struct SortedStream<'a> {
    ops: &'a dyn TreeOps,
    dedup: Option<DedupFn<'a>>,
    with_op: bool,
    sources: Vec<BufReader<File>>,
    heap: IntervalHeap<HeapEntry<'a>>,
    initialized: bool,
}

impl<'a> SortedStream<'a> {
    /// A stream over nothing; yields no records.
    pub(crate) fn empty(ops: &'a dyn TreeOps) -> Self {
        Self {
            ops,
            dedup: None,
            with_op: false,
            sources: Vec::new(),
            heap: IntervalHeap::with_capacity(0),
            initialized: true,
        }
    }

    fn new(
        ops: &'a dyn TreeOps,
        dedup: Option<DedupFn<'a>>,
        with_op: bool,
        runs: Vec<File>,
    ) -> crate::Result<Self> {
        let mut sources = Vec::with_capacity(runs.len());
        for mut run in runs {
            run.seek(SeekFrom::Start(0))?;
            sources.push(BufReader::new(run));
        }

        Ok(Self {
            ops,
            dedup,
            with_op,
            heap: IntervalHeap::with_capacity(sources.len()),
            sources,
            initialized: false,
        })
    }

    fn refill(&mut self, source: usize) -> crate::Result<()> {
        let Some(reader) = self.sources.get_mut(source) else {
            return Ok(());
        };

        if let Some(record) = read_record(reader, self.with_op)? {
            self.heap.push(HeapEntry {
                record,
                source,
                ops: self.ops,
            });
        }

        Ok(())
    }

    /// Returns the next record in comparator order, with equal-key runs
    /// collapsed by the dedup rule (earliest arrival first).
    pub(crate) fn next_record(&mut self) -> crate::Result<Option<SpillRecord>> {
        if !self.initialized {
            for source in 0..self.sources.len() {
                self.refill(source)?;
            }
            self.initialized = true;
        }

        let Some(entry) = self.heap.pop_min() else {
            return Ok(None);
        };
        self.refill(entry.source)?;

        let mut current = entry.record;

        if let Some(dedup) = self.dedup {
            while let Some(next) = self.heap.pop_min() {
                if self.ops.compare(&next.record.key, &current.key) == Ordering::Equal {
                    self.refill(next.source)?;
                    current = dedup(current, next.record);
                } else {
                    self.heap.push(next);
                    break;
                }
            }
        }

        Ok(Some(current))
    }
}

/// Two-phase external sorter: buffered run sorting, then k-way merging.
pub(crate) struct ExternalSorter<'a> {
    ops: &'a dyn TreeOps,
    dedup: Option<DedupFn<'a>>,
    with_op: bool,
    run_capacity: usize,
    buffer: Vec<SpillRecord>,
    buffered_bytes: usize,
    runs: Vec<File>,
}

impl<'a> ExternalSorter<'a> {
    pub(crate) fn new(ops: &'a dyn TreeOps, dedup: Option<DedupFn<'a>>, with_op: bool) -> Self {
        Self::with_run_capacity(ops, dedup, with_op, RUN_CAPACITY)
    }

    pub(crate) fn with_run_capacity(
        ops: &'a dyn TreeOps,
        dedup: Option<DedupFn<'a>>,
        with_op: bool,
        run_capacity: usize,
    ) -> Self {
        Self {
            ops,
            dedup,
            with_op,
            run_capacity,
            buffer: Vec::new(),
            buffered_bytes: 0,
            runs: Vec::new(),
        }
    }

    /// Adds a record, spilling a sorted run when the buffer cap is hit.
    pub(crate) fn add(&mut self, record: SpillRecord) -> crate::Result<()> {
        self.buffered_bytes += record.encoded_size();
        self.buffer.push(record);

        if self.buffered_bytes >= self.run_capacity {
            self.spill_run()?;
        }

        Ok(())
    }

    fn spill_run(&mut self) -> crate::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        // Stable sort keeps arrival order for equal keys
        let ops = self.ops;
        self.buffer.sort_by(|a, b| ops.compare(&a.key, &b.key));

        let mut writer = BufWriter::new(tempfile::tempfile().map_err(crate::Error::OpenFile)?);
        for record in self.buffer.drain(..) {
            write_record(&mut writer, &record)?;
        }

        let file = writer
            .into_inner()
            .map_err(std::io::IntoInnerError::into_error)?;

        log::trace!("spilled sort run #{}", self.runs.len());

        self.runs.push(file);
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Sorts whatever is buffered and returns the merged stream.
    ///
    /// If more than [`MERGE_FAN_IN`] runs exist, they are merged in waves
    /// until the final merge fits the fan-in.
    pub(crate) fn finish(mut self) -> crate::Result<SortedStream<'a>> {
        self.spill_run()?;

        while self.runs.len() > MERGE_FAN_IN {
            let wave = self.runs.drain(..MERGE_FAN_IN).collect::<Vec<_>>();
            log::trace!("merging wave of {} runs", wave.len());

            let mut stream = SortedStream::new(self.ops, self.dedup, self.with_op, wave)?;
            let mut writer = BufWriter::new(tempfile::tempfile().map_err(crate::Error::OpenFile)?);

            while let Some(record) = stream.next_record()? {
                write_record(&mut writer, &record)?;
            }

            let merged = writer
                .into_inner()
                .map_err(std::io::IntoInnerError::into_error)?;

            // The wave output holds the oldest records; it must stay ahead
            // of later runs so equal keys keep their arrival order
            self.runs.insert(0, merged);
        }

        SortedStream::new(self.ops, self.dedup, self.with_op, std::mem::take(&mut self.runs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::Lexicographic;
    use rand::seq::SliceRandom;
    use std::io::Cursor;
    use test_log::test;

    #[test]
    fn record_raw() -> crate::Result<()> {
        let record = SpillRecord::new(b"key".to_vec(), b"value".to_vec());

        let mut buf = vec![];
        write_record(&mut buf, &record)?;

        #[rustfmt::skip]
        let expected = [
            // Total length: 2 + 3 + 5
            0, 0, 0, 10,

            // Key length
            0, 3,

            // Key
            b'k', b'e', b'y',

            // Value
            b'v', b'a', b'l', b'u', b'e',
        ];
        assert_eq!(expected, *buf);

        let decoded = read_record(&mut Cursor::new(buf), false)?.expect("record should parse");
        assert_eq!(record, decoded);
        Ok(())
    }

    #[test]
    fn record_with_op_raw() -> crate::Result<()> {
        let record = SpillRecord {
            op: Some(1),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };

        let mut buf = vec![];
        write_record(&mut buf, &record)?;

        #[rustfmt::skip]
        let expected = [
            // Total length: 1 + 2 + 1 + 1
            0, 0, 0, 5,

            // Op
            1,

            // Key length
            0, 1,

            b'k', b'v',
        ];
        assert_eq!(expected, *buf);

        let decoded = read_record(&mut Cursor::new(buf), true)?.expect("record should parse");
        assert_eq!(record, decoded);
        Ok(())
    }

    #[test]
    fn record_eof_is_clean() -> crate::Result<()> {
        assert_eq!(None, read_record(&mut Cursor::new(vec![]), false)?);
        Ok(())
    }

    #[test]
    fn sorts_shuffled_input() -> crate::Result<()> {
        let mut keys = (0..5_000u32).collect::<Vec<_>>();
        keys.shuffle(&mut rand::rng());

        // Tiny run capacity forces many runs and at least one merge wave
        let mut sorter = ExternalSorter::with_run_capacity(&Lexicographic, None, false, 4_096);
        for key in &keys {
            sorter.add(SpillRecord::new(
                key.to_be_bytes().to_vec(),
                format!("v{key}").into_bytes(),
            ))?;
        }

        let mut stream = sorter.finish()?;
        let mut expected = 0u32;
        while let Some(record) = stream.next_record()? {
            assert_eq!(expected.to_be_bytes().to_vec(), record.key);
            assert_eq!(format!("v{expected}").into_bytes(), record.value);
            expected += 1;
        }
        assert_eq!(5_000, expected);
        Ok(())
    }

    #[test]
    fn dedup_latest_op_wins() -> crate::Result<()> {
        let latest_wins: DedupFn<'_> = &|_, later| later;

        let mut sorter =
            ExternalSorter::with_run_capacity(&Lexicographic, Some(latest_wins), true, 64);

        for (i, key) in [b"b", b"a", b"b", b"c", b"b"].iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            sorter.add(SpillRecord {
                op: Some(i as u8),
                key: key.to_vec(),
                value: vec![],
            })?;
        }

        let mut stream = sorter.finish()?;
        let mut out = vec![];
        while let Some(record) = stream.next_record()? {
            out.push((record.key, record.op));
        }

        // One survivor per key; for "b" the latest op (4) wins
        assert_eq!(
            vec![
                (b"a".to_vec(), Some(1)),
                (b"b".to_vec(), Some(4)),
                (b"c".to_vec(), Some(3)),
            ],
            out
        );
        Ok(())
    }

    #[test]
    fn empty_sorter_yields_nothing() -> crate::Result<()> {
        let sorter = ExternalSorter::new(&Lexicographic, None, false);
        let mut stream = sorter.finish()?;
        assert!(stream.next_record()?.is_none());
        Ok(())
    }
}
