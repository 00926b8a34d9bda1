// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    bitfield::{read_u48, write_u48},
    block,
    btree::{
        node::{decode_raw_pointer, encode_raw_pointer, raw_pointer_size},
        NodePointer,
    },
    file::TreeFile,
    Slice,
};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// On-disk format version
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiskVersion {
    /// Legacy version, readable
    V7,

    /// Legacy version, readable
    V8,

    /// Current version
    V9,
}

impl DiskVersion {
    /// The version new files are written in.
    pub const CURRENT: Self = Self::V9;
}

impl std::fmt::Display for DiskVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

impl From<DiskVersion> for u8 {
    fn from(value: DiskVersion) -> Self {
        match value {
            DiskVersion::V7 => 7,
            DiskVersion::V8 => 8,
            DiskVersion::V9 => 9,
        }
    }
}

impl TryFrom<u8> for DiskVersion {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            7 => Ok(Self::V7),
            8 => Ok(Self::V8),
            9 => Ok(Self::V9),
            _ => Err(()),
        }
    }
}

/// The database header: the root pointers of the three trees plus the
/// sequence counters.
///
/// Serialized on a 4 KiB boundary; the highest-offset valid header in the
/// file is authoritative.
#[derive(Clone, Debug)]
pub(crate) struct Header {
    pub disk_version: DiskVersion,
    pub update_seq: u64,
    pub purge_seq: u64,
    pub by_id_root: Option<NodePointer>,
    pub by_seq_root: Option<NodePointer>,
    pub local_docs_root: Option<NodePointer>,

    /// Offset this header was read from or written to
    pub position: u64,
}

impl Header {
    pub(crate) fn empty(disk_version: DiskVersion) -> Self {
        Self {
            disk_version,
            update_seq: 0,
            purge_seq: 0,
            by_id_root: None,
            by_seq_root: None,
            local_docs_root: None,
            position: 0,
        }
    }

    fn encode(&self) -> crate::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);

        out.write_u8(self.disk_version.into())?;
        write_u48(&mut out, self.update_seq)?;
        write_u48(&mut out, self.purge_seq)?;

        for root in [&self.by_id_root, &self.by_seq_root, &self.local_docs_root] {
            match root {
                Some(pointer) => {
                    #[allow(clippy::cast_possible_truncation)]
                    out.write_u16::<BigEndian>(raw_pointer_size(pointer) as u16)?;
                    encode_raw_pointer(&mut out, pointer)?;
                }
                None => out.write_u16::<BigEndian>(0)?,
            }
        }

        Ok(out)
    }

    fn decode(payload: &Slice, position: u64) -> crate::Result<Self> {
        if payload.len() < 13 {
            return Err(crate::Error::CorruptNode("truncated header"));
        }

        #[allow(clippy::indexing_slicing)]
        let version = payload[0];
        let disk_version =
            DiskVersion::try_from(version).map_err(|()| crate::Error::HeaderVersion(version))?;

        #[allow(clippy::indexing_slicing)]
        let mut counters = &payload[1..13];
        let update_seq = read_u48(&mut counters)?;
        let purge_seq = read_u48(&mut counters)?;

        let mut pos = 13usize;
        let mut roots: [Option<NodePointer>; 3] = [None, None, None];

        for root in &mut roots {
            if payload.len() < pos + 2 {
                return Err(crate::Error::CorruptNode("truncated header root"));
            }

            #[allow(clippy::indexing_slicing)]
            let len = usize::from(BigEndian::read_u16(&payload[pos..pos + 2]) & 0x0FFF);
            pos += 2;

            if len == 0 {
                continue;
            }
            if payload.len() < pos + len {
                return Err(crate::Error::CorruptNode("truncated header root"));
            }

            let record = payload.slice(pos..pos + len);
            pos += len;

            *root = Some(decode_raw_pointer(Slice::empty(), &record)?);
        }

        let [by_id_root, by_seq_root, local_docs_root] = roots;

        Ok(Self {
            disk_version,
            update_seq,
            purge_seq,
            by_id_root,
            by_seq_root,
            local_docs_root,
            position,
        })
    }

    /// A header may only reference nodes written before it.
    fn check_in_range(&self) -> crate::Result<()> {
        for root in [&self.by_id_root, &self.by_seq_root, &self.local_docs_root] {
            if let Some(pointer) = root {
                if pointer.pointer >= self.position {
                    return Err(crate::Error::CorruptNode("root points past its header"));
                }
            }
        }
        Ok(())
    }

    /// Appends this header at the next block boundary, returning its offset.
    pub(crate) fn write_to(&self, file: &mut TreeFile) -> crate::Result<u64> {
        block::write_header_chunk(file, &self.encode()?)
    }

    /// Scans backward from end-of-file for the newest valid header.
    ///
    /// A candidate block must carry the header prefix, decode with a valid
    /// CRC, a plausible version, and in-range root offsets; anything else
    /// continues the scan.
    pub(crate) fn find_latest(file: &TreeFile) -> crate::Result<Self> {
        if file.pos() == 0 {
            return Err(crate::Error::NoHeader);
        }

        let mut offset = (file.pos() - 1) / block::BLOCK_SIZE * block::BLOCK_SIZE;
        let mut version_error = None;

        loop {
            match Self::try_read_at(file, offset) {
                Ok(header) => {
                    log::trace!("found header at {offset}");
                    return Ok(header);
                }
                Err(e @ crate::Error::HeaderVersion(_)) => {
                    version_error.get_or_insert(e);
                }
                Err(_) => {}
            }

            if offset == 0 {
                return Err(version_error.unwrap_or(crate::Error::NoHeader));
            }
            offset -= block::BLOCK_SIZE;
        }
    }

    fn try_read_at(file: &TreeFile, offset: u64) -> crate::Result<Self> {
        if !block::is_header_block(file, offset)? {
            return Err(crate::Error::NoHeader);
        }

        let payload = block::read_header_chunk(file, offset)?;
        let header = Self::decode(&payload, offset)?;
        header.check_in_range()?;

        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_ops::MemoryFileOps;
    use test_log::test;

    fn memory_file() -> crate::Result<TreeFile> {
        TreeFile::new(Box::new(MemoryFileOps::new()))
    }

    #[test]
    fn header_roundtrip() -> crate::Result<()> {
        let mut file = memory_file()?;

        let mut header = Header::empty(DiskVersion::CURRENT);
        header.update_seq = 42;
        header.purge_seq = 7;

        let position = header.write_to(&mut file)?;
        assert_eq!(0, position);

        let found = Header::find_latest(&file)?;
        assert_eq!(DiskVersion::V9, found.disk_version);
        assert_eq!(42, found.update_seq);
        assert_eq!(7, found.purge_seq);
        assert!(found.by_id_root.is_none());
        Ok(())
    }

    #[test]
    fn header_with_roots_roundtrip() -> crate::Result<()> {
        let mut file = memory_file()?;

        // Reserve some space so root offsets stay below the header
        file.append(&[0u8; 100])?;

        let mut header = Header::empty(DiskVersion::CURRENT);
        header.update_seq = 1;
        header.by_id_root = Some(NodePointer {
            key: Slice::empty(),
            pointer: 10,
            subtree_size: 90,
            reduce_value: Slice::from([1, 2, 3]),
        });

        header.write_to(&mut file)?;

        let found = Header::find_latest(&file)?;
        let root = found.by_id_root.expect("root should exist");
        assert_eq!(10, root.pointer);
        assert_eq!(90, root.subtree_size);
        assert_eq!([1, 2, 3], *root.reduce_value);
        assert!(found.by_seq_root.is_none());
        assert!(found.local_docs_root.is_none());
        Ok(())
    }

    #[test]
    fn newest_header_wins() -> crate::Result<()> {
        let mut file = memory_file()?;

        let mut header = Header::empty(DiskVersion::CURRENT);
        header.update_seq = 1;
        header.write_to(&mut file)?;

        // Some data in between
        crate::block::write_chunk(
            &mut file,
            &[7u8; 10_000],
            crate::compression::CompressionType::None,
        )?;

        header.update_seq = 2;
        let second = header.write_to(&mut file)?;
        assert!(second > 0);

        let found = Header::find_latest(&file)?;
        assert_eq!(2, found.update_seq);
        assert_eq!(second, found.position);
        Ok(())
    }

    #[test]
    fn empty_file_has_no_header() -> crate::Result<()> {
        let file = memory_file()?;
        assert!(matches!(
            Header::find_latest(&file),
            Err(crate::Error::NoHeader)
        ));
        Ok(())
    }

    #[test]
    fn data_only_file_has_no_header() -> crate::Result<()> {
        let mut file = memory_file()?;
        crate::block::write_chunk(
            &mut file,
            &[1u8; 20_000],
            crate::compression::CompressionType::None,
        )?;

        assert!(matches!(
            Header::find_latest(&file),
            Err(crate::Error::NoHeader)
        ));
        Ok(())
    }

    #[test]
    fn unsupported_version_is_reported() -> crate::Result<()> {
        let mut file = memory_file()?;

        let mut header = Header::empty(DiskVersion::CURRENT);
        header.write_to(&mut file)?;

        // Bump the version byte and rewrite the whole image
        let mut raw = vec![0u8; usize::try_from(file.pos()).unwrap_or_default()];
        file.pread_exact(&mut raw, 0)?;
        raw[9] = 12; // version byte sits after prefix and chunk frame

        let patched = {
            // Re-checksum so only the version is implausible
            let payload_len = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]) as usize;
            let payload = &raw[9..9 + payload_len];
            let crc = crate::Checksum::from_bytes(payload).into_u32();
            raw[5..9].copy_from_slice(&crc.to_be_bytes());
            raw
        };

        let file = TreeFile::new(Box::new(MemoryFileOps::with_data(patched)))?;
        assert!(matches!(
            Header::find_latest(&file),
            Err(crate::Error::HeaderVersion(12))
        ));
        Ok(())
    }
}
