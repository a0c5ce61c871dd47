use std::convert::TryInto;

use crate::error::{Result, SelvaError};
use crate::pager::PAGE_CHECKSUM_SIZE;
use crate::record::slot::{RecordHeader, RecordKind, RECORD_HEADER_SIZE};

/// Bytes reserved at the front of every record page.
pub const PAGE_HEADER_SIZE: usize = 16;
/// Bytes a slot directory entry occupies.
pub const SLOT_ENTRY_SIZE: usize = 2;

const RECORD_COUNT_OFFSET: usize = 0;
const FREE_SPACE_OFFSET_OFFSET: usize = 2;

/// Mutable slotted-page view over a raw page buffer.
///
/// Layout: 16-byte header, slot directory of u16 record offsets growing
/// up, record heap growing down from the checksum footer. Records are
/// 8-byte aligned.
#[derive(Debug)]
pub struct RecordPage<'a> {
    data: &'a mut [u8],
}

impl<'a> RecordPage<'a> {
    /// Wraps a raw page buffer.
    pub fn from_bytes(data: &'a mut [u8]) -> Result<Self> {
        if data.len() < PAGE_CHECKSUM_SIZE {
            return Err(SelvaError::Corruption(
                "page smaller than checksum metadata region".into(),
            ));
        }
        let payload_len = data.len() - PAGE_CHECKSUM_SIZE;
        if payload_len < PAGE_HEADER_SIZE {
            return Err(SelvaError::Corruption(
                "page smaller than header size".into(),
            ));
        }
        Ok(Self { data })
    }

    fn payload_limit(&self) -> usize {
        self.data.len() - PAGE_CHECKSUM_SIZE
    }

    /// Sets up the free-space offset on a page whose header is still zeroed.
    pub fn initialize(&mut self) -> Result<()> {
        if self.record_count()? == 0 && self.free_space_offset()? == 0 {
            let limit = self.payload_limit();
            self.set_free_space_offset(limit as u16)?;
        }
        Ok(())
    }

    /// Returns the number of directory slots, live or free.
    pub fn record_count(&self) -> Result<u16> {
        self.read_u16_at(RECORD_COUNT_OFFSET)
    }

    fn set_record_count(&mut self, value: u16) {
        self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 2]
            .copy_from_slice(&value.to_le_bytes());
    }

    /// Returns the offset where the record heap currently starts.
    pub fn free_space_offset(&self) -> Result<u16> {
        self.read_u16_at(FREE_SPACE_OFFSET_OFFSET)
    }

    fn set_free_space_offset(&mut self, value: u16) -> Result<()> {
        if value as usize > self.payload_limit() {
            return Err(SelvaError::InvalidArgument(
                "free space offset beyond page size".into(),
            ));
        }
        self.data[FREE_SPACE_OFFSET_OFFSET..FREE_SPACE_OFFSET_OFFSET + 2]
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn directory_start() -> usize {
        PAGE_HEADER_SIZE
    }

    fn directory_end(&self) -> Result<usize> {
        Ok(Self::directory_start() + self.record_count()? as usize * SLOT_ENTRY_SIZE)
    }

    /// Bytes still available between the slot directory and the heap.
    pub fn available_space(&self) -> Result<usize> {
        let free_offset = self.free_space_offset()? as usize;
        let dir_end = self.directory_end()?;
        if free_offset < dir_end {
            return Err(SelvaError::Corruption(
                "free space offset precedes directory".into(),
            ));
        }
        if free_offset > self.payload_limit() {
            return Err(SelvaError::Corruption(
                "free space offset beyond payload region".into(),
            ));
        }
        Ok(free_offset - dir_end)
    }

    /// Returns the heap offset of the record in `index`.
    pub fn record_offset(&self, index: usize) -> Result<u16> {
        let count = self.record_count()? as usize;
        if index >= count {
            return Err(SelvaError::InvalidArgument(
                "record index out of bounds".into(),
            ));
        }
        self.read_u16_at(Self::directory_start() + index * SLOT_ENTRY_SIZE)
    }

    fn set_record_offset(&mut self, index: usize, offset: u16) -> Result<()> {
        let dir_pos = Self::directory_start() + index * SLOT_ENTRY_SIZE;
        if dir_pos + SLOT_ENTRY_SIZE > self.payload_limit() {
            return Err(SelvaError::InvalidArgument(
                "directory position outside page".into(),
            ));
        }
        self.data[dir_pos..dir_pos + SLOT_ENTRY_SIZE].copy_from_slice(&offset.to_le_bytes());
        Ok(())
    }

    /// True when a record of `record_len` encoded bytes fits.
    pub fn can_fit(&self, record_len: usize) -> Result<bool> {
        Ok(self.available_space()? >= required_space(record_len))
    }

    /// Appends an encoded record, returning its slot index.
    pub fn append_record(&mut self, record: &[u8]) -> Result<u16> {
        let padded_len = align_to_eight(record.len());
        if self.available_space()? < required_space(record.len()) {
            return Err(SelvaError::InvalidArgument(
                "insufficient space for record".into(),
            ));
        }

        let free_offset = self.free_space_offset()? as usize;
        let new_offset = free_offset - padded_len;
        self.data[new_offset..new_offset + record.len()].copy_from_slice(record);
        if padded_len > record.len() {
            self.data[new_offset + record.len()..free_offset].fill(0);
        }

        let record_idx = self.record_count()? as usize;
        if record_idx >= u16::MAX as usize {
            return Err(SelvaError::InvalidArgument(
                "record count would overflow u16".into(),
            ));
        }
        self.set_record_count((record_idx + 1) as u16);
        self.set_record_offset(record_idx, new_offset as u16)?;
        self.set_free_space_offset(new_offset as u16)?;
        Ok(record_idx as u16)
    }

    /// Returns the full encoded record (header included) in `index`.
    pub fn record_slice(&self, index: usize) -> Result<&[u8]> {
        let offset = self.record_offset(index)? as usize;
        let (start, end) = self.record_bounds(offset)?;
        let header = RecordHeader::from_bytes(&self.data[start..start + RECORD_HEADER_SIZE])?;
        let record_len = RECORD_HEADER_SIZE + header.payload_length as usize;
        debug_assert!(start + record_len <= end);
        Ok(&self.data[start..start + record_len])
    }

    /// Writes `record` into a free slot whose capacity suffices.
    ///
    /// Returns `false` when the slot is live or too small.
    pub fn try_reuse_slot(&mut self, index: usize, record: &[u8]) -> Result<bool> {
        if record.len() <= RECORD_HEADER_SIZE {
            return Err(SelvaError::InvalidArgument(
                "record payload cannot be empty".into(),
            ));
        }
        if self.record_header_at(index)?.kind != RecordKind::Free {
            return Ok(false);
        }
        self.overwrite_slot(index, record)
    }

    /// Overwrites a live slot in place when the new record fits its footprint.
    pub fn try_update_slot(&mut self, index: usize, record: &[u8]) -> Result<bool> {
        if record.len() <= RECORD_HEADER_SIZE {
            return Err(SelvaError::InvalidArgument(
                "record payload cannot be empty".into(),
            ));
        }
        self.overwrite_slot(index, record)
    }

    fn overwrite_slot(&mut self, index: usize, record: &[u8]) -> Result<bool> {
        let offset = self.record_offset(index)? as usize;
        let (start, end) = self.record_bounds(offset)?;
        let capacity = end - start;
        let needed = align_to_eight(record.len());
        if needed > capacity {
            return Ok(false);
        }
        self.data[start..start + record.len()].copy_from_slice(record);
        if capacity > record.len() {
            self.data[start + record.len()..end].fill(0);
        }
        Ok(true)
    }

    /// Marks the slot in `index` as free, zeroing its payload.
    pub fn mark_slot_free(&mut self, index: usize) -> Result<()> {
        let offset = self.record_offset(index)? as usize;
        let (start, end) = self.record_bounds(offset)?;
        if self.record_header_at(index)?.kind == RecordKind::Free {
            return Ok(());
        }
        let capacity = end - start;
        if capacity < RECORD_HEADER_SIZE {
            return Err(SelvaError::Corruption(
                "record slot smaller than header".into(),
            ));
        }
        let free_payload = capacity - RECORD_HEADER_SIZE;
        let free_header = RecordHeader::new(RecordKind::Free, free_payload as u32);
        free_header.write_to(&mut self.data[start..start + RECORD_HEADER_SIZE])?;
        self.data[start + RECORD_HEADER_SIZE..end].fill(0);
        Ok(())
    }

    /// Counts slots whose kind is not [`RecordKind::Free`].
    pub fn live_record_count(&self) -> Result<usize> {
        let count = self.record_count()? as usize;
        let mut live = 0;
        for idx in 0..count {
            if self.record_header_at(idx)?.kind != RecordKind::Free {
                live += 1;
            }
        }
        Ok(live)
    }

    /// Decodes the record header of the slot in `index`.
    pub fn record_header_at(&self, index: usize) -> Result<RecordHeader> {
        let offset = self.record_offset(index)? as usize;
        if offset + RECORD_HEADER_SIZE > self.payload_limit() {
            return Err(SelvaError::Corruption(
                "record header extends beyond page".into(),
            ));
        }
        RecordHeader::from_bytes(&self.data[offset..offset + RECORD_HEADER_SIZE])
    }

    fn record_bounds(&self, offset: usize) -> Result<(usize, usize)> {
        let limit = self.payload_limit();
        if offset >= limit || offset + RECORD_HEADER_SIZE > limit {
            return Err(SelvaError::Corruption("record offset outside page".into()));
        }
        let header = RecordHeader::from_bytes(&self.data[offset..offset + RECORD_HEADER_SIZE])?;
        let record_len = RECORD_HEADER_SIZE + header.payload_length as usize;
        let end = offset + align_to_eight(record_len);
        if end > limit {
            return Err(SelvaError::Corruption(
                "record extends past end of page".into(),
            ));
        }
        Ok((offset, end))
    }

    fn read_u16_at(&self, offset: usize) -> Result<u16> {
        let end = offset + 2;
        if end > self.payload_limit() {
            return Err(SelvaError::Corruption(
                "record page short read for u16".into(),
            ));
        }
        let bytes: [u8; 2] = self.data[offset..end]
            .try_into()
            .map_err(|_| SelvaError::Corruption("failed to read u16 from record page".into()))?;
        Ok(u16::from_le_bytes(bytes))
    }
}

/// Rounds a length up to the next 8-byte boundary.
pub fn align_to_eight(value: usize) -> usize {
    let remainder = value % 8;
    if remainder == 0 {
        value
    } else {
        value + (8 - remainder)
    }
}

/// Total page bytes consumed by an encoded record of `record_len` bytes.
pub fn required_space(record_len: usize) -> usize {
    align_to_eight(record_len) + SLOT_ENTRY_SIZE
}

/// Largest encoded record a fresh page of `page_size` bytes can host.
pub fn max_record_len(page_size: usize) -> usize {
    let usable = page_size - PAGE_CHECKSUM_SIZE - PAGE_HEADER_SIZE - SLOT_ENTRY_SIZE;
    // Alignment can round the record up to the next boundary; stay under it.
    usable - usable % 8
}
