use crate::errors::IpcError;
use crate::import::MappedRegion;
use crate::layout::{
    FRAME_ALIGN, FRAME_DATA_OFFSET, FRAME_TIMESTAMP_OFFSET, FrameHeader, HEADER_FRAME_COUNT_OFFSET,
    HEADER_FRAME_SIZE_OFFSET, HEADER_MAGIC_OFFSET, HEADER_SIZE, HEADER_WRITE_INDEX_OFFSET,
    frame_offset_offset, lock_offset,
};
use crate::paths::MAX_FRAMES;
use std::sync::atomic::{AtomicU32, Ordering};

/// Validated view of a shared frame buffer mapped from the camera server.
///
/// Header fields are read at fixed byte offsets. The write index and slot
/// lock words are `AtomicU32`s placed directly on the mapped memory, so CAS
/// on them is visible to the producer process.
pub struct SharedFrameBuffer {
    region: MappedRegion,
    frame_count: usize,
    frame_size: usize,
    offsets: [usize; MAX_FRAMES],
}

impl SharedFrameBuffer {
    /// Validate the header of a freshly mapped region. The header is trusted
    /// from here on; the producer only changes it together with a new
    /// buffer-announce.
    pub fn new(region: MappedRegion) -> Result<Self, IpcError> {
        let len = region.len();
        if len < HEADER_SIZE {
            return Err(IpcError::Map(format!(
                "region of {len} bytes cannot hold the {HEADER_SIZE} byte header"
            )));
        }

        let base = region.as_ptr();
        let read = |offset: usize| unsafe { (base.add(offset) as *const u32).read() } as usize;

        let frame_count = read(HEADER_FRAME_COUNT_OFFSET);
        let frame_size = read(HEADER_FRAME_SIZE_OFFSET);

        if frame_count > MAX_FRAMES {
            return Err(IpcError::Map(format!(
                "frame count {frame_count} exceeds {MAX_FRAMES}"
            )));
        }
        if frame_count > 0 && frame_size < FRAME_DATA_OFFSET {
            return Err(IpcError::Map(format!(
                "frame size {frame_size} smaller than the frame header"
            )));
        }

        let mut offsets = [0usize; MAX_FRAMES];
        for (slot, offset) in offsets.iter_mut().enumerate().take(frame_count) {
            let value = read(frame_offset_offset(slot));
            if value % FRAME_ALIGN != 0 {
                return Err(IpcError::Map(format!(
                    "slot {slot} offset {value} is not {FRAME_ALIGN}-byte aligned"
                )));
            }
            if value < HEADER_SIZE || value.saturating_add(frame_size) > len {
                return Err(IpcError::Map(format!(
                    "slot {slot} at {value}+{frame_size} falls outside the {len} byte region"
                )));
            }
            *offset = value;
        }

        let mut sorted = offsets[..frame_count].to_vec();
        sorted.sort_unstable();
        if sorted.windows(2).any(|pair| pair[1] - pair[0] < frame_size) {
            return Err(IpcError::Map("frame slots overlap".into()));
        }

        Ok(Self {
            region,
            frame_count,
            frame_size,
            offsets,
        })
    }

    pub fn magic(&self) -> [u8; 4] {
        let mut magic = [0u8; 4];
        let src = unsafe { self.bytes(HEADER_MAGIC_OFFSET, 4) };
        magic.copy_from_slice(src);
        magic
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Slot most recently published by the producer.
    #[inline]
    pub fn write_index(&self) -> u32 {
        self.word(HEADER_WRITE_INDEX_OFFSET).load(Ordering::Acquire)
    }

    #[cfg(any(test, feature = "frame-producer"))]
    pub(crate) fn write_index_word(&self) -> &AtomicU32 {
        self.word(HEADER_WRITE_INDEX_OFFSET)
    }

    /// Shared lock word of `slot`: 0 = free, 1 = held by someone.
    #[inline]
    pub fn lock_word(&self, slot: usize) -> &AtomicU32 {
        assert!(slot < MAX_FRAMES, "slot {slot} out of range");
        self.word(lock_offset(slot))
    }

    /// Read the metadata of `slot`. Only meaningful while the caller holds
    /// the slot's lock word.
    pub fn frame_header(&self, slot: usize) -> FrameHeader {
        let record = unsafe { self.bytes(self.record_offset(slot), FRAME_DATA_OFFSET) };
        FrameHeader::decode(record)
    }

    /// Pixel bytes of `slot`. Only meaningful while the caller holds the
    /// slot's lock word.
    pub fn frame_data(&self, slot: usize) -> &[u8] {
        let offset = self.record_offset(slot) + FRAME_DATA_OFFSET;
        unsafe { self.bytes(offset, self.frame_size - FRAME_DATA_OFFSET) }
    }

    /// Mark `slot` as holding no valid frame.
    pub fn clear_timestamp(&self, slot: usize) {
        let offset = self.record_offset(slot) + FRAME_TIMESTAMP_OFFSET;
        unsafe { (self.region.as_ptr().add(offset) as *mut u64).write_volatile(0) };
    }

    /// Mutable view of a whole frame record, for the producer side.
    ///
    /// # Safety
    /// The caller must hold the slot's lock word and no other reference to
    /// the record may be alive.
    #[cfg(feature = "frame-producer")]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn record_mut(&self, slot: usize) -> &mut [u8] {
        let offset = self.record_offset(slot);
        unsafe { std::slice::from_raw_parts_mut(self.region.as_ptr().add(offset), self.frame_size) }
    }

    fn record_offset(&self, slot: usize) -> usize {
        assert!(
            slot < self.frame_count,
            "slot {slot} out of range for {} frames",
            self.frame_count
        );
        self.offsets[slot]
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        // Page-aligned mapping plus a 4-byte aligned offset
        unsafe { &*(self.region.as_ptr().add(offset) as *const AtomicU32) }
    }

    unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.region.as_ptr().add(offset), len) }
    }
}

impl std::fmt::Debug for SharedFrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFrameBuffer")
            .field("len", &self.len())
            .field("frame_count", &self.frame_count)
            .field("frame_size", &self.frame_size)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::import::page_size;

    #[test]
    fn test_valid_ring_exposes_slots() {
        let buffer = ring(3, 256);
        assert_eq!(buffer.frame_count(), 3);
        assert_eq!(buffer.frame_size(), 256);
        assert_eq!(buffer.frame_data(2).len(), 256 - FRAME_DATA_OFFSET);

        write_frame(&buffer, 1, 777, 5);
        let header = buffer.frame_header(1);
        assert_eq!(header.timestamp, 777);
        assert_eq!(header.frame_id, 5);

        buffer.clear_timestamp(1);
        assert_eq!(buffer.frame_header(1).timestamp, 0);
        assert_eq!(buffer.frame_header(1).frame_id, 5, "Only the timestamp is cleared");
    }

    #[test]
    fn test_lock_words_are_shared_atomics() {
        let buffer = ring(2, 128);
        let word = buffer.lock_word(1);
        assert!(word.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_ok());
        assert_eq!(buffer.lock_word(1).load(Ordering::Acquire), 1);
        assert_eq!(buffer.lock_word(0).load(Ordering::Acquire), 0);

        publish(&buffer, 1);
        assert_eq!(buffer.write_index(), 1);
    }

    #[test]
    fn test_rejects_too_many_frames() {
        let result = buffer_with(page_size(), |bytes| {
            put_u32(bytes, HEADER_FRAME_COUNT_OFFSET, MAX_FRAMES as u32 + 1);
            put_u32(bytes, HEADER_FRAME_SIZE_OFFSET, 64);
        });
        assert!(matches!(result, Err(IpcError::Map(_))));
    }

    #[test]
    fn test_rejects_misaligned_offset() {
        let result = buffer_with(page_size(), |bytes| {
            put_u32(bytes, HEADER_FRAME_COUNT_OFFSET, 1);
            put_u32(bytes, HEADER_FRAME_SIZE_OFFSET, 128);
            put_u32(bytes, frame_offset_offset(0), HEADER_SIZE as u32 + 4);
        });
        assert!(matches!(result, Err(IpcError::Map(_))));
    }

    #[test]
    fn test_rejects_slot_past_end_of_region() {
        let size = page_size();
        let result = buffer_with(size, |bytes| {
            put_u32(bytes, HEADER_FRAME_COUNT_OFFSET, 1);
            put_u32(bytes, HEADER_FRAME_SIZE_OFFSET, 1024);
            put_u32(bytes, frame_offset_offset(0), (size - 512) as u32);
        });
        assert!(matches!(result, Err(IpcError::Map(_))));
    }

    #[test]
    fn test_rejects_overlapping_slots() {
        let result = buffer_with(page_size(), |bytes| {
            put_u32(bytes, HEADER_FRAME_COUNT_OFFSET, 2);
            put_u32(bytes, HEADER_FRAME_SIZE_OFFSET, 256);
            put_u32(bytes, frame_offset_offset(0), 64);
            put_u32(bytes, frame_offset_offset(1), 128);
        });
        assert!(matches!(result, Err(IpcError::Map(_))));
    }
}
