use crate::errors::IpcError;
use crate::frame_buffer::SharedFrameBuffer;
use crate::import::{DmaBufImporter, MemoryImporter, page_size};
use crate::layout::{
    FRAME_ALIGN, FRAME_DATA_OFFSET, FrameHeader, HEADER_FRAME_COUNT_OFFSET,
    HEADER_FRAME_SIZE_OFFSET, HEADER_MAGIC_OFFSET, HEADER_SIZE, LOCK_FREE, LOCK_HELD, PixelFormat,
    frame_offset_offset,
};
use crate::paths::MAX_FRAMES;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::Ordering;

pub const PRODUCER_MAGIC: [u8; 4] = *b"CAMB";

/// Writes frames into a shared buffer the way the camera server does.
///
/// Lays out the header over a plain file, then publishes frames by locking
/// a free slot, filling it and advancing the write index. Clients map the
/// same file through the descriptor returned by [`FrameProducer::share_fd`].
pub struct FrameProducer {
    file: File,
    size: usize,
    buffer: SharedFrameBuffer,
    next_frame_id: u32,
}

impl FrameProducer {
    /// Size `file` and lay out `frame_count` contiguous records of
    /// `frame_size` bytes.
    pub fn format(file: File, frame_count: usize, frame_size: usize) -> Result<Self, IpcError> {
        if frame_count > MAX_FRAMES {
            return Err(IpcError::Map(format!(
                "frame count {frame_count} exceeds {MAX_FRAMES}"
            )));
        }
        if frame_size < FRAME_DATA_OFFSET || frame_size > u32::MAX as usize {
            return Err(IpcError::Map(format!("unusable frame size {frame_size}")));
        }

        let stride = frame_size.next_multiple_of(FRAME_ALIGN);
        let page = page_size();
        let size = (HEADER_SIZE + frame_count * stride).div_ceil(page) * page;
        file.set_len(size as u64)?;

        let region = DmaBufImporter.import(OwnedFd::from(file.try_clone()?), size)?;
        let bytes = unsafe { std::slice::from_raw_parts_mut(region.as_ptr(), region.len()) };
        bytes.fill(0);

        bytes[HEADER_MAGIC_OFFSET..HEADER_MAGIC_OFFSET + 4].copy_from_slice(&PRODUCER_MAGIC);
        put_u32(bytes, HEADER_FRAME_COUNT_OFFSET, frame_count as u32);
        put_u32(bytes, HEADER_FRAME_SIZE_OFFSET, frame_size as u32);
        for slot in 0..frame_count {
            put_u32(
                bytes,
                frame_offset_offset(slot),
                (HEADER_SIZE + slot * stride) as u32,
            );
        }

        let buffer = SharedFrameBuffer::new(region)?;
        tracing::debug!(size, frame_count, frame_size, "Formatted frame buffer");

        Ok(Self {
            file,
            size,
            buffer,
            next_frame_id: 1,
        })
    }

    /// Mapped size, as announced to clients.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn buffer(&self) -> &SharedFrameBuffer {
        &self.buffer
    }

    /// A fresh descriptor for the backing file, to send in a buffer-announce.
    pub fn share_fd(&self) -> io::Result<OwnedFd> {
        self.file.try_clone().map(OwnedFd::from)
    }

    /// Pixel bytes a single record can hold.
    pub fn capacity(&self) -> usize {
        self.buffer.frame_size() - FRAME_DATA_OFFSET
    }

    /// Publish one frame into the next slot no reader holds.
    ///
    /// Returns the assigned frame id, or `None` when every slot is locked.
    pub fn publish(
        &mut self,
        timestamp: u64,
        format: PixelFormat,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Option<u32>, IpcError> {
        if pixels.len() > self.capacity() {
            return Err(IpcError::PayloadTooLarge(pixels.len()));
        }

        let count = self.buffer.frame_count();
        if count == 0 {
            return Ok(None);
        }

        let start = self.buffer.write_index() as usize + 1;
        let Some(slot) = (0..count)
            .map(|i| (start + i) % count)
            .find(|&slot| self.try_lock(slot))
        else {
            return Ok(None);
        };

        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);

        let bits_per_pixel = bits_per_pixel(format);
        let header = FrameHeader {
            timestamp,
            frame_id,
            width,
            height,
            bytes_per_row: width * u32::from(bits_per_pixel) / 8,
            bits_per_pixel,
            format: format as u8,
        };

        // Slot lock is held, nobody else touches the record
        let record = unsafe { self.buffer.record_mut(slot) };
        header.encode(record);
        record[FRAME_DATA_OFFSET..FRAME_DATA_OFFSET + pixels.len()].copy_from_slice(pixels);

        self.buffer
            .lock_word(slot)
            .store(LOCK_FREE, Ordering::Release);
        self.buffer
            .write_index_word()
            .store(slot as u32, Ordering::Release);

        tracing::trace!(slot, frame_id, timestamp, "Published frame");
        Ok(Some(frame_id))
    }

    fn try_lock(&self, slot: usize) -> bool {
        self.buffer
            .lock_word(slot)
            .compare_exchange(LOCK_FREE, LOCK_HELD, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for FrameProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameProducer")
            .field("size", &self.size)
            .field("buffer", &self.buffer)
            .field("next_frame_id", &self.next_frame_id)
            .finish()
    }
}

fn bits_per_pixel(format: PixelFormat) -> u8 {
    match format {
        PixelFormat::BayerMipiBggr10 => 10,
        PixelFormat::Rgb888 => 24,
        PixelFormat::Yuv420sp => 12,
    }
}

fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}
