//! SHARED BUFFER LAYOUT
//!
//! The camera server allocates one region and carves it into a header
//! followed by `frame_count` fixed-size frame records. Every field lives at
//! a fixed byte offset; nothing here relies on Rust struct layout.
//!
//! ```text
//! 0   magic          [u8; 4]
//! 4   write_index    AtomicU32   slot most recently published by the server
//! 8   frame_locks    [AtomicU32; MAX_FRAMES]   0 = free, 1 = held
//! 32  frame_count    u32
//! 36  frame_size     u32
//! 40  frame_offsets  [u32; MAX_FRAMES]
//! 64  frame records
//! ```
//!
//! Lock protocol:
//! The lock word is the only synchronization point. The server writes a
//! slot's record only while it holds the slot's word and clears the word
//! with Release ordering afterwards. A reader wins the word with an
//! AcqRel compare-and-swap before touching the record, so the record is
//! fully visible once the CAS succeeds.

use crate::paths::MAX_FRAMES;

pub const HEADER_MAGIC_OFFSET: usize = 0;
pub const HEADER_WRITE_INDEX_OFFSET: usize = 4;
pub const HEADER_FRAME_LOCKS_OFFSET: usize = 8;
pub const HEADER_FRAME_COUNT_OFFSET: usize = HEADER_FRAME_LOCKS_OFFSET + 4 * MAX_FRAMES;
pub const HEADER_FRAME_SIZE_OFFSET: usize = HEADER_FRAME_COUNT_OFFSET + 4;
pub const HEADER_FRAME_OFFSETS_OFFSET: usize = HEADER_FRAME_SIZE_OFFSET + 4;
pub const HEADER_SIZE: usize = HEADER_FRAME_OFFSETS_OFFSET + 4 * MAX_FRAMES;

pub const FRAME_TIMESTAMP_OFFSET: usize = 0;
pub const FRAME_ID_OFFSET: usize = 8;
pub const FRAME_WIDTH_OFFSET: usize = 12;
pub const FRAME_HEIGHT_OFFSET: usize = 16;
pub const FRAME_BYTES_PER_ROW_OFFSET: usize = 20;
pub const FRAME_BITS_PER_PIXEL_OFFSET: usize = 24;
pub const FRAME_FORMAT_OFFSET: usize = 25;
/// Pixel data follows two reserved bytes and 32 bytes of padding
pub const FRAME_DATA_OFFSET: usize = 60;

/// Frame records hold a u64 timestamp and must stay 8-byte aligned
pub const FRAME_ALIGN: usize = 8;

pub const LOCK_FREE: u32 = 0;
pub const LOCK_HELD: u32 = 1;

pub fn lock_offset(slot: usize) -> usize {
    HEADER_FRAME_LOCKS_OFFSET + 4 * slot
}

pub fn frame_offset_offset(slot: usize) -> usize {
    HEADER_FRAME_OFFSETS_OFFSET + 4 * slot
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 10-bit packed MIPI Bayer, BGGR order. Also what the server calls RAW.
    BayerMipiBggr10 = 0,
    Rgb888 = 1,
    Yuv420sp = 2,
}

impl PixelFormat {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PixelFormat::BayerMipiBggr10),
            1 => Some(PixelFormat::Rgb888),
            2 => Some(PixelFormat::Yuv420sp),
            _ => None,
        }
    }
}

/// Metadata at the start of every frame record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Monotonic capture time in ns. 0 means the slot holds no valid frame.
    pub timestamp: u64,
    pub frame_id: u32,
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: u32,
    pub bits_per_pixel: u8,
    /// Raw format byte; see [`FrameHeader::pixel_format`]
    pub format: u8,
}

impl FrameHeader {
    pub fn decode(record: &[u8]) -> Self {
        Self {
            timestamp: u64::from_ne_bytes(field(record, FRAME_TIMESTAMP_OFFSET)),
            frame_id: u32::from_ne_bytes(field(record, FRAME_ID_OFFSET)),
            width: u32::from_ne_bytes(field(record, FRAME_WIDTH_OFFSET)),
            height: u32::from_ne_bytes(field(record, FRAME_HEIGHT_OFFSET)),
            bytes_per_row: u32::from_ne_bytes(field(record, FRAME_BYTES_PER_ROW_OFFSET)),
            bits_per_pixel: record[FRAME_BITS_PER_PIXEL_OFFSET],
            format: record[FRAME_FORMAT_OFFSET],
        }
    }

    pub fn encode(&self, record: &mut [u8]) {
        record[FRAME_TIMESTAMP_OFFSET..FRAME_TIMESTAMP_OFFSET + 8]
            .copy_from_slice(&self.timestamp.to_ne_bytes());
        record[FRAME_ID_OFFSET..FRAME_ID_OFFSET + 4].copy_from_slice(&self.frame_id.to_ne_bytes());
        record[FRAME_WIDTH_OFFSET..FRAME_WIDTH_OFFSET + 4].copy_from_slice(&self.width.to_ne_bytes());
        record[FRAME_HEIGHT_OFFSET..FRAME_HEIGHT_OFFSET + 4]
            .copy_from_slice(&self.height.to_ne_bytes());
        record[FRAME_BYTES_PER_ROW_OFFSET..FRAME_BYTES_PER_ROW_OFFSET + 4]
            .copy_from_slice(&self.bytes_per_row.to_ne_bytes());
        record[FRAME_BITS_PER_PIXEL_OFFSET] = self.bits_per_pixel;
        record[FRAME_FORMAT_OFFSET] = self.format;
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_u8(self.format)
    }
}

fn field<const N: usize>(record: &[u8], offset: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&record[offset..offset + N]);
    bytes
}
