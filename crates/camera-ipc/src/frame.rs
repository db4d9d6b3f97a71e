use crate::frame_buffer::SharedFrameBuffer;
use crate::layout::{FrameHeader, PixelFormat};
use crate::slot_table::{AcquiredSlot, SlotLockTable, SlotState};
use std::sync::Arc;

/// A frame handed out by `acquire_frame`.
///
/// Keeps the mapping it points into alive, so the pixel slice stays valid
/// even if the server announces a new buffer in the meantime. Contents are
/// only stable until the frame is released.
#[derive(Clone)]
pub struct FrameView {
    buffer: Arc<SharedFrameBuffer>,
    slot: usize,
    header: FrameHeader,
}

impl FrameView {
    pub(crate) fn new(buffer: Arc<SharedFrameBuffer>, acquired: AcquiredSlot) -> Self {
        Self {
            buffer,
            slot: acquired.slot,
            header: acquired.header,
        }
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn frame_id(&self) -> u32 {
        self.header.frame_id
    }

    /// Capture time in monotonic nanoseconds
    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    pub fn width(&self) -> u32 {
        self.header.width
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn bytes_per_row(&self) -> u32 {
        self.header.bytes_per_row
    }

    pub fn bits_per_pixel(&self) -> u8 {
        self.header.bits_per_pixel
    }

    pub fn format(&self) -> Option<PixelFormat> {
        self.header.pixel_format()
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The whole data area of the slot
    pub fn data(&self) -> &[u8] {
        self.buffer.frame_data(self.slot)
    }

    /// The image rows described by the header, clamped to the slot
    pub fn pixels(&self) -> &[u8] {
        let data = self.data();
        let len = (self.header.bytes_per_row as usize).saturating_mul(self.header.height as usize);
        &data[..len.min(data.len())]
    }
}

impl std::fmt::Debug for FrameView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameView")
            .field("slot", &self.slot)
            .field("header", &self.header)
            .finish()
    }
}

/// Frame-side session data: the current buffer, the slots held in it and
/// whether the sensor is in standby.
#[derive(Debug, Default)]
pub(crate) struct FrameState {
    buffer: Option<Arc<SharedFrameBuffer>>,
    slots: SlotLockTable,
    paused: bool,
}

impl FrameState {
    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// Swap in a freshly announced buffer. Every lock held in the old one is
    /// given back first.
    pub fn replace(&mut self, buffer: Option<SharedFrameBuffer>) {
        self.unmap();
        self.buffer = buffer.map(Arc::new);
    }

    /// Drop the current buffer. Outstanding frames keep their own mapping
    /// alive. Calling this without a buffer does nothing.
    pub fn unmap(&mut self) {
        if let Some(old) = self.buffer.take() {
            self.slots.release_all(&old);
        }
        self.slots.reset();
    }

    /// Nothing is handed out while paused; each attempt instead sweeps up
    /// slots the producer has let go of since the pause.
    pub fn acquire(&mut self, timestamp: u64) -> Option<FrameView> {
        if self.paused {
            self.hold_and_clear();
            return None;
        }
        let buffer = self.buffer.as_ref()?;
        let acquired = self.slots.acquire(buffer, timestamp)?;
        Some(FrameView::new(Arc::clone(buffer), acquired))
    }

    pub fn release(&mut self, frame_id: u32) -> bool {
        match self.buffer.as_ref() {
            Some(buffer) => self.slots.release(buffer, frame_id),
            None => true,
        }
    }

    pub fn lock_all(&mut self) {
        if let Some(buffer) = self.buffer.as_ref() {
            self.slots.lock_all_slots(buffer);
        }
    }

    /// Enter standby. Every slot that can be won is locked and kept, and
    /// every slot this client holds is marked as carrying no frame. Slots the
    /// producer holds right now are swept up by later acquires or on resume.
    pub fn pause(&mut self) {
        self.paused = true;
        self.hold_and_clear();
    }

    /// Leave standby and give the held slots back to the producer. Anything
    /// written before this point is cleared first.
    pub fn resume(&mut self) {
        self.hold_and_clear();
        self.paused = false;
        if let Some(buffer) = self.buffer.as_ref() {
            self.slots.release_held(buffer);
        }
    }

    fn hold_and_clear(&mut self) {
        let Some(buffer) = self.buffer.as_ref() else {
            return;
        };
        self.slots.lock_all_slots(buffer);
        for slot in 0..buffer.frame_count() {
            if self.slots.state(slot) != SlotState::Free {
                buffer.clear_timestamp(slot);
            }
        }
    }
}
