use crate::frame_buffer::SharedFrameBuffer;
use crate::layout::{FrameHeader, LOCK_FREE, LOCK_HELD};
use crate::paths::MAX_FRAMES;
use std::sync::atomic::Ordering;

/// What this client knows about one slot's shared lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Not held by this client
    #[default]
    Free,
    /// Lock word held by this client, frame not handed out
    Held,
    /// Lock word held on behalf of a caller that acquired `frame_id`
    Owned { frame_id: u32 },
}

/// Slots locked by a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotSet(u8);

impl SlotSet {
    pub fn insert(&mut self, slot: usize) {
        self.0 |= 1 << slot;
    }

    pub fn contains(&self, slot: usize) -> bool {
        slot < MAX_FRAMES && self.0 & (1 << slot) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_FRAMES).filter(|slot| self.contains(*slot))
    }
}

/// A frame promoted to `Owned` by [`SlotLockTable::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredSlot {
    pub slot: usize,
    pub header: FrameHeader,
}

/// Client-side bookkeeping of the shared slot locks.
///
/// The shared lock words are the real cross-process mutex. This table only
/// remembers which of them this client currently holds and why, so that it
/// never releases a word it does not own.
#[derive(Debug, Default)]
pub struct SlotLockTable {
    slots: [SlotState; MAX_FRAMES],
    last_slot: Option<u32>,
    last_frame_id: Option<u32>,
}

impl SlotLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    /// Try to take every lock word not already held by this client. Slots
    /// busy in the producer or elsewhere are skipped.
    pub fn lock_all_slots(&mut self, buffer: &SharedFrameBuffer) -> SlotSet {
        let mut locked = SlotSet::default();

        for slot in 0..buffer.frame_count() {
            if self.slots[slot] != SlotState::Free {
                continue;
            }
            if buffer
                .lock_word(slot)
                .compare_exchange(LOCK_FREE, LOCK_HELD, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.slots[slot] = SlotState::Held;
                locked.insert(slot);
            }
        }

        locked
    }

    /// Lock the frame closest to, but not after, `timestamp` (0 = the most
    /// recently written frame) and hand it out.
    ///
    /// Candidates are every slot this client holds without having handed it
    /// out, including holds left by an earlier [`Self::lock_all_slots`]. All
    /// of them except the winner are given back before returning.
    ///
    /// Returns `None` when nothing new is available; that is not an error.
    pub fn acquire(&mut self, buffer: &SharedFrameBuffer, timestamp: u64) -> Option<AcquiredSlot> {
        self.lock_all_slots(buffer);
        let locked = self.held();

        let write_index = buffer.write_index();
        if write_index as usize >= buffer.frame_count() {
            tracing::warn!(write_index, frame_count = buffer.frame_count(), "Invalid write index");
            self.release_held(buffer);
            return None;
        }
        if self.last_slot == Some(write_index) {
            self.release_held(buffer);
            return None;
        }

        let candidate = if timestamp == 0 {
            let slot = write_index as usize;
            locked.contains(slot).then_some(slot)
        } else {
            best_before(buffer, locked, timestamp)
        };

        let Some(slot) = candidate else {
            self.release_held(buffer);
            return None;
        };

        let header = buffer.frame_header(slot);
        if header.timestamp == 0 {
            tracing::debug!(slot, "Slot has zero timestamp");
            self.release_held(buffer);
            return None;
        }
        if self.last_frame_id == Some(header.frame_id) {
            self.release_held(buffer);
            return None;
        }

        self.release_except(buffer, slot);
        self.slots[slot] = SlotState::Owned {
            frame_id: header.frame_id,
        };

        self.last_slot = Some(slot as u32);
        self.last_frame_id = Some(header.frame_id);

        Some(AcquiredSlot { slot, header })
    }

    /// Give back the lock of an acquired frame. Unknown frame ids are a
    /// no-op and still report success.
    pub fn release(&mut self, buffer: &SharedFrameBuffer, frame_id: u32) -> bool {
        let Some(slot) = self
            .slots
            .iter()
            .position(|state| *state == SlotState::Owned { frame_id })
        else {
            tracing::debug!(frame_id, "No slot found for frame");
            return true;
        };

        self.unlock(buffer, slot);
        true
    }

    /// Release every `Held` slot except `keep`.
    pub fn release_except(&mut self, buffer: &SharedFrameBuffer, keep: usize) {
        for slot in 0..MAX_FRAMES {
            if slot != keep && self.slots[slot] == SlotState::Held {
                self.unlock(buffer, slot);
            }
        }
    }

    /// Release every `Held` slot, leaving frames handed to callers alone.
    pub fn release_held(&mut self, buffer: &SharedFrameBuffer) {
        for slot in 0..MAX_FRAMES {
            if self.slots[slot] == SlotState::Held {
                self.unlock(buffer, slot);
            }
        }
    }

    /// Release every slot this client holds, owned frames included.
    pub fn release_all(&mut self, buffer: &SharedFrameBuffer) {
        for slot in 0..MAX_FRAMES {
            if self.slots[slot] != SlotState::Free {
                self.unlock(buffer, slot);
            }
        }
    }

    /// Forget all bookkeeping, e.g. once the buffer it referred to is gone.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Slots currently held but not handed out.
    pub fn held(&self) -> SlotSet {
        let mut set = SlotSet::default();
        for (slot, state) in self.slots.iter().enumerate() {
            if *state == SlotState::Held {
                set.insert(slot);
            }
        }
        set
    }

    fn unlock(&mut self, buffer: &SharedFrameBuffer, slot: usize) {
        if slot < buffer.frame_count()
            && buffer
                .lock_word(slot)
                .compare_exchange(LOCK_HELD, LOCK_FREE, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            tracing::warn!(slot, "Slot lock was not held while releasing");
        }
        self.slots[slot] = SlotState::Free;
    }
}

/// Newest non-zero timestamp at or before `timestamp` among `locked`. Ties
/// go to the lowest slot.
fn best_before(buffer: &SharedFrameBuffer, locked: SlotSet, timestamp: u64) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;

    for slot in locked.iter() {
        let ts = buffer.frame_header(slot).timestamp;
        if ts == 0 || ts > timestamp {
            continue;
        }
        if best.is_none_or(|(_, best_ts)| ts > best_ts) {
            best = Some((slot, ts));
        }
    }

    best.map(|(slot, _)| slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_buffer::test_support::{publish, ring, write_frame};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{Duration, Instant};

    fn word(buffer: &SharedFrameBuffer, slot: usize) -> u32 {
        buffer.lock_word(slot).load(Ordering::Acquire)
    }

    #[test]
    fn test_slot_set_membership() {
        let mut set = SlotSet::default();
        set.insert(0);
        set.insert(5);
        assert!(set.contains(5));
        assert!(!set.contains(3));
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 5]);
    }

    #[test]
    fn test_acquire_selects_newest_at_or_before_timestamp() {
        let buffer = ring(3, 128);
        write_frame(&buffer, 0, 100, 1);
        write_frame(&buffer, 1, 250, 2);
        write_frame(&buffer, 2, 400, 3);
        publish(&buffer, 2);

        let mut table = SlotLockTable::new();
        let acquired = table.acquire(&buffer, 300).expect("A frame at or before 300");

        assert_eq!(acquired.slot, 1);
        assert_eq!(acquired.header.timestamp, 250);
        assert_eq!(table.state(1), SlotState::Owned { frame_id: 2 });
        assert_eq!(word(&buffer, 1), LOCK_HELD);
        assert_eq!(word(&buffer, 0), LOCK_FREE, "Losing slots are released");
        assert_eq!(word(&buffer, 2), LOCK_FREE, "Losing slots are released");
    }

    #[test]
    fn test_acquire_latest_uses_write_index() {
        let buffer = ring(3, 128);
        write_frame(&buffer, 0, 100, 1);
        write_frame(&buffer, 1, 250, 2);
        write_frame(&buffer, 2, 400, 3);
        publish(&buffer, 1);

        let mut table = SlotLockTable::new();
        let acquired = table.acquire(&buffer, 0).unwrap();
        assert_eq!(acquired.slot, 1, "Timestamp 0 means the published slot");
    }

    #[test]
    fn test_acquire_latest_skips_slot_busy_in_producer() {
        let buffer = ring(3, 128);
        write_frame(&buffer, 2, 400, 3);
        publish(&buffer, 2);
        buffer.lock_word(2).store(LOCK_HELD, Ordering::Release);

        let mut table = SlotLockTable::new();
        assert!(table.acquire(&buffer, 0).is_none());
        assert!(table.held().is_empty(), "Nothing stays held after a miss");
        assert_eq!(word(&buffer, 2), LOCK_HELD, "Producer lock is untouched");
    }

    #[test]
    fn test_no_frame_before_requested_timestamp() {
        let buffer = ring(2, 128);
        write_frame(&buffer, 0, 500, 1);
        write_frame(&buffer, 1, 600, 2);
        publish(&buffer, 1);

        let mut table = SlotLockTable::new();
        assert!(table.acquire(&buffer, 100).is_none());
        assert_eq!(word(&buffer, 0), LOCK_FREE);
        assert_eq!(word(&buffer, 1), LOCK_FREE);
    }

    #[test]
    fn test_equal_timestamps_prefer_lowest_slot() {
        let buffer = ring(3, 128);
        write_frame(&buffer, 0, 50, 1);
        write_frame(&buffer, 1, 200, 2);
        write_frame(&buffer, 2, 200, 3);
        publish(&buffer, 0);

        let mut table = SlotLockTable::new();
        assert_eq!(table.acquire(&buffer, 300).unwrap().slot, 1);
    }

    #[test]
    fn test_zero_timestamp_never_returned() {
        let buffer = ring(2, 128);
        write_frame(&buffer, 1, 0, 9);
        publish(&buffer, 1);

        let mut table = SlotLockTable::new();
        assert!(table.acquire(&buffer, 0).is_none());
        assert_eq!(word(&buffer, 1), LOCK_FREE);
    }

    #[test]
    fn test_duplicate_frame_suppressed() {
        let buffer = ring(3, 128);
        write_frame(&buffer, 0, 100, 7);
        publish(&buffer, 0);

        let mut table = SlotLockTable::new();
        let first = table.acquire(&buffer, 0).unwrap();
        assert!(table.release(&buffer, first.header.frame_id));

        // Same slot published again
        assert!(table.acquire(&buffer, 0).is_none(), "Unchanged write index");

        // Producer republishes the same frame in another slot
        write_frame(&buffer, 1, 100, 7);
        publish(&buffer, 1);
        assert!(table.acquire(&buffer, 0).is_none(), "Same frame id is a duplicate");

        write_frame(&buffer, 2, 200, 8);
        publish(&buffer, 2);
        assert_eq!(table.acquire(&buffer, 0).unwrap().header.frame_id, 8);
    }

    #[test]
    fn test_invalid_write_index_releases_everything() {
        let buffer = ring(2, 128);
        write_frame(&buffer, 0, 100, 1);
        publish(&buffer, 5);

        let mut table = SlotLockTable::new();
        assert!(table.acquire(&buffer, 0).is_none());
        assert_eq!(word(&buffer, 0), LOCK_FREE);
        assert_eq!(word(&buffer, 1), LOCK_FREE);
    }

    #[test]
    fn test_release_is_idempotent() {
        let buffer = ring(2, 128);
        write_frame(&buffer, 0, 100, 4);
        publish(&buffer, 0);

        let mut table = SlotLockTable::new();
        let acquired = table.acquire(&buffer, 0).unwrap();

        assert!(table.release(&buffer, acquired.header.frame_id));
        assert_eq!(word(&buffer, 0), LOCK_FREE);
        assert!(table.release(&buffer, acquired.header.frame_id), "Second release is a no-op");
        assert!(table.release(&buffer, 12345), "Unknown frame is a no-op");
        assert_eq!(table.state(0), SlotState::Free);
    }

    #[test]
    fn test_release_held_keeps_owned_frames() {
        let buffer = ring(3, 128);
        write_frame(&buffer, 0, 100, 1);
        publish(&buffer, 0);

        let mut table = SlotLockTable::new();
        let owned = table.acquire(&buffer, 0).unwrap();
        let held = table.lock_all_slots(&buffer);
        assert_eq!(held.iter().collect::<Vec<_>>(), vec![1, 2]);

        table.release_held(&buffer);
        assert_eq!(table.state(owned.slot), SlotState::Owned { frame_id: 1 });
        assert_eq!(word(&buffer, 0), LOCK_HELD);
        assert_eq!(word(&buffer, 1), LOCK_FREE);

        table.release_all(&buffer);
        assert_eq!(word(&buffer, 0), LOCK_FREE);
    }

    #[test]
    fn test_release_except_keeps_one_slot() {
        let buffer = ring(3, 128);
        let mut table = SlotLockTable::new();
        table.lock_all_slots(&buffer);

        table.release_except(&buffer, 1);
        assert_eq!(table.held().iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(word(&buffer, 1), LOCK_HELD);
        assert_eq!(word(&buffer, 2), LOCK_FREE);
    }

    #[test]
    fn test_acquire_gives_back_earlier_holds() {
        let buffer = ring(3, 128);
        write_frame(&buffer, 1, 100, 1);
        publish(&buffer, 1);

        let mut table = SlotLockTable::new();
        table.lock_all_slots(&buffer);
        assert_eq!(table.held().len(), 3);

        let acquired = table.acquire(&buffer, 0).expect("Held slots are candidates");
        assert_eq!(acquired.slot, 1);
        assert!(table.held().is_empty());
        assert_eq!(word(&buffer, 0), LOCK_FREE);
        assert_eq!(word(&buffer, 2), LOCK_FREE);
    }

    #[test]
    fn test_missed_acquire_gives_back_earlier_holds() {
        let buffer = ring(3, 128);
        let mut table = SlotLockTable::new();
        table.lock_all_slots(&buffer);

        for _ in 0..3 {
            assert!(table.acquire(&buffer, 0).is_none());
        }
        for slot in 0..3 {
            assert_eq!(word(&buffer, slot), LOCK_FREE, "Slot {slot} still held");
        }
    }

    #[test]
    fn test_reset_forgets_last_frame() {
        let buffer = ring(1, 128);
        write_frame(&buffer, 0, 100, 1);
        publish(&buffer, 0);

        let mut table = SlotLockTable::new();
        let acquired = table.acquire(&buffer, 0).unwrap();
        table.release(&buffer, acquired.header.frame_id);
        table.reset();

        assert!(table.acquire(&buffer, 0).is_some(), "Reset clears duplicate tracking");
    }

    #[test]
    fn test_slot_exclusivity_against_producer() {
        let buffer = Arc::new(ring(4, 128));
        let stop = Arc::new(AtomicBool::new(false));

        // Producer: lock a slot, scribble a frame, verify nobody else held it
        let producer = {
            let buffer = Arc::clone(&buffer);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut frame_id = 1u32;
                let mut collisions = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    let slot = (frame_id as usize) % buffer.frame_count();
                    let lock = buffer.lock_word(slot);
                    if lock
                        .compare_exchange(LOCK_FREE, LOCK_HELD, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        frame_id += 1;
                        continue;
                    }
                    write_frame(&buffer, slot, u64::from(frame_id) * 10, frame_id);
                    if lock
                        .compare_exchange(LOCK_HELD, LOCK_FREE, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        collisions += 1;
                    }
                    publish(&buffer, slot as u32);
                    frame_id += 1;
                }
                collisions
            })
        };

        let mut table = SlotLockTable::new();
        let mut last_id = 0u32;
        let mut acquired_count = 0;
        let deadline = Instant::now() + Duration::from_secs(2);
        while acquired_count < 500 && Instant::now() < deadline {
            if let Some(acquired) = table.acquire(&buffer, 0) {
                assert_eq!(word(&buffer, acquired.slot), LOCK_HELD);
                let id = acquired.header.frame_id;
                assert_ne!(id, last_id, "Duplicate frame handed out");
                assert_eq!(
                    buffer.frame_header(acquired.slot).frame_id,
                    id,
                    "Owned slot changed underneath the reader"
                );
                last_id = id;
                acquired_count += 1;
                assert!(table.release(&buffer, id));
            }
        }

        stop.store(true, Ordering::Relaxed);
        let collisions = producer.join().unwrap();
        assert_eq!(collisions, 0, "Producer and reader held a slot at the same time");
        assert!(acquired_count > 0, "Reader should see at least one frame");
    }
}
