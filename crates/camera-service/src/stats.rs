use crate::service::ImageFrame;

/// Running counters over the frames a consumer received.
#[derive(Debug, Default, Clone)]
pub struct FrameStats {
    frames: u64,
    /// Frame ids skipped between consecutive frames
    skipped: u64,
    first_timestamp_ms: Option<u64>,
    last_timestamp_ms: u64,
    last_frame_id: Option<u32>,
}

impl FrameStats {
    pub fn record(&mut self, frame: &ImageFrame) {
        if let Some(last) = self.last_frame_id {
            let gap = frame.frame_id.wrapping_sub(last);
            if gap > 1 && gap < u32::MAX / 2 {
                self.skipped += u64::from(gap - 1);
            }
        }

        self.frames += 1;
        self.first_timestamp_ms.get_or_insert(frame.timestamp_ms);
        self.last_timestamp_ms = frame.timestamp_ms;
        self.last_frame_id = Some(frame.frame_id);
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Average rate since the first frame, by capture time.
    pub fn fps(&self) -> f64 {
        let Some(first) = self.first_timestamp_ms else {
            return 0.0;
        };
        let span_ms = self.last_timestamp_ms.saturating_sub(first);
        if span_ms == 0 {
            return 0.0;
        }
        (self.frames - 1) as f64 * 1000.0 / span_ms as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_ipc::PixelFormat;

    fn frame(frame_id: u32, timestamp_ms: u64) -> ImageFrame {
        ImageFrame {
            frame_id,
            timestamp_ms,
            width: 1,
            height: 1,
            format: PixelFormat::Rgb888,
            pixels: vec![0; 3],
        }
    }

    #[test]
    fn test_counts_frames_and_gaps() {
        let mut stats = FrameStats::default();
        stats.record(&frame(1, 1000));
        stats.record(&frame(2, 1033));
        stats.record(&frame(5, 1100));

        assert_eq!(stats.frames(), 3);
        assert_eq!(stats.skipped(), 2);
        assert!((stats.fps() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_frame_has_no_rate() {
        let mut stats = FrameStats::default();
        assert_eq!(stats.fps(), 0.0);
        stats.record(&frame(1, 1000));
        assert_eq!(stats.fps(), 0.0);
    }
}
