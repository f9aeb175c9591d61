use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use tracing::debug;

/// One captured image. Cloning shares the pixel buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic capture index
    pub index: u64,
    /// Capture time relative to the start of the capture source
    pub timestamp: Duration,
    pub width: u32,
    pub height: u32,
    /// RGB8, row-major
    pub data: Bytes,
}

impl Frame {
    pub fn new(index: u64, timestamp: Duration, width: u32, height: u32, data: Bytes) -> Self {
        Self {
            index,
            timestamp,
            width,
            height,
            data,
        }
    }

    /// Frame without pixels, for replays where recognition output is scripted.
    pub fn empty(index: u64, timestamp: Duration) -> Self {
        Self::new(index, timestamp, 0, 0, Bytes::new())
    }

    pub fn secs(&self) -> f64 {
        self.timestamp.as_secs_f64()
    }
}

/// Small pool of the most recently dispatched frames. The newest entry is the
/// "current frame"; older entries stay addressable by index so on-demand
/// classification can run on the frame that produced a signal.
#[derive(Clone)]
pub struct RecentFrames {
    inner: Arc<Mutex<VecDeque<Frame>>>,
    capacity: usize,
}

impl RecentFrames {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, frame: Frame) {
        let mut frames = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        frames.push_back(frame);
        while frames.len() > self.capacity {
            frames.pop_front();
        }
    }

    pub fn current(&self) -> Option<Frame> {
        self.inner.lock().ok().and_then(|f| f.back().cloned())
    }

    pub fn get(&self, index: u64) -> Option<Frame> {
        self.inner
            .lock()
            .ok()
            .and_then(|f| f.iter().rev().find(|frame| frame.index == index).cloned())
    }

    pub fn clear(&self) {
        if let Ok(mut frames) = self.inner.lock() {
            frames.clear();
        }
    }
}

/// Reads headerless RGB24 video, e.g. `ffmpeg -i clip.mp4 -pix_fmt rgb24 -f rawvideo -`.
/// Timestamps are derived from the frame rate.
pub struct RawVideoReader<R> {
    reader: R,
    width: u32,
    height: u32,
    fps: f64,
    next_index: u64,
    done: bool,
}

impl<R: Read> RawVideoReader<R> {
    pub fn new(reader: R, width: u32, height: u32, fps: f64) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("invalid frame size {}x{}", width, height);
        }
        if fps.is_nan() || fps <= 0.0 {
            bail!("invalid frame rate {}", fps);
        }
        Ok(Self {
            reader,
            width,
            height,
            fps,
            next_index: 0,
            done: false,
        })
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl<R: Read> Iterator for RawVideoReader<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buffer = vec![0u8; self.frame_len()];
        match self.reader.read_exact(&mut buffer) {
            Ok(()) => {
                let index = self.next_index;
                self.next_index += 1;
                let timestamp = Duration::from_secs_f64(index as f64 / self.fps);
                Some(Ok(Frame::new(index, timestamp, self.width, self.height, Bytes::from(buffer))))
            }
            // end of stream, a trailing partial frame is dropped
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(frames = self.next_index, "raw video finished");
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(index: u64) -> Frame {
        Frame::empty(index, Duration::from_millis(index * 33))
    }

    #[test]
    fn test_current_is_newest() {
        let frames = RecentFrames::new(4);
        assert!(frames.current().is_none());
        frames.push(frame(1));
        frames.push(frame(2));
        assert_eq!(frames.current().unwrap().index, 2);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let frames = RecentFrames::new(2);
        frames.push(frame(1));
        frames.push(frame(2));
        frames.push(frame(3));
        assert!(frames.get(1).is_none());
        assert_eq!(frames.get(2).unwrap().index, 2);
        assert_eq!(frames.get(3).unwrap().index, 3);
    }

    #[test]
    fn test_clear() {
        let frames = RecentFrames::new(2);
        frames.push(frame(1));
        frames.clear();
        assert!(frames.current().is_none());
    }

    #[test]
    fn test_raw_video_frames_and_timestamps() {
        // two 2x1 frames plus a partial third
        let data: Vec<u8> = (0..15).collect();
        let frames: Vec<Frame> = RawVideoReader::new(io::Cursor::new(data), 2, 1, 25.0)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].index, 1);
        assert_eq!(frames[1].timestamp, Duration::from_millis(40));
        assert_eq!(&frames[1].data[..], &[6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_raw_video_rejects_bad_geometry() {
        assert!(RawVideoReader::new(io::empty(), 0, 10, 30.0).is_err());
        assert!(RawVideoReader::new(io::empty(), 10, 10, 0.0).is_err());
    }
}
