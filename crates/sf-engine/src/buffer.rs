//! Source sample buffers and the per-voice buffer queue

use sf_core::{BufferFormat, Sample, SfError, SfResult};
use std::sync::Arc;

/// An immutable block of interleaved source samples
pub struct AudioBuffer {
    format: BufferFormat,
    sample_rate: u32,
    data: Vec<Sample>,
    frames: usize,
}

impl AudioBuffer {
    pub fn new(format: BufferFormat, sample_rate: u32, data: Vec<Sample>) -> SfResult<Self> {
        let channels = format.channel_count();
        if sample_rate == 0 {
            return Err(SfError::InvalidParam("buffer sample rate must be positive"));
        }
        if data.len() % channels != 0 {
            return Err(SfError::InvalidParam(
                "buffer length is not a whole number of frames",
            ));
        }
        let frames = data.len() / channels;
        Ok(Self {
            format,
            sample_rate,
            data,
            frames,
        })
    }

    /// Convenience constructor for a mono buffer
    pub fn mono(sample_rate: u32, data: Vec<Sample>) -> Self {
        let frames = data.len();
        Self {
            format: BufferFormat::Mono,
            sample_rate,
            data,
            frames,
        }
    }

    pub fn format(&self) -> BufferFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.format.channel_count()
    }

    /// One channel's sample of a frame
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> Sample {
        self.data[frame * self.channels() + channel]
    }

    /// Copy `count` frames of one channel starting at `frame` into `dst`,
    /// returning how many frames were available.
    pub fn copy_channel(&self, channel: usize, frame: usize, dst: &mut [Sample]) -> usize {
        let avail = self.frames.saturating_sub(frame).min(dst.len());
        let stride = self.channels();
        let mut idx = frame * stride + channel;
        for d in dst[..avail].iter_mut() {
            *d = self.data[idx];
            idx += stride;
        }
        avail
    }
}

/// Ordered list of buffers a voice plays through. All entries must share
/// one format and sample rate.
pub struct BufferQueue {
    entries: Vec<Arc<AudioBuffer>>,
}

impl BufferQueue {
    pub fn new(entries: Vec<Arc<AudioBuffer>>) -> SfResult<Self> {
        let first = entries
            .first()
            .ok_or(SfError::InvalidParam("buffer queue may not be empty"))?;
        let format = first.format();
        let rate = first.sample_rate();
        if entries
            .iter()
            .any(|b| b.format() != format || b.sample_rate() != rate)
        {
            return Err(SfError::InvalidParam(
                "buffer queue entries must share format and sample rate",
            ));
        }
        Ok(Self { entries })
    }

    pub fn single(buffer: Arc<AudioBuffer>) -> Self {
        Self {
            entries: vec![buffer],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, idx: usize) -> &Arc<AudioBuffer> {
        &self.entries[idx]
    }

    pub fn format(&self) -> BufferFormat {
        self.entries[0].format()
    }

    pub fn sample_rate(&self) -> u32 {
        self.entries[0].sample_rate()
    }

    /// Total frames across the queue
    pub fn total_frames(&self) -> usize {
        self.entries.iter().map(|b| b.frames()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ragged_data() {
        assert!(AudioBuffer::new(BufferFormat::Stereo, 44100, vec![0.0; 5]).is_err());
        assert!(AudioBuffer::new(BufferFormat::Stereo, 44100, vec![0.0; 6]).is_ok());
    }

    #[test]
    fn channel_copy_handles_tail() {
        let data = vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0];
        let buf = AudioBuffer::new(BufferFormat::Stereo, 44100, data).unwrap();
        let mut dst = [0.0f32; 8];
        let got = buf.copy_channel(1, 1, &mut dst);
        assert_eq!(got, 2);
        assert_eq!(&dst[..2], &[-2.0, -3.0]);
    }

    #[test]
    fn queue_requires_matching_entries() {
        let a = Arc::new(AudioBuffer::mono(44100, vec![0.0; 4]));
        let b = Arc::new(AudioBuffer::mono(48000, vec![0.0; 4]));
        assert!(BufferQueue::new(vec![a.clone(), b]).is_err());
        let q = BufferQueue::new(vec![a.clone(), a]).unwrap();
        assert_eq!(q.total_frames(), 8);
        assert_eq!(q.len(), 2);
    }
}
