use serde::{Deserialize, Serialize};

/// Interleaved, fixed-shape PCM frames flowing through the DSP graph.
///
/// The DSP contract (component design §4.8) operates on `float32` buffers of
/// shape `[n_frames, channels]`; this is the borrowed view passed between
/// Decoder, DSP graph stages and Output.
#[derive(Clone, Copy, Debug)]
pub struct AudioBlock<'a> {
    /// Interleaved audio frames (len = n_frames * n_channels).
    pub frames: &'a [f32],
    pub sample_rate: u32,
    pub channels: u16,
}

impl<'a> AudioBlock<'a> {
    pub fn new(frames: &'a [f32], sample_rate: u32, channels: u16) -> Self {
        Self {
            frames,
            sample_rate,
            channels,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len() / self.channels as usize
    }

    pub fn is_valid(&self) -> bool {
        self.frames.len() % self.channels as usize == 0
    }
}

/// Sample format produced for an Output consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 32-bit float, used by the local speaker output.
    F32,
    /// 16-bit signed integer, host-native encoding; byte order is swapped
    /// to big-endian by the AirPlay sender before it goes on the wire.
    S16LE,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::S16LE => 2,
        }
    }

    pub fn bit_depth(&self) -> u8 {
        match self {
            SampleFormat::F32 => 32,
            SampleFormat::S16LE => 16,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, SampleFormat::F32)
    }
}

/// Configuration for an output sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    /// Buffer size in milliseconds; also the chunk size used by the
    /// bounded PCM queue between the Decoder worker and the audio callback.
    pub buffer_ms: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            format: SampleFormat::F32,
            buffer_ms: 100,
        }
    }
}

impl OutputConfig {
    pub fn buffer_frames(&self) -> usize {
        (self.sample_rate as u64 * self.buffer_ms as u64 / 1000) as usize
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_frames() * self.channels as usize * self.format.bytes_per_sample()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_block_validation() {
        let frames = vec![0.0f32; 480];
        let block = AudioBlock::new(&frames, 48000, 2);
        assert!(block.is_valid());
        assert_eq!(block.num_frames(), 240);
    }

    #[test]
    fn audio_block_invalid() {
        let frames = vec![0.0f32; 481];
        let block = AudioBlock::new(&frames, 48000, 2);
        assert!(!block.is_valid());
    }

    #[test]
    fn sample_format_sizes() {
        assert_eq!(SampleFormat::F32.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::S16LE.bytes_per_sample(), 2);
    }

    #[test]
    fn output_config_buffer_calculation() {
        let cfg = OutputConfig {
            sample_rate: 48000,
            channels: 2,
            format: SampleFormat::S16LE,
            buffer_ms: 100,
        };
        assert_eq!(cfg.buffer_frames(), 4800);
        assert_eq!(cfg.buffer_bytes(), 19200);
    }
}
