use crate::types::{AudioBlock, SampleFormat};
use anyhow::Result;

/// Convert a post-DSP `AudioBlock` into the byte encoding an Output consumes.
pub fn convert_format(
    block: AudioBlock<'_>,
    target_format: SampleFormat,
    output: &mut Vec<u8>,
) -> Result<()> {
    output.clear();

    match target_format {
        SampleFormat::F32 => {
            for &sample in block.frames {
                output.extend_from_slice(&sample.to_le_bytes());
            }
        }
        SampleFormat::S16LE => {
            for &sample in block.frames {
                let dithered = apply_tpdf_dither(sample, 16);
                let i16_sample = (dithered.clamp(-1.0, 1.0) * 32767.0) as i16;
                output.extend_from_slice(&i16_sample.to_le_bytes());
            }
        }
    }

    Ok(())
}

/// Decode raw little-endian float32 PCM bytes (the Decoder's own output
/// format, chosen so the DSP graph always works in its native
/// representation regardless of which format the Output ultimately wants)
/// into a sample buffer. Trailing partial samples are dropped.
pub fn decode_f32le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Apply TPDF (Triangular Probability Density Function) dither before
/// quantizing down to a lower bit depth.
fn apply_tpdf_dither(sample: f32, bit_depth: u8) -> f32 {
    let lsb = 1.0 / (1u32 << (bit_depth - 1)) as f32;
    let r1: f32 = fastrand::f32();
    let r2: f32 = fastrand::f32();
    let dither = (r1 - r2) * lsb;
    sample + dither
}

/// Calculate RMS level of an audio block (in dBFS)
pub fn calculate_rms_dbfs(block: AudioBlock<'_>) -> f32 {
    if block.frames.is_empty() {
        return f32::NEG_INFINITY;
    }

    let sum_squares: f32 = block.frames.iter().map(|&s| s * s).sum();
    let rms = (sum_squares / block.frames.len() as f32).sqrt();

    if rms > 0.0 {
        20.0 * rms.log10()
    } else {
        f32::NEG_INFINITY
    }
}

/// Calculate peak level of an audio block (in dBFS)
pub fn calculate_peak_dbfs(block: AudioBlock<'_>) -> f32 {
    let peak = block
        .frames
        .iter()
        .map(|&s| s.abs())
        .fold(0.0f32, f32::max);

    if peak > 0.0 {
        20.0 * peak.log10()
    } else {
        f32::NEG_INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_f32_passthrough() {
        let frames = vec![0.5, -0.5, 0.0, 1.0];
        let block = AudioBlock::new(&frames, 48000, 2);
        let mut output = Vec::new();

        convert_format(block, SampleFormat::F32, &mut output).unwrap();

        assert_eq!(output.len(), 16);
    }

    #[test]
    fn test_convert_to_s16le() {
        let frames = vec![0.5, -0.5];
        let block = AudioBlock::new(&frames, 48000, 2);
        let mut output = Vec::new();

        convert_format(block, SampleFormat::S16LE, &mut output).unwrap();

        assert_eq!(output.len(), 4);
    }

    #[test]
    fn test_calculate_rms() {
        let frames = vec![0.5, -0.5, 0.5, -0.5];
        let block = AudioBlock::new(&frames, 48000, 2);

        let rms = calculate_rms_dbfs(block);
        assert!(rms < 0.0);
        assert!(rms > -10.0);
    }

    #[test]
    fn test_decode_f32le_round_trips_through_convert() {
        let frames = vec![0.25f32, -0.25];
        let block = AudioBlock::new(&frames, 48000, 2);
        let mut bytes = Vec::new();
        convert_format(block, SampleFormat::F32, &mut bytes).unwrap();

        let decoded = decode_f32le(&bytes);
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_calculate_peak() {
        let frames = vec![0.5, -0.8, 0.3, -0.2];
        let block = AudioBlock::new(&frames, 48000, 2);

        let peak = calculate_peak_dbfs(block);
        assert!((peak - (-1.94)).abs() < 0.1);
    }
}
