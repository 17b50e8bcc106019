/// LocalSpeaker — the Output variant that writes PCM to the host sound
/// card via cpal. Audio arrives on the Decoder's worker thread and is
/// handed off to the real-time cpal callback through a bounded queue of
/// fixed-size chunks (one per `OutputConfig::buffer_ms` worth of audio).
/// When the callback can't keep up, the oldest queued chunk is dropped
/// rather than blocking the writer — an underrun is preferable to
/// backpressure reaching the Decoder and stalling playback upstream.
use crate::convert::convert_format;
use crate::output::OutputSink;
use crate::types::{AudioBlock, OutputConfig, SampleFormat};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, Stream, StreamConfig};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

const MAX_QUEUED_CHUNKS: usize = 8;

pub struct LocalSpeaker {
    device_name: Option<String>,
    host: Host,
    device: Option<Device>,
    stream: Option<Stream>,
    config: Option<OutputConfig>,
    queue: Arc<Mutex<ChunkQueue>>,
    is_open: bool,
}

// The cpal Stream is not Send/Sync by default, but it is only ever
// accessed from the owning task; the audio callback itself only touches
// `queue`, which is already behind an `Arc<Mutex<_>>`.
unsafe impl Send for LocalSpeaker {}
unsafe impl Sync for LocalSpeaker {}

/// A queue of fixed-size byte chunks with a drop-oldest overflow policy
/// and a running count of drops, surfaced via `LocalSpeaker::dropped_chunks`.
struct ChunkQueue {
    chunks: VecDeque<Vec<u8>>,
    current: Vec<u8>,
    cursor: usize,
    dropped_chunks: u64,
}

impl ChunkQueue {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            current: Vec::new(),
            cursor: 0,
            dropped_chunks: 0,
        }
    }

    fn push_chunk(&mut self, chunk: Vec<u8>) {
        if self.chunks.len() >= MAX_QUEUED_CHUNKS {
            self.chunks.pop_front();
            self.dropped_chunks += 1;
        }
        self.chunks.push_back(chunk);
    }

    fn read(&mut self, output: &mut [u8]) -> usize {
        let mut written = 0;
        while written < output.len() {
            if self.cursor >= self.current.len() {
                match self.chunks.pop_front() {
                    Some(chunk) => {
                        self.current = chunk;
                        self.cursor = 0;
                    }
                    None => break,
                }
            }

            let available = self.current.len() - self.cursor;
            let needed = output.len() - written;
            let to_copy = available.min(needed);

            output[written..written + to_copy]
                .copy_from_slice(&self.current[self.cursor..self.cursor + to_copy]);

            self.cursor += to_copy;
            written += to_copy;
        }
        written
    }

    fn queued_bytes(&self) -> usize {
        let current_remaining = self.current.len().saturating_sub(self.cursor);
        current_remaining + self.chunks.iter().map(|c| c.len()).sum::<usize>()
    }
}

impl LocalSpeaker {
    pub fn new(device_name: Option<String>) -> Self {
        let host = cpal::default_host();
        Self {
            device_name,
            host,
            device: None,
            stream: None,
            config: None,
            queue: Arc::new(Mutex::new(ChunkQueue::new())),
            is_open: false,
        }
    }

    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.output_devices()?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }

        Ok(names)
    }

    fn select_device(&mut self) -> Result<Device> {
        if let Some(ref name) = self.device_name {
            let devices = self.host.output_devices()?;
            for device in devices {
                if let Ok(device_name) = device.name() {
                    if device_name == *name {
                        info!("Selected audio device: {}", name);
                        return Ok(device);
                    }
                }
            }
            warn!("Device '{}' not found, using default", name);
        }

        self.host
            .default_output_device()
            .ok_or_else(|| anyhow!("No output device available"))
    }

    fn create_stream_config(&self, cfg: &OutputConfig) -> StreamConfig {
        StreamConfig {
            channels: cfg.channels,
            sample_rate: cpal::SampleRate(cfg.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }

    /// Number of chunks currently dropped due to queue overflow.
    pub fn dropped_chunks(&self) -> u64 {
        self.queue.lock().unwrap().dropped_chunks
    }
}

#[async_trait]
impl OutputSink for LocalSpeaker {
    fn name(&self) -> &'static str {
        "local_speaker"
    }

    async fn open(&mut self, cfg: OutputConfig) -> Result<()> {
        debug!("Opening local speaker with config: {:?}", cfg);

        let device = self.select_device()?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using audio device: {}", device_name);

        let supported_configs = device.supported_output_configs()?;
        let mut supports_f32 = false;
        let mut supports_i16 = false;

        for config_range in supported_configs {
            match config_range.sample_format() {
                cpal::SampleFormat::F32 => supports_f32 = true,
                cpal::SampleFormat::I16 => supports_i16 = true,
                _ => {}
            }
        }

        let actual_format = match cfg.format {
            SampleFormat::F32 if !supports_f32 && supports_i16 => {
                warn!("Device doesn't support F32, falling back to S16LE");
                SampleFormat::S16LE
            }
            SampleFormat::S16LE if !supports_i16 && supports_f32 => {
                warn!("Device doesn't support S16LE, falling back to F32");
                SampleFormat::F32
            }
            _ => cfg.format,
        };

        let stream_config = self.create_stream_config(&cfg);
        let queue = self.queue.clone();

        let stream = match actual_format {
            SampleFormat::F32 => device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = queue.lock().unwrap();
                    let bytes_needed = data.len() * 4;
                    let mut bytes = vec![0u8; bytes_needed];
                    let bytes_read = queue.read(&mut bytes);

                    for (i, chunk) in bytes[..bytes_read].chunks_exact(4).enumerate() {
                        data[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    }
                    for sample in data.iter_mut().skip(bytes_read / 4) {
                        *sample = 0.0;
                    }
                },
                |err| error!("Stream error: {}", err),
                None,
            )?,
            SampleFormat::S16LE => device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut queue = queue.lock().unwrap();
                    let bytes_needed = data.len() * 2;
                    let mut bytes = vec![0u8; bytes_needed];
                    let bytes_read = queue.read(&mut bytes);

                    for (i, chunk) in bytes[..bytes_read].chunks_exact(2).enumerate() {
                        data[i] = i16::from_le_bytes([chunk[0], chunk[1]]);
                    }
                    for sample in data.iter_mut().skip(bytes_read / 2) {
                        *sample = 0;
                    }
                },
                |err| error!("Stream error: {}", err),
                None,
            )?,
        };

        stream.play()?;
        info!("Audio stream started with format: {:?}", actual_format);

        let mut actual_cfg = cfg;
        actual_cfg.format = actual_format;

        self.device = Some(device);
        self.stream = Some(stream);
        self.config = Some(actual_cfg);
        self.is_open = true;

        Ok(())
    }

    async fn write(&mut self, block: AudioBlock<'_>) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("Sink not open"));
        }

        let cfg = self.config.as_ref().unwrap();

        let mut converted = Vec::new();
        convert_format(block, cfg.format, &mut converted)?;

        let mut queue = self.queue.lock().unwrap();
        let dropped_before = queue.dropped_chunks;
        queue.push_chunk(converted);
        if queue.dropped_chunks > dropped_before {
            warn!("Local speaker queue overflow: oldest chunk dropped");
        }

        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        loop {
            let remaining = {
                let queue = self.queue.lock().unwrap();
                queue.queued_bytes()
            };

            if remaining == 0 {
                break;
            }

            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing local speaker sink");

        if let Some(stream) = self.stream.take() {
            drop(stream);
        }

        self.device = None;
        self.config = None;
        self.is_open = false;

        info!("Local speaker sink closed");
        Ok(())
    }

    fn latency_ms(&self) -> u32 {
        if let Some(cfg) = &self.config {
            let queue = self.queue.lock().unwrap();
            let bytes_queued = queue.queued_bytes();
            let bytes_per_sample = cfg.format.bytes_per_sample();
            let samples_queued = bytes_queued / (bytes_per_sample * cfg.channels as usize);
            let ms = (samples_queued as f64 / cfg.sample_rate as f64 * 1000.0) as u32;
            ms + 20
        } else {
            0
        }
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

impl Default for LocalSpeaker {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_queue_write_read() {
        let mut queue = ChunkQueue::new();
        queue.push_chunk(vec![1u8, 2, 3, 4, 5]);

        let mut output = vec![0u8; 5];
        let read = queue.read(&mut output);
        assert_eq!(read, 5);
        assert_eq!(output, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn chunk_queue_spans_multiple_chunks() {
        let mut queue = ChunkQueue::new();
        queue.push_chunk(vec![1u8, 2, 3]);
        queue.push_chunk(vec![4u8, 5, 6]);

        let mut output = vec![0u8; 6];
        let read = queue.read(&mut output);
        assert_eq!(read, 6);
        assert_eq!(output, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn chunk_queue_drops_oldest_on_overflow() {
        let mut queue = ChunkQueue::new();
        for i in 0..(MAX_QUEUED_CHUNKS + 3) {
            queue.push_chunk(vec![i as u8]);
        }
        assert_eq!(queue.dropped_chunks, 3);
        assert_eq!(queue.chunks.len(), MAX_QUEUED_CHUNKS);
    }

    #[test]
    fn chunk_queue_read_past_end_returns_partial() {
        let mut queue = ChunkQueue::new();
        queue.push_chunk(vec![1u8, 2]);

        let mut output = vec![0u8; 10];
        let read = queue.read(&mut output);
        assert_eq!(read, 2);
    }

    #[tokio::test]
    async fn local_speaker_create() {
        let sink = LocalSpeaker::new(None);
        assert_eq!(sink.name(), "local_speaker");
        assert!(!sink.is_open());
    }
}
