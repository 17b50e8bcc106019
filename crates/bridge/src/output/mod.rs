/// Output variants: the two things a Virtual Device can write PCM frames
/// to. `AirPlaySender` forwards PCM to a discovered AirPlay device over
/// RTP (a thin in-process RTSP/RTP sender); `LocalSpeaker` writes to the
/// host sound device via cpal.
pub mod airplay;
pub mod local_speaker;

use crate::types::{AudioBlock, OutputConfig};
use anyhow::Result;
use async_trait::async_trait;

pub use airplay::AirPlaySender;
pub use local_speaker::LocalSpeaker;

/// An output consumes post-DSP `AudioBlock`s. Both variants implement this.
#[async_trait]
pub trait OutputSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn open(&mut self, cfg: OutputConfig) -> Result<()>;
    async fn write(&mut self, block: AudioBlock<'_>) -> Result<()>;
    async fn drain(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    fn latency_ms(&self) -> u32;
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockSink {
        open: bool,
        frames_received: usize,
    }

    impl MockSink {
        fn new() -> Self {
            Self {
                open: false,
                frames_received: 0,
            }
        }
    }

    #[async_trait]
    impl OutputSink for MockSink {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn open(&mut self, _cfg: OutputConfig) -> Result<()> {
            self.open = true;
            Ok(())
        }

        async fn write(&mut self, block: AudioBlock<'_>) -> Result<()> {
            if !self.open {
                anyhow::bail!("Sink not open");
            }
            self.frames_received += block.num_frames();
            Ok(())
        }

        async fn drain(&mut self) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.open = false;
            Ok(())
        }

        fn latency_ms(&self) -> u32 {
            50
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    #[tokio::test]
    async fn mock_sink_lifecycle() {
        let mut sink = MockSink::new();
        assert!(!sink.is_open());

        sink.open(OutputConfig::default()).await.unwrap();
        assert!(sink.is_open());

        let frames = vec![0.0; 480];
        let block = AudioBlock::new(&frames, 48000, 2);
        sink.write(block).await.unwrap();
        assert_eq!(sink.frames_received, 240);

        sink.close().await.unwrap();
        assert!(!sink.is_open());
    }

    #[tokio::test]
    async fn mock_sink_write_without_open() {
        let mut sink = MockSink::new();
        let frames = vec![0.0; 480];
        let block = AudioBlock::new(&frames, 48000, 2);

        let result = sink.write(block).await;
        assert!(result.is_err());
    }
}
