/// Reads a growing cache file and produces interleaved PCM via `ffmpeg`.
///
/// Spawns `ffmpeg -i <path> ... -f <s16le|f32le> pipe:1` with its stdout
/// piped, and pulls fixed-size chunks from that pipe on a blocking worker
/// thread so the async runtime is never blocked on subprocess I/O. Seeking
/// is the Downloader's job (the cache file already starts at the desired
/// offset), so the decoder always decodes from the start of its input.
use airbridge_core::DecoderError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcmFormat {
    S16LE,
    F32LE,
}

impl PcmFormat {
    fn codec(self) -> &'static str {
        match self {
            PcmFormat::S16LE => "pcm_s16le",
            PcmFormat::F32LE => "pcm_f32le",
        }
    }

    fn container(self) -> &'static str {
        match self {
            PcmFormat::S16LE => "s16le",
            PcmFormat::F32LE => "f32le",
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            PcmFormat::S16LE => 2,
            PcmFormat::F32LE => 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DecoderConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub pcm_format: PcmFormat,
    pub realtime: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            pcm_format: PcmFormat::F32LE,
            realtime: false,
        }
    }
}

impl DecoderConfig {
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.pcm_format.bytes_per_sample()
    }
}

/// Drives an `ffmpeg` child process, exposing its stdout as a pull-based
/// PCM stream. `read` runs on `spawn_blocking` since `std::process::Child`
/// doesn't offer async I/O.
pub struct Decoder {
    config: DecoderConfig,
    tag: &'static str,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self::with_tag(config, "Decoder")
    }

    pub fn with_tag(config: DecoderConfig, tag: &'static str) -> Self {
        Self {
            config,
            tag,
            child: None,
            stdout: None,
        }
    }

    pub fn is_running(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.config.bytes_per_frame()
    }

    /// Spawns the ffmpeg process. A no-op if already started.
    pub fn start(&mut self, input_path: impl AsRef<Path>) -> Result<(), DecoderError> {
        if self.child.is_some() {
            return Ok(());
        }

        let input_path: PathBuf = input_path.as_ref().to_path_buf();
        let cfg = &self.config;

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        if cfg.realtime {
            cmd.arg("-re");
        }
        cmd.arg("-i").arg(&input_path);
        cmd.args([
            "-vn",
            "-acodec",
            cfg.pcm_format.codec(),
            "-ar",
            &cfg.sample_rate.to_string(),
            "-ac",
            &cfg.channels.to_string(),
            "-f",
            cfg.pcm_format.container(),
            "pipe:1",
        ]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        debug!(
            tag = self.tag,
            format = ?cfg.pcm_format,
            rate = cfg.sample_rate,
            channels = cfg.channels,
            input = %input_path.display(),
            "starting decoder"
        );

        let mut child = cmd.spawn().map_err(DecoderError::Spawn)?;
        let stdout = child.stdout.take().ok_or(DecoderError::PrematureExit)?;

        self.child = Some(child);
        self.stdout = Some(stdout);
        Ok(())
    }

    /// Reads up to `size` bytes, blocking briefly if the writer (the
    /// Downloader) is ahead of ffmpeg's own probing. Returns an empty
    /// vector on EOF or if the decoder was never started.
    pub async fn read(&mut self, size: usize) -> Vec<u8> {
        let Some(mut stdout) = self.stdout.take() else {
            return Vec::new();
        };

        let tag = self.tag;
        let result = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; size];
            let read = match stdout.read(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!(tag, error = %e, "decoder read error");
                    0
                }
            };
            buf.truncate(read);
            (buf, stdout)
        })
        .await;

        match result {
            Ok((data, stdout)) => {
                self.stdout = Some(stdout);
                data
            }
            Err(e) => {
                // The blocking task panicked or was cancelled; the stdout
                // handle is lost with it, so treat this like EOF.
                warn!(tag, error = %e, "decoder read task failed");
                Vec::new()
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.stdout = None;
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_frame_matches_format() {
        let cfg = DecoderConfig {
            sample_rate: 44100,
            channels: 2,
            pcm_format: PcmFormat::S16LE,
            realtime: false,
        };
        assert_eq!(cfg.bytes_per_frame(), 4);
    }

    #[test]
    fn f32le_bytes_per_sample_is_four() {
        assert_eq!(PcmFormat::F32LE.bytes_per_sample(), 4);
    }

    #[tokio::test]
    async fn fresh_decoder_is_not_running() {
        let mut decoder = Decoder::new(DecoderConfig::default());
        assert!(!decoder.is_running());
    }

    #[tokio::test]
    async fn read_without_start_returns_empty() {
        let mut decoder = Decoder::new(DecoderConfig::default());
        let data = decoder.read(4096).await;
        assert!(data.is_empty());
    }
}
