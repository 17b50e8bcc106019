/// Background copy of a remote audio URL into a local cache file.
///
/// Spawns `ffmpeg -c:a copy` to stream-copy the source into a Matroska
/// container (Matroska accepts nearly any audio codec without re-encoding)
/// so the Decoder downstream always receives a well-known container
/// regardless of what the source actually serves. The copy runs on a
/// dedicated worker task; `start` tears down any prior copy first.
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const GRACE_PERIOD: Duration = Duration::from_secs(2);
const STDERR_TRUNCATE_BYTES: usize = 200;

#[derive(Clone, Debug)]
pub struct DownloaderConfig {
    pub cache_dir: PathBuf,
    pub cache_filename: String,
    pub container_format: String,
    pub file_extension: String,
}

impl DownloaderConfig {
    pub fn new(cache_dir: impl Into<PathBuf>, cache_filename: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            cache_filename: cache_filename.into(),
            container_format: "matroska".to_string(),
            file_extension: "mkv".to_string(),
        }
    }
}

struct DownloaderState {
    downloading: bool,
    completed: bool,
    error: Option<String>,
    seek_position: f64,
}

/// Stream-copies a remote URL into a local cache file using `ffmpeg`.
pub struct Downloader {
    config: DownloaderConfig,
    tag: &'static str,
    state: Arc<Mutex<DownloaderState>>,
    child: Arc<AsyncMutex<Option<Child>>>,
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Downloader {
    pub fn new(config: DownloaderConfig) -> Self {
        Self::with_tag(config, "Downloader")
    }

    pub fn with_tag(config: DownloaderConfig, tag: &'static str) -> Self {
        Self {
            config,
            tag,
            state: Arc::new(Mutex::new(DownloaderState {
                downloading: false,
                completed: false,
                error: None,
                seek_position: 0.0,
            })),
            child: Arc::new(AsyncMutex::new(None)),
            cancelled: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    pub fn file_path(&self) -> PathBuf {
        self.config
            .cache_dir
            .join(format!(
                "{}.{}",
                self.config.cache_filename, self.config.file_extension
            ))
    }

    pub fn file_size(&self) -> u64 {
        std::fs::metadata(self.file_path())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn is_downloading(&self) -> bool {
        self.state.lock().unwrap().downloading
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().unwrap().completed
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    /// Starts a new copy, tearing down any previous one first.
    pub async fn start(&mut self, url: String, seek_position: f64) {
        self.stop().await;
        self.cleanup_file();

        {
            let mut state = self.state.lock().unwrap();
            state.downloading = true;
            state.completed = false;
            state.error = None;
            state.seek_position = seek_position;
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let file_path = self.file_path();
        let container_format = self.config.container_format.clone();
        let tag = self.tag;
        let state = self.state.clone();
        let child_slot = self.child.clone();
        let cancelled = self.cancelled.clone();

        info!(tag, seek_position, "download started");
        debug!(tag, url = %url, path = %file_path.display(), "download target");

        self.task = Some(tokio::spawn(async move {
            let mut cmd = Command::new("ffmpeg");
            cmd.arg("-y");
            if seek_position > 0.0 {
                cmd.args(["-ss", &seek_position.to_string()]);
            }
            cmd.args(["-i", &url, "-vn", "-c:a", "copy", "-f", &container_format]);
            cmd.arg(&file_path);
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::piped());

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    let mut state = state.lock().unwrap();
                    state.error = Some(e.to_string());
                    state.downloading = false;
                    error!(tag, error = %e, "failed to spawn ffmpeg");
                    return;
                }
            };

            let stderr_handle = child.stderr.take();
            *child_slot.lock().await = Some(child);

            let mut stderr_capture = Vec::new();
            if let Some(mut stderr) = stderr_handle {
                let _ = stderr.read_to_end(&mut stderr_capture).await;
            }

            // Poll rather than hold the lock across a long `wait()`, so
            // `stop()` can grab the child and kill it in between polls.
            let status = loop {
                {
                    let mut guard = child_slot.lock().await;
                    if let Some(child) = guard.as_mut() {
                        match child.try_wait() {
                            Ok(Some(status)) => break Ok(status),
                            Ok(None) => {}
                            Err(e) => break Err(e),
                        }
                    } else {
                        break Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "child removed before exit",
                        ));
                    }
                }
                if cancelled.load(Ordering::SeqCst) {
                    debug!(tag, "download cancelled");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            };
            *child_slot.lock().await = None;

            if cancelled.load(Ordering::SeqCst) {
                debug!(tag, "download cancelled");
                return;
            }

            match status {
                Ok(status) if status.success() => {
                    let mut state = state.lock().unwrap();
                    state.completed = true;
                    info!(tag, "download completed");
                }
                Ok(status) => {
                    let msg = String::from_utf8_lossy(&stderr_capture);
                    let truncated: String = msg.chars().take(STDERR_TRUNCATE_BYTES).collect();
                    warn!(tag, code = ?status.code(), stderr = %truncated, "download failed");
                    let mut state = state.lock().unwrap();
                    state.error = Some(truncated);
                }
                Err(e) => {
                    error!(tag, error = %e, "download process error");
                    let mut state = state.lock().unwrap();
                    state.error = Some(e.to_string());
                }
            }

            {
                let mut state = state.lock().unwrap();
                state.downloading = false;
            }
        }));
    }

    /// Terminates the copy if running. Sends SIGTERM first and gives ffmpeg
    /// `GRACE_PERIOD` to exit cleanly, then SIGKILLs it if it's still alive.
    pub async fn stop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            state.downloading = false;
        }

        let pid = self.child.lock().await.as_ref().and_then(|c| c.id());
        if let Some(pid) = pid {
            // SAFETY: pid is the live ffmpeg child we just looked up under
            // the lock; sending SIGTERM to it is the intended request to
            // exit.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        if let Some(task) = self.task.take() {
            if tokio::time::timeout(GRACE_PERIOD, task).await.is_err() {
                warn!(tag = self.tag, "ffmpeg did not exit after SIGTERM, sending SIGKILL");
                if let Some(child) = self.child.lock().await.as_mut() {
                    let _ = child.start_kill();
                }
            }
        }
    }

    pub fn cleanup_file(&self) {
        let path = self.file_path();
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(tag = self.tag, error = %e, "failed to clean up cache file");
            } else {
                debug!(tag = self.tag, path = %path.display(), "cache file cleaned");
            }
        }
    }

    pub async fn cleanup(&mut self) {
        self.stop().await;
        self.cleanup_file();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_downloader_is_idle() {
        let cfg = DownloaderConfig::new(std::env::temp_dir(), "airbridge-test-idle");
        let downloader = Downloader::new(cfg);
        assert!(!downloader.is_downloading());
        assert!(!downloader.is_completed());
        assert_eq!(downloader.file_size(), 0);
    }

    #[tokio::test]
    async fn cleanup_removes_cache_file() {
        let cfg = DownloaderConfig::new(std::env::temp_dir(), "airbridge-test-cleanup");
        let downloader = Downloader::new(cfg);
        let path = downloader.file_path();
        std::fs::write(&path, b"fake cache contents").unwrap();
        assert!(path.exists());

        downloader.cleanup_file();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn file_path_uses_configured_extension() {
        let cfg = DownloaderConfig::new("/tmp/cache", "deadbeef");
        let downloader = Downloader::new(cfg);
        assert_eq!(downloader.file_path(), PathBuf::from("/tmp/cache/deadbeef.mkv"));
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let cfg = DownloaderConfig::new(std::env::temp_dir(), "airbridge-test-stop-noop");
        let mut downloader = Downloader::new(cfg);
        downloader.stop().await;
        assert!(!downloader.is_downloading());
    }
}
