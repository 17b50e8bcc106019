/// Virtual DLNA device — the executor. Bridges a single DLNA renderer
/// identity to either an AirPlay device or the local speaker, owning its
/// own Downloader, Decoder, DSP graph and Output for its entire lifetime.
/// Subscribes device-filtered command handlers on `start`, executes them
/// against that pipeline, and publishes state events the DLNA service
/// turns into GENA notifications.
use crate::config_store::ConfigStore;
use crate::convert::decode_f32le;
use crate::decoder::{Decoder, DecoderConfig, PcmFormat};
use crate::downloader::{Downloader, DownloaderConfig};
use crate::dsp::DspGraph;
use crate::event_bus::EventBus;
use crate::output::OutputSink;
use crate::types::{AudioBlock, OutputConfig};
use airbridge_core::{DspConfig, Event, EventKind, EventTypeTag, PlaybackState, TrackMeta};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_CHUNK_FRAMES: usize = 4410;
/// The cache must hold at least this many bytes before the Decoder starts
/// reading, so ffmpeg's own input probing isn't starved by a half-written
/// file.
const CACHE_READY_THRESHOLD_BYTES: u64 = 100 * 1024;
const CACHE_READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    AirPlay,
    ServerSpeaker,
}

struct DeviceState {
    state: PlaybackState,
    url: String,
    metadata: TrackMeta,
    position: f64,
    anchor: Option<Instant>,
    volume: u8,
    muted: bool,
    dsp_enabled: bool,
    dsp_config: DspConfig,
    active_client: Option<(String, String)>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            state: PlaybackState::Stopped,
            url: String::new(),
            metadata: TrackMeta::default(),
            position: 0.0,
            anchor: None,
            volume: 100,
            muted: false,
            dsp_enabled: false,
            dsp_config: DspConfig::default(),
            active_client: None,
        }
    }
}

pub struct VirtualDevice {
    pub device_id: String,
    pub device_name: String,
    pub device_kind: DeviceKind,
    pub airplay_id: Option<String>,
    airplay_address: Mutex<Option<String>>,
    pub dlna_uuid: String,

    state: Mutex<DeviceState>,
    output: Arc<Mutex<Box<dyn OutputSink>>>,
    output_config: OutputConfig,
    cache_dir: PathBuf,
    event_bus: Arc<EventBus>,
    config_store: Arc<ConfigStore>,
    playback_task: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<crate::event_bus::SubscriptionId>>,
}

/// Deterministic device id: a fixed name for the local speaker, otherwise
/// the first 16 hex characters of MD5(airplay-identifier).
pub fn generate_device_id(airplay_id: Option<&str>, is_server_speaker: bool) -> String {
    if is_server_speaker {
        return "server_speaker".to_string();
    }
    match airplay_id {
        Some(id) => {
            let digest = format!("{:x}", md5::compute(id.as_bytes()));
            digest[..16].to_string()
        }
        None => uuid::Uuid::new_v4().simple().to_string()[..16].to_string(),
    }
}

impl VirtualDevice {
    pub fn new(
        device_id: String,
        device_name: String,
        device_kind: DeviceKind,
        airplay_id: Option<String>,
        airplay_address: Option<String>,
        output: Box<dyn OutputSink>,
        output_config: OutputConfig,
        cache_dir: PathBuf,
        event_bus: Arc<EventBus>,
        config_store: Arc<ConfigStore>,
    ) -> Arc<Self> {
        let dlna_uuid = format!("uuid:dlna-bridge-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        Arc::new(Self {
            device_id,
            device_name,
            device_kind,
            airplay_id,
            airplay_address: Mutex::new(airplay_address),
            dlna_uuid,
            state: Mutex::new(DeviceState::default()),
            output: Arc::new(Mutex::new(output)),
            output_config,
            cache_dir,
            event_bus,
            config_store,
            playback_task: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Publishes `DEVICE_ADDED`, loads persisted DSP config and subscribes
    /// this device's command handlers on the bus.
    pub async fn start(self: &Arc<Self>) {
        let dsp_config = self.config_store.get_dsp_config(&self.device_id).await;
        let dsp_enabled = self.config_store.get_dsp_enabled(&self.device_id).await;
        {
            let mut state = self.state.lock().await;
            state.dsp_config = dsp_config;
            state.dsp_enabled = dsp_enabled;
        }

        self.subscribe_events().await;

        self.event_bus.publish(Event::for_device(
            self.device_id.clone(),
            EventKind::DeviceAdded {
                device_name: self.device_name.clone(),
                device_type: match self.device_kind {
                    DeviceKind::AirPlay => "airplay".to_string(),
                    DeviceKind::ServerSpeaker => "server_speaker".to_string(),
                },
            },
        ));

        info!(device = %self.device_name, "virtual device started");
    }

    async fn subscribe_events(self: &Arc<Self>) {
        let mut subs = self.subscriptions.lock().await;
        if !subs.is_empty() {
            return;
        }

        macro_rules! sub {
            ($tag:expr, $method:ident) => {{
                let device = self.clone();
                self.event_bus.subscribe(
                    $tag,
                    Some(&self.device_id),
                    Arc::new(move |event: Event| {
                        let device = device.clone();
                        Box::pin(async move {
                            device.$method(event).await;
                            Ok(())
                        })
                    }),
                )
            }};
        }

        subs.push(sub!(EventTypeTag::Play, on_cmd_play));
        subs.push(sub!(EventTypeTag::Stop, on_cmd_stop));
        subs.push(sub!(EventTypeTag::Pause, on_cmd_pause));
        subs.push(sub!(EventTypeTag::Seek, on_cmd_seek));
        subs.push(sub!(EventTypeTag::SetVolume, on_cmd_volume));
        subs.push(sub!(EventTypeTag::SetMute, on_cmd_mute));
        subs.push(sub!(EventTypeTag::SetDsp, on_cmd_dsp));
        subs.push(sub!(EventTypeTag::ResetDsp, on_cmd_reset_dsp));
    }

    pub async fn shutdown(self: &Arc<Self>) {
        {
            let mut subs = self.subscriptions.lock().await;
            for id in subs.drain(..) {
                self.event_bus.unsubscribe(id);
            }
        }
        self.event_bus.unsubscribe_device(&self.device_id);

        self.stop_playback_task().await;
        let _ = self.output.lock().await.close().await;

        self.event_bus
            .publish(Event::for_device(self.device_id.clone(), EventKind::DeviceRemoved));

        info!(device = %self.device_name, "virtual device shut down");
    }

    // ----- command handlers -----

    async fn on_cmd_play(self: &Arc<Self>, event: Event) {
        let EventKind::Play { url, position, metadata } = event.kind else {
            return;
        };
        if url.is_empty() {
            warn!(trace_id = %event.trace_id, device = %self.device_name, "play command without url");
            return;
        }

        {
            let mut state = self.state.lock().await;
            state.url = url.clone();
            if let Some(meta) = metadata {
                state.metadata.merge(meta);
            }
            state.position = position;
            state.anchor = Some(Instant::now());
            state.state = PlaybackState::Transitioning;
        }

        self.event_bus.publish(Event::for_device(
            self.device_id.clone(),
            EventKind::StateChanged {
                state: PlaybackState::Transitioning,
            },
        ));

        self.start_playback_task(url, position).await;
    }

    async fn on_cmd_stop(self: &Arc<Self>, _event: Event) {
        self.stop_playback_task().await;
        let _ = self.output.lock().await.drain().await;

        {
            let mut state = self.state.lock().await;
            state.state = PlaybackState::Stopped;
            state.position = 0.0;
            state.anchor = None;
        }

        self.event_bus.publish(Event::for_device(
            self.device_id.clone(),
            EventKind::StateChanged {
                state: PlaybackState::Stopped,
            },
        ));
    }

    async fn on_cmd_pause(self: &Arc<Self>, _event: Event) {
        {
            let mut state = self.state.lock().await;
            if state.state == PlaybackState::Playing {
                if let Some(anchor) = state.anchor.take() {
                    state.position += anchor.elapsed().as_secs_f64();
                }
            }
            state.state = PlaybackState::Paused;
        }

        // The worker task keeps the cache file around so resuming can
        // continue feeding from where it left off; only the anchor
        // freezes, not the pipeline.
        self.event_bus.publish(Event::for_device(
            self.device_id.clone(),
            EventKind::StateChanged {
                state: PlaybackState::Paused,
            },
        ));
    }

    async fn on_cmd_seek(self: &Arc<Self>, event: Event) {
        let EventKind::Seek { position } = event.kind else {
            return;
        };

        let url = {
            let mut state = self.state.lock().await;
            state.position = position;
            if state.state == PlaybackState::Playing {
                state.anchor = Some(Instant::now());
            }
            state.url.clone()
        };

        if !url.is_empty() {
            self.start_playback_task(url, position).await;
        }
    }

    async fn on_cmd_volume(self: &Arc<Self>, event: Event) {
        let EventKind::SetVolume { level } = event.kind else {
            return;
        };
        let clamped = level.min(100);
        {
            let mut state = self.state.lock().await;
            state.volume = clamped;
        }
        self.event_bus
            .publish(Event::for_device(self.device_id.clone(), EventKind::VolumeChanged));
    }

    async fn on_cmd_mute(self: &Arc<Self>, event: Event) {
        let EventKind::SetMute { muted } = event.kind else {
            return;
        };
        {
            let mut state = self.state.lock().await;
            state.muted = muted;
        }
        self.event_bus
            .publish(Event::for_device(self.device_id.clone(), EventKind::VolumeChanged));
    }

    async fn on_cmd_dsp(self: &Arc<Self>, event: Event) {
        let EventKind::SetDsp { enabled, config } = event.kind else {
            return;
        };
        let merged = {
            let mut state = self.state.lock().await;
            state.dsp_enabled = enabled;
            state.dsp_config.merge(&config);
            serde_json::to_value(&state.dsp_config).unwrap_or(serde_json::json!({}))
        };

        self.event_bus.publish(Event::for_device(
            self.device_id.clone(),
            EventKind::DspChanged {
                enabled,
                config: merged,
            },
        ));
    }

    async fn on_cmd_reset_dsp(self: &Arc<Self>, _event: Event) {
        let merged = {
            let mut state = self.state.lock().await;
            state.dsp_enabled = false;
            state.dsp_config = DspConfig::default();
            serde_json::to_value(&state.dsp_config).unwrap_or(serde_json::json!({}))
        };

        self.event_bus.publish(Event::for_device(
            self.device_id.clone(),
            EventKind::DspChanged {
                enabled: false,
                config: merged,
            },
        ));
    }

    // ----- playback pipeline -----

    async fn stop_playback_task(&self) {
        if let Some(task) = self.playback_task.lock().await.take() {
            task.abort();
        }
    }

    async fn start_playback_task(self: &Arc<Self>, url: String, seek_position: f64) {
        self.stop_playback_task().await;

        let device = self.clone();
        let handle = tokio::spawn(async move {
            device.run_playback(url, seek_position).await;
        });
        *self.playback_task.lock().await = Some(handle);
    }

    async fn run_playback(self: Arc<Self>, url: String, seek_position: f64) {
        let cache_name = format!("{}_role", self.device_id);
        let mut downloader = Downloader::with_tag(
            DownloaderConfig::new(self.cache_dir.clone(), cache_name),
            "Downloader",
        );
        downloader.start(url, seek_position).await;

        let cache_path = downloader.file_path();
        if !wait_for_cache_ready(&cache_path).await {
            warn!(device = %self.device_name, "cache never reached ready threshold, aborting playback");
            downloader.cleanup().await;
            return;
        }

        let mut decoder = Decoder::with_tag(
            DecoderConfig {
                sample_rate: self.output_config.sample_rate,
                channels: self.output_config.channels,
                pcm_format: PcmFormat::F32LE,
                realtime: true,
            },
            "Decoder",
        );
        if let Err(e) = decoder.start(&cache_path) {
            warn!(device = %self.device_name, error = %e, "failed to start decoder");
            downloader.cleanup().await;
            return;
        }

        let mut dsp = DspGraph::new(self.output_config.sample_rate, self.output_config.channels.into());
        {
            let state = self.state.lock().await;
            if state.dsp_enabled {
                dsp.apply_config(&state.dsp_config);
            }
        }

        if let Err(e) = self.output.lock().await.open(self.output_config.clone()).await {
            warn!(device = %self.device_name, error = %e, "failed to open output");
            downloader.cleanup().await;
            return;
        }

        {
            let mut state = self.state.lock().await;
            state.state = PlaybackState::Playing;
        }
        self.event_bus.publish(Event::for_device(
            self.device_id.clone(),
            EventKind::StateChanged {
                state: PlaybackState::Playing,
            },
        ));

        let bytes_per_frame = decoder.bytes_per_frame();
        let read_size = READ_CHUNK_FRAMES * bytes_per_frame;

        loop {
            let bytes = decoder.read(read_size).await;
            if bytes.is_empty() {
                break;
            }

            let mut samples = decode_f32le(&bytes);
            {
                let state = self.state.lock().await;
                if state.dsp_enabled {
                    dsp.apply_config(&state.dsp_config);
                    dsp.process(&mut samples);
                }
            }

            let block = AudioBlock::new(&samples, self.output_config.sample_rate, self.output_config.channels);
            let mut output = self.output.lock().await;
            if output.write(block).await.is_err() {
                break;
            }
        }

        decoder.stop();
        downloader.cleanup().await;

        {
            let mut state = self.state.lock().await;
            state.state = PlaybackState::Stopped;
            state.position = 0.0;
            state.anchor = None;
        }
        self.event_bus.publish(Event::for_device(
            self.device_id.clone(),
            EventKind::StateChanged {
                state: PlaybackState::Stopped,
            },
        ));
        debug!(device = %self.device_name, "playback pipeline ended (EOF)");
    }

    // ----- queries -----

    pub async fn current_position(&self) -> f64 {
        let state = self.state.lock().await;
        match (state.state, state.anchor) {
            (PlaybackState::Playing, Some(anchor)) => state.position + anchor.elapsed().as_secs_f64(),
            _ => state.position,
        }
    }

    pub async fn playback_state(&self) -> PlaybackState {
        self.state.lock().await.state
    }

    pub async fn set_active_client(&self, ip: String, sid: String) {
        self.state.lock().await.active_client = Some((ip, sid));
    }

    pub async fn active_client(&self) -> Option<(String, String)> {
        self.state.lock().await.active_client.clone()
    }

    pub async fn metadata(&self) -> TrackMeta {
        self.state.lock().await.metadata.clone()
    }

    pub async fn current_url(&self) -> String {
        self.state.lock().await.url.clone()
    }

    /// Merges supplemental metadata (e.g. from an out-of-band probe)
    /// without disturbing fields the probe didn't supply.
    pub async fn merge_metadata(&self, meta: TrackMeta) {
        {
            let mut state = self.state.lock().await;
            state.metadata.merge(meta);
        }
        self.event_bus
            .publish(Event::for_device(self.device_id.clone(), EventKind::MetadataUpdated));
    }

    pub async fn volume(&self) -> (u8, bool) {
        let state = self.state.lock().await;
        (state.volume, state.muted)
    }

    pub async fn airplay_address(&self) -> Option<String> {
        self.airplay_address.lock().await.clone()
    }

    /// Called when the Scanner re-discovers an already-known device at a
    /// possibly-new address.
    pub async fn set_airplay_address(&self, address: Option<String>) {
        *self.airplay_address.lock().await = address;
    }
}

async fn wait_for_cache_ready(path: &PathBuf) -> bool {
    let deadline = Instant::now() + CACHE_READY_TIMEOUT;
    loop {
        let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        if size >= CACHE_READY_THRESHOLD_BYTES {
            return true;
        }
        if Instant::now() >= deadline {
            // A short stream may finish before crossing the threshold at
            // all; treat "file exists with any data" as ready once timed out.
            return size > 0;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_deterministic_for_server_speaker() {
        assert_eq!(generate_device_id(None, true), "server_speaker");
    }

    #[test]
    fn device_id_is_deterministic_for_same_airplay_id() {
        let a = generate_device_id(Some("AA:BB:CC:DD"), false);
        let b = generate_device_id(Some("AA:BB:CC:DD"), false);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn device_id_differs_across_airplay_ids() {
        let a = generate_device_id(Some("device-1"), false);
        let b = generate_device_id(Some("device-2"), false);
        assert_ne!(a, b);
    }

}
