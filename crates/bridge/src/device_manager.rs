/// Owns the set of Virtual Devices. Creates one optional local-speaker
/// device at startup, then creates or refreshes AirPlay-backed devices
/// from Scanner callbacks, wiring each to an Output via a factory
/// registered by the bootstrap.
use crate::config_store::ConfigStore;
use crate::event_bus::EventBus;
use crate::output::airplay::{AirPlayDevice, AirPlaySender};
use crate::output::{LocalSpeaker, OutputSink};
use crate::scanner::AirPlayScanner;
use crate::types::OutputConfig;
use crate::virtual_device::{generate_device_id, DeviceKind, VirtualDevice};
use airbridge_core::{Event, EventKind};
use cpal::traits::HostTrait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct DeviceManagerConfig {
    pub enable_server_speaker: bool,
    pub cache_dir: PathBuf,
    pub output_config: OutputConfig,
}

/// Builds the `OutputSink` a newly-created device should use. Registered
/// once by the bootstrap so the Device Manager stays ignorant of which
/// concrete Output types exist.
pub type OutputFactory =
    Arc<dyn Fn(DeviceKind, Option<&AirPlayDevice>) -> Box<dyn OutputSink> + Send + Sync>;

pub struct DeviceManager {
    config: DeviceManagerConfig,
    event_bus: Arc<EventBus>,
    config_store: Arc<ConfigStore>,
    devices: Mutex<HashMap<String, Arc<VirtualDevice>>>,
    scan_id_to_device_id: Mutex<HashMap<String, String>>,
    output_factory: Mutex<Option<OutputFactory>>,
}

impl DeviceManager {
    pub fn new(
        config: DeviceManagerConfig,
        event_bus: Arc<EventBus>,
        config_store: Arc<ConfigStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            event_bus,
            config_store,
            devices: Mutex::new(HashMap::new()),
            scan_id_to_device_id: Mutex::new(HashMap::new()),
            output_factory: Mutex::new(None),
        })
    }

    pub async fn set_output_factory(&self, factory: OutputFactory) {
        *self.output_factory.lock().await = Some(factory);
    }

    fn default_output_sink(&self, kind: DeviceKind, info: Option<&AirPlayDevice>) -> Box<dyn OutputSink> {
        match kind {
            DeviceKind::ServerSpeaker => Box::new(LocalSpeaker::new(None)),
            DeviceKind::AirPlay => {
                let mut sender = AirPlaySender::new();
                if let Some(info) = info {
                    sender.set_device(info.clone());
                }
                Box::new(sender)
            }
        }
    }

    async fn build_output(&self, kind: DeviceKind, info: Option<&AirPlayDevice>) -> Box<dyn OutputSink> {
        match self.output_factory.lock().await.clone() {
            Some(factory) => factory(kind, info),
            None => self.default_output_sink(kind, info),
        }
    }

    fn has_audio_output_device() -> bool {
        cpal::default_host().default_output_device().is_some()
    }

    /// Creates the local-speaker device, if enabled and the host actually
    /// has an audio output device, then starts the Scanner.
    pub async fn bootstrap(self: &Arc<Self>, scanner: &Arc<AirPlayScanner>) {
        if self.config.enable_server_speaker && Self::has_audio_output_device() {
            self.create_server_speaker().await;
        } else if self.config.enable_server_speaker {
            warn!("server speaker enabled but no audio output device found");
        }

        let manager_found = self.clone();
        let manager_lost = self.clone();
        scanner
            .set_on_device_found(Arc::new(move |device: AirPlayDevice| {
                let manager = manager_found.clone();
                Box::pin(async move {
                    manager.on_scanner_device_found(device).await;
                })
            }))
            .await;
        scanner
            .set_on_device_lost(Arc::new(move |scan_id: String| {
                let manager = manager_lost.clone();
                Box::pin(async move {
                    manager.on_scanner_device_lost(scan_id).await;
                })
            }))
            .await;

        scanner.start().await;
    }

    async fn create_server_speaker(self: &Arc<Self>) {
        let device_id = generate_device_id(None, true);
        let output = self.build_output(DeviceKind::ServerSpeaker, None).await;
        let device = VirtualDevice::new(
            device_id.clone(),
            "Server Speaker".to_string(),
            DeviceKind::ServerSpeaker,
            None,
            None,
            output,
            self.config.output_config.clone(),
            self.config.cache_dir.clone(),
            self.event_bus.clone(),
            self.config_store.clone(),
        );
        device.start().await;
        self.devices.lock().await.insert(device_id, device);
        info!("server speaker device created");
    }

    pub(crate) async fn on_scanner_device_found(self: &Arc<Self>, info: AirPlayDevice) {
        let scan_id = info.hostname.clone();
        let existing_device_id = self.scan_id_to_device_id.lock().await.get(&scan_id).cloned();

        if let Some(device_id) = existing_device_id {
            self.refresh_device(&device_id, &info).await;
            return;
        }

        let device_id = generate_device_id(Some(&scan_id), false);
        let address = info.addresses.first().map(|a| a.to_string());

        let output = self.build_output(DeviceKind::AirPlay, Some(&info)).await;

        let device = VirtualDevice::new(
            device_id.clone(),
            info.name.clone(),
            DeviceKind::AirPlay,
            Some(scan_id.clone()),
            address,
            output,
            self.config.output_config.clone(),
            self.config.cache_dir.clone(),
            self.event_bus.clone(),
            self.config_store.clone(),
        );
        device.start().await;

        self.devices.lock().await.insert(device_id.clone(), device);
        self.scan_id_to_device_id
            .lock()
            .await
            .insert(scan_id, device_id.clone());

        self.event_bus.publish(Event::for_device(
            device_id,
            EventKind::DeviceConnected,
        ));
    }

    async fn refresh_device(self: &Arc<Self>, device_id: &str, info: &AirPlayDevice) {
        let devices = self.devices.lock().await;
        if let Some(device) = devices.get(device_id) {
            device
                .set_airplay_address(info.addresses.first().map(|a| a.to_string()))
                .await;
            self.event_bus.publish(Event::for_device(
                device_id.to_string(),
                EventKind::DeviceConnected,
            ));
        }
    }

    async fn on_scanner_device_lost(self: &Arc<Self>, scan_id: String) {
        let device_id = self.scan_id_to_device_id.lock().await.remove(&scan_id);
        let Some(device_id) = device_id else {
            return;
        };

        self.event_bus.publish(Event::for_device(
            device_id.clone(),
            EventKind::DeviceOfflineThresholdReached {
                scan_id: scan_id.clone(),
            },
        ));

        self.remove_device(&device_id).await;
    }

    async fn remove_device(self: &Arc<Self>, device_id: &str) {
        let device = self.devices.lock().await.remove(device_id);
        let Some(device) = device else {
            return;
        };

        if device.playback_state().await == airbridge_core::PlaybackState::Playing
            || device.playback_state().await == airbridge_core::PlaybackState::Paused
        {
            self.event_bus
                .publish(Event::for_device(device_id.to_string(), EventKind::Stop));
        }

        device.shutdown().await;

        self.event_bus.publish(Event::for_device(
            device_id.to_string(),
            EventKind::DeviceDisconnected,
        ));
        info!(device_id, "device removed");
    }

    pub async fn device(&self, device_id: &str) -> Option<Arc<VirtualDevice>> {
        self.devices.lock().await.get(device_id).cloned()
    }

    pub async fn devices(&self) -> Vec<Arc<VirtualDevice>> {
        self.devices.lock().await.values().cloned().collect()
    }

    pub async fn shutdown(self: &Arc<Self>) {
        let ids: Vec<String> = self.devices.lock().await.keys().cloned().collect();
        for id in ids {
            self.remove_device(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DeviceManagerConfig {
        DeviceManagerConfig {
            enable_server_speaker: false,
            cache_dir: std::env::temp_dir(),
            output_config: OutputConfig::default(),
        }
    }

    async fn test_config_store() -> Arc<ConfigStore> {
        let path = std::env::temp_dir().join(format!(
            "airbridge-devmgr-test-{}.json",
            uuid::Uuid::new_v4()
        ));
        ConfigStore::load(path).await
    }

    #[tokio::test]
    async fn fresh_manager_has_no_devices() {
        let bus = Arc::new(EventBus::default());
        let store = test_config_store().await;
        let manager = DeviceManager::new(test_config(), bus, store);
        assert!(manager.devices().await.is_empty());
    }

    #[tokio::test]
    async fn device_lost_before_found_is_a_noop() {
        let bus = Arc::new(EventBus::default());
        let store = test_config_store().await;
        let manager = DeviceManager::new(test_config(), bus, store);
        manager.on_scanner_device_lost("unknown.local.".to_string()).await;
        assert!(manager.devices().await.is_empty());
    }
}
