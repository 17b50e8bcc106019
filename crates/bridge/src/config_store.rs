/// Persistent per-device DSP configuration, backed by a JSON document.
///
/// Schema: `{"devices": {device-id: {"dsp_enabled": bool, "dsp_config": {...}}}}`.
/// Subscribes to `DSP_CHANGED` so every configuration change is saved without
/// the rest of the system needing to know persistence exists. Writes go to a
/// sibling temp file and are renamed into place so a crash mid-write never
/// corrupts the previous good state.
use crate::event_bus::EventBus;
use airbridge_core::{DspConfig, Event, EventKind, EventTypeTag};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub dsp_enabled: bool,
    pub dsp_config: Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    devices: HashMap<String, DeviceConfig>,
}

pub struct ConfigStore {
    path: PathBuf,
    doc: RwLock<ConfigDocument>,
}

impl ConfigStore {
    /// Loads `path` if it exists and is valid JSON; otherwise starts empty.
    /// A missing or unparseable file is never an error — it just means
    /// there is nothing saved yet.
    pub async fn load(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<ConfigDocument>(&contents) {
                Ok(doc) => {
                    info!(devices = doc.devices.len(), "loaded config store");
                    doc
                }
                Err(e) => {
                    warn!(error = %e, "config file is not valid JSON, starting empty");
                    ConfigDocument::default()
                }
            },
            Err(_) => {
                debug!("config file not found, starting empty");
                ConfigDocument::default()
            }
        };

        Arc::new(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    /// Subscribes this store to `DSP_CHANGED` on `bus` so every DSP change
    /// is persisted automatically. `device_id` identifies the subscriber
    /// scope — pass `None` to receive every device's changes (the usual
    /// bootstrap wiring, since one store serves every device).
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let store = self.clone();
        bus.subscribe(
            EventTypeTag::DspChanged,
            None,
            Arc::new(move |event: Event| {
                let store = store.clone();
                Box::pin(async move {
                    let Some(device_id) = event.device_id.clone() else {
                        return Ok(());
                    };
                    if let EventKind::DspChanged { enabled, config } = event.kind {
                        store.set_device_config(&device_id, enabled, config).await;
                    }
                    Ok(())
                })
            }),
        );
    }

    pub async fn get_device_config(&self, device_id: &str) -> Option<DeviceConfig> {
        self.doc.read().await.devices.get(device_id).cloned()
    }

    pub async fn set_device_config(&self, device_id: &str, dsp_enabled: bool, dsp_config: Value) {
        {
            let mut doc = self.doc.write().await;
            doc.devices.insert(
                device_id.to_string(),
                DeviceConfig {
                    dsp_enabled,
                    dsp_config,
                },
            );
        }
        if let Err(e) = self.save().await {
            warn!(error = %e, "failed to persist config store");
        } else {
            debug!(device_id, "saved device config");
        }
    }

    pub async fn get_dsp_enabled(&self, device_id: &str) -> bool {
        self.get_device_config(device_id)
            .await
            .map(|c| c.dsp_enabled)
            .unwrap_or(false)
    }

    pub async fn get_dsp_config(&self, device_id: &str) -> DspConfig {
        match self.get_device_config(device_id).await {
            Some(c) => {
                let mut config = DspConfig::default();
                config.merge(&c.dsp_config);
                config
            }
            None => DspConfig::default(),
        }
    }

    async fn save(&self) -> anyhow::Result<()> {
        let body = {
            let doc = self.doc.read().await;
            serde_json::to_string_pretty(&*doc)?
        };

        let tmp_path = tmp_sibling(&self.path);
        tokio::fs::write(&tmp_path, body).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let suffix = format!(".tmp-{}", uuid::Uuid::new_v4());
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_path::temp_config_path;

    mod tempfile_path {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub fn temp_config_path() -> PathBuf {
            let n = COUNTER.fetch_add(1, Ordering::SeqCst);
            std::env::temp_dir().join(format!("airbridge-config-store-test-{n}.json"))
        }
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let path = temp_config_path();
        let store = ConfigStore::load(&path).await;
        assert!(store.get_device_config("dev-1").await.is_none());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let path = temp_config_path();
        let store = ConfigStore::load(&path).await;

        store
            .set_device_config("dev-1", true, serde_json::json!({"eq_enabled": true}))
            .await;

        let cfg = store.get_device_config("dev-1").await.unwrap();
        assert!(cfg.dsp_enabled);

        let dsp = store.get_dsp_config("dev-1").await;
        assert!(dsp.eq_enabled);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn unknown_device_returns_default_dsp_config() {
        let path = temp_config_path();
        let store = ConfigStore::load(&path).await;
        let dsp = store.get_dsp_config("missing").await;
        assert!(dsp.is_identity());
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let path = temp_config_path();
        {
            let store = ConfigStore::load(&path).await;
            store
                .set_device_config("dev-1", false, serde_json::json!({}))
                .await;
        }

        let reloaded = ConfigStore::load(&path).await;
        assert!(reloaded.get_device_config("dev-1").await.is_some());

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn dsp_changed_event_persists_config() {
        let path = temp_config_path();
        let store = ConfigStore::load(&path).await;
        let bus = EventBus::new();
        store.attach(&bus);

        bus.publish_async(Event::for_device(
            "dev-2",
            EventKind::DspChanged {
                enabled: true,
                config: serde_json::json!({"use_compression": true}),
            },
        ))
        .await;

        let dsp = store.get_dsp_config("dev-2").await;
        assert!(dsp.use_compression);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
