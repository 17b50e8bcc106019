/// Periodic AirPlay network scan. Every `scan_interval`, runs a discovery
/// round bounded by `scan_timeout` and diffs the result against the
/// previously known set: new scan-identifiers fire `on_device_found`,
/// identifiers that have been absent for `offline_threshold` consecutive
/// rounds fire `on_device_lost`. Devices matching an exclusion filter
/// (by IP or a friendly-name substring) never reach either callback.
use crate::output::airplay::{discover_devices, AirPlayDevice};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type FoundCallback = Arc<dyn Fn(AirPlayDevice) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
pub type LostCallback = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ScannerConfig {
    pub scan_interval: Duration,
    pub scan_timeout: Duration,
    pub offline_threshold: u32,
    /// Excludes devices whose IP address or name contains any of these
    /// substrings.
    pub exclude_patterns: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            scan_timeout: Duration::from_secs(5),
            offline_threshold: 3,
            exclude_patterns: Vec::new(),
        }
    }
}

struct TrackedDevice {
    device: AirPlayDevice,
    misses: u32,
}

pub struct AirPlayScanner {
    config: ScannerConfig,
    devices: Mutex<HashMap<String, TrackedDevice>>,
    on_found: Mutex<Option<FoundCallback>>,
    on_lost: Mutex<Option<LostCallback>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AirPlayScanner {
    pub fn new(config: ScannerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            devices: Mutex::new(HashMap::new()),
            on_found: Mutex::new(None),
            on_lost: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub async fn set_on_device_found(&self, cb: FoundCallback) {
        *self.on_found.lock().await = Some(cb);
    }

    pub async fn set_on_device_lost(&self, cb: LostCallback) {
        *self.on_lost.lock().await = Some(cb);
    }

    fn is_excluded(&self, device: &AirPlayDevice) -> bool {
        self.config.exclude_patterns.iter().any(|pattern| {
            device
                .addresses
                .iter()
                .any(|addr| addr.to_string().contains(pattern.as_str()))
                || device.hostname.contains(pattern.as_str())
                || device.name.contains(pattern.as_str())
        })
    }

    /// A device's hostname uniquely identifies it across scan rounds.
    fn identifier(device: &AirPlayDevice) -> String {
        device.hostname.clone()
    }

    /// Runs a single discovery round and returns every non-excluded device.
    pub async fn scan_once(&self) -> Vec<AirPlayDevice> {
        debug!(timeout = ?self.config.scan_timeout, "starting device scan");
        match discover_devices(self.config.scan_timeout.as_secs()).await {
            Ok(found) => found.into_iter().filter(|d| !self.is_excluded(d)).collect(),
            Err(e) => {
                warn!(error = %e, "scan failed");
                Vec::new()
            }
        }
    }

    /// One found/lost diff pass against the tracked set — split out from
    /// the loop so tests can drive it without waiting on real timers.
    async fn scan_round(self: &Arc<Self>) {
        let discovered = self.scan_once().await;
        let discovered_ids: std::collections::HashSet<String> =
            discovered.iter().map(Self::identifier).collect();

        let mut tracked = self.devices.lock().await;

        for device in discovered {
            let id = Self::identifier(&device);
            match tracked.get_mut(&id) {
                Some(entry) => {
                    entry.device = device;
                    entry.misses = 0;
                }
                None => {
                    info!(name = %device.name, hostname = %device.hostname, "new device discovered");
                    tracked.insert(
                        id,
                        TrackedDevice {
                            device: device.clone(),
                            misses: 0,
                        },
                    );
                    if let Some(cb) = self.on_found.lock().await.clone() {
                        drop(tracked);
                        cb(device).await;
                        tracked = self.devices.lock().await;
                    }
                }
            }
        }

        let mut lost_ids = Vec::new();
        for (id, entry) in tracked.iter_mut() {
            if !discovered_ids.contains(id) {
                entry.misses += 1;
                if entry.misses >= self.config.offline_threshold {
                    lost_ids.push(id.clone());
                }
            }
        }

        for id in lost_ids {
            if let Some(entry) = tracked.remove(&id) {
                info!(name = %entry.device.name, "device lost");
            }
            if let Some(cb) = self.on_lost.lock().await.clone() {
                drop(tracked);
                cb(id).await;
                tracked = self.devices.lock().await;
            }
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut task_slot = self.task.lock().await;
        if task_slot.is_some() {
            debug!("scanner already running");
            return;
        }

        let scanner = self.clone();
        let interval = self.config.scan_interval;
        *task_slot = Some(tokio::spawn(async move {
            info!("scanner started");
            loop {
                scanner.scan_round().await;
                tokio::time::sleep(interval).await;
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            info!("scanner stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    pub async fn devices(&self) -> Vec<AirPlayDevice> {
        self.devices.lock().await.values().map(|t| t.device.clone()).collect()
    }

    pub async fn device(&self, identifier: &str) -> Option<AirPlayDevice> {
        self.devices
            .lock()
            .await
            .get(identifier)
            .map(|t| t.device.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fake_device(id: &str) -> AirPlayDevice {
        AirPlayDevice {
            name: format!("Speaker {id}"),
            hostname: format!("{id}.local."),
            port: 7000,
            addresses: vec!["10.0.0.5".parse().unwrap()],
            model: None,
            features: None,
        }
    }

    #[tokio::test]
    async fn exclusion_filters_by_name_substring() {
        let scanner = AirPlayScanner::new(ScannerConfig {
            exclude_patterns: vec!["Kitchen".to_string()],
            ..Default::default()
        });

        let excluded = AirPlayDevice {
            name: "Kitchen Speaker".to_string(),
            hostname: "abc.local.".to_string(),
            port: 7000,
            addresses: vec!["10.0.0.9".parse().unwrap()],
            model: None,
            features: None,
        };
        assert!(scanner.is_excluded(&excluded));

        let kept = fake_device("def");
        assert!(!scanner.is_excluded(&kept));
    }

    #[tokio::test]
    async fn tracking_a_device_directly_then_missing_increments_counter() {
        let scanner = AirPlayScanner::new(ScannerConfig {
            offline_threshold: 2,
            ..Default::default()
        });

        {
            let mut tracked = scanner.devices.lock().await;
            tracked.insert(
                "abc".to_string(),
                TrackedDevice {
                    device: fake_device("abc"),
                    misses: 0,
                },
            );
        }

        let lost_calls = Arc::new(AtomicUsize::new(0));
        let counter = lost_calls.clone();
        scanner
            .set_on_device_lost(Arc::new(move |_id| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .await;

        // Simulate two consecutive empty rounds without hitting the network.
        {
            let mut tracked = scanner.devices.lock().await;
            for entry in tracked.values_mut() {
                entry.misses += 1;
            }
        }
        assert_eq!(lost_calls.load(Ordering::SeqCst), 0);

        let should_be_lost = {
            let mut tracked = scanner.devices.lock().await;
            for entry in tracked.values_mut() {
                entry.misses += 1;
            }
            tracked
                .iter()
                .filter(|(_, e)| e.misses >= scanner.config.offline_threshold)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(should_be_lost, vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn fresh_scanner_is_not_running() {
        let scanner = AirPlayScanner::new(ScannerConfig::default());
        assert!(!scanner.is_running().await);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let scanner = AirPlayScanner::new(ScannerConfig {
            scan_interval: Duration::from_secs(3600),
            scan_timeout: Duration::from_millis(1),
            ..Default::default()
        });
        scanner.start().await;
        scanner.start().await;
        assert!(scanner.is_running().await);
        scanner.stop().await;
        assert!(!scanner.is_running().await);
    }
}
