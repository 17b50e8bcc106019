/// DLNA media renderer service: SSDP discovery, device/SCPD description
/// documents, SOAP control and GENA eventing for every device the Device
/// Manager owns, all behind one HTTP port.
pub mod device_description;
pub mod didl;
pub mod gena;
pub mod http_server;
pub mod scpd;
pub mod soap;
pub mod ssdp;

use crate::device_manager::DeviceManager;
use crate::event_bus::EventBus;
use airbridge_core::{EventKind, EventTypeTag};
use gena::SubscriptionTable;
use http_server::AppState;
use ssdp::SsdpResponder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Clone, Debug)]
pub struct DlnaConfig {
    pub http_port: u16,
    pub ssdp_port: u16,
    /// LAN-facing IP to advertise in SSDP `LOCATION`/`USN` headers; `None`
    /// auto-detects via the default route.
    pub bind_ip: Option<IpAddr>,
}

impl Default for DlnaConfig {
    fn default() -> Self {
        Self {
            http_port: 8200,
            ssdp_port: 1900,
            bind_ip: None,
        }
    }
}

pub struct DlnaService {
    http_port: u16,
    ssdp: Arc<SsdpResponder>,
    app_state: AppState,
    http_task: Mutex<Option<JoinHandle<()>>>,
}

impl DlnaService {
    pub fn new(device_manager: Arc<DeviceManager>, event_bus: Arc<EventBus>, config: DlnaConfig) -> Arc<Self> {
        let http_port = config.http_port;
        let subscriptions = Arc::new(SubscriptionTable::new());
        let ssdp = SsdpResponder::with_bind(
            device_manager.clone(),
            http_port,
            config.ssdp_port,
            config.bind_ip,
        );
        let app_state = AppState {
            device_manager,
            event_bus: event_bus.clone(),
            subscriptions,
        };

        let notify_state = app_state.clone();
        event_bus.subscribe(
            EventTypeTag::StateChanged,
            None,
            Arc::new(move |event| {
                let state = notify_state.clone();
                Box::pin(async move {
                    if let EventKind::StateChanged { state: new_state } = event.kind {
                        if let Some(device_id) = &event.device_id {
                            if let Some(device) = state.device_manager.device(device_id).await {
                                let url = device.current_url().await;
                                let actions = soap::transport_actions_for(new_state);
                                let active_ip =
                                    device.active_client().await.map(|(ip, _)| ip);
                                gena::notify_state_changed(
                                    &state.subscriptions,
                                    device_id,
                                    active_ip.as_deref(),
                                    new_state,
                                    &url,
                                    actions,
                                )
                                .await;
                            }
                        }
                    }
                    Ok(())
                })
            }),
        );

        Arc::new(Self {
            http_port,
            ssdp,
            app_state,
            http_task: Mutex::new(None),
        })
    }

    /// Binds the HTTP router and starts SSDP advertisement. Both halves
    /// keep running until `stop` is called.
    pub async fn start(self: &Arc<Self>) {
        let router = http_server::build_router(self.app_state.clone());
        let addr: SocketAddr = ([0, 0, 0, 0], self.http_port).into();

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, port = self.http_port, "failed to bind dlna http port");
                return;
            }
        };

        let task = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service).await {
                error!(error = %e, "dlna http server exited");
            }
        });
        *self.http_task.lock().await = Some(task);

        self.ssdp.start().await;
        info!(port = self.http_port, "dlna service started");
    }

    pub async fn stop(self: &Arc<Self>) {
        self.ssdp.stop().await;
        if let Some(task) = self.http_task.lock().await.take() {
            task.abort();
        }
        info!("dlna service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::ConfigStore;
    use crate::types::OutputConfig;
    use std::path::PathBuf;

    #[tokio::test]
    async fn service_can_be_constructed() {
        let bus = Arc::new(EventBus::default());
        let store = ConfigStore::load(std::env::temp_dir().join(format!(
            "airbridge-dlnasvc-test-{}.json",
            uuid::Uuid::new_v4()
        )))
        .await;
        let manager = DeviceManager::new(
            crate::device_manager::DeviceManagerConfig {
                enable_server_speaker: false,
                cache_dir: PathBuf::from(std::env::temp_dir()),
                output_config: OutputConfig::default(),
            },
            bus.clone(),
            store,
        );
        let service = DlnaService::new(
            manager,
            bus,
            DlnaConfig {
                http_port: 0,
                ssdp_port: 0,
                bind_ip: None,
            },
        );
        assert_eq!(service.http_port, 0);
    }
}
