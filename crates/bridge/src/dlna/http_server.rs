/// Single-port HTTP router serving device descriptions, static SCPD
/// documents, SOAP actions and GENA subscriptions for every local device.
use super::gena::{ServiceKind, SubscriptionTable};
use super::{device_description, scpd, soap};
use crate::device_manager::DeviceManager;
use crate::event_bus::EventBus;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, on, MethodFilter};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    pub device_manager: Arc<DeviceManager>,
    pub event_bus: Arc<EventBus>,
    pub subscriptions: Arc<SubscriptionTable>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/device/:id/device.xml", get(device_xml))
        .route("/device/:id/AVTransport.xml", get(avtransport_scpd))
        .route("/device/:id/RenderingControl.xml", get(rendering_control_scpd))
        .route("/device/:id/ConnectionManager.xml", get(connection_manager_scpd))
        .route("/device/:id/ctl/:service", on(MethodFilter::POST, soap_action))
        .route(
            "/device/:id/evt/:service",
            axum::routing::MethodRouter::new().fallback(gena_evt),
        )
        .with_state(state)
}

async fn device_xml(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(device) = state.device_manager.device(&id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let base_url = format!("http://{host}/device/{id}");
    let xml = device_description::generate_device_description(&device, &base_url);
    ([("Content-Type", "text/xml; charset=utf-8")], xml).into_response()
}

async fn avtransport_scpd(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    scpd_response(&state, &id, ServiceKind::AvTransport).await
}

async fn rendering_control_scpd(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    scpd_response(&state, &id, ServiceKind::RenderingControl).await
}

async fn connection_manager_scpd(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    scpd_response(&state, &id, ServiceKind::ConnectionManager).await
}

async fn scpd_response(state: &AppState, id: &str, service: ServiceKind) -> Response {
    if state.device_manager.device(id).await.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [("Content-Type", "text/xml; charset=utf-8")],
        scpd::scpd_for(service),
    )
        .into_response()
}

fn action_name_from_header(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("soapaction")?.to_str().ok()?;
    let raw = raw.trim_matches('"');
    raw.rsplit('#').next().map(|s| s.to_string())
}

async fn soap_action(
    State(state): State<AppState>,
    Path((id, service)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(device) = state.device_manager.device(&id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(service) = ServiceKind::from_path_segment(&service) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(action) = action_name_from_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing SOAPAction header").into_response();
    };

    let client_ip = addr.ip().to_string();
    debug!(device = %id, %action, client = %client_ip, "soap action");

    match soap::dispatch(
        service,
        &action,
        &body,
        &device,
        &state.event_bus,
        &state.subscriptions,
        &client_ip,
    )
    .await
    {
        Ok(envelope) => (
            StatusCode::OK,
            [("Content-Type", "text/xml; charset=utf-8")],
            envelope,
        )
            .into_response(),
        Err(fault) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("Content-Type", "text/xml; charset=utf-8")],
            soap::fault_envelope(fault),
        )
            .into_response(),
    }
}

fn first_callback_url(header: &str) -> Option<String> {
    header.split(['<', '>']).find(|s| s.starts_with("http")).map(|s| s.to_string())
}

fn timeout_secs(header: Option<&str>) -> u64 {
    header
        .and_then(|h| h.strip_prefix("Second-"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(super::gena::DEFAULT_TIMEOUT_SECS)
}

async fn gena_evt(
    method: Method,
    state: State<AppState>,
    path: Path<(String, String)>,
    addr: ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    match method.as_str() {
        "SUBSCRIBE" => gena_subscribe(state, path, addr, headers).await,
        "UNSUBSCRIBE" => gena_unsubscribe(state, path, headers).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn gena_subscribe(
    State(state): State<AppState>,
    Path((id, service)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(device) = state.device_manager.device(&id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(service_kind) = ServiceKind::from_path_segment(&service) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let client_ip = addr.ip().to_string();
    let timeout = timeout_secs(headers.get("timeout").and_then(|v| v.to_str().ok()));

    if let Some(sid) = headers.get("sid").and_then(|v| v.to_str().ok()) {
        if state.subscriptions.renew(sid, timeout).await {
            return (
                StatusCode::OK,
                [("SID", sid.to_string()), ("TIMEOUT", format!("Second-{timeout}"))],
                "",
            )
                .into_response();
        }
        return StatusCode::PRECONDITION_FAILED.into_response();
    }

    let Some(callback_header) = headers.get("callback").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing CALLBACK header").into_response();
    };
    let Some(callback) = first_callback_url(callback_header) else {
        return (StatusCode::BAD_REQUEST, "malformed CALLBACK header").into_response();
    };

    let sid = state
        .subscriptions
        .subscribe(&device.device_id, service_kind, &client_ip, &callback, timeout)
        .await;

    if service_kind == ServiceKind::AvTransport {
        send_initial_notify(&state, &device, &sid).await;
    }

    (
        StatusCode::OK,
        [("SID", sid), ("TIMEOUT", format!("Second-{timeout}"))],
        "",
    )
        .into_response()
}

async fn send_initial_notify(state: &AppState, device: &crate::virtual_device::VirtualDevice, sid: &str) {
    let subs = state.subscriptions.avtransport_subscribers(&device.device_id).await;
    let Some(sub) = subs.into_iter().find(|s| s.sid == sid) else {
        return;
    };
    let playback_state = device.playback_state().await;
    let url = device.current_url().await;
    let actions = soap::transport_actions_for(playback_state);
    let last_change = super::gena::build_last_change(playback_state, &url, actions);
    super::gena::send_notify(&state.subscriptions, &sub, &last_change, 0).await;
}

async fn gena_unsubscribe(
    State(state): State<AppState>,
    Path((id, _service)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if state.device_manager.device(&id).await.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(sid) = headers.get("sid").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing SID header").into_response();
    };
    if state.subscriptions.unsubscribe(sid).await {
        StatusCode::OK.into_response()
    } else {
        warn!(sid, "unsubscribe for unknown sid");
        StatusCode::PRECONDITION_FAILED.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::ConfigStore;
    use crate::device_manager::{DeviceManager, DeviceManagerConfig};
    use crate::output::airplay::AirPlayDevice;
    use crate::types::OutputConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_app() -> (Router, String) {
        let bus = Arc::new(EventBus::default());
        let store = ConfigStore::load(std::env::temp_dir().join(format!(
            "airbridge-httpsrv-test-{}.json",
            uuid::Uuid::new_v4()
        )))
        .await;
        let manager = DeviceManager::new(
            DeviceManagerConfig {
                enable_server_speaker: false,
                cache_dir: std::env::temp_dir(),
                output_config: OutputConfig::default(),
            },
            bus.clone(),
            store,
        );
        manager
            .set_output_factory(Arc::new(|_kind, _info| Box::new(MockSink::default())))
            .await;
        manager
            .on_scanner_device_found(AirPlayDevice {
                name: "Living Room".to_string(),
                hostname: "living-room.local.".to_string(),
                port: 7000,
                addresses: vec!["192.168.1.20".parse().unwrap()],
                model: None,
                features: None,
            })
            .await;
        let device_id = manager.devices().await[0].device_id.clone();

        let state = AppState {
            device_manager: manager,
            event_bus: bus,
            subscriptions: Arc::new(SubscriptionTable::new()),
        };
        (build_router(state), device_id)
    }

    fn soap_request(device_id: &str, service: &str, action: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/device/{device_id}/ctl/{service}"))
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"urn:schemas-upnp-org:service:{service}:1#{action}\""))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn with_connect_info(mut request: Request<Body>, ip: &str) -> Request<Body> {
        let addr: SocketAddr = format!("{ip}:12345").parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    #[derive(Default)]
    struct MockSink {
        open: bool,
    }

    #[async_trait::async_trait]
    impl crate::output::OutputSink for MockSink {
        fn name(&self) -> &'static str {
            "mock"
        }
        async fn open(&mut self, _cfg: OutputConfig) -> anyhow::Result<()> {
            self.open = true;
            Ok(())
        }
        async fn write(&mut self, _block: crate::types::AudioBlock<'_>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn drain(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close(&mut self) -> anyhow::Result<()> {
            self.open = false;
            Ok(())
        }
        fn latency_ms(&self) -> u32 {
            0
        }
        fn is_open(&self) -> bool {
            self.open
        }
    }

    #[tokio::test]
    async fn device_xml_returns_device_description() {
        let (router, device_id) = test_app().await;
        let request = Request::builder()
            .uri(format!("/device/{device_id}/device.xml"))
            .header("Host", "127.0.0.1:8200")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let xml = String::from_utf8(body.to_vec()).unwrap();
        assert!(xml.contains("AVTransport"));
        assert!(xml.contains(&device_id));
    }

    #[tokio::test]
    async fn device_xml_unknown_device_is_not_found() {
        let (router, _device_id) = test_app().await;
        let request = Request::builder()
            .uri("/device/does-not-exist/device.xml")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_transport_info_reports_stopped_for_fresh_device() {
        let (router, device_id) = test_app().await;
        let request = with_connect_info(
            soap_request(
                &device_id,
                "AVTransport",
                "GetTransportInfo",
                "<InstanceID>0</InstanceID>",
            ),
            "192.168.1.5",
        );

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let xml = String::from_utf8(body.to_vec()).unwrap();
        assert!(xml.contains("STOPPED"));
    }

    #[tokio::test]
    async fn set_av_transport_uri_then_stop_round_trip() {
        let (router, device_id) = test_app().await;

        let set_uri = with_connect_info(
            soap_request(
                &device_id,
                "AVTransport",
                "SetAVTransportURI",
                "<InstanceID>0</InstanceID><CurrentURI>http://example.com/stream.mp3</CurrentURI>\
                 <CurrentURIMetaData></CurrentURIMetaData>",
            ),
            "192.168.1.5",
        );
        let response = router.clone().oneshot(set_uri).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // A different control point has no active session on this device yet.
        let stop_from_other = with_connect_info(
            soap_request(&device_id, "AVTransport", "Stop", "<InstanceID>0</InstanceID>"),
            "192.168.1.99",
        );
        let response = router.clone().oneshot(stop_from_other).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let stop_from_owner = with_connect_info(
            soap_request(&device_id, "AVTransport", "Stop", "<InstanceID>0</InstanceID>"),
            "192.168.1.5",
        );
        let response = router.oneshot(stop_from_owner).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn set_volume_out_of_range_is_a_soap_fault() {
        let (router, device_id) = test_app().await;

        let set_uri = with_connect_info(
            soap_request(
                &device_id,
                "AVTransport",
                "SetAVTransportURI",
                "<InstanceID>0</InstanceID><CurrentURI>http://example.com/stream.mp3</CurrentURI>\
                 <CurrentURIMetaData></CurrentURIMetaData>",
            ),
            "192.168.1.5",
        );
        router.clone().oneshot(set_uri).await.unwrap();

        let set_volume = with_connect_info(
            soap_request(
                &device_id,
                "RenderingControl",
                "SetVolume",
                "<InstanceID>0</InstanceID><Channel>Master</Channel><DesiredVolume>500</DesiredVolume>",
            ),
            "192.168.1.5",
        );
        let response = router.oneshot(set_volume).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let xml = String::from_utf8(body.to_vec()).unwrap();
        assert!(xml.contains("402"));
    }

    #[tokio::test]
    async fn gena_subscribe_then_unsubscribe_round_trip() {
        let (router, device_id) = test_app().await;

        let subscribe = Request::builder()
            .method("SUBSCRIBE")
            .uri(format!("/device/{device_id}/evt/AVTransport"))
            .header("CALLBACK", "<http://192.168.1.5:1400/evt>")
            .header("NT", "upnp:event")
            .header("TIMEOUT", "Second-1800")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(subscribe).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let sid = response
            .headers()
            .get("SID")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();

        let unsubscribe = Request::builder()
            .method("UNSUBSCRIBE")
            .uri(format!("/device/{device_id}/evt/AVTransport"))
            .header("SID", sid)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(unsubscribe).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn gena_unsubscribe_unknown_sid_is_precondition_failed() {
        let (router, device_id) = test_app().await;
        let unsubscribe = Request::builder()
            .method("UNSUBSCRIBE")
            .uri(format!("/device/{device_id}/evt/AVTransport"))
            .header("SID", "uuid:not-a-real-subscription")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(unsubscribe).await.unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[test]
    fn action_name_strips_urn_and_quotes() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "soapaction",
            "\"urn:schemas-upnp-org:service:AVTransport:1#Play\"".parse().unwrap(),
        );
        assert_eq!(action_name_from_header(&headers).as_deref(), Some("Play"));
    }

    #[test]
    fn first_callback_url_extracts_angle_bracketed_url() {
        let header = "<http://10.0.0.2:1400/evt>";
        assert_eq!(first_callback_url(header).as_deref(), Some("http://10.0.0.2:1400/evt"));
    }

    #[test]
    fn timeout_secs_parses_second_prefixed_header() {
        assert_eq!(timeout_secs(Some("Second-1800")), 1800);
        assert_eq!(timeout_secs(Some("Second-infinite")), super::super::gena::DEFAULT_TIMEOUT_SECS);
        assert_eq!(timeout_secs(None), super::super::gena::DEFAULT_TIMEOUT_SECS);
    }
}
