/// SSDP advertisement: multicast `NOTIFY ssdp:alive` for every local device
/// every 30 seconds, and `M-SEARCH` responses on demand. Each virtual
/// device advertises itself under five search targets (root device,
/// MediaRenderer, AVTransport, RenderingControl, ConnectionManager) with a
/// `LOCATION` pointing at that device's own description document.
use crate::device_manager::DeviceManager;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SSDP_MULTICAST_IP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const DEFAULT_SSDP_PORT: u16 = 1900;
const SSDP_ALIVE_INTERVAL_SECS: u64 = 30;

const SEARCH_TARGETS: &[&str] = &[
    "upnp:rootdevice",
    "urn:schemas-upnp-org:device:MediaRenderer:1",
    "urn:schemas-upnp-org:service:AVTransport:1",
    "urn:schemas-upnp-org:service:RenderingControl:1",
    "urn:schemas-upnp-org:service:ConnectionManager:1",
];

pub struct SsdpResponder {
    device_manager: Arc<DeviceManager>,
    http_port: u16,
    ssdp_port: u16,
    bind_ip: Option<IpAddr>,
    running: Arc<AtomicBool>,
    notify_task: Mutex<Option<JoinHandle<()>>>,
    search_task: Mutex<Option<JoinHandle<()>>>,
}

impl SsdpResponder {
    pub fn new(device_manager: Arc<DeviceManager>, http_port: u16) -> Arc<Self> {
        Self::with_bind(device_manager, http_port, DEFAULT_SSDP_PORT, None)
    }

    pub fn with_bind(
        device_manager: Arc<DeviceManager>,
        http_port: u16,
        ssdp_port: u16,
        bind_ip: Option<IpAddr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_manager,
            http_port,
            ssdp_port,
            bind_ip,
            running: Arc::new(AtomicBool::new(false)),
            notify_task: Mutex::new(None),
            search_task: Mutex::new(None),
        })
    }

    fn multicast_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(SSDP_MULTICAST_IP), self.ssdp_port)
    }

    fn local_ip(&self) -> std::io::Result<IpAddr> {
        match self.bind_ip {
            Some(ip) => Ok(ip),
            None => get_local_ip(),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("ssdp responder already running");
            return;
        }

        self.broadcast_alive().await;

        let notify_self = self.clone();
        *self.notify_task.lock().await = Some(tokio::spawn(async move {
            notify_self.periodic_notify_loop().await;
        }));

        let search_self = self.clone();
        *self.search_task.lock().await = Some(tokio::spawn(async move {
            search_self.msearch_loop().await;
        }));

        info!("ssdp responder started");
    }

    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.broadcast_byebye().await;

        if let Some(task) = self.notify_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.search_task.lock().await.take() {
            task.abort();
        }

        info!("ssdp responder stopped");
    }

    async fn periodic_notify_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(SSDP_ALIVE_INTERVAL_SECS)).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.broadcast_alive().await;
        }
    }

    async fn broadcast_alive(&self) {
        let local_ip = match self.local_ip() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, "could not determine local ip for ssdp notify");
                return;
            }
        };

        for device in self.device_manager.devices().await {
            let location = device_location(local_ip, self.http_port, &device.device_id);
            for st in SEARCH_TARGETS {
                let usn = usn_for(&device.dlna_uuid, st);
                let message = notify_message(&self.multicast_addr(), &location, st, &usn, "ssdp:alive");
                if let Err(e) = send_multicast(&message, self.multicast_addr()) {
                    warn!(error = %e, device = %device.device_id, "failed to send ssdp notify");
                }
            }
        }
        debug!("sent ssdp:alive for all devices");
    }

    async fn broadcast_byebye(&self) {
        for device in self.device_manager.devices().await {
            for st in SEARCH_TARGETS {
                let usn = usn_for(&device.dlna_uuid, st);
                let addr = self.multicast_addr();
                let message = format!(
                    "NOTIFY * HTTP/1.1\r\nHOST: {addr}\r\nNT: {st}\r\nNTS: ssdp:byebye\r\nUSN: {usn}\r\n\r\n"
                );
                let _ = send_multicast(&message, addr);
            }
        }
    }

    async fn msearch_loop(self: Arc<Self>) {
        let socket = match create_msearch_listener(self.ssdp_port) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to create m-search listener");
                return;
            }
        };
        socket.set_nonblocking(true).ok();

        while self.running.load(Ordering::SeqCst) {
            let mut buf = [0u8; 2048];
            match socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    let request = String::from_utf8_lossy(&buf[..len]);
                    if request.starts_with("M-SEARCH") {
                        let st = extract_search_target(&request);
                        self.respond_to_search(&socket, addr, &st).await;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    warn!(error = %e, "error receiving m-search");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn respond_to_search(&self, socket: &UdpSocket, dest: SocketAddr, st: &str) {
        let local_ip = match self.local_ip() {
            Ok(ip) => ip,
            Err(_) => return,
        };

        for device in self.device_manager.devices().await {
            let matches = st == "ssdp:all"
                || st == device.dlna_uuid
                || SEARCH_TARGETS.contains(&st);
            if !matches {
                continue;
            }
            let location = device_location(local_ip, self.http_port, &device.device_id);
            let usn = usn_for(&device.dlna_uuid, st);
            let response = format!(
                "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=1800\r\nEXT:\r\nLOCATION: {location}\r\nSERVER: Linux UPnP/1.0 airbridge-dlna/1.0\r\nST: {st}\r\nUSN: {usn}\r\n\r\n"
            );
            if let Err(e) = socket.send_to(response.as_bytes(), dest) {
                warn!(error = %e, "failed to send m-search response");
            }
        }
    }
}

fn device_location(local_ip: IpAddr, http_port: u16, device_id: &str) -> String {
    format!("http://{local_ip}:{http_port}/device/{device_id}/device.xml")
}

fn usn_for(dlna_uuid: &str, st: &str) -> String {
    if st == "upnp:rootdevice" {
        format!("{dlna_uuid}::upnp:rootdevice")
    } else if st.starts_with("uuid:") {
        dlna_uuid.to_string()
    } else {
        format!("{dlna_uuid}::{st}")
    }
}

fn notify_message(multicast_addr: &SocketAddr, location: &str, nt: &str, usn: &str, nts: &str) -> String {
    format!(
        "NOTIFY * HTTP/1.1\r\nHOST: {multicast_addr}\r\nCACHE-CONTROL: max-age=1800\r\nLOCATION: {location}\r\nNT: {nt}\r\nNTS: {nts}\r\nSERVER: Linux UPnP/1.0 airbridge-dlna/1.0\r\nUSN: {usn}\r\n\r\n"
    )
}

fn create_msearch_listener(ssdp_port: u16) -> std::io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let addr: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), ssdp_port);
    socket.bind(&addr.into())?;

    let socket: UdpSocket = socket.into();
    socket.join_multicast_v4(&SSDP_MULTICAST_IP, &Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}

fn send_multicast(message: &str, addr: SocketAddr) -> std::io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_multicast_ttl_v4(2)?;
    socket.send_to(message.as_bytes(), addr)?;
    Ok(())
}

fn extract_search_target(request: &str) -> String {
    for line in request.lines() {
        if line.to_uppercase().starts_with("ST:") {
            return line
                .split_once(':')
                .map(|(_, value)| value.trim().to_string())
                .unwrap_or_default();
        }
    }
    String::new()
}

fn get_local_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usn_for_root_device() {
        assert_eq!(usn_for("uuid:abc", "upnp:rootdevice"), "uuid:abc::upnp:rootdevice");
    }

    #[test]
    fn usn_for_uuid_search_target() {
        assert_eq!(usn_for("uuid:abc", "uuid:abc"), "uuid:abc");
    }

    #[test]
    fn usn_for_service_target() {
        assert_eq!(
            usn_for("uuid:abc", "urn:schemas-upnp-org:service:AVTransport:1"),
            "uuid:abc::urn:schemas-upnp-org:service:AVTransport:1"
        );
    }

    #[test]
    fn extract_search_target_is_case_insensitive() {
        let req = "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nst: ssdp:all\r\n\r\n";
        assert_eq!(extract_search_target(req), "ssdp:all");
    }

    #[test]
    fn device_location_points_at_per_device_path() {
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(
            device_location(ip, 8200, "dev1"),
            "http://10.0.0.5:8200/device/dev1/device.xml"
        );
    }

    #[tokio::test]
    async fn bind_ip_override_skips_route_detection() {
        let bus = Arc::new(crate::event_bus::EventBus::default());
        let store = crate::config_store::ConfigStore::load(std::env::temp_dir().join(format!(
            "airbridge-ssdp-test-{}.json",
            uuid::Uuid::new_v4()
        )))
        .await;
        let manager = DeviceManager::new(
            crate::device_manager::DeviceManagerConfig {
                enable_server_speaker: false,
                cache_dir: std::env::temp_dir(),
                output_config: crate::types::OutputConfig::default(),
            },
            bus,
            store,
        );
        let pinned: IpAddr = "192.168.1.50".parse().unwrap();
        let responder = SsdpResponder::with_bind(manager, 8200, 19000, Some(pinned));
        assert_eq!(responder.local_ip().unwrap(), pinned);
        assert_eq!(responder.multicast_addr().port(), 19000);
    }
}
