/// GENA event subscriptions: `SUBSCRIBE`/`UNSUBSCRIBE`/`NOTIFY` plumbing.
///
/// The subscription table is the DLNA Service's own state (mutated only
/// from the HTTP router's task); `VirtualDevice` never touches it. Each
/// subscription is keyed by a random SID and scoped to one
/// `(device-id, service)` pair.
use airbridge_core::PlaybackState;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    AvTransport,
    RenderingControl,
    ConnectionManager,
}

impl ServiceKind {
    pub fn path_segment(self) -> &'static str {
        match self {
            ServiceKind::AvTransport => "AVTransport",
            ServiceKind::RenderingControl => "RenderingControl",
            ServiceKind::ConnectionManager => "ConnectionManager",
        }
    }

    pub fn from_path_segment(s: &str) -> Option<Self> {
        match s {
            "AVTransport" => Some(ServiceKind::AvTransport),
            "RenderingControl" => Some(ServiceKind::RenderingControl),
            "ConnectionManager" => Some(ServiceKind::ConnectionManager),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Subscription {
    pub sid: String,
    pub device_id: String,
    pub service: ServiceKind,
    pub client_ip: String,
    pub callback_url: String,
    pub expires_at: Instant,
    pub seq: u64,
    /// Set by `SetAVTransportURI` on a freshly-created temporary
    /// subscription, so a subsequent `Play` from the same IP knows which
    /// URL to use even without an explicit argument.
    pub last_play_url: Option<String>,
}

impl Subscription {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Default)]
pub struct SubscriptionTable {
    subscriptions: Mutex<HashMap<String, Subscription>>,
    notify_failures: std::sync::atomic::AtomicU64,
}

fn random_sid() -> String {
    format!("uuid:{}", uuid::Uuid::new_v4())
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscription, replacing any prior one for the same
    /// `(device, client-ip, service)` triple. Returns the assigned SID.
    pub async fn subscribe(
        &self,
        device_id: &str,
        service: ServiceKind,
        client_ip: &str,
        callback_url: &str,
        timeout_secs: u64,
    ) -> String {
        let mut table = self.subscriptions.lock().await;
        table.retain(|_, s| {
            !(s.device_id == device_id && s.service == service && s.client_ip == client_ip)
        });

        let sid = random_sid();
        table.insert(
            sid.clone(),
            Subscription {
                sid: sid.clone(),
                device_id: device_id.to_string(),
                service,
                client_ip: client_ip.to_string(),
                callback_url: callback_url.to_string(),
                expires_at: Instant::now() + Duration::from_secs(timeout_secs),
                seq: 0,
                last_play_url: None,
            },
        );
        sid
    }

    /// Creates a temporary subscription with a synthetic callback, used
    /// when `SetAVTransportURI` arrives from an IP with no prior
    /// subscription.
    pub async fn create_temporary(
        &self,
        device_id: &str,
        client_ip: &str,
    ) -> String {
        let callback = format!("http://{client_ip}/temp/");
        self.subscribe(device_id, ServiceKind::AvTransport, client_ip, &callback, 3600)
            .await
    }

    pub async fn renew(&self, sid: &str, timeout_secs: u64) -> bool {
        let mut table = self.subscriptions.lock().await;
        match table.get_mut(sid) {
            Some(sub) => {
                sub.expires_at = Instant::now() + Duration::from_secs(timeout_secs);
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe(&self, sid: &str) -> bool {
        self.subscriptions.lock().await.remove(sid).is_some()
    }

    pub async fn has_active_subscription(
        &self,
        device_id: &str,
        client_ip: &str,
        service: ServiceKind,
    ) -> bool {
        let table = self.subscriptions.lock().await;
        table.values().any(|s| {
            s.device_id == device_id
                && s.client_ip == client_ip
                && s.service == service
                && !s.is_expired()
        })
    }

    pub async fn set_last_play_url(&self, device_id: &str, client_ip: &str, url: &str) {
        let mut table = self.subscriptions.lock().await;
        for sub in table.values_mut() {
            if sub.device_id == device_id && sub.client_ip == client_ip {
                sub.last_play_url = Some(url.to_string());
            }
        }
    }

    pub async fn last_play_url(&self, device_id: &str, client_ip: &str) -> Option<String> {
        let table = self.subscriptions.lock().await;
        table
            .values()
            .find(|s| s.device_id == device_id && s.client_ip == client_ip)
            .and_then(|s| s.last_play_url.clone())
    }

    /// Every non-expired AVTransport subscriber for a device, pruning
    /// expired ones from the table in the same pass.
    pub async fn avtransport_subscribers(&self, device_id: &str) -> Vec<Subscription> {
        let mut table = self.subscriptions.lock().await;
        table.retain(|_, s| !s.is_expired());
        table
            .values()
            .filter(|s| s.device_id == device_id && s.service == ServiceKind::AvTransport)
            .cloned()
            .collect()
    }

    async fn next_seq(&self, sid: &str) -> u64 {
        let mut table = self.subscriptions.lock().await;
        match table.get_mut(sid) {
            Some(sub) => {
                let seq = sub.seq;
                sub.seq += 1;
                seq
            }
            None => 0,
        }
    }

    /// Total failed/rejected NOTIFY deliveries since this table was created.
    pub fn notify_failures(&self) -> u64 {
        self.notify_failures.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Renders the `LastChange` body NOTIFY wraps around state changes.
pub fn build_last_change(
    state: PlaybackState,
    current_uri: &str,
    actions: &str,
) -> String {
    let state_str = match state {
        PlaybackState::Playing => "PLAYING",
        PlaybackState::Paused => "PAUSED_PLAYBACK",
        PlaybackState::Transitioning => "TRANSITIONING",
        PlaybackState::Stopped => "STOPPED",
    };
    format!(
        r#"<Event xmlns="urn:schemas-upnp-org:metadata-1-0/AVT/"><InstanceID val="0"><TransportState val="{state}"/><TransportStatus val="OK"/><CurrentTransportActions val="{actions}"/><AVTransportURI val="{uri}"/><CurrentTrackURI val="{uri}"/></InstanceID></Event>"#,
        state = state_str,
        actions = super::didl::escape_xml(actions),
        uri = super::didl::escape_xml(current_uri),
    )
}

fn build_notify_body(last_change: &str) -> String {
    format!(
        r#"<?xml version="1.0"?><e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><LastChange>{}</LastChange></e:property></e:propertyset>"#,
        super::didl::escape_xml(last_change)
    )
}

/// Sends one NOTIFY to a subscriber's callback URL. Failures are logged
/// and non-fatal; the subscription survives a single failed delivery.
/// Counted on `table.notify_failures` either way.
pub async fn send_notify(table: &SubscriptionTable, sub: &Subscription, last_change: &str, seq: u64) {
    let body = build_notify_body(last_change);
    let client = match reqwest::Client::builder().timeout(NOTIFY_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to build notify client");
            table.notify_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }
    };

    let result = client
        .request(reqwest::Method::from_bytes(b"NOTIFY").unwrap(), &sub.callback_url)
        .header("Content-Type", "text/xml")
        .header("NT", "upnp:event")
        .header("NTS", "upnp:propchange")
        .header("SID", &sub.sid)
        .header("SEQ", seq.to_string())
        .body(body)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            debug!(sid = %sub.sid, seq, "notify delivered");
        }
        Ok(resp) => {
            debug!(sid = %sub.sid, status = %resp.status(), "notify rejected by subscriber");
            table.notify_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Err(e) => {
            debug!(sid = %sub.sid, error = %e, "notify delivery failed");
            table.notify_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}


/// Fans a `StateChanged` notification out to every current AVTransport
/// subscriber for a device: the active client sees the true state,
/// everyone else sees `PAUSED_PLAYBACK` (per §4.14's policy so other
/// control points can't be fooled into thinking they're in control).
pub async fn notify_state_changed(
    table: &SubscriptionTable,
    device_id: &str,
    active_client_ip: Option<&str>,
    true_state: PlaybackState,
    current_uri: &str,
    actions: &str,
) {
    for sub in table.avtransport_subscribers(device_id).await {
        let state = if Some(sub.client_ip.as_str()) == active_client_ip {
            true_state
        } else {
            PlaybackState::Paused
        };
        let last_change = build_last_change(state, current_uri, actions);
        let seq = table.next_seq(&sub.sid).await;
        send_notify(table, &sub, &last_change, seq).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_then_has_active_subscription() {
        let table = SubscriptionTable::new();
        table
            .subscribe("dev-1", ServiceKind::AvTransport, "10.0.0.2", "http://10.0.0.2/cb", 1800)
            .await;
        assert!(
            table
                .has_active_subscription("dev-1", "10.0.0.2", ServiceKind::AvTransport)
                .await
        );
        assert!(
            !table
                .has_active_subscription("dev-1", "10.0.0.3", ServiceKind::AvTransport)
                .await
        );
    }

    #[tokio::test]
    async fn resubscribing_same_triple_replaces_prior() {
        let table = SubscriptionTable::new();
        let sid1 = table
            .subscribe("dev-1", ServiceKind::AvTransport, "10.0.0.2", "http://a", 1800)
            .await;
        let sid2 = table
            .subscribe("dev-1", ServiceKind::AvTransport, "10.0.0.2", "http://b", 1800)
            .await;
        assert_ne!(sid1, sid2);
        assert!(!table.unsubscribe(&sid1).await);
        assert!(table.unsubscribe(&sid2).await);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_sid_fails() {
        let table = SubscriptionTable::new();
        assert!(!table.unsubscribe("uuid:does-not-exist").await);
    }

    #[tokio::test]
    async fn renew_unknown_sid_fails() {
        let table = SubscriptionTable::new();
        assert!(!table.renew("uuid:nope", 1800).await);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_expires_after_timeout_elapses() {
        let table = SubscriptionTable::new();
        table
            .subscribe("dev-1", ServiceKind::AvTransport, "10.0.0.2", "http://a", 5)
            .await;
        assert!(
            table
                .has_active_subscription("dev-1", "10.0.0.2", ServiceKind::AvTransport)
                .await
        );

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(
            !table
                .has_active_subscription("dev-1", "10.0.0.2", ServiceKind::AvTransport)
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn renew_pushes_expiry_past_the_original_timeout() {
        let table = SubscriptionTable::new();
        let sid = table
            .subscribe("dev-1", ServiceKind::AvTransport, "10.0.0.2", "http://a", 5)
            .await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(table.renew(&sid, 5).await);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(
            table
                .has_active_subscription("dev-1", "10.0.0.2", ServiceKind::AvTransport)
                .await
        );
    }

    #[tokio::test]
    async fn failed_delivery_is_counted() {
        let table = SubscriptionTable::new();
        let sid = table
            .subscribe("dev-1", ServiceKind::AvTransport, "10.0.0.2", "http://127.0.0.1:9/evt", 1800)
            .await;
        let sub = table
            .avtransport_subscribers("dev-1")
            .await
            .into_iter()
            .find(|s| s.sid == sid)
            .unwrap();

        assert_eq!(table.notify_failures(), 0);
        send_notify(&table, &sub, "dummy", 0).await;
        assert_eq!(table.notify_failures(), 1);
    }

    #[tokio::test]
    async fn seq_increments_per_subscription() {
        let table = SubscriptionTable::new();
        let sid = table
            .subscribe("dev-1", ServiceKind::AvTransport, "10.0.0.2", "http://a", 1800)
            .await;
        assert_eq!(table.next_seq(&sid).await, 0);
        assert_eq!(table.next_seq(&sid).await, 1);
        assert_eq!(table.next_seq(&sid).await, 2);
    }
}
