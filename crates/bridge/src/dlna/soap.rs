/// SOAP action dispatch for AVTransport, RenderingControl and
/// ConnectionManager — the inverse of a SOAP *client*: each function here
/// parses an incoming request body, validates and authorizes it, and
/// either returns a success envelope or a `SoapFault`. State mutation is
/// always via `EventBus::publish` onto the owning `VirtualDevice`; these
/// handlers never touch the playback pipeline directly.
use super::didl;
use super::gena::{ServiceKind, SubscriptionTable};
use crate::event_bus::EventBus;
use crate::virtual_device::VirtualDevice;
use airbridge_core::{Event, EventKind, PlaybackState, SoapFault, TrackMeta};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Formats a duration in seconds as `H:MM:SS`, the form UPnP time fields
/// use (`TrackDuration`, `RelTime`, `AbsTime`, `Target`).
pub fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{h}:{m:02}:{s:02}")
}

/// Parses a `H:MM:SS` or `HH:MM:SS` time value into seconds.
pub fn parse_time(s: &str) -> Result<f64, airbridge_core::ProtocolError> {
    let s = s.trim();
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err(airbridge_core::ProtocolError::BadTime(s.to_string()));
    }
    let h: u64 = parts[0].parse().map_err(|_| airbridge_core::ProtocolError::BadTime(s.to_string()))?;
    let m: u64 = parts[1].parse().map_err(|_| airbridge_core::ProtocolError::BadTime(s.to_string()))?;
    let sec: f64 = parts[2].parse().map_err(|_| airbridge_core::ProtocolError::BadTime(s.to_string()))?;
    if m >= 60 {
        return Err(airbridge_core::ProtocolError::BadTime(s.to_string()));
    }
    Ok((h * 3600) as f64 + (m * 60) as f64 + sec)
}

/// Extracts the text content of the first `<tag>...</tag>` in a flat SOAP
/// argument list. Action bodies are a flat list of scalar arguments, never
/// nested, so a simple find is enough — no need for a streaming parser.
fn extract_arg(xml: &str, tag: &str) -> Option<String> {
    let start_tag = format!("<{tag}>");
    let start_tag_ns = format!("<{tag} ");
    let (start_idx, has_attrs) = match xml.find(&start_tag) {
        Some(i) => (i, false),
        None => (xml.find(&start_tag_ns)?, true),
    };
    let after_open = if has_attrs {
        xml[start_idx..].find('>')? + start_idx + 1
    } else {
        start_idx + start_tag.len()
    };
    let end_tag = format!("</{tag}>");
    let end_idx = xml[after_open..].find(&end_tag)?;
    Some(unescape_xml(xml[after_open..after_open + end_idx].trim()))
}

fn raw_arg(xml: &str, tag: &str) -> Option<String> {
    let start_tag = format!("<{tag}>");
    let end_tag = format!("</{tag}>");
    let start = xml.find(&start_tag)? + start_tag.len();
    let end = xml[start..].find(&end_tag)?;
    Some(unescape_xml(xml[start..start + end].trim()))
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn service_urn(service: ServiceKind) -> &'static str {
    match service {
        ServiceKind::AvTransport => "urn:schemas-upnp-org:service:AVTransport:1",
        ServiceKind::RenderingControl => "urn:schemas-upnp-org:service:RenderingControl:1",
        ServiceKind::ConnectionManager => "urn:schemas-upnp-org:service:ConnectionManager:1",
    }
}

/// Wraps an action's output arguments in the SOAP envelope a control point
/// expects back.
pub fn success_envelope(service: ServiceKind, action: &str, args_xml: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:{action}Response xmlns:u="{urn}">{args}</u:{action}Response></s:Body>
</s:Envelope>"#,
        action = action,
        urn = service_urn(service),
        args = args_xml,
    )
}

/// Builds the `UPnPError` fault envelope for a failed action.
pub fn fault_envelope(fault: SoapFault) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring>
<detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0"><errorCode>{code}</errorCode><errorDescription>{desc}</errorDescription></UPnPError></detail>
</s:Fault></s:Body></s:Envelope>"#,
        code = fault.code(),
        desc = fault.description(),
    )
}

/// The permissive fallback the HTTP router returns for an action name it
/// doesn't recognize: a success envelope with no arguments, since many
/// control points probe for optional actions and treat a fault as fatal.
pub fn permissive_envelope(service: ServiceKind, action: &str) -> String {
    success_envelope(service, action, "")
}

pub(crate) fn transport_actions_for(state: PlaybackState) -> &'static str {
    match state {
        PlaybackState::Playing => "Pause,Stop,Seek",
        PlaybackState::Paused => "Play,Stop",
        PlaybackState::Transitioning => "Stop",
        PlaybackState::Stopped => "Play",
    }
}

fn transport_state_str(state: PlaybackState) -> &'static str {
    match state {
        PlaybackState::Playing => "PLAYING",
        PlaybackState::Paused => "PAUSED_PLAYBACK",
        PlaybackState::Transitioning => "TRANSITIONING",
        PlaybackState::Stopped => "STOPPED",
    }
}

/// Best-effort Icecast/Shoutcast metadata probe, run in the background
/// after `SetAVTransportURI` so a slow or unreachable stream never delays
/// the SOAP response. Only `icy-name` maps onto anything DIDL-Lite can
/// carry; other `icy-*` headers aren't modeled.
async fn probe_metadata(device: Arc<VirtualDevice>, url: String) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(4))
        .build()
    {
        Ok(c) => c,
        Err(_) => return,
    };

    let response = match client
        .get(&url)
        .header("Icy-MetaData", "1")
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            debug!(url = %url, error = %e, "metadata probe failed");
            return;
        }
    };

    let name = response
        .headers()
        .get("icy-name")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if let Some(name) = name {
        if !name.trim().is_empty() {
            device
                .merge_metadata(TrackMeta {
                    title: name,
                    ..Default::default()
                })
                .await;
        }
    }
}

/// Dispatches one already-authenticated SOAP action. `client_ip` is the
/// remote peer's address as seen by the HTTP server — the only identity a
/// UPnP control point carries.
pub async fn dispatch(
    service: ServiceKind,
    action: &str,
    body: &str,
    device: &Arc<VirtualDevice>,
    event_bus: &Arc<EventBus>,
    subscriptions: &SubscriptionTable,
    client_ip: &str,
) -> Result<String, SoapFault> {
    match service {
        ServiceKind::AvTransport => avtransport_action(action, body, device, event_bus, subscriptions, client_ip).await,
        ServiceKind::RenderingControl => rendering_control_action(action, body, device, event_bus, client_ip).await,
        ServiceKind::ConnectionManager => connection_manager_action(action),
    }
}

fn is_active_client(device_active: Option<(String, String)>, client_ip: &str) -> bool {
    match device_active {
        Some((ip, _)) => ip == client_ip,
        None => false,
    }
}

async fn avtransport_action(
    action: &str,
    body: &str,
    device: &Arc<VirtualDevice>,
    event_bus: &Arc<EventBus>,
    subscriptions: &SubscriptionTable,
    client_ip: &str,
) -> Result<String, SoapFault> {
    match action {
        "SetAVTransportURI" => {
            let uri = extract_arg(body, "CurrentURI").filter(|u| !u.is_empty());
            let Some(uri) = uri else {
                return Err(SoapFault::InvalidArgs);
            };
            let meta_xml = raw_arg(body, "CurrentURIMetaData").unwrap_or_default();
            let meta = didl::parse_didl_lite(&meta_xml);

            let sid = if subscriptions
                .has_active_subscription(&device.device_id, client_ip, ServiceKind::AvTransport)
                .await
            {
                subscriptions
                    .avtransport_subscribers(&device.device_id)
                    .await
                    .into_iter()
                    .find(|s| s.client_ip == client_ip)
                    .map(|s| s.sid)
                    .unwrap_or_default()
            } else {
                subscriptions.create_temporary(&device.device_id, client_ip).await
            };

            subscriptions
                .set_last_play_url(&device.device_id, client_ip, &uri)
                .await;
            device.set_active_client(client_ip.to_string(), sid).await;

            event_bus.publish(Event::for_device(
                device.device_id.clone(),
                EventKind::Play {
                    url: uri.clone(),
                    position: 0.0,
                    metadata: Some(meta),
                },
            ));

            tokio::spawn(probe_metadata(device.clone(), uri));

            Ok(success_envelope(ServiceKind::AvTransport, action, ""))
        }

        "Play" => {
            if !subscriptions
                .has_active_subscription(&device.device_id, client_ip, ServiceKind::AvTransport)
                .await
            {
                return Err(SoapFault::TransitionNotAvailable);
            }

            let stored = subscriptions.last_play_url(&device.device_id, client_ip).await;
            let current = device.current_url().await;
            let url = stored.filter(|u| !u.is_empty()).or_else(|| Some(current).filter(|u| !u.is_empty()));
            let Some(url) = url else {
                return Err(SoapFault::TransitionNotAvailable);
            };

            let state = device.playback_state().await;
            if state != PlaybackState::Playing && state != PlaybackState::Transitioning {
                let position = if state == PlaybackState::Paused {
                    device.current_position().await
                } else {
                    0.0
                };
                event_bus.publish(Event::for_device(
                    device.device_id.clone(),
                    EventKind::Play {
                        url,
                        position,
                        metadata: None,
                    },
                ));
            }

            Ok(success_envelope(ServiceKind::AvTransport, action, ""))
        }

        "Stop" => {
            if !is_active_client(device.active_client().await, client_ip) {
                return Err(SoapFault::TransitionNotAvailable);
            }
            event_bus.publish(Event::for_device(device.device_id.clone(), EventKind::Stop));
            Ok(success_envelope(ServiceKind::AvTransport, action, ""))
        }

        "Pause" => {
            if !is_active_client(device.active_client().await, client_ip) {
                return Err(SoapFault::TransitionNotAvailable);
            }
            if device.playback_state().await != PlaybackState::Playing {
                return Err(SoapFault::TransitionNotAvailable);
            }
            event_bus.publish(Event::for_device(device.device_id.clone(), EventKind::Pause));
            Ok(success_envelope(ServiceKind::AvTransport, action, ""))
        }

        "Seek" => {
            if !subscriptions
                .has_active_subscription(&device.device_id, client_ip, ServiceKind::AvTransport)
                .await
            {
                return Err(SoapFault::TransitionNotAvailable);
            }

            let unit = extract_arg(body, "Unit").unwrap_or_default();
            if unit != "REL_TIME" && unit != "ABS_TIME" {
                return Err(SoapFault::SeekNotSupported);
            }
            let target_raw = extract_arg(body, "Target").ok_or(SoapFault::InvalidArgs)?;
            let target = parse_time(&target_raw).map_err(|_| SoapFault::InvalidArgs)?;
            if target < 0.0 {
                return Err(SoapFault::InvalidSeekTarget);
            }
            let duration = device.metadata().await.duration_secs;
            if duration > 0.0 && target > duration {
                return Err(SoapFault::InvalidSeekTarget);
            }

            let current = device.current_position().await;
            if (target - current).abs() >= 1.0 {
                event_bus.publish(Event::for_device(
                    device.device_id.clone(),
                    EventKind::Seek { position: target },
                ));
            }
            Ok(success_envelope(ServiceKind::AvTransport, action, ""))
        }

        "GetPositionInfo" => {
            let meta = device.metadata().await;
            let url = device.current_url().await;
            let position = device.current_position().await;
            let didl_xml = didl::generate_didl_lite(&url, &meta);
            let args = format!(
                "<Track>1</Track><TrackDuration>{dur}</TrackDuration><TrackMetaData>{meta}</TrackMetaData>\
                 <TrackURI>{uri}</TrackURI><RelTime>{pos}</RelTime><AbsTime>{pos}</AbsTime>\
                 <RelCount>2147483647</RelCount><AbsCount>2147483647</AbsCount>",
                dur = format_time(meta.duration_secs),
                meta = didl::escape_xml(&didl_xml),
                uri = didl::escape_xml(&url),
                pos = format_time(position),
            );
            Ok(success_envelope(ServiceKind::AvTransport, action, &args))
        }

        "GetTransportInfo" => {
            let state = device.playback_state().await;
            let args = format!(
                "<CurrentTransportState>{state}</CurrentTransportState><CurrentTransportStatus>OK</CurrentTransportStatus><CurrentSpeed>1</CurrentSpeed>",
                state = transport_state_str(state),
            );
            Ok(success_envelope(ServiceKind::AvTransport, action, &args))
        }

        "GetMediaInfo" => {
            let meta = device.metadata().await;
            let url = device.current_url().await;
            let didl_xml = didl::generate_didl_lite(&url, &meta);
            let args = format!(
                "<NrTracks>1</NrTracks><MediaDuration>{dur}</MediaDuration><CurrentURI>{uri}</CurrentURI>\
                 <CurrentURIMetaData>{meta}</CurrentURIMetaData><NextURI></NextURI><NextURIMetaData></NextURIMetaData>\
                 <PlayMedium>NETWORK</PlayMedium><RecordMedium>NOT_IMPLEMENTED</RecordMedium><WriteStatus>NOT_IMPLEMENTED</WriteStatus>",
                dur = format_time(meta.duration_secs),
                uri = didl::escape_xml(&url),
                meta = didl::escape_xml(&didl_xml),
            );
            Ok(success_envelope(ServiceKind::AvTransport, action, &args))
        }

        "GetCurrentTransportActions" => {
            let state = device.playback_state().await;
            let args = format!(
                "<Actions>{}</Actions>",
                transport_actions_for(state)
            );
            Ok(success_envelope(ServiceKind::AvTransport, action, &args))
        }

        _ => Ok(permissive_envelope(ServiceKind::AvTransport, action)),
    }
}

async fn rendering_control_action(
    action: &str,
    body: &str,
    device: &Arc<VirtualDevice>,
    event_bus: &Arc<EventBus>,
    client_ip: &str,
) -> Result<String, SoapFault> {
    match action {
        "GetVolume" => {
            let (level, _) = device.volume().await;
            Ok(success_envelope(
                ServiceKind::RenderingControl,
                action,
                &format!("<CurrentVolume>{level}</CurrentVolume>"),
            ))
        }

        "GetMute" => {
            let (_, muted) = device.volume().await;
            Ok(success_envelope(
                ServiceKind::RenderingControl,
                action,
                &format!("<CurrentMute>{}</CurrentMute>", if muted { 1 } else { 0 }),
            ))
        }

        "SetVolume" => {
            if !is_active_client(device.active_client().await, client_ip) {
                return Err(SoapFault::InvalidArgs);
            }
            let raw = extract_arg(body, "DesiredVolume").ok_or(SoapFault::InvalidArgs)?;
            let level: u32 = raw.parse().map_err(|_| SoapFault::InvalidArgs)?;
            if level > 100 {
                return Err(SoapFault::InvalidArgs);
            }
            event_bus.publish(Event::for_device(
                device.device_id.clone(),
                EventKind::SetVolume { level: level as u8 },
            ));
            Ok(success_envelope(ServiceKind::RenderingControl, action, ""))
        }

        "SetMute" => {
            if !is_active_client(device.active_client().await, client_ip) {
                return Err(SoapFault::InvalidArgs);
            }
            let raw = extract_arg(body, "DesiredMute").ok_or(SoapFault::InvalidArgs)?;
            let muted = match raw.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => return Err(SoapFault::InvalidArgs),
            };
            event_bus.publish(Event::for_device(
                device.device_id.clone(),
                EventKind::SetMute { muted },
            ));
            Ok(success_envelope(ServiceKind::RenderingControl, action, ""))
        }

        _ => Ok(permissive_envelope(ServiceKind::RenderingControl, action)),
    }
}

fn connection_manager_action(action: &str) -> Result<String, SoapFault> {
    match action {
        "GetProtocolInfo" => {
            let sink = "http-get:*:audio/mpeg:*,http-get:*:audio/mp4:*,http-get:*:audio/flac:*,\
                        http-get:*:audio/x-wav:*,http-get:*:audio/ogg:*,http-get:*:audio/aac:*,http-get:*:*:*";
            Ok(success_envelope(
                ServiceKind::ConnectionManager,
                action,
                &format!("<Source></Source><Sink>{sink}</Sink>"),
            ))
        }

        "GetCurrentConnectionIDs" => Ok(success_envelope(
            ServiceKind::ConnectionManager,
            action,
            "<ConnectionIDs>0</ConnectionIDs>",
        )),

        "GetCurrentConnectionInfo" => Ok(success_envelope(
            ServiceKind::ConnectionManager,
            action,
            "<RcsID>-1</RcsID><AVTransportID>0</AVTransportID><ProtocolInfo></ProtocolInfo>\
             <PeerConnectionManager></PeerConnectionManager><PeerConnectionID>-1</PeerConnectionID>\
             <Direction>Input</Direction><Status>OK</Status>",
        )),

        _ => Ok(permissive_envelope(ServiceKind::ConnectionManager, action)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_round_trips() {
        for s in ["0:00:00", "0:00:05", "1:02:03", "12:59:59"] {
            let secs = parse_time(s).unwrap();
            assert_eq!(format_time(secs), s);
        }
    }

    #[test]
    fn parse_time_rejects_malformed() {
        assert!(parse_time("not-a-time").is_err());
        assert!(parse_time("1:99:00").is_err());
    }

    #[test]
    fn extract_arg_reads_flat_value() {
        let body = "<CurrentURI>http://host/stream.mp3</CurrentURI><CurrentURIMetaData></CurrentURIMetaData>";
        assert_eq!(extract_arg(body, "CurrentURI").as_deref(), Some("http://host/stream.mp3"));
    }

    #[test]
    fn extract_arg_missing_is_none() {
        assert_eq!(extract_arg("<Foo>bar</Foo>", "CurrentURI"), None);
    }

    #[test]
    fn fault_envelope_carries_upnp_code() {
        let xml = fault_envelope(SoapFault::SeekNotSupported);
        assert!(xml.contains("712"));
    }

    #[test]
    fn transport_actions_match_state_table() {
        assert_eq!(transport_actions_for(PlaybackState::Playing), "Pause,Stop,Seek");
        assert_eq!(transport_actions_for(PlaybackState::Paused), "Play,Stop");
        assert_eq!(transport_actions_for(PlaybackState::Transitioning), "Stop");
        assert_eq!(transport_actions_for(PlaybackState::Stopped), "Play");
    }
}
