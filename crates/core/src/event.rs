use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::TrackMeta;

/// Transport state of a virtual device. Mirrors the explicit state machine:
/// STOPPED -> (PLAY) -> TRANSITIONING -> (first PCM frame) -> PLAYING;
/// PLAYING -> (PAUSE) -> PAUSED; PAUSED -> (PLAY) -> PLAYING; any -> (STOP)
/// -> STOPPED; PLAYING -> (EOF) -> STOPPED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
    Transitioning,
}

/// Discriminant used for subscription keys — a `(EventTypeTag, device_id?)`
/// pair is the subscription's composite key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTypeTag {
    Play,
    Stop,
    Pause,
    Seek,
    SetVolume,
    SetMute,
    SetDsp,
    ResetDsp,
    DeviceAdded,
    DeviceRemoved,
    DeviceConnected,
    DeviceDisconnected,
    DeviceOfflineThresholdReached,
    StateChanged,
    PositionUpdated,
    MetadataUpdated,
    DspChanged,
    VolumeChanged,
    Startup,
    Shutdown,
}

/// The closed set of event payloads. Each variant is tagged by the
/// matching `EventTypeTag`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventKind {
    Play {
        url: String,
        position: f64,
        metadata: Option<TrackMeta>,
    },
    Stop,
    Pause,
    Seek {
        position: f64,
    },
    SetVolume {
        level: u8,
    },
    SetMute {
        muted: bool,
    },
    SetDsp {
        enabled: bool,
        config: serde_json::Value,
    },
    ResetDsp,

    DeviceAdded {
        device_name: String,
        device_type: String,
    },
    DeviceRemoved,
    DeviceConnected,
    DeviceDisconnected,
    DeviceOfflineThresholdReached {
        scan_id: String,
    },

    StateChanged {
        state: PlaybackState,
    },
    PositionUpdated {
        position: f64,
    },
    MetadataUpdated,
    /// Emitted after a `SET_DSP`/`RESET_DSP` command has been applied.
    /// Carries the merged, persistable state — this is what the config
    /// store saves, not the raw patch from the originating command.
    DspChanged {
        enabled: bool,
        config: serde_json::Value,
    },
    VolumeChanged,

    Startup,
    Shutdown,
}

impl EventKind {
    pub fn tag(&self) -> EventTypeTag {
        match self {
            EventKind::Play { .. } => EventTypeTag::Play,
            EventKind::Stop => EventTypeTag::Stop,
            EventKind::Pause => EventTypeTag::Pause,
            EventKind::Seek { .. } => EventTypeTag::Seek,
            EventKind::SetVolume { .. } => EventTypeTag::SetVolume,
            EventKind::SetMute { .. } => EventTypeTag::SetMute,
            EventKind::SetDsp { .. } => EventTypeTag::SetDsp,
            EventKind::ResetDsp => EventTypeTag::ResetDsp,
            EventKind::DeviceAdded { .. } => EventTypeTag::DeviceAdded,
            EventKind::DeviceRemoved => EventTypeTag::DeviceRemoved,
            EventKind::DeviceConnected => EventTypeTag::DeviceConnected,
            EventKind::DeviceDisconnected => EventTypeTag::DeviceDisconnected,
            EventKind::DeviceOfflineThresholdReached { .. } => {
                EventTypeTag::DeviceOfflineThresholdReached
            }
            EventKind::StateChanged { .. } => EventTypeTag::StateChanged,
            EventKind::PositionUpdated { .. } => EventTypeTag::PositionUpdated,
            EventKind::MetadataUpdated => EventTypeTag::MetadataUpdated,
            EventKind::DspChanged { .. } => EventTypeTag::DspChanged,
            EventKind::VolumeChanged => EventTypeTag::VolumeChanged,
            EventKind::Startup => EventTypeTag::Startup,
            EventKind::Shutdown => EventTypeTag::Shutdown,
        }
    }
}

/// A published event: a tagged payload plus addressing and tracing fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub device_id: Option<String>,
    pub timestamp: f64,
    pub trace_id: String,
}

impl Event {
    pub fn new(kind: EventKind, device_id: Option<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            kind,
            device_id,
            timestamp,
            trace_id: uuid_like_trace_id(),
        }
    }

    pub fn global(kind: EventKind) -> Self {
        Self::new(kind, None)
    }

    pub fn for_device(device_id: impl Into<String>, kind: EventKind) -> Self {
        Self::new(kind, Some(device_id.into()))
    }

    pub fn tag(&self) -> EventTypeTag {
        self.kind.tag()
    }
}

/// A short hex trace id. Not a real UUID generator (that lives at the
/// bridge crate, which owns the `uuid` dependency) — `Event` needs no
/// external randomness source beyond what the standard library gives it,
/// so this keeps `airbridge-core` dependency-free of `uuid`.
fn uuid_like_trace_id() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = DefaultHasher::new();
    nanos.hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_matches_kind() {
        let event = Event::global(EventKind::Stop);
        assert_eq!(event.tag(), EventTypeTag::Stop);
    }

    #[test]
    fn device_scoped_event_carries_id() {
        let event = Event::for_device("dev-1", EventKind::Pause);
        assert_eq!(event.device_id.as_deref(), Some("dev-1"));
    }

    #[test]
    fn trace_ids_are_nonempty() {
        let event = Event::global(EventKind::Startup);
        assert!(!event.trace_id.is_empty());
    }
}
