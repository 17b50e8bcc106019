use serde::{Deserialize, Serialize};

/// Track metadata carried by `PLAY`/`METADATA_UPDATED` events and rendered
/// into DIDL-Lite / `GetMediaInfo` responses.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMeta {
    pub title: String,
    pub artist: String,
    pub album: String,
    #[serde(default)]
    pub album_art_url: Option<String>,
    /// Total duration in seconds; 0 means unknown/live.
    #[serde(default)]
    pub duration_secs: f64,
}

impl TrackMeta {
    /// Merge in fields from a freshly-parsed DIDL-Lite block, keeping
    /// whatever is already set when the new value is empty.
    pub fn merge(&mut self, other: TrackMeta) {
        if !other.title.is_empty() {
            self.title = other.title;
        }
        if !other.artist.is_empty() {
            self.artist = other.artist;
        }
        if !other.album.is_empty() {
            self.album = other.album;
        }
        if other.album_art_url.is_some() {
            self.album_art_url = other.album_art_url;
        }
        if other.duration_secs > 0.0 {
            self.duration_secs = other.duration_secs;
        }
    }

    /// `duration = 0 ∨ duration > 86400s` marks a stream as live/unbounded.
    pub fn is_streaming(&self) -> bool {
        self.duration_secs <= 0.0 || self.duration_secs > 86_400.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_existing_on_empty() {
        let mut meta = TrackMeta {
            title: "Song".into(),
            ..Default::default()
        };
        meta.merge(TrackMeta::default());
        assert_eq!(meta.title, "Song");
    }

    #[test]
    fn is_streaming_rules() {
        assert!(TrackMeta::default().is_streaming());
        assert!(TrackMeta { duration_secs: 90_000.0, ..Default::default() }.is_streaming());
        assert!(!TrackMeta { duration_secs: 180.0, ..Default::default() }.is_streaming());
    }
}
