/// DIDL-Lite generation and parsing.
///
/// Generation produces the `<res>` item a control point sees in
/// `GetMediaInfo`/NOTIFY bodies. Parsing reads the `CurrentURIMetaData`
/// argument a control point sends with `SetAVTransportURI`, tolerant of
/// CDATA wrapping and the `dc:creator`/`upnp:artist` variants different
/// control points use for the same field.
use airbridge_core::TrackMeta;
use quick_xml::events::Event;
use quick_xml::Reader;

/// Escape XML special characters in text content.
pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Builds the DIDL-Lite block embedded in `GetMediaInfo`/NOTIFY responses.
pub fn generate_didl_lite(uri: &str, meta: &TrackMeta) -> String {
    let mut out = String::new();
    out.push_str(r#"<DIDL-Lite xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/" "#);
    out.push_str(r#"xmlns:dc="http://purl.org/dc/elements/1.1/" "#);
    out.push_str(r#"xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/">"#);
    out.push_str(r#"<item id="1" parentID="0" restricted="1">"#);

    let title = if meta.title.is_empty() { uri } else { &meta.title };
    out.push_str(&format!("<dc:title>{}</dc:title>", escape_xml(title)));

    if !meta.artist.is_empty() {
        out.push_str(&format!("<dc:creator>{}</dc:creator>", escape_xml(&meta.artist)));
        out.push_str(&format!("<upnp:artist>{}</upnp:artist>", escape_xml(&meta.artist)));
    }
    if !meta.album.is_empty() {
        out.push_str(&format!("<upnp:album>{}</upnp:album>", escape_xml(&meta.album)));
    }
    if let Some(art) = &meta.album_art_url {
        out.push_str(&format!("<upnp:albumArtURI>{}</upnp:albumArtURI>", escape_xml(art)));
    }
    out.push_str("<upnp:class>object.item.audioItem.musicTrack</upnp:class>");

    out.push_str(r#"<res protocolInfo="http-get:*:audio/mpeg:*""#);
    if meta.duration_secs > 0.0 {
        out.push_str(&format!(r#" duration="{}""#, super::soap::format_time(meta.duration_secs)));
    }
    out.push('>');
    out.push_str(&escape_xml(uri));
    out.push_str("</res></item></DIDL-Lite>");
    out
}

/// Parses a `CurrentURIMetaData` argument into a `TrackMeta`, tolerating
/// CDATA-wrapped content and either `dc:creator` or `upnp:artist` for the
/// artist field. Returns a default (empty) `TrackMeta` on malformed input
/// rather than erroring — metadata is always optional.
pub fn parse_didl_lite(xml: &str) -> TrackMeta {
    let mut meta = TrackMeta::default();
    if xml.trim().is_empty() {
        return meta;
    }

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current_tag = String::new();
    let mut duration_attr: Option<f64> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = local_name(e.name().as_ref());
                if name == "res" {
                    for attr in e.attributes().flatten() {
                        if local_name(attr.key.as_ref()) == "duration" {
                            if let Ok(value) = attr.unescape_value() {
                                duration_attr = super::soap::parse_time(&value).ok();
                            }
                        }
                    }
                }
                current_tag = name;
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map(|c| c.into_owned())
                    .unwrap_or_default();
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                match current_tag.as_str() {
                    "title" => meta.title = text.to_string(),
                    "creator" | "artist" if meta.artist.is_empty() => meta.artist = text.to_string(),
                    "album" => meta.album = text.to_string(),
                    "albumArtURI" => meta.album_art_url = Some(text.to_string()),
                    _ => {}
                }
            }
            Ok(Event::CData(e)) => {
                let text = e
                    .minimal_escape()
                    .ok()
                    .and_then(|t| t.unescape().map(|c| c.into_owned()).ok())
                    .unwrap_or_default();
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                match current_tag.as_str() {
                    "title" => meta.title = text.to_string(),
                    "creator" | "artist" if meta.artist.is_empty() => meta.artist = text.to_string(),
                    "album" => meta.album = text.to_string(),
                    "albumArtURI" => meta.album_art_url = Some(text.to_string()),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current_tag.clear(),
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }

    if let Some(duration) = duration_attr {
        meta.duration_secs = duration;
    }
    meta
}

/// Strips a namespace prefix (`dc:title` -> `title`) since different
/// control points prefix tags differently.
fn local_name(raw: &[u8]) -> String {
    let full = String::from_utf8_lossy(raw);
    full.rsplit(':').next().unwrap_or(&full).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_didl_escapes_title() {
        let meta = TrackMeta {
            title: "Rock & Roll".to_string(),
            ..Default::default()
        };
        let didl = generate_didl_lite("http://example/track.mp3", &meta);
        assert!(didl.contains("Rock &amp; Roll"));
    }

    #[test]
    fn parses_dc_creator_variant() {
        let xml = r#"<DIDL-Lite><item><dc:title>Song</dc:title><dc:creator>Artist</dc:creator></item></DIDL-Lite>"#;
        let meta = parse_didl_lite(xml);
        assert_eq!(meta.title, "Song");
        assert_eq!(meta.artist, "Artist");
    }

    #[test]
    fn parses_upnp_artist_variant() {
        let xml = r#"<DIDL-Lite><item><dc:title>Song</dc:title><upnp:artist>Artist2</upnp:artist></item></DIDL-Lite>"#;
        let meta = parse_didl_lite(xml);
        assert_eq!(meta.artist, "Artist2");
    }

    #[test]
    fn tolerates_cdata_title() {
        let xml = r#"<DIDL-Lite><item><dc:title><![CDATA[CDATA Song]]></dc:title></item></DIDL-Lite>"#;
        let meta = parse_didl_lite(xml);
        assert_eq!(meta.title, "CDATA Song");
    }

    #[test]
    fn empty_metadata_is_tolerated() {
        let meta = parse_didl_lite("");
        assert_eq!(meta, TrackMeta::default());
    }
}
