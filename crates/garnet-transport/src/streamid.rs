//! Parser for the `#!::` stream-id convention.
//!
//! The transport itself treats the stream id as opaque bytes; listener
//! acceptance callbacks use this module to interpret the conventional
//! `#!::key1=value1,key2=value2` form (user, resource, mode and friends).

use std::collections::HashMap;

pub const STREAMID_HEADER: &str = "#!::";

/// Connection intent named by the `m` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Caller wants to receive ("request").
    #[default]
    Request,
    /// Caller wants to send ("publish").
    Publish,
    /// Both directions.
    Bidirectional,
}

/// Decoded key-value stream id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamIdInfo {
    pub user: Option<String>,
    pub resource: Option<String>,
    pub hostname: Option<String>,
    pub session: Option<String>,
    pub stream_type: Option<String>,
    pub mode: AccessMode,
    /// Keys outside the recognized set, kept verbatim.
    pub extra: HashMap<String, String>,
}

/// Parses a stream id. A string without the `#!::` header is treated as
/// a bare resource name. Returns `None` for a malformed key-value body
/// (missing `=`, empty key).
pub fn parse(streamid: &str) -> Option<StreamIdInfo> {
    let Some(body) = streamid.strip_prefix(STREAMID_HEADER) else {
        return Some(StreamIdInfo {
            resource: if streamid.is_empty() {
                None
            } else {
                Some(streamid.to_string())
            },
            ..Default::default()
        });
    };

    let mut info = StreamIdInfo::default();
    if body.is_empty() {
        return Some(info);
    }
    for pair in body.split(',') {
        let (key, value) = pair.split_once('=')?;
        if key.is_empty() {
            return None;
        }
        match key {
            "u" => info.user = Some(value.to_string()),
            "r" => info.resource = Some(value.to_string()),
            "h" => info.hostname = Some(value.to_string()),
            "s" => info.session = Some(value.to_string()),
            "t" => info.stream_type = Some(value.to_string()),
            "m" => {
                info.mode = match value {
                    "request" => AccessMode::Request,
                    "publish" => AccessMode::Publish,
                    "bidirectional" => AccessMode::Bidirectional,
                    other => {
                        log::warn!("stream id: unknown access mode '{}'", other);
                        return None;
                    }
                }
            }
            other => {
                info.extra.insert(other.to_string(), value.to_string());
            }
        }
    }
    Some(info)
}

/// Renders the key-value form back into a stream id string.
pub fn encode(info: &StreamIdInfo) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(u) = &info.user {
        parts.push(format!("u={}", u));
    }
    if let Some(r) = &info.resource {
        parts.push(format!("r={}", r));
    }
    if let Some(h) = &info.hostname {
        parts.push(format!("h={}", h));
    }
    if let Some(s) = &info.session {
        parts.push(format!("s={}", s));
    }
    if let Some(t) = &info.stream_type {
        parts.push(format!("t={}", t));
    }
    match info.mode {
        AccessMode::Request => {}
        AccessMode::Publish => parts.push("m=publish".into()),
        AccessMode::Bidirectional => parts.push("m=bidirectional".into()),
    }
    let mut extras: Vec<_> = info.extra.iter().collect();
    extras.sort();
    for (k, v) in extras {
        parts.push(format!("{}={}", k, v));
    }
    format!("{}{}", STREAMID_HEADER, parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_conventional_form() {
        let info =
            parse("#!::u=haivision,r=resource name,s=154484316484,t=stream,m=request").unwrap();
        assert_eq!(info.user.as_deref(), Some("haivision"));
        assert_eq!(info.resource.as_deref(), Some("resource name"));
        assert_eq!(info.session.as_deref(), Some("154484316484"));
        assert_eq!(info.stream_type.as_deref(), Some("stream"));
        assert_eq!(info.mode, AccessMode::Request);
    }

    #[test]
    fn bare_string_is_a_resource() {
        let info = parse("live/stream-17").unwrap();
        assert_eq!(info.resource.as_deref(), Some("live/stream-17"));
        assert_eq!(info.mode, AccessMode::Request);
    }

    #[test]
    fn publish_mode_and_extra_keys() {
        let info = parse("#!::m=publish,x=custom").unwrap();
        assert_eq!(info.mode, AccessMode::Publish);
        assert_eq!(info.extra.get("x").map(String::as_str), Some("custom"));
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(parse("#!::novalue").is_none());
        assert!(parse("#!::=x").is_none());
        assert!(parse("#!::m=sideways").is_none());
    }

    #[test]
    fn empty_ids() {
        assert_eq!(parse("").unwrap(), StreamIdInfo::default());
        assert_eq!(parse("#!::").unwrap(), StreamIdInfo::default());
    }

    #[test]
    fn encode_round_trips() {
        let info = StreamIdInfo {
            user: Some("alice".into()),
            resource: Some("cam1".into()),
            mode: AccessMode::Publish,
            ..Default::default()
        };
        let encoded = encode(&info);
        assert_eq!(encoded, "#!::u=alice,r=cam1,m=publish");
        assert_eq!(parse(&encoded).unwrap(), info);
    }
}
