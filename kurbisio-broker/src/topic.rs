//! Topic parsing, the subscribe ACL and MQTT wildcard matching.
//!
//! All pure functions; every access decision the broker makes is encoded
//! here so the rules stay testable without a socket.

use uuid::Uuid;

/// The namespace all twin topics live under.
pub const NAMESPACE: &str = "kurbisio";

/// A parsed topic under the `kurbisio/` namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwinTopic {
    /// `kurbisio/{device_id}/twin/requests/{key}`: server → device.
    Requests { device_id: Uuid, key: String },
    /// `kurbisio/{device_id}/twin/reports/{key}`: device → server. The key
    /// is a single segment (no `/`).
    Reports { device_id: Uuid, key: String },
    /// `kurbisio/{device_id}/twin/get`: device asks for a replay of its
    /// stored requests.
    Get { device_id: Uuid },
}

/// Whether a topic falls under the reserved namespace.
pub fn is_reserved(topic: &str) -> bool {
    topic == NAMESPACE || topic.starts_with("kurbisio/")
}

/// Parse a `kurbisio/…` topic. Returns `None` for anything malformed,
/// including report keys containing `/`, which the broker refuses.
pub fn parse(topic: &str) -> Option<TwinTopic> {
    let rest = topic.strip_prefix("kurbisio/")?;
    let mut segments = rest.split('/');
    let device_id = Uuid::parse_str(segments.next()?).ok()?;
    if segments.next()? != "twin" {
        return None;
    }
    match segments.next()? {
        "get" => match segments.next() {
            None => Some(TwinTopic::Get { device_id }),
            Some(_) => None,
        },
        "requests" => {
            let key = segments.next()?;
            if key.is_empty() || segments.next().is_some() {
                return None;
            }
            Some(TwinTopic::Requests {
                device_id,
                key: key.to_owned(),
            })
        }
        "reports" => {
            let key = segments.next()?;
            if key.is_empty() || segments.next().is_some() {
                return None;
            }
            Some(TwinTopic::Reports {
                device_id,
                key: key.to_owned(),
            })
        }
        _ => None,
    }
}

/// The subscribe ACL: a device may subscribe only to its own twin-request
/// topics, `kurbisio/{device_id}/twin/requests/…` (wildcards below that
/// prefix included).
pub fn subscription_allowed(device_id: Uuid, filter: &str) -> bool {
    let prefix = format!("kurbisio/{device_id}/twin/requests/");
    filter.strip_prefix(&prefix)
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

/// MQTT topic filter matching with `+` (one level) and `#` (rest).
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_segments = filter.split('/').peekable();
    let mut topic_segments = topic.split('/');
    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
