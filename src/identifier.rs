use serde::Serialize;
use std::fmt;

/// Identifies a single logical stream (one live channel or one opened file).
///
/// `Rtmp { app_name, stream_name }` is kept as the default/minimal variant —
/// grounded in how the rest of this codebase's stream-relay layer keys its
/// hub lookups (`StreamIdentifier::Rtmp { app_name, stream_name }`). Other
/// flavors are free to mint their own `Custom` identity; the core treats it
/// as an opaque, hashable key throughout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum StreamIdentifier {
    Rtmp {
        app_name: String,
        stream_name: String,
    },
    Custom {
        host: String,
        name: String,
    },
}

impl StreamIdentifier {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Rtmp { stream_name, .. } => stream_name,
            Self::Custom { name, .. } => name,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            Self::Rtmp { app_name, .. } => app_name,
            Self::Custom { host, .. } => host,
        }
    }
}

impl fmt::Display for StreamIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rtmp {
                app_name,
                stream_name,
            } => write!(f, "rtmp:{app_name}/{stream_name}"),
            Self::Custom { host, name } => write!(f, "{host}/{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_variant() {
        let id = StreamIdentifier::Rtmp {
            app_name: "live".to_string(),
            stream_name: "room1".to_string(),
        };
        assert_eq!(id.to_string(), "rtmp:live/room1");
        assert_eq!(id.name(), "room1");
    }
}
