use crate::identifier::StreamIdentifier;
use crate::media_info::MediaInfo;

/// Source-loss timer policy (spec.md §3/§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTimeout {
    /// Terminate the actor the instant the source is lost, no grace period.
    Shutdown,
    /// Stay alive indefinitely with `source = None`; no timer is ever armed.
    Disabled,
    /// Arm a `no_source` timer for this many milliseconds. `0` terminates
    /// immediately without arming a timer (same end state as `Shutdown`,
    /// kept distinct because the spec keeps it a separate configuration
    /// value rather than folding it into `Shutdown`).
    Millis(u64),
}

impl Default for SourceTimeout {
    fn default() -> Self {
        Self::Millis(60_000)
    }
}

/// Optional pluggable frame transformer (spec.md §3 `transcoder`/`trans_state`).
/// Owns its own mutable state; the actor holds it exclusively, so `apply`
/// takes `&mut self` rather than requiring interior mutability.
#[async_trait::async_trait]
pub trait Transcoder: Send + Sync {
    /// Transform (or drop) one frame. Returning `None` drops it from the
    /// dispatch path entirely.
    async fn apply(&mut self, frame: crate::frame::Frame) -> Option<crate::frame::Frame>;
}

/// Configuration recognized at actor init (spec.md §6).
pub struct StreamOptions {
    /// This stream's identity (spec.md §3 "per stream"). `name`/`host` are
    /// carried on `identifier` rather than as separate fields.
    pub identifier: StreamIdentifier,
    pub url: String,
    pub kind: String,
    pub media_info: MediaInfo,
    /// Max acceptable gap (ms) between two consecutive source DTS streams
    /// before a discontinuity is flagged.
    pub glue_delta: u64,
    /// Enables the built-in in-memory timeshift buffer. Mutually exclusive
    /// with a flavor-supplied `format`/`storage` pair — enforced at init,
    /// see `StreamErrorValue::InitializedTimeshiftAndStorage`.
    pub timeshift_ms: Option<u64>,
    pub source_timeout: SourceTimeout,
    /// Opaque, flavor-owned configuration the core neither enforces nor
    /// interprets (spec.md §9 Open Questions).
    pub clients_timeout: Option<u64>,
    pub retry_limit: Option<u32>,
    pub transcoder: Option<Box<dyn Transcoder>>,
}

impl StreamOptions {
    /// Builds a `Custom` identity from `name` with an empty host, for
    /// callers that don't need the RTMP app/stream-name split.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            identifier: StreamIdentifier::Custom {
                host: String::new(),
                name: name.into(),
            },
            url: String::new(),
            kind: String::new(),
            media_info: MediaInfo::default(),
            glue_delta: 500,
            timeshift_ms: None,
            source_timeout: SourceTimeout::default(),
            clients_timeout: None,
            retry_limit: None,
            transcoder: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_source_timeout_is_sixty_seconds() {
        assert_eq!(SourceTimeout::default(), SourceTimeout::Millis(60_000));
    }

    #[test]
    fn new_options_have_sensible_defaults() {
        let opts = StreamOptions::new("room1");
        assert_eq!(opts.identifier.name(), "room1");
        assert!(opts.timeshift_ms.is_none());
        assert!(opts.transcoder.is_none());
    }
}
