use crate::frame::{Frame, FrameKey};
use crate::options::StreamOptions;
use crate::source::SourceHandle;

/// Shared tagged-variant return for every `Flavor` callback (Design Note
/// "Pluggable flavors" — maps the Erlang behaviour's `{reply,...}` /
/// `{noreply,...}` / `{stop,...}` / `{stop,...,Reply,...}` tuples onto one
/// exhaustive enum so the actor's dispatcher never needs a fallback arm).
#[derive(Debug)]
pub enum FlavorOutcome<T> {
    Reply(T),
    NoReply,
    Stop(String),
    StopWithReply(String, T),
}

impl<T> FlavorOutcome<T> {
    #[must_use]
    pub fn reply(self) -> Option<T> {
        match self {
            Self::Reply(v) | Self::StopWithReply(_, v) => Some(v),
            Self::NoReply | Self::Stop(_) => None,
        }
    }

    #[must_use]
    pub fn stop_reason(&self) -> Option<&str> {
        match self {
            Self::Stop(reason) | Self::StopWithReply(reason, _) => Some(reason.as_str()),
            Self::Reply(_) | Self::NoReply => None,
        }
    }
}

/// Events the core guarantees to raise on `handle_control` (spec.md §4.5).
pub enum ControlEvent {
    /// Carries only the new source's identity, not the `SourceHandle`
    /// itself — the actor retains ownership of the liveness watch and
    /// falls back to monitoring this source by default; a flavor that
    /// wants a *different* source returns `ControlReply::NewSource` to
    /// substitute one (spec.md §4.1 "flavor may substitute").
    SetSource(String),
    /// Opaque socket ownership transfer — the network type itself is an
    /// external collaborator's concern, out of scope here.
    SetSocket(Box<dyn std::any::Any + Send>),
    SeekInfo { dts: i64, opts: serde_json::Value },
    SourceLost(String),
    NoSource,
    Timeout,
    /// Any cast the core does not itself interpret, forwarded verbatim.
    Custom(String, serde_json::Value),
}

impl std::fmt::Debug for ControlEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SetSource(id) => write!(f, "SetSource({id})"),
            Self::SetSocket(_) => write!(f, "SetSocket(..)"),
            Self::SeekInfo { dts, .. } => write!(f, "SeekInfo{{dts: {dts}}}"),
            Self::SourceLost(id) => write!(f, "SourceLost({id})"),
            Self::NoSource => write!(f, "NoSource"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Custom(tag, _) => write!(f, "Custom({tag})"),
        }
    }
}

/// What a `handle_control` call may hand back to the actor.
pub enum ControlReply {
    NewSource(SourceHandle),
    SeekInfo(Option<(FrameKey, i64)>),
    None,
}

/// An out-of-band message delivered to `handle_info` (spec.md §4.5); the
/// concrete shape is flavor-defined, so it is carried as an opaque value.
pub struct InfoMessage(pub serde_json::Value);

/// The per-stream-type capability a flavor plugs into the core actor.
/// Every strategy that differs between file / live / mpegts / rtmp / rtsp
/// lives behind this trait (spec.md §4.5) — grounded in this codebase's
/// `TStreamHandler` (`#[async_trait] pub trait TStreamHandler`), the
/// existing precedent for an async-trait pluggable per-stream callback
/// object injected at publish time.
#[async_trait::async_trait]
pub trait Flavor: Send + Sync {
    async fn init(&mut self, options: &StreamOptions) -> FlavorOutcome<()>;

    async fn handle_frame(&mut self, frame: &Frame) -> FlavorOutcome<Frame>;

    async fn handle_control(&mut self, event: ControlEvent) -> FlavorOutcome<ControlReply>;

    async fn handle_info(&mut self, message: InfoMessage) -> FlavorOutcome<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal flavor used by the actor's own test suite: passes frames
    /// through unchanged, never intercepts control events, never stops.
    pub struct PassthroughFlavor;

    #[async_trait::async_trait]
    impl Flavor for PassthroughFlavor {
        async fn init(&mut self, _options: &StreamOptions) -> FlavorOutcome<()> {
            FlavorOutcome::NoReply
        }

        async fn handle_frame(&mut self, _frame: &Frame) -> FlavorOutcome<Frame> {
            FlavorOutcome::NoReply
        }

        async fn handle_control(&mut self, _event: ControlEvent) -> FlavorOutcome<ControlReply> {
            FlavorOutcome::NoReply
        }

        async fn handle_info(&mut self, _message: InfoMessage) -> FlavorOutcome<()> {
            FlavorOutcome::NoReply
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_extracts_value() {
        let outcome: FlavorOutcome<i32> = FlavorOutcome::Reply(42);
        assert_eq!(outcome.reply(), Some(42));

        let outcome: FlavorOutcome<i32> = FlavorOutcome::NoReply;
        assert_eq!(outcome.reply(), None);
    }

    #[test]
    fn stop_reason_reads_through_stop_with_reply() {
        let outcome: FlavorOutcome<i32> = FlavorOutcome::StopWithReply("bye".to_string(), 1);
        assert_eq!(outcome.stop_reason(), Some("bye"));
        assert_eq!(outcome.reply(), Some(1));
    }
}
