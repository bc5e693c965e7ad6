use serde::Serialize;

use crate::frame::Frame;

/// Declarative description of one track's codec configuration, derived
/// from the last `flavor = config` frame seen for it.
#[derive(Debug, Clone, Serialize)]
pub struct TrackInfo {
    pub codec: u8,
    #[serde(skip_serializing)]
    pub config_body: bytes::Bytes,
}

impl TrackInfo {
    #[must_use]
    pub fn from_config_frame(frame: &Frame) -> Self {
        Self {
            codec: frame.codec,
            config_body: frame.body.clone(),
        }
    }
}

/// A track's state: either still pending configuration, or known.
#[derive(Debug, Clone, Serialize, Default)]
pub enum TrackState {
    #[default]
    Wait,
    Known(Vec<TrackInfo>),
}

impl TrackState {
    #[must_use]
    pub const fn is_wait(&self) -> bool {
        matches!(self, Self::Wait)
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub enum FlowType {
    #[default]
    Stream,
    File,
}

/// Mirrors spec.md §3 `media_info`: track descriptors plus codec config,
/// where a track may be `wait`ing on its first config frame.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MediaInfo {
    pub flow_type: FlowType,
    pub audio: TrackState,
    pub video: TrackState,
    /// Merged in from storage properties (notably `duration`) only when
    /// replying to a `media_info` query, never stored here persistently.
    #[serde(skip_serializing)]
    pub duration_ms: Option<u64>,
}

impl MediaInfo {
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        !self.audio.is_wait() && !self.video.is_wait()
    }

    /// Forces any remaining `wait` track to an empty, concrete list — the
    /// `stop_wait_for_config` timer's effect (spec.md §4.1/§5).
    pub fn force_ready(&mut self) {
        if self.audio.is_wait() {
            self.audio = TrackState::Known(Vec::new());
        }
        if self.video.is_wait() {
            self.video = TrackState::Known(Vec::new());
        }
    }

    /// Update the track matching `content` from a newly-seen config frame.
    /// Returns `true` if this transitioned `media_info` from not-ready to
    /// ready (i.e. waiters should be flushed).
    pub fn observe_config(&mut self, frame: &Frame) -> bool {
        let was_ready = self.is_ready();
        let info = TrackInfo::from_config_frame(frame);
        let slot = match frame.content {
            crate::frame::Content::Audio => &mut self.audio,
            crate::frame::Content::Video => &mut self.video,
            crate::frame::Content::MetaData => return false,
        };
        match slot {
            TrackState::Wait => *slot = TrackState::Known(vec![info]),
            TrackState::Known(list) => list.push(info),
        }
        !was_ready && self.is_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Content, FrameFlavor};
    use bytes::Bytes;

    fn config_frame(content: Content) -> Frame {
        Frame::new(content, FrameFlavor::Config, 7, 0, 0, Bytes::from_static(b"cfg"))
    }

    #[test]
    fn starts_waiting_on_both_tracks() {
        let info = MediaInfo::default();
        assert!(!info.is_ready());
    }

    #[test]
    fn becomes_ready_once_both_tracks_seen() {
        let mut info = MediaInfo::default();
        assert!(!info.observe_config(&config_frame(Content::Video)));
        assert!(info.observe_config(&config_frame(Content::Audio)));
        assert!(info.is_ready());
    }

    #[test]
    fn force_ready_empties_remaining_waits() {
        let mut info = MediaInfo::default();
        info.observe_config(&config_frame(Content::Video));
        info.force_ready();
        assert!(info.is_ready());
        match &info.audio {
            TrackState::Known(list) => assert!(list.is_empty()),
            TrackState::Wait => panic!("audio should not still be waiting"),
        }
    }
}
