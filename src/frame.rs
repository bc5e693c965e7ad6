use bytes::Bytes;

/// Opaque storage key identifying one frame's position for random access.
/// Storage adapters are free to interpret it however they like (offset,
/// sequence number, ...); the core only ever threads it through.
pub type FrameKey = u64;

/// What kind of media a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Content {
    Audio,
    Video,
    MetaData,
}

/// The frame's role within its content stream — orthogonal to `Content`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFlavor {
    /// Codec configuration (e.g. AVC sequence header / AAC sequence header).
    /// Cached by the actor and replayed to new subscribers; never charged
    /// against a client's byte counter.
    Config,
    /// A video keyframe / sync point.
    Keyframe,
    /// An ordinary content frame.
    Frame,
}

/// One immutable unit of media flowing through the actor.
#[derive(Debug, Clone)]
pub struct Frame {
    pub content: Content,
    pub flavor: FrameFlavor,
    /// Codec identifier; the frame-codec library that would interpret this
    /// further is an external collaborator, out of scope for this crate.
    pub codec: u8,
    pub dts: i64,
    pub pts: i64,
    pub body: Bytes,
    /// Stamped per-client by the dispatch path; absent on frames as they
    /// arrive from the source.
    pub stream_id: Option<String>,
    /// Storage key of the frame that follows this one, if this frame was
    /// read from storage. `None` means "end of stream" to a ticker.
    pub next_id: Option<FrameKey>,
}

impl Frame {
    #[must_use]
    pub fn new(content: Content, flavor: FrameFlavor, codec: u8, dts: i64, pts: i64, body: Bytes) -> Self {
        Self {
            content,
            flavor,
            codec,
            dts,
            pts,
            body,
            stream_id: None,
            next_id: None,
        }
    }

    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self.flavor, FrameFlavor::Config)
    }

    /// Stamp a copy of this frame with a client's `stream_id` tag.
    #[must_use]
    pub fn stamped(&self, stream_id: Option<&str>) -> Self {
        let mut f = self.clone();
        f.stream_id = stream_id.map(str::to_string);
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamping_does_not_mutate_original() {
        let f = Frame::new(Content::Video, FrameFlavor::Keyframe, 7, 10, 10, Bytes::from_static(b"x"));
        let stamped = f.stamped(Some("A"));
        assert_eq!(stamped.stream_id.as_deref(), Some("A"));
        assert_eq!(f.stream_id, None);
    }

    #[test]
    fn config_frames_are_tagged() {
        let f = Frame::new(Content::Audio, FrameFlavor::Config, 0, 0, 0, Bytes::new());
        assert!(f.is_config());
    }
}
