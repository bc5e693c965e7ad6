//! Per-stream fan-out actor: splits an incoming sequence of media frames to
//! a dynamic set of subscribed clients, and serves passive (file-like)
//! clients and seek by pulling frames from a pluggable storage adapter.
//!
//! One actor instance represents one logical stream. It is immutable with
//! respect to per-client position: clients carry their own place in the
//! timeline, never the actor.

pub mod actor;
pub mod client;
pub mod errors;
pub mod flavor;
pub mod frame;
pub mod identifier;
pub mod media_info;
pub mod options;
pub mod source;
pub mod storage;
pub mod ticker;

pub use actor::StreamActorHandle;
pub use client::{CallerId, ClientId, ClientState, SubscribeOptions};
pub use errors::{StreamError, StreamErrorValue, StreamResult};
pub use flavor::{ControlEvent, ControlReply, Flavor, FlavorOutcome, InfoMessage};
pub use frame::{Content, Frame, FrameFlavor, FrameKey};
pub use identifier::StreamIdentifier;
pub use media_info::{FlowType, MediaInfo, TrackInfo, TrackState};
pub use options::{SourceTimeout, StreamOptions, Transcoder};
pub use source::SourceHandle;
pub use storage::{SeekOptions, StorageAdapter, StorageProperties, TimeshiftStorage};
