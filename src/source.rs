use std::convert::Infallible;
use tokio::sync::oneshot;

/// The liveness half held by the actor. Fires when the source task drops
/// its matching [`DeathToken`] — the async analogue of an Erlang
/// monitor/DOWN notification (Design Note "Liveness notifications").
pub type LivenessWatch = oneshot::Receiver<Infallible>;

/// The half a source task holds for as long as it is alive. Drop it (or
/// let the task finish) to signal source death to the actor.
pub type DeathToken = oneshot::Sender<Infallible>;

/// Identity + liveness of the actor's current frame producer.
pub struct SourceHandle {
    pub id: String,
    pub liveness: LivenessWatch,
}

impl SourceHandle {
    /// Create a fresh handle/token pair for a new source.
    #[must_use]
    pub fn new(id: impl Into<String>) -> (Self, DeathToken) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                id: id.into(),
                liveness: rx,
            },
            tx,
        )
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle").field("id", &self.id).finish()
    }
}
