use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::client::ClientId;
use crate::frame::{Frame, FrameKey};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback the ticker uses to pull one frame back through the owning
/// actor (spec.md §4.1 `read_frame`, driven by the ticker). Kept as a
/// boxed closure rather than a direct dependency on the actor's handle
/// type so this module has no upward edge onto `crate::actor`.
pub type ReadFrameFn =
    Arc<dyn Fn(ClientId, Option<FrameKey>) -> BoxFuture<'static, Option<Frame>> + Send + Sync>;

/// Runtime reconfiguration accepted by a live ticker (spec.md §4.4).
pub enum TickerCommand {
    PlaySetup {
        buffer_ms: Option<u64>,
        send_audio: Option<bool>,
        send_video: Option<bool>,
    },
    Pause,
    Resume,
    Seek {
        key: Option<FrameKey>,
        dts: i64,
    },
    Stop,
}

/// Handle to a running ticker task, owned by the actor (one per passive
/// client). Dropping or stopping the actor drops this, which aborts the
/// task — mirrors how `streamhub`'s statistics loop is owned by its
/// spawner rather than detached.
pub struct TickerHandle {
    commands: mpsc::Sender<TickerCommand>,
    task: JoinHandle<()>,
}

impl TickerHandle {
    pub async fn send(&self, cmd: TickerCommand) {
        let _ = self.commands.send(cmd).await;
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct TickerState {
    client: ClientId,
    key: Option<FrameKey>,
    base_dts: Option<i64>,
    base_wall: Instant,
    buffer_ms: u64,
    send_audio: bool,
    send_video: bool,
    paused: bool,
    read_frame: ReadFrameFn,
    sink: mpsc::Sender<Frame>,
}

impl TickerState {
    /// Wall-clock deadline for delivering a frame at `dts`, honoring the
    /// pre-push buffer window (spec.md §4.4: "that initial window is
    /// drained as fast as possible").
    fn deadline_for(&mut self, dts: i64) -> Instant {
        let base_dts = *self.base_dts.get_or_insert(dts);
        let elapsed_stream_ms = dts.saturating_sub(base_dts).max(0) as u64;
        let paced_ms = elapsed_stream_ms.saturating_sub(self.buffer_ms);
        self.base_wall + Duration::from_millis(paced_ms)
    }
}

/// Spawn a ticker for `client`, starting its read position at `start_key`
/// (`None` = beginning of storage). Grounded in this codebase's
/// `StatisticsCalculate` (`tokio::select!` over a command channel and a
/// timer in one task), generalized from a fixed interval to a per-frame
/// deadline computed from DTS deltas.
#[must_use]
pub fn spawn(
    client: ClientId,
    start_key: Option<FrameKey>,
    buffer_ms: u64,
    send_audio: bool,
    send_video: bool,
    read_frame: ReadFrameFn,
    sink: mpsc::Sender<Frame>,
) -> TickerHandle {
    let (tx, mut rx) = mpsc::channel(16);

    let mut state = TickerState {
        client,
        key: start_key,
        base_dts: None,
        base_wall: Instant::now(),
        buffer_ms,
        send_audio,
        send_video,
        paused: false,
        read_frame,
        sink,
    };

    let task = tokio::spawn(async move {
        let mut pending: Option<Frame> = None;
        loop {
            if state.paused {
                match rx.recv().await {
                    Some(cmd) => apply_command(&mut state, cmd, &mut pending),
                    None => return,
                }
                continue;
            }

            let frame = match pending.take() {
                Some(f) => f,
                None => match (state.read_frame)(state.client, state.key).await {
                    Some(f) => f,
                    None => {
                        // EOF: idle until a command (seek/stop) arrives.
                        match rx.recv().await {
                            Some(cmd) => apply_command(&mut state, cmd, &mut pending),
                            None => return,
                        }
                        continue;
                    }
                },
            };

            let deadline = state.deadline_for(frame.dts);

            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            pending = Some(frame);
                            apply_command(&mut state, cmd, &mut pending);
                        }
                        None => return,
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    state.key = frame.next_id;
                    let admitted = match frame.content {
                        crate::frame::Content::Audio => state.send_audio,
                        crate::frame::Content::Video => state.send_video,
                        crate::frame::Content::MetaData => true,
                    };
                    if admitted && state.sink.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    TickerHandle { commands: tx, task }
}

fn apply_command(state: &mut TickerState, cmd: TickerCommand, pending: &mut Option<Frame>) {
    match cmd {
        TickerCommand::PlaySetup {
            buffer_ms,
            send_audio,
            send_video,
        } => {
            if let Some(ms) = buffer_ms {
                state.buffer_ms = ms;
            }
            if let Some(a) = send_audio {
                state.send_audio = a;
            }
            if let Some(v) = send_video {
                state.send_video = v;
            }
        }
        TickerCommand::Pause => state.paused = true,
        TickerCommand::Resume => state.paused = false,
        TickerCommand::Seek { key, dts } => {
            state.key = key;
            state.base_dts = Some(dts);
            state.base_wall = Instant::now();
            *pending = None;
        }
        TickerCommand::Stop => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Content, FrameFlavor};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn frame(dts: i64, content: Content) -> Frame {
        Frame::new(content, FrameFlavor::Frame, 7, dts, dts, Bytes::from_static(b"x"))
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_frames_in_order_respecting_filters() {
        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = calls.clone();
        let read_frame: ReadFrameFn = Arc::new(move |_client, key| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                let idx = calls.fetch_add(1, Ordering::SeqCst);
                match (key, idx) {
                    (None, 0) => {
                        let mut f = frame(0, Content::Audio);
                        f.next_id = Some(1);
                        Some(f)
                    }
                    (Some(1), _) => {
                        let mut f = frame(20, Content::Video);
                        f.next_id = None;
                        Some(f)
                    }
                    _ => None,
                }
            })
        });

        let (sink, mut recv) = mpsc::channel(8);
        let handle = spawn(ClientId::new(), None, 0, false, true, read_frame, sink);

        // send_audio = false, so the first (audio) frame is dropped and the
        // client only ever observes the video frame.
        let delivered = recv.recv().await.expect("video frame should be delivered");
        assert_eq!(delivered.content, Content::Video);
        assert_eq!(delivered.dts, 20);
        drop(handle);
    }
}
