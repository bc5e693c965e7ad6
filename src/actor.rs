use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::client::{CallerId, ClientId, ClientRegistry, ClientState, SubscribeOptions};
use crate::errors::{StreamError, StreamErrorValue, StreamResult};
use crate::flavor::{ControlEvent, ControlReply, Flavor, FlavorOutcome, InfoMessage};
use crate::frame::{Content, Frame, FrameFlavor, FrameKey};
use crate::media_info::MediaInfo;
use crate::options::StreamOptions;
use crate::source::{DeathToken, SourceHandle};
use crate::storage::{SeekOptions, StorageAdapter, TimeshiftStorage};
use crate::ticker::{self, ReadFrameFn, TickerCommand};

const MAILBOX_CAPACITY: usize = 256;
const GC_HINT_INTERVAL: Duration = Duration::from_secs(30);
const STOP_WAIT_FOR_CONFIG: Duration = Duration::from_secs(5);
const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Source-loss state machine states (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Ok,
    LostGrace,
    NoSource,
}

/// Messages accepted by the actor's mailbox. Sync requests carry a reply
/// channel; async ones (per spec.md §4.1 "Asynchronous") do not.
enum ActorMessage {
    Subscribe {
        caller: CallerId,
        opts: SubscribeOptions,
        sink: mpsc::Sender<Frame>,
        reply: oneshot::Sender<StreamResult<(ClientId, DeathToken)>>,
    },
    Start {
        client: ClientId,
        reply: oneshot::Sender<StreamResult<()>>,
    },
    Pause {
        client: ClientId,
        reply: oneshot::Sender<StreamResult<()>>,
    },
    Resume {
        client: ClientId,
        reply: oneshot::Sender<StreamResult<()>>,
    },
    Unsubscribe {
        client: ClientId,
        reply: oneshot::Sender<StreamResult<()>>,
    },
    Seek {
        client: ClientId,
        dts: i64,
        before_after: SeekOptions,
        reply: oneshot::Sender<StreamResult<()>>,
    },
    SeekInfo {
        dts: i64,
        opts: Value,
        reply: oneshot::Sender<Option<(FrameKey, i64)>>,
    },
    ReadFrame {
        client: ClientId,
        key: Option<FrameKey>,
        reply: oneshot::Sender<Option<Frame>>,
    },
    MediaInfoQuery {
        reply: oneshot::Sender<MediaInfo>,
    },
    SetMediaInfo {
        info: MediaInfo,
        reply: oneshot::Sender<StreamResult<()>>,
    },
    Info {
        keys: Vec<String>,
        reply: oneshot::Sender<StreamResult<Vec<(String, Value)>>>,
    },
    Status {
        reply: oneshot::Sender<Value>,
    },
    SetSource {
        source: SourceHandle,
    },
    SetSocket {
        socket: Box<dyn Any + Send>,
    },
    PlaySetup {
        client: ClientId,
        buffer_ms: Option<u64>,
        send_audio: Option<bool>,
        send_video: Option<bool>,
    },
    FlavorInfo {
        message: InfoMessage,
    },
    Publish {
        frame: Frame,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running stream actor (spec.md §6 "Inbound API").
#[derive(Clone)]
pub struct StreamActorHandle {
    sender: mpsc::Sender<ActorMessage>,
}

macro_rules! request {
    ($self:ident, $variant:ident { $($field:ident),* $(,)? }) => {{
        let (reply, rx) = oneshot::channel();
        $self
            .sender
            .send(ActorMessage::$variant { $($field,)* reply })
            .await
            .map_err(StreamError::from)?;
        rx.await.map_err(StreamError::from)
    }};
}

impl StreamActorHandle {
    /// `subscribe(opts)` then `start` (spec.md §6 `play`). The caller must
    /// hold onto the returned `DeathToken` for as long as it stays
    /// subscribed — dropping it is what the actor's liveness watch
    /// observes as the client going away.
    pub async fn play(
        &self,
        caller: CallerId,
        opts: SubscribeOptions,
        sink: mpsc::Sender<Frame>,
    ) -> StreamResult<(ClientId, DeathToken)> {
        let (client, death_token) = self.subscribe(caller, opts, sink).await?;
        self.start(client).await?;
        Ok((client, death_token))
    }

    /// Rejects with `AlreadySubscribed` if `caller` already has a live
    /// subscription on this stream (spec.md §4.1).
    pub async fn subscribe(
        &self,
        caller: CallerId,
        opts: SubscribeOptions,
        sink: mpsc::Sender<Frame>,
    ) -> StreamResult<(ClientId, DeathToken)> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Subscribe {
                caller,
                opts,
                sink,
                reply,
            })
            .await
            .map_err(StreamError::from)?;
        rx.await.map_err(StreamError::from)?
    }

    pub async fn start(&self, client: ClientId) -> StreamResult<()> {
        request!(self, Start { client })?
    }

    pub async fn pause(&self, client: ClientId) -> StreamResult<()> {
        request!(self, Pause { client })?
    }

    pub async fn resume(&self, client: ClientId) -> StreamResult<()> {
        request!(self, Resume { client })?
    }

    pub async fn unsubscribe(&self, client: ClientId) -> StreamResult<()> {
        request!(self, Unsubscribe { client })?
    }

    /// `before_after` is accepted for API fidelity with spec.md §6's
    /// `seek(before_after, dts)` but is advisory only — both variants
    /// resolve to "nearest keyframe at or after `dts`, else nearest
    /// strictly before" (spec.md §9 Open Questions).
    pub async fn seek(&self, client: ClientId, dts: i64, before_after: SeekOptions) -> StreamResult<()> {
        request!(self, Seek { client, dts, before_after })?
    }

    pub async fn seek_info(&self, dts: i64, opts: Value) -> StreamResult<Option<(FrameKey, i64)>> {
        request!(self, SeekInfo { dts, opts })
    }

    pub async fn read_frame(&self, client: ClientId, key: Option<FrameKey>) -> StreamResult<Option<Frame>> {
        request!(self, ReadFrame { client, key })
    }

    pub async fn media_info(&self) -> StreamResult<MediaInfo> {
        request!(self, MediaInfoQuery {})
    }

    pub async fn set_media_info(&self, info: MediaInfo) -> StreamResult<()> {
        request!(self, SetMediaInfo { info })?
    }

    pub async fn info(&self, keys: Vec<String>) -> StreamResult<Vec<(String, Value)>> {
        request!(self, Info { keys })?
    }

    pub async fn status(&self) -> StreamResult<Value> {
        request!(self, Status {})
    }

    pub async fn set_source(&self, source: SourceHandle) -> StreamResult<()> {
        self.sender
            .send(ActorMessage::SetSource { source })
            .await
            .map_err(StreamError::from)
    }

    pub async fn set_socket(&self, socket: Box<dyn Any + Send>) -> StreamResult<()> {
        self.sender
            .send(ActorMessage::SetSocket { socket })
            .await
            .map_err(StreamError::from)
    }

    pub async fn play_setup(
        &self,
        client: ClientId,
        buffer_ms: Option<u64>,
        send_audio: Option<bool>,
        send_video: Option<bool>,
    ) -> StreamResult<()> {
        self.sender
            .send(ActorMessage::PlaySetup {
                client,
                buffer_ms,
                send_audio,
                send_video,
            })
            .await
            .map_err(StreamError::from)
    }

    pub async fn publish(&self, frame: Frame) -> StreamResult<()> {
        self.sender
            .send(ActorMessage::Publish { frame })
            .await
            .map_err(StreamError::from)
    }

    /// Forwards an out-of-band message straight to the flavor's
    /// `handle_info` (spec.md §4.5) without the core interpreting it.
    pub async fn send_info(&self, message: InfoMessage) -> StreamResult<()> {
        self.sender
            .send(ActorMessage::FlavorInfo { message })
            .await
            .map_err(StreamError::from)
    }

    pub async fn stop_stream(&self) -> StreamResult<()> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Stop { reply })
            .await
            .map_err(StreamError::from)?;
        let _ = rx.await;
        Ok(())
    }

    /// Builds the closure a ticker uses to pull frames back through this
    /// actor (spec.md §4.4), routed through the same mailbox as every
    /// other request so storage access stays serialized on the actor task.
    fn read_frame_fn(&self) -> ReadFrameFn {
        let sender = self.sender.clone();
        Arc::new(move |client, key| {
            let sender = sender.clone();
            Box::pin(async move {
                let (reply, rx) = oneshot::channel();
                if sender
                    .send(ActorMessage::ReadFrame { client, key, reply })
                    .await
                    .is_err()
                {
                    return None;
                }
                rx.await.ok().flatten()
            })
        })
    }
}

struct StreamActor {
    options: StreamOptions,
    flavor: Box<dyn Flavor>,
    storage: Option<Box<dyn StorageAdapter>>,
    media_info: MediaInfo,
    clients: ClientRegistry,
    source: Option<SourceHandle>,
    source_state: SourceState,
    ts_delta: Option<i64>,
    last_dts: Option<i64>,
    last_dts_at: Option<Instant>,
    video_config: Option<Frame>,
    audio_config: Option<Frame>,
    waiting_for_config: VecDeque<oneshot::Sender<MediaInfo>>,
    has_socket: bool,
    created_at: DateTime<Utc>,
    handle: StreamActorHandle,
}

impl StreamActor {
    /// Spawn a new actor task implementing spec.md §4.1–§4.6.
    ///
    /// `format_storage` stands in for "a flavor that sets `format`"
    /// (spec.md §3) — our `Flavor::init` returns only a control outcome,
    /// not a storage object, so storage conflicting with `timeshift_ms` is
    /// surfaced as an explicit constructor argument instead.
    pub async fn spawn(
        options: StreamOptions,
        mut flavor: Box<dyn Flavor>,
        format_storage: Option<Box<dyn StorageAdapter>>,
    ) -> StreamResult<StreamActorHandle> {
        if options.timeshift_ms.is_some() && format_storage.is_some() {
            return Err(StreamErrorValue::InitializedTimeshiftAndStorage.into());
        }

        match flavor.init(&options).await {
            FlavorOutcome::Stop(reason) | FlavorOutcome::StopWithReply(reason, _) => {
                return Err(StreamErrorValue::FlavorStop(reason).into());
            }
            FlavorOutcome::Reply(()) | FlavorOutcome::NoReply => {}
        }

        let storage: Option<Box<dyn StorageAdapter>> = format_storage.or_else(|| {
            options
                .timeshift_ms
                .map(|ms| Box::new(TimeshiftStorage::new(ms)) as Box<dyn StorageAdapter>)
        });

        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = StreamActorHandle { sender };

        let media_info = clone_media_info_seed(&options.media_info);

        let actor = Self {
            options,
            flavor,
            storage,
            media_info,
            clients: ClientRegistry::new(),
            source: None,
            source_state: SourceState::Ok,
            ts_delta: None,
            last_dts: None,
            last_dts_at: None,
            video_config: None,
            audio_config: None,
            waiting_for_config: VecDeque::new(),
            has_socket: false,
            created_at: Utc::now(),
            handle: handle.clone(),
        };

        tokio::spawn(actor.run(receiver));
        Ok(handle)
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<ActorMessage>) {
        let mut gc_hint = tokio::time::interval(GC_HINT_INTERVAL);
        let mut stop_wait_fired = false;
        let mut stop_wait_deadline = Some(Instant::now() + STOP_WAIT_FOR_CONFIG);
        let mut no_source_deadline: Option<Instant> = None;
        let mut inactivity_deadline = Instant::now() + DEFAULT_INACTIVITY_TIMEOUT;

        loop {
            let source_liveness_active = self.source.is_some();

            tokio::select! {
                biased;

                msg = mailbox.recv() => {
                    let Some(msg) = msg else { break };
                    inactivity_deadline = Instant::now() + DEFAULT_INACTIVITY_TIMEOUT;
                    if !self.handle_message(msg).await {
                        break;
                    }
                    // `set_source` may have cancelled the grace period from
                    // inside `handle_message` (spec.md §4.6 "During
                    // SOURCE_LOST_GRACE, set_source(S) cancels the timer").
                    // A no-longer-`LostGrace` state means any armed
                    // `no_source` deadline is stale and must not fire.
                    if self.source_state != SourceState::LostGrace {
                        no_source_deadline = None;
                    }
                }

                () = watch_source(&mut self.source), if source_liveness_active => {
                    if !self.on_source_lost().await {
                        break;
                    }
                    no_source_deadline = self.arm_no_source_timer();
                }

                () = sleep_until_opt(no_source_deadline) => {
                    no_source_deadline = None;
                    if !self.on_no_source_timer().await {
                        break;
                    }
                }

                () = sleep_until_opt(stop_wait_deadline), if !stop_wait_fired => {
                    stop_wait_fired = true;
                    stop_wait_deadline = None;
                    self.fire_stop_wait_for_config().await;
                }

                _ = gc_hint.tick() => {
                    debug!(stream = %self.options.identifier.name(), "gc hint");
                }

                () = tokio::time::sleep_until(inactivity_deadline), if self.source.is_some() => {
                    if !self.on_inactivity_timeout().await {
                        break;
                    }
                    inactivity_deadline = Instant::now() + DEFAULT_INACTIVITY_TIMEOUT;
                }
            }
        }

        info!(stream = %self.options.identifier.name(), "stream actor stopped");
    }

    /// Returns `false` if the actor should terminate.
    async fn handle_message(&mut self, msg: ActorMessage) -> bool {
        match msg {
            ActorMessage::Subscribe {
                caller,
                opts,
                sink,
                reply,
            } => {
                let result = self
                    .clients
                    .insert(caller, opts, sink)
                    .map(|(id, sub)| (id, sub.death_token));
                let _ = reply.send(result);
                true
            }
            ActorMessage::Start { client, reply } => {
                let result = self.start_client(client).await;
                let _ = reply.send(result);
                true
            }
            ActorMessage::Pause { client, reply } => {
                let result = self.pause_client(client).await;
                let _ = reply.send(result);
                true
            }
            ActorMessage::Resume { client, reply } => {
                let result = self.resume_client(client).await;
                let _ = reply.send(result);
                true
            }
            ActorMessage::Unsubscribe { client, reply } => {
                self.clients.remove(client);
                let _ = reply.send(Ok(()));
                true
            }
            ActorMessage::Seek {
                client,
                dts,
                before_after,
                reply,
            } => {
                let result = self.seek_client(client, dts, before_after).await;
                let _ = reply.send(result);
                true
            }
            ActorMessage::SeekInfo { dts, opts, reply } => {
                let result = self.seek_info(dts, opts).await;
                let _ = reply.send(result);
                true
            }
            ActorMessage::ReadFrame { client, key, reply } => {
                let result = self.read_frame_for_client(client, key).await;
                let _ = reply.send(result);
                true
            }
            ActorMessage::MediaInfoQuery { reply } => {
                self.on_media_info_query(reply).await;
                true
            }
            ActorMessage::SetMediaInfo { info, reply } => {
                self.media_info = info;
                self.flush_waiters_if_ready().await;
                let _ = reply.send(Ok(()));
                true
            }
            ActorMessage::Info { keys, reply } => {
                let result = self.info(&keys).await;
                let _ = reply.send(result);
                true
            }
            ActorMessage::Status { reply } => {
                let status = self.status_snapshot().await;
                let _ = reply.send(status);
                true
            }
            ActorMessage::SetSource { source } => self.set_source(source).await,
            ActorMessage::SetSocket { socket } => {
                self.has_socket = true;
                let _ = self.flavor.handle_control(ControlEvent::SetSocket(socket)).await;
                true
            }
            ActorMessage::PlaySetup {
                client,
                buffer_ms,
                send_audio,
                send_video,
            } => {
                if let Some(entry) = self.clients.find(client) {
                    if let Some(ticker) = &entry.ticker {
                        ticker
                            .send(TickerCommand::PlaySetup {
                                buffer_ms,
                                send_audio,
                                send_video,
                            })
                            .await;
                    }
                }
                true
            }
            ActorMessage::Publish { frame } => self.dispatch_frame(frame).await,
            ActorMessage::Stop { reply } => {
                let _ = reply.send(());
                false
            }
        }
    }

    async fn start_client(&mut self, client: ClientId) -> StreamResult<()> {
        let passive = self.storage.is_some();
        let Some(entry) = self.clients.find_mut(client) else {
            return Err(StreamErrorValue::UnknownClient(client.to_string()).into());
        };
        entry.started = true;
        if passive {
            entry.state = ClientState::Passive;
            let buffer_ms = entry.buffer_ms;
            let send_audio = entry.send_audio;
            let send_video = entry.send_video;
            let sink = entry.sink.clone();
            let read_frame = self.handle.read_frame_fn();
            let ticker = ticker::spawn(client, None, buffer_ms, send_audio, send_video, read_frame, sink);
            if let Some(e) = self.clients.find_mut(client) {
                e.ticker = Some(ticker);
            }
        } else {
            // Stays `Starting`; fan-out flips it to `Active` on its first
            // dispatched frame (spec.md §4.2 step 5), which is also what
            // keeps the "no frame arrives before start" ordering guarantee.
            entry.state = ClientState::Starting;
        }
        Ok(())
    }

    async fn pause_client(&mut self, client: ClientId) -> StreamResult<()> {
        let Some(entry) = self.clients.find_mut(client) else {
            return Err(StreamErrorValue::UnknownClient(client.to_string()).into());
        };
        match entry.state {
            ClientState::Active | ClientState::Passive => {
                if let Some(ticker) = &entry.ticker {
                    ticker.send(TickerCommand::Pause).await;
                }
                entry.state = ClientState::Paused;
                Ok(())
            }
            ClientState::Starting | ClientState::Paused => Ok(()),
        }
    }

    async fn resume_client(&mut self, client: ClientId) -> StreamResult<()> {
        let Some(entry) = self.clients.find_mut(client) else {
            return Err(StreamErrorValue::UnknownClient(client.to_string()).into());
        };
        if entry.state != ClientState::Paused {
            return Ok(());
        }
        if entry.ticker.is_some() {
            entry.state = ClientState::Passive;
            if let Some(ticker) = &entry.ticker {
                ticker.send(TickerCommand::Resume).await;
            }
        } else {
            entry.state = ClientState::Active;
        }
        Ok(())
    }

    async fn seek_client(&mut self, client: ClientId, dts: i64, before_after: SeekOptions) -> StreamResult<()> {
        let Some(storage) = &self.storage else {
            return Err(StreamErrorValue::NoStorage.into());
        };
        let Some((key, new_dts)) = storage.seek(dts, before_after).await else {
            return Err(StreamErrorValue::SeekNotFound.into());
        };
        let Some(entry) = self.clients.find(client) else {
            return Err(StreamErrorValue::UnknownClient(client.to_string()).into());
        };
        let Some(ticker) = &entry.ticker else {
            return Err(StreamErrorValue::NoStorage.into());
        };
        ticker
            .send(TickerCommand::Seek {
                key: Some(key),
                dts: new_dts,
            })
            .await;
        Ok(())
    }

    async fn seek_info(&mut self, dts: i64, opts: Value) -> Option<(FrameKey, i64)> {
        let outcome = self
            .flavor
            .handle_control(ControlEvent::SeekInfo { dts, opts })
            .await;
        if let FlavorOutcome::Reply(ControlReply::SeekInfo(info)) = outcome {
            return info;
        }
        let storage = self.storage.as_ref()?;
        storage.seek(dts, SeekOptions::After).await
    }

    async fn read_frame_for_client(&mut self, client: ClientId, key: Option<FrameKey>) -> Option<Frame> {
        let storage = self.storage.as_mut()?;
        let frame = storage.read_frame(key).await?;
        if frame.flavor == FrameFlavor::Config {
            self.cache_config_frame(&frame);
        } else {
            let size = frame.body.len() as u64;
            self.clients.increment_bytes(client, size);
        }
        Some(frame)
    }

    fn cache_config_frame(&mut self, frame: &Frame) {
        match frame.content {
            Content::Video => self.video_config = Some(frame.clone()),
            Content::Audio => self.audio_config = Some(frame.clone()),
            Content::MetaData => {}
        }
    }

    /// A `media_info` reply with storage's `duration` merged in (spec.md
    /// §4.1 "merging storage properties (notably `duration`) into the
    /// reply options").
    async fn media_info_reply(&self) -> MediaInfo {
        let mut info = self.media_info.clone();
        info.duration_ms = match &self.storage {
            Some(storage) => storage.properties().await.duration_ms,
            None => None,
        };
        info
    }

    async fn on_media_info_query(&mut self, reply: oneshot::Sender<MediaInfo>) {
        if self.media_info.is_ready() {
            let info = self.media_info_reply().await;
            let _ = reply.send(info);
        } else {
            self.waiting_for_config.push_back(reply);
        }
    }

    async fn flush_waiters_if_ready(&mut self) {
        if !self.media_info.is_ready() || self.waiting_for_config.is_empty() {
            return;
        }
        let info = self.media_info_reply().await;
        while let Some(waiter) = self.waiting_for_config.pop_front() {
            let _ = waiter.send(info.clone());
        }
    }

    async fn fire_stop_wait_for_config(&mut self) {
        self.media_info.force_ready();
        self.flush_waiters_if_ready().await;
    }

    async fn info(&mut self, keys: &[String]) -> StreamResult<Vec<(String, Value)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let value = match key.as_str() {
                "client_count" => json!(self.clients.client_count()),
                "url" => json!(self.options.url),
                "type" => json!(self.options.kind),
                "storage" => {
                    if let Some(storage) = &self.storage {
                        let props = storage.properties().await;
                        json!({ "present": true, "duration_ms": props.duration_ms })
                    } else {
                        json!({ "present": false })
                    }
                }
                "clients" => json!(self
                    .clients
                    .list()
                    .map(|c| json!({ "id": c.id.to_string(), "state": format!("{:?}", c.state) }))
                    .collect::<Vec<_>>()),
                "last_dts" => json!(self.last_dts),
                "ts_delay" => json!(self.ts_delay_ms()),
                "created_at" => json!(self.created_at.to_rfc3339()),
                "options" => json!({
                    "name": self.options.identifier.name(),
                    "url": self.options.url,
                    "host": self.options.identifier.host(),
                    "type": self.options.kind,
                    "glue_delta": self.options.glue_delta,
                    "timeshift_ms": self.options.timeshift_ms,
                    "clients_timeout": self.options.clients_timeout,
                    "retry_limit": self.options.retry_limit,
                }),
                other => return Err(StreamErrorValue::BadInfoKey(other.to_string()).into()),
            };
            out.push((key.clone(), value));
        }
        Ok(out)
    }

    fn ts_delay_ms(&self) -> i64 {
        if matches!(self.media_info.flow_type, crate::media_info::FlowType::File) {
            return 0;
        }
        match self.last_dts_at {
            Some(at) => Instant::now().saturating_duration_since(at).as_millis() as i64,
            None => 0,
        }
    }

    async fn status_snapshot(&mut self) -> Value {
        let info = self
            .info(&[
                "client_count".into(),
                "url".into(),
                "type".into(),
                "last_dts".into(),
                "created_at".into(),
            ])
            .await
            .unwrap_or_default();
        Value::Object(info.into_iter().collect())
    }

    /// Returns `false` if the flavor used this call to stop the actor
    /// (spec.md §7: a flavor `{stop, Reason, ...}` return always propagates
    /// as actor termination).
    async fn set_source(&mut self, source: SourceHandle) -> bool {
        // Demonitor any previous source: dropping `self.source` drops its
        // `LivenessWatch`, which is all that "demonitor" means here.
        self.source = None;
        // Cancels any pending `no_source` grace timer (spec.md §4.6 "During
        // SOURCE_LOST_GRACE, set_source(S) cancels the timer and returns to
        // SOURCE_OK") — the caller in `run()` re-arms it from this state.
        self.source_state = SourceState::Ok;
        self.ts_delta = None;

        let outcome = self.flavor.handle_control(ControlEvent::SetSource(source.id.clone())).await;
        if matches!(outcome, FlavorOutcome::Stop(_) | FlavorOutcome::StopWithReply(_, _)) {
            self.notify_clients_of_shutdown();
            return false;
        }
        self.source = match outcome {
            FlavorOutcome::Reply(ControlReply::NewSource(s)) => Some(s),
            // Default: adopt the source the caller supplied. The flavor
            // only gets to *substitute* a different one; staying silent
            // must not leave the actor with no monitored source at all.
            _ => Some(source),
        };
        // spec.md §8 scenario 2: an explicit `set_source` arriving mid
        // failover must re-arm codec-config delivery for clients that were
        // already streaming, the same as the `no_source` timer's own
        // recovery branch (see `on_no_source_timer` below).
        self.clients.mass_update_state(ClientState::Active, ClientState::Starting);
        true
    }

    /// Returns `false` if the actor should terminate.
    async fn on_source_lost(&mut self) -> bool {
        let source_id = self.source.as_ref().map(|s| s.id.clone()).unwrap_or_default();
        self.source = None;
        let outcome = self
            .flavor
            .handle_control(ControlEvent::SourceLost(source_id))
            .await;

        match outcome {
            FlavorOutcome::Stop(_) | FlavorOutcome::StopWithReply(_, _) => {
                self.notify_clients_of_shutdown();
                false
            }
            FlavorOutcome::Reply(ControlReply::NewSource(s)) => {
                self.source = Some(s);
                self.source_state = SourceState::Ok;
                self.ts_delta = None;
                true
            }
            FlavorOutcome::NoReply | FlavorOutcome::Reply(_) => match self.options.source_timeout {
                crate::options::SourceTimeout::Shutdown => {
                    self.notify_clients_of_shutdown();
                    false
                }
                crate::options::SourceTimeout::Millis(0) => {
                    self.notify_clients_of_shutdown();
                    false
                }
                crate::options::SourceTimeout::Disabled => {
                    self.source_state = SourceState::Ok;
                    true
                }
                crate::options::SourceTimeout::Millis(_) => {
                    self.source_state = SourceState::LostGrace;
                    true
                }
            },
        }
    }

    fn arm_no_source_timer(&self) -> Option<Instant> {
        match (self.source_state, self.options.source_timeout) {
            (SourceState::LostGrace, crate::options::SourceTimeout::Millis(ms)) => {
                Some(Instant::now() + Duration::from_millis(ms))
            }
            _ => None,
        }
    }

    /// Returns `false` if the actor should terminate.
    async fn on_no_source_timer(&mut self) -> bool {
        let outcome = self.flavor.handle_control(ControlEvent::NoSource).await;
        match outcome {
            FlavorOutcome::NoReply => {
                self.notify_clients_of_shutdown();
                false
            }
            FlavorOutcome::Reply(ControlReply::NewSource(s)) => {
                self.source = Some(s);
                self.source_state = SourceState::Ok;
                self.ts_delta = None;
                // Active clients re-receive codec configs on the next frame.
                self.clients.mass_update_state(ClientState::Active, ClientState::Starting);
                true
            }
            FlavorOutcome::Stop(_) | FlavorOutcome::StopWithReply(_, _) => {
                self.notify_clients_of_shutdown();
                false
            }
            FlavorOutcome::Reply(_) => true,
        }
    }

    /// Returns `false` if the actor should terminate.
    async fn on_inactivity_timeout(&mut self) -> bool {
        let outcome = self.flavor.handle_control(ControlEvent::Timeout).await;
        !matches!(outcome, FlavorOutcome::Stop(_) | FlavorOutcome::StopWithReply(_, _))
    }

    fn notify_clients_of_shutdown(&mut self) {
        // Dropping every client entry drops its monitor/ticker, which is
        // the unsubscribe signal a liveness watch exists to deliver.
        for entry in self.clients.list_mut() {
            if let Some(ticker) = entry.ticker.take() {
                ticker.stop();
            }
        }
    }

    /// Frame dispatch pipeline (spec.md §4.2). Every inbound frame is first
    /// offered to the flavor's `handle_frame` (spec.md §4.5) so a flavor can
    /// rewrite or drop it ahead of the transcoder, mirroring how it already
    /// gets first refusal on every control event. Returns `false` if the
    /// flavor requested the actor stop.
    async fn dispatch_frame(&mut self, frame: Frame) -> bool {
        let mut frame = match self.flavor.handle_frame(&frame).await {
            FlavorOutcome::Stop(_) | FlavorOutcome::StopWithReply(_, _) => {
                self.notify_clients_of_shutdown();
                return false;
            }
            FlavorOutcome::Reply(rewritten) => rewritten,
            FlavorOutcome::NoReply => frame,
        };

        if let Some(transcoder) = &mut self.options.transcoder {
            match transcoder.apply(frame).await {
                Some(f) => frame = f,
                None => return true,
            }
        }

        self.apply_ts_delta(&mut frame);

        self.last_dts = Some(frame.dts);
        self.last_dts_at = Some(Instant::now());

        if frame.flavor == FrameFlavor::Config {
            self.cache_config_frame(&frame);
            if self.media_info.observe_config(&frame) {
                self.flush_waiters_if_ready().await;
            }
        }

        if let Some(storage) = &mut self.storage {
            storage.write_frame(frame.clone()).await;
        }

        self.fan_out_frame(&frame).await;
        true
    }

    fn apply_ts_delta(&mut self, frame: &mut Frame) {
        if self.ts_delta.is_none() {
            let delta = self.last_dts.map_or(0, |last| last - frame.dts);
            self.ts_delta = Some(delta);
        }
        let delta = self.ts_delta.unwrap_or(0);
        frame.dts += delta;
        frame.pts += delta;
    }

    /// Lock-free-for-the-actor snapshot-and-push fan-out, grounded in this
    /// codebase's `fan_out_frame`/`fan_out_packet` (`try_send`, never
    /// blocking the dispatcher on one slow client).
    async fn fan_out_frame(&mut self, frame: &Frame) {
        let video_config = self.video_config.clone();
        let audio_config = self.audio_config.clone();

        for entry in self.clients.list_mut() {
            let eligible = entry.started
                && matches!(entry.state, ClientState::Active | ClientState::Starting);
            if !eligible {
                continue;
            }

            if !entry.sent_starting_config && entry.state == ClientState::Starting {
                if let Some(video) = &video_config {
                    let _ = entry.sink.try_send(video.stamped(entry.stream_tag.as_deref()));
                }
                if let Some(audio) = &audio_config {
                    let _ = entry.sink.try_send(audio.stamped(entry.stream_tag.as_deref()));
                }
                entry.sent_starting_config = true;
                entry.state = ClientState::Active;
            }

            let admitted = match frame.content {
                Content::Audio => entry.send_audio,
                Content::Video => entry.send_video,
                Content::MetaData => true,
            };
            if !admitted {
                continue;
            }

            let stamped = frame.stamped(entry.stream_tag.as_deref());
            if entry.sink.try_send(stamped).is_err() {
                warn!(client = %entry.id, "dropped frame: client channel full or closed");
            }
        }
    }
}

fn clone_media_info_seed(seed: &MediaInfo) -> MediaInfo {
    // `MediaInfo` itself is cheap (no trait objects) so a manual field copy
    // suffices without requiring the whole `StreamOptions` to be `Clone`.
    MediaInfo {
        flow_type: match seed.flow_type {
            crate::media_info::FlowType::Stream => crate::media_info::FlowType::Stream,
            crate::media_info::FlowType::File => crate::media_info::FlowType::File,
        },
        audio: seed.audio.clone(),
        video: seed.video.clone(),
        duration_ms: seed.duration_ms,
    }
}

async fn watch_source(source: &mut Option<SourceHandle>) {
    match source {
        Some(handle) => {
            let _ = (&mut handle.liveness).await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::test_support::PassthroughFlavor;
    use bytes::Bytes;

    fn video_frame(flavor: FrameFlavor, dts: i64) -> Frame {
        Frame::new(Content::Video, flavor, 7, dts, dts, Bytes::from_static(b"v"))
    }

    fn audio_frame(flavor: FrameFlavor, dts: i64) -> Frame {
        Frame::new(Content::Audio, flavor, 7, dts, dts, Bytes::from_static(b"a"))
    }

    async fn spawn_actor(options: StreamOptions) -> StreamActorHandle {
        StreamActor::spawn(options, Box::new(PassthroughFlavor), None)
            .await
            .expect("actor should spawn")
    }

    #[tokio::test]
    async fn config_then_frames_scenario() {
        let handle = spawn_actor(StreamOptions::new("room")).await;

        let (sink, mut recv) = mpsc::channel(16);
        let (client, _death) = handle
            .subscribe(
                CallerId("c1".into()),
                SubscribeOptions {
                    stream_tag: Some("A".into()),
                    ..SubscribeOptions::new()
                },
                sink,
            )
            .await
            .unwrap();
        handle.start(client).await.unwrap();

        let media_info_handle = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.media_info().await })
        };

        handle.publish(video_frame(FrameFlavor::Config, 0)).await.unwrap();
        handle.publish(audio_frame(FrameFlavor::Config, 0)).await.unwrap();

        let info = media_info_handle.await.unwrap().unwrap();
        assert!(info.is_ready());

        let first = recv.recv().await.unwrap();
        assert_eq!(first.content, Content::Video);
        assert_eq!(first.stream_id.as_deref(), Some("A"));
        let second = recv.recv().await.unwrap();
        assert_eq!(second.content, Content::Audio);
        assert_eq!(second.stream_id.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn unknown_info_key_is_a_local_error() {
        let handle = spawn_actor(StreamOptions::new("room")).await;
        let err = handle.info(vec!["client_count".into(), "foo".into()]).await;
        assert!(err.is_err());

        // actor survives; subsequent info call still works
        let ok = handle.info(vec!["client_count".into()]).await.unwrap();
        assert_eq!(ok[0].1, json!(0));
    }

    #[tokio::test]
    async fn client_count_tracks_subscriptions() {
        let handle = spawn_actor(StreamOptions::new("room")).await;
        let (sink, _recv) = mpsc::channel(4);
        let (client, _death) = handle
            .subscribe(CallerId("test-client".into()), SubscribeOptions::new(), sink)
            .await
            .unwrap();
        let count = handle.info(vec!["client_count".into()]).await.unwrap();
        assert_eq!(count[0].1, json!(1));
        handle.unsubscribe(client).await.unwrap();
        let count = handle.info(vec!["client_count".into()]).await.unwrap();
        assert_eq!(count[0].1, json!(0));
    }

    #[tokio::test]
    async fn ts_delta_resets_after_set_source() {
        let handle = spawn_actor(StreamOptions::new("room")).await;
        handle.publish(video_frame(FrameFlavor::Keyframe, 100)).await.unwrap();

        let (new_source, _death_token) = SourceHandle::new("s2");
        handle.set_source(new_source).await.unwrap();

        // ts_delta is recomputed fresh on the next frame: 100 (last_dts)
        // minus this frame's own dts of 0 means the next frame should be
        // re-based to continue at 100.
        let (sink, mut recv) = mpsc::channel(4);
        let (client, _death) = handle
            .subscribe(CallerId("test-client".into()), SubscribeOptions::new(), sink)
            .await
            .unwrap();
        handle.start(client).await.unwrap();
        handle.publish(video_frame(FrameFlavor::Keyframe, 0)).await.unwrap();
        let delivered = recv.recv().await.unwrap();
        assert_eq!(delivered.dts, 100);
    }

    /// A flavor that drops every audio frame and rewrites video frames'
    /// codec tag, exercising `handle_frame`'s `Reply`/`NoReply` outcomes
    /// ahead of the rest of the dispatch pipeline (spec.md §4.5).
    struct RewritingFlavor;

    #[async_trait::async_trait]
    impl Flavor for RewritingFlavor {
        async fn init(&mut self, _options: &StreamOptions) -> FlavorOutcome<()> {
            FlavorOutcome::NoReply
        }

        async fn handle_frame(&mut self, frame: &Frame) -> FlavorOutcome<Frame> {
            match frame.content {
                Content::Audio => FlavorOutcome::Stop("audio rejected".into()),
                Content::Video => {
                    let mut rewritten = frame.clone();
                    rewritten.codec = 99;
                    FlavorOutcome::Reply(rewritten)
                }
                Content::MetaData => FlavorOutcome::NoReply,
            }
        }

        async fn handle_control(&mut self, _event: ControlEvent) -> FlavorOutcome<ControlReply> {
            FlavorOutcome::NoReply
        }

        async fn handle_info(&mut self, _message: InfoMessage) -> FlavorOutcome<()> {
            FlavorOutcome::NoReply
        }
    }

    #[tokio::test]
    async fn handle_frame_can_rewrite_a_frame_before_dispatch() {
        let handle = StreamActor::spawn(StreamOptions::new("room"), Box::new(RewritingFlavor), None)
            .await
            .unwrap();
        let (sink, mut recv) = mpsc::channel(4);
        let (client, _death) = handle
            .subscribe(CallerId("test-client".into()), SubscribeOptions::new(), sink)
            .await
            .unwrap();
        handle.start(client).await.unwrap();

        handle.publish(video_frame(FrameFlavor::Keyframe, 0)).await.unwrap();
        let delivered = recv.recv().await.unwrap();
        assert_eq!(delivered.codec, 99);
    }

    #[tokio::test]
    async fn handle_frame_stop_terminates_the_actor() {
        let handle = StreamActor::spawn(StreamOptions::new("room"), Box::new(RewritingFlavor), None)
            .await
            .unwrap();

        handle.publish(audio_frame(FrameFlavor::Frame, 0)).await.unwrap();

        // The actor's mailbox is gone once it terminates; a subsequent
        // request fails rather than hanging.
        assert!(handle.info(vec!["client_count".into()]).await.is_err());
    }
}
