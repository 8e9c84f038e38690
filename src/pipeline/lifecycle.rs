//! Pipeline lifecycle
//!
//! Reference-counts consumers. The first `attach` opens the source, brings up
//! the scheduler and the decode worker and, with a session configured,
//! connects and joins. The last `detach` unwinds in the opposite order:
//! worker first, then unpublish → leave → disconnect, then the scheduler.
//! A source failure unwinds the same way on the next [`PipelineLifecycle::reap`],
//! `attach` or `detach`.

use anyhow::{Context, anyhow};
use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::capture::{MediaSource, RegionError, SourceError, SourceFactory, default_factory};
use crate::config::{PipelineConfig, SessionConfig};
use crate::encoder;
use crate::pipeline::distributor::{
    FrameDistributor, PreviewSink, SharedTracks, TrackRegistry, end_tracks, lock_tracks,
};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::pacer::PlaybackPacer;
use crate::pipeline::queue::{ConsumerId, TrackConsumer, track_queue};
use crate::pipeline::scheduler::{Scheduler, SchedulerError, SchedulerHandle};
use crate::pipeline::state::PipelineState;
use crate::pipeline::types::MediaKind;
use crate::pipeline::worker::{DecodeWorker, WorkerExit};
use crate::session::{OutboundTrack, SessionConnector};
use crate::utils::sos::SignalOfStop;

const JOIN_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid capture region: {0}")]
    InvalidRegion(#[from] RegionError),

    #[error("cannot open source: {0}")]
    Source(#[from] SourceError),

    #[error("source has no {0} stream")]
    MissingStream(MediaKind),

    #[error("looping needs a seekable source")]
    LoopUnsupported,

    #[error("failed to spawn decode thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("a server url is configured but no session connector")]
    MissingConnector,

    #[error("session failure: {0:#}")]
    Session(anyhow::Error),

    #[error("server refused to publish the {0} track")]
    PublishRejected(MediaKind),

    #[error("attach/detach called from the scheduler thread")]
    ReentrantCall,

    #[error("unknown consumer {0}")]
    UnknownConsumer(ConsumerId),

    #[error("publishing decoded frames needs an encoder; build with the `ffmpeg` feature or disable decode")]
    EncoderUnavailable,
}

/// Handle returned by [`PipelineLifecycle::attach`]
pub struct Consumer {
    pub id: ConsumerId,
    pub kind: MediaKind,
    /// The queue to read from; `None` when it was published to the session
    pub track: Option<TrackConsumer>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("published", &self.track.is_none())
            .finish()
    }
}

pub struct PipelineLifecycle {
    config: PipelineConfig,
    session: SessionConfig,
    factory: SourceFactory,
    connector: Option<Arc<dyn SessionConnector>>,
    preview: Option<Arc<dyn PreviewSink>>,

    state: PipelineState,
    /// Active consumers and the kind each one asked for
    consumers: HashMap<ConsumerId, MediaKind>,
    /// Consumers dropped by a failure teardown; their detach is a no-op
    retired: HashSet<ConsumerId>,
    next_id: ConsumerId,
    available: Vec<MediaKind>,
    published: usize,

    tracks: SharedTracks,
    scheduler: Option<Scheduler>,
    worker: Option<JoinHandle<WorkerExit>>,
    worker_ended: Option<Arc<AtomicBool>>,
    worker_failed: Option<Arc<AtomicBool>>,
    quit: SignalOfStop,
    health: Arc<PipelineHealth>,
}

impl PipelineLifecycle {
    pub fn new(config: PipelineConfig, session: SessionConfig) -> Self {
        Self {
            config,
            session,
            factory: default_factory(),
            connector: None,
            preview: None,
            state: PipelineState::Stopped,
            consumers: HashMap::new(),
            retired: HashSet::new(),
            next_id: 1,
            available: Vec::new(),
            published: 0,
            tracks: TrackRegistry::shared(),
            scheduler: None,
            worker: None,
            worker_ended: None,
            worker_failed: None,
            quit: SignalOfStop::new(),
            health: Arc::new(PipelineHealth::new()),
        }
    }

    pub fn with_factory(mut self, factory: SourceFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_preview(mut self, preview: Arc<dyn PreviewSink>) -> Self {
        self.preview = Some(preview);
        self
    }

    /// Reports `Stopping` once the source has failed, until the failure is reaped
    pub fn state(&self) -> PipelineState {
        if self.state.is_running() && self.source_failed() {
            return PipelineState::Stopping;
        }
        self.state
    }

    /// How long the pipeline has been running
    pub fn uptime(&self) -> Option<Duration> {
        self.state().running_duration()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn has_scheduler(&self) -> bool {
        self.scheduler.is_some()
    }

    /// The decode loop has exited (end of stream, source failure or stop)
    pub fn source_ended(&self) -> bool {
        self.worker_ended
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// The decode loop stopped on a source error
    pub fn source_failed(&self) -> bool {
        self.worker_failed
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Tear down a pipeline whose source failed. Returns whether it did.
    ///
    /// The consumers that were attached are retired: their queues have ended
    /// and detaching them later succeeds without effect.
    pub fn reap(&mut self) -> bool {
        if !self.source_failed() || (self.worker.is_none() && self.scheduler.is_none()) {
            return false;
        }
        if self.on_scheduler_thread() {
            return false;
        }
        warn!(
            "Pipeline: source failed, stopping {} consumer(s)",
            self.consumers.len()
        );
        self.retired.extend(self.consumers.keys().copied());
        self.teardown();
        true
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    fn session_enabled(&self) -> bool {
        self.session.is_enabled()
    }

    fn scheduler_handle(&self) -> Result<SchedulerHandle, PipelineError> {
        self.scheduler
            .as_ref()
            .map(Scheduler::handle)
            .ok_or(PipelineError::Scheduler(SchedulerError::Stopped))
    }

    fn connector(&self) -> Result<Arc<dyn SessionConnector>, PipelineError> {
        self.connector.clone().ok_or(PipelineError::MissingConnector)
    }

    fn on_scheduler_thread(&self) -> bool {
        self.scheduler
            .as_ref()
            .is_some_and(|s| s.handle().is_scheduler_thread())
    }

    fn transition(&mut self, next: PipelineState) {
        if !self.state.can_transition_to(&next) {
            warn!("Pipeline: unexpected transition {} -> {}", self.state, next);
        }
        self.state = next;
    }

    /// Add a consumer of `kind`. The first consumer starts the pipeline.
    pub fn attach(&mut self, kind: MediaKind) -> Result<Consumer, PipelineError> {
        if self.on_scheduler_thread() {
            return Err(PipelineError::ReentrantCall);
        }
        self.reap();

        let first = self.consumers.is_empty();
        let result = if first {
            self.transition(PipelineState::Starting);
            self.start(kind)
        } else {
            self.add_consumer(kind)
        };

        match result {
            Ok(consumer) => {
                self.consumers.insert(consumer.id, kind);
                if first {
                    self.transition(PipelineState::Running {
                        started_at: Instant::now(),
                    });
                }
                info!(
                    "Pipeline: {} consumer {} attached ({} active)",
                    kind,
                    consumer.id,
                    self.consumers.len()
                );
                Ok(consumer)
            }
            Err(e) => {
                error!("Pipeline: attach {} failed: {}", kind, e);
                if first {
                    self.teardown();
                }
                Err(e)
            }
        }
    }

    /// Remove a consumer. The last one stops the pipeline.
    pub fn detach(&mut self, id: ConsumerId) -> Result<(), PipelineError> {
        if self.on_scheduler_thread() {
            return Err(PipelineError::ReentrantCall);
        }
        self.reap();
        if self.retired.remove(&id) {
            return Ok(());
        }
        let kind = self
            .consumers
            .remove(&id)
            .ok_or(PipelineError::UnknownConsumer(id))?;

        let sender = lock_tracks(&self.tracks).remove(id);
        if let (Some(sender), Ok(handle)) = (sender, self.scheduler_handle()) {
            end_tracks(&handle, vec![sender]);
        }
        info!(
            "Pipeline: {} consumer {} detached ({} active)",
            kind,
            id,
            self.consumers.len()
        );

        if self.consumers.is_empty() {
            self.teardown();
        }
        Ok(())
    }

    fn start(&mut self, kind: MediaKind) -> Result<Consumer, PipelineError> {
        self.config.region.validate()?;
        if self.session_enabled() && self.config.decode && !encoder::available() {
            return Err(PipelineError::EncoderUnavailable);
        }

        let mut source = (self.factory)(&self.config.region, &self.config.source_options())?;
        if let Err(e) = self.check_source(source.as_ref(), kind) {
            source.close();
            return Err(e);
        }
        self.available = source.streams().iter().map(|s| s.kind).collect();
        info!(
            "Pipeline: starting on {} ({})",
            source.name(),
            self.config.region
        );

        let scheduler = Scheduler::spawn(Arc::clone(&self.health))?;
        self.health.record_scheduler_spawn();
        let handle = scheduler.handle();
        self.scheduler = Some(scheduler);

        // registered before the worker runs so the first consumer sees the first frame
        let (id, track) = self.register(kind);

        self.quit = SignalOfStop::new();
        let throttle = self
            .config
            .throttle
            .unwrap_or_else(|| PlaybackPacer::should_throttle(source.as_ref()));
        let distributor = FrameDistributor::new(
            Arc::clone(&self.tracks),
            handle,
            self.preview.clone(),
            Arc::clone(&self.health),
        );
        let worker = DecodeWorker::new(
            source,
            distributor,
            PlaybackPacer::new(throttle, self.config.loop_enabled),
            self.quit.clone(),
            Arc::clone(&self.health),
        );
        self.worker_ended = Some(worker.ended_flag());
        self.worker_failed = Some(worker.failed_flag());
        self.worker = Some(worker.spawn().map_err(PipelineError::Spawn)?);

        if self.session_enabled() {
            self.connect()?;
        }
        self.hand_out(id, kind, track)
    }

    fn check_source(&self, source: &dyn MediaSource, kind: MediaKind) -> Result<(), PipelineError> {
        if !source.has_stream(kind) {
            return Err(PipelineError::MissingStream(kind));
        }
        if self.config.loop_enabled && !source.can_seek() {
            return Err(PipelineError::LoopUnsupported);
        }
        Ok(())
    }

    fn add_consumer(&mut self, kind: MediaKind) -> Result<Consumer, PipelineError> {
        if !self.available.contains(&kind) {
            return Err(PipelineError::MissingStream(kind));
        }
        let (id, track) = self.register(kind);
        self.hand_out(id, kind, track)
    }

    fn register(&mut self, kind: MediaKind) -> (ConsumerId, TrackConsumer) {
        let id = self.next_id;
        self.next_id += 1;
        let (sender, track) = track_queue(id, kind);
        lock_tracks(&self.tracks).insert(sender);
        (id, track)
    }

    /// Give the queue to the caller, or publish it when a session is configured
    fn hand_out(
        &mut self,
        id: ConsumerId,
        kind: MediaKind,
        track: TrackConsumer,
    ) -> Result<Consumer, PipelineError> {
        if !self.session_enabled() {
            return Ok(Consumer {
                id,
                kind,
                track: Some(track),
            });
        }

        if let Err(e) = self.publish(id, kind, track) {
            lock_tracks(&self.tracks).remove(id);
            return Err(e);
        }
        self.published += 1;
        Ok(Consumer {
            id,
            kind,
            track: None,
        })
    }

    fn connect(&mut self) -> Result<(), PipelineError> {
        let connector = self.connector()?;
        let session = self.session.clone();

        let joined = self.scheduler_handle()?.run_blocking(move |ctx| {
            let ctx = ctx.clone();
            async move {
                let connected = connector
                    .connect(&session.server_url, &session.credentials())
                    .await
                    .with_context(|| format!("connect to {}", session.server_url))?;
                let joined = connector
                    .join(&connected, session.room_id, &session.display_name)
                    .await
                    .with_context(|| format!("join room {}", session.room_id));
                // kept even when the join failed so teardown can disconnect
                ctx.set_session(connected);
                joined
            }
        })?;

        let joined = joined.map_err(PipelineError::Session)?;
        info!(
            "Pipeline: joined room {} as {}",
            joined.room_id, joined.participant_id
        );
        Ok(())
    }

    fn publish(
        &self,
        id: ConsumerId,
        kind: MediaKind,
        consumer: TrackConsumer,
    ) -> Result<(), PipelineError> {
        let connector = self.connector()?;

        let accepted = self.scheduler_handle()?.run_blocking(move |ctx| {
            let ctx = ctx.clone();
            async move {
                let session = ctx
                    .take_session()
                    .ok_or_else(|| anyhow!("no session to publish on"))?;
                let track = OutboundTrack { id, kind, consumer };
                let result = connector.publish(&session, vec![track]).await;
                ctx.set_session(session);
                result.with_context(|| format!("publish {} track", kind))
            }
        })?;

        match accepted {
            Ok(true) => Ok(()),
            Ok(false) => Err(PipelineError::PublishRejected(kind)),
            Err(e) => Err(PipelineError::Session(e)),
        }
    }

    /// Best-effort unpublish → leave → disconnect on the scheduler, bounded by
    /// the session teardown timeout
    fn close_session(&mut self, handle: &SchedulerHandle) {
        let Ok(connector) = self.connector() else {
            return;
        };
        let unpublish = std::mem::take(&mut self.published) > 0;
        let limit = self.session.teardown_timeout();

        let done = handle.run_blocking(move |ctx| {
            let ctx = ctx.clone();
            async move {
                let Some(session) = ctx.take_session() else {
                    return true;
                };
                let steps = async move {
                    if unpublish {
                        match connector.unpublish(&session).await {
                            Ok(true) => {}
                            Ok(false) => warn!("Pipeline: server refused to unpublish"),
                            Err(e) => warn!("Pipeline: unpublish failed: {:#}", e),
                        }
                    }
                    match connector.leave(&session).await {
                        Ok(true) => {}
                        Ok(false) => warn!("Pipeline: server refused leave"),
                        Err(e) => warn!("Pipeline: leave failed: {:#}", e),
                    }
                    if let Err(e) = connector.disconnect(session).await {
                        warn!("Pipeline: disconnect failed: {:#}", e);
                    }
                };
                tokio::time::timeout(limit, steps).await.is_ok()
            }
        });
        match done {
            Ok(true) => {}
            Ok(false) => warn!(
                "Pipeline: session teardown did not finish within {:?}, dropping the session",
                limit
            ),
            Err(e) => error!("Pipeline: session teardown not run: {}", e),
        }
    }

    /// Wait for the decode thread, giving up after the configured timeout
    fn join_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let deadline = Instant::now() + self.config.join_timeout();
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(JOIN_POLL);
        }

        if !worker.is_finished() {
            error!(
                "Pipeline: decode thread did not stop within {:?}, abandoning it",
                self.config.join_timeout()
            );
            return;
        }
        match worker.join() {
            Ok(exit) => info!("Pipeline: decode thread finished ({:?})", exit),
            Err(_) => error!("Pipeline: decode thread panicked"),
        }
    }

    /// Stop everything that is running, in order. Safe to call in any state.
    fn teardown(&mut self) {
        if self.state.is_stopped() && self.scheduler.is_none() && self.worker.is_none() {
            return;
        }
        let uptime = self.state.running_duration();
        if !matches!(self.state, PipelineState::Stopping) {
            self.transition(PipelineState::Stopping);
        }

        self.quit.cancel();
        self.join_worker();

        if let Some(scheduler) = self.scheduler.take() {
            let handle = scheduler.handle();
            if self.session_enabled() {
                self.close_session(&handle);
            }
            end_tracks(&handle, lock_tracks(&self.tracks).all());
            scheduler.shutdown();
        }

        // dropping the senders ends any queue the scheduler did not reach
        *lock_tracks(&self.tracks) = TrackRegistry::default();
        self.consumers.clear();
        self.available.clear();
        self.published = 0;

        self.transition(PipelineState::Stopped);
        match uptime {
            Some(uptime) => info!(
                "Pipeline: stopped after {:.1}s. {}",
                uptime.as_secs_f64(),
                self.health.summary()
            ),
            None => info!("Pipeline: stopped. {}", self.health.summary()),
        }
    }
}

impl Drop for PipelineLifecycle {
    fn drop(&mut self) {
        if self.on_scheduler_thread() {
            error!("Pipeline: dropped on the scheduler thread, leaking threads");
            return;
        }
        self.teardown();
    }
}
