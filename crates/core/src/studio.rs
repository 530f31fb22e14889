use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use vox_decode::{
    BufferCaches, BufferKind, BufferStore, ByteFetcher, FetchError, LoadRequest, ObjectUrls,
    SourceFetcher,
};
use vox_engine::{AudioContext, ContextFactory, CpalContextFactory};
use vox_project::{
    DurableStore, EphemeralStore, FileDurableStore, MemoryEphemeralStore, SNAPSHOT_KEY,
    SnapshotDebouncer, TrackSnapshot, decode_snapshot, encode_snapshot,
};
use vox_transport::{AudioRef, Category, MixParams, PlayMode, Track, TrackId, WaveformData};

use crate::config::StudioConfig;
use crate::error::StudioError;
use crate::mixer::PlayableTrack;
use crate::output::PlaybackOutput;
use crate::progress::{MixProgress, ProgressMap};
use crate::route::Platform;
use crate::service::{
    HttpMixService, JobStatus, MasterRequest, MasterResult, MasterTrackSpec, MixRequest, MixService,
    MixSubmission,
};
use crate::session::{PlaybackScheduler, PlaybackState, PollOutcome, SchedulerTiming, SeekOutcome};

/// Buffer-store key of the master preview pair.
const MASTER_ID: &str = "master";
/// Track named in load errors of a rendered mix download.
const RENDER_ID: &str = "mix";
const DEFAULT_FILE_NAME: &str = "audio.wav";

/// A mix job running apart from the studio. It owns everything it needs, so
/// the studio stays usable while the backend works. Hand its output to
/// [`Studio::finish_mix`].
pub type MixJob = BoxFuture<'static, MixFinished>;

/// A mix rendered by the backend into one file, resolving to its bytes.
pub type RenderJob = BoxFuture<'static, Result<Arc<[u8]>, StudioError>>;

/// Outcome of a [`MixJob`].
#[derive(Debug)]
pub struct MixFinished {
    pub track: TrackId,
    /// File serial of the track when the job started.
    file: u64,
    /// Reference of the processed audio.
    pub result: Result<String, StudioError>,
}

/// Where raw track bytes come from, detached from the studio.
#[derive(Clone)]
struct RawSources {
    objects: ObjectUrls,
    durable: Arc<dyn DurableStore>,
    fetcher: Arc<dyn ByteFetcher>,
}

impl RawSources {
    /// The live reference, else the durable copy, else a fetch.
    async fn bytes(&self, id: &TrackId, reference: &AudioRef) -> Result<Arc<[u8]>, StudioError> {
        if let Some(entry) = self.objects.resolve(reference) {
            return Ok(entry.bytes);
        }
        if let Some(record) = self.durable.get(id)? {
            return Ok(record.bytes);
        }
        self.fetcher.fetch(reference).await.map_err(|err| StudioError::Load {
            track: id.clone(),
            reason: err.to_string(),
        })
    }
}

struct MixJobContext {
    track: TrackId,
    raw_ref: AudioRef,
    file_name: String,
    category: Category,
    params: MixParams,
    sources: RawSources,
    service: Arc<dyn MixService>,
    progress: MixProgress,
    poll_interval: Duration,
}

impl MixJobContext {
    async fn run(self) -> Result<String, StudioError> {
        let bytes = self.sources.bytes(&self.track, &self.raw_ref).await?;
        let request = MixRequest {
            track: self.track.clone(),
            file_name: self.file_name.clone(),
            bytes,
            category: self.category,
            params: self.params.clone(),
        };
        match self.service.submit(&request).await? {
            MixSubmission::Done(url) => Ok(url),
            MixSubmission::Job(job) => self.wait_for(&job).await,
        }
    }

    async fn wait_for(&self, job: &str) -> Result<String, StudioError> {
        let id = &self.track;
        loop {
            match self.service.status(job).await? {
                JobStatus::Running { percent } => {
                    self.progress.report(id, percent);
                    tokio::time::sleep(self.poll_interval).await;
                }
                JobStatus::Done { url } => return Ok(url),
                JobStatus::Failed { message } => {
                    log::warn!("mix job {job} of track {id} failed: {message}");
                    return Err(StudioError::MixJob {
                        track: Some(id.clone()),
                        message,
                    });
                }
            }
        }
    }
}

/// Track specs for the backend plus where to read the files it needs.
struct TrackBundle {
    entries: Vec<(TrackId, AudioRef, String, MasterTrackSpec)>,
    sources: RawSources,
}

impl TrackBundle {
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw files are only uploaded for tracks the backend has no mixed
    /// version of.
    async fn into_request(self) -> Result<MasterRequest, StudioError> {
        let mut request = MasterRequest {
            specs: Vec::with_capacity(self.entries.len()),
            files: Vec::new(),
        };
        for (id, raw, name, spec) in self.entries {
            if spec.mixed_track_id.is_none() {
                let bytes = self.sources.bytes(&id, &raw).await?;
                request.files.push((name, bytes));
            }
            request.specs.push(spec);
        }
        Ok(request)
    }
}

async fn render_and_fetch(
    bundle: TrackBundle,
    service: Arc<dyn MixService>,
    fetcher: Arc<dyn ByteFetcher>,
) -> Result<Arc<[u8]>, StudioError> {
    let request = bundle.into_request().await?;
    let url = service.render_mix(&request).await?;
    log::info!("mix rendered: {url}");
    fetcher.fetch(&AudioRef::from(url)).await.map_err(|err| match err {
        FetchError::Network(reason) => StudioError::Network(reason),
        other => StudioError::Load {
            track: TrackId::from(RENDER_ID),
            reason: other.to_string(),
        },
    })
}

/// Collaborators a [`Studio`] is built from.
pub struct StudioDeps {
    pub caches: BufferCaches,
    pub objects: ObjectUrls,
    pub fetcher: Arc<dyn ByteFetcher>,
    pub durable: Arc<dyn DurableStore>,
    pub ephemeral: Box<dyn EphemeralStore>,
    pub service: Arc<dyn MixService>,
    pub contexts: Box<dyn ContextFactory>,
    pub platform: Platform,
}

impl StudioDeps {
    /// Default output device, file-backed durable store and the HTTP backend.
    pub fn from_config(config: &StudioConfig) -> Result<Self, StudioError> {
        let objects = ObjectUrls::new();
        Ok(Self {
            caches: BufferCaches::default(),
            fetcher: Arc::new(SourceFetcher::new(objects.clone(), config.api_base.clone())),
            objects,
            durable: Arc::new(FileDurableStore::open(config.durable_dir())?),
            ephemeral: Box::new(MemoryEphemeralStore::new()),
            service: Arc::new(HttpMixService::new(config.api_base.clone())),
            contexts: Box::new(CpalContextFactory),
            platform: config.platform(),
        })
    }
}

/// The mix and master pair returned by the mastering service.
#[derive(Debug, Clone)]
pub struct MasterPreview {
    pub result: MasterResult,
    pub mix_waveform: Option<WaveformData>,
    pub master_waveform: Option<WaveformData>,
    /// `Processed` plays the master, `Raw` the plain mix.
    pub mode: PlayMode,
}

/// Everything the UI talks to: the track list, playback, mixing and
/// persistence.
///
/// Methods that start playback must be called from inside the user gesture.
/// They activate audio output before their first await point.
pub struct Studio {
    config: StudioConfig,
    tracks: Vec<Track>,
    bpm: f64,
    buffers: BufferStore,
    objects: ObjectUrls,
    fetcher: Arc<dyn ByteFetcher>,
    durable: Arc<dyn DurableStore>,
    ephemeral: Box<dyn EphemeralStore>,
    service: Arc<dyn MixService>,
    output: PlaybackOutput,
    scheduler: PlaybackScheduler,
    progress: MixProgress,
    snapshot: SnapshotDebouncer,
    last_toggle: Option<(TrackId, Instant)>,
    /// Bumped whenever a track's file is replaced or cleared.
    file_serials: HashMap<TrackId, u64>,
    master: Option<MasterPreview>,
}

impl Studio {
    pub fn new(config: StudioConfig, deps: StudioDeps) -> Self {
        let timing = SchedulerTiming::from_config(&config, deps.platform);
        Self {
            tracks: Vec::new(),
            bpm: MixParams::default().bpm,
            buffers: BufferStore::new(deps.caches, deps.fetcher.clone()),
            objects: deps.objects,
            fetcher: deps.fetcher,
            durable: deps.durable,
            ephemeral: deps.ephemeral,
            service: deps.service,
            output: PlaybackOutput::new(deps.contexts, deps.platform, config.route),
            scheduler: PlaybackScheduler::new(timing),
            progress: MixProgress::new(),
            snapshot: SnapshotDebouncer::new(config.snapshot_debounce()),
            last_toggle: None,
            file_serials: HashMap::new(),
            master: None,
            config,
        }
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: &TrackId) -> Option<&Track> {
        self.tracks.iter().find(|track| &track.id == id)
    }

    pub fn waveform(&self, id: &TrackId) -> Option<&WaveformData> {
        self.track(id).and_then(|track| track.waveform.as_ref())
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn master(&self) -> Option<&MasterPreview> {
        self.master.as_ref()
    }

    /// New empty track. The second track defaults to the instrumental.
    pub fn add_track(&mut self) -> TrackId {
        let category = if self.tracks.len() == 1 {
            Category::Instrumental
        } else {
            Category::LeadVocal
        };
        let track = Track::new(TrackId::generate(), category);
        let id = track.id.clone();
        log::debug!("added {} track {id}", category.as_str());
        self.tracks.push(track);
        self.mark_dirty();
        id
    }

    pub fn remove_track(&mut self, id: &TrackId) -> Result<(), StudioError> {
        let index = self.index_of(id)?;
        if let Some(ctx) = self.output.context_mut() {
            self.scheduler.remove_track(ctx, id);
        }
        let track = self.tracks.remove(index);
        if let Some(reference) = &track.raw_ref {
            self.objects.revoke(reference);
        }
        self.buffers.invalidate(id);
        self.progress.clear(id);
        self.file_serials.remove(id);
        if let Err(err) = self.durable.delete(id) {
            log::warn!("could not delete stored file of track {id}: {err}");
        }
        self.mark_dirty();
        Ok(())
    }

    /// Take a file the user picked. The bytes go to the durable store first so
    /// the track can be rebuilt after a reload.
    pub async fn select_file(
        &mut self,
        id: &TrackId,
        name: &str,
        bytes: Arc<[u8]>,
    ) -> Result<(), StudioError> {
        self.index_of(id)?;
        if let Err(err) = self.durable.put(id, &bytes, name) {
            log::warn!("could not store file of track {id}: {err}");
        }
        self.drop_track_audio(id);

        let reference = self.objects.create(bytes.clone(), name);
        self.buffers.insert_bytes(id, BufferKind::Raw, &reference, bytes);
        {
            let track = self.track_mut(id)?;
            track.raw_ref = Some(reference.clone());
            track.raw_file_name = Some(name.to_string());
            track.play_mode = PlayMode::Raw;
        }
        self.mark_dirty();

        self.buffers.ensure_decoded(id, Some(&reference), None).await?;
        self.refresh_waveforms();
        Ok(())
    }

    /// Forget the track's file but keep the track and its settings.
    pub fn clear_track_file(&mut self, id: &TrackId) -> Result<(), StudioError> {
        self.index_of(id)?;
        self.drop_track_audio(id);
        if let Err(err) = self.durable.delete(id) {
            log::warn!("could not delete stored file of track {id}: {err}");
        }
        let track = self.track_mut(id)?;
        track.raw_file_name = None;
        track.play_mode = PlayMode::Processed;
        self.mark_dirty();
        Ok(())
    }

    /// Takes effect the next time playback is scheduled.
    pub fn set_category(&mut self, id: &TrackId, category: Category) -> Result<(), StudioError> {
        self.track_mut(id)?.category = category;
        self.mark_dirty();
        Ok(())
    }

    /// Gain in percent, clamped to 0..=200. Applies to playing nodes at once.
    pub fn set_gain(&mut self, id: &TrackId, percent: f32) -> Result<(), StudioError> {
        let track = self.track_mut(id)?;
        track.set_gain(percent);
        let factor = track.gain_factor();
        if let Some(ctx) = self.output.context_mut() {
            self.scheduler.set_gain(ctx, id, factor)?;
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn set_play_mode(&mut self, id: &TrackId, mode: PlayMode) -> Result<(), StudioError> {
        self.track_mut(id)?.play_mode = mode;
        if let Some(ctx) = self.output.context_mut() {
            self.scheduler.set_play_mode(ctx, id, mode)?;
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn toggle_play_mode(&mut self, id: &TrackId) -> Result<bool, StudioError> {
        self.toggle_play_mode_at(id, Instant::now())
    }

    /// Flip between raw and processed. A repeated toggle of the same track
    /// inside the debounce window is ignored; returns whether it applied.
    pub fn toggle_play_mode_at(&mut self, id: &TrackId, at: Instant) -> Result<bool, StudioError> {
        let debounced = self.last_toggle.as_ref().is_some_and(|(last, last_at)| {
            last == id && at.saturating_duration_since(*last_at) < self.config.toggle_debounce()
        });
        if debounced {
            return Ok(false);
        }
        let mode = self.track_mut(id)?.play_mode.toggled();
        self.last_toggle = Some((id.clone(), at));
        self.set_play_mode(id, mode)?;
        Ok(true)
    }

    pub fn set_mix_params(&mut self, id: &TrackId, params: MixParams) -> Result<(), StudioError> {
        self.track_mut(id)?.mix_params = params;
        self.mark_dirty();
        Ok(())
    }

    /// Project tempo, sent with every mix request.
    pub fn set_bpm(&mut self, bpm: f64) {
        if bpm.is_finite() && bpm > 0.0 {
            self.bpm = bpm;
        }
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        self.service.set_token(token);
    }

    pub fn mix_progress(&self, id: &TrackId) -> Option<u8> {
        self.progress.get(id)
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressMap> {
        self.progress.subscribe()
    }

    /// Send the track's raw file to the mix service and wait for the result,
    /// then apply it with [`Studio::finish_mix`]. The studio is borrowed for
    /// the whole job; use [`Studio::start_mix`] to keep it usable meanwhile.
    pub async fn run_mix(&mut self, id: &TrackId) -> Result<(), StudioError> {
        let job = self.start_mix(id)?;
        let finished = job.await;
        self.finish_mix(finished).await
    }

    /// Mark the track as mixing and return the job that uploads its raw file
    /// and polls the backend. Progress is published while it runs. Several
    /// jobs may run at once.
    pub fn start_mix(&mut self, id: &TrackId) -> Result<MixJob, StudioError> {
        let track = self.track(id).ok_or_else(|| StudioError::UnknownTrack(id.clone()))?;
        let raw_ref = track
            .raw_ref
            .clone()
            .ok_or(StudioError::NotReady("Select a file for this track first."))?;
        let mut params = track.mix_params.clone();
        params.bpm = self.bpm;
        let context = MixJobContext {
            track: id.clone(),
            raw_ref,
            file_name: track.raw_file_name.clone().unwrap_or_else(|| DEFAULT_FILE_NAME.to_string()),
            category: track.category,
            params,
            sources: self.raw_sources(),
            service: self.service.clone(),
            progress: self.progress.clone(),
            poll_interval: self.config.mix_poll_interval(),
        };
        let file = self.file_serial(id);

        self.track_mut(id)?.is_mixing = true;
        self.progress.report(id, 0.0);
        log::debug!("starting mix of track {id}");

        let track = id.clone();
        Ok(Box::pin(async move {
            let result = context.run().await.map_err(|err| match err {
                StudioError::MixJob { track: None, message } => StudioError::MixJob {
                    track: Some(track.clone()),
                    message,
                },
                other => other,
            });
            MixFinished { track, file, result }
        }))
    }

    /// Apply a finished mix job. The processed audio is decoded before the
    /// track refers to it; on success it becomes the audible branch and any
    /// running playback is stopped with the position reset to the start.
    /// Results for a file that was replaced since the job started are dropped.
    pub async fn finish_mix(&mut self, finished: MixFinished) -> Result<(), StudioError> {
        let MixFinished { track: id, file, result } = finished;
        let current = self.file_serial(&id);
        let Some(track) = self.tracks.iter_mut().find(|track| track.id == id) else {
            self.progress.clear(&id);
            return Err(StudioError::UnknownTrack(id));
        };
        if file != current {
            log::info!("dropping mix result of track {id}: its file changed");
            return Err(StudioError::NotReady("The file changed while it was being mixed."));
        }
        track.is_mixing = false;

        let url = match result {
            Ok(url) => url,
            Err(err) => {
                self.progress.clear(&id);
                return Err(err);
            }
        };
        log::info!("mix of track {id} finished: {url}");

        let processed = AudioRef::from(url);
        self.buffers.invalidate_processed(&id);
        if let Err(err) = self.buffers.ensure_decoded(&id, None, Some(&processed)).await {
            self.buffers.invalidate_processed(&id);
            self.progress.clear(&id);
            return Err(err.into());
        }

        let track = self.track_mut(&id)?;
        track.processed_ref = Some(processed);
        track.play_mode = PlayMode::Processed;
        self.progress.complete(&id);
        if let Some(ctx) = self.output.context_mut() {
            self.scheduler.stop(ctx);
            self.output.suspend_route();
        }
        self.scheduler.set_resume_offset(0.0);
        self.progress.clear(&id);
        self.mark_dirty();
        Ok(())
    }

    /// Master every track with audio. Needs at least one mixed vocal.
    pub async fn run_master(&mut self) -> Result<MasterResult, StudioError> {
        if !self.tracks.iter().any(|track| track.processed_ref.is_some()) {
            return Err(StudioError::NotReady("Mix at least one vocal before mastering."));
        }

        let request = self.track_bundle().into_request().await?;
        let result = self.service.master(&request).await?;
        let mix = AudioRef::from(result.mix_url.clone());
        let master = AudioRef::from(result.master_url.clone());
        let key = TrackId::from(MASTER_ID);
        self.buffers.invalidate(&key);
        self.buffers.ensure_decoded(&key, Some(&mix), Some(&master)).await?;

        let entry = self.buffers.get_decoded(&key);
        let points = self.config.waveform_points;
        self.master = Some(MasterPreview {
            result: result.clone(),
            mix_waveform: entry.raw.as_ref().map(|audio| WaveformData::from_audio(audio, points)),
            master_waveform: entry
                .processed
                .as_ref()
                .map(|audio| WaveformData::from_audio(audio, points)),
            mode: PlayMode::Processed,
        });
        log::info!("master ready: {}", result.master_url);
        Ok(result)
    }

    /// Have the backend bounce every track into one file and download it.
    /// The returned job does not borrow the studio.
    pub fn render_mix(&self) -> Result<RenderJob, StudioError> {
        let bundle = self.track_bundle();
        if bundle.is_empty() {
            return Err(StudioError::NothingToPlay);
        }
        Ok(Box::pin(render_and_fetch(bundle, self.service.clone(), self.fetcher.clone())))
    }

    /// Play the mix and master side by side so switching between them is
    /// instant, starting at the beginning.
    pub async fn play_master(&mut self) -> Result<(), StudioError> {
        self.prepare_output()?;
        let Some(preview) = &self.master else {
            return Err(StudioError::NotReady("Run mastering first."));
        };
        let mode = preview.mode;
        let mix = AudioRef::from(preview.result.mix_url.clone());
        let master = AudioRef::from(preview.result.master_url.clone());
        let key = TrackId::from(MASTER_ID);
        self.buffers.ensure_decoded(&key, Some(&mix), Some(&master)).await?;

        let entry = self.buffers.get_decoded(&key);
        let raw = entry.raw.ok_or(StudioError::NothingToPlay)?;
        let track = PlayableTrack {
            id: key,
            paired: true,
            raw,
            processed: entry.processed,
            mode,
            gain: 1.0,
        };
        self.start_scheduler(vec![track], Some(0.0))
    }

    /// `Processed` makes the master audible, `Raw` the mix.
    pub fn set_master_mode(&mut self, mode: PlayMode) -> Result<(), StudioError> {
        let Some(preview) = self.master.as_mut() else {
            return Err(StudioError::NotReady("Run mastering first."));
        };
        preview.mode = mode;
        if let Some(ctx) = self.output.context_mut() {
            self.scheduler.set_play_mode(ctx, &TrackId::from(MASTER_ID), mode)?;
        }
        Ok(())
    }

    /// Start every track with audio in sync. While already playing this
    /// restarts from the current position.
    ///
    /// Every track must load; one failure blocks the whole start.
    pub async fn play_all(&mut self) -> Result<(), StudioError> {
        self.prepare_output()?;
        self.recover_stale_refs()?;

        let requests = self.load_requests();
        if requests.is_empty() {
            return Err(StudioError::NothingToPlay);
        }
        if let Err(err) = self.buffers.ensure_all(&requests).await {
            let retry = err.is_load() && err.kind() == BufferKind::Raw;
            let track = err.track().clone();
            if !(retry && self.recover_from_durable(&track)?) {
                return Err(err.into());
            }
            log::info!("retrying load of track {track} from the durable store");
            self.buffers.ensure_all(&self.load_requests()).await?;
        }
        self.refresh_waveforms();

        let playable = self.playable_tracks();
        if playable.is_empty() {
            return Err(StudioError::NothingToPlay);
        }
        self.start_scheduler(playable, None)
    }

    /// Stop and remember the position. Returns it.
    pub fn stop_all(&mut self) -> f64 {
        let offset = match self.output.context_mut() {
            Some(ctx) => self.scheduler.stop(ctx),
            None => self.scheduler.resume_offset(),
        };
        self.output.suspend_route();
        offset
    }

    pub fn seek_to(&mut self, seconds: f64) -> Result<SeekOutcome, StudioError> {
        self.seek_to_at(seconds, Instant::now())
    }

    pub fn seek_to_at(&mut self, seconds: f64, at: Instant) -> Result<SeekOutcome, StudioError> {
        let bus = self.output.output_bus();
        match self.output.context_mut() {
            Some(ctx) => Ok(self.scheduler.seek(ctx, bus, seconds, at)?),
            None => {
                self.scheduler.set_resume_offset(seconds);
                Ok(SeekOutcome::Moved)
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.scheduler.is_playing()
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.scheduler.state()
    }

    pub fn current_offset(&self) -> f64 {
        match self.output.context() {
            Some(ctx) => self.scheduler.current_offset(ctx.current_time()),
            None => self.scheduler.resume_offset(),
        }
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn audio_context_mut(&mut self) -> Option<&mut AudioContext> {
        self.output.context_mut()
    }

    /// Housekeeping for the UI tick: playback state, end detection, deferred
    /// snapshot writes and freeing released graph objects.
    pub fn poll(&mut self) -> PollOutcome {
        self.poll_at(Instant::now())
    }

    pub fn poll_at(&mut self, now: Instant) -> PollOutcome {
        let outcome = match self.output.context_mut() {
            Some(ctx) => {
                let outcome = self.scheduler.poll(ctx);
                ctx.collect_garbage();
                outcome
            }
            None => PollOutcome::default(),
        };
        if outcome.ended {
            self.output.suspend_route();
        }
        if self.snapshot.poll(now) {
            self.write_snapshot();
        }
        outcome
    }

    /// Rebuild the track list from the session snapshot, if there is one.
    /// Audio is not touched; follow up with [`Studio::warm_up`].
    pub fn restore(&mut self) -> usize {
        let Some(value) = self.ephemeral.get(SNAPSHOT_KEY) else {
            return 0;
        };
        let Some(snapshots) = decode_snapshot(&value) else {
            log::warn!("discarding unreadable session snapshot");
            return 0;
        };
        self.tracks = snapshots.into_iter().map(TrackSnapshot::into_track).collect();
        log::info!("restored {} tracks from the session snapshot", self.tracks.len());
        self.tracks.len()
    }

    /// Decode everything restored tracks need, rebuilding stale references
    /// from the durable store. Per-track failures are logged and skipped.
    /// Returns how many tracks are ready to play.
    pub async fn warm_up(&mut self) -> Result<usize, StudioError> {
        self.recover_stale_refs()?;
        for request in self.load_requests() {
            if let Err(err) = self
                .buffers
                .ensure_decoded(&request.track, request.raw.as_ref(), request.processed.as_ref())
                .await
            {
                log::warn!("{err}");
            }
        }
        self.refresh_waveforms();
        Ok(self.playable_tracks().len())
    }

    /// Write a pending snapshot now instead of waiting for the debounce.
    pub fn flush_snapshot(&mut self) {
        if self.snapshot.flush() {
            self.write_snapshot();
        }
    }

    fn mark_dirty(&mut self) {
        self.snapshot.mark_dirty(Instant::now());
    }

    fn write_snapshot(&self) {
        match encode_snapshot(&self.tracks) {
            Ok(json) => self.ephemeral.set(SNAPSHOT_KEY, json),
            Err(err) => log::warn!("could not write session snapshot: {err}"),
        }
    }

    fn index_of(&self, id: &TrackId) -> Result<usize, StudioError> {
        self.tracks
            .iter()
            .position(|track| &track.id == id)
            .ok_or_else(|| StudioError::UnknownTrack(id.clone()))
    }

    fn track_mut(&mut self, id: &TrackId) -> Result<&mut Track, StudioError> {
        self.tracks
            .iter_mut()
            .find(|track| &track.id == id)
            .ok_or_else(|| StudioError::UnknownTrack(id.clone()))
    }

    /// Stop the track's nodes and drop its references and cached audio.
    fn drop_track_audio(&mut self, id: &TrackId) {
        if let Some(ctx) = self.output.context_mut() {
            self.scheduler.remove_track(ctx, id);
        }
        if let Some(track) = self.tracks.iter_mut().find(|track| &track.id == id) {
            if let Some(reference) = track.raw_ref.take() {
                self.objects.revoke(&reference);
            }
            track.processed_ref = None;
            track.waveform = None;
            track.is_mixing = false;
        }
        *self.file_serials.entry(id.clone()).or_insert(0) += 1;
        self.buffers.invalidate(id);
        self.progress.clear(id);
    }

    /// Activate the output synchronously. Stops current playback first so a
    /// restart resumes where it was.
    fn prepare_output(&mut self) -> Result<(), StudioError> {
        if self.scheduler.is_playing() {
            if let Some(ctx) = self.output.context_mut() {
                self.scheduler.stop(ctx);
            }
        }
        let activation = self.output.activate()?;
        if activation.fresh_context {
            self.scheduler.forget();
        }
        self.buffers.set_target_sample_rate(activation.sample_rate);
        Ok(())
    }

    fn start_scheduler(
        &mut self,
        tracks: Vec<PlayableTrack>,
        offset: Option<f64>,
    ) -> Result<(), StudioError> {
        let bus = self.output.output_bus();
        let Some(ctx) = self.output.context_mut() else {
            return Err(StudioError::NotReady("Audio output is not available."));
        };
        self.scheduler.start(ctx, bus, tracks, offset)?;
        Ok(())
    }

    fn raw_sources(&self) -> RawSources {
        RawSources {
            objects: self.objects.clone(),
            durable: self.durable.clone(),
            fetcher: self.fetcher.clone(),
        }
    }

    fn file_serial(&self, id: &TrackId) -> u64 {
        self.file_serials.get(id).copied().unwrap_or(0)
    }

    /// Every track with a file, in list order.
    fn track_bundle(&self) -> TrackBundle {
        let entries = self
            .tracks
            .iter()
            .filter_map(|track| {
                let raw = track.raw_ref.clone()?;
                let spec = MasterTrackSpec {
                    category: track.category,
                    gain: track.gain(),
                    mixed_track_id: track
                        .processed_ref
                        .as_ref()
                        .and_then(|r| r.remote_id())
                        .map(str::to_string),
                };
                let name = track
                    .raw_file_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
                Some((track.id.clone(), raw, name, spec))
            })
            .collect();
        TrackBundle {
            entries,
            sources: self.raw_sources(),
        }
    }

    /// Replace missing or dead object references with fresh ones built from
    /// the durable store. Live references are left alone.
    fn recover_stale_refs(&mut self) -> Result<(), StudioError> {
        let stale: Vec<TrackId> = self
            .tracks
            .iter()
            .filter(|track| {
                let dead = match &track.raw_ref {
                    Some(reference) => !self.objects.is_live(reference),
                    None => track.raw_file_name.is_some(),
                };
                dead && self.buffers.get_decoded(&track.id).raw.is_none()
            })
            .map(|track| track.id.clone())
            .collect();

        for id in stale {
            if !self.recover_from_durable(&id)? {
                log::warn!("track {id} has a stale reference and no stored copy");
            }
        }
        Ok(())
    }

    fn recover_from_durable(&mut self, id: &TrackId) -> Result<bool, StudioError> {
        let Some(record) = self.durable.get(id)? else {
            return Ok(false);
        };
        let reference = self.objects.create(record.bytes.clone(), &record.name);
        self.buffers.insert_bytes(id, BufferKind::Raw, &reference, record.bytes);
        let track = self.track_mut(id)?;
        track.raw_ref = Some(reference);
        track.raw_file_name = Some(record.name);
        log::info!("rebuilt track {id} from the durable store");
        self.mark_dirty();
        Ok(true)
    }

    fn load_requests(&self) -> Vec<LoadRequest> {
        self.tracks
            .iter()
            .filter_map(|track| {
                Some(LoadRequest {
                    track: track.id.clone(),
                    raw: Some(track.raw_ref.clone()?),
                    processed: if track.category.is_vocal() {
                        track.processed_ref.clone()
                    } else {
                        None
                    },
                })
            })
            .collect()
    }

    fn playable_tracks(&self) -> Vec<PlayableTrack> {
        self.tracks
            .iter()
            .filter(|track| track.raw_ref.is_some())
            .filter_map(|track| {
                let entry = self.buffers.get_decoded(&track.id);
                let paired = track.category.is_vocal();
                Some(PlayableTrack {
                    id: track.id.clone(),
                    paired,
                    raw: entry.raw?,
                    processed: if paired { entry.processed } else { None },
                    mode: track.play_mode,
                    gain: track.gain_factor(),
                })
            })
            .collect()
    }

    fn refresh_waveforms(&mut self) {
        let points = self.config.waveform_points;
        for track in &mut self.tracks {
            if track.waveform.is_some() {
                continue;
            }
            if let Some(raw) = self.buffers.get_decoded(&track.id).raw {
                track.waveform = Some(WaveformData::from_audio(&raw, points));
            }
        }
    }
}
