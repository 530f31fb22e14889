use std::time::{Duration, Instant};

use vox_engine::{AudioContext, AudioError, BusId};
use vox_transport::{PlayMode, TrackId};

use crate::config::StudioConfig;
use crate::mixer::{PlayableTrack, TrackNodes};
use crate::route::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    /// Nodes are created; the schedule instant is still ahead of the clock.
    Scheduled,
    Playing,
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        !matches!(self, PlaybackState::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerTiming {
    pub lead: Duration,
    pub seek_window: Duration,
    pub seek_tolerance: f64,
}

impl SchedulerTiming {
    pub fn from_config(config: &StudioConfig, platform: Platform) -> Self {
        Self {
            lead: config.lead_time(platform),
            seek_window: config.seek_debounce(),
            seek_tolerance: config.seek_tolerance_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    /// Too close to the previous seek in both time and position.
    Coalesced,
    Rescheduled,
    /// Not playing; only the resume offset moved.
    Moved,
}

#[derive(Debug, Default, PartialEq)]
pub struct PollOutcome {
    pub started: bool,
    pub finished: Vec<TrackId>,
    /// The last track finished and the session went back to Stopped.
    pub ended: bool,
}

/// One shared timeline for every track.
///
/// All nodes created by one [`PlaybackScheduler::start`] share the same
/// schedule instant, so relative timing holds no matter how long setup took.
/// A new start always tears the previous graph down first.
pub struct PlaybackScheduler {
    timing: SchedulerTiming,
    state: PlaybackState,
    tracks: Vec<PlayableTrack>,
    nodes: Vec<(TrackId, TrackNodes)>,
    instant: f64,
    /// Context time that corresponds to offset 0.
    start_ref: f64,
    start_offset: f64,
    resume_offset: f64,
    last_seek: Option<(Instant, f64)>,
}

impl PlaybackScheduler {
    pub fn new(timing: SchedulerTiming) -> Self {
        Self {
            timing,
            state: PlaybackState::Stopped,
            tracks: Vec::new(),
            nodes: Vec::new(),
            instant: 0.0,
            start_ref: 0.0,
            start_offset: 0.0,
            resume_offset: 0.0,
            last_seek: None,
        }
    }

    /// Schedule `tracks` from `offset` seconds (the remembered resume offset
    /// when `None`). Returns the number of tracks scheduled.
    pub fn start(
        &mut self,
        ctx: &mut AudioContext,
        output: BusId,
        tracks: Vec<PlayableTrack>,
        offset: Option<f64>,
    ) -> Result<usize, AudioError> {
        self.teardown(ctx);
        self.state = PlaybackState::Stopped;

        let offset = offset.unwrap_or(self.resume_offset);
        let offset = if offset.is_finite() { offset.max(0.0) } else { 0.0 };
        self.resume_offset = offset;
        if tracks.is_empty() {
            return Ok(0);
        }

        let instant = ctx.current_time() + self.timing.lead.as_secs_f64();
        let mut nodes = Vec::with_capacity(tracks.len());
        for track in &tracks {
            match TrackNodes::start(ctx, output, track, instant, offset) {
                Ok(started) => nodes.push((track.id.clone(), started)),
                Err(err) => {
                    for (_, started) in nodes {
                        started.teardown(ctx);
                    }
                    return Err(err);
                }
            }
        }

        log::info!(
            "scheduled {} tracks at {instant:.3}s from offset {offset:.3}s",
            nodes.len()
        );
        self.nodes = nodes;
        self.tracks = tracks;
        self.instant = instant;
        self.start_offset = offset;
        self.start_ref = instant - offset;
        self.state = PlaybackState::Scheduled;
        Ok(self.nodes.len())
    }

    /// Stop everything and remember where playback was. Returns that offset.
    pub fn stop(&mut self, ctx: &mut AudioContext) -> f64 {
        if self.state.is_playing() {
            self.resume_offset = self.current_offset(ctx.current_time());
            log::debug!("stopped at {:.3}s", self.resume_offset);
        }
        self.teardown(ctx);
        self.state = PlaybackState::Stopped;
        self.resume_offset
    }

    /// Drop all node handles without touching the context, for when the
    /// context itself has been replaced. The resume offset survives.
    pub fn forget(&mut self) {
        self.nodes.clear();
        self.state = PlaybackState::Stopped;
    }

    /// Timeline position at context time `now`. Before the schedule instant
    /// this is the offset playback was started from.
    pub fn current_offset(&self, now: f64) -> f64 {
        match self.state {
            PlaybackState::Stopped => self.resume_offset,
            _ => (now - self.start_ref).max(self.start_offset),
        }
    }

    /// While playing, reschedule every track at `target`; otherwise just move
    /// the resume offset. Repeated seeks to about the same place are dropped.
    pub fn seek(
        &mut self,
        ctx: &mut AudioContext,
        output: BusId,
        target: f64,
        at: Instant,
    ) -> Result<SeekOutcome, AudioError> {
        let target = if target.is_finite() { target.max(0.0) } else { 0.0 };
        if let Some((previous_at, previous)) = self.last_seek {
            let recent = at.saturating_duration_since(previous_at) < self.timing.seek_window;
            if recent && (target - previous).abs() < self.timing.seek_tolerance {
                log::debug!("seek to {target:.3}s coalesced");
                return Ok(SeekOutcome::Coalesced);
            }
        }
        self.last_seek = Some((at, target));

        if self.state.is_playing() {
            let tracks = std::mem::take(&mut self.tracks);
            self.start(ctx, output, tracks, Some(target))?;
            Ok(SeekOutcome::Rescheduled)
        } else {
            self.resume_offset = target;
            Ok(SeekOutcome::Moved)
        }
    }

    /// Advance the state machine from the context clock and completion
    /// signals. Call regularly from the control thread.
    pub fn poll(&mut self, ctx: &mut AudioContext) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        if !self.state.is_playing() {
            return outcome;
        }
        if self.state == PlaybackState::Scheduled && ctx.current_time() >= self.instant {
            self.state = PlaybackState::Playing;
            outcome.started = true;
        }

        let mut index = 0;
        while index < self.nodes.len() {
            if self.nodes[index].1.poll_finished() {
                let (id, nodes) = self.nodes.remove(index);
                nodes.teardown(ctx);
                log::debug!("track {id} finished");
                outcome.finished.push(id);
            } else {
                index += 1;
            }
        }

        if self.nodes.is_empty() {
            self.state = PlaybackState::Stopped;
            self.resume_offset = 0.0;
            outcome.ended = true;
            log::info!("playback ended");
        }
        outcome
    }

    /// Stop one track's nodes; the rest keep playing untouched. Returns
    /// whether the track had live nodes.
    pub fn remove_track(&mut self, ctx: &mut AudioContext, id: &TrackId) -> bool {
        self.tracks.retain(|track| &track.id != id);
        match self.nodes.iter().position(|(track, _)| track == id) {
            Some(index) => {
                let (_, nodes) = self.nodes.remove(index);
                nodes.teardown(ctx);
                true
            }
            None => false,
        }
    }

    /// Returns true when live nodes were switched.
    pub fn set_play_mode(
        &mut self,
        ctx: &mut AudioContext,
        id: &TrackId,
        mode: PlayMode,
    ) -> Result<bool, AudioError> {
        if let Some(track) = self.tracks.iter_mut().find(|track| &track.id == id) {
            track.mode = mode;
        }
        match self.nodes_mut(id) {
            Some(nodes) => nodes.set_play_mode(ctx, mode),
            None => Ok(false),
        }
    }

    pub fn set_gain(
        &mut self,
        ctx: &mut AudioContext,
        id: &TrackId,
        factor: f32,
    ) -> Result<(), AudioError> {
        if let Some(track) = self.tracks.iter_mut().find(|track| &track.id == id) {
            track.gain = factor;
        }
        match self.nodes_mut(id) {
            Some(nodes) => nodes.set_gain(ctx, factor),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_playing()
    }

    pub fn active_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self, id: &TrackId) -> Option<&TrackNodes> {
        self.nodes.iter().find(|(track, _)| track == id).map(|(_, nodes)| nodes)
    }

    pub fn schedule_instant(&self) -> Option<f64> {
        self.state.is_playing().then_some(self.instant)
    }

    pub fn resume_offset(&self) -> f64 {
        self.resume_offset
    }

    /// Ignored while playing; use [`PlaybackScheduler::seek`] instead.
    pub fn set_resume_offset(&mut self, offset: f64) {
        if !self.state.is_playing() {
            self.resume_offset = offset.max(0.0);
        }
    }

    fn nodes_mut(&mut self, id: &TrackId) -> Option<&mut TrackNodes> {
        self.nodes
            .iter_mut()
            .find(|(track, _)| track == id)
            .map(|(_, nodes)| nodes)
    }

    fn teardown(&mut self, ctx: &mut AudioContext) {
        for (_, nodes) in self.nodes.drain(..) {
            nodes.teardown(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_transport::AudioArc;

    const RATE: u32 = 8000;

    fn timing() -> SchedulerTiming {
        SchedulerTiming {
            lead: Duration::from_millis(20),
            seek_window: Duration::from_millis(120),
            seek_tolerance: 0.05,
        }
    }

    fn track(id: &str, paired: bool, secs: f64, processed: bool) -> PlayableTrack {
        let frames = (secs * RATE as f64) as usize;
        PlayableTrack {
            id: TrackId::from(id),
            paired,
            raw: AudioArc::constant(0.1, frames, RATE, 1),
            processed: processed.then(|| AudioArc::constant(0.2, frames, RATE, 1)),
            mode: PlayMode::Processed,
            gain: 1.0,
        }
    }

    fn setup() -> (AudioContext, PlaybackScheduler) {
        (AudioContext::offline(RATE, 1, false), PlaybackScheduler::new(timing()))
    }

    #[test]
    fn test_all_tracks_share_schedule_instant() {
        let (mut ctx, mut scheduler) = setup();
        ctx.render_until(0.5).unwrap();
        let tracks = vec![track("inst", false, 10.0, false), track("lead", true, 10.0, true)];

        assert_eq!(scheduler.start(&mut ctx, BusId::DESTINATION, tracks, Some(0.0)).unwrap(), 2);
        let instant = scheduler.schedule_instant().unwrap();
        assert!((instant - (ctx.current_time() + 0.02)).abs() < 1e-9);
        assert_eq!(scheduler.nodes(&"inst".into()).unwrap().when(), instant);
        assert_eq!(scheduler.nodes(&"lead".into()).unwrap().when(), instant);
        assert_eq!(scheduler.state(), PlaybackState::Scheduled);

        ctx.render_until(instant + 0.1).unwrap();
        assert!(scheduler.poll(&mut ctx).started);
        assert_eq!(scheduler.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_offsets_never_exceed_buffer_duration() {
        let (mut ctx, mut scheduler) = setup();
        let tracks = vec![track("short", false, 2.0, false), track("long", true, 6.0, true)];
        scheduler.start(&mut ctx, BusId::DESTINATION, tracks, Some(4.0)).unwrap();

        assert_eq!(scheduler.nodes(&"short".into()).unwrap().offsets(), vec![2.0]);
        assert_eq!(scheduler.nodes(&"long".into()).unwrap().offsets(), vec![4.0, 4.0]);
        // the short track is already past its end
        ctx.render_until(0.1).unwrap();
        let outcome = scheduler.poll(&mut ctx);
        assert_eq!(outcome.finished, vec![TrackId::from("short")]);
        assert!(!outcome.ended);
    }

    #[test]
    fn test_stop_then_start_resumes_at_captured_offset() {
        let (mut ctx, mut scheduler) = setup();
        scheduler
            .start(&mut ctx, BusId::DESTINATION, vec![track("a", false, 10.0, false)], Some(1.0))
            .unwrap();
        ctx.render_until(2.02).unwrap();

        let stopped_at = scheduler.stop(&mut ctx);
        assert!((stopped_at - 3.0).abs() < 0.05, "stopped at {stopped_at}");
        assert_eq!(scheduler.current_offset(ctx.current_time()), stopped_at);
        assert_eq!(scheduler.active_count(), 0);

        scheduler
            .start(&mut ctx, BusId::DESTINATION, vec![track("a", false, 10.0, false)], None)
            .unwrap();
        assert_eq!(scheduler.nodes(&"a".into()).unwrap().offsets(), vec![stopped_at]);
    }

    #[test]
    fn test_current_offset_holds_before_instant() {
        let (mut ctx, mut scheduler) = setup();
        scheduler
            .start(&mut ctx, BusId::DESTINATION, vec![track("a", false, 10.0, false)], Some(5.0))
            .unwrap();
        assert_eq!(scheduler.current_offset(ctx.current_time()), 5.0);
        ctx.render_until(1.02).unwrap();
        assert!((scheduler.current_offset(ctx.current_time()) - 6.0).abs() < 0.02);
    }

    #[test]
    fn test_rapid_duplicate_seeks_reschedule_once() {
        let (mut ctx, mut scheduler) = setup();
        scheduler
            .start(&mut ctx, BusId::DESTINATION, vec![track("a", false, 10.0, false)], Some(0.0))
            .unwrap();
        let at = Instant::now();

        let first = scheduler.seek(&mut ctx, BusId::DESTINATION, 3.0, at).unwrap();
        let second = scheduler
            .seek(&mut ctx, BusId::DESTINATION, 3.02, at + Duration::from_millis(50))
            .unwrap();
        assert_eq!(first, SeekOutcome::Rescheduled);
        assert_eq!(second, SeekOutcome::Coalesced);
        assert_eq!(scheduler.nodes(&"a".into()).unwrap().offsets(), vec![3.0]);

        let later = scheduler
            .seek(&mut ctx, BusId::DESTINATION, 3.02, at + Duration::from_millis(200))
            .unwrap();
        assert_eq!(later, SeekOutcome::Rescheduled);
    }

    #[test]
    fn test_seek_while_stopped_moves_resume_offset() {
        let (mut ctx, mut scheduler) = setup();
        let outcome = scheduler
            .seek(&mut ctx, BusId::DESTINATION, 7.5, Instant::now())
            .unwrap();
        assert_eq!(outcome, SeekOutcome::Moved);
        assert_eq!(scheduler.current_offset(0.0), 7.5);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_session_ends_when_every_track_finishes() {
        let (mut ctx, mut scheduler) = setup();
        let tracks = vec![track("a", false, 1.0, false), track("b", true, 1.0, true)];
        scheduler.start(&mut ctx, BusId::DESTINATION, tracks, Some(0.5)).unwrap();

        ctx.render_until(0.3).unwrap();
        assert!(!scheduler.poll(&mut ctx).ended);
        ctx.render_until(0.6).unwrap();
        let outcome = scheduler.poll(&mut ctx);
        assert!(outcome.ended);
        assert_eq!(scheduler.state(), PlaybackState::Stopped);
        assert_eq!(scheduler.current_offset(ctx.current_time()), 0.0);
    }

    #[test]
    fn test_removing_track_leaves_others_alone() {
        let (mut ctx, mut scheduler) = setup();
        let tracks = vec![track("a", false, 10.0, false), track("b", true, 10.0, true)];
        scheduler.start(&mut ctx, BusId::DESTINATION, tracks, Some(1.0)).unwrap();
        let before = scheduler.nodes(&"b".into()).unwrap().source_ids();
        ctx.render_until(0.5).unwrap();

        assert!(scheduler.remove_track(&mut ctx, &"a".into()));
        assert_eq!(scheduler.active_count(), 1);
        let b = scheduler.nodes(&"b".into()).unwrap();
        assert_eq!(b.source_ids(), before);
        assert_eq!(b.offsets(), vec![1.0, 1.0]);
        assert!(!scheduler.poll(&mut ctx).ended);
        assert!(scheduler.is_playing());
    }

    #[test]
    fn test_toggle_keeps_position() {
        let (mut ctx, mut scheduler) = setup();
        scheduler
            .start(&mut ctx, BusId::DESTINATION, vec![track("v", true, 10.0, true)], Some(2.0))
            .unwrap();
        ctx.render_until(1.0).unwrap();
        let before = scheduler.current_offset(ctx.current_time());

        assert!(scheduler.set_play_mode(&mut ctx, &"v".into(), PlayMode::Raw).unwrap());
        assert_eq!(scheduler.current_offset(ctx.current_time()), before);
        assert_eq!(scheduler.nodes(&"v".into()).unwrap().branch_levels(), Some((1.0, 0.0)));
    }
}
