use tokio::sync::oneshot::error::TryRecvError;
use vox_engine::{AudioContext, AudioError, BusId, BusOutput, SourceHandle, SourceId, SourceSpec};
use vox_transport::{AudioArc, PlayMode, TrackId};

/// Everything the scheduler needs to start one track.
#[derive(Debug, Clone)]
pub struct PlayableTrack {
    pub id: TrackId,
    /// Vocal shape: a raw/processed source pair under a master gain.
    pub paired: bool,
    pub raw: AudioArc,
    pub processed: Option<AudioArc>,
    pub mode: PlayMode,
    /// Linear master gain.
    pub gain: f32,
}

/// `(raw, processed)` branch levels. Exactly one branch is audible; without a
/// processed buffer the raw branch always is.
pub fn branch_levels(mode: PlayMode, has_processed: bool) -> (f32, f32) {
    match (mode, has_processed) {
        (PlayMode::Processed, true) => (0.0, 1.0),
        _ => (1.0, 0.0),
    }
}

#[derive(Debug)]
pub struct Voice {
    handle: SourceHandle,
    done: bool,
}

impl Voice {
    fn start(
        ctx: &mut AudioContext,
        buffer: &AudioArc,
        bus: BusId,
        when: f64,
        offset: f64,
    ) -> Result<Self, AudioError> {
        let handle = ctx.start_source(SourceSpec {
            buffer: buffer.clone(),
            bus,
            when,
            offset: offset.min(buffer.duration_secs()),
        })?;
        Ok(Self {
            handle,
            done: false,
        })
    }

    /// Ended or stopped.
    fn poll(&mut self) -> bool {
        if !self.done {
            match self.handle.completion.try_recv() {
                Ok(_) | Err(TryRecvError::Closed) => self.done = true,
                Err(TryRecvError::Empty) => {}
            }
        }
        self.done
    }
}

#[derive(Debug)]
pub struct Branch {
    voice: Voice,
    gain: BusId,
    level: f32,
}

impl Branch {
    fn start(
        ctx: &mut AudioContext,
        buffer: &AudioArc,
        parent: BusId,
        level: f32,
        when: f64,
        offset: f64,
    ) -> Result<Self, AudioError> {
        let gain = ctx.create_bus(level, BusOutput::Bus(parent))?;
        match Voice::start(ctx, buffer, gain, when, offset) {
            Ok(voice) => Ok(Self { voice, gain, level }),
            Err(err) => {
                discard_bus(ctx, gain);
                Err(err)
            }
        }
    }

    fn discard(self, ctx: &mut AudioContext) {
        discard_source(ctx, self.voice.handle.id);
        discard_bus(ctx, self.gain);
    }

    fn set_level(&mut self, ctx: &mut AudioContext, level: f32) -> Result<(), AudioError> {
        ctx.set_gain(self.gain, level)?;
        self.level = level;
        Ok(())
    }
}

/// The nodes one track plays through.
///
/// A vocal track keeps its raw and processed sources running side by side
/// from the same offset; switching between them only swaps branch gains.
#[derive(Debug)]
pub enum TrackNodes {
    Instrumental {
        source: Voice,
        gain: BusId,
        level: f32,
    },
    Vocal {
        master: BusId,
        level: f32,
        raw: Branch,
        processed: Option<Branch>,
    },
}

fn discard_source(ctx: &mut AudioContext, id: SourceId) {
    if let Err(err) = ctx.stop_source(id) {
        log::debug!("stopping source: {err}");
    }
}

fn discard_bus(ctx: &mut AudioContext, bus: BusId) {
    if let Err(err) = ctx.remove_bus(bus) {
        log::debug!("removing bus: {err}");
    }
}

fn feed(output: BusId) -> BusOutput {
    if output == BusId::DESTINATION {
        BusOutput::Destination
    } else {
        BusOutput::Bus(output)
    }
}

impl TrackNodes {
    /// Start every source of `track` at `when`, `offset` seconds in. Offsets
    /// past the end of a buffer are clamped to its duration.
    ///
    /// Either every node of the track starts or none is left behind.
    pub fn start(
        ctx: &mut AudioContext,
        output: BusId,
        track: &PlayableTrack,
        when: f64,
        offset: f64,
    ) -> Result<Self, AudioError> {
        ctx.reserve(Self::command_count(track))?;

        if !track.paired {
            let gain = ctx.create_bus(track.gain, feed(output))?;
            let source = match Voice::start(ctx, &track.raw, gain, when, offset) {
                Ok(source) => source,
                Err(err) => {
                    discard_bus(ctx, gain);
                    return Err(err);
                }
            };
            return Ok(TrackNodes::Instrumental {
                source,
                gain,
                level: track.gain,
            });
        }

        let master = ctx.create_bus(track.gain, feed(output))?;
        let (raw_level, processed_level) = branch_levels(track.mode, track.processed.is_some());
        let raw = match Branch::start(ctx, &track.raw, master, raw_level, when, offset) {
            Ok(raw) => raw,
            Err(err) => {
                discard_bus(ctx, master);
                return Err(err);
            }
        };
        let processed = match &track.processed {
            Some(buffer) => {
                match Branch::start(ctx, buffer, master, processed_level, when, offset) {
                    Ok(processed) => Some(processed),
                    Err(err) => {
                        raw.discard(ctx);
                        discard_bus(ctx, master);
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        Ok(TrackNodes::Vocal {
            master,
            level: track.gain,
            raw,
            processed,
        })
    }

    /// Make the branch for `mode` audible. Returns false when there is nothing
    /// to switch, i.e. no processed branch.
    pub fn set_play_mode(
        &mut self,
        ctx: &mut AudioContext,
        mode: PlayMode,
    ) -> Result<bool, AudioError> {
        let TrackNodes::Vocal {
            raw,
            processed: Some(processed),
            ..
        } = self
        else {
            return Ok(false);
        };
        let (raw_level, processed_level) = branch_levels(mode, true);
        raw.set_level(ctx, raw_level)?;
        processed.set_level(ctx, processed_level)?;
        Ok(true)
    }

    pub fn set_gain(&mut self, ctx: &mut AudioContext, factor: f32) -> Result<(), AudioError> {
        match self {
            TrackNodes::Instrumental { gain, level, .. } => {
                ctx.set_gain(*gain, factor)?;
                *level = factor;
            }
            TrackNodes::Vocal { master, level, .. } => {
                ctx.set_gain(*master, factor)?;
                *level = factor;
            }
        }
        Ok(())
    }

    /// True once every source has finished.
    pub fn poll_finished(&mut self) -> bool {
        match self {
            TrackNodes::Instrumental { source, .. } => source.poll(),
            TrackNodes::Vocal { raw, processed, .. } => {
                let raw_done = raw.voice.poll();
                let processed_done = processed.as_mut().is_none_or(|p| p.voice.poll());
                raw_done && processed_done
            }
        }
    }

    /// Stop and disconnect everything. Sources that already ended are fine.
    pub fn teardown(self, ctx: &mut AudioContext) {
        let (sources, buses) = match self {
            TrackNodes::Instrumental { source, gain, .. } => (vec![source.handle.id], vec![gain]),
            TrackNodes::Vocal {
                master,
                raw,
                processed,
                ..
            } => {
                let mut sources = vec![raw.voice.handle.id];
                let mut buses = vec![raw.gain];
                if let Some(processed) = processed {
                    sources.push(processed.voice.handle.id);
                    buses.push(processed.gain);
                }
                buses.push(master);
                (sources, buses)
            }
        };
        for id in sources {
            discard_source(ctx, id);
        }
        for bus in buses {
            discard_bus(ctx, bus);
        }
    }

    /// Engine commands needed to start `track`.
    fn command_count(track: &PlayableTrack) -> usize {
        match (track.paired, track.processed.is_some()) {
            (false, _) => 2,
            (true, false) => 3,
            (true, true) => 5,
        }
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.handles().iter().map(|h| h.id).collect()
    }

    /// Schedule instant shared by all sources of the track.
    pub fn when(&self) -> f64 {
        self.handles()[0].when
    }

    /// Buffer offsets the sources were started at.
    pub fn offsets(&self) -> Vec<f64> {
        self.handles().iter().map(|h| h.offset).collect()
    }

    /// Current `(raw, processed)` branch levels of a vocal track.
    pub fn branch_levels(&self) -> Option<(f32, f32)> {
        match self {
            TrackNodes::Instrumental { .. } => None,
            TrackNodes::Vocal { raw, processed, .. } => {
                Some((raw.level, processed.as_ref().map_or(0.0, |p| p.level)))
            }
        }
    }

    pub fn gain(&self) -> f32 {
        match self {
            TrackNodes::Instrumental { level, .. } | TrackNodes::Vocal { level, .. } => *level,
        }
    }

    fn handles(&self) -> Vec<&SourceHandle> {
        match self {
            TrackNodes::Instrumental { source, .. } => vec![&source.handle],
            TrackNodes::Vocal { raw, processed, .. } => {
                let mut handles = vec![&raw.voice.handle];
                if let Some(processed) = processed {
                    handles.push(&processed.voice.handle);
                }
                handles
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 8000;

    fn vocal(raw: f32, processed: Option<f32>, mode: PlayMode) -> PlayableTrack {
        PlayableTrack {
            id: TrackId::from("vox"),
            paired: true,
            raw: AudioArc::constant(raw, RATE as usize, RATE, 1),
            processed: processed.map(|v| AudioArc::constant(v, RATE as usize, RATE, 1)),
            mode,
            gain: 1.0,
        }
    }

    fn first_sample(ctx: &mut AudioContext) -> f32 {
        ctx.render(128).unwrap()[127]
    }

    #[test]
    fn test_branch_levels() {
        assert_eq!(branch_levels(PlayMode::Processed, true), (0.0, 1.0));
        assert_eq!(branch_levels(PlayMode::Raw, true), (1.0, 0.0));
        assert_eq!(branch_levels(PlayMode::Processed, false), (1.0, 0.0));
    }

    #[test]
    fn test_toggle_swaps_audible_branch_without_restarting() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let track = vocal(0.25, Some(0.5), PlayMode::Raw);
        let mut nodes = TrackNodes::start(&mut ctx, BusId::DESTINATION, &track, 0.0, 0.0).unwrap();
        let sources = nodes.source_ids();

        assert_eq!(first_sample(&mut ctx), 0.25);
        assert!(nodes.set_play_mode(&mut ctx, PlayMode::Processed).unwrap());
        assert_eq!(first_sample(&mut ctx), 0.5);
        assert_eq!(nodes.branch_levels(), Some((0.0, 1.0)));
        assert_eq!(nodes.source_ids(), sources);
    }

    #[test]
    fn test_toggle_without_processed_is_noop() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let track = vocal(0.25, None, PlayMode::Processed);
        let mut nodes = TrackNodes::start(&mut ctx, BusId::DESTINATION, &track, 0.0, 0.0).unwrap();

        assert!(!nodes.set_play_mode(&mut ctx, PlayMode::Raw).unwrap());
        assert_eq!(first_sample(&mut ctx), 0.25);
        assert_eq!(nodes.branch_levels(), Some((1.0, 0.0)));
    }

    #[test]
    fn test_master_gain_scales_active_branch() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let mut track = vocal(0.25, Some(0.5), PlayMode::Processed);
        track.gain = 2.0;
        let mut nodes = TrackNodes::start(&mut ctx, BusId::DESTINATION, &track, 0.0, 0.0).unwrap();

        assert_eq!(first_sample(&mut ctx), 1.0);
        nodes.set_gain(&mut ctx, 0.5).unwrap();
        assert_eq!(first_sample(&mut ctx), 0.25);
    }

    #[test]
    fn test_offsets_clamp_to_buffer_duration() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let track = vocal(0.1, Some(0.1), PlayMode::Raw);
        let nodes = TrackNodes::start(&mut ctx, BusId::DESTINATION, &track, 0.5, 3.0).unwrap();
        assert_eq!(nodes.offsets(), vec![1.0, 1.0]);
        assert_eq!(nodes.when(), 0.5);
    }

    #[test]
    fn test_finishes_when_all_sources_end() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let track = PlayableTrack {
            processed: Some(AudioArc::constant(0.1, 400, RATE, 1)),
            raw: AudioArc::constant(0.1, 100, RATE, 1),
            ..vocal(0.0, None, PlayMode::Raw)
        };
        let mut nodes = TrackNodes::start(&mut ctx, BusId::DESTINATION, &track, 0.0, 0.0).unwrap();

        ctx.render(128).unwrap();
        assert!(!nodes.poll_finished());
        ctx.render(384).unwrap();
        assert!(nodes.poll_finished());
    }

    #[test]
    fn test_start_without_room_leaves_nothing_playing() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        // four free slots: enough for the raw branch but not the processed one
        while ctx.reserve(5).is_ok() {
            ctx.set_gain(BusId::DESTINATION, 1.0).unwrap();
        }
        ctx.reserve(4).unwrap();

        let track = vocal(0.25, Some(0.5), PlayMode::Raw);
        assert!(matches!(
            TrackNodes::start(&mut ctx, BusId::DESTINATION, &track, 0.0, 0.0),
            Err(AudioError::QueueFull)
        ));
        assert_eq!(ctx.bus_count(), 0);
        assert_eq!(first_sample(&mut ctx), 0.0);

        let nodes = TrackNodes::start(&mut ctx, BusId::DESTINATION, &track, 0.0, 0.0).unwrap();
        assert_eq!(nodes.source_ids().len(), 2);
        assert_eq!(ctx.bus_count(), 3);
    }

    #[test]
    fn test_teardown_silences_track() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let nodes = TrackNodes::start(
            &mut ctx,
            BusId::DESTINATION,
            &PlayableTrack {
                paired: false,
                ..vocal(0.3, None, PlayMode::Raw)
            },
            0.0,
            0.0,
        )
        .unwrap();
        assert!((first_sample(&mut ctx) - 0.3).abs() < 1e-6);

        nodes.teardown(&mut ctx);
        assert_eq!(first_sample(&mut ctx), 0.0);
    }
}
