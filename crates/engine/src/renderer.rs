use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use basedrop::Owned;
use tokio::sync::oneshot;
use vox_transport::AudioArc;

use crate::{BusId, BusOutput, ContextState, Ended, SourceId};

/// Frames rendered per processing block. Commands and gain changes take effect
/// on block boundaries; sources start at their exact frame inside a block.
pub const RENDER_QUANTUM: usize = 128;

/// State shared between a context and its renderer.
pub(crate) struct ContextClock {
    frames: AtomicU64,
    state: AtomicU8,
}

impl ContextClock {
    pub(crate) fn new(state: ContextState) -> Self {
        Self {
            frames: AtomicU64::new(0),
            state: AtomicU8::new(state as u8),
        }
    }

    pub(crate) fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ContextState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }
}

pub(crate) struct Source {
    pub id: SourceId,
    pub audio: AudioArc,
    pub bus: BusId,
    pub start_frame: u64,
    /// Read position in buffer frames.
    pub position: f64,
    /// Buffer frames per output frame.
    pub step: f64,
    pub ended: Option<oneshot::Sender<Ended>>,
}

pub(crate) struct Bus {
    pub id: BusId,
    pub gain: f32,
    pub output: BusOutput,
    /// One quantum of interleaved input, allocated on the control thread.
    pub mix: Vec<f32>,
    pub tap: Option<rtrb::Producer<f32>>,
}

pub(crate) enum Command {
    AddBus(Owned<Bus>),
    SetGain { bus: BusId, gain: f32 },
    RemoveBus(BusId),
    AddSource(Owned<Source>),
    StopSource(SourceId),
}

/// The audio-thread half of a context.
pub(crate) struct Renderer {
    commands: rtrb::Consumer<Command>,
    clock: Arc<ContextClock>,
    channels: usize,
    sources: Vec<Owned<Source>>,
    buses: Vec<Owned<Bus>>,
    master: Vec<f32>,
    /// Read position into `master` when the host asks for sizes that are not
    /// a multiple of the quantum.
    cursor: usize,
}

impl Renderer {
    pub(crate) fn new(
        commands: rtrb::Consumer<Command>,
        clock: Arc<ContextClock>,
        channels: usize,
    ) -> Self {
        let master = vec![0.0; RENDER_QUANTUM * channels];
        Self {
            commands,
            clock,
            channels,
            sources: Vec::with_capacity(64),
            buses: Vec::with_capacity(64),
            cursor: master.len(),
            master,
        }
    }

    /// Fill `out` with interleaved output.
    pub(crate) fn process(&mut self, out: &mut [f32]) {
        if self.clock.state() != ContextState::Running {
            self.apply_commands();
            out.fill(0.0);
            return;
        }

        let mut written = 0;
        while written < out.len() {
            if self.cursor >= self.master.len() {
                self.render_quantum();
                self.cursor = 0;
            }
            let n = (out.len() - written).min(self.master.len() - self.cursor);
            out[written..written + n].copy_from_slice(&self.master[self.cursor..self.cursor + n]);
            written += n;
            self.cursor += n;
        }
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                Command::AddBus(bus) => self.buses.push(bus),
                Command::SetGain { bus, gain } => {
                    if let Some(bus) = self.buses.iter_mut().find(|b| b.id == bus) {
                        bus.gain = gain;
                    }
                }
                Command::RemoveBus(id) => self.buses.retain(|b| b.id != id),
                Command::AddSource(source) => self.sources.push(source),
                Command::StopSource(id) => {
                    if let Some(index) = self.sources.iter().position(|s| s.id == id) {
                        let mut source = self.sources.swap_remove(index);
                        // closes the completion now instead of at the next collect
                        drop(source.ended.take());
                    }
                }
            }
        }
    }

    fn render_quantum(&mut self) {
        self.apply_commands();

        let frame0 = self.clock.frames();
        let channels = self.channels;
        self.master.fill(0.0);
        for bus in self.buses.iter_mut() {
            bus.mix.fill(0.0);
        }

        let master = &mut self.master;
        let buses = &mut self.buses;
        self.sources.retain_mut(|source| {
            let source: &mut Source = source;
            let target = if source.bus == BusId::DESTINATION {
                Some(master.as_mut_slice())
            } else {
                buses
                    .iter_mut()
                    .find(|b| b.id == source.bus)
                    .map(|b| b.mix.as_mut_slice())
            };
            match render_source(source, target, frame0, channels) {
                Some(frame) => {
                    if let Some(ended) = source.ended.take() {
                        let _ = ended.send(Ended { frame });
                    }
                    false
                }
                None => true,
            }
        });

        // children are created after their parents, so walking backwards
        // settles every bus before its parent is read
        for i in (0..self.buses.len()).rev() {
            let (head, tail) = self.buses.split_at_mut(i);
            let bus: &mut Bus = &mut tail[0];
            match bus.output {
                BusOutput::Destination => mix_into(&mut self.master, &bus.mix, bus.gain),
                BusOutput::Bus(parent) => {
                    if let Some(parent) = head.iter_mut().find(|b| b.id == parent) {
                        mix_into(&mut parent.mix, &bus.mix, bus.gain);
                    }
                }
                BusOutput::Stream => {
                    if let Some(tap) = bus.tap.as_mut() {
                        for &sample in &bus.mix {
                            if tap.push(sample * bus.gain).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.clock.advance(RENDER_QUANTUM as u64);
    }
}

/// Mix one quantum of `source` into `target`. Returns the frame at which the
/// source ran out of samples, if it did.
fn render_source(
    source: &mut Source,
    mut target: Option<&mut [f32]>,
    frame0: u64,
    channels: usize,
) -> Option<u64> {
    let quantum_end = frame0 + RENDER_QUANTUM as u64;
    if source.start_frame >= quantum_end {
        return None;
    }

    let frames = source.audio.frames();
    let first = source.start_frame.saturating_sub(frame0) as usize;
    for i in first..RENDER_QUANTUM {
        let index = source.position as usize;
        if index >= frames {
            return Some(frame0 + i as u64);
        }
        if let Some(target) = target.as_deref_mut() {
            let frame = &mut target[i * channels..(i + 1) * channels];
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample += source.audio.sample_wrapped(index, ch);
            }
        }
        source.position += source.step;
    }

    if source.position as usize >= frames {
        Some(quantum_end)
    } else {
        None
    }
}

#[inline]
fn mix_into(target: &mut [f32], input: &[f32], gain: f32) {
    if gain == 0.0 {
        return;
    }
    for (out, sample) in target.iter_mut().zip(input) {
        *out += sample * gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Collector;

    struct Rig {
        collector: Collector,
        commands: rtrb::Producer<Command>,
        clock: Arc<ContextClock>,
        renderer: Renderer,
    }

    fn rig() -> Rig {
        let (commands, consumer) = rtrb::RingBuffer::new(64);
        let clock = Arc::new(ContextClock::new(ContextState::Running));
        let renderer = Renderer::new(consumer, clock.clone(), 1);
        Rig {
            collector: Collector::new(),
            commands,
            clock,
            renderer,
        }
    }

    impl Rig {
        fn source(
            &mut self,
            id: u64,
            audio: AudioArc,
            start_frame: u64,
        ) -> oneshot::Receiver<Ended> {
            let (tx, rx) = oneshot::channel();
            let source = Source {
                id: SourceId(id),
                audio,
                bus: BusId::DESTINATION,
                start_frame,
                position: 0.0,
                step: 1.0,
                ended: Some(tx),
            };
            let owned = Owned::new(&self.collector.handle(), source);
            assert!(self.commands.push(Command::AddSource(owned)).is_ok());
            rx
        }

        fn render(&mut self, frames: usize) -> Vec<f32> {
            let mut out = vec![0.0; frames];
            self.renderer.process(&mut out);
            self.collector.collect();
            out
        }
    }

    #[test]
    fn test_source_starts_inside_quantum() {
        let mut rig = rig();
        rig.source(1, AudioArc::constant(1.0, 1000, 48000, 1), 10);

        let out = rig.render(RENDER_QUANTUM);
        assert_eq!(out[9], 0.0);
        assert_eq!(out[10], 1.0);
        assert_eq!(rig.clock.frames(), RENDER_QUANTUM as u64);
    }

    #[test]
    fn test_natural_end_resolves_completion() {
        let mut rig = rig();
        let mut rx = rig.source(1, AudioArc::constant(0.5, 50, 48000, 1), 0);

        let out = rig.render(RENDER_QUANTUM);
        assert_eq!(out[49], 0.5);
        assert_eq!(out[50], 0.0);
        assert_eq!(rx.try_recv().expect("ended"), Ended { frame: 50 });
    }

    #[test]
    fn test_stopped_source_closes_completion() {
        let mut rig = rig();
        let mut rx = rig.source(7, AudioArc::constant(0.5, 10_000, 48000, 1), 0);
        rig.render(RENDER_QUANTUM);

        assert!(rig.commands.push(Command::StopSource(SourceId(7))).is_ok());
        let out = rig.render(RENDER_QUANTUM);

        assert!(out.iter().all(|&s| s == 0.0));
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_suspended_renderer_is_silent_and_frozen() {
        let mut rig = rig();
        rig.clock.set_state(ContextState::Suspended);
        rig.source(1, AudioArc::constant(1.0, 1000, 48000, 1), 0);

        let out = rig.render(RENDER_QUANTUM * 2);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(rig.clock.frames(), 0);
    }

    #[test]
    fn test_odd_host_block_sizes_keep_continuity() {
        let mut rig = rig();
        let ramp: Vec<f32> = (0..400).map(|i| i as f32).collect();
        rig.source(1, AudioArc::new(ramp, 48000, 1), 0);

        let mut collected = rig.render(100);
        collected.extend(rig.render(77));
        collected.extend(rig.render(123));

        let expected: Vec<f32> = (0..300).map(|i| i as f32).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn test_mix_into_skips_muted_input() {
        let mut target = vec![1.0, 1.0];
        mix_into(&mut target, &[5.0, 5.0], 0.0);
        assert_eq!(target, vec![1.0, 1.0]);
        mix_into(&mut target, &[1.0, 2.0], 0.5);
        assert_eq!(target, vec![1.5, 2.0]);
    }
}
