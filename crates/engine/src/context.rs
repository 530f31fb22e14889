use std::collections::HashSet;
use std::sync::Arc;

use basedrop::{Collector, Handle, Owned};
use cpal::traits::StreamTrait;
use tokio::sync::oneshot;

use crate::device::{OutputDevice, build_output};
use crate::media::{CaptureElement, CpalMediaElement, MediaElement, StreamReceiver};
use crate::renderer::{Bus, Command, ContextClock, RENDER_QUANTUM, Renderer, Source};
use crate::{AudioError, BusId, BusOutput, ContextState, SourceHandle, SourceId, SourceSpec};

const COMMAND_CAPACITY: usize = 1024;

enum Driver {
    Device {
        output: OutputDevice,
        stream: cpal::Stream,
    },
    Offline {
        renderer: Box<Renderer>,
        elements: Vec<CaptureElement>,
    },
    Closed,
}

/// Control-thread handle of an audio graph.
///
/// Time is counted in frames rendered; it only moves while the context is
/// running, and it moves in steps of [`RENDER_QUANTUM`].
pub struct AudioContext {
    driver: Driver,
    sample_rate: u32,
    channels: u16,
    commands: rtrb::Producer<Command>,
    clock: Arc<ContextClock>,
    collector: Collector,
    handle: Handle,
    buses: HashSet<BusId>,
    next_id: u64,
}

impl AudioContext {
    /// Open a context on the default output device. The stream is built but
    /// stays paused until [`AudioContext::resume`].
    pub fn open_default() -> Result<Self, AudioError> {
        let output = OutputDevice::open_default()?;
        let (sample_rate, channels) = (output.sample_rate(), output.channels());
        let (commands, mut renderer, clock) = Self::renderer(ContextState::Suspended, channels);

        let stream = build_output(&output, move |out: &mut [f32]| renderer.process(out))?;
        stream.pause()?;

        Ok(Self::with_driver(
            Driver::Device { output, stream },
            sample_rate,
            channels,
            commands,
            clock,
        ))
    }

    /// A context rendered on demand with [`AudioContext::render`].
    pub fn offline(sample_rate: u32, channels: u16, suspended: bool) -> Self {
        let state = if suspended {
            ContextState::Suspended
        } else {
            ContextState::Running
        };
        let (commands, renderer, clock) = Self::renderer(state, channels);
        Self::with_driver(
            Driver::Offline {
                renderer: Box::new(renderer),
                elements: Vec::new(),
            },
            sample_rate,
            channels,
            commands,
            clock,
        )
    }

    fn renderer(
        state: ContextState,
        channels: u16,
    ) -> (rtrb::Producer<Command>, Renderer, Arc<ContextClock>) {
        let (commands, consumer) = rtrb::RingBuffer::new(COMMAND_CAPACITY);
        let clock = Arc::new(ContextClock::new(state));
        let renderer = Renderer::new(consumer, clock.clone(), channels as usize);
        (commands, renderer, clock)
    }

    fn with_driver(
        driver: Driver,
        sample_rate: u32,
        channels: u16,
        commands: rtrb::Producer<Command>,
        clock: Arc<ContextClock>,
    ) -> Self {
        let collector = Collector::new();
        let handle = collector.handle();
        Self {
            driver,
            sample_rate,
            channels,
            commands,
            clock,
            collector,
            handle,
            buses: HashSet::new(),
            next_id: 1,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn state(&self) -> ContextState {
        self.clock.state()
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.driver, Driver::Offline { .. })
    }

    pub fn current_frame(&self) -> u64 {
        self.clock.frames()
    }

    /// Seconds rendered so far.
    pub fn current_time(&self) -> f64 {
        self.current_frame() as f64 / self.sample_rate as f64
    }

    pub fn resume(&mut self) -> Result<(), AudioError> {
        match &self.driver {
            Driver::Closed => return Err(AudioError::Closed),
            Driver::Device { stream, .. } => stream.play()?,
            Driver::Offline { .. } => {}
        }
        if self.state() != ContextState::Running {
            log::debug!("audio context resumed at frame {}", self.current_frame());
        }
        self.clock.set_state(ContextState::Running);
        Ok(())
    }

    pub fn suspend(&mut self) -> Result<(), AudioError> {
        match &self.driver {
            Driver::Closed => return Err(AudioError::Closed),
            Driver::Device { stream, .. } => stream.pause()?,
            Driver::Offline { .. } => {}
        }
        self.clock.set_state(ContextState::Suspended);
        Ok(())
    }

    /// Release the output. Everything scheduled is dropped.
    pub fn close(&mut self) {
        if matches!(self.driver, Driver::Closed) {
            return;
        }
        self.clock.set_state(ContextState::Closed);
        self.driver = Driver::Closed;
        self.buses.clear();
        self.collector.collect();
        log::debug!("audio context closed");
    }

    /// Add a gain bus routed to `output`. A bus may only feed a bus created
    /// before it.
    pub fn create_bus(&mut self, gain: f32, output: BusOutput) -> Result<BusId, AudioError> {
        if let BusOutput::Bus(parent) = output {
            self.check_bus(parent)?;
        }
        self.add_bus(gain, output, None)
    }

    pub fn set_gain(&mut self, bus: BusId, gain: f32) -> Result<(), AudioError> {
        self.check_bus(bus)?;
        self.send(Command::SetGain { bus, gain })
    }

    /// Remove a bus. Sources still routed to it keep advancing silently.
    pub fn remove_bus(&mut self, bus: BusId) -> Result<(), AudioError> {
        if bus == BusId::DESTINATION || !self.buses.remove(&bus) {
            return Ok(());
        }
        self.send(Command::RemoveBus(bus))
    }

    /// Fail with [`AudioError::QueueFull`] unless `commands` more commands
    /// fit in the queue right now.
    pub fn reserve(&self, commands: usize) -> Result<(), AudioError> {
        if matches!(self.driver, Driver::Closed) {
            return Err(AudioError::Closed);
        }
        if self.commands.slots() < commands {
            return Err(AudioError::QueueFull);
        }
        Ok(())
    }

    /// Live gain buses, not counting the destination.
    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    /// A bus whose output is delivered to the returned receiver instead of the
    /// device.
    pub fn create_stream_destination(&mut self) -> Result<(BusId, StreamReceiver), AudioError> {
        let capacity = self.sample_rate as usize * self.channels as usize;
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        let bus = self.add_bus(1.0, BusOutput::Stream, Some(producer))?;
        Ok((bus, StreamReceiver::new(consumer, self.channels)))
    }

    pub fn start_source(&mut self, spec: SourceSpec) -> Result<SourceHandle, AudioError> {
        self.check_bus(spec.bus)?;

        let id = SourceId(self.next_id());
        let (ended, completion) = oneshot::channel();
        let buffer_rate = spec.buffer.sample_rate() as f64;
        let offset = spec.offset.max(0.0);
        let source = Source {
            id,
            bus: spec.bus,
            start_frame: (spec.when.max(0.0) * self.sample_rate as f64).round() as u64,
            position: offset * buffer_rate,
            step: buffer_rate / self.sample_rate as f64,
            audio: spec.buffer,
            ended: Some(ended),
        };
        self.send(Command::AddSource(Owned::new(&self.handle, source)))?;

        Ok(SourceHandle {
            id,
            when: spec.when,
            offset,
            completion,
        })
    }

    /// Stop a source. Stopping one that already ended is not an error.
    pub fn stop_source(&mut self, id: SourceId) -> Result<(), AudioError> {
        self.send(Command::StopSource(id))
    }

    pub fn create_media_element(&mut self) -> Result<Box<dyn MediaElement>, AudioError> {
        match &mut self.driver {
            Driver::Closed => Err(AudioError::Closed),
            Driver::Device { output, .. } => Ok(Box::new(CpalMediaElement::open(output)?)),
            Driver::Offline { elements, .. } => {
                let element = CaptureElement::new(self.channels);
                elements.push(element.clone());
                Ok(Box::new(element))
            }
        }
    }

    /// Elements created by an offline context, in creation order.
    pub fn captured_elements(&self) -> &[CaptureElement] {
        match &self.driver {
            Driver::Offline { elements, .. } => elements,
            _ => &[],
        }
    }

    /// Render `frames` frames of an offline context, returning the
    /// interleaved device output.
    pub fn render(&mut self, frames: usize) -> Result<Vec<f32>, AudioError> {
        let Driver::Offline { renderer, .. } = &mut self.driver else {
            return Err(AudioError::NotOffline);
        };
        let mut out = vec![0.0; frames * self.channels as usize];
        renderer.process(&mut out);
        self.collector.collect();
        Ok(out)
    }

    /// Render until the context time reaches `seconds`, in whole quanta.
    pub fn render_until(&mut self, seconds: f64) -> Result<(), AudioError> {
        let target = (seconds * self.sample_rate as f64).ceil() as u64;
        while self.current_frame() < target {
            self.render(RENDER_QUANTUM)?;
        }
        Ok(())
    }

    /// Free graph objects the audio thread has let go of.
    pub fn collect_garbage(&mut self) {
        self.collector.collect();
    }

    fn add_bus(
        &mut self,
        gain: f32,
        output: BusOutput,
        tap: Option<rtrb::Producer<f32>>,
    ) -> Result<BusId, AudioError> {
        if matches!(self.driver, Driver::Closed) {
            return Err(AudioError::Closed);
        }
        let id = BusId(self.next_id());
        let bus = Bus {
            id,
            gain,
            output,
            mix: vec![0.0; RENDER_QUANTUM * self.channels as usize],
            tap,
        };
        self.send(Command::AddBus(Owned::new(&self.handle, bus)))?;
        self.buses.insert(id);
        Ok(id)
    }

    fn check_bus(&self, bus: BusId) -> Result<(), AudioError> {
        if matches!(self.driver, Driver::Closed) {
            return Err(AudioError::Closed);
        }
        if bus == BusId::DESTINATION || self.buses.contains(&bus) {
            Ok(())
        } else {
            Err(AudioError::UnknownBus(bus))
        }
    }

    fn send(&mut self, command: Command) -> Result<(), AudioError> {
        if matches!(self.driver, Driver::Closed) {
            return Err(AudioError::Closed);
        }
        self.collector.collect();
        self.commands.push(command).map_err(|_| AudioError::QueueFull)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContext")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("state", &self.state())
            .field("frame", &self.current_frame())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ended;
    use tokio::sync::oneshot::error::TryRecvError;
    use vox_transport::AudioArc;

    const RATE: u32 = 48000;

    fn source(buffer: AudioArc, bus: BusId, when: f64, offset: f64) -> SourceSpec {
        SourceSpec {
            buffer,
            bus,
            when,
            offset,
        }
    }

    #[test]
    fn test_clock_only_runs_when_resumed() {
        let mut ctx = AudioContext::offline(RATE, 2, true);
        ctx.render(512).unwrap();
        assert_eq!(ctx.current_frame(), 0);

        ctx.resume().unwrap();
        ctx.render(512).unwrap();
        assert_eq!(ctx.current_frame(), 512);
        assert!((ctx.current_time() - 512.0 / RATE as f64).abs() < 1e-12);
    }

    #[test]
    fn test_sources_sharing_an_instant_start_together() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let when = 200.0 / RATE as f64;
        let quiet = AudioArc::constant(0.25, 1000, RATE, 1);
        let loud = AudioArc::constant(0.5, 1000, RATE, 1);
        ctx.start_source(source(quiet, BusId::DESTINATION, when, 0.0)).unwrap();
        ctx.start_source(source(loud, BusId::DESTINATION, when, 0.0)).unwrap();

        let out = ctx.render(256).unwrap();
        assert_eq!(out[199], 0.0);
        assert_eq!(out[200], 0.75);
    }

    #[test]
    fn test_offset_skips_into_buffer() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let ramp: Vec<f32> = (0..RATE).map(|i| i as f32).collect();
        ctx.start_source(source(AudioArc::new(ramp, RATE, 1), BusId::DESTINATION, 0.0, 0.5))
            .unwrap();

        let out = ctx.render(4).unwrap();
        assert_eq!(out, vec![24000.0, 24001.0, 24002.0, 24003.0]);
    }

    #[test]
    fn test_nested_bus_gains_multiply() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let master = ctx.create_bus(0.5, BusOutput::Destination).unwrap();
        let branch = ctx.create_bus(0.5, BusOutput::Bus(master)).unwrap();
        ctx.start_source(source(AudioArc::constant(1.0, 1000, RATE, 1), branch, 0.0, 0.0))
            .unwrap();

        let out = ctx.render(128).unwrap();
        assert_eq!(out[0], 0.25);

        ctx.set_gain(branch, 0.0).unwrap();
        let out = ctx.render(128).unwrap();
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn test_completion_resolves_only_for_natural_end() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let short_audio = AudioArc::constant(0.1, 64, RATE, 1);
        let long_audio = AudioArc::constant(0.1, RATE as usize, RATE, 1);
        let mut short =
            ctx.start_source(source(short_audio, BusId::DESTINATION, 0.0, 0.0)).unwrap();
        let mut long = ctx.start_source(source(long_audio, BusId::DESTINATION, 0.0, 0.0)).unwrap();

        ctx.render(128).unwrap();
        assert_eq!(short.completion.try_recv().unwrap(), Ended { frame: 64 });
        assert!(matches!(long.completion.try_recv(), Err(TryRecvError::Empty)));

        ctx.stop_source(long.id).unwrap();
        ctx.render(128).unwrap();
        assert!(matches!(long.completion.try_recv(), Err(TryRecvError::Closed)));
    }

    #[test]
    fn test_stream_destination_feeds_element() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let (bus, receiver) = ctx.create_stream_destination().unwrap();
        let mut element = ctx.create_media_element().unwrap();
        element.set_source(crate::MediaSource::Stream(receiver));
        element.play().unwrap();

        ctx.start_source(source(AudioArc::constant(0.5, 1000, RATE, 1), bus, 0.0, 0.0))
            .unwrap();
        let device = ctx.render(128).unwrap();
        assert!(device.iter().all(|&s| s == 0.0));

        let heard = ctx.captured_elements()[0].pull(128);
        assert!(heard.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_unknown_bus_is_rejected() {
        let mut ctx = AudioContext::offline(RATE, 1, false);
        let bus = ctx.create_bus(1.0, BusOutput::Destination).unwrap();
        ctx.remove_bus(bus).unwrap();

        let err = ctx
            .start_source(source(AudioArc::constant(0.1, 10, RATE, 1), bus, 0.0, 0.0))
            .unwrap_err();
        assert!(matches!(err, AudioError::UnknownBus(_)));
    }

    #[test]
    fn test_closed_context_refuses_work() {
        let mut ctx = AudioContext::offline(RATE, 2, false);
        ctx.close();
        assert_eq!(ctx.state(), ContextState::Closed);
        assert!(matches!(ctx.resume(), Err(AudioError::Closed)));
        assert!(matches!(
            ctx.create_bus(1.0, BusOutput::Destination),
            Err(AudioError::Closed)
        ));
        assert!(matches!(ctx.render(128), Err(AudioError::NotOffline)));
    }
}
