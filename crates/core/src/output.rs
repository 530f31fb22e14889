use vox_engine::{AudioContext, AudioError, BusId, ContextFactory, ContextState};

use crate::config::RoutePreference;
use crate::route::{OutputRoute, Platform, route_for};
use crate::unlock::AudioUnlockManager;

/// Result of [`PlaybackOutput::activate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    /// A new context replaced the previous one; anything scheduled on the old
    /// one is gone.
    pub fresh_context: bool,
    pub sample_rate: u32,
}

/// Owns the audio context, the output route and the unlock state.
///
/// Mobile engines are unreliable about reviving a context that went idle, so
/// on mobile every activation starts from a fresh context. The decoded
/// buffers survive in the buffer store; only the graph is rebuilt.
pub struct PlaybackOutput {
    factory: Box<dyn ContextFactory>,
    platform: Platform,
    route: Box<dyn OutputRoute>,
    unlock: AudioUnlockManager,
    context: Option<AudioContext>,
    output_bus: BusId,
}

impl PlaybackOutput {
    pub fn new(
        factory: Box<dyn ContextFactory>,
        platform: Platform,
        preference: RoutePreference,
    ) -> Self {
        Self {
            factory,
            platform,
            route: route_for(platform, preference),
            unlock: AudioUnlockManager::new(),
            context: None,
            output_bus: BusId::DESTINATION,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Make the output audible. Runs synchronously so it can be called at
    /// the very start of a user gesture.
    pub fn activate(&mut self) -> Result<Activation, AudioError> {
        let stale = match &self.context {
            None => true,
            Some(ctx) => ctx.state() == ContextState::Closed || self.platform.is_mobile(),
        };

        let fresh_context = stale;
        if stale {
            if let Some(mut old) = self.context.take() {
                old.close();
            }
            let mut ctx = self.factory.create()?;
            self.output_bus = self.route.connect(&mut ctx)?;
            self.unlock.rearm();
            log::info!(
                "created audio context at {} Hz ({:?} route)",
                ctx.sample_rate(),
                self.route.kind()
            );
            self.context = Some(ctx);
        }

        let Some(ctx) = self.context.as_mut() else {
            return Err(AudioError::Closed);
        };
        self.unlock.unlock(ctx)?;
        ctx.resume()?;
        self.route.activate()?;

        Ok(Activation {
            fresh_context,
            sample_rate: ctx.sample_rate(),
        })
    }

    /// Pause the route's element when playback stops. The context itself
    /// keeps running so the next play has no wake-up cost.
    pub fn suspend_route(&mut self) {
        self.route.suspend();
    }

    pub fn context(&self) -> Option<&AudioContext> {
        self.context.as_ref()
    }

    pub fn context_mut(&mut self) -> Option<&mut AudioContext> {
        self.context.as_mut()
    }

    /// Bus track graphs feed.
    pub fn output_bus(&self) -> BusId {
        self.output_bus
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlock.is_unlocked()
    }
}
