use vox_engine::{AudioContext, AudioError, BusId, MediaElement, MediaSource};

use crate::config::RoutePreference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Mobile,
    Desktop,
}

impl Platform {
    /// Classify by device signature. Touch support alone does not make a
    /// device mobile: touchscreen laptops stay on the desktop path. iPadOS
    /// reports a desktop Mac user agent and is told apart by its touch points.
    /// Fed from the configured device signature, see [`StudioConfig::platform`].
    ///
    /// [`StudioConfig::platform`]: crate::StudioConfig::platform
    pub fn classify(user_agent: &str, max_touch_points: u32) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        let handset = ["android", "iphone", "ipod"].iter().any(|sig| ua.contains(sig));
        let ipad = ua.contains("macintosh") && max_touch_points > 1;
        if handset || ipad {
            Platform::Mobile
        } else {
            Platform::Desktop
        }
    }

    /// The platform this binary was built for.
    pub fn native() -> Self {
        if cfg!(any(target_os = "android", target_os = "ios")) {
            Platform::Mobile
        } else {
            Platform::Desktop
        }
    }

    pub fn is_mobile(&self) -> bool {
        matches!(self, Platform::Mobile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Direct,
    MediaElement,
}

/// How the graph reaches the speaker. Track graphs connect to the bus
/// returned by [`OutputRoute::connect`] and never learn which route is in use.
pub trait OutputRoute {
    fn kind(&self) -> RouteKind;

    /// Wire the route into a freshly created context and return the bus track
    /// graphs should feed.
    fn connect(&mut self, ctx: &mut AudioContext) -> Result<BusId, AudioError>;

    /// Start the output path. Must be called from inside the user gesture.
    fn activate(&mut self) -> Result<(), AudioError>;

    fn suspend(&mut self);
}

/// Straight to the context destination.
#[derive(Debug, Default)]
pub struct DirectRoute;

impl OutputRoute for DirectRoute {
    fn kind(&self) -> RouteKind {
        RouteKind::Direct
    }

    fn connect(&mut self, _ctx: &mut AudioContext) -> Result<BusId, AudioError> {
        Ok(BusId::DESTINATION)
    }

    fn activate(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn suspend(&mut self) {}
}

/// Through a stream destination into a media element, for platforms where
/// context output does not reliably reach the hardware.
#[derive(Default)]
pub struct MediaElementRoute {
    element: Option<Box<dyn MediaElement>>,
}

impl MediaElementRoute {
    pub fn is_playing(&self) -> bool {
        self.element.as_ref().is_some_and(|e| e.is_playing())
    }
}

impl OutputRoute for MediaElementRoute {
    fn kind(&self) -> RouteKind {
        RouteKind::MediaElement
    }

    fn connect(&mut self, ctx: &mut AudioContext) -> Result<BusId, AudioError> {
        if let Some(mut old) = self.element.take() {
            old.pause();
        }
        let (bus, stream) = ctx.create_stream_destination()?;
        let mut element = ctx.create_media_element()?;
        element.set_source(MediaSource::Stream(stream));
        self.element = Some(element);
        Ok(bus)
    }

    fn activate(&mut self) -> Result<(), AudioError> {
        match self.element.as_mut() {
            Some(element) => element.play(),
            None => Ok(()),
        }
    }

    fn suspend(&mut self) {
        if let Some(element) = self.element.as_mut() {
            element.pause();
        }
    }
}

pub fn route_for(platform: Platform, preference: RoutePreference) -> Box<dyn OutputRoute> {
    let kind = match preference {
        RoutePreference::Direct => RouteKind::Direct,
        RoutePreference::MediaElement => RouteKind::MediaElement,
        RoutePreference::Auto if platform.is_mobile() => RouteKind::MediaElement,
        RoutePreference::Auto => RouteKind::Direct,
    };
    log::debug!("output route for {platform:?}: {kind:?}");
    match kind {
        RouteKind::Direct => Box::new(DirectRoute),
        RouteKind::MediaElement => Box::new(MediaElementRoute::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_engine::{BusOutput, SourceSpec};
    use vox_transport::AudioArc;

    #[test]
    fn test_classify_handsets() {
        let iphone = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15";
        let android = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36";
        assert_eq!(Platform::classify(iphone, 5), Platform::Mobile);
        assert_eq!(Platform::classify(android, 5), Platform::Mobile);
    }

    #[test]
    fn test_ipad_reporting_as_mac_is_mobile() {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15";
        assert_eq!(Platform::classify(ua, 5), Platform::Mobile);
        assert_eq!(Platform::classify(ua, 0), Platform::Desktop);
    }

    #[test]
    fn test_touchscreen_windows_stays_desktop() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
        assert_eq!(Platform::classify(ua, 10), Platform::Desktop);
    }

    #[test]
    fn test_route_selection() {
        assert_eq!(
            route_for(Platform::Mobile, RoutePreference::Auto).kind(),
            RouteKind::MediaElement
        );
        assert_eq!(route_for(Platform::Desktop, RoutePreference::Auto).kind(), RouteKind::Direct);
        assert_eq!(route_for(Platform::Mobile, RoutePreference::Direct).kind(), RouteKind::Direct);
    }

    #[test]
    fn test_media_element_route_carries_graph_output() {
        let mut ctx = AudioContext::offline(8000, 1, false);
        let mut route = MediaElementRoute::default();
        let bus = route.connect(&mut ctx).unwrap();
        route.activate().unwrap();
        assert!(route.is_playing());

        let track = ctx.create_bus(0.5, BusOutput::Bus(bus)).unwrap();
        ctx.start_source(SourceSpec {
            buffer: AudioArc::constant(1.0, 4000, 8000, 1),
            bus: track,
            when: 0.0,
            offset: 0.0,
        })
        .unwrap();
        let device = ctx.render(128).unwrap();
        assert!(device.iter().all(|&s| s == 0.0));

        let heard = ctx.captured_elements()[0].pull(128);
        assert!(heard.iter().all(|&s| s == 0.5));

        route.suspend();
        assert!(!route.is_playing());
    }
}
