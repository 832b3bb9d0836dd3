// Inputs from the out-of-scope collaborators (OS lifecycle, navigator,
// network monitor, renderer).

use crate::models::{DestinationCategory, GeoPoint, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycleEvent {
    Foreground,
    Background,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationEvent {
    EnteredMatchingContext {
        role: Role,
        destination: DestinationCategory,
    },
    LeftMatchingContext {
        current_route_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Lost,
    Restored,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RendererInput {
    LocationTick(GeoPoint),
    RadiusChanged(f64),
}
