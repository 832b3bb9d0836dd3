pub mod entity;
pub mod lifecycle;
pub mod presence_record;
pub mod renderer_event;
pub mod signals;

pub use entity::{CellId, ClusterOrMarker, Entity};
pub use lifecycle::{LifecycleState, RemovalReason};
pub use presence_record::{DestinationCategory, GeoPoint, PartitionKey, PresencePath, PresenceRecord, Role};
pub use renderer_event::{EventBus, RendererEvent};
pub use signals::{AppLifecycleEvent, ConnectivityEvent, NavigationEvent, RendererInput};
