pub mod clock;
pub mod clustering_service;
pub mod counterpart_subscription_service;
pub mod geo_math;
pub mod marker_icon_cache;
pub mod match_pipeline_service;
pub mod matching_session;
pub mod presence_lifecycle_service;
pub mod proximity_service;
pub mod throttle_service;
