pub mod accumulation_service;
pub mod chip_zone_service;
pub mod fetch_service;
pub mod indicators;
pub mod publish_service;
pub mod rate_limiter;
pub mod render_service;
pub mod sync_service;
pub mod volume_profile_service;
