pub mod executor;
pub mod forest;
pub mod request;
pub mod sync_lane;
