pub mod bus;
pub mod config;
pub mod crypto;
pub mod entity;
pub mod os;

/// Log target prefix used by all NMS services.
pub const NMS_NAMESPACE: &str = "nms";
