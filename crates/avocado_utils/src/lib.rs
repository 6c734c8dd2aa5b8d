pub mod duration;
pub mod exit;
pub mod fs_safe;
pub mod net_protocol;
pub mod runnable;
pub mod time;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
