/// Host and process resource collector
pub mod system;

/// Closure-backed collector for ad-hoc sources
pub mod func;

pub use func::FnCollector;
pub use system::SystemCollector;
