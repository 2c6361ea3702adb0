//! The POSIX operation layer: per-operation local execution, and the
//! owner/forward/replicate dispatch contract built on top of it.

pub mod context;
pub mod dispatch;
pub mod handlers;

pub use context::NodeContext;
pub use dispatch::dispatch;
