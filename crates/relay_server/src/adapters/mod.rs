#![forbid(unsafe_code)]

mod demo;
mod null;

pub use demo::{DEFAULT_DEMO_EMIT_INTERVAL, DemoUpstreamFactory};
pub use null::NullUpstreamFactory;
