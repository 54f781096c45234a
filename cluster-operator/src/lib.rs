pub mod cache;
pub mod children;
pub mod cloud;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod finalizer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;
pub mod queue;
pub mod reconciler;
pub mod scanner;
pub mod util;
