#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Building blocks shared by every netlab crate: the [`Platform`] value selected once at process
//! start, the per-topology [`Registry`] of counters and once-only checks, and the fixed-delay
//! [`Retry`] policy used for known-transient OS races.

pub mod platform;
pub mod registry;
pub mod retry;

pub use platform::Platform;
pub use registry::Registry;
pub use retry::{Retry, RetryError};
