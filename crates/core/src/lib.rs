#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models and pure logic for the content factory.

pub mod api;
pub mod feedback;
pub mod model;
pub mod policy;
pub mod retry;
pub mod schedule;

mod util;

pub use util::{new_ulid, now_ms, srt_timestamp, topic_slug};
