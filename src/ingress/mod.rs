//! Ingress - feeds that push received records into the dispatcher
//!
//! Records reach the dispatcher through an mpsc channel consumed by
//! `pipeline::source::ChannelSource`.

pub mod jsonl_feed;

pub use jsonl_feed::{run_feed, FeedStart, FeedStats, JsonlFeed};
