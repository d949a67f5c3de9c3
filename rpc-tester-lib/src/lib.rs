#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

pub mod codec;
pub mod config;
pub mod driver;
pub mod job;
pub mod protocol;
pub mod report;
pub mod sched;
pub mod shard;
pub mod stats;
pub mod utils;
