pub const fn project_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

/// Number of shards to run when none is configured.
///
/// `RPC_TESTER_SHARDS` overrides the default of one shard per available core.
pub fn default_shard_count() -> usize {
    std::env::var("RPC_TESTER_SHARDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&n: &usize| n > 0)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}
