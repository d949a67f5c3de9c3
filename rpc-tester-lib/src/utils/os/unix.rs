use std::io;

use rama::telemetry::tracing;

pub use libc::rlim_t;

/// Descriptors held by one shard: its listener, the outgoing client
/// connection, an accepted peer connection and the poll and wake-up
/// descriptors of its runtime.
const SHARD_NOFILE: rlim_t = 5;

/// Descriptors of the process itself (stdio, log file, main runtime).
const PROCESS_NOFILE: rlim_t = 16;

/// Open file descriptor limits of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NofileLimit {
    pub soft: rlim_t,
    pub hard: rlim_t,
}

/// Least amount of descriptors needed to run `shards` shards.
pub fn required_nofile(shards: usize) -> rlim_t {
    let shards = rlim_t::try_from(shards).unwrap_or(rlim_t::MAX);
    shards
        .saturating_mul(SHARD_NOFILE)
        .saturating_add(PROCESS_NOFILE)
}

pub fn nofile_limit() -> io::Result<NofileLimit> {
    // SAFETY: getrlimit only writes into the provided, fully owned struct
    let mut lim: libc::rlimit = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(NofileLimit {
        soft: lim.rlim_cur,
        hard: lim.rlim_max,
    })
}

/// Raise the soft limit of open file descriptors towards `target`,
/// capped by the hard limit. Returns the limits now in effect.
pub fn raise_nofile(target: rlim_t) -> io::Result<NofileLimit> {
    let current = nofile_limit()?;
    let soft = target.min(current.hard);
    if current.soft >= soft {
        tracing::debug!(
            ulimit.soft = current.soft,
            ulimit.requested = target,
            "ulimit: keep current soft limit",
        );
        return Ok(current);
    }

    let lim = libc::rlimit {
        rlim_cur: soft,
        rlim_max: current.hard,
    };
    // SAFETY: setrlimit only reads the provided struct
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    tracing::info!(
        ulimit.soft = soft,
        ulimit.previous = current.soft,
        "ulimit: soft limit raised",
    );

    Ok(NofileLimit {
        soft,
        hard: current.hard,
    })
}
