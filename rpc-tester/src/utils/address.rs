use std::net::{IpAddr, SocketAddr, ToSocketAddrs as _};

use rama::error::{BoxError, ErrorContext as _, ErrorExt as _};

/// Resolve a `--listen` / `--connect` value.
///
/// Accepts `ip:port`, a bare ip or a host name, the latter two combined
/// with `default_port`.
pub fn resolve_address(input: &str, default_port: u16) -> Result<SocketAddr, BoxError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(BoxError::from("empty address"));
    }
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let unbracketed = input
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(input);
    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let resolved = match input.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => input.to_socket_addrs(),
        _ => (input, default_port).to_socket_addrs(),
    }
    .context("resolve address")
    .context_str_field("address", input)?;

    resolved.into_iter().next().ok_or_else(|| {
        BoxError::from("address did not resolve to any socket address")
            .context_str_field("address", input)
    })
}
