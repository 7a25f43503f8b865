use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use itertools::Itertools;
use tracing::debug;

use crate::error::Error;

/// Host to listen on when none is given.
pub const DEFAULT_LISTEN_ADDRESS: &str = "localhost";

/// Port to listen on when none is given.
pub const DEFAULT_LISTEN_PORT: u16 = 8501;

/// Split a listen specification of the form `[host][:port]` into its parts.
///
/// IPv6 literals with a port must be bracketed, as in `[::1]:8501`.
/// A bare IPv6 literal such as `::1` is taken to be all host.
pub fn parse_listen(spec: &str) -> Result<(Option<String>, Option<u16>), Error> {
    let spec = spec.trim();
    let bad = |problem: &str| {
        Error::InvalidConfiguration(format!("Listen address `{spec}`: {problem}"))
    };

    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| bad("the port is not a number from 0 to 65535"))
    };

    let host = |host: &str| (!host.is_empty()).then(|| host.to_string());

    if let Some(bracketed) = spec.strip_prefix('[') {
        let Some((address, rest)) = bracketed.split_once(']') else {
            return Err(bad("missing `]`"));
        };

        return match rest {
            "" => Ok((host(address), None)),
            rest => match rest.strip_prefix(':') {
                Some(port) => Ok((host(address), Some(parse_port(port)?))),
                None => Err(bad("expected `:port` after `]`")),
            },
        };
    }

    match spec.matches(':').count() {
        0 => Ok((host(spec), None)),
        1 => {
            let (address, port) = spec.split_once(':').unwrap_or((spec, ""));
            Ok((host(address), Some(parse_port(port)?)))
        }
        _ => Ok((host(spec), None)),
    }
}

/// True for the host names meaning "every interface".
pub fn is_wildcard(host: &str) -> bool {
    matches!(host.trim(), "" | "*" | "any")
}

/// Resolve a host and port to socket addresses, in resolver order.
/// Wildcard hosts give the unspecified address of both families.
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
    if is_wildcard(host) {
        return Ok(vec![
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        ]);
    }

    let resolved = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::io(format!("Resolving `{host}`"), e))?
        .collect::<Vec<_>>();
    debug!(host, ?resolved, "Resolved");

    Ok(resolved)
}

/// Pick which of the resolved addresses to bind.
///
/// Duplicates are dropped.
/// If any address is unspecified (a wildcard) only those are kept, one per family.
/// Otherwise the first address of each family is kept.
pub fn select_binds(resolved: &[SocketAddr]) -> Vec<SocketAddr> {
    let any_wildcard = resolved.iter().any(|address| address.ip().is_unspecified());

    resolved
        .iter()
        .copied()
        .unique()
        .filter(|address| !any_wildcard || address.ip().is_unspecified())
        .unique_by(SocketAddr::is_ipv4)
        .collect()
}

/// The addresses to listen on for a host and port.
pub fn listen_addresses(host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
    let selected = select_binds(&resolve(host, port)?);

    if selected.is_empty() {
        return Err(Error::NoListener(format!("{host}:{port}")));
    }

    Ok(selected)
}
