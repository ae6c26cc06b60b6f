//! Host port allocation for container backends.

use anyhow::{anyhow, Result};
use rand::Rng;
use std::net::TcpListener;

/// IANA ephemeral port range.
const RANGE_START: u16 = 49152;
const RANGE_END: u16 = 65535;

/// Bind attempts before giving up.
const MAX_ATTEMPTS: u32 = 32;

/// Find an unused TCP port on `ip` in the ephemeral range.
///
/// Picks a uniformly random starting port and probe-binds, advancing by one
/// (wrapping at the range boundary) on each failure. The probe socket is
/// closed as soon as the bind succeeds, so there is an inherent window in
/// which another process can claim the port before the container runtime
/// binds it; callers must tolerate the resulting bind failure.
pub fn find_open_port(ip: &str) -> Result<u16> {
    let mut port = rand::thread_rng().gen_range(RANGE_START..=RANGE_END);

    for _ in 0..MAX_ATTEMPTS {
        match TcpListener::bind((ip, port)) {
            Ok(listener) => {
                drop(listener);
                return Ok(port);
            }
            Err(_) => {
                port = if port == RANGE_END { RANGE_START } else { port + 1 };
            }
        }
    }

    Err(anyhow!(
        "could not find an open port on {} after {} attempts",
        ip,
        MAX_ATTEMPTS
    ))
}
