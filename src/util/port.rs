//! Local forward-port selection
//!
//! Workers tunnel back to the master over two adjacent local ports
//! (master port and master port + 1), so both must be free. Concurrent
//! orchestrators on the same workstation each step past the other's pair.

use anyhow::{bail, Result};
use std::net::TcpListener;

const MAX_PROBES: u16 = 64;

/// Find the first free pair (port, port + 1) at or above `start`,
/// stepping by two like the probe order other orchestrators use.
pub fn first_free_port_pair(start: u16) -> Result<u16> {
    let mut port = start;
    for _ in 0..MAX_PROBES {
        let Some(second) = port.checked_add(1) else {
            break;
        };
        if bindable(port) && bindable(second) {
            return Ok(port);
        }
        port = match port.checked_add(2) {
            Some(p) => p,
            None => break,
        };
    }
    bail!(
        "no free local port pair found in range {}-{}",
        start,
        port
    )
}

fn bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
