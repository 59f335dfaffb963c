//! Guest address discovery.
//!
//! Two independent strategies: the hypervisor's guest-tools query
//! (authoritative, potentially very slow — see [`crate::hypervisor::Vmrun::guest_ip`])
//! and a direct scan of the host's DHCP lease file keyed by the hardware
//! address advertised in the VM descriptor. The lease scan distinguishes
//! "no lease yet" from real I/O errors so callers can poll.

use std::path::Path;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;

use crate::error::DrifterError;

/// Port probed for login reachability.
pub const LOGIN_PORT: u16 = 22;

/// Default window for the reachability gate when no deadline is given.
pub const DEFAULT_REACHABILITY_WINDOW: Duration = Duration::from_secs(30);

const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Extract the generated hardware address from a VM descriptor file.
pub fn mac_addr_from_vmx(vmx: &Path) -> Result<String, DrifterError> {
    let contents = std::fs::read_to_string(vmx).map_err(|e| DrifterError::Io {
        context: format!("reading descriptor {}", vmx.display()),
        source: e,
    })?;
    mac_addr_in(&contents).ok_or_else(|| DrifterError::Validation {
        message: format!("no hardware address found in descriptor {}", vmx.display()),
    })
}

fn mac_addr_in(contents: &str) -> Option<String> {
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        // Exact key match: `ethernet0.generatedAddressOffset` also shares
        // the prefix and must not win.
        if key.trim() == "ethernet0.generatedAddress" {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

/// Scan lease records for the most recent block held by `mac_addr`.
/// Later records shadow earlier ones, so the whole file is read and the
/// last match wins. No match is the distinguished `AddressUnassigned`.
pub fn find_lease(contents: &str, mac_addr: &str) -> Result<String, DrifterError> {
    let mut ip_addr = None;
    let mut lines = contents.lines();
    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        // lease 192.168.254.169 {
        let Some(rest) = line.strip_prefix("lease ") else {
            continue;
        };
        let lease_ip = rest.split_whitespace().next().unwrap_or("");
        for inner in lines.by_ref() {
            let inner = inner.trim();
            // hardware ethernet 00:0c:29:ff:94:8f;
            if let Some(hw) = inner.strip_prefix("hardware ethernet ") {
                if hw.trim_end_matches(';').eq_ignore_ascii_case(mac_addr) {
                    ip_addr = Some(lease_ip.to_string());
                }
            } else if inner == "}" {
                break;
            }
        }
    }
    ip_addr.ok_or_else(|| DrifterError::AddressUnassigned {
        mac_addr: mac_addr.to_string(),
    })
}

/// Poll the lease file until an address shows up or the deadline passes.
/// The unassigned condition usually just means the hypervisor has not
/// finished its internal allocation yet.
pub async fn ip_from_lease_file(
    lease_file: &Path,
    mac_addr: &str,
    deadline: Option<Instant>,
) -> Result<String, DrifterError> {
    loop {
        let contents =
            tokio::fs::read_to_string(lease_file)
                .await
                .map_err(|e| DrifterError::Io {
                    context: format!("reading lease file {}", lease_file.display()),
                    source: e,
                })?;
        match find_lease(&contents, mac_addr) {
            Ok(ip_addr) => return Ok(ip_addr),
            Err(err @ DrifterError::AddressUnassigned { .. }) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(err);
                }
                tokio::time::sleep(LEASE_POLL_INTERVAL).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Probe TCP reachability on `port` at one-second attempt granularity
/// until the deadline. A successful connect only proves a listener is
/// up, not that the login service will authenticate; callers treat a
/// timeout as "try another strategy", not hard failure.
pub async fn wait_for_reachable(ip_addr: &str, port: u16, deadline: Option<Instant>) -> bool {
    let deadline = deadline.unwrap_or_else(|| Instant::now() + DEFAULT_REACHABILITY_WINDOW);
    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Waiting for login service on {ip_addr}:{port}..."));
    spinner.enable_steady_tick(Duration::from_millis(120));

    while Instant::now() < deadline {
        let attempt = tokio::time::timeout(
            Duration::from_secs(1),
            tokio::net::TcpStream::connect((ip_addr, port)),
        )
        .await;
        if matches!(attempt, Ok(Ok(_))) {
            spinner.finish_and_clear();
            return true;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    spinner.finish_and_clear();
    false
}
