//! TCP port conflict resolution
//!
//! Availability is observed through the OS, never owned by this process, so
//! the discipline is advisory: probe immediately before acting and accept a
//! best-effort race window. Killing a port's owner requires explicit caller
//! confirmation, and the owner's identity is re-validated immediately before
//! every signal so a process that grabbed the port in the meantime is never
//! signaled by mistake.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::config::PortsConfig;
use crate::error::{WardenError, WardenResult};
use crate::exec;

/// Process found listening on a port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortOwner {
    pub pid: i32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Result of probing one port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortStatus {
    pub port: u16,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<PortOwner>,
}

/// Result of a kill request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum KillOutcome {
    /// Port was not busy; nothing to do.
    NotBusy,
    /// Caller did not confirm; owner reported, no signal sent.
    NotConfirmed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<PortOwner>,
    },
    /// Port released after signaling.
    Released { pid: i32, forced: bool },
    /// Owner changed between probe and signal; escalation abandoned.
    OwnerChanged {
        expected_pid: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current: Option<PortOwner>,
    },
    /// Signals sent but the port is still bound.
    StillBound { pid: i32 },
}

static PORT_FLAG_EQ: Lazy<Regex> = Lazy::new(|| Regex::new(r"--port=\d+").unwrap());
static PORT_FLAG_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"--port\s+\d+").unwrap());
static PORT_SHORT_FLAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|\s)-p\s+\d+").unwrap());
static PORT_ENV: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bPORT=\d+").unwrap());

pub struct PortResourceManager {
    config: PortsConfig,
}

impl PortResourceManager {
    pub fn new(config: PortsConfig) -> Self {
        Self { config }
    }

    /// Connect-and-immediately-close probe: an accepted connection means
    /// busy, a refusal (or probe timeout) means available.
    pub async fn check_port(&self, port: u16) -> WardenResult<PortStatus> {
        let busy = self.probe(port).await;
        let owner = if busy { self.owner_of(port).await } else { None };
        Ok(PortStatus {
            port,
            available: !busy,
            owner,
        })
    }

    async fn probe(&self, port: u16) -> bool {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        matches!(
            timeout(
                Duration::from_millis(self.config.probe_timeout_ms),
                TcpStream::connect(addr),
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Platform process-table lookup via lsof. Best effort: None when the
    /// tool is unavailable or the owner cannot be determined.
    pub async fn owner_of(&self, port: u16) -> Option<PortOwner> {
        let out = exec::run_program(
            "lsof",
            &["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN"],
            None,
            10,
        )
        .await
        .ok()?;
        if !out.success {
            return None;
        }
        // lsof header then one row per listener: COMMAND PID USER ...
        let row = out.stdout.lines().nth(1)?;
        let mut fields = row.split_whitespace();
        let name = fields.next()?.to_string();
        let pid: i32 = fields.next()?.parse().ok()?;

        let command = exec::run_program("ps", &["-p", &pid.to_string(), "-o", "args="], None, 10)
            .await
            .ok()
            .filter(|o| o.success)
            .map(|o| o.stdout.trim().to_string())
            .filter(|s| !s.is_empty());

        Some(PortOwner { pid, name, command })
    }

    /// Try the preferred port, then the common-ports list, then a range
    /// scan; first available wins. Excluded ports are skipped everywhere.
    pub async fn find_available(&self, preferred: u16, excluded: &[u16]) -> WardenResult<u16> {
        let mut candidates: Vec<u16> = Vec::new();
        candidates.push(preferred);
        candidates.extend(&self.config.common_ports);
        candidates.extend(self.config.scan_start..=self.config.scan_end);

        let mut seen = std::collections::HashSet::new();
        for port in candidates {
            if excluded.contains(&port) || !seen.insert(port) {
                continue;
            }
            if !self.probe(port).await {
                return Ok(port);
            }
        }
        Err(WardenError::Port(format!(
            "no available port found near {}",
            preferred
        )))
    }

    /// Terminate whatever listens on `port`, only when `confirmed`. SIGTERM
    /// first, a grace period, then SIGKILL if the *same* pid still owns the
    /// port; finally re-probe to confirm release.
    pub async fn kill_on_port(&self, port: u16, confirmed: bool) -> WardenResult<KillOutcome> {
        if !self.probe(port).await {
            return Ok(KillOutcome::NotBusy);
        }
        let owner = self.owner_of(port).await;
        if !confirmed {
            log::info!("[Ports] kill on {} not confirmed, reporting owner only", port);
            return Ok(KillOutcome::NotConfirmed { owner });
        }
        let owner = owner.ok_or_else(|| {
            WardenError::Port(format!("port {} is busy but its owner is unknown", port))
        })?;

        log::info!(
            "[Ports] sending SIGTERM to {} (pid {}) on port {}",
            owner.name,
            owner.pid,
            port
        );
        signal(owner.pid, libc::SIGTERM)?;
        tokio::time::sleep(Duration::from_millis(self.config.grace_period_ms)).await;

        if !self.probe(port).await {
            return Ok(KillOutcome::Released {
                pid: owner.pid,
                forced: false,
            });
        }

        // Identity re-validation before escalating: if a different process
        // took the port during the grace period, do not signal it.
        match self.owner_of(port).await {
            Some(current) if current.pid == owner.pid => {
                log::warn!("[Ports] pid {} survived SIGTERM, escalating to SIGKILL", owner.pid);
                signal(owner.pid, libc::SIGKILL)?;
                tokio::time::sleep(Duration::from_millis(self.config.grace_period_ms / 3)).await;
                if self.probe(port).await {
                    Ok(KillOutcome::StillBound { pid: owner.pid })
                } else {
                    Ok(KillOutcome::Released {
                        pid: owner.pid,
                        forced: true,
                    })
                }
            }
            current => Ok(KillOutcome::OwnerChanged {
                expected_pid: owner.pid,
                current,
            }),
        }
    }

    /// Rewrite a server-start command onto another port. Targeted
    /// substitution over `--port=N`, `--port N`, `-p N` and `PORT=N`; a
    /// command with no port token is returned unchanged.
    pub fn rewrite_port(&self, command: &str, new_port: u16) -> String {
        let mut rewritten = command.to_string();
        if PORT_FLAG_EQ.is_match(&rewritten) {
            rewritten = PORT_FLAG_EQ
                .replace_all(&rewritten, format!("--port={}", new_port).as_str())
                .into_owned();
        } else if PORT_FLAG_SPACE.is_match(&rewritten) {
            rewritten = PORT_FLAG_SPACE
                .replace_all(&rewritten, format!("--port {}", new_port).as_str())
                .into_owned();
        } else if PORT_SHORT_FLAG.is_match(&rewritten) {
            rewritten = PORT_SHORT_FLAG
                .replace_all(&rewritten, |caps: &regex::Captures| {
                    format!("{}-p {}", &caps[1], new_port)
                })
                .into_owned();
        }
        if PORT_ENV.is_match(&rewritten) {
            rewritten = PORT_ENV
                .replace_all(&rewritten, format!("PORT={}", new_port).as_str())
                .into_owned();
        }
        rewritten
    }

    /// First port token found in a command, if any.
    pub fn embedded_port(&self, command: &str) -> Option<u16> {
        static TOKEN: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?:--port[= ]|(?:^|\s)-p\s+|\bPORT=)(\d{2,5})").unwrap());
        TOKEN
            .captures(command)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

fn signal(pid: i32, sig: i32) -> WardenResult<()> {
    // Safety: plain kill(2) call; the pid was read from the process table.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(WardenError::Port(format!(
            "kill({}, {}) failed: {}",
            pid,
            sig,
            std::io::Error::last_os_error()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn manager() -> PortResourceManager {
        PortResourceManager::new(PortsConfig::default())
    }

    #[tokio::test]
    async fn probe_is_idempotent_and_tracks_binding() {
        let manager = manager();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let first = manager.check_port(port).await.unwrap();
        let second = manager.check_port(port).await.unwrap();
        assert!(!first.available);
        assert_eq!(first.available, second.available);

        drop(listener);
        // Give the OS a moment to release the socket.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = manager.check_port(port).await.unwrap();
        assert!(after.available);
    }

    #[tokio::test]
    async fn find_available_skips_busy_and_excluded_ports() {
        let manager = manager();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = listener.local_addr().unwrap().port();

        let picked = manager.find_available(busy, &[]).await.unwrap();
        assert_ne!(picked, busy);

        let picked2 = manager.find_available(busy, &[picked]).await.unwrap();
        assert_ne!(picked2, busy);
        assert_ne!(picked2, picked);
    }

    #[tokio::test]
    async fn unconfirmed_kill_reports_and_does_not_signal() {
        let manager = manager();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let outcome = manager.kill_on_port(port, false).await.unwrap();
        assert!(matches!(outcome, KillOutcome::NotConfirmed { .. }));
        // Still ours, still busy.
        assert!(!manager.check_port(port).await.unwrap().available);
    }

    #[tokio::test]
    async fn kill_on_free_port_is_a_noop() {
        let manager = manager();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let outcome = manager.kill_on_port(port, true).await.unwrap();
        assert!(matches!(outcome, KillOutcome::NotBusy));
    }

    #[test]
    fn rewrite_covers_each_port_token_shape() {
        let manager = manager();
        assert_eq!(
            manager.rewrite_port("npm start --port 3000", 3005),
            "npm start --port 3005"
        );
        assert_eq!(
            manager.rewrite_port("serve --port=3000", 3005),
            "serve --port=3005"
        );
        assert_eq!(
            manager.rewrite_port("http-server -p 3000 dist", 3005),
            "http-server -p 3005 dist"
        );
        assert_eq!(
            manager.rewrite_port("PORT=3000 node server.js", 3005),
            "PORT=3005 node server.js"
        );
        assert_eq!(manager.rewrite_port("cargo test", 3005), "cargo test");
    }

    #[test]
    fn embedded_port_extraction() {
        let manager = manager();
        assert_eq!(manager.embedded_port("serve --port 8080"), Some(8080));
        assert_eq!(manager.embedded_port("serve --port=8080"), Some(8080));
        assert_eq!(manager.embedded_port("PORT=3000 node x"), Some(3000));
        assert_eq!(manager.embedded_port("ls -la"), None);
    }
}
