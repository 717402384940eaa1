//! systemctl-backed service manager control
//!
//! Each call runs `systemctl` as a child process and is bounded by the
//! caller's timeout. A call that times out is killed and reported as
//! [`BackendError::Timeout`]; the unit is left in whatever state systemd
//! reached.

use std::time::Duration;

use tokio::process::Command;

use super::{BackendError, ServiceManager};

/// Which systemd instance to talk to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SystemdMode {
    #[default]
    System,
    User,
}

/// Timeout for queries that do not change unit state
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Systemctl {
    mode: SystemdMode,
    binary: String,
}

impl Systemctl {
    pub fn new(mode: SystemdMode) -> Self {
        Self {
            mode,
            binary: "systemctl".to_string(),
        }
    }

    /// Use a different systemctl binary (e.g., for tests)
    pub fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<String, BackendError> {
        let mut cmd = Command::new(&self.binary);
        if self.mode == SystemdMode::User {
            cmd.arg("--user");
        }
        cmd.args(args).kill_on_drop(true);

        let command = format!("{} {}", self.binary, args.join(" "));
        log::debug!("Running {}", command);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackendError::Timeout {
                    unit: args.last().copied().unwrap_or_default().to_string(),
                    timeout,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Command {
                command,
                detail: format!("{} ({})", stderr.trim(), output.status),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for Systemctl {
    fn default() -> Self {
        Self::new(SystemdMode::System)
    }
}

impl ServiceManager for Systemctl {
    async fn restart(&self, unit: &str, timeout: Duration) -> Result<(), BackendError> {
        self.run(&["restart", unit], timeout).await.map(|_| ())
    }

    async fn stop(&self, unit: &str, timeout: Duration) -> Result<(), BackendError> {
        self.run(&["stop", unit], timeout).await.map(|_| ())
    }

    async fn version(&self) -> Result<u32, BackendError> {
        let out = self.run(&["--version"], QUERY_TIMEOUT).await?;
        parse_version(&out)
    }
}

/// Parse the output of `systemctl --version`
/// e.g., "systemd 249 (249.11-0ubuntu3.12)\n+PAM +AUDIT ..." -> 249
pub fn parse_version(output: &str) -> Result<u32, BackendError> {
    let first = output.lines().next().unwrap_or_default();
    let mut fields = first.split_whitespace();

    match (fields.next(), fields.next()) {
        (Some("systemd"), Some(version)) => version
            .parse()
            .map_err(|_| BackendError::Other(format!("cannot parse systemd version {:?}", version))),
        _ => Err(BackendError::Other(format!(
            "cannot parse systemd version from {:?}",
            first
        ))),
    }
}
