//! Best-effort OS detection after connect.

use std::time::Duration;

use super::{ExecRequest, SshClient, SshError};
use crate::assets::OsType;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Detected OS information.
#[derive(Debug, Clone, Default)]
pub struct OsInfo {
    pub os_type: OsType,
    pub os_version: Option<String>,
}

/// Probe the remote host's OS. Failures are reported, never fatal;
/// callers treat any error as "unknown".
pub async fn detect_os(client: &mut SshClient) -> Result<OsInfo, SshError> {
    let uname = client
        .exec(&ExecRequest::new("uname -s", PROBE_TIMEOUT), |_, _| {})
        .await?;

    let kernel = uname.stdout.trim().to_lowercase();
    let os_type = if kernel.contains("linux") {
        OsType::Linux
    } else if kernel.contains("darwin") {
        OsType::Macos
    } else if !uname.exit.is_success() || kernel.is_empty() {
        // uname missing entirely usually means a Windows SSH server.
        OsType::Windows
    } else {
        OsType::Unknown
    };

    let os_version = match os_type {
        OsType::Linux => {
            let release = client
                .exec(
                    &ExecRequest::new("cat /etc/os-release", PROBE_TIMEOUT),
                    |_, _| {},
                )
                .await?;
            parse_pretty_name(&release.stdout)
        }
        OsType::Macos => {
            let version = client
                .exec(&ExecRequest::new("sw_vers -productVersion", PROBE_TIMEOUT), |_, _| {})
                .await?;
            let v = version.stdout.trim();
            (!v.is_empty()).then(|| format!("macOS {v}"))
        }
        _ => None,
    };

    Ok(OsInfo {
        os_type,
        os_version,
    })
}

fn parse_pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}
