//! Asset data models.

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::security::SudoMethod;

/// Operating system family of a remote host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Windows,
    Macos,
    #[default]
    Unknown,
}

impl std::fmt::Display for OsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsType::Linux => write!(f, "linux"),
            OsType::Windows => write!(f, "windows"),
            OsType::Macos => write!(f, "macos"),
            OsType::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for OsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(OsType::Linux),
            "windows" => Ok(OsType::Windows),
            "macos" | "darwin" => Ok(OsType::Macos),
            "unknown" => Ok(OsType::Unknown),
            other => Err(format!("unknown os type: {other}")),
        }
    }
}

impl TryFrom<String> for OsType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A remote host reachable by SSH.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Asset {
    pub id: String,
    pub hostname: String,
    pub ip_address: Option<String>,
    #[sqlx(try_from = "String")]
    pub os_type: OsType,
    pub os_version: Option<String>,
    pub ssh_port: i64,
    pub ssh_username: Option<String>,
    /// Password credential. Never serialized out through the API.
    #[serde(skip_serializing)]
    pub ssh_password: Option<String>,
    /// PEM-encoded private key credential. Never serialized out.
    #[serde(skip_serializing)]
    pub ssh_key: Option<String>,
    /// Pinned server host-key fingerprint (trust-on-first-use).
    pub pinned_fingerprint: Option<String>,
    pub sudo_method: Option<String>,
    #[serde(skip_serializing)]
    pub sudo_password: Option<String>,
    pub tags: Json<Vec<String>>,
    pub created_at: String,
    pub updated_at: String,
    pub last_seen: Option<String>,
}

impl Asset {
    /// Parsed sudo method, ignoring unrecognized stored values.
    pub fn sudo(&self) -> Option<SudoMethod> {
        self.sudo_method.as_deref().and_then(|m| m.parse().ok())
    }

    /// The password piped to `sudo -S`, according to the sudo method.
    pub fn sudo_password_for_policy(&self) -> Option<String> {
        match self.sudo()? {
            SudoMethod::Nopasswd => None,
            SudoMethod::ReuseSshPassword => self.ssh_password.clone(),
            SudoMethod::CustomPassword => self.sudo_password.clone(),
        }
    }
}

/// Request body for creating an asset.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAssetRequest {
    pub hostname: String,
    pub ip_address: Option<String>,
    #[serde(default)]
    pub os_type: OsType,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: i64,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_key: Option<String>,
    pub sudo_method: Option<String>,
    pub sudo_password: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_ssh_port() -> i64 {
    22
}

/// Request body for patching an asset. All fields optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatchAssetRequest {
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub os_type: Option<OsType>,
    pub ssh_port: Option<i64>,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_key: Option<String>,
    pub sudo_method: Option<String>,
    pub sudo_password: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_type_round_trips() {
        assert_eq!("linux".parse::<OsType>().unwrap(), OsType::Linux);
        assert_eq!("darwin".parse::<OsType>().unwrap(), OsType::Macos);
        assert!("beos".parse::<OsType>().is_err());
        assert_eq!(OsType::Windows.to_string(), "windows");
    }

    #[test]
    fn sudo_password_follows_method() {
        let mut asset = Asset {
            id: "a1".into(),
            hostname: "h".into(),
            ip_address: None,
            os_type: OsType::Linux,
            os_version: None,
            ssh_port: 22,
            ssh_username: Some("root".into()),
            ssh_password: Some("ssh-pw".into()),
            ssh_key: None,
            pinned_fingerprint: None,
            sudo_method: Some("reuse_ssh_password".into()),
            sudo_password: Some("sudo-pw".into()),
            tags: Json(vec![]),
            created_at: String::new(),
            updated_at: String::new(),
            last_seen: None,
        };
        assert_eq!(asset.sudo_password_for_policy().as_deref(), Some("ssh-pw"));

        asset.sudo_method = Some("custom_password".into());
        assert_eq!(asset.sudo_password_for_policy().as_deref(), Some("sudo-pw"));

        asset.sudo_method = Some("nopasswd".into());
        assert_eq!(asset.sudo_password_for_policy(), None);

        asset.sudo_method = None;
        assert_eq!(asset.sudo_password_for_policy(), None);
    }
}
