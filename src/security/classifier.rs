//! Classifies shell commands before they reach the remote host.
//!
//! Three classes: SAFE commands run unattended, SUSPECT commands need the
//! analyst's explicit approval, BLOCKED commands never reach the wire.
//! Classification happens on our side; the remote SSH account's own
//! permissions are the only other enforcement layer.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

/// Maximum command length in bytes.
pub const MAX_COMMAND_LENGTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandClass {
    Safe,
    Suspect,
    Blocked,
}

static BLOCKED: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        // Destructive filesystem
        r"(?i)\brm\s+-[rRf]",
        r"(?i)\bmkfs\b",
        r"(?i)\bdd\b.*\bof=/dev/",
        r"(?i)\bshred\b",
        r"(?i)\bwipefs\b",
        // Privilege escalation tampering
        r"(?i)chmod\s+[0-7]*7[0-7]*\s+/etc/(sudoers|shadow|passwd)",
        r"(?i)\bvisudo\b",
        // Pipe-to-shell download execution
        r"(?i)\b(curl|wget)\b.*\|\s*(ba)?sh\b",
        // Fork bomb
        r"(?i):\(\)\s*\{.*:\|:&\s*\}",
        // Reverse shells
        r"(?i)bash\s+-i\s+>(&|\|)\s*/dev/tcp/",
        r"(?i)/dev/(tcp|udp)/\d",
        r"(?i)\bnc(at)?\b.*-e\s+/bin/(ba)?sh",
        r"(?i)\bsocat\b.*\bexec\b",
        // History / log tampering
        r"(?i)\bhistory\s+-[cdw]",
        r"(?i)\bunset\s+HIST(FILE|SIZE)\b",
        r"(?i)>\s*/var/log/",
        r"(?i)\b(rm|truncate)\b.*\b/var/log/",
        // Kernel module loading
        r"(?i)\b(insmod|modprobe)\b",
        // Crypto miners
        r"(?i)\b(xmrig|minerd)\b",
        r"(?i)stratum\+tcp://",
    ])
    .expect("blocked pattern set")
});

static SUSPECT: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\bchmod\b",
        r"(?i)\bchown\b",
        r"(?i)\bchattr\b",
        r"(?i)\bpasswd\b",
        r"(?i)\buser(add|mod|del)\b",
        r"(?i)\b(iptables|nftables|ufw)\b",
        r"(?i)\bcrontab\s+-[er]\b",
        r"(?i)\bsystemctl\s+(start|stop|disable|enable|mask)\b",
        r"(?i)\b(scp|rsync)\b",
        r"(?i)\b(nc|netcat|ncat)\b",
        r"(?i)\b(kill|killall|pkill)\b",
        r"(?i)\b(mount|umount)\b",
        r"(?i)\bsetenforce\b",
    ])
    .expect("suspect pattern set")
});

/// Read-only / forensic command prefixes that run unattended.
static SAFE_PREFIXES: &[&str] = &[
    "ls", "cat", "less", "more", "head", "tail", "find", "locate", "grep", "awk", "sed", "sort",
    "uniq", "wc", "cut", "echo", "ps", "top", "lsof", "netstat", "ss", "ip", "ifconfig", "uname",
    "hostname", "id", "whoami", "w", "who", "last", "lastb", "env", "printenv", "df", "du", "free",
    "uptime", "dmesg", "journalctl", "systemctl list", "systemctl status", "crontab -l", "stat",
    "file", "strings", "md5sum", "sha256sum", "sha1sum", "lsmod", "modinfo", "getent",
    "timedatectl", "hostnamectl", "loginctl", "ausearch", "aureport", "pstree", "docker ps",
    "docker inspect", "sleep", "true",
];

/// Classify a command, returning the class and the matched reason.
pub fn classify_command(command: &str) -> (CommandClass, String) {
    let stripped = command.trim();

    if stripped.is_empty() {
        return (CommandClass::Blocked, "empty command".to_string());
    }
    if stripped.len() > MAX_COMMAND_LENGTH {
        return (
            CommandClass::Blocked,
            format!("command exceeds maximum length ({MAX_COMMAND_LENGTH} bytes)"),
        );
    }

    if let Some(idx) = BLOCKED.matches(stripped).into_iter().next() {
        return (
            CommandClass::Blocked,
            format!("matched blocklist pattern #{idx}"),
        );
    }

    let lower = stripped.to_lowercase();
    for prefix in SAFE_PREFIXES {
        if lower.starts_with(prefix) {
            return (CommandClass::Safe, format!("matches safe prefix: {prefix}"));
        }
    }

    if let Some(idx) = SUSPECT.matches(stripped).into_iter().next() {
        return (
            CommandClass::Suspect,
            format!("matched suspect pattern #{idx}"),
        );
    }

    (
        CommandClass::Suspect,
        "unknown command, requires analyst approval".to_string(),
    )
}

// ── Sudo policy ──────────────────────────────────────────────────────────────

/// How sudo is performed on an asset, per its credential record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SudoMethod {
    /// `sudo -n`: non-interactive, fails if a password would be prompted.
    Nopasswd,
    /// `sudo -S` with the SSH password piped over stdin.
    ReuseSshPassword,
    /// `sudo -S` with a dedicated sudo password piped over stdin.
    CustomPassword,
}

impl std::str::FromStr for SudoMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nopasswd" => Ok(SudoMethod::Nopasswd),
            "reuse_ssh_password" => Ok(SudoMethod::ReuseSshPassword),
            "custom_password" => Ok(SudoMethod::CustomPassword),
            other => Err(format!("unknown sudo method: {other}")),
        }
    }
}

impl std::fmt::Display for SudoMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SudoMethod::Nopasswd => write!(f, "nopasswd"),
            SudoMethod::ReuseSshPassword => write!(f, "reuse_ssh_password"),
            SudoMethod::CustomPassword => write!(f, "custom_password"),
        }
    }
}

/// Decides whether and how sudo is prepended to a hunt step command.
#[derive(Debug, Clone, Copy, Default)]
pub struct SudoPolicy {
    pub method: Option<SudoMethod>,
}

impl SudoPolicy {
    pub fn new(method: Option<SudoMethod>) -> Self {
        Self { method }
    }

    /// Whether this policy pipes a password over stdin.
    pub fn needs_password(&self) -> bool {
        matches!(
            self.method,
            Some(SudoMethod::ReuseSshPassword) | Some(SudoMethod::CustomPassword)
        )
    }

    /// Wrap a command with the appropriate sudo invocation.
    /// Commands already starting with `sudo ` pass through untouched.
    pub fn wrap_command(&self, command: &str, requires_sudo: bool) -> String {
        if !requires_sudo {
            return command.to_string();
        }
        let Some(method) = self.method else {
            return command.to_string();
        };
        if command.trim_start().starts_with("sudo ") {
            return command.to_string();
        }
        match method {
            SudoMethod::Nopasswd => format!("sudo -n {command}"),
            SudoMethod::ReuseSshPassword | SudoMethod::CustomPassword => {
                format!("sudo -S {command}")
            }
        }
    }
}

static SUDO_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\[sudo\] password for \S+:\s*").expect("sudo prompt pattern"));

/// Remove the `[sudo] password for user:` line from captured stderr so it
/// does not pollute hunt observations.
pub fn strip_sudo_prompt(stderr: &str) -> String {
    SUDO_PROMPT
        .replace_all(stderr, "")
        .trim_start_matches('\n')
        .to_string()
}
