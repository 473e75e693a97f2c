//! Test utilities and common setup.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use sqlx::types::Json;

use nighthound::api::{self, AppState, GatewayLimits};
use nighthound::assets::{Asset, AssetRepository, OsType};
use nighthound::auth::{hash_password, AuthConfig, AuthState};
use nighthound::db::Database;
use nighthound::events::EventBus;
use nighthound::hunt::{HuntRepository, HuntScheduler, ModuleRegistry};
use nighthound::intelligence::{FindingStore, TimelineRecorder};
use nighthound::session::{SessionManager, SessionManagerConfig, SessionRepository};
use nighthound::users::{Role, UserRepository};

pub const ADMIN_PASSWORD: &str = "devpassword123";
pub const ANALYST_PASSWORD: &str = "analystpass456";

pub const LINUX_NETWORK_MODULE: &str = r#"---
id: linux_network
name: Linux Network Triage
description: Listening sockets and host file tampering
os_types: [linux]
tags: [network]
severity_hint: medium
---

## Steps

### check_listening_ports
**description**: Enumerate listening sockets
**command**: `ss -tlnpu`
**timeout**: 10
**requires_sudo**: false

### check_hosts_file
**description**: Inspect /etc/hosts
**command**: `cat /etc/hosts`
**timeout**: 5
**requires_sudo**: false
"#;

pub const WINDOWS_PERSISTENCE_MODULE: &str = r#"---
id: windows_persistence
name: Windows Persistence Sweep
description: Run keys and scheduled tasks
os_types: [windows]
tags: [persistence]
severity_hint: high
---

## Steps

### check_run_keys
**description**: Enumerate Run keys
**command**: `reg query HKLM\Software\Microsoft\Windows\CurrentVersion\Run`
**timeout**: 15
**requires_sudo**: false
"#;

/// Everything an API test needs.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub admin_token: String,
    pub analyst_token: String,
    pub modules_dir: PathBuf,
}

fn test_auth_config() -> AuthConfig {
    AuthConfig {
        jwt_secret: "test-secret-for-integration-tests-minimum-32-chars".to_string(),
        ..Default::default()
    }
}

/// Write the default test module files into a fresh temp directory.
pub fn test_modules_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("nh-test-modules-{}", uuid_suffix()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("linux_network.md"), LINUX_NETWORK_MODULE).unwrap();
    std::fs::write(dir.join("windows_persistence.md"), WINDOWS_PERSISTENCE_MODULE).unwrap();
    dir
}

fn uuid_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Create a test application with all services wired to an in-memory DB.
pub async fn test_app() -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let bus = Arc::new(EventBus::new());
    let auth = AuthState::new(&test_auth_config());

    let users = UserRepository::new(db.pool().clone());
    users
        .create("dev", &hash_password(ADMIN_PASSWORD).unwrap(), Role::Admin)
        .await
        .unwrap();
    users
        .create(
            "analyst",
            &hash_password(ANALYST_PASSWORD).unwrap(),
            Role::Analyst,
        )
        .await
        .unwrap();

    let admin_token = auth.create_access_token("dev", Role::Admin).unwrap();
    let analyst_token = auth.create_access_token("analyst", Role::Analyst).unwrap();

    let assets = AssetRepository::new(db.pool().clone());
    let sessions = SessionRepository::new(db.pool().clone());
    let hunts = HuntRepository::new(db.pool().clone());
    let findings = FindingStore::new(db.pool().clone());
    let timeline = TimelineRecorder::new(db.pool().clone(), bus.clone());

    let modules_dir = test_modules_dir();
    let modules = Arc::new(ModuleRegistry::new(&modules_dir));

    let scheduler = Arc::new(HuntScheduler::new(
        bus.clone(),
        hunts.clone(),
        timeline.clone(),
        modules.clone(),
        None,
        1,
    ));

    let manager = Arc::new(SessionManager::new(
        bus.clone(),
        sessions.clone(),
        assets.clone(),
        timeline.clone(),
        SessionManagerConfig::default(),
    ));

    let state = AppState {
        bus,
        auth,
        users,
        assets,
        sessions,
        manager,
        modules,
        scheduler,
        hunts,
        findings,
        timeline,
        limits: GatewayLimits::default(),
    };

    TestApp {
        router: api::create_router(state.clone()),
        state,
        admin_token,
        analyst_token,
        modules_dir,
    }
}

/// A linux asset record pointing at an address nothing listens on.
pub fn sample_asset(id: &str) -> Asset {
    Asset {
        id: id.to_string(),
        hostname: "test-host".to_string(),
        ip_address: Some("192.0.2.10".to_string()),
        os_type: OsType::Linux,
        os_version: None,
        ssh_port: 22,
        ssh_username: Some("root".to_string()),
        ssh_password: Some("hunter2".to_string()),
        ssh_key: None,
        pinned_fingerprint: None,
        sudo_method: None,
        sudo_password: None,
        tags: Json(vec![]),
        created_at: String::new(),
        updated_at: String::new(),
        last_seen: None,
    }
}
