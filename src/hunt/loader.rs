//! Hunt module loading from markdown spec files.
//!
//! A module file is YAML-like front-matter (id, name, description,
//! os_types, tags, severity_hint) followed by one `### step_id` section per
//! step with labelled fields. Section order is execution order. The
//! registry reloads when the directory or any loaded file changes on disk.

use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use crate::assets::OsType;

use super::models::{HuntModule, HuntStep};

static FIELD_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*(\w+)\*\*\s*:\s*(.*)").expect("field pattern"));

/// Split front-matter (between `---` markers) from the body.
fn parse_front_matter(content: &str) -> (HashMap<String, String>, &str) {
    let mut fields = HashMap::new();
    let Some(rest) = content.strip_prefix("---") else {
        return (fields, content);
    };
    let Some(end) = rest.find("\n---") else {
        return (fields, content);
    };

    for line in rest[..end].lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        fields.insert(key.trim().to_string(), value.trim().to_string());
    }

    (fields, &rest[end + 4..])
}

/// Parse a front-matter list value: `[a, b]` or comma-separated.
fn parse_list(raw: &str) -> Vec<String> {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|item| item.trim().trim_matches(['"', '\'']).to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_steps(body: &str) -> Vec<HuntStep> {
    let mut steps = Vec::new();

    for block in body.split("\n### ").skip(1) {
        let mut lines = block.lines();
        let Some(step_id) = lines.next().map(|l| l.trim().to_string()) else {
            continue;
        };

        let mut attrs: HashMap<String, String> = HashMap::new();
        for line in lines {
            if let Some(capture) = FIELD_LINE.captures(line.trim()) {
                let value = capture[2].trim().trim_matches('`').trim().to_string();
                attrs.insert(capture[1].to_lowercase(), value);
            }
        }

        let Some(command) = attrs.get("command").filter(|c| !c.is_empty()).cloned() else {
            warn!("hunt step {step_id} has no command, skipping");
            continue;
        };

        let timeout = attrs
            .get("timeout")
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(30);
        let requires_sudo = attrs
            .get("requires_sudo")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "yes" | "1"))
            .unwrap_or(false);

        steps.push(HuntStep {
            description: attrs.remove("description").unwrap_or_else(|| step_id.clone()),
            id: step_id,
            command,
            timeout,
            requires_sudo,
        });
    }

    steps
}

/// Parse a complete module document.
pub fn parse_module(file_stem: &str, content: &str) -> HuntModule {
    let (front, body) = parse_front_matter(content);

    let os_types: Vec<OsType> = front
        .get("os_types")
        .map(|raw| {
            parse_list(raw)
                .iter()
                .filter_map(|os| os.parse().ok())
                .collect()
        })
        .filter(|list: &Vec<OsType>| !list.is_empty())
        .unwrap_or_else(|| vec![OsType::Linux]);

    HuntModule {
        id: front
            .get("id")
            .cloned()
            .unwrap_or_else(|| file_stem.to_string()),
        name: front
            .get("name")
            .cloned()
            .unwrap_or_else(|| file_stem.to_string()),
        description: front.get("description").cloned().unwrap_or_default(),
        os_types,
        tags: front.get("tags").map(|t| parse_list(t)).unwrap_or_default(),
        severity_hint: front
            .get("severity_hint")
            .cloned()
            .unwrap_or_else(|| "medium".to_string()),
        steps: parse_steps(body),
    }
}

/// Serialize a module back to its markdown document form.
pub fn serialize_module(module: &HuntModule) -> String {
    let os_types: Vec<String> = module.os_types.iter().map(|os| os.to_string()).collect();
    let mut lines = vec![
        "---".to_string(),
        format!("id: {}", module.id),
        format!("name: {}", module.name),
        format!("description: {}", module.description),
        format!("os_types: [{}]", os_types.join(", ")),
        format!("tags: [{}]", module.tags.join(", ")),
        format!("severity_hint: {}", module.severity_hint),
        "---".to_string(),
        String::new(),
        "## Steps".to_string(),
    ];

    for step in &module.steps {
        lines.push(String::new());
        lines.push(format!("### {}", step.id));
        lines.push(format!("**description**: {}", step.description));
        lines.push(format!("**command**: `{}`", step.command));
        lines.push(format!("**timeout**: {}", step.timeout));
        lines.push(format!(
            "**requires_sudo**: {}",
            if step.requires_sudo { "true" } else { "false" }
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

struct RegistryState {
    modules: HashMap<String, HuntModule>,
    dir_mtime: Option<SystemTime>,
    file_mtimes: HashMap<PathBuf, SystemTime>,
}

/// Registry of modules loaded from a directory of markdown files.
pub struct ModuleRegistry {
    directory: PathBuf,
    state: RwLock<RegistryState>,
}

impl ModuleRegistry {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let registry = Self {
            directory: directory.into(),
            state: RwLock::new(RegistryState {
                modules: HashMap::new(),
                dir_mtime: None,
                file_mtimes: HashMap::new(),
            }),
        };
        registry.reload();
        registry
    }

    /// Reload every module file from disk.
    pub fn reload(&self) {
        let mut state = self.state.write().expect("registry lock poisoned");
        state.modules.clear();
        state.file_mtimes.clear();

        let Ok(entries) = std::fs::read_dir(&self.directory) else {
            warn!(
                "hunt modules directory not found: {}",
                self.directory.display()
            );
            return;
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        paths.sort();

        for path in paths {
            let Ok(content) = std::fs::read_to_string(&path) else {
                warn!("failed to read hunt module {}", path.display());
                continue;
            };
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let module = parse_module(&stem, &content);
            info!(
                "loaded hunt module: {} ({} steps)",
                module.id,
                module.steps.len()
            );
            if let Ok(meta) = std::fs::metadata(&path) {
                if let Ok(mtime) = meta.modified() {
                    state.file_mtimes.insert(path.clone(), mtime);
                }
            }
            state.modules.insert(module.id.clone(), module);
        }

        state.dir_mtime = std::fs::metadata(&self.directory)
            .and_then(|m| m.modified())
            .ok();
        info!("hunt module registry loaded: {} modules", state.modules.len());
    }

    /// Reload if the directory or any loaded file changed on disk.
    fn check_reload(&self) {
        let needs_reload = {
            let state = self.state.read().expect("registry lock poisoned");
            let current_dir_mtime = std::fs::metadata(&self.directory)
                .and_then(|m| m.modified())
                .ok();
            if current_dir_mtime != state.dir_mtime {
                true
            } else {
                state.file_mtimes.iter().any(|(path, recorded)| {
                    std::fs::metadata(path)
                        .and_then(|m| m.modified())
                        .map(|mtime| mtime != *recorded)
                        .unwrap_or(true)
                })
            }
        };
        if needs_reload {
            info!("hunt modules changed on disk, reloading");
            self.reload();
        }
    }

    pub fn get(&self, module_id: &str) -> Option<HuntModule> {
        self.check_reload();
        self.state
            .read()
            .expect("registry lock poisoned")
            .modules
            .get(module_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<HuntModule> {
        self.check_reload();
        let mut modules: Vec<HuntModule> = self
            .state
            .read()
            .expect("registry lock poisoned")
            .modules
            .values()
            .cloned()
            .collect();
        modules.sort_by(|a, b| a.id.cmp(&b.id));
        modules
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Persist a module document and reload.
    pub fn save(&self, module: &HuntModule) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.directory.join(format!("{}.md", module.id));
        std::fs::write(path, serialize_module(module))?;
        self.reload();
        Ok(())
    }

    /// Delete a module document and reload. Returns whether it existed.
    pub fn delete(&self, module_id: &str) -> std::io::Result<bool> {
        let path = self.directory.join(format!("{module_id}.md"));
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        self.reload();
        Ok(true)
    }
}
