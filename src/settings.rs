use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scope of rules coming from `sandbox.user`: applies to every untrusted module
pub const USER_SCOPE: &str = "*";

/// Scope of rules coming from `sandbox.test`: applies to the comparison module only
pub const TEST_SCOPE: &str = "compare";

/// Bounds for `main.container_timeout`, in seconds
pub const CONTAINER_TIMEOUT_BOUNDS: (f64, f64) = (5.0, 60.0 * 60.0);

/// Bounds for `main.code_timeout`, in seconds
pub const CODE_TIMEOUT_BOUNDS: (f64, f64) = (5.0, 60.0);

/// Opaque token naming the settings a client believes are active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsVersion(String);

impl SettingsVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SettingsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecSettings {
    pub run: bool,
    pub mark: bool,
    pub pytest: bool,
}

impl ExecSettings {
    pub fn any(&self) -> bool {
        self.run || self.mark || self.pytest
    }
}

/// Allows importing `name` from modules matching `scope`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRule {
    pub scope: String,
    pub name: String,
    pub allowed: BTreeSet<String>,
}

impl ImportRule {
    pub fn new<I, S>(scope: &str, name: &str, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scope: scope.to_string(),
            name: name.to_string(),
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether code running as `module` is governed by this rule
    pub fn applies_to(&self, module: &str) -> bool {
        self.scope == USER_SCOPE || module.contains(self.scope.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxSettings {
    pub user: Vec<ImportRule>,
    pub test: Vec<ImportRule>,
}

impl SandboxSettings {
    /// All rules in lookup order: user rules first, then test rules
    pub fn rules(&self) -> impl Iterator<Item = &ImportRule> {
        self.user.iter().chain(self.test.iter())
    }
}

/// Settings pushed by the host during the handshake
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalSettings {
    pub debug: bool,
    pub exec: ExecSettings,
    pub sandbox: SandboxSettings,
    /// Requested idle timeout of the container, seconds, unvalidated
    pub container_timeout: Option<Value>,
    /// Requested per-request execution timeout, seconds, unvalidated
    pub code_timeout: Option<Value>,
}

impl GlobalSettings {
    /// Lenient parse: unknown shapes fall back to defaults instead of failing
    pub fn from_value(data: &Value) -> Self {
        let exec = data.get("exec");
        let sandbox = data.get("sandbox");
        let main = data.get("main");

        Self {
            debug: is_true(data.get("debug")),
            exec: ExecSettings {
                run: is_true(exec.and_then(|e| e.get("run"))),
                mark: is_true(exec.and_then(|e| e.get("mark"))),
                pytest: is_true(exec.and_then(|e| e.get("pytest"))),
            },
            sandbox: SandboxSettings {
                user: parse_rules(sandbox.and_then(|s| s.get("user")), USER_SCOPE),
                test: parse_rules(sandbox.and_then(|s| s.get("test")), TEST_SCOPE),
            },
            container_timeout: main.and_then(|m| m.get("container_timeout")).cloned(),
            code_timeout: main.and_then(|m| m.get("code_timeout")).cloned(),
        }
    }
}

fn is_true(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}

fn parse_rules(entries: Option<&Value>, scope: &str) -> Vec<ImportRule> {
    let Some(Value::Array(entries)) = entries else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let name = entry.get("module")?.as_str()?;
            let allowed = match entry.get("allowed") {
                Some(Value::Array(names)) => names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect(),
                _ => BTreeSet::new(),
            };
            Some(ImportRule {
                scope: scope.to_string(),
                name: name.to_string(),
                allowed,
            })
        })
        .collect()
}

/// Outcome of validating a timeout coming from the settings blob
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeoutUpdate {
    /// Not a number; leave the current value alone
    Invalid,
    /// Zero or negative; leave the current value alone
    Unchanged,
    /// Clamped to the allowed bounds
    Set(Duration),
}

pub fn clamp_timeout(value: Option<&Value>, (min, max): (f64, f64)) -> TimeoutUpdate {
    match value.and_then(Value::as_f64) {
        None => TimeoutUpdate::Invalid,
        Some(secs) if secs <= 0.0 || !secs.is_finite() => TimeoutUpdate::Unchanged,
        Some(secs) => TimeoutUpdate::Set(Duration::from_secs_f64(secs.clamp(min, max))),
    }
}

/// Submission to execute
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub test: String,
}

impl ExecutionRequest {
    pub fn from_value(data: &Value) -> Self {
        let field = |key: &str| {
            data.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            code: field("code"),
            test: field("test"),
        }
    }
}
