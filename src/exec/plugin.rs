use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::driver::{Driver, DriverCommand};
use super::harness::{self, MARK_SCRIPT};
use super::mark;
use super::output::{ExecOutput, Mark, Text};
use crate::sandbox::{self, ModuleKind, PreparedModule, Sandbox};
use crate::settings::{ExecutionRequest, GlobalSettings};

/// A grading backend hosted by the orchestrator
///
/// Execution is blocking; the orchestrator runs it on a blocking thread and
/// cancels `cancel` once the request deadline passes.
pub trait Plugin: Send + Sync {
    /// Run every driver enabled in `settings`; returns the `exec` object of the result
    fn exec(
        &self,
        request: &ExecutionRequest,
        settings: &GlobalSettings,
        cancel: &CancellationToken,
    ) -> Result<Value>;

    /// Called inside the handshake after new settings were accepted
    fn reload(&self, _settings: &GlobalSettings) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PythonConfig {
    pub work_dir: PathBuf,
    pub python: String,
    pub pytest: String,
    pub driver_timeout: Duration,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            python: "python3".to_string(),
            pytest: "pytest".to_string(),
            driver_timeout: Duration::from_secs(60),
        }
    }
}

/// Runs Python submissions through the source sandbox and the mark harness
pub struct PythonPlugin {
    config: PythonConfig,
}

impl PythonPlugin {
    pub fn new(config: PythonConfig) -> Self {
        Self { config }
    }

    pub fn work_dir(&self) -> &Path {
        &self.config.work_dir
    }

    fn driver(&self) -> Driver {
        Driver::new(self.config.driver_timeout)
    }

    fn run_code(&self, user: &PreparedModule, dir: &Path, cancel: &CancellationToken) -> Result<Text> {
        if let Some(violation) = &user.violation {
            return Ok(Text::new(violation.report(), ""));
        }
        let command = DriverCommand::new(&self.config.python, [format!("./{}", user.kind.file_name())]);
        self.driver().run_text(&command, dir, cancel)
    }

    fn run_pytest(&self, user: &PreparedModule, dir: &Path, cancel: &CancellationToken) -> Result<Text> {
        if let Some(violation) = &user.violation {
            return Ok(Text::new(violation.report(), ""));
        }
        let command = DriverCommand::new(
            &self.config.pytest,
            [format!("./{}", user.kind.file_name()), "--color=yes".to_string()],
        );
        self.driver().run_text(&command, dir, cancel)
    }

    fn run_mark(
        &self,
        user: &PreparedModule,
        compare: &PreparedModule,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Mark> {
        if let Some(violation) = user.violation.as_ref().or(compare.violation.as_ref()) {
            return Ok(Mark::new(violation.report(), ""));
        }

        let token = mark::sentinel_token()?;
        let driver = self.driver().with_env("DELIMITER", &token);
        let command = DriverCommand::new(&self.config.python, [format!("./{MARK_SCRIPT}")]);

        let output = driver.execute(&command, dir, cancel)?;
        if output.timed_out {
            return Ok(Mark::new(driver.timeout_text(&command).error, ""));
        }
        let (text, data) = mark::split_output(&output.stdout, &token);
        Ok(mark::collect(output.stderr, text, &data))
    }
}

impl Plugin for PythonPlugin {
    fn exec(
        &self,
        request: &ExecutionRequest,
        settings: &GlobalSettings,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let dir = tempfile::Builder::new()
            .prefix("tmp_")
            .tempdir_in(&self.config.work_dir)
            .context("Failed to create request directory")?;
        let sandbox = Sandbox::from_settings(&settings.sandbox);
        harness::install(dir.path(), sandbox.gate())?;

        let user = sandbox.prepare(ModuleKind::User, &request.code);
        harness::write_module(dir.path(), &user)?;

        let mut output = ExecOutput::default();
        if settings.exec.run {
            output.run = Some(self.run_code(&user, dir.path(), cancel)?);
        }
        if settings.exec.pytest {
            output.pytest = Some(self.run_pytest(&user, dir.path(), cancel)?);
        }
        if settings.exec.mark {
            let compare = sandbox.prepare(ModuleKind::Compare, &request.test);
            harness::write_module(dir.path(), &compare)?;
            output.mark = Some(self.run_mark(&user, &compare, dir.path(), cancel)?);
        }

        Ok(serde_json::to_value(output)?)
    }

    fn reload(&self, settings: &GlobalSettings) -> Result<()> {
        sandbox::install_rules(&settings.sandbox, &self.config.work_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ImportGate;
    use crate::settings::{ExecSettings, ImportRule, SandboxSettings};

    fn plugin(work_dir: &Path) -> PythonPlugin {
        PythonPlugin::new(PythonConfig {
            work_dir: work_dir.to_path_buf(),
            ..Default::default()
        })
    }

    #[test]
    fn test_violation_skips_every_driver() {
        let work_dir = tempfile::tempdir().unwrap();
        let plugin = plugin(work_dir.path());
        let settings = GlobalSettings {
            exec: ExecSettings {
                run: true,
                mark: true,
                pytest: true,
            },
            sandbox: SandboxSettings {
                user: vec![ImportRule::new("*", "math", Vec::<String>::new())],
                test: vec![],
            },
            ..Default::default()
        };
        plugin.reload(&settings).unwrap();

        let request = ExecutionRequest {
            code: "import os".to_string(),
            test: String::new(),
        };
        let result = plugin
            .exec(&request, &settings, &CancellationToken::new())
            .unwrap();

        let expected = "SandboxError: Cannot import os: forbidden";
        assert_eq!(result["run"]["error"], expected);
        assert_eq!(result["pytest"]["error"], expected);
        assert_eq!(result["mark"]["error"], expected);
        assert_eq!(result["mark"]["success"], serde_json::json!([]));
    }

    #[test]
    fn test_request_uses_its_own_settings_snapshot() {
        let work_dir = tempfile::tempdir().unwrap();
        let plugin = plugin(work_dir.path());
        let run_only = ExecSettings {
            run: true,
            ..Default::default()
        };
        let strict = GlobalSettings {
            exec: run_only.clone(),
            ..Default::default()
        };
        let permissive = GlobalSettings {
            exec: run_only,
            sandbox: SandboxSettings {
                user: vec![ImportRule::new("*", "os", Vec::<String>::new())],
                test: vec![],
            },
            ..Default::default()
        };

        // A later handshake installed more permissive rules
        plugin.reload(&permissive).unwrap();
        let durable = ImportGate::load(&sandbox::settings_path(work_dir.path())).unwrap();
        assert_eq!(durable.rules().len(), 1);

        let request = ExecutionRequest {
            code: "import os".to_string(),
            test: String::new(),
        };
        let result = plugin
            .exec(&request, &strict, &CancellationToken::new())
            .unwrap();
        assert_eq!(result["run"]["error"], "SandboxError: Cannot import os: forbidden");
    }

    #[test]
    fn test_nothing_enabled_and_directory_removed() {
        let work_dir = tempfile::tempdir().unwrap();
        let plugin = plugin(work_dir.path());
        let result = plugin
            .exec(
                &ExecutionRequest::default(),
                &GlobalSettings::default(),
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(result, serde_json::json!({}));
        let leftovers: Vec<_> = std::fs::read_dir(work_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("tmp_"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
