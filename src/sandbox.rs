mod imports;
mod rewrite;

pub use imports::{HARNESS_PREFIX, ImportGate};
pub use rewrite::{FORBIDDEN_ATTRIBUTES, FORBIDDEN_FUNCTIONS, PROXY, rewrite_source, with_boilerplate};

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::error::SandboxError;
use crate::settings::SandboxSettings;

/// File in the work directory holding the import rules of the active settings
pub const SETTINGS_FILE: &str = "sct_settings.json";

/// The two untrusted modules a request is split into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// The submitted code
    User,
    /// The comparison script driving the mark pass
    Compare,
}

impl ModuleKind {
    pub fn module_name(self) -> &'static str {
        match self {
            Self::User => "sct_user",
            Self::Compare => "sct_compare",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.py", self.module_name())
    }

    /// Trusted code placed above the sandbox boilerplate
    fn header(self) -> &'static str {
        match self {
            Self::User => "def test_dummy():\n    assert True",
            Self::Compare => "from sct_test import test, test_no_inject, check_args, set_function",
        }
    }
}

/// Source of one untrusted module, ready to be written next to the harness
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedModule {
    pub kind: ModuleKind,
    pub source: String,
    /// Set when the import gate refused the module; it must not be executed
    pub violation: Option<SandboxError>,
}

impl PreparedModule {
    pub fn is_allowed(&self) -> bool {
        self.violation.is_none()
    }
}

pub fn settings_path(work_dir: &Path) -> PathBuf {
    work_dir.join(SETTINGS_FILE)
}

/// Write the import rules of freshly loaded settings to the work directory
pub fn install_rules(settings: &SandboxSettings, work_dir: &Path) -> Result<()> {
    let gate = ImportGate::new(settings.rules().cloned().collect());
    gate.persist(&settings_path(work_dir))?;
    log::debug!("Installed {} import rules", gate.rules().len());
    Ok(())
}

/// Source-level sandbox for one request
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    gate: ImportGate,
}

impl Sandbox {
    pub fn new(gate: ImportGate) -> Self {
        Self { gate }
    }

    /// Sandbox governed by the import rules of one settings snapshot
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self::new(ImportGate::new(settings.rules().cloned().collect()))
    }

    pub fn gate(&self) -> &ImportGate {
        &self.gate
    }

    pub fn prepare(&self, kind: ModuleKind, source: &str) -> PreparedModule {
        let violation = self.gate.scan(kind.module_name(), source).err();
        if let Some(violation) = &violation {
            log::info!("{} rejected: {violation}", kind.module_name());
        }

        PreparedModule {
            kind,
            source: with_boilerplate(kind.header(), &rewrite_source(source)),
            violation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ImportRule, TEST_SCOPE, USER_SCOPE};

    #[test]
    fn test_prepare_user_module() {
        let sandbox = Sandbox::new(ImportGate::new(vec![ImportRule::new(
            USER_SCOPE,
            "math",
            Vec::<String>::new(),
        )]));
        let module = sandbox.prepare(ModuleKind::User, "import math\nprint(eval('1'))");

        assert!(module.is_allowed());
        assert!(module.source.starts_with("def test_dummy():\n    assert True\n"));
        assert!(module.source.contains("print(_sandboxed_.eval('1'))"));
        assert!(module.source.contains("import math\n"));
    }

    #[test]
    fn test_compare_module_sees_test_rules() {
        let sandbox = Sandbox::new(ImportGate::new(vec![ImportRule::new(
            TEST_SCOPE,
            "random",
            Vec::<String>::new(),
        )]));

        let compare = sandbox.prepare(ModuleKind::Compare, "import random");
        assert!(compare.is_allowed());
        assert!(compare.source.starts_with("from sct_test import"));

        let user = sandbox.prepare(ModuleKind::User, "import random");
        assert_eq!(
            user.violation,
            Some(SandboxError::ForbiddenForModule("random".to_string()))
        );
    }

    #[test]
    fn test_install_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SandboxSettings {
            user: vec![ImportRule::new(USER_SCOPE, "os", ["system"])],
            test: vec![],
        };
        install_rules(&settings, dir.path()).unwrap();

        let sandbox = Sandbox::new(ImportGate::load(&settings_path(dir.path())).unwrap());
        assert!(sandbox.prepare(ModuleKind::User, "from os import system").is_allowed());
        assert!(!sandbox.prepare(ModuleKind::User, "from os import path").is_allowed());
        assert_eq!(sandbox.gate(), Sandbox::from_settings(&settings).gate());
    }
}
