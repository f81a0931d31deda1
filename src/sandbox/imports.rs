use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;

use crate::error::SandboxError;
use crate::settings::ImportRule;

/// Prefix of the trusted harness modules; untrusted code may never import them
pub const HARNESS_PREFIX: &str = "sct_";

/// Allow-list resolver for imports made by untrusted modules
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportGate {
    rules: Vec<ImportRule>,
}

impl ImportGate {
    pub fn new(rules: Vec<ImportRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ImportRule] {
        &self.rules
    }

    /// Check `import name` (no `named`) or `from name import named...` issued by `module`
    ///
    /// The first rule for `name` whose scope matches `module` decides.
    pub fn check(&self, module: &str, name: &str, named: &[&str]) -> Result<(), SandboxError> {
        if name.starts_with(HARNESS_PREFIX) {
            return Err(SandboxError::ForbiddenImport(name.to_string()));
        }

        let mut candidates = self.rules.iter().filter(|rule| rule.name == name).peekable();
        if candidates.peek().is_none() {
            return Err(SandboxError::ForbiddenImport(name.to_string()));
        }

        match candidates.find(|rule| rule.applies_to(module)) {
            Some(rule) => check_named(rule, named),
            None => Err(SandboxError::ForbiddenForModule(name.to_string())),
        }
    }

    /// Check every import statement found in `source`; stops at the first violation
    pub fn scan(&self, module: &str, source: &str) -> Result<(), SandboxError> {
        for statement in import_statements(source) {
            let named: Vec<&str> = statement.named.iter().map(String::as_str).collect();
            for name in &statement.modules {
                self.check(module, name, &named)?;
            }
        }
        Ok(())
    }

    /// Atomically replace the rule file at `path`
    pub fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let entries: Vec<(&str, &str, Vec<&str>)> = self
            .rules
            .iter()
            .map(|rule| {
                (
                    rule.scope.as_str(),
                    rule.name.as_str(),
                    rule.allowed.iter().map(String::as_str).collect(),
                )
            })
            .collect();

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(serde_json::to_string(&entries)?.as_bytes())?;
        file.persist(path)
            .with_context(|| format!("Failed to write sandbox rules to {}", path.display()))?;
        Ok(())
    }

    /// Load a rule file written by [`ImportGate::persist`]; a missing file is an empty gate
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).context(format!("Failed to read {}", path.display())),
        };

        let entries: Vec<(String, String, Vec<String>)> = serde_json::from_str(&text)
            .with_context(|| format!("Malformed sandbox rules in {}", path.display()))?;
        Ok(Self::new(
            entries
                .into_iter()
                .map(|(scope, name, allowed)| ImportRule::new(&scope, &name, allowed))
                .collect(),
        ))
    }
}

fn check_named(rule: &ImportRule, named: &[&str]) -> Result<(), SandboxError> {
    if named.contains(&"*") {
        return Err(SandboxError::StarImport(rule.name.clone()));
    }
    if rule.allowed.is_empty() {
        return Ok(());
    }
    if named.is_empty() {
        return Err(SandboxError::NamedImportRequired(rule.name.clone()));
    }
    match named.iter().find(|n| !rule.allowed.contains(**n)) {
        Some(name) => Err(SandboxError::ForbiddenName {
            module: rule.name.clone(),
            name: name.to_string(),
        }),
        None => Ok(()),
    }
}

#[derive(Debug, PartialEq)]
struct ImportStatement {
    modules: Vec<String>,
    named: Vec<String>,
}

fn plain_import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)(?:^|[;:])[ \t]*import[ \t]+([^\n;#]+)").expect("import pattern is valid")
    })
}

fn from_import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)(?:^|[;:])[ \t]*from[ \t]+([\w.]+)[ \t]+import[ \t]*(\([^)]*\)|[^\n;#]+)")
            .expect("from-import pattern is valid")
    })
}

/// Drop an `as alias` suffix and surrounding noise from one import target
fn target_name(item: &str) -> Option<String> {
    let item = item.trim().trim_end_matches('\\').trim();
    let name = item.split_whitespace().next()?;
    Some(name.to_string())
}

/// Statements may start a line, follow `;`, or follow the `:` of a compound
/// statement header; backslash continuations are joined first
fn import_statements(source: &str) -> Vec<ImportStatement> {
    let source = source.replace("\\\r\n", " ").replace("\\\n", " ");
    let source = source.as_str();
    let mut statements = Vec::new();

    for caps in plain_import_regex().captures_iter(source) {
        statements.push(ImportStatement {
            modules: caps[1].split(',').filter_map(target_name).collect(),
            named: Vec::new(),
        });
    }

    for caps in from_import_regex().captures_iter(source) {
        let targets = caps[2].trim().trim_start_matches('(').trim_end_matches(')');
        statements.push(ImportStatement {
            modules: vec![caps[1].to_string()],
            named: targets
                .split([',', '\n'])
                .filter_map(|item| {
                    // strip trailing comments inside a parenthesized list
                    target_name(item.split('#').next().unwrap_or_default())
                })
                .collect(),
        });
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn gate(rules: &[(&str, &str, &[&str])]) -> ImportGate {
        ImportGate::new(
            rules
                .iter()
                .map(|(scope, name, allowed)| ImportRule::new(scope, name, allowed.iter().copied()))
                .collect(),
        )
    }

    #[test]
    fn test_unrestricted_module() {
        let gate = gate(&[("*", "os", &[])]);
        assert_eq!(gate.check("sct_user", "os", &[]), Ok(()));
        assert_eq!(gate.check("sct_user", "os", &["path"]), Ok(()));
        assert_eq!(
            gate.check("sct_user", "os", &["*"]),
            Err(SandboxError::StarImport("os".to_string()))
        );
    }

    #[test]
    fn test_named_allow_list() {
        let gate = gate(&[("*", "os", &["system"])]);
        assert_eq!(gate.scan("sct_user", "from os import system"), Ok(()));
        assert_eq!(
            gate.scan("sct_user", "from os import path"),
            Err(SandboxError::ForbiddenName {
                module: "os".to_string(),
                name: "path".to_string()
            })
        );
        assert_eq!(
            gate.scan("sct_user", "import os"),
            Err(SandboxError::NamedImportRequired("os".to_string()))
        );
    }

    #[test]
    fn test_unknown_module_always_rejected() {
        let gate = gate(&[("*", "math", &[])]);
        assert_eq!(
            gate.scan("sct_user", "import os as _x"),
            Err(SandboxError::ForbiddenImport("os".to_string()))
        );
        assert_eq!(
            ImportGate::default().scan("sct_compare", "  import os as _x"),
            Err(SandboxError::ForbiddenImport("os".to_string()))
        );
    }

    #[test]
    fn test_scope_restricts_rule() {
        let gate = gate(&[("compare", "hypothesis", &[])]);
        assert_eq!(gate.scan("sct_compare", "import hypothesis"), Ok(()));
        assert_eq!(
            gate.scan("sct_user", "import hypothesis"),
            Err(SandboxError::ForbiddenForModule("hypothesis".to_string()))
        );
    }

    #[test]
    fn test_harness_modules_rejected() {
        let gate = gate(&[("*", "sct_test", &[])]);
        assert_eq!(
            gate.scan("sct_user", "from sct_test import test"),
            Err(SandboxError::ForbiddenImport("sct_test".to_string()))
        );
    }

    #[test]
    fn test_statement_forms() {
        let statements = import_statements(
            "import a.b, c as d\nx = 1; from m import (x,\n    y as z,  # why\n)\nif t:\n    from . import q\n",
        );
        assert_eq!(
            statements,
            vec![
                ImportStatement {
                    modules: vec!["a.b".to_string(), "c".to_string()],
                    named: vec![],
                },
                ImportStatement {
                    modules: vec!["m".to_string()],
                    named: vec!["x".to_string(), "y".to_string()],
                },
                ImportStatement {
                    modules: vec![".".to_string()],
                    named: vec!["q".to_string()],
                },
            ]
        );
    }

    #[test]
    fn test_imports_after_compound_headers() {
        let gate = ImportGate::default();
        let forbidden = Err(SandboxError::ForbiddenImport("os".to_string()));
        for source in [
            "if True: import os as _x",
            "try: import os as _x\nexcept ImportError: pass",
            "if False: pass\nelse: import os as _x",
            "with ctx: import os as _x",
            "for _ in [1]:from os import path",
            "while True:import os; break",
            "def f(): import os as _x",
        ] {
            assert_eq!(gate.scan("sct_user", source), forbidden, "{source}");
        }
    }

    #[test]
    fn test_backslash_continuation() {
        let math_only = gate(&[("*", "math", &[])]);
        assert_eq!(
            math_only.scan("sct_user", "import \\\n    os as _x"),
            Err(SandboxError::ForbiddenImport("os".to_string()))
        );
        assert_eq!(
            math_only.scan("sct_user", "import math, \\\r\n    os"),
            Err(SandboxError::ForbiddenImport("os".to_string()))
        );

        let os_path = gate(&[("*", "os", &["path"])]);
        assert_eq!(
            os_path.scan("sct_user", "from os import \\\n    system"),
            Err(SandboxError::ForbiddenName {
                module: "os".to_string(),
                name: "system".to_string()
            })
        );
    }

    #[test]
    fn test_persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sct_settings.json");
        assert_eq!(ImportGate::load(&path).unwrap(), ImportGate::default());

        let gate = gate(&[("*", "os", &["system"]), ("compare", "math", &[])]);
        gate.persist(&path).unwrap();
        assert_eq!(ImportGate::load(&path).unwrap(), gate);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!([["*", "os", ["system"]], ["compare", "math", []]]));
    }
}
