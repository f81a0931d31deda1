use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::sandbox::{self, FORBIDDEN_ATTRIBUTES, FORBIDDEN_FUNCTIONS, ImportGate, PreparedModule};

const SANDBOX_MODULE: &str = include_str!("assets/sct_sandbox.py");
const TEST_MODULE: &str = include_str!("assets/sct_test.py");
const MARK_MODULE: &str = include_str!("assets/sct_exec_mark.py");

/// Entry script of the mark pass
pub const MARK_SCRIPT: &str = "sct_exec_mark.py";

/// Source of `sct_sandbox.py`, with the deny-lists the rewriter uses
fn sandbox_module() -> Result<String> {
    let forbidden: Vec<&str> = FORBIDDEN_FUNCTIONS
        .iter()
        .chain(FORBIDDEN_ATTRIBUTES)
        .copied()
        .collect();
    Ok(format!(
        "FORBIDDEN = frozenset({})\n\n{SANDBOX_MODULE}",
        serde_json::to_string(&forbidden)?
    ))
}

/// Write the trusted harness modules into a request directory, together with
/// the import rules the runtime import hook enforces
pub fn install(dir: &Path, gate: &ImportGate) -> Result<()> {
    gate.persist(&sandbox::settings_path(dir))?;

    let files = [
        ("sct_sandbox.py", sandbox_module()?),
        ("sct_test.py", TEST_MODULE.to_string()),
        (MARK_SCRIPT, MARK_MODULE.to_string()),
    ];
    for (name, source) in files {
        fs::write(dir.join(name), source).with_context(|| format!("Failed to write {name}"))?;
    }
    Ok(())
}

/// Write an untrusted module next to the harness
pub fn write_module(dir: &Path, module: &PreparedModule) -> Result<()> {
    let name = module.kind.file_name();
    fs::write(dir.join(&name), &module.source).with_context(|| format!("Failed to write {name}"))
}
