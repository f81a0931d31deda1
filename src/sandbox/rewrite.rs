use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Builtins that give untrusted code evaluation, file or namespace access
pub const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "eval",
    "exec",
    "open",
    "globals",
    "locals",
    "vars",
    "breakpoint",
    "copyright",
    "credits",
    "license",
    "memoryview",
    "getattr",
    "__import__",
];

/// Attribute names that lead out of the module namespace
pub const FORBIDDEN_ATTRIBUTES: &[&str] = &[
    "__untrusted__",
    "__dict__",
    "builtins",
    "__builtins__",
    "__file__",
    "__main__",
    "__loader__",
    "__globals__",
    "__subclasses__",
];

/// Name of the proxy object every forbidden identifier is routed through
pub const PROXY: &str = "_sandboxed_";

fn identifier_regex(name: &str) -> Regex {
    Regex::new(&format!(r"\b{}\b", regex::escape(name))).expect("identifier pattern is valid")
}

fn definition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"\b(def|class)(\s+){}\.(\w+)", regex::escape(PROXY)))
            .expect("definition pattern is valid")
    })
}

fn import_clause_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)(?:^|[;:])[ \t]*(?:from[ \t]+[\w.]+[ \t]+)?import[ \t]+(?:\([^)]*\)|[^\n;#]*)")
            .expect("import pattern is valid")
    })
}

/// Prefix every whole-word occurrence of `name` with the proxy
///
/// With `after_dot == false`, occurrences written as an attribute access
/// (`obj.name`) are left alone.
fn route_through_proxy(source: &str, name: &str, after_dot: bool) -> String {
    let re = identifier_regex(name);
    let mut out = String::with_capacity(source.len());
    let mut last = 0;

    for m in re.find_iter(source) {
        out.push_str(&source[last..m.start()]);
        let preceded_by_dot = source[..m.start()].ends_with('.');
        if after_dot || !preceded_by_dot {
            out.push_str(PROXY);
            out.push('.');
        }
        out.push_str(m.as_str());
        last = m.end();
    }
    out.push_str(&source[last..]);
    out
}

/// Rewrite untrusted source so forbidden identifiers hit the sandbox proxy
///
/// Definition targets (`def name`, `class name`) and names inside import
/// clauses keep their original spelling. Identifiers inside string literals
/// and comments are rewritten too; this is a best-effort, lexical pass.
pub fn rewrite_source(source: &str) -> String {
    let mut src = source.to_string();
    for name in FORBIDDEN_FUNCTIONS {
        src = route_through_proxy(&src, name, false);
    }
    for name in FORBIDDEN_ATTRIBUTES {
        src = route_through_proxy(&src, name, true);
    }

    let proxied = format!("{PROXY}.");
    let src = definition_regex().replace_all(&src, "$1$2$3");
    import_clause_regex()
        .replace_all(&src, |caps: &Captures| caps[0].replace(&proxied, ""))
        .into_owned()
}

/// Boilerplate that installs the proxy and flags the module as untrusted
pub fn with_boilerplate(header: &str, body: &str) -> String {
    format!(
        "{header}\n\
         from sct_sandbox import init as _sct_init, SandboxError\n\
         {PROXY} = _sct_init()\n\
         __untrusted__ = True\n\
         {body}\n"
    )
}
