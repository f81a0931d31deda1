//! Report markup understood by the front end.
//!
//! Inline styles wrap their text: `<SCT:BOLD>text<!SCT:BOLD>`. Structural
//! markers (header, section, subsection) are single open tags carrying their
//! title: `<SCT:SECTION:RUN>`.

use std::sync::OnceLock;

use regex::Regex;

const TAG: &str = "SCT";

fn open(tag: &str) -> String {
    format!("<{TAG}:{tag}>")
}

fn close(tag: &str) -> String {
    format!("<!{TAG}:{tag}>")
}

fn wrap(tag: &str, text: &str) -> String {
    format!("{}{text}{}", open(tag), close(tag))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Bold,
    Red,
    Green,
    Blue,
}

impl Style {
    fn tag(self) -> &'static str {
        match self {
            Self::Bold => "BOLD",
            Self::Red => "COLOR:RED",
            Self::Green => "COLOR:GREEN",
            Self::Blue => "COLOR:BLUE",
        }
    }

    /// SGR parameters the test runner emits that map onto markup
    fn from_sgr(code: &str) -> Option<Self> {
        match code {
            "1" => Some(Self::Bold),
            "31" => Some(Self::Red),
            "32" => Some(Self::Green),
            _ => None,
        }
    }
}

pub fn bold(text: &str) -> String {
    wrap(Style::Bold.tag(), text)
}

pub fn red(text: &str) -> String {
    wrap(Style::Red.tag(), text)
}

pub fn green(text: &str) -> String {
    wrap(Style::Green.tag(), text)
}

pub fn blue(text: &str) -> String {
    wrap(Style::Blue.tag(), text)
}

pub fn header(title: &str) -> String {
    open(&format!("HEADER:{title}"))
}

pub fn section(title: &str) -> String {
    open(&format!("SECTION:{title}"))
}

pub fn subsection(title: &str) -> String {
    open(&format!("SUBSECTION:{title}"))
}

fn sgr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[([0-9;]*)m").expect("SGR pattern is valid"))
}

/// Replace ANSI SGR sequences with markup
///
/// Bold, red and green open a style; a reset closes every open style in
/// reverse order. Other sequences are dropped. Styles still open at the end
/// are closed.
pub fn escape_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut active: Vec<Style> = Vec::new();
    let mut last = 0;

    let close_all = |active: &mut Vec<Style>, out: &mut String| {
        while let Some(style) = active.pop() {
            out.push_str(&close(style.tag()));
        }
    };

    for caps in sgr_regex().captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&text[last..m.start()]);
        last = m.end();

        for code in caps[1].split(';') {
            if code.is_empty() || code == "0" {
                close_all(&mut active, &mut out);
            } else if let Some(style) = Style::from_sgr(code) {
                out.push_str(&open(style.tag()));
                active.push(style);
            }
        }
    }
    out.push_str(&text[last..]);
    close_all(&mut active, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_inline_styles() {
        assert_eq!(bold("x"), "<SCT:BOLD>x<!SCT:BOLD>");
        assert_eq!(red("err"), "<SCT:COLOR:RED>err<!SCT:COLOR:RED>");
        assert_eq!(section("RUN"), "<SCT:SECTION:RUN>");
        assert_eq!(header("TRACEBACK"), "<SCT:HEADER:TRACEBACK>");
    }

    #[test]
    fn test_escape_ansi() {
        assert_eq!(
            escape_ansi("\x1b[32m1 passed\x1b[0m in 0.01s"),
            "<SCT:COLOR:GREEN>1 passed<!SCT:COLOR:GREEN> in 0.01s"
        );
        assert_eq!(
            escape_ansi("\x1b[1m\x1b[31mFAIL\x1b[0m"),
            "<SCT:BOLD><SCT:COLOR:RED>FAIL<!SCT:COLOR:RED><!SCT:BOLD>"
        );
        assert_eq!(escape_ansi("\x1b[33mwarn\x1b[0m"), "warn");
        assert_eq!(
            escape_ansi("\x1b[1;31mopen"),
            "<SCT:BOLD><SCT:COLOR:RED>open<!SCT:COLOR:RED><!SCT:BOLD>"
        );
        assert_eq!(escape_ansi("plain"), "plain");
    }
}
