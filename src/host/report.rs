use serde::Serialize;
use serde_json::Value;

use super::format;
use crate::exec::{ExecOutput, Mark, Text};
use crate::protocol::ResultCode;

/// Result code reported when the container sent no final packet
pub const NO_RESULT: i64 = -1;

/// Host-side view of the settings blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSettings {
    pub debug: bool,
    pub print_mark: bool,
    pub force_mark_user_output: bool,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            debug: false,
            print_mark: true,
            force_mark_user_output: false,
        }
    }
}

impl ReportSettings {
    pub fn from_value(settings: &Value) -> Self {
        let print = |key: &str, default: bool| {
            settings
                .get("print")
                .and_then(|p| p.get(key))
                .and_then(Value::as_bool)
                .unwrap_or(default)
        };
        Self {
            debug: settings.get("debug").and_then(Value::as_bool).unwrap_or(false),
            print_mark: print("mark", true),
            force_mark_user_output: print("force_mark_user_output", false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub key: String,
    pub text: String,
}

impl ErrorInfo {
    pub fn none() -> Self {
        Self {
            key: "none".to_string(),
            text: String::new(),
        }
    }
}

/// What the host hands back to its caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub error: ErrorInfo,
}

impl Response {
    /// A failure on the host side, before or around the exchange
    pub fn exception(err: &anyhow::Error, settings: &ReportSettings) -> Self {
        let mut text = format::bold(&format::red("internal error while executing your code."));
        if settings.debug {
            text.push_str("\n\n");
            text.push_str(&format::red(&format!("{err:#}")));
        }
        Self {
            points: None,
            text: None,
            error: ErrorInfo {
                key: "exception".to_string(),
                text,
            },
        }
    }
}

pub fn error_key(code: i64) -> String {
    match ResultCode::from_code(code) {
        Some(ResultCode::Ok) => "none".to_string(),
        Some(ResultCode::TooManyConnections) => "too_many_connections".to_string(),
        Some(ResultCode::ListenerTimeout | ResultCode::ExecutionTimeout) => "timeout".to_string(),
        Some(ResultCode::Exception) => "container_exception".to_string(),
        None => format!("unknown_container_{code}"),
    }
}

pub fn error_text(code: i64, data: &Value, settings: &ReportSettings) -> String {
    let message = match ResultCode::from_code(code) {
        Some(ResultCode::Ok) => return String::new(),
        Some(ResultCode::TooManyConnections) => {
            "Too many connections to container. please try again later".to_string()
        }
        Some(ResultCode::ListenerTimeout | ResultCode::ExecutionTimeout) => {
            format!("A timeout occurred while executing your code ({code}).")
        }
        _ if settings.debug => format!("fatal exception in container ({code})."),
        _ => format!("fatal exception in container ({code}). activate debug mode for details"),
    };

    let mut text = format::bold(&format::red(&message));
    if !settings.debug {
        return text;
    }
    if code == NO_RESULT {
        text.push_str(&data.to_string());
    }
    if code == ResultCode::Exception.code() {
        text.push_str("\n\n");
        text.push_str(&format::header("TRACEBACK"));
        text.push_str(&traceback(data));
    }
    text
}

fn traceback(data: &Value) -> String {
    let field = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or_default();
    let mut text = format!(
        "{}: {}\n",
        format::red(&format::bold(field("class"))),
        format::red(field("msg"))
    );
    for frame in data.get("tb").and_then(Value::as_array).into_iter().flatten() {
        let index = frame.get("index").map(Value::to_string).unwrap_or_default();
        let context = frame.get("context").and_then(Value::as_str).unwrap_or_default();
        text.push_str(&format!(" - {} {}\n", format::bold(&index), format::blue(context)));
    }
    text
}

/// Driver results of a successful exchange; malformed data reads as no results
pub fn exec_output(data: &Value) -> ExecOutput {
    data.get("exec")
        .cloned()
        .and_then(|exec| serde_json::from_value(exec).ok())
        .unwrap_or_default()
}

pub fn score(output: &ExecOutput) -> f64 {
    output.mark.as_ref().map(Mark::score).unwrap_or_default()
}

fn text_section(title: &str, result: &Text) -> String {
    let mut text = format::section(title);
    if !result.text.is_empty() {
        text.push_str(&format!("{}\n", result.text));
    }
    if !result.error.is_empty() {
        text.push_str(&format!("{}\n", format::red(&result.error)));
    }
    text
}

fn mark_section(mark: &Mark, settings: &ReportSettings) -> String {
    if !settings.print_mark {
        return String::new();
    }

    let mut text = format::section("MARK");
    let mut has_content = false;

    if (settings.debug || settings.force_mark_user_output) && !mark.text.is_empty() {
        text.push_str(&format!("{}\n", mark.text));
        has_content = true;
    }
    if settings.debug && !mark.error.is_empty() {
        text.push_str(&format!("{}\n", format::red(&mark.error)));
        has_content = true;
    }

    let mut lists = vec![("SUCCESS", &mark.success)];
    if settings.debug {
        lists.push(("MISSED", &mark.missed));
    }
    for (title, entries) in lists {
        if settings.debug {
            text.push_str(&format::subsection(title));
        }
        for entry in entries {
            has_content = true;
            if entry.note.is_empty() {
                text.push_str(&format!("{}: {}\n", entry.function, entry.points));
            } else {
                text.push_str(&format!(
                    "{}: {} => {}\n",
                    entry.function, entry.points, entry.note
                ));
            }
        }
    }

    if has_content { text } else { String::new() }
}

pub fn report_text(output: &ExecOutput, settings: &ReportSettings) -> String {
    let mut text = if settings.debug {
        format::header("DEBUGMODE")
    } else {
        String::new()
    };
    if let Some(run) = &output.run {
        text.push_str(&text_section("RUN", run));
    }
    if let Some(pytest) = &output.pytest {
        text.push_str(&text_section("PYTEST", pytest));
    }
    if let Some(mark) = &output.mark {
        text.push_str(&mark_section(mark, settings));
    }
    format::escape_ansi(&text)
}

/// Turn the container's final `{res, data}` into a response
pub fn render(code: i64, data: &Value, settings: &ReportSettings) -> Response {
    if code != ResultCode::Ok.code() {
        return Response {
            points: None,
            text: None,
            error: ErrorInfo {
                key: error_key(code),
                text: error_text(code, data, settings),
            },
        };
    }

    let output = exec_output(data);
    Response {
        points: Some(score(&output).max(0.0)),
        text: Some(report_text(&output, settings)),
        error: ErrorInfo::none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn debug() -> ReportSettings {
        ReportSettings {
            debug: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_error_keys() {
        assert_eq!(error_key(0), "none");
        assert_eq!(error_key(1), "too_many_connections");
        assert_eq!(error_key(2), "timeout");
        assert_eq!(error_key(3), "timeout");
        assert_eq!(error_key(4), "container_exception");
        assert_eq!(error_key(-1), "unknown_container_-1");
        assert_eq!(error_key(9), "unknown_container_9");
    }

    #[test]
    fn test_settings_defaults() {
        assert_eq!(ReportSettings::from_value(&json!({})), ReportSettings::default());
        let settings = ReportSettings::from_value(&json!({
            "debug": true,
            "print": {"mark": false, "force_mark_user_output": true},
        }));
        assert!(settings.debug && !settings.print_mark && settings.force_mark_user_output);
    }

    #[test]
    fn test_success_response() {
        let data = json!({
            "exec": {
                "run": {"error": "", "text": "hi"},
                "mark": {
                    "error": "trace",
                    "text": "user output",
                    "success": [{"function": "t2", "note": "works", "points": 2.0}],
                    "missed": [{"function": "t1", "note": "", "points": 1.0}],
                },
            },
            "version": "v1",
        });
        let response = render(0, &data, &ReportSettings::default());

        assert_eq!(response.points, Some(2.0));
        assert_eq!(
            response.text.as_deref(),
            Some("<SCT:SECTION:RUN>hi\n<SCT:SECTION:MARK>t2: 2 => works\n")
        );
        assert_json_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "points": 2.0,
                "text": "<SCT:SECTION:RUN>hi\n<SCT:SECTION:MARK>t2: 2 => works\n",
                "error": {"key": "none", "text": ""},
            })
        );
    }

    #[test]
    fn test_debug_shows_missed_and_user_output() {
        let data = json!({"exec": {"mark": {
            "error": "",
            "text": "printed",
            "success": [],
            "missed": [{"function": "t1", "note": "", "points": 1.0}],
        }}});
        let text = render(0, &data, &debug()).text.unwrap();

        assert!(text.starts_with("<SCT:HEADER:DEBUGMODE>"));
        assert!(text.contains("printed\n"));
        assert!(text.contains("<SCT:SUBSECTION:MISSED>t1: 1\n"));
    }

    #[test]
    fn test_mark_section_hidden() {
        let data = json!({"exec": {"mark": {"error": "", "text": "x", "success": [], "missed": []}}});
        assert_eq!(render(0, &data, &ReportSettings::default()).text.unwrap(), "");

        let settings = ReportSettings {
            print_mark: false,
            ..Default::default()
        };
        let data = json!({"exec": {"mark": {
            "error": "", "text": "", "success": [{"function": "t", "note": "", "points": 1}], "missed": [],
        }}});
        let response = render(0, &data, &settings);
        assert_eq!(response.text.unwrap(), "");
        assert_eq!(response.points, Some(1.0));
    }

    #[test]
    fn test_failure_texts() {
        let response = render(3, &Value::Null, &ReportSettings::default());
        assert_eq!(response.points, None);
        assert_eq!(
            response.error.text,
            format::bold(&format::red("A timeout occurred while executing your code (3)."))
        );

        let hidden = error_text(4, &json!({"class": "IoError"}), &ReportSettings::default());
        assert!(hidden.contains("activate debug mode for details"));
        assert!(!hidden.contains("IoError"));

        let shown = error_text(
            4,
            &json!({"class": "IoError", "msg": "disk full", "tb": [{"index": 0, "context": "preparing"}]}),
            &debug(),
        );
        assert!(shown.contains("<SCT:HEADER:TRACEBACK>"));
        assert!(shown.contains("disk full"));
        assert!(shown.contains(" - <SCT:BOLD>0<!SCT:BOLD> <SCT:COLOR:BLUE>preparing<!SCT:COLOR:BLUE>\n"));
    }
}
