use anyhow::{Result, anyhow};
use serde_json::{Map, Value};

use super::output::{Mark, MarkEntry};

const TOKEN_PREFIX: &str = "DATA_";
const TOKEN_LENGTH: usize = 20;

/// Fresh per-invocation token delimiting the harness result on stdout
pub fn sentinel_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_LENGTH];
    getrandom::fill(&mut bytes).map_err(|e| anyhow!("Failed to generate sentinel token: {e}"))?;

    let suffix: String = bytes.iter().map(|b| char::from(b'A' + b % 26)).collect();
    Ok(format!("{TOKEN_PREFIX}{suffix}"))
}

/// Split harness stdout into the text printed before the opening sentinel and
/// the JSON blob between the sentinels
///
/// The last opening sentinel and the first closing sentinel after it win. If
/// either marker is missing or the blob is not JSON, the whole output is
/// returned as text together with an empty object.
pub fn split_output(output: &str, token: &str) -> (String, Value) {
    let open = format!("<{token}>");
    let close = format!("</{token}>");

    let parsed = output.rfind(&open).and_then(|start| {
        let body = start + open.len();
        let end = body + output[body..].find(&close)?;
        match serde_json::from_str(&output[body..end]) {
            Ok(data) => Some((output[..start].to_string(), data)),
            Err(e) => {
                log::warn!("Malformed mark result: {e}");
                None
            }
        }
    });

    parsed.unwrap_or_else(|| (output.to_string(), Value::Object(Map::new())))
}

/// Build the mark result from the `{test: {reg, suc}, args: {reg, suc}}` blob
pub fn collect(error: String, text: String, data: &Value) -> Mark {
    let mut mark = Mark::new(error, text);
    let Some(sections) = data.as_object() else {
        return mark;
    };

    for section in sections.values() {
        for entry in entries(section.get("reg")) {
            mark.add(entry, false);
        }
        for entry in entries(section.get("suc")) {
            mark.add(entry, true);
        }
    }
    mark
}

/// Entries travel as `[function, note, points]` triples; anything else is skipped
fn entries(list: Option<&Value>) -> impl Iterator<Item = MarkEntry> + '_ {
    list.and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| match entry.as_array()?.as_slice() {
            [function, note, points] => Some(MarkEntry {
                function: function.as_str()?.to_string(),
                note: note.as_str().unwrap_or_default().to_string(),
                points: points.as_f64().unwrap_or_default(),
            }),
            _ => None,
        })
}
