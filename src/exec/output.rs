use serde::{Deserialize, Serialize};

/// Captured result of a plain run or a test-runner pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub error: String,
    pub text: String,
}

impl Text {
    pub fn new(error: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkEntry {
    pub function: String,
    pub note: String,
    pub points: f64,
}

/// Result of the mark pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    pub error: String,
    pub text: String,
    #[serde(default)]
    pub success: Vec<MarkEntry>,
    #[serde(default)]
    pub missed: Vec<MarkEntry>,
}

impl Mark {
    pub fn new(error: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn add(&mut self, entry: MarkEntry, passed: bool) {
        if passed {
            self.success.push(entry);
        } else {
            self.missed.push(entry);
        }
    }

    /// Sum of the points of every passed predicate
    pub fn score(&self) -> f64 {
        self.success.iter().map(|entry| entry.points).sum()
    }
}

/// Per-driver results of one request; drivers that did not run are omitted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<Text>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pytest: Option<Text>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark: Option<Mark>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn test_missing_drivers_are_omitted() {
        let output = ExecOutput {
            run: Some(Text::new("", "hi\n")),
            ..Default::default()
        };
        assert_json_eq!(
            serde_json::to_value(&output).unwrap(),
            json!({"run": {"error": "", "text": "hi\n"}})
        );
    }

    #[test]
    fn test_mark_score() {
        let mut mark = Mark::new("", "");
        mark.add(
            MarkEntry {
                function: "t1".to_string(),
                note: "first".to_string(),
                points: 1.0,
            },
            false,
        );
        mark.add(
            MarkEntry {
                function: "t2".to_string(),
                note: "second".to_string(),
                points: 2.0,
            },
            true,
        );
        assert_eq!(mark.score(), 2.0);
        assert_eq!(mark.missed[0].function, "t1");
    }
}
