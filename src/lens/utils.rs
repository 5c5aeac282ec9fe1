//! Shared output helpers for lens results

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default maximum length for AS names in tables
pub const DEFAULT_NAME_MAX_LEN: usize = 40;

/// Output format shared by all commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Pretty table with borders (default)
    #[default]
    Table,
    /// Markdown table
    Markdown,
    /// Compact JSON on a single line
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

impl OutputFormat {
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json | Self::JsonPretty)
    }

    pub fn all_names() -> &'static [&'static str] {
        &["table", "markdown", "json", "json-pretty"]
    }

    /// Serialize `value` for the JSON variants
    ///
    /// Returns `None` for table formats.
    pub fn render_json<T: Serialize>(&self, value: &T) -> Option<Result<String, serde_json::Error>> {
        match self {
            Self::Json => Some(serde_json::to_string(value)),
            Self::JsonPretty => Some(serde_json::to_string_pretty(value)),
            Self::Table | Self::Markdown => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Markdown => write!(f, "markdown"),
            Self::Json => write!(f, "json"),
            Self::JsonPretty => write!(f, "json-pretty"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" | "pretty" => Ok(Self::Table),
            "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            "json-pretty" | "jsonpretty" => Ok(Self::JsonPretty),
            _ => Err(format!(
                "Unknown output format '{}'. Valid formats: {}",
                s,
                Self::all_names().join(", ")
            )),
        }
    }
}

/// Truncate a string to `max_len` characters, ending in "..." when cut
///
/// ```
/// use netinfo::lens::utils::truncate_name;
///
/// assert_eq!(truncate_name("GOOGLE", 20), "GOOGLE");
/// assert_eq!(truncate_name("CLOUDFLARENET - Cloudflare, Inc., US", 16), "CLOUDFLARENET...");
/// ```
pub fn truncate_name(name: &str, max_len: usize) -> String {
    if name.chars().count() <= max_len {
        name.to_string()
    } else {
        let truncated: String = name.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

/// Render an optional value for table output, `-` when absent
pub fn or_dash<T: fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("Short", 20), "Short");
        assert_eq!(truncate_name("", 20), "");
        assert_eq!(
            truncate_name("LVLT-1 - Level 3 Parent, LLC, US", 12),
            "LVLT-1 - ..."
        );
        assert_eq!(truncate_name("Hello", 3), "...");
    }

    #[test]
    fn test_truncate_counts_chars_not_bytes() {
        assert_eq!(truncate_name("Télécom Québec", 10), "Télécom...");
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(OutputFormat::from_str("table").unwrap(), OutputFormat::Table);
        assert_eq!(OutputFormat::from_str("MD").unwrap(), OutputFormat::Markdown);
        assert_eq!(OutputFormat::from_str("json").unwrap(), OutputFormat::Json);
        assert_eq!(
            OutputFormat::from_str("json-pretty").unwrap(),
            OutputFormat::JsonPretty
        );
        let err = OutputFormat::from_str("xml").unwrap_err();
        assert!(err.contains("json-pretty"));
    }

    #[test]
    fn test_render_json() {
        let value = serde_json::json!({"as_num": 13335});
        assert_eq!(
            OutputFormat::Json.render_json(&value).unwrap().unwrap(),
            r#"{"as_num":13335}"#
        );
        assert!(OutputFormat::Table.render_json(&value).is_none());
        assert!(OutputFormat::JsonPretty.is_json());
        assert!(!OutputFormat::Markdown.is_json());
    }

    #[test]
    fn test_or_dash() {
        assert_eq!(or_dash(Some(64500)), "64500");
        assert_eq!(or_dash::<u32>(None), "-");
    }
}
