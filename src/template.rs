/// Value-key templates: expand `#{column}` placeholders against a row into a
/// metric key fragment.
use crate::value::Row;
use regex::Regex;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\{([A-Za-z0-9_]+)\}").unwrap());

/// Characters that may not appear in a metric key.
static INVALID_KEY_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^-a-zA-Z0-9_]").unwrap());

/// Why a placeholder could not be expanded. Each variant names the column
/// the placeholder referred to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    ColumnNotFound(String),
    NullValue(String),
    EmptyValue(String),
}

impl TemplateError {
    /// The placeholder column that failed to expand.
    pub fn column(&self) -> &str {
        match self {
            TemplateError::ColumnNotFound(c)
            | TemplateError::NullValue(c)
            | TemplateError::EmptyValue(c) => c,
        }
    }
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::ColumnNotFound(c) => write!(f, "{c:?} not exists in columns"),
            TemplateError::NullValue(c) => write!(f, "{c:?} value is null"),
            TemplateError::EmptyValue(c) => write!(f, "{c:?} is empty"),
        }
    }
}

impl std::error::Error for TemplateError {}

/// Replace every `#{name}` in `template` with the sanitized string form of
/// `row[name]`. A template without placeholders comes back unchanged.
pub fn expand(template: &str, row: &Row) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(column)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let column = column.as_str();

        out.push_str(&template[last..whole.start()]);
        out.push_str(&fragment(column, row)?);
        last = whole.end();
    }
    out.push_str(&template[last..]);

    Ok(out)
}

fn fragment(column: &str, row: &Row) -> Result<String, TemplateError> {
    let value = row
        .get(column)
        .ok_or_else(|| TemplateError::ColumnNotFound(column.to_string()))?;
    if value.is_null() {
        return Err(TemplateError::NullValue(column.to_string()));
    }

    let rendered = value.to_string();
    let trimmed = rendered.trim();
    if trimmed.is_empty() {
        return Err(TemplateError::EmptyValue(column.to_string()));
    }

    Ok(sanitize(trimmed))
}

/// Replace any character outside `[-a-zA-Z0-9_]` with `_`.
pub fn sanitize(s: &str) -> String {
    INVALID_KEY_CHARS.replace_all(s, "_").into_owned()
}
