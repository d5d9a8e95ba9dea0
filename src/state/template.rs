//! File layout templates describing how artifacts are named.
//!
//! A layout such as `AWSLogs/{account_id}/{year}/{month}/{day}/{name}.json.gz`
//! names the fields captured from an artifact path. Time fields determine the
//! [`Granularity`] of the naming scheme and, when matched, the artifact's
//! timestamp. Go-template style placeholders (`{{ .year }}`) are accepted too.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use tracing::debug;

use super::StateError;
use super::granularity::{Granularity, TimeField};

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\.?([A-Za-z_][A-Za-z0-9_]*)\s*\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .expect("placeholder pattern is valid")
});

/// Compiled file layout template.
#[derive(Debug, Clone)]
pub struct FileLayout {
    template: String,
    fields: Vec<String>,
    pattern: Regex,
}

/// Fields captured from a path that matched a [`FileLayout`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutMatch {
    /// Every captured placeholder, by name.
    pub fields: BTreeMap<String, String>,
    /// Timestamp assembled from the captured time fields, if a year was captured.
    pub timestamp: Option<DateTime<Utc>>,
}

impl FileLayout {
    /// Compiles a template.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidLayout`] if a placeholder repeats or the
    /// template is empty.
    pub fn parse(template: &str) -> Result<Self, StateError> {
        if template.trim().is_empty() {
            return Err(StateError::invalid_layout(template, "template is empty"));
        }

        let mut fields = Vec::new();
        let mut pattern = String::from("^");
        let mut cursor = 0;

        for captures in PLACEHOLDER.captures_iter(template) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1).or(captures.get(2)))
            else {
                continue;
            };
            let name = name.as_str();
            if fields.iter().any(|existing| existing == name) {
                return Err(StateError::invalid_layout(
                    template,
                    format!("placeholder '{name}' appears more than once"),
                ));
            }

            pattern.push_str(&regex::escape(&template[cursor..whole.start()]));
            let group = match TimeField::from_name(name) {
                Some(TimeField::Year) => r"\d{4}",
                Some(_) => r"\d{2}",
                None => r"[^/]+?",
            };
            pattern.push_str(&format!("(?P<{name}>{group})"));
            fields.push(name.to_string());
            cursor = whole.end();
        }
        pattern.push_str(&regex::escape(&template[cursor..]));
        pattern.push('$');

        let pattern = Regex::new(&pattern)
            .map_err(|error| StateError::invalid_layout(template, error.to_string()))?;

        debug!(template, fields = ?fields, "compiled file layout");

        Ok(Self {
            template: template.to_string(),
            fields,
            pattern,
        })
    }

    /// The source template.
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Placeholder names in template order.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Time fields captured by the template.
    #[must_use]
    pub fn time_fields(&self) -> Vec<TimeField> {
        self.fields
            .iter()
            .filter_map(|name| TimeField::from_name(name))
            .collect()
    }

    /// Minimum time resolution derivable from names in this layout.
    #[must_use]
    pub fn granularity(&self) -> Granularity {
        Granularity::from_fields(&self.time_fields())
    }

    /// Matches a relative path against the layout.
    ///
    /// Returns `None` if the path does not follow the layout.
    #[must_use]
    pub fn extract(&self, path: &str) -> Option<LayoutMatch> {
        let captures = self.pattern.captures(path)?;
        let fields: BTreeMap<String, String> = self
            .fields
            .iter()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|value| (name.clone(), value.as_str().to_string()))
            })
            .collect();
        let timestamp = timestamp_from_fields(&fields);
        Some(LayoutMatch { fields, timestamp })
    }
}

fn timestamp_from_fields(fields: &BTreeMap<String, String>) -> Option<DateTime<Utc>> {
    let part = |field: TimeField, default: u32| -> Option<u32> {
        match fields.get(field.name()) {
            Some(value) => value.parse().ok(),
            None => Some(default),
        }
    };

    let year: i32 = fields.get(TimeField::Year.name())?.parse().ok()?;
    Utc.with_ymd_and_hms(
        year,
        part(TimeField::Month, 1)?,
        part(TimeField::Day, 1)?,
        part(TimeField::Hour, 0)?,
        part(TimeField::Minute, 0)?,
        part(TimeField::Second, 0)?,
    )
    .single()
}
