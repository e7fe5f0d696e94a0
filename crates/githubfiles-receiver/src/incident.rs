//! Running incident log kept in a single markdown document.
//!
//! Layout of a document:
//!
//! ```text
//! ---
//! <YAML header>
//! ---
//! <free text, optional>
//! ---                      (present only with free text)
//!
//! <newest timeline entry>
//!
//! <older entries ...>
//! ```
//!
//! Every merge regenerates the header, keeps the free text byte-for-byte and
//! prepends one timeline entry. The marker line is reserved: a `---` line in
//! a timeline entry would be read back as the end of a free-text section.

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::alert::Alert;
use crate::error::MergeError;
use crate::template::{Templater, TIME_FORMAT};

/// Line separating the header, free text and timeline.
pub const MARKER: &str = "---";

/// Header fields read back from existing documents.
pub const STATE_FIELD: &str = "state";
pub const STARTS_AT_FIELD: &str = "startsAt";
pub const ENDS_AT_FIELD: &str = "endsAt";

/// Default header template.
pub const DEFAULT_HEADER_TEMPLATE: &str = r#"title: {{quote Data.Title}}
state: {{Data.State}}
startsAt: "{{Data.StartsAt}}"
endsAt: "{{Data.EndsAt}}"
"#;

/// Default timeline entry template.
pub const DEFAULT_ENTRY_TEMPLATE: &str = "**{{Data.State}}** - {{Data.Timestamp}}";

/// State shown for firing alerts.
pub const STATE_INVESTIGATING: &str = "Investigating";
/// State shown for resolved alerts.
pub const STATE_RESOLVED: &str = "Resolved";

/// Parsed view of an incident document.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentDocument {
    pub header: Mapping,
    /// Authored text between the header and the timeline
    pub free_text: Option<String>,
    /// Raw timeline text, newest entry first
    pub timeline: String,
}

/// Byte range `(start, end)` of the first line equal to [`MARKER`]; `end`
/// includes the line break.
fn find_marker_line(text: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let end = offset + line.len();
        if line.trim_end_matches(['\n', '\r']) == MARKER {
            return Some((offset, end));
        }
        offset = end;
    }
    None
}

impl IncidentDocument {
    /// Parse an existing document.
    pub fn parse(content: &str) -> Result<Self, MergeError> {
        let rest = match find_marker_line(content) {
            Some((0, end)) => &content[end..],
            _ => return Err(MergeError::MissingHeader),
        };
        let (header_end, body_start) =
            find_marker_line(rest).ok_or(MergeError::UnterminatedHeader)?;

        let header_text = &rest[..header_end];
        let header = if header_text.trim().is_empty() {
            Mapping::new()
        } else {
            serde_yaml::from_str(header_text)?
        };

        let body = &rest[body_start..];
        let (free_text, timeline) = match find_marker_line(body) {
            Some((start, end)) => (Some(body[..start].to_string()), &body[end..]),
            None => (None, body),
        };

        let document = Self {
            header,
            free_text,
            timeline: timeline.to_string(),
        };
        for field in [STATE_FIELD, STARTS_AT_FIELD, ENDS_AT_FIELD] {
            document.header_str(field)?;
        }
        Ok(document)
    }

    /// Read a header field that must be a string when present.
    pub fn header_str(&self, field: &'static str) -> Result<Option<&str>, MergeError> {
        match self.header.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(MergeError::FieldType { field }),
        }
    }

    /// Timeline entries, newest first.
    #[must_use]
    pub fn entries(&self) -> Vec<&str> {
        self.timeline
            .split("\n\n")
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .collect()
    }
}

/// Values exposed to the header and entry templates as `Data`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IncidentFields {
    pub title: String,
    pub state: &'static str,
    pub starts_at: String,
    pub ends_at: String,
    /// Time of the event this entry records
    pub timestamp: String,
}

impl IncidentFields {
    #[must_use]
    pub fn from_alert(alert: &Alert) -> Self {
        let (state, event_time) = if alert.is_resolved() {
            (STATE_RESOLVED, alert.ends_at)
        } else {
            (STATE_INVESTIGATING, alert.starts_at)
        };

        Self {
            title: alert.name().to_string(),
            state,
            starts_at: alert.starts_at.format(TIME_FORMAT).to_string(),
            ends_at: alert.ends_at.format(TIME_FORMAT).to_string(),
            timestamp: event_time.format(TIME_FORMAT).to_string(),
        }
    }
}

/// Content strategy maintaining an incident log across firings.
#[derive(Debug, Clone)]
pub struct IncidentMerger {
    header_template: String,
    entry_template: String,
}

impl Default for IncidentMerger {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_TEMPLATE, DEFAULT_ENTRY_TEMPLATE)
    }
}

impl IncidentMerger {
    #[must_use]
    pub fn new(header_template: impl Into<String>, entry_template: impl Into<String>) -> Self {
        Self {
            header_template: header_template.into(),
            entry_template: entry_template.into(),
        }
    }

    /// Merge `alert` into `existing` (empty for a new document).
    pub fn merge(
        &self,
        templater: &Templater,
        existing: &str,
        alert: &Alert,
    ) -> Result<String, MergeError> {
        let mut fields = IncidentFields::from_alert(alert);
        let mut free_text = None;
        let mut timeline = String::new();

        if !existing.trim().is_empty() {
            let document = IncidentDocument::parse(existing)?;
            if let Some(starts_at) = document.header_str(STARTS_AT_FIELD)? {
                let parsed = NaiveDateTime::parse_from_str(starts_at, TIME_FORMAT).map_err(
                    |source| MergeError::Timestamp {
                        field: STARTS_AT_FIELD,
                        value: starts_at.to_string(),
                        source,
                    },
                )?;
                fields.starts_at = parsed.format(TIME_FORMAT).to_string();
            }
            free_text = document.free_text;
            timeline = document.timeline;
        }

        let header = templater.render_with_data(&self.header_template, alert, Some(&fields))?;
        if !header.trim().is_empty() {
            // Refuse to write a header the next merge could not read
            serde_yaml::from_str::<Mapping>(&header)?;
        }
        let entry = templater.render_with_data(&self.entry_template, alert, Some(&fields))?;

        let mut out = String::with_capacity(
            header.len() + entry.len() + timeline.len() + free_text.as_ref().map_or(0, String::len) + 16,
        );
        out.push_str(MARKER);
        out.push('\n');
        out.push_str(&header);
        if !header.is_empty() && !header.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(MARKER);
        out.push('\n');
        if let Some(text) = &free_text {
            out.push_str(text);
            out.push_str(MARKER);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(entry.trim_end());
        out.push('\n');
        out.push_str(&timeline);

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertStatus;
    use crate::template::RepoCoordinates;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn templater() -> Templater {
        Templater::new(RepoCoordinates::parse("acme/status", "content/issues").unwrap())
    }

    fn alert(status: AlertStatus, starts: (u32, u32), ends: Option<(u32, u32)>) -> Alert {
        let ends_at = ends.map_or_else(
            || Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap(),
            |(h, m)| Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap(),
        );
        Alert {
            status,
            labels: HashMap::from([
                ("alertname".to_string(), "disk-full".to_string()),
                ("githubfilesenabled".to_string(), "true".to_string()),
            ]),
            annotations: HashMap::new(),
            starts_at: Utc.with_ymd_and_hms(2024, 1, 1, starts.0, starts.1, 0).unwrap(),
            ends_at,
            generator_url: String::new(),
            fingerprint: String::new(),
        }
    }

    fn header_value<'a>(doc: &'a IncidentDocument, field: &'static str) -> &'a str {
        doc.header_str(field).unwrap().unwrap()
    }

    #[test]
    fn test_new_document() {
        let merger = IncidentMerger::default();
        let out = merger
            .merge(&templater(), "", &alert(AlertStatus::Firing, (0, 0), None))
            .unwrap();

        assert_eq!(
            out,
            "---\ntitle: \"disk-full\"\nstate: Investigating\nstartsAt: \"2024-01-01 00:00:00\"\n\
             endsAt: \"0001-01-01 00:00:00\"\n---\n\n**Investigating** - 2024-01-01 00:00:00\n"
        );

        let doc = IncidentDocument::parse(&out).unwrap();
        assert_eq!(header_value(&doc, STATE_FIELD), "Investigating");
        assert_eq!(header_value(&doc, STARTS_AT_FIELD), "2024-01-01 00:00:00");
        assert!(doc.free_text.is_none());
        assert_eq!(doc.entries().len(), 1);
    }

    #[test]
    fn test_title_with_quotes_and_backslashes_stays_valid_yaml() {
        let merger = IncidentMerger::default();
        let templater = templater();
        let name = r#"disk "full" on C:\data"#;
        let mut firing = alert(AlertStatus::Firing, (0, 0), None);
        firing
            .labels
            .insert("alertname".to_string(), name.to_string());

        let created = merger.merge(&templater, "", &firing).unwrap();
        let merged = merger.merge(&templater, &created, &firing).unwrap();

        let doc = IncidentDocument::parse(&merged).unwrap();
        assert_eq!(doc.header_str("title").unwrap(), Some(name));
        assert_eq!(doc.entries().len(), 2);
    }

    #[test]
    fn test_resolve_preserves_start_and_prepends_entry() {
        let merger = IncidentMerger::default();
        let templater = templater();
        let first = merger
            .merge(&templater, "", &alert(AlertStatus::Firing, (0, 0), None))
            .unwrap();
        // A later firing may report a different start; the document keeps the original
        let second = merger
            .merge(
                &templater,
                &first,
                &alert(AlertStatus::Resolved, (0, 30), Some((1, 0))),
            )
            .unwrap();

        let doc = IncidentDocument::parse(&second).unwrap();
        assert_eq!(header_value(&doc, STATE_FIELD), "Resolved");
        assert_eq!(header_value(&doc, STARTS_AT_FIELD), "2024-01-01 00:00:00");
        assert_eq!(header_value(&doc, ENDS_AT_FIELD), "2024-01-01 01:00:00");
        assert_eq!(
            doc.entries(),
            vec![
                "**Resolved** - 2024-01-01 01:00:00",
                "**Investigating** - 2024-01-01 00:00:00",
            ]
        );
    }

    #[test]
    fn test_free_text_survives_repeated_merges() {
        let merger = IncidentMerger::default();
        let templater = templater();
        let free_text = "## Postmortem\n\nRoot cause: log rotation was disabled.\n  trailing spaces  \n\n";

        let created = merger
            .merge(&templater, "", &alert(AlertStatus::Firing, (0, 0), None))
            .unwrap();
        // Operator edits the file and adds a write-up between header and timeline
        let doc = IncidentDocument::parse(&created).unwrap();
        let edited = created.replacen(
            &format!("{MARKER}\n{}", doc.timeline),
            &format!("{MARKER}\n{free_text}{MARKER}\n{}", doc.timeline),
            1,
        );

        let mut content = edited;
        for i in 0..5 {
            let status = if i % 2 == 0 {
                AlertStatus::Resolved
            } else {
                AlertStatus::Firing
            };
            content = merger
                .merge(&templater, &content, &alert(status, (0, 0), Some((1, i))))
                .unwrap();
            let doc = IncidentDocument::parse(&content).unwrap();
            assert_eq!(doc.free_text.as_deref(), Some(free_text));
        }

        let doc = IncidentDocument::parse(&content).unwrap();
        assert_eq!(doc.entries().len(), 6);
    }

    #[test]
    fn test_body_without_second_marker_is_timeline() {
        let doc = IncidentDocument::parse("---\nstate: Investigating\n---\n\nentry one\n").unwrap();
        assert!(doc.free_text.is_none());
        assert_eq!(doc.timeline, "\nentry one\n");
    }

    #[test]
    fn test_everything_after_second_marker_is_timeline() {
        let doc =
            IncidentDocument::parse("---\na: b\n---\nnotes\n---\n\nnew\n\nold\n---\nolder\n")
                .unwrap();
        assert_eq!(doc.free_text.as_deref(), Some("notes\n"));
        assert_eq!(doc.timeline, "\nnew\n\nold\n---\nolder\n");
    }

    #[test]
    fn test_missing_header_fails() {
        let err = IncidentDocument::parse("just some text\n").unwrap_err();
        assert!(matches!(err, MergeError::MissingHeader));
    }

    #[test]
    fn test_unterminated_header_fails() {
        let err = IncidentDocument::parse("---\nstate: Investigating\n").unwrap_err();
        assert!(matches!(err, MergeError::UnterminatedHeader));
    }

    #[test]
    fn test_invalid_yaml_fails() {
        let err = IncidentDocument::parse("---\n: [unbalanced\n---\n").unwrap_err();
        assert!(matches!(err, MergeError::HeaderYaml(_)));
    }

    #[test]
    fn test_non_string_starts_at_fails_merge() {
        let merger = IncidentMerger::default();
        let existing = "---\nstate: Investigating\nstartsAt: [2024]\n---\n\nentry\n";
        let err = merger
            .merge(&templater(), existing, &alert(AlertStatus::Firing, (0, 0), None))
            .unwrap_err();
        assert!(matches!(err, MergeError::FieldType { field: "startsAt" }));
    }

    #[test]
    fn test_unparseable_starts_at_fails_merge() {
        let merger = IncidentMerger::default();
        let existing = "---\nstartsAt: \"yesterday\"\n---\n\nentry\n";
        let err = merger
            .merge(&templater(), existing, &alert(AlertStatus::Firing, (0, 0), None))
            .unwrap_err();
        assert!(matches!(err, MergeError::Timestamp { .. }));
    }

    #[test]
    fn test_header_template_must_render_a_mapping() {
        let merger = IncidentMerger::new("- not\n- a mapping\n", DEFAULT_ENTRY_TEMPLATE);
        let err = merger
            .merge(&templater(), "", &alert(AlertStatus::Firing, (0, 0), None))
            .unwrap_err();
        assert!(matches!(err, MergeError::HeaderYaml(_)));
    }

    #[test]
    fn test_custom_templates() {
        let merger = IncidentMerger::new(
            "section: issue\nresolved: {{#if (eq Data.State \"Resolved\")}}true{{else}}false{{/if}}\n",
            "*{{Data.State}}* - {{Alert.Labels.alertname}} ({{Repo.Dir}})",
        );
        let out = merger
            .merge(
                &templater(),
                "",
                &alert(AlertStatus::Resolved, (0, 0), Some((2, 0))),
            )
            .unwrap();
        assert_eq!(
            out,
            "---\nsection: issue\nresolved: true\n---\n\n*Resolved* - disk-full (content/issues)\n"
        );
    }
}
