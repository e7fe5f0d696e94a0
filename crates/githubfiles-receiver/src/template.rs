//! Template rendering for file names and document fragments using Handlebars.
//!
//! Every template sees the same context:
//! - `Repo`: `Owner`, `Repo`, `Dir` of the target repository
//! - `Alert`: `Status`, `Labels`, `Annotations`, `StartsAt`, `EndsAt`,
//!   `GeneratorURL`, `Fingerprint`
//! - `Time`: render time
//! - `Data`: extra values supplied by the content strategy
//!
//! Helpers: `split` (also `Split`), `index`, `concat` and `quote`, which
//! emits a string as a double-quoted YAML scalar. Go-style references with a
//! leading dot (`{{ .Alert.Status }}`) are accepted.
//!
//! Strict mode is on, so a reference to a missing label is an error rather
//! than an empty string in a file path.

use chrono::Utc;
use handlebars::{
    handlebars_helper, Context as HbsContext, Handlebars, Helper, HelperResult, Output,
    RenderContext,
};
use serde::Serialize;
use serde_json::Value as Json;
use std::collections::HashMap;

use crate::alert::Alert;
use crate::error::TemplateError;

/// Timestamp layout used in rendered documents.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

handlebars_helper!(split_helper: |s: str, sep: str| s.split(sep).collect::<Vec<_>>());

// JSON string literals are valid double-quoted YAML scalars
handlebars_helper!(quote_helper: |s: str| serde_json::to_string(s).unwrap_or_default());

handlebars_helper!(index_helper: |list: Json, i: u64| usize::try_from(i)
    .ok()
    .and_then(|i| list.get(i))
    .cloned()
    .unwrap_or(Json::Null));

/// Helper function to concatenate strings in templates.
/// Usage: `{{concat "prefix" variable "suffix"}}`
fn concat_helper(
    h: &Helper,
    _: &Handlebars,
    _: &HbsContext,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let mut result = String::new();
    for param in h.params() {
        if let Some(s) = param.value().as_str() {
            result.push_str(s);
        } else {
            result.push_str(param.value().to_string().trim_matches('"'));
        }
    }
    out.write(&result)?;
    Ok(())
}

/// Coordinates of the repository files are written to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RepoCoordinates {
    pub owner: String,
    pub repo: String,
    /// Base directory inside the repository; may be empty
    pub dir: String,
}

impl RepoCoordinates {
    /// Parse `owner/name` plus a base directory.
    #[must_use]
    pub fn parse(full_name: &str, dir: &str) -> Option<Self> {
        let (owner, repo) = full_name.split_once('/')?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            dir: dir.trim_matches('/').to_string(),
        })
    }

    /// Full repository name (owner/repo)
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Join a rendered file name onto the base directory.
    #[must_use]
    pub fn join(&self, file_name: &str) -> String {
        let file_name = file_name.trim_start_matches('/');
        if self.dir.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.dir, file_name)
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AlertView<'a> {
    status: &'static str,
    labels: &'a HashMap<String, String>,
    annotations: &'a HashMap<String, String>,
    starts_at: String,
    ends_at: String,
    #[serde(rename = "GeneratorURL")]
    generator_url: &'a str,
    fingerprint: &'a str,
}

impl<'a> From<&'a Alert> for AlertView<'a> {
    fn from(alert: &'a Alert) -> Self {
        Self {
            status: alert.status.as_str(),
            labels: &alert.labels,
            annotations: &alert.annotations,
            starts_at: alert.starts_at.format(TIME_FORMAT).to_string(),
            ends_at: alert.ends_at.format(TIME_FORMAT).to_string(),
            generator_url: &alert.generator_url,
            fingerprint: &alert.fingerprint,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TemplateContext<'a, T: Serialize> {
    repo: &'a RepoCoordinates,
    alert: AlertView<'a>,
    time: String,
    data: Option<&'a T>,
}

/// Renders templates against an alert and the target repository.
pub struct Templater {
    handlebars: Handlebars<'static>,
    repo: RepoCoordinates,
}

impl Templater {
    #[must_use]
    pub fn new(repo: RepoCoordinates) -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        // Output is file paths and markdown, never HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("split", Box::new(split_helper));
        handlebars.register_helper("Split", Box::new(split_helper));
        handlebars.register_helper("index", Box::new(index_helper));
        handlebars.register_helper("quote", Box::new(quote_helper));
        handlebars.register_helper("concat", Box::new(concat_helper));

        Self { handlebars, repo }
    }

    #[must_use]
    pub fn repo(&self) -> &RepoCoordinates {
        &self.repo
    }

    /// Render `template` for `alert`.
    pub fn render(&self, template: &str, alert: &Alert) -> Result<String, TemplateError> {
        self.render_with_data::<()>(template, alert, None)
    }

    /// Render `template` for `alert`, exposing `data` as `Data`.
    pub fn render_with_data<T: Serialize>(
        &self,
        template: &str,
        alert: &Alert,
        data: Option<&T>,
    ) -> Result<String, TemplateError> {
        let context = TemplateContext {
            repo: &self.repo,
            alert: AlertView::from(alert),
            time: Utc::now().format(TIME_FORMAT).to_string(),
            data,
        };
        let template = normalize_references(template);
        Ok(self.handlebars.render_template(&template, &context)?)
    }
}

/// Accept Go-style references (`{{ .Alert.Status }}`, `{{ Split .X "-" }}`,
/// `{{- . -}}`) alongside plain Handlebars paths.
fn normalize_references(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        out.push_str("{{");
        out.push_str(&normalize_expression(&after[..close]));
        out.push_str("}}");
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

fn normalize_expression(expr: &str) -> String {
    // Comments pass through untouched
    if expr.starts_with('!') {
        return expr.to_string();
    }

    let mut expr = expr.to_string();
    if expr.starts_with("- ") {
        expr.replace_range(..1, "~");
    }
    if expr.ends_with(" -") {
        let last = expr.len() - 1;
        expr.replace_range(last.., "~");
    }

    let chars: Vec<char> = expr.chars().collect();
    let mut out = String::with_capacity(expr.len());
    let mut quote = None;
    for (i, &c) in chars.iter().enumerate() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            out.push(c);
            continue;
        }
        if c == '"' || c == '\'' {
            quote = Some(c);
            out.push(c);
            continue;
        }

        let at_token_start = i == 0 || matches!(chars[i - 1], ' ' | '\t' | '\n' | '(' | '~' | '{');
        if c == '.' && at_token_start {
            match chars.get(i + 1) {
                Some(next) if next.is_alphabetic() || *next == '_' => continue,
                None | Some(' ' | '\t' | '\n' | ')' | '~') => {
                    out.push_str("this");
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}
