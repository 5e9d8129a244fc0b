use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::ReportKey;
use crate::compose::ReportDocument;

/// Where a rendered report lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub uri: String,
    pub media_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error("template error: {0}")]
    Template(String),

    #[error("failed to write report: {0}")]
    Io(String),
}

/// Turns a composed document into an artifact
#[async_trait::async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, document: &ReportDocument, key: &ReportKey) -> Result<ArtifactRef, RenderError>;
}

const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
  body { font-family: sans-serif; max-width: 760px; margin: 2em auto; color: #222; }
  h1 { border-bottom: 2px solid #333; padding-bottom: .3em; }
  .source > h2 { color: #555; margin-top: 1.6em; }
  .article { margin: 1em 0; }
  .article h3 { margin-bottom: .2em; }
  .article a { color: #0b57d0; text-decoration: none; }
  .meta { color: #888; font-size: .85em; }
</style>
</head>
<body>
<h1>{title}</h1>
<p class="meta">{date}</p>
{articles}
</body>
</html>
"#;

/// Fills an HTML template and writes `report-<key>.html` into `output_dir`.
pub struct HtmlRenderer {
    output_dir: PathBuf,
    template: Option<PathBuf>,
    offset: FixedOffset,
}

impl HtmlRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { output_dir: output_dir.into(), template: None, offset: Utc.fix() }
    }

    /// Template file with `{title}`, `{date}` and `{articles}` placeholders
    pub fn with_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.template = Some(path.into());
        self
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    async fn load_template(&self) -> Result<String, RenderError> {
        let Some(path) = &self.template else {
            return Ok(DEFAULT_TEMPLATE.to_string());
        };
        let template = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RenderError::Template(format!("cannot read {}: {}", path.display(), e)))?;
        if !template.contains("{articles}") {
            return Err(RenderError::Template(format!("{} has no {{articles}} placeholder", path.display())));
        }
        Ok(template)
    }

    pub fn articles_html(&self, document: &ReportDocument) -> String {
        let mut out = String::new();
        for section in &document.sections {
            let name = escape_html(&section.name);
            let _ = writeln!(out, "<section class=\"source\">\n<h2>{}</h2>", name);
            for entry in &section.entries {
                let _ = writeln!(
                    out,
                    "<div class=\"article\">\n<h3><a href=\"{}\" target=\"_blank\">{}</a></h3>\n<p class=\"summary\">{}</p>",
                    escape_html(&entry.url),
                    escape_html(&entry.title),
                    escape_html(&entry.summary),
                );
                let when = entry
                    .published_at
                    .map(|p| format!(" · {}", p.with_timezone(&self.offset).format("%Y-%m-%d %H:%M")))
                    .unwrap_or_default();
                let _ = writeln!(out, "<p class=\"meta\">来源: {}{}</p>\n</div>", name, when);
            }
            out.push_str("</section>\n");
        }
        out
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// File-name safe, one-to-one form of a report key: `<bucket>[.<scope>]`.
/// Bytes other than ASCII alphanumerics and `-` become `_xx` (hex), so `.`
/// only ever separates the two parts and distinct keys never share a file.
fn file_stem(key: &ReportKey) -> String {
    let mut stem = encode_component(&key.bucket);
    if let Some(scope) = &key.scope {
        stem.push('.');
        stem.push_str(&encode_component(scope));
    }
    stem
}

fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(b as char);
        } else {
            let _ = write!(out, "_{:02x}", b);
        }
    }
    out
}

#[async_trait::async_trait]
impl Renderer for HtmlRenderer {
    async fn render(&self, document: &ReportDocument, key: &ReportKey) -> Result<ArtifactRef, RenderError> {
        let template = self.load_template().await?;
        let date = document.generated_at.with_timezone(&self.offset).format("%Y-%m-%d %H:%M").to_string();

        // {articles} last, so placeholders inside article text stay literal
        let html = template
            .replace("{title}", &escape_html(&document.title))
            .replace("{date}", &date)
            .replace("{articles}", &self.articles_html(document));

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| RenderError::Io(format!("{}: {}", self.output_dir.display(), e)))?;
        let path = self.output_dir.join(format!("report-{}.html", file_stem(key)));
        tokio::fs::write(&path, html.as_bytes())
            .await
            .map_err(|e| RenderError::Io(format!("{}: {}", path.display(), e)))?;

        debug!(path = %path.display(), "report rendered");
        Ok(ArtifactRef {
            uri: path.to_string_lossy().to_string(),
            media_type: "text/html".to_string(),
            size_bytes: html.len() as u64,
        })
    }
}
