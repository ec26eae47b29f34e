//! Text extraction for uploaded documents.
//!
//! The engine consumes extraction through the [`TextExtractor`] trait so that
//! binary formats (PDF, OOXML) can be handled by an external service. The
//! built-in [`PlainTextExtractor`] covers the text formats an operator
//! usually uploads: plain text, Markdown, CSV, JSON and HTML.

use crate::error::{RagError, Result};

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_JSON: &str = "application/json";
pub const MIME_HTML: &str = "text/html";

/// Turns raw upload bytes into plain UTF-8 text.
///
/// Implementations run on a blocking thread; they may do CPU-heavy work.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], mime: &str) -> Result<String>;
}

/// Extractor for UTF-8 text formats.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8], mime: &str) -> Result<String> {
        let base = mime.split(';').next().unwrap_or(mime).trim().to_lowercase();
        match base.as_str() {
            MIME_TEXT | MIME_MARKDOWN | MIME_CSV | MIME_JSON => decode(bytes),
            MIME_HTML => decode(bytes).map(|html| strip_html(&html)),
            other => Err(RagError::input(format!(
                "unsupported content type: {}",
                other
            ))),
        }
    }
}

fn decode(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let text = std::str::from_utf8(bytes)
        .map_err(|e| RagError::input(format!("document is not valid UTF-8: {}", e)))?;
    Ok(text.replace("\r\n", "\n"))
}

/// Drops tags, `<script>`/`<style>` bodies and decodes the common entities.
/// Block-level closing tags become line breaks so paragraphs survive.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        let after = &rest[lt..];
        let Some(gt) = after.find('>') else {
            // Unterminated tag: keep the text as-is.
            out.push_str(after);
            rest = "";
            break;
        };
        let tag = after[1..gt].trim().to_ascii_lowercase();
        rest = &after[gt + 1..];

        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("");
        if !tag.starts_with('/') && (name == "script" || name == "style") {
            let close = format!("</{}", name);
            match rest.to_ascii_lowercase().find(&close) {
                Some(pos) => {
                    let tail = &rest[pos..];
                    rest = tail.find('>').map(|g| &tail[g + 1..]).unwrap_or("");
                }
                None => rest = "",
            }
            continue;
        }
        if matches!(
            name,
            "p" | "div" | "br" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "section"
        ) {
            out.push('\n');
            if tag.starts_with('/') && name != "li" && name != "tr" {
                out.push('\n');
            }
        }
    }
    out.push_str(rest);

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    let mut lines: Vec<&str> = Vec::new();
    let mut blank_run = 0;
    for line in decoded.lines().map(str::trim_end) {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(line);
    }
    lines.join("\n").trim().to_string()
}

/// Guesses a content type from a file name's extension.
pub fn mime_from_name(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" | "mdx" => MIME_MARKDOWN,
        "csv" => MIME_CSV,
        "json" => MIME_JSON,
        "html" | "htm" => MIME_HTML,
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => MIME_TEXT,
    }
}
