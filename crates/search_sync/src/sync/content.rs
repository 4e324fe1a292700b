//! Body text extraction for indexing
//!
//! Only runs for documents the engine confirmed as new; everything else
//! is decided from headers alone.

use mailparse::{parse_mail, ParsedMail};

use crate::types::error::{Result, SyncError};

/// Extract indexable text from a raw RFC 822 message.
///
/// All `text/plain` parts are concatenated. Messages without a plain part
/// fall back to their `text/html` parts with markup stripped.
pub fn extract_text(raw: &[u8]) -> Result<String> {
    if raw.is_empty() {
        return Err(SyncError::Parse("Empty message source".to_string()));
    }

    let parsed = parse_mail(raw)?;

    let mut plain = Vec::new();
    let mut html = Vec::new();
    collect_parts(&parsed, &mut plain, &mut html)?;

    let text = if !plain.is_empty() {
        plain.join("\n")
    } else {
        html.iter()
            .map(|h| strip_tags(h))
            .collect::<Vec<_>>()
            .join("\n")
    };

    Ok(collapse_whitespace(&text))
}

fn collect_parts(part: &ParsedMail, plain: &mut Vec<String>, html: &mut Vec<String>) -> Result<()> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, plain, html)?;
        }
        return Ok(());
    }

    // Attachments are not indexed
    let disposition = part.get_content_disposition();
    if disposition.disposition == mailparse::DispositionType::Attachment {
        return Ok(());
    }

    match part.ctype.mimetype.as_str() {
        "text/plain" => plain.push(part.get_body()?),
        "text/html" => html.push(part.get_body()?),
        _ => {}
    }
    Ok(())
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;

    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }

    out.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_message() {
        let raw = b"From: a@example.com\r\nSubject: Hi\r\n\r\nHello   there,\r\nsee you\r\n";
        assert_eq!(extract_text(raw).unwrap(), "Hello there, see you");
    }

    #[test]
    fn test_multipart_prefers_plain() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Content-Type: multipart/alternative; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Plain body\r\n",
            "--b1\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>Html body</p>\r\n",
            "--b1--\r\n",
        );
        assert_eq!(extract_text(raw.as_bytes()).unwrap(), "Plain body");
    }

    #[test]
    fn test_html_only_is_stripped() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<html><body><b>Fish</b>&amp;chips</body></html>\r\n",
        );
        assert_eq!(extract_text(raw.as_bytes()).unwrap(), "Fish &chips");
    }

    #[test]
    fn test_attachment_skipped() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Content-Type: multipart/mixed; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "See attached\r\n",
            "--b1\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Disposition: attachment; filename=\"notes.txt\"\r\n",
            "\r\n",
            "secret notes\r\n",
            "--b1--\r\n",
        );
        assert_eq!(extract_text(raw.as_bytes()).unwrap(), "See attached");
    }

    #[test]
    fn test_empty_source_fails() {
        assert!(matches!(extract_text(b""), Err(SyncError::Parse(_))));
    }
}
