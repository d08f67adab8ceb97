//! Format-specific document parsing.
//!
//! Turns raw bytes (or fetched URL content) into a [`ParsedDocument`] of
//! structural blocks. Each source type gets its own path: page-wise pdf
//! extraction, docx XML run text, a best-effort legacy doc decoder, markdown
//! section splitting, crude HTML tag stripping, and heading heuristics for
//! plain text. A size ceiling is enforced before any parsing starts.

use std::io::Read;
use std::time::Duration;

use quick_xml::events::Event;

use crate::error::{codes, Error, Result};
use crate::models::{DocumentBlock, DocumentMeta, ParsedDocument, SourceType};

/// Hard ceiling on raw document size: 5 MiB.
pub const MAX_DOCUMENT_BYTES: usize = 5 << 20;

/// Timeout for fetching URL sources.
pub const URL_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Parse raw bytes into structural blocks according to the source type.
///
/// `declared_title` may be empty; a title is then inferred from the first
/// meaningful parsed line.
pub fn parse_document(
    raw: &[u8],
    source_type: SourceType,
    declared_title: &str,
    source_uri: &str,
) -> Result<ParsedDocument> {
    if raw.is_empty() {
        return Err(Error::validation(
            codes::DOC_CONTENT_MISSING,
            "document content is empty",
        ));
    }
    if raw.len() > MAX_DOCUMENT_BYTES {
        return Err(Error::validation(
            codes::DOC_TOO_LARGE,
            format!("document is {} bytes, limit {}", raw.len(), MAX_DOCUMENT_BYTES),
        ));
    }

    let blocks = match source_type {
        SourceType::Pdf => parse_pdf(raw)?,
        SourceType::Docx => parse_docx(raw)?,
        SourceType::Doc => parse_doc(raw)?,
        SourceType::Markdown => parse_markdown(&decode_utf8(raw)),
        SourceType::Html | SourceType::Url => split_text_blocks(&strip_tags(&decode_utf8(raw))),
        SourceType::Text => split_text_blocks(&decode_utf8(raw)),
    };

    let mut doc = ParsedDocument {
        meta: DocumentMeta {
            title: declared_title.to_string(),
            source_uri: source_uri.to_string(),
            source_type: source_type.as_str().to_string(),
        },
        blocks,
    };
    infer_title(&mut doc);
    Ok(doc)
}

/// Fetch a URL with a bounded timeout and size cap, then parse it as HTML.
pub async fn fetch_and_parse_url(url: &str, declared_title: &str) -> Result<ParsedDocument> {
    let client = reqwest::Client::builder()
        .timeout(URL_FETCH_TIMEOUT)
        .build()
        .map_err(|e| Error::upstream(codes::URL_FETCH_FAILED, e.to_string()))?;
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::upstream(codes::URL_FETCH_FAILED, format!("{url}: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::upstream(
            codes::URL_FETCH_FAILED,
            format!("{url}: status {}", resp.status()),
        ));
    }
    let body = resp
        .bytes()
        .await
        .map_err(|e| Error::upstream(codes::URL_FETCH_FAILED, format!("{url}: {e}")))?;
    if body.len() > MAX_DOCUMENT_BYTES {
        return Err(Error::validation(
            codes::DOC_TOO_LARGE,
            format!("fetched {} bytes from {url}, limit {}", body.len(), MAX_DOCUMENT_BYTES),
        ));
    }
    parse_document(&body, SourceType::Url, declared_title, url)
}

fn decode_utf8(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

// ---- pdf ----

/// One block per page; pages with no extractable text are dropped.
fn parse_pdf(raw: &[u8]) -> Result<Vec<DocumentBlock>> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(raw)
        .map_err(|e| Error::upstream(codes::PARSE_FAILED, format!("pdf extraction: {e}")))?;
    let mut blocks = Vec::new();
    for (i, page) in pages.iter().enumerate() {
        let text = page.trim();
        if text.is_empty() {
            continue;
        }
        blocks.push(DocumentBlock {
            text: text.to_string(),
            section: String::new(),
            page_no: (i + 1) as u32,
        });
    }
    Ok(blocks)
}

// ---- docx ----

/// Unzip `word/document.xml` and collect `w:t` run text, one paragraph per
/// `w:p` element. The entry read is bounded independently of the outer size
/// ceiling since the XML may decompress larger than the archive.
fn parse_docx(raw: &[u8]) -> Result<Vec<DocumentBlock>> {
    let cursor = std::io::Cursor::new(raw);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| Error::upstream(codes::PARSE_FAILED, format!("docx archive: {e}")))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| Error::upstream(codes::PARSE_FAILED, format!("docx document.xml: {e}")))?;

    let mut xml = String::new();
    entry
        .take(4 * MAX_DOCUMENT_BYTES as u64)
        .read_to_string(&mut xml)
        .map_err(|e| Error::upstream(codes::PARSE_FAILED, format!("docx read: {e}")))?;

    let mut reader = quick_xml::Reader::from_str(&xml);
    let mut text = String::new();
    let mut in_run_text = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_run_text = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"t" => in_run_text = false,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"p" => text.push('\n'),
            Ok(Event::Text(t)) if in_run_text => {
                if let Ok(s) = t.unescape() {
                    text.push_str(&s);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::upstream(
                    codes::PARSE_FAILED,
                    format!("docx xml: {e}"),
                ))
            }
            _ => {}
        }
    }
    Ok(split_text_blocks(&text))
}

// ---- legacy doc ----

/// Best-effort text recovery from the legacy binary format: decode as
/// UTF-16LE and as printable ASCII, keep whichever yields more characters.
/// Payloads that are actually zip archives are routed to the docx path.
/// Deliberately lenient; older producers depend on this behavior.
fn parse_doc(raw: &[u8]) -> Result<Vec<DocumentBlock>> {
    if raw.starts_with(b"PK\x03\x04") {
        return parse_docx(raw);
    }
    let utf16 = extract_utf16(raw);
    let ascii = extract_ascii(raw);
    let text = if utf16.chars().count() > ascii.chars().count() {
        utf16
    } else {
        ascii
    };
    Ok(split_text_blocks(&text))
}

fn extract_utf16(raw: &[u8]) -> String {
    let mut out = String::new();
    for pair in raw.chunks_exact(2) {
        let code = u16::from_le_bytes([pair[0], pair[1]]);
        match char::from_u32(code as u32) {
            Some(c) if c == '\n' || c == '\t' => out.push(c),
            Some(c) if !c.is_control() => out.push(c),
            _ => out.push('\n'),
        }
    }
    squeeze_newlines(&out)
}

fn extract_ascii(raw: &[u8]) -> String {
    let mut out = String::new();
    for &b in raw {
        match b {
            0x20..=0x7E => out.push(b as char),
            b'\n' | b'\t' | b'\r' => out.push('\n'),
            _ => out.push('\n'),
        }
    }
    squeeze_newlines(&out)
}

/// Collapse runs of newline-separated noise left by binary decoding: keep
/// only lines with at least a few word characters.
fn squeeze_newlines(text: &str) -> String {
    let mut out = String::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.chars().filter(|c| c.is_alphanumeric()).count() >= 3 {
            out.push_str(trimmed);
            out.push('\n');
        }
    }
    out
}

// ---- markdown ----

/// `#` headings start a new section; everything between two headings becomes
/// one block carrying the preceding heading as its section name.
fn parse_markdown(text: &str) -> Vec<DocumentBlock> {
    let mut blocks = Vec::new();
    let mut section = String::new();
    let mut body = String::new();
    let mut in_fence = false;

    let mut flush = |section: &str, body: &mut String| {
        let trimmed = body.trim();
        if !trimmed.is_empty() {
            blocks.push(DocumentBlock {
                text: trimmed.to_string(),
                section: section.to_string(),
                page_no: 0,
            });
        }
        body.clear();
    };

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            body.push_str(line);
            body.push('\n');
            continue;
        }
        if !in_fence && line.starts_with('#') {
            flush(&section, &mut body);
            section = line.trim_start_matches('#').trim().to_string();
            continue;
        }
        body.push_str(line);
        body.push('\n');
    }
    flush(&section, &mut body);
    blocks
}

// ---- html ----

/// Crude tag stripping: every `<`…`>` span becomes a space. Good enough for
/// retrieval text; not a DOM parser.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

// ---- plain text ----

/// Split plain text into blocks using heading heuristics. A heading sets the
/// `section` of following lines until the next heading or a blank-line
/// break; blank lines also end the current block.
fn split_text_blocks(text: &str) -> Vec<DocumentBlock> {
    let mut blocks = Vec::new();
    let mut section = String::new();
    let mut body = String::new();

    let mut flush = |section: &mut String, body: &mut String, reset_section: bool| {
        let trimmed = body.trim();
        if !trimmed.is_empty() {
            blocks.push(DocumentBlock {
                text: trimmed.to_string(),
                section: section.clone(),
                page_no: 0,
            });
        }
        body.clear();
        if reset_section {
            section.clear();
        }
    };

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            flush(&mut section, &mut body, true);
            continue;
        }
        if is_heading(trimmed) {
            flush(&mut section, &mut body, false);
            section = heading_text(trimmed);
            continue;
        }
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(trimmed);
    }
    flush(&mut section, &mut body, true);
    blocks
}

/// Heading heuristics for plain text lines.
fn is_heading(line: &str) -> bool {
    if line.starts_with('#') {
        return true;
    }
    if is_numbered_heading(line) {
        return true;
    }
    if line.len() <= 64 && line.ends_with(':') && line.chars().any(|c| c.is_alphabetic()) {
        return true;
    }
    if is_all_caps_heading(line) {
        return true;
    }
    is_title_case_heading(line)
}

/// `1. `, `1.2) `, `1.2.3. ` style prefixes on a short line.
fn is_numbered_heading(line: &str) -> bool {
    if line.len() > 100 {
        return false;
    }
    let mut chars = line.char_indices().peekable();
    let mut saw_digit = false;
    let mut end = 0;
    while let Some(&(i, c)) = chars.peek() {
        if c.is_ascii_digit() {
            saw_digit = true;
        } else if c != '.' {
            break;
        }
        end = i + c.len_utf8();
        chars.next();
    }
    if !saw_digit {
        return false;
    }
    let rest = &line[end..];
    let rest = rest.strip_prefix(')').unwrap_or(rest);
    rest.starts_with(' ') && !rest.trim().is_empty()
}

/// Short line of ≥3 letters with no lowercase.
fn is_all_caps_heading(line: &str) -> bool {
    if line.len() > 64 {
        return false;
    }
    let letters = line.chars().filter(|c| c.is_alphabetic()).count();
    letters >= 3 && !line.chars().any(|c| c.is_lowercase() && c.is_alphabetic())
}

/// Short title-cased line with no terminal punctuation, e.g. "Section One".
fn is_title_case_heading(line: &str) -> bool {
    if line.len() > 48 {
        return false;
    }
    if line
        .chars()
        .last()
        .is_some_and(|c| matches!(c, '.' | '!' | '?' | ';' | ':' | ','))
    {
        return false;
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() || words.len() > 6 {
        return false;
    }
    words.iter().all(|w| {
        w.chars()
            .next()
            .is_some_and(|c| c.is_uppercase() || c.is_ascii_digit())
    })
}

fn heading_text(line: &str) -> String {
    line.trim_start_matches('#')
        .trim()
        .trim_end_matches(':')
        .trim()
        .to_string()
}

/// Fill an empty title from the first meaningful parsed line.
fn infer_title(doc: &mut ParsedDocument) {
    if !doc.meta.title.trim().is_empty() {
        return;
    }
    if let Some(block) = doc.blocks.first() {
        if !block.section.is_empty() {
            doc.meta.title = block.section.clone();
        } else if let Some(line) = block.text.lines().find(|l| !l.trim().is_empty()) {
            doc.meta.title = line.trim().to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_ceiling() {
        let raw = vec![b'a'; MAX_DOCUMENT_BYTES + 1];
        let err = parse_document(&raw, SourceType::Text, "", "mem://big").unwrap_err();
        assert_eq!(err.code(), codes::DOC_TOO_LARGE);
    }

    #[test]
    fn test_empty_content_rejected() {
        let err = parse_document(&[], SourceType::Text, "", "mem://empty").unwrap_err();
        assert_eq!(err.code(), codes::DOC_CONTENT_MISSING);
    }

    #[test]
    fn test_text_heading_sections() {
        let text = b"INTRODUCTION\nThis system answers questions.\n\n1.2) Setup\nInstall the binary.";
        let doc = parse_document(text, SourceType::Text, "", "mem://t").unwrap();
        assert_eq!(doc.blocks.len(), 2);
        assert_eq!(doc.blocks[0].section, "INTRODUCTION");
        assert_eq!(doc.blocks[0].text, "This system answers questions.");
        assert_eq!(doc.blocks[1].section, "1.2) Setup");
    }

    #[test]
    fn test_title_case_heading_sections() {
        let text = b"Section One\nHello world. This is a test.\n\nSection Two\nMore content here.";
        let doc = parse_document(text, SourceType::Text, "", "mem://t").unwrap();
        assert_eq!(doc.blocks.len(), 2);
        assert_eq!(doc.blocks[0].section, "Section One");
        assert_eq!(doc.blocks[1].section, "Section Two");
        assert_eq!(doc.blocks[1].text, "More content here.");
    }

    #[test]
    fn test_colon_heading() {
        let text = b"Refund policy:\nRefunds are issued within 30 days.";
        let doc = parse_document(text, SourceType::Text, "", "mem://t").unwrap();
        assert_eq!(doc.blocks[0].section, "Refund policy");
    }

    #[test]
    fn test_blank_line_resets_section() {
        let text = b"OVERVIEW\nFirst paragraph.\n\nNo heading here, plain continuation text follows.";
        let doc = parse_document(text, SourceType::Text, "", "mem://t").unwrap();
        assert_eq!(doc.blocks.len(), 2);
        assert_eq!(doc.blocks[0].section, "OVERVIEW");
        assert_eq!(doc.blocks[1].section, "");
    }

    #[test]
    fn test_sentence_line_is_not_heading() {
        assert!(!is_heading("This is a normal sentence that just happens to be here."));
        assert!(!is_heading("it starts lowercase"));
        assert!(is_heading("# Quick Start"));
        assert!(is_heading("SUMMARY"));
    }

    #[test]
    fn test_markdown_sections() {
        let md = b"# Guide\nIntro paragraph.\n\n## Install\nRun the installer.\nThen restart.";
        let doc = parse_document(md, SourceType::Markdown, "", "mem://m").unwrap();
        assert_eq!(doc.blocks.len(), 2);
        assert_eq!(doc.blocks[0].section, "Guide");
        assert_eq!(doc.blocks[1].section, "Install");
        assert!(doc.blocks[1].text.contains("Run the installer."));
    }

    #[test]
    fn test_markdown_fence_heading_ignored() {
        let md = b"# Title\n```\n# not a heading\ncode line\n```\ntail";
        let doc = parse_document(md, SourceType::Markdown, "", "mem://m").unwrap();
        assert_eq!(doc.blocks.len(), 1);
        assert!(doc.blocks[0].text.contains("# not a heading"));
    }

    #[test]
    fn test_html_strip() {
        let html = b"<html><body><h1>Pricing</h1><p>Plans start at $5.</p></body></html>";
        let doc = parse_document(html, SourceType::Html, "", "mem://h").unwrap();
        let joined: String = doc.blocks.iter().map(|b| b.text.clone()).collect();
        assert!(joined.contains("Plans start at $5."));
        assert!(!joined.contains('<'));
    }

    #[test]
    fn test_doc_utf16_extraction() {
        let text = "Billing And Invoices\nInvoices are sent monthly to the account owner.";
        let mut raw = Vec::new();
        for unit in text.encode_utf16() {
            raw.extend_from_slice(&unit.to_le_bytes());
        }
        let doc = parse_document(&raw, SourceType::Doc, "", "mem://d").unwrap();
        let joined: String = doc.blocks.iter().map(|b| b.text.clone()).collect();
        assert!(joined.contains("Invoices are sent monthly"));
    }

    #[test]
    fn test_doc_zip_magic_routes_to_docx() {
        // A zip without word/document.xml should fail as docx, not decode as binary.
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("other.txt", options).unwrap();
            std::io::Write::write_all(&mut writer, b"hello").unwrap();
            writer.finish().unwrap();
        }
        let err = parse_document(&buf, SourceType::Doc, "", "mem://d").unwrap_err();
        assert_eq!(err.code(), codes::PARSE_FAILED);
    }

    #[test]
    fn test_title_inferred_from_first_section() {
        let text = b"Getting Started\nDownload the binary first.";
        let doc = parse_document(text, SourceType::Text, "", "mem://t").unwrap();
        assert_eq!(doc.meta.title, "Getting Started");
    }

    #[test]
    fn test_declared_title_preserved() {
        let text = b"Getting Started\nDownload the binary first.";
        let doc = parse_document(text, SourceType::Text, "Manual", "mem://t").unwrap();
        assert_eq!(doc.meta.title, "Manual");
    }
}
