//! Multi-format text extraction for uploaded documents.
//!
//! Callers supply bytes plus a declared content type; this module returns
//! plain UTF-8 text. Extraction is pure: it never touches storage. The
//! upload size ceiling is enforced by the pipeline before extraction begins.

use std::io::Read;

use crate::error::{Error, Result};
use crate::models::FileType;

/// Supported MIME types.
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_DOC: &str = "application/msword";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Resolve the file type from the declared content type, falling back to the
/// filename extension and finally to magic-byte sniffing.
///
/// `UnsupportedFormat` distinguishes "not a supported file" from a damaged
/// one, which surfaces later as `ExtractionFailed`.
pub fn detect_file_type(
    declared: Option<&str>,
    filename: &str,
    bytes: &[u8],
) -> Result<FileType> {
    if let Some(ct) = declared {
        // Strip any charset parameter before matching.
        let ct = ct.split(';').next().unwrap_or(ct).trim();
        match ct {
            MIME_PDF => return Ok(FileType::Pdf),
            MIME_DOCX | MIME_DOC => return Ok(FileType::Docx),
            _ if ct.starts_with("text/") => return Ok(FileType::Text),
            _ => {}
        }
    }

    let ext = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "md" | "rtf" => return Ok(FileType::Text),
        "pdf" => return Ok(FileType::Pdf),
        "docx" | "doc" => return Ok(FileType::Docx),
        _ => {}
    }

    if bytes.starts_with(b"%PDF-") {
        return Ok(FileType::Pdf);
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return Ok(FileType::Docx);
    }

    Err(Error::UnsupportedFormat(format!(
        "{} ({})",
        filename,
        declared.unwrap_or("no content type")
    )))
}

/// Extract plain text from document bytes.
pub fn extract_text(bytes: &[u8], file_type: FileType) -> Result<String> {
    let text = match file_type {
        FileType::Text => extract_plain(bytes)?,
        FileType::Pdf => extract_pdf(bytes)?,
        FileType::Docx => extract_docx(bytes)?,
    };
    Ok(clean_text(&text))
}

/// UTF-8 decode with Latin-1 fallback for legacy exports.
fn extract_plain(bytes: &[u8]) -> Result<String> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => Ok(bytes.iter().map(|&b| b as char).collect()),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| Error::ExtractionFailed(format!("PDF: {}", e)))
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| Error::ExtractionFailed(format!("OOXML: {}", e)))?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    extract_docx_runs(&doc_xml)
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| Error::ExtractionFailed(format!("OOXML: {} ({})", e, name)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| Error::ExtractionFailed(format!("OOXML: {}", e)))?;
    if out.len() as u64 >= max_bytes {
        return Err(Error::ExtractionFailed(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Pull `w:t` text runs out of `word/document.xml`, emitting one newline per
/// closed `w:p` paragraph so chunking can split on paragraph boundaries.
fn extract_docx_runs(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text_run => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(Error::ExtractionFailed(format!("OOXML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Normalize line endings, strip NUL bytes, and collapse runs of blank lines
/// down to a single paragraph break.
fn clean_text(text: &str) -> String {
    let mut out = text
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\0', "");
    while out.contains("\n\n\n") {
        out = out.replace("\n\n\n", "\n\n");
    }
    out.trim().to_string()
}
