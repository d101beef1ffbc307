//! File-to-text conversion for PDF, OOXML, and plain-text documents.
//!
//! [`FileConverter`] picks an extractor by file extension and returns
//! normalized markdown-like text:
//!
//! | Extension | Output |
//! |-----------|--------|
//! | `.pdf` | text as laid out by `pdf-extract` |
//! | `.docx` | one block per paragraph; `Heading N` styles become `#`×N |
//! | `.pptx` | `## Slide N` followed by that slide's paragraphs |
//! | `.xlsx` | `## Sheet N` followed by one `a \| b \| c` line per row |
//! | `.txt .md .markdown .rst .csv .log` | passed through |
//!
//! Extraction never panics on malformed input; it returns a
//! [`ConversionError`] and the document is skipped.

use std::io::Read;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};

use local_rag_core::convert::{normalize_text, DocumentConverter};
use local_rag_core::error::ConversionError;

/// Extensions passed through as UTF-8 text.
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "rst", "csv", "log"];

/// Every extension [`FileConverter`] accepts.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "pptx", "xlsx", "txt", "md", "markdown", "rst", "csv", "log",
];

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Default converter for files on local disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileConverter;

impl FileConverter {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentConverter for FileConverter {
    fn convert(&self, path: &Path) -> Result<String, ConversionError> {
        let ext = extension_of(path);
        let bytes = std::fs::read(path)?;
        let raw = extract_bytes(&bytes, &ext)?;
        Ok(normalize_text(&raw))
    }
}

/// Lowercased extension of `path`, or an empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Whether [`FileConverter`] can convert `path`.
pub fn is_supported(path: &Path) -> bool {
    SUPPORTED_EXTENSIONS.contains(&extension_of(path).as_str())
}

/// Extract raw (not yet normalized) text from file contents.
pub fn extract_bytes(bytes: &[u8], extension: &str) -> Result<String, ConversionError> {
    match extension {
        "pdf" => extract_pdf(bytes),
        "docx" => extract_docx(bytes),
        "pptx" => extract_pptx(bytes),
        "xlsx" => extract_xlsx(bytes),
        ext if TEXT_EXTENSIONS.contains(&ext) => String::from_utf8(bytes.to_vec())
            .map_err(|e| ConversionError::Encoding(e.to_string())),
        other => Err(ConversionError::UnsupportedFormat(if other.is_empty() {
            "(no extension)".to_string()
        } else {
            format!(".{}", other)
        })),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ConversionError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ConversionError::Pdf(e.to_string()))
}

fn ooxml_err(e: impl std::fmt::Display) -> ConversionError {
    ConversionError::Ooxml(e.to_string())
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ConversionError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_err)
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ConversionError> {
    let entry = archive.by_name(name).map_err(|e| {
        ConversionError::Ooxml(format!("{}: {}", name, e))
    })?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(ooxml_err)?;
    if out.len() as u64 >= max_bytes {
        return Err(ConversionError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Entries named `{prefix}{N}.xml`, sorted by N.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn attr_value(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == local {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// `Heading2` / `heading 2` → `Some(2)`.
fn heading_level(style: &str) -> Option<usize> {
    let lower = style.to_ascii_lowercase();
    let rest = lower.strip_prefix("heading")?.trim_start();
    rest.parse::<usize>().ok().filter(|n| (1..=6).contains(n))
}

// ============ DOCX ============

fn extract_docx(bytes: &[u8]) -> Result<String, ConversionError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    docx_paragraphs(&xml)
}

fn docx_paragraphs(xml: &[u8]) -> Result<String, ConversionError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut blocks: Vec<String> = Vec::new();
    let mut para = String::new();
    let mut level: Option<usize> = None;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    para.clear();
                    level = None;
                }
                b"t" => in_text = true,
                b"pStyle" => level = attr_value(&e, b"val").as_deref().and_then(heading_level),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => level = attr_value(&e, b"val").as_deref().and_then(heading_level),
                b"tab" => para.push('\t'),
                b"br" => para.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                para.push_str(&te.unescape().map_err(ooxml_err)?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = para.trim();
                    if !text.is_empty() {
                        blocks.push(match level {
                            Some(n) => format!("{} {}", "#".repeat(n), text),
                            None => text.to_string(),
                        });
                    }
                    para.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(blocks.join("\n\n"))
}

// ============ PPTX ============

fn extract_pptx(bytes: &[u8]) -> Result<String, ConversionError> {
    let mut archive = open_archive(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    let mut sections = Vec::with_capacity(slides.len());
    for (idx, name) in slides.iter().enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, name, MAX_XML_ENTRY_BYTES)?;
        let paragraphs = slide_paragraphs(&xml)?;
        let mut section = format!("## Slide {}", idx + 1);
        if !paragraphs.is_empty() {
            section.push_str("\n\n");
            section.push_str(&paragraphs.join("\n"));
        }
        sections.push(section);
    }
    Ok(sections.join("\n\n"))
}

fn slide_paragraphs(xml: &[u8]) -> Result<Vec<String>, ConversionError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut para = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                para.push_str(&te.unescape().map_err(ooxml_err)?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = para.trim();
                    if !text.is_empty() {
                        out.push(text.to_string());
                    }
                    para.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ XLSX ============

fn extract_xlsx(bytes: &[u8]) -> Result<String, ConversionError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.by_name("xl/sharedStrings.xml").is_ok() {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };
    let sheets = numbered_entries(&archive, "xl/worksheets/sheet");

    let mut sections = Vec::new();
    for (idx, name) in sheets.iter().take(XLSX_MAX_SHEETS).enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, name, MAX_XML_ENTRY_BYTES)?;
        let rows = sheet_rows(&xml, &shared_strings)?;
        let mut section = format!("## Sheet {}", idx + 1);
        if !rows.is_empty() {
            section.push_str("\n\n");
            section.push_str(&rows.join("\n"));
        }
        sections.push(section);
    }
    Ok(sections.join("\n\n"))
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ConversionError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                current.push_str(&te.unescape().map_err(ooxml_err)?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One `a | b | c` line per non-empty row.
fn sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<String>, ConversionError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_type: Option<String> = None;
    let mut in_value = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => cell_type = attr_value(&e, b"t"),
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(ooxml_err)?;
                let value = raw.trim();
                if !value.is_empty() {
                    let text = match cell_type.as_deref() {
                        Some("s") => value
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned()),
                        _ => Some(value.to_string()),
                    };
                    if let Some(text) = text {
                        row.push(text);
                        cell_count += 1;
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_type = None,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" | "));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join(" | "));
    }
    Ok(rows)
}
