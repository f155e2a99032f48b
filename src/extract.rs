//! Per-page text extraction for uploaded documents.
//!
//! Every supported format is reduced to an ordered sequence of pages,
//! numbered from 1, each carrying raw (un-normalized) text:
//!
//! | Extension | Pages |
//! |-----------|-------|
//! | `.pdf` | one per PDF page |
//! | `.txt`, `.md` | split on form feed (`\x0c`) |
//! | `.docx` | the whole document as one page |
//! | `.pptx` | one per slide |
//!
//! Pages with no extractable text are kept as empty strings; the normalizer
//! and chunker drop them downstream. Any failure to open or parse a document
//! is reported as [`RetrievalError::DocumentParse`] carrying the filename.
//!
//! A document's text is read in full when it is opened. Consuming
//! [`Pages`] yields owned [`Page`] values one at a time.

use std::io::Read;
use std::path::Path;

use crate::error::RetrievalError;
use crate::models::Page;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const FORM_FEED: char = '\x0c';

/// Supported document kinds, resolved from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    PlainText,
    Docx,
    Pptx,
}

impl DocumentKind {
    /// Resolve the kind from a path's extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocumentKind::Pdf),
            "txt" | "md" => Some(DocumentKind::PlainText),
            "docx" => Some(DocumentKind::Docx),
            "pptx" => Some(DocumentKind::Pptx),
            _ => None,
        }
    }
}

/// The extracted pages of one document.
///
/// Finite and restartable: [`Pages::iter`] can be called any number of
/// times and always yields pages in increasing page order starting at 1.
#[derive(Debug, Clone)]
pub struct Pages {
    document_name: String,
    texts: Vec<String>,
}

impl Pages {
    fn new(document_name: &str, texts: Vec<String>) -> Self {
        Self {
            document_name: document_name.to_string(),
            texts,
        }
    }

    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Iterate over `(page_number, raw_text)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.texts
            .iter()
            .enumerate()
            .map(|(i, text)| (i as u32 + 1, text.as_str()))
    }
}

impl IntoIterator for Pages {
    type Item = Page;
    type IntoIter = PagesIntoIter;

    fn into_iter(self) -> Self::IntoIter {
        PagesIntoIter {
            document_name: self.document_name,
            texts: self.texts.into_iter().enumerate(),
        }
    }
}

/// Owning iterator over a document's pages. Each [`Page`] is built as it
/// is pulled.
pub struct PagesIntoIter {
    document_name: String,
    texts: std::iter::Enumerate<std::vec::IntoIter<String>>,
}

impl Iterator for PagesIntoIter {
    type Item = Page;

    fn next(&mut self) -> Option<Page> {
        let (i, text) = self.texts.next()?;
        Some(Page {
            document_name: self.document_name.clone(),
            page_number: i as u32 + 1,
            text,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.texts.size_hint()
    }
}

/// The display name used for a document path: its final component.
pub fn document_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Read a document from disk and extract its pages.
pub fn extract_pages(path: &Path) -> Result<Pages, RetrievalError> {
    let name = document_name(path);
    let kind = DocumentKind::from_path(path)
        .ok_or_else(|| RetrievalError::parse(&name, "unsupported document type"))?;
    let bytes = std::fs::read(path).map_err(|e| RetrievalError::parse(&name, e))?;
    extract_pages_from_bytes(&name, &bytes, kind)
}

/// Extract pages from in-memory document bytes.
pub fn extract_pages_from_bytes(
    name: &str,
    bytes: &[u8],
    kind: DocumentKind,
) -> Result<Pages, RetrievalError> {
    let texts = match kind {
        DocumentKind::Pdf => extract_pdf(bytes),
        DocumentKind::PlainText => Ok(split_form_feeds(&String::from_utf8_lossy(bytes))),
        DocumentKind::Docx => extract_docx(bytes).map(|text| vec![text]),
        DocumentKind::Pptx => extract_pptx(bytes),
    }
    .map_err(|reason| RetrievalError::parse(name, reason))?;
    Ok(Pages::new(name, texts))
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<String>, String> {
    // pdf-extract panics on some malformed inputs instead of returning an error.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem_by_pages(bytes)
    }));
    match outcome {
        Ok(Ok(pages)) => Ok(pages),
        Ok(Err(e)) => Err(format!("PDF extraction failed: {}", e)),
        Err(_) => Err("PDF extraction failed: parser panicked".to_string()),
    }
}

fn split_form_feeds(text: &str) -> Vec<String> {
    let text = text.strip_suffix(FORM_FEED).unwrap_or(text);
    text.split(FORM_FEED).map(str::to_string).collect()
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| format!("{}: {}", name, e))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        ));
    }
    Ok(out)
}

fn open_zip(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, String> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| format!("invalid archive: {}", e))
}

fn extract_docx(bytes: &[u8]) -> Result<String, String> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml)
}

fn extract_pptx(bytes: &[u8]) -> Result<Vec<String>, String> {
    let mut archive = open_zip(bytes)?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    if slide_names.is_empty() {
        return Err("no slides found".to_string());
    }
    slide_names
        .iter()
        .map(|name| {
            let xml = read_zip_entry_bounded(&mut archive, name)?;
            collect_text_runs(&xml)
        })
        .collect()
}

/// Collect the contents of `<*:t>` text runs, ending each `<*:p>` paragraph
/// with a newline. Works for both WordprocessingML and DrawingML.
fn collect_text_runs(xml: &[u8]) -> Result<String, String> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_run = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_run = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_run => {
                let text = te.unescape().map_err(|e| e.to_string())?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn kind_from_extension_is_case_insensitive() {
        assert_eq!(
            DocumentKind::from_path(Path::new("a/Report.PDF")),
            Some(DocumentKind::Pdf)
        );
        assert_eq!(
            DocumentKind::from_path(Path::new("notes.md")),
            Some(DocumentKind::PlainText)
        );
        assert_eq!(DocumentKind::from_path(Path::new("image.png")), None);
        assert_eq!(DocumentKind::from_path(Path::new("README")), None);
    }

    #[test]
    fn plain_text_splits_on_form_feed() {
        let pages =
            extract_pages_from_bytes("a.txt", b"first\x0csecond\x0c", DocumentKind::PlainText)
                .unwrap();
        let collected: Vec<(u32, &str)> = pages.iter().collect();
        assert_eq!(collected, vec![(1, "first"), (2, "second")]);
    }

    #[test]
    fn empty_pages_are_kept() {
        let pages =
            extract_pages_from_bytes("a.txt", b"one\x0c\x0cthree", DocumentKind::PlainText)
                .unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages.iter().nth(1), Some((2, "")));
    }

    #[test]
    fn pages_are_restartable() {
        let pages =
            extract_pages_from_bytes("a.txt", b"x\x0cy", DocumentKind::PlainText).unwrap();
        let first: Vec<_> = pages.iter().collect();
        let second: Vec<_> = pages.iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn into_iter_carries_document_name() {
        let pages = extract_pages_from_bytes("doc.md", b"a\x0cb", DocumentKind::PlainText).unwrap();
        let owned: Vec<Page> = pages.into_iter().collect();
        assert_eq!(owned[1].document_name, "doc.md");
        assert_eq!(owned[1].page_number, 2);
        assert_eq!(owned[1].text, "b");
    }

    #[test]
    fn invalid_pdf_is_a_parse_error_with_filename() {
        let err = extract_pages_from_bytes("bad.pdf", b"not a pdf", DocumentKind::Pdf).unwrap_err();
        match err {
            RetrievalError::DocumentParse { filename, .. } => assert_eq!(filename, "bad.pdf"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn invalid_zip_is_a_parse_error() {
        let err = extract_pages_from_bytes("x.docx", b"not a zip", DocumentKind::Docx).unwrap_err();
        assert!(matches!(err, RetrievalError::DocumentParse { .. }));
    }

    #[test]
    fn unsupported_extension_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");
        std::fs::write(&path, b"\x89PNG").unwrap();
        let err = extract_pages(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported document type"));
    }

    #[test]
    fn missing_file_is_a_parse_error() {
        let err = extract_pages(Path::new("/nonexistent/dir/file.pdf")).unwrap_err();
        assert!(matches!(err, RetrievalError::DocumentParse { .. }));
    }

    #[test]
    fn docx_is_a_single_page_with_paragraph_breaks() {
        let xml = "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>Gradient </w:t></w:r><w:r><w:t>descent</w:t></w:r></w:p><w:p><w:r><w:t>second</w:t></w:r></w:p></w:body></w:document>";
        let bytes = zip_with(&[("word/document.xml", xml)]);
        let pages = extract_pages_from_bytes("a.docx", &bytes, DocumentKind::Docx).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages.iter().next(), Some((1, "Gradient descent\nsecond\n")));
    }

    #[test]
    fn pptx_yields_one_page_per_slide_in_order() {
        let slide = |text: &str| {
            format!(
                "<p:sld xmlns:p=\"p\" xmlns:a=\"a\"><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>",
                text
            )
        };
        let s1 = slide("one");
        let s2 = slide("two");
        let s10 = slide("ten");
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
        ]);
        let pages = extract_pages_from_bytes("deck.pptx", &bytes, DocumentKind::Pptx).unwrap();
        let texts: Vec<&str> = pages.iter().map(|(_, t)| t.trim()).collect();
        assert_eq!(texts, vec!["one", "two", "ten"]);
    }
}
