use crate::error::IngestError;
use crate::models::RawFile;
use lopdf::Document;

const FORM_FEED: char = '\u{000c}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    PlainText,
}

impl FileKind {
    pub fn detect(file: &RawFile) -> Result<Self, IngestError> {
        match file.extension().as_deref() {
            Some("pdf") => Ok(FileKind::Pdf),
            Some("txt") | Some("md") => Ok(FileKind::PlainText),
            Some(other) => Err(IngestError::UnsupportedType(format!(
                "{} (.{other})",
                file.filename
            ))),
            None => Err(IngestError::UnsupportedType(file.filename.clone())),
        }
    }

    pub fn is_supported_extension(ext: &str) -> bool {
        matches!(ext.to_ascii_lowercase().as_str(), "pdf" | "txt" | "md")
    }
}

pub trait PageExtractor {
    fn extract_pages(&self, file: &RawFile) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PageExtractor for LopdfExtractor {
    fn extract_pages(&self, file: &RawFile) -> Result<Vec<PageText>, IngestError> {
        let document = Document::load_mem(&file.bytes)
            .map_err(|error| IngestError::ParseFailure(format!("{}: {error}", file.filename)))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::ParseFailure(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        Ok(pages)
    }
}

/// Plain text where form feeds separate pages.
#[derive(Default)]
pub struct PlainTextExtractor;

impl PageExtractor for PlainTextExtractor {
    fn extract_pages(&self, file: &RawFile) -> Result<Vec<PageText>, IngestError> {
        let raw = std::str::from_utf8(&file.bytes).map_err(|error| {
            IngestError::ParseFailure(format!("{} is not valid utf-8: {error}", file.filename))
        })?;

        Ok(raw
            .split(FORM_FEED)
            .enumerate()
            .filter_map(|(index, chunk)| {
                let trimmed = chunk.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: (index + 1) as u32,
                        text: trimmed.to_string(),
                    })
                }
            })
            .collect())
    }
}

pub fn extract_page_texts(file: &RawFile) -> Result<Vec<PageText>, IngestError> {
    let pages = match FileKind::detect(file)? {
        FileKind::Pdf => LopdfExtractor.extract_pages(file)?,
        FileKind::PlainText => PlainTextExtractor.extract_pages(file)?,
    };

    if pages.is_empty() {
        return Err(IngestError::ParseFailure(format!(
            "document had no readable page text: {}",
            file.filename
        )));
    }

    Ok(pages)
}
