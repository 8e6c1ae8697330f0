//! Document format detection from media type and body.

use std::fmt;

/// Leading bytes of a PDF file.
const PDF_MAGIC: &[u8] = b"%PDF";

/// Leading bytes of a ZIP archive (EPUB container).
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Uncompressed `mimetype` entry an EPUB stores first in its archive.
const EPUB_MIMETYPE: &[u8] = b"mimetypeapplication/epub+zip";

/// Format of a fetched body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    /// `application/pdf`
    Pdf,
    /// `application/xml`, `text/xml` (JATS and similar full-text XML)
    Xml,
    /// `application/epub+zip`
    Epub,
    /// `text/html`, usually a landing page
    Html,
    /// `text/plain`
    Text,
    /// `application/json`
    Json,
    /// `image/png`
    Png,
    /// Anything else
    Unknown,
}

impl DocumentFormat {
    /// Maps a media type (parameters allowed) to a format.
    #[must_use]
    pub fn from_mime(content_type: &str) -> Self {
        match essence(content_type).as_str() {
            "application/pdf" | "application/x-pdf" => Self::Pdf,
            "application/xml" | "text/xml" | "application/jats+xml" => Self::Xml,
            "application/epub+zip" => Self::Epub,
            "text/html" | "application/xhtml+xml" => Self::Html,
            "text/plain" => Self::Text,
            "application/json" => Self::Json,
            "image/png" => Self::Png,
            _ => Self::Unknown,
        }
    }

    /// Guesses a format from the first bytes of a body.
    #[must_use]
    pub fn sniff(body: &[u8]) -> Option<Self> {
        let start = body
            .iter()
            .position(|byte| !byte.is_ascii_whitespace())
            .unwrap_or(body.len());
        let trimmed = &body[start..];

        if trimmed.starts_with(PDF_MAGIC) {
            return Some(Self::Pdf);
        }
        if body.starts_with(ZIP_MAGIC) && body.get(30..30 + EPUB_MIMETYPE.len()) == Some(EPUB_MIMETYPE)
        {
            return Some(Self::Epub);
        }
        if trimmed.starts_with(b"<article") {
            return Some(Self::Xml);
        }
        None
    }

    /// Detects the format of a response.
    ///
    /// A PDF signature always wins. Otherwise a specific media type is
    /// trusted, and the body decides when the media type is missing, generic
    /// (`application/octet-stream`) or HTML.
    #[must_use]
    pub fn detect(content_type: Option<&str>, body: &[u8]) -> Self {
        let sniffed = Self::sniff(body);
        if sniffed == Some(Self::Pdf) {
            return Self::Pdf;
        }
        match content_type.map(Self::from_mime) {
            Some(Self::Html) => sniffed.unwrap_or(Self::Html),
            Some(Self::Unknown) | None => sniffed.unwrap_or(Self::Unknown),
            Some(declared) => declared,
        }
    }

    /// Returns whether this format is an acceptable full-text document.
    #[must_use]
    pub fn is_final_document(self) -> bool {
        matches!(self, Self::Pdf | Self::Xml | Self::Epub)
    }

    /// Returns the conventional file extension / label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Xml => "xml",
            Self::Epub => "epub",
            Self::Html => "html",
            Self::Text => "txt",
            Self::Json => "json",
            Self::Png => "png",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strips parameters from a media type and lowercases it.
#[must_use]
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}
