//! Content-type detection for blobs.
//!
//! Magic numbers always win. For files on disk the extension comes next, and
//! the UTF-8 text check only decides when neither is conclusive.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::{Result, StorageError};

/// Bytes read from the head of a file for detection.
const SNIFF_SAMPLE_SIZE: usize = 8192;

/// Mime type reported for zero-length content.
pub const EMPTY_MIME: &str = "application/x-empty";

/// Mime type reported when nothing better is known.
pub const BINARY_MIME: &str = "application/octet-stream";

/// Mime type reported for UTF-8 text without a recognised signature.
pub const TEXT_MIME: &str = "text/plain";

/// Known content signatures, checked in order.
const SIGNATURES: &[(&[u8], &str)] = &[
    (&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A], "image/png"),
    (&[0xFF, 0xD8, 0xFF], "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"BM", "image/bmp"),
    (b"%PDF", "application/pdf"),
    (&[0x50, 0x4B, 0x03, 0x04], "application/zip"),
    (&[0x50, 0x4B, 0x05, 0x06], "application/zip"),
    (&[0x1F, 0x8B, 0x08], "application/gzip"),
    (&[0x42, 0x5A, 0x68], "application/x-bzip2"),
    (&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00], "application/x-xz"),
    (&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C], "application/x-7z-compressed"),
    (&[0x7F, 0x45, 0x4C, 0x46], "application/x-executable"),
    (&[0x49, 0x44, 0x33], "audio/mpeg"),
    (&[0x1A, 0x45, 0xDF, 0xA3], "video/webm"),
    (&[0x00, 0x61, 0x73, 0x6D], "application/wasm"),
];

/// Detects the content type of bytes or on-disk files.
pub trait MimeDetector: Send + Sync + fmt::Debug {
    /// Detect the mime type of an in-memory buffer.
    fn detect_bytes(&self, content: &[u8]) -> String;

    /// Detect the mime type of a file on disk.
    fn detect_path(&self, path: &Path) -> Result<String>;
}

/// Signature-table detector with an extension fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureMimeDetector;

impl SignatureMimeDetector {
    fn from_signature(content: &[u8]) -> Option<&'static str> {
        if content.len() >= 12 && &content[..4] == b"RIFF" {
            return match &content[8..12] {
                b"WEBP" => Some("image/webp"),
                b"WAVE" => Some("audio/wav"),
                b"AVI " => Some("video/x-msvideo"),
                _ => None,
            };
        }

        SIGNATURES
            .iter()
            .find(|(magic, _)| content.starts_with(magic))
            .map(|(_, mime)| *mime)
    }

    fn looks_like_text(content: &[u8]) -> bool {
        if content.contains(&0) {
            return false;
        }
        match std::str::from_utf8(content) {
            Ok(_) => true,
            // A multi-byte character cut off at the end of the sample.
            Err(e) => e.error_len().is_none() && e.valid_up_to() + 4 > content.len(),
        }
    }

    fn classify(content: &[u8]) -> Option<&'static str> {
        if content.is_empty() {
            return Some(EMPTY_MIME);
        }
        if let Some(mime) = Self::from_signature(content) {
            return Some(mime);
        }
        if Self::looks_like_text(content) {
            return Some(TEXT_MIME);
        }
        None
    }
}

impl MimeDetector for SignatureMimeDetector {
    fn detect_bytes(&self, content: &[u8]) -> String {
        let sample = &content[..content.len().min(SNIFF_SAMPLE_SIZE)];
        Self::classify(sample).unwrap_or(BINARY_MIME).to_string()
    }

    fn detect_path(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path).map_err(|e| {
            StorageError::BlobIo(format!("cannot open {} for sniffing: {e}", path.display()))
        })?;

        let mut sample = Vec::with_capacity(SNIFF_SAMPLE_SIZE);
        file.by_ref()
            .take(SNIFF_SAMPLE_SIZE as u64)
            .read_to_end(&mut sample)
            .map_err(|e| {
                StorageError::BlobIo(format!("cannot read {} for sniffing: {e}", path.display()))
            })?;

        if let Some(mime) = Self::from_signature(&sample) {
            return Ok(mime.to_string());
        }
        if sample.is_empty() {
            return Ok(EMPTY_MIME.to_string());
        }

        let by_extension = mime_guess::from_path(path).first_raw();
        if let Some(mime) = by_extension {
            return Ok(mime.to_string());
        }

        Ok(Self::classify(&sample).unwrap_or(BINARY_MIME).to_string())
    }
}

/// Conventional extensions for types where mime_guess lists a rarer one first.
const CANONICAL_EXTENSIONS: &[(&str, &str)] = &[
    ("text/plain", "txt"),
    ("text/html", "html"),
    ("text/csv", "csv"),
    ("image/jpeg", "jpg"),
    ("image/svg+xml", "svg"),
    ("image/tiff", "tiff"),
    ("audio/mpeg", "mp3"),
    ("video/mp4", "mp4"),
    ("application/json", "json"),
    ("application/xml", "xml"),
    ("application/octet-stream", "bin"),
];

/// Preferred file extension for a mime type, if one is known.
///
/// Common types get their conventional extension. Otherwise an extension that
/// guesses back to the same mime type wins, so a name built from it sniffs
/// consistently later.
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    if let Some((_, ext)) = CANONICAL_EXTENSIONS
        .iter()
        .find(|(canonical, _)| canonical.eq_ignore_ascii_case(essence))
    {
        return Some(ext);
    }

    let extensions = mime_guess::get_mime_extensions_str(essence)?;

    extensions
        .iter()
        .find(|ext| {
            mime_guess::from_ext(ext)
                .first_raw()
                .is_some_and(|guess| guess.eq_ignore_ascii_case(essence))
        })
        .or_else(|| extensions.first())
        .copied()
}
