//! File type classification by native type, MIME type, and extension.

use super::models::{Category, ExportSpec};

/// Native document types and the office format each one exports to.
const NATIVE_EXPORTS: &[(&str, Category, &str, &str)] = &[
    (
        "application/vnd.google-apps.document",
        Category::Document,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ".docx",
    ),
    (
        "application/vnd.google-apps.spreadsheet",
        Category::Document,
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ".xlsx",
    ),
    (
        "application/vnd.google-apps.presentation",
        Category::Document,
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        ".pptx",
    ),
    (
        "application/vnd.google-apps.drawing",
        Category::Other,
        "image/png",
        ".png",
    ),
];

/// Native types with no downloadable content.
const UNSUPPORTED_NATIVE: &[&str] = &[
    "application/vnd.google-apps.folder",
    "application/vnd.google-apps.shortcut",
    "application/vnd.google-apps.form",
    "application/vnd.google-apps.map",
    "application/vnd.google-apps.site",
];

const MIME_CATEGORIES: &[(&str, Category)] = &[
    ("image/jpeg", Category::Photo),
    ("image/png", Category::Photo),
    ("image/gif", Category::Photo),
    ("image/webp", Category::Photo),
    ("image/heic", Category::Photo),
    ("image/heif", Category::Photo),
    ("image/bmp", Category::Photo),
    ("image/tiff", Category::Photo),
    ("video/mp4", Category::Video),
    ("video/x-matroska", Category::Video),
    ("video/quicktime", Category::Video),
    ("video/x-msvideo", Category::Video),
    ("video/webm", Category::Video),
    ("video/x-ms-wmv", Category::Video),
    ("video/x-flv", Category::Video),
    ("audio/mpeg", Category::Audio),
    ("audio/mp3", Category::Audio),
    ("audio/wav", Category::Audio),
    ("audio/x-wav", Category::Audio),
    ("audio/flac", Category::Audio),
    ("audio/x-flac", Category::Audio),
    ("audio/mp4", Category::Audio),
    ("audio/aac", Category::Audio),
    ("audio/ogg", Category::Audio),
    ("application/pdf", Category::Document),
    ("application/msword", Category::Document),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Category::Document,
    ),
    ("application/vnd.ms-excel", Category::Document),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Category::Document,
    ),
    ("application/vnd.ms-powerpoint", Category::Document),
    (
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        Category::Document,
    ),
    ("text/plain", Category::Document),
    ("application/zip", Category::Archive),
    ("application/x-rar-compressed", Category::Archive),
    ("application/x-7z-compressed", Category::Archive),
    ("application/x-tar", Category::Archive),
    ("application/gzip", Category::Archive),
    ("application/x-msdownload", Category::Installer),
    ("application/x-msi", Category::Installer),
];

const EXTENSION_CATEGORIES: &[(Category, &[&str])] = &[
    (
        Category::Photo,
        &[
            "jpg", "jpeg", "png", "heic", "webp", "gif", "bmp", "tiff", "tif", "raw", "cr2", "nef",
        ],
    ),
    (
        Category::Video,
        &["mp4", "mkv", "mov", "avi", "webm", "wmv", "flv", "m4v", "3gp"],
    ),
    (
        Category::Audio,
        &["mp3", "wav", "flac", "m4a", "aac", "ogg", "wma", "aiff"],
    ),
    (
        Category::Document,
        &[
            "pdf", "docx", "doc", "xlsx", "xls", "pptx", "ppt", "txt", "rtf", "odt", "ods", "odp",
        ],
    ),
    (
        Category::Archive,
        &["zip", "rar", "7z", "tar", "gz", "bz2", "xz", "tgz"],
    ),
    (
        Category::Installer,
        &["exe", "msi", "dmg", "pkg", "deb", "rpm", "appimage"],
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: Category,
    pub export: Option<ExportSpec>,
}

/// Classify a file. Total: anything unrecognized is `Other`.
pub fn classify(name: &str, mime_type: &str) -> Classification {
    let mime_type = mime_type.trim();

    if let Some((_, category, export_mime, extension)) =
        NATIVE_EXPORTS.iter().find(|(native, ..)| *native == mime_type)
    {
        return Classification {
            category: *category,
            export: Some(ExportSpec {
                mime_type: export_mime.to_string(),
                extension: extension.to_string(),
            }),
        };
    }

    let category = MIME_CATEGORIES
        .iter()
        .find(|(mime, _)| *mime == mime_type)
        .map(|(_, category)| *category)
        .or_else(|| extension_of(name).and_then(|ext| category_for_extension(&ext)))
        .unwrap_or(Category::Other);

    Classification {
        category,
        export: None,
    }
}

/// Whether the MIME type is a native kind that cannot be downloaded or exported.
pub fn is_unsupported_native(mime_type: &str) -> bool {
    UNSUPPORTED_NATIVE.contains(&mime_type.trim())
}

/// Whether the MIME type is a native document that needs exporting.
pub fn is_native_document(mime_type: &str) -> bool {
    NATIVE_EXPORTS
        .iter()
        .any(|(native, ..)| *native == mime_type.trim())
}

/// Lowercased extension, ignoring trailing whitespace and dots.
/// Names without a stem (".bashrc") have no extension.
pub fn extension_of(name: &str) -> Option<String> {
    let trimmed = name.trim_end_matches(|c: char| c.is_whitespace() || c == '.');
    let (stem, ext) = trimmed.rsplit_once('.')?;
    if stem.trim().is_empty() || ext.is_empty() || ext.contains(char::is_whitespace) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn category_for_extension(ext: &str) -> Option<Category> {
    EXTENSION_CATEGORIES
        .iter()
        .find(|(_, exts)| exts.contains(&ext))
        .map(|(category, _)| *category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_fallback() {
        assert_eq!(classify("trip.jpg", "").category, Category::Photo);
        assert_eq!(classify("movie.MKV", "").category, Category::Video);
        assert_eq!(classify("song.flac", "").category, Category::Audio);
        assert_eq!(classify("report.pdf", "").category, Category::Document);
        assert_eq!(classify("backup.tar", "").category, Category::Archive);
        assert_eq!(classify("setup.exe", "").category, Category::Installer);
        assert_eq!(classify("notes.xyz", "").category, Category::Other);
    }

    #[test]
    fn test_extension_ignores_case_whitespace_and_trailing_dots() {
        assert_eq!(extension_of("IMG_0001.JPG"), Some("jpg".to_string()));
        assert_eq!(extension_of("IMG_0001.jpg. "), Some("jpg".to_string()));
        assert_eq!(extension_of("IMG_0001.jpg..."), Some("jpg".to_string()));
        assert_eq!(extension_of("archive.tar.gz"), Some("gz".to_string()));
        assert_eq!(classify("IMG_0001.Jpg . ", "").category, Category::Photo);
    }

    #[test]
    fn test_names_without_extension() {
        assert_eq!(extension_of("README"), None);
        assert_eq!(extension_of(".bashrc"), None);
        assert_eq!(extension_of(""), None);
        assert_eq!(extension_of("..."), None);
        assert_eq!(classify(".jpg", "").category, Category::Other);
    }

    #[test]
    fn test_mime_takes_precedence_over_extension() {
        let c = classify("clip.bin", "video/mp4");
        assert_eq!(c.category, Category::Video);
        assert!(c.export.is_none());
    }

    #[test]
    fn test_native_types_export() {
        let doc = classify("Quarterly plan", "application/vnd.google-apps.document");
        assert_eq!(doc.category, Category::Document);
        assert_eq!(doc.export.unwrap().extension, ".docx");

        let sheet = classify("Budget", "application/vnd.google-apps.spreadsheet");
        assert_eq!(sheet.export.unwrap().extension, ".xlsx");

        let slides = classify("Deck", "application/vnd.google-apps.presentation");
        assert_eq!(slides.export.unwrap().extension, ".pptx");

        let drawing = classify("Sketch", "application/vnd.google-apps.drawing");
        assert_eq!(drawing.category, Category::Other);
        assert_eq!(drawing.export.unwrap().mime_type, "image/png");
    }

    #[test]
    fn test_classify_is_deterministic() {
        let inputs = [
            ("trip.jpg", "image/jpeg"),
            ("weird name", "application/octet-stream"),
            ("Doc", "application/vnd.google-apps.document"),
        ];
        for (name, mime) in inputs {
            assert_eq!(classify(name, mime), classify(name, mime));
        }
    }

    #[test]
    fn test_unsupported_native_types() {
        assert!(is_unsupported_native("application/vnd.google-apps.folder"));
        assert!(is_unsupported_native("application/vnd.google-apps.shortcut"));
        assert!(!is_unsupported_native("application/vnd.google-apps.document"));
        assert!(is_native_document("application/vnd.google-apps.document"));
        assert!(!is_native_document("image/jpeg"));
    }
}
