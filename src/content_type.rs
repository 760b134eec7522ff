//! MIME type guessing for document uploads.

/// Guess a MIME type from a filename extension.
///
/// Covers the document formats the origin actually serves; everything
/// else falls back to `application/octet-stream`.
pub fn guess_content_type(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "json" => "application/json",
        "csv" => "text/csv",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "html" | "htm" => "text/html",
        "xml" => "application/xml",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Content-Disposition for an object: images render inline, documents download.
pub fn content_disposition(filename: &str) -> String {
    let ctype = guess_content_type(filename);
    let disposition = if ctype.starts_with("image/") {
        "inline"
    } else {
        "attachment"
    };
    format!("{}; filename=\"{}\"", disposition, filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_extensions() {
        assert_eq!(guess_content_type("brief.pdf"), "application/pdf");
        assert_eq!(guess_content_type("photo.JPG"), "image/jpeg");
        assert_eq!(guess_content_type("notes.txt"), "text/plain");
        assert_eq!(
            guess_content_type("exhibit.docx"),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
    }

    #[test]
    fn test_unknown_extension_falls_back() {
        assert_eq!(guess_content_type("data.xyz"), "application/octet-stream");
        assert_eq!(
            guess_content_type("no_extension"),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_disposition() {
        assert_eq!(
            content_disposition("photo.png"),
            "inline; filename=\"photo.png\""
        );
        assert_eq!(
            content_disposition("brief.pdf"),
            "attachment; filename=\"brief.pdf\""
        );
    }
}
