use std::path::Path;

/// An inclusive byte range within an entity of known size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// The range covering a whole entity, `None` for an empty one.
    pub fn whole(size: u64) -> Option<ByteRange> {
        if size == 0 {
            None
        } else {
            Some(ByteRange {
                start: 0,
                end: size - 1,
            })
        }
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeSpec {
    /// No usable range header; answer with the whole entity.
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

///
/// Resolve a `Range` header against an entity of `size` bytes.
///
/// Only the single-range form `bytes=start-end` is understood. `bytes=-N`
/// asks for the last `N` bytes and `bytes=N-` for everything from `N`. An
/// end past the entity is clamped. A range that turns out to cover the whole
/// entity is reported as `Full`.
///
pub fn http_range(header: Option<&str>, size: u64) -> RangeSpec {
    let header = match header {
        None | Some("-") => return RangeSpec::Full,
        Some(header) => header.trim(),
    };

    let spec = match header.strip_prefix("bytes=") {
        Some(spec) => spec,
        None => return RangeSpec::Unsatisfiable,
    };
    let (first, last) = match spec.split_once('-') {
        Some(pair) => pair,
        None => return RangeSpec::Unsatisfiable,
    };

    let digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if !digits(first) || !digits(last) {
        return RangeSpec::Unsatisfiable;
    }

    let parse = |s: &str| s.parse::<u64>().ok();
    let (start, end) = match (first.is_empty(), last.is_empty()) {
        (true, true) => return RangeSpec::Unsatisfiable,
        (true, false) => match parse(last) {
            Some(suffix) if suffix <= size && suffix > 0 => (size - suffix, size - 1),
            _ => return RangeSpec::Unsatisfiable,
        },
        (false, false) => match (parse(first), parse(last)) {
            (Some(start), Some(end)) => (start, end.min(size.saturating_sub(1))),
            _ => return RangeSpec::Unsatisfiable,
        },
        (false, true) => match parse(first) {
            Some(start) => (start, size.saturating_sub(1)),
            None => return RangeSpec::Unsatisfiable,
        },
    };

    if size == 0 || start > end {
        return RangeSpec::Unsatisfiable;
    }

    if start == 0 && end == size - 1 {
        RangeSpec::Full
    } else {
        RangeSpec::Partial(ByteRange { start, end })
    }
}

///
/// Build a `Content-Disposition` value. Non-ASCII names get an ASCII
/// fallback in `filename` plus the exact name as RFC 5987 `filename*`.
///
pub fn disposition_header_value(disposition: &str, attachment_name: &str) -> String {
    let fallback: String = attachment_name
        .chars()
        .map(|c| if c.is_ascii() && c != '%' { c } else { '_' })
        .collect::<String>()
        .replace('\\', "\\\\")
        .replace('"', "\\\"");

    let mut value = format!("{}; filename=\"{}\"", disposition, fallback);
    if fallback != attachment_name {
        value.push_str(&format!(
            "; filename*=utf-8''{}",
            urlencoding::encode(attachment_name)
        ));
    }

    value
}

pub fn mime_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("txt") => "text/plain",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_resolve_closed_ranges() {
        assert_eq!(
            http_range(Some("bytes=500-999"), 2000),
            RangeSpec::Partial(ByteRange {
                start: 500,
                end: 999
            })
        );
        assert_eq!(
            http_range(Some("bytes=1500-9999"), 2000),
            RangeSpec::Partial(ByteRange {
                start: 1500,
                end: 1999
            })
        );
    }

    #[test]
    fn it_should_resolve_suffix_and_open_ranges() {
        assert_eq!(
            http_range(Some("bytes=-100"), 2000),
            RangeSpec::Partial(ByteRange {
                start: 1900,
                end: 1999
            })
        );
        assert_eq!(http_range(Some("bytes=0-"), 2000), RangeSpec::Full);
        assert_eq!(http_range(None, 2000), RangeSpec::Full);
    }

    #[test]
    fn it_should_reject_unsatisfiable_ranges() {
        assert_eq!(http_range(Some("bytes=5000-"), 2000), RangeSpec::Unsatisfiable);
        assert_eq!(http_range(Some("bytes=9-3"), 2000), RangeSpec::Unsatisfiable);
        assert_eq!(http_range(Some("bytes=-"), 2000), RangeSpec::Unsatisfiable);
        assert_eq!(http_range(Some("items=0-1"), 2000), RangeSpec::Unsatisfiable);
    }

    #[test]
    fn it_should_add_an_encoded_name_for_non_ascii_files() {
        assert_eq!(
            disposition_header_value("attachment", "report.pdf"),
            "attachment; filename=\"report.pdf\""
        );
        assert_eq!(
            disposition_header_value("inline", "évé.txt"),
            "inline; filename=\"_v_.txt\"; filename*=utf-8''%C3%A9v%C3%A9.txt"
        );
    }
}
