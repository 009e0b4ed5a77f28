//! Building and reading `Content-Disposition` headers

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet};
use phf::{phf_set, Set};

/// Content types that are safe to be rendered inline by a browser
///
/// Anything that can carry markup or script, SVG included, must not be listed
/// here.
static INLINE_CONTENT_TYPES: Set<&str> = phf_set! {
    // Keep sorted
    "application/json",
    "application/ld+json",
    "audio/aac",
    "audio/flac",
    "audio/mp4",
    "audio/mpeg",
    "audio/ogg",
    "audio/wav",
    "audio/wave",
    "audio/webm",
    "audio/x-flac",
    "audio/x-pn-wav",
    "audio/x-wav",
    "image/apng",
    "image/avif",
    "image/gif",
    "image/jpeg",
    "image/png",
    "image/webp",
    "text/css",
    "text/csv",
    "text/plain",
    "video/mp4",
    "video/ogg",
    "video/quicktime",
    "video/webm",
};

/// Bytes that have to be escaped in an RFC 5987 `ext-value`
const EXT_VALUE: &AsciiSet = &percent_encoding::NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Returns whether `c` may appear in an unquoted header token
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// Whether content of this type may be displayed inline
fn is_inline(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    INLINE_CONTENT_TYPES.contains(essence.to_ascii_lowercase().as_str())
}

/// Determine a `Content-Disposition` header that prevents XSS
///
/// `filename` is percent-decoded before use. Names outside of printable ASCII
/// are only sent in the extended `filename*` form.
pub(crate) fn content_disposition_for(
    content_type: &str,
    filename: &str,
) -> String {
    let disposition = if is_inline(content_type) {
        "inline"
    } else {
        "attachment"
    };

    let filename = percent_decode_str(filename)
        .decode_utf8()
        .map_or_else(|_| filename.into(), |decoded| decoded);

    if filename.is_empty() {
        disposition.to_owned()
    } else if filename.chars().any(|c| !c.is_ascii() || c.is_ascii_control()) {
        format!(
            "{disposition}; filename*=utf-8''{}",
            utf8_percent_encode(&filename, EXT_VALUE)
        )
    } else if filename.chars().all(is_token_char) {
        format!("{disposition}; filename={filename}")
    } else {
        let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
        format!("{disposition}; filename=\"{escaped}\"")
    }
}

/// Splits header parameters on `;`, ignoring separators inside quotes
fn split_params(header: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;

    for (i, c) in header.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                params.extend(header.get(start..i));
                start = i + 1;
            }
            _ => {}
        }
    }
    params.extend(header.get(start..));

    params
}

fn unquote(value: &str) -> String {
    let Some(inner) =
        value.strip_prefix('"').and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_owned();
    };

    let mut unquoted = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            unquoted.extend(chars.next());
        } else {
            unquoted.push(c);
        }
    }

    unquoted
}

/// Extracts the filename from a `Content-Disposition` header, preferring the
/// extended form
pub(crate) fn filename_from_header(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in split_params(header).into_iter().skip(1) {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim();

        match name.trim().to_ascii_lowercase().as_str() {
            "filename" => plain = Some(unquote(value)),
            "filename*" => {
                let Some((charset, rest)) = value.split_once('\'') else {
                    continue;
                };
                let Some((_language, encoded)) = rest.split_once('\'') else {
                    continue;
                };
                if charset.eq_ignore_ascii_case("utf-8") {
                    extended = percent_decode_str(encoded)
                        .decode_utf8()
                        .ok()
                        .map(Into::into);
                }
            }
            _ => {}
        }
    }

    extended.or(plain).filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{content_disposition_for, filename_from_header, is_inline};

    #[test]
    fn plain_ascii_name() {
        assert_eq!(
            content_disposition_for("application/pdf", "document.pdf"),
            "attachment; filename=document.pdf"
        );
    }

    #[test]
    fn names_with_spaces_are_quoted() {
        assert_eq!(
            content_disposition_for("application/pdf", "my document.pdf"),
            "attachment; filename=\"my document.pdf\""
        );
        assert_eq!(
            content_disposition_for("application/pdf", "a;b.pdf"),
            "attachment; filename=\"a;b.pdf\""
        );
        assert_eq!(
            content_disposition_for("application/pdf", r#"say "hi"\.txt"#),
            r#"attachment; filename="say \"hi\"\\.txt""#
        );
    }

    #[test]
    fn non_ascii_names_only_use_the_extended_form() {
        assert_eq!(
            content_disposition_for("application/pdf", "文档.pdf"),
            "attachment; filename*=utf-8''%E6%96%87%E6%A1%A3.pdf"
        );
    }

    #[test]
    fn empty_name_is_omitted() {
        assert_eq!(content_disposition_for("application/pdf", ""), "attachment");
    }

    #[test]
    fn safe_types_are_inline() {
        assert_eq!(content_disposition_for("image/png", ""), "inline");
        assert_eq!(
            content_disposition_for("image/png", "cat.png"),
            "inline; filename=cat.png"
        );
        assert!(is_inline("Text/Plain; charset=utf-8"), "parameters ignored");
        assert!(!is_inline("image/svg+xml"), "SVG can carry script");
        assert!(!is_inline("text/html"), "HTML can carry script");
    }

    #[test]
    fn names_are_percent_decoded_first() {
        assert_eq!(
            content_disposition_for("application/pdf", "my%20document.pdf"),
            "attachment; filename=\"my document.pdf\""
        );
        assert_eq!(
            content_disposition_for("application/pdf", "100%zz.pdf"),
            "attachment; filename=100%zz.pdf",
            "invalid escapes should pass through"
        );
        assert_eq!(
            content_disposition_for("application/pdf", "%E6%96%87.pdf"),
            "attachment; filename*=utf-8''%E6%96%87.pdf"
        );
    }

    #[test]
    fn reads_filenames_back() {
        assert_eq!(
            filename_from_header("attachment; filename=document.pdf"),
            Some("document.pdf".to_owned())
        );
        assert_eq!(
            filename_from_header(r#"inline; filename="a; \"b\".png""#),
            Some(r#"a; "b".png"#.to_owned())
        );
        assert_eq!(
            filename_from_header(
                "attachment; filename=fallback.pdf; \
                 filename*=UTF-8''%E6%96%87%E6%A1%A3.pdf"
            ),
            Some("文档.pdf".to_owned())
        );
        assert_eq!(filename_from_header("attachment"), None);
        assert_eq!(filename_from_header("attachment; filename=\"\""), None);
    }
}
