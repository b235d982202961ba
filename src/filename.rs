//! Filename and destination-path derivation.
//!
//! A candidate name comes from, in order: `Content-Disposition` (`filename*=`
//! then `filename=`), the last URL path segment, and finally a host-based
//! placeholder. The caller's template (`*`, `*.ext`, `stem.*`, or a literal)
//! is applied on top of the derived stem/extension pair.

use std::path::{Path, PathBuf};

/// Longest filename the engine will derive, in characters.
const MAX_NAME_RUNES: usize = 80;

/// Extracts a filename from a `Content-Disposition` header value.
///
/// Tries `filename*=` (RFC 6266, `charset''name` with percent encoding)
/// first, then plain `filename=`. Some servers percent-encode the plain
/// form too, so decoding is attempted either way.
pub fn from_content_disposition(value: &str) -> Option<String> {
    if let Some(pos) = value.find("filename*=") {
        let parts = &value[pos + 10..];
        let encoded = parts.split(';').next().unwrap_or("").trim();
        if let Some(last_quote) = encoded.rfind('\'') {
            let actual = &encoded[last_quote + 1..];
            if let Ok(decoded) = percent_encoding::percent_decode(actual.as_bytes()).decode_utf8() {
                if !decoded.is_empty() {
                    return Some(decoded.into_owned());
                }
            }
        }
    }

    if let Some(pos) = value.find("filename=") {
        let parts = &value[pos + 9..];
        let raw = parts.split(';').next().unwrap_or("").trim();
        let raw = raw.trim_matches('"').trim_matches('\'');
        if !raw.is_empty() {
            if let Ok(decoded) = percent_encoding::percent_decode(raw.as_bytes()).decode_utf8() {
                return Some(decoded.into_owned());
            }
            return Some(raw.to_string());
        }
    }

    None
}

/// Last non-empty path segment of the URL, percent-decoded. Query and
/// fragment never contribute.
pub fn from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .rev()
        .find(|s| !s.is_empty())?
        .to_string();
    let decoded = percent_encoding::percent_decode(segment.as_bytes())
        .decode_utf8()
        .map(|d| d.into_owned())
        .unwrap_or(segment);
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

/// Placeholder used when neither headers nor the URL yield a name.
pub fn fallback_name(url: &str) -> String {
    let host = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| "unknown".to_string());
    format!("requested_download_{}", host)
}

/// Strips characters illegal on common filesystems and truncates to the
/// maximum derived-name length.
pub fn sanitize(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control() || "<>:\"/\\|?*".contains(c) {
                '_'
            } else {
                c
            }
        })
        .take(MAX_NAME_RUNES)
        .collect();

    if sanitized.is_empty() {
        "download".to_string()
    } else {
        sanitized
    }
}

/// Splits `name.ext` into its stem and (dotless) extension.
pub fn split_stem_ext(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < name.len() => (&name[..pos], Some(&name[pos + 1..])),
        _ => (name, None),
    }
}

/// Applies the caller's filename template to a derived stem/extension pair.
///
/// `*` expands to the full derived name, `*.ext` keeps the derived stem with
/// a literal extension, `stem.*` keeps a literal stem with the derived
/// extension. A template without `*` is taken literally.
pub fn apply_template(template: &str, derived_stem: &str, derived_ext: Option<&str>) -> String {
    let derived_full = match derived_ext {
        Some(ext) => format!("{}.{}", derived_stem, ext),
        None => derived_stem.to_string(),
    };

    if template.is_empty() || template == "*" {
        return derived_full;
    }
    if let Some(literal_ext) = template.strip_prefix("*.") {
        return format!("{}.{}", derived_stem, literal_ext);
    }
    if let Some(literal_stem) = template.strip_suffix(".*") {
        return match derived_ext {
            Some(ext) => format!("{}.{}", literal_stem, ext),
            None => literal_stem.to_string(),
        };
    }
    template.to_string()
}

/// Derives the destination filename for a response.
///
/// `hint` is the probe's Content-Disposition name, `content_type_ext` the
/// extension produced by the external MIME lookup. Derive, sanitize,
/// extend, then apply the template.
pub fn resolve_name(
    url: &str,
    hint: Option<&str>,
    content_type_ext: Option<&str>,
    template: Option<&str>,
) -> String {
    let candidate = hint
        .map(|s| s.to_string())
        .or_else(|| from_url(url))
        .unwrap_or_else(|| fallback_name(url));
    let candidate = sanitize(&candidate);

    let (stem, own_ext) = split_stem_ext(&candidate);
    // Content-Type wins; the URL-derived extension is the fallback.
    let ext = content_type_ext.or(own_ext);

    apply_template(template.unwrap_or(""), stem, ext)
}

/// Dotless extension of a derived name, lowercased for exclusion matching.
pub fn extension_of(name: &str) -> Option<String> {
    split_stem_ext(name).1.map(|e| e.to_ascii_lowercase())
}

/// Finds a nonexistent sibling of `path` by appending ` (1)`, ` (2)`, ...
/// to the stem. Used by `WriteMode::CreateNew`.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let (stem, ext) = split_stem_ext(&name);

    let mut counter = 1u32;
    loop {
        let candidate_name = match ext {
            Some(ext) => format!("{} ({}).{}", stem, counter, ext),
            None => format!("{} ({})", stem, counter),
        };
        let candidate = dir.join(candidate_name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
