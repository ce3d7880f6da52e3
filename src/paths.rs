//! Object path generation and path helpers.
//!
//! A uid looks like `2024/01/31/1x2y3z4w5v_photo.png`: the local date of the
//! write, a random base-36 token and the sanitized original file name.  The
//! date partitions the share chronologically and the random token keeps
//! concurrent writers apart without a coordinating index.

use chrono::Local;
use rand::Rng;

/// Exclusive upper bound of the random token.
const RANDOM_SPACE: u64 = 1_000_000_000_000_000;

/// Suffix of legacy sidecar metadata files.
pub const SIDECAR_SUFFIX: &str = ".meta.yml";

/// Generate a fresh uid for a file called `original_name`.
pub fn generate_uid(original_name: &str) -> String {
    let token = rand::thread_rng().gen_range(0..RANDOM_SPACE);
    format!(
        "{}{}_{}",
        Local::now().format("%Y/%m/%d/"),
        to_base36(token),
        sanitize_name(original_name)
    )
}

/// Replace every character outside `[A-Za-z0-9_.]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Render `value` in lowercase base 36.
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Join the optional root prefix and a uid into the physical path.
///
/// Empty segments and stray slashes are dropped, so `None`, `""` and `"/"`
/// roots all leave the uid unchanged.
pub fn full_path(root: Option<&str>, uid: &str) -> String {
    root.into_iter()
        .chain(std::iter::once(uid))
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Split a path into `(directory, file name)`.
pub fn split_path(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => (String::new(), path.to_string()),
    }
}

/// Name of the legacy sidecar file describing `basename`.
///
/// A trailing `.meta` on the name is dropped first so that both `a.png` and
/// `a.png.meta` map to `a.png.meta.yml`.
pub fn sidecar_name(basename: &str) -> String {
    let stem = basename.strip_suffix(".meta").unwrap_or(basename);
    format!("{}{}", stem, SIDECAR_SUFFIX)
}
