//! Artifact naming convention.
//!
//! Generates deterministic filenames for fetched artifacts from the
//! request's domain name.

/// Extension used when the backend filename carries none.
pub const DEFAULT_ARTIFACT_EXTENSION: &str = "gif";

/// Generate an artifact filename from a request name.
///
/// Convention: `{slug}_anim.{ext}`
///
/// - `slug` = lowercased name with whitespace and path separators replaced
///   by `_`
/// - `ext` = extension of `backend_filename`, or `gif` if it has none
///
/// # Examples
///
/// ```
/// use duat_core::naming::artifact_filename;
///
/// assert_eq!(artifact_filename("Ra Solar Deity", None), "ra_solar_deity_anim.gif");
/// assert_eq!(artifact_filename("Isis", Some("out_00001_.webp")), "isis_anim.webp");
/// assert_eq!(artifact_filename("Set/Chaos", Some("noext")), "set_chaos_anim.gif");
/// ```
pub fn artifact_filename(name: &str, backend_filename: Option<&str>) -> String {
    let slug = name_slug(name);

    let ext = backend_filename
        .and_then(|f| f.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(DEFAULT_ARTIFACT_EXTENSION);

    format!("{slug}_anim.{}", ext.to_ascii_lowercase())
}

/// The `slug` part of [`artifact_filename`]. Two names with the same slug
/// write to the same file.
///
/// ```
/// use duat_core::naming::name_slug;
///
/// assert_eq!(name_slug("Set/Chaos"), name_slug("set chaos"));
/// ```
pub fn name_slug(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_whitespace() || c == '/' || c == '\\' {
                '_'
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_replaces_spaces() {
        assert_eq!(
            artifact_filename("Anubis Judge of the Dead", None),
            "anubis_judge_of_the_dead_anim.gif"
        );
    }

    #[test]
    fn same_name_gives_same_filename() {
        assert_eq!(
            artifact_filename("Horus", Some("a.gif")),
            artifact_filename("Horus", Some("b.gif"))
        );
    }

    #[test]
    fn takes_extension_from_backend_file() {
        assert_eq!(artifact_filename("Thoth", Some("x_00001_.MP4")), "thoth_anim.mp4");
    }

    #[test]
    fn path_separators_do_not_escape_output_dir() {
        let name = artifact_filename("../../etc", None);
        assert!(!name.contains('/'));
    }

    #[test]
    fn odd_extension_falls_back_to_default() {
        assert_eq!(artifact_filename("Ra", Some("file.g/f")), "ra_anim.gif");
    }
}
