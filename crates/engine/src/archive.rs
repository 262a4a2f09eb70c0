//! Update container layout.
//!
//! An update is a plain tar archive with a fixed member set. The metadata
//! members are authored before the payload so a single forward pass over
//! the stream sees everything it needs:
//!
//! - `CHANGELOG` — human-readable release notes, version on an early line
//! - `update.img.xz.minisig` — detached signature over the compressed image
//! - `update.img.xz` — xz-compressed filesystem image

pub const CHANGELOG_MEMBER: &str = "CHANGELOG";
pub const SIGNATURE_MEMBER: &str = "update.img.xz.minisig";
pub const PAYLOAD_MEMBER: &str = "update.img.xz";

/// Best-effort version lookup in the changelog head.
///
/// Accepts `Version X.Y.Z`, `vX.Y.Z` and a bare `X.Y.Z` line within the
/// first ten lines. Falls back to `"unknown"` rather than failing the
/// cycle, the version string is informational only.
pub fn extract_version(changelog: &str) -> String {
    for line in changelog.lines().take(10) {
        if let Some((_, rest)) = line.split_once("Version ") {
            return rest.trim().to_string();
        }
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix('v') {
            if rest.starts_with(|c: char| c.is_ascii_digit()) {
                return rest.trim().to_string();
            }
        }
        if trimmed.matches('.').count() == 2
            && !trimmed.is_empty()
            && trimmed.chars().all(|c| c.is_alphanumeric() || c == '.')
        {
            return trimmed.to_string();
        }
    }
    "unknown".to_string()
}
