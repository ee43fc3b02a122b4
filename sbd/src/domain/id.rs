//! Build ID generation

/// Generate a new build ID
///
/// Build IDs are UUIDv7 strings: time ordered, and stable for the lifetime of a
/// build including across crash and resume.
pub fn generate_build_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Short form of a build ID for file names and display
///
/// Uses the trailing characters because the leading ones of a UUIDv7 are a
/// coarse timestamp shared by builds started close together.
pub fn short_id(id: &str) -> &str {
    let start = id.len().saturating_sub(8);
    id.get(start..).unwrap_or(id)
}
