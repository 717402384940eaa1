//! Slice unit naming for quota groups
//!
//! Every quota group maps to one slice unit. Nesting is expressed the
//! systemd way: a dash in a slice name separates path components, so
//! "snap.web-api.slice" is a child of "snap.web.slice" and dashes inside
//! a single group name must be escaped.

/// Prefix shared by all quota group slices
pub const SLICE_PREFIX: &str = "snap.";

/// Escape one path component for use in a slice name
/// e.g., "my-web" -> "my\x2dweb"
pub fn escape_component(name: &str) -> String {
    name.replace('-', "\\x2d")
}

/// Build the slice unit name from a root-first chain of group names
/// e.g., ["web", "api"] -> "snap.web-api.slice"
pub fn slice_name<S: AsRef<str>>(path: &[S]) -> String {
    let escaped: Vec<String> = path
        .iter()
        .map(|component| escape_component(component.as_ref()))
        .collect();
    format!("{}{}.slice", SLICE_PREFIX, escaped.join("-"))
}
