//! Flat `key=value,key=value` payload extraction.

/// Default separator between a key and its value.
pub const DEFAULT_DEFINER: &str = "=";

/// Default separator between pairs.
pub const DEFAULT_DELIMITER: &str = ",";

/// Extracts the value of `key` from `data`.
///
/// Finds the first occurrence of `key` followed by `definer` and returns the
/// text from there up to the next `delimiter` (or the end of `data`).
/// Returns `None` when the key is absent. The match is case-sensitive and
/// purely textual, so keys must not appear inside other keys' names or
/// values: with both `a` and `ba` as keys, `ba=1` also matches `a=`.
///
/// The value is returned as-is; converting it is the caller's job.
#[must_use]
pub fn extract_value<'a>(data: &'a str, key: &str, definer: &str, delimiter: &str) -> Option<&'a str> {
    let definition = format!("{key}{definer}");
    let start = data.find(&definition)? + definition.len();
    let rest = &data[start..];
    Some(rest.find(delimiter).map_or(rest, |end| &rest[..end]))
}

/// Extracts a value using the default `=` definer and `,` delimiter.
#[must_use]
pub fn extract<'a>(data: &'a str, key: &str) -> Option<&'a str> {
    extract_value(data, key, DEFAULT_DEFINER, DEFAULT_DELIMITER)
}
