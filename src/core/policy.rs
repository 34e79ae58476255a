/// Textual scan for disallowed built-in calls.
///
/// This is a teaching aid and not a security boundary: aliasing or computed
/// property access slips through.
pub fn find_forbidden<S: AsRef<str>>(source: &str, forbidden: &[S]) -> Vec<String> {
    forbidden
        .iter()
        .map(AsRef::as_ref)
        .filter(|construct| !construct.is_empty() && source.contains(construct))
        .map(str::to_string)
        .collect()
}
