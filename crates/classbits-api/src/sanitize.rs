use std::collections::HashSet;

use ammonia::Builder;

/// Tags a siphon reason may keep. Everything else is stripped, attributes
/// included.
const ALLOWED_TAGS: &[&str] = &["b", "i", "em", "strong", "u", "p", "br", "ul", "ol", "li"];

pub fn sanitize_reason(raw: &str) -> String {
    Builder::default()
        .tags(ALLOWED_TAGS.iter().copied().collect::<HashSet<_>>())
        .generic_attributes(HashSet::new())
        .link_rel(None)
        .clean(raw)
        .to_string()
        .trim()
        .to_string()
}
