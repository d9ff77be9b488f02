/// Trim whitespace and the braces some drag-and-drop sources wrap around text.
pub fn sanitize_url(raw: &str) -> String {
    raw.trim().trim_matches(['{', '}']).trim().to_string()
}

/// A URL pointing at a playlist/album rather than one item (`list=` query parameter).
pub fn is_collection_url(url: &str) -> bool {
    let Some((_, query)) = url.split_once('?') else {
        return false;
    };
    let query = query.split('#').next().unwrap_or(query);
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(k, v)| k == "list" && !v.is_empty())
}
