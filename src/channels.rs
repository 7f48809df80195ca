/// Canonical channel id for a direct-message pair. Both participants compute
/// the same id independently, so no allocation step is needed: the lower
/// identifier always comes first.
pub fn dm_channel_id(user_a: &str, user_b: &str) -> String {
    let (min, max) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    format!("dm_{min}_{max}")
}

/// Sanitize an input string into a channel-name-friendly slug.
pub fn sanitize_slug(input: &str) -> String {
    let mut slug = String::new();
    let mut prev_dash = false;
    for c in input.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            prev_dash = false;
        } else if !prev_dash {
            slug.push('-');
            prev_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}
