/// `1/true/yes/on` and `0/false/no/off`, any case.
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_bool(key: &str) -> Option<bool> {
    env_string(key).and_then(|raw| parse_bool_flag(&raw))
}

/// Non-empty, trimmed value of an environment variable.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
