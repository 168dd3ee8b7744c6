//! Shared helpers for pulling structured artifacts out of model output.
//!
//! Stage executors accept three response shapes, tried in order: a fenced
//! ```yaml block, a fenced ```json block, and a bare JSON object located by
//! brace counting. All three normalize into an `ArtifactBody`.

use crate::stage::ArtifactBody;

/// Extract the contents of the first fenced code block tagged `lang`.
pub fn extract_fenced_block(text: &str, lang: &str) -> Option<String> {
    let fence = format!("```{lang}");
    let start = text.find(&fence)? + fence.len();
    let rest = &text[start..];
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("```")?;
    Some(rest[..end].trim_end().to_string())
}

/// Locate the outermost JSON object in free text by brace counting,
/// ignoring braces inside string literals.
pub fn find_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Normalize a model response into an artifact body, trying fenced YAML,
/// fenced JSON, then a bare JSON object.
pub fn parse_artifact_text(text: &str) -> Option<ArtifactBody> {
    if let Some(yaml) = extract_fenced_block(text, "yaml")
        && let Ok(value) = serde_yaml::from_str::<serde_json::Value>(&yaml)
        && let Some(map) = value.as_object()
    {
        return Some(map.clone());
    }
    if let Some(json) = extract_fenced_block(text, "json")
        && let Ok(serde_json::Value::Object(map)) = serde_json::from_str(&json)
    {
        return Some(map);
    }
    if let Some(raw) = find_json_object(text)
        && let Ok(serde_json::Value::Object(map)) = serde_json::from_str(raw)
    {
        return Some(map);
    }
    None
}
