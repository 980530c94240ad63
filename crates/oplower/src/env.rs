use std::env;
use std::sync::OnceLock;

pub(crate) const PATTERN_OVERRIDES_VAR: &str = "OPLOWER_PATTERN_OVERRIDES";
const DISABLE_FUSION_VAR: &str = "OPLOWER_DISABLE_FUSION";

static OPLOWER_DISABLE_FUSION: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// When set, every operator is reported as opaque to the fusion pass.
pub(crate) fn fusion_disabled() -> bool {
    *OPLOWER_DISABLE_FUSION.get_or_init(|| match env::var(DISABLE_FUSION_VAR) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn pattern_overrides() -> Option<String> {
    match env::var(PATTERN_OVERRIDES_VAR) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}
