//! Placeholder substitution for command templates and instruction documents.
//!
//! Supports `$name`, `${name}` and `$$` (literal dollar). Unknown
//! placeholders are left untouched so a typo shows up verbatim in the
//! evidence instead of silently becoming an empty argument.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("static regex")
});

/// Template variables, ordered for stable debug output
pub type TemplateVars = BTreeMap<String, String>;

/// Render `template` with `vars`
pub fn render(template: &str, vars: &TemplateVars) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            if caps.get(1).is_some() {
                return "$".to_string();
            }
            let name = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match vars.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Render every element of an argument template
pub fn render_args(args: &[String], vars: &TemplateVars) -> Vec<String> {
    args.iter().map(|a| render(a, vars)).collect()
}

/// Names of placeholders in `template` that `vars` does not define
pub fn unknown_placeholders(template: &str, vars: &TemplateVars) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|caps| caps.get(2).or_else(|| caps.get(3)))
        .map(|m| m.as_str().to_string())
        .filter(|name| !vars.contains_key(name))
        .collect()
}
