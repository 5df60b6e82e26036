//! Rule-based compaction of tool and parameter descriptions.
//!
//! The rewrite set strips filler phrasing and maps long nouns/verbs to
//! short forms while preserving meaning. Rule order is part of the
//! contract: a later rule sees the output of earlier rules.

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

/// Descriptions shorter than this are passed through untouched.
const MIN_COMPRESSIBLE_LEN: usize = 20;

// RATIONALE: Every pattern below is a compile-time string literal that has
// been verified to be valid, so the `.expect()` calls can never fire.
static COMPRESSION_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    const RULES: &[(&str, &str)] = &[
        // Remove filler phrases
        (
            r"(?i)\bThis tool (?:will |can |is used to |enables (?:you|users|LLMs|AI assistants) to |allows (?:you|users|LLMs|AI assistants) to )",
            "",
        ),
        (r"(?i)\bThis server (?:enables|allows|provides)\b", ""),
        (r"(?i)\bThis operation (?:will|can)\b", ""),
        (r"(?i)\bYou can use this (?:tool |to )\b", ""),
        (r"(?i)\bProvides? (?:the )?ability to\b", ""),
        (r"(?i)\bProvides? access to\b", "Access"),
        (r"(?i)\bGives? (?:you )?access to\b", "Access"),
        (r"(?i)\bmust be provided\b", "required"),
        (r"(?i)\bshould be provided\b", "recommended"),
        (r"(?i)\bcan be used (?:to |for )\b", "for "),
        (r"(?i)\bEnables you to\b", ""),
        (r"(?i)\bAllows you to\b", ""),
        // Simplify phrases
        (r"(?i)\bin order to\b", "to"),
        (r"(?i)\bas well as\b", "and"),
        (r"(?i)\bprior to\b", "before"),
        (r"(?i)\bwith respect to\b", "for"),
        // Remove qualifiers
        (r"(?i)\bvery\b", ""),
        (r"(?i)\bsimply\b", ""),
        (r"(?i)\bbasically\b", ""),
        (r"(?i)\bessentially\b", ""),
        // Shorten terms
        (r"(?i)\brepository\b", "repo"),
        (r"(?i)\bconfiguration\b", "config"),
        (r"(?i)\binformation\b", "info"),
        (r"(?i)\bdocumentation\b", "docs"),
        (r"(?i)\bapplication\b", "app"),
        (r"(?i)\bdatabase\b", "DB"),
        (r"(?i)\benvironment\b", "env"),
        (r"(?i)\bparameters\b", "params"),
        (r"(?i)\bparameter\b", "param"),
        // Shorten verbs
        (r"(?i)\bretrieve(?:s)?\b", "get"),
        (r"(?i)\bfetch(?:es)?\b", "get"),
        (r"(?i)\bexecute(?:s)?\b", "run"),
        (r"(?i)\bgenerate(?:s)?\b", "create"),
        // Shorten notes
        (r"(?i)\bfor example\b", "e.g."),
        (r"(?i)\bsuch as\b", "like"),
        // Clean up
        (r"  +", " "),
        (r" +([.,;:])", "$1"),
    ];
    RULES
        .iter()
        .map(|(pattern, replacement)| {
            (
                Regex::new(pattern).expect("COMPRESSION_RULES: compile-time constant"),
                *replacement,
            )
        })
        .collect()
});

static REPEATED_DOTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.+").expect("REPEATED_DOTS: compile-time constant"));
static SENTENCE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\. )([a-z])").expect("SENTENCE_START: compile-time constant"));

/// Applies the ordered rewrite rules to one description string.
pub fn compress_description(desc: &str) -> String {
    if desc.len() < MIN_COMPRESSIBLE_LEN {
        return desc.to_string();
    }
    let mut result = desc.to_string();
    for (pattern, replacement) in COMPRESSION_RULES.iter() {
        result = pattern.replace_all(&result, *replacement).into_owned();
    }
    result = REPEATED_DOTS.replace_all(&result, ".").into_owned();
    result = SENTENCE_START
        .replace_all(&result, |caps: &Captures<'_>| {
            format!("{}{}", &caps[1], caps[2].to_uppercase())
        })
        .into_owned();
    let mut chars = result.chars();
    if let Some(first) = chars.next() {
        if first.is_lowercase() {
            result = first.to_uppercase().chain(chars).collect();
        }
    }
    result.trim().to_string()
}

/// Recursively compresses `description` fields through a JSON Schema.
///
/// Walks `description`, then `properties.*`, then `items`.
pub fn compress_schema(schema: &mut Value) {
    let Some(map) = schema.as_object_mut() else {
        return;
    };
    if let Some(Value::String(desc)) = map.get("description") {
        let compressed = compress_description(desc);
        map.insert("description".into(), Value::String(compressed));
    }
    if let Some(Value::Object(props)) = map.get_mut("properties") {
        for prop_schema in props.values_mut() {
            compress_schema(prop_schema);
        }
    }
    if let Some(items) = map.get_mut("items") {
        if items.is_object() {
            compress_schema(items);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn short_descriptions_pass_through() {
        assert_eq!(compress_description("List items"), "List items");
        assert_eq!(compress_description(""), "");
    }

    #[test]
    fn filler_phrases_are_removed() {
        let out = compress_description("This tool enables you to retrieve repository information.");
        assert_eq!(out, "Get repo info.");
    }

    #[test]
    fn noun_and_verb_maps_apply_case_insensitively() {
        let out = compress_description("Fetches the Configuration from the Database environment.");
        assert_eq!(out, "Get the config from the DB env.");
    }

    #[test]
    fn repeated_dots_collapse_and_sentences_recapitalize() {
        let out = compress_description("Run the query... then retrieve results. more data follows.");
        assert_eq!(out, "Run the query. Then get results. More data follows.");
    }

    #[test]
    fn compression_is_idempotent() {
        let once = compress_description("This tool allows you to execute commands in order to fetch information.");
        let twice = compress_description(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn schema_walk_reaches_nested_properties_and_items() {
        let mut schema = json!({
            "type": "object",
            "description": "This tool enables you to retrieve repository information.",
            "properties": {
                "filter": {
                    "type": "string",
                    "description": "The filter expression that must be provided for this query."
                },
                "pages": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "description": "Configuration for a single page, for example page size."
                    }
                }
            }
        });
        compress_schema(&mut schema);
        assert_eq!(schema["description"], "Get repo info.");
        assert_eq!(
            schema["properties"]["filter"]["description"],
            "The filter expression that required for this query."
        );
        assert_eq!(
            schema["properties"]["pages"]["items"]["description"],
            "Config for a single page, e.g. page size."
        );
    }
}
