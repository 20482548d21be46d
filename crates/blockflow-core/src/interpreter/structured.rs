//! Structured agent output: schema instructions, JSON extraction, validation.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::Value;

lazy_static! {
    static ref JSON_FENCE: Regex =
        Regex::new(r"(?s)```json[ \t]*\r?\n?(.*?)```").expect("json fence pattern");
    static ref ANY_FENCE: Regex =
        Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").expect("fence pattern");
}

fn pretty(schema: &serde_json::Value) -> String {
    serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string())
}

/// Append the output-format instructions to a resolved prompt.
pub fn with_schema_instructions(prompt: &str, schema: &serde_json::Value) -> String {
    format!(
        "{}\n\nProvide your final answer in this output JSON schema:\n{}",
        prompt,
        pretty(schema)
    )
}

/// Follow-up sent once when the first answer cannot be parsed.
pub fn corrective_prompt(schema: &serde_json::Value) -> String {
    format!(
        "Your previous response could not be parsed. Please provide your answer in the \
         exact JSON schema format required:\n\n{}\n\nEnsure your response contains ONLY \
         valid JSON matching this schema.",
        pretty(schema)
    )
}

/// Find the JSON object in an agent reply: a ```json fence, any fence,
/// then the outermost braces.
pub fn extract_json(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let fenced = JSON_FENCE
        .captures(text)
        .into_iter()
        .chain(ANY_FENCE.captures(text))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()));

    let braces = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => Some(text[start..=end].to_string()),
        _ => None,
    };

    fenced
        .chain(braces)
        .find_map(|candidate| match serde_json::from_str(candidate.trim()) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        })
}

/// Parse and validate a reply, returning one variable per captured field.
///
/// With declared `properties`, only those fields are captured, in schema
/// order; otherwise every field of the object is.
pub fn parse_response(text: &str, schema: &serde_json::Value) -> Result<Vec<(String, Value)>, String> {
    let object = extract_json(text).ok_or_else(|| "no JSON object found in response".to_string())?;
    validate(&object, schema)?;

    let fields = match schema.get("properties").and_then(|p| p.as_object()) {
        Some(properties) => properties
            .keys()
            .filter_map(|key| object.get(key).map(|v| (key.clone(), Value::from_json(v))))
            .collect(),
        None => object
            .iter()
            .map(|(key, v)| (key.clone(), Value::from_json(v)))
            .collect(),
    };
    Ok(fields)
}

/// Check `required` fields and per-property `type`.
pub fn validate(
    object: &serde_json::Map<String, serde_json::Value>,
    schema: &serde_json::Value,
) -> Result<(), String> {
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            match object.get(field) {
                None | Some(serde_json::Value::Null) => {
                    return Err(format!("missing required field '{}'", field))
                }
                Some(_) => {}
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (name, spec) in properties {
            let Some(value) = object.get(name) else { continue };
            let matches = match spec.get("type") {
                Some(serde_json::Value::String(t)) => type_matches(t, value),
                Some(serde_json::Value::Array(types)) => types
                    .iter()
                    .filter_map(|t| t.as_str())
                    .any(|t| type_matches(t, value)),
                _ => true,
            };
            if !matches {
                return Err(format!(
                    "field '{}' should be {}, got {}",
                    name,
                    spec.get("type").map(|t| t.to_string()).unwrap_or_default(),
                    value
                ));
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}
