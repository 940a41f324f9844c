// ABOUTME: Template parameter schema and validation
// ABOUTME: Turns raw JSON parameters into a typed parameter set or a ValidationError

use crate::error::ValidationError;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Declared kind of one template parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    String,
    Number,
    NumberList,
    StringList,
    Bool,
    Base64,
    /// Only presence is checked
    Any,
}

impl ParamType {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim() {
            "string" => Some(ParamType::String),
            "number" => Some(ParamType::Number),
            "number[]" => Some(ParamType::NumberList),
            "string[]" => Some(ParamType::StringList),
            "bool" => Some(ParamType::Bool),
            "base64" => Some(ParamType::Base64),
            "any" => Some(ParamType::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::NumberList => "number[]",
            ParamType::StringList => "string[]",
            ParamType::Bool => "bool",
            ParamType::Base64 => "base64",
            ParamType::Any => "any",
        }
    }
}

fn default_type_tag() -> String {
    "any".to_string()
}

/// Schema entry for one parameter, as declared by a template's `info()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default = "default_type_tag")]
    pub type_tag: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

pub type ParamSchema = BTreeMap<String, ParamSpec>;

/// Metadata a template publishes through `info()`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub parameters: ParamSchema,
    /// Files shipped in the template's data directory
    #[serde(default, skip_deserializing)]
    pub data_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    Number(Number),
    Bool(bool),
    NumberList(Vec<Number>),
    StringList(Vec<String>),
    Binary(Vec<u8>),
    Any(Value),
}

/// Validated inputs for one template invocation
pub type ParameterSet = BTreeMap<String, ParamValue>;

/// Validate `raw` against `schema`.
///
/// Absent optional parameters receive their declared default. Parameters
/// the schema does not mention are passed through as `ParamValue::Any`.
pub fn validate(
    template: &str,
    schema: &ParamSchema,
    raw: &Map<String, Value>,
) -> Result<ParameterSet, ValidationError> {
    let mut typed = Vec::with_capacity(schema.len());
    for (name, spec) in schema {
        let ty = ParamType::parse(&spec.type_tag).ok_or_else(|| ValidationError::UnknownType {
            template: template.to_string(),
            parameter: name.clone(),
            tag: spec.type_tag.clone(),
        })?;
        typed.push((name, spec, ty));
    }

    let mut params = ParameterSet::new();

    for (name, spec, ty) in typed {
        let value = match raw.get(name.as_str()).filter(|v| !v.is_null()) {
            Some(value) => value,
            None if spec.mandatory => {
                return Err(ValidationError::Missing {
                    template: template.to_string(),
                    parameter: name.clone(),
                })
            }
            None => match spec.default.as_ref().filter(|v| !v.is_null()) {
                Some(default) => default,
                None => continue,
            },
        };

        params.insert(name.clone(), check(template, name, ty, value)?);
    }

    for (name, value) in raw {
        if !schema.contains_key(name) {
            params.insert(name.clone(), ParamValue::Any(value.clone()));
        }
    }

    Ok(params)
}

fn check(
    template: &str,
    name: &str,
    ty: ParamType,
    value: &Value,
) -> Result<ParamValue, ValidationError> {
    let wrong_type = || ValidationError::WrongType {
        template: template.to_string(),
        parameter: name.to_string(),
        expected: ty.as_str(),
        actual: json_kind(value).to_string(),
    };

    match ty {
        ParamType::String => value
            .as_str()
            .map(|s| ParamValue::String(s.to_string()))
            .ok_or_else(wrong_type),
        ParamType::Number => match value {
            Value::Number(n) => Ok(ParamValue::Number(n.clone())),
            _ => Err(wrong_type()),
        },
        ParamType::Bool => value.as_bool().map(ParamValue::Bool).ok_or_else(wrong_type),
        ParamType::NumberList => {
            let items = value.as_array().ok_or_else(wrong_type)?;
            items
                .iter()
                .map(|item| match item {
                    Value::Number(n) => Ok(n.clone()),
                    _ => Err(wrong_type()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(ParamValue::NumberList)
        }
        ParamType::StringList => {
            let items = value.as_array().ok_or_else(wrong_type)?;
            items
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or_else(wrong_type))
                .collect::<Result<Vec<_>, _>>()
                .map(ParamValue::StringList)
        }
        ParamType::Base64 => {
            let encoded = value.as_str().ok_or_else(wrong_type)?;
            general_purpose::STANDARD
                .decode(encoded.trim())
                .map(ParamValue::Binary)
                .map_err(|e| ValidationError::InvalidBase64 {
                    template: template.to_string(),
                    parameter: name.to_string(),
                    reason: e.to_string(),
                })
        }
        ParamType::Any => Ok(ParamValue::Any(value.clone())),
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn spec(tag: &str, mandatory: bool, default: Option<Value>) -> ParamSpec {
        ParamSpec {
            description: String::new(),
            type_tag: tag.to_string(),
            mandatory,
            default,
        }
    }

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_valid_parameters_pass() {
        let schema = ParamSchema::from([
            ("name".to_string(), spec("string", true, None)),
            ("port".to_string(), spec("number", true, None)),
            ("ports".to_string(), spec("number[]", false, None)),
            ("hosts".to_string(), spec("string[]", false, None)),
            ("debug".to_string(), spec("bool", false, None)),
            ("blob".to_string(), spec("base64", false, None)),
            ("extra".to_string(), spec("any", false, None)),
        ]);

        let params = validate(
            "svc",
            &schema,
            &raw(json!({
                "name": "db",
                "port": 5432,
                "ports": [1, 2.5],
                "hosts": ["a", "b"],
                "debug": true,
                "blob": "aGVsbG8=",
                "extra": {"nested": [1]},
            })),
        )
        .unwrap();

        assert_eq!(params["name"], ParamValue::String("db".to_string()));
        assert_eq!(params["port"], ParamValue::Number(5432.into()));
        assert_eq!(params["blob"], ParamValue::Binary(b"hello".to_vec()));
        assert_eq!(
            params["hosts"],
            ParamValue::StringList(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(params["extra"], ParamValue::Any(json!({"nested": [1]})));
    }

    #[test]
    fn test_missing_mandatory_parameter() {
        let schema = ParamSchema::from([("image".to_string(), spec("string", true, None))]);

        let err = validate("svc", &schema, &Map::new()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::Missing {
                template: "svc".to_string(),
                parameter: "image".to_string()
            }
        );
    }

    #[test]
    fn test_default_never_applies_to_mandatory() {
        let schema = ParamSchema::from([(
            "image".to_string(),
            spec("string", true, Some(json!("redis:7"))),
        )]);

        assert!(matches!(
            validate("svc", &schema, &Map::new()),
            Err(ValidationError::Missing { .. })
        ));
    }

    #[test]
    fn test_default_applied_to_absent_optional() {
        let schema = ParamSchema::from([(
            "port".to_string(),
            spec("number", false, Some(json!(6379))),
        )]);

        let params = validate("svc", &schema, &Map::new()).unwrap();
        assert_eq!(params["port"], ParamValue::Number(6379.into()));
    }

    #[test]
    fn test_absent_optional_without_default_stays_undefined() {
        let schema = ParamSchema::from([("port".to_string(), spec("number", false, None))]);

        let params = validate("svc", &schema, &raw(json!({"port": null}))).unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn test_wrong_type_names_parameter_and_expectation() {
        let schema = ParamSchema::from([("ports".to_string(), spec("number[]", true, None))]);

        let err = validate("svc", &schema, &raw(json!({"ports": [1, "2"]}))).unwrap_err();
        assert_eq!(
            err,
            ValidationError::WrongType {
                template: "svc".to_string(),
                parameter: "ports".to_string(),
                expected: "number[]",
                actual: "array".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_type_tag_is_rejected() {
        let schema = ParamSchema::from([("x".to_string(), spec("float", false, None))]);

        assert!(matches!(
            validate("svc", &schema, &Map::new()),
            Err(ValidationError::UnknownType { tag, .. }) if tag == "float"
        ));
    }

    #[test]
    fn test_invalid_base64() {
        let schema = ParamSchema::from([("bin".to_string(), spec("base64", true, None))]);

        assert!(matches!(
            validate("svc", &schema, &raw(json!({"bin": "not base64!"}))),
            Err(ValidationError::InvalidBase64 { .. })
        ));
    }

    #[test]
    fn test_unknown_parameters_pass_through() {
        let params = validate("svc", &ParamSchema::new(), &raw(json!({"flag": 1}))).unwrap();
        assert_eq!(params["flag"], ParamValue::Any(json!(1)));
    }

    #[test]
    fn test_info_deserializes_with_defaults() {
        let info: TemplateInfo = serde_json::from_value(json!({
            "description": "Redis",
            "parameters": {
                "port": {"type": "number", "default": 6379}
            }
        }))
        .unwrap();

        assert_eq!(info.version, None);
        assert!(!info.parameters["port"].mandatory);
        assert_eq!(info.parameters["port"].default, Some(json!(6379)));
    }
}
