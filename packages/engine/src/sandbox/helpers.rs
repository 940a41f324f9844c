// ABOUTME: Pure helper functions exposed to templates and value conversions for the sandbox
// ABOUTME: fmt(), the types:: validation namespace, option maps and Dynamic <-> JSON conversion

use crate::params::{ParamValue, ParameterSet};
use base64::{engine::general_purpose, Engine as _};
use rhai::{Array, Blob, Dynamic, EvalAltResult, Map, Module, FLOAT, INT};
use serde_json::Value;
use std::time::Duration;

pub(crate) type FnResult<T> = Result<T, Box<EvalAltResult>>;

/// Printf-style formatting with `%s`, `%d`, `%v` and `%%`
pub(crate) fn format_verbs(format: &str, args: &[Dynamic]) -> FnResult<String> {
    let mut out = String::with_capacity(format.len());
    let mut args = args.iter();
    let mut chars = format.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let verb = chars
            .next()
            .ok_or_else(|| format!("fmt: dangling '%' in \"{}\"", format))?;
        if verb == '%' {
            out.push('%');
            continue;
        }

        let arg = args
            .next()
            .ok_or_else(|| format!("fmt: missing argument for %{} in \"{}\"", verb, format))?;

        match verb {
            's' | 'v' => out.push_str(&arg.to_string()),
            'd' => {
                if let Ok(i) = arg.as_int() {
                    out.push_str(&i.to_string());
                } else if let Ok(f) = arg.as_float() {
                    out.push_str(&(f.trunc() as INT).to_string());
                } else {
                    return Err(format!("fmt: %d expects a number, got {}", arg.type_name()).into());
                }
            }
            other => return Err(format!("fmt: unsupported verb %{}", other).into()),
        }
    }

    Ok(out)
}

/// Render a scalar script value as a string (env values, labels, substitutions)
pub(crate) fn scalar_to_string(what: &str, value: &Dynamic) -> FnResult<String> {
    if value.is_string() || value.is_char() {
        return Ok(value.to_string());
    }
    if let Ok(i) = value.as_int() {
        return Ok(i.to_string());
    }
    if let Ok(f) = value.as_float() {
        return Ok(f.to_string());
    }
    if let Ok(b) = value.as_bool() {
        return Ok(b.to_string());
    }
    Err(format!("{} must be a string, number or bool, got {}", what, value.type_name()).into())
}

pub(crate) fn strings(what: &str, values: Array) -> FnResult<Vec<String>> {
    values
        .into_iter()
        .map(|v| {
            v.into_string().map_err(|t| -> Box<EvalAltResult> {
                format!("{} must contain only strings, got {}", what, t).into()
            })
        })
        .collect()
}

pub(crate) fn ints(what: &str, values: Array) -> FnResult<Vec<INT>> {
    values
        .into_iter()
        .map(|v| {
            v.as_int().map_err(|t| -> Box<EvalAltResult> {
                format!("{} must contain only integers, got {}", what, t).into()
            })
        })
        .collect()
}

/// Typed accessors over an options map
pub(crate) struct Opts<'a> {
    what: &'a str,
    map: &'a Map,
}

impl<'a> Opts<'a> {
    pub(crate) fn new(what: &'a str, map: &'a Map) -> Self {
        Self { what, map }
    }

    pub(crate) fn raw(&self, key: &str) -> Option<&'a Dynamic> {
        self.map.get(key).filter(|v| !v.is_unit())
    }

    fn invalid(&self, key: &str, expected: &str, value: &Dynamic) -> Box<EvalAltResult> {
        format!(
            "Invalid type for {} option '{}', expected {} got {}",
            self.what,
            key,
            expected,
            value.type_name()
        )
        .into()
    }

    pub(crate) fn bool(&self, key: &str, default: bool) -> FnResult<bool> {
        match self.raw(key) {
            Some(v) => v.as_bool().map_err(|_| self.invalid(key, "bool", v)),
            None => Ok(default),
        }
    }

    pub(crate) fn int(&self, key: &str) -> FnResult<Option<INT>> {
        self.raw(key)
            .map(|v| v.as_int().map_err(|_| self.invalid(key, "int", v)))
            .transpose()
    }

    pub(crate) fn string(&self, key: &str) -> FnResult<Option<String>> {
        self.raw(key)
            .map(|v| {
                v.clone()
                    .into_string()
                    .map_err(|_| self.invalid(key, "string", v))
            })
            .transpose()
    }

    pub(crate) fn required_string(&self, key: &str) -> FnResult<String> {
        self.string(key)?
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("{} option '{}' is required", self.what, key).into())
    }

    pub(crate) fn int_list(&self, key: &str) -> FnResult<Vec<INT>> {
        match self.raw(key) {
            Some(v) if v.is_array() => {
                let items = v.clone().into_array().map_err(|_| self.invalid(key, "array", v))?;
                ints(&format!("{} option '{}'", self.what, key), items)
            }
            Some(v) => Err(self.invalid(key, "array", v)),
            None => Ok(Vec::new()),
        }
    }
}

/// Parse a retry interval: integer milliseconds or a string with `ms`, `s` or `m` suffix
pub(crate) fn parse_interval(value: &Dynamic) -> FnResult<Duration> {
    if let Ok(ms) = value.as_int() {
        return u64::try_from(ms)
            .map(Duration::from_millis)
            .map_err(|_| format!("retry_interval must not be negative, got {}", ms).into());
    }

    let text = value
        .clone()
        .into_string()
        .map_err(|t| format!("retry_interval must be a number or string, got {}", t))?;
    let text = text.trim();

    let (number, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(at) => text.split_at(at),
        None => (text, "ms"),
    };
    let amount: u64 = number
        .parse()
        .map_err(|_| format!("invalid retry_interval '{}'", text))?;

    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => amount
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("retry_interval '{}' is too large", text).into()),
        _ => Err(format!("invalid retry_interval unit in '{}'", text).into()),
    }
}

pub(crate) fn params_to_dynamic(params: ParameterSet) -> FnResult<Dynamic> {
    let mut map = Map::new();

    for (name, value) in params {
        let value = match value {
            ParamValue::String(s) => Dynamic::from(s),
            ParamValue::Number(n) => number_to_dynamic(&n),
            ParamValue::Bool(b) => Dynamic::from_bool(b),
            ParamValue::NumberList(ns) => {
                Dynamic::from_array(ns.iter().map(number_to_dynamic).collect())
            }
            ParamValue::StringList(ss) => {
                Dynamic::from_array(ss.into_iter().map(Dynamic::from).collect())
            }
            ParamValue::Binary(bytes) => Dynamic::from_blob(bytes),
            ParamValue::Any(value) => rhai::serde::to_dynamic(&value)?,
        };
        map.insert(name.into(), value);
    }

    Ok(Dynamic::from_map(map))
}

fn number_to_dynamic(n: &serde_json::Number) -> Dynamic {
    match n.as_i64() {
        Some(i) => Dynamic::from_int(i),
        None => Dynamic::from_float(n.as_f64().unwrap_or(FLOAT::NAN)),
    }
}

/// Convert script values to JSON for nested template parameters.
///
/// Blobs are base64 encoded so they satisfy `base64` parameters.
pub(crate) fn dynamic_to_json(value: &Dynamic) -> FnResult<Value> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = value.as_float() {
        return serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| format!("cannot pass non-finite number {}", f).into());
    }
    if value.is_string() || value.is_char() {
        return Ok(Value::String(value.to_string()));
    }
    if value.is_blob() {
        let bytes: Blob = value.clone().into_blob()?;
        return Ok(Value::String(general_purpose::STANDARD.encode(bytes)));
    }
    if value.is_array() {
        let items = value.clone().into_array()?;
        return items
            .iter()
            .map(dynamic_to_json)
            .collect::<FnResult<Vec<_>>>()
            .map(Value::Array);
    }
    if let Some(map) = value.clone().try_cast::<Map>() {
        return map_to_json(&map).map(Value::Object);
    }

    Err(format!("cannot pass a {} as a template parameter", value.type_name()).into())
}

pub(crate) fn map_to_json(map: &Map) -> FnResult<serde_json::Map<String, Value>> {
    map.iter()
        .map(|(k, v)| Ok((k.to_string(), dynamic_to_json(v)?)))
        .collect()
}

fn is_number(value: &Dynamic) -> bool {
    value.as_int().is_ok() || value.as_float().is_ok()
}

fn mismatch(name: &str, expected: &str, value: &Dynamic) -> Box<EvalAltResult> {
    format!(
        "Parameter '{}' must be {}, got {}",
        name,
        expected,
        value.type_name()
    )
    .into()
}

fn ensure_list(
    name: &str,
    value: &Dynamic,
    expected: &str,
    item: fn(&Dynamic) -> bool,
) -> FnResult<()> {
    if value.is_unit() {
        return Ok(());
    }
    let items = value
        .clone()
        .into_array()
        .map_err(|_| mismatch(name, expected, value))?;
    match items.iter().find(|v| !item(v)) {
        Some(bad) => Err(mismatch(name, expected, bad)),
        None => Ok(()),
    }
}

/// The `types` namespace. `Ensure*` accept undefined values.
pub(crate) fn types_module() -> Module {
    let mut module = Module::new();

    module.set_native_fn("EnsureString", |name: &str, value: Dynamic| -> FnResult<()> {
        if value.is_unit() || value.is_string() {
            Ok(())
        } else {
            Err(mismatch(name, "a string", &value))
        }
    });

    module.set_native_fn("EnsureNumber", |name: &str, value: Dynamic| -> FnResult<()> {
        if value.is_unit() || is_number(&value) {
            Ok(())
        } else {
            Err(mismatch(name, "a number", &value))
        }
    });

    module.set_native_fn("EnsureBool", |name: &str, value: Dynamic| -> FnResult<()> {
        if value.is_unit() || value.as_bool().is_ok() {
            Ok(())
        } else {
            Err(mismatch(name, "a bool", &value))
        }
    });

    module.set_native_fn("EnsureListOfNumbers", |name: &str, value: Dynamic| -> FnResult<()> {
        ensure_list(name, &value, "a list of numbers", is_number)
    });

    module.set_native_fn("EnsureListOfStrings", |name: &str, value: Dynamic| -> FnResult<()> {
        ensure_list(name, &value, "a list of strings", |v| v.is_string())
    });

    module.set_native_fn("IsDefined", |value: Dynamic| -> FnResult<bool> {
        Ok(!value.is_unit())
    });

    module.set_native_fn("FromBase64", |name: &str, value: Dynamic| -> FnResult<Dynamic> {
        if value.is_unit() || value.is_blob() {
            return Ok(value);
        }
        let encoded = value
            .clone()
            .into_string()
            .map_err(|_| mismatch(name, "a base64 string", &value))?;
        general_purpose::STANDARD
            .decode(encoded.trim())
            .map(Dynamic::from_blob)
            .map_err(|e| format!("Parameter '{}' is not valid base64: {}", name, e).into())
    });

    module
}
