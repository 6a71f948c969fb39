//! 工具参数 Schema 与校验
//!
//! 参数类型限定为 string / integer / number / boolean / array / object。
//! 校验规则：未知键忽略；缺失必填键、类型不匹配返回描述性错误字符串（由注册表转为 Observation）。
//! 模型常把数字写成字符串，integer / number / boolean 允许从字符串宽松转换。
//! 非结构化的 Action Input 以 `input` 键传入；工具未声明该键且只有一个必填参数时，改挂到该参数上。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 参数类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        };
        f.write_str(s)
    }
}

/// 单个参数的声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl ParamSpec {
    pub fn required(param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            param_type,
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            param_type,
            description: description.into(),
            required: false,
        }
    }
}

/// 参数表：BTreeMap 保证渲染顺序稳定
pub type ParamTable = BTreeMap<String, ParamSpec>;

/// 无法结构化解析的 Action Input 整段挂在这个键下
pub const FALLBACK_INPUT_KEY: &str = "input";

/// 按声明校验参数，返回规范化后的参数对象（未知键原样保留，交给 handler 忽略）
pub fn validate_args(params: &ParamTable, args: Value) -> Result<Value, String> {
    let mut obj = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => return Err(format!("arguments must be an object, got {}", json_kind(&other))),
    };
    remap_fallback_input(params, &mut obj);

    let missing: Vec<&str> = params
        .iter()
        .filter(|(name, spec)| spec.required && obj.get(*name).map_or(true, Value::is_null))
        .map(|(name, _)| name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required parameter(s): {}", missing.join(", ")));
    }

    for (name, spec) in params {
        let Some(value) = obj.get_mut(name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let coerced = coerce(spec.param_type, value.take()).map_err(|got| {
            format!(
                "parameter '{}' must be of type {}, got {}",
                name, spec.param_type, got
            )
        })?;
        *value = coerced;
    }

    Ok(Value::Object(obj))
}

/// {"input": text} 且 `input` 未声明时，交给唯一的必填参数
fn remap_fallback_input(params: &ParamTable, obj: &mut Map<String, Value>) {
    if obj.len() != 1 || params.contains_key(FALLBACK_INPUT_KEY) {
        return;
    }
    let mut required = params.iter().filter(|(_, spec)| spec.required);
    let (Some((name, _)), None) = (required.next(), required.next()) else {
        return;
    };
    if let Some(text) = obj.remove(FALLBACK_INPUT_KEY) {
        obj.insert(name.clone(), text);
    }
}

fn coerce(ty: ParamType, value: Value) -> Result<Value, &'static str> {
    match (ty, value) {
        (ParamType::String, Value::String(s)) => Ok(Value::String(s)),
        (ParamType::String, v @ (Value::Number(_) | Value::Bool(_))) => {
            Ok(Value::String(v.to_string()))
        }
        (ParamType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(Value::Number(n)),
        (ParamType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| "string"),
        (ParamType::Number, Value::Number(n)) => Ok(Value::Number(n)),
        (ParamType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or("string"),
        (ParamType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (ParamType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err("string"),
        },
        (ParamType::Array, v @ Value::Array(_)) => Ok(v),
        (ParamType::Object, v @ Value::Object(_)) => Ok(v),
        (_, other) => Err(json_kind(&other)),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> ParamTable {
        let mut t = ParamTable::new();
        t.insert("path".into(), ParamSpec::required(ParamType::String, "file"));
        t.insert("limit".into(), ParamSpec::optional(ParamType::Integer, "max lines"));
        t
    }

    #[test]
    fn test_missing_required_is_reported() {
        let err = validate_args(&table(), json!({"limit": 3})).unwrap_err();
        assert!(err.contains("missing required parameter(s): path"));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let out = validate_args(&table(), json!({"path": "a.txt", "colour": "red"})).unwrap();
        assert_eq!(out["path"], "a.txt");
    }

    #[test]
    fn test_integer_coerced_from_string() {
        let out = validate_args(&table(), json!({"path": "a", "limit": " 12 "})).unwrap();
        assert_eq!(out["limit"], 12);
    }

    #[test]
    fn test_type_mismatch() {
        let err = validate_args(&table(), json!({"path": ["a"]})).unwrap_err();
        assert!(err.contains("'path' must be of type string, got array"));
    }

    #[test]
    fn test_fallback_input_goes_to_sole_required_param() {
        let out = validate_args(&table(), json!({"input": "notes.txt"})).unwrap();
        assert_eq!(out, json!({"path": "notes.txt"}));
    }

    #[test]
    fn test_fallback_input_kept_when_ambiguous_or_declared() {
        let mut two = table();
        two.insert("mode".into(), ParamSpec::required(ParamType::String, "mode"));
        let err = validate_args(&two, json!({"input": "x"})).unwrap_err();
        assert!(err.contains("missing required parameter(s): mode, path"));

        let mut declared = ParamTable::new();
        declared.insert("input".into(), ParamSpec::required(ParamType::String, "raw"));
        declared.insert("path".into(), ParamSpec::optional(ParamType::String, "file"));
        let out = validate_args(&declared, json!({"input": "x"})).unwrap();
        assert_eq!(out, json!({"input": "x"}));
    }

    #[test]
    fn test_non_object_arguments_rejected() {
        assert!(validate_args(&table(), json!("a.txt")).is_err());
        assert!(validate_args(&ParamTable::new(), Value::Null).is_ok());
    }
}
