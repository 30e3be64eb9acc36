/// 设置 schema：声明每个键的类型和默认值

use serde_json::{Map, Value};
use tracing::warn;

/// 设置项类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Bool,
    Int,
    String,
    Path,
}

/// 单个设置项声明
#[derive(Debug, Clone)]
pub struct SettingSpec {
    pub name: String,
    pub kind: SettingKind,
    pub default: Value,
}

/// 设置 schema
#[derive(Debug, Clone, Default)]
pub struct SettingsSchema {
    specs: Vec<SettingSpec>,
}

impl SettingsSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bool(self, name: &str, default: bool) -> Self {
        self.with(name, SettingKind::Bool, Value::Bool(default))
    }

    pub fn int(self, name: &str, default: i64) -> Self {
        self.with(name, SettingKind::Int, Value::from(default))
    }

    pub fn string(self, name: &str, default: &str) -> Self {
        self.with(name, SettingKind::String, Value::from(default))
    }

    pub fn path(self, name: &str, default: &str) -> Self {
        self.with(name, SettingKind::Path, Value::from(default))
    }

    fn with(mut self, name: &str, kind: SettingKind, default: Value) -> Self {
        self.specs.push(SettingSpec {
            name: name.to_string(),
            kind,
            default,
        });
        self
    }

    pub fn specs(&self) -> &[SettingSpec] {
        &self.specs
    }

    /// 默认值
    pub fn defaults(&self) -> Map<String, Value> {
        self.apply(None)
    }

    /// 按声明的类型转换存储的值，缺失或无法转换时使用默认值
    ///
    /// 只返回 schema 中声明的键
    pub fn apply(&self, stored: Option<&Map<String, Value>>) -> Map<String, Value> {
        self.specs
            .iter()
            .map(|spec| {
                let raw = stored.and_then(|s| s.get(&spec.name));
                let value = raw
                    .and_then(|v| coerce(spec.kind, v))
                    .unwrap_or_else(|| spec.default.clone());
                (spec.name.clone(), value)
            })
            .collect()
    }
}

impl SettingsSchema {
    /// 按声明的类型转换传入的值
    ///
    /// 未声明的键原样保留，无法转换的键被丢弃
    pub fn coerce_known(&self, values: Map<String, Value>) -> Map<String, Value> {
        values
            .into_iter()
            .filter_map(|(name, value)| {
                let Some(spec) = self.specs.iter().find(|s| s.name == name) else {
                    return Some((name, value));
                };
                match coerce(spec.kind, &value) {
                    Some(coerced) => Some((name, coerced)),
                    None => {
                        warn!("设置 {} 的值 {} 无法转换为 {:?}，已忽略", name, value, spec.kind);
                        None
                    }
                }
            })
            .collect()
    }
}

/// 把值转换为指定类型
pub fn coerce(kind: SettingKind, value: &Value) -> Option<Value> {
    match kind {
        SettingKind::Bool => match value {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::Number(n) => n.as_i64().map(|n| Value::Bool(n != 0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(Value::Bool(true)),
                "false" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        SettingKind::Int => match value {
            Value::Number(n) => n.as_i64().map(Value::from),
            Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
            Value::Bool(b) => Some(Value::from(i64::from(*b))),
            _ => None,
        },
        SettingKind::String | SettingKind::Path => match value {
            Value::String(s) => Some(Value::String(s.clone())),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
    }
}
