//! Task descriptors - the caller-supplied identity of every task
//!
//! A descriptor carries everything that feeds the content hash:
//! - `logic_version`: bumped by the task author when semantics change
//! - `dependencies`: ordered upstream task ids (position matters)
//! - `parameters`: ordered configuration values (position matters)

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{:?}", v),
            ParamValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// Named parameter
///
/// Insignificant parameters reach the task logic but are left out of the
/// content hash (e.g. a log level that cannot change the output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: ParamValue,
    #[serde(default = "default_true")]
    pub significant: bool,
}

fn default_true() -> bool { true }

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            significant: true,
        }
    }
}

/// Everything the engine needs to know about one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(alias = "id")]
    pub task_id: String,
    #[serde(alias = "version")]
    pub logic_version: String,
    #[serde(default, alias = "deps")]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "params", deserialize_with = "deserialize_params")]
    pub parameters: Vec<Param>,
}

impl TaskDescriptor {
    pub fn new(task_id: impl Into<String>, logic_version: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            logic_version: logic_version.into(),
            dependencies: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Append a dependency; call order is dependency order
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    /// Set a significant parameter. Re-setting a name keeps its position.
    pub fn param(self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.with_param(Param::new(name, value))
    }

    /// Set a parameter that does not take part in the content hash
    pub fn insignificant_param(self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        let mut param = Param::new(name, value);
        param.significant = false;
        self.with_param(param)
    }

    fn with_param(mut self, param: Param) -> Self {
        match self.parameters.iter_mut().find(|p| p.name == param.name) {
            Some(existing) => *existing = param,
            None => self.parameters.push(param),
        }
        self
    }

    /// Look up a parameter value by name
    pub fn get_param(&self, name: &str) -> Option<&ParamValue> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}

/// Accepts `{"name": value, ...}` (document order kept) or a list of
/// `Param` entries.
pub fn deserialize_params<'de, D>(deserializer: D) -> Result<Vec<Param>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ParamsVisitor;

    impl<'de> Visitor<'de> for ParamsVisitor {
        type Value = Vec<Param>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of parameters or a list of parameter entries")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut params: Vec<Param> = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((name, value)) = map.next_entry::<String, ParamValue>()? {
                if params.iter().any(|p| p.name == name) {
                    return Err(de::Error::custom(format!("duplicate parameter `{}`", name)));
                }
                params.push(Param::new(name, value));
            }
            Ok(params)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut params: Vec<Param> = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(param) = seq.next_element::<Param>()? {
                if params.iter().any(|p| p.name == param.name) {
                    return Err(de::Error::custom(format!("duplicate parameter `{}`", param.name)));
                }
                params.push(param);
            }
            Ok(params)
        }
    }

    deserializer.deserialize_any(ParamsVisitor)
}
