use indexmap::IndexMap;

/// A parsed document or expression value.
///
/// Expression trees, query parameter dictionaries and document bodies are all
/// handed to the query subsystem as `Value` trees. Dictionaries preserve
/// insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Data(Vec<u8>),
    Array(Vec<Value>),
    Dict(IndexMap<String, Value>),
}

impl Value {
    /// Parses JSON text into a value tree.
    pub fn from_json(json: &str) -> Result<Value, serde_json::Error> {
        Ok(serde_json::from_str::<serde_json::Value>(json)?.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Integral reading of a numeric value; floats truncate.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    /// Evaluates a dotted/bracketed property path (`user.tags[0]`) against
    /// this value. A leading `$` or `$.` is tolerated. Returns `None` as soon
    /// as a segment is missing or the shape doesn't match.
    pub fn at_path(&self, path: &str) -> Option<&Value> {
        let mut path = path
            .strip_prefix("$.")
            .or_else(|| path.strip_prefix('$'))
            .unwrap_or(path);
        let mut current = self;
        while !path.is_empty() {
            if let Some(rest) = path.strip_prefix('[') {
                let end = rest.find(']')?;
                let index: usize = rest[..end].parse().ok()?;
                current = current.as_array()?.get(index)?;
                path = &rest[end + 1..];
            } else {
                let end = path.find(['.', '[']).unwrap_or(path.len());
                current = current.as_dict()?.get(&path[..end])?;
                path = &path[end..];
            }
            path = path.strip_prefix('.').unwrap_or(path);
        }
        Some(current)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    // Beyond i64 range; SQL binds it as a double anyway.
                    Value::Float(u as f64)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(entries) => {
                Value::Dict(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}
