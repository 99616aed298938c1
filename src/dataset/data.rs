//! Microdata record structures

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Declared type of a microdata variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    /// Monetary amounts and counts
    Numeric,
    /// Labelled categories (region, tenure, age band, ...)
    Categorical,
    /// Yes/no flags
    Boolean,
}

impl VariableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::Numeric => "numeric",
            VariableType::Categorical => "categorical",
            VariableType::Boolean => "boolean",
        }
    }
}

/// A single variable value on a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Numeric(f64),
    Categorical(String),
}

impl Value {
    pub fn value_type(&self) -> VariableType {
        match self {
            Value::Numeric(_) => VariableType::Numeric,
            Value::Categorical(_) => VariableType::Categorical,
            Value::Boolean(_) => VariableType::Boolean,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            Value::Categorical(c) => Some(c.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Parse a raw text cell according to the declared type
    ///
    /// Returns `None` when the text cannot represent a value of that type.
    pub fn parse(raw: &str, var_type: VariableType) -> Option<Value> {
        let raw = raw.trim();
        match var_type {
            VariableType::Numeric => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Value::Numeric),
            VariableType::Categorical => Some(Value::Categorical(raw.to_string())),
            VariableType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(Value::Boolean(true)),
                "false" | "0" | "no" | "n" => Some(Value::Boolean(false)),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Numeric(v) => write!(f, "{}", v),
            Value::Categorical(c) => write!(f, "{}", c),
            Value::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// Declaration of one variable in the dataset schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub var_type: VariableType,

    /// Required variables must appear on at least one record
    #[serde(default)]
    pub required: bool,

    /// Growth-factor category used to uprate this variable (None = not uprated)
    #[serde(default)]
    pub uprating: Option<String>,
}

impl VariableSpec {
    pub fn new(name: &str, var_type: VariableType) -> Self {
        Self {
            name: name.to_string(),
            var_type,
            required: false,
            uprating: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn uprated_by(mut self, category: &str) -> Self {
        self.uprating = Some(category.to_string());
        self
    }
}

/// Ordered set of declared variables shared by every record of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    variables: Vec<VariableSpec>,
}

impl Schema {
    pub fn new(variables: Vec<VariableSpec>) -> Self {
        Self { variables }
    }

    /// Load a schema from a JSON array of variable declarations
    pub fn from_json_path(path: &std::path::Path) -> crate::Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    pub fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    pub fn get(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Growth-factor categories referenced by any variable, deduplicated and sorted
    pub fn uprating_categories(&self) -> Vec<&str> {
        let mut categories: Vec<&str> = self
            .variables
            .iter()
            .filter_map(|v| v.uprating.as_deref())
            .collect();
        categories.sort_unstable();
        categories.dedup();
        categories
    }

    /// Check that names are unique and non-empty
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for var in &self.variables {
            if var.name.trim().is_empty() {
                return Err(crate::ProjectionError::config("schema contains an unnamed variable"));
            }
            if var.name == "id" || var.name == "weight" {
                return Err(crate::ProjectionError::config(format!(
                    "variable name '{}' is reserved",
                    var.name
                )));
            }
            if !seen.insert(var.name.as_str()) {
                return Err(crate::ProjectionError::config(format!(
                    "variable '{}' declared more than once",
                    var.name
                )));
            }
        }
        Ok(())
    }
}

/// Quality tag for a single record or a whole snapshot
///
/// Ordered from best to worst so that `max` gives the worse of two statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataStatus {
    Ok,
    Partial,
    Invalid,
}

impl DataStatus {
    pub fn worse(self, other: DataStatus) -> DataStatus {
        self.max(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataStatus::Ok => "OK",
            DataStatus::Partial => "PARTIAL",
            DataStatus::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for DataStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One simulated household or person unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier, also the basis for deterministic draws
    pub id: u64,

    /// Variable values; a declared variable absent here is missing
    pub values: BTreeMap<String, Value>,

    /// Population scale-up weight
    pub weight: f64,

    /// Completeness of this record against the schema
    pub status: DataStatus,
}

impl Record {
    pub fn new(id: u64, weight: f64) -> Self {
        Self {
            id,
            values: BTreeMap::new(),
            weight,
            status: DataStatus::Ok,
        }
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn numeric(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(Value::as_f64)
    }
}
