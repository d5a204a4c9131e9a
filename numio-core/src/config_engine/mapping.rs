//! The response-mapping interpreter.
//!
//! A provider's response mapping is a small declarative program: a `type`
//! discriminant selecting the overall response shape, plus per-field rules
//! projecting upstream values into canonical row fields. Field rules parse
//! once into an AST ([`FieldRule`]) and evaluate against a pre-parsed
//! [`serde_json::Value`] or regex captures; nothing is interpolated per
//! call.
//!
//! Rule syntax, by example:
//!
//! - `price`: literal field
//! - `a.b.c`: dotted path
//! - `price|cost|amount`: fallback chain; first defined non-null wins
//! - `$key`, `$parentKey`, `$grandParentKey`: dictionary key accessors
//! - `$atDepth:0`: ancestor key by depth from the root (preferred over
//!   the hierarchy accessors at >= 3 nesting levels)
//! - `count:int`: typed transform
//! - `name:default:Unknown`: literal default when missing/null
//! - `operator:ifEmpty:any`: literal replacement when empty

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// A projected row: canonical field name to extracted value.
pub type MappedRow = Map<String, Value>;

/// Canonical field rules keyed by output field name.
pub type FieldMap = BTreeMap<String, FieldRule>;

/// A parsed response body, JSON or plain text depending on Content-Type.
#[derive(Clone, Debug)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("Root path '{0}' not found in response")]
    RootNotFound(String),
    #[error("Expected a JSON array at '{0}'")]
    NotAnArray(String),
    #[error("Expected a JSON object")]
    NotAnObject,
    #[error("Expected a JSON response")]
    ExpectedJson,
    #[error("Expected a text response")]
    ExpectedText,
    #[error("Invalid regex: {0}")]
    BadRegex(String),
    #[error("Nested array response has no header row")]
    MissingHeaderRow,
    #[error("Invalid field rule '{0}': {1}")]
    BadFieldRule(String, String),
}

// --- Field rules --- //

/// One step of a fallback chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Accessor {
    /// Dotted path into the element (or a capture-group name/index for
    /// `text_regex`).
    Path(Vec<String>),
    /// The element's own dictionary key.
    Key,
    /// One level up.
    ParentKey,
    /// Two levels up.
    GrandParentKey,
    /// Ancestor key at depth `N` counted from the root (0 = outermost).
    AtDepth(usize),
}

/// A typed transform applied after accessor resolution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Transform {
    Number,
    Int,
    Float,
    String,
    Boolean,
    /// Literal used when every alternative is missing or null.
    Default(String),
    /// Literal used when the resolved value is null, missing, or `""`.
    IfEmpty(String),
}

/// A parsed field rule: fallback alternatives plus an optional transform.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldRule {
    pub alternatives: Vec<Accessor>,
    pub transform: Option<Transform>,
}

impl FromStr for FieldRule {
    type Err = MappingError;

    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| {
            MappingError::BadFieldRule(rule.to_owned(), why.to_owned())
        };

        // Split off the transform suffix first. `$atDepth:N` also uses a
        // colon, so only recognized transform keywords count.
        let (accessor_part, transform) =
            if let Some((head, lit)) = rule.split_once(":default:") {
                (head, Some(Transform::Default(lit.to_owned())))
            } else if let Some((head, lit)) = rule.split_once(":ifEmpty:") {
                (head, Some(Transform::IfEmpty(lit.to_owned())))
            } else if let Some(head) = rule.strip_suffix(":number") {
                (head, Some(Transform::Number))
            } else if let Some(head) = rule.strip_suffix(":int") {
                (head, Some(Transform::Int))
            } else if let Some(head) = rule.strip_suffix(":float") {
                (head, Some(Transform::Float))
            } else if let Some(head) = rule.strip_suffix(":string") {
                (head, Some(Transform::String))
            } else if let Some(head) = rule.strip_suffix(":boolean") {
                (head, Some(Transform::Boolean))
            } else {
                (rule, None)
            };

        if accessor_part.is_empty() {
            return Err(bad("empty accessor"));
        }

        let mut alternatives = Vec::new();
        for alt in accessor_part.split('|') {
            let alt = alt.trim();
            if alt.is_empty() {
                return Err(bad("empty alternative"));
            }
            let accessor = match alt {
                "$key" => Accessor::Key,
                "$parentKey" => Accessor::ParentKey,
                "$grandParentKey" => Accessor::GrandParentKey,
                _ =>
                    if let Some(depth) = alt.strip_prefix("$atDepth:") {
                        let depth = depth
                            .parse::<usize>()
                            .map_err(|_| bad("bad $atDepth index"))?;
                        Accessor::AtDepth(depth)
                    } else if let Some(unknown) = alt.strip_prefix('$') {
                        return Err(bad(&format!(
                            "unknown accessor '${unknown}'"
                        )));
                    } else {
                        Accessor::Path(
                            alt.split('.').map(str::to_owned).collect(),
                        )
                    },
            };
            alternatives.push(accessor);
        }

        Ok(Self {
            alternatives,
            transform,
        })
    }
}

impl Display for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alts = self
            .alternatives
            .iter()
            .map(|a| match a {
                Accessor::Path(segs) => segs.join("."),
                Accessor::Key => "$key".to_owned(),
                Accessor::ParentKey => "$parentKey".to_owned(),
                Accessor::GrandParentKey => "$grandParentKey".to_owned(),
                Accessor::AtDepth(n) => format!("$atDepth:{n}"),
            })
            .collect::<Vec<_>>()
            .join("|");
        write!(f, "{alts}")?;
        match &self.transform {
            None => Ok(()),
            Some(Transform::Number) => write!(f, ":number"),
            Some(Transform::Int) => write!(f, ":int"),
            Some(Transform::Float) => write!(f, ":float"),
            Some(Transform::String) => write!(f, ":string"),
            Some(Transform::Boolean) => write!(f, ":boolean"),
            Some(Transform::Default(lit)) => write!(f, ":default:{lit}"),
            Some(Transform::IfEmpty(lit)) => write!(f, ":ifEmpty:{lit}"),
        }
    }
}

impl Serialize for FieldRule {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldRule {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(|e| D::Error::custom(format!("{e}")))
    }
}

// --- Mapping spec --- //

/// The declarative response-mapping spec, one per configured operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseMapping {
    /// Root path yields a sequence; each element is projected by field
    /// rules.
    JsonArray {
        #[serde(default)]
        root: Option<String>,
        fields: FieldMap,
    },
    /// A single object projected by field rules.
    JsonObject { fields: FieldMap },
    /// Recursive walk of a nested dictionary; per-depth keys bind to the
    /// reserved accessors. `depth` pins the leaf depth; when omitted, a
    /// node is a leaf as soon as not all of its values are objects.
    JsonDictionary {
        #[serde(default)]
        depth: Option<usize>,
        fields: FieldMap,
    },
    /// A single primitive extracted by root path, projected to `value`.
    JsonValue { path: String },
    /// A tuple (or sequence of tuples) projected to named fields by
    /// position.
    JsonArrayPositional { fields: Vec<String> },
    /// A mapping from identifier to primitive, projected to
    /// `{key_field}: id, {value_field}: primitive`.
    JsonKeyedValue {
        #[serde(default = "default_key_field")]
        key_field: String,
        #[serde(default = "default_value_field")]
        value_field: String,
    },
    /// A 2D table whose first row defines the column names; remaining
    /// rows are projected by field rules over those columns.
    JsonNestedArray {
        #[serde(default)]
        root: Option<String>,
        fields: FieldMap,
    },
    /// A regular expression over a text response; named or numbered
    /// groups bind to fields. `status_mapping` canonicalizes the
    /// extracted `status` field; unmapped literals become `unknown`.
    TextRegex {
        pattern: String,
        fields: FieldMap,
        #[serde(default)]
        status_mapping: BTreeMap<String, String>,
    },
}

fn default_key_field() -> String {
    "key".to_owned()
}

fn default_value_field() -> String {
    "value".to_owned()
}

impl ResponseMapping {
    /// Evaluates this mapping against a response body, producing
    /// normalized rows.
    pub fn eval(
        &self,
        body: &ResponseBody,
    ) -> Result<Vec<MappedRow>, MappingError> {
        match self {
            Self::TextRegex {
                pattern,
                fields,
                status_mapping,
            } => {
                let text = match body {
                    ResponseBody::Text(text) => text,
                    // Some upstreams send text with a JSON content type.
                    ResponseBody::Json(Value::String(text)) => text,
                    ResponseBody::Json(_) =>
                        return Err(MappingError::ExpectedText),
                };
                eval_text_regex(pattern, fields, status_mapping, text)
            }
            _ => {
                let parsed;
                let json = match body {
                    ResponseBody::Json(json) => json,
                    ResponseBody::Text(text) => {
                        // Tolerate a JSON body served as text/plain.
                        parsed = serde_json::from_str::<Value>(text)
                            .map_err(|_| MappingError::ExpectedJson)?;
                        &parsed
                    }
                };
                self.eval_json(json)
            }
        }
    }

    fn eval_json(
        &self,
        json: &Value,
    ) -> Result<Vec<MappedRow>, MappingError> {
        match self {
            Self::JsonArray { root, fields } => {
                let target = resolve_root(json, root.as_deref())?;
                let elements = target.as_array().ok_or_else(|| {
                    MappingError::NotAnArray(
                        root.clone().unwrap_or_default(),
                    )
                })?;
                elements
                    .iter()
                    .map(|element| project(fields, element, &[]))
                    .collect()
            }
            Self::JsonObject { fields } => {
                if !json.is_object() {
                    return Err(MappingError::NotAnObject);
                }
                Ok(vec![project(fields, json, &[])?])
            }
            Self::JsonDictionary { depth, fields } => {
                let mut rows = Vec::new();
                let mut key_stack = Vec::new();
                walk_dictionary(
                    json,
                    *depth,
                    fields,
                    &mut key_stack,
                    &mut rows,
                )?;
                Ok(rows)
            }
            Self::JsonValue { path } => {
                let value = resolve_root(json, Some(path))?;
                let mut row = MappedRow::new();
                row.insert("value".to_owned(), value.clone());
                Ok(vec![row])
            }
            Self::JsonArrayPositional { fields } => {
                let elements = json
                    .as_array()
                    .ok_or_else(|| MappingError::NotAnArray(String::new()))?;
                // Either a single tuple or a sequence of tuples.
                let tuples: Vec<&Vec<Value>> =
                    if elements.iter().all(Value::is_array) {
                        elements
                            .iter()
                            .map(|e| e.as_array().unwrap())
                            .collect()
                    } else {
                        vec![elements]
                    };
                Ok(tuples
                    .into_iter()
                    .map(|tuple| {
                        let mut row = MappedRow::new();
                        for (idx, name) in fields.iter().enumerate() {
                            let value = tuple
                                .get(idx)
                                .cloned()
                                .unwrap_or(Value::Null);
                            row.insert(name.clone(), value);
                        }
                        row
                    })
                    .collect())
            }
            Self::JsonKeyedValue {
                key_field,
                value_field,
            } => {
                let object =
                    json.as_object().ok_or(MappingError::NotAnObject)?;
                Ok(object
                    .iter()
                    .map(|(key, value)| {
                        let mut row = MappedRow::new();
                        row.insert(
                            key_field.clone(),
                            Value::String(key.clone()),
                        );
                        row.insert(value_field.clone(), value.clone());
                        row
                    })
                    .collect())
            }
            Self::JsonNestedArray { root, fields } => {
                let target = resolve_root(json, root.as_deref())?;
                let table = target.as_array().ok_or_else(|| {
                    MappingError::NotAnArray(
                        root.clone().unwrap_or_default(),
                    )
                })?;
                let mut table_rows = table.iter();
                let header = table_rows
                    .next()
                    .and_then(Value::as_array)
                    .ok_or(MappingError::MissingHeaderRow)?;
                let columns: Vec<String> = header
                    .iter()
                    .map(|c| json_to_plain_string(c))
                    .collect();

                let mut rows = Vec::new();
                for table_row in table_rows {
                    let cells = table_row.as_array().ok_or_else(|| {
                        MappingError::NotAnArray("row".to_owned())
                    })?;
                    // Rebuild the row as an object keyed by column name,
                    // then project like any other object element.
                    let mut object = Map::new();
                    for (column, cell) in columns.iter().zip(cells) {
                        object.insert(column.clone(), cell.clone());
                    }
                    let element = Value::Object(object);
                    rows.push(project(fields, &element, &[])?);
                }
                Ok(rows)
            }
            Self::TextRegex { .. } => unreachable!("handled in eval"),
        }
    }
}

// --- Evaluation helpers --- //

/// Resolves an optional dotted root path.
fn resolve_root<'a>(
    json: &'a Value,
    root: Option<&str>,
) -> Result<&'a Value, MappingError> {
    let Some(root) = root.filter(|r| !r.is_empty()) else {
        return Ok(json);
    };
    let mut current = json;
    for segment in root.split('.') {
        current = current
            .get(segment)
            .ok_or_else(|| MappingError::RootNotFound(root.to_owned()))?;
    }
    Ok(current)
}

/// Projects one element through the field rules. `key_stack` carries the
/// dictionary ancestor keys, outermost first; empty outside
/// `json_dictionary`.
fn project(
    fields: &FieldMap,
    element: &Value,
    key_stack: &[&str],
) -> Result<MappedRow, MappingError> {
    let mut row = MappedRow::new();
    for (name, rule) in fields {
        row.insert(name.clone(), eval_rule(rule, element, key_stack));
    }
    Ok(row)
}

fn eval_rule(rule: &FieldRule, element: &Value, key_stack: &[&str]) -> Value {
    // First defined, non-null alternative wins.
    let mut resolved = Value::Null;
    for accessor in &rule.alternatives {
        let value = eval_accessor(accessor, element, key_stack);
        if !value.is_null() {
            resolved = value;
            break;
        }
    }
    apply_transform(rule.transform.as_ref(), resolved)
}

fn eval_accessor(
    accessor: &Accessor,
    element: &Value,
    key_stack: &[&str],
) -> Value {
    let stack_get = |idx: Option<usize>| {
        idx.and_then(|i| key_stack.get(i))
            .map(|k| Value::String((*k).to_owned()))
            .unwrap_or(Value::Null)
    };
    match accessor {
        Accessor::Path(segments) => {
            let mut current = element;
            for segment in segments {
                match current.get(segment) {
                    Some(next) => current = next,
                    None => return Value::Null,
                }
            }
            current.clone()
        }
        Accessor::Key => stack_get(key_stack.len().checked_sub(1)),
        Accessor::ParentKey => stack_get(key_stack.len().checked_sub(2)),
        Accessor::GrandParentKey =>
            stack_get(key_stack.len().checked_sub(3)),
        Accessor::AtDepth(depth) => stack_get(Some(*depth)),
    }
}

fn apply_transform(transform: Option<&Transform>, value: Value) -> Value {
    match transform {
        None => value,
        Some(Transform::Default(lit)) =>
            if value.is_null() {
                literal_to_value(lit)
            } else {
                value
            },
        Some(Transform::IfEmpty(lit)) => {
            let empty = match &value {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                _ => false,
            };
            if empty { literal_to_value(lit) } else { value }
        }
        Some(Transform::Number) | Some(Transform::Float) =>
            match &value {
                Value::Number(_) => value,
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            },
        Some(Transform::Int) => match &value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Value::from)
                .unwrap_or(Value::Null),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .map(|f| Value::from(f as i64))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        Some(Transform::String) => match &value {
            Value::Null => Value::Null,
            Value::String(_) => value,
            other => Value::String(json_to_plain_string(other)),
        },
        Some(Transform::Boolean) => match &value {
            Value::Bool(_) => value,
            Value::Number(n) => Value::Bool(n.as_f64() != Some(0.0)),
            Value::String(s) => Value::Bool(matches!(
                s.to_ascii_lowercase().as_str(),
                "true" | "1" | "yes"
            )),
            _ => Value::Null,
        },
    }
}

/// Parses a transform literal as a JSON scalar where possible, falling
/// back to a plain string: `default:0` is the number zero, not `"0"`.
fn literal_to_value(lit: &str) -> Value {
    serde_json::from_str::<Value>(lit)
        .ok()
        .filter(|v| !v.is_object() && !v.is_array())
        .unwrap_or_else(|| Value::String(lit.to_owned()))
}

fn json_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Recursive walk for `json_dictionary`.
fn walk_dictionary(
    node: &Value,
    depth: Option<usize>,
    fields: &FieldMap,
    key_stack: &mut Vec<String>,
    rows: &mut Vec<MappedRow>,
) -> Result<(), MappingError> {
    let object = node.as_object().ok_or(MappingError::NotAnObject)?;

    let at_leaf = match depth {
        Some(depth) => key_stack.len() == depth.saturating_sub(1),
        // Inferred: keep descending while every child is itself a
        // dictionary of objects; the children become the leaf elements as
        // soon as that stops holding.
        None => !object.values().all(|v| {
            v.as_object()
                .is_some_and(|o| !o.is_empty() && o.values().all(Value::is_object))
        }),
    };

    for (key, value) in object {
        key_stack.push(key.clone());
        if at_leaf {
            let borrowed: Vec<&str> =
                key_stack.iter().map(String::as_str).collect();
            rows.push(project(fields, value, &borrowed)?);
        } else {
            walk_dictionary(value, depth, fields, key_stack, rows)?;
        }
        key_stack.pop();
    }
    Ok(())
}

/// Evaluation for `text_regex`.
fn eval_text_regex(
    pattern: &str,
    fields: &FieldMap,
    status_mapping: &BTreeMap<String, String>,
    text: &str,
) -> Result<Vec<MappedRow>, MappingError> {
    let re = regex::Regex::new(pattern)
        .map_err(|e| MappingError::BadRegex(e.to_string()))?;

    let mut rows = Vec::new();
    for captures in re.captures_iter(text) {
        let mut row = MappedRow::new();
        for (name, rule) in fields {
            // Alternatives name capture groups (or indices); transforms
            // behave exactly as in the JSON case.
            let mut resolved = Value::Null;
            for accessor in &rule.alternatives {
                let group = match accessor {
                    Accessor::Path(segments) if segments.len() == 1 =>
                        &segments[0],
                    _ => continue,
                };
                let matched = match group.parse::<usize>() {
                    Ok(idx) => captures.get(idx),
                    Err(_) => captures.name(group),
                };
                if let Some(m) = matched {
                    resolved = Value::String(m.as_str().to_owned());
                    break;
                }
            }
            let mut value =
                apply_transform(rule.transform.as_ref(), resolved);

            // Canonicalize the status field through the mapping table.
            if name == "status" && !status_mapping.is_empty() {
                let literal = match &value {
                    Value::String(s) => s.clone(),
                    other => json_to_plain_string(other),
                };
                let canonical = status_mapping
                    .get(&literal)
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_owned());
                value = Value::String(canonical);
            }

            row.insert(name.clone(), value);
        }
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(name, rule)| {
                ((*name).to_owned(), rule.parse::<FieldRule>().unwrap())
            })
            .collect()
    }

    /// The nested price dictionary every aggregator seems to love:
    /// country -> service -> {price, count}.
    #[test]
    fn dictionary_parent_and_key_accessors() {
        let mapping = ResponseMapping::JsonDictionary {
            depth: None,
            fields: fields(&[
                ("country", "$parentKey"),
                ("service", "$key"),
                ("cost", "price"),
                ("count", "count"),
            ]),
        };
        let body = ResponseBody::Json(json!({
            "us": {
                "tg": {"price": 1.5, "count": 10},
                "wa": {"price": 2.0, "count": 5},
            }
        }));

        let rows = mapping.eval(&body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["country"], "us");
        assert_eq!(rows[0]["service"], "tg");
        assert_eq!(rows[0]["cost"], json!(1.5));
        assert_eq!(rows[0]["count"], json!(10));
        assert_eq!(rows[1]["service"], "wa");
        assert_eq!(rows[1]["cost"], json!(2.0));
    }

    /// `$atDepth:0..N` returns each ancestor key in order, outermost
    /// first.
    #[test]
    fn dictionary_at_depth_accessors() {
        let mapping = ResponseMapping::JsonDictionary {
            depth: Some(3),
            fields: fields(&[
                ("d0", "$atDepth:0"),
                ("d1", "$atDepth:1"),
                ("d2", "$atDepth:2"),
                ("cost", "price"),
            ]),
        };
        let body = ResponseBody::Json(json!({
            "ru": {"tg": {"mts": {"price": 0.42}}}
        }));

        let rows = mapping.eval(&body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["d0"], "ru");
        assert_eq!(rows[0]["d1"], "tg");
        assert_eq!(rows[0]["d2"], "mts");
        assert_eq!(rows[0]["cost"], json!(0.42));
    }

    /// Field fallback chain `a|b|c` selects the first defined, non-null
    /// value.
    #[test]
    fn fallback_chain() {
        let rule: FieldRule = "price|cost|amount".parse().unwrap();
        let pick = |element: Value| {
            eval_rule(&rule, &element, &[])
        };
        assert_eq!(pick(json!({"price": 1, "cost": 2})), json!(1));
        assert_eq!(pick(json!({"price": null, "cost": 2})), json!(2));
        assert_eq!(pick(json!({"amount": 3})), json!(3));
        assert_eq!(pick(json!({})), Value::Null);
    }

    #[test]
    fn transforms() {
        let element = json!({
            "n": "1.5", "i": "42", "b": "yes", "s": 7, "e": ""
        });
        let eval = |rule: &str| {
            eval_rule(&rule.parse::<FieldRule>().unwrap(), &element, &[])
        };
        assert_eq!(eval("n:number"), json!(1.5));
        assert_eq!(eval("i:int"), json!(42));
        assert_eq!(eval("b:boolean"), json!(true));
        assert_eq!(eval("s:string"), json!("7"));
        assert_eq!(eval("missing:default:0"), json!(0));
        assert_eq!(eval("missing:default:any"), json!("any"));
        assert_eq!(eval("e:ifEmpty:unset"), json!("unset"));
        assert_eq!(eval("i:ifEmpty:unset"), json!("42"));
    }

    #[test]
    fn json_array_with_root() {
        let mapping = ResponseMapping::JsonArray {
            root: Some("data.items".to_owned()),
            fields: fields(&[("code", "iso|id"), ("name", "title")]),
        };
        let body = ResponseBody::Json(json!({
            "data": {"items": [
                {"iso": "us", "title": "United States"},
                {"id": "gb", "title": "United Kingdom"},
            ]}
        }));
        let rows = mapping.eval(&body).unwrap();
        assert_eq!(rows[0]["code"], "us");
        assert_eq!(rows[1]["code"], "gb");
        assert_eq!(rows[1]["name"], "United Kingdom");
    }

    #[test]
    fn json_value_and_keyed_value() {
        let mapping = ResponseMapping::JsonValue {
            path: "balance.amount".to_owned(),
        };
        let body = ResponseBody::Json(json!({"balance": {"amount": 12.34}}));
        let rows = mapping.eval(&body).unwrap();
        assert_eq!(rows[0]["value"], json!(12.34));

        let mapping = ResponseMapping::JsonKeyedValue {
            key_field: "service".to_owned(),
            value_field: "count".to_owned(),
        };
        let body = ResponseBody::Json(json!({"tg": 10, "wa": 5}));
        let rows = mapping.eval(&body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["service"], "tg");
        assert_eq!(rows[0]["count"], json!(10));
    }

    #[test]
    fn positional_tuple() {
        let mapping = ResponseMapping::JsonArrayPositional {
            fields: vec![
                "activation_id".to_owned(),
                "phone".to_owned(),
                "price".to_owned(),
            ],
        };
        let body = ResponseBody::Json(json!(["A123", "+15551234567", 1.2]));
        let rows = mapping.eval(&body).unwrap();
        assert_eq!(rows[0]["activation_id"], "A123");
        assert_eq!(rows[0]["phone"], "+15551234567");

        // A sequence of tuples also works.
        let body = ResponseBody::Json(json!([["A1", "+1", 1], ["A2", "+2", 2]]));
        let rows = mapping.eval(&body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["activation_id"], "A2");
    }

    #[test]
    fn nested_array_table() {
        let mapping = ResponseMapping::JsonNestedArray {
            root: None,
            fields: fields(&[
                ("country", "country"),
                ("cost", "price:number"),
            ]),
        };
        let body = ResponseBody::Json(json!([
            ["country", "price", "stock"],
            ["us", "1.5", 10],
            ["gb", "2.5", 3],
        ]));
        let rows = mapping.eval(&body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["country"], "us");
        assert_eq!(rows[0]["cost"], json!(1.5));
        assert_eq!(rows[1]["country"], "gb");
    }

    /// `text_regex` with a status mapping returns the mapped canonical
    /// value for every configured literal and `unknown` otherwise.
    #[test]
    fn text_regex_status_mapping() {
        let mapping = ResponseMapping::TextRegex {
            pattern: r"STATUS_(?P<status>\w+)(?::(?P<code>\d+))?".to_owned(),
            fields: fields(&[("status", "status"), ("code", "code")]),
            status_mapping: [
                ("WAIT_CODE".to_owned(), "pending".to_owned()),
                ("OK".to_owned(), "received".to_owned()),
                ("CANCEL".to_owned(), "cancelled".to_owned()),
            ]
            .into_iter()
            .collect(),
        };

        let configured = [
            ("STATUS_WAIT_CODE", "pending"),
            ("STATUS_OK:842193", "received"),
            ("STATUS_CANCEL", "cancelled"),
        ];
        for (input, expected) in configured {
            let body = ResponseBody::Text(input.to_owned());
            let rows = mapping.eval(&body).unwrap();
            assert_eq!(rows[0]["status"], *expected, "input: {input}");
        }

        let body = ResponseBody::Text("STATUS_EXPLODED".to_owned());
        let rows = mapping.eval(&body).unwrap();
        assert_eq!(rows[0]["status"], "unknown");

        // Numbered group access also works.
        let mapping = ResponseMapping::TextRegex {
            pattern: r"ACCESS_NUMBER:(\d+):(\+?\d+)".to_owned(),
            fields: fields(&[("activation_id", "1"), ("phone", "2")]),
            status_mapping: BTreeMap::new(),
        };
        let body = ResponseBody::Text(
            "ACCESS_NUMBER:12345:+15551230000".to_owned(),
        );
        let rows = mapping.eval(&body).unwrap();
        assert_eq!(rows[0]["activation_id"], "12345");
        assert_eq!(rows[0]["phone"], "+15551230000");
    }

    #[test]
    fn field_rule_serde_roundtrip() {
        for rule in [
            "price|cost|amount:number",
            "$atDepth:2",
            "$parentKey",
            "a.b.c",
            "name:default:Unknown",
            "operator:ifEmpty:any",
        ] {
            let parsed: FieldRule = rule.parse().unwrap();
            assert_eq!(parsed.to_string(), rule);
            let json = serde_json::to_string(&parsed).unwrap();
            let back: FieldRule = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, back);
        }

        assert!("".parse::<FieldRule>().is_err());
        assert!("$bogus".parse::<FieldRule>().is_err());
        assert!("a||b".parse::<FieldRule>().is_err());
    }
}
