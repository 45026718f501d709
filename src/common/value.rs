// Tagged field values.
//
// Raw values coming off the wire are heterogeneous: scalars, `false` as a
// null marker, `[id, name]` pairs for many2one references, and id lists
// for collections. Everything is normalized into `FieldValue` at the
// transport boundary so the record layer never sees raw JSON shapes.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::models::registry::FieldKind;
use crate::RecordId;

/// A normalized field value.
///
/// `Ref` keeps the display name the wire sends alongside a many2one id;
/// callers that only need the id ignore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// Single foreign reference (many2one).
    Ref {
        id: RecordId,
        display_name: Option<String>,
    },
    /// Foreign id list (one2many / many2many).
    RefMany(Vec<RecordId>),
    /// Anything the normalizer has no better shape for (selections with
    /// structured values, context dicts).
    Json(Json),
}

impl FieldValue {
    /// Normalize a raw wire value.
    ///
    /// When field metadata is available it disambiguates `false` (null
    /// marker vs. boolean) and parses date/datetime strings; without it
    /// the shape of the JSON decides.
    pub fn from_wire(raw: &Json, kind: Option<&FieldKind>) -> Self {
        match raw {
            Json::Null => FieldValue::Null,
            Json::Bool(b) => {
                // The wire uses `false` as the null marker for every
                // non-boolean field.
                if !b && !matches!(kind, Some(FieldKind::Boolean)) {
                    FieldValue::Null
                } else {
                    FieldValue::Bool(*b)
                }
            }
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    match kind {
                        Some(FieldKind::Float) | Some(FieldKind::Monetary) => {
                            FieldValue::Float(i as f64)
                        }
                        Some(FieldKind::Many2One { .. }) => FieldValue::Ref {
                            id: i,
                            display_name: None,
                        },
                        _ => FieldValue::Int(i),
                    }
                } else {
                    FieldValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => match kind {
                Some(FieldKind::Date) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map(FieldValue::Date)
                    .unwrap_or_else(|_| FieldValue::String(s.clone())),
                Some(FieldKind::DateTime) => {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                        .map(FieldValue::DateTime)
                        .unwrap_or_else(|_| FieldValue::String(s.clone()))
                }
                _ => FieldValue::String(s.clone()),
            },
            Json::Array(items) => Self::from_wire_array(items, kind),
            Json::Object(_) => FieldValue::Json(raw.clone()),
        }
    }

    fn from_wire_array(items: &[Json], kind: Option<&FieldKind>) -> Self {
        // `[id, "Display Name"]` is the many2one wire shape.
        if items.len() == 2 && items[0].is_i64() && items[1].is_string() {
            let collection = matches!(
                kind,
                Some(FieldKind::One2Many { .. }) | Some(FieldKind::Many2Many { .. })
            );
            if !collection {
                return FieldValue::Ref {
                    id: items[0].as_i64().unwrap_or_default(),
                    display_name: items[1].as_str().map(str::to_string),
                };
            }
        }

        if items.iter().all(|v| v.is_i64()) {
            return FieldValue::RefMany(
                items.iter().filter_map(Json::as_i64).collect(),
            );
        }

        FieldValue::Json(Json::Array(items.to_vec()))
    }

    /// Encode back into the wire representation.
    pub fn to_wire(&self) -> Json {
        match self {
            FieldValue::Null => Json::Bool(false),
            FieldValue::Bool(b) => Json::Bool(*b),
            FieldValue::Int(i) => Json::from(*i),
            FieldValue::Float(f) => Json::from(*f),
            FieldValue::String(s) => Json::String(s.clone()),
            FieldValue::Bytes(b) => Json::String(base16_encode(b)),
            FieldValue::Date(d) => Json::String(d.format("%Y-%m-%d").to_string()),
            FieldValue::DateTime(dt) => {
                Json::String(dt.format("%Y-%m-%d %H:%M:%S").to_string())
            }
            FieldValue::Ref { id, .. } => Json::from(*id),
            FieldValue::RefMany(ids) => {
                Json::Array(ids.iter().map(|id| Json::from(*id)).collect())
            }
            FieldValue::Json(v) => v.clone(),
        }
    }

    /// The foreign id of a `Ref`, or `None` for anything else.
    pub fn ref_id(&self) -> Option<RecordId> {
        match self {
            FieldValue::Ref { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// The foreign ids this value references, if any.
    pub fn ref_ids(&self) -> Option<Vec<RecordId>> {
        match self {
            FieldValue::Ref { id, .. } => Some(vec![*id]),
            FieldValue::RefMany(ids) => Some(ids.clone()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Float(f)
    }
}

fn base16_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
