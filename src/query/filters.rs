// Keyword filter lookups.
//
// Django-style field lookups (`name__ilike`, `age__gte`, `state__in`,
// `parent__isnull`) parsed into domain leaves. Path segments before the
// lookup suffix become a dotted related-field path.

use serde_json::{json, Value as Json};

use crate::common::{DomainLeaf, DomainOperator};
use crate::query::expressions::Expr;

/// Parse one `field[__path]__lookup` pair into an expression.
///
/// A trailing segment that is not a known lookup is part of the field
/// path; `company_id__name` filters on `company_id.name` with equality.
pub fn lookup(field_lookup: &str, value: Json) -> Expr {
    Expr::Leaf(parse_lookup(field_lookup, value))
}

/// AND-combine a set of keyword lookups.
pub fn lookups(pairs: Vec<(&str, Json)>) -> Option<Expr> {
    let mut combined: Option<Expr> = None;
    for (field_lookup, value) in pairs {
        let expr = lookup(field_lookup, value);
        combined = Some(match combined {
            Some(acc) => acc.and(expr),
            None => expr,
        });
    }
    combined
}

fn parse_lookup(field_lookup: &str, value: Json) -> DomainLeaf {
    let parts: Vec<&str> = field_lookup.split("__").collect();

    let (path, suffix) = match parts.split_last() {
        Some((last, rest)) if !rest.is_empty() && is_lookup(last) => (rest.to_vec(), *last),
        _ => (parts, "exact"),
    };

    let field = path.join(".");
    let (operator, value) = translate(suffix, value);
    DomainLeaf::new(field, operator, value)
}

fn is_lookup(token: &str) -> bool {
    matches!(
        token,
        "exact"
            | "iexact"
            | "contains"
            | "icontains"
            | "startswith"
            | "istartswith"
            | "endswith"
            | "iendswith"
            | "like"
            | "ilike"
            | "gt"
            | "gte"
            | "lt"
            | "lte"
            | "ne"
            | "in"
            | "not_in"
            | "isnull"
            | "isnotnull"
    )
}

/// Lookup suffix -> (operator, transformed value).
fn translate(suffix: &str, value: Json) -> (DomainOperator, Json) {
    match suffix {
        "exact" => (DomainOperator::Eq, value),
        "iexact" => (DomainOperator::ILike, value),
        "contains" | "icontains" => (
            DomainOperator::ILike,
            Json::String(format!("%{}%", text(&value))),
        ),
        "startswith" | "istartswith" => (
            DomainOperator::ILike,
            Json::String(format!("{}%", text(&value))),
        ),
        "endswith" | "iendswith" => (
            DomainOperator::ILike,
            Json::String(format!("%{}", text(&value))),
        ),
        "like" => (DomainOperator::Like, value),
        "ilike" => (DomainOperator::ILike, value),
        "gt" => (DomainOperator::Gt, value),
        "gte" => (DomainOperator::Ge, value),
        "lt" => (DomainOperator::Lt, value),
        "lte" => (DomainOperator::Le, value),
        "ne" => (DomainOperator::Ne, value),
        "in" => (DomainOperator::In, value),
        "not_in" => (DomainOperator::NotIn, value),
        // Null checks ignore the given value; the wire null is `false`.
        "isnull" => (DomainOperator::Eq, json!(false)),
        "isnotnull" => (DomainOperator::Ne, json!(false)),
        _ => (DomainOperator::Eq, value),
    }
}

fn text(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}
