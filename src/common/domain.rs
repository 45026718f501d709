// Search domains in Polish notation.
//
// A domain is a flat list mixing prefix operators ("&", "|", "!") and
// `(field, op, value)` leaves. "&" is the implicit default between
// adjacent leaves, so a plain conjunction is just a list of leaves.

use serde_json::Value as Json;
use std::fmt;

/// Comparison operator of a domain leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainOperator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    ILike,
    In,
    NotIn,
}

impl DomainOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainOperator::Eq => "=",
            DomainOperator::Ne => "!=",
            DomainOperator::Gt => ">",
            DomainOperator::Ge => ">=",
            DomainOperator::Lt => "<",
            DomainOperator::Le => "<=",
            DomainOperator::Like => "like",
            DomainOperator::ILike => "ilike",
            DomainOperator::In => "in",
            DomainOperator::NotIn => "not in",
        }
    }
}

impl fmt::Display for DomainOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `(field, operator, value)` condition.
///
/// Field names may be dotted paths into related models
/// (`partner_id.country_id.code`).
#[derive(Debug, Clone, PartialEq)]
pub struct DomainLeaf {
    pub field: String,
    pub operator: DomainOperator,
    pub value: Json,
}

impl DomainLeaf {
    pub fn new(field: impl Into<String>, operator: DomainOperator, value: Json) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }
}

/// One token of a domain list.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainNode {
    /// Binary AND (the implicit default).
    And,
    /// Binary OR.
    Or,
    /// Unary NOT.
    Not,
    Leaf(DomainLeaf),
}

/// A complete search domain.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Domain {
    nodes: Vec<DomainNode>,
}

impl Domain {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn leaf(field: impl Into<String>, operator: DomainOperator, value: Json) -> Self {
        Self {
            nodes: vec![DomainNode::Leaf(DomainLeaf::new(field, operator, value))],
        }
    }

    pub fn from_nodes(nodes: Vec<DomainNode>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[DomainNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Append another domain; conjunction between the two is implicit.
    pub fn extend(&mut self, other: Domain) {
        self.nodes.extend(other.nodes);
    }

    pub fn push(&mut self, node: DomainNode) {
        self.nodes.push(node);
    }

    /// Encode into the wire list-of-tokens form.
    ///
    /// Leaves become 3-element arrays; operators become their string
    /// tokens. Booleans stay booleans.
    pub fn to_wire(&self) -> Json {
        let tokens: Vec<Json> = self
            .nodes
            .iter()
            .map(|node| match node {
                DomainNode::And => Json::String("&".to_string()),
                DomainNode::Or => Json::String("|".to_string()),
                DomainNode::Not => Json::String("!".to_string()),
                DomainNode::Leaf(leaf) => Json::Array(vec![
                    Json::String(leaf.field.clone()),
                    Json::String(leaf.operator.as_str().to_string()),
                    leaf.value.clone(),
                ]),
            })
            .collect();
        Json::Array(tokens)
    }

    /// The leaves of this domain, in order.
    pub fn leaves(&self) -> impl Iterator<Item = &DomainLeaf> {
        self.nodes.iter().filter_map(|n| match n {
            DomainNode::Leaf(leaf) => Some(leaf),
            _ => None,
        })
    }
}

impl From<DomainLeaf> for Domain {
    fn from(leaf: DomainLeaf) -> Self {
        Domain {
            nodes: vec![DomainNode::Leaf(leaf)],
        }
    }
}
