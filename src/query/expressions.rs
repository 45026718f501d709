// Query expressions.
//
// A typed condition tree that renders into a Polish-notation domain.
// `field("name").ilike("acme%") & field("is_company").eq(true)` builds
// the tree; the builder turns it into wire tokens. Each subtree encodes
// as exactly one term so `!`, `&`, and `|` always bind correctly.

use serde_json::{json, Value as Json};
use std::ops::{BitAnd, BitOr, Not};

use crate::common::{Domain, DomainLeaf, DomainNode, DomainOperator};

/// A condition tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Leaf(DomainLeaf),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

/// Entry point for building field conditions.
pub fn field(name: impl Into<String>) -> Field {
    Field { name: name.into() }
}

/// A field reference; supports dotted paths into related models.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
}

impl Field {
    fn leaf(self, operator: DomainOperator, value: Json) -> Expr {
        Expr::Leaf(DomainLeaf::new(self.name, operator, value))
    }

    pub fn eq(self, value: impl Into<Json>) -> Expr {
        self.leaf(DomainOperator::Eq, value.into())
    }

    pub fn ne(self, value: impl Into<Json>) -> Expr {
        self.leaf(DomainOperator::Ne, value.into())
    }

    pub fn gt(self, value: impl Into<Json>) -> Expr {
        self.leaf(DomainOperator::Gt, value.into())
    }

    pub fn gte(self, value: impl Into<Json>) -> Expr {
        self.leaf(DomainOperator::Ge, value.into())
    }

    pub fn lt(self, value: impl Into<Json>) -> Expr {
        self.leaf(DomainOperator::Lt, value.into())
    }

    pub fn lte(self, value: impl Into<Json>) -> Expr {
        self.leaf(DomainOperator::Le, value.into())
    }

    pub fn like(self, pattern: impl Into<String>) -> Expr {
        self.leaf(DomainOperator::Like, Json::String(pattern.into()))
    }

    pub fn ilike(self, pattern: impl Into<String>) -> Expr {
        self.leaf(DomainOperator::ILike, Json::String(pattern.into()))
    }

    pub fn in_(self, values: impl Into<Json>) -> Expr {
        self.leaf(DomainOperator::In, values.into())
    }

    pub fn not_in(self, values: impl Into<Json>) -> Expr {
        self.leaf(DomainOperator::NotIn, values.into())
    }

    /// Substring match, case-insensitive (`%value%`).
    pub fn contains(self, value: impl AsRef<str>) -> Expr {
        let pattern = format!("%{}%", value.as_ref());
        self.leaf(DomainOperator::ILike, Json::String(pattern))
    }

    /// Prefix match, case-insensitive (`value%`).
    pub fn startswith(self, value: impl AsRef<str>) -> Expr {
        let pattern = format!("{}%", value.as_ref());
        self.leaf(DomainOperator::ILike, Json::String(pattern))
    }

    /// Suffix match, case-insensitive (`%value`).
    pub fn endswith(self, value: impl AsRef<str>) -> Expr {
        let pattern = format!("%{}", value.as_ref());
        self.leaf(DomainOperator::ILike, Json::String(pattern))
    }

    /// Null check: the wire represents null as `false`.
    pub fn is_null(self) -> Expr {
        self.leaf(DomainOperator::Eq, json!(false))
    }

    pub fn is_not_null(self) -> Expr {
        self.leaf(DomainOperator::Ne, json!(false))
    }
}

impl Expr {
    /// Flatten nested conjunctions while combining.
    pub fn and(self, other: Expr) -> Expr {
        match (self, other) {
            (Expr::And(mut left), Expr::And(right)) => {
                left.extend(right);
                Expr::And(left)
            }
            (Expr::And(mut left), right) => {
                left.push(right);
                Expr::And(left)
            }
            (left, Expr::And(mut right)) => {
                right.insert(0, left);
                Expr::And(right)
            }
            (left, right) => Expr::And(vec![left, right]),
        }
    }

    pub fn or(self, other: Expr) -> Expr {
        match (self, other) {
            (Expr::Or(mut left), Expr::Or(right)) => {
                left.extend(right);
                Expr::Or(left)
            }
            (Expr::Or(mut left), right) => {
                left.push(right);
                Expr::Or(left)
            }
            (left, Expr::Or(mut right)) => {
                right.insert(0, left);
                Expr::Or(right)
            }
            (left, right) => Expr::Or(vec![left, right]),
        }
    }

    pub fn negate(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// Encode as a single Polish-notation term.
    ///
    /// An n-way conjunction/disjunction needs n-1 prefix operators so
    /// the whole subtree reads as one term (which is what `!` negates).
    fn push_term(&self, nodes: &mut Vec<DomainNode>) {
        match self {
            Expr::Leaf(leaf) => nodes.push(DomainNode::Leaf(leaf.clone())),
            Expr::And(children) => {
                for _ in 1..children.len() {
                    nodes.push(DomainNode::And);
                }
                for child in children {
                    child.push_term(nodes);
                }
            }
            Expr::Or(children) => {
                for _ in 1..children.len() {
                    nodes.push(DomainNode::Or);
                }
                for child in children {
                    child.push_term(nodes);
                }
            }
            Expr::Not(child) => {
                nodes.push(DomainNode::Not);
                child.push_term(nodes);
            }
        }
    }

    /// Render to a domain. A top-level conjunction relies on the
    /// implicit AND between adjacent terms.
    pub fn to_domain(&self) -> Domain {
        let mut nodes = Vec::new();
        match self {
            Expr::And(children) => {
                for child in children {
                    child.push_term(&mut nodes);
                }
            }
            other => other.push_term(&mut nodes),
        }
        Domain::from_nodes(nodes)
    }
}

impl BitAnd for Expr {
    type Output = Expr;

    fn bitand(self, other: Expr) -> Expr {
        self.and(other)
    }
}

impl BitOr for Expr {
    type Output = Expr;

    fn bitor(self, other: Expr) -> Expr {
        self.or(other)
    }
}

impl Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        self.negate()
    }
}
