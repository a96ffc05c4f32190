//! Search patterns: ordered triples over fixed nodes, identifiers and variables.
//!
//! A [`Pattern`] is matched triple by triple, left to right. A `Var` term
//! introduces a new variable (optionally constrained to a [`NodeKind`]); a
//! `Ref` term reuses a variable bound by an earlier triple or preset by the
//! caller. `Idtf` terms name well-known markers and are resolved by the
//! knowledge base at search time.

use crate::{EdgeKind, NodeKind, NodeRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One position of a triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    /// A concrete element
    Node(NodeRef),
    /// A marker, resolved by identifier (kind is not constrained)
    Idtf(String),
    /// A fresh variable, optionally constrained to a node kind
    Var {
        name: String,
        #[serde(default)]
        kind: Option<NodeKind>,
    },
    /// A previously bound variable
    Ref(String),
}

impl Term {
    pub fn var(name: impl Into<String>) -> Self {
        Term::Var {
            name: name.into(),
            kind: None,
        }
    }

    pub fn var_of(kind: NodeKind, name: impl Into<String>) -> Self {
        Term::Var {
            name: name.into(),
            kind: Some(kind),
        }
    }

    pub fn idtf(idtf: impl Into<String>) -> Self {
        Term::Idtf(idtf.into())
    }

    pub fn bound(name: impl Into<String>) -> Self {
        Term::Ref(name.into())
    }

    /// Variable name introduced or referenced by this term.
    pub fn variable(&self) -> Option<&str> {
        match self {
            Term::Var { name, .. } | Term::Ref(name) => Some(name),
            _ => None,
        }
    }
}

impl From<NodeRef> for Term {
    fn from(node: NodeRef) -> Self {
        Term::Node(node)
    }
}

/// `source --edge--> target`, optionally labelled by a relation node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    pub source: Term,
    pub edge: EdgeKind,
    pub target: Term,
    #[serde(default)]
    pub relation: Option<Term>,
}

/// An ordered conjunction of triples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub triples: Vec<Triple>,
}

impl Pattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an unlabelled triple.
    pub fn triple(mut self, source: impl Into<Term>, edge: EdgeKind, target: impl Into<Term>) -> Self {
        self.triples.push(Triple {
            source: source.into(),
            edge,
            target: target.into(),
            relation: None,
        });
        self
    }

    /// Append a triple whose edge is labelled by `relation`.
    pub fn triple_with_relation(
        mut self,
        source: impl Into<Term>,
        edge: EdgeKind,
        target: impl Into<Term>,
        relation: impl Into<Term>,
    ) -> Self {
        self.triples.push(Triple {
            source: source.into(),
            edge,
            target: target.into(),
            relation: Some(relation.into()),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// All variable names that appear in the pattern, in first-use order.
    pub fn variables(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for triple in &self.triples {
            let terms = [Some(&triple.source), Some(&triple.target), triple.relation.as_ref()];
            for name in terms.into_iter().flatten().filter_map(Term::variable) {
                if !out.contains(&name) {
                    out.push(name);
                }
            }
        }
        out
    }
}

/// Result row of a pattern search: variable name → element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    vars: BTreeMap<String, NodeRef>,
}

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, node: NodeRef) -> Self {
        self.vars.insert(name.into(), node);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, node: NodeRef) {
        self.vars.insert(name.into(), node);
    }

    pub fn get(&self, name: &str) -> Option<NodeRef> {
        self.vars.get(name).copied()
    }

    /// Like [`Binding::get`], but a missing variable is an error.
    pub fn require(&self, name: &str) -> crate::TransportResult<NodeRef> {
        self.get(name)
            .ok_or_else(|| crate::TransportError::UnboundVariable(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeRef)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
