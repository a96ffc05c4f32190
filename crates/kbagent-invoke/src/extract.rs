//! ResultExtractor: declarative walk of the result subgraph.
//!
//! Every completed action is expected to carry
//! `action ═nrel_result═► structure`. What hangs off the structure depends
//! on the action and is described by a [`ResultSpec`]:
//!
//! - `Unit`: nothing is read
//! - `ScalarLink`: one member link, returned as text
//! - `TypedScalar`: one member link, parsed as int / float / bool / text
//! - `RecordList`: one record per member, each field pulled by its own
//!   sub-pattern
//!
//! Field patterns see three pre-bound variables: [`VAR_ACTION`],
//! [`VAR_RESULT`] and [`VAR_MEMBER`].

use crate::waiter::CompletionOutcome;
use kbagent_graph::{
    Binding, EdgeKind, KbTransport, NodeKind, NodeRef, Pattern, Term, TransportError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const VAR_ACTION: &str = "_action";
pub const VAR_RESULT: &str = "_result";
pub const VAR_MEMBER: &str = "_member";

// ============================================================================
// Specs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Int,
    Float,
    Bool,
    Text,
}

/// Shape of the result an action produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "spec", rename_all = "snake_case")]
pub enum ResultSpec {
    Unit,
    ScalarLink,
    TypedScalar(ScalarType),
    RecordList(RecordSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSpec {
    /// Kind every member must satisfy (`Node` for any non-link)
    pub member_kind: NodeKind,
    /// Only members of this class count as records
    #[serde(default)]
    pub member_class: Option<String>,
    pub fields: Vec<FieldSpec>,
}

impl RecordSpec {
    pub fn new(member_kind: NodeKind) -> Self {
        Self {
            member_kind,
            member_class: None,
            fields: Vec::new(),
        }
    }

    pub fn member_class(mut self, class: impl Into<String>) -> Self {
        self.member_class = Some(class.into());
        self
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadAs {
    /// Link content
    Content,
    /// The element itself
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Exactly one match is required; none is a malformed result
    One,
    Optional,
    Many,
}

/// One named field of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Empty pattern reads the pre-bound variables directly
    #[serde(default)]
    pub pattern: Pattern,
    pub read_var: String,
    pub read: ReadAs,
    pub cardinality: Cardinality,
}

impl FieldSpec {
    pub fn new(
        name: impl Into<String>,
        pattern: Pattern,
        read_var: impl Into<String>,
        read: ReadAs,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            pattern,
            read_var: read_var.into(),
            read,
            cardinality,
        }
    }

    /// Content of the member link itself.
    pub fn member_content(name: impl Into<String>) -> Self {
        Self::new(name, Pattern::new(), VAR_MEMBER, ReadAs::Content, Cardinality::One)
    }

    /// The member element itself.
    pub fn member_node(name: impl Into<String>) -> Self {
        Self::new(name, Pattern::new(), VAR_MEMBER, ReadAs::Node, Cardinality::One)
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Texts(Vec<String>),
    Node(NodeRef),
    Nodes(Vec<NodeRef>),
    Absent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub member: NodeRef,
    pub fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Text values of a field; a single value counts as one.
    pub fn texts(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            Some(FieldValue::Texts(texts)) => texts.clone(),
            Some(FieldValue::Text(text)) => vec![text.clone()],
            _ => Vec::new(),
        }
    }

    pub fn node(&self, name: &str) -> Option<NodeRef> {
        match self.get(name)? {
            FieldValue::Node(node) => Some(*node),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Unit,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Records(Vec<Record>),
}

impl Payload {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Payload::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Payload::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_records(self) -> Option<Vec<Record>> {
        match self {
            Payload::Records(records) => Some(records),
            _ => None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Success was reported but the result subgraph does not have the
/// expected shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed result: {reason}")]
pub struct MalformedResult {
    pub reason: String,
    /// Unparsed link content, when there was any
    pub raw: Option<String>,
}

impl MalformedResult {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            raw: None,
        }
    }

    pub fn with_raw(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            raw: Some(raw.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    Malformed(#[from] MalformedResult),
    #[error("transport error during extraction: {0}")]
    Transport(#[from] TransportError),
}

// ============================================================================
// Extractor
// ============================================================================

pub struct ResultExtractor {
    transport: Arc<dyn KbTransport>,
    result_relation: String,
}

impl ResultExtractor {
    pub fn new(transport: Arc<dyn KbTransport>, result_relation: impl Into<String>) -> Self {
        Self {
            transport,
            result_relation: result_relation.into(),
        }
    }

    /// `Ok(None)` unless the action succeeded.
    pub fn extract(
        &self,
        action: NodeRef,
        outcome: CompletionOutcome,
        spec: &ResultSpec,
    ) -> Result<Option<Payload>, ExtractError> {
        if outcome != CompletionOutcome::Succeeded {
            return Ok(None);
        }
        self.extract_succeeded(action, spec).map(Some)
    }

    /// Read the result of an action already known to have succeeded.
    pub fn extract_succeeded(
        &self,
        action: NodeRef,
        spec: &ResultSpec,
    ) -> Result<Payload, ExtractError> {
        Ok(match spec {
            ResultSpec::Unit => Payload::Unit,
            ResultSpec::ScalarLink => Payload::Text(self.scalar_text(action)?),
            ResultSpec::TypedScalar(ty) => parse_scalar(*ty, self.scalar_text(action)?)?,
            ResultSpec::RecordList(record) => Payload::Records(self.records(action, record)?),
        })
    }

    /// The structure attached by `nrel_result`.
    fn result_structure(&self, action: NodeRef) -> Result<NodeRef, ExtractError> {
        let pattern = Pattern::new().triple_with_relation(
            action,
            EdgeKind::Common,
            Term::var(VAR_RESULT),
            Term::idtf(&self.result_relation),
        );
        let rows = self.transport.search(&pattern)?;
        let Some(first) = rows.first() else {
            return Err(MalformedResult::new(format!(
                "action {action} has no {} structure",
                self.result_relation
            ))
            .into());
        };
        if rows.len() > 1 {
            tracing::debug!(action = %action, count = rows.len(), "several result structures, using the first");
        }
        Ok(first.require(VAR_RESULT)?)
    }

    fn scalar_text(&self, action: NodeRef) -> Result<String, ExtractError> {
        let structure = self.result_structure(action)?;
        match self.transport.read_link_content(structure) {
            Ok(text) => return Ok(text),
            Err(TransportError::NotALink(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let pattern = Pattern::new().triple(
            structure,
            EdgeKind::Access,
            Term::var_of(NodeKind::Link, "_link"),
        );
        let rows = self.transport.search(&pattern)?;
        let Some(row) = rows.first() else {
            return Err(MalformedResult::new(format!(
                "result structure {structure} of {action} has no link"
            ))
            .into());
        };
        Ok(self.transport.read_link_content(row.require("_link")?)?)
    }

    fn records(&self, action: NodeRef, spec: &RecordSpec) -> Result<Vec<Record>, ExtractError> {
        let structure = self.result_structure(action)?;
        let seed = Binding::new()
            .with(VAR_ACTION, action)
            .with(VAR_RESULT, structure);

        let mut pattern = Pattern::new().triple(
            Term::bound(VAR_RESULT),
            EdgeKind::Access,
            Term::var_of(spec.member_kind, VAR_MEMBER),
        );
        if let Some(class) = &spec.member_class {
            pattern = pattern.triple(Term::idtf(class), EdgeKind::Access, Term::bound(VAR_MEMBER));
        }

        let mut members: Vec<NodeRef> = Vec::new();
        for row in self.transport.search_from(&pattern, &seed)? {
            let member = row.require(VAR_MEMBER)?;
            if !members.contains(&member) {
                members.push(member);
            }
        }

        let mut records = Vec::with_capacity(members.len());
        for member in members {
            let scope = seed.clone().with(VAR_MEMBER, member);
            let mut fields = Vec::with_capacity(spec.fields.len());
            for field in &spec.fields {
                fields.push((field.name.clone(), self.field(action, member, &scope, field)?));
            }
            records.push(Record { member, fields });
        }
        Ok(records)
    }

    fn field(
        &self,
        action: NodeRef,
        member: NodeRef,
        scope: &Binding,
        field: &FieldSpec,
    ) -> Result<FieldValue, ExtractError> {
        let rows = if field.pattern.is_empty() {
            vec![scope.clone()]
        } else {
            self.transport.search_from(&field.pattern, scope)?
        };

        let mut nodes: Vec<NodeRef> = Vec::new();
        for row in &rows {
            let node = row.require(&field.read_var)?;
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        }

        let first = nodes.first().copied();
        let value = match (field.cardinality, first) {
            (Cardinality::One, None) => {
                return Err(MalformedResult::new(format!(
                    "field '{}' missing for member {member} of {action}",
                    field.name
                ))
                .into())
            }
            (Cardinality::Optional, None) => FieldValue::Absent,
            (Cardinality::One | Cardinality::Optional, Some(node)) => match field.read {
                ReadAs::Node => FieldValue::Node(node),
                ReadAs::Content => FieldValue::Text(self.content(node, &field.name)?),
            },
            (Cardinality::Many, _) => match field.read {
                ReadAs::Node => FieldValue::Nodes(nodes),
                ReadAs::Content => FieldValue::Texts(
                    nodes
                        .iter()
                        .map(|node| self.content(*node, &field.name))
                        .collect::<Result<_, _>>()?,
                ),
            },
        };
        Ok(value)
    }

    fn content(&self, node: NodeRef, field: &str) -> Result<String, ExtractError> {
        match self.transport.read_link_content(node) {
            Ok(text) => Ok(text),
            Err(TransportError::NotALink(_)) => Err(MalformedResult::new(format!(
                "field '{field}' expects a link, {node} is not one"
            ))
            .into()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Parse link text as a typed scalar, keeping the raw text on failure.
pub fn parse_scalar(ty: ScalarType, raw: String) -> Result<Payload, MalformedResult> {
    let text = raw.trim();
    let parsed = match ty {
        ScalarType::Text => return Ok(Payload::Text(raw)),
        ScalarType::Int => text.parse().ok().map(Payload::Int),
        ScalarType::Float => text.parse().ok().map(Payload::Float),
        ScalarType::Bool => match text.to_ascii_lowercase().as_str() {
            "1" | "true" => Some(Payload::Bool(true)),
            "0" | "false" => Some(Payload::Bool(false)),
            _ => None,
        },
    };
    parsed.ok_or_else(|| MalformedResult::with_raw(format!("expected {ty:?} scalar"), raw))
}

#[cfg(test)]
mod tests;
