//! Typed action catalog.
//!
//! Each action kind declares its positional roles, its result shape and its
//! own deadline. Calls are checked against the catalog before anything is
//! written, so a wrong argument list fails fast instead of as a timeout.

use crate::error::{InvokeError, InvokeResult};
use crate::extract::{
    Cardinality, FieldSpec, ReadAs, RecordSpec, ResultSpec, ScalarType, VAR_ACTION, VAR_MEMBER,
    VAR_RESULT,
};
use crate::fragment::RoleArg;
use anyhow::{Context, Result};
use kbagent_graph::{idtf, EdgeKind, NodeKind, Pattern, Term};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

/// Identifiers of the actions served by the legal knowledge base.
pub mod actions {
    pub const AUTHENTICATION: &str = "action_authentication";
    pub const REGISTRATION: &str = "action_user_registration";
    pub const VERIFICATION: &str = "action_verification";
    pub const USER_REQUEST: &str = "action_user_request";
    pub const DIRECTORY_SEARCH: &str = "action_search";
    pub const ADD_EVENT: &str = "action_add_event";
    pub const DELETE_EVENT: &str = "action_del_event";
    pub const USER_EVENTS: &str = "action_user_events";
    pub const NEXT_QUESTION: &str = "action_choice_next_question";
    pub const QUESTION_ANSWERS: &str = "action_search_answers_for_question";
    pub const SAVE_ANSWER: &str = "action_save_answer";
    pub const CHECK_ANSWER: &str = "action_check_answer";
    pub const DELETE_OLD_NODES: &str = "action_delete_old_nodes";
    pub const UPDATE_RATING: &str = "action_update_rating";
    pub const ADD_TOPIC: &str = "action_add_topic";
    pub const ADD_MESSAGE: &str = "action_add_message";
}

/// Markers referenced by the standard result patterns and arguments.
pub mod markers {
    pub const CONCEPT_CLIENT: &str = "concept_client";
    pub const CONCEPT_SPECIALIST: &str = "concept_specialist";
    pub const CONCEPT_FULL_SEARCH: &str = "CONCEPT_FULL_SEARCH";
    pub const FULL_SEARCH: &str = "FULL_SEARCH";
    pub const LEGAL_ARTICLE: &str = "belarus_legal_article";
    pub const LANG_RU: &str = "lang_ru";
    pub const RREL_KEY_SC_ELEMENT: &str = "rrel_key_sc_element";
    pub const NREL_SC_TEXT_TRANSLATION: &str = "nrel_sc_text_translation";
    pub const RREL_EXAMPLE: &str = "rrel_example";
    pub const RREL_EVENT_DAY: &str = "rrel_event_day";
    pub const RREL_EVENT_MONTH: &str = "rrel_event_month";
    pub const RREL_EVENT_YEAR: &str = "rrel_event_year";
}

const SHORT_TIMEOUT_MS: u64 = 10_000;
const LONG_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// Specs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub index: u32,
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl RoleSpec {
    pub fn required(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            required: true,
        }
    }

    pub fn optional(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub kind: String,
    pub roles: Vec<RoleSpec>,
    pub result: ResultSpec,
    pub timeout_ms: u64,
}

impl ActionSpec {
    pub fn new(kind: impl Into<String>, result: ResultSpec, timeout_ms: u64) -> Self {
        Self {
            kind: kind.into(),
            roles: Vec::new(),
            result,
            timeout_ms,
        }
    }

    pub fn role(mut self, role: RoleSpec) -> Self {
        self.roles.push(role);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check an argument list against the declared roles.
    pub fn check_args(&self, args: &[RoleArg]) -> InvokeResult<()> {
        let mismatch = |reason: String| InvokeError::CatalogMismatch {
            kind: self.kind.clone(),
            reason,
        };

        let given: BTreeSet<u32> = args.iter().map(|a| a.role).collect();
        for arg in args {
            if !self.roles.iter().any(|r| r.index == arg.role) {
                return Err(mismatch(format!("role {} is not declared", arg.role)));
            }
        }
        for role in self.roles.iter().filter(|r| r.required) {
            if !given.contains(&role.index) {
                return Err(mismatch(format!(
                    "required role {} ({}) is missing",
                    role.index, role.name
                )));
            }
        }
        Ok(())
    }

    fn check_declaration(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for role in &self.roles {
            anyhow::ensure!(role.index >= 1, "{}: role indices start at 1", self.kind);
            anyhow::ensure!(
                seen.insert(role.index),
                "{}: role {} declared twice",
                self.kind,
                role.index
            );
        }
        anyhow::ensure!(self.timeout_ms > 0, "{}: timeout must be positive", self.kind);
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionCatalog {
    actions: BTreeMap<String, ActionSpec>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, spec: ActionSpec) -> Option<ActionSpec> {
        self.actions.insert(spec.kind.clone(), spec)
    }

    pub fn with(mut self, spec: ActionSpec) -> Self {
        self.insert(spec);
        self
    }

    pub fn get(&self, kind: &str) -> Option<&ActionSpec> {
        self.actions.get(kind)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    /// Look up `kind` and check `args` against it.
    pub fn validate(&self, kind: &str, args: &[RoleArg]) -> InvokeResult<&ActionSpec> {
        let spec = self
            .get(kind)
            .ok_or_else(|| InvokeError::UnknownAction(kind.to_string()))?;
        spec.check_args(args)?;
        Ok(spec)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let catalog: Self = serde_json::from_str(json).context("failed to parse action catalog")?;
        for (kind, spec) in &catalog.actions {
            anyhow::ensure!(
                kind == &spec.kind,
                "catalog entry '{kind}' declares kind '{}'",
                spec.kind
            );
            spec.check_declaration()?;
        }
        Ok(catalog)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read action catalog {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize action catalog")
    }

    /// The actions of the legal knowledge base, with their deadlines.
    ///
    /// Registration and the test agents get 30 s; everything else 10 s.
    pub fn standard() -> Self {
        use actions::*;

        let user_only = |kind: &str, result: ResultSpec, timeout_ms: u64| {
            ActionSpec::new(kind, result, timeout_ms).role(RoleSpec::required(1, "user"))
        };

        Self::new()
            .with(
                ActionSpec::new(REGISTRATION, ResultSpec::Unit, LONG_TIMEOUT_MS)
                    .role(RoleSpec::required(1, "email"))
                    .role(RoleSpec::required(2, "password"))
                    .role(RoleSpec::required(3, "password_conf"))
                    .role(RoleSpec::required(4, "user_type"))
                    .role(RoleSpec::optional(5, "full_name"))
                    .role(RoleSpec::optional(6, "gender"))
                    .role(RoleSpec::optional(7, "age"))
                    .role(RoleSpec::optional(8, "experience"))
                    .role(RoleSpec::optional(9, "field")),
            )
            .with(
                ActionSpec::new(AUTHENTICATION, ResultSpec::Unit, SHORT_TIMEOUT_MS)
                    .role(RoleSpec::required(1, "user"))
                    .role(RoleSpec::required(2, "password")),
            )
            .with(
                ActionSpec::new(VERIFICATION, ResultSpec::Unit, SHORT_TIMEOUT_MS)
                    .role(RoleSpec::required(1, "email"))
                    .role(RoleSpec::optional(2, "token")),
            )
            .with(
                ActionSpec::new(USER_REQUEST, legal_request_result(), SHORT_TIMEOUT_MS)
                    .role(RoleSpec::required(1, "request")),
            )
            .with(
                ActionSpec::new(DIRECTORY_SEARCH, directory_result(), SHORT_TIMEOUT_MS)
                    .role(RoleSpec::required(1, "search_part"))
                    .role(RoleSpec::required(2, "search_area"))
                    .role(RoleSpec::required(3, "content")),
            )
            .with(
                ActionSpec::new(ADD_EVENT, ResultSpec::Unit, SHORT_TIMEOUT_MS)
                    .role(RoleSpec::required(1, "user"))
                    .role(RoleSpec::required(2, "name"))
                    .role(RoleSpec::required(3, "date"))
                    .role(RoleSpec::required(4, "description")),
            )
            .with(
                ActionSpec::new(DELETE_EVENT, ResultSpec::Unit, SHORT_TIMEOUT_MS)
                    .role(RoleSpec::required(1, "user"))
                    .role(RoleSpec::required(2, "name")),
            )
            .with(user_only(USER_EVENTS, named_nodes_result("event"), SHORT_TIMEOUT_MS))
            .with(user_only(NEXT_QUESTION, named_nodes_result("question"), LONG_TIMEOUT_MS))
            .with(
                ActionSpec::new(QUESTION_ANSWERS, named_nodes_result("answer"), LONG_TIMEOUT_MS)
                    .role(RoleSpec::required(1, "question")),
            )
            .with(
                ActionSpec::new(SAVE_ANSWER, ResultSpec::Unit, LONG_TIMEOUT_MS)
                    .role(RoleSpec::required(1, "answer"))
                    .role(RoleSpec::required(2, "user")),
            )
            .with(
                ActionSpec::new(
                    CHECK_ANSWER,
                    ResultSpec::TypedScalar(ScalarType::Bool),
                    LONG_TIMEOUT_MS,
                )
                .role(RoleSpec::required(1, "question"))
                .role(RoleSpec::required(2, "user")),
            )
            .with(user_only(DELETE_OLD_NODES, ResultSpec::Unit, LONG_TIMEOUT_MS))
            .with(user_only(
                UPDATE_RATING,
                ResultSpec::TypedScalar(ScalarType::Int),
                LONG_TIMEOUT_MS,
            ))
            .with(
                ActionSpec::new(ADD_TOPIC, ResultSpec::Unit, SHORT_TIMEOUT_MS)
                    .role(RoleSpec::required(1, "user"))
                    .role(RoleSpec::required(2, "title"))
                    .role(RoleSpec::required(3, "description")),
            )
            .with(
                ActionSpec::new(ADD_MESSAGE, ResultSpec::Unit, SHORT_TIMEOUT_MS)
                    .role(RoleSpec::required(1, "user"))
                    .role(RoleSpec::required(2, "topic"))
                    .role(RoleSpec::required(3, "text")),
            )
    }
}

// ============================================================================
// Standard result patterns
// ============================================================================

fn main_idtf_of(var: &str, out: &str) -> Pattern {
    Pattern::new().triple_with_relation(
        Term::bound(var),
        EdgeKind::Common,
        Term::var_of(NodeKind::Link, out),
        Term::idtf(idtf::NREL_MAIN_IDTF),
    )
}

/// One record per answer link: the asked term, the answer text and the
/// articles and concepts listed next to it in the result structure.
fn legal_request_result() -> ResultSpec {
    let term = Pattern::new().triple_with_relation(
        Term::bound(VAR_ACTION),
        EdgeKind::Access,
        Term::var_of(NodeKind::Link, "_term"),
        Term::idtf(idtf::role(1)),
    );

    let mut articles = Pattern::new()
        .triple(Term::bound(VAR_RESULT), EdgeKind::Access, Term::var_of(NodeKind::Node, "_article"))
        .triple(Term::idtf(markers::LEGAL_ARTICLE), EdgeKind::Access, Term::bound("_article"));
    articles.triples.extend(main_idtf_of("_article", "_article_name").triples);

    let mut concepts = Pattern::new().triple(
        Term::bound(VAR_RESULT),
        EdgeKind::Access,
        Term::var_of(NodeKind::Class, "_concept"),
    );
    concepts.triples.extend(main_idtf_of("_concept", "_concept_name").triples);

    ResultSpec::RecordList(
        RecordSpec::new(NodeKind::Link)
            .field(FieldSpec::new("term", term, "_term", ReadAs::Content, Cardinality::One))
            .field(FieldSpec::member_content("content"))
            .field(FieldSpec::new(
                "related_articles",
                articles,
                "_article_name",
                ReadAs::Content,
                Cardinality::Many,
            ))
            .field(FieldSpec::new(
                "related_concepts",
                concepts,
                "_concept_name",
                ReadAs::Content,
                Cardinality::Many,
            )),
    )
}

/// One record per found article: its Russian title and example text.
fn directory_result() -> ResultSpec {
    let title = main_idtf_of(VAR_MEMBER, "_title").triple(
        Term::idtf(markers::LANG_RU),
        EdgeKind::Access,
        Term::bound("_title"),
    );

    let content = Pattern::new()
        .triple_with_relation(
            Term::var("_key"),
            EdgeKind::Access,
            Term::bound(VAR_MEMBER),
            Term::idtf(markers::RREL_KEY_SC_ELEMENT),
        )
        .triple_with_relation(
            Term::var("_translation"),
            EdgeKind::Common,
            Term::bound("_key"),
            Term::idtf(markers::NREL_SC_TEXT_TRANSLATION),
        )
        .triple_with_relation(
            Term::bound("_translation"),
            EdgeKind::Access,
            Term::var_of(NodeKind::Link, "_content"),
            Term::idtf(markers::RREL_EXAMPLE),
        )
        .triple(
            Term::idtf(markers::LANG_RU),
            EdgeKind::Access,
            Term::bound("_content"),
        );

    ResultSpec::RecordList(
        RecordSpec::new(NodeKind::Node)
            .field(FieldSpec::new("title", title, "_title", ReadAs::Content, Cardinality::One))
            .field(FieldSpec::new(
                "content",
                content,
                "_content",
                ReadAs::Content,
                Cardinality::One,
            )),
    )
}

/// Member nodes, each with its main identifier when it has one.
fn named_nodes_result(node_field: &str) -> ResultSpec {
    ResultSpec::RecordList(
        RecordSpec::new(NodeKind::Node)
            .field(FieldSpec::member_node(node_field))
            .field(FieldSpec::new(
                "name",
                main_idtf_of(VAR_MEMBER, "_name"),
                "_name",
                ReadAs::Content,
                Cardinality::Optional,
            )),
    )
}
