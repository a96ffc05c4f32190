//! Typed call sites for the legal knowledge base agents.
//!
//! Each method maps its arguments onto the catalogued roles, runs
//! [`AgentInvoker::call`] and turns the payload into a domain value.
//! Identity lookups (login → user node) happen before these are called.

use crate::catalog::{actions, markers};
use crate::error::InvokeResult;
use crate::extract::{MalformedResult, Payload, Record};
use crate::fragment::{ArgValue, RoleArg};
use crate::invoker::{AgentInvoker, Invocation};
use crate::keynodes::MarkerRef;
use chrono::{Datelike, NaiveDate};
use kbagent_graph::NodeRef;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of a typed call.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceReply<T> {
    Done(T),
    /// The agent finished unsuccessfully (bad credentials, unknown event, ...)
    Rejected,
    /// The agent reported an internal error
    ServerError,
    TimedOut,
    Malformed(MalformedResult),
}

impl<T> ServiceReply<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, ServiceReply::Done(_))
    }

    pub fn done(self) -> Option<T> {
        match self {
            ServiceReply::Done(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ServiceReply<U> {
        self.and_then(|value| ServiceReply::Done(f(value)))
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> ServiceReply<U>) -> ServiceReply<U> {
        match self {
            ServiceReply::Done(value) => f(value),
            ServiceReply::Rejected => ServiceReply::Rejected,
            ServiceReply::ServerError => ServiceReply::ServerError,
            ServiceReply::TimedOut => ServiceReply::TimedOut,
            ServiceReply::Malformed(m) => ServiceReply::Malformed(m),
        }
    }
}

// ============================================================================
// Domain values
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Client,
    Specialist,
}

impl UserType {
    fn class(self) -> &'static str {
        match self {
            UserType::Client => markers::CONCEPT_CLIENT,
            UserType::Specialist => markers::CONCEPT_SPECIALIST,
        }
    }
}

/// Optional specialist profile sent with a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub full_name: String,
    pub gender: String,
    pub age: u32,
    pub experience: u32,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub password_conf: String,
    pub user_type: UserType,
    #[serde(default)]
    pub profile: Option<Profile>,
}

/// One answer to a legal question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegalAnswer {
    pub term: String,
    pub content: String,
    pub related_articles: Vec<String>,
    pub related_concepts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub title: String,
    pub content: String,
}

/// A node from a result list, with its main identifier if it has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedNode {
    pub node: NodeRef,
    pub name: Option<String>,
}

// ============================================================================
// Services
// ============================================================================

#[derive(Clone)]
pub struct AgentServices {
    invoker: Arc<AgentInvoker>,
}

impl AgentServices {
    pub fn new(invoker: Arc<AgentInvoker>) -> Self {
        Self { invoker }
    }

    pub fn invoker(&self) -> &AgentInvoker {
        &self.invoker
    }

    pub fn authenticate(&self, email: &str, password: &str) -> InvokeResult<ServiceReply<()>> {
        self.unit(
            actions::AUTHENTICATION,
            &[RoleArg::text(1, email), RoleArg::text(2, password)],
        )
    }

    pub fn register(&self, registration: &Registration) -> InvokeResult<ServiceReply<()>> {
        let mut args = vec![
            RoleArg::text(1, registration.email.as_str()),
            RoleArg::text(2, registration.password.as_str()),
            RoleArg::text(3, registration.password_conf.as_str()),
            RoleArg::instance_of(4, registration.user_type.class()),
        ];
        if let Some(profile) = &registration.profile {
            args.extend([
                RoleArg::text(5, profile.full_name.as_str()),
                RoleArg::text(6, profile.gender.as_str()),
                RoleArg::int(7, i64::from(profile.age)),
                RoleArg::int(8, i64::from(profile.experience)),
                RoleArg::text(9, profile.field.as_str()),
            ]);
        }
        self.unit(actions::REGISTRATION, &args)
    }

    /// Ask the server to mail a verification token.
    pub fn send_verification(&self, email: &str) -> InvokeResult<ServiceReply<()>> {
        self.unit(actions::VERIFICATION, &[RoleArg::text(1, email)])
    }

    pub fn verify_email(&self, email: &str, token: &str) -> InvokeResult<ServiceReply<()>> {
        self.unit(
            actions::VERIFICATION,
            &[RoleArg::text(1, email), RoleArg::text(2, token)],
        )
    }

    pub fn legal_request(&self, request: &str) -> InvokeResult<ServiceReply<Vec<LegalAnswer>>> {
        self.records(actions::USER_REQUEST, &[RoleArg::text(1, request)], |record| {
            Some(LegalAnswer {
                term: record.text("term")?.to_string(),
                content: record.text("content")?.to_string(),
                related_articles: record.texts("related_articles"),
                related_concepts: record.texts("related_concepts"),
            })
        })
    }

    pub fn directory_search(&self, content: &str) -> InvokeResult<ServiceReply<Vec<DirectoryEntry>>> {
        let args = [
            RoleArg::marker(1, MarkerRef::class(markers::CONCEPT_FULL_SEARCH)),
            RoleArg::marker(2, MarkerRef::class(markers::FULL_SEARCH)),
            RoleArg::text(3, content),
        ];
        self.records(actions::DIRECTORY_SEARCH, &args, |record| {
            Some(DirectoryEntry {
                title: record.text("title")?.to_string(),
                content: record.text("content")?.to_string(),
            })
        })
    }

    pub fn add_event(
        &self,
        user: NodeRef,
        name: &str,
        date: NaiveDate,
        description: &str,
    ) -> InvokeResult<ServiceReply<()>> {
        let date = RoleArg::tuple(
            3,
            [
                (markers::RREL_EVENT_DAY, ArgValue::Int(i64::from(date.day()))),
                (markers::RREL_EVENT_MONTH, ArgValue::Int(i64::from(date.month()))),
                (markers::RREL_EVENT_YEAR, ArgValue::Int(i64::from(date.year()))),
            ],
        );
        self.unit(
            actions::ADD_EVENT,
            &[
                RoleArg::node(1, user),
                RoleArg::text(2, name),
                date,
                RoleArg::text(4, description),
            ],
        )
    }

    pub fn delete_event(&self, user: NodeRef, name: &str) -> InvokeResult<ServiceReply<()>> {
        self.unit(
            actions::DELETE_EVENT,
            &[RoleArg::node(1, user), RoleArg::text(2, name)],
        )
    }

    pub fn user_events(&self, user: NodeRef) -> InvokeResult<ServiceReply<Vec<NamedNode>>> {
        self.named_nodes(actions::USER_EVENTS, "event", RoleArg::node(1, user))
    }

    /// Next unanswered question; `Done(None)` when none remain.
    pub fn next_question(&self, user: NodeRef) -> InvokeResult<ServiceReply<Option<NamedNode>>> {
        Ok(self
            .named_nodes(actions::NEXT_QUESTION, "question", RoleArg::node(1, user))?
            .map(|questions| questions.into_iter().next()))
    }

    pub fn question_answers(&self, question: NodeRef) -> InvokeResult<ServiceReply<Vec<NamedNode>>> {
        self.named_nodes(actions::QUESTION_ANSWERS, "answer", RoleArg::node(1, question))
    }

    pub fn save_answer(&self, user: NodeRef, answer: NodeRef) -> InvokeResult<ServiceReply<()>> {
        self.unit(
            actions::SAVE_ANSWER,
            &[RoleArg::node(1, answer), RoleArg::node(2, user)],
        )
    }

    pub fn check_answer(&self, user: NodeRef, question: NodeRef) -> InvokeResult<ServiceReply<bool>> {
        self.scalar(
            actions::CHECK_ANSWER,
            &[RoleArg::node(1, question), RoleArg::node(2, user)],
            Payload::as_bool,
        )
    }

    pub fn delete_old_nodes(&self, user: NodeRef) -> InvokeResult<ServiceReply<()>> {
        self.unit(actions::DELETE_OLD_NODES, &[RoleArg::node(1, user)])
    }

    pub fn update_rating(&self, user: NodeRef) -> InvokeResult<ServiceReply<i64>> {
        self.scalar(actions::UPDATE_RATING, &[RoleArg::node(1, user)], Payload::as_int)
    }

    pub fn add_topic(&self, user: NodeRef, title: &str, description: &str) -> InvokeResult<ServiceReply<()>> {
        self.unit(
            actions::ADD_TOPIC,
            &[
                RoleArg::node(1, user),
                RoleArg::text(2, title),
                RoleArg::text(3, description),
            ],
        )
    }

    pub fn add_message(&self, user: NodeRef, topic: NodeRef, text: &str) -> InvokeResult<ServiceReply<()>> {
        self.unit(
            actions::ADD_MESSAGE,
            &[
                RoleArg::node(1, user),
                RoleArg::node(2, topic),
                RoleArg::text(3, text),
            ],
        )
    }

    // ------------------------------------------------------------------------
    // Shapes
    // ------------------------------------------------------------------------

    fn call(&self, kind: &str, args: &[RoleArg]) -> InvokeResult<ServiceReply<Payload>> {
        Ok(match self.invoker.call(kind, args)? {
            Invocation::Ok(payload) => ServiceReply::Done(payload),
            Invocation::Failed => ServiceReply::Rejected,
            Invocation::Errored => ServiceReply::ServerError,
            Invocation::TimedOut(_) => ServiceReply::TimedOut,
            Invocation::Malformed(malformed) => ServiceReply::Malformed(malformed),
        })
    }

    fn unit(&self, kind: &str, args: &[RoleArg]) -> InvokeResult<ServiceReply<()>> {
        Ok(self.call(kind, args)?.map(|_| ()))
    }

    fn scalar<T>(
        &self,
        kind: &str,
        args: &[RoleArg],
        convert: impl FnOnce(&Payload) -> Option<T>,
    ) -> InvokeResult<ServiceReply<T>> {
        Ok(self.call(kind, args)?.and_then(|payload| match convert(&payload) {
            Some(value) => ServiceReply::Done(value),
            None => ServiceReply::Malformed(shape_mismatch(kind, &payload)),
        }))
    }

    fn records<T>(
        &self,
        kind: &str,
        args: &[RoleArg],
        convert: impl Fn(&Record) -> Option<T>,
    ) -> InvokeResult<ServiceReply<Vec<T>>> {
        Ok(self.call(kind, args)?.and_then(|payload| match payload {
            Payload::Records(records) => match records.iter().map(&convert).collect::<Option<Vec<T>>>() {
                Some(values) => ServiceReply::Done(values),
                None => ServiceReply::Malformed(MalformedResult::new(format!(
                    "{kind}: record is missing a field"
                ))),
            },
            other => ServiceReply::Malformed(shape_mismatch(kind, &other)),
        }))
    }

    fn named_nodes(
        &self,
        kind: &str,
        node_field: &'static str,
        arg: RoleArg,
    ) -> InvokeResult<ServiceReply<Vec<NamedNode>>> {
        self.records(kind, &[arg], |record| {
            Some(NamedNode {
                node: record.node(node_field)?,
                name: record.text("name").map(str::to_string),
            })
        })
    }
}

fn shape_mismatch(kind: &str, payload: &Payload) -> MalformedResult {
    MalformedResult::new(format!("{kind}: unexpected payload {payload:?}"))
}
