//! GraphFragmentBuilder: action kind + positional arguments → write plan.
//!
//! ```text
//!   RoleArg { role: 1, Text("alice") }     ┌──────────────────────────┐
//!   RoleArg { role: 2, Node(#42) }    ──►  │ 0. create action node    │
//!                                          │ 1. create link "alice"   │
//!                                          │ 2. action ─rrel_1─► link │
//!                                          │ 3. action ─rrel_2─► #42  │
//!                                          │ 4. kind ──► action       │
//!                                          │ 5. initiated ──► action  │
//!                                          └──────────────────────────┘
//! ```
//!
//! The builder is pure: it produces a symbolic [`ActionFragment`] that names
//! the markers it needs. The fragment is lowered to concrete
//! [`Instruction`]s only once those markers have been resolved.

use crate::error::BuildError;
use crate::keynodes::{MarkerRef, ProtocolIdtfs};
use kbagent_graph::{EdgeKind, Instruction, NodeKind, NodeRef, Operand, SlotId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Slot of the action node in every fragment.
pub const ACTION_SLOT: SlotId = 0;

// ============================================================================
// Arguments
// ============================================================================

/// Value of one positional argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    /// Existing element, passed through unchanged
    Node(NodeRef),
    /// Materialized as a fresh link
    Text(String),
    /// Materialized as a fresh link holding the decimal text
    Int(i64),
    /// Well-known marker node
    Marker(MarkerRef),
    /// Fresh node made a member of the named class
    InstanceOf(String),
    /// Fresh tuple whose members carry named role relations
    Tuple(Vec<(String, ArgValue)>),
}

impl From<NodeRef> for ArgValue {
    fn from(node: NodeRef) -> Self {
        ArgValue::Node(node)
    }
}

impl From<&str> for ArgValue {
    fn from(text: &str) -> Self {
        ArgValue::Text(text.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(text: String) -> Self {
        ArgValue::Text(text)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

/// Argument bound to a positional role (`rrel_<role>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleArg {
    pub role: u32,
    pub value: ArgValue,
}

impl RoleArg {
    pub fn new(role: u32, value: impl Into<ArgValue>) -> Self {
        Self {
            role,
            value: value.into(),
        }
    }

    pub fn node(role: u32, node: NodeRef) -> Self {
        Self::new(role, ArgValue::Node(node))
    }

    pub fn text(role: u32, text: impl Into<String>) -> Self {
        Self::new(role, ArgValue::Text(text.into()))
    }

    pub fn int(role: u32, value: i64) -> Self {
        Self::new(role, ArgValue::Int(value))
    }

    pub fn marker(role: u32, marker: MarkerRef) -> Self {
        Self::new(role, ArgValue::Marker(marker))
    }

    pub fn instance_of(role: u32, class: impl Into<String>) -> Self {
        Self::new(role, ArgValue::InstanceOf(class.into()))
    }

    pub fn tuple<I, S>(role: u32, members: I) -> Self
    where
        I: IntoIterator<Item = (S, ArgValue)>,
        S: Into<String>,
    {
        Self::new(
            role,
            ArgValue::Tuple(members.into_iter().map(|(r, v)| (r.into(), v)).collect()),
        )
    }
}

// ============================================================================
// Fragment
// ============================================================================

/// Endpoint of a planned edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOperand {
    Slot(SlotId),
    Node(NodeRef),
    Marker(MarkerRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOp {
    CreateNode {
        slot: SlotId,
        kind: NodeKind,
    },
    CreateLink {
        slot: SlotId,
        content: String,
    },
    Edge {
        from: FragmentOperand,
        to: FragmentOperand,
        kind: EdgeKind,
        relation: Option<MarkerRef>,
    },
}

/// Ordered write plan for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFragment {
    pub kind: String,
    pub ops: Vec<FragmentOp>,
}

impl ActionFragment {
    /// Every marker the plan refers to, deduplicated.
    pub fn required_markers(&self) -> BTreeSet<MarkerRef> {
        let mut out = BTreeSet::new();
        for op in &self.ops {
            if let FragmentOp::Edge {
                from, to, relation, ..
            } = op
            {
                for operand in [from, to] {
                    if let FragmentOperand::Marker(marker) = operand {
                        out.insert(marker.clone());
                    }
                }
                if let Some(relation) = relation {
                    out.insert(relation.clone());
                }
            }
        }
        out
    }

    /// Concrete instructions, with markers replaced by `resolve`.
    pub fn lower<E>(
        &self,
        mut resolve: impl FnMut(&MarkerRef) -> Result<NodeRef, E>,
    ) -> Result<Vec<Instruction>, E> {
        let mut out = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            out.push(match op {
                FragmentOp::CreateNode { slot, kind } => Instruction::CreateNode {
                    slot: *slot,
                    kind: *kind,
                },
                FragmentOp::CreateLink { slot, content } => Instruction::CreateLink {
                    slot: *slot,
                    content: content.clone(),
                },
                FragmentOp::Edge {
                    from,
                    to,
                    kind,
                    relation,
                } => {
                    let from = lower_operand(from, &mut resolve)?;
                    let to = lower_operand(to, &mut resolve)?;
                    let relation = relation.as_ref().map(&mut resolve).transpose()?;
                    Instruction::CreateEdge {
                        from,
                        to,
                        kind: *kind,
                        relation,
                    }
                }
            });
        }
        Ok(out)
    }

    /// Role relations of the top-level arguments, in plan order.
    pub fn argument_roles(&self) -> Vec<&str> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                FragmentOp::Edge {
                    from: FragmentOperand::Slot(ACTION_SLOT),
                    relation: Some(role),
                    ..
                } => Some(role.idtf.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct GraphFragmentBuilder {
    idtfs: ProtocolIdtfs,
}

impl GraphFragmentBuilder {
    pub fn new(idtfs: ProtocolIdtfs) -> Self {
        Self { idtfs }
    }

    /// Plan the fragment for `kind(args...)`.
    ///
    /// Arguments keep their given order; the kind edge and then the
    /// initiated edge come last so the server never sees a half-written
    /// action.
    pub fn build(&self, kind: &str, args: &[RoleArg]) -> Result<ActionFragment, BuildError> {
        let mut seen = HashSet::new();
        for arg in args {
            if arg.role == 0 {
                return Err(BuildError::ZeroRole);
            }
            if !seen.insert(arg.role) {
                return Err(BuildError::DuplicateRole(arg.role));
            }
            check_value(arg.role, &arg.value)?;
        }

        let mut plan = Plan::default();
        plan.ops.push(FragmentOp::CreateNode {
            slot: ACTION_SLOT,
            kind: NodeKind::Node,
        });
        plan.next_slot = ACTION_SLOT + 1;

        for arg in args {
            let target = plan.materialize(&arg.value);
            plan.ops.push(FragmentOp::Edge {
                from: FragmentOperand::Slot(ACTION_SLOT),
                to: target,
                kind: EdgeKind::Access,
                relation: Some(MarkerRef::role(self.idtfs.role(arg.role))),
            });
        }

        plan.ops.push(FragmentOp::Edge {
            from: FragmentOperand::Marker(MarkerRef::class(kind)),
            to: FragmentOperand::Slot(ACTION_SLOT),
            kind: EdgeKind::Access,
            relation: None,
        });
        plan.ops.push(FragmentOp::Edge {
            from: FragmentOperand::Marker(MarkerRef::class(&self.idtfs.initiated)),
            to: FragmentOperand::Slot(ACTION_SLOT),
            kind: EdgeKind::Access,
            relation: None,
        });

        Ok(ActionFragment {
            kind: kind.to_string(),
            ops: plan.ops,
        })
    }
}

fn lower_operand<E>(
    operand: &FragmentOperand,
    resolve: &mut impl FnMut(&MarkerRef) -> Result<NodeRef, E>,
) -> Result<Operand, E> {
    Ok(match operand {
        FragmentOperand::Slot(slot) => Operand::Slot(*slot),
        FragmentOperand::Node(node) => Operand::Node(*node),
        FragmentOperand::Marker(marker) => Operand::Node(resolve(marker)?),
    })
}

fn check_value(role: u32, value: &ArgValue) -> Result<(), BuildError> {
    let ArgValue::Tuple(members) = value else {
        return Ok(());
    };
    if members.is_empty() {
        return Err(BuildError::EmptyTuple(role));
    }
    let mut seen = HashSet::new();
    for (member_role, member) in members {
        if !seen.insert(member_role.as_str()) {
            return Err(BuildError::DuplicateTupleRole(member_role.clone()));
        }
        check_value(role, member)?;
    }
    Ok(())
}

#[derive(Default)]
struct Plan {
    ops: Vec<FragmentOp>,
    next_slot: SlotId,
}

impl Plan {
    fn fresh(&mut self) -> SlotId {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn materialize(&mut self, value: &ArgValue) -> FragmentOperand {
        match value {
            ArgValue::Node(node) => FragmentOperand::Node(*node),
            ArgValue::Marker(marker) => FragmentOperand::Marker(marker.clone()),
            ArgValue::Text(text) => self.link(text.clone()),
            ArgValue::Int(value) => self.link(value.to_string()),
            ArgValue::InstanceOf(class) => {
                let slot = self.fresh();
                self.ops.push(FragmentOp::CreateNode {
                    slot,
                    kind: NodeKind::Node,
                });
                self.ops.push(FragmentOp::Edge {
                    from: FragmentOperand::Marker(MarkerRef::class(class)),
                    to: FragmentOperand::Slot(slot),
                    kind: EdgeKind::Access,
                    relation: None,
                });
                FragmentOperand::Slot(slot)
            }
            ArgValue::Tuple(members) => {
                let slot = self.fresh();
                self.ops.push(FragmentOp::CreateNode {
                    slot,
                    kind: NodeKind::Tuple,
                });
                for (role, member) in members {
                    let target = self.materialize(member);
                    self.ops.push(FragmentOp::Edge {
                        from: FragmentOperand::Slot(slot),
                        to: target,
                        kind: EdgeKind::Access,
                        relation: Some(MarkerRef::role(role)),
                    });
                }
                FragmentOperand::Slot(slot)
            }
        }
    }

    fn link(&mut self, content: String) -> FragmentOperand {
        let slot = self.fresh();
        self.ops.push(FragmentOp::CreateLink { slot, content });
        FragmentOperand::Slot(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> GraphFragmentBuilder {
        GraphFragmentBuilder::new(ProtocolIdtfs::default())
    }

    #[test]
    fn test_instruction_order() {
        let user = NodeRef::new(42);
        let fragment = builder()
            .build(
                "action_authentication",
                &[RoleArg::text(1, "alice"), RoleArg::node(2, user)],
            )
            .unwrap();

        assert_eq!(
            fragment.ops[0],
            FragmentOp::CreateNode {
                slot: ACTION_SLOT,
                kind: NodeKind::Node
            }
        );
        assert_eq!(
            fragment.ops[1],
            FragmentOp::CreateLink {
                slot: 1,
                content: "alice".to_string()
            }
        );
        assert_eq!(fragment.argument_roles(), vec!["rrel_1", "rrel_2"]);

        let n = fragment.ops.len();
        assert_eq!(
            fragment.ops[n - 2],
            FragmentOp::Edge {
                from: FragmentOperand::Marker(MarkerRef::class("action_authentication")),
                to: FragmentOperand::Slot(ACTION_SLOT),
                kind: EdgeKind::Access,
                relation: None,
            }
        );
        assert_eq!(
            fragment.ops[n - 1],
            FragmentOp::Edge {
                from: FragmentOperand::Marker(MarkerRef::class("action_initiated")),
                to: FragmentOperand::Slot(ACTION_SLOT),
                kind: EdgeKind::Access,
                relation: None,
            }
        );
    }

    #[test]
    fn test_node_arguments_pass_through() {
        let user = NodeRef::new(7);
        let fragment = builder().build("action_user_events", &[RoleArg::node(1, user)]).unwrap();

        let links = fragment
            .ops
            .iter()
            .filter(|op| matches!(op, FragmentOp::CreateLink { .. }))
            .count();
        assert_eq!(links, 0);
        assert!(fragment.ops.contains(&FragmentOp::Edge {
            from: FragmentOperand::Slot(ACTION_SLOT),
            to: FragmentOperand::Node(user),
            kind: EdgeKind::Access,
            relation: Some(MarkerRef::role("rrel_1")),
        }));
    }

    #[test]
    fn test_role_collision_rejected() {
        let err = builder()
            .build("action_x", &[RoleArg::text(1, "a"), RoleArg::text(1, "b")])
            .unwrap_err();
        assert_eq!(err, BuildError::DuplicateRole(1));

        let err = builder().build("action_x", &[RoleArg::text(0, "a")]).unwrap_err();
        assert_eq!(err, BuildError::ZeroRole);
    }

    #[test]
    fn test_tuple_validation() {
        let err = builder()
            .build("action_x", &[RoleArg::tuple(3, Vec::<(String, ArgValue)>::new())])
            .unwrap_err();
        assert_eq!(err, BuildError::EmptyTuple(3));

        let err = builder()
            .build(
                "action_x",
                &[RoleArg::tuple(
                    3,
                    [("rrel_event_day", ArgValue::Int(1)), ("rrel_event_day", ArgValue::Int(2))],
                )],
            )
            .unwrap_err();
        assert_eq!(err, BuildError::DuplicateTupleRole("rrel_event_day".to_string()));
    }

    #[test]
    fn test_required_markers() {
        let fragment = builder()
            .build(
                "action_user_registration",
                &[
                    RoleArg::text(1, "a@b.c"),
                    RoleArg::instance_of(4, "concept_client"),
                    RoleArg::tuple(5, [("rrel_event_day", ArgValue::Int(3))]),
                ],
            )
            .unwrap();

        let markers = fragment.required_markers();
        for expected in [
            MarkerRef::class("action_user_registration"),
            MarkerRef::class("action_initiated"),
            MarkerRef::class("concept_client"),
            MarkerRef::role("rrel_1"),
            MarkerRef::role("rrel_4"),
            MarkerRef::role("rrel_5"),
            MarkerRef::role("rrel_event_day"),
        ] {
            assert!(markers.contains(&expected), "missing {expected:?}");
        }
        assert_eq!(markers.len(), 7);
    }

    #[test]
    fn test_lower_replaces_markers() {
        let fragment = builder().build("action_x", &[RoleArg::int(1, 5)]).unwrap();
        let instructions = fragment
            .lower(|marker| -> Result<NodeRef, ()> {
                Ok(match marker.idtf.as_str() {
                    "rrel_1" => NodeRef::new(100),
                    "action_x" => NodeRef::new(200),
                    _ => NodeRef::new(300),
                })
            })
            .unwrap();

        assert_eq!(
            instructions[1],
            Instruction::CreateLink {
                slot: 1,
                content: "5".to_string()
            }
        );
        assert_eq!(
            instructions[2],
            Instruction::CreateEdge {
                from: Operand::Slot(ACTION_SLOT),
                to: Operand::Slot(1),
                kind: EdgeKind::Access,
                relation: Some(NodeRef::new(100)),
            }
        );
        assert_eq!(
            instructions[3],
            Instruction::CreateEdge {
                from: Operand::Node(NodeRef::new(200)),
                to: Operand::Slot(ACTION_SLOT),
                kind: EdgeKind::Access,
                relation: None,
            }
        );
    }

    #[test]
    fn test_lower_propagates_resolution_failure() {
        let fragment = builder().build("action_x", &[]).unwrap();
        let err = fragment
            .lower(|marker| Err::<NodeRef, _>(marker.idtf.clone()))
            .unwrap_err();
        assert_eq!(err, "action_x");
    }
}
