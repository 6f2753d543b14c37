use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use donorflow_core::types::{Channel, ContactId};

/// Identifier of a node within one journey graph.
pub type NodeId = String;

/// Longest delay a node or edge may carry (ten years).
pub const MAX_DELAY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Out-of-range delays are clamped; `validate` rejects them before activation.
fn bounded_delay(delay_secs: u64) -> Duration {
    Duration::seconds(delay_secs.min(MAX_DELAY_SECS) as i64)
}

/// A journey definition describing a multi-step communication sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyDefinition {
    pub id: Uuid,
    pub name: String,
    pub organization_id: String,
    pub status: JourneyStatus,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every structural edit.
    pub version: u32,
}

/// Lifecycle status of a journey definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    Draft,
    Active,
    Inactive,
}

impl JourneyStatus {
    /// Structural edits are only allowed while the journey is not live.
    pub fn is_editable(&self) -> bool {
        !matches!(self, JourneyStatus::Active)
    }
}

/// A single step within a journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Canvas placement from the editor. Never read by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<serde_json::Value>,
}

/// The kind of work a node performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NodeKind {
    Entry,
    Message(MessageNode),
    Condition(ConditionNode),
    JourneyRef(JourneyRefNode),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Entry => "entry",
            NodeKind::Message(_) => "message",
            NodeKind::Condition(_) => "condition",
            NodeKind::JourneyRef(_) => "journey_ref",
        }
    }
}

/// Configuration for a message dispatch node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageNode {
    pub channel: Channel,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    /// Wait after a successful dispatch before following the outgoing edge.
    #[serde(default)]
    pub delay_secs: u64,
}

impl MessageNode {
    pub fn delay(&self) -> Duration {
        bounded_delay(self.delay_secs)
    }
}

/// Configuration for a branching node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionNode {
    pub predicate: ConditionPredicate,
}

/// Predicates a condition node can test against donation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ConditionPredicate {
    HasDonated,
    DonationAmountGt {
        value: f64,
        #[serde(default)]
        basis: AmountBasis,
    },
    DaysSinceLastDonationGt {
        value: i64,
    },
}

/// Which donation amount a `donation_amount_gt` predicate compares against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountBasis {
    #[default]
    Total,
    Max,
}

/// Hands the contact over to another journey; terminal for the current run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyRefNode {
    pub target_journey_id: Uuid,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub delay_secs: u64,
    /// Set only on edges leaving a condition node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
}

impl Edge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            delay_secs: 0,
            branch: None,
        }
    }

    pub fn branch(source: impl Into<NodeId>, target: impl Into<NodeId>, branch: Branch) -> Self {
        Self {
            branch: Some(branch),
            ..Self::new(source, target)
        }
    }

    pub fn with_delay_secs(mut self, delay_secs: u64) -> Self {
        self.delay_secs = delay_secs;
        self
    }

    pub fn delay(&self) -> Duration {
        bounded_delay(self.delay_secs)
    }
}

/// Branch label on a condition node's outgoing edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Branch {
    #[serde(rename = "true")]
    True,
    #[serde(rename = "false")]
    False,
}

impl From<bool> for Branch {
    fn from(value: bool) -> Self {
        if value {
            Branch::True
        } else {
            Branch::False
        }
    }
}

impl JourneyDefinition {
    /// Builds a draft journey from its graph.
    pub fn new(
        name: impl Into<String>,
        organization_id: impl Into<String>,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            organization_id: organization_id.into(),
            status: JourneyStatus::Draft,
            nodes,
            edges,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn entry_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Entry))
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    /// The single "next" edge of an entry or message node.
    pub fn next_edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.source == id)
    }

    /// The edge a condition node follows for the given result.
    pub fn branch_edge(&self, id: &str, result: bool) -> Option<&Edge> {
        let wanted = Branch::from(result);
        self.edges
            .iter()
            .find(|e| e.source == id && e.branch == Some(wanted))
    }
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            position: None,
        }
    }

    pub fn entry(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Entry)
    }

    pub fn message(id: impl Into<NodeId>, channel: Channel, body: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Message(MessageNode {
                channel,
                subject: None,
                body: body.into(),
                delay_secs: 0,
            }),
        )
    }

    pub fn condition(id: impl Into<NodeId>, predicate: ConditionPredicate) -> Self {
        Self::new(id, NodeKind::Condition(ConditionNode { predicate }))
    }

    pub fn journey_ref(id: impl Into<NodeId>, target_journey_id: Uuid) -> Self {
        Self::new(id, NodeKind::JourneyRef(JourneyRefNode { target_journey_id }))
    }

    /// Sets the post-dispatch delay. No effect on non-message nodes.
    pub fn with_delay_secs(mut self, delay_secs: u64) -> Self {
        if let NodeKind::Message(ref mut msg) = self.kind {
            msg.delay_secs = delay_secs;
        }
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        if let NodeKind::Message(ref mut msg) = self.kind {
            msg.subject = Some(subject.into());
        }
        self
    }

    /// Delay contributed by the node itself once it has executed.
    pub fn own_delay(&self) -> Duration {
        match &self.kind {
            NodeKind::Message(msg) => msg.delay(),
            _ => Duration::zero(),
        }
    }
}

// ─── Runs ───────────────────────────────────────────────────────────────

/// One contact's execution state against one journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub journey_id: Uuid,
    pub contact_id: ContactId,
    pub current_node_id: NodeId,
    pub status: RunStatus,
    /// When the run is next due. `None` once terminal.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Failed dispatch attempts on the current node.
    pub attempt_count: u32,
    /// Compare-and-swap token; bumped on every claim and commit.
    pub version: u64,
    pub history: Vec<HistoryEntry>,
    /// Set when a cancellation arrives while a worker holds the claim.
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub entered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Runtime status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    WaitingDelay,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed
        )
    }

    /// Statuses the scheduler may claim once `scheduled_at` has passed.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, RunStatus::Active | RunStatus::WaitingDelay)
    }
}

/// Append-only record of one node execution or terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub node_id: NodeId,
    pub entered_at: DateTime<Utc>,
    pub outcome: Outcome,
}

/// What happened when a node was executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Outcome {
    Entered,
    Sent {
        channel: Channel,
    },
    Branched {
        result: bool,
    },
    DispatchError {
        attempt: u32,
        reason: String,
    },
    Chained {
        target_journey_id: Uuid,
        enrolled_run_id: Option<Uuid>,
        skipped: Option<SkipReason>,
    },
    Completed,
    Failed {
        reason: String,
    },
    Cancelled,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::DispatchError { .. } | Outcome::Failed { .. })
    }

    /// Outcomes that already describe the run's end state.
    pub fn is_terminal_marker(&self) -> bool {
        matches!(
            self,
            Outcome::Completed | Outcome::Failed { .. } | Outcome::Cancelled
        )
    }
}

impl Run {
    /// A fresh run parked at the entry node and immediately due.
    pub fn new(
        journey_id: Uuid,
        contact_id: impl Into<ContactId>,
        entry_node_id: impl Into<NodeId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            journey_id,
            contact_id: contact_id.into(),
            current_node_id: entry_node_id.into(),
            status: RunStatus::Active,
            scheduled_at: Some(now),
            attempt_count: 0,
            version: 0,
            history: Vec::new(),
            cancel_requested: false,
            claimed_at: None,
            entered_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_schedulable() && self.scheduled_at.map_or(false, |at| at <= now)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id,
            journey_id: self.journey_id,
            contact_id: self.contact_id.clone(),
            status: self.status,
            current_node_id: self.current_node_id.clone(),
            scheduled_at: self.scheduled_at,
            attempt_count: self.attempt_count,
            entered_at: self.entered_at,
            updated_at: self.updated_at,
            history_len: self.history.len(),
        }
    }
}

/// Read model for the "enrolled contacts" view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub journey_id: Uuid,
    pub contact_id: ContactId,
    pub status: RunStatus,
    pub current_node_id: NodeId,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub entered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history_len: usize,
}

// ─── Enrollment ─────────────────────────────────────────────────────────

/// Result of enrolling a batch of contacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollmentReport {
    pub created: Vec<Uuid>,
    pub skipped: Vec<SkippedEnrollment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedEnrollment {
    pub contact_id: ContactId,
    pub reason: SkipReason,
}

/// Why a contact was not enrolled. None of these abort the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    JourneyNotFound,
    JourneyNotActive,
    AlreadyEnrolled { run_id: Uuid },
    ContactNotFound,
    DuplicateInBatch,
    ContactLookupFailed { message: String },
}

/// Run counts for one journey.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JourneyStats {
    pub journey_id: Uuid,
    pub total_enrolled: u64,
    pub active: u64,
    pub waiting: u64,
    pub processing: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branching() -> JourneyDefinition {
        JourneyDefinition::new(
            "Branching",
            "org-1",
            vec![
                Node::entry("entry"),
                Node::condition("check", ConditionPredicate::HasDonated),
                Node::message("yes", Channel::Email, "Thanks"),
                Node::message("no", Channel::Email, "Please give"),
            ],
            vec![
                Edge::new("entry", "check"),
                Edge::branch("check", "no", Branch::False),
                Edge::branch("check", "yes", Branch::True),
            ],
        )
    }

    #[test]
    fn test_edges_outlive_the_lookup_key() {
        let journey = branching();
        let edge = {
            let key = String::from("check");
            journey.branch_edge(&key, true)
        };
        assert_eq!(edge.map(|e| e.target.as_str()), Some("yes"));

        let next = {
            let key = "entry".to_string();
            journey.next_edge(&key)
        };
        assert_eq!(next.map(|e| e.target.as_str()), Some("check"));

        assert_eq!(
            journey.branch_edge("check", false).map(|e| e.target.as_str()),
            Some("no")
        );
        assert!(journey.next_edge("yes").is_none());
    }

    #[test]
    fn test_delays_never_go_negative() {
        let node = Node::message("m", Channel::Sms, "Hi").with_delay_secs(u64::MAX);
        assert_eq!(node.own_delay(), Duration::seconds(MAX_DELAY_SECS as i64));

        let edge = Edge::new("a", "b").with_delay_secs(1 << 63);
        assert!(edge.delay() > Duration::zero());
        assert_eq!(Edge::new("a", "b").with_delay_secs(90).delay(), Duration::seconds(90));
    }
}
