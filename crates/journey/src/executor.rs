use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, info, warn};

use donorflow_core::config::JourneyConfig;

use crate::collaborators::{ChannelSender, ContactDirectory, DonationRepository};
use crate::enrollment::EnrollmentService;
use crate::error::JourneyResult;
use crate::evaluator::ConditionEvaluator;
use crate::template::render;
use crate::types::{
    Edge, HistoryEntry, JourneyDefinition, MessageNode, Node, NodeId, NodeKind, Outcome, Run,
    RunStatus,
};

/// What executing one node decided about the run.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    pub outcome: Outcome,
    pub next_node_id: Option<NodeId>,
    pub next_delay: Duration,
    pub terminal: bool,
}

impl NodeResult {
    /// Follow `edge` (if any) after `own_delay`; no edge ends the run.
    fn follow(outcome: Outcome, edge: Option<&Edge>, own_delay: Duration) -> Self {
        match edge {
            Some(edge) => Self {
                outcome,
                next_node_id: Some(edge.target.clone()),
                next_delay: own_delay + edge.delay(),
                terminal: false,
            },
            None => Self::end(outcome),
        }
    }

    fn end(outcome: Outcome) -> Self {
        Self {
            outcome,
            next_node_id: None,
            next_delay: Duration::zero(),
            terminal: true,
        }
    }

    /// Terminal failure, used when a node cannot be executed at all.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::end(Outcome::Failed {
            reason: reason.into(),
        })
    }

    /// The run status a terminal result lands in.
    pub fn terminal_status(&self) -> Option<RunStatus> {
        if !self.terminal {
            return None;
        }
        Some(if self.outcome.is_failure() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        })
    }

    /// Applies this result to a claimed run: appends history, moves the
    /// node pointer and sets the next status and due time.
    pub fn apply_to(&self, run: &mut Run, now: DateTime<Utc>) {
        run.history.push(HistoryEntry {
            node_id: run.current_node_id.clone(),
            entered_at: now,
            outcome: self.outcome.clone(),
        });

        run.attempt_count = match &self.outcome {
            Outcome::DispatchError { attempt, .. } => *attempt,
            _ => 0,
        };

        if let Some(status) = self.terminal_status() {
            run.status = status;
            run.scheduled_at = None;
            if !self.outcome.is_terminal_marker() {
                let marker = match &self.outcome {
                    Outcome::DispatchError { attempt, reason } => Outcome::Failed {
                        reason: format!("dispatch failed after {attempt} attempt(s): {reason}"),
                    },
                    _ => Outcome::Completed,
                };
                run.history.push(HistoryEntry {
                    node_id: run.current_node_id.clone(),
                    entered_at: now,
                    outcome: marker,
                });
            }
        } else {
            match now.checked_add_signed(self.next_delay) {
                Some(due_at) => {
                    if let Some(next) = &self.next_node_id {
                        run.current_node_id = next.clone();
                    }
                    run.status = if self.next_delay > Duration::zero() {
                        RunStatus::WaitingDelay
                    } else {
                        RunStatus::Active
                    };
                    run.scheduled_at = Some(due_at);
                }
                None => {
                    warn!(
                        run_id = %run.id,
                        node_id = %run.current_node_id,
                        delay_secs = self.next_delay.num_seconds(),
                        "Next step falls outside the representable time range"
                    );
                    run.status = RunStatus::Failed;
                    run.scheduled_at = None;
                    run.history.push(HistoryEntry {
                        node_id: run.current_node_id.clone(),
                        entered_at: now,
                        outcome: Outcome::Failed {
                            reason: format!(
                                "delay of {}s overflows the schedule",
                                self.next_delay.num_seconds()
                            ),
                        },
                    });
                }
            }
        }
        run.updated_at = now;
    }
}

/// Bounded retry for failed dispatches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    config: JourneyConfig,
}

impl RetryPolicy {
    pub fn from_config(config: &JourneyConfig) -> Self {
        Self {
            max_attempts: config.max_dispatch_attempts.max(1),
            config: config.clone(),
        }
    }

    /// Wait before retrying after the given failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff(attempt);
        let ratio = self.config.retry_jitter_ratio;
        if ratio <= 0.0 || base.is_zero() {
            return base;
        }
        let max_jitter_ms = (base.num_milliseconds() as f64 * ratio) as i64;
        if max_jitter_ms <= 0 {
            return base;
        }
        let jitter = Duration::milliseconds(rand::thread_rng().gen_range(0..=max_jitter_ms));
        base.checked_add(&jitter).unwrap_or(base)
    }
}

/// Performs one node's effect and decides where the run goes next.
pub struct NodeExecutor {
    channel_sender: Arc<dyn ChannelSender>,
    donations: Arc<dyn DonationRepository>,
    contacts: Arc<dyn ContactDirectory>,
    enrollment: EnrollmentService,
    evaluator: ConditionEvaluator,
    retry: RetryPolicy,
}

impl NodeExecutor {
    pub fn new(
        channel_sender: Arc<dyn ChannelSender>,
        donations: Arc<dyn DonationRepository>,
        contacts: Arc<dyn ContactDirectory>,
        enrollment: EnrollmentService,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            channel_sender,
            donations,
            contacts,
            enrollment,
            evaluator: ConditionEvaluator::new(),
            retry,
        }
    }

    pub async fn execute(
        &self,
        run: &Run,
        journey: &JourneyDefinition,
        node: &Node,
        now: DateTime<Utc>,
    ) -> JourneyResult<NodeResult> {
        debug!(
            run_id = %run.id,
            node_id = %node.id,
            kind = node.kind.label(),
            "Executing node"
        );

        match &node.kind {
            NodeKind::Entry => Ok(NodeResult::follow(
                Outcome::Entered,
                journey.next_edge(&node.id),
                Duration::zero(),
            )),
            NodeKind::Message(message) => self.execute_message(run, journey, node, message).await,
            NodeKind::Condition(condition) => {
                let aggregates = self.donations.donation_aggregates(&run.contact_id).await?;
                let result = self.evaluator.evaluate(&condition.predicate, &aggregates, now);
                Ok(NodeResult::follow(
                    Outcome::Branched { result },
                    journey.branch_edge(&node.id, result),
                    Duration::zero(),
                ))
            }
            NodeKind::JourneyRef(reference) => {
                let target = reference.target_journey_id;
                let report = self
                    .enrollment
                    .enroll_at(target, std::slice::from_ref(&run.contact_id), now)
                    .await;
                let enrolled_run_id = report.created.first().copied();
                let skipped = report.skipped.into_iter().next().map(|s| s.reason);
                info!(
                    run_id = %run.id,
                    target_journey_id = %target,
                    enrolled = enrolled_run_id.is_some(),
                    "Contact handed over to another journey"
                );
                Ok(NodeResult::end(Outcome::Chained {
                    target_journey_id: target,
                    enrolled_run_id,
                    skipped,
                }))
            }
        }
    }

    async fn execute_message(
        &self,
        run: &Run,
        journey: &JourneyDefinition,
        node: &Node,
        message: &MessageNode,
    ) -> JourneyResult<NodeResult> {
        let variables = match self.contacts.profile(&run.contact_id).await? {
            Some(profile) => profile.template_variables(),
            None => [("contact_id".to_string(), run.contact_id.clone())].into(),
        };
        let rendered = render(message, &variables);

        match self
            .channel_sender
            .send(message.channel, &run.contact_id, &rendered)
            .await
        {
            Ok(()) => Ok(NodeResult::follow(
                Outcome::Sent {
                    channel: message.channel,
                },
                journey.next_edge(&node.id),
                message.delay(),
            )),
            Err(err) => {
                let attempt = run.attempt_count + 1;
                metrics::counter!("journey.dispatch_failures").increment(1);
                let outcome = Outcome::DispatchError {
                    attempt,
                    reason: err.to_string(),
                };

                if err.is_retryable() && attempt < self.retry.max_attempts {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        run_id = %run.id,
                        node_id = %node.id,
                        attempt,
                        backoff_secs = backoff.num_seconds(),
                        error = %err,
                        "Dispatch failed, retrying"
                    );
                    Ok(NodeResult {
                        outcome,
                        next_node_id: Some(node.id.clone()),
                        next_delay: backoff,
                        terminal: false,
                    })
                } else {
                    warn!(
                        run_id = %run.id,
                        node_id = %node.id,
                        attempt,
                        error = %err,
                        "Dispatch failed, giving up"
                    );
                    Ok(NodeResult::end(outcome))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryContacts, InMemoryDonations, ScriptedChannelSender};
    use crate::error::DispatchError;
    use crate::repository::InMemoryRunRepository;
    use crate::store::DefinitionStore;
    use crate::types::{Branch, ConditionPredicate, Edge, SkipReason};
    use donorflow_core::event_bus::noop_sink;
    use donorflow_core::types::{Channel, ContactProfile, DonationAggregates};

    struct Fixture {
        executor: NodeExecutor,
        sender: Arc<ScriptedChannelSender>,
        donations: Arc<InMemoryDonations>,
        store: Arc<DefinitionStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(DefinitionStore::new());
        let runs = Arc::new(InMemoryRunRepository::new());
        let contacts = Arc::new(InMemoryContacts::new());
        contacts.add(ContactProfile::new("c-1", "Ada"));
        let sender = Arc::new(ScriptedChannelSender::new());
        let donations = Arc::new(InMemoryDonations::new());

        let enrollment =
            EnrollmentService::new(store.clone(), runs, contacts.clone(), noop_sink());
        let config = JourneyConfig {
            max_dispatch_attempts: 3,
            retry_backoff_secs: 60,
            retry_jitter_ratio: 0.0,
            ..JourneyConfig::default()
        };
        let executor = NodeExecutor::new(
            sender.clone(),
            donations.clone(),
            contacts,
            enrollment,
            RetryPolicy::from_config(&config),
        );
        Fixture {
            executor,
            sender,
            donations,
            store,
        }
    }

    fn journey() -> JourneyDefinition {
        JourneyDefinition::new(
            "Appeal",
            "org-1",
            vec![
                Node::entry("entry"),
                Node::message("ask", Channel::Email, "Hi {{name}}")
                    .with_subject("Our appeal")
                    .with_delay_secs(3600),
                Node::condition("gave", ConditionPredicate::HasDonated),
                Node::message("thanks", Channel::Email, "Thanks"),
                Node::message("nudge", Channel::Sms, "Reminder"),
            ],
            vec![
                Edge::new("entry", "ask"),
                Edge::new("ask", "gave").with_delay_secs(60),
                Edge::branch("gave", "thanks", Branch::True),
                Edge::branch("gave", "nudge", Branch::False),
            ],
        )
    }

    fn run_at(journey: &JourneyDefinition, node: &str) -> Run {
        let mut run = Run::new(journey.id, "c-1", node, Utc::now());
        run.status = RunStatus::Processing;
        run
    }

    #[tokio::test]
    async fn test_entry_follows_single_edge() {
        let fx = fixture();
        let j = journey();
        let run = run_at(&j, "entry");
        let result = fx
            .executor
            .execute(&run, &j, j.node("entry").unwrap(), Utc::now())
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Entered);
        assert_eq!(result.next_node_id.as_deref(), Some("ask"));
        assert!(result.next_delay.is_zero());
        assert!(!result.terminal);
    }

    #[tokio::test]
    async fn test_message_success_waits_node_plus_edge_delay() {
        let fx = fixture();
        let j = journey();
        let mut run = run_at(&j, "ask");
        let now = Utc::now();

        let result = fx
            .executor
            .execute(&run, &j, j.node("ask").unwrap(), now)
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Sent { channel: Channel::Email });
        assert_eq!(result.next_delay, Duration::seconds(3660));

        result.apply_to(&mut run, now);
        assert_eq!(run.status, RunStatus::WaitingDelay);
        assert_eq!(run.scheduled_at, Some(now + Duration::seconds(3660)));
        assert_eq!(run.current_node_id, "gave");

        let sent = fx.sender.sent();
        assert_eq!(sent[0].message.body, "Hi Ada");
        assert_eq!(sent[0].message.subject.as_deref(), Some("Our appeal"));
    }

    #[test]
    fn test_unrepresentable_due_time_fails_run() {
        let j = journey();
        let mut run = run_at(&j, "ask");
        let now = Utc::now();
        let result = NodeResult {
            outcome: Outcome::Sent { channel: Channel::Email },
            next_node_id: Some("gave".into()),
            next_delay: Duration::weeks(52 * 300_000),
            terminal: false,
        };

        result.apply_to(&mut run, now);

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.scheduled_at.is_none());
        assert_eq!(run.current_node_id, "ask");
        let outcomes: Vec<_> = run.history.iter().map(|h| h.outcome.clone()).collect();
        assert_eq!(outcomes[0], Outcome::Sent { channel: Channel::Email });
        assert!(matches!(outcomes[1], Outcome::Failed { .. }));
        assert_eq!(outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_condition_routes_on_donation_history() {
        let fx = fixture();
        let j = journey();
        let run = run_at(&j, "gave");

        let result = fx
            .executor
            .execute(&run, &j, j.node("gave").unwrap(), Utc::now())
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::Branched { result: false });
        assert_eq!(result.next_node_id.as_deref(), Some("nudge"));

        fx.donations.set(
            "c-1",
            DonationAggregates {
                has_donated: true,
                last_donation_date: Some(Utc::now()),
                total_amount: 20.0,
                max_amount: 20.0,
            },
        );
        let result = fx
            .executor
            .execute(&run, &j, j.node("gave").unwrap(), Utc::now())
            .await
            .unwrap();
        assert_eq!(result.next_node_id.as_deref(), Some("thanks"));
        assert!(result.next_delay.is_zero());
    }

    #[tokio::test]
    async fn test_last_node_completes_run() {
        let fx = fixture();
        let j = journey();
        let mut run = run_at(&j, "thanks");
        let now = Utc::now();

        let result = fx
            .executor
            .execute(&run, &j, j.node("thanks").unwrap(), now)
            .await
            .unwrap();
        assert!(result.terminal);
        assert_eq!(result.terminal_status(), Some(RunStatus::Completed));

        result.apply_to(&mut run, now);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.scheduled_at.is_none());
        let outcomes: Vec<_> = run.history.iter().map(|h| h.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![Outcome::Sent { channel: Channel::Email }, Outcome::Completed]
        );
    }

    #[tokio::test]
    async fn test_dispatch_failure_retries_then_fails() {
        let fx = fixture();
        let j = journey();
        let mut run = run_at(&j, "nudge");
        fx.sender
            .fail_always(DispatchError::Unavailable("gateway timeout".into()));
        let now = Utc::now();

        let first = fx
            .executor
            .execute(&run, &j, j.node("nudge").unwrap(), now)
            .await
            .unwrap();
        assert!(!first.terminal);
        assert_eq!(first.next_node_id.as_deref(), Some("nudge"));
        assert_eq!(first.next_delay, Duration::seconds(60));
        first.apply_to(&mut run, now);
        assert_eq!(run.attempt_count, 1);
        assert_eq!(run.status, RunStatus::WaitingDelay);

        let second = fx
            .executor
            .execute(&run, &j, j.node("nudge").unwrap(), now)
            .await
            .unwrap();
        assert_eq!(second.next_delay, Duration::seconds(120));
        second.apply_to(&mut run, now);

        let third = fx
            .executor
            .execute(&run, &j, j.node("nudge").unwrap(), now)
            .await
            .unwrap();
        assert!(third.terminal);
        assert_eq!(third.terminal_status(), Some(RunStatus::Failed));
        third.apply_to(&mut run, now);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.attempt_count, 3);
        assert!(matches!(
            run.history.last().unwrap().outcome,
            Outcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_rejected_dispatch_fails_without_retry() {
        let fx = fixture();
        let j = journey();
        let run = run_at(&j, "nudge");
        fx.sender
            .fail_next(1, DispatchError::Rejected("invalid number".into()));

        let result = fx
            .executor
            .execute(&run, &j, j.node("nudge").unwrap(), Utc::now())
            .await
            .unwrap();
        assert!(result.terminal);
        assert_eq!(
            result.outcome,
            Outcome::DispatchError {
                attempt: 1,
                reason: "message rejected: invalid number".into()
            }
        );
    }

    #[tokio::test]
    async fn test_journey_ref_reports_skipped_target() {
        let fx = fixture();
        let target = JourneyDefinition::new(
            "Stewardship",
            "org-1",
            vec![Node::entry("e"), Node::message("m", Channel::Whatsapp, "Hello")],
            vec![Edge::new("e", "m")],
        );
        let target_id = fx.store.create(target).unwrap();

        let mut j = journey();
        j.nodes.push(Node::journey_ref("handoff", target_id));
        let run = run_at(&j, "handoff");

        let result = fx
            .executor
            .execute(&run, &j, j.node("handoff").unwrap(), Utc::now())
            .await
            .unwrap();
        assert!(result.terminal);
        assert_eq!(result.terminal_status(), Some(RunStatus::Completed));
        assert_eq!(
            result.outcome,
            Outcome::Chained {
                target_journey_id: target_id,
                enrolled_run_id: None,
                skipped: Some(SkipReason::JourneyNotActive),
            }
        );

        fx.store.activate(target_id).unwrap();
        let result = fx
            .executor
            .execute(&run, &j, j.node("handoff").unwrap(), Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            result.outcome,
            Outcome::Chained {
                enrolled_run_id: Some(_),
                skipped: None,
                ..
            }
        ));
    }
}
