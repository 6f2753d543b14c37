use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use donorflow_core::event_bus::{make_event, EventSink};
use donorflow_core::types::{ContactId, EventType};

use crate::collaborators::ContactDirectory;
use crate::repository::RunRepository;
use crate::store::DefinitionStore;
use crate::types::{EnrollmentReport, JourneyStatus, Run, SkipReason, SkippedEnrollment};

/// Creates runs for contacts entering a journey. Also used by journey
/// reference nodes to chain a contact into another journey.
#[derive(Clone)]
pub struct EnrollmentService {
    store: Arc<DefinitionStore>,
    runs: Arc<dyn RunRepository>,
    contacts: Arc<dyn ContactDirectory>,
    event_sink: Arc<dyn EventSink>,
}

impl EnrollmentService {
    pub fn new(
        store: Arc<DefinitionStore>,
        runs: Arc<dyn RunRepository>,
        contacts: Arc<dyn ContactDirectory>,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            runs,
            contacts,
            event_sink,
        }
    }

    /// Enrolls each contact at the journey's entry node, due immediately.
    pub async fn enroll(&self, journey_id: Uuid, contact_ids: &[ContactId]) -> EnrollmentReport {
        self.enroll_at(journey_id, contact_ids, Utc::now()).await
    }

    /// As [`enroll`](Self::enroll) with an explicit clock reading.
    pub async fn enroll_at(
        &self,
        journey_id: Uuid,
        contact_ids: &[ContactId],
        now: DateTime<Utc>,
    ) -> EnrollmentReport {
        let mut report = EnrollmentReport::default();

        let journey = match self.store.get(journey_id) {
            Some(j) => j,
            None => {
                warn!(journey_id = %journey_id, "Enrollment into unknown journey");
                return Self::skip_all(contact_ids, SkipReason::JourneyNotFound);
            }
        };
        if journey.status != JourneyStatus::Active {
            warn!(journey_id = %journey_id, status = ?journey.status, "Enrollment into inactive journey");
            return Self::skip_all(contact_ids, SkipReason::JourneyNotActive);
        }
        // Activation validated the graph, so an active journey has an entry.
        let Some(entry) = journey.entry_node() else {
            return Self::skip_all(contact_ids, SkipReason::JourneyNotActive);
        };

        let mut seen: HashSet<&str> = HashSet::with_capacity(contact_ids.len());
        for contact_id in contact_ids {
            if !seen.insert(contact_id.as_str()) {
                report.skipped.push(SkippedEnrollment {
                    contact_id: contact_id.clone(),
                    reason: SkipReason::DuplicateInBatch,
                });
                continue;
            }

            match self.contacts.exists(contact_id).await {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped.push(SkippedEnrollment {
                        contact_id: contact_id.clone(),
                        reason: SkipReason::ContactNotFound,
                    });
                    continue;
                }
                Err(err) => {
                    warn!(contact_id = %contact_id, error = %err, "Contact lookup failed");
                    report.skipped.push(SkippedEnrollment {
                        contact_id: contact_id.clone(),
                        reason: SkipReason::ContactLookupFailed {
                            message: err.to_string(),
                        },
                    });
                    continue;
                }
            }

            let run = Run::new(journey_id, contact_id.clone(), entry.id.clone(), now);
            match self.runs.insert(run) {
                Ok(run_id) => {
                    info!(
                        run_id = %run_id,
                        journey_id = %journey_id,
                        contact_id = %contact_id,
                        "Contact enrolled"
                    );
                    metrics::counter!("journey.runs_enrolled").increment(1);
                    self.event_sink.emit(make_event(
                        EventType::RunEnrolled,
                        journey_id,
                        Some(run_id),
                        Some(contact_id.clone()),
                    ));
                    report.created.push(run_id);
                }
                Err(existing) => {
                    report.skipped.push(SkippedEnrollment {
                        contact_id: contact_id.clone(),
                        reason: SkipReason::AlreadyEnrolled { run_id: existing },
                    });
                }
            }
        }

        report
    }

    fn skip_all(contact_ids: &[ContactId], reason: SkipReason) -> EnrollmentReport {
        EnrollmentReport {
            created: Vec::new(),
            skipped: contact_ids
                .iter()
                .map(|c| SkippedEnrollment {
                    contact_id: c.clone(),
                    reason: reason.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryContacts;
    use crate::repository::InMemoryRunRepository;
    use crate::types::{Edge, JourneyDefinition, Node, RunStatus};
    use donorflow_core::event_bus::capture_sink;
    use donorflow_core::types::{Channel, ContactProfile};

    struct Fixture {
        service: EnrollmentService,
        store: Arc<DefinitionStore>,
        runs: Arc<InMemoryRunRepository>,
        journey_id: Uuid,
    }

    fn fixture(activate: bool) -> Fixture {
        let store = Arc::new(DefinitionStore::new());
        let runs = Arc::new(InMemoryRunRepository::new());
        let contacts = Arc::new(InMemoryContacts::new());
        for id in ["c-1", "c-2", "c-3"] {
            contacts.add(ContactProfile::new(id, id.to_uppercase()));
        }

        let journey = JourneyDefinition::new(
            "Welcome",
            "org-1",
            vec![Node::entry("start"), Node::message("hello", Channel::Sms, "Hi")],
            vec![Edge::new("start", "hello")],
        );
        let journey_id = store.create(journey).unwrap();
        if activate {
            store.activate(journey_id).unwrap();
        }

        let service = EnrollmentService::new(
            store.clone(),
            runs.clone(),
            contacts,
            capture_sink(),
        );
        Fixture {
            service,
            store,
            runs,
            journey_id,
        }
    }

    #[tokio::test]
    async fn test_enroll_creates_run_at_entry() {
        let fx = fixture(true);
        let report = fx.service.enroll(fx.journey_id, &["c-1".to_string()]).await;

        assert_eq!(report.created.len(), 1);
        assert!(report.skipped.is_empty());

        let run = fx.runs.get(report.created[0]).unwrap();
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.current_node_id, "start");
        assert!(run.scheduled_at.is_some());
        assert!(run.history.is_empty());
    }

    #[tokio::test]
    async fn test_reenroll_is_skipped_not_duplicated() {
        let fx = fixture(true);
        let first = fx.service.enroll(fx.journey_id, &["c-1".to_string()]).await;
        let second = fx
            .service
            .enroll(fx.journey_id, &["c-1".to_string(), "c-2".to_string()])
            .await;

        assert_eq!(second.created.len(), 1);
        assert_eq!(
            second.skipped[0].reason,
            SkipReason::AlreadyEnrolled {
                run_id: first.created[0]
            }
        );
        assert_eq!(fx.runs.list_for_journey(fx.journey_id).len(), 2);
    }

    #[tokio::test]
    async fn test_batch_continues_past_bad_contacts() {
        let fx = fixture(true);
        let ids: Vec<ContactId> = ["c-1", "ghost", "c-1", "c-3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let report = fx.service.enroll(fx.journey_id, &ids).await;

        assert_eq!(report.created.len(), 2);
        let reasons: Vec<_> = report.skipped.iter().map(|s| s.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![SkipReason::ContactNotFound, SkipReason::DuplicateInBatch]
        );
    }

    #[tokio::test]
    async fn test_inactive_journey_skips_everyone() {
        let fx = fixture(false);
        let report = fx
            .service
            .enroll(fx.journey_id, &["c-1".to_string(), "c-2".to_string()])
            .await;
        assert!(report.created.is_empty());
        assert!(report
            .skipped
            .iter()
            .all(|s| s.reason == SkipReason::JourneyNotActive));
        assert!(!fx.store.is_active(fx.journey_id));

        let missing = fx.service.enroll(Uuid::new_v4(), &["c-1".to_string()]).await;
        assert_eq!(missing.skipped[0].reason, SkipReason::JourneyNotFound);
    }
}
