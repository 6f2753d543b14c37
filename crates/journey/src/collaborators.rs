//! External collaborators consumed by the engine, plus in-process
//! implementations used by the daemon and by tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;

use donorflow_core::types::{Channel, ContactId, ContactProfile, DonationAggregates};

use crate::error::{CollaboratorError, DispatchError};
use crate::template::RenderedMessage;

/// Delivers a rendered message. The only side-effecting external call the
/// engine makes.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(
        &self,
        channel: Channel,
        contact_id: &str,
        message: &RenderedMessage,
    ) -> Result<(), DispatchError>;
}

/// Read-only view over a contact's donation history.
#[async_trait]
pub trait DonationRepository: Send + Sync {
    async fn donation_aggregates(
        &self,
        contact_id: &str,
    ) -> Result<DonationAggregates, CollaboratorError>;
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn exists(&self, contact_id: &str) -> Result<bool, CollaboratorError>;

    async fn profile(&self, contact_id: &str) -> Result<Option<ContactProfile>, CollaboratorError>;
}

// ─── In-process implementations ─────────────────────────────────────────

/// Donation aggregates held in memory. Unknown contacts have no donations.
#[derive(Default)]
pub struct InMemoryDonations {
    aggregates: DashMap<ContactId, DonationAggregates>,
}

impl InMemoryDonations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, contact_id: impl Into<ContactId>, aggregates: DonationAggregates) {
        self.aggregates.insert(contact_id.into(), aggregates);
    }
}

#[async_trait]
impl DonationRepository for InMemoryDonations {
    async fn donation_aggregates(
        &self,
        contact_id: &str,
    ) -> Result<DonationAggregates, CollaboratorError> {
        Ok(self
            .aggregates
            .get(contact_id)
            .map(|a| a.clone())
            .unwrap_or_else(DonationAggregates::none))
    }
}

/// Contact profiles held in memory.
#[derive(Default)]
pub struct InMemoryContacts {
    profiles: DashMap<ContactId, ContactProfile>,
}

impl InMemoryContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, profile: ContactProfile) {
        self.profiles.insert(profile.contact_id.clone(), profile);
    }
}

#[async_trait]
impl ContactDirectory for InMemoryContacts {
    async fn exists(&self, contact_id: &str) -> Result<bool, CollaboratorError> {
        Ok(self.profiles.contains_key(contact_id))
    }

    async fn profile(&self, contact_id: &str) -> Result<Option<ContactProfile>, CollaboratorError> {
        Ok(self.profiles.get(contact_id).map(|p| p.clone()))
    }
}

/// Sender that only logs. Used when delivery is handled outside the process.
#[derive(Debug, Default)]
pub struct TracingChannelSender;

#[async_trait]
impl ChannelSender for TracingChannelSender {
    async fn send(
        &self,
        channel: Channel,
        contact_id: &str,
        message: &RenderedMessage,
    ) -> Result<(), DispatchError> {
        info!(
            channel = %channel,
            contact_id = %contact_id,
            subject = ?message.subject,
            body_len = message.body.len(),
            "Message dispatched"
        );
        Ok(())
    }
}

/// A message accepted by [`ScriptedChannelSender`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub channel: Channel,
    pub contact_id: ContactId,
    pub message: RenderedMessage,
}

/// Test double that records deliveries and fails on demand.
#[derive(Default)]
pub struct ScriptedChannelSender {
    sent: Mutex<Vec<SentMessage>>,
    scripted_failures: Mutex<VecDeque<DispatchError>>,
    always_fail: Mutex<Option<DispatchError>>,
    attempts: Mutex<u32>,
    latency: Option<Duration>,
}

impl ScriptedChannelSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send sleeps for `latency` before completing.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The next `times` sends fail with `error`.
    pub fn fail_next(&self, times: usize, error: DispatchError) {
        let mut queue = self.scripted_failures.lock();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn fail_always(&self, error: DispatchError) {
        *self.always_fail.lock() = Some(error);
    }

    pub fn recover(&self) {
        *self.always_fail.lock() = None;
        self.scripted_failures.lock().clear();
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, contact_id: &str) -> Vec<SentMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.contact_id == contact_id)
            .cloned()
            .collect()
    }

    /// Total sends attempted, successful or not.
    pub fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }
}

#[async_trait]
impl ChannelSender for ScriptedChannelSender {
    async fn send(
        &self,
        channel: Channel,
        contact_id: &str,
        message: &RenderedMessage,
    ) -> Result<(), DispatchError> {
        *self.attempts.lock() += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = self.always_fail.lock().clone() {
            return Err(err);
        }
        if let Some(err) = self.scripted_failures.lock().pop_front() {
            return Err(err);
        }

        self.sent.lock().push(SentMessage {
            channel,
            contact_id: contact_id.to_string(),
            message: message.clone(),
        });
        Ok(())
    }
}
