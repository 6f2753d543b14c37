//! Demo data for `--demo`.

use chrono::{Duration, Utc};
use donorflow_core::types::{Channel, ContactProfile, DonationAggregates};
use donorflow_journey::collaborators::{InMemoryContacts, InMemoryDonations};
use donorflow_journey::types::{
    AmountBasis, Branch, ConditionPredicate, Edge, JourneyDefinition, Node,
};
use donorflow_journey::JourneyEngine;
use tracing::info;

/// Creates and activates a lapsed-donor journey, then enrolls three contacts.
pub async fn seed(
    engine: &JourneyEngine,
    contacts: &InMemoryContacts,
    donations: &InMemoryDonations,
) -> anyhow::Result<()> {
    info!("Seeding demo journey");
    let now = Utc::now();

    contacts.add(ContactProfile::new("demo-1", "Ada").with_field("campaign", "Clean Water"));
    contacts.add(ContactProfile::new("demo-2", "Grace").with_field("campaign", "Clean Water"));
    contacts.add(ContactProfile::new("demo-3", "Alan").with_field("campaign", "Clean Water"));

    donations.set(
        "demo-1",
        DonationAggregates {
            has_donated: true,
            last_donation_date: Some(now - Duration::days(200)),
            total_amount: 750.0,
            max_amount: 500.0,
        },
    );
    donations.set(
        "demo-2",
        DonationAggregates {
            has_donated: true,
            last_donation_date: Some(now - Duration::days(20)),
            total_amount: 40.0,
            max_amount: 25.0,
        },
    );

    let journey = JourneyDefinition::new(
        "Lapsed donor win-back",
        "demo-org",
        vec![
            Node::entry("entry"),
            Node::condition(
                "lapsed",
                ConditionPredicate::DaysSinceLastDonationGt { value: 180 },
            ),
            Node::condition(
                "major",
                ConditionPredicate::DonationAmountGt {
                    value: 250.0,
                    basis: AmountBasis::Max,
                },
            ),
            Node::message("call-ask", Channel::Whatsapp, "Hi {{name}}, could we call you?"),
            Node::message(
                "we-miss-you",
                Channel::Email,
                "{{name}}, {{campaign}} still needs you",
            )
            .with_subject("We miss you")
            .with_delay_secs(60),
            Node::message("update", Channel::Sms, "{{name}}, here is what your gift did"),
        ],
        vec![
            Edge::new("entry", "lapsed"),
            Edge::branch("lapsed", "major", Branch::True),
            Edge::branch("lapsed", "update", Branch::False),
            Edge::branch("major", "call-ask", Branch::True),
            Edge::branch("major", "we-miss-you", Branch::False),
        ],
    );

    let journey_id = engine.create_journey(journey)?;
    engine.activate(journey_id)?;

    let ids: Vec<String> = ["demo-1", "demo-2", "demo-3"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let report = engine.enroll(journey_id, &ids).await;
    info!(
        journey_id = %journey_id,
        enrolled = report.created.len(),
        skipped = report.skipped.len(),
        "Demo journey seeded"
    );
    Ok(())
}
