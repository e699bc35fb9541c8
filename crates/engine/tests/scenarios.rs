//! End-to-end scenarios through the `OutreachEngine` facade.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use campaign_core::config::AppConfig;
use campaign_core::event_bus::capture_sink;
use campaign_core::{
    Clock, CustomerRecord, CustomerStore, InMemoryCustomerStore, ManualClock, StoreId,
};
use campaign_delivery::{DeliveryEvent, DeliveryEventFeed, DeliveryEventKind, RecordingTransport};
use campaign_engine::OutreachEngine;
use campaign_management::{
    CampaignStatus, CreateCampaignRequest, ScheduleRequest, Sender, TargetAudience,
};
use campaign_recovery::{
    AbandonmentRequest, CartItem, CreateSequenceRequest, DiscountOffer, EnrollmentStatus,
    RecoveryStep, RecoveryTrigger,
};
use campaign_segmentation::SegmentBuilder;

struct Harness {
    engine: Arc<OutreachEngine>,
    customers: Arc<InMemoryCustomerStore>,
    transport: Arc<RecordingTransport>,
    clock: Arc<ManualClock>,
    store_id: StoreId,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

fn harness() -> Harness {
    let mut config = AppConfig::default();
    config.dispatch.base_retry_delay_ms = 0;
    config.dispatch.max_retry_delay_ms = 0;
    config.dispatch.retry_jitter_factor = 0.0;

    let customers = Arc::new(InMemoryCustomerStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let clock = Arc::new(ManualClock::new(start()));
    let engine = Arc::new(OutreachEngine::new(
        config,
        customers.clone(),
        transport.clone(),
        clock.clone(),
        capture_sink(),
    ));
    let store_id = StoreId::new_v4();
    for (id, spent) in [("alice", 600.0), ("bob", 400.0), ("carol", 1000.0)] {
        let mut record = CustomerRecord::new(store_id, id, format!("{id}@shop.test"));
        record.total_spent = spent;
        record.order_count = 3;
        customers.upsert(record);
    }
    Harness {
        engine,
        customers,
        transport,
        clock,
        store_id,
    }
}

fn campaign_request(audience: TargetAudience) -> CreateCampaignRequest {
    CreateCampaignRequest {
        name: "VIP preview".into(),
        subject: "Early access for our best customers".into(),
        content_ref: "tpl-vip".into(),
        sender: Sender {
            name: "Shop".into(),
            address: "hello@shop.test".into(),
        },
        audience,
        send_immediately: false,
        scheduled_at: None,
        timezone: None,
    }
}

async fn big_spenders(h: &Harness) -> TargetAudience {
    let segment = h
        .engine
        .create_segment(
            h.store_id,
            SegmentBuilder::new("Big Spenders").spent_more_than(500.0).build(),
        )
        .await
        .unwrap();
    TargetAudience::segments(vec![segment.id])
}

fn recipient_id(h: &Harness, campaign_id: uuid::Uuid, address: &str) -> uuid::Uuid {
    h.engine
        .recipients(h.store_id, campaign_id)
        .unwrap()
        .into_iter()
        .find(|r| r.address == address)
        .map(|r| r.id)
        .unwrap()
}

#[tokio::test]
async fn big_spenders_campaign_reports_half_opened() {
    let h = harness();
    let audience = big_spenders(&h).await;
    assert_eq!(h.engine.estimate_recipients(h.store_id, &audience).await.unwrap(), 2);

    let mut request = campaign_request(audience);
    request.send_immediately = true;
    let campaign = h.engine.create_campaign(h.store_id, request).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Sent);
    assert_eq!(campaign.counters.total_recipients, 2);

    let report = h.engine.campaign_report(h.store_id, campaign.id).unwrap();
    assert_eq!(report.rates.open_rate, 0.0);

    let now = h.clock.now();
    let addresses = ["alice@shop.test", "carol@shop.test"];
    for address in addresses {
        let id = recipient_id(&h, campaign.id, address);
        h.engine
            .ingest_event(
                h.store_id,
                &DeliveryEvent::new(campaign.id, id, DeliveryEventKind::Sent, now),
            )
            .await
            .unwrap();
    }
    let alice = recipient_id(&h, campaign.id, "alice@shop.test");
    h.engine
        .ingest_event(
            h.store_id,
            &DeliveryEvent::new(campaign.id, alice, DeliveryEventKind::Opened, now),
        )
        .await
        .unwrap();

    let report = h.engine.campaign_report(h.store_id, campaign.id).unwrap();
    assert_eq!(report.counters.total_sent, 2);
    assert_eq!(report.counters.total_opened, 1);
    assert_eq!(report.counters.total_delivery_reports, 0);
    assert_eq!(report.rates.open_rate, 0.5);
    assert_eq!(report.rates_percent.open_rate, 50.0);

    // Delivery reports arriving later keep the same rate.
    for address in addresses {
        let id = recipient_id(&h, campaign.id, address);
        h.engine
            .ingest_event(
                h.store_id,
                &DeliveryEvent::new(campaign.id, id, DeliveryEventKind::Delivered, now),
            )
            .await
            .unwrap();
    }
    let report = h.engine.campaign_report(h.store_id, campaign.id).unwrap();
    assert_eq!(report.counters.total_delivered, 2);
    assert_eq!(report.rates.open_rate, 0.5);

    let overview = h.engine.store_overview(h.store_id);
    assert_eq!(overview.total_campaigns, 1);
    assert_eq!(overview.totals.total_opened, 1);
}

#[tokio::test]
async fn repeated_and_reordered_events_never_double_count() {
    let h = harness();
    let mut request = campaign_request(big_spenders(&h).await);
    request.send_immediately = true;
    let campaign = h.engine.create_campaign(h.store_id, request).await.unwrap();
    let carol = recipient_id(&h, campaign.id, "carol@shop.test");
    let now = start();

    let opened = DeliveryEvent::new(campaign.id, carol, DeliveryEventKind::Opened, now);
    let delivered = DeliveryEvent::new(
        campaign.id,
        carol,
        DeliveryEventKind::Delivered,
        now - ChronoDuration::minutes(1),
    );

    let mut previous = h.engine.get_campaign(h.store_id, campaign.id).unwrap().counters;
    for event in [&opened, &opened, &delivered, &delivered, &opened] {
        h.engine.ingest_event(h.store_id, event).await.unwrap();
        let counters = h.engine.get_campaign(h.store_id, campaign.id).unwrap().counters;
        assert!(counters.dominates(&previous));
        previous = counters;
    }
    assert_eq!(previous.total_delivered, 1);
    assert_eq!(previous.total_opened, 1);

    let again = h.engine.ingest_event(h.store_id, &opened).await.unwrap();
    assert!(again.duplicate);
}

#[tokio::test]
async fn roster_is_frozen_once_sending_starts() {
    let h = harness();
    let mut request = campaign_request(big_spenders(&h).await);
    request.send_immediately = true;
    let campaign = h.engine.create_campaign(h.store_id, request).await.unwrap();

    let mut dave = CustomerRecord::new(h.store_id, "dave", "dave@shop.test");
    dave.total_spent = 5_000.0;
    h.customers.upsert(dave);

    let recipients = h.engine.recipients(h.store_id, campaign.id).unwrap();
    assert_eq!(recipients.len(), 2);
    assert_eq!(h.transport.sent_to("dave@shop.test"), 0);
}

#[tokio::test]
async fn sent_campaign_refuses_every_transition() {
    let h = harness();
    let mut request = campaign_request(big_spenders(&h).await);
    request.send_immediately = true;
    let campaign = h.engine.create_campaign(h.store_id, request).await.unwrap();
    let id = campaign.id;
    let later = start() + ChronoDuration::days(1);

    let attempts = [
        h.engine.pause_campaign(h.store_id, id).await,
        h.engine.resume_campaign(h.store_id, id).await,
        h.engine.cancel_campaign(h.store_id, id).await,
        h.engine.send_now(h.store_id, id).await,
        h.engine
            .schedule_campaign(h.store_id, id, ScheduleRequest::At { at: later })
            .await,
    ];
    for attempt in attempts {
        assert!(attempt.unwrap_err().is_invalid_transition());
    }
    let unchanged = h.engine.get_campaign(h.store_id, id).unwrap();
    assert_eq!(unchanged.status, CampaignStatus::Sent);
    assert_eq!(h.transport.sent().len(), 2);
}

#[tokio::test]
async fn scheduled_campaign_starts_on_the_due_tick() {
    let h = harness();
    let mut request = campaign_request(big_spenders(&h).await);
    request.scheduled_at = Some(start() + ChronoDuration::hours(2));
    let campaign = h.engine.create_campaign(h.store_id, request).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Scheduled);
    assert_eq!(campaign.estimated_recipients, 2);

    let early = h.engine.tick(start() + ChronoDuration::hours(1)).await;
    assert!(early.campaigns.is_empty());
    assert!(h.transport.sent().is_empty());

    h.clock.set(start() + ChronoDuration::hours(2));
    let due = h.engine.tick_now().await;
    assert_eq!(due.campaigns.started, vec![campaign.id]);
    assert_eq!(due.campaigns.completed, vec![campaign.id]);
    let sent = h.engine.get_campaign(h.store_id, campaign.id).unwrap();
    assert_eq!(sent.status, CampaignStatus::Sent);
    assert_eq!(h.transport.sent().len(), 2);
}

#[tokio::test]
async fn failed_start_discards_the_draft() {
    let h = harness();
    let segment = h
        .engine
        .create_segment(
            h.store_id,
            SegmentBuilder::new("Whales").spent_more_than(1_000_000.0).build(),
        )
        .await
        .unwrap();
    let mut request = campaign_request(TargetAudience::segments(vec![segment.id]));
    request.send_immediately = true;

    let err = h.engine.create_campaign(h.store_id, request).await.unwrap_err();
    assert!(err.is_validation());
    assert!(h.engine.list_campaigns(h.store_id).is_empty());
}

#[tokio::test]
async fn unsubscribe_from_the_feed_suppresses_the_address() {
    let h = harness();
    let mut request = campaign_request(big_spenders(&h).await);
    request.send_immediately = true;
    let campaign = h.engine.create_campaign(h.store_id, request).await.unwrap();
    let alice = recipient_id(&h, campaign.id, "alice@shop.test");

    let sequence = h
        .engine
        .create_sequence(h.store_id, cart_sequence(vec![step(1, None)]))
        .unwrap();
    let enrollment = h
        .engine
        .record_abandonment(
            h.store_id,
            AbandonmentRequest::cart("alice@shop.test", cart_items()).at(start()),
        )
        .unwrap()
        .enrollment
        .unwrap();
    assert_eq!(enrollment.sequence_id, sequence.id);

    let shutdown = CancellationToken::new();
    let (feed, consumer) =
        DeliveryEventFeed::spawn(&h.engine.config().feed, h.engine.clone(), shutdown.clone());
    feed.publish_wait(DeliveryEvent::new(
        campaign.id,
        alice,
        DeliveryEventKind::Unsubscribed,
        start(),
    ))
    .await
    .unwrap();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .unwrap()
        .unwrap();

    let suppressed = h.customers.unsubscribed_addresses(h.store_id).await.unwrap();
    assert!(suppressed.contains("alice@shop.test"));
    let closed = h.engine.get_enrollment(h.store_id, enrollment.id).unwrap();
    assert_eq!(closed.status, EnrollmentStatus::Unsubscribed);

    let report = h.engine.campaign_report(h.store_id, campaign.id).unwrap();
    assert_eq!(report.counters.total_unsubscribed, 1);

    let next = big_spenders(&h).await;
    assert_eq!(h.engine.estimate_recipients(h.store_id, &next).await.unwrap(), 1);
}

#[tokio::test]
async fn unsubscribe_redelivered_after_store_outage_is_suppressed() {
    let h = harness();
    let mut request = campaign_request(big_spenders(&h).await);
    request.send_immediately = true;
    let campaign = h.engine.create_campaign(h.store_id, request).await.unwrap();
    let alice = recipient_id(&h, campaign.id, "alice@shop.test");
    h.engine
        .create_sequence(h.store_id, cart_sequence(vec![step(1, None)]))
        .unwrap();
    let enrollment = h
        .engine
        .record_abandonment(
            h.store_id,
            AbandonmentRequest::cart("alice@shop.test", cart_items()).at(start()),
        )
        .unwrap()
        .enrollment
        .unwrap();

    let unsubscribe = DeliveryEvent::new(campaign.id, alice, DeliveryEventKind::Unsubscribed, start());
    h.customers.set_available(false);
    let err = h.engine.ingest_event(h.store_id, &unsubscribe).await.unwrap_err();
    assert!(err.to_string().contains("unavailable"));
    let closed = h.engine.get_enrollment(h.store_id, enrollment.id).unwrap();
    assert_eq!(closed.status, EnrollmentStatus::Unsubscribed);

    h.customers.set_available(true);
    let replay = h.engine.ingest_event(h.store_id, &unsubscribe).await.unwrap();
    assert!(replay.duplicate);
    let suppressed = h.customers.unsubscribed_addresses(h.store_id).await.unwrap();
    assert!(suppressed.contains("alice@shop.test"));

    let report = h.engine.campaign_report(h.store_id, campaign.id).unwrap();
    assert_eq!(report.counters.total_unsubscribed, 1);
}

fn step(delay_hours: i64, offer: Option<&str>) -> RecoveryStep {
    RecoveryStep {
        delay_secs: (delay_hours * 3600) as u64,
        subject: format!("Still thinking it over? ({delay_hours}h)"),
        content_ref: format!("tpl-cart-{delay_hours}"),
        offer: offer.map(|code| DiscountOffer {
            code: code.into(),
            percent_off: 15.0,
        }),
    }
}

fn cart_sequence(steps: Vec<RecoveryStep>) -> CreateSequenceRequest {
    CreateSequenceRequest {
        name: "Cart recovery".into(),
        trigger: RecoveryTrigger::CartAbandoned,
        steps,
        from_name: "Shop".into(),
        from_address: "hello@shop.test".into(),
        activate: true,
    }
}

fn cart_items() -> Vec<CartItem> {
    vec![CartItem {
        sku: "LAMP-7".into(),
        name: "Desk lamp".into(),
        quantity: 1,
        unit_price: 89.0,
    }]
}

async fn tick_at(h: &Harness, hours: i64) {
    let now = start() + ChronoDuration::hours(hours);
    h.clock.set(now);
    h.engine.tick(now).await;
}

#[tokio::test]
async fn order_placed_mid_sequence_stops_further_reminders() {
    let h = harness();
    h.engine
        .create_sequence(h.store_id, cart_sequence(vec![step(1, None), step(24, None), step(72, None)]))
        .unwrap();
    let outcome = h
        .engine
        .record_abandonment(
            h.store_id,
            AbandonmentRequest::cart("bob@shop.test", cart_items()).at(start()),
        )
        .unwrap();
    let enrollment = outcome.enrollment.unwrap();

    tick_at(&h, 1).await;
    assert_eq!(h.transport.sent_to("bob@shop.test"), 1);

    tick_at(&h, 2).await;
    assert_eq!(h.transport.sent_to("bob@shop.test"), 1);
    let waiting = h.engine.get_enrollment(h.store_id, enrollment.id).unwrap();
    assert_eq!(waiting.status, EnrollmentStatus::Active);
    assert_eq!(waiting.current_step, 1);

    h.engine
        .mark_order_completed(h.store_id, "bob@shop.test", start() + ChronoDuration::hours(10));
    tick_at(&h, 24).await;
    tick_at(&h, 72).await;

    assert_eq!(h.transport.sent_to("bob@shop.test"), 1);
    let done = h.engine.get_enrollment(h.store_id, enrollment.id).unwrap();
    assert_eq!(done.status, EnrollmentStatus::Completed);
    assert!(!done.dispatched_steps.contains(&1));

    let stats = h.engine.recovery_stats(h.store_id);
    assert_eq!(stats.carts_recovered, 1);
    assert_eq!(stats.recovered_value, 89.0);
    assert_eq!(stats.recovery_rate, 1.0);
}

#[tokio::test]
async fn discount_is_sent_once_even_after_restart() {
    let h = harness();
    h.engine
        .create_sequence(
            h.store_id,
            cart_sequence(vec![step(1, Some("COMEBACK15")), step(24, None)]),
        )
        .unwrap();
    let enrollment = h
        .engine
        .record_abandonment(
            h.store_id,
            AbandonmentRequest::cart("carol@shop.test", cart_items()).at(start()),
        )
        .unwrap()
        .enrollment
        .unwrap();

    tick_at(&h, 1).await;
    let paused = h.engine.pause_enrollment(h.store_id, enrollment.id).unwrap();
    assert_eq!(paused.current_step, 1);

    let restarted = h.engine.restart_enrollment(h.store_id, enrollment.id).unwrap();
    assert_eq!(restarted.current_step, 0);
    assert!(restarted.offer_issued_at.is_some());

    let err = h
        .engine
        .dispatch_enrollment_now(h.store_id, enrollment.id)
        .await
        .unwrap_err();
    assert!(err.is_invalid_transition());

    // Restarted at hour 1: the offer step is skipped, the 24h step follows.
    tick_at(&h, 2).await;
    tick_at(&h, 25).await;

    let with_offer = h
        .transport
        .sent()
        .into_iter()
        .filter(|m| m.offer_code.as_deref() == Some("COMEBACK15"))
        .count();
    assert_eq!(with_offer, 1);
    assert_eq!(h.transport.sent_to("carol@shop.test"), 2);
    let finished = h.engine.get_enrollment(h.store_id, enrollment.id).unwrap();
    assert_eq!(finished.status, EnrollmentStatus::Completed);
}
