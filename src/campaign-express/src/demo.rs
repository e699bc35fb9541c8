//! Demo store seeding for local runs.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;

use campaign_core::{CampaignResult, CustomerRecord, InMemoryCustomerStore, StoreId};
use campaign_engine::OutreachEngine;
use campaign_management::{CreateCampaignRequest, Sender, TargetAudience};
use campaign_recovery::{
    AbandonmentRequest, CartItem, CreateSequenceRequest, DiscountOffer, RecoveryStep,
    RecoveryTrigger,
};
use campaign_segmentation::SegmentBuilder;

const CUSTOMERS: &[(&str, f64, u32)] = &[
    ("ada", 1_250.0, 9),
    ("brook", 640.0, 4),
    ("cyril", 120.0, 1),
    ("dana", 75.0, 1),
    ("emil", 980.0, 6),
];

pub async fn seed(
    engine: &OutreachEngine,
    customers: &Arc<InMemoryCustomerStore>,
) -> CampaignResult<StoreId> {
    let store_id = StoreId::new_v4();
    let now = Utc::now();

    for (name, spent, orders) in CUSTOMERS {
        let mut record = CustomerRecord::new(store_id, *name, format!("{name}@demo.shop"));
        record.total_spent = *spent;
        record.order_count = *orders;
        record.last_purchase_at = Some(now - Duration::days(i64::from(*orders) * 7));
        record.signed_up_at = Some(now - Duration::days(365));
        customers.upsert(record);
    }

    let segment = engine
        .create_segment(
            store_id,
            SegmentBuilder::new("Big Spenders")
                .spent_more_than(500.0)
                .build(),
        )
        .await?;

    let sender = Sender {
        name: "Demo Shop".into(),
        address: "hello@demo.shop".into(),
    };
    let campaign = engine
        .create_campaign(
            store_id,
            CreateCampaignRequest {
                name: "Spring preview".into(),
                subject: "A first look at the spring range".into(),
                content_ref: "tpl-spring-preview".into(),
                sender: sender.clone(),
                audience: TargetAudience::segments(vec![segment.id]),
                send_immediately: false,
                scheduled_at: Some(now + Duration::seconds(30)),
                timezone: None,
            },
        )
        .await?;

    let sequence = engine.create_sequence(
        store_id,
        CreateSequenceRequest {
            name: "Cart recovery".into(),
            trigger: RecoveryTrigger::CartAbandoned,
            steps: vec![
                RecoveryStep {
                    delay_secs: 60,
                    subject: "You left something behind".into(),
                    content_ref: "tpl-cart-reminder".into(),
                    offer: None,
                },
                RecoveryStep {
                    delay_secs: 300,
                    subject: "10% off your cart".into(),
                    content_ref: "tpl-cart-offer".into(),
                    offer: Some(DiscountOffer {
                        code: "COMEBACK10".into(),
                        percent_off: 10.0,
                    }),
                },
            ],
            from_name: sender.name.clone(),
            from_address: sender.address.clone(),
            activate: true,
        },
    )?;

    let outcome = engine.record_abandonment(
        store_id,
        AbandonmentRequest::cart(
            "cyril@demo.shop",
            vec![CartItem {
                sku: "MUG-2".into(),
                name: "Stoneware mug".into(),
                quantity: 2,
                unit_price: 18.0,
            }],
        )
        .at(now),
    )?;

    info!(
        store_id = %store_id,
        segment_id = %segment.id,
        campaign_id = %campaign.id,
        sequence_id = %sequence.id,
        cart_id = %outcome.cart.id,
        "Demo store seeded"
    );
    Ok(store_id)
}
