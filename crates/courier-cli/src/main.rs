//! End-to-end demo: build a payload for a sample product, queue it, and let
//! the dispatcher deliver it to a real webhook.
//!
//! ```text
//! COURIER_WEBHOOK_URL=https://hooks.example/abc courier-cli
//! COURIER_DB=/tmp/courier.db  # optional; in-memory queue when unset
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{Duration, sleep};
use tracing::info;

use courier_core::clock::SystemClock;
use courier_core::payload::{SourceProduct, SourceVariant, VariationPayloadBuilder};
use courier_core::queue::{MemoryQueue, Queue, SqliteQueue};
use courier_core::{CourierConfig, CourierService, Dispatcher, WebhookClient};

fn sample_product() -> SourceProduct {
    let variant = |id: u64, color: &str, price: f64| SourceVariant {
        id,
        sku: format!("DEMO-{id}"),
        price,
        stock_status: "instock".to_string(),
        attributes: BTreeMap::from([
            ("color".to_string(), color.to_string()),
            ("model".to_string(), "XR-7".to_string()),
        ]),
    };
    SourceProduct {
        id: 42,
        name: "Demo Trail Shoe".to_string(),
        permalink: "https://shop.example/product/demo-trail-shoe".to_string(),
        last_scraped_at: Some(Utc::now()),
        variants: vec![variant(101, "black", 199.0), variant(102, "red", 189.0)],
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courier_core=debug".into()),
        )
        .init();

    let config = CourierConfig {
        webhook_url: std::env::var("COURIER_WEBHOOK_URL").unwrap_or_default(),
        model_attributes: "model".to_string(),
        ..CourierConfig::default()
    };

    if !config.integration_enabled() {
        info!("no webhook url configured, nothing to deliver (set COURIER_WEBHOOK_URL)");
        return Ok(());
    }

    // (A) Pick a queue: SQLite when COURIER_DB is set, in-memory otherwise.
    let clock = Arc::new(SystemClock);
    let queue: Arc<dyn Queue> = match std::env::var("COURIER_DB") {
        Ok(path) => Arc::new(SqliteQueue::open(&path, clock, config.max_attempts).await?),
        Err(_) => Arc::new(MemoryQueue::new(clock, config.max_attempts)),
    };

    // (B) Start the dispatcher with the real HTTP sink.
    let sink = Arc::new(WebhookClient::new(config.webhook())?);
    let dispatcher = Dispatcher::spawn(queue.clone(), sink, config.dispatcher());

    // (C) Submit one product the way the scraping pipeline would.
    let service = CourierService::new(
        queue.clone(),
        Arc::new(VariationPayloadBuilder),
        config.build_rules(),
        config.group.clone(),
        config.integration_enabled(),
    );
    let Some(id) = service.submit(&sample_product()).await? else {
        info!("builder produced nothing to send");
        dispatcher.shutdown_and_join().await;
        return Ok(());
    };

    // (D) Poll until the task reaches a terminal state.
    loop {
        let Some(record) = queue.status(id).await? else {
            break;
        };
        if record.state.is_terminal() {
            info!(
                task_id = %id,
                state = record.state.as_str(),
                attempts = record.attempt_count,
                last_error = record.last_error.as_deref().unwrap_or("-"),
                "delivery finished"
            );
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    info!(counts = ?queue.counts(Some(&config.group)).await?, "queue counts");

    // (E) Graceful stop.
    dispatcher.shutdown_and_join().await;
    Ok(())
}
