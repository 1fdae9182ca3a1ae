//! Webhook delivery receipts.
//!
//! Deliveries are persisted before any action is taken on them so they can
//! be replayed after a crash.

use crate::projects::parse_id;
use crate::{db_err, Store};
use chrono::{DateTime, Utc};
use sqlx::Row;
use zephyr_core::ids::{DeliveryId, RunId};
use zephyr_core::run::WebhookDelivery;
use zephyr_core::Result;

impl Store {
    pub async fn save_webhook_delivery(
        &self,
        provider: &str,
        event_type: &str,
        payload: &str,
        signature: Option<&str>,
    ) -> Result<WebhookDelivery> {
        let delivery = WebhookDelivery {
            id: DeliveryId::new(),
            provider: provider.to_string(),
            event_type: event_type.to_string(),
            payload: payload.to_string(),
            signature: signature.map(str::to_string),
            processed: false,
            run_id: None,
            error: None,
            received_at: Utc::now(),
        };

        sqlx::query(
            r#"INSERT INTO webhook_deliveries
               (id, provider, event_type, payload, signature, processed, received_at)
               VALUES (?, ?, ?, ?, ?, 0, ?)"#,
        )
        .bind(delivery.id.as_uuid().to_string())
        .bind(&delivery.provider)
        .bind(&delivery.event_type)
        .bind(&delivery.payload)
        .bind(&delivery.signature)
        .bind(delivery.received_at)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(delivery)
    }

    pub async fn mark_webhook_processed(
        &self,
        id: DeliveryId,
        run_id: Option<RunId>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_deliveries SET processed = 1, pipeline_run_id = ?, error = ? WHERE id = ?",
        )
        .bind(run_id.map(|r| r.as_uuid().to_string()))
        .bind(error)
        .bind(id.as_uuid().to_string())
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(())
    }

    pub async fn unprocessed_webhook_deliveries(&self, limit: u32) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query(
            r#"SELECT id, provider, event_type, payload, signature, processed,
                      pipeline_run_id, error, received_at
               FROM webhook_deliveries WHERE processed = 0
               ORDER BY received_at ASC LIMIT ?"#,
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_delivery).collect()
    }
}

fn row_to_delivery(r: &sqlx::sqlite::SqliteRow) -> Result<WebhookDelivery> {
    let run_id: Option<String> = r.get("pipeline_run_id");
    Ok(WebhookDelivery {
        id: parse_id(r.get("id"))?,
        provider: r.get("provider"),
        event_type: r.get("event_type"),
        payload: r.get("payload"),
        signature: r.get("signature"),
        processed: r.get::<i64, _>("processed") != 0,
        run_id: run_id.map(parse_id).transpose()?,
        error: r.get("error"),
        received_at: r.get::<DateTime<Utc>, _>("received_at"),
    })
}
