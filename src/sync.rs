//! `SyncEngine`: the cursor-paged batch loop tying together the receiver,
//! the parser registry and the catalog writer.
//!
//! Each pass: fetch a batch, normalize it, upsert it, advance the cursor,
//! emit an event, one `info_span!` per stage.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::catalog::CatalogWriter;
use crate::domain::RawObservation;
use crate::parsers::text::TextNormalizer;
use crate::parsers::ParserRegistry;
use crate::receiver::ReceiverReader;
use crate::storage::StorageClient;

#[derive(Debug, Clone)]
pub struct BatchEvent {
    pub batch_no: u32,
    pub size: usize,
    pub running_total: usize,
    pub wm_ingested_at: Option<DateTime<Utc>>,
    pub wm_product_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub batches: u32,
    pub records: usize,
    pub wm_ingested_at: Option<DateTime<Utc>>,
    pub wm_product_id: Option<i64>,
}

pub struct SyncEngine<'a> {
    receiver: &'a ReceiverReader,
    catalog: &'a mut CatalogWriter,
    registry: &'a ParserRegistry,
    normalizer: &'a dyn TextNormalizer,
    storage: Option<&'a StorageClient>,
    parser_name: String,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        receiver: &'a ReceiverReader,
        catalog: &'a mut CatalogWriter,
        registry: &'a ParserRegistry,
        normalizer: &'a dyn TextNormalizer,
        storage: Option<&'a StorageClient>,
        parser_name: impl Into<String>,
    ) -> Self {
        Self {
            receiver,
            catalog,
            registry,
            normalizer,
            storage,
            parser_name: parser_name.into(),
        }
    }

    /// Runs the batch loop to completion (or until `max_batches` is hit),
    /// invoking `on_batch` after each committed batch.
    pub async fn run(
        &mut self,
        batch_size: u32,
        max_batches: u32,
        mut on_batch: Option<&mut dyn FnMut(BatchEvent)>,
    ) -> anyhow::Result<SyncOutcome> {
        let handler = self.registry.get(&self.parser_name)?;
        let (mut wm_ts, mut wm_id) = self.catalog.get_receiver_cursor(&self.parser_name)?;

        let mut batch_no = 0u32;
        let mut total_records = 0usize;

        loop {
            if max_batches > 0 && batch_no >= max_batches {
                break;
            }

            let span = tracing::info_span!("sync_batch", parser_name = %self.parser_name, batch_no);
            let _enter = span.enter();

            let batch = self.receiver.fetch_batch(batch_size, Some(&self.parser_name), wm_ts, wm_id)?;
            if batch.is_empty() {
                tracing::debug!("batch empty, stopping");
                break;
            }

            let started = std::time::Instant::now();
            let normalized: Vec<_> = batch
                .iter()
                .cloned()
                .map(|raw| crate::parsers::normalize(handler.as_ref(), self.normalizer, raw))
                .collect();
            crate::metrics::parser::parse_success(&self.parser_name);

            let (new_ts, new_id) = watermark_from_batch(&batch);

            let outcome = match self.catalog.upsert_many(normalized) {
                Ok(outcome) => outcome,
                Err(err) => {
                    crate::metrics::sync::error();
                    return Err(err.into());
                }
            };

            self.catalog.set_receiver_cursor(&self.parser_name, new_ts, new_id)?;
            crate::metrics::sync::cursor_advanced();
            wm_ts = Some(new_ts);
            wm_id = Some(new_id);

            if let Some(storage) = self.storage {
                if !outcome.duplicate_image_urls.is_empty() {
                    crate::metrics::images::duplicates_found(outcome.duplicate_image_urls.len() as u64);
                    storage.delete_images(&outcome.duplicate_image_urls).await?;
                }
            }

            batch_no += 1;
            total_records += batch.len();
            crate::metrics::sync::batch_processed(batch.len() as u64, batch.len() as u64, started.elapsed().as_secs_f64());
            tracing::info!(batch_size = batch.len(), total_records, "batch committed");

            if let Some(callback) = on_batch.as_deref_mut() {
                callback(BatchEvent {
                    batch_no,
                    size: batch.len(),
                    running_total: total_records,
                    wm_ingested_at: wm_ts,
                    wm_product_id: wm_id,
                });
            }
        }

        Ok(SyncOutcome {
            batches: batch_no,
            records: total_records,
            wm_ingested_at: wm_ts,
            wm_product_id: wm_id,
        })
    }
}

/// Lexicographic maximum of `(observed_at, payload.receiver_product_id or 0)`
/// across a batch of raw (not normalized) observations — the new cursor
/// watermark once the batch has been written.
fn watermark_from_batch(batch: &[RawObservation]) -> (DateTime<Utc>, i64) {
    let mut best: Option<(DateTime<Utc>, i64)> = None;
    for raw in batch {
        let product_id = raw.payload.get("receiver_product_id").and_then(Value::as_i64).unwrap_or(0);
        let candidate = (raw.observed_at, product_id);
        best = Some(match best {
            Some(current) if current >= candidate => current,
            _ => candidate,
        });
    }
    best.unwrap_or_else(|| (Utc::now(), 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Map;

    fn observation(observed_at: DateTime<Utc>, product_id: i64) -> RawObservation {
        let mut payload = Map::new();
        payload.insert("receiver_product_id".to_string(), Value::from(product_id));
        RawObservation {
            parser_name: "fixprice".to_string(),
            source_id: Some(product_id.to_string()),
            plu: None,
            sku: None,
            title: "x".to_string(),
            brand: None,
            available_count: None,
            package_quantity: None,
            unit: None,
            package_unit: None,
            category: None,
            geo: None,
            composition: None,
            image_urls: vec![],
            observed_at,
            payload,
        }
    }

    #[test]
    fn watermark_picks_lexicographic_max_of_timestamp_then_product_id() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let batch = vec![observation(t1, 5), observation(t1, 9), observation(t0, 100)];
        let (ts, id) = watermark_from_batch(&batch);
        assert_eq!(ts, t1);
        assert_eq!(id, 9);
    }

    #[test]
    fn watermark_defaults_product_id_to_zero_when_absent() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut raw = observation(t0, 5);
        raw.payload.clear();
        let (ts, id) = watermark_from_batch(&[raw]);
        assert_eq!(ts, t0);
        assert_eq!(id, 0);
    }
}
