use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::domain::ShopServices;
use crate::domain::collaborators::{QuoteSuggestion, ShopStore};
use crate::domain::records::{JobItem, Service, Upcharge, VisualQuoteStatus};
use crate::engine::types::{PoolName, RunResult};
use crate::engine::{
    CompletionEvent, CompletionHandler, RetryPolicy, StartOptions, WorkflowArgs,
    WorkflowDefinition, WorkflowManager,
};

pub const COMPLETION_HANDLER: &str = "visual_quote_completion";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualQuoteArgs {
    pub job_id: String,
}

impl WorkflowArgs for VisualQuoteArgs {
    const NAME: &'static str = "visual_quote";
    const POOL: PoolName = PoolName::Default;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualQuoteContext {
    pub job_id: String,
}

pub fn definition(services: &ShopServices) -> WorkflowDefinition {
    let store = services.store.clone();
    let content = services.content.clone();

    WorkflowDefinition::builder::<VisualQuoteArgs>()
        .action(
            "analyze_photos",
            RetryPolicy::new(3, 1000, 2.0),
            move |args, _input| {
                let store = store.clone();
                let content = content.clone();
                async move {
                    let job = store
                        .get_job(&args.job_id)
                        .await?
                        .with_context(|| format!("Job not found: {}", args.job_id))?;
                    if job.visual_quote_photos.is_empty() {
                        bail!("Job {} has no photos to analyze", args.job_id);
                    }

                    let services = store.list_services().await?;
                    let upcharges = store.list_upcharges().await?;
                    content
                        .suggest_quote(&job.visual_quote_photos, &services, &upcharges)
                        .await
                }
            },
        )
        .build()
}

/// Mark the job's quote as pending and start the analysis.
pub async fn request_visual_quote(
    manager: &WorkflowManager,
    store: &dyn ShopStore,
    job_id: &str,
) -> Result<String> {
    let mut job = store
        .get_job(job_id)
        .await?
        .with_context(|| format!("Job not found: {}", job_id))?;
    if job.visual_quote_photos.is_empty() {
        bail!("Upload at least one photo before requesting a visual quote");
    }

    job.visual_quote_status = Some(VisualQuoteStatus::Pending);
    store.update_job(&job).await?;

    let options = StartOptions::on_complete(
        COMPLETION_HANDLER,
        &VisualQuoteContext {
            job_id: job_id.to_string(),
        },
    )?;
    let args = VisualQuoteArgs {
        job_id: job_id.to_string(),
    };
    Ok(manager.start(&args, options).await?)
}

/// Build priced job items from an AI suggestion.
///
/// Unknown service ids are dropped. All suggested upcharges attach to the
/// first item and compound in order: a percentage upcharge applies to the
/// running total, a flat one adds its amount.
pub fn price_suggestion(
    suggestion: &QuoteSuggestion,
    services: &[Service],
    upcharges: &[Upcharge],
) -> (Vec<JobItem>, f64) {
    let stamp = Utc::now().timestamp_millis();

    let mut items: Vec<JobItem> = suggestion
        .suggested_service_ids
        .iter()
        .filter_map(|service_id| services.iter().find(|s| &s.id == service_id))
        .map(|service| JobItem {
            id: format!("item_{}_{}", stamp, service.id),
            service_id: service.id.clone(),
            quantity: 1,
            unit_price: service.base_price,
            applied_pricing_rule_ids: Vec::new(),
            added_upcharge_ids: Vec::new(),
            total: service.base_price,
        })
        .collect();

    if let Some(first) = items.first_mut() {
        first
            .added_upcharge_ids
            .extend(suggestion.suggested_upcharge_ids.iter().cloned());
    }

    for item in &mut items {
        let mut total = item.unit_price;
        for upcharge_id in &item.added_upcharge_ids {
            if let Some(upcharge) = upcharges.iter().find(|u| &u.id == upcharge_id) {
                if upcharge.is_percentage {
                    total += total * (upcharge.default_amount / 100.0);
                } else {
                    total += upcharge.default_amount;
                }
            }
        }
        item.total = total;
    }

    let total_amount = items.iter().map(|i| i.total).sum();
    (items, total_amount)
}

pub struct VisualQuoteCompletion {
    pub store: Arc<dyn ShopStore>,
}

#[async_trait]
impl CompletionHandler for VisualQuoteCompletion {
    fn name(&self) -> &str {
        COMPLETION_HANDLER
    }

    async fn on_complete(&self, event: CompletionEvent) -> Result<()> {
        let ctx: VisualQuoteContext = event.context()?;
        let Some(mut job) = self.store.get_job(&ctx.job_id).await? else {
            return Ok(());
        };

        match event.result {
            RunResult::Success { ref return_value } => {
                let suggestion: QuoteSuggestion = serde_json::from_value(return_value.clone())
                    .context("Failed to decode quote suggestion")?;
                let services = self.store.list_services().await?;
                let upcharges = self.store.list_upcharges().await?;
                let (items, total_amount) = price_suggestion(&suggestion, &services, &upcharges);

                info!(job_id = %job.id, items = items.len(), total_amount, "Visual quote applied");
                job.job_items = items;
                job.total_amount = total_amount;
                job.visual_quote_status = Some(VisualQuoteStatus::Complete);
            }
            RunResult::Error { ref error } => {
                error!(job_id = %job.id, error = %error, "Visual quote workflow failed");
                job.visual_quote_status = Some(VisualQuoteStatus::Failed);
            }
            RunResult::Canceled => {
                info!(job_id = %job.id, "Visual quote workflow canceled");
                job.visual_quote_status = Some(VisualQuoteStatus::Failed);
            }
        }

        self.store.update_job(&job).await
    }
}
