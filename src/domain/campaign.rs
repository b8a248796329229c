//! Marketing campaigns: AI-drafted content on the low-priority pool, then a
//! fan-out send to every customer.

use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::domain::ShopServices;
use crate::domain::collaborators::{
    CampaignDraft, EmailMessage, IdentityProvider, ShopStore, require_admin,
};
use crate::domain::records::{Campaign, CampaignStatus, Customer};
use crate::engine::types::{PoolName, RunResult};
use crate::engine::{
    CompletionEvent, CompletionHandler, RetryPolicy, StartOptions, WorkflowArgs,
    WorkflowDefinition, WorkflowManager,
};

pub const GENERATION_HANDLER: &str = "campaign_generation_completion";
pub const SENT_HANDLER: &str = "campaign_sent_completion";

pub const GENERATION_FAILED_SUBJECT: &str = "Content Generation Failed";
pub const GENERATION_FAILED_BODY: &str = "There was an error generating the content for this campaign. Please try creating a new one.";

const NAME_PLACEHOLDER: &str = "{customer.name}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignGenerationArgs {
    pub goal: String,
}

impl WorkflowArgs for CampaignGenerationArgs {
    const NAME: &'static str = "campaign_generation";
    const POOL: PoolName = PoolName::Low;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCampaignArgs {
    pub campaign_id: String,
}

impl WorkflowArgs for SendCampaignArgs {
    const NAME: &'static str = "send_campaign";
    const POOL: PoolName = PoolName::Low;
}

/// Completion context shared by both campaign workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignContext {
    pub campaign_id: String,
}

pub fn generation_definition(services: &ShopServices) -> WorkflowDefinition {
    let store = services.store.clone();
    let content = services.content.clone();

    WorkflowDefinition::builder::<CampaignGenerationArgs>()
        .action(
            "generate_campaign_text",
            RetryPolicy::new(3, 1000, 2.0),
            move |args, _input| {
                let store = store.clone();
                let content = content.clone();
                async move {
                    let company = store.company().await?;
                    content
                        .generate_campaign(company.display_name(), &args.goal)
                        .await
                }
            },
        )
        .build()
}

pub fn send_definition(services: &ShopServices) -> WorkflowDefinition {
    let campaigns = services.store.clone();
    let customers = services.store.clone();
    let mailer = services.mailer.clone();

    WorkflowDefinition::builder::<SendCampaignArgs>()
        .query("get_campaign", RetryPolicy::once(), move |args, _input| {
            let store = campaigns.clone();
            async move {
                let campaign = store
                    .get_campaign(&args.campaign_id)
                    .await?
                    .with_context(|| format!("Campaign not found: {}", args.campaign_id))?;
                let (Some(subject), Some(body)) = (campaign.subject, campaign.body) else {
                    bail!("Campaign content is missing.");
                };
                Ok(CampaignDraft { subject, body })
            }
        })
        .query("get_all_customers", RetryPolicy::once(), move |_args, _input| {
            let store = customers.clone();
            async move { store.list_customers().await }
        })
        .action(
            "send_emails",
            RetryPolicy::new(2, 1000, 2.0),
            move |_args, input| {
                let mailer = mailer.clone();
                async move {
                    let draft: CampaignDraft = input.output(0)?;
                    let customers: Vec<Customer> = input.output(1)?;

                    let sends = customers.iter().map(|customer| {
                        let message = EmailMessage {
                            to: customer.email.clone(),
                            subject: draft.subject.clone(),
                            body: personalize(&draft.body, &customer.name),
                        };
                        let mailer = mailer.clone();
                        async move { mailer.send(&message).await }
                    });
                    futures_util::future::try_join_all(sends).await?;

                    Ok(customers.len())
                }
            },
        )
        .build()
}

/// Replace the first `{customer.name}` placeholder in `body`.
pub fn personalize(body: &str, name: &str) -> String {
    body.replacen(NAME_PLACEHOLDER, name, 1)
}

/// Create a campaign in `generating` and start drafting its content.
pub async fn request_campaign(
    manager: &WorkflowManager,
    services: &ShopServices,
    identity: &dyn IdentityProvider,
    goal: &str,
) -> Result<String> {
    let user = require_admin(identity)?;
    services.limits.check_heavy_ai(&user.id)?;

    let store = services.store.as_ref();
    let mut campaign = Campaign {
        id: String::new(),
        goal: goal.to_string(),
        subject: None,
        body: None,
        status: CampaignStatus::Generating,
        created_at: Utc::now(),
        sent_at: None,
    };
    campaign.id = store.insert_campaign(campaign.clone()).await?;

    let options = StartOptions::on_complete(
        GENERATION_HANDLER,
        &CampaignContext {
            campaign_id: campaign.id.clone(),
        },
    )?;
    let args = CampaignGenerationArgs {
        goal: goal.to_string(),
    };
    if let Err(e) = manager.start(&args, options).await {
        // No run will ever settle the placeholder.
        campaign.status = CampaignStatus::Failed;
        campaign.subject = Some(GENERATION_FAILED_SUBJECT.to_string());
        campaign.body = Some(GENERATION_FAILED_BODY.to_string());
        store.update_campaign(&campaign).await?;
        return Err(e.into());
    }

    Ok(campaign.id)
}

/// Move a drafted campaign to `sending` and start delivery. Returns the run id.
pub async fn send_campaign(
    manager: &WorkflowManager,
    store: &dyn ShopStore,
    identity: &dyn IdentityProvider,
    campaign_id: &str,
) -> Result<String> {
    require_admin(identity)?;

    let mut campaign = store
        .get_campaign(campaign_id)
        .await?
        .with_context(|| format!("Campaign not found: {}", campaign_id))?;
    if campaign.status != CampaignStatus::Complete {
        bail!("Campaign is not ready to be sent.");
    }

    campaign.status = CampaignStatus::Sending;
    store.update_campaign(&campaign).await?;

    let options = StartOptions::on_complete(
        SENT_HANDLER,
        &CampaignContext {
            campaign_id: campaign_id.to_string(),
        },
    )?;
    let args = SendCampaignArgs {
        campaign_id: campaign_id.to_string(),
    };
    match manager.start(&args, options).await {
        Ok(run_id) => Ok(run_id),
        Err(e) => {
            campaign.status = CampaignStatus::Complete;
            store.update_campaign(&campaign).await?;
            Err(e.into())
        }
    }
}

pub struct CampaignGenerationCompletion {
    pub store: Arc<dyn ShopStore>,
}

#[async_trait]
impl CompletionHandler for CampaignGenerationCompletion {
    fn name(&self) -> &str {
        GENERATION_HANDLER
    }

    async fn on_complete(&self, event: CompletionEvent) -> Result<()> {
        let ctx: CampaignContext = event.context()?;
        let Some(mut campaign) = self.store.get_campaign(&ctx.campaign_id).await? else {
            return Ok(());
        };

        match event.result {
            RunResult::Success { return_value } => {
                let draft: CampaignDraft = serde_json::from_value(return_value)
                    .context("Failed to decode campaign draft")?;
                campaign.subject = Some(draft.subject);
                campaign.body = Some(draft.body);
                campaign.status = CampaignStatus::Complete;
            }
            RunResult::Error { error } => {
                error!(campaign_id = %campaign.id, error = %error, "Campaign generation failed");
                campaign.status = CampaignStatus::Failed;
                campaign.subject = Some(GENERATION_FAILED_SUBJECT.to_string());
                campaign.body = Some(GENERATION_FAILED_BODY.to_string());
            }
            RunResult::Canceled => {
                info!(campaign_id = %campaign.id, "Campaign generation canceled");
                campaign.status = CampaignStatus::Failed;
                campaign.subject = Some("Canceled".to_string());
            }
        }

        self.store.update_campaign(&campaign).await
    }
}

pub struct CampaignSentCompletion {
    pub store: Arc<dyn ShopStore>,
}

#[async_trait]
impl CompletionHandler for CampaignSentCompletion {
    fn name(&self) -> &str {
        SENT_HANDLER
    }

    async fn on_complete(&self, event: CompletionEvent) -> Result<()> {
        let ctx: CampaignContext = event.context()?;
        let Some(mut campaign) = self.store.get_campaign(&ctx.campaign_id).await? else {
            return Ok(());
        };

        match event.result {
            RunResult::Success { .. } => {
                info!(campaign_id = %campaign.id, "Campaign sent");
                campaign.status = CampaignStatus::Sent;
                campaign.sent_at = Some(Utc::now());
            }
            RunResult::Error { error } => {
                error!(campaign_id = %campaign.id, error = %error, "Sending campaign failed");
                campaign.status = CampaignStatus::Failed;
            }
            RunResult::Canceled => {
                error!(campaign_id = %campaign.id, "Sending campaign failed: canceled");
                campaign.status = CampaignStatus::Failed;
            }
        }

        self.store.update_campaign(&campaign).await
    }
}
