//! Contracts for the services the workflows call out to. The real
//! implementations (database, email provider, generative model, identity)
//! live in the surrounding application.

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::records::*;

/// Transactional business-record store.
///
/// Insert methods assign the record id and ignore the one passed in.
#[async_trait]
pub trait ShopStore: Send + Sync {
    async fn company(&self) -> Result<Company>;

    /// Return the id of the customer with `info.email`, inserting one if
    /// none exists. Lookup and insert happen in one transaction.
    async fn find_or_insert_customer(&self, info: &CustomerInfo) -> Result<String>;
    async fn get_customer(&self, id: &str) -> Result<Option<Customer>>;
    async fn list_customers(&self) -> Result<Vec<Customer>>;
    async fn insert_customer(&self, info: &CustomerInfo) -> Result<String>;

    async fn insert_vehicle(&self, vehicle: Vehicle) -> Result<String>;

    async fn get_service(&self, id: &str) -> Result<Option<Service>>;
    async fn list_services(&self) -> Result<Vec<Service>>;
    async fn list_upcharges(&self) -> Result<Vec<Upcharge>>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>>;
    async fn update_job(&self, job: &Job) -> Result<()>;
    /// Insert a job and its appointment in one transaction. The
    /// appointment's `job_id` is filled in. Returns `(job_id, appointment_id)`.
    async fn insert_job_with_appointment(
        &self,
        job: Job,
        appointment: Appointment,
    ) -> Result<(String, String)>;

    async fn get_appointment(&self, id: &str) -> Result<Option<Appointment>>;
    /// Patch only `reminder_workflow_id`.
    async fn set_reminder_workflow_id(&self, appointment_id: &str, workflow_id: &str)
    -> Result<()>;
    /// Patch only `reminder_sent_at`.
    async fn mark_reminder_sent(&self, appointment_id: &str, at: DateTime<Utc>) -> Result<()>;
    /// Scheduled appointments starting within `[start, end]` that have not
    /// had a reminder sent.
    async fn appointments_for_reminder(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Appointment>>;

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>>;
    async fn insert_campaign(&self, campaign: Campaign) -> Result<String>;
    async fn update_campaign(&self, campaign: &Campaign) -> Result<()>;

    async fn log_message(&self, job_id: &str, content: &str, message_type: MessageType)
    -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound email delivery.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Mailer that only writes the message to the log.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(to = %message.to, subject = %message.subject, body = %message.body, "Email sent (log only)");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignDraft {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuoteSuggestion {
    #[serde(default)]
    pub suggested_service_ids: Vec<String>,
    #[serde(default)]
    pub suggested_upcharge_ids: Vec<String>,
}

/// Generative-AI content calls.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Subject line and body for an email campaign with the given goal.
    async fn generate_campaign(&self, company_name: &str, goal: &str) -> Result<CampaignDraft>;

    /// Services and upcharges that fit the vehicle condition shown in `photos`.
    async fn suggest_quote(
        &self,
        photos: &[String],
        services: &[Service],
        upcharges: &[Upcharge],
    ) -> Result<QuoteSuggestion>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Technician,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    pub role: Role,
}

/// Supplies the already-verified caller, if any.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<CurrentUser>;
}

/// Identity fixed at construction; used for background jobs and tests.
pub struct StaticIdentity(pub Option<CurrentUser>);

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<CurrentUser> {
        self.0.clone()
    }
}

pub fn require_admin(identity: &dyn IdentityProvider) -> Result<CurrentUser> {
    match identity.current_user() {
        Some(user) if user.role == Role::Admin => Ok(user),
        Some(_) => bail!("Admin role required"),
        None => bail!("Not authenticated"),
    }
}
