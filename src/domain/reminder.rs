use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::domain::ShopServices;
use crate::domain::collaborators::{EmailMessage, Mailer, ShopStore};
use crate::domain::records::{Appointment, Customer, MessageType};
use crate::engine::types::{PoolName, RunResult};
use crate::engine::{
    CompletionEvent, CompletionHandler, RetryPolicy, StartOptions, WorkflowArgs,
    WorkflowDefinition, WorkflowManager,
};

pub const COMPLETION_HANDLER: &str = "reminder_completion";
pub const REMINDER_SUBJECT: &str = "Appointment Reminder";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderArgs {
    pub appointment_id: String,
}

impl WorkflowArgs for ReminderArgs {
    const NAME: &'static str = "appointment_reminder";
    const POOL: PoolName = PoolName::High;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderContext {
    pub appointment_id: String,
}

pub fn definition(services: &ShopServices) -> WorkflowDefinition {
    let store = services.store.clone();
    let mailer = services.mailer.clone();

    WorkflowDefinition::builder::<ReminderArgs>()
        .action(
            "send_and_log_reminder",
            RetryPolicy::new(3, 60_000, 2.0),
            move |args, _input| {
                let store = store.clone();
                let mailer = mailer.clone();
                async move {
                    send_and_log_reminder(store.as_ref(), mailer.as_ref(), &args.appointment_id)
                        .await
                }
            },
        )
        .build()
}

pub fn reminder_message(customer: &Customer, appointment: &Appointment) -> String {
    format!(
        "Hi {},\n\nThis is a friendly reminder of your upcoming auto detailing appointment scheduled for {}.\n\nWe look forward to seeing you!\n\n- Detailing Pro",
        customer.name,
        appointment.start_time.format("%Y-%m-%d %H:%M UTC")
    )
}

/// Returns whether an email went out. Records that disappeared since the
/// dispatch are not an error.
async fn send_and_log_reminder(
    store: &dyn ShopStore,
    mailer: &dyn Mailer,
    appointment_id: &str,
) -> Result<bool> {
    let Some(appointment) = store.get_appointment(appointment_id).await? else {
        return Ok(false);
    };
    let Some(job) = store.get_job(&appointment.job_id).await? else {
        return Ok(false);
    };
    let Some(customer) = store.get_customer(&job.customer_id).await? else {
        return Ok(false);
    };

    let message = reminder_message(&customer, &appointment);
    mailer
        .send(&EmailMessage {
            to: customer.email.clone(),
            subject: REMINDER_SUBJECT.to_string(),
            body: message.clone(),
        })
        .await?;

    store
        .log_message(&job.id, &message, MessageType::AutomatedReminder)
        .await?;

    Ok(true)
}

/// Start one reminder workflow per scheduled appointment starting 23.5 to
/// 24.5 hours after `now`. Appointments that already have a reminder
/// workflow are skipped. Returns the ids of the started runs.
pub async fn dispatch_reminders(
    manager: &WorkflowManager,
    store: &dyn ShopStore,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let company = store.company().await?;
    if !company.enable_email_reminders {
        info!("Email reminders are disabled. Skipping dispatch.");
        return Ok(Vec::new());
    }

    let window_start = now + Duration::minutes(23 * 60 + 30);
    let window_end = now + Duration::minutes(24 * 60 + 30);
    let due = store
        .appointments_for_reminder(window_start, window_end)
        .await?;

    let mut started = Vec::new();
    for appointment in due {
        if appointment.reminder_workflow_id.is_some() {
            continue;
        }

        let options = StartOptions::on_complete(
            COMPLETION_HANDLER,
            &ReminderContext {
                appointment_id: appointment.id.clone(),
            },
        )?;
        let args = ReminderArgs {
            appointment_id: appointment.id.clone(),
        };
        let run_id = manager.start(&args, options).await?;

        store
            .set_reminder_workflow_id(&appointment.id, &run_id)
            .await?;
        started.push(run_id);
    }

    info!(count = started.len(), "Reminder workflows dispatched");
    Ok(started)
}

pub struct ReminderCompletion {
    pub store: Arc<dyn ShopStore>,
}

#[async_trait]
impl CompletionHandler for ReminderCompletion {
    fn name(&self) -> &str {
        COMPLETION_HANDLER
    }

    async fn on_complete(&self, event: CompletionEvent) -> Result<()> {
        let ctx: ReminderContext = event.context()?;

        match event.result {
            RunResult::Success { .. } => {
                self.store
                    .mark_reminder_sent(&ctx.appointment_id, Utc::now())
                    .await
            }
            RunResult::Error { error } => {
                error!(appointment_id = %ctx.appointment_id, error = %error, "Sending reminder failed");
                Ok(())
            }
            RunResult::Canceled => {
                error!(appointment_id = %ctx.appointment_id, "Sending reminder failed: canceled");
                Ok(())
            }
        }
    }
}
