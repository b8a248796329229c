use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub customer_id: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub vin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: String,
    pub base_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upcharge {
    pub id: String,
    pub name: String,
    pub description: String,
    pub default_amount: f64,
    /// `default_amount` is a percentage of the item total rather than a flat fee.
    pub is_percentage: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItem {
    pub id: String,
    pub service_id: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub applied_pricing_rule_ids: Vec<String>,
    pub added_upcharge_ids: Vec<String>,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Estimate,
    WorkOrder,
    Invoice,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualQuoteStatus {
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub customer_id: String,
    pub vehicle_id: String,
    pub status: JobStatus,
    pub estimate_date: DateTime<Utc>,
    pub work_order_date: Option<DateTime<Utc>>,
    pub total_amount: f64,
    pub payment_received: f64,
    pub payment_status: PaymentStatus,
    pub job_items: Vec<JobItem>,
    pub customer_approval_status: ApprovalStatus,
    pub notes: String,
    pub inventory_debited: bool,
    /// References to uploaded vehicle photos for AI quoting.
    #[serde(default)]
    pub visual_quote_photos: Vec<String>,
    #[serde(default)]
    pub visual_quote_status: Option<VisualQuoteStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub job_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub description: String,
    /// Set once a reminder workflow has been started for this appointment.
    #[serde(default)]
    pub reminder_workflow_id: Option<String>,
    #[serde(default)]
    pub reminder_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Generating,
    Complete,
    Failed,
    Sending,
    Sent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub goal: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Company {
    pub name: Option<String>,
    pub enable_email_reminders: bool,
}

impl Company {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Detailing Pro")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AutomatedReminder,
    ManualMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationLog {
    pub id: String,
    pub job_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub method: String,
    pub timestamp: DateTime<Utc>,
}
