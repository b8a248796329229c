//! Online booking: customer, vehicle, then job plus appointment, on the
//! high-priority pool.

use anyhow::{Context as _, Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ShopServices;
use crate::domain::collaborators::ShopStore;
use crate::domain::records::*;
use crate::engine::types::PoolName;
use crate::engine::{RetryPolicy, StartOptions, WorkflowArgs, WorkflowDefinition, WorkflowManager};

pub const ONLINE_BOOKING_VIN: &str = "N/A_OnlineBooking";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingArgs {
    pub customer_info: CustomerInfo,
    pub vehicle_info: VehicleInfo,
    pub service_ids: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub total_price: f64,
    pub total_duration_minutes: i64,
}

impl WorkflowArgs for BookingArgs {
    const NAME: &'static str = "online_booking";
    const POOL: PoolName = PoolName::High;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingOutcome {
    pub customer_id: String,
    pub vehicle_id: String,
    pub job_id: String,
    pub appointment_id: String,
}

pub fn definition(services: &ShopServices) -> WorkflowDefinition {
    let customers = services.store.clone();
    let vehicles = services.store.clone();
    let jobs = services.store.clone();

    WorkflowDefinition::builder::<BookingArgs>()
        .mutation(
            "find_or_create_customer",
            RetryPolicy::once(),
            move |args, _input| {
                let store = customers.clone();
                async move { store.find_or_insert_customer(&args.customer_info).await }
            },
        )
        .mutation("create_vehicle", RetryPolicy::once(), move |args, input| {
            let store = vehicles.clone();
            async move {
                let customer_id: String = input.output(0)?;
                create_vehicle(store.as_ref(), &customer_id, &args.vehicle_info).await
            }
        })
        .mutation(
            "create_job_and_appointment",
            RetryPolicy::once(),
            move |args, input| {
                let store = jobs.clone();
                async move {
                    let customer_id: String = input.output(0)?;
                    let vehicle_id: String = input.output(1)?;
                    create_job_and_appointment(store.as_ref(), &args, customer_id, vehicle_id).await
                }
            },
        )
        .build()
}

/// Validate a public booking request and start the booking workflow.
pub async fn book_online(
    manager: &WorkflowManager,
    services: &ShopServices,
    args: &BookingArgs,
) -> Result<String> {
    services.limits.check_public_booking()?;

    if args.customer_info.email.trim().is_empty() {
        bail!("Customer email is required");
    }
    if args.service_ids.is_empty() {
        bail!("At least one service must be selected");
    }
    if args.total_duration_minutes <= 0 {
        bail!("Booking duration must be positive");
    }

    Ok(manager.start(args, StartOptions::new()).await?)
}

async fn create_vehicle(store: &dyn ShopStore, customer_id: &str, info: &VehicleInfo) -> Result<String> {
    store
        .insert_vehicle(Vehicle {
            id: String::new(),
            customer_id: customer_id.to_string(),
            make: info.make.clone(),
            model: info.model.clone(),
            year: info.year,
            color: info.color.clone(),
            vin: ONLINE_BOOKING_VIN.to_string(),
        })
        .await
}

async fn create_job_and_appointment(
    store: &dyn ShopStore,
    args: &BookingArgs,
    customer_id: String,
    vehicle_id: String,
) -> Result<BookingOutcome> {
    let now = Utc::now();

    let mut job_items = Vec::with_capacity(args.service_ids.len());
    for service_id in &args.service_ids {
        let service = store
            .get_service(service_id)
            .await?
            .with_context(|| format!("Service not found: {}", service_id))?;
        job_items.push(JobItem {
            id: format!("item_{}_{}", now.timestamp_millis(), service.id),
            service_id: service.id.clone(),
            quantity: 1,
            unit_price: service.base_price,
            applied_pricing_rule_ids: Vec::new(),
            added_upcharge_ids: Vec::new(),
            total: service.base_price,
        });
    }

    let job = Job {
        id: String::new(),
        customer_id: customer_id.clone(),
        vehicle_id: vehicle_id.clone(),
        status: JobStatus::WorkOrder,
        estimate_date: now,
        work_order_date: Some(now),
        total_amount: args.total_price,
        payment_received: 0.0,
        payment_status: PaymentStatus::Unpaid,
        job_items,
        customer_approval_status: ApprovalStatus::Approved,
        notes: "Booked online by customer.".to_string(),
        inventory_debited: false,
        visual_quote_photos: Vec::new(),
        visual_quote_status: None,
    };

    let appointment = Appointment {
        id: String::new(),
        job_id: String::new(),
        start_time: args.start_time,
        end_time: args.start_time + Duration::minutes(args.total_duration_minutes),
        status: AppointmentStatus::Scheduled,
        description: "Online Booking".to_string(),
        reminder_workflow_id: None,
        reminder_sent_at: None,
    };

    let (job_id, appointment_id) = store.insert_job_with_appointment(job, appointment).await?;

    Ok(BookingOutcome {
        customer_id,
        vehicle_id,
        job_id,
        appointment_id,
    })
}
