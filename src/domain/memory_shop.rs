use std::collections::BTreeMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::collaborators::ShopStore;
use crate::domain::records::*;

#[derive(Default)]
struct ShopData {
    company: Company,
    customers: BTreeMap<String, Customer>,
    vehicles: BTreeMap<String, Vehicle>,
    services: BTreeMap<String, Service>,
    upcharges: BTreeMap<String, Upcharge>,
    jobs: BTreeMap<String, Job>,
    appointments: BTreeMap<String, Appointment>,
    campaigns: BTreeMap<String, Campaign>,
    messages: Vec<CommunicationLog>,
}

/// In-memory [`ShopStore`]. One lock around all tables keeps every call
/// transactional.
#[derive(Default)]
pub struct MemoryShopStore {
    data: Mutex<ShopData>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl MemoryShopStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_company(&self, company: Company) {
        self.data.lock().await.company = company;
    }

    /// Seed a catalog service; its id is kept as given.
    pub async fn add_service(&self, service: Service) {
        self.data
            .lock()
            .await
            .services
            .insert(service.id.clone(), service);
    }

    /// Seed a catalog upcharge; its id is kept as given.
    pub async fn add_upcharge(&self, upcharge: Upcharge) {
        self.data
            .lock()
            .await
            .upcharges
            .insert(upcharge.id.clone(), upcharge);
    }

    /// Seed a job directly, keeping its id.
    pub async fn add_job(&self, job: Job) {
        self.data.lock().await.jobs.insert(job.id.clone(), job);
    }

    /// Seed an appointment directly, keeping its id.
    pub async fn add_appointment(&self, appointment: Appointment) {
        self.data
            .lock()
            .await
            .appointments
            .insert(appointment.id.clone(), appointment);
    }

    pub async fn vehicles(&self) -> Vec<Vehicle> {
        self.data.lock().await.vehicles.values().cloned().collect()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.data.lock().await.jobs.values().cloned().collect()
    }

    pub async fn appointments(&self) -> Vec<Appointment> {
        self.data
            .lock()
            .await
            .appointments
            .values()
            .cloned()
            .collect()
    }

    pub async fn campaigns(&self) -> Vec<Campaign> {
        self.data.lock().await.campaigns.values().cloned().collect()
    }

    pub async fn messages(&self) -> Vec<CommunicationLog> {
        self.data.lock().await.messages.clone()
    }
}

#[async_trait]
impl ShopStore for MemoryShopStore {
    async fn company(&self) -> Result<Company> {
        Ok(self.data.lock().await.company.clone())
    }

    async fn find_or_insert_customer(&self, info: &CustomerInfo) -> Result<String> {
        let mut data = self.data.lock().await;
        if let Some(existing) = data.customers.values().find(|c| c.email == info.email) {
            return Ok(existing.id.clone());
        }

        let id = new_id();
        data.customers.insert(
            id.clone(),
            Customer {
                id: id.clone(),
                name: info.name.clone(),
                email: info.email.clone(),
                phone: info.phone.clone(),
            },
        );
        Ok(id)
    }

    async fn get_customer(&self, id: &str) -> Result<Option<Customer>> {
        Ok(self.data.lock().await.customers.get(id).cloned())
    }

    async fn list_customers(&self) -> Result<Vec<Customer>> {
        Ok(self.data.lock().await.customers.values().cloned().collect())
    }

    async fn insert_customer(&self, info: &CustomerInfo) -> Result<String> {
        let id = new_id();
        let customer = Customer {
            id: id.clone(),
            name: info.name.clone(),
            email: info.email.clone(),
            phone: info.phone.clone(),
        };
        self.data.lock().await.customers.insert(id.clone(), customer);
        Ok(id)
    }

    async fn insert_vehicle(&self, mut vehicle: Vehicle) -> Result<String> {
        let mut data = self.data.lock().await;
        if !data.customers.contains_key(&vehicle.customer_id) {
            bail!("Customer not found: {}", vehicle.customer_id);
        }
        vehicle.id = new_id();
        let id = vehicle.id.clone();
        data.vehicles.insert(id.clone(), vehicle);
        Ok(id)
    }

    async fn get_service(&self, id: &str) -> Result<Option<Service>> {
        Ok(self.data.lock().await.services.get(id).cloned())
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.data.lock().await.services.values().cloned().collect())
    }

    async fn list_upcharges(&self) -> Result<Vec<Upcharge>> {
        Ok(self.data.lock().await.upcharges.values().cloned().collect())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.data.lock().await.jobs.get(id).cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut data = self.data.lock().await;
        match data.jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => bail!("Job not found: {}", job.id),
        }
    }

    async fn insert_job_with_appointment(
        &self,
        mut job: Job,
        mut appointment: Appointment,
    ) -> Result<(String, String)> {
        let mut data = self.data.lock().await;
        job.id = new_id();
        appointment.id = new_id();
        appointment.job_id = job.id.clone();
        let ids = (job.id.clone(), appointment.id.clone());
        data.jobs.insert(job.id.clone(), job);
        data.appointments.insert(appointment.id.clone(), appointment);
        Ok(ids)
    }

    async fn get_appointment(&self, id: &str) -> Result<Option<Appointment>> {
        Ok(self.data.lock().await.appointments.get(id).cloned())
    }

    async fn set_reminder_workflow_id(
        &self,
        appointment_id: &str,
        workflow_id: &str,
    ) -> Result<()> {
        let mut data = self.data.lock().await;
        match data.appointments.get_mut(appointment_id) {
            Some(appointment) => {
                appointment.reminder_workflow_id = Some(workflow_id.to_string());
                Ok(())
            }
            None => bail!("Appointment not found: {}", appointment_id),
        }
    }

    async fn mark_reminder_sent(&self, appointment_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut data = self.data.lock().await;
        match data.appointments.get_mut(appointment_id) {
            Some(appointment) => {
                appointment.reminder_sent_at = Some(at);
                Ok(())
            }
            None => bail!("Appointment not found: {}", appointment_id),
        }
    }

    async fn appointments_for_reminder(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Appointment>> {
        let data = self.data.lock().await;
        Ok(data
            .appointments
            .values()
            .filter(|a| {
                a.start_time >= start
                    && a.start_time <= end
                    && a.reminder_sent_at.is_none()
                    && a.status == AppointmentStatus::Scheduled
            })
            .cloned()
            .collect())
    }

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        Ok(self.data.lock().await.campaigns.get(id).cloned())
    }

    async fn insert_campaign(&self, mut campaign: Campaign) -> Result<String> {
        campaign.id = new_id();
        let id = campaign.id.clone();
        self.data.lock().await.campaigns.insert(id.clone(), campaign);
        Ok(id)
    }

    async fn update_campaign(&self, campaign: &Campaign) -> Result<()> {
        let mut data = self.data.lock().await;
        match data.campaigns.get_mut(&campaign.id) {
            Some(existing) => {
                *existing = campaign.clone();
                Ok(())
            }
            None => bail!("Campaign not found: {}", campaign.id),
        }
    }

    async fn log_message(
        &self,
        job_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<()> {
        self.data.lock().await.messages.push(CommunicationLog {
            id: new_id(),
            job_id: job_id.to_string(),
            content: content.to_string(),
            message_type,
            method: "email".to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}
