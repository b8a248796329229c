pub mod booking;
pub mod campaign;
pub mod collaborators;
pub mod limits;
pub mod memory_shop;
pub mod records;
pub mod reminder;
pub mod visual_quote;

use std::sync::Arc;

use crate::domain::collaborators::{ContentGenerator, Mailer, ShopStore};
use crate::domain::limits::RateLimits;
use crate::engine::{WorkflowError, WorkflowManager};

/// Collaborators shared by every shop workflow.
#[derive(Clone)]
pub struct ShopServices {
    pub store: Arc<dyn ShopStore>,
    pub mailer: Arc<dyn Mailer>,
    pub content: Arc<dyn ContentGenerator>,
    pub limits: Arc<RateLimits>,
}

/// Register all shop workflows and their completion handlers.
pub fn register_all(manager: &WorkflowManager, services: &ShopServices) -> Result<(), WorkflowError> {
    manager.define(booking::definition(services))?;
    manager.define(visual_quote::definition(services))?;
    manager.define(campaign::generation_definition(services))?;
    manager.define(campaign::send_definition(services))?;
    manager.define(reminder::definition(services))?;

    manager.register_handler(Arc::new(visual_quote::VisualQuoteCompletion {
        store: services.store.clone(),
    }));
    manager.register_handler(Arc::new(campaign::CampaignGenerationCompletion {
        store: services.store.clone(),
    }));
    manager.register_handler(Arc::new(campaign::CampaignSentCompletion {
        store: services.store.clone(),
    }));
    manager.register_handler(Arc::new(reminder::ReminderCompletion {
        store: services.store.clone(),
    }));

    Ok(())
}
