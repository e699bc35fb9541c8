//! Campaign management — recipient resolution, the send lifecycle state
//! machine, bounded dispatch and per-campaign reporting.

pub mod dispatcher;
pub mod lifecycle;
pub mod manager;
pub mod models;
pub mod resolver;
pub mod store;

pub use lifecycle::{check_transition, CampaignTrigger};
pub use manager::CampaignManager;
pub use models::*;
pub use resolver::RecipientResolver;
pub use store::CampaignStore;
