//! Shared foundation for the outreach campaign engine: configuration, error
//! taxonomy, customer records, time source and the engine event bus.

pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod records;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{CampaignError, CampaignResult};
pub use records::{CustomerStore, InMemoryCustomerStore};
pub use types::{CustomerId, CustomerRecord, DeliveryCounters, StoreId};
