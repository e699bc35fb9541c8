//! Campaign analytics — divide-by-zero safe delivery rates and the trailing
//! store overview.

pub mod overview;
pub mod rates;

pub use overview::{CampaignSnapshot, StoreOverview};
pub use rates::{rate, to_percent, CampaignRates, CampaignReport};
