//! Delivery tracking — frozen rosters, per-recipient state, retrying
//! transport dispatch and the inbound delivery event feed.

pub mod events;
pub mod feed;
pub mod recipient;
pub mod retry;
pub mod tracker;
pub mod transport;

pub use events::{DeliveryEvent, DeliveryEventKind};
pub use feed::{DeliveryEventFeed, DeliveryEventHandler};
pub use recipient::{Recipient, RecipientSeed, RecipientStatus};
pub use retry::RetryPolicy;
pub use tracker::{DeliveryTracker, IngestOutcome};
pub use transport::{
    dispatch_with_retry, DispatchResult, LogTransport, OutboundMessage, RecordingTransport,
    SendOutcome, Transport, TransportError,
};
