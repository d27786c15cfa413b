pub mod address;
pub mod agent;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod nostr;
pub mod policy;
pub mod reconcile;
pub mod settings;
pub mod tracing_setup;

pub use address::{issue_next_address, AddressScheme, IssuedAddress};
pub use agent::{process_batch, CycleSummary, PayDmAgent, SessionLedger};
pub use dispatch::{DispatchOutcome, OutboundReply, ReplyDispatcher, ReplyPublisher};
pub use error::{AddressError, DecryptError, DispatchError, FeedError, SettingsError};
pub use models::{DmEvent, PendingRequest};
pub use policy::{decide_reply, ReplyIntent};
pub use reconcile::{reconcile, Decryptor};
pub use settings::{Settings, SettingsStorage};
