pub mod cipher;
pub mod feed;
pub mod publisher;

pub use cipher::Nip04Cipher;
pub use feed::{dm_filters, RelayFeed};
pub use publisher::{build_reply_event, NostrReplyPublisher};
