pub mod commands;
pub mod run;

pub use commands::{
    add_relay, clear_relays, next_address, set_campaign_message, set_scheme, set_xpub, show,
};
pub use run::run_agent;
