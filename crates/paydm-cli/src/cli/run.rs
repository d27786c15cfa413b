use anyhow::Result;
use paydm_core::{PayDmAgent, SettingsStorage};
use tracing::info;

/// Run the agent on a fresh tokio runtime until Ctrl-C.
#[tokio::main]
pub async fn run_agent(storage: SettingsStorage) -> Result<()> {
    info!(settings = %storage.path().display(), "Loaded settings");
    let agent = PayDmAgent::new(storage)?;
    agent.run().await
}
