//! `register`: provisioning round trip only.

use pnplink_api::ProvisioningClient;
use pnplink_config::Settings;
use tracing::info;

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub async fn handle(settings: &Settings, global: &GlobalOpts) -> Result<(), CliError> {
    let identity = settings.identity(super::model_id(global));
    let options = settings.client_options();
    let client = ProvisioningClient::new(options.provisioning)?;

    let registration = client.register(&identity).await?;
    info!(endpoint = %registration.endpoint, "assigned");

    println!("endpoint:  {}", registration.endpoint);
    println!("device_id: {}", registration.device_id);
    Ok(())
}
