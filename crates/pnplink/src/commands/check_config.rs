//! `check-config`: print the effective settings.

use pnplink_config::Settings;

use crate::error::CliError;

pub fn handle(settings: &Settings) -> Result<(), CliError> {
    match settings.source() {
        Some(path) => println!("# source: {}", path.display()),
        None => println!("# source: environment only"),
    }
    print!("{}", settings.to_toml()?);
    Ok(())
}
