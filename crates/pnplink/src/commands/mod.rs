//! Subcommand handlers.

pub mod check_config;
pub mod register;
pub mod run;

use std::sync::Arc;

use pnplink_config::Settings;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;
use crate::model;

pub async fn dispatch(cmd: Command, global: &GlobalOpts) -> Result<(), CliError> {
    let settings = Arc::new(Settings::load(global.config.as_deref())?);
    tracing::debug!(command = ?cmd, source = ?settings.source(), "settings loaded");

    match cmd {
        Command::Run(args) => run::handle(settings, args, global).await,
        Command::Register => register::handle(&settings, global).await,
        Command::CheckConfig => check_config::handle(&settings),
    }
}

/// Model id from `--model-id`, or the gateway model's own.
pub(crate) fn model_id(global: &GlobalOpts) -> &str {
    global.model_id.as_deref().unwrap_or(model::MODEL_ID)
}
