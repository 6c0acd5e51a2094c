//! Clap derive structures for the `pnplink` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// pnplink -- plug-and-play gateway agent for cloud device hubs
#[derive(Debug, Parser)]
#[command(
    name = "pnplink",
    version,
    about = "Provision a gateway and stream its telemetry to a cloud device hub",
    long_about = "Registers the gateway with the device provisioning service, opens an\n\
        authenticated session to the assigned hub, keeps device-twin properties in\n\
        sync, answers direct methods and sends periodic telemetry.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Settings file (TOML, or JSON when the extension is .json)
    #[arg(long, short = 'c', env = "PNPLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Model id announced to the provisioning service and hub
    #[arg(long, env = "PNPLINK_MODEL_ID", global = true)]
    pub model_id: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Provision, connect and run the gateway until interrupted
    Run(RunArgs),

    /// Register with the provisioning service and print the assignment
    Register,

    /// Validate settings and print the effective values
    #[command(alias = "check")]
    CheckConfig,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Thermal zone file reporting the SoC temperature in millidegrees
    #[arg(long, value_name = "PATH", default_value = crate::model::DEFAULT_THERMAL_ZONE)]
    pub thermal_zone: PathBuf,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["pnplink", "run", "-vv", "--config", "/tmp/s.toml"]).unwrap();
        assert_eq!(cli.global.verbose, 2);
        assert_eq!(cli.global.config, Some(PathBuf::from("/tmp/s.toml")));
        match cli.command {
            Command::Run(args) => assert_eq!(
                args.thermal_zone,
                PathBuf::from(crate::model::DEFAULT_THERMAL_ZONE)
            ),
            other => panic!("expected run, got {other:?}"),
        }
    }
}
