//! `run`: provision, connect and keep the gateway reporting.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pnplink_api::{DeviceModel, PnpClient, Session};
use pnplink_config::Settings;

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;
use crate::model::GatewayModel;

pub async fn handle(
    settings: Arc<Settings>,
    args: RunArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let restart = CancellationToken::new();
    let model = Arc::new(
        GatewayModel::new(Arc::clone(&settings), restart.clone())
            .with_model_id(super::model_id(global))
            .with_thermal_zone(args.thermal_zone),
    );
    let client = PnpClient::new(
        settings.identity(super::model_id(global)),
        Arc::clone(&model) as Arc<dyn DeviceModel>,
        settings.client_options(),
    )?;

    // The first session must come up; later losses are retried per tick.
    let mut session = Some(client.auth_and_connect().await?);
    model.sense().await;

    let mut sense_every = settings.thermalsense_interval();
    let mut sense = ticker(sense_every);
    let mut send = ticker(settings.send_interval());

    let stop = interrupt_token();

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => {
                info!("interrupted; shutting down");
                break;
            }
            () = restart.cancelled() => {
                info!("restart requested; shutting down");
                break;
            }
            _ = sense.tick() => {
                model.sense().await;
                let wanted = settings.thermalsense_interval();
                if wanted != sense_every {
                    debug!(secs = wanted.as_secs(), "rescheduling temperature sampling");
                    sense_every = wanted;
                    sense = ticker(wanted);
                }
            }
            _ = send.tick() => {
                // Reconnecting can take a full provisioning round; stay
                // responsive to shutdown meanwhile.
                let tick = send_tick(&client, &model, &mut session);
                if until_stopped(&stop, &restart, tick).await.is_none() {
                    debug!("send tick abandoned for shutdown");
                }
            }
        }
    }

    if let Some(active) = session {
        active.shutdown().await;
    }
    Ok(())
}

/// Cancelled on the first Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let stop = CancellationToken::new();
    let token = stop.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "signal handler failed");
        }
        token.cancel();
    });
    stop
}

/// Drive `work` unless either token fires first.
async fn until_stopped<T>(
    stop: &CancellationToken,
    restart: &CancellationToken,
    work: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        () = stop.cancelled() => None,
        () = restart.cancelled() => None,
        out = work => Some(out),
    }
}

async fn send_tick(client: &PnpClient, model: &GatewayModel, session: &mut Option<Session>) {
    ensure_session(client, session).await;
    if let (Some(active), Some(doc)) = (session.as_ref(), model.telemetry()) {
        match active.send_telemetry(&doc).await {
            Ok(true) => debug!("telemetry delivered"),
            Ok(false) => warn!("telemetry not delivered; session is down"),
            Err(e) => warn!(error = %e, "telemetry failed"),
        }
    }
}

/// First tick one period from now.
fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Keep a live session, re-provisioning when the current one is gone or
/// has been demoted.
async fn ensure_session(client: &PnpClient, session: &mut Option<Session>) {
    if session.as_ref().is_some_and(Session::is_connected) {
        return;
    }
    if let Some(stale) = session.take() {
        info!(state = %stale.state(), "session lost; re-provisioning");
        stale.shutdown().await;
    }

    match client.auth_and_connect().await {
        Ok(fresh) => {
            info!(endpoint = fresh.endpoint(), "reconnected");
            *session = Some(fresh);
        }
        Err(e) => warn!(error = %e, "re-provisioning failed; retrying next interval"),
    }
}
