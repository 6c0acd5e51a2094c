// Handler behavior over a channel-backed link. The fake hub stamps each
// frame as it is "transmitted" so ordering against side effects can be
// checked.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;

use pnplink_api::message::OutboundFrame;
use pnplink_api::{
    CommandDispatcher, CommandOutcome, DeviceModel, DispatchError, Link, MethodRequest,
    PatchHandler, PropertyError, PropertyPatch, SendError,
};

// ── Fake hub ────────────────────────────────────────────────────────

type Transmitted = Arc<Mutex<Vec<(Instant, OutboundFrame)>>>;

/// Answer every frame with `reply` and record when it was taken.
fn fake_hub(reply: fn() -> Result<(), SendError>) -> (Link, Transmitted, JoinHandle<()>) {
    let (link, mut rx) = Link::channel(Duration::from_secs(5));
    let log: Transmitted = Arc::default();
    let sink = Arc::clone(&log);
    let task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            sink.lock()
                .unwrap()
                .push((Instant::now(), outbound.frame.clone()));
            outbound.complete(reply());
        }
    });
    (link, log, task)
}

fn accept() -> Result<(), SendError> {
    Ok(())
}

fn throttle() -> Result<(), SendError> {
    Err(SendError::Rejected {
        status: 429,
        message: "throttled".into(),
    })
}

// ── Test model ──────────────────────────────────────────────────────

#[derive(Default)]
struct Panel {
    brightness: Mutex<i64>,
    restarted_at: Arc<Mutex<Option<Instant>>>,
}

#[async_trait]
impl DeviceModel for Panel {
    fn model_id(&self) -> &str {
        "dtmi:pnplink:panel;1"
    }

    fn props(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("brightness".into(), json!(*self.brightness.lock().unwrap()));
        props
    }

    fn set_prop(&self, name: &str, value: Value) -> Result<Value, PropertyError> {
        if name != "brightness" {
            return Err(PropertyError::Unknown(name.into()));
        }
        let v = value.as_i64().ok_or_else(|| PropertyError::InvalidValue {
            name: name.into(),
            reason: "expected an integer".into(),
        })?;
        *self.brightness.lock().unwrap() = v.clamp(0, 100);
        Ok(json!(v.clamp(0, 100)))
    }

    async fn execute_command(
        &self,
        name: &str,
        _payload: Value,
    ) -> Result<CommandOutcome, DispatchError> {
        match name {
            "restart" => {
                let stamp = Arc::clone(&self.restarted_at);
                Ok(CommandOutcome::succeeded().then(move || {
                    *stamp.lock().unwrap() = Some(Instant::now());
                }))
            }
            "info" => Ok(CommandOutcome::data(json!({"firmware": "1.2.0"}))),
            _ => Ok(CommandOutcome::unknown()),
        }
    }
}

fn request(name: &str) -> MethodRequest {
    MethodRequest {
        request_id: format!("req-{name}"),
        name: name.into(),
        payload: Value::Null,
    }
}

// ── Direct methods ──────────────────────────────────────────────────

#[tokio::test]
async fn test_post_action_runs_after_response_transmit() {
    let panel = Arc::new(Panel::default());
    let stamp = Arc::clone(&panel.restarted_at);
    let (link, log, _hub) = fake_hub(accept);

    CommandDispatcher::new(panel)
        .handle(&link, request("restart"))
        .await
        .unwrap();

    let transmitted = log.lock().unwrap();
    assert_eq!(transmitted.len(), 1);
    let (sent_at, frame) = &transmitted[0];
    assert_eq!(
        serde_json::to_value(frame).unwrap(),
        json!({
            "type": "methodResponse",
            "requestId": "req-restart",
            "status": 200,
            "payload": {"result": true, "data": "restart is succeeded"}
        })
    );
    let ran_at = stamp.lock().unwrap().expect("post-action did not run");
    assert!(ran_at >= *sent_at);
}

#[tokio::test]
async fn test_data_result_is_returned_verbatim() {
    let (link, log, _hub) = fake_hub(accept);
    CommandDispatcher::new(Arc::new(Panel::default()))
        .handle(&link, request("info"))
        .await
        .unwrap();

    let transmitted = log.lock().unwrap();
    match &transmitted[0].1 {
        OutboundFrame::MethodResponse { status, payload, .. } => {
            assert_eq!(*status, 200);
            assert_eq!(*payload, json!({"result": true, "data": {"firmware": "1.2.0"}}));
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_method_has_no_side_effects() {
    let panel = Arc::new(Panel::default());
    let stamp = Arc::clone(&panel.restarted_at);
    let (link, log, _hub) = fake_hub(accept);

    CommandDispatcher::new(panel)
        .handle(&link, request("launch"))
        .await
        .unwrap();

    match &log.lock().unwrap()[0].1 {
        OutboundFrame::MethodResponse { status, payload, .. } => {
            assert_eq!(*status, 400);
            assert_eq!(*payload, json!({"result": false, "data": "unknown method"}));
        }
        other => panic!("unexpected frame {other:?}"),
    }
    assert!(stamp.lock().unwrap().is_none());
}

// ── Desired properties ──────────────────────────────────────────────

#[tokio::test]
async fn test_each_patch_produces_one_update() {
    let panel = Arc::new(Panel::default());
    let handler = PatchHandler::new(Arc::clone(&panel) as Arc<dyn DeviceModel>);
    let (link, log, _hub) = fake_hub(accept);

    for (version, value) in [(1, 40), (2, 140)] {
        let patch = PropertyPatch::from_value(json!({"$version": version, "brightness": value}))
            .unwrap();
        handler.handle(&link, patch).await.unwrap();
    }

    let bodies: Vec<Value> = log
        .lock()
        .unwrap()
        .iter()
        .map(|(_, frame)| match frame {
            OutboundFrame::ReportedPatch { body, .. } => body.clone(),
            other => panic!("unexpected frame {other:?}"),
        })
        .collect();
    assert_eq!(
        bodies,
        vec![
            json!({"brightness": {"ac": 200, "ad": "Successfully executed patch", "av": 1, "value": 40}}),
            json!({"brightness": {"ac": 200, "ad": "Successfully executed patch", "av": 2, "value": 100}}),
        ]
    );
    assert_eq!(*panel.brightness.lock().unwrap(), 100);
}

#[tokio::test]
async fn test_rejected_properties_still_batch() {
    let (link, log, _hub) = fake_hub(accept);
    let handler = PatchHandler::new(Arc::new(Panel::default()));
    let patch = PropertyPatch::from_value(json!({
        "$version": 9,
        "brightness": "max",
        "contrast": 3
    }))
    .unwrap();

    handler.handle(&link, patch).await.unwrap();

    let transmitted = log.lock().unwrap();
    assert_eq!(transmitted.len(), 1);
    match &transmitted[0].1 {
        OutboundFrame::ReportedPatch { body, .. } => {
            assert_eq!(body["brightness"]["ac"], 400);
            assert_eq!(body["brightness"]["value"], 0);
            assert_eq!(body["contrast"]["ad"], "Unknown property: contrast");
            assert_eq!(body["contrast"]["value"], Value::Null);
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn test_rejected_update_surfaces_error() {
    let (link, _log, _hub) = fake_hub(throttle);
    let handler = PatchHandler::new(Arc::new(Panel::default()));
    let patch = PropertyPatch::from_value(json!({"$version": 1, "brightness": 5})).unwrap();

    let err = handler.handle(&link, patch).await.unwrap_err();
    assert!(matches!(err, SendError::Rejected { status: 429, .. }));
}
