//! Websocket control channel.
//!
//! Bidirectional JSON message stream between the workbench UI and the
//! mediator. Capture events broadcast to every connected client;
//! command replies go back to the issuing client only. Commands carry a
//! `command` discriminator, events a `type` discriminator.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use veil_common::{CaptureEvent, ItemOverrides};
use veil_mediator::{Mediator, ReplayRequest};

use crate::projects::{ProjectData, ProjectStore};

/// Inbound UI commands.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ControlCommand {
    Start {
        url: String,
    },
    Stop,
    InterceptRequests {
        #[serde(default)]
        enabled: bool,
    },
    InterceptResponses {
        #[serde(default)]
        enabled: bool,
    },
    Forward {
        id: Uuid,
        #[serde(default)]
        modified: Option<ItemOverrides>,
    },
    Drop {
        id: Uuid,
    },
    Replay {
        request: ReplayRequest,
        #[serde(default, rename = "tabId")]
        tab_id: Option<Value>,
    },
    ProjectList,
    ProjectLoad {
        name: String,
    },
    ProjectSave {
        name: String,
        #[serde(default)]
        project: ProjectData,
    },
    ProjectDelete {
        name: String,
    },
}

/// The websocket control-channel server.
pub struct ControlServer {
    listen: String,
    mediator: Arc<Mediator>,
    store: Arc<ProjectStore>,
    events: broadcast::Sender<CaptureEvent>,
    cancel: CancellationToken,
}

impl ControlServer {
    pub fn new(
        listen: String,
        mediator: Arc<Mediator>,
        store: Arc<ProjectStore>,
        events: broadcast::Sender<CaptureEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            listen,
            mediator,
            store,
            events,
            cancel,
        }
    }

    /// Accept UI connections until cancelled.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen).await?;
        info!(target: "control.ws", listen = %self.listen, "control channel listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(target: "control.ws", %peer, "client connected");
                    let connection = Connection {
                        mediator: self.mediator.clone(),
                        store: self.store.clone(),
                        events: self.events.subscribe(),
                        cancel: self.cancel.child_token(),
                    };
                    tokio::spawn(async move {
                        if let Err(err) = connection.serve(stream).await {
                            debug!(target: "control.ws", %peer, %err, "client connection ended");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

struct Connection {
    mediator: Arc<Mediator>,
    store: Arc<ProjectStore>,
    events: broadcast::Receiver<CaptureEvent>,
    cancel: CancellationToken,
}

impl Connection {
    async fn serve(self, stream: TcpStream) -> anyhow::Result<()> {
        let Connection {
            mediator,
            store,
            mut events,
            cancel,
        } = self;

        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut source) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        // Writer: everything this client should see funnels through one
        // channel so replies and broadcasts cannot interleave mid-frame.
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        // Capture-event forwarder.
        let event_tx = out_tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let frame = json!({ "type": "capture", "data": event });
                        if event_tx.send(frame.to_string()).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "control.ws", skipped, "client lagged; capture events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                incoming = source.next() => match incoming {
                    None => break Ok(()),
                    Some(Err(err)) => break Err(err.into()),
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlCommand>(&text) {
                            Ok(command) => {
                                handle_command(&mediator, &store, command, &out_tx).await;
                            }
                            Err(err) => {
                                debug!(target: "control.ws", %err, "ignoring unparseable command");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => break Ok(()),
                    Some(Ok(_)) => {}
                },
            }
        };

        forwarder.abort();
        drop(out_tx);
        let _ = writer.await;
        result
    }
}

fn send(out: &mpsc::UnboundedSender<String>, frame: Value) {
    let _ = out.send(frame.to_string());
}

async fn handle_command(
    mediator: &Arc<Mediator>,
    store: &Arc<ProjectStore>,
    command: ControlCommand,
    out: &mpsc::UnboundedSender<String>,
) {
    match command {
        ControlCommand::Start { url } => {
            let mediator = mediator.clone();
            tokio::spawn(async move {
                if let Err(err) = mediator.start(&url).await {
                    warn!(target: "control.ws", %url, %err, "browser start failed");
                }
            });
        }

        ControlCommand::Stop => {
            mediator.stop().await;
        }

        ControlCommand::InterceptRequests { enabled } => {
            mediator.set_intercept_requests(enabled);
            let (requests, responses) = mediator.intercept_flags();
            send(
                out,
                json!({
                    "type": "intercept_status",
                    "intercept_requests": requests,
                    "intercept_responses": responses,
                }),
            );
        }

        ControlCommand::InterceptResponses { enabled } => {
            mediator.set_intercept_responses(enabled);
            let (requests, responses) = mediator.intercept_flags();
            send(
                out,
                json!({
                    "type": "intercept_status",
                    "intercept_requests": requests,
                    "intercept_responses": responses,
                }),
            );
        }

        ControlCommand::Forward { id, modified } => {
            let success = mediator.forward(id, modified);
            send(
                out,
                json!({ "type": "forward_result", "id": id, "success": success }),
            );
        }

        ControlCommand::Drop { id } => {
            let success = mediator.drop_item(id);
            send(
                out,
                json!({ "type": "drop_result", "id": id, "success": success }),
            );
        }

        ControlCommand::Replay { request, tab_id } => {
            // Replay can take tens of seconds; run it off the command loop
            // so verdicts and captures keep flowing meanwhile.
            let mediator = mediator.clone();
            let out = out.clone();
            tokio::spawn(async move {
                let original_id = request.id.clone();
                let response = mediator.replay(&request).await;
                send(
                    &out,
                    json!({
                        "type": "replay_response",
                        "original_id": original_id,
                        "tab_id": tab_id,
                        "response": response,
                    }),
                );
            });
        }

        ControlCommand::ProjectList => {
            send(
                out,
                json!({ "type": "project_list_result", "projects": store.list() }),
            );
        }

        ControlCommand::ProjectLoad { name } => match store.load(&name) {
            Some(project) => {
                // A loaded project's rules replace the active set atomically.
                mediator.replace_rules(project.match_replace_rules.clone());
                send(out, json!({ "type": "project_loaded", "project": project }));
            }
            None => {
                send(
                    out,
                    json!({ "type": "project_loaded", "error": "Project not found" }),
                );
            }
        },

        ControlCommand::ProjectSave { name, project } => {
            let rules = project.match_replace_rules.clone();
            let success = match store.upsert(&name, project) {
                Ok(_) => {
                    mediator.replace_rules(rules);
                    true
                }
                Err(err) => {
                    warn!(target: "projects.store", %name, %err, "project save failed");
                    false
                }
            };
            send(
                out,
                json!({ "type": "project_saved", "name": name, "success": success }),
            );
        }

        ControlCommand::ProjectDelete { name } => {
            let success = store.delete(&name);
            send(
                out,
                json!({ "type": "project_deleted", "name": name, "success": success }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_deserialize_from_ui_wire_shapes() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"command":"start","url":"https://example.com"}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::Start { url } if url == "https://example.com"));

        let cmd: ControlCommand =
            serde_json::from_str(r#"{"command":"intercept_requests","enabled":true}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::InterceptRequests { enabled: true }));

        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"command":"forward","id":"{id}","modified":{{"method":"POST","body":"hi"}}}}"#
        );
        let cmd: ControlCommand = serde_json::from_str(&raw).unwrap();
        match cmd {
            ControlCommand::Forward { id: got, modified } => {
                assert_eq!(got, id);
                let modified = modified.unwrap();
                assert_eq!(modified.method.as_deref(), Some("POST"));
                assert_eq!(modified.body.as_deref(), Some("hi"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn replay_command_keeps_tab_and_request_ids() {
        let raw = r#"{
            "command": "replay",
            "tabId": 7,
            "request": {
                "id": "abc-123",
                "method": "POST",
                "url": "https://a.example/api",
                "headers": {"Cookie": "sid=1"},
                "body": "{}"
            }
        }"#;
        let cmd: ControlCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            ControlCommand::Replay { request, tab_id } => {
                assert_eq!(tab_id, Some(json!(7)));
                assert_eq!(request.id, Some(json!("abc-123")));
                assert_eq!(request.method, "POST");
                assert_eq!(request.headers["Cookie"], "sid=1");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn replay_request_defaults_method_to_get() {
        let raw = r#"{"command":"replay","request":{"url":"https://a.example/"}}"#;
        let cmd: ControlCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            ControlCommand::Replay { request, tab_id } => {
                assert_eq!(request.method, "GET");
                assert!(tab_id.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn project_save_parses_nested_payload() {
        let raw = r#"{
            "command": "project_save",
            "name": "demo",
            "project": {
                "targetUrl": "https://t.example",
                "hideStatic": true,
                "matchReplaceRules": [
                    {"item": "Request header", "match": "a", "replace": "b"}
                ]
            }
        }"#;
        let cmd: ControlCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            ControlCommand::ProjectSave { name, project } => {
                assert_eq!(name, "demo");
                assert_eq!(project.target_url, "https://t.example");
                assert!(project.hide_static);
                assert_eq!(project.match_replace_rules.len(), 1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
