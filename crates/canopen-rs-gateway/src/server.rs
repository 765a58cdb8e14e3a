// crates/canopen-rs-gateway/src/server.rs

//! The axum router and the executor thread that serializes gateway
//! requests onto the master's single-in-flight SDO client.

use crate::command::{self, GatewayRequest, Token};
use crate::error::GatewayError;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use canopen_rs::Network;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// How long a handler waits for the executor before reporting a gateway
/// time-out (SDO timeouts surface earlier through the client itself).
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of one executed request.
#[derive(Debug)]
pub enum GatewayReply {
    Ok,
    Data(Vec<u8>),
    Err(GatewayError),
}

type Job = (GatewayRequest, Sender<GatewayReply>);

/// Executes gateway requests one at a time on a dedicated thread, keeping
/// the blocking SDO calls out of the async runtime.
#[derive(Clone)]
pub struct Executor {
    tx: Sender<Job>,
}

impl Executor {
    pub fn spawn(network: Arc<Network>) -> Executor {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = unbounded();
        std::thread::spawn(move || {
            for (request, reply_tx) in rx.iter() {
                let reply = Self::run(&network, request);
                let _ = reply_tx.send(reply);
            }
        });
        Executor { tx }
    }

    fn run(network: &Network, request: GatewayRequest) -> GatewayReply {
        match request {
            GatewayRequest::Nmt { target, command } => match network.nmt_command(command, target) {
                Ok(()) => GatewayReply::Ok,
                Err(e) => GatewayReply::Err(e.into()),
            },
            GatewayRequest::Read {
                node,
                index,
                sub_index,
            } => match network.read(node, index, sub_index) {
                Ok(data) => GatewayReply::Data(data),
                Err(e) => GatewayReply::Err(e.into()),
            },
            GatewayRequest::Write {
                node,
                index,
                sub_index,
                data,
            } => match network.write(node, index, sub_index, &data, false) {
                Ok(()) => GatewayReply::Ok,
                Err(e) => GatewayReply::Err(e.into()),
            },
        }
    }

    pub fn execute(&self, request: GatewayRequest) -> GatewayReply {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send((request, reply_tx)).is_err() {
            return GatewayReply::Err(GatewayError::Internal);
        }
        match reply_rx.recv_timeout(EXECUTE_TIMEOUT) {
            Ok(reply) => reply,
            Err(_) => GatewayReply::Err(GatewayError::Timeout),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub executor: Executor,
    pub default_node: Option<u8>,
}

/// Builds the CiA 309-5 router.
pub fn router(executor: Executor, default_node: Option<u8>) -> Router {
    Router::new()
        .route(
            "/cia309-5/1.0/{sequence}/{net}/{node}/{*command}",
            any(handle_command),
        )
        .with_state(AppState {
            executor,
            default_node,
        })
}

async fn handle_command(
    State(state): State<AppState>,
    Path((sequence, net, node, command)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Response {
    info!("gateway request {}: {}/{}/{}", sequence, net, node, command);
    match process(&state, &net, &node, &command, &body).await {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => {
            warn!("gateway request {} failed: {:?}", sequence, e);
            (StatusCode::OK, Json(e.to_json())).into_response()
        }
    }
}

async fn process(
    state: &AppState,
    net: &str,
    node: &str,
    command: &str,
    body: &Bytes,
) -> Result<serde_json::Value, GatewayError> {
    command::resolve_net(Token::parse(net)?)?;
    let node_token = Token::parse(node)?;
    let body = if body.is_empty() {
        None
    } else {
        Some(body.as_ref())
    };
    let request = command::parse_command(node_token, state.default_node, command, body)?;

    let executor = state.executor.clone();
    let reply = tokio::task::spawn_blocking(move || executor.execute(request))
        .await
        .map_err(|_| GatewayError::Internal)?;

    match reply {
        GatewayReply::Ok => Ok(json!({ "response": "OK" })),
        GatewayReply::Data(data) => Ok(json!({ "data": command::format_data(&data) })),
        GatewayReply::Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopen_rs::BusManager;
    use canopen_rs::hal::{CanInterface, CanOpenError};
    use canopen_rs::CanFrame;
    use std::sync::Mutex;

    struct CaptureDriver {
        frames: Arc<Mutex<Vec<CanFrame>>>,
    }
    impl CanInterface for CaptureDriver {
        fn connect(&mut self) -> Result<(), CanOpenError> {
            Ok(())
        }
        fn send(&mut self, frame: &CanFrame) -> Result<(), CanOpenError> {
            self.frames.lock().unwrap().push(*frame);
            Ok(())
        }
    }

    fn executor() -> (Executor, Arc<Mutex<Vec<CanFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let bus = Arc::new(BusManager::new(Box::new(CaptureDriver {
            frames: frames.clone(),
        })));
        let network = Arc::new(Network::new(bus));
        (Executor::spawn(network), frames)
    }

    #[test]
    fn test_nmt_request_reaches_the_wire() {
        let (executor, frames) = executor();
        let reply = executor.execute(GatewayRequest::Nmt {
            target: 0x10,
            command: canopen_rs::nmt::NmtCommand::EnterOperational,
        });
        assert!(matches!(reply, GatewayReply::Ok));
        let sent = frames.lock().unwrap();
        assert_eq!(sent[0].ident, 0x000);
        assert_eq!(sent[0].payload(), &[1, 0x10]);
    }

    #[test]
    fn test_read_without_peer_reports_sdo_abort() {
        let (executor, _frames) = executor();
        let reply = executor.execute(GatewayRequest::Read {
            node: 0x10,
            index: 0x1000,
            sub_index: 0,
        });
        match reply {
            GatewayReply::Err(GatewayError::SdoAbort(code)) => {
                assert_eq!(code, canopen_rs::sdo::ABORT_TIMEOUT);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
