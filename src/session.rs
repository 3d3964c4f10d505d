// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection WebSocket session state machine: Connecting -> Idle,
//! with subscribe/resolution/historical-request handlers and error
//! frames on protocol faults rather than connection drops.

use crate::dispatcher::Dispatcher;
use crate::historical::run_historical_query;
use crate::protocol::{ClientMessage, ServerMessage};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub struct ClientSession {
    dispatcher: Arc<Dispatcher>,
    conn_id: String,
}

impl ClientSession {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let conn_id = Uuid::new_v4().to_string()[..8].to_string();
        info!("[{}] new session", conn_id);
        Self { dispatcher, conn_id }
    }

    pub async fn run(self, socket: WebSocket) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut ws_tx, mut ws_rx) = socket.split();

        let welcome = serde_json::to_string(&ServerMessage::ConnectInit)?;
        ws_tx.send(Message::Text(welcome)).await?;

        let mut rx = self.dispatcher.fanout.register_client(&self.conn_id);
        let tx = self
            .dispatcher
            .fanout
            .clone_sender(&self.conn_id)
            .expect("just-registered client must have a sender");

        let conn_id = self.conn_id.clone();
        let forward = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json)).await.is_err() {
                            debug!("[{}] send failed, closing", conn_id);
                            break;
                        }
                    }
                    Err(e) => error!("[{}] failed to serialize frame: {}", conn_id, e),
                }
            }
        });

        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Err(e) = self.handle_message(&text, &tx).await {
                        warn!("[{}] error handling message: {}", self.conn_id, e);
                        let _ = tx.send(ServerMessage::error(e.to_string())).await;
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("[{}] client closed connection", self.conn_id);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Binary(_)) => {
                    warn!("[{}] binary frames not supported", self.conn_id);
                }
                Err(e) => {
                    error!("[{}] transport error: {}", self.conn_id, e);
                    break;
                }
            }
        }

        forward.abort();
        self.dispatcher.fanout.remove_client(&self.conn_id);
        info!("[{}] session ended", self.conn_id);
        Ok(())
    }

    async fn handle_message(
        &self,
        text: &str,
        tx: &tokio::sync::mpsc::Sender<ServerMessage>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                tx.send(ServerMessage::error(format!("invalid message: {e}")))
                    .await?;
                return Ok(());
            }
        };

        match msg {
            ClientMessage::SubscribeStations { stations } => {
                self.dispatcher.registry.subscribe(&self.conn_id, stations);
            }
            ClientMessage::SetDisplayResolution { width } => {
                self.dispatcher.registry.set_resolution(&self.conn_id, width);
            }
            ClientMessage::RequestHistoricalData {
                stations,
                window_seconds,
            } => {
                self.spawn_historical_query(stations, window_seconds, tx.clone());
            }
        }
        Ok(())
    }

    /// Spawns the HQ job as an ephemeral task for this connection; frames
    /// stream over the same send queue as the live path and are tagged by
    /// `event`, so they interleave naturally.
    fn spawn_historical_query(
        &self,
        stations: Vec<String>,
        window_seconds: u64,
        tx: tokio::sync::mpsc::Sender<ServerMessage>,
    ) {
        let dispatcher = self.dispatcher.clone();
        let conn_id = self.conn_id.clone();
        let width_px = self.dispatcher.registry.display_width_px(&self.conn_id);

        tokio::spawn(async move {
            let bus = dispatcher.bus.clone();
            let now = now_secs();
            if let Err(e) = run_historical_query(
                bus.as_ref(),
                &dispatcher.signal,
                &dispatcher.calibration,
                stations,
                window_seconds,
                dispatcher.config.historical_retention_sec,
                width_px,
                now,
                &tx,
            )
            .await
            {
                warn!("[{}] historical query failed: {}", conn_id, e);
                let _ = tx.send(ServerMessage::error(e.to_string())).await;
            }
        });
    }
}
