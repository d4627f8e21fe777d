// StepSnap - Execution snapshot recorder for debug adapters
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Debug client over a TCP connection
//!
//! A reader task owns the read half of the socket. Responses are routed to the
//! waiting request through a per-request oneshot channel, events and reverse
//! requests go to the [`EventHub`].

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::oneshot,
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, trace, warn};

use super::{
    client::{DebugClient, EventHub, EventSubscription, SubscriptionId},
    codec::{encode_message, read_message},
    types::{DebugEvent, ProtocolMessage, Request, Response},
};
use crate::DapError;

type PendingRequests = Arc<Mutex<HashMap<i64, oneshot::Sender<Response>>>>;

/// Debug adapter client over TCP
#[derive(Debug)]
pub struct DapClient {
    addr: SocketAddr,
    request_timeout: Duration,
    seq: AtomicI64,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: PendingRequests,
    hub: Arc<EventHub>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl DapClient {
    /// Connects to an adapter listening on `addr`.
    pub async fn connect(addr: SocketAddr, request_timeout: Duration) -> Result<Self, DapError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let pending = PendingRequests::default();
        let hub = Arc::new(EventHub::new());
        let reader = tokio::spawn(read_loop(addr, read_half, pending.clone(), hub.clone()));

        debug!(%addr, "connected to debug adapter");
        Ok(Self {
            addr,
            request_timeout,
            seq: AtomicI64::new(1),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending,
            hub,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Connects to `addr`, retrying while the adapter is not accepting yet.
    pub async fn connect_with_retry(
        addr: SocketAddr,
        request_timeout: Duration,
        max_attempts: usize,
    ) -> Result<Self, DapError> {
        let mut attempt = 1;
        loop {
            match Self::connect(addr, request_timeout).await {
                Ok(client) => return Ok(client),
                Err(e) if attempt < max_attempts => {
                    debug!(%addr, "adapter not ready (attempt {attempt}/{max_attempts}): {e}");
                    attempt += 1;
                    sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    async fn send(&self, message: &ProtocolMessage) -> Result<(), DapError> {
        let frame = encode_message(message)?;
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(DapError::Disconnected)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl DebugClient for DapClient {
    async fn request(&self, command: &str, arguments: Value) -> Result<Value, DapError> {
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);

        let message = ProtocolMessage::Request(Request {
            seq,
            command: command.to_string(),
            arguments: Some(arguments),
        });
        trace!(seq, command, "sending request");
        if let Err(e) = self.send(&message).await {
            self.pending.lock().remove(&seq);
            return Err(e);
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            // The reader dropped every pending sender
            Ok(Err(_)) => return Err(DapError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&seq);
                return Err(DapError::Timeout {
                    command: command.to_string(),
                    timeout: self.request_timeout,
                });
            }
        };

        if response.success {
            Ok(response.body.unwrap_or(Value::Null))
        } else {
            Err(DapError::ErrorResponse {
                command: command.to_string(),
                message: response.error_message(),
            })
        }
    }

    async fn respond(&self, request_seq: i64, command: &str, body: Value) -> Result<(), DapError> {
        let message = ProtocolMessage::Response(Response {
            seq: self.next_seq(),
            request_seq,
            success: true,
            command: command.to_string(),
            message: None,
            body: Some(body),
        });
        self.send(&message).await
    }

    fn subscribe(&self) -> EventSubscription {
        self.hub.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.hub.unsubscribe(id);
    }

    async fn close_transport(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.lock().clear();
        self.hub.close();
        debug!(addr = %self.addr, "debug adapter transport closed");
    }
}

async fn read_loop(
    addr: SocketAddr,
    read_half: OwnedReadHalf,
    pending: PendingRequests,
    hub: Arc<EventHub>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        match read_message(&mut reader).await {
            Ok(Some(ProtocolMessage::Response(response))) => {
                match pending.lock().remove(&response.request_seq) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => trace!(
                        request_seq = response.request_seq,
                        command = %response.command,
                        "response without a waiting request"
                    ),
                }
            }
            Ok(Some(ProtocolMessage::Event(event))) => {
                trace!(event = %event.event, "received event");
                hub.publish(DebugEvent::from_event(event));
            }
            Ok(Some(ProtocolMessage::Request(request))) => {
                debug!(command = %request.command, "received reverse request");
                hub.publish(DebugEvent::from_reverse_request(request));
            }
            Ok(None) => {
                debug!(%addr, "debug adapter closed the connection");
                break;
            }
            Err(DapError::Undecodable(reason)) => {
                warn!(%addr, "skipping debug adapter message: {reason}");
            }
            Err(e) => {
                warn!(%addr, "debug adapter connection failed: {e}");
                break;
            }
        }
    }

    pending.lock().clear();
    hub.close();
}
