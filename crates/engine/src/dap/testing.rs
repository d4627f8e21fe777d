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

//! In-process debug adapters for unit tests

use std::net::SocketAddr;

use serde_json::Value;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::TcpListener,
};

use super::{
    codec::{encode_message, read_message},
    types::{Event, ProtocolMessage, Request, Response},
};

/// Accepts one connection and answers every request with `handler`.
/// Responses the client sends back are ignored.
pub async fn fake_adapter<F>(handler: F) -> SocketAddr
where
    F: Fn(&Request) -> Vec<ProtocolMessage> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        while let Ok(Some(message)) = read_message(&mut reader).await {
            if let ProtocolMessage::Request(request) = message {
                for reply in handler(&request) {
                    let frame = encode_message(&reply).unwrap();
                    if write_half.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    addr
}

/// Successful response to `request`
pub fn ok(request: &Request, body: Value) -> ProtocolMessage {
    ProtocolMessage::Response(Response {
        seq: 100 + request.seq,
        request_seq: request.seq,
        success: true,
        command: request.command.clone(),
        message: None,
        body: Some(body),
    })
}

/// Failed response to `request`
pub fn failure(request: &Request, message: &str) -> ProtocolMessage {
    ProtocolMessage::Response(Response {
        seq: 100 + request.seq,
        request_seq: request.seq,
        success: false,
        command: request.command.clone(),
        message: Some(message.to_string()),
        body: None,
    })
}

/// Event sent by the adapter
pub fn event(name: &str, body: Option<Value>) -> ProtocolMessage {
    ProtocolMessage::Event(Event { seq: 0, event: name.to_string(), body })
}
