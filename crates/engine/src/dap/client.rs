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

//! The debug client abstraction
//!
//! [`DebugClient`] is what the engine talks to. Implementors only provide the
//! raw [`DebugClient::request`] round trip and event plumbing, the typed
//! protocol operations are built on top of it.

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use stepsnap_common::types::Source;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::types::*;
use crate::DapError;

/// Events kept for the next subscriber at most; older ones are dropped.
pub const MAX_BACKLOG: usize = 4096;

/// Identifier of an event subscription
pub type SubscriptionId = u64;

/// Receiving end of an event subscription
#[derive(Debug)]
pub struct EventSubscription {
    /// Id to pass to [`DebugClient::unsubscribe`]
    pub id: SubscriptionId,
    /// Events, in the order the adapter sent them. Closed with the transport.
    pub events: mpsc::UnboundedReceiver<DebugEvent>,
}

/// Client side of a debug adapter protocol connection
#[async_trait]
pub trait DebugClient: Send + Sync {
    /// Sends `command` and waits for its response body (`Null` when absent).
    async fn request(&self, command: &str, arguments: Value) -> Result<Value, DapError>;

    /// Answers a reverse request of the adapter.
    async fn respond(&self, request_seq: i64, command: &str, body: Value) -> Result<(), DapError>;

    /// Starts receiving events.
    fn subscribe(&self) -> EventSubscription;

    /// Stops delivering events to a subscription.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Closes the connection to the adapter. Pending and future requests fail
    /// with [`DapError::Disconnected`].
    async fn close_transport(&self);

    /// `initialize`, returning the adapter capabilities.
    async fn initialize(&self, arguments: InitializeArguments) -> Result<Value, DapError> {
        self.request("initialize", serde_json::to_value(arguments)?).await
    }

    /// `launch`. Arguments are adapter specific.
    async fn launch(&self, arguments: Value) -> Result<(), DapError> {
        self.request("launch", arguments).await.map(drop)
    }

    /// `setBreakpoints` on one source file, replacing its previous breakpoints.
    async fn set_breakpoints(
        &self,
        source_path: &Path,
        lines: &[u32],
    ) -> Result<SetBreakpointsResponseBody, DapError> {
        let arguments = SetBreakpointsArguments {
            source: Source { name: None, path: Some(source_path.to_string_lossy().into_owned()) },
            breakpoints: lines.iter().map(|&line| SourceBreakpoint { line }).collect(),
        };
        let body = self.request("setBreakpoints", serde_json::to_value(arguments)?).await?;
        decode("setBreakpoints", body)
    }

    /// `configurationDone`
    async fn configuration_done(&self) -> Result<(), DapError> {
        self.request("configurationDone", json!({})).await.map(drop)
    }

    /// `stackTrace` of a thread
    async fn stack_trace(&self, thread_id: i64) -> Result<Vec<DapStackFrame>, DapError> {
        let body = self.request("stackTrace", json!({ "threadId": thread_id })).await?;
        decode::<StackTraceResponseBody>("stackTrace", body).map(|body| body.stack_frames)
    }

    /// `scopes` of a frame
    async fn scopes(&self, frame_id: i64) -> Result<Vec<DapScope>, DapError> {
        let body = self.request("scopes", json!({ "frameId": frame_id })).await?;
        decode::<ScopesResponseBody>("scopes", body).map(|body| body.scopes)
    }

    /// `variables` of a reference
    async fn variables(&self, variables_reference: i64) -> Result<Vec<DapVariable>, DapError> {
        let body = self
            .request("variables", json!({ "variablesReference": variables_reference }))
            .await?;
        decode::<VariablesResponseBody>("variables", body).map(|body| body.variables)
    }

    /// `readMemory`
    async fn read_memory(
        &self,
        memory_reference: &str,
        count: u32,
    ) -> Result<ReadMemoryResponseBody, DapError> {
        let arguments = ReadMemoryArguments {
            memory_reference: memory_reference.to_string(),
            offset: 0,
            count,
        };
        let body = self.request("readMemory", serde_json::to_value(arguments)?).await?;
        decode("readMemory", body)
    }

    /// `continue`
    async fn continue_(&self, thread_id: i64) -> Result<(), DapError> {
        let arguments = ContinueArguments { thread_id };
        self.request("continue", serde_json::to_value(arguments)?).await.map(drop)
    }

    /// `stepIn`
    async fn step_in(
        &self,
        thread_id: i64,
        granularity: Option<SteppingGranularity>,
    ) -> Result<(), DapError> {
        let arguments = StepArguments { thread_id, granularity };
        self.request("stepIn", serde_json::to_value(arguments)?).await.map(drop)
    }

    /// `next`, i.e. step over
    async fn next(
        &self,
        thread_id: i64,
        granularity: Option<SteppingGranularity>,
    ) -> Result<(), DapError> {
        let arguments = StepArguments { thread_id, granularity };
        self.request("next", serde_json::to_value(arguments)?).await.map(drop)
    }

    /// `stepOut`
    async fn step_out(
        &self,
        thread_id: i64,
        granularity: Option<SteppingGranularity>,
    ) -> Result<(), DapError> {
        let arguments = StepArguments { thread_id, granularity };
        self.request("stepOut", serde_json::to_value(arguments)?).await.map(drop)
    }

    /// `disconnect`, terminating the debuggee
    async fn disconnect(&self) -> Result<(), DapError> {
        self.request("disconnect", json!({ "terminateDebuggee": true })).await.map(drop)
    }
}

/// Decodes a response body of `command`.
pub fn decode<T: DeserializeOwned>(command: &str, body: Value) -> Result<T, DapError> {
    serde_json::from_value(body)
        .map_err(|e| DapError::Codec(format!("unexpected `{command}` response body: {e}")))
}

/// Fan-out of adapter events to subscribers
///
/// Events published while nobody is subscribed are buffered and replayed to
/// the next subscriber, so nothing the adapter sends between two owners of
/// the connection gets lost. The buffer holds the latest [`MAX_BACKLOG`]
/// events.
#[derive(Debug, Default)]
pub struct EventHub {
    inner: Mutex<HubInner>,
}

#[derive(Debug, Default)]
struct HubInner {
    next_id: SubscriptionId,
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<DebugEvent>>,
    backlog: VecDeque<DebugEvent>,
    closed: bool,
}

impl EventHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber, replaying the backlog to it.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        let id = inner.next_id;
        inner.next_id += 1;

        for event in inner.backlog.drain(..) {
            let _ = tx.send(event);
        }
        // Subscribing to a closed hub yields a channel that ends right away
        if !inner.closed {
            inner.subscribers.insert(id, tx);
        }

        EventSubscription { id, events: rx }
    }

    /// Drops a subscriber.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().subscribers.remove(&id);
    }

    /// Delivers an event to every live subscriber.
    pub fn publish(&self, event: DebugEvent) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        inner.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
        if inner.subscribers.is_empty() {
            trace!(?event, "no subscriber, buffering event");
            if inner.backlog.len() == MAX_BACKLOG {
                warn!("event backlog full, dropping the oldest event");
                inner.backlog.pop_front();
            }
            inner.backlog.push_back(event);
        }
    }

    /// Ends every subscription. Later publications are dropped.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.clear();
        inner.backlog.clear();
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}
