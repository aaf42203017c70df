//! Per-session protocol state machine.
//!
//! `disconnected → negotiating → ready → closing → disconnected`. A reader
//! task turns the byte stream into frames; the session loop answers them in
//! arrival order while tool calls run concurrently through the dispatcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::{FuturesOrdered, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::codec::{FrameReader, FrameWriter, Framing};
use super::message::{Message, MessageType, RequestId};
use super::providers::{AssistantPrompts, EditorResources, PromptProvider, ResourceProvider};
use super::CapabilitySet;
use crate::audit::{log_tool_call, ToolCallRecord};
use crate::dispatcher::{Caller, CommandInvocation, Dispatcher};
use crate::error::AppError;
use crate::registry::catalog::tools_json;
use crate::settings::Settings;

/// Frames buffered between the reader task and the session loop.
const FRAME_QUEUE_LEN: usize = 64;
/// Quiet period after the last reply before a closing session stops
/// reading. Requests written right behind `shutdown` land inside it.
const CLOSE_LINGER: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Negotiating,
    Ready,
    Closing,
}

/// Public view of one remote session, live or finished.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub negotiated: CapabilitySet,
}

/// A response that may still be waiting on the dispatcher. `None` means the
/// request gets no reply.
type Reply = BoxFuture<'static, Option<Message>>;

fn immediate(message: Message) -> Reply {
    future::ready(Some(message)).boxed()
}

fn malformed(message: impl Into<String>) -> AppError {
    AppError::MalformedMessage {
        message: message.into(),
    }
}

fn object_field(payload: &Value, key: &str) -> Result<Map<String, Value>, AppError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(malformed(format!("\"{key}\" must be an object"))),
    }
}

fn audit_call(
    config_dir: &Path,
    session_id: &str,
    tool: &str,
    arguments: Map<String, Value>,
    result: &Result<CommandInvocation, AppError>,
    started: Instant,
) {
    let sequence = match result {
        Ok(invocation) => Some(invocation.sequence),
        Err(AppError::CommandExecution { sequence, .. }) => Some(*sequence),
        Err(_) => None,
    };
    let text = match result {
        Ok(invocation) => invocation.feedback.clone().unwrap_or_else(|| "applied".into()),
        Err(e) => e.to_string(),
    };
    let input = Value::Object(arguments);
    log_tool_call(
        config_dir,
        &ToolCallRecord {
            session_id,
            sequence,
            tool,
            input: &input,
            result: if result.is_ok() {
                Ok(text.as_str())
            } else {
                Err(text.as_str())
            },
            duration: started.elapsed(),
        },
    );
}

struct SessionCtx {
    id: String,
    caller: Caller,
    state: SessionState,
    negotiated: CapabilitySet,
}

impl SessionCtx {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.state,
            negotiated: self.negotiated,
        }
    }

    /// Gate for every request other than `negotiate` and `shutdown`.
    fn require(&self, capability: CapabilitySet) -> Result<(), AppError> {
        match self.state {
            SessionState::Negotiating => Err(AppError::ProtocolNotReady),
            SessionState::Closing | SessionState::Disconnected => Err(AppError::SessionClosed),
            SessionState::Ready if !self.negotiated.contains(capability) => {
                Err(AppError::CapabilityNotNegotiated {
                    capability: capability.label(),
                })
            }
            SessionState::Ready => Ok(()),
        }
    }
}

/// Exposes the command registry to remote agents. One bridge serves any
/// number of sessions, all sharing the same dispatcher.
pub struct ProtocolBridge {
    dispatcher: Arc<Dispatcher>,
    resources: Arc<dyn ResourceProvider>,
    prompts: Arc<dyn PromptProvider>,
    capabilities: CapabilitySet,
    framing: Framing,
    call_timeout: Duration,
    shutdown_grace: Duration,
    audit_dir: Option<PathBuf>,
    sessions: Mutex<IndexMap<String, SessionInfo>>,
}

impl ProtocolBridge {
    pub fn new(dispatcher: Arc<Dispatcher>, settings: &Settings) -> Self {
        Self {
            resources: Arc::new(EditorResources::new(dispatcher.clone())),
            prompts: Arc::new(AssistantPrompts::new(dispatcher.registry().clone())),
            dispatcher,
            capabilities: settings.capabilities,
            framing: settings.framing,
            call_timeout: Duration::from_millis(settings.call_timeout_ms),
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
            audit_dir: None,
            sessions: Mutex::new(IndexMap::new()),
        }
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceProvider>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptProvider>) -> Self {
        self.prompts = prompts;
        self
    }

    /// Log every tool call to the JSONL audit files under `config_dir`.
    pub fn with_audit_dir(mut self, config_dir: PathBuf) -> Self {
        self.audit_dir = Some(config_dir);
        self
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Invocations made by a session. Stays available after it closes.
    pub fn session_history(&self, id: &str) -> Result<Vec<CommandInvocation>, AppError> {
        if !self.sessions.lock().contains_key(id) {
            return Err(AppError::NotFound {
                what: format!("session {id}"),
            });
        }
        Ok(self.dispatcher.history_for(&Caller::Agent(id.to_string())))
    }

    fn set_state(&self, ctx: &mut SessionCtx, state: SessionState) {
        tracing::debug!(session = %ctx.id, from = ?ctx.state, to = ?state, "session state");
        ctx.state = state;
        self.sessions.lock().insert(ctx.id.clone(), ctx.info());
    }

    /// Run one session over a byte stream until it closes. Returns the final
    /// session view, or the transport error that killed it.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<SessionInfo, AppError>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let id = Uuid::new_v4().to_string();
        let mut ctx = SessionCtx {
            caller: Caller::Agent(id.clone()),
            id,
            state: SessionState::Disconnected,
            negotiated: CapabilitySet::empty(),
        };
        self.sessions.lock().insert(ctx.id.clone(), ctx.info());
        tracing::info!(session = %ctx.id, framing = ?self.framing, "session opened");

        let (frames_tx, mut frames) = mpsc::channel(FRAME_QUEUE_LEN);
        let mut frame_reader = FrameReader::new(reader, self.framing);
        let reader_task = tokio::spawn(async move {
            loop {
                match frame_reader.read_frame().await {
                    Ok(Some(frame)) => {
                        if frames_tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = frames_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let mut writer = FrameWriter::new(writer, self.framing);
        let result = self.run(&mut ctx, &mut frames, &mut writer).await;

        reader_task.abort();
        writer.shutdown().await;
        self.set_state(&mut ctx, SessionState::Disconnected);
        match &result {
            Ok(()) => tracing::info!(session = %ctx.id, "session closed"),
            Err(e) => tracing::error!(session = %ctx.id, error = %e, "session terminated"),
        }
        result.map(|()| ctx.info())
    }

    async fn run<W: AsyncWrite + Unpin>(
        &self,
        ctx: &mut SessionCtx,
        frames: &mut mpsc::Receiver<Result<Vec<u8>, AppError>>,
        writer: &mut FrameWriter<W>,
    ) -> Result<(), AppError> {
        self.set_state(ctx, SessionState::Negotiating);
        let hello = Message::new(
            MessageType::Negotiate,
            Some(RequestId::Text("negotiate".into())),
            json!({ "capabilities": self.capabilities, "sessionId": ctx.id }),
        );
        writer.write_frame(&hello.to_json()?).await?;

        let mut pending: FuturesOrdered<Reply> = FuturesOrdered::new();
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(Ok(body)) => {
                        if let Some(reply) = self.handle_frame(ctx, &body) {
                            pending.push_back(reply);
                        }
                        if ctx.state == SessionState::Closing {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        tracing::info!(session = %ctx.id, "peer closed the stream");
                        self.set_state(ctx, SessionState::Closing);
                        break;
                    }
                },
                Some(reply) = pending.next(), if !pending.is_empty() => {
                    if let Some(message) = reply {
                        writer.write_frame(&message.to_json()?).await?;
                    }
                }
            }
        }

        self.drain(ctx, frames, writer, pending).await
    }

    /// Let in-flight calls finish within the grace period. Requests that
    /// arrive meanwhile are refused with `SessionClosed`, in order.
    async fn drain<W: AsyncWrite + Unpin>(
        &self,
        ctx: &mut SessionCtx,
        frames: &mut mpsc::Receiver<Result<Vec<u8>, AppError>>,
        writer: &mut FrameWriter<W>,
        mut pending: FuturesOrdered<Reply>,
    ) -> Result<(), AppError> {
        let deadline = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(deadline);
        let mut inbound_open = true;

        loop {
            if pending.is_empty() && !inbound_open {
                break;
            }
            tokio::select! {
                () = &mut deadline => {
                    if !pending.is_empty() {
                        tracing::warn!(
                            session = %ctx.id,
                            in_flight = pending.len(),
                            "shutdown grace elapsed, dropping unanswered requests"
                        );
                    }
                    break;
                }
                Some(reply) = pending.next(), if !pending.is_empty() => {
                    if let Some(message) = reply {
                        writer.write_frame(&message.to_json()?).await?;
                    }
                }
                frame = frames.recv(), if inbound_open => match frame {
                    Some(Ok(body)) => {
                        if let Some(reply) = self.handle_frame(ctx, &body) {
                            pending.push_back(reply);
                        }
                    }
                    Some(Err(_)) | None => inbound_open = false,
                },
                () = tokio::time::sleep(CLOSE_LINGER), if pending.is_empty() => break,
            }
        }
        Ok(())
    }

    fn handle_frame(&self, ctx: &mut SessionCtx, body: &[u8]) -> Option<Reply> {
        let message = match Message::parse(body) {
            Ok(message) => message,
            Err((request_id, err)) => {
                tracing::warn!(session = %ctx.id, request_id = ?request_id, error = %err, "malformed message");
                return Some(immediate(Message::error(request_id, &err)));
            }
        };
        tracing::debug!(
            session = %ctx.id,
            request_id = ?message.request_id,
            kind = ?message.kind,
            "request"
        );

        let result = match message.kind {
            MessageType::Negotiate => self.negotiate(ctx, &message),
            MessageType::ListTools => self.list_tools(ctx, &message),
            MessageType::CallTool => self.call_tool(ctx, &message),
            MessageType::ReadResource => self.read_resource(ctx, &message),
            MessageType::GetPrompt => self.get_prompt(ctx, &message),
            MessageType::Shutdown => self.shutdown(ctx, &message),
            MessageType::Error => {
                tracing::warn!(session = %ctx.id, payload = %message.payload, "peer reported an error");
                return None;
            }
        };
        Some(result.unwrap_or_else(|e| {
            tracing::debug!(session = %ctx.id, request_id = ?message.request_id, error = %e, "request refused");
            immediate(Message::error(message.request_id.clone(), &e))
        }))
    }

    fn negotiate(&self, ctx: &mut SessionCtx, message: &Message) -> Result<Reply, AppError> {
        match ctx.state {
            SessionState::Negotiating => {}
            SessionState::Ready => return Err(malformed("session already negotiated")),
            SessionState::Closing | SessionState::Disconnected => return Err(AppError::SessionClosed),
        }
        let Some(Value::Array(tokens)) = message.payload.get("capabilities") else {
            return Err(malformed("negotiate needs a \"capabilities\" list"));
        };
        let remote = CapabilitySet::parse_tokens(tokens.iter().filter_map(Value::as_str));
        ctx.negotiated = self.capabilities.negotiate(remote);
        self.set_state(ctx, SessionState::Ready);
        tracing::info!(
            session = %ctx.id,
            local = %self.capabilities.label(),
            remote = %remote.label(),
            negotiated = %ctx.negotiated.label(),
            "capabilities negotiated"
        );

        let mut payload = Map::new();
        payload.insert("sessionId".into(), json!(ctx.id));
        payload.insert("capabilities".into(), json!(ctx.negotiated));
        if ctx.negotiated.contains(CapabilitySet::RESOURCES) {
            payload.insert("resources".into(), Value::Array(self.resources.list()));
        }
        if ctx.negotiated.contains(CapabilitySet::PROMPTS) {
            payload.insert("prompts".into(), Value::Array(self.prompts.list()));
        }
        Ok(immediate(Message::reply(message, Value::Object(payload))))
    }

    fn list_tools(&self, ctx: &SessionCtx, message: &Message) -> Result<Reply, AppError> {
        ctx.require(CapabilitySet::TOOLS)?;
        let tools = tools_json(self.dispatcher.registry(), ctx.negotiated);
        Ok(immediate(Message::reply(message, json!({ "tools": tools }))))
    }

    fn call_tool(&self, ctx: &SessionCtx, message: &Message) -> Result<Reply, AppError> {
        ctx.require(CapabilitySet::TOOLS)?;
        let name = message
            .payload_str("name")
            .ok_or_else(|| malformed("call-tool needs a tool \"name\""))?
            .to_string();
        let arguments = object_field(&message.payload, "arguments")?;
        let timeout = match message.payload.get("timeoutMs") {
            None | Some(Value::Null) => self.call_timeout,
            Some(v) => Duration::from_millis(
                v.as_u64()
                    .ok_or_else(|| malformed("\"timeoutMs\" must be a non-negative integer"))?,
            ),
        };

        let def = self.dispatcher.registry().lookup(&name)?;
        if !ctx.negotiated.contains(def.requires) {
            return Err(AppError::CapabilityNotNegotiated {
                capability: def.requires.difference(ctx.negotiated).label(),
            });
        }

        let dispatcher = self.dispatcher.clone();
        let caller = ctx.caller.clone();
        let session_id = ctx.id.clone();
        let audit_dir = self.audit_dir.clone();
        let kind = message.kind;
        let request_id = message.request_id.clone();

        Ok(async move {
            let started = Instant::now();
            let result = dispatcher.execute(&name, &arguments, caller, Some(timeout)).await;

            if let Some(dir) = &audit_dir {
                audit_call(dir, &session_id, &name, arguments, &result, started);
            }

            Some(match result {
                Ok(invocation) => {
                    tracing::info!(
                        session = %session_id,
                        request_id = ?request_id,
                        sequence = invocation.sequence,
                        command = %invocation.command,
                        "tool call applied"
                    );
                    Message::new(
                        kind,
                        request_id,
                        json!({ "feedback": invocation.feedback, "invocation": invocation }),
                    )
                }
                Err(e) => {
                    tracing::warn!(session = %session_id, request_id = ?request_id, tool = %name, error = %e, "tool call failed");
                    Message::error(request_id, &e)
                }
            })
        }
        .boxed())
    }

    fn read_resource(&self, ctx: &SessionCtx, message: &Message) -> Result<Reply, AppError> {
        ctx.require(CapabilitySet::RESOURCES)?;
        let payload = match message.payload_str("uri") {
            Some(uri) => self.resources.read(uri)?,
            None => json!({ "resources": self.resources.list() }),
        };
        Ok(immediate(Message::reply(message, payload)))
    }

    fn get_prompt(&self, ctx: &SessionCtx, message: &Message) -> Result<Reply, AppError> {
        ctx.require(CapabilitySet::PROMPTS)?;
        let payload = match message.payload_str("name") {
            Some(name) => self
                .prompts
                .get(name, &object_field(&message.payload, "arguments")?)?,
            None => json!({ "prompts": self.prompts.list() }),
        };
        Ok(immediate(Message::reply(message, payload)))
    }

    fn shutdown(&self, ctx: &mut SessionCtx, message: &Message) -> Result<Reply, AppError> {
        if matches!(ctx.state, SessionState::Closing | SessionState::Disconnected) {
            return Err(AppError::SessionClosed);
        }
        self.set_state(ctx, SessionState::Closing);
        tracing::info!(session = %ctx.id, "shutdown requested");
        Ok(immediate(Message::reply(
            message,
            json!({ "sessionId": ctx.id, "state": ctx.state }),
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::model::Project;
    use crate::registry::Registry;
    use crate::session::LocalSession;

    struct Peer {
        reader: FrameReader<BufReader<ReadHalf<DuplexStream>>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl Peer {
        async fn send(&mut self, message: Value) {
            self.writer.write_frame(&message.to_string()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let frame = self.reader.read_frame().await.unwrap().unwrap();
            serde_json::from_slice(&frame).unwrap()
        }

        async fn negotiate(&mut self, capabilities: Value) -> Value {
            self.send(json!({ "type": "negotiate", "requestId": 0, "payload": { "capabilities": capabilities } }))
                .await;
            self.recv().await
        }
    }

    fn bridge() -> Arc<ProtocolBridge> {
        let registry = Arc::new(Registry::builtin().unwrap());
        let session = Arc::new(LocalSession::new(Project::sample()));
        let dispatcher = Arc::new(Dispatcher::new(registry, session, true));
        Arc::new(ProtocolBridge::new(dispatcher, &Settings::default()))
    }

    async fn connect(bridge: &Arc<ProtocolBridge>) -> (Peer, JoinHandle<Result<SessionInfo, AppError>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let serving = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.serve(BufReader::new(server_read), server_write).await })
        };
        let (client_read, client_write) = tokio::io::split(client);
        let mut peer = Peer {
            reader: FrameReader::new(BufReader::new(client_read), Framing::Lines),
            writer: FrameWriter::new(client_write, Framing::Lines),
        };
        let hello = peer.recv().await;
        assert_eq!(hello["type"], "negotiate");
        assert_eq!(hello["payload"]["capabilities"], json!(["resources", "tools", "prompts"]));
        (peer, serving)
    }

    fn transition_call(id: i64) -> Value {
        json!({
            "type": "call-tool",
            "requestId": id,
            "payload": {
                "name": "add-transition",
                "arguments": { "type": "cross-dissolve", "durationSeconds": 1.5, "position": 20 }
            }
        })
    }

    #[tokio::test]
    async fn call_before_negotiation_is_refused() {
        let bridge = bridge();
        let (mut peer, serving) = connect(&bridge).await;

        peer.send(transition_call(1)).await;
        let refused = peer.recv().await;
        assert_eq!(refused["type"], "error");
        assert_eq!(refused["requestId"], 1);
        assert_eq!(refused["payload"]["code"], "ProtocolNotReady");
        assert!(bridge.dispatcher.history().is_empty());

        let negotiated = peer.negotiate(json!(["tools", "sampling", "telepathy"])).await;
        assert_eq!(negotiated["requestId"], 0);
        assert_eq!(negotiated["payload"]["capabilities"], json!(["tools"]));
        assert!(negotiated["payload"].get("resources").is_none());

        peer.send(transition_call(2)).await;
        let applied = peer.recv().await;
        assert_eq!(applied["type"], "call-tool");
        assert_eq!(applied["requestId"], 2);
        assert_eq!(applied["payload"]["invocation"]["outcome"], "applied");
        let feedback = applied["payload"]["feedback"].as_str().unwrap();
        assert!(feedback.contains("cross-dissolve"));

        drop(peer);
        let info = serving.await.unwrap().unwrap();
        assert_eq!(info.state, SessionState::Disconnected);
        let history = bridge.session_history(&info.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].caller, Caller::Agent(info.id.clone()));
    }

    #[tokio::test]
    async fn tools_without_capability_never_reach_dispatcher() {
        let bridge = bridge();
        let (mut peer, _serving) = connect(&bridge).await;
        let negotiated = peer.negotiate(json!(["resources"])).await;
        assert_eq!(negotiated["payload"]["resources"].as_array().unwrap().len(), 3);

        peer.send(json!({ "type": "list-tools", "requestId": "a" })).await;
        let listed = peer.recv().await;
        assert_eq!(listed["payload"]["code"], "CapabilityNotNegotiated");
        assert_eq!(listed["payload"]["detail"]["capability"], "tools");

        peer.send(transition_call(3)).await;
        assert_eq!(peer.recv().await["payload"]["code"], "CapabilityNotNegotiated");
        assert!(bridge.dispatcher.history().is_empty());

        peer.send(json!({ "type": "read-resource", "requestId": 4, "payload": { "uri": "project://info" } }))
            .await;
        let resource = peer.recv().await;
        assert!(resource["payload"]["contents"].as_str().unwrap().contains("Demo Project"));
    }

    #[tokio::test]
    async fn responses_keep_request_order() {
        let bridge = bridge();
        let (mut peer, _serving) = connect(&bridge).await;
        peer.negotiate(json!(["tools", "prompts"])).await;

        peer.send(transition_call(10)).await;
        peer.send(json!({ "type": "call-tool", "requestId": 11, "payload": { "name": "add-marker" } }))
            .await;
        peer.send(json!({ "type": "list-tools", "requestId": 12 })).await;
        peer.send(json!({ "type": "get-prompt", "requestId": 13, "payload": { "name": "edit-assistant" } }))
            .await;

        let ids: Vec<Value> = [peer.recv().await, peer.recv().await, peer.recv().await, peer.recv().await]
            .iter()
            .map(|m| m["requestId"].clone())
            .collect();
        assert_eq!(ids, vec![json!(10), json!(11), json!(12), json!(13)]);

        let sequences: Vec<u64> = bridge.dispatcher.history().iter().map(|i| i.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn malformed_and_bad_calls_keep_session_alive() {
        let bridge = bridge();
        let (mut peer, _serving) = connect(&bridge).await;
        peer.negotiate(json!(["tools"])).await;

        peer.writer.write_frame("{not json").await.unwrap();
        let bad = peer.recv().await;
        assert_eq!(bad["payload"]["code"], "MalformedMessage");
        assert!(bad.get("requestId").is_none());

        peer.send(json!({ "type": "call-tool", "requestId": 5, "payload": { "name": "fly-away" } }))
            .await;
        assert_eq!(peer.recv().await["payload"]["code"], "UnknownCommand");

        peer.send(json!({ "type": "call-tool", "requestId": 6, "payload": { "name": "move-playhead" } }))
            .await;
        let missing = peer.recv().await;
        assert_eq!(missing["payload"]["code"], "MissingParameter");
        assert_eq!(missing["payload"]["class"], "input");

        peer.send(json!({ "type": "negotiate", "requestId": 7, "payload": { "capabilities": [] } }))
            .await;
        assert_eq!(peer.recv().await["payload"]["code"], "MalformedMessage");

        peer.send(json!({ "type": "list-tools", "requestId": 8 })).await;
        let tools = peer.recv().await;
        assert_eq!(tools["payload"]["tools"].as_array().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn shutdown_closes_session() {
        let bridge = bridge();
        let (mut peer, serving) = connect(&bridge).await;
        peer.negotiate(json!(["tools"])).await;

        peer.send(json!({ "type": "shutdown", "requestId": 9 })).await;
        let ack = peer.recv().await;
        assert_eq!(ack["type"], "shutdown");
        assert_eq!(ack["payload"]["state"], "closing");

        let info = serving.await.unwrap().unwrap();
        assert_eq!(info.state, SessionState::Disconnected);
        assert!(peer.reader.read_frame().await.unwrap().is_none());
        assert_eq!(bridge.sessions()[0].state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn request_behind_shutdown_is_refused() {
        let bridge = bridge();
        for _ in 0..20 {
            let (mut peer, serving) = connect(&bridge).await;
            peer.negotiate(json!(["tools"])).await;

            let batch = "{\"type\":\"shutdown\",\"requestId\":1}\n{\"type\":\"list-tools\",\"requestId\":2}";
            peer.writer.write_frame(batch).await.unwrap();

            let ack = peer.recv().await;
            assert_eq!(ack["type"], "shutdown");
            assert_eq!(ack["requestId"], 1);
            let refused = peer.recv().await;
            assert_eq!(refused["type"], "error");
            assert_eq!(refused["requestId"], 2);
            assert_eq!(refused["payload"]["code"], "SessionClosed");
            assert!(peer.reader.read_frame().await.unwrap().is_none());
            serving.await.unwrap().unwrap();
        }
    }

    /// Writes the timeline slowly so a call is still running when the peer
    /// goes away.
    struct SlowWrites {
        inner: LocalSession,
        delay: Duration,
    }

    impl crate::session::EditingSession for SlowWrites {
        fn project(&self) -> Result<Project, AppError> {
            self.inner.project()
        }
        fn set_project(&self, project: Project) -> Result<(), AppError> {
            self.inner.set_project(project)
        }
        fn timeline(&self) -> Result<crate::model::Timeline, AppError> {
            self.inner.timeline()
        }
        fn set_timeline(&self, timeline: crate::model::Timeline) -> Result<(), AppError> {
            std::thread::sleep(self.delay);
            self.inner.set_timeline(timeline)
        }
        fn clip(&self, track: usize, id: crate::model::ClipId) -> Result<crate::model::Clip, AppError> {
            self.inner.clip(track, id)
        }
        fn set_clip(&self, track: usize, clip: crate::model::Clip) -> Result<(), AppError> {
            self.inner.set_clip(track, clip)
        }
    }

    #[tokio::test]
    async fn disconnect_mid_call_still_settles_history() {
        let registry = Arc::new(Registry::builtin().unwrap());
        let session = Arc::new(SlowWrites {
            inner: LocalSession::new(Project::sample()),
            delay: Duration::from_millis(200),
        });
        let dispatcher = Arc::new(Dispatcher::new(registry, session, true));
        let bridge = Arc::new(ProtocolBridge::new(dispatcher.clone(), &Settings::default()));
        let (mut peer, serving) = connect(&bridge).await;
        peer.negotiate(json!(["tools"])).await;

        peer.send(json!({ "type": "call-tool", "requestId": 1, "payload": { "name": "add-marker" } }))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(peer);
        // The late reply has nowhere to go, so the session may end either way.
        let _ = serving.await.unwrap();
        let info = bridge.sessions().remove(0);
        assert_eq!(info.state, SessionState::Disconnected);

        // The next command queues behind the one the peer abandoned.
        dispatcher
            .execute("move-playhead", &Map::from_iter([("position".to_string(), json!(1))]), Caller::Human, None)
            .await
            .unwrap();

        let history = dispatcher.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].command, "add-marker");
        assert_eq!(history[0].caller, Caller::Agent(info.id.clone()));
        assert_ne!(history[0].outcome, crate::dispatcher::Outcome::Pending);
    }

    #[tokio::test]
    async fn write_failure_is_fatal() {
        let bridge = bridge();
        let (client, server) = tokio::io::duplex(1024);
        drop(client);
        let (server_read, server_write) = tokio::io::split(server);
        let result = bridge.serve(BufReader::new(server_read), server_write).await;
        assert!(matches!(result, Err(AppError::Transport { .. })));
        assert_eq!(bridge.sessions()[0].state, SessionState::Disconnected);
    }
}
