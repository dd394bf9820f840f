//! The agent loop: call the model, run the tools it asks for, feed the
//! results back, and repeat until it answers or a limit is reached.
//!
//! ```text
//! Idle -> ModelCall -> (ToolDispatch -> ModelCall)* -> Finalizing -> Done
//!                                                    \-> Failed | Cancelled
//! ```
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::context;
use crate::conversation::MessageStore;
use crate::errors::{OrchestratorError, TimeoutScope, ToolError, ToolErrorKind, ToolResult};
use crate::models::content::Content;
use crate::models::delta::Delta;
use crate::models::message::{Message, MessageStatus, ToolRequest};
use crate::multiplexer::{ClientEvent, MuxSender};
use crate::providers::base::{CompletionRequest, Usage};
use crate::retry::{RetryController, RetryError, RetryPolicy, Route};
use crate::state::{StateManager, Turn};
use crate::tools::ToolRegistry;

pub const TOOL_LIMIT_NOTICE: &str = "Stopped after reaching the tool call limit for this turn.";
pub const TOOL_LIMIT_STOP_REASON: &str = "tool_budget_exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolTimeoutMode {
    /// Every call gets the full tool timeout
    #[default]
    PerCall,
    /// All calls of one dispatch phase share a single deadline
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    Parallel,
    Sequential,
    /// Parallel, except tools marked sequential run alone after everything before them
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPolicy {
    /// A new turn waits for the running one to finish
    #[default]
    Wait,
    /// A new turn cancels the running one
    Supersede,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub system_prompt: String,
    pub max_tool_calls: u32,
    /// Longest wait for a stream to open or for its next delta
    pub provider_timeout_ms: u64,
    pub tool_timeout_ms: u64,
    pub tool_timeout_mode: ToolTimeoutMode,
    pub turn_timeout_ms: u64,
    pub dispatch: DispatchPolicy,
    /// Zero sends the whole active path
    pub context_window_tokens: usize,
    pub turn_policy: TurnPolicy,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            system_prompt: "You are a helpful assistant.".to_string(),
            max_tool_calls: 8,
            provider_timeout_ms: 120_000,
            tool_timeout_ms: 30_000,
            tool_timeout_mode: ToolTimeoutMode::PerCall,
            turn_timeout_ms: 600_000,
            dispatch: DispatchPolicy::Auto,
            context_window_tokens: 128_000,
            turn_policy: TurnPolicy::Wait,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl AgentConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    ModelCall,
    ToolDispatch,
    Finalizing,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub conversation_id: String,
    pub message: Message,
}

impl ReplyRequest {
    pub fn new<S: Into<String>>(conversation_id: S, message: Message) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message,
        }
    }
}

/// How a turn ended and what it left behind
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub phase: TurnPhase,
    pub message_ids: Vec<String>,
    pub usage: Usage,
    pub error: Option<OrchestratorError>,
}

#[derive(Default)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    active: Option<(u64, CancellationToken)>,
}

/// Serializes turns per conversation and remembers how to cancel the running one
#[derive(Default)]
struct ConversationLocks {
    slots: Mutex<HashMap<String, Slot>>,
    next_turn: AtomicU64,
}

impl ConversationLocks {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn acquire(
        &self,
        conversation_id: &str,
        policy: TurnPolicy,
        cancel: &CancellationToken,
    ) -> (u64, OwnedMutexGuard<()>) {
        let (lock, running) = {
            let mut slots = self.slots();
            let slot = slots.entry(conversation_id.to_string()).or_default();
            (slot.lock.clone(), slot.active.as_ref().map(|(_, token)| token.clone()))
        };

        if policy == TurnPolicy::Supersede {
            if let Some(running) = running {
                tracing::info!(conversation_id, "superseding running turn");
                running.cancel();
            }
        }

        let guard = lock.lock_owned().await;
        let turn_id = self.next_turn.fetch_add(1, Ordering::Relaxed);
        self.slots()
            .entry(conversation_id.to_string())
            .or_default()
            .active = Some((turn_id, cancel.clone()));
        (turn_id, guard)
    }

    /// Clear the finished turn. The caller must have dropped its guard.
    fn release(&self, conversation_id: &str, turn_id: u64) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(conversation_id) {
            if slot.active.as_ref().is_some_and(|(id, _)| *id == turn_id) {
                slot.active = None;
            }
        }
        remove_if_idle(&mut slots, conversation_id);
    }

    /// Drop the slot of a conversation nobody is running or waiting on
    fn forget_idle(&self, conversation_id: &str) {
        remove_if_idle(&mut self.slots(), conversation_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots().len()
    }

    fn cancel(&self, conversation_id: &str) -> bool {
        match self
            .slots()
            .get(conversation_id)
            .and_then(|slot| slot.active.as_ref())
        {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Waiters and the running turn each hold a clone of the lock, so a slot whose
/// lock is held only by the table has nobody behind it.
fn remove_if_idle(slots: &mut HashMap<String, Slot>, conversation_id: &str) {
    let idle = slots
        .get(conversation_id)
        .is_some_and(|slot| slot.active.is_none() && Arc::strong_count(&slot.lock) == 1);
    if idle {
        slots.remove(conversation_id);
    }
}

/// Drives turns against a set of provider routes and tools
pub struct Agent {
    config: AgentConfig,
    controller: RwLock<Arc<RetryController>>,
    routes: RwLock<Arc<Vec<Route>>>,
    registry: RwLock<Arc<ToolRegistry>>,
    state: StateManager,
    locks: ConversationLocks,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        controller: RetryController,
        routes: Vec<Route>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            config,
            controller: RwLock::new(Arc::new(controller)),
            routes: RwLock::new(Arc::new(routes)),
            registry: RwLock::new(registry),
            state: StateManager::new(store),
            locks: ConversationLocks::default(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        self.state.store()
    }

    pub fn routes(&self) -> Arc<Vec<Route>> {
        match self.routes.read() {
            Ok(routes) => routes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn controller(&self) -> Arc<RetryController> {
        match self.controller.read() {
            Ok(controller) => controller.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Default retry policy for routes that carry none of their own
    pub fn retry_policy(&self) -> RetryPolicy {
        self.controller().policy().clone()
    }

    /// Replace the default retry policy. Turns already running keep the one they started with.
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        let controller = Arc::new(RetryController::new(policy));
        match self.controller.write() {
            Ok(mut current) => *current = controller,
            Err(poisoned) => *poisoned.into_inner() = controller,
        }
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        match self.registry.read() {
            Ok(registry) => registry.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the provider routes. Turns already running keep the ones they started with.
    pub fn set_routes(&self, routes: Vec<Route>) {
        let routes = Arc::new(routes);
        match self.routes.write() {
            Ok(mut current) => *current = routes,
            Err(poisoned) => *poisoned.into_inner() = routes,
        }
    }

    /// Replace the tool registry. Turns already running keep the one they started with.
    pub fn set_registry(&self, registry: Arc<ToolRegistry>) {
        match self.registry.write() {
            Ok(mut current) => *current = registry,
            Err(poisoned) => *poisoned.into_inner() = registry,
        }
    }

    /// Cancel the running turn of a conversation, if there is one
    pub fn cancel(&self, conversation_id: &str) -> bool {
        self.locks.cancel(conversation_id)
    }

    /// Run one turn, streaming its events to `sender`. The client always gets
    /// exactly one terminal event.
    pub async fn reply(
        &self,
        request: ReplyRequest,
        sender: MuxSender,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let conversation_id = request.conversation_id.clone();
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            acquired = self.locks.acquire(&conversation_id, self.config.turn_policy, &cancel) => Some(acquired),
        };
        let Some((turn_id, guard)) = acquired else {
            self.locks.forget_idle(&conversation_id);
            if let Err(error) = sender.send(ClientEvent::Cancelled).await {
                tracing::debug!(error = %error, "cancellation not delivered");
            }
            return TurnOutcome {
                phase: TurnPhase::Cancelled,
                message_ids: Vec::new(),
                usage: Usage::default(),
                error: Some(OrchestratorError::Cancelled),
            };
        };

        let outcome = self.run_turn(request, &sender, &cancel).await;
        drop(guard);
        self.locks.release(&conversation_id, turn_id);
        outcome
    }

    async fn run_turn(
        &self,
        request: ReplyRequest,
        sender: &MuxSender,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let conversation_id = request.conversation_id;
        tracing::info!(conversation_id = %conversation_id, phase = %TurnPhase::Idle, "turn started");

        let history = match self.store().read_active_path(&conversation_id).await {
            Ok(history) => history,
            Err(error) => {
                tracing::error!(conversation_id = %conversation_id, error = %error, "could not read conversation");
                Vec::new()
            }
        };
        let mut turn = self
            .state
            .begin_turn(&conversation_id, history, self.config.max_tool_calls);

        let interrupt = Interrupt::new(cancel, self.config.turn_timeout());
        let result = match turn.append_message(request.message).await {
            Err(error) => Err(error.into()),
            Ok(_) => self.run_loop(&mut turn, sender, &interrupt).await,
        };

        self.finish(turn, result, sender).await
    }

    async fn run_loop(
        &self,
        turn: &mut Turn,
        sender: &MuxSender,
        interrupt: &Interrupt<'_>,
    ) -> Result<Option<String>, OrchestratorError> {
        let routes = self.routes();
        let registry = self.registry();
        let tools = interrupt.guard(registry.tools()).await?;

        loop {
            let stop_reason = self.model_call(turn, &routes, &tools, sender, interrupt).await?;
            // Store writes are never interrupted; the turn stops at the next wait instead
            let message = turn.finalize_draft(MessageStatus::Complete).await?;
            let requests: Vec<ToolRequest> = message.tool_requests().into_iter().cloned().collect();
            if requests.is_empty() {
                tracing::debug!(conversation_id = turn.conversation_id(), phase = %TurnPhase::Finalizing);
                return Ok(stop_reason);
            }

            tracing::debug!(
                conversation_id = turn.conversation_id(),
                phase = %TurnPhase::ToolDispatch,
                calls = requests.len()
            );
            let granted = turn.take_tool_budget(requests.len());
            let (allowed, denied) = requests.split_at(granted);
            let results = interrupt
                .guard(self.dispatch(&registry, allowed, interrupt.cancel))
                .await?;

            let mut timed_out = false;
            for (request, result) in allowed.iter().zip(results) {
                timed_out |= matches!(&result, Err(error) if error.kind == ToolErrorKind::Timeout);
                record_tool_result(turn, sender, interrupt, request, result).await?;
            }
            for request in denied {
                let refused = ToolError::execution("tool call limit reached, this call was not run");
                record_tool_result(turn, sender, interrupt, request, Err(refused)).await?;
            }

            if timed_out {
                return Err(OrchestratorError::Timeout(TimeoutScope::Tool));
            }
            if interrupt.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            if turn.remaining_tool_calls() == 0 {
                if !turn.produced_text() {
                    return Err(OrchestratorError::BudgetExhausted);
                }
                tracing::info!(conversation_id = turn.conversation_id(), "tool call budget exhausted");
                emit(sender, interrupt, ClientEvent::Delta { delta: Delta::text(TOOL_LIMIT_NOTICE) }).await?;
                turn.append_message(Message::assistant().with_text(TOOL_LIMIT_NOTICE))
                    .await?;
                return Ok(Some(TOOL_LIMIT_STOP_REASON.to_string()));
            }
        }
    }

    /// Stream one model response into a fresh draft. Returns the stop reason of the final `Done`.
    async fn model_call(
        &self,
        turn: &mut Turn,
        routes: &[Route],
        tools: &[crate::models::tool::Tool],
        sender: &MuxSender,
        interrupt: &Interrupt<'_>,
    ) -> Result<Option<String>, OrchestratorError> {
        tracing::debug!(conversation_id = turn.conversation_id(), phase = %TurnPhase::ModelCall);
        let messages = context::fit_to_window(
            turn.active_path(),
            &self.config.system_prompt,
            self.config.context_window_tokens,
        );
        let mut request = CompletionRequest::new(&self.config.model, &self.config.system_prompt, messages)
            .with_tools(tools.to_vec());
        request.temperature = self.config.temperature;
        request.max_tokens = self.config.max_tokens;

        let provider_timeout = self.config.provider_timeout();
        let controller = self.controller();
        let mut deltas = match interrupt
            .guard(tokio::time::timeout(
                provider_timeout,
                controller.open(&request, routes, interrupt.cancel),
            ))
            .await?
        {
            Err(_) => return Err(OrchestratorError::Timeout(TimeoutScope::Provider)),
            Ok(Err(RetryError::Cancelled)) => return Err(OrchestratorError::Cancelled),
            Ok(Err(RetryError::Exhausted(error))) => return Err(error.into()),
            Ok(Ok(deltas)) => deltas,
        };

        turn.begin_draft()?;
        loop {
            let delta = match interrupt
                .guard(tokio::time::timeout(provider_timeout, deltas.next()))
                .await?
            {
                Err(_) => return Err(OrchestratorError::Timeout(TimeoutScope::Provider)),
                Ok(None) => {
                    return Err(OrchestratorError::TruncatedStream(
                        "provider stream ended without a terminal event".to_string(),
                    ))
                }
                Ok(Some(delta)) => delta,
            };

            match &delta {
                Delta::Done { stop_reason } => {
                    let stop_reason = stop_reason.clone();
                    turn.append_delta(&delta);
                    return Ok(stop_reason);
                }
                Delta::Error { error } => {
                    let error = error.clone();
                    turn.append_delta(&delta);
                    if turn.draft_truncated() {
                        return Err(OrchestratorError::TruncatedStream(error.message));
                    }
                    return Err(error.into());
                }
                _ => {
                    // Only what reached the client is kept
                    emit(sender, interrupt, ClientEvent::Delta { delta: delta.clone() }).await?;
                    turn.append_delta(&delta);
                }
            }
        }
    }

    /// Run the granted calls. Results come back in request order whatever
    /// order the calls finish in.
    async fn dispatch(
        &self,
        registry: &ToolRegistry,
        requests: &[ToolRequest],
        cancel: &CancellationToken,
    ) -> Vec<ToolResult<Vec<Content>>> {
        let mut prepared = Vec::with_capacity(requests.len());
        for request in requests {
            let call = match &request.tool_call {
                Ok(call) => registry
                    .resolve(&call.name)
                    .await
                    .map(|descriptor| (descriptor, call.arguments.clone())),
                Err(error) => Err(error.clone()),
            };
            prepared.push(call);
        }

        let sequential: Vec<bool> = prepared
            .iter()
            .map(|call| call.as_ref().is_ok_and(|(descriptor, _)| descriptor.sequential))
            .collect();
        let deadline = match self.config.tool_timeout_mode {
            ToolTimeoutMode::Shared => Some(Instant::now() + self.config.tool_timeout()),
            ToolTimeoutMode::PerCall => None,
        };

        let mut results = Vec::with_capacity(prepared.len());
        for batch in plan_batches(&sequential, self.config.dispatch) {
            let calls = batch.into_iter().map(|index| {
                let call = &prepared[index];
                async move {
                    let (descriptor, arguments) = match call {
                        Ok(call) => call,
                        Err(error) => return Err(error.clone()),
                    };
                    let timeout = deadline.map_or(self.config.tool_timeout(), |deadline| {
                        deadline.saturating_duration_since(Instant::now())
                    });
                    tracing::info!(tool = %descriptor.name, remote = descriptor.is_remote(), "calling tool");
                    registry
                        .invoke(descriptor, arguments.clone(), timeout, cancel)
                        .await
                }
            });
            results.extend(join_all(calls).await);
        }
        results
    }

    async fn finish(
        &self,
        mut turn: Turn,
        result: Result<Option<String>, OrchestratorError>,
        sender: &MuxSender,
    ) -> TurnOutcome {
        let (phase, event, error) = match result {
            Ok(stop_reason) => {
                let usage = turn.usage();
                (TurnPhase::Done, ClientEvent::Done { stop_reason, usage }, None)
            }
            Err(OrchestratorError::Cancelled) => {
                turn.cancel();
                preserve_partial(&mut turn, MessageStatus::Partial, ToolError::cancelled()).await;
                (
                    TurnPhase::Cancelled,
                    ClientEvent::Cancelled,
                    Some(OrchestratorError::Cancelled),
                )
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = turn.conversation_id(),
                    code = %error.code(),
                    error = %error,
                    "turn failed"
                );
                let abandoned = ToolError::unavailable("the turn ended before this call ran");
                preserve_partial(&mut turn, MessageStatus::Errored, abandoned).await;
                let event = ClientEvent::Error {
                    code: error.code(),
                    message: error.to_string(),
                };
                (TurnPhase::Failed, event, Some(error))
            }
        };

        if let Err(error) = sender.send(event).await {
            tracing::debug!(error = %error, "terminal event not delivered");
        }

        let usage = turn.usage();
        tracing::info!(
            conversation_id = turn.conversation_id(),
            phase = %phase,
            messages = turn.message_ids().len(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "turn finished"
        );
        TurnOutcome {
            phase,
            message_ids: turn.message_ids().to_vec(),
            usage,
            error,
        }
    }
}

/// Where a running turn may be stopped. Cancellation and the turn deadline
/// take effect only at the waits wrapped in `guard`, so a store write that
/// has started always completes.
struct Interrupt<'a> {
    cancel: &'a CancellationToken,
    deadline: tokio::time::Instant,
}

impl<'a> Interrupt<'a> {
    fn new(cancel: &'a CancellationToken, turn_timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: tokio::time::Instant::now() + turn_timeout,
        }
    }

    async fn guard<T>(&self, future: impl std::future::Future<Output = T>) -> Result<T, OrchestratorError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(OrchestratorError::Timeout(TimeoutScope::Turn)),
            value = future => Ok(value),
        }
    }
}

async fn emit(sender: &MuxSender, interrupt: &Interrupt<'_>, event: ClientEvent) -> Result<(), OrchestratorError> {
    interrupt.guard(sender.send(event)).await?.map_err(|error| {
        tracing::debug!(error = %error, "client stream closed");
        OrchestratorError::Cancelled
    })
}

async fn record_tool_result(
    turn: &mut Turn,
    sender: &MuxSender,
    interrupt: &Interrupt<'_>,
    request: &ToolRequest,
    result: ToolResult<Vec<Content>>,
) -> Result<(), OrchestratorError> {
    let (content, is_error) = match &result {
        Ok(content) => (content.clone(), false),
        Err(error) => (vec![Content::text(error.to_string())], true),
    };
    emit(
        sender,
        interrupt,
        ClientEvent::ToolResult {
            id: request.id.clone(),
            name: request.name.clone(),
            content,
            is_error,
        },
    )
    .await?;
    turn.append_tool_result(request, result).await?;
    Ok(())
}

/// Persist whatever the turn produced before it stopped, and answer any tool
/// requests left without a result so the history stays well formed.
async fn preserve_partial(turn: &mut Turn, status: MessageStatus, unanswered: ToolError) {
    if turn.draft_has_content() {
        if let Err(error) = turn.finalize_draft(status).await {
            tracing::error!(conversation_id = turn.conversation_id(), error = %error, "could not persist partial message");
            return;
        }
    } else {
        turn.discard_draft();
    }

    for request in turn.pending_tool_requests() {
        if let Err(error) = turn.append_tool_result(&request, Err(unanswered.clone())).await {
            tracing::error!(conversation_id = turn.conversation_id(), error = %error, "could not close tool request");
            return;
        }
    }
}

/// Group call indices into batches that run one after another; calls within a
/// batch run concurrently.
fn plan_batches(sequential: &[bool], policy: DispatchPolicy) -> Vec<Vec<usize>> {
    if sequential.is_empty() {
        return Vec::new();
    }
    match policy {
        DispatchPolicy::Parallel => vec![(0..sequential.len()).collect()],
        DispatchPolicy::Sequential => (0..sequential.len()).map(|index| vec![index]).collect(),
        DispatchPolicy::Auto => {
            let mut batches = Vec::new();
            let mut current = Vec::new();
            for (index, is_sequential) in sequential.iter().enumerate() {
                if *is_sequential {
                    if !current.is_empty() {
                        batches.push(std::mem::take(&mut current));
                    }
                    batches.push(vec![index]);
                } else {
                    current.push(index);
                }
            }
            if !current.is_empty() {
                batches.push(current);
            }
            batches
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::InMemoryStore;
    use crate::errors::StoreError;
    use crate::models::message::MessageContent;
    use crate::models::role::Role;
    use crate::models::tool::Tool;
    use crate::multiplexer::{self, MuxReceiver};
    use crate::providers::credential::{ProviderCredential, SecretRef};
    use crate::providers::mock::{MockProvider, MockResponse};
    use crate::tools::builtin::CalculatorTool;
    use crate::tools::ToolExecutor;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct DelayedTool {
        name: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl ToolExecutor for DelayedTool {
        fn tool(&self) -> Tool {
            Tool::new(self.name, "Answers after a delay", json!({"type": "object"}))
        }

        async fn execute(&self, _arguments: Value) -> ToolResult<Vec<Content>> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![Content::text(self.name)])
        }
    }

    /// Stores messages at once but acknowledges assistant messages late
    struct SlowAckStore {
        inner: InMemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl MessageStore for SlowAckStore {
        async fn append(&self, conversation_id: &str, message: Message) -> Result<(), StoreError> {
            let assistant = message.role == Role::Assistant;
            self.inner.append(conversation_id, message).await?;
            if assistant {
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        }

        async fn read_active_path(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
            self.inner.read_active_path(conversation_id).await
        }

        async fn set_leaf(&self, conversation_id: &str, message_id: &str) -> Result<(), StoreError> {
            self.inner.set_leaf(conversation_id, message_id).await
        }
    }

    fn agent(config: AgentConfig, responses: Vec<MockResponse>, registry: ToolRegistry) -> (Agent, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let agent = agent_with_store(config, responses, registry, store.clone());
        (agent, store)
    }

    fn agent_with_store<S: MessageStore + 'static>(
        config: AgentConfig,
        responses: Vec<MockResponse>,
        registry: ToolRegistry,
        store: Arc<S>,
    ) -> Agent {
        let route = Route::new(
            Arc::new(MockProvider::new("mock", responses)),
            Arc::new(ProviderCredential::new("mock", SecretRef::Literal("key".to_string()))),
        );
        let controller = RetryController::new(RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 10,
        });
        Agent::new(config, controller, vec![route], Arc::new(registry), store)
    }

    async fn collect(mut receiver: MuxReceiver) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            if !event.is_heartbeat() {
                events.push(event);
            }
        }
        events
    }

    async fn run(agent: &Agent, text: &str) -> (TurnOutcome, Vec<ClientEvent>) {
        let cancel = CancellationToken::new();
        let (sender, receiver) = multiplexer::channel(64, Duration::from_secs(60), cancel.clone());
        let request = ReplyRequest::new("c1", Message::user().with_text(text));
        let (outcome, events) = tokio::join!(agent.reply(request, sender, cancel), collect(receiver));
        (outcome, events)
    }

    #[test]
    fn test_plan_batches() {
        let flags = [false, false, true, false];
        assert_eq!(plan_batches(&flags, DispatchPolicy::Parallel), vec![vec![0, 1, 2, 3]]);
        assert_eq!(
            plan_batches(&flags, DispatchPolicy::Sequential),
            vec![vec![0], vec![1], vec![2], vec![3]]
        );
        assert_eq!(
            plan_batches(&flags, DispatchPolicy::Auto),
            vec![vec![0, 1], vec![2], vec![3]]
        );
        assert!(plan_batches(&[], DispatchPolicy::Auto).is_empty());
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: AgentConfig = serde_json::from_value(json!({
            "max_tool_calls": 2,
            "dispatch": "sequential",
            "tool_timeout_mode": "shared"
        }))
        .unwrap();
        assert_eq!(config.max_tool_calls, 2);
        assert_eq!(config.dispatch, DispatchPolicy::Sequential);
        assert_eq!(config.tool_timeout_mode, ToolTimeoutMode::Shared);
        assert_eq!(config.turn_policy, TurnPolicy::Wait);
        assert_eq!(config.tool_timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_results_are_recorded_in_request_order() {
        let registry = ToolRegistry::new(Default::default())
            .with_executor(Arc::new(DelayedTool { name: "slow", delay: Duration::from_millis(80) }))
            .with_executor(Arc::new(DelayedTool { name: "fast", delay: Duration::from_millis(1) }));
        let (agent, store) = agent(
            AgentConfig::default(),
            vec![
                MockResponse::tool_calls(&[("a", "slow", "{}"), ("b", "fast", "{}")]),
                MockResponse::text("both done"),
            ],
            registry,
        );

        let (outcome, events) = run(&agent, "go").await;
        assert_eq!(outcome.phase, TurnPhase::Done);

        let results: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                ClientEvent::ToolResult { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(results, vec!["a", "b"]);

        let path = store.read_active_path("c1").await.unwrap();
        let roles: Vec<Role> = path.iter().map(|message| message.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
        );
        assert_eq!(path[2].content[0].as_tool_response().unwrap().id, "a");
        assert_eq!(path[3].content[0].as_tool_response().unwrap().id, "b");
        assert_eq!(path[4].text(), "both done");
    }

    #[tokio::test]
    async fn test_per_call_tool_timeout_fails_the_turn() {
        let registry = ToolRegistry::new(Default::default())
            .with_executor(Arc::new(DelayedTool { name: "slow", delay: Duration::from_secs(5) }));
        let config = AgentConfig {
            tool_timeout_ms: 20,
            ..Default::default()
        };
        let (agent, store) = agent(
            config,
            vec![MockResponse::tool_calls(&[("a", "slow", "{}")])],
            registry,
        );

        let (outcome, events) = run(&agent, "go").await;
        assert_eq!(outcome.phase, TurnPhase::Failed);
        assert_eq!(outcome.error, Some(OrchestratorError::Timeout(TimeoutScope::Tool)));
        assert!(matches!(events.last(), Some(ClientEvent::Error { code, .. }) if code == "tool_timeout"));

        let path = store.read_active_path("c1").await.unwrap();
        let response = path.last().unwrap().content[0].as_tool_response().unwrap();
        assert_eq!(response.tool_result.as_ref().unwrap_err().kind, ToolErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_to_the_model() {
        let (agent, store) = agent(
            AgentConfig::default(),
            vec![
                MockResponse::tool_calls(&[("a", "missing", "{}")]),
                MockResponse::text("sorry"),
            ],
            ToolRegistry::new(Default::default()),
        );

        let (outcome, _) = run(&agent, "go").await;
        assert_eq!(outcome.phase, TurnPhase::Done);

        let path = store.read_active_path("c1").await.unwrap();
        let response = path[2].content[0].as_tool_response().unwrap();
        assert_eq!(response.tool_result.as_ref().unwrap_err().kind, ToolErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (agent, store) = agent(AgentConfig::default(), Vec::new(), ToolRegistry::new(Default::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (sender, receiver) = multiplexer::channel(8, Duration::from_secs(60), CancellationToken::new());

        let outcome = agent
            .reply(ReplyRequest::new("c1", Message::user().with_text("hi")), sender, cancel)
            .await;
        assert_eq!(outcome.phase, TurnPhase::Cancelled);
        assert_eq!(collect(receiver).await, vec![ClientEvent::Cancelled]);
        assert!(store.read_active_path("c1").await.unwrap().is_empty());
        assert_eq!(agent.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_store_write_answers_every_request() {
        let store = Arc::new(SlowAckStore {
            inner: InMemoryStore::new(),
            delay: Duration::from_millis(300),
        });
        let registry = ToolRegistry::new(Default::default()).with_executor(Arc::new(CalculatorTool));
        let agent = agent_with_store(
            AgentConfig::default(),
            vec![
                MockResponse::tool_calls(&[("a", "calculator", r#"{"expression": "2 + 2"}"#)]),
                MockResponse::text("4"),
            ],
            registry,
            store.clone(),
        );

        let cancel = CancellationToken::new();
        let (sender, receiver) = multiplexer::channel(64, Duration::from_secs(60), CancellationToken::new());
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let request = ReplyRequest::new("c1", Message::user().with_text("what is 2 + 2?"));
        let (outcome, events) = tokio::join!(agent.reply(request, sender, cancel), collect(receiver));

        assert_eq!(outcome.phase, TurnPhase::Cancelled);
        assert_eq!(events.last(), Some(&ClientEvent::Cancelled));

        let path = store.read_active_path("c1").await.unwrap();
        let roles: Vec<Role> = path.iter().map(|message| message.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);
        let requested: Vec<&str> = path[1]
            .tool_requests()
            .into_iter()
            .map(|request| request.id.as_str())
            .collect();
        assert_eq!(requested, vec!["a"]);
        let response = path[2]
            .content
            .iter()
            .find_map(MessageContent::as_tool_response)
            .unwrap();
        assert_eq!(response.id, "a");
        assert_eq!(
            response.tool_result.as_ref().unwrap_err().kind,
            ToolErrorKind::Cancelled
        );
    }

    #[tokio::test]
    async fn test_lock_table_is_empty_after_turns_finish() {
        let (agent, store) = agent(
            AgentConfig::default(),
            vec![
                MockResponse::text("one"),
                MockResponse::text("two"),
                MockResponse::text("three"),
            ],
            ToolRegistry::new(Default::default()),
        );

        let (outcome, _) = run(&agent, "first").await;
        assert_eq!(outcome.phase, TurnPhase::Done);
        assert_eq!(agent.locks.len(), 0);

        // The second turn waits on the first and both leave the table
        let ((first, _), (second, _)) = tokio::join!(run(&agent, "second"), run(&agent, "third"));
        assert_eq!(first.phase, TurnPhase::Done);
        assert_eq!(second.phase, TurnPhase::Done);
        assert_eq!(agent.locks.len(), 0);
        assert_eq!(store.read_active_path("c1").await.unwrap().len(), 6);
    }
}
