//! The conversation turn engine.
//!
//! One turn loads the stored history, appends the user's message and then
//! alternates model calls with tool execution until the model answers
//! without requesting tools or the call budget runs out. Whatever history
//! the turn built is persisted before the event stream ends.

pub mod cache;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::docs::types::Slug;
use crate::docs::DocumentStore;
use crate::error::{LlmError, TurnError};
use crate::llm::{ContentBlock, Message, ModelClient, ModelEvent, ModelRequest, ToolDefinition};
use crate::prompts;
use crate::state::AgentConfig;
use crate::tools::{ToolCall, ToolContext, ToolName};

use cache::refresh_cache_breakpoints;

const CANCELLED_TOOL_RESULT: &str = "Error: Turn cancelled before this tool ran.";

/// Progress reported to the caller while a turn runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ContentDelta { content: String },
    ToolUse { name: String },
}

/// An image sent along with the user's text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub mime_type: String,
    pub base64_data: String,
}

pub struct TurnEngine {
    model: Arc<dyn ModelClient>,
    store: Arc<DocumentStore>,
    tools: Arc<ToolContext>,
    config: AgentConfig,
    definitions: Vec<ToolDefinition>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TurnEngine {
    pub fn new(
        model: Arc<dyn ModelClient>,
        store: Arc<DocumentStore>,
        tools: Arc<ToolContext>,
        config: AgentConfig,
    ) -> Self {
        Self {
            model,
            store,
            tools,
            config,
            definitions: ToolName::registry(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Turns on one conversation run one after another.
    fn conversation_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|id, lock| id == conversation_id || Arc::strong_count(lock) > 1);
        locks
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    async fn system_prompt(&self) -> Result<String, TurnError> {
        let config = self.store.read(Slug::Config).await?;
        Ok(prompts::system_prompt(&config, Utc::now(), self.config.time_zone))
    }

    /// Run one turn. The returned stream yields text deltas and tool
    /// notifications; an error item, if any, is the last item.
    pub fn run_turn(
        self: Arc<Self>,
        conversation_id: String,
        text: String,
        images: Vec<ImageAttachment>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<AgentEvent, TurnError>> + Send + 'static {
        async_stream::stream! {
            let lock = self.conversation_lock(&conversation_id);
            let _turn = lock.lock().await;

            let mut messages = match self.store.load_conversation(&conversation_id).await {
                Ok(messages) => messages,
                Err(e) => {
                    error!(conversation_id = %conversation_id, error = %e, "failed to load history");
                    yield Err(TurnError::Store(e));
                    return;
                }
            };
            info!(conversation_id = %conversation_id, history = messages.len(), images = images.len(), "turn started");

            let mut content = vec![
                ContentBlock::text(prompts::system_reminder(Utc::now(), self.config.time_zone)),
                ContentBlock::text(text),
            ];
            content.extend(
                images
                    .into_iter()
                    .map(|image| ContentBlock::image(image.mime_type, image.base64_data)),
            );
            messages.push(Message::user(content));

            let mut failure: Option<TurnError> = None;
            let mut turns_left = self.config.max_turns;

            'turns: loop {
                if turns_left == 0 {
                    warn!(conversation_id = %conversation_id, max_turns = self.config.max_turns, "model call budget exhausted");
                    break;
                }
                turns_left -= 1;
                if cancel.is_cancelled() {
                    break;
                }

                refresh_cache_breakpoints(&mut messages);
                let system = match self.system_prompt().await {
                    Ok(system) => system,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                };

                let request = ModelRequest {
                    system: &system,
                    messages: &messages,
                    tools: &self.definitions,
                };
                let opened = tokio::select! {
                    opened = self.model.stream(request) => Some(opened),
                    _ = cancel.cancelled() => None,
                };
                let mut stream = match opened {
                    Some(Ok(stream)) => stream,
                    Some(Err(e)) => {
                        failure = Some(e.into());
                        break;
                    }
                    None => break,
                };

                let mut completed = None;
                loop {
                    let next = tokio::select! {
                        next = stream.next() => next,
                        _ = cancel.cancelled() => None,
                    };
                    match next {
                        Some(Ok(ModelEvent::TextDelta(delta))) => {
                            yield Ok(AgentEvent::ContentDelta { content: delta });
                        }
                        Some(Ok(ModelEvent::Completed(message))) => {
                            completed = Some(message);
                            break;
                        }
                        Some(Err(e)) => {
                            failure = Some(e.into());
                            break;
                        }
                        None => break,
                    }
                }
                if failure.is_some() || cancel.is_cancelled() {
                    break;
                }
                let Some(message) = completed else {
                    failure = Some(LlmError::Stream("stream ended before the message completed".into()).into());
                    break;
                };

                let tool_uses = message.tool_uses();
                if !message.content.is_empty() {
                    messages.push(message);
                }
                debug!(conversation_id = %conversation_id, tools = tool_uses.len(), turns_left, "model call completed");
                if tool_uses.is_empty() {
                    break;
                }

                let mut resolved = Vec::with_capacity(tool_uses.len());
                for tool_use in tool_uses {
                    match ToolName::from_name(&tool_use.name) {
                        Some(name) => resolved.push((name, tool_use)),
                        None => {
                            error!(conversation_id = %conversation_id, tool = %tool_use.name, "model requested an unregistered tool");
                            messages.pop();
                            failure = Some(TurnError::UnknownTool(tool_use.name));
                            break 'turns;
                        }
                    }
                }

                for (name, _) in &resolved {
                    yield Ok(AgentEvent::ToolUse { name: name.to_string() });
                }

                let mut results = Vec::with_capacity(resolved.len());
                for (name, tool_use) in resolved {
                    let output = if cancel.is_cancelled() {
                        CANCELLED_TOOL_RESULT.to_string()
                    } else {
                        match ToolCall::parse(name, tool_use.input) {
                            Ok(call) => self.tools.dispatch(call, &cancel).await,
                            Err(e) => e.to_string(),
                        }
                    };
                    results.push(ContentBlock::tool_result(tool_use.id, output));
                }
                messages.push(Message::user(results));
            }

            if cancel.is_cancelled() && failure.is_none() {
                info!(conversation_id = %conversation_id, "turn cancelled");
            }
            if let Err(e) = self.store.save_conversation(&conversation_id, &messages).await {
                error!(conversation_id = %conversation_id, error = %e, "failed to persist history");
                failure.get_or_insert(TurnError::Store(e));
            }

            match failure {
                Some(e) => {
                    error!(conversation_id = %conversation_id, error = %e, "turn aborted");
                    yield Err(e);
                }
                None => info!(conversation_id = %conversation_id, history = messages.len(), "turn finished"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::schema::{Log, LogEntry, StructuredDocument};
    use crate::llm::{CacheControl, ModelStream, Role};
    use crate::tools::testing;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;

    enum Reply {
        Message(Vec<ContentBlock>),
        Fail,
    }

    /// Plays back scripted replies; once the script runs out it keeps
    /// asking for the log document.
    struct ScriptedModel {
        replies: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn stream(&self, request: ModelRequest<'_>) -> Result<ModelStream, LlmError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(request.messages.to_vec());
                calls.len()
            };
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
                Reply::Message(vec![tool_use(&format!("toolu_{}", n), "ReadDocument", json!({"slug": "log"}))])
            });
            let content = match reply {
                Reply::Message(content) => content,
                Reply::Fail => return Err(LlmError::Api { status: 529, body: "overloaded".into() }),
            };

            let mut events: Vec<Result<ModelEvent, LlmError>> = content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text, .. } => Some(Ok(ModelEvent::TextDelta(text.clone()))),
                    _ => None,
                })
                .collect();
            events.push(Ok(ModelEvent::Completed(Message::assistant(content))));
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    fn tool_use(id: &str, name: &str, input: serde_json::Value) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }

    fn engine(model: Arc<ScriptedModel>) -> (Arc<TurnEngine>, Arc<DocumentStore>) {
        let tools = testing::context();
        let store = tools.store.clone();
        let engine = TurnEngine::new(model, store.clone(), Arc::new(tools), AgentConfig::default());
        (Arc::new(engine), store)
    }

    async fn run(
        engine: &Arc<TurnEngine>,
        text: &str,
        cancel: CancellationToken,
    ) -> Vec<Result<AgentEvent, TurnError>> {
        engine
            .clone()
            .run_turn("c1".to_string(), text.to_string(), vec![], cancel)
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_text_reply_streams_and_persists() {
        let model = ScriptedModel::new(vec![Reply::Message(vec![ContentBlock::text("Moi!")])]);
        let (engine, store) = engine(model.clone());

        let events = run(&engine, "Hei", CancellationToken::new()).await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].as_ref().unwrap(),
            &AgentEvent::ContentDelta { content: "Moi!".to_string() }
        );

        let history = store.load_conversation("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert!(matches!(&history[0].content[0], ContentBlock::Text { text, .. } if text.starts_with("<system_reminder>")));
        assert!(matches!(&history[0].content[1], ContentBlock::Text { text, .. } if text == "Hei"));
        assert_eq!(history[1], Message::assistant(vec![ContentBlock::text("Moi!")]));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_tools_run_in_model_order_with_one_result_message() {
        let model = ScriptedModel::new(vec![
            Reply::Message(vec![
                ContentBlock::text("Kirjaan."),
                tool_use("A", "AppendWeightLogEntry", json!({"weight": 82.4, "date": "2024-01-03"})),
                tool_use("B", "AppendWeightLogEntry", json!({"weight": 82.0, "date": "2024-01-01"})),
                tool_use("C", "AppendWeightLogEntry", json!({"weight": -1})),
            ]),
            Reply::Message(vec![ContentBlock::text("Valmis.")]),
        ]);
        let (engine, store) = engine(model.clone());

        let events = run(&engine, "paino", CancellationToken::new()).await;
        let events: Vec<AgentEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                AgentEvent::ContentDelta { content: "Kirjaan.".into() },
                AgentEvent::ToolUse { name: "AppendWeightLogEntry".into() },
                AgentEvent::ToolUse { name: "AppendWeightLogEntry".into() },
                AgentEvent::ToolUse { name: "AppendWeightLogEntry".into() },
                AgentEvent::ContentDelta { content: "Valmis.".into() },
            ]
        );

        let history = store.load_conversation("c1").await.unwrap();
        assert_eq!(history.len(), 4);
        let results: Vec<(&str, &str)> = history[2]
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::ToolResult { tool_use_id, content, .. } => {
                    (tool_use_id.as_str(), content.as_str())
                }
                other => panic!("unexpected block {:?}", other),
            })
            .collect();
        assert_eq!(results.iter().map(|r| r.0).collect::<Vec<_>>(), vec!["A", "B", "C"]);
        assert!(results[0].1.starts_with("Weight log entry recorded"));
        assert_eq!(results[2].1, "Error: Weight must be a positive number.");

        let log = Log::parse(&store.read(Slug::Log).await.unwrap()).unwrap();
        let weights: Vec<f64> = log
            .entries
            .iter()
            .map(|entry| match entry {
                LogEntry::Weight(w) => w.weight,
                LogEntry::Food(_) => panic!("unexpected food entry"),
            })
            .collect();
        assert_eq!(weights, vec![82.0, 82.4]);

        // The second call saw the tool results flagged for caching.
        let calls = model.calls.lock().unwrap();
        let last_result = calls[1][2].content.last().unwrap();
        assert!(last_result.cache_control().is_some());
    }

    #[tokio::test]
    async fn test_model_calls_stop_at_budget() {
        let model = ScriptedModel::new(vec![]);
        let (engine, store) = engine(model.clone());

        let events = run(&engine, "loop", CancellationToken::new()).await;
        assert!(events.iter().all(Result::is_ok));
        assert_eq!(model.call_count(), 16);

        let history = store.load_conversation("c1").await.unwrap();
        assert_eq!(history.len(), 1 + 16 * 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_aborts_and_keeps_history_consistent() {
        let model = ScriptedModel::new(vec![Reply::Message(vec![tool_use(
            "X",
            "DeleteEverything",
            json!({}),
        )])]);
        let (engine, store) = engine(model);

        let events = run(&engine, "hi", CancellationToken::new()).await;
        assert!(matches!(events.last(), Some(Err(TurnError::UnknownTool(name))) if name == "DeleteEverything"));

        let history = store.load_conversation("c1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_collaborator_failure_persists_completed_steps() {
        let model = ScriptedModel::new(vec![
            Reply::Message(vec![tool_use("A", "ReadDocument", json!({"slug": "foo"}))]),
            Reply::Fail,
        ]);
        let (engine, store) = engine(model);

        let events = run(&engine, "hi", CancellationToken::new()).await;
        assert!(matches!(events.last(), Some(Err(TurnError::Collaborator(_)))));

        let history = store.load_conversation("c1").await.unwrap();
        assert_eq!(history.len(), 3);
        // The breakpoint set before the failed call is stored with it.
        let mut result = ContentBlock::tool_result("A", "Error: Unknown document slug: foo");
        result.set_cache_control(Some(CacheControl::Ephemeral));
        assert_eq!(history[2].content, vec![result]);
    }

    #[tokio::test]
    async fn test_history_accumulates_across_turns() {
        let model = ScriptedModel::new(vec![
            Reply::Message(vec![ContentBlock::text("1")]),
            Reply::Message(vec![ContentBlock::text("2")]),
        ]);
        let (engine, store) = engine(model.clone());

        run(&engine, "first", CancellationToken::new()).await;
        run(&engine, "second", CancellationToken::new()).await;

        assert_eq!(store.load_conversation("c1").await.unwrap().len(), 4);
        assert_eq!(model.calls.lock().unwrap()[1].len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_turn_still_persists_user_message() {
        let model = ScriptedModel::new(vec![]);
        let (engine, store) = engine(model.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let events = run(&engine, "hi", cancel).await;
        assert!(events.is_empty());
        assert_eq!(model.call_count(), 0);
        assert_eq!(store.load_conversation("c1").await.unwrap().len(), 1);
    }
}
