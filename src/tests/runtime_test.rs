use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::memory::{
    LocalMemoryStore, MemoryEntry, MemoryQuery, MemoryStore, ScoredEntry,
};
use crate::runtime::{AgentRuntime, InvokeRequest, ModelRuntime, ProcessRuntime};
use crate::shim::MockShim;
use crate::state::{InMemoryStateStore, StateStore};
use crate::tests::utils::test_definition;
use crate::types::{AgentDefinition, ChatMessage, StateVarSchema};

struct Fixture {
    state: Arc<InMemoryStateStore>,
    memory: Arc<LocalMemoryStore>,
    runtime: ModelRuntime,
}

fn fixture(shim: MockShim, attempts: u32) -> Fixture {
    let state = Arc::new(InMemoryStateStore::new());
    let memory = Arc::new(LocalMemoryStore::new());
    let runtime = ModelRuntime::new(
        Arc::new(shim),
        state.clone(),
        memory.clone(),
        attempts,
    );
    Fixture {
        state,
        memory,
        runtime,
    }
}

fn invoke_request(definition: AgentDefinition, input: serde_json::Value) -> InvokeRequest {
    InvokeRequest {
        agent_id: definition.name.clone(),
        session_id: format!("test:{}", definition.name),
        definition: Arc::new(definition),
        input,
        params: HashMap::new(),
        deadline: Duration::from_secs(5),
        cancel: CancellationToken::new(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn invoke_renders_template_and_persists_history() -> anyhow::Result<()> {
    let fixture = fixture(MockShim::new(), 1);
    let mut definition = test_definition("upper", "mock/upper");
    definition.prompt_template = "say: {input}".to_string();

    let output = fixture
        .runtime
        .invoke(invoke_request(definition, json!("hi")))
        .await?;
    assert_eq!(output.as_text().unwrap(), "SAY: HI");

    let history = fixture.state.get_history("test:upper").await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].as_text(), Some("hi"));
    assert_eq!(history[1].as_text(), Some("SAY: HI"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn history_feeds_the_next_prompt() -> anyhow::Result<()> {
    let fixture = fixture(MockShim::new(), 1);
    let definition = test_definition("chat", "mock/echo");

    fixture
        .runtime
        .invoke(invoke_request(definition.clone(), json!("first")))
        .await?;
    let second = fixture
        .runtime
        .invoke(invoke_request(definition, json!("second")))
        .await?;

    // Echo returns the synthesized prompt, so the prior exchange is visible.
    let text = second.as_text().unwrap();
    assert!(text.contains("user: first"), "{text}");
    assert!(text.contains("assistant: first"), "{text}");
    assert!(text.ends_with("second"), "{text}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn declared_state_variables_are_maintained() -> anyhow::Result<()> {
    let fixture = fixture(MockShim::new(), 1);
    let mut definition = test_definition("stateful", "mock/upper");
    definition.state_schema.insert(
        "steps".to_string(),
        StateVarSchema {
            var_type: "counter".to_string(),
            default: None,
        },
    );
    definition.state_schema.insert(
        "last_response".to_string(),
        StateVarSchema::default(),
    );
    definition.state_schema.insert(
        "mode".to_string(),
        StateVarSchema {
            var_type: "string".to_string(),
            default: Some(json!("idle")),
        },
    );

    fixture
        .runtime
        .invoke(invoke_request(definition.clone(), json!("a")))
        .await?;
    fixture
        .runtime
        .invoke(invoke_request(definition, json!("b")))
        .await?;

    assert_eq!(fixture.state.get("stateful", "steps").await?, Some(json!(2)));
    assert_eq!(
        fixture.state.get("stateful", "last_response").await?,
        Some(json!("B"))
    );
    assert_eq!(fixture.state.get("stateful", "mode").await?, Some(json!("idle")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_shim_errors_are_retried() -> anyhow::Result<()> {
    let shim = MockShim::new().with_transient_failures(2);
    let fixture = fixture(shim, 3);
    let output = fixture
        .runtime
        .invoke(invoke_request(test_definition("u", "mock/upper"), json!("ok")))
        .await?;
    assert_eq!(output.as_text().unwrap(), "OK");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_budget_is_bounded() {
    let shim = MockShim::new().with_transient_failures(5);
    let fixture = fixture(shim, 2);
    let err = fixture
        .runtime
        .invoke(invoke_request(test_definition("u", "mock/upper"), json!("x")))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Shim(_)), "{err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn unrecognized_param_types_are_rejected() {
    let fixture = fixture(MockShim::new(), 1);
    let mut request = invoke_request(test_definition("u", "mock/upper"), json!("x"));
    request
        .params
        .insert("temperature".to_string(), json!("warm"));

    let err = fixture.runtime.invoke(request).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Params(_)), "{err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn remember_and_recall_use_agent_memory() -> anyhow::Result<()> {
    let fixture = fixture(MockShim::new(), 1);
    let definition = test_definition("scribe", "mock/echo");

    let mut request = invoke_request(definition.clone(), json!("the sky is teal"));
    request.params.insert("remember".to_string(), json!(true));
    fixture.runtime.invoke(request).await?;

    let stored = fixture
        .memory
        .query("scribe", MemoryQuery::Text("teal".to_string()), 10, None)
        .await?;
    assert_eq!(stored.len(), 1);

    let mut recall = invoke_request(definition, json!("the sky"));
    recall.params.insert("recall".to_string(), json!(true));
    let output = fixture.runtime.invoke(recall).await?;
    let text = output.as_text().unwrap();
    assert!(text.contains("Relevant memory:"), "{text}");
    assert!(text.contains("teal"), "{text}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn recall_only_sees_its_own_scope() -> anyhow::Result<()> {
    let fixture = fixture(MockShim::new(), 1);
    fixture
        .memory
        .add(MemoryEntry::new("other", "", json!("what a secret")))
        .await?;

    let mut request = invoke_request(test_definition("reader", "mock/echo"), json!("what"));
    request.params.insert("recall".to_string(), json!(true));
    let output = fixture.runtime.invoke(request).await?;
    assert!(!output.as_text().unwrap().contains("secret"));
    Ok(())
}

/// State store that fails the first `read_failures` reads and, when
/// `fail_writes` is set, every write. Write attempts are counted so tests
/// can assert writes fail fast with no retry.
struct FlakyStateStore {
    inner: InMemoryStateStore,
    read_failures: AtomicU32,
    fail_writes: bool,
    write_attempts: AtomicU32,
}

impl FlakyStateStore {
    fn failing_reads(count: u32) -> Self {
        Self {
            inner: InMemoryStateStore::new(),
            read_failures: AtomicU32::new(count),
            fail_writes: false,
            write_attempts: AtomicU32::new(0),
        }
    }

    fn failing_writes() -> Self {
        Self {
            inner: InMemoryStateStore::new(),
            read_failures: AtomicU32::new(0),
            fail_writes: true,
            write_attempts: AtomicU32::new(0),
        }
    }

    fn take_read_failure(&self) -> bool {
        self.read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record_write(&self) -> anyhow::Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            anyhow::bail!("injected write failure");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for FlakyStateStore {
    async fn get(&self, agent_id: &str, key: &str) -> anyhow::Result<Option<Value>> {
        if self.take_read_failure() {
            anyhow::bail!("injected read failure");
        }
        self.inner.get(agent_id, key).await
    }

    async fn set(&self, agent_id: &str, key: &str, value: Value) -> anyhow::Result<()> {
        self.record_write()?;
        self.inner.set(agent_id, key, value).await
    }

    async fn get_all(&self, agent_id: &str) -> anyhow::Result<HashMap<String, Value>> {
        if self.take_read_failure() {
            anyhow::bail!("injected read failure");
        }
        self.inner.get_all(agent_id).await
    }

    async fn clear(&self, agent_id: &str) -> anyhow::Result<()> {
        self.record_write()?;
        self.inner.clear(agent_id).await
    }

    async fn get_history(&self, session_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        if self.take_read_failure() {
            anyhow::bail!("injected read failure");
        }
        self.inner.get_history(session_id).await
    }

    async fn append_history(&self, session_id: &str, message: ChatMessage) -> anyhow::Result<()> {
        self.record_write()?;
        self.inner.append_history(session_id, message).await
    }

    async fn clear_history(&self, session_id: &str) -> anyhow::Result<()> {
        self.record_write()?;
        self.inner.clear_history(session_id).await
    }
}

/// Memory store that fails the first `read_failures` reads.
struct FlakyMemoryStore {
    inner: LocalMemoryStore,
    read_failures: AtomicU32,
}

impl FlakyMemoryStore {
    fn failing_reads(count: u32) -> Self {
        Self {
            inner: LocalMemoryStore::new(),
            read_failures: AtomicU32::new(count),
        }
    }

    fn take_read_failure(&self) -> bool {
        self.read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl MemoryStore for FlakyMemoryStore {
    async fn add(&self, entry: MemoryEntry) -> anyhow::Result<String> {
        self.inner.add(entry).await
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<MemoryEntry>> {
        if self.take_read_failure() {
            anyhow::bail!("injected read failure");
        }
        self.inner.get(id).await
    }

    async fn query(
        &self,
        scope: &str,
        query: MemoryQuery,
        top_k: usize,
        threshold: Option<f32>,
    ) -> anyhow::Result<Vec<ScoredEntry>> {
        if self.take_read_failure() {
            anyhow::bail!("injected read failure");
        }
        self.inner.query(scope, query, top_k, threshold).await
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.inner.delete(id).await
    }

    async fn clear(&self, scope: &str) -> anyhow::Result<()> {
        self.inner.clear(scope).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_state_reads_are_retried_once() -> anyhow::Result<()> {
    let state = Arc::new(FlakyStateStore::failing_reads(1));
    let runtime = ModelRuntime::new(
        Arc::new(MockShim::new()),
        state.clone(),
        Arc::new(LocalMemoryStore::new()),
        1,
    );

    // The history read fails once; the retry sees the working store.
    let output = runtime
        .invoke(invoke_request(test_definition("u", "mock/upper"), json!("ok")))
        .await?;
    assert_eq!(output.as_text().unwrap(), "OK");
    assert_eq!(state.get_history("test:u").await?.len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_state_read_failure_fails_the_step() {
    // Both the read and its single retry fail.
    let state = Arc::new(FlakyStateStore::failing_reads(2));
    let runtime = ModelRuntime::new(
        Arc::new(MockShim::new()),
        state,
        Arc::new(LocalMemoryStore::new()),
        1,
    );

    let err = runtime
        .invoke(invoke_request(test_definition("u", "mock/upper"), json!("x")))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::State(_)), "{err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_memory_reads_are_retried_once() -> anyhow::Result<()> {
    let memory = Arc::new(FlakyMemoryStore::failing_reads(1));
    memory
        .add(MemoryEntry::new("scribe", "", json!("the sky is teal")))
        .await?;
    let runtime = ModelRuntime::new(
        Arc::new(MockShim::new()),
        Arc::new(InMemoryStateStore::new()),
        memory,
        1,
    );

    let mut request = invoke_request(test_definition("scribe", "mock/echo"), json!("the sky"));
    request.params.insert("recall".to_string(), json!(true));
    let output = runtime.invoke(request).await?;
    assert!(output.as_text().unwrap().contains("teal"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn state_writes_fail_fast_without_retry() {
    let state = Arc::new(FlakyStateStore::failing_writes());
    let runtime = ModelRuntime::new(
        Arc::new(MockShim::new()),
        state.clone(),
        Arc::new(LocalMemoryStore::new()),
        1,
    );

    let err = runtime
        .invoke(invoke_request(test_definition("u", "mock/upper"), json!("x")))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::State(_)), "{err:?}");
    // The failed history append was attempted exactly once.
    assert_eq!(state.write_attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn process_runtime_pipes_json_payload() -> anyhow::Result<()> {
    let state = Arc::new(InMemoryStateStore::new());
    let runtime = ProcessRuntime::new(state.clone());

    let mut request = invoke_request(test_definition("external", "unused"), json!("ping"));
    request.params.insert("command".to_string(), json!("cat"));
    let output = runtime.invoke(request).await?;

    // `cat` echoes the payload back, which parses as a JSON object.
    assert_eq!(output.values.get("agent"), Some(&json!("external")));
    assert_eq!(output.values.get("input"), Some(&json!("ping")));
    assert_eq!(state.get_history("test:external").await?.len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn process_runtime_accepts_plain_text_output() -> anyhow::Result<()> {
    let state = Arc::new(InMemoryStateStore::new());
    let runtime = ProcessRuntime::new(state);

    let mut request = invoke_request(test_definition("shell", "unused"), json!("x"));
    request.params.insert("command".to_string(), json!("sh"));
    request
        .params
        .insert("args".to_string(), json!(["-c", "echo plain words"]));
    let output = runtime.invoke(request).await?;
    assert_eq!(output.as_text().unwrap(), "plain words");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn process_runtime_requires_a_command() {
    let runtime = ProcessRuntime::new(Arc::new(InMemoryStateStore::new()));
    let err = runtime
        .invoke(invoke_request(test_definition("none", "unused"), json!("x")))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Params(_)), "{err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn process_runtime_surfaces_nonzero_exit() {
    let runtime = ProcessRuntime::new(Arc::new(InMemoryStateStore::new()));
    let mut request = invoke_request(test_definition("bad", "unused"), json!("x"));
    request.params.insert("command".to_string(), json!("sh"));
    request
        .params
        .insert("args".to_string(), json!(["-c", "echo oops >&2; exit 3"]));

    let err = runtime.invoke(request).await.unwrap_err();
    let RuntimeError::Process(message) = err else {
        panic!("expected Process error");
    };
    assert!(message.contains("oops"), "{message}");
}
