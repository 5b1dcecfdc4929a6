use anyhow::anyhow;
use async_trait::async_trait;
use databot_core::{
    AgentLoop, ContentBlock, Message, MessageContent, Model, ModelRequest, ModelResponse, Role,
    ToolDescriptor, ToolOutput, ToolRegistry, ToolSession, TurnError,
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct ScriptedModel {
    responses: Mutex<VecDeque<anyhow::Result<ModelResponse>>>,
    requests: Mutex<Vec<Vec<Message>>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    fn new(responses: Vec<anyhow::Result<ModelResponse>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    fn slow(responses: Vec<anyhow::Result<ModelResponse>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Model for ScriptedModel {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        "scripted-1"
    }

    async fn create_message(&self, request: ModelRequest<'_>) -> anyhow::Result<ModelResponse> {
        self.requests.lock().unwrap().push(request.messages.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("script exhausted")))
    }
}

type Handler = Box<dyn Fn(&str, &Value) -> anyhow::Result<ToolOutput> + Send + Sync>;

struct MockSession {
    name: String,
    calls: Mutex<Vec<(String, Value)>>,
    handler: Handler,
    delay: Option<Duration>,
}

impl MockSession {
    fn new(name: &str, handler: Handler) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: Mutex::new(Vec::new()),
            handler,
            delay: None,
        })
    }

    fn echo(name: &str) -> Arc<Self> {
        Self::new(
            name,
            Box::new(|tool: &str, args: &Value| Ok(ToolOutput::success(json!({ "tool": tool, "args": args })))),
        )
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolSession for MockSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>> {
        Ok(vec![])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<ToolOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(name, &arguments)
    }
}

fn descriptor(name: &str) -> ToolDescriptor {
    ToolDescriptor::new(name, format!("{name} tool"), json!({"type": "object"}))
}

fn registry_with(session: Arc<MockSession>, tools: &[&str]) -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(
        "postgres",
        tools.iter().map(|t| descriptor(t)).collect(),
        session,
    );
    registry
}

fn text(t: &str) -> anyhow::Result<ModelResponse> {
    Ok(ModelResponse::new(vec![ContentBlock::text(t)]))
}

fn blocks(content: Vec<ContentBlock>) -> anyhow::Result<ModelResponse> {
    Ok(ModelResponse::new(content).with_usage(10, 5))
}

fn tool_results(message: &Message) -> Vec<(String, Value, Option<bool>)> {
    assert_eq!(message.role, Role::User);
    match &message.content {
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => (tool_use_id.clone(), content.clone(), *is_error),
                other => panic!("expected tool result, got {other:?}"),
            })
            .collect(),
        MessageContent::Text(t) => panic!("expected blocks, got text {t}"),
    }
}

#[tokio::test]
async fn single_text_response_is_returned_without_tool_calls() {
    let model = ScriptedModel::new(vec![text("Hello!")]);
    let session = MockSession::echo("postgres");
    let agent = AgentLoop::new(model.clone(), registry_with(session.clone(), &["get_tables"]));

    let answer = agent.process("Hello!").await.unwrap();

    assert_eq!(answer, "Hello!");
    assert!(session.calls().is_empty());
    assert_eq!(model.requests(), vec![vec![Message::user("Hello!")]]);
}

#[tokio::test]
async fn list_tables_round_trip() {
    let model = ScriptedModel::new(vec![
        blocks(vec![ContentBlock::tool_use("toolu_01", "get_tables", json!({}))]),
        text("You have 2 tables: orders, customers."),
    ]);
    let session = MockSession::new(
        "postgres",
        Box::new(|_: &str, _: &Value| Ok(ToolOutput::success(json!({"tables": ["orders", "customers"]})))),
    );
    let agent = AgentLoop::new(model.clone(), registry_with(session.clone(), &["get_tables"]));

    let answer = agent.process("list tables").await.unwrap();

    assert_eq!(answer, "You have 2 tables: orders, customers.");
    assert_eq!(session.calls(), vec![("get_tables".to_string(), json!({}))]);

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    let second = &requests[1];
    assert_eq!(second.len(), 3);
    assert_eq!(second[0], Message::user("list tables"));
    assert_eq!(
        second[1],
        Message::assistant(vec![ContentBlock::tool_use("toolu_01", "get_tables", json!({}))])
    );
    assert_eq!(
        tool_results(&second[2]),
        vec![(
            "toolu_01".to_string(),
            json!({"tables": ["orders", "customers"]}),
            None
        )]
    );
}

#[tokio::test]
async fn several_tool_uses_are_each_correlated_before_next_model_call() {
    let model = ScriptedModel::new(vec![
        blocks(vec![
            ContentBlock::text("Checking both schemas."),
            ContentBlock::tool_use("toolu_a", "get_schema", json!({"table_name": "orders"})),
            ContentBlock::tool_use("toolu_b", "get_schema", json!({"table_name": "customers"})),
        ]),
        text("Both tables share customer_id."),
    ]);
    let session = MockSession::echo("postgres");
    let agent = AgentLoop::new(model.clone(), registry_with(session.clone(), &["get_schema"]));

    let answer = agent.process("compare schemas").await.unwrap();
    assert_eq!(answer, "Both tables share customer_id.");

    assert_eq!(
        session.calls(),
        vec![
            ("get_schema".to_string(), json!({"table_name": "orders"})),
            ("get_schema".to_string(), json!({"table_name": "customers"})),
        ]
    );

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    let results = tool_results(requests[1].last().unwrap());
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "toolu_a");
    assert_eq!(results[0].1["args"], json!({"table_name": "orders"}));
    assert_eq!(results[1].0, "toolu_b");
    assert_eq!(results[1].1["args"], json!({"table_name": "customers"}));
}

#[tokio::test]
async fn transcript_only_grows() {
    let model = ScriptedModel::new(vec![
        blocks(vec![ContentBlock::tool_use("t1", "get_tables", json!({}))]),
        blocks(vec![ContentBlock::tool_use("t2", "get_schema", json!({"table_name": "orders"}))]),
        blocks(vec![
            ContentBlock::text("One more."),
            ContentBlock::tool_use("t3", "execute_query", json!({"sql": "SELECT count(*) FROM orders"})),
        ]),
        text("There are 42 orders."),
    ]);
    let session = MockSession::echo("postgres");
    let agent = AgentLoop::new(
        model.clone(),
        registry_with(session, &["get_tables", "get_schema", "execute_query"]),
    );

    assert_eq!(agent.process("how many orders?").await.unwrap(), "There are 42 orders.");

    let requests = model.requests();
    assert_eq!(requests.len(), 4);
    for pair in requests.windows(2) {
        let (before, after) = (&pair[0], &pair[1]);
        assert_eq!(after.len(), before.len() + 2);
        assert_eq!(&after[..before.len()], before.as_slice());
    }
}

#[tokio::test]
async fn unknown_tool_fails_before_any_invocation() {
    let model = ScriptedModel::new(vec![blocks(vec![
        ContentBlock::tool_use("t1", "get_tables", json!({})),
        ContentBlock::tool_use("t2", "drop_everything", json!({})),
    ])]);
    let session = MockSession::echo("postgres");
    let agent = AgentLoop::new(model, registry_with(session.clone(), &["get_tables"]));

    let err = agent.process("clean up").await.unwrap_err();

    assert!(matches!(err, TurnError::UnknownTool(ref name) if name == "drop_everything"));
    assert!(session.calls().is_empty());
}

#[tokio::test]
async fn provider_failure_aborts_turn_with_tool_invocation_error() {
    let model = ScriptedModel::new(vec![
        blocks(vec![ContentBlock::tool_use("t1", "execute_query", json!({"sql": "SELECT 1"}))]),
        text("unreachable"),
    ]);
    let session = MockSession::new(
        "postgres",
        Box::new(|_: &str, _: &Value| Err(anyhow!("connection refused"))),
    );
    let agent = AgentLoop::new(model.clone(), registry_with(session, &["execute_query"]));

    let err = agent.process("run it").await.unwrap_err();

    match err {
        TurnError::ToolInvocation { tool, source } => {
            assert_eq!(tool, "execute_query");
            assert!(source.to_string().contains("connection refused"));
        }
        other => panic!("expected ToolInvocation, got {other:?}"),
    }
    assert_eq!(model.requests().len(), 1);
}

#[tokio::test]
async fn tool_error_payload_is_passed_back_to_model() {
    let model = ScriptedModel::new(vec![
        blocks(vec![ContentBlock::tool_use("t1", "execute_query", json!({"sql": "DELETE FROM orders"}))]),
        text("Only SELECT queries are allowed."),
    ]);
    let session = MockSession::new(
        "postgres",
        Box::new(|_: &str, _: &Value| Ok(ToolOutput::error(json!([{"type": "text", "text": "Only SELECT queries are allowed"}])))),
    );
    let agent = AgentLoop::new(model.clone(), registry_with(session, &["execute_query"]));

    assert_eq!(
        agent.process("delete orders").await.unwrap(),
        "Only SELECT queries are allowed."
    );
    let results = tool_results(model.requests()[1].last().unwrap());
    assert_eq!(results[0].2, Some(true));
}

#[tokio::test]
async fn model_failure_is_model_call_error() {
    let model = ScriptedModel::new(vec![Err(anyhow!("overloaded"))]);
    let agent = AgentLoop::new(model, registry_with(MockSession::echo("postgres"), &[]));

    let err = agent.process("hi").await.unwrap_err();
    assert!(matches!(err, TurnError::ModelCall(_)));
    assert!(err.to_string().contains("overloaded"));
}

#[tokio::test]
async fn endless_tool_calls_hit_turn_limit() {
    let responses = (0..5)
        .map(|i| blocks(vec![ContentBlock::tool_use(format!("t{i}"), "get_tables", json!({}))]))
        .collect();
    let model = ScriptedModel::new(responses);
    let session = MockSession::echo("postgres");
    let agent = AgentLoop::new(model.clone(), registry_with(session.clone(), &["get_tables"]))
        .with_max_turns(2);

    let err = agent.process("loop forever").await.unwrap_err();

    assert!(matches!(err, TurnError::TurnLimitExceeded { limit: 2 }));
    assert_eq!(session.calls().len(), 2);
    assert_eq!(model.requests().len(), 3);
}

#[tokio::test]
async fn response_without_answer_or_tool_use_is_stalled() {
    let model = ScriptedModel::new(vec![blocks(vec![
        ContentBlock::text("Part one."),
        ContentBlock::text("Part two."),
    ])]);
    let agent = AgentLoop::new(model, registry_with(MockSession::echo("postgres"), &[]));

    let err = agent.process("hi").await.unwrap_err();
    assert!(matches!(err, TurnError::StalledResponse { blocks: 2 }));
}

#[tokio::test]
async fn slow_tool_times_out() {
    let model = ScriptedModel::new(vec![blocks(vec![ContentBlock::tool_use(
        "t1",
        "execute_query",
        json!({"sql": "SELECT pg_sleep(10)"}),
    )])]);
    let session = Arc::new(MockSession {
        name: "postgres".into(),
        calls: Mutex::new(Vec::new()),
        handler: Box::new(|_: &str, _: &Value| Ok(ToolOutput::success(json!("late")))),
        delay: Some(Duration::from_millis(500)),
    });
    let agent = AgentLoop::new(model, registry_with(session, &["execute_query"]))
        .with_tool_timeout(Duration::from_millis(20));

    let err = agent.process("slow").await.unwrap_err();
    assert!(matches!(err, TurnError::ToolTimeout { ref tool, .. } if tool == "execute_query"));
}

#[tokio::test]
async fn slow_model_times_out() {
    let model = ScriptedModel::slow(vec![text("late")], Duration::from_millis(500));
    let agent = AgentLoop::new(model, registry_with(MockSession::echo("postgres"), &[]))
        .with_model_timeout(Duration::from_millis(20));

    let err = agent.process("hi").await.unwrap_err();
    assert!(matches!(err, TurnError::ModelTimeout(_)));
}

#[tokio::test]
async fn cancellation_aborts_in_flight_call() {
    let model = ScriptedModel::slow(vec![text("never seen")], Duration::from_secs(5));
    let agent = AgentLoop::new(model, registry_with(MockSession::echo("postgres"), &[]));
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = agent.process_with_cancel("hi", &token).await.unwrap_err();
    assert!(matches!(err, TurnError::Cancelled));
}

#[tokio::test]
async fn failed_turn_leaves_agent_usable() {
    let model = ScriptedModel::new(vec![
        blocks(vec![ContentBlock::tool_use("t1", "missing", json!({}))]),
        text("Hello again!"),
    ]);
    let session = MockSession::echo("postgres");
    let agent = AgentLoop::new(model.clone(), registry_with(session, &["get_tables"]));

    assert!(agent.process("first").await.is_err());
    assert_eq!(agent.process("second").await.unwrap(), "Hello again!");
    assert_eq!(agent.tool_registry().len(), 1);
    assert_eq!(model.requests()[1], vec![Message::user("second")]);
}
