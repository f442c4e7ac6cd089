use serde_json::json;
use tether::{
    Agent, LanguageModel, Message, OpenAIClient, StopReason, TetherError, Tool, ToolRegistry,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> OpenAIClient {
    OpenAIClient::new("sk-test", "gpt-test")
        .unwrap()
        .with_base_url(server.uri())
}

struct Echo;

#[async_trait::async_trait]
impl Tool for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes its input"
    }

    async fn call(&self, input: serde_json::Value) -> tether::Result<serde_json::Value> {
        Ok(input)
    }
}

#[tokio::test]
async fn parses_tool_calls_from_a_plain_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "gpt-test", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "echo", "arguments": "{\"text\":\"hi\"}"}
                    }]
                }
            }]
        })))
        .mount(&server)
        .await;

    let reply = client(&server)
        .complete_chat(&[Message::user("say hi")], &[])
        .await
        .unwrap();

    assert!(reply.content.is_none());
    assert_eq!(reply.tool_calls.len(), 1);
    assert_eq!(reply.tool_calls[0].id, "call_1");
    assert_eq!(reply.tool_calls[0].arguments, json!({"text": "hi"}));
}

#[tokio::test]
async fn folds_streamed_chunks_into_one_reply() {
    let server = MockServer::start().await;
    let body = [
        r#"data: {"choices":[{"delta":{"content":"Let me "}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"check."}}]}"#,
        r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"echo","arguments":"{\"te"}}]}}]}"#,
        r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"xt\":\"yo\"}"}}]}}]}"#,
        "data: [DONE]",
    ]
    .join("\n\n");
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let reply = client(&server)
        .with_streaming(true)
        .complete_chat(&[Message::user("hi")], &[])
        .await
        .unwrap();

    assert_eq!(reply.content.as_deref(), Some("Let me check."));
    assert_eq!(reply.tool_calls.len(), 1);
    assert_eq!(reply.tool_calls[0].id, "call_a");
    assert_eq!(reply.tool_calls[0].arguments, json!({"text": "yo"}));
}

#[tokio::test]
async fn rate_limits_surface_as_model_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let err = client(&server)
        .complete_chat(&[Message::user("hi")], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::LanguageModel(ref msg) if msg.contains("rate limit")));
}

#[tokio::test]
async fn agent_round_trips_through_the_http_client() {
    let server = MockServer::start().await;
    // The second request carries the tool result, so it is matched first.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "messages": [{"role": "user"}, {"role": "assistant"}, {"role": "tool", "tool_call_id": "call_1"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "done"}}]
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"tools": [{"type": "function", "function": {"name": "echo"}}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "echo", "arguments": "{}"}}]
            }}]
        })))
        .with_priority(2)
        .mount(&server)
        .await;

    let mut tools = ToolRegistry::new();
    tools.register(Echo);
    let mut agent = Agent::new(std::sync::Arc::new(client(&server))).with_tools(tools);

    let outcome = agent.run("use echo").await.unwrap();
    assert_eq!(outcome.answer, "done");
    assert_eq!(outcome.stop, StopReason::Completed);
    assert_eq!(outcome.model_calls, 2);
}
