use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use chat_api::{ChatApiClient, ChatApiConfig, ChatApiError, ChatMessage, ChatRequest};
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

fn allow_local_integration() -> bool {
    std::env::var("CHAT_API_ALLOW_LOCAL_INTEGRATION")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

#[derive(Clone)]
struct ScriptedResponse {
    status: u16,
    body: String,
}

struct ScriptedServer {
    base_url: String,
    request_count: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    async fn new(scripts: Vec<ScriptedResponse>) -> Self {
        let scripts = Arc::new(scripts);
        let request_count = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("local TCP listener should bind");
        let addr = listener
            .local_addr()
            .expect("resolved local listener address");
        let base_url = format!("http://{addr}/v1");

        let handle = tokio::spawn({
            let scripts = Arc::clone(&scripts);
            let request_count = Arc::clone(&request_count);
            let bodies = Arc::clone(&bodies);

            async move {
                loop {
                    let (socket, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(_) => break,
                    };
                    let scripts = Arc::clone(&scripts);
                    let request_count = Arc::clone(&request_count);
                    let bodies = Arc::clone(&bodies);
                    tokio::spawn(async move {
                        serve_one(socket, scripts, request_count, bodies).await;
                    });
                }
            }
        });

        Self {
            base_url,
            request_count,
            bodies,
            handle,
        }
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Acquire)
    }

    fn received_bodies(&self) -> Vec<String> {
        self.bodies.lock().expect("bodies lock").clone()
    }

    fn shutdown(&self) {
        self.handle.abort();
    }
}

fn respond(status: u16, body: &str) -> ScriptedResponse {
    ScriptedResponse {
        status,
        body: body.to_string(),
    }
}

fn user_request(text: &str) -> ChatRequest {
    ChatRequest::new(
        "gpt-4o-mini",
        vec![ChatMessage {
            role: "user".to_string(),
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }],
    )
}

#[tokio::test]
async fn complete_integration_parses_successful_reply() {
    if !allow_local_integration() {
        return;
    }

    let server = ScriptedServer::new(vec![respond(
        200,
        r##"{"id":"chatcmpl-1","choices":[{"index":0,"finish_reason":"stop","message":{"role":"assistant","content":"hello"}}]}"##,
    )])
    .await;

    let client =
        ChatApiClient::new(ChatApiConfig::new("sk-test").with_base_url(&server.base_url))
            .expect("client");
    let response = client
        .complete(&user_request("hi"))
        .await
        .expect("completion should succeed");

    assert_eq!(
        response.choices[0].message.content.as_deref(),
        Some("hello")
    );
    assert_eq!(server.request_count(), 1);
    assert!(server.received_bodies()[0].contains("\"model\":\"gpt-4o-mini\""));

    server.shutdown();
}

#[tokio::test]
async fn complete_integration_surfaces_status_and_message() {
    if !allow_local_integration() {
        return;
    }

    let server = ScriptedServer::new(vec![respond(
        400,
        r##"{"error":{"message":"Invalid parameter: messages with role 'tool' must be a response to a preceding message with 'tool_calls'.","type":"invalid_request_error"}}"##,
    )])
    .await;

    let client =
        ChatApiClient::new(ChatApiConfig::new("sk-test").with_base_url(&server.base_url))
            .expect("client");
    let error = client
        .complete(&user_request("hi"))
        .await
        .expect_err("400 must fail");

    match error {
        ChatApiError::Status(status, message) => {
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(message.contains("messages with role 'tool'"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.request_count(), 1, "transport never retries");

    server.shutdown();
}

#[tokio::test]
async fn complete_integration_rejects_empty_choices() {
    if !allow_local_integration() {
        return;
    }

    let server = ScriptedServer::new(vec![respond(200, r##"{"choices":[]}"##)]).await;

    let client =
        ChatApiClient::new(ChatApiConfig::new("sk-test").with_base_url(&server.base_url))
            .expect("client");
    let error = client
        .complete(&user_request("hi"))
        .await
        .expect_err("empty choices must fail");

    assert!(matches!(error, ChatApiError::EmptyChoices));

    server.shutdown();
}

async fn serve_one(
    mut socket: TcpStream,
    scripts: Arc<Vec<ScriptedResponse>>,
    request_count: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<String>>>,
) {
    let Ok(body) = read_request(&mut socket).await else {
        return;
    };
    bodies.lock().expect("bodies lock").push(body);

    let index = request_count.fetch_add(1, Ordering::AcqRel);
    let response = scripts
        .get(index)
        .cloned()
        .unwrap_or_else(|| respond(500, r##"{"error":{"message":"unexpected request"}}"##));

    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        status_reason(response.status),
        response.body.len(),
    );
    if socket.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    let _ = socket.write_all(response.body.as_bytes()).await;
    let _ = socket.shutdown().await;
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut request = Vec::new();
    let mut buffer = [0_u8; 2048];

    let header_end = loop {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        request.extend_from_slice(&buffer[..n]);
        if let Some(position) = request.windows(4).position(|window| window == b"\r\n\r\n") {
            break position + 4;
        }
    };

    let head = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while request.len() < header_end + content_length {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buffer[..n]);
    }

    Ok(String::from_utf8_lossy(&request[header_end..]).into_owned())
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}
