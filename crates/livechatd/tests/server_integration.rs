//! Integration tests for the TCP chat server.
//!
//! These run a real `ChatServer` on a loopback port and talk to it the way
//! visitor widgets and agent consoles do: newline-delimited JSON frames.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use livechat_core::{CloseReason, Role, SessionId};
use livechat_protocol::{codes, ClientMessage, ServerMessage};
use livechatd::auth::JwtAuthenticator;
use livechatd::config::Config;
use livechatd::hub::{spawn_hub, HubConfig, HubHandle};
use livechatd::server::{ChatServer, ConnectionSettings, ServerContext};
use livechatd::transcript::NullSink;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const SECRET: &str = "integration-secret-0123456789abcdef";

/// Maximum time to wait for a single frame
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    addr: SocketAddr,
    hub: HubHandle,
    auth: JwtAuthenticator,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(Config::default()).await
    }

    async fn spawn_with(mut config: Config) -> Self {
        config.server.listen = "127.0.0.1:0".to_string();
        config.auth.jwt_secret = SECRET.to_string();

        let hub = spawn_hub(HubConfig::from_config(&config), Arc::new(NullSink));
        let auth = JwtAuthenticator::new(SECRET);
        let cancel_token = CancellationToken::new();
        let ctx = ServerContext::new(
            hub.clone(),
            Arc::new(auth.clone()),
            ConnectionSettings::from_config(&config),
            cancel_token.clone(),
        );
        let server = ChatServer::bind(config.listen_addr().unwrap(), ctx)
            .await
            .expect("bind");
        let addr = server.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let _ = server.run().await;
        });

        Self {
            addr,
            hub,
            auth,
            cancel_token,
            task,
        }
    }

    fn agent_token(&self, name: &str) -> String {
        self.auth.issue_token(name, None, 60).expect("token")
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        let _ = timeout(RECV_TIMEOUT, self.task).await;
    }
}

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    /// Connects and completes a visitor handshake; returns the session id.
    async fn visitor(addr: SocketAddr) -> (Self, SessionId) {
        let mut client = Self::connect(addr).await;
        client.send(&ClientMessage::connect_visitor(None)).await;
        match client.recv().await {
            ServerMessage::Connected {
                session_id: Some(session_id),
                role: Role::Visitor,
                ..
            } => (client, session_id),
            other => panic!("expected connected, got {other:?}"),
        }
    }

    async fn agent(addr: SocketAddr, token: String) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(&ClientMessage::connect_agent(token)).await;
        match client.recv().await {
            ServerMessage::Connected { role: Role::Agent, .. } => client,
            other => panic!("expected connected, got {other:?}"),
        }
    }

    async fn send(&mut self, msg: &ClientMessage) {
        let json = serde_json::to_string(msg).expect("serialize");
        self.send_raw(&json).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    async fn try_recv(&mut self) -> Option<ServerMessage> {
        let line = timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for frame")
            .ok()??;
        Some(serde_json::from_str(&line).expect("parse server frame"))
    }

    async fn recv(&mut self) -> ServerMessage {
        self.try_recv().await.expect("connection closed")
    }

    /// Skips frames until one matches.
    async fn recv_until(&mut self, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        loop {
            let frame = self.recv().await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    /// Reads the remaining frames until the server closes the connection.
    async fn drain_to_eof(&mut self) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Some(frame) = self.try_recv().await {
            frames.push(frame);
        }
        frames
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_visitor_handshake() {
    let server = TestServer::spawn().await;
    let (_client, session_id) = TestClient::visitor(server.addr).await;

    let view = server.hub.get_session(session_id).await.expect("session");
    assert_eq!(view.held, 0);
    server.shutdown().await;
}

#[tokio::test]
async fn test_visitor_proposed_id_is_used() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::connect(server.addr).await;
    client
        .send(&ClientMessage::connect_visitor(Some("cookie-42".to_string())))
        .await;

    match client.recv().await {
        ServerMessage::Connected { connection_id, .. } => {
            assert_eq!(connection_id.as_str(), "visitor-cookie-42");
        }
        other => panic!("expected connected, got {other:?}"),
    }
    server.shutdown().await;
}

#[tokio::test]
async fn test_visitor_cannot_lock_out_agent_by_proposing_its_id() {
    let server = TestServer::spawn().await;
    let mut squatter = TestClient::connect(server.addr).await;
    squatter
        .send(&ClientMessage::connect_visitor(Some("agent-alice".to_string())))
        .await;
    match squatter.recv().await {
        ServerMessage::Connected {
            connection_id,
            role: Role::Visitor,
            ..
        } => assert_eq!(connection_id.as_str(), "visitor-agent-alice"),
        other => panic!("expected connected, got {other:?}"),
    }

    // The real agent still gets in under its own id
    let _agent = TestClient::agent(server.addr, server.agent_token("alice")).await;
    let agents = server.hub.list_by_role(Role::Agent).await;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].as_str(), "agent-alice");
    server.shutdown().await;
}

#[tokio::test]
async fn test_version_mismatch_rejected() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::connect(server.addr).await;
    client
        .send_raw(r#"{"protocol_version":{"major":2,"minor":0},"type":"connect","role":"visitor"}"#)
        .await;

    let frames = client.drain_to_eof().await;
    assert!(matches!(
        frames.first(),
        Some(ServerMessage::Rejected { reason, .. }) if reason.contains("2.0")
    ));
    server.shutdown().await;
}

#[tokio::test]
async fn test_agent_without_token_rejected() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::connect(server.addr).await;
    client
        .send_raw(r#"{"type":"connect","role":"agent"}"#)
        .await;

    let frames = client.drain_to_eof().await;
    assert!(matches!(frames.first(), Some(ServerMessage::Rejected { .. })));
    assert!(server.hub.list_by_role(Role::Agent).await.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_agent_with_bad_token_rejected() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::connect(server.addr).await;
    client.send(&ClientMessage::connect_agent("not-a-jwt")).await;

    let frames = client.drain_to_eof().await;
    assert!(matches!(
        frames.first(),
        Some(ServerMessage::Rejected { reason, .. }) if reason.contains("Invalid token")
    ));
    server.shutdown().await;
}

#[tokio::test]
async fn test_first_frame_must_be_connect() {
    let server = TestServer::spawn().await;
    let mut client = TestClient::connect(server.addr).await;
    client.send(&ClientMessage::ping(1)).await;

    let frames = client.drain_to_eof().await;
    assert!(matches!(
        frames.first(),
        Some(ServerMessage::Error { code: Some(code), .. }) if code == codes::UNEXPECTED_MESSAGE
    ));
    server.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_visitor_id_rejected() {
    let server = TestServer::spawn().await;
    let mut first = TestClient::connect(server.addr).await;
    first
        .send(&ClientMessage::connect_visitor(Some("same".to_string())))
        .await;
    assert!(matches!(first.recv().await, ServerMessage::Connected { .. }));

    let mut second = TestClient::connect(server.addr).await;
    second
        .send(&ClientMessage::connect_visitor(Some("same".to_string())))
        .await;
    let frames = second.drain_to_eof().await;
    assert!(matches!(frames.first(), Some(ServerMessage::Rejected { .. })));
    server.shutdown().await;
}

// ============================================================================
// Conversation
// ============================================================================

#[tokio::test]
async fn test_full_conversation() {
    let server = TestServer::spawn().await;
    let mut agent = TestClient::agent(server.addr, server.agent_token("alice")).await;
    let (mut visitor, session_id) = TestClient::visitor(server.addr).await;

    // No agent yet: the message is held and announced
    visitor.send(&ClientMessage::text(None, "hi")).await;
    assert_eq!(
        visitor.recv().await,
        ServerMessage::Accepted {
            session_id: session_id.clone(),
            seq: 1,
        }
    );
    let notice = agent
        .recv_until(|f| matches!(f, ServerMessage::AwaitingAgent { .. }))
        .await;
    assert!(matches!(notice, ServerMessage::AwaitingAgent { preview, .. } if preview == "hi"));

    // Claim flushes the held message
    agent.send(&ClientMessage::claim(session_id.clone())).await;
    agent
        .recv_until(|f| matches!(f, ServerMessage::AgentAssigned { .. }))
        .await;
    match agent.recv().await {
        ServerMessage::Message { envelope } => {
            assert_eq!(envelope.seq, 1);
            assert_eq!(envelope.payload, "hi");
        }
        other => panic!("expected held message, got {other:?}"),
    }
    assert!(matches!(
        visitor.recv().await,
        ServerMessage::AgentAssigned { agent, .. } if agent.as_str() == "agent-alice"
    ));

    // Reply reaches the visitor
    agent
        .send(&ClientMessage::text(Some(session_id.clone()), "hello, how can I help?"))
        .await;
    agent
        .recv_until(|f| matches!(f, ServerMessage::Accepted { seq: 2, .. }))
        .await;
    match visitor.recv().await {
        ServerMessage::Message { envelope } => {
            assert_eq!(envelope.seq, 2);
            assert_eq!(envelope.sender_role, Role::Agent);
        }
        other => panic!("expected reply, got {other:?}"),
    }

    // Visitor ends the chat and is disconnected
    visitor.send(&ClientMessage::close(None)).await;
    let tail = visitor.drain_to_eof().await;
    assert!(tail.iter().any(|f| matches!(
        f,
        ServerMessage::SessionClosed { reason: CloseReason::ClosedByVisitor, .. }
    )));
    let closed = agent
        .recv_until(|f| matches!(f, ServerMessage::SessionClosed { .. }))
        .await;
    assert!(matches!(
        closed,
        ServerMessage::SessionClosed { reason: CloseReason::ClosedByVisitor, .. }
    ));

    // The agent stays connected
    agent.send(&ClientMessage::ping(7)).await;
    agent
        .recv_until(|f| matches!(f, ServerMessage::Pong { seq: 7 }))
        .await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_second_claim_rejected_over_the_wire() {
    let server = TestServer::spawn().await;
    let mut alice = TestClient::agent(server.addr, server.agent_token("alice")).await;
    let mut bob = TestClient::agent(server.addr, server.agent_token("bob")).await;
    let (_visitor, session_id) = TestClient::visitor(server.addr).await;

    alice.send(&ClientMessage::claim(session_id.clone())).await;
    alice
        .recv_until(|f| matches!(f, ServerMessage::AgentAssigned { .. }))
        .await;

    bob.send(&ClientMessage::claim(session_id.clone())).await;
    let rejected = bob
        .recv_until(|f| matches!(f, ServerMessage::ClaimRejected { .. }))
        .await;
    assert!(matches!(
        rejected,
        ServerMessage::ClaimRejected { reason, .. } if reason.contains("agent-alice")
    ));
    server.shutdown().await;
}

#[tokio::test]
async fn test_agent_text_to_unknown_session_fails() {
    let server = TestServer::spawn().await;
    let mut agent = TestClient::agent(server.addr, server.agent_token("alice")).await;

    agent
        .send(&ClientMessage::text(Some(SessionId::new("sess-nope")), "hello?"))
        .await;
    let failed = agent
        .recv_until(|f| matches!(f, ServerMessage::DeliveryFailed { .. }))
        .await;
    assert!(matches!(
        failed,
        ServerMessage::DeliveryFailed { code, .. } if code == codes::RECIPIENT_NOT_FOUND
    ));
    server.shutdown().await;
}

#[tokio::test]
async fn test_list_waiting() {
    let server = TestServer::spawn().await;
    let (mut visitor, session_id) = TestClient::visitor(server.addr).await;
    let mut agent = TestClient::agent(server.addr, server.agent_token("alice")).await;

    agent.send(&ClientMessage::list_waiting()).await;
    // The first waiting list arrives on connect, the second answers the request
    agent
        .recv_until(|f| matches!(f, ServerMessage::WaitingList { .. }))
        .await;
    match agent.recv_until(|f| matches!(f, ServerMessage::WaitingList { .. })).await {
        ServerMessage::WaitingList { sessions } => {
            assert_eq!(sessions.len(), 1);
            assert_eq!(sessions[0].id, session_id);
        }
        _ => unreachable!(),
    }

    visitor.send(&ClientMessage::list_waiting()).await;
    assert!(matches!(visitor.recv().await, ServerMessage::Error { .. }));
    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::spawn().await;
    let (mut visitor, _) = TestClient::visitor(server.addr).await;

    visitor.send(&ClientMessage::ping(41)).await;
    assert_eq!(visitor.recv().await, ServerMessage::Pong { seq: 41 });
    server.shutdown().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_closes_sessions_and_connections() {
    let server = TestServer::spawn().await;
    let mut agent = TestClient::agent(server.addr, server.agent_token("alice")).await;
    let (mut visitor, _) = TestClient::visitor(server.addr).await;
    let hub = server.hub.clone();

    server.shutdown().await;

    let tail = visitor.drain_to_eof().await;
    assert!(tail.iter().any(|f| matches!(
        f,
        ServerMessage::SessionClosed { reason: CloseReason::Shutdown, .. }
    )));
    agent.drain_to_eof().await;

    let stats = hub.stats().await.unwrap();
    assert_eq!(stats.visitors + stats.agents, 0);
}
