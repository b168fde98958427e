use std::sync::{Arc, Mutex as StdMutex};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{net::TcpListener, time::timeout};

use super::*;

#[derive(Clone)]
struct StompServerState {
    accepted_token: String,
    error_on_connect: Option<String>,
    heart_beat: Option<String>,
    connect_frames: Arc<StdMutex<Vec<Frame>>>,
}

impl StompServerState {
    fn accepting(token: &str) -> Self {
        Self {
            accepted_token: token.to_string(),
            error_on_connect: None,
            heart_beat: None,
            connect_frames: Arc::new(StdMutex::new(Vec::new())),
        }
    }
}

async fn handle_upgrade(
    State(state): State<StompServerState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if provided != format!("Bearer {}", state.accepted_token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_stomp(socket, state))
}

async fn serve_stomp(mut socket: WebSocket, state: StompServerState) {
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(WireFrame::Frame(frame)) = WireFrame::decode(&text) else {
            continue;
        };
        let reply = match frame.command {
            FrameCommand::Connect | FrameCommand::Stomp => {
                state
                    .connect_frames
                    .lock()
                    .expect("frames lock")
                    .push(frame.clone());
                match &state.error_on_connect {
                    Some(reason) => Frame::new(FrameCommand::Error).header("message", reason.clone()),
                    None => {
                        let connected = Frame::new(FrameCommand::Connected).header("version", "1.2");
                        match &state.heart_beat {
                            Some(value) => connected.header("heart-beat", value.clone()),
                            None => connected,
                        }
                    }
                }
            }
            FrameCommand::Subscribe => {
                let destination = frame.get("destination").unwrap_or_default().to_string();
                if destination == "/close" {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    return;
                }
                Frame::new(FrameCommand::Message)
                    .header("destination", destination)
                    .header("subscription", frame.get("id").unwrap_or_default())
                    .header("message-id", "1")
                    .with_body("{\"id\":\"m1\"}")
            }
            FrameCommand::Disconnect => return,
            _ => continue,
        };
        if socket.send(WsMessage::Text(reply.encode())).await.is_err() {
            return;
        }
    }
}

async fn spawn_stomp_server(state: StompServerState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/ws", get(handle_upgrade))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("ws://{addr}/ws")
}

async fn next_frame(link: &mut TransportLink) -> Frame {
    loop {
        match timeout(Duration::from_secs(2), link.recv()).await.expect("link event") {
            LinkEvent::Frame(frame) => return frame,
            LinkEvent::Heartbeat => continue,
            LinkEvent::Closed(reason) => panic!("link closed early: {reason:?}"),
        }
    }
}

#[tokio::test]
async fn handshake_carries_bearer_and_routes_frames() {
    let state = StompServerState::accepting("token-1");
    let endpoint = spawn_stomp_server(state.clone()).await;
    let connector = WebSocketConnector::new(Duration::from_secs(10));

    let mut link = connector.connect(&endpoint, "token-1").await.expect("connect");
    {
        let frames = state.connect_frames.lock().expect("frames lock");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].get("Authorization"), Some("Bearer token-1"));
        assert_eq!(frames[0].get("accept-version"), Some("1.2"));
        assert_eq!(frames[0].get("host"), Some("127.0.0.1"));
    }

    assert!(link.send(WireFrame::Frame(Frame::subscribe("sub-0", "/chat/c1"))));
    let message = next_frame(&mut link).await;
    assert_eq!(message.command, FrameCommand::Message);
    assert_eq!(message.get("destination"), Some("/chat/c1"));
    assert_eq!(message.get("subscription"), Some("sub-0"));
    assert_eq!(message.body, "{\"id\":\"m1\"}");
}

#[tokio::test]
async fn connected_heart_beat_header_sets_link_heartbeats() {
    let endpoint = spawn_stomp_server(StompServerState::accepting("token-1")).await;
    let connector = WebSocketConnector::new(Duration::from_millis(30));
    let link = connector.connect(&endpoint, "token-1").await.expect("connect");
    assert_eq!(link.heartbeats(), Heartbeats::default());

    let mut state = StompServerState::accepting("token-1");
    state.heart_beat = Some("0,100".into());
    let endpoint = spawn_stomp_server(state.clone()).await;
    let link = connector.connect(&endpoint, "token-1").await.expect("connect");
    assert_eq!(
        link.heartbeats(),
        Heartbeats {
            send: Some(Duration::from_millis(100)),
            expect: None,
        }
    );
    let frames = state.connect_frames.lock().expect("frames lock");
    assert_eq!(frames[0].get("heart-beat"), Some("30,30"));
}

#[test]
fn heartbeat_negotiation_takes_the_slower_side() {
    let proposed = Duration::from_secs(10);
    assert_eq!(
        Heartbeats::negotiate(proposed, Some("4000,25000")),
        Heartbeats {
            send: Some(Duration::from_secs(25)),
            expect: Some(Duration::from_secs(10)),
        }
    );
    assert_eq!(Heartbeats::negotiate(proposed, Some("0,0")), Heartbeats::default());
    assert_eq!(Heartbeats::negotiate(proposed, None), Heartbeats::default());
    assert_eq!(Heartbeats::negotiate(proposed, Some("garbage")), Heartbeats::default());
    assert_eq!(
        Heartbeats::negotiate(Duration::ZERO, Some("1000,1000")),
        Heartbeats::default()
    );
}

#[tokio::test]
async fn upgrade_rejection_is_an_auth_failure() {
    let endpoint = spawn_stomp_server(StompServerState::accepting("token-1")).await;
    let connector = WebSocketConnector::new(Duration::from_secs(10));

    let err = connector
        .connect(&endpoint, "stale")
        .await
        .err()
        .expect("upgrade must fail");
    assert!(matches!(err, HandshakeError::Unauthorized(_)), "got {err:?}");
}

#[tokio::test]
async fn stomp_error_frame_during_handshake_is_classified() {
    let mut state = StompServerState::accepting("token-1");
    state.error_on_connect = Some("Unauthorized: token expired".into());
    let endpoint = spawn_stomp_server(state).await;
    let connector = WebSocketConnector::new(Duration::from_secs(10));

    let err = connector
        .connect(&endpoint, "token-1")
        .await
        .err()
        .expect("handshake must fail");
    assert_eq!(
        err,
        HandshakeError::Unauthorized("Unauthorized: token expired".into())
    );
}

#[tokio::test]
async fn server_close_surfaces_as_closed_event() {
    let endpoint = spawn_stomp_server(StompServerState::accepting("token-1")).await;
    let connector = WebSocketConnector::new(Duration::from_secs(10));
    let mut link = connector.connect(&endpoint, "token-1").await.expect("connect");

    assert!(link.send(WireFrame::Frame(Frame::subscribe("sub-0", "/close"))));
    let event = loop {
        match timeout(Duration::from_secs(2), link.recv()).await.expect("link event") {
            LinkEvent::Heartbeat => continue,
            other => break other,
        }
    };
    assert!(matches!(event, LinkEvent::Closed(_)), "got {event:?}");
}

#[test]
fn error_frames_without_auth_wording_are_plain_rejections() {
    let frame = Frame::new(FrameCommand::Error).with_body("broker unavailable\n");
    assert_eq!(
        classify_error_frame(&frame),
        HandshakeError::Rejected("broker unavailable".into())
    );

    let frame = Frame::new(FrameCommand::Error).header("message", "403 Forbidden");
    assert_eq!(
        classify_error_frame(&frame),
        HandshakeError::Unauthorized("403 Forbidden".into())
    );
}

#[tokio::test]
async fn missing_connector_always_fails() {
    let err = MissingTransportConnector
        .connect("ws://127.0.0.1:1/ws", "token")
        .await
        .err()
        .expect("no transport");
    assert!(matches!(err, HandshakeError::Transport(_)));
}
