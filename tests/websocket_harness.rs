use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use vitals_stream::stream::proto::{decode, encode, Frame, IdentifyPayload, OpCode};
use vitals_stream::{ConnectionState, ErrorReason, StreamClient, StreamConfig};

const TEST_TOKEN: &str = "ws-test-token";
const HEARTBEAT_INTERVAL_MS: i64 = 50;

#[derive(Debug)]
struct WsObserved {
    identify: IdentifyPayload,
    heartbeats: usize,
}

#[derive(Clone)]
struct WsState {
    observed_tx: Arc<Mutex<Option<oneshot::Sender<Result<WsObserved, String>>>>>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_client_completes_handshake_and_streams_heart_rate() {
    let (observed_tx, observed_rx) = oneshot::channel();
    let state = WsState {
        observed_tx: Arc::new(Mutex::new(Some(observed_tx))),
    };
    let app = Router::new()
        .route("/connect", get(ws_handler))
        .with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let config = StreamConfig::new(SecretString::new(TEST_TOKEN.to_string()))
        .with_endpoint(format!("ws://{addr}/connect"))
        .with_handshake_grace(Duration::from_secs(2));
    let client = StreamClient::new(config);

    let (sample_tx, mut sample_rx) = mpsc::unbounded_channel();
    client.on_sample(move |sample| {
        let _ = sample_tx.send(sample.value);
    });

    client.connect().expect("connect to mock ws server");

    let value = timeout(Duration::from_secs(2), sample_rx.recv())
        .await
        .expect("timed out waiting for heart rate sample")
        .expect("sample observer closed");
    assert_eq!(value, 72.0);
    assert!(client.is_connected());

    let observed = timeout(Duration::from_secs(2), observed_rx)
        .await
        .expect("timed out waiting for ws server observations")
        .expect("ws observation channel closed")
        .expect("ws protocol assertions failed");
    assert_eq!(observed.identify.token, TEST_TOKEN);
    assert_eq!(observed.identify.auth_type, 1);
    assert!(observed.heartbeats >= 2);

    client.disconnect();
    assert_eq!(client.current_state(), ConnectionState::Closed);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_client_skips_non_utf8_binary_frames() {
    let app = Router::new().route("/connect", get(binary_noise_handler));
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let config = StreamConfig::new(SecretString::new(TEST_TOKEN.to_string()))
        .with_endpoint(format!("ws://{addr}/connect"))
        .with_handshake_grace(Duration::from_secs(2));
    let client = StreamClient::new(config);

    let (sample_tx, mut sample_rx) = mpsc::unbounded_channel();
    client.on_sample(move |sample| {
        let _ = sample_tx.send(sample.value);
    });

    client.connect().expect("connect to mock ws server");

    let value = timeout(Duration::from_secs(2), sample_rx.recv())
        .await
        .expect("timed out waiting for heart rate sample")
        .expect("sample observer closed");
    assert_eq!(value, 72.0);
    assert_eq!(client.current_state(), ConnectionState::Streaming);

    client.disconnect();
    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_client_reports_unreachable_endpoint() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    let addr = listener.local_addr().expect("probe address");
    drop(listener);

    let config = StreamConfig::new(SecretString::new(TEST_TOKEN.to_string()))
        .with_endpoint(format!("ws://{addr}/connect"));
    let client = StreamClient::new(config);
    let mut states = client.watch_state();

    client.connect().expect("connect");
    timeout(Duration::from_secs(5), states.wait_for(ConnectionState::is_terminal))
        .await
        .expect("timed out waiting for failure")
        .expect("state channel closed");
    assert!(matches!(
        client.current_state(),
        ConnectionState::Errored(ErrorReason::Transport(_))
    ));
}

async fn ws_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let observed_tx = state.observed_tx.clone();
    ws.on_upgrade(move |socket| async move {
        let result = run_ws_protocol(socket).await;
        if let Some(tx) = observed_tx.lock().await.take() {
            let _ = tx.send(result);
        }
    })
}

async fn binary_noise_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        if send_binary_noise(&mut socket).await.is_err() {
            return;
        }
        // Hold the link open until the client leaves.
        while let Some(Ok(message)) = socket.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    })
}

async fn send_binary_noise(socket: &mut WebSocket) -> Result<(), String> {
    let identify = recv_client_frame(socket).await?;
    if identify.op != OpCode::Identify {
        return Err(format!("expected identify, got {:?}", identify.op));
    }
    send_frame(socket, &Frame::hello(30_000)).await?;
    send_frame(socket, &Frame::control(OpCode::Ready)).await?;
    socket
        .send(Message::Binary(vec![0xff, 0xfe, 0x00]))
        .await
        .map_err(|err| format!("failed to send binary frame: {err}"))?;
    send_frame(socket, &Frame::dispatch("HEART_RATE", 72.0, Some(1))).await
}

async fn run_ws_protocol(mut socket: WebSocket) -> Result<WsObserved, String> {
    let identify = recv_client_frame(&mut socket).await?;
    if identify.op != OpCode::Identify {
        return Err(format!(
            "expected first client frame to be identify, got {:?}",
            identify.op
        ));
    }
    let identify: IdentifyPayload = identify
        .payload
        .ok_or_else(|| "identify frame has no payload".to_string())
        .and_then(|payload| {
            serde_json::from_value(payload).map_err(|err| format!("bad identify payload: {err}"))
        })?;

    send_frame(&mut socket, &Frame::hello(HEARTBEAT_INTERVAL_MS)).await?;
    send_frame(&mut socket, &Frame::control(OpCode::Ready)).await?;
    send_frame(&mut socket, &Frame::dispatch("HEART_RATE", 72.0, Some(1))).await?;

    let mut heartbeats = 0;
    while heartbeats < 2 {
        let frame = recv_client_frame(&mut socket).await?;
        if frame.op != OpCode::Heartbeat {
            return Err(format!("expected heartbeat, got {:?}", frame.op));
        }
        heartbeats += 1;
        send_frame(&mut socket, &Frame::control(OpCode::HeartbeatAck)).await?;
    }

    Ok(WsObserved {
        identify,
        heartbeats,
    })
}

async fn recv_client_frame(socket: &mut WebSocket) -> Result<Frame, String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return decode(&text).map_err(|err| format!("failed to decode client frame: {err}"));
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err("websocket closed before expected client frame".to_string());
            }
            Some(Ok(_)) => return Err("received unexpected non-text websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Err("websocket stream ended unexpectedly".to_string()),
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), String> {
    socket
        .send(Message::Text(encode(frame).into()))
        .await
        .map_err(|err| format!("failed to send server frame: {err}"))
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
