//! Interactive transport against an in-process panel

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use panelterm::config::{LocalStore, ServerConfig, TerminalConfig};
use panelterm::session::DisconnectReason;
use panelterm::transport::{
    event_channel, ConnectOptions, DisconnectOptions, EventReceiver, PtyTransport, SendOptions,
    Transport, TransportEventKind,
};

/// What the fake panel observed on one connection
#[derive(Debug)]
enum Seen {
    Uri(String),
    Text(String),
    Binary(Vec<u8>),
    End,
}

/// Accepts WebSocket connections, sends `script` on each, and reports
/// everything the client sends
async fn spawn_panel(script: Vec<String>) -> (String, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = seen_tx.clone();
            let script = script.clone();
            tokio::spawn(async move {
                let uri_seen = seen.clone();
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    let _ = uri_seen.send(Seen::Uri(req.uri().to_string()));
                    Ok(resp)
                };
                let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                    .await
                    .unwrap();

                for frame in script {
                    ws.send(Message::Text(frame)).await.unwrap();
                }

                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(text) => {
                            let _ = seen.send(Seen::Text(text));
                        }
                        Message::Binary(bytes) => {
                            let _ = seen.send(Seen::Binary(bytes));
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                let _ = seen.send(Seen::End);
            });
        }
    });

    (format!("http://{}", addr), seen_rx)
}

fn config(base_url: String) -> TerminalConfig {
    TerminalConfig {
        server: ServerConfig {
            base_url,
            token_path: None,
            capabilities_path: None,
            ..Default::default()
        },
        tab_id: "tab-1".into(),
        ..Default::default()
    }
}

fn connect_opts(generation: u64, preserve_screen: bool) -> ConnectOptions {
    ConnectOptions {
        cols: 100,
        rows: 30,
        generation,
        preserve_screen,
    }
}

/// Collect events until `done` matches one, or time out
async fn collect_until(
    rx: &mut EventReceiver,
    done: impl Fn(&TransportEventKind) -> bool,
) -> Vec<TransportEventKind> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            let stop = done(&event.payload);
            out.push(event.payload);
            if stop {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for transport events");
    out
}

/// Client frames until the connection ends
async fn drain_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Vec<Seen> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(seen) = rx.recv().await {
            let end = matches!(seen, Seen::End);
            out.push(seen);
            if end {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for the panel");
    out
}

fn texts(seen: &[Seen]) -> Vec<&str> {
    seen.iter()
        .filter_map(|s| match s {
            Seen::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_output_is_deduplicated_by_seq() {
    let (base_url, mut seen) = spawn_panel(vec![
        r#"{"type":"init","session_id":"s1","shell":"/bin/ash","lines":["welcome"]}"#.into(),
        r#"{"type":"output","data":"a","seq":1}"#.into(),
        r#"{"type":"output","data":"a","seq":1}"#.into(),
        r#"{"type":"output","data":"b","seq":2}"#.into(),
    ])
    .await;

    let store = Arc::new(LocalStore::in_memory());
    let (tx, mut rx) = event_channel();
    let pty = PtyTransport::new(&config(base_url), store, tx);

    pty.connect(connect_opts(1, false)).await.unwrap();
    assert!(pty.is_connected());

    let events = collect_until(&mut rx, |e| *e == TransportEventKind::Output("b".into())).await;
    let outputs: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            TransportEventKind::Output(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(outputs, vec!["a", "b"]);
    assert!(events.contains(&TransportEventKind::Replay(vec!["welcome".into()])));
    assert!(events.iter().any(|e| matches!(
        e,
        TransportEventKind::SessionInfo { session_id: Some(id), .. } if id == "s1"
    )));

    let key = pty.session_key();
    assert_eq!(key.session_id.as_deref(), Some("s1"));
    assert_eq!(key.last_seq, 2);

    assert!(pty.send("ls\r", SendOptions::default()));
    pty.disconnect(DisconnectOptions::graceful(DisconnectReason::Close))
        .await;

    let frames = drain_seen(&mut seen).await;
    match &frames[0] {
        Seen::Uri(uri) => assert!(uri.starts_with("/ws/pty?cols=100&rows=30")),
        other => panic!("expected handshake first, got {:?}", other),
    }
    assert_eq!(texts(&frames)[0], r#"{"type":"resize","cols":100,"rows":30}"#);
    assert!(frames
        .iter()
        .any(|s| matches!(s, Seen::Binary(b) if b.as_slice() == b"ls\r")));
    assert_eq!(texts(&frames).last().copied(), Some(r#"{"type":"close"}"#));
}

#[tokio::test]
async fn test_detach_keeps_remote_process() {
    let (base_url, mut seen) =
        spawn_panel(vec![r#"{"type":"init","session_id":"s9"}"#.into()]).await;

    let store = Arc::new(LocalStore::in_memory());
    let (tx, mut rx) = event_channel();
    let pty = PtyTransport::new(&config(base_url), store, tx);

    pty.connect(connect_opts(1, false)).await.unwrap();
    collect_until(&mut rx, |e| matches!(e, TransportEventKind::SessionInfo { .. })).await;

    pty.disconnect(DisconnectOptions::silent(DisconnectReason::Detach))
        .await;
    let events = collect_until(&mut rx, |e| matches!(e, TransportEventKind::Closed(_))).await;
    assert!(matches!(
        events.last(),
        Some(TransportEventKind::Closed(panelterm::session::CloseReason::Requested(
            DisconnectReason::Detach
        )))
    ));

    let frames = drain_seen(&mut seen).await;
    assert!(!texts(&frames).contains(&r#"{"type":"close"}"#));
    // Reattachment key survives a detach
    assert_eq!(pty.session_key().session_id.as_deref(), Some("s9"));
}

#[tokio::test]
async fn test_reconnect_resumes_with_session_key() {
    let (base_url, mut seen) = spawn_panel(vec![
        r#"{"type":"init","session_id":"s2"}"#.into(),
        r#"{"type":"output","data":"x","seq":5}"#.into(),
    ])
    .await;

    let store = Arc::new(LocalStore::in_memory());
    let (tx, mut rx) = event_channel();
    let pty = PtyTransport::new(&config(base_url.clone()), store.clone(), tx);

    pty.connect(connect_opts(1, false)).await.unwrap();
    collect_until(&mut rx, |e| *e == TransportEventKind::Output("x".into())).await;
    pty.disconnect(DisconnectOptions::silent(DisconnectReason::Detach))
        .await;
    drain_seen(&mut seen).await;

    // A fresh transport on the same store picks the key back up
    let (tx2, _rx2) = event_channel();
    let pty2 = PtyTransport::new(&config(base_url), store, tx2);
    pty2.connect(connect_opts(1, true)).await.unwrap();

    let frames = drain_seen_until_uri(&mut seen).await;
    assert!(frames.contains("session_id=s2"), "{}", frames);
    assert!(frames.contains("last_seq=5"), "{}", frames);

    pty2.disconnect(DisconnectOptions::kill(DisconnectReason::Kill))
        .await;
    assert_eq!(pty2.session_key().session_id, None);
}

async fn drain_seen_until_uri(rx: &mut mpsc::UnboundedReceiver<Seen>) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(seen) = rx.recv().await {
            if let Seen::Uri(uri) = seen {
                return uri;
            }
        }
        String::new()
    })
    .await
    .expect("timed out waiting for the handshake")
}
