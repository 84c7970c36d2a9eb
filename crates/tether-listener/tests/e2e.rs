//! Listener and agent wired together, over in-memory pipes and over TLS

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{duplex, split, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use tether_agent::tunnel::TlsConnector;
use tether_agent::{AgentError, AgentState, SessionConfig};
use tether_core::{agent_handshake, tls, AuthContext, AuthError, Connected, Connector};
use tether_core::{SessionError, TransferError};
use tether_listener::server::{ConnectionHandler, TlsServer};
use tether_listener::session::{ExchangeSettings, SessionRegistry};
use tether_listener::transfer;
use tether_protocol::codec::DEFAULT_MAX_LINE_LENGTH;
use tether_protocol::auth::certificate_fingerprint;
use tether_protocol::{AgentReply, ChannelCodec, Command, Frame, Inbound, Outbound, TerminalSize};

const SECRET: [u8; 32] = [0x5a; 32];

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 7], port))
}

fn registry(response_timeout: Duration) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(ExchangeSettings {
        command_timeout: Duration::from_secs(5),
        response_timeout,
    }))
}

fn handler(registry: &Arc<SessionRegistry>, secret: Option<[u8; 32]>) -> ConnectionHandler {
    ConnectionHandler::new(
        Arc::clone(registry),
        secret,
        Duration::from_secs(5),
        DEFAULT_MAX_LINE_LENGTH,
    )
}

/// Start a real agent on one end of a pipe and admit the other end
async fn connect_agent(
    handler: &ConnectionHandler,
    peer: SocketAddr,
    auth: AuthContext,
) -> (Result<u64, AuthError>, JoinHandle<Result<(), AgentError>>) {
    let (listener_end, agent_end) = duplex(1 << 20);

    let agent = tokio::spawn(async move {
        let mut state = AgentState::new("listener.test:8443", auth, Duration::from_secs(5));
        tether_agent::serve(
            Connected::plain(agent_end),
            &SessionConfig::default(),
            &mut state,
        )
        .await
    });

    let admitted = handler
        .handle(listener_end, peer)
        .await
        .map(|session| session.id());
    (admitted, agent)
}

fn secret_auth() -> AuthContext {
    AuthContext::new(Some(SECRET), None)
}

#[cfg(unix)]
#[tokio::test]
async fn test_exec_output_matches_local_run() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, Some(SECRET));
    let peer = addr(41000);

    let (admitted, _agent) = connect_agent(&handler, peer, secret_auth()).await;
    admitted.unwrap();

    let expected = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg("id")
        .output()
        .unwrap()
        .stdout;

    let response = registry
        .execute(&peer, &Command::Exec("id".to_string()))
        .await
        .unwrap();
    assert_eq!(response.output(), expected.as_slice());
    assert_eq!(response.reply(), None);
    assert_eq!(response.corrupt_frames(), 0);
}

#[tokio::test]
async fn test_wrong_secret_is_never_admitted() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, Some(SECRET));

    let (admitted, agent) = connect_agent(
        &handler,
        addr(41001),
        AuthContext::new(Some([0x11; 32]), None),
    )
    .await;

    assert!(matches!(admitted, Err(AuthError::InvalidProof)));
    assert!(matches!(
        agent.await.unwrap(),
        Err(AgentError::Auth(AuthError::Denied))
    ));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_ping() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41002);

    let (admitted, _agent) = connect_agent(&handler, peer, AuthContext::default()).await;
    admitted.unwrap();

    assert!(registry.ping(&peer).await.is_ok());
}

#[tokio::test]
async fn test_upload_ten_megabytes() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, Some(SECRET));
    let peer = addr(41003);

    let (admitted, _agent) = connect_agent(&handler, peer, secret_auth()).await;
    admitted.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("payload.bin");
    let remote = dir.path().join("uploaded.bin");

    // Poorly compressible so the chunks carry real weight
    let data: Vec<u8> = (0..10 * 1024 * 1024u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect();
    std::fs::write(&local, &data).unwrap();

    let written = transfer::upload(
        &registry,
        &peer,
        &local,
        remote.to_str().unwrap(),
        512 * 1024,
    )
    .await
    .unwrap();

    assert_eq!(written, data.len() as u64);
    assert_eq!(std::fs::read(&remote).unwrap(), data);
}

#[tokio::test]
async fn test_missing_local_file_leaves_session_alone() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41004);

    let (admitted, _agent) = connect_agent(&handler, peer, AuthContext::default()).await;
    admitted.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let result = transfer::upload(
        &registry,
        &peer,
        &dir.path().join("nope.bin"),
        "/tmp/never-written",
        1024,
    )
    .await;

    assert!(matches!(result, Err(TransferError::LocalIo { .. })));
    assert!(registry.ping(&peer).await.is_ok());
}

#[tokio::test]
async fn test_download() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41005);

    let (admitted, _agent) = connect_agent(&handler, peer, AuthContext::default()).await;
    admitted.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("report.txt");
    let local = dir.path().join("fetched.txt");
    std::fs::write(&remote, "line one\nline two\n").unwrap();

    let bytes = transfer::download(&registry, &peer, remote.to_str().unwrap(), &local)
        .await
        .unwrap();
    assert_eq!(bytes, 18);
    assert_eq!(std::fs::read_to_string(&local).unwrap(), "line one\nline two\n");

    // Agent-side failures are reported and the session stays usable
    let missing = dir.path().join("missing.txt");
    let result = transfer::download(&registry, &peer, missing.to_str().unwrap(), &local).await;
    assert!(matches!(result, Err(TransferError::Remote(_))));
    assert_eq!(registry.len(), 1);
    assert!(registry.ping(&peer).await.is_ok());
}

#[tokio::test]
async fn test_newest_connection_wins() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41006);

    let (first, first_agent) = connect_agent(&handler, peer, AuthContext::default()).await;
    let (second, _second_agent) = connect_agent(&handler, peer, AuthContext::default()).await;
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(second > first);

    // The replaced connection is dropped, which the agent sees as a close
    assert!(first_agent.await.unwrap().is_ok());
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get(&peer).unwrap().id(), second);
    assert!(registry.ping(&peer).await.is_ok());
}

#[tokio::test]
async fn test_agent_disconnect_removes_session() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41007);

    let (listener_end, agent_end) = duplex(4096);
    let agent = tokio::spawn(async move {
        let (r, w) = split(agent_end);
        let mut reader = FramedRead::new(r, ChannelCodec::new());
        let mut writer = FramedWrite::new(w, ChannelCodec::new());
        agent_handshake(&mut reader, &mut writer, &AuthContext::default(), None).await
    });
    handler.handle(listener_end, peer).await.unwrap();
    agent.await.unwrap().unwrap();

    // Both halves are gone once the task ends
    for _ in 0..100 {
        if registry.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registry.is_empty());
    assert!(matches!(
        registry.execute(&peer, &Command::Ping).await,
        Err(SessionError::NotFound(_))
    ));
}

/// Agent that never finishes its first response, then catches up
async fn slow_agent(stream: DuplexStream) {
    let (r, w) = split(stream);
    let mut reader = FramedRead::new(r, ChannelCodec::new());
    let mut writer = FramedWrite::new(w, ChannelCodec::new());
    agent_handshake(&mut reader, &mut writer, &AuthContext::default(), None)
        .await
        .unwrap();

    while let Some(Ok(Inbound::Line(line))) = reader.next().await {
        match Command::parse(&line).unwrap() {
            Command::Exec(_) => {
                writer
                    .send(Outbound::Line(Frame::data(b"partial").to_line()))
                    .await
                    .unwrap();
            }
            Command::Ping => {
                // The first response's end marker shows up late
                for frame in [
                    Frame::End,
                    AgentReply::Pong.into_frame(),
                    Frame::End,
                ] {
                    writer.send(Outbound::Line(frame.to_line())).await.unwrap();
                }
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_response_timeout_keeps_session() {
    let registry = registry(Duration::from_secs(2));
    let handler = handler(&registry, None);
    let peer = addr(41008);

    let (listener_end, agent_end) = duplex(4096);
    tokio::spawn(slow_agent(agent_end));
    handler.handle(listener_end, peer).await.unwrap();

    let result = registry
        .execute(&peer, &Command::Exec("sleep 600".to_string()))
        .await;
    assert!(matches!(result, Err(SessionError::ResponseTimeout(_))));
    assert_eq!(registry.len(), 1);

    // Leftovers from the timed-out command are not mistaken for this reply
    let response = registry.execute(&peer, &Command::Ping).await.unwrap();
    assert_eq!(response.reply(), Some(AgentReply::Pong));
    assert!(response.output().is_empty());
}

/// Agent that answers each command with the frames `reply` returns, followed
/// by the end marker; `None` leaves the command unanswered
///
/// Every command it receives is passed on through `seen`.
async fn scripted_agent<F>(
    stream: DuplexStream,
    seen: mpsc::UnboundedSender<Command>,
    reply: F,
) where
    F: Fn(&Command) -> Option<Vec<Frame>>,
{
    let (r, w) = split(stream);
    let mut reader = FramedRead::new(r, ChannelCodec::new());
    let mut writer = FramedWrite::new(w, ChannelCodec::new());
    agent_handshake(&mut reader, &mut writer, &AuthContext::default(), None)
        .await
        .unwrap();

    while let Some(Ok(Inbound::Line(line))) = reader.next().await {
        let command = Command::parse(&line).unwrap();
        let frames = reply(&command);
        let _ = seen.send(command);

        for frame in frames.into_iter().flatten().chain([Frame::End]) {
            if writer.send(Outbound::Line(frame.to_line())).await.is_err() {
                return;
            }
        }
    }
}

/// Admit a scripted agent; returns the commands it sees
async fn admit_scripted<F>(
    handler: &ConnectionHandler,
    peer: SocketAddr,
    reply: F,
) -> mpsc::UnboundedReceiver<Command>
where
    F: Fn(&Command) -> Option<Vec<Frame>> + Send + 'static,
{
    let (listener_end, agent_end) = duplex(1 << 20);
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(scripted_agent(agent_end, tx, reply));
    handler.handle(listener_end, peer).await.unwrap();
    rx
}

fn seen(rx: &mut mpsc::UnboundedReceiver<Command>) -> Vec<Command> {
    let mut commands = Vec::new();
    while let Ok(command) = rx.try_recv() {
        commands.push(command);
    }
    commands
}

fn ok() -> Option<Vec<Frame>> {
    Some(vec![AgentReply::Ok.into_frame()])
}

fn local_file(dir: &tempfile::TempDir, len: usize) -> std::path::PathBuf {
    let path = dir.path().join("payload.bin");
    std::fs::write(&path, vec![0x42u8; len]).unwrap();
    path
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_chunk_is_session_fatal() {
    let registry = registry(Duration::from_secs(2));
    let handler = handler(&registry, None);
    let peer = addr(41020);

    let mut commands = admit_scripted(&handler, peer, |command| match command {
        Command::Chunk { .. } => None,
        _ => ok(),
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let local = local_file(&dir, 3000);
    let result = transfer::upload(&registry, &peer, &local, "/tmp/target.bin", 1024).await;

    let err = result.unwrap_err();
    assert!(
        matches!(err, TransferError::Session(SessionError::Transport(_))),
        "got {:?}",
        err
    );
    assert!(err.is_session_fatal());

    // Nothing else is sent on a session that stopped answering
    let commands = seen(&mut commands);
    assert_eq!(commands.len(), 2);
    assert!(matches!(commands[0], Command::Upload { .. }));
    assert!(matches!(commands[1], Command::Chunk { index: 0, .. }));
}

#[tokio::test]
async fn test_wrong_acknowledgment_aborts_upload() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41021);

    let mut commands = admit_scripted(&handler, peer, |command| match command {
        Command::Chunk { .. } => Some(vec![AgentReply::Ack(7).into_frame()]),
        Command::Ping => Some(vec![AgentReply::Pong.into_frame()]),
        _ => ok(),
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let local = local_file(&dir, 3000);
    let result = transfer::upload(&registry, &peer, &local, "/tmp/target.bin", 1024).await;

    match result {
        Err(TransferError::Acknowledgement { expected, got }) => {
            assert_eq!(expected, 0);
            assert_eq!(got, "ACK 7");
        }
        other => panic!("expected acknowledgment error, got {:?}", other),
    }

    let commands = seen(&mut commands);
    assert_eq!(commands.len(), 3);
    assert!(matches!(commands[1], Command::Chunk { index: 0, .. }));
    assert_eq!(commands[2], Command::UploadAbort);

    assert_eq!(registry.len(), 1);
    assert!(registry.ping(&peer).await.is_ok());
}

#[tokio::test]
async fn test_negative_acknowledgment_aborts_upload() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41022);

    let mut commands = admit_scripted(&handler, peer, |command| match command {
        Command::Chunk { index: 1, .. } => {
            Some(vec![AgentReply::Err("disk full".to_string()).into_frame()])
        }
        Command::Chunk { index, .. } => Some(vec![AgentReply::Ack(*index).into_frame()]),
        _ => ok(),
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let local = local_file(&dir, 3000);
    let result = transfer::upload(&registry, &peer, &local, "/tmp/target.bin", 1024).await;

    assert!(matches!(result, Err(TransferError::Remote(ref m)) if m == "disk full"));
    let commands = seen(&mut commands);
    assert_eq!(commands.last(), Some(&Command::UploadAbort));
    assert!(!commands.contains(&Command::UploadEnd));
    assert_eq!(registry.len(), 1);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_local_read_error_aborts_upload() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41023);

    let mut commands = admit_scripted(&handler, peer, |_| ok()).await;

    // A directory opens fine but every read fails
    let dir = tempfile::tempdir().unwrap();
    let result = transfer::upload(&registry, &peer, dir.path(), "/tmp/target.bin", 1024).await;

    let err = result.unwrap_err();
    assert!(matches!(err, TransferError::LocalIo { .. }), "got {:?}", err);
    assert!(!err.is_session_fatal());

    let commands = seen(&mut commands);
    assert_eq!(commands.len(), 2);
    assert!(matches!(commands[0], Command::Upload { .. }));
    assert_eq!(commands[1], Command::UploadAbort);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_corrupt_download_keeps_session() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41024);

    let _commands = admit_scripted(&handler, peer, |command| match command {
        Command::Download { .. } => Some(vec![Frame::Data("zz-not-hex".to_string())]),
        Command::Ping => Some(vec![AgentReply::Pong.into_frame()]),
        _ => ok(),
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("fetched.bin");
    let result = transfer::download(&registry, &peer, "/etc/hostname", &local).await;

    let err = result.unwrap_err();
    assert!(matches!(err, TransferError::Decode(_)), "got {:?}", err);
    assert!(!err.is_session_fatal());
    assert!(!local.exists());

    assert_eq!(registry.len(), 1);
    assert!(registry.ping(&peer).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_send_command_gives_up_on_busy_session() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41025);

    let mut commands = admit_scripted(&handler, peer, |_| ok()).await;

    let held = registry.exchange(&peer).await.unwrap();
    let started = tokio::time::Instant::now();
    let result = registry.send_command(&peer, &Command::Ping).await;

    let err = result.unwrap_err();
    assert!(matches!(err, SessionError::Busy { .. }), "got {:?}", err);
    assert!(!err.is_fatal());
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(6));
    assert!(seen(&mut commands).is_empty());

    drop(held);
    registry.send_command(&peer, &Command::Ping).await.unwrap();
    assert_eq!(registry.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_response_wait() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41026);

    let _commands = admit_scripted(&handler, peer, |command| match command {
        Command::Exec(_) => Some(vec![Frame::data(b"done\n")]),
        _ => ok(),
    })
    .await;

    registry
        .send_command(&peer, &Command::Exec("true".to_string()))
        .await
        .unwrap();
    let response = registry.get_response(&peer, Duration::MAX).await.unwrap();
    assert_eq!(response.text(), "done\n");
}

#[cfg(unix)]
#[tokio::test]
async fn test_pty_round_trip() {
    let registry = registry(Duration::from_secs(30));
    let handler = handler(&registry, None);
    let peer = addr(41009);

    let (admitted, _agent) = connect_agent(&handler, peer, AuthContext::default()).await;
    admitted.unwrap();

    let mut bridge = registry
        .enter_pty_mode(&peer, TerminalSize::new(24, 80))
        .await
        .unwrap();
    assert!(registry.is_in_pty_mode(&peer));

    // Commands are refused while the terminal is attached
    assert!(matches!(
        registry.execute(&peer, &Command::Ping).await,
        Err(SessionError::ModeConflict { .. })
    ));

    bridge.resize(TerminalSize::new(40, 120)).await.unwrap();
    bridge.write(b"echo tether-$((40 + 2)); exit 3\n").await.unwrap();

    let mut seen = Vec::new();
    let collect = async {
        while let Some(chunk) = bridge.recv().await {
            seen.extend_from_slice(&chunk);
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&seen).contains("tether-42"));

    assert_eq!(bridge.exit().await.unwrap(), Some(3));
    assert!(!registry.is_in_pty_mode(&peer));
    assert!(registry.ping(&peer).await.is_ok());
}

/// Serve TLS on an ephemeral port with a fresh self-signed certificate
async fn tls_listener(
    registry: &Arc<SessionRegistry>,
    dir: &std::path::Path,
) -> (String, String, CancellationToken) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("listener.crt");
    let key_path = dir.join("listener.key");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
    let fingerprint = certificate_fingerprint(certified.cert.der());

    let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = socket.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();
    let server = TlsServer::new(
        tls::server_config(&cert_path, &key_path).unwrap(),
        Arc::new(handler(registry, Some(SECRET))),
        cancel.clone(),
    );
    tokio::spawn(async move { server.serve(socket).await });

    (target, fingerprint, cancel)
}

#[tokio::test]
async fn test_tls_with_pinned_fingerprint() {
    let registry = registry(Duration::from_secs(30));
    let dir = tempfile::tempdir().unwrap();
    let (target, fingerprint, cancel) = tls_listener(&registry, dir.path()).await;

    let connector = TlsConnector::new(
        target.clone(),
        tls::client_config().unwrap(),
        Duration::from_secs(5),
    );
    let connected = connector.connect().await.unwrap();
    assert!(connected.peer_certificate.is_some());

    tokio::spawn(async move {
        let auth = AuthContext::new(Some(SECRET), Some(fingerprint));
        let mut state = AgentState::new(target, auth, Duration::from_secs(5));
        tether_agent::serve(connected, &SessionConfig::default(), &mut state).await
    });

    for _ in 0..200 {
        if !registry.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let peer = registry.resolve_index("1").unwrap();
    assert!(peer.ip().is_loopback());
    assert!(registry.ping(&peer).await.is_ok());

    cancel.cancel();
    registry.close_all();
}

#[tokio::test]
async fn test_fingerprint_mismatch_is_refused() {
    let registry = registry(Duration::from_secs(30));
    let dir = tempfile::tempdir().unwrap();
    let (target, _, cancel) = tls_listener(&registry, dir.path()).await;

    let connector = TlsConnector::new(
        target.clone(),
        tls::client_config().unwrap(),
        Duration::from_secs(5),
    );
    let connected = connector.connect().await.unwrap();

    let auth = AuthContext::new(Some(SECRET), Some("ab".repeat(32)));
    let mut state = AgentState::new(target, auth, Duration::from_secs(5));
    let result = tether_agent::serve(connected, &SessionConfig::default(), &mut state).await;

    assert!(matches!(
        result,
        Err(AgentError::Auth(AuthError::FingerprintMismatch { .. }))
    ));
    assert!(registry.is_empty());
    cancel.cancel();
}
