//! Integration tests for Tor control port communication
//!
//! A fake control server on a local TcpListener answers each command line
//! with canned reply lines, optionally preceded by asynchronous events.

use onionwrapper::tor::control::{ControlChannel, ControlPort};
use onionwrapper::tor::TorEvent;
use onionwrapper::Error;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Serve one connection. The handler returns the lines to send back, or
/// None to hang up. Resolves to the command lines received.
async fn fake_server<F>(handler: F) -> (u16, JoinHandle<Vec<String>>)
where
    F: Fn(&str) -> Option<Vec<String>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut received = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            received.push(line.clone());
            let Some(replies) = handler(&line) else {
                break;
            };
            for reply in replies {
                if write.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                    return received;
                }
            }
        }
        received
    });
    (port, task)
}

fn ok() -> Option<Vec<String>> {
    Some(vec!["250 OK".to_string()])
}

async fn next_event(events: &mut mpsc::Receiver<TorEvent>) -> TorEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_authenticate_and_configure() {
    let (port, server) = fake_server(|line| {
        if line.starts_with("GETINFO status/circuit-established") {
            Some(vec![
                "250-status/circuit-established=1".to_string(),
                "250 OK".to_string(),
            ])
        } else {
            ok()
        }
    })
    .await;
    let (tx, _events) = mpsc::channel(16);
    let control = ControlPort::connect(port, tx).await.unwrap();

    control.authenticate(&[0xab; 32]).await.unwrap();
    control.take_ownership().await.unwrap();
    control.reset_conf(&["__OwningControllerProcess"]).await.unwrap();
    control.set_conf("DisableNetwork", "0").await.unwrap();
    control
        .set_conf_lines(&["UseBridges 1".to_string(), "Bridge 192.0.2.1:443".to_string()])
        .await
        .unwrap();
    let established = control.get_info("status/circuit-established").await.unwrap();
    assert_eq!(established.as_deref(), Some("1"));
    control.close().await.unwrap();

    let received = server.await.unwrap();
    assert_eq!(
        received,
        vec![
            format!("AUTHENTICATE {}", "ab".repeat(32)),
            "TAKEOWNERSHIP".to_string(),
            "RESETCONF __OwningControllerProcess".to_string(),
            "SETCONF DisableNetwork=\"0\"".to_string(),
            "SETCONF UseBridges=\"1\" Bridge=\"192.0.2.1:443\"".to_string(),
            "GETINFO status/circuit-established".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_events_between_replies() {
    let (port, _server) = fake_server(|line| {
        if line.starts_with("SETEVENTS") {
            Some(vec![
                "650 CIRC 7 BUILT $AAAA~a,$BBBB~b PURPOSE=GENERAL".to_string(),
                "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=100 TAG=done".to_string(),
                "250 OK".to_string(),
            ])
        } else {
            ok()
        }
    })
    .await;
    let (tx, mut events) = mpsc::channel(16);
    let control = ControlPort::connect(port, tx).await.unwrap();

    control.set_events(&["CIRC", "STATUS_CLIENT"]).await.unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        TorEvent::CircuitStatus { ref status, ref id, .. } if status == "BUILT" && id == "7"
    ));
    assert_eq!(
        next_event(&mut events).await,
        TorEvent::Unrecognized {
            kind: "STATUS_CLIENT".to_string(),
            msg: "NOTICE BOOTSTRAP PROGRESS=100 TAG=done".to_string(),
        }
    );
}

#[tokio::test]
async fn test_error_status() {
    let (port, _server) =
        fake_server(|_| Some(vec!["552 Unrecognized option: Unknown option 'Bogus'".to_string()])).await;
    let (tx, _events) = mpsc::channel(16);
    let control = ControlPort::connect(port, tx).await.unwrap();

    let err = control.set_conf("Bogus", "1").await.unwrap_err();
    assert!(matches!(err, Error::Control(ref msg) if msg.starts_with("552")));
}

#[tokio::test]
async fn test_add_onion_reply() {
    let (port, server) = fake_server(|line| {
        if line.starts_with("ADD_ONION") {
            Some(vec![
                "250-ServiceID=abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuvwx".to_string(),
                "250-PrivateKey=ED25519-V3:a2V5bWF0ZXJpYWw=".to_string(),
                "250 OK".to_string(),
            ])
        } else {
            ok()
        }
    })
    .await;
    let (tx, _events) = mpsc::channel(16);
    let control = ControlPort::connect(port, tx).await.unwrap();

    let reply = control
        .add_onion("NEW:ED25519-V3", &[(80, "127.0.0.1:8080".to_string())])
        .await
        .unwrap();
    assert_eq!(reply["PrivateKey"], "ED25519-V3:a2V5bWF0ZXJpYWw=");
    assert_eq!(
        reply["ServiceID"],
        "abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuvwx"
    );
    control.del_onion("abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuvwx").await.unwrap();
    control.close().await.unwrap();

    let received = server.await.unwrap();
    assert_eq!(received[0], "ADD_ONION NEW:ED25519-V3 Port=80,127.0.0.1:8080");
    assert_eq!(
        received[1],
        "DEL_ONION abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuvwx"
    );
}

#[tokio::test]
async fn test_get_info_data_block() {
    let (port, _server) = fake_server(|_| {
        Some(vec![
            "250+status/bootstrap-phase=".to_string(),
            "NOTICE BOOTSTRAP PROGRESS=45 TAG=loading_descriptors".to_string(),
            ".".to_string(),
            "250 OK".to_string(),
        ])
    })
    .await;
    let (tx, _events) = mpsc::channel(16);
    let control = ControlPort::connect(port, tx).await.unwrap();

    let phase = control.get_info("status/bootstrap-phase").await.unwrap();
    assert_eq!(
        phase.as_deref(),
        Some("NOTICE BOOTSTRAP PROGRESS=45 TAG=loading_descriptors")
    );
    let missing = control.get_info("status/other").await.unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_remote_close() {
    let (port, _server) =
        fake_server(|line| if line.starts_with("SETEVENTS") { None } else { ok() }).await;
    let (tx, mut events) = mpsc::channel(16);
    let control = ControlPort::connect(port, tx).await.unwrap();

    control.take_ownership().await.unwrap();
    // The server hangs up instead of replying
    let err = control.set_events(&["CIRC"]).await.unwrap_err();
    assert!(matches!(err, Error::Control(_)));
    assert_eq!(next_event(&mut events).await, TorEvent::ConnectionClosed);
}

#[tokio::test]
async fn test_shutdown_without_reply() {
    let (port, _server) = fake_server(|line| if line.starts_with("SIGNAL") { None } else { ok() }).await;
    let (tx, _events) = mpsc::channel(16);
    let control = ControlPort::connect(port, tx).await.unwrap();

    control.shutdown_tor("TERM").await.unwrap();
}

#[tokio::test]
async fn test_abandoned_command_reply_is_skipped() {
    // The reply to the first GETINFO only arrives with the second one
    let (port, _server) = fake_server(|line| match line {
        "GETINFO status/bootstrap-phase" => Some(Vec::new()),
        _ => Some(vec![
            "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=5".to_string(),
            "250 OK".to_string(),
            "250-status/circuit-established=1".to_string(),
            "250 OK".to_string(),
        ]),
    })
    .await;
    let (tx, _events) = mpsc::channel(16);
    let control = ControlPort::connect(port, tx).await.unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(200), control.get_info("status/bootstrap-phase")).await;
    assert!(abandoned.is_err());

    let established = control.get_info("status/circuit-established").await.unwrap();
    assert_eq!(established.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_commands_after_close() {
    let (port, _server) = fake_server(|_| ok()).await;
    let (tx, _events) = mpsc::channel(16);
    let control = ControlPort::connect(port, tx).await.unwrap();

    control.close().await.unwrap();
    let err = control.take_ownership().await.unwrap_err();
    assert!(matches!(err, Error::ChannelNotOpen));
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (tx, _events) = mpsc::channel(16);
    let err = ControlPort::connect(port, tx).await.err().unwrap();
    assert!(matches!(err, Error::Control(_)));
}
