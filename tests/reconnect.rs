//! Socket reconnect supervision through the session

mod common;

use common::{serial, settle, socket, texts};
use linkterm_core::core::logger::EntryKind;
use linkterm_core::core::session::SessionState;
use linkterm_core::core::transport::{Capabilities, TransportError, TransportKind};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_unexpected_close_reconnects_once_after_delay() {
    let (session, connector) = common::session(socket());
    let first = connector.push_link(TransportKind::Socket, Capabilities::STREAM);
    let second = connector.push_link(TransportKind::Socket, Capabilities::STREAM);

    session.connect().await.unwrap();
    first.end_stream();
    settle().await;

    assert_eq!(session.state(), SessionState::Reconnecting);
    assert!(session.reconnect_pending());
    assert_eq!(connector.attempts(), 1);

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(connector.attempts(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(session.state(), SessionState::Connected);
    assert!(second.is_open());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_disconnect_never_reconnects() {
    let (session, connector) = common::session(socket());
    let peer = connector.push_link(TransportKind::Socket, Capabilities::STREAM);
    let _spare = connector.push_link(TransportKind::Socket, Capabilities::STREAM);

    session.connect().await.unwrap();
    session.disconnect().await;
    peer.end_stream();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_timer() {
    let (session, connector) = common::session(socket());
    let peer = connector.push_link(TransportKind::Socket, Capabilities::STREAM);
    let _spare = connector.push_link(TransportKind::Socket, Capabilities::STREAM);

    session.connect().await.unwrap();
    peer.end_stream();
    settle().await;
    assert!(session.reconnect_pending());

    session.disconnect().await;
    assert!(!session.reconnect_pending());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_attempts_retry_every_second() {
    let (session, connector) = common::session(socket());
    let peer = connector.push_link(TransportKind::Socket, Capabilities::STREAM);
    connector.push_error(TransportError::ConnectFailure("refused".into()));
    connector.push_error(TransportError::ConnectFailure("refused".into()));
    let last = connector.push_link(TransportKind::Socket, Capabilities::STREAM);

    session.connect().await.unwrap();
    peer.end_stream();
    settle().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(session.state(), SessionState::Reconnecting);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(connector.attempts(), 4);
    assert_eq!(session.state(), SessionState::Connected);
    assert!(last.is_open());
    assert_eq!(texts(&session, EntryKind::Error).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_serial_close_is_final() {
    let (session, connector) = common::session(serial());
    let peer = connector.push_link(TransportKind::Serial, Capabilities::STREAM);
    let _spare = connector.push_link(TransportKind::Serial, Capabilities::STREAM);

    session.connect().await.unwrap();
    peer.end_stream();
    settle().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_while_reconnecting() {
    let (session, connector) = common::session(socket());
    let peer = connector.push_link(TransportKind::Socket, Capabilities::STREAM);
    let _next = connector.push_link(TransportKind::Socket, Capabilities::STREAM);

    session.connect().await.unwrap();
    peer.end_stream();
    settle().await;
    assert_eq!(session.state(), SessionState::Reconnecting);

    session.connect().await.unwrap();
    assert!(!session.reconnect_pending());
    assert_eq!(session.state(), SessionState::Connected);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(connector.attempts(), 2);
}
