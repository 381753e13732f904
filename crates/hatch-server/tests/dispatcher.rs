//! End-to-end tests: a real dispatcher on a loopback port, real sessions.

use futures_util::{SinkExt, StreamExt};
use hatch_client::{Session, SessionConfig};
use hatch_core::Frame;
use hatch_server::{
    CloseReason, ConnectionState, Dispatcher, Envelope, Identity, MessageKind, Outbound, SendError,
    ServerConfig, serve,
};
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(2);

async fn start() -> Dispatcher {
    let config = ServerConfig {
        port: 0,
        drop_pause_ms: 20,
        ..ServerConfig::default()
    };
    let dispatcher = Dispatcher::bind(config).await.unwrap();
    dispatcher.spawn();
    dispatcher
}

async fn connect(dispatcher: &Dispatcher, identity: u64) -> Session {
    let config = SessionConfig::new("127.0.0.1", dispatcher.local_addr().port())
        .with_identity(Identity::new(identity))
        .with_receive_timeout(Some(WAIT));
    Session::connect(config).await.unwrap()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn numbered(kind: MessageKind, n: u32) -> Envelope {
    Envelope::with_payload(kind, &json!(n)).unwrap()
}

#[tokio::test]
async fn handshake_registers_one_active_connection() {
    let dispatcher = start().await;
    let session = connect(&dispatcher, 1001).await;

    assert_eq!(session.state(), ConnectionState::Active);
    assert_eq!(dispatcher.identities(), [Identity::new(1001)]);
    assert_eq!(
        dispatcher.state_of(Identity::new(1001)),
        Some(ConnectionState::Active)
    );
}

#[tokio::test]
async fn envelopes_arrive_in_order_stamped_with_sender() {
    let dispatcher = start().await;
    let session = connect(&dispatcher, 7).await;

    for n in 0..10 {
        session.send(&numbered(MessageKind::Login, n)).await.unwrap();
    }
    for n in 0..10 {
        let env = dispatcher.next_envelope(Some(WAIT)).await.expect("envelope");
        assert_eq!(env.origin, Identity::new(7));
        assert_eq!(env.payload_as::<u32>().unwrap(), n);
    }
    assert!(dispatcher.receive_any().is_none());
}

#[tokio::test]
async fn receive_of_kind_leaves_other_kinds_queued() {
    let dispatcher = start().await;
    let session = connect(&dispatcher, 8).await;

    session.send(&numbered(MessageKind::AddDish, 1)).await.unwrap();
    session.send(&numbered(MessageKind::AddDish, 2)).await.unwrap();
    session.send(&Envelope::new(MessageKind::GetBasket)).await.unwrap();

    let mut basket = None;
    eventually("GET_BASKET", || {
        basket = dispatcher.receive_of_kind(MessageKind::GetBasket);
        basket.is_some()
    })
    .await;

    let first = dispatcher.receive_of_kind(MessageKind::AddDish).unwrap();
    let second = dispatcher.receive_of_kind(MessageKind::AddDish).unwrap();
    assert_eq!(first.payload_as::<u32>().unwrap(), 1);
    assert_eq!(second.payload_as::<u32>().unwrap(), 2);
}

#[tokio::test]
async fn client_filters_by_kind_and_intercepts_update() {
    let dispatcher = start().await;
    let session = connect(&dispatcher, 9).await;
    let refresh = session.refresh();
    let id = session.identity();

    dispatcher.unicast(id, &numbered(MessageKind::Dishes, 1)).await.unwrap();
    dispatcher.unicast(id, &Envelope::update()).await.unwrap();
    dispatcher.unicast(id, &numbered(MessageKind::Dishes, 2)).await.unwrap();
    dispatcher.unicast(id, &numbered(MessageKind::Basket, 3)).await.unwrap();

    let basket = session.receive_kind(MessageKind::Basket).await.unwrap();
    assert_eq!(basket.payload_as::<u32>().unwrap(), 3);
    assert!(refresh.is_requested());

    let a = session.receive_kind(MessageKind::Dishes).await.unwrap();
    let b = session.receive_kind(MessageKind::Dishes).await.unwrap();
    assert_eq!(a.payload_as::<u32>().unwrap(), 1);
    assert_eq!(b.payload_as::<u32>().unwrap(), 2);
    assert!(session.receive().unwrap().is_none());
    assert!(refresh.take());
}

#[tokio::test]
async fn broadcast_reaches_every_connection() {
    let dispatcher = start().await;
    let sessions = [
        connect(&dispatcher, 21).await,
        connect(&dispatcher, 22).await,
        connect(&dispatcher, 23).await,
    ];

    let report = dispatcher.broadcast(&numbered(MessageKind::Status, 5)).await;
    assert!(report.all_succeeded());
    assert_eq!(report.delivered.len(), 3);

    for session in &sessions {
        let env = session.receive_kind(MessageKind::Status).await.unwrap();
        assert_eq!(env.payload_as::<u32>().unwrap(), 5);
    }
}

#[tokio::test]
async fn invalid_broadcast_fails_everywhere() {
    let dispatcher = start().await;
    let _a = connect(&dispatcher, 31).await;
    let _b = connect(&dispatcher, 32).await;

    let report = dispatcher.broadcast(&Envelope::new(MessageKind::Orders)).await;
    assert!(!report.all_succeeded());
    assert!(report.delivered.is_empty());
    assert_eq!(report.failed.len(), 2);
    assert!(
        report
            .failed
            .iter()
            .all(|(_, e)| matches!(e, SendError::Invalid(_)))
    );
}

#[tokio::test]
async fn unicast_only_reaches_its_target() {
    let dispatcher = start().await;
    let target = connect(&dispatcher, 41).await;
    let bystander = connect(&dispatcher, 42).await;

    dispatcher
        .unicast(target.identity(), &numbered(MessageKind::Cost, 12))
        .await
        .unwrap();
    let env = target.receive_kind(MessageKind::Cost).await.unwrap();
    assert_eq!(env.payload_as::<u32>().unwrap(), 12);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bystander.receive().unwrap().is_none());

    let missing = dispatcher
        .unicast(Identity::new(404), &Envelope::new(MessageKind::SendClear))
        .await;
    assert!(matches!(missing, Err(SendError::UnknownIdentity(id)) if id == Identity::new(404)));
}

#[tokio::test]
async fn client_disconnect_is_removed_from_registry() {
    let dispatcher = start().await;
    let leaving = connect(&dispatcher, 51).await;
    let staying = connect(&dispatcher, 52).await;

    leaving.close().await;
    eventually("registry cleanup", || !dispatcher.contains(Identity::new(51))).await;

    assert!(dispatcher.contains(staying.identity()));
    dispatcher
        .unicast(staying.identity(), &Envelope::new(MessageKind::SendCancel))
        .await
        .unwrap();
}

#[tokio::test]
async fn server_close_unblocks_waiting_client() {
    let dispatcher = start().await;
    let session = std::sync::Arc::new(connect(&dispatcher, 61).await);

    let waiter = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .receive_kind_timeout(MessageKind::Order, None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(dispatcher.drop_all_connections().await, 1);

    let result = tokio::time::timeout(WAIT, waiter).await.expect("waiter released").unwrap();
    assert!(matches!(result, Err(hatch_client::RecvError::Closed(CloseReason::Remote))));
}

#[tokio::test]
async fn drop_all_then_reconnect() {
    let dispatcher = start().await;
    let _a = connect(&dispatcher, 71).await;
    let _b = connect(&dispatcher, 72).await;
    assert_eq!(dispatcher.connection_count(), 2);

    assert_eq!(dispatcher.drop_all_connections().await, 2);
    assert_eq!(dispatcher.connection_count(), 0);

    let again = connect(&dispatcher, 71).await;
    assert_eq!(again.state(), ConnectionState::Active);
    assert_eq!(dispatcher.identities(), [Identity::new(71)]);
}

#[tokio::test]
async fn duplicate_identity_is_rejected() {
    let dispatcher = start().await;
    let _first = connect(&dispatcher, 81).await;

    let config = SessionConfig::new("127.0.0.1", dispatcher.local_addr().port())
        .with_identity(Identity::new(81));
    let err = Session::connect(config).await.unwrap_err();
    assert!(matches!(err, hatch_client::ClientError::Rejected(_)));
    assert_eq!(dispatcher.connection_count(), 1);
}

#[tokio::test]
async fn envelope_before_hello_fails_the_connection() {
    let dispatcher = start().await;
    let url = format!("ws://{}", dispatcher.local_addr());
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let early = Frame::Envelope(Envelope::new(MessageKind::Login));
    ws.send(early.to_message().unwrap()).await.unwrap();

    let ended = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "server kept the connection open");
    assert_eq!(dispatcher.connection_count(), 0);
}

#[tokio::test]
async fn serve_routes_replies_and_broadcasts() {
    let dispatcher = start().await;
    let server = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let mut handler = |request: &Envelope| match request.kind {
                MessageKind::GetDishes => vec![Outbound::Reply(
                    Envelope::with_payload(MessageKind::Dishes, &json!(["soup"])).unwrap(),
                )],
                MessageKind::AddDish => vec![Outbound::Broadcast(Envelope::update())],
                _ => Vec::new(),
            };
            serve(&dispatcher, &mut handler).await;
        })
    };

    let asker = connect(&dispatcher, 91).await;
    let watcher = connect(&dispatcher, 92).await;
    let watcher_refresh = watcher.refresh();

    let dishes = asker
        .request(&Envelope::new(MessageKind::GetDishes))
        .await
        .unwrap();
    assert_eq!(dishes.payload_as::<Vec<String>>().unwrap(), ["soup"]);

    asker
        .send(&Envelope::with_payload(MessageKind::AddDish, &json!({"name": "stew"})).unwrap())
        .await
        .unwrap();
    tokio::time::timeout(WAIT, watcher_refresh.wait())
        .await
        .expect("watcher asked to refresh");

    dispatcher.shutdown();
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(asker.closed().await, CloseReason::Remote);
}
