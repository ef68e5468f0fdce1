use super::*;

fn channel() -> (EventSender, mpsc::UnboundedReceiver<ServerEvent>) {
    mpsc::unbounded_channel()
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn first_connection_broadcasts_online_set() {
    let presence = PresenceRegistry::default();
    let (alice_tx, mut alice_rx) = channel();
    let (bob_tx, mut bob_rx) = channel();

    assert!(
        presence
            .register_connection(UserId(1), ConnectionId(1), alice_tx)
            .await
    );
    assert!(
        presence
            .register_connection(UserId(2), ConnectionId(2), bob_tx)
            .await
    );

    assert_eq!(
        drain(&mut alice_rx),
        vec![
            ServerEvent::OnlineUsersUpdated {
                user_ids: vec![UserId(1)]
            },
            ServerEvent::OnlineUsersUpdated {
                user_ids: vec![UserId(1), UserId(2)]
            },
        ]
    );
    assert_eq!(
        drain(&mut bob_rx),
        vec![ServerEvent::OnlineUsersUpdated {
            user_ids: vec![UserId(1), UserId(2)]
        }]
    );
}

#[tokio::test]
async fn second_device_does_not_rebroadcast() {
    let presence = PresenceRegistry::default();
    let (phone_tx, mut phone_rx) = channel();
    let (laptop_tx, mut laptop_rx) = channel();

    presence
        .register_connection(UserId(1), ConnectionId(1), phone_tx)
        .await;
    drain(&mut phone_rx);
    assert!(
        !presence
            .register_connection(UserId(1), ConnectionId(2), laptop_tx)
            .await
    );

    assert!(drain(&mut phone_rx).is_empty());
    assert!(drain(&mut laptop_rx).is_empty());
    assert_eq!(
        presence.connections_for(UserId(1)).await,
        vec![ConnectionId(1), ConnectionId(2)]
    );

    assert!(!presence.unregister_connection(ConnectionId(1)).await);
    assert!(drain(&mut laptop_rx).is_empty());
    assert_eq!(presence.online_users().await, vec![UserId(1)]);
}

#[tokio::test]
async fn last_disconnect_broadcasts_removal() {
    let presence = PresenceRegistry::default();
    let (alice_tx, _alice_rx) = channel();
    let (bob_tx, mut bob_rx) = channel();
    presence
        .register_connection(UserId(1), ConnectionId(1), alice_tx)
        .await;
    presence
        .register_connection(UserId(2), ConnectionId(2), bob_tx)
        .await;
    drain(&mut bob_rx);

    assert!(presence.unregister_connection(ConnectionId(1)).await);
    assert_eq!(
        drain(&mut bob_rx),
        vec![ServerEvent::OnlineUsersUpdated {
            user_ids: vec![UserId(2)]
        }]
    );
    assert!(presence.connections_for(UserId(1)).await.is_empty());
}

#[tokio::test]
async fn unknown_connection_is_ignored() {
    let presence = PresenceRegistry::default();
    assert!(!presence.unregister_connection(ConnectionId(42)).await);
    assert!(!presence.request_snapshot(ConnectionId(42)).await);
    assert!(presence.sender(ConnectionId(42)).await.is_none());
}

#[tokio::test]
async fn snapshot_goes_to_one_connection() {
    let presence = PresenceRegistry::default();
    let (alice_tx, mut alice_rx) = channel();
    let (bob_tx, mut bob_rx) = channel();
    presence
        .register_connection(UserId(1), ConnectionId(1), alice_tx)
        .await;
    presence
        .register_connection(UserId(2), ConnectionId(2), bob_tx)
        .await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    assert!(presence.request_snapshot(ConnectionId(2)).await);
    assert!(drain(&mut alice_rx).is_empty());
    assert_eq!(
        drain(&mut bob_rx),
        vec![ServerEvent::OnlineUsersUpdated {
            user_ids: vec![UserId(1), UserId(2)]
        }]
    );
}

#[test]
fn connection_ids_are_unique() {
    let presence = PresenceRegistry::default();
    let first = presence.next_connection_id();
    let second = presence.next_connection_id();
    assert_ne!(first, second);
}
