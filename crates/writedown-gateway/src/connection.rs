use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use writedown_db::Database;
use writedown_types::api::Claims;
use writedown_types::events::{CollectionChange, GatewayCommand, GatewayEvent};

use crate::access;
use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh socket has to send its Identify command.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Characters of a malformed command echoed into the log.
const PREVIEW_CHARS: usize = 200;

type Subscriptions = Arc<RwLock<HashSet<String>>>;

/// Handle a single WebSocket connection: Identify handshake, then relay
/// changes of the collections the client subscribes to.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let Some(user_id) = wait_for_identify(&mut receiver, &jwt_secret).await else {
        warn!("WebSocket client failed to identify, closing");
        return;
    };

    info!("{} connected to gateway", user_id);

    // Step 2: Send Ready event
    let ready = GatewayEvent::Ready {
        user_id: user_id.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, dispatcher, db, user_id.clone()).await;
    info!("{} disconnected from gateway", user_id);
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), ()> {
    let text = serde_json::to_string(event).map_err(|e| {
        error!("failed to encode gateway event: {}", e);
    })?;
    sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|_| ())
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: String,
) {
    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    // Replies to this connection only (subscription errors)
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut broadcast_rx = dispatcher.subscribe_all();

    // Forward subscribed changes + replies -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let change = match result {
                        Ok(change) => change,
                        Err(RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} changes", n);
                            let Ok(errors) = lag_errors(&send_subscriptions, n) else {
                                break;
                            };
                            let mut failed = false;
                            for event in errors {
                                if send_event(&mut sender, &event).await.is_err() {
                                    failed = true;
                                    break;
                                }
                            }
                            if failed {
                                break;
                            }
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };

                    let event = match relay(&send_subscriptions, change) {
                        Ok(Some(event)) => event,
                        Ok(None) => continue,
                        Err(()) => break,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(event) = reply else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(
                                "Heartbeat timeout (missed {} pongs), dropping connection",
                                missed_heartbeats
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let recv_user = user_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&db, &recv_user, cmd, &subscriptions, &reply_tx).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            recv_user,
                            e,
                            preview(&text)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<String> {
    let handshake = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                match identify(&text, jwt_secret) {
                    Some(Ok(user_id)) => return Some(user_id),
                    Some(Err(e)) => {
                        warn!("Identify rejected: {}", e);
                        return None;
                    }
                    None => {}
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, handshake).await.ok().flatten()
}

/// The user id of an Identify frame. `None` if the frame is anything else.
fn identify(text: &str, jwt_secret: &str) -> Option<Result<String, jsonwebtoken::errors::Error>> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let Ok(GatewayCommand::Identify { token }) = serde_json::from_str::<GatewayCommand>(text) else {
        return None;
    };
    let claims = decode::<Claims>(
        &token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    );
    Some(claims.map(|data| data.claims.sub))
}

/// The event to forward for a change, if the connection subscribed to its
/// collection. Errs if the subscription set is poisoned.
fn relay(
    subscriptions: &Subscriptions,
    change: CollectionChange,
) -> Result<Option<GatewayEvent>, ()> {
    let subs = subscriptions.read().map_err(|_| ())?;
    if subs.contains(&change.collection) {
        Ok(Some(GatewayEvent::Change(change)))
    } else {
        Ok(None)
    }
}

/// After missing `n` changes every subscription is dropped and reported,
/// so the client resubscribes and refetches.
fn lag_errors(subscriptions: &Subscriptions, n: u64) -> Result<Vec<GatewayEvent>, ()> {
    let mut subs = subscriptions.write().map_err(|_| ())?;
    Ok(subs
        .drain()
        .map(|collection| GatewayEvent::Error {
            collection,
            reason: format!("lagged by {} changes", n),
        })
        .collect())
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

async fn handle_command(
    db: &Arc<Database>,
    user_id: &str,
    cmd: GatewayCommand,
    subscriptions: &Subscriptions,
    reply_tx: &mpsc::UnboundedSender<GatewayEvent>,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::Subscribe { collection } => {
            let db = db.clone();
            let uid = user_id.to_string();
            let path = collection.clone();
            let allowed =
                tokio::task::spawn_blocking(move || access::can_read(&db, &uid, &path)).await;

            let refusal = match allowed {
                Ok(Ok(true)) => None,
                Ok(Ok(false)) => Some("forbidden".to_string()),
                Ok(Err(e)) => {
                    error!("access check for {} failed: {}", collection, e);
                    Some("internal error".to_string())
                }
                Err(e) => {
                    error!("spawn_blocking join error: {}", e);
                    Some("internal error".to_string())
                }
            };

            match refusal {
                None => {
                    info!("{} subscribed to {}", user_id, collection);
                    if let Ok(mut subs) = subscriptions.write() {
                        subs.insert(collection);
                    }
                }
                Some(reason) => {
                    warn!("{} refused subscription to {}: {}", user_id, collection, reason);
                    let _ = reply_tx.send(GatewayEvent::Error { collection, reason });
                }
            }
        }

        GatewayCommand::Unsubscribe { collection } => {
            if let Ok(mut subs) = subscriptions.write() {
                subs.remove(&collection);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;
    use uuid::Uuid;
    use writedown_types::models::new_slug;
    use writedown_types::paths::{CHANNEL_DIRECTORY, channel_messages};
    use writedown_types::{Channel, Document, DocumentChange, Visibility};

    const SECRET: &str = "gateway-secret";

    fn token(user: &str, secret: &str) -> String {
        let claims = Claims {
            sub: user.into(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn identify_frame(token: &str) -> String {
        json!({ "type": "Identify", "data": { "token": token } }).to_string()
    }

    fn subscriptions(collections: &[&str]) -> Subscriptions {
        Arc::new(RwLock::new(collections.iter().map(|c| c.to_string()).collect()))
    }

    /// A database holding one channel with the given members.
    fn db_with_channel(members: &[&str]) -> (Arc<Database>, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let channel = Channel {
            id: Uuid::new_v4(),
            name: "general".into(),
            emoji: "🙂".into(),
            emoji_background: "#fde68a".into(),
            user_id: members[0].into(),
            visibility: Visibility::Public,
            slug: new_slug(),
            messages: vec![],
            members: members.iter().map(|m| m.to_string()).collect(),
        };
        let doc = Document::from_model(channel.id.to_string(), &channel).unwrap();
        db.create_document(CHANNEL_DIRECTORY, &doc.id, doc.fields).unwrap();
        (Arc::new(db), channel.id)
    }

    fn subscribe(collection: &str) -> GatewayCommand {
        GatewayCommand::Subscribe {
            collection: collection.into(),
        }
    }

    #[test]
    fn identify_accepts_only_valid_tokens() {
        let frame = identify_frame(&token("u1", SECRET));
        assert_eq!(identify(&frame, SECRET).unwrap().unwrap(), "u1");

        let forged = identify_frame(&token("u1", "other-secret"));
        assert!(identify(&forged, SECRET).unwrap().is_err());
        assert!(identify(&identify_frame("garbage"), SECRET).unwrap().is_err());

        let other = json!({ "type": "Unsubscribe", "data": { "collection": "x" } }).to_string();
        assert!(identify(&other, SECRET).is_none());
        assert!(identify("not json", SECRET).is_none());
    }

    #[test]
    fn preview_cuts_on_char_boundaries() {
        let text = format!("{}éx", "a".repeat(PREVIEW_CHARS - 1));
        let cut = preview(&text);
        assert_eq!(cut.chars().count(), PREVIEW_CHARS);
        assert!(cut.ends_with('é'));
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn relay_forwards_subscribed_collections_only() {
        let subs = subscriptions(&["users/u1/channels"]);
        let change = |collection: &str| CollectionChange {
            collection: collection.into(),
            change: DocumentChange::Removed { id: "c1".into() },
        };

        let forwarded = relay(&subs, change("users/u1/channels")).unwrap();
        assert!(matches!(
            forwarded,
            Some(GatewayEvent::Change(CollectionChange { collection, .. }))
                if collection == "users/u1/channels"
        ));
        assert!(relay(&subs, change("users/u2/channels")).unwrap().is_none());
    }

    #[test]
    fn lag_drops_and_reports_every_subscription() {
        let subs = subscriptions(&["a", "b"]);
        let mut reported: Vec<String> = lag_errors(&subs, 7)
            .unwrap()
            .into_iter()
            .map(|event| match event {
                GatewayEvent::Error { collection, reason } => {
                    assert_eq!(reason, "lagged by 7 changes");
                    collection
                }
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        reported.sort();
        assert_eq!(reported, ["a", "b"]);
        assert!(subs.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn members_may_subscribe_to_messages() {
        let (db, channel_id) = db_with_channel(&["owner", "guest"]);
        let subs = subscriptions(&[]);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let path = channel_messages(channel_id);

        handle_command(&db, "guest", subscribe(&path), &subs, &reply_tx).await;
        handle_command(&db, "guest", subscribe("users/guest/channels"), &subs, &reply_tx).await;

        assert!(subs.read().unwrap().contains(&path));
        assert!(subs.read().unwrap().contains("users/guest/channels"));
        assert!(reply_rx.try_recv().is_err());

        let unsubscribe = GatewayCommand::Unsubscribe {
            collection: path.clone(),
        };
        handle_command(&db, "guest", unsubscribe, &subs, &reply_tx).await;
        assert!(!subs.read().unwrap().contains(&path));
    }

    #[tokio::test]
    async fn refused_subscriptions_are_reported() {
        let (db, channel_id) = db_with_channel(&["owner"]);
        let subs = subscriptions(&[]);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

        let refused = [
            channel_messages(channel_id),
            "users/owner/channels".to_string(),
            CHANNEL_DIRECTORY.to_string(),
        ];
        for path in &refused {
            handle_command(&db, "stranger", subscribe(path), &subs, &reply_tx).await;
        }

        assert!(subs.read().unwrap().is_empty());
        for path in &refused {
            match reply_rx.try_recv().unwrap() {
                GatewayEvent::Error { collection, reason } => {
                    assert_eq!(&collection, path);
                    assert_eq!(reason, "forbidden");
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }
}
