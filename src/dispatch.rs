use serde_json::{json, Map, Value};

use crate::broadcast::{Broadcaster, QueuePolicy};
use crate::constants::{CHAT_MESSAGE_MAX_CHARS, SPEED_BOOST_MS};
use crate::engine::{ItemEffect, MoveOutcome};
use crate::net::frame::CLOSE_POLICY_VIOLATION;
use crate::state::{now_ms, ServerState, SharedState};
use crate::types::{CellPos, GameError, ItemKind, MoveDirection, WorldPos};

/// Canonical outbound form; ingress also accepts the historical flat
/// dialect, but everything we emit is wrapped.
pub fn envelope(kind: &str, data: Value) -> Value {
    json!({ "type": kind, "timestamp": now_ms(), "data": data })
}

#[derive(Clone, Debug, PartialEq)]
enum ClientMessage {
    Auth {
        player_id: Option<String>,
        player_name: String,
    },
    Move {
        position: WorldPos,
        rotation: f32,
    },
    /// Legacy clients send a direction to step instead of a position.
    MoveStep {
        direction: MoveDirection,
    },
    Purchase {
        item_type: String,
    },
    UseItem {
        item_type: String,
        target_player: Option<String>,
        target_position: Option<CellPos>,
    },
    Chat {
        message: String,
    },
    Ping {
        timestamp: Value,
    },
}

#[derive(Clone, Debug, PartialEq)]
enum ParseFailure {
    Malformed,
    UnknownType(String),
    BadPayload(&'static str),
}

fn parse_message(raw: &str) -> Result<ClientMessage, ParseFailure> {
    let value: Value = serde_json::from_str(raw).map_err(|_| ParseFailure::Malformed)?;
    let object = value.as_object().ok_or(ParseFailure::Malformed)?;
    let message_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseFailure::Malformed)?;
    // older clients put the fields at the top level instead of in `data`
    let data = object
        .get("data")
        .and_then(Value::as_object)
        .unwrap_or(object);

    match message_type {
        "auth" => {
            let player_id = data
                .get("playerId")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string);
            let player_name = data
                .get("playerName")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .unwrap_or("Player")
                .to_string();
            Ok(ClientMessage::Auth {
                player_id,
                player_name,
            })
        }
        "move" => {
            if let Some(raw_direction) = data.get("direction") {
                let direction = raw_direction
                    .as_str()
                    .and_then(MoveDirection::parse)
                    .ok_or(ParseFailure::BadPayload("direction"))?;
                return Ok(ClientMessage::MoveStep { direction });
            }
            let position = parse_world_pos(data.get("position"))
                .ok_or(ParseFailure::BadPayload("position"))?;
            let rotation = data
                .get("rotation")
                .and_then(Value::as_f64)
                .unwrap_or(0.0) as f32;
            Ok(ClientMessage::Move { position, rotation })
        }
        "purchase_item" => {
            let item_type = data
                .get("itemType")
                .and_then(Value::as_str)
                .ok_or(ParseFailure::BadPayload("itemType"))?
                .to_string();
            Ok(ClientMessage::Purchase { item_type })
        }
        "use_item" => {
            let item_type = data
                .get("itemType")
                .and_then(Value::as_str)
                .ok_or(ParseFailure::BadPayload("itemType"))?
                .to_string();
            let target_player = data
                .get("targetPlayerId")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string);
            let target_position = parse_cell_pos(data.get("targetPosition"));
            Ok(ClientMessage::UseItem {
                item_type,
                target_player,
                target_position,
            })
        }
        "chat_message" => {
            let message = data
                .get("message")
                .and_then(Value::as_str)
                .ok_or(ParseFailure::BadPayload("message"))?
                .to_string();
            Ok(ClientMessage::Chat { message })
        }
        "ping" => Ok(ClientMessage::Ping {
            timestamp: data.get("timestamp").cloned().unwrap_or(Value::Null),
        }),
        other => Err(ParseFailure::UnknownType(other.to_string())),
    }
}

/// Positions arrive as `{x, y, z}` objects or `[x, y, z]` arrays depending
/// on the client build.
fn parse_world_pos(value: Option<&Value>) -> Option<WorldPos> {
    let value = value?;
    if let Some(object) = value.as_object() {
        return Some(WorldPos::new(
            object.get("x")?.as_f64()? as f32,
            object.get("y")?.as_f64()? as f32,
            object.get("z")?.as_f64()? as f32,
        ));
    }
    if let Some(array) = value.as_array() {
        if array.len() == 3 {
            return Some(WorldPos::new(
                array[0].as_f64()? as f32,
                array[1].as_f64()? as f32,
                array[2].as_f64()? as f32,
            ));
        }
    }
    None
}

fn parse_cell_pos(value: Option<&Value>) -> Option<CellPos> {
    let pos = parse_world_pos(value)?;
    Some(pos.cell())
}

/// Surrogate hardware fingerprint for clients that authenticate without an
/// identity: six octets derived from the connection id, in canonical form.
fn surrogate_fingerprint(conn_id: u64) -> String {
    let bytes = [
        0x02,
        (conn_id >> 32) as u8,
        (conn_id >> 24) as u8,
        (conn_id >> 16) as u8,
        (conn_id >> 8) as u8,
        conn_id as u8,
    ];
    bytes
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn send_error(broadcaster: &Broadcaster, conn_id: u64, error: &GameError, extra: Option<Value>) {
    let mut data = Map::new();
    data.insert("code".to_string(), json!(error.wire_code()));
    data.insert("message".to_string(), json!(error.to_string()));
    if let Some(Value::Object(fields)) = extra {
        for (key, value) in fields {
            data.insert(key, value);
        }
    }
    broadcaster.send(conn_id, &envelope("error", Value::Object(data)));
}

pub(crate) fn game_state_message(state: &ServerState) -> Value {
    let view = state.engine.game_state(now_ms());
    envelope(
        "game_state",
        serde_json::to_value(view).unwrap_or_else(|_| json!({})),
    )
}

/// Targeted `game_state` carrying the requesting player's own coins and
/// inventory alongside the match counters.
fn personal_state_message(state: &ServerState, player_id: &str) -> Value {
    let mut data = json!({
        "running": state.engine.running(),
        "remainingCoins": state.engine.remaining_coins(),
        "finishedCount": state.engine.finished_count(),
    });
    if let Some(view) = state.engine.player_view(player_id, now_ms()) {
        data["coins"] = json!(view.coins);
        data["inventory"] = json!(view.inventory);
        data["hasCompass"] = json!(view.has_compass);
    }
    envelope("game_state", data)
}

pub(crate) fn maze_data_message(state: &ServerState) -> Value {
    let (data, collected) = state.engine.maze_snapshot();
    let mut payload = serde_json::to_value(data).unwrap_or_else(|_| json!({}));
    payload["collected"] = json!(collected);
    payload["remainingCoins"] = json!(state.engine.remaining_coins());
    envelope("maze_data", payload)
}

/// Entry point for every decoded text message from a connection.
pub async fn handle_message(
    state: &SharedState,
    broadcaster: &Broadcaster,
    conn_id: u64,
    raw: &str,
) {
    match parse_message(raw) {
        Ok(ClientMessage::Auth {
            player_id,
            player_name,
        }) => handle_auth(state, broadcaster, conn_id, player_id, player_name).await,
        Ok(ClientMessage::Move { position, rotation }) => {
            handle_move(state, broadcaster, conn_id, position, rotation).await
        }
        Ok(ClientMessage::MoveStep { direction }) => {
            handle_move_step(state, broadcaster, conn_id, direction).await
        }
        Ok(ClientMessage::Purchase { item_type }) => {
            handle_purchase(state, broadcaster, conn_id, &item_type).await
        }
        Ok(ClientMessage::UseItem {
            item_type,
            target_player,
            target_position,
        }) => {
            handle_use_item(
                state,
                broadcaster,
                conn_id,
                &item_type,
                target_player.as_deref(),
                target_position,
            )
            .await
        }
        Ok(ClientMessage::Chat { message }) => {
            handle_chat(state, broadcaster, conn_id, message).await
        }
        Ok(ClientMessage::Ping { timestamp }) => {
            broadcaster.send(conn_id, &envelope("pong", json!({ "timestamp": timestamp })));
        }
        Err(ParseFailure::Malformed) => {
            tracing::warn!(conn_id, "malformed message; closing connection");
            send_error(
                broadcaster,
                conn_id,
                &GameError::Protocol("malformed message".to_string()),
                None,
            );
            broadcaster.close(conn_id, CLOSE_POLICY_VIOLATION, "malformed message");
        }
        Err(ParseFailure::UnknownType(kind)) => {
            send_error(
                broadcaster,
                conn_id,
                &GameError::Protocol(format!("unknown message type '{kind}'")),
                None,
            );
        }
        Err(ParseFailure::BadPayload(field)) => {
            send_error(
                broadcaster,
                conn_id,
                &GameError::Protocol(format!("missing or invalid field '{field}'")),
                None,
            );
        }
    }
}

async fn handle_auth(
    state: &SharedState,
    broadcaster: &Broadcaster,
    conn_id: u64,
    player_id: Option<String>,
    player_name: String,
) {
    let mut guard = state.lock().await;

    let resolved = match player_id.filter(|id| guard.registry.is_valid(id)) {
        Some(id) => id,
        None => {
            let fingerprint = surrogate_fingerprint(conn_id);
            match guard
                .registry
                .register_or_resolve(&fingerprint, &player_name)
            {
                Ok(id) => id,
                Err(error) => {
                    broadcaster.send(
                        conn_id,
                        &envelope("auth_failed", json!({ "reason": error.to_string() })),
                    );
                    broadcaster.close(conn_id, CLOSE_POLICY_VIOLATION, "auth failed");
                    return;
                }
            }
        }
    };

    if let Err(error) = guard.registry.login(&resolved) {
        broadcaster.send(
            conn_id,
            &envelope("auth_failed", json!({ "reason": error.to_string() })),
        );
        broadcaster.close(conn_id, CLOSE_POLICY_VIOLATION, "auth failed");
        return;
    }

    if let Some(prior) = guard.sessions.bind(conn_id, &resolved, &player_name) {
        tracing::info!(player_id = %resolved, prior_conn = prior, "session superseded");
        broadcaster.close(prior, 4001, "superseded by new connection");
    }
    if !guard.engine.has_player(&resolved) {
        if let Err(error) = guard.engine.add_player(&resolved) {
            tracing::error!(player_id = %resolved, %error, "failed to add runtime player");
        }
    }

    let token = format!("session_{}", now_ms() / 1000);
    broadcaster.send(
        conn_id,
        &envelope(
            "auth_success",
            json!({
                "playerId": resolved,
                "playerName": player_name,
                "token": token,
            }),
        ),
    );
    if let Some(view) = guard.engine.player_view(&resolved, now_ms()) {
        let position = view.position;
        broadcaster.send(
            conn_id,
            &envelope(
                "player_data",
                serde_json::to_value(&view).unwrap_or_else(|_| json!({})),
            ),
        );
        broadcaster.broadcast_except(
            conn_id,
            &envelope(
                "player_join",
                json!({
                    "playerId": resolved,
                    "playerName": player_name,
                    "position": position,
                }),
            ),
            QueuePolicy::DisconnectOnFull,
        );
    }
    broadcaster.send(conn_id, &maze_data_message(&guard));
    tracing::info!(player_id = %resolved, conn_id, name = %player_name, "player authenticated");
}

async fn handle_move(
    state: &SharedState,
    broadcaster: &Broadcaster,
    conn_id: u64,
    position: WorldPos,
    rotation: f32,
) {
    let mut guard = state.lock().await;
    // silently ignored until authenticated
    let Some(session) = guard.sessions.session_for_conn(conn_id) else {
        return;
    };
    let player_id = session.player_id.clone();

    match guard
        .engine
        .apply_client_position(&player_id, position, rotation, now_ms())
    {
        Ok(outcome) => {
            broadcaster.broadcast_except(
                conn_id,
                &envelope(
                    "player_moved",
                    json!({
                        "playerId": player_id,
                        "position": position,
                        "rotation": rotation,
                    }),
                ),
                QueuePolicy::DropOnFull,
            );
            publish_move_outcome(&mut guard, broadcaster, &player_id, &outcome);
        }
        Err(error @ GameError::InvalidMove) => {
            // clamp: tell the client where the server still has it
            let authoritative = guard.engine.player(&player_id).map(|p| p.pos);
            send_error(
                broadcaster,
                conn_id,
                &error,
                authoritative.map(|pos| json!({ "position": pos })),
            );
        }
        Err(error) => send_error(broadcaster, conn_id, &error, None),
    }
}

/// Legacy dialect: the server computes the step itself, so the resulting
/// position comes from the engine rather than the client.
async fn handle_move_step(
    state: &SharedState,
    broadcaster: &Broadcaster,
    conn_id: u64,
    direction: MoveDirection,
) {
    let mut guard = state.lock().await;
    // silently ignored until authenticated
    let Some(session) = guard.sessions.session_for_conn(conn_id) else {
        return;
    };
    let player_id = session.player_id.clone();

    match guard.engine.move_player(&player_id, direction, now_ms()) {
        Ok(outcome) => {
            if let Some(player) = guard.engine.player(&player_id) {
                broadcaster.broadcast_except(
                    conn_id,
                    &envelope(
                        "player_moved",
                        json!({
                            "playerId": player_id,
                            "position": player.pos,
                            "rotation": player.yaw,
                        }),
                    ),
                    QueuePolicy::DropOnFull,
                );
            }
            publish_move_outcome(&mut guard, broadcaster, &player_id, &outcome);
        }
        Err(error @ GameError::InvalidMove) => {
            let authoritative = guard.engine.player(&player_id).map(|p| p.pos);
            send_error(
                broadcaster,
                conn_id,
                &error,
                authoritative.map(|pos| json!({ "position": pos })),
            );
        }
        Err(error) => send_error(broadcaster, conn_id, &error, None),
    }
}

/// Coin, goal, and game-over fan-out shared by both move dialects.
fn publish_move_outcome(
    guard: &mut ServerState,
    broadcaster: &Broadcaster,
    player_id: &str,
    outcome: &MoveOutcome,
) {
    if let Some(coin_index) = outcome.collected_coin {
        guard.registry.credit_total_coins(player_id, 1);
        broadcaster.broadcast(
            &envelope(
                "game_event",
                json!({
                    "eventType": "coin_collected",
                    "playerId": player_id,
                    "coinIndex": coin_index,
                    "remainingCoins": guard.engine.remaining_coins(),
                }),
            ),
            QueuePolicy::DisconnectOnFull,
        );
    }
    if let Some(rank) = outcome.finish_rank {
        if rank == 1 {
            guard.registry.record_win(player_id);
        }
        guard
            .registry
            .credit_total_coins(player_id, outcome.reward as i64);
        broadcaster.broadcast(
            &envelope(
                "game_event",
                json!({
                    "eventType": "player_reached_goal",
                    "playerId": player_id,
                    "finishRank": rank,
                    "reward": outcome.reward,
                }),
            ),
            QueuePolicy::DisconnectOnFull,
        );
        broadcaster.broadcast(&game_state_message(guard), QueuePolicy::DisconnectOnFull);
    }
    if outcome.game_over {
        broadcaster.broadcast(
            &envelope(
                "game_event",
                json!({
                    "eventType": "game_over",
                    "finishedCount": guard.engine.finished_count(),
                }),
            ),
            QueuePolicy::DisconnectOnFull,
        );
    }
}

async fn handle_purchase(
    state: &SharedState,
    broadcaster: &Broadcaster,
    conn_id: u64,
    item_type: &str,
) {
    let mut guard = state.lock().await;
    let Some(session) = guard.sessions.session_for_conn(conn_id) else {
        send_error(broadcaster, conn_id, &GameError::AuthFailed, None);
        return;
    };
    let player_id = session.player_id.clone();

    let Some(kind) = ItemKind::parse(item_type) else {
        send_error(
            broadcaster,
            conn_id,
            &GameError::InvalidTarget,
            Some(json!({ "itemType": item_type })),
        );
        return;
    };
    match guard.engine.purchase_item(&player_id, kind) {
        Ok(balance) => {
            tracing::debug!(player_id = %player_id, item = kind.wire_name(), balance, "item purchased");
            broadcaster.send(conn_id, &personal_state_message(&guard, &player_id));
        }
        Err(error) => send_error(broadcaster, conn_id, &error, None),
    }
}

async fn handle_use_item(
    state: &SharedState,
    broadcaster: &Broadcaster,
    conn_id: u64,
    item_type: &str,
    target_player: Option<&str>,
    target_position: Option<CellPos>,
) {
    let mut guard = state.lock().await;
    let Some(session) = guard.sessions.session_for_conn(conn_id) else {
        send_error(broadcaster, conn_id, &GameError::AuthFailed, None);
        return;
    };
    let player_id = session.player_id.clone();

    let Some(kind) = ItemKind::parse(item_type) else {
        send_error(
            broadcaster,
            conn_id,
            &GameError::InvalidTarget,
            Some(json!({ "itemType": item_type })),
        );
        return;
    };
    match guard
        .engine
        .use_item(&player_id, kind, target_player, target_position, now_ms())
    {
        Ok(effect) => {
            let mut data = json!({
                "playerId": player_id,
                "itemType": kind.wire_name(),
            });
            match &effect {
                ItemEffect::SpeedBoost { until_ms, .. } => {
                    data["durationMs"] = json!(SPEED_BOOST_MS);
                    data["untilMs"] = json!(until_ms);
                }
                ItemEffect::CompassGranted { .. } => {}
                ItemEffect::WallBroken { cell, repair_at_ms } => {
                    data["targetPosition"] = json!(cell);
                    data["repairAtMs"] = json!(repair_at_ms);
                }
                ItemEffect::PlayerKilled { target_id, respawn } => {
                    data["targetPlayerId"] = json!(target_id);
                    data["respawnPosition"] = json!(respawn);
                }
                ItemEffect::TrapPlaced { cell } => {
                    data["targetPosition"] = json!(cell);
                }
                ItemEffect::PositionsSwapped {
                    target_id,
                    player_pos,
                    target_pos,
                    ..
                } => {
                    data["targetPlayerId"] = json!(target_id);
                    data["playerPosition"] = json!(player_pos);
                    data["targetPosition"] = json!(target_pos);
                }
            }
            broadcaster.broadcast(&envelope("item_effect", data), QueuePolicy::DisconnectOnFull);
            broadcaster.send(conn_id, &personal_state_message(&guard, &player_id));
        }
        Err(error) => send_error(broadcaster, conn_id, &error, None),
    }
}

async fn handle_chat(
    state: &SharedState,
    broadcaster: &Broadcaster,
    conn_id: u64,
    message: String,
) {
    let mut guard = state.lock().await;
    let Some(session) = guard.sessions.session_for_conn(conn_id) else {
        send_error(broadcaster, conn_id, &GameError::AuthFailed, None);
        return;
    };
    let player_id = session.player_id.clone();
    let display_name = session.display_name.clone();

    let capped: String = message.chars().take(CHAT_MESSAGE_MAX_CHARS).collect();
    guard.store.append_chat(&display_name, &capped);
    broadcaster.broadcast(
        &envelope(
            "chat_message",
            json!({
                "playerId": player_id,
                "playerName": display_name,
                "message": capped,
            }),
        ),
        QueuePolicy::DisconnectOnFull,
    );
}

/// Close handling: always invoked by the connection's reader, exactly once.
pub async fn handle_disconnect(state: &SharedState, broadcaster: &Broadcaster, conn_id: u64) {
    let mut guard = state.lock().await;
    if let Some(session) = guard.sessions.unbind_conn(conn_id) {
        guard.registry.logout(&session.player_id);
        guard.engine.remove_player(&session.player_id);
        broadcaster.broadcast(
            &envelope(
                "player_leave",
                json!({
                    "playerId": session.player_id,
                    "playerName": session.display_name,
                }),
            ),
            QueuePolicy::DisconnectOnFull,
        );
        tracing::info!(player_id = %session.player_id, conn_id, "player disconnected");
    }
    broadcaster.remove(conn_id);
}

/// Operator broadcast used by the console's `system` command.
pub fn broadcast_system_message(broadcaster: &Broadcaster, message: &str) {
    broadcaster.broadcast(
        &envelope(
            "chat_message",
            json!({
                "playerId": "SYSTEM",
                "playerName": "SYSTEM",
                "message": message,
            }),
        ),
        QueuePolicy::DisconnectOnFull,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::OutboundMessage;
    use crate::engine::GameEngine;
    use crate::mazegen::MazeGenerator;
    use crate::registry::{is_valid_fingerprint, PlayerRegistry};
    use crate::store::{DataStore, ServerConfig};
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Notify};

    fn temp_dir(name: &str) -> PathBuf {
        let unique = format!("{}-{}-{}", name, std::process::id(), rand::random::<u32>());
        std::env::temp_dir().join(unique)
    }

    fn test_state(name: &str) -> SharedState {
        let dir = temp_dir(name);
        let store = DataStore::open(&dir).expect("store");
        let registry = PlayerRegistry::load(store.players_path());
        let data = MazeGenerator::new(9, 9, 2, 1234).generate();
        let engine = GameEngine::new(data, 99);
        Arc::new(tokio::sync::Mutex::new(ServerState::new(
            engine,
            registry,
            store,
            ServerConfig::default(),
            8081,
        )))
    }

    fn connect(broadcaster: &Broadcaster, conn_id: u64) -> mpsc::Receiver<OutboundMessage> {
        let (tx, rx) = mpsc::channel(64);
        let addr: SocketAddr = "127.0.0.1:5000".parse().expect("addr");
        broadcaster.register(conn_id, addr, tx, Arc::new(Notify::new()));
        rx
    }

    fn received(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let OutboundMessage::Text(text) = message {
                out.push(serde_json::from_str(&text).expect("outbound json"));
            }
        }
        out
    }

    fn types_of(messages: &[Value]) -> Vec<String> {
        messages
            .iter()
            .map(|m| m["type"].as_str().unwrap_or("?").to_string())
            .collect()
    }

    #[test]
    fn parse_accepts_wrapped_and_flat_dialects() {
        let wrapped = r#"{"type":"chat_message","timestamp":1,"data":{"message":"hi"}}"#;
        let flat = r#"{"type":"chat_message","message":"hi"}"#;
        assert_eq!(parse_message(wrapped), parse_message(flat));
        assert_eq!(
            parse_message(flat),
            Ok(ClientMessage::Chat {
                message: "hi".to_string()
            })
        );
    }

    #[test]
    fn parse_move_accepts_object_and_array_positions() {
        let object = r#"{"type":"move","data":{"position":{"x":1.5,"y":2.0,"z":0.0},"rotation":0.7}}"#;
        let array = r#"{"type":"move","data":{"position":[1.5,2.0,0.0],"rotation":0.7}}"#;
        assert_eq!(parse_message(object), parse_message(array));
    }

    #[test]
    fn parse_move_accepts_the_legacy_direction_dialect() {
        let wrapped = r#"{"type":"move","data":{"direction":"backward"}}"#;
        let flat = r#"{"type":"move","direction":"backward"}"#;
        assert_eq!(
            parse_message(wrapped),
            Ok(ClientMessage::MoveStep {
                direction: MoveDirection::Backward
            })
        );
        assert_eq!(parse_message(wrapped), parse_message(flat));
        assert_eq!(
            parse_message(r#"{"type":"move","data":{"direction":"sideways"}}"#),
            Err(ParseFailure::BadPayload("direction"))
        );
    }

    #[test]
    fn parse_rejects_garbage_and_unknown_types() {
        assert_eq!(parse_message("not json"), Err(ParseFailure::Malformed));
        assert_eq!(parse_message("[1,2,3]"), Err(ParseFailure::Malformed));
        assert_eq!(
            parse_message(r#"{"type":"teleport_hack"}"#),
            Err(ParseFailure::UnknownType("teleport_hack".to_string()))
        );
        assert_eq!(
            parse_message(r#"{"type":"move","data":{}}"#),
            Err(ParseFailure::BadPayload("position"))
        );
    }

    #[test]
    fn surrogate_fingerprints_are_canonical() {
        for conn_id in [1u64, 42, 9_999, u32::MAX as u64] {
            assert!(is_valid_fingerprint(&surrogate_fingerprint(conn_id)));
        }
        assert_ne!(surrogate_fingerprint(1), surrogate_fingerprint(2));
    }

    #[test]
    fn envelope_always_wraps_data() {
        let message = envelope("pong", json!({"timestamp": 5}));
        assert_eq!(message["type"], "pong");
        assert!(message["timestamp"].as_u64().expect("stamp") > 0);
        assert_eq!(message["data"]["timestamp"], 5);
    }

    #[tokio::test]
    async fn auth_yields_success_player_data_and_maze() {
        let state = test_state("dispatch-auth");
        let broadcaster = Broadcaster::new();
        let mut rx = connect(&broadcaster, 1);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"auth","data":{"playerName":"Alice"}}"#,
        )
        .await;

        let messages = received(&mut rx);
        assert_eq!(
            types_of(&messages),
            vec!["auth_success", "player_data", "maze_data"]
        );
        let auth = &messages[0]["data"];
        assert!(auth["token"].as_str().expect("token").starts_with("session_"));
        assert!(auth["playerId"].as_str().expect("id").starts_with("PLAYER_"));

        let player_data = &messages[1]["data"];
        assert_eq!(player_data["coins"], 0);
        assert_eq!(player_data["inventory"], json!({}));

        let guard = state.lock().await;
        assert_eq!(guard.sessions.bound_count(), 1);
        assert_eq!(guard.registry.online_count(), 1);
    }

    #[tokio::test]
    async fn second_auth_supersedes_the_first_connection() {
        let state = test_state("dispatch-supersede");
        let broadcaster = Broadcaster::new();
        let mut rx1 = connect(&broadcaster, 1);
        let mut rx2 = connect(&broadcaster, 2);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"auth","data":{"playerName":"Alice"}}"#,
        )
        .await;
        let player_id = received(&mut rx1)[0]["data"]["playerId"]
            .as_str()
            .expect("id")
            .to_string();

        let reauth = format!(
            r#"{{"type":"auth","data":{{"playerId":"{player_id}","playerName":"Alice"}}}}"#
        );
        handle_message(&state, &broadcaster, 2, &reauth).await;

        let guard = state.lock().await;
        assert_eq!(guard.sessions.conn_for_player(&player_id), Some(2));
        assert_eq!(guard.sessions.bound_count(), 1);
        drop(guard);

        // the first connection got a close queued
        let mut closed = false;
        while let Ok(message) = rx1.try_recv() {
            if matches!(message, OutboundMessage::Close { code: 4001, .. }) {
                closed = true;
            }
        }
        assert!(closed);
        assert!(!received(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn purchase_and_use_compass_flow() {
        let state = test_state("dispatch-compass");
        let broadcaster = Broadcaster::new();
        let mut rx = connect(&broadcaster, 1);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"auth","data":{"playerName":"Shopper"}}"#,
        )
        .await;
        let player_id = received(&mut rx)[0]["data"]["playerId"]
            .as_str()
            .expect("id")
            .to_string();
        {
            let mut guard = state.lock().await;
            guard.engine.set_coins(&player_id, 30).expect("coins");
        }

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"purchase_item","data":{"itemType":"compass"}}"#,
        )
        .await;
        let messages = received(&mut rx);
        assert_eq!(types_of(&messages), vec!["game_state"]);
        assert_eq!(messages[0]["data"]["coins"], 5);
        assert_eq!(messages[0]["data"]["inventory"]["compass"], 1);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"use_item","data":{"itemType":"compass"}}"#,
        )
        .await;
        let messages = received(&mut rx);
        assert_eq!(types_of(&messages), vec!["item_effect", "game_state"]);
        assert_eq!(messages[0]["data"]["itemType"], "compass");
        assert_eq!(messages[1]["data"]["hasCompass"], true);
        assert_eq!(messages[1]["data"]["inventory"], json!({}));
    }

    #[tokio::test]
    async fn insufficient_coins_yield_the_right_error() {
        let state = test_state("dispatch-poor");
        let broadcaster = Broadcaster::new();
        let mut rx = connect(&broadcaster, 1);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"auth","data":{"playerName":"Poor"}}"#,
        )
        .await;
        let player_id = received(&mut rx)[0]["data"]["playerId"]
            .as_str()
            .expect("id")
            .to_string();
        {
            let mut guard = state.lock().await;
            guard.engine.set_coins(&player_id, 59).expect("coins");
        }

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"purchase_item","data":{"itemType":"swap_item"}}"#,
        )
        .await;
        let messages = received(&mut rx);
        assert_eq!(types_of(&messages), vec!["error"]);
        assert_eq!(messages[0]["data"]["code"], "INSUFFICIENT_COINS");
    }

    #[tokio::test]
    async fn sword_alias_resolves_to_kill_sword() {
        let state = test_state("dispatch-sword");
        let broadcaster = Broadcaster::new();
        let mut rx = connect(&broadcaster, 1);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"auth","data":{"playerName":"Knight"}}"#,
        )
        .await;
        received(&mut rx);

        // no target: the error proves the alias reached the engine
        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"use_item","data":{"itemType":"sword"}}"#,
        )
        .await;
        let messages = received(&mut rx);
        assert_eq!(messages[0]["data"]["code"], "ITEM_NOT_OWNED");
    }

    #[tokio::test]
    async fn chat_is_capped_and_broadcast() {
        let state = test_state("dispatch-chat");
        let broadcaster = Broadcaster::new();
        let mut rx1 = connect(&broadcaster, 1);
        let mut rx2 = connect(&broadcaster, 2);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"auth","data":{"playerName":"Chatty"}}"#,
        )
        .await;
        handle_message(
            &state,
            &broadcaster,
            2,
            r#"{"type":"auth","data":{"playerName":"Quiet"}}"#,
        )
        .await;
        received(&mut rx1);
        received(&mut rx2);

        let long = "x".repeat(500);
        let raw = format!(r#"{{"type":"chat_message","data":{{"message":"{long}"}}}}"#);
        handle_message(&state, &broadcaster, 1, &raw).await;

        let to_other: Vec<Value> = received(&mut rx2)
            .into_iter()
            .filter(|m| m["type"] == "chat_message")
            .collect();
        assert_eq!(to_other.len(), 1);
        let text = to_other[0]["data"]["message"].as_str().expect("message");
        assert_eq!(text.chars().count(), CHAT_MESSAGE_MAX_CHARS);
        assert_eq!(to_other[0]["data"]["playerName"], "Chatty");
    }

    #[tokio::test]
    async fn ping_echoes_the_timestamp() {
        let state = test_state("dispatch-ping");
        let broadcaster = Broadcaster::new();
        let mut rx = connect(&broadcaster, 1);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"ping","data":{"timestamp":123456}}"#,
        )
        .await;
        let messages = received(&mut rx);
        assert_eq!(types_of(&messages), vec!["pong"]);
        assert_eq!(messages[0]["data"]["timestamp"], 123456);
    }

    #[tokio::test]
    async fn moves_are_ignored_until_authenticated() {
        let state = test_state("dispatch-unauth-move");
        let broadcaster = Broadcaster::new();
        let mut rx = connect(&broadcaster, 1);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"move","data":{"position":[1.0,1.0,0.0],"rotation":0}}"#,
        )
        .await;
        assert!(received(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn direction_steps_run_through_the_engine() {
        let state = test_state("dispatch-move-step");
        let broadcaster = Broadcaster::new();
        let mut rx1 = connect(&broadcaster, 1);
        let mut rx2 = connect(&broadcaster, 2);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"auth","data":{"playerName":"Stepper"}}"#,
        )
        .await;
        handle_message(
            &state,
            &broadcaster,
            2,
            r#"{"type":"auth","data":{"playerName":"Watcher"}}"#,
        )
        .await;
        let player_id = received(&mut rx1)[0]["data"]["playerId"]
            .as_str()
            .expect("id")
            .to_string();
        received(&mut rx2);
        let start = {
            let guard = state.lock().await;
            guard.engine.start_cell()
        };

        // backward with yaw 0 steps +y inside the start cell
        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"move","data":{"direction":"backward"}}"#,
        )
        .await;

        let guard = state.lock().await;
        let pos = guard.engine.player(&player_id).expect("runtime").pos;
        assert!((pos.y - (start.y as f32 + 0.1)).abs() < 1e-4);
        drop(guard);

        let moved: Vec<Value> = received(&mut rx2)
            .into_iter()
            .filter(|m| m["type"] == "player_moved")
            .collect();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0]["data"]["playerId"], player_id.as_str());
        let reported_y = moved[0]["data"]["position"]["y"].as_f64().expect("y");
        assert!((reported_y - (start.y as f64 + 0.1)).abs() < 1e-4);
        // the stepping client itself gets no echo
        assert!(received(&mut rx1)
            .iter()
            .all(|m| m["type"] != "player_moved"));
    }

    #[tokio::test]
    async fn blocked_direction_step_reports_the_server_position() {
        let state = test_state("dispatch-move-step-blocked");
        let broadcaster = Broadcaster::new();
        let mut rx = connect(&broadcaster, 1);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"auth","data":{"playerName":"Climber"}}"#,
        )
        .await;
        received(&mut rx);

        // no stairs under the start cell, so an upward step is invalid
        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"move","data":{"direction":"up"}}"#,
        )
        .await;
        let messages = received(&mut rx);
        assert_eq!(types_of(&messages), vec!["error"]);
        assert_eq!(messages[0]["data"]["code"], "INVALID_MOVE");
        assert!(messages[0]["data"]["position"].is_object());
    }

    #[tokio::test]
    async fn teleport_sized_move_is_clamped_with_an_error() {
        let state = test_state("dispatch-clamp");
        let broadcaster = Broadcaster::new();
        let mut rx = connect(&broadcaster, 1);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"auth","data":{"playerName":"Cheater"}}"#,
        )
        .await;
        received(&mut rx);
        let start = {
            let guard = state.lock().await;
            guard.engine.start_cell()
        };

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"move","data":{"position":[90.0,90.0,0.0],"rotation":0}}"#,
        )
        .await;
        let messages = received(&mut rx);
        assert_eq!(types_of(&messages), vec!["error"]);
        assert_eq!(messages[0]["data"]["code"], "INVALID_MOVE");
        let reported = &messages[0]["data"]["position"];
        assert_eq!(reported["x"].as_f64().expect("x") as i32, start.x);
    }

    #[tokio::test]
    async fn disconnect_logs_out_and_announces_leave() {
        let state = test_state("dispatch-leave");
        let broadcaster = Broadcaster::new();
        let mut rx1 = connect(&broadcaster, 1);
        let mut rx2 = connect(&broadcaster, 2);

        handle_message(
            &state,
            &broadcaster,
            1,
            r#"{"type":"auth","data":{"playerName":"Leaver"}}"#,
        )
        .await;
        handle_message(
            &state,
            &broadcaster,
            2,
            r#"{"type":"auth","data":{"playerName":"Stayer"}}"#,
        )
        .await;
        let player_id = received(&mut rx1)[0]["data"]["playerId"]
            .as_str()
            .expect("id")
            .to_string();
        received(&mut rx2);

        handle_disconnect(&state, &broadcaster, 1).await;

        let guard = state.lock().await;
        assert!(!guard.registry.is_online(&player_id));
        assert!(!guard.engine.has_player(&player_id));
        assert_eq!(guard.sessions.bound_count(), 1);
        drop(guard);

        let leaves: Vec<Value> = received(&mut rx2)
            .into_iter()
            .filter(|m| m["type"] == "player_leave")
            .collect();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0]["data"]["playerId"], player_id.as_str());
        assert!(!broadcaster.contains(1));
    }
}
