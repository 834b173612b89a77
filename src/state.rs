use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::engine::GameEngine;
use crate::registry::PlayerRegistry;
use crate::store::{DataStore, ServerConfig};
use crate::types::AdminLevel;

/// Everything behind the engine-wide exclusion region. Dispatcher, console,
/// and tick loop all enter through this mutex; none of the operations
/// inside suspend on I/O.
pub struct ServerState {
    pub engine: GameEngine,
    pub registry: PlayerRegistry,
    pub store: DataStore,
    pub sessions: SessionIndex,
    pub admins: AdminTable,
    pub config: ServerConfig,
    pub websocket_port: u16,
    pub started_at: Instant,
}

pub type SharedState = Arc<Mutex<ServerState>>;

impl ServerState {
    pub fn new(
        engine: GameEngine,
        registry: PlayerRegistry,
        store: DataStore,
        config: ServerConfig,
        websocket_port: u16,
    ) -> Self {
        Self {
            engine,
            registry,
            store,
            sessions: SessionIndex::default(),
            admins: AdminTable::with_defaults(),
            config,
            websocket_port,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Bijection between bound connections and player ids; each side maps to at
/// most one of the other at any instant.
#[derive(Default)]
pub struct SessionIndex {
    by_conn: HashMap<u64, BoundSession>,
    by_player: HashMap<String, u64>,
}

#[derive(Clone, Debug)]
pub struct BoundSession {
    pub player_id: String,
    pub display_name: String,
}

impl SessionIndex {
    /// Binds a connection to a player. When the player already holds
    /// another live connection, that one is unbound and returned so the
    /// caller can close it (new auth supersedes old).
    pub fn bind(
        &mut self,
        conn_id: u64,
        player_id: &str,
        display_name: &str,
    ) -> Option<u64> {
        let superseded = match self.by_player.get(player_id) {
            Some(prior) if *prior != conn_id => {
                let prior = *prior;
                self.by_conn.remove(&prior);
                Some(prior)
            }
            _ => None,
        };
        self.by_conn.insert(
            conn_id,
            BoundSession {
                player_id: player_id.to_string(),
                display_name: display_name.to_string(),
            },
        );
        self.by_player.insert(player_id.to_string(), conn_id);
        superseded
    }

    pub fn unbind_conn(&mut self, conn_id: u64) -> Option<BoundSession> {
        let session = self.by_conn.remove(&conn_id)?;
        if self.by_player.get(&session.player_id) == Some(&conn_id) {
            self.by_player.remove(&session.player_id);
        }
        Some(session)
    }

    pub fn session_for_conn(&self, conn_id: u64) -> Option<&BoundSession> {
        self.by_conn.get(&conn_id)
    }

    pub fn conn_for_player(&self, player_id: &str) -> Option<u64> {
        self.by_player.get(player_id).copied()
    }

    pub fn bound_count(&self) -> usize {
        self.by_conn.len()
    }
}

/// Admin level table for operator commands. The console executor is
/// super-admin; `admin` and `root` come seeded like the original default
/// admin list.
pub struct AdminTable {
    levels: HashMap<String, AdminLevel>,
}

pub const CONSOLE_EXECUTOR: &str = "console";

impl AdminTable {
    pub fn with_defaults() -> Self {
        let mut levels = HashMap::new();
        levels.insert(CONSOLE_EXECUTOR.to_string(), AdminLevel::SuperAdmin);
        levels.insert("admin".to_string(), AdminLevel::Admin);
        levels.insert("root".to_string(), AdminLevel::Admin);
        Self { levels }
    }

    pub fn level_of(&self, executor: &str) -> AdminLevel {
        self.levels
            .get(executor)
            .copied()
            .unwrap_or(AdminLevel::None)
    }

    pub fn permits(&self, executor: &str, required: AdminLevel) -> bool {
        self.level_of(executor) >= required
    }

    pub fn set(&mut self, player_id: &str, level: AdminLevel) {
        if level == AdminLevel::None {
            self.levels.remove(player_id);
        } else {
            self.levels.insert(player_id.to_string(), level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_is_a_bijection() {
        let mut sessions = SessionIndex::default();
        assert_eq!(sessions.bind(1, "PLAYER_1", "Alice"), None);
        assert_eq!(sessions.bind(2, "PLAYER_2", "Bob"), None);
        assert_eq!(sessions.bound_count(), 2);
        assert_eq!(sessions.conn_for_player("PLAYER_1"), Some(1));
        assert_eq!(
            sessions.session_for_conn(2).map(|s| s.player_id.clone()),
            Some("PLAYER_2".to_string())
        );
    }

    #[test]
    fn rebinding_a_player_supersedes_the_prior_connection() {
        let mut sessions = SessionIndex::default();
        sessions.bind(1, "PLAYER_1", "Alice");
        let superseded = sessions.bind(7, "PLAYER_1", "Alice");
        assert_eq!(superseded, Some(1));
        assert_eq!(sessions.conn_for_player("PLAYER_1"), Some(7));
        assert!(sessions.session_for_conn(1).is_none());
        assert_eq!(sessions.bound_count(), 1);
    }

    #[test]
    fn unbind_clears_both_directions() {
        let mut sessions = SessionIndex::default();
        sessions.bind(1, "PLAYER_1", "Alice");
        let session = sessions.unbind_conn(1).expect("bound");
        assert_eq!(session.player_id, "PLAYER_1");
        assert_eq!(session.display_name, "Alice");
        assert_eq!(sessions.conn_for_player("PLAYER_1"), None);
        assert!(sessions.unbind_conn(1).is_none());
    }

    #[test]
    fn admin_table_defaults_and_mutation() {
        let mut admins = AdminTable::with_defaults();
        assert!(admins.permits(CONSOLE_EXECUTOR, AdminLevel::SuperAdmin));
        assert!(admins.permits("root", AdminLevel::Admin));
        assert!(!admins.permits("root", AdminLevel::SuperAdmin));
        assert!(!admins.permits("PLAYER_123456", AdminLevel::Moderator));

        admins.set("PLAYER_123456", AdminLevel::Moderator);
        assert!(admins.permits("PLAYER_123456", AdminLevel::Moderator));
        admins.set("PLAYER_123456", AdminLevel::None);
        assert!(!admins.permits("PLAYER_123456", AdminLevel::Moderator));
    }
}
