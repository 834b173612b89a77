use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::types::GameError;

/// Durable identity, persisted as one entry of the `players.json` array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    pub player_id: String,
    pub fingerprint: String,
    #[serde(default)]
    pub cookie: String,
    pub total_coins: i64,
    pub games_played: u32,
    pub games_won: u32,
    /// Epoch seconds of the most recent login.
    pub last_login_at: i64,
    #[serde(default)]
    pub online: bool,
}

/// Owns durable identities and their secondary indexes. Loads tolerantly,
/// saves eagerly; persistence errors are logged and never fatal.
pub struct PlayerRegistry {
    file_path: PathBuf,
    players: HashMap<String, PlayerRecord>,
    by_fingerprint: HashMap<String, String>,
    by_cookie: HashMap<String, String>,
    online: Vec<String>,
}

impl PlayerRegistry {
    pub fn load(file_path: PathBuf) -> Self {
        let mut registry = Self {
            file_path,
            players: HashMap::new(),
            by_fingerprint: HashMap::new(),
            by_cookie: HashMap::new(),
            online: Vec::new(),
        };
        for mut record in load_records(&registry.file_path) {
            // sessions do not survive a restart
            record.online = false;
            registry.index(&record);
            registry.players.insert(record.player_id.clone(), record);
        }
        registry
    }

    fn index(&mut self, record: &PlayerRecord) {
        self.by_fingerprint
            .insert(record.fingerprint.clone(), record.player_id.clone());
        if !record.cookie.is_empty() {
            self.by_cookie
                .insert(record.cookie.clone(), record.player_id.clone());
        }
    }

    /// Resolves an existing identity by fingerprint, then cookie; otherwise
    /// mints a fresh `PLAYER_<six-digit>` with zeroed counters. Calling
    /// twice with identical inputs returns the same id.
    pub fn register_or_resolve(
        &mut self,
        fingerprint: &str,
        cookie: &str,
    ) -> Result<String, GameError> {
        if !is_valid_fingerprint(fingerprint) {
            return Err(GameError::AuthFailed);
        }
        if let Some(existing) = self.by_fingerprint.get(fingerprint) {
            return Ok(existing.clone());
        }
        if !cookie.is_empty() {
            if let Some(existing) = self.by_cookie.get(cookie) {
                return Ok(existing.clone());
            }
        }

        let player_id = self.mint_player_id();
        let record = PlayerRecord {
            player_id: player_id.clone(),
            fingerprint: fingerprint.to_string(),
            cookie: cookie.to_string(),
            total_coins: 0,
            games_played: 0,
            games_won: 0,
            last_login_at: Utc::now().timestamp(),
            online: false,
        };
        self.index(&record);
        self.players.insert(player_id.clone(), record);
        self.save();
        Ok(player_id)
    }

    fn mint_player_id(&self) -> String {
        let mut rng = rand::rng();
        loop {
            let candidate = format!("PLAYER_{}", rng.random_range(100_000..=999_999));
            if !self.players.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Marks the record online and stamps `last_login_at`. Session
    /// supersession is the dispatcher's business.
    pub fn login(&mut self, player_id: &str) -> Result<(), GameError> {
        let record = self
            .players
            .get_mut(player_id)
            .ok_or(GameError::PlayerNotFound)?;
        record.online = true;
        record.last_login_at = Utc::now().timestamp();
        record.games_played += 1;
        if !self.online.iter().any(|id| id == player_id) {
            self.online.push(player_id.to_string());
        }
        Ok(())
    }

    pub fn logout(&mut self, player_id: &str) {
        if let Some(record) = self.players.get_mut(player_id) {
            record.online = false;
        }
        self.online.retain(|id| id != player_id);
        self.save();
    }

    pub fn get(&self, player_id: &str) -> Option<&PlayerRecord> {
        self.players.get(player_id)
    }

    pub fn update(&mut self, player_id: &str, record: PlayerRecord) -> bool {
        if !self.players.contains_key(player_id) {
            return false;
        }
        self.players.insert(player_id.to_string(), record);
        self.save();
        true
    }

    pub fn is_valid(&self, player_id: &str) -> bool {
        self.players.contains_key(player_id)
    }

    pub fn is_online(&self, player_id: &str) -> bool {
        self.online.iter().any(|id| id == player_id)
    }

    pub fn online(&self) -> &[String] {
        &self.online
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// In-memory credit on the hot path; durability comes from the next
    /// logout/shutdown save.
    pub fn credit_total_coins(&mut self, player_id: &str, delta: i64) {
        if let Some(record) = self.players.get_mut(player_id) {
            record.total_coins += delta;
        }
    }

    pub fn add_total_coins(&mut self, player_id: &str, delta: i64) -> bool {
        match self.players.get_mut(player_id) {
            Some(record) => {
                record.total_coins += delta;
                self.save();
                true
            }
            None => false,
        }
    }

    pub fn set_total_coins(&mut self, player_id: &str, total: i64) -> bool {
        match self.players.get_mut(player_id) {
            Some(record) => {
                record.total_coins = total;
                self.save();
                true
            }
            None => false,
        }
    }

    pub fn record_win(&mut self, player_id: &str) {
        if let Some(record) = self.players.get_mut(player_id) {
            record.games_won += 1;
            self.save();
        }
    }

    pub fn save(&self) {
        if let Some(parent) = self.file_path.parent() {
            if let Err(error) = fs::create_dir_all(parent) {
                tracing::warn!("failed to create data dir {}: {error}", parent.display());
                return;
            }
        }
        let mut records: Vec<&PlayerRecord> = self.players.values().collect();
        records.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        match serde_json::to_string_pretty(&records) {
            Ok(text) => {
                if let Err(error) = fs::write(&self.file_path, text) {
                    tracing::warn!(
                        "failed to write {}: {error}",
                        self.file_path.display()
                    );
                }
            }
            Err(error) => {
                tracing::warn!("failed to serialize player records: {error}");
            }
        }
    }
}

fn load_records(path: &Path) -> Vec<PlayerRecord> {
    let text = match fs::read_to_string(path) {
        Ok(value) => value,
        Err(error) => {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to read {}: {error}", path.display());
            }
            return Vec::new();
        }
    };
    let raw: Vec<serde_json::Value> = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!("failed to parse {}: {error}", path.display());
            return Vec::new();
        }
    };
    let mut records = Vec::new();
    for value in raw {
        match serde_json::from_value::<PlayerRecord>(value) {
            Ok(record) => records.push(record),
            Err(error) => {
                tracing::warn!("skipping bad player entry in {}: {error}", path.display());
            }
        }
    }
    records
}

/// Canonical hardware fingerprint: six hex octets joined by a consistent
/// `:` or `-` separator, 17 characters total.
pub fn is_valid_fingerprint(value: &str) -> bool {
    if value.len() != 17 {
        return false;
    }
    let bytes = value.as_bytes();
    let separator = bytes[2];
    if separator != b':' && separator != b'-' {
        return false;
    }
    for (i, byte) in bytes.iter().enumerate() {
        if (i + 1) % 3 == 0 {
            if *byte != separator {
                return false;
            }
        } else if !byte.is_ascii_hexdigit() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> PathBuf {
        let unique = format!(
            "{}-{}-{}",
            name,
            std::process::id(),
            rand::random::<u32>()
        );
        std::env::temp_dir().join(unique).join("players.json")
    }

    const FP: &str = "AA:BB:CC:DD:EE:FF";

    #[test]
    fn fingerprint_validation_accepts_canonical_forms_only() {
        assert!(is_valid_fingerprint("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_fingerprint("aa-bb-cc-dd-ee-ff"));
        assert!(is_valid_fingerprint("01:23:45:67:89:ab"));
        // mixed separators
        assert!(!is_valid_fingerprint("AA:BB-CC:DD:EE:FF"));
        // wrong length
        assert!(!is_valid_fingerprint("AA:BB:CC:DD:EE"));
        assert!(!is_valid_fingerprint("AA:BB:CC:DD:EE:FF:00"));
        // non-hex digits
        assert!(!is_valid_fingerprint("GG:BB:CC:DD:EE:FF"));
        assert!(!is_valid_fingerprint(""));
    }

    #[test]
    fn register_or_resolve_is_idempotent() {
        let path = temp_file("registry-idempotent");
        let mut registry = PlayerRegistry::load(path.clone());
        let first = registry.register_or_resolve(FP, "cookie-1").expect("register");
        let second = registry.register_or_resolve(FP, "cookie-1").expect("resolve");
        assert_eq!(first, second);
        assert_eq!(registry.player_count(), 1);
        assert!(first.starts_with("PLAYER_"));
        assert_eq!(first.len(), "PLAYER_".len() + 6);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn cookie_resolves_when_fingerprint_is_new() {
        let path = temp_file("registry-cookie");
        let mut registry = PlayerRegistry::load(path.clone());
        let original = registry.register_or_resolve(FP, "shared-cookie").expect("register");
        // same browser, different adapter address
        let resolved = registry
            .register_or_resolve("11:22:33:44:55:66", "shared-cookie")
            .expect("resolve");
        assert_eq!(original, resolved);
        assert_eq!(registry.player_count(), 1);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn bad_fingerprint_fails_auth() {
        let path = temp_file("registry-badfp");
        let mut registry = PlayerRegistry::load(path.clone());
        assert_eq!(
            registry.register_or_resolve("not-a-fingerprint!", ""),
            Err(GameError::AuthFailed)
        );
        assert_eq!(registry.player_count(), 0);
    }

    #[test]
    fn login_logout_toggle_online_and_stamp_time() {
        let path = temp_file("registry-login");
        let mut registry = PlayerRegistry::load(path.clone());
        let id = registry.register_or_resolve(FP, "").expect("register");
        assert!(!registry.is_online(&id));

        registry.login(&id).expect("login");
        assert!(registry.is_online(&id));
        assert_eq!(registry.online(), &[id.clone()]);
        let record = registry.get(&id).expect("record");
        assert!(record.last_login_at > 0);
        assert_eq!(record.games_played, 1);

        registry.logout(&id);
        assert!(!registry.is_online(&id));
        assert!(registry.online().is_empty());
        assert_eq!(registry.login("PLAYER_000000"), Err(GameError::PlayerNotFound));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn records_survive_a_reload_without_sessions() {
        let path = temp_file("registry-reload");
        let id = {
            let mut registry = PlayerRegistry::load(path.clone());
            let id = registry.register_or_resolve(FP, "biscuit").expect("register");
            registry.login(&id).expect("login");
            registry.set_total_coins(&id, 77);
            id
        };

        let reloaded = PlayerRegistry::load(path.clone());
        let record = reloaded.get(&id).expect("record survives");
        assert_eq!(record.total_coins, 77);
        assert_eq!(record.cookie, "biscuit");
        // online never survives a restart
        assert!(!record.online);
        assert!(reloaded.online().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn malformed_entries_are_skipped_on_load() {
        let path = temp_file("registry-partial");
        let parent = path.parent().expect("parent").to_path_buf();
        fs::create_dir_all(&parent).expect("create dir");
        let raw = r#"[
  {
    "playerId": "PLAYER_123456",
    "fingerprint": "AA:BB:CC:DD:EE:FF",
    "cookie": "",
    "totalCoins": 5,
    "gamesPlayed": 2,
    "gamesWon": 1,
    "lastLoginAt": 1700000000,
    "online": true
  },
  { "playerId": "PLAYER_999999" }
]"#;
        fs::write(&path, raw).expect("write");

        let registry = PlayerRegistry::load(path.clone());
        assert_eq!(registry.player_count(), 1);
        assert!(registry.is_valid("PLAYER_123456"));
        assert!(!registry.is_valid("PLAYER_999999"));

        let _ = fs::remove_file(&path);
        let _ = fs::remove_dir_all(&parent);
    }
}
