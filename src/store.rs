use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_PLAYERS, MAZE_HEIGHT, MAZE_LAYERS, MAZE_WIDTH};
use crate::maze::MazeData;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub server_name: String,
    pub max_players: usize,
    pub maze_width: i32,
    pub maze_height: i32,
    pub maze_layers: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "3D Maze Game Server".to_string(),
            max_players: MAX_PLAYERS,
            maze_width: MAZE_WIDTH,
            maze_height: MAZE_HEIGHT,
            maze_layers: MAZE_LAYERS,
        }
    }
}

/// File-backed data directory: `maze_data.json`, `config.json`, the
/// append-only `chat_log.txt`, and timestamped backups. Read errors fall
/// back to defaults; write errors are logged and swallowed so a bad disk
/// never takes the match down.
pub struct DataStore {
    data_dir: PathBuf,
    chat_log: File,
}

impl DataStore {
    pub fn open(data_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        let chat_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_dir.join("chat_log.txt"))?;
        Ok(Self { data_dir, chat_log })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn players_path(&self) -> PathBuf {
        self.data_dir.join("players.json")
    }

    fn maze_path(&self) -> PathBuf {
        self.data_dir.join("maze_data.json")
    }

    fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// Missing or unreadable config falls back to the defaults, which are
    /// then written out so operators have a file to edit.
    pub fn load_config(&self) -> ServerConfig {
        let path = self.config_path();
        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(error) => {
                    tracing::warn!("bad config at {}: {error}; using defaults", path.display());
                    ServerConfig::default()
                }
            },
            Err(_) => {
                let config = ServerConfig::default();
                self.save_config(&config);
                config
            }
        }
    }

    pub fn save_config(&self, config: &ServerConfig) {
        write_json(&self.config_path(), config);
    }

    pub fn load_maze(&self) -> Option<MazeData> {
        let path = self.maze_path();
        let text = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(data) => Some(data),
            Err(error) => {
                tracing::warn!("bad maze data at {}: {error}", path.display());
                None
            }
        }
    }

    pub fn save_maze(&self, data: &MazeData) {
        write_json(&self.maze_path(), data);
    }

    pub fn append_chat(&mut self, sender: &str, message: &str) {
        let stamp = Local::now().format("[%Y-%m-%d %H:%M:%S]");
        if let Err(error) = writeln!(self.chat_log, "{stamp} [{sender}]: {message}") {
            tracing::warn!("chat log write failed: {error}");
            return;
        }
        let _ = self.chat_log.flush();
    }

    /// Timestamped copies of the persisted files into `backups/`.
    pub fn create_backup(&self) {
        let backup_dir = self.data_dir.join("backups");
        if let Err(error) = fs::create_dir_all(&backup_dir) {
            tracing::warn!("failed to create {}: {error}", backup_dir.display());
            return;
        }
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        for name in ["players.json", "config.json", "maze_data.json"] {
            let source = self.data_dir.join(name);
            if !source.exists() {
                continue;
            }
            let target = backup_dir.join(format!("backup_{stamp}_{name}"));
            if let Err(error) = fs::copy(&source, &target) {
                tracing::warn!("backup of {name} failed: {error}");
            }
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            if let Err(error) = fs::write(path, text) {
                tracing::warn!("failed to write {}: {error}", path.display());
            }
        }
        Err(error) => {
            tracing::warn!("failed to serialize {}: {error}", path.display());
        }
    }
}
