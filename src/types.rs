use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    SpeedPotion,
    Compass,
    Hammer,
    KillSword,
    SlowTrap,
    SwapItem,
    /// Operator-only pseudo item for the `give` path; never purchasable.
    Coin,
}

impl ItemKind {
    pub const PURCHASABLE: [ItemKind; 6] = [
        ItemKind::SpeedPotion,
        ItemKind::Compass,
        ItemKind::Hammer,
        ItemKind::KillSword,
        ItemKind::SlowTrap,
        ItemKind::SwapItem,
    ];

    /// Parses the wire/console spelling, including the legacy client
    /// aliases (`sword`, `speed`, `trap`, `swap`, `coins`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "speed_potion" | "speed" => Some(Self::SpeedPotion),
            "compass" => Some(Self::Compass),
            "hammer" => Some(Self::Hammer),
            "kill_sword" | "sword" => Some(Self::KillSword),
            "slow_trap" | "trap" => Some(Self::SlowTrap),
            "swap_item" | "swap" => Some(Self::SwapItem),
            "coin" | "coins" => Some(Self::Coin),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::SpeedPotion => "speed_potion",
            Self::Compass => "compass",
            Self::Hammer => "hammer",
            Self::KillSword => "kill_sword",
            Self::SlowTrap => "slow_trap",
            Self::SwapItem => "swap_item",
            Self::Coin => "coin",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Forward,
    Backward,
    Left,
    Right,
    Up,
    Down,
}

impl MoveDirection {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "forward" => Some(Self::Forward),
            "backward" => Some(Self::Backward),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

/// Integer cell coordinates; `z` is the maze layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellPos {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// Float world position; rounds to the containing cell.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorldPos {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl WorldPos {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn from_cell(cell: CellPos) -> Self {
        Self {
            x: cell.x as f32,
            y: cell.y as f32,
            z: cell.z as f32,
        }
    }

    pub fn cell(&self) -> CellPos {
        CellPos {
            x: self.x.round() as i32,
            y: self.y.round() as i32,
            z: self.z.round() as i32,
        }
    }

    pub fn distance_to(&self, other: WorldPos) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Wire snapshot of one player's runtime state.
#[derive(Clone, Debug, Serialize)]
pub struct PlayerView {
    #[serde(rename = "playerId")]
    pub player_id: String,
    pub position: WorldPos,
    pub rotation: f32,
    pub alive: bool,
    pub coins: i32,
    #[serde(rename = "hasCompass")]
    pub has_compass: bool,
    #[serde(rename = "speedBoosted")]
    pub speed_boosted: bool,
    pub inventory: BTreeMap<String, u32>,
    #[serde(rename = "reachedGoal")]
    pub reached_goal: bool,
    #[serde(rename = "finishRank")]
    pub finish_rank: u32,
}

/// Wire snapshot of the whole match, sent as `game_state`.
#[derive(Clone, Debug, Serialize)]
pub struct GameStateView {
    pub running: bool,
    #[serde(rename = "remainingCoins")]
    pub remaining_coins: usize,
    #[serde(rename = "finishedCount")]
    pub finished_count: usize,
    pub players: Vec<PlayerView>,
}

/// Admin privilege ladder for operator commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AdminLevel {
    None,
    Moderator,
    Admin,
    SuperAdmin,
}

impl AdminLevel {
    pub fn from_index(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Moderator),
            2 => Some(Self::Admin),
            3 => Some(Self::SuperAdmin),
            _ => None,
        }
    }
}

/// Failure kinds surfaced to clients as `error` messages. Engine and
/// dispatcher both speak this vocabulary; `wire_code` is the on-wire form.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("invalid move")]
    InvalidMove,
    #[error("not enough coins")]
    InsufficientCoins,
    #[error("item not owned")]
    ItemNotOwned,
    #[error("player not found")]
    PlayerNotFound,
    #[error("invalid target")]
    InvalidTarget,
    #[error("game is not running")]
    GameNotRunning,
    #[error("authentication failed")]
    AuthFailed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("rate limited")]
    RateLimited,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GameError {
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::InvalidMove => "INVALID_MOVE",
            Self::InsufficientCoins => "INSUFFICIENT_COINS",
            Self::ItemNotOwned => "ITEM_NOT_OWNED",
            Self::PlayerNotFound => "PLAYER_NOT_FOUND",
            Self::InvalidTarget => "INVALID_TARGET",
            Self::GameNotRunning => "GAME_NOT_RUNNING",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_kind_parses_wire_names_and_aliases() {
        assert_eq!(ItemKind::parse("kill_sword"), Some(ItemKind::KillSword));
        assert_eq!(ItemKind::parse("sword"), Some(ItemKind::KillSword));
        assert_eq!(ItemKind::parse("SPEED_POTION"), Some(ItemKind::SpeedPotion));
        assert_eq!(ItemKind::parse("coins"), Some(ItemKind::Coin));
        assert_eq!(ItemKind::parse("wand"), None);
    }

    #[test]
    fn wire_names_round_trip() {
        for kind in ItemKind::PURCHASABLE {
            assert_eq!(ItemKind::parse(kind.wire_name()), Some(kind));
        }
    }

    #[test]
    fn world_pos_rounds_to_nearest_cell() {
        let pos = WorldPos::new(2.4, 6.6, 0.2);
        assert_eq!(pos.cell(), CellPos::new(2, 7, 0));
        let negative = WorldPos::new(-0.4, 0.0, 0.0);
        assert_eq!(negative.cell(), CellPos::new(0, 0, 0));
    }

    #[test]
    fn admin_levels_are_ordered() {
        assert!(AdminLevel::SuperAdmin > AdminLevel::Admin);
        assert!(AdminLevel::Admin > AdminLevel::Moderator);
        assert!(AdminLevel::Moderator > AdminLevel::None);
        assert_eq!(AdminLevel::from_index(3), Some(AdminLevel::SuperAdmin));
        assert_eq!(AdminLevel::from_index(4), None);
    }

    #[test]
    fn error_codes_match_wire_contract() {
        assert_eq!(GameError::InvalidMove.wire_code(), "INVALID_MOVE");
        assert_eq!(GameError::RateLimited.wire_code(), "RATE_LIMITED");
        assert_eq!(
            GameError::Internal("boom".to_string()).wire_code(),
            "INTERNAL"
        );
    }
}
