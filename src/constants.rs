use crate::types::ItemKind;

pub const TICK_MS: u64 = 100;

pub const MAZE_WIDTH: i32 = 50;
pub const MAZE_HEIGHT: i32 = 50;
pub const MAZE_LAYERS: i32 = 7;

pub const COIN_COUNT_MIN: usize = 100;
pub const COIN_COUNT_MAX: usize = 120;

pub const BASE_MOVE_SPEED: f32 = 0.1;
pub const SPEED_BOOST_MULTIPLIER: f32 = 2.0;
/// Largest per-message position delta the dispatcher accepts: one boosted
/// step plus slack for diagonal movement and float rounding.
pub const MAX_MOVE_STEP: f32 = 0.35;

pub const SPEED_BOOST_MS: u64 = 10_000;
pub const WALL_REPAIR_MS: u64 = 60_000;
pub const SLOW_TRAP_MS: u64 = 30_000;

/// First finisher earns 60, second 59, and so on.
pub const FINISH_REWARD_BASE: i32 = 61;

pub const MAX_PLAYERS: usize = 50;
pub const CHAT_MESSAGE_MAX_CHARS: usize = 200;
pub const COMMAND_HISTORY_CAP: usize = 1000;

pub const OUTBOUND_QUEUE_CAP: usize = 256;
pub const WRITE_STALL_GRACE_MS: u64 = 2_000;
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;
pub const HANDSHAKE_MAX_BYTES: usize = 8 * 1024;
pub const HANDSHAKE_READ_ATTEMPTS: u32 = 10;
pub const HANDSHAKE_READ_WAIT_MS: u64 = 20;

pub const INBOUND_RATE_LIMIT: usize = 100;
pub const INBOUND_RATE_WINDOW_MS: u64 = 1_000;

pub const GAME_VERSION: &str = "1.0.0";

pub fn item_price(kind: ItemKind) -> Option<i32> {
    match kind {
        ItemKind::SpeedPotion => Some(20),
        ItemKind::Compass => Some(25),
        ItemKind::Hammer => Some(50),
        ItemKind::KillSword => Some(50),
        ItemKind::SlowTrap => Some(30),
        ItemKind::SwapItem => Some(60),
        ItemKind::Coin => None,
    }
}
