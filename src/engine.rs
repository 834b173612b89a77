use std::collections::{BTreeMap, HashMap};

use crate::constants::{
    item_price, BASE_MOVE_SPEED, FINISH_REWARD_BASE, MAX_MOVE_STEP, SLOW_TRAP_MS,
    SPEED_BOOST_MS, SPEED_BOOST_MULTIPLIER, WALL_REPAIR_MS,
};
use crate::maze::{Cell, MazeData};
use crate::rng::Rng;
use crate::types::{
    CellPos, GameError, GameStateView, ItemKind, MoveDirection, PlayerView, WorldPos,
};

#[derive(Clone, Debug)]
pub struct PlayerRuntime {
    pub player_id: String,
    pub pos: WorldPos,
    pub yaw: f32,
    pub alive: bool,
    pub has_compass: bool,
    /// Monotonic ms; 0 means no boost.
    pub speed_boost_until: u64,
    pub coins: i32,
    pub inventory: BTreeMap<ItemKind, u32>,
    pub reached_goal: bool,
    pub finish_rank: u32,
}

impl PlayerRuntime {
    fn new(player_id: &str, start: CellPos) -> Self {
        Self {
            player_id: player_id.to_string(),
            pos: WorldPos::from_cell(start),
            yaw: 0.0,
            alive: true,
            has_compass: false,
            speed_boost_until: 0,
            coins: 0,
            inventory: BTreeMap::new(),
            reached_goal: false,
            finish_rank: 0,
        }
    }

    pub fn item_count(&self, kind: ItemKind) -> u32 {
        self.inventory.get(&kind).copied().unwrap_or(0)
    }

    fn view(&self, now_ms: u64) -> PlayerView {
        PlayerView {
            player_id: self.player_id.clone(),
            position: self.pos,
            rotation: self.yaw,
            alive: self.alive,
            coins: self.coins,
            has_compass: self.has_compass,
            speed_boosted: self.speed_boost_until > now_ms,
            inventory: self
                .inventory
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(kind, count)| (kind.wire_name().to_string(), *count))
                .collect(),
            reached_goal: self.reached_goal,
            finish_rank: self.finish_rank,
        }
    }
}

/// What a successful item use did; the dispatcher turns this into the
/// `item_effect` broadcast.
#[derive(Clone, Debug, PartialEq)]
pub enum ItemEffect {
    SpeedBoost {
        player_id: String,
        until_ms: u64,
    },
    CompassGranted {
        player_id: String,
    },
    WallBroken {
        cell: CellPos,
        repair_at_ms: u64,
    },
    PlayerKilled {
        target_id: String,
        respawn: WorldPos,
    },
    TrapPlaced {
        cell: CellPos,
    },
    PositionsSwapped {
        player_id: String,
        target_id: String,
        player_pos: WorldPos,
        target_pos: WorldPos,
    },
}

/// Side effects of an accepted position change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MoveOutcome {
    pub finish_rank: Option<u32>,
    pub reward: i32,
    pub collected_coin: Option<usize>,
    pub game_over: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub walls_repaired: usize,
    pub traps_expired: usize,
    pub boosts_expired: usize,
}

/// Single source of truth for match state. Callers serialize access through
/// the shared state mutex; nothing here blocks on I/O.
pub struct GameEngine {
    data: MazeData,
    coin_collected: Vec<bool>,
    remaining_coins: usize,
    players: HashMap<String, PlayerRuntime>,
    broken_walls: BTreeMap<CellPos, u64>,
    slow_traps: Vec<(CellPos, u64)>,
    running: bool,
    finished_count: usize,
    next_finish_rank: u32,
    rng: Rng,
}

impl GameEngine {
    pub fn new(data: MazeData, seed: u32) -> Self {
        let coin_count = data.coin_positions.len();
        Self {
            data,
            coin_collected: vec![false; coin_count],
            remaining_coins: coin_count,
            players: HashMap::new(),
            broken_walls: BTreeMap::new(),
            slow_traps: Vec::new(),
            running: true,
            finished_count: 0,
            next_finish_rank: 1,
            rng: Rng::new(seed),
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn remaining_coins(&self) -> usize {
        self.remaining_coins
    }

    pub fn finished_count(&self) -> usize {
        self.finished_count
    }

    pub fn start_cell(&self) -> CellPos {
        self.data.start
    }

    pub fn has_player(&self, player_id: &str) -> bool {
        self.players.contains_key(player_id)
    }

    pub fn player(&self, player_id: &str) -> Option<&PlayerRuntime> {
        self.players.get(player_id)
    }

    pub fn player_ids(&self) -> Vec<String> {
        self.players.keys().cloned().collect()
    }

    pub fn maze_snapshot(&self) -> (&MazeData, &[bool]) {
        (&self.data, &self.coin_collected)
    }

    pub fn player_view(&self, player_id: &str, now_ms: u64) -> Option<PlayerView> {
        self.players.get(player_id).map(|p| p.view(now_ms))
    }

    pub fn game_state(&self, now_ms: u64) -> GameStateView {
        let mut players: Vec<PlayerView> =
            self.players.values().map(|p| p.view(now_ms)).collect();
        players.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        GameStateView {
            running: self.running,
            remaining_coins: self.remaining_coins,
            finished_count: self.finished_count,
            players,
        }
    }

    pub fn add_player(&mut self, player_id: &str) -> Result<(), GameError> {
        if self.players.contains_key(player_id) {
            return Err(GameError::Internal(format!(
                "player {player_id} already in match"
            )));
        }
        self.players
            .insert(player_id.to_string(), PlayerRuntime::new(player_id, self.data.start));
        Ok(())
    }

    pub fn remove_player(&mut self, player_id: &str) -> bool {
        self.players.remove(player_id).is_some()
    }

    fn player_checked(&self, player_id: &str) -> Result<&PlayerRuntime, GameError> {
        self.players
            .get(player_id)
            .ok_or(GameError::PlayerNotFound)
    }

    /// Vertical movement is only legal while standing inside a stair
    /// column (either end of the pair).
    fn on_stair(&self, cell: CellPos) -> bool {
        matches!(
            self.data.maze.get(cell),
            Some(Cell::StairUp) | Some(Cell::StairDown)
        )
    }

    fn move_speed(&self, player: &PlayerRuntime, now_ms: u64) -> f32 {
        if player.speed_boost_until > now_ms {
            BASE_MOVE_SPEED * SPEED_BOOST_MULTIPLIER
        } else {
            BASE_MOVE_SPEED
        }
    }

    /// One step from the current yaw. Fails without mutating when the
    /// player is dead, the candidate cell blocks, or a layer change is
    /// attempted off a stair pair.
    pub fn move_player(
        &mut self,
        player_id: &str,
        direction: MoveDirection,
        now_ms: u64,
    ) -> Result<MoveOutcome, GameError> {
        if !self.running {
            return Err(GameError::GameNotRunning);
        }
        let player = self.player_checked(player_id)?;
        if !player.alive {
            return Err(GameError::InvalidMove);
        }
        let speed = self.move_speed(player, now_ms);
        let yaw = player.yaw;
        let from = player.pos;
        let from_cell = from.cell();

        let (dx, dy, dz) = match direction {
            MoveDirection::Forward => (-yaw.sin() * speed, -yaw.cos() * speed, 0.0),
            MoveDirection::Backward => (yaw.sin() * speed, yaw.cos() * speed, 0.0),
            MoveDirection::Left => (-yaw.cos() * speed, yaw.sin() * speed, 0.0),
            MoveDirection::Right => (yaw.cos() * speed, -yaw.sin() * speed, 0.0),
            MoveDirection::Up => {
                if !self.on_stair(from_cell) {
                    return Err(GameError::InvalidMove);
                }
                (0.0, 0.0, speed)
            }
            MoveDirection::Down => {
                if !self.on_stair(from_cell) {
                    return Err(GameError::InvalidMove);
                }
                (0.0, 0.0, -speed)
            }
        };

        let candidate = WorldPos::new(from.x + dx, from.y + dy, from.z + dz);
        let cell = candidate.cell();
        if self.data.maze.is_blocking(cell) {
            return Err(GameError::InvalidMove);
        }
        if !self.data.maze.vertical_transition_ok(from_cell, cell) {
            return Err(GameError::InvalidMove);
        }

        if let Some(player) = self.players.get_mut(player_id) {
            player.pos = candidate;
        }
        Ok(self.after_position_change(player_id))
    }

    /// Server-authoritative acceptance of a client-proposed position: the
    /// delta must be coverable by a single move step and the target cell
    /// must be enterable from here. Rejection leaves the last validated
    /// position in place.
    pub fn apply_client_position(
        &mut self,
        player_id: &str,
        proposed: WorldPos,
        yaw: f32,
        now_ms: u64,
    ) -> Result<MoveOutcome, GameError> {
        if !self.running {
            return Err(GameError::GameNotRunning);
        }
        let player = self.player_checked(player_id)?;
        if !player.alive {
            return Err(GameError::InvalidMove);
        }
        let from = player.pos;
        let from_cell = from.cell();
        let cell = proposed.cell();

        let step_budget = if self.move_speed(player, now_ms) > BASE_MOVE_SPEED {
            MAX_MOVE_STEP
        } else {
            MAX_MOVE_STEP / SPEED_BOOST_MULTIPLIER
        };
        if from.distance_to(proposed) > step_budget {
            return Err(GameError::InvalidMove);
        }
        if self.data.maze.is_blocking(cell) {
            return Err(GameError::InvalidMove);
        }
        if !self.data.maze.vertical_transition_ok(from_cell, cell) {
            return Err(GameError::InvalidMove);
        }

        if let Some(player) = self.players.get_mut(player_id) {
            player.pos = proposed;
            player.yaw = yaw;
        }
        Ok(self.after_position_change(player_id))
    }

    fn after_position_change(&mut self, player_id: &str) -> MoveOutcome {
        let mut outcome = MoveOutcome::default();
        let cell = match self.players.get(player_id) {
            Some(player) => player.pos.cell(),
            None => return outcome,
        };

        if cell == self.data.end {
            if let Some((rank, reward, game_over)) = self.check_goal(player_id) {
                outcome.finish_rank = Some(rank);
                outcome.reward = reward;
                outcome.game_over = game_over;
            }
        }

        let coin_index = self.data.coin_positions.iter().position(|coin| *coin == cell);
        if let Some(idx) = coin_index {
            if !self.coin_collected[idx] && self.collect_coin(player_id, idx).is_ok() {
                outcome.collected_coin = Some(idx);
            }
        }
        outcome
    }

    /// First arrival at the end cell: rank assignment and coin bonus
    /// (60 for the winner, one less per rank).
    fn check_goal(&mut self, player_id: &str) -> Option<(u32, i32, bool)> {
        let rank = self.next_finish_rank;
        let reward = FINISH_REWARD_BASE - rank as i32;
        {
            let player = self.players.get_mut(player_id)?;
            if player.reached_goal {
                return None;
            }
            player.reached_goal = true;
            player.finish_rank = rank;
            player.coins += reward;
        }
        self.next_finish_rank += 1;
        self.finished_count += 1;

        let game_over = self.players.values().all(|p| p.reached_goal);
        if game_over {
            self.running = false;
        }
        Some((rank, reward, game_over))
    }

    /// Idempotent: a collected coin never collects again.
    pub fn collect_coin(&mut self, player_id: &str, coin_index: usize) -> Result<(), GameError> {
        if coin_index >= self.coin_collected.len() || self.coin_collected[coin_index] {
            return Err(GameError::InvalidTarget);
        }
        if !self.players.contains_key(player_id) {
            return Err(GameError::PlayerNotFound);
        }
        self.coin_collected[coin_index] = true;
        self.remaining_coins -= 1;
        if let Some(player) = self.players.get_mut(player_id) {
            player.coins += 1;
        }
        Ok(())
    }

    /// Returns the new balance.
    pub fn purchase_item(&mut self, player_id: &str, kind: ItemKind) -> Result<i32, GameError> {
        if !self.running {
            return Err(GameError::GameNotRunning);
        }
        let price = item_price(kind).ok_or(GameError::InvalidTarget)?;
        let player = self
            .players
            .get_mut(player_id)
            .ok_or(GameError::PlayerNotFound)?;
        if player.coins < price {
            return Err(GameError::InsufficientCoins);
        }
        player.coins -= price;
        *player.inventory.entry(kind).or_insert(0) += 1;
        Ok(player.coins)
    }

    /// Validates the whole effect before touching inventory, so a failed
    /// use never consumes the item.
    pub fn use_item(
        &mut self,
        player_id: &str,
        kind: ItemKind,
        target_player: Option<&str>,
        target_cell: Option<CellPos>,
        now_ms: u64,
    ) -> Result<ItemEffect, GameError> {
        if !self.running {
            return Err(GameError::GameNotRunning);
        }
        let player = self.player_checked(player_id)?;
        if player.item_count(kind) == 0 {
            return Err(GameError::ItemNotOwned);
        }

        let user_pos = player.pos;

        let effect = match kind {
            ItemKind::SpeedPotion => {
                let until_ms = now_ms + SPEED_BOOST_MS;
                if let Some(player) = self.players.get_mut(player_id) {
                    player.speed_boost_until = until_ms;
                }
                ItemEffect::SpeedBoost {
                    player_id: player_id.to_string(),
                    until_ms,
                }
            }
            ItemKind::Compass => {
                if let Some(player) = self.players.get_mut(player_id) {
                    player.has_compass = true;
                }
                ItemEffect::CompassGranted {
                    player_id: player_id.to_string(),
                }
            }
            ItemKind::Hammer => {
                let cell = target_cell.ok_or(GameError::InvalidTarget)?;
                if self.data.maze.get(cell) != Some(Cell::Wall) {
                    return Err(GameError::InvalidTarget);
                }
                let repair_at_ms = now_ms + WALL_REPAIR_MS;
                self.data.maze.set(cell, Cell::Path);
                self.broken_walls.insert(cell, repair_at_ms);
                ItemEffect::WallBroken { cell, repair_at_ms }
            }
            ItemKind::KillSword => {
                let target_id = target_player.ok_or(GameError::InvalidTarget)?.to_string();
                let target = self
                    .players
                    .get(&target_id)
                    .ok_or(GameError::PlayerNotFound)?;
                if !target.alive {
                    return Err(GameError::InvalidTarget);
                }
                let respawn = self.kill_and_respawn(&target_id);
                ItemEffect::PlayerKilled { target_id, respawn }
            }
            ItemKind::SlowTrap => {
                let cell = target_cell.ok_or(GameError::InvalidTarget)?;
                if !self.data.maze.in_bounds(cell) {
                    return Err(GameError::InvalidTarget);
                }
                self.slow_traps.push((cell, now_ms));
                ItemEffect::TrapPlaced { cell }
            }
            ItemKind::SwapItem => {
                let target_id = target_player.ok_or(GameError::InvalidTarget)?.to_string();
                if target_id == player_id {
                    return Err(GameError::InvalidTarget);
                }
                let target_pos = self
                    .players
                    .get(&target_id)
                    .ok_or(GameError::PlayerNotFound)?
                    .pos;
                if let Some(player) = self.players.get_mut(player_id) {
                    player.pos = target_pos;
                }
                if let Some(target) = self.players.get_mut(&target_id) {
                    target.pos = user_pos;
                }
                ItemEffect::PositionsSwapped {
                    player_id: player_id.to_string(),
                    target_id,
                    player_pos: target_pos,
                    target_pos: user_pos,
                }
            }
            ItemKind::Coin => return Err(GameError::InvalidTarget),
        };

        if let Some(player) = self.players.get_mut(player_id) {
            if let Some(count) = player.inventory.get_mut(&kind) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(effect)
    }

    /// Instant respawn on a uniformly random non-blocking cell. Coins and
    /// inventory survive; compass and speed boost do not.
    fn kill_and_respawn(&mut self, player_id: &str) -> WorldPos {
        let cells = self.data.maze.non_blocking_cells();
        let pick = if cells.is_empty() {
            WorldPos::from_cell(self.data.start)
        } else {
            WorldPos::from_cell(cells[self.rng.pick_index(cells.len())])
        };
        if let Some(player) = self.players.get_mut(player_id) {
            player.alive = true;
            player.pos = pick;
            player.has_compass = false;
            player.speed_boost_until = 0;
        }
        pick
    }

    /// Expires traps and speed boosts, reverts repaired walls.
    pub fn tick(&mut self, now_ms: u64) -> TickReport {
        let mut report = TickReport::default();

        let before = self.slow_traps.len();
        self.slow_traps
            .retain(|(_, placed_at)| now_ms < placed_at + SLOW_TRAP_MS);
        report.traps_expired = before - self.slow_traps.len();

        let due: Vec<CellPos> = self
            .broken_walls
            .iter()
            .filter(|(_, repair_at)| **repair_at <= now_ms)
            .map(|(cell, _)| *cell)
            .collect();
        for cell in due {
            self.data.maze.set(cell, Cell::Wall);
            self.broken_walls.remove(&cell);
            report.walls_repaired += 1;
        }

        for player in self.players.values_mut() {
            if player.speed_boost_until != 0 && player.speed_boost_until <= now_ms {
                player.speed_boost_until = 0;
                report.boosts_expired += 1;
            }
        }
        report
    }

    pub fn trap_count(&self) -> usize {
        self.slow_traps.len()
    }

    pub fn wall_at(&self, cell: CellPos) -> bool {
        self.data.maze.get(cell) == Some(Cell::Wall)
    }

    // Operator-privileged operations.

    pub fn give_item(
        &mut self,
        player_id: &str,
        kind: ItemKind,
        count: u32,
    ) -> Result<u32, GameError> {
        if kind == ItemKind::Coin {
            return Err(GameError::InvalidTarget);
        }
        let player = self
            .players
            .get_mut(player_id)
            .ok_or(GameError::PlayerNotFound)?;
        let entry = player.inventory.entry(kind).or_insert(0);
        *entry += count;
        Ok(*entry)
    }

    pub fn teleport(&mut self, player_id: &str, pos: WorldPos) -> Result<(), GameError> {
        if self.data.maze.is_blocking(pos.cell()) {
            return Err(GameError::InvalidMove);
        }
        let player = self
            .players
            .get_mut(player_id)
            .ok_or(GameError::PlayerNotFound)?;
        player.pos = pos;
        Ok(())
    }

    pub fn kill(&mut self, player_id: &str) -> Result<WorldPos, GameError> {
        let player = self.player_checked(player_id)?;
        if !player.alive {
            return Err(GameError::InvalidTarget);
        }
        Ok(self.kill_and_respawn(player_id))
    }

    pub fn set_coins(&mut self, player_id: &str, amount: i32) -> Result<(), GameError> {
        let player = self
            .players
            .get_mut(player_id)
            .ok_or(GameError::PlayerNotFound)?;
        player.coins = amount;
        Ok(())
    }

    /// Fresh match on the same maze: players back at start, coin bits and
    /// ranks cleared, ephemeral effects gone. Coins and inventory carry
    /// over; durable records are untouched.
    pub fn reset(&mut self) {
        let start = WorldPos::from_cell(self.data.start);
        for player in self.players.values_mut() {
            player.pos = start;
            player.alive = true;
            player.has_compass = false;
            player.speed_boost_until = 0;
            player.reached_goal = false;
            player.finish_rank = 0;
        }
        for collected in self.coin_collected.iter_mut() {
            *collected = false;
        }
        self.remaining_coins = self.coin_collected.len();
        for (cell, _) in std::mem::take(&mut self.broken_walls) {
            self.data.maze.set(cell, Cell::Wall);
        }
        self.slow_traps.clear();
        self.finished_count = 0;
        self.next_finish_rank = 1;
        self.running = true;
    }
}
