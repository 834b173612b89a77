use std::collections::{HashMap, VecDeque};

use crate::constants::{COIN_COUNT_MAX, COIN_COUNT_MIN};
use crate::maze::{Cell, Maze, MazeData};
use crate::rng::Rng;
use crate::types::CellPos;

/// Carves a multi-layer maze: recursive division inside each layer's wall
/// shell, stair pairs between adjacent layers, a start on layer 0, the end
/// at the farthest reachable cell, and 100-120 coins on path cells.
pub struct MazeGenerator {
    width: i32,
    height: i32,
    layers: i32,
    rng: Rng,
}

impl MazeGenerator {
    pub fn new(width: i32, height: i32, layers: i32, seed: u32) -> Self {
        Self {
            width,
            height,
            layers,
            rng: Rng::new(seed),
        }
    }

    pub fn generate(mut self) -> MazeData {
        let mut maze = Maze::filled(self.width, self.height, self.layers, Cell::Wall);

        for z in 0..self.layers {
            for y in 1..self.height - 1 {
                for x in 1..self.width - 1 {
                    maze.set(CellPos::new(x, y, z), Cell::Path);
                }
            }
            self.divide(&mut maze, z, 1, self.width - 2, 1, self.height - 2, true);
        }

        self.add_stairs(&mut maze);
        let start = self.place_start(&mut maze);
        let end = self.place_end(&mut maze, start);
        let coin_positions = self.distribute_coins(&mut maze, start, end);

        MazeData {
            maze,
            coin_positions,
            start,
            end,
        }
    }

    fn divide(
        &mut self,
        maze: &mut Maze,
        z: i32,
        min_x: i32,
        max_x: i32,
        min_y: i32,
        max_y: i32,
        horizontal: bool,
    ) {
        if max_x - min_x < 2 || max_y - min_y < 2 {
            return;
        }

        if horizontal {
            let range_y = (max_y - min_y) / 2 - 1;
            if range_y <= 0 {
                return;
            }
            let wall_y = (min_y + 2 * self.rng.int(0, range_y - 1) + 1).min(self.height - 2);
            for x in min_x..=max_x {
                maze.set(CellPos::new(x, wall_y, z), Cell::Wall);
            }
            let range_x = (max_x - min_x) / 2;
            if range_x <= 0 {
                return;
            }
            let door_x = (min_x + 2 * self.rng.int(0, range_x - 1)).min(self.width - 2);
            maze.set(CellPos::new(door_x, wall_y, z), Cell::Path);

            self.divide(maze, z, min_x, max_x, min_y, wall_y - 1, !horizontal);
            self.divide(maze, z, min_x, max_x, wall_y + 1, max_y, !horizontal);
        } else {
            let range_x = (max_x - min_x) / 2 - 1;
            if range_x <= 0 {
                return;
            }
            let wall_x = (min_x + 2 * self.rng.int(0, range_x - 1) + 1).min(self.width - 2);
            for y in min_y..=max_y {
                maze.set(CellPos::new(wall_x, y, z), Cell::Wall);
            }
            let range_y = (max_y - min_y) / 2;
            if range_y <= 0 {
                return;
            }
            let door_y = (min_y + 2 * self.rng.int(0, range_y - 1)).min(self.height - 2);
            maze.set(CellPos::new(wall_x, door_y, z), Cell::Path);

            self.divide(maze, z, min_x, wall_x - 1, min_y, max_y, !horizontal);
            self.divide(maze, z, wall_x + 1, max_x, min_y, max_y, !horizontal);
        }
    }

    /// Two or three stair pairs per layer boundary, each placed where both
    /// layers have open path: `StairUp` below coupled with `StairDown`
    /// directly above.
    fn add_stairs(&mut self, maze: &mut Maze) {
        for z in 0..self.layers - 1 {
            let stair_count = 2 + self.rng.int(0, 1);
            for _ in 0..stair_count {
                for _attempt in 0..100 {
                    let x = self.rng.int(1, self.width - 2);
                    let y = self.rng.int(1, self.height - 2);
                    let lower = CellPos::new(x, y, z);
                    let upper = CellPos::new(x, y, z + 1);
                    if maze.get(lower) == Some(Cell::Path) && maze.get(upper) == Some(Cell::Path)
                    {
                        maze.set(lower, Cell::StairUp);
                        maze.set(upper, Cell::StairDown);
                        break;
                    }
                }
            }
        }
    }

    fn place_start(&mut self, maze: &mut Maze) -> CellPos {
        for _attempt in 0..100 {
            let x = self.rng.int(1, self.width - 2);
            let y = self.rng.int(1, self.height - 2);
            let pos = CellPos::new(x, y, 0);
            if maze.get(pos) == Some(Cell::Path) {
                maze.set(pos, Cell::Start);
                return pos;
            }
        }
        // fallback scan: layer 0 always has open cells after carving
        let pos = maze.find_first(Cell::Path).unwrap_or(CellPos::new(1, 1, 0));
        maze.set(pos, Cell::Start);
        pos
    }

    /// The end goes on the farthest cell reachable from the start, so the
    /// reachability invariant holds by construction. Prefers the highest
    /// layer that the stair network reaches.
    fn place_end(&mut self, maze: &mut Maze, start: CellPos) -> CellPos {
        let distances = reachable_cells(maze, start);
        let best = distances
            .iter()
            .filter(|(pos, _)| maze.get(**pos) == Some(Cell::Path))
            .max_by_key(|(pos, dist)| (pos.z, **dist))
            .map(|(pos, _)| *pos)
            .unwrap_or(CellPos::new(start.x + 1, start.y, start.z));
        maze.set(best, Cell::End);
        best
    }

    fn distribute_coins(&mut self, maze: &mut Maze, start: CellPos, end: CellPos) -> Vec<CellPos> {
        let target = COIN_COUNT_MIN
            + self.rng.pick_index(COIN_COUNT_MAX - COIN_COUNT_MIN + 1);
        let mut coins = Vec::new();
        let mut attempts = 0;
        while coins.len() < target && attempts < 10_000 {
            attempts += 1;
            let pos = CellPos::new(
                self.rng.int(1, self.width - 2),
                self.rng.int(1, self.height - 2),
                self.rng.int(0, self.layers - 1),
            );
            if pos == start || pos == end {
                continue;
            }
            if maze.get(pos) == Some(Cell::Path) {
                maze.set(pos, Cell::Coin);
                coins.push(pos);
            }
        }
        coins
    }
}

/// Breadth-first distances from `start`, honoring the blocking view and the
/// stair-pair rule for layer changes.
pub fn reachable_cells(maze: &Maze, start: CellPos) -> HashMap<CellPos, u32> {
    let mut distances = HashMap::new();
    let mut queue = VecDeque::new();
    distances.insert(start, 0);
    queue.push_back(start);

    while let Some(pos) = queue.pop_front() {
        let dist = distances[&pos];
        let mut candidates = vec![
            CellPos::new(pos.x + 1, pos.y, pos.z),
            CellPos::new(pos.x - 1, pos.y, pos.z),
            CellPos::new(pos.x, pos.y + 1, pos.z),
            CellPos::new(pos.x, pos.y - 1, pos.z),
        ];
        candidates.push(CellPos::new(pos.x, pos.y, pos.z + 1));
        candidates.push(CellPos::new(pos.x, pos.y, pos.z - 1));

        for next in candidates {
            if maze.is_blocking(next) || distances.contains_key(&next) {
                continue;
            }
            if !maze.vertical_transition_ok(pos, next) {
                continue;
            }
            distances.insert(next, dist + 1);
            queue.push_back(next);
        }
    }
    distances
}
