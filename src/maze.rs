use serde::{Deserialize, Serialize};

use crate::types::CellPos;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cell {
    Wall,
    Path,
    StairUp,
    StairDown,
    Start,
    End,
    /// A path cell holding a collectible; blocking-wise identical to Path.
    Coin,
}

impl Cell {
    pub fn is_blocking(self) -> bool {
        self == Cell::Wall
    }

    fn to_char(self) -> char {
        match self {
            Cell::Wall => '#',
            Cell::Path => '.',
            Cell::StairUp => 'U',
            Cell::StairDown => 'D',
            Cell::Start => 'S',
            Cell::End => 'E',
            Cell::Coin => 'C',
        }
    }

    fn from_char(value: char) -> Option<Self> {
        match value {
            '#' => Some(Cell::Wall),
            '.' => Some(Cell::Path),
            'U' => Some(Cell::StairUp),
            'D' => Some(Cell::StairDown),
            'S' => Some(Cell::Start),
            'E' => Some(Cell::End),
            'C' => Some(Cell::Coin),
            _ => None,
        }
    }
}

/// Three-dimensional grid of cells; `z` indexes the layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Maze {
    width: i32,
    height: i32,
    layers: i32,
    cells: Vec<Cell>,
}

impl Maze {
    pub fn filled(width: i32, height: i32, layers: i32, fill: Cell) -> Self {
        let len = (width as usize) * (height as usize) * (layers as usize);
        Self {
            width,
            height,
            layers,
            cells: vec![fill; len],
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn layers(&self) -> i32 {
        self.layers
    }

    pub fn in_bounds(&self, pos: CellPos) -> bool {
        (0..self.width).contains(&pos.x)
            && (0..self.height).contains(&pos.y)
            && (0..self.layers).contains(&pos.z)
    }

    fn index(&self, pos: CellPos) -> usize {
        ((pos.z * self.height + pos.y) * self.width + pos.x) as usize
    }

    pub fn get(&self, pos: CellPos) -> Option<Cell> {
        if self.in_bounds(pos) {
            Some(self.cells[self.index(pos)])
        } else {
            None
        }
    }

    pub fn set(&mut self, pos: CellPos, cell: Cell) {
        if self.in_bounds(pos) {
            let idx = self.index(pos);
            self.cells[idx] = cell;
        }
    }

    /// Out-of-bounds counts as blocking.
    pub fn is_blocking(&self, pos: CellPos) -> bool {
        self.get(pos).map(Cell::is_blocking).unwrap_or(true)
    }

    /// Whether a layer change between the two cells crosses a stair pair:
    /// `StairUp` at (x, y, z) coupled with `StairDown` at (x, y, z + 1).
    pub fn vertical_transition_ok(&self, from: CellPos, to: CellPos) -> bool {
        if from.z == to.z {
            return true;
        }
        if from.x != to.x || from.y != to.y {
            return false;
        }
        if to.z == from.z + 1 {
            self.get(from) == Some(Cell::StairUp) && self.get(to) == Some(Cell::StairDown)
        } else if to.z == from.z - 1 {
            self.get(from) == Some(Cell::StairDown) && self.get(to) == Some(Cell::StairUp)
        } else {
            false
        }
    }

    pub fn find_first(&self, wanted: Cell) -> Option<CellPos> {
        for z in 0..self.layers {
            for y in 0..self.height {
                for x in 0..self.width {
                    let pos = CellPos::new(x, y, z);
                    if self.cells[self.index(pos)] == wanted {
                        return Some(pos);
                    }
                }
            }
        }
        None
    }

    pub fn non_blocking_cells(&self) -> Vec<CellPos> {
        let mut cells = Vec::new();
        for z in 0..self.layers {
            for y in 0..self.height {
                for x in 0..self.width {
                    let pos = CellPos::new(x, y, z);
                    if !self.cells[self.index(pos)].is_blocking() {
                        cells.push(pos);
                    }
                }
            }
        }
        cells
    }

    fn layer_rows(&self, z: i32) -> Vec<String> {
        let mut rows = Vec::with_capacity(self.height as usize);
        for y in 0..self.height {
            let mut row = String::with_capacity(self.width as usize);
            for x in 0..self.width {
                row.push(self.cells[self.index(CellPos::new(x, y, z))].to_char());
            }
            rows.push(row);
        }
        rows
    }
}

/// Persisted maze snapshot: grid plus coin pool, start, and end. This is
/// the exact shape of `maze_data.json`.
#[derive(Clone, Debug, PartialEq)]
pub struct MazeData {
    pub maze: Maze,
    pub coin_positions: Vec<CellPos>,
    pub start: CellPos,
    pub end: CellPos,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MazeFile {
    width: i32,
    height: i32,
    layers: i32,
    /// Rows of cell characters, outer index is the layer.
    tiles: Vec<Vec<String>>,
    coin_positions: Vec<CellPos>,
    start: CellPos,
    end: CellPos,
}

impl Serialize for MazeData {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let tiles = (0..self.maze.layers)
            .map(|z| self.maze.layer_rows(z))
            .collect();
        MazeFile {
            width: self.maze.width,
            height: self.maze.height,
            layers: self.maze.layers,
            tiles,
            coin_positions: self.coin_positions.clone(),
            start: self.start,
            end: self.end,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MazeData {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let file = MazeFile::deserialize(deserializer)?;
        let mut maze = Maze::filled(file.width, file.height, file.layers, Cell::Wall);
        if file.tiles.len() != file.layers as usize {
            return Err(serde::de::Error::custom("layer count mismatch"));
        }
        for (z, layer) in file.tiles.iter().enumerate() {
            if layer.len() != file.height as usize {
                return Err(serde::de::Error::custom("row count mismatch"));
            }
            for (y, row) in layer.iter().enumerate() {
                if row.chars().count() != file.width as usize {
                    return Err(serde::de::Error::custom("row width mismatch"));
                }
                for (x, ch) in row.chars().enumerate() {
                    let cell = Cell::from_char(ch)
                        .ok_or_else(|| serde::de::Error::custom(format!("bad cell '{ch}'")))?;
                    maze.set(CellPos::new(x as i32, y as i32, z as i32), cell);
                }
            }
        }
        Ok(MazeData {
            maze,
            coin_positions: file.coin_positions,
            start: file.start,
            end: file.end,
        })
    }
}
