//! A walls-only maze: the smallest problem the engine can run.
//!
//! `#` is a wall, `S` a start (each start seeds its own initial
//! state), `F` a finish. Every move costs one frame, so shortest
//! delay equals fewest moves.

use std::fmt;

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::compressed::{CompressedState, Frame};
use crate::layout::{bits_for, Field, LayoutBuilder};
use crate::problem::Problem;

/// The built-in sample level: two starts, one finish.
pub const SAMPLE_LEVEL: &str = "\
###############
#S#         # #
# ##### ### # #
#     #   #   #
#####   # # # #
#     # ### # #
# ### # #   # #
# # ### ##### #
# #   # #     #
### # ### #####
#S# #     #   #
# # # # ### # #
# # # # #   # #
#   # #   # #F#
###############
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dir {
    Up,
    Right,
    Down,
    Left,
}

impl Dir {
    pub const ALL: [Dir; 4] = [Dir::Up, Dir::Right, Dir::Down, Dir::Left];

    pub fn delta(self) -> (i32, i32) {
        match self {
            Dir::Up => (0, -1),
            Dir::Right => (1, 0),
            Dir::Down => (0, 1),
            Dir::Left => (-1, 0),
        }
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dir::Up => "Up",
            Dir::Right => "Right",
            Dir::Down => "Down",
            Dir::Left => "Left",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MazeState {
    pub x: u32,
    pub y: u32,
}

pub struct Maze {
    name: String,
    width: u32,
    height: u32,
    walls: Vec<bool>,
    starts: Vec<MazeState>,
    finishes: Vec<(u32, u32)>,
    x_field: Field,
    y_field: Field,
}

impl Maze {
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self> {
        let rows: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
        ensure!(!rows.is_empty(), "empty maze");
        let width = rows[0].chars().count() as u32;
        let height = rows.len() as u32;
        ensure!(
            rows.iter().all(|r| r.chars().count() as u32 == width),
            "ragged maze rows"
        );

        let mut walls = vec![false; (width * height) as usize];
        let mut starts = Vec::new();
        let mut finishes = Vec::new();
        for (y, row) in rows.iter().enumerate() {
            for (x, c) in row.chars().enumerate() {
                let (x, y) = (x as u32, y as u32);
                match c {
                    '#' => walls[(y * width + x) as usize] = true,
                    'S' => starts.push(MazeState { x, y }),
                    'F' => finishes.push((x, y)),
                    ' ' => {}
                    other => bail!("unexpected maze character {other:?} at {x},{y}"),
                }
            }
        }
        ensure!(!starts.is_empty(), "maze has no start");
        ensure!(!finishes.is_empty(), "maze has no finish");

        let mut layout = LayoutBuilder::new();
        let x_field = layout.field(bits_for(width));
        let y_field = layout.field(bits_for(height));
        layout.finish()?;

        Ok(Self {
            name: name.into(),
            width,
            height,
            walls,
            starts,
            finishes,
            x_field,
            y_field,
        })
    }

    fn wall(&self, x: u32, y: u32) -> bool {
        self.walls[(y * self.width + x) as usize]
    }
}

impl Problem for Maze {
    type State = MazeState;
    type Step = Dir;

    fn name(&self) -> &str {
        &self.name
    }

    fn max_frames(&self) -> Frame {
        // A shortest path never revisits a cell.
        self.width * self.height
    }

    fn initial_states(&self) -> Vec<MazeState> {
        self.starts.clone()
    }

    fn compress(&self, state: &MazeState) -> CompressedState {
        let mut data = 0u128;
        self.x_field.set(&mut data, state.x);
        self.y_field.set(&mut data, state.y);
        CompressedState::from_data(data)
    }

    fn decompress(&self, cs: &CompressedState) -> MazeState {
        let data = cs.data();
        MazeState {
            x: self.x_field.get(data),
            y: self.y_field.get(data),
        }
    }

    fn is_finish(&self, state: &MazeState) -> bool {
        self.finishes.contains(&(state.x, state.y))
    }

    fn expand(&self, state: &MazeState, visit: &mut dyn FnMut(Dir, &MazeState, Frame)) {
        for dir in Dir::ALL {
            if let Some((child, delay)) = self.apply(state, dir) {
                visit(dir, &child, delay);
            }
        }
    }

    fn apply(&self, state: &MazeState, step: Dir) -> Option<(MazeState, Frame)> {
        let (dx, dy) = step.delta();
        let x = state.x.checked_add_signed(dx)?;
        let y = state.y.checked_add_signed(dy)?;
        if x >= self.width || y >= self.height || self.wall(x, y) {
            return None;
        }
        Some((MazeState { x, y }, 1))
    }

    fn state_to_string(&self, state: &MazeState) -> String {
        let mut out = String::with_capacity(((self.width + 1) * self.height) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                out.push(if (x, y) == (state.x, state.y) {
                    '@'
                } else if self.wall(x, y) {
                    '#'
                } else if self.finishes.contains(&(x, y)) {
                    'F'
                } else {
                    ' '
                });
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Maze {
        Maze::parse("maze", SAMPLE_LEVEL).unwrap()
    }

    #[test]
    fn sample_level_parses() {
        let maze = sample();
        assert_eq!(maze.width, 15);
        assert_eq!(maze.height, 15);
        assert_eq!(maze.initial_states().len(), 2);
        assert_eq!(maze.finishes, vec![(13, 13)]);
    }

    #[test]
    fn compress_round_trips_every_cell() {
        let maze = sample();
        for y in 0..maze.height {
            for x in 0..maze.width {
                let s = MazeState { x, y };
                let cs = maze.compress(&s);
                assert_eq!(maze.decompress(&cs), s);
                // Compressing twice yields identical bytes.
                assert_eq!(maze.compress(&s).to_le_bytes(), cs.to_le_bytes());
            }
        }
    }

    #[test]
    fn walls_block_moves() {
        let maze = sample();
        let start = maze.initial_states()[0];
        assert_eq!(start, MazeState { x: 1, y: 1 });
        assert!(maze.apply(&start, Dir::Up).is_none());
        assert!(maze.apply(&start, Dir::Left).is_none());
        assert!(maze.apply(&start, Dir::Right).is_none());
        let (down, delay) = maze.apply(&start, Dir::Down).unwrap();
        assert_eq!(delay, 1);
        assert_eq!(down, MazeState { x: 1, y: 2 });
    }

    #[test]
    fn expansion_matches_apply() {
        let maze = sample();
        let s = MazeState { x: 3, y: 3 };
        let mut seen = Vec::new();
        maze.expand(&s, &mut |dir, child, delay| {
            seen.push((dir, *child, delay));
        });
        for (dir, child, delay) in seen {
            assert_eq!(maze.apply(&s, dir), Some((child, delay)));
        }
    }

    #[test]
    fn finish_is_recognized() {
        let maze = sample();
        assert!(maze.is_finish(&MazeState { x: 13, y: 13 }));
        assert!(!maze.is_finish(&MazeState { x: 1, y: 1 }));
    }
}
