//! Kwirk rules: up to four players, exits, pushable rectangular
//! blocks, holes that swallow exactly-fitting blocks, and quarter-turn
//! rotators.
//!
//! The live state is a byte grid plus the player roster. The high two
//! bits of a cell say what the floor is (wall, hole), the low six what
//! object sits on it (block borders, rotator parts, exit). Inactive
//! players are drawn as walls so movement checks need no special
//! cases.

use std::fmt;

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::compressed::{CompressedState, Frame};
use crate::layout::{bits_for, Field, LayoutBuilder};
use crate::problem::Problem;

const DELAY_MOVE: Frame = 9;
const DELAY_PUSH: Frame = 10;
const DELAY_FILL: Frame = 18;
const DELAY_ROTATE: Frame = 12;
const DELAY_SWITCH: Frame = 30;

const CELL_MASK: u8 = 0xC0;
const CELL_WALL: u8 = 0x40;
const CELL_HOLE: u8 = 0x80;

const OBJ_MASK: u8 = 0x3F;
const OBJ_BLOCK_UP: u8 = 0x01;
const OBJ_BLOCK_RIGHT: u8 = 0x02;
const OBJ_BLOCK_DOWN: u8 = 0x04;
const OBJ_BLOCK_LEFT: u8 = 0x08;
const OBJ_BLOCK_MAX: u8 = 0x0F;
const OBJ_ROTATOR_CENTER: u8 = 0x10;
const OBJ_ROTATOR_UP: u8 = 0x11;
const OBJ_EXIT: u8 = 0x20;

const MAX_PLAYERS: usize = 4;

/// Marker coordinate for a player who has left the level.
const EXITED: u8 = u8::MAX;

const DX: [i32; 4] = [0, 1, 0, -1];
const DY: [i32; 4] = [-1, 0, 1, 0];

/// Arrow notation for rotator arms, indexed by direction.
const ARROWS: [char; 4] = ['^', '>', '`', '<'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Up,
    Right,
    Down,
    Left,
    Switch,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Up,
        Action::Right,
        Action::Down,
        Action::Left,
        Action::Switch,
    ];

    fn dir(self) -> Option<usize> {
        match self {
            Action::Up => Some(0),
            Action::Right => Some(1),
            Action::Down => Some(2),
            Action::Left => Some(3),
            Action::Switch => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Up => "Up",
            Action::Right => "Right",
            Action::Down => "Down",
            Action::Left => "Left",
            Action::Switch => "Switch",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlayerPos {
    x: u8,
    y: u8,
}

impl PlayerPos {
    fn exited(self) -> bool {
        self.x == EXITED
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KwirkState {
    map: Box<[u8]>,
    players: [PlayerPos; MAX_PLAYERS],
    active: u8,
}

/// Per-slot fields of one packed block.
#[derive(Debug, Clone, Copy)]
struct BlockFields {
    x: Field,
    y: Field,
    w: Field,
    h: Field,
}

pub struct Kwirk {
    name: String,
    width: u32,
    height: u32,
    /// Walls and exits only; everything else is state.
    base: Box<[u8]>,
    hole_cells: Vec<(u8, u8)>,
    rotator_centers: Vec<(u8, u8)>,
    /// Arm mask of each rotator in the level's initial orientation.
    initial_arms: Vec<u8>,
    player_count: usize,
    max_frames: Frame,
    initial: KwirkState,

    active_field: Field,
    player_fields: Vec<(Field, Field, Field)>,
    block_fields: Vec<BlockFields>,
    rotator_fields: Vec<Field>,
    hole_fields: Vec<Field>,
}

fn rotate_mask(mask: u8, quarter_turns: u32) -> u8 {
    let r = quarter_turns % 4;
    ((mask << r) | (mask >> (4 - r))) & 0x0F
}

impl Kwirk {
    pub fn parse(name: impl Into<String>, text: &str, max_steps: u32) -> Result<Self> {
        let rows: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
        ensure!(rows.len() >= 3, "level too small");
        let width = rows[0].chars().count() as u32;
        let height = rows.len() as u32;
        ensure!(
            rows.iter().all(|r| r.chars().count() as u32 == width),
            "ragged level rows"
        );
        ensure!(width <= 64 && height <= 64, "level too large");
        let level: Vec<Vec<char>> = rows.iter().map(|r| r.chars().collect()).collect();
        for y in 0..height as usize {
            for x in 0..width as usize {
                if y == 0 || x == 0 || y == height as usize - 1 || x == width as usize - 1 {
                    ensure!(
                        level[y][x] == '#' || level[y][x] == '2',
                        "level border must be walls or exits"
                    );
                }
            }
        }
        let at = |x: i32, y: i32| -> char {
            if x < 0 || y < 0 || x >= width as i32 || y >= height as i32 {
                '#'
            } else {
                level[y as usize][x as usize]
            }
        };

        let idx = |x: u32, y: u32| (y * width + x) as usize;
        let mut map = vec![0u8; (width * height) as usize].into_boxed_slice();
        let mut base = vec![0u8; (width * height) as usize].into_boxed_slice();
        let mut players = [PlayerPos { x: EXITED, y: EXITED }; MAX_PLAYERS];
        let mut player_count = 0usize;
        let mut hole_cells = Vec::new();
        let mut seen_blocks = Vec::new();
        let mut max_block_w = 1u32;
        let mut max_block_h = 1u32;

        for y in 0..height {
            for x in 0..width {
                let c = level[y as usize][x as usize];
                let cell = match c {
                    ' ' => 0,
                    '#' => CELL_WALL,
                    'O' => {
                        hole_cells.push((x as u8, y as u8));
                        CELL_HOLE
                    }
                    '2' => CELL_WALL | OBJ_EXIT,
                    '1' | '3' | '4' | '5' => {
                        let p = if c == '1' { 0 } else { c as usize - '3' as usize + 1 };
                        ensure!(p < MAX_PLAYERS, "invalid player {c}");
                        ensure!(players[p].exited(), "duplicate player {c}");
                        players[p] = PlayerPos {
                            x: x as u8,
                            y: y as u8,
                        };
                        player_count = player_count.max(p + 1);
                        // Filled in below: the active player stands on
                        // an empty cell, everyone else reads as a wall.
                        0
                    }
                    'a'..='z' => {
                        ensure!(
                            x > 0 && y > 0 && x < width - 1 && y < height - 1,
                            "block {c} touches the border"
                        );
                        if !seen_blocks.contains(&c) {
                            seen_blocks.push(c);
                            let mut x2 = x;
                            while at(x2 as i32 + 1, y as i32) == c {
                                x2 += 1;
                            }
                            let mut y2 = y;
                            while at(x as i32, y2 as i32 + 1) == c {
                                y2 += 1;
                            }
                            max_block_w = max_block_w.max(x2 - x + 1);
                            max_block_h = max_block_h.max(y2 - y + 1);
                        }
                        (if at(x as i32, y as i32 - 1) != c { OBJ_BLOCK_UP } else { 0 })
                            | (if at(x as i32 + 1, y as i32) != c { OBJ_BLOCK_RIGHT } else { 0 })
                            | (if at(x as i32, y as i32 + 1) != c { OBJ_BLOCK_DOWN } else { 0 })
                            | (if at(x as i32 - 1, y as i32) != c { OBJ_BLOCK_LEFT } else { 0 })
                    }
                    '^' | '>' | '`' | '<' => {
                        let d = match c {
                            '^' => 0,
                            '>' => 1,
                            '`' => 2,
                            _ => 3,
                        };
                        OBJ_ROTATOR_UP + d
                    }
                    'A'..='N' | 'P'..='Z' => {
                        let mut neighbors = Vec::new();
                        let mut is_center = false;
                        for d in 0..4 {
                            let c2 = at(x as i32 + DX[d], y as i32 + DY[d]);
                            if c2 == ARROWS[d] {
                                is_center = true;
                            }
                            if c2 == c || c2 == ARROWS[d] {
                                neighbors.push(d);
                            }
                        }
                        ensure!(!neighbors.is_empty(), "stray rotator letter {c}");
                        if neighbors.len() > 1 || is_center {
                            OBJ_ROTATOR_CENTER
                        } else {
                            OBJ_ROTATOR_UP + ((2 + neighbors[0]) % 4) as u8
                        }
                    }
                    other => bail!("unexpected level character {other:?} at {x},{y}"),
                };
                map[idx(x, y)] = cell;
                base[idx(x, y)] = cell & (CELL_WALL | OBJ_EXIT);
            }
        }

        ensure!(player_count >= 1, "level has no player");
        for p in 0..player_count {
            ensure!(!players[p].exited(), "player {} missing", p + 1);
        }
        // Non-active players read as walls.
        for p in 1..player_count {
            map[idx(players[p].x as u32, players[p].y as u32)] = CELL_WALL;
        }

        // Collect rotator centers and validate arm attachment.
        let mut rotator_centers = Vec::new();
        let mut initial_arms = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let obj = map[idx(x, y)] & OBJ_MASK;
                if obj == OBJ_ROTATOR_CENTER {
                    let mut arms = 0u8;
                    for d in 0..4 {
                        let (ax, ay) = (x as i32 + DX[d], y as i32 + DY[d]);
                        if ax >= 0
                            && ay >= 0
                            && (ax as u32) < width
                            && (ay as u32) < height
                            && map[idx(ax as u32, ay as u32)] & OBJ_MASK
                                == OBJ_ROTATOR_UP + d as u8
                        {
                            arms |= 1 << d;
                        }
                    }
                    ensure!(arms != 0, "rotator center at {x},{y} has no arms");
                    rotator_centers.push((x as u8, y as u8));
                    initial_arms.push(arms);
                } else if (OBJ_ROTATOR_UP..OBJ_ROTATOR_UP + 4).contains(&obj) {
                    let d = (obj - OBJ_ROTATOR_UP) as usize;
                    let (cx, cy) = (x as i32 + DX[(d + 2) % 4], y as i32 + DY[(d + 2) % 4]);
                    ensure!(
                        cx >= 0
                            && cy >= 0
                            && (cx as u32) < width
                            && (cy as u32) < height
                            && map[idx(cx as u32, cy as u32)] & OBJ_MASK == OBJ_ROTATOR_CENTER,
                        "rotator arm at {x},{y} is not attached to a center"
                    );
                }
            }
        }

        let block_count = seen_blocks.len();

        // Packed layout: active player, players, blocks, rotators,
        // holes, allocated from bit 0 upward.
        let mut layout = LayoutBuilder::new();
        let active_field = layout.field(bits_for(player_count as u32));
        let px_bits = bits_for(width - 1);
        let py_bits = bits_for(height - 1);
        let player_fields: Vec<_> = (0..player_count)
            .map(|_| {
                (
                    layout.field(px_bits),
                    layout.field(py_bits),
                    layout.field(1),
                )
            })
            .collect();
        // One extra value beyond the valid range so the all-ones slot
        // marker can never collide with a real block.
        let bw_bits = bits_for(max_block_w + 1);
        let bh_bits = bits_for(max_block_h + 1);
        let block_fields: Vec<_> = (0..block_count)
            .map(|_| BlockFields {
                x: layout.field(px_bits),
                y: layout.field(py_bits),
                w: layout.field(bw_bits),
                h: layout.field(bh_bits),
            })
            .collect();
        let rotator_fields: Vec<_> = (0..rotator_centers.len())
            .map(|_| layout.field(2))
            .collect();
        let hole_fields: Vec<_> = (0..hole_cells.len()).map(|_| layout.field(1)).collect();
        layout.finish()?;

        let initial = KwirkState {
            map,
            players,
            active: 0,
        };

        Ok(Self {
            name: name.into(),
            width,
            height,
            base,
            hole_cells,
            rotator_centers,
            initial_arms,
            player_count,
            max_frames: max_steps * (DELAY_MOVE + DELAY_SWITCH),
            initial,
            active_field,
            player_fields,
            block_fields,
            rotator_fields,
            hole_fields,
        })
    }

    fn idx(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    fn players_left(&self, state: &KwirkState) -> usize {
        (0..self.player_count)
            .filter(|&p| !state.players[p].exited())
            .count()
    }

    /// Hands the turn to the next non-exited player, updating the
    /// wall markers in the map.
    fn switch_players(&self, state: &mut KwirkState) {
        let p = state.players[state.active as usize];
        if !p.exited() {
            state.map[self.idx(p.x as u32, p.y as u32)] = CELL_WALL;
        }
        loop {
            state.active = (state.active + 1) % self.player_count as u8;
            if !state.players[state.active as usize].exited() {
                break;
            }
        }
        let p = state.players[state.active as usize];
        state.map[self.idx(p.x as u32, p.y as u32)] = 0;
    }

    /// Applies `action`, returning the successor and its delay, or
    /// `None` for an illegal move.
    fn perform(&self, state: &KwirkState, action: Action) -> Option<(KwirkState, Frame)> {
        let Some(dir) = action.dir() else {
            // Switch: meaningful only with another player to hand to.
            if self.players_left(state) < 2 {
                return None;
            }
            let mut next = state.clone();
            self.switch_players(&mut next);
            return Some((next, DELAY_SWITCH));
        };

        let p = state.players[state.active as usize];
        debug_assert!(!p.exited());
        let nx = (p.x as i32 + DX[dir]) as u32;
        let ny = (p.y as i32 + DY[dir]) as u32;
        let dcell = state.map[self.idx(nx, ny)];
        let dobj = dcell & OBJ_MASK;

        if dobj == OBJ_EXIT {
            let mut next = state.clone();
            next.players[next.active as usize] = PlayerPos { x: EXITED, y: EXITED };
            if self.players_left(&next) > 0 {
                self.switch_players(&mut next);
                return Some((next, DELAY_MOVE + DELAY_SWITCH));
            }
            return Some((next, DELAY_MOVE));
        }
        if dcell & CELL_MASK != 0 {
            return None; // wall or open hole
        }
        if dobj == 0 {
            let mut next = state.clone();
            next.players[next.active as usize] = PlayerPos {
                x: nx as u8,
                y: ny as u8,
            };
            return Some((next, DELAY_MOVE));
        }
        if dobj <= OBJ_BLOCK_MAX {
            return self.push_block(state, dir, nx, ny);
        }
        if dobj == OBJ_ROTATOR_CENTER {
            return None;
        }
        self.push_rotator(state, dir, nx, ny)
    }

    fn push_block(
        &self,
        state: &KwirkState,
        dir: usize,
        nx: u32,
        ny: u32,
    ) -> Option<(KwirkState, Frame)> {
        let map = &state.map;
        // Walk the border bits to the block's bounding box.
        let (mut x1, mut x2, mut y1, mut y2) = (nx, nx, ny, ny);
        while map[self.idx(x1, ny)] & OBJ_BLOCK_LEFT == 0 {
            x1 -= 1;
        }
        while map[self.idx(x2, ny)] & OBJ_BLOCK_RIGHT == 0 {
            x2 += 1;
        }
        while map[self.idx(nx, y1)] & OBJ_BLOCK_UP == 0 {
            y1 -= 1;
        }
        while map[self.idx(nx, y2)] & OBJ_BLOCK_DOWN == 0 {
            y2 += 1;
        }

        // The strip the block would move into must be clear. Holes are
        // fine; walls and objects are not.
        let blocked = |cell: u8| cell & (CELL_WALL | OBJ_MASK) != 0;
        match dir {
            0 => {
                for x in x1..=x2 {
                    if blocked(map[self.idx(x, y1 - 1)]) {
                        return None;
                    }
                }
            }
            1 => {
                for y in y1..=y2 {
                    if blocked(map[self.idx(x2 + 1, y)]) {
                        return None;
                    }
                }
            }
            2 => {
                for x in x1..=x2 {
                    if blocked(map[self.idx(x, y2 + 1)]) {
                        return None;
                    }
                }
            }
            _ => {
                for y in y1..=y2 {
                    if blocked(map[self.idx(x1 - 1, y)]) {
                        return None;
                    }
                }
            }
        }

        let mut next = state.clone();
        // Clear the vacated edge; the rest of the footprint is redrawn
        // below.
        match dir {
            0 | 2 => {
                for x in x1..=x2 {
                    next.map[self.idx(x, ny)] &= CELL_MASK;
                }
            }
            _ => {
                for y in y1..=y2 {
                    next.map[self.idx(nx, y)] &= CELL_MASK;
                }
            }
        }
        next.players[next.active as usize] = PlayerPos {
            x: nx as u8,
            y: ny as u8,
        };
        let x1 = (x1 as i32 + DX[dir]) as u32;
        let x2 = (x2 as i32 + DX[dir]) as u32;
        let y1 = (y1 as i32 + DY[dir]) as u32;
        let y2 = (y2 as i32 + DY[dir]) as u32;

        let all_holes = (y1..=y2)
            .all(|y| (x1..=x2).all(|x| next.map[self.idx(x, y)] & CELL_HOLE != 0));
        if all_holes {
            // The block drops in and fills the holes; both disappear.
            for y in y1..=y2 {
                for x in x1..=x2 {
                    next.map[self.idx(x, y)] = 0;
                }
            }
            return Some((next, DELAY_PUSH + DELAY_FILL));
        }

        for y in y1..=y2 {
            for x in x1..=x2 {
                let borders = (if y == y1 { OBJ_BLOCK_UP } else { 0 })
                    | (if x == x2 { OBJ_BLOCK_RIGHT } else { 0 })
                    | (if y == y2 { OBJ_BLOCK_DOWN } else { 0 })
                    | (if x == x1 { OBJ_BLOCK_LEFT } else { 0 });
                let i = self.idx(x, y);
                next.map[i] = (next.map[i] & CELL_MASK) | borders;
            }
        }
        Some((next, DELAY_PUSH))
    }

    fn push_rotator(
        &self,
        state: &KwirkState,
        dir: usize,
        nx: u32,
        ny: u32,
    ) -> Option<(KwirkState, Frame)> {
        let map = &state.map;
        let arm_dir = ((map[self.idx(nx, ny)] & OBJ_MASK) - OBJ_ROTATOR_UP) as usize;
        // Pushing along the arm's own axis does nothing.
        if arm_dir % 2 == dir % 2 {
            return None;
        }
        // Rotation direction: 1 quarter turn clockwise or 3 (= CCW).
        let dd = (dir + 4 - arm_dir) % 4;
        let back = (arm_dir + 2) % 4;
        let cx = (nx as i32 + DX[back]) as u32;
        let cy = (ny as i32 + DY[back]) as u32;

        let mut old_arms = [false; 4];
        let mut new_arms = [false; 4];
        for d in 0..4 {
            let (ax, ay) = ((cx as i32 + DX[d]) as u32, (cy as i32 + DY[d]) as u32);
            if map[self.idx(ax, ay)] & OBJ_MASK == OBJ_ROTATOR_UP + d as u8 {
                let d2 = (d + dd) % 4;
                old_arms[d] = true;
                new_arms[d2] = true;
                // The corner the arm sweeps through must be clear.
                let (kx, ky) = (
                    (cx as i32 + DX[d] + DX[d2]) as u32,
                    (cy as i32 + DY[d] + DY[d2]) as u32,
                );
                if map[self.idx(kx, ky)] & (CELL_WALL | OBJ_MASK) != 0 {
                    return None;
                }
                // The destination must be empty or another part of
                // this same rotator.
                let dest = map[self.idx((cx as i32 + DX[d2]) as u32, (cy as i32 + DY[d2]) as u32)];
                if dest & CELL_WALL != 0 {
                    return None;
                }
                let dest_obj = dest & OBJ_MASK;
                if dest_obj != OBJ_ROTATOR_UP + d2 as u8 && dest_obj != 0 {
                    return None;
                }
            }
        }

        let mut next = state.clone();
        for d in 0..4 {
            let i = self.idx((cx as i32 + DX[d]) as u32, (cy as i32 + DY[d]) as u32);
            if !old_arms[d] && new_arms[d] {
                next.map[i] = (next.map[i] & CELL_MASK) | (OBJ_ROTATOR_UP + d as u8);
            } else if old_arms[d] && !new_arms[d] {
                next.map[i] &= CELL_MASK;
            }
        }
        // If another arm swung into the pushed cell the player follows
        // the rotation one cell further.
        let (mut px, mut py) = (nx, ny);
        if next.map[self.idx(nx, ny)] != 0 {
            px = (nx as i32 + DX[dir]) as u32;
            py = (ny as i32 + DY[dir]) as u32;
        }
        next.players[next.active as usize] = PlayerPos {
            x: px as u8,
            y: py as u8,
        };
        Some((next, DELAY_ROTATE))
    }

    fn current_arms(&self, state: &KwirkState, rotator: usize) -> u8 {
        let (cx, cy) = self.rotator_centers[rotator];
        let mut arms = 0u8;
        for d in 0..4 {
            let (ax, ay) = (
                (cx as i32 + DX[d]) as u32,
                (cy as i32 + DY[d]) as u32,
            );
            if state.map[self.idx(ax, ay)] & OBJ_MASK == OBJ_ROTATOR_UP + d as u8 {
                arms |= 1 << d;
            }
        }
        arms
    }
}

impl Problem for Kwirk {
    type State = KwirkState;
    type Step = Action;

    fn name(&self) -> &str {
        &self.name
    }

    fn max_frames(&self) -> Frame {
        self.max_frames
    }

    fn initial_states(&self) -> Vec<KwirkState> {
        vec![self.initial.clone()]
    }

    fn compress(&self, state: &KwirkState) -> CompressedState {
        let mut data = 0u128;
        self.active_field.set(&mut data, state.active as u32);
        for (p, &(fx, fy, fexit)) in self.player_fields.iter().enumerate() {
            let player = state.players[p];
            if player.exited() {
                fexit.set(&mut data, 1);
            } else {
                fx.set(&mut data, player.x as u32 - 1);
                fy.set(&mut data, player.y as u32 - 1);
            }
        }

        // Blocks in scan order of their top-left corner; vacant slots
        // (blocks swallowed by holes) are filled with all-ones.
        let mut slot = 0usize;
        for y in 1..self.height - 1 {
            for x in 1..self.width - 1 {
                let cell = state.map[self.idx(x, y)];
                if cell & OBJ_MASK != 0
                    && cell & OBJ_MASK <= OBJ_BLOCK_MAX
                    && cell & (OBJ_BLOCK_UP | OBJ_BLOCK_LEFT) == (OBJ_BLOCK_UP | OBJ_BLOCK_LEFT)
                {
                    let mut x2 = x;
                    while state.map[self.idx(x2, y)] & OBJ_BLOCK_RIGHT == 0 {
                        x2 += 1;
                    }
                    let mut y2 = y;
                    while state.map[self.idx(x, y2)] & OBJ_BLOCK_DOWN == 0 {
                        y2 += 1;
                    }
                    debug_assert!(slot < self.block_fields.len(), "more blocks than slots");
                    let f = self.block_fields[slot];
                    f.x.set(&mut data, x - 1);
                    f.y.set(&mut data, y - 1);
                    f.w.set(&mut data, x2 - x);
                    f.h.set(&mut data, y2 - y);
                    slot += 1;
                }
            }
        }
        for vacant in slot..self.block_fields.len() {
            let f = self.block_fields[vacant];
            f.x.set(&mut data, f.x.ones());
            f.y.set(&mut data, f.y.ones());
            f.w.set(&mut data, f.w.ones());
            f.h.set(&mut data, f.h.ones());
        }

        // Rotators: smallest quarter-turn count that maps the initial
        // arm mask onto the current one, so symmetric rotators stay
        // canonical.
        for (r, field) in self.rotator_fields.iter().enumerate() {
            let current = self.current_arms(state, r);
            let turns = (0..4).find(|&t| rotate_mask(self.initial_arms[r], t) == current);
            debug_assert!(turns.is_some(), "rotator arms out of shape");
            field.set(&mut data, turns.unwrap_or(0));
        }

        for (h, field) in self.hole_fields.iter().enumerate() {
            let (x, y) = self.hole_cells[h];
            let open = state.map[self.idx(x as u32, y as u32)] & CELL_MASK == CELL_HOLE;
            field.set(&mut data, open as u32);
        }

        CompressedState::from_data(data)
    }

    fn decompress(&self, cs: &CompressedState) -> KwirkState {
        let data = cs.data();
        let mut map = self.base.clone();

        for (h, field) in self.hole_fields.iter().enumerate() {
            if field.get(data) == 1 {
                let (x, y) = self.hole_cells[h];
                map[self.idx(x as u32, y as u32)] = CELL_HOLE;
            }
        }

        for f in &self.block_fields {
            let x = f.x.get(data);
            if x == f.x.ones() {
                continue; // swallowed by a hole
            }
            let x1 = x + 1;
            let y1 = f.y.get(data) + 1;
            let x2 = x1 + f.w.get(data);
            let y2 = y1 + f.h.get(data);
            for y in y1..=y2 {
                for x in x1..=x2 {
                    let borders = (if y == y1 { OBJ_BLOCK_UP } else { 0 })
                        | (if x == x2 { OBJ_BLOCK_RIGHT } else { 0 })
                        | (if y == y2 { OBJ_BLOCK_DOWN } else { 0 })
                        | (if x == x1 { OBJ_BLOCK_LEFT } else { 0 });
                    let i = self.idx(x, y);
                    map[i] = (map[i] & CELL_MASK) | borders;
                }
            }
        }

        for (r, field) in self.rotator_fields.iter().enumerate() {
            let (cx, cy) = self.rotator_centers[r];
            let i = self.idx(cx as u32, cy as u32);
            map[i] = (map[i] & CELL_MASK) | OBJ_ROTATOR_CENTER;
            let arms = rotate_mask(self.initial_arms[r], field.get(data));
            for d in 0..4 {
                if arms & (1 << d) != 0 {
                    let ai = self.idx(
                        (cx as i32 + DX[d]) as u32,
                        (cy as i32 + DY[d]) as u32,
                    );
                    map[ai] = (map[ai] & CELL_MASK) | (OBJ_ROTATOR_UP + d as u8);
                }
            }
        }

        let active = self.active_field.get(data) as u8;
        let mut players = [PlayerPos { x: EXITED, y: EXITED }; MAX_PLAYERS];
        for (p, &(fx, fy, fexit)) in self.player_fields.iter().enumerate() {
            if fexit.get(data) == 0 {
                players[p] = PlayerPos {
                    x: (fx.get(data) + 1) as u8,
                    y: (fy.get(data) + 1) as u8,
                };
                if p != active as usize {
                    let i = self.idx(players[p].x as u32, players[p].y as u32);
                    map[i] = CELL_WALL;
                }
            }
        }

        KwirkState {
            map,
            players,
            active,
        }
    }

    fn is_finish(&self, state: &KwirkState) -> bool {
        self.players_left(state) == 0
    }

    fn expand(&self, state: &KwirkState, visit: &mut dyn FnMut(Action, &KwirkState, Frame)) {
        for action in Action::ALL {
            if let Some((child, delay)) = self.perform(state, action) {
                visit(action, &child, delay);
            }
        }
    }

    fn apply(&self, state: &KwirkState, step: Action) -> Option<(KwirkState, Frame)> {
        self.perform(state, step)
    }

    fn state_to_string(&self, state: &KwirkState) -> String {
        let mut out = String::with_capacity(((self.width + 1) * self.height) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let cell = state.map[self.idx(x, y)];
                let c = match cell & OBJ_MASK {
                    0 => match cell & CELL_MASK {
                        0 => ' ',
                        CELL_WALL => '#',
                        _ => 'O',
                    },
                    OBJ_EXIT => 'X',
                    OBJ_ROTATOR_CENTER => '+',
                    o if o == OBJ_ROTATOR_UP => '^',
                    o if o == OBJ_ROTATOR_UP + 1 => '>',
                    o if o == OBJ_ROTATOR_UP + 2 => 'v',
                    o if o == OBJ_ROTATOR_UP + 3 => '<',
                    _ => 'x',
                };
                out.push(c);
            }
            out.push('\n');
        }
        for p in 0..self.player_count {
            let player = state.players[p];
            if !player.exited() {
                let pos = (player.y as u32 * (self.width + 1) + player.x as u32) as usize;
                let marker = if p == state.active as usize { '@' } else { '&' };
                out.replace_range(pos..pos + 1, &marker.to_string());
            }
        }
        out
    }
}
