// src/motion/buffer.rs - Look-ahead block ring
//
// Fixed-size ring of planned-move blocks. Slot ownership is the backing
// array; neighbors are index links so no pointer ever crosses the
// exec-tier boundary. The producer side only writes the
// Empty -> Loading -> Queued transitions; the exec tier only writes
// Queued/Pending -> Running -> Empty. Those state transitions are the
// whole synchronization story.

use super::AXES;

/// Slot lifecycle inside the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferState {
    #[default]
    Empty,
    /// Checked out for writing, not yet committed.
    Loading,
    Queued,
    /// Marked as the next block to run.
    Pending,
    Running,
}

/// Per-block and per-section execution state. The runtime reuses the same
/// enum for its section sub-state (New/Run1/Run2 within Head/Body/Tail).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum MoveState {
    #[default]
    Off,
    New,
    Run,
    Run1,
    Run2,
    Head,
    Body,
    Tail,
}

/// Dispatch tag for a committed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveType {
    #[default]
    None,
    /// Linear move with no accel/decel planning.
    Line,
    /// Accelerated (jerk-planned) linear move.
    Aline,
    Dwell,
    MCode,
    Tool,
    SpindleSpeed,
}

/// One planned Cartesian move.
///
/// Velocity fields come in two flavors: the `*_vmax` caps computed at
/// submit time and never changed by replanning, and the working
/// entry/cruise/exit triple the planner rewrites on every pass while the
/// block is replannable.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub line_number: u32,
    /// Ring neighbors, fixed at init and preserved by clear/copy.
    pub prev: usize,
    pub next: usize,

    pub buffer_state: BufferState,
    pub move_type: MoveType,
    /// Opaque code for non-motion blocks (M code, tool index).
    pub move_code: u8,
    pub move_state: MoveState,
    pub replannable: bool,
    /// Feedhold release gate; the executor refuses to start this block
    /// until the hold is released.
    pub hold_point: bool,

    pub target: [f64; AXES],
    pub unit: [f64; AXES],

    /// Line/dwell duration in minutes (dwells store seconds, spindle
    /// speed blocks ride their rpm here).
    pub time: f64,
    pub length: f64,
    pub head_length: f64,
    pub body_length: f64,
    pub tail_length: f64,

    pub entry_velocity: f64,
    pub cruise_velocity: f64,
    pub exit_velocity: f64,

    pub entry_vmax: f64,
    pub cruise_vmax: f64,
    pub exit_vmax: f64,
    /// Maximum velocity change achievable over `length` under the jerk
    /// limit.
    pub delta_vmax: f64,
    pub braking_velocity: f64,

    pub jerk: f64,
    pub recip_jerk: f64,
    pub cubert_jerk: f64,
}

impl Block {
    /// Zero the payload while keeping the ring links intact.
    fn reset(&mut self) {
        let prev = self.prev;
        let next = self.next;
        *self = Block::default();
        self.prev = prev;
        self.next = next;
    }
}

/// The block ring with its three cursors.
///
/// `w` is the next slot to check out for writing, `q` the next slot to
/// commit, `r` the current running slot. `w` advances on checkout, `q` on
/// commit, `r` on completion; `w == r` with an empty `r` slot means the
/// queue is idle.
#[derive(Debug)]
pub struct BlockRing {
    blocks: Vec<Block>,
    w: usize,
    q: usize,
    r: usize,
}

impl BlockRing {
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        let mut ring = Self {
            blocks: vec![Block::default(); size],
            w: 0,
            q: 0,
            r: 0,
        };
        ring.init();
        ring
    }

    /// Reset every slot and rewind the cursors. Links are rebuilt, so this
    /// also serves as the flush path.
    pub fn init(&mut self) {
        let size = self.blocks.len();
        for (i, block) in self.blocks.iter_mut().enumerate() {
            *block = Block::default();
            block.next = (i + 1) % size;
            block.prev = (i + size - 1) % size;
        }
        self.w = 0;
        self.q = 0;
        self.r = 0;
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, idx: usize) -> &Block {
        &self.blocks[idx]
    }

    pub fn block_mut(&mut self, idx: usize) -> &mut Block {
        &mut self.blocks[idx]
    }

    pub fn next_of(&self, idx: usize) -> usize {
        self.blocks[idx].next
    }

    pub fn prev_of(&self, idx: usize) -> usize {
        self.blocks[idx].prev
    }

    /// True if a write slot is available. The last empty slot is held in
    /// reserve so that `w == r` always means an idle queue.
    pub fn test_write(&self) -> bool {
        self.blocks[self.w].buffer_state == BufferState::Empty
            && !(self.blocks[self.w].next == self.r
                && self.blocks[self.r].buffer_state != BufferState::Empty)
    }

    /// Check out the next write slot, zero-filled. Returns `None` under
    /// back-pressure (next slot not yet freed by the executor).
    pub fn checkout_write(&mut self) -> Option<usize> {
        if !self.test_write() {
            return None;
        }
        let idx = self.w;
        self.blocks[idx].reset();
        self.blocks[idx].buffer_state = BufferState::Loading;
        self.w = self.blocks[idx].next;
        Some(idx)
    }

    /// Back out of a checkout without committing. Rewinds `w` and frees
    /// the slot.
    pub fn release_write(&mut self) {
        self.w = self.blocks[self.w].prev;
        self.blocks[self.w].buffer_state = BufferState::Empty;
    }

    /// Commit the oldest loading slot to the queue, stamping its type.
    pub fn commit_write(&mut self, move_type: MoveType) {
        let idx = self.q;
        self.blocks[idx].move_type = move_type;
        self.blocks[idx].move_state = MoveState::New;
        self.blocks[idx].buffer_state = BufferState::Queued;
        self.q = self.blocks[idx].next;
    }

    /// Promote and return the run slot. Re-entrant: while the slot stays
    /// `Running`, repeated calls return the same block, which is what the
    /// segment continuations rely on.
    pub fn get_run(&mut self) -> Option<usize> {
        let state = self.blocks[self.r].buffer_state;
        if state == BufferState::Queued || state == BufferState::Pending {
            self.blocks[self.r].buffer_state = BufferState::Running;
        }
        if self.blocks[self.r].buffer_state == BufferState::Running {
            return Some(self.r);
        }
        None
    }

    /// Free the run slot and advance. Returns true when this emptied the
    /// queue (the caller ends the cycle).
    pub fn free_run(&mut self) -> bool {
        let idx = self.r;
        self.blocks[idx].reset();
        self.blocks[idx].buffer_state = BufferState::Empty;
        self.r = self.blocks[idx].next;
        if self.blocks[self.r].buffer_state == BufferState::Queued {
            self.blocks[self.r].buffer_state = BufferState::Pending;
        }
        self.w == self.r
    }

    /// The running block, if any.
    pub fn first(&mut self) -> Option<usize> {
        self.get_run()
    }

    /// The last committed block in the list: the one whose successor is
    /// still `Off`.
    pub fn last(&mut self) -> Option<usize> {
        let first = self.get_run()?;
        let mut bp = first;
        loop {
            let next = self.blocks[bp].next;
            if self.blocks[next].move_state == MoveState::Off || next == first {
                return Some(bp);
            }
            bp = next;
            if bp == first {
                return Some(bp);
            }
        }
    }

    /// Zero a slot's payload, keeping links.
    pub fn clear_block(&mut self, idx: usize) {
        self.blocks[idx].reset();
    }

    /// Copy `src`'s payload into `dst`, keeping `dst`'s links.
    pub fn copy_block(&mut self, dst: usize, src: usize) {
        let prev = self.blocks[dst].prev;
        let next = self.blocks[dst].next;
        self.blocks[dst] = self.blocks[src].clone();
        self.blocks[dst].prev = prev;
        self.blocks[dst].next = next;
    }

    /// Snapshot of the occupied slots in ring order starting at `r`, for
    /// diagnostics and tests.
    pub fn occupied(&self) -> Vec<Block> {
        let mut out = Vec::new();
        let mut idx = self.r;
        for _ in 0..self.blocks.len() {
            if self.blocks[idx].buffer_state != BufferState::Empty {
                out.push(self.blocks[idx].clone());
            }
            idx = self.blocks[idx].next;
        }
        out
    }
}
