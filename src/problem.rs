//! The boundary between the search engine and the puzzle semantics.
//!
//! The engine never looks inside a state: it moves fixed-width
//! compressed records between disk and the worker pool and asks the
//! problem to compress, decompress, expand and recognize finishes.

use std::fmt::{Debug, Display};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::compressed::{CompressedState, Frame};

pub trait Problem: Send + Sync + 'static {
    /// Decompressed in-memory state.
    type State: Clone + PartialEq + Send;

    /// One move, as recorded in solutions and checkpoints.
    type Step: Copy + Send + Serialize + DeserializeOwned + Display + Debug;

    /// Prefix for every working file of this problem instance.
    fn name(&self) -> &str;

    /// Upper bound on the total delay of any solution; sizes the
    /// frame-group arrays.
    fn max_frames(&self) -> Frame;

    /// The states that populate frame 0 (one to four, typically).
    fn initial_states(&self) -> Vec<Self::State>;

    /// Bit-exact packing. `decompress(compress(s)) == s` must hold for
    /// every reachable state; the subframe tag is not the problem's
    /// concern.
    fn compress(&self, state: &Self::State) -> CompressedState;

    fn decompress(&self, cs: &CompressedState) -> Self::State;

    fn is_finish(&self, state: &Self::State) -> bool;

    /// Invokes `visit(step, child, delay)` for every legal move;
    /// `delay` is strictly positive.
    fn expand(&self, state: &Self::State, visit: &mut dyn FnMut(Self::Step, &Self::State, Frame));

    /// Applies one step, returning the successor and its delay, or
    /// `None` when the step is not legal in `state`. Used to replay
    /// solutions.
    fn apply(&self, state: &Self::State, step: Self::Step) -> Option<(Self::State, Frame)>;

    /// Textual visualization for dump/sample/solution output.
    fn state_to_string(&self, state: &Self::State) -> String;
}
