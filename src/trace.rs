//! Backward reconstruction of the move path once a finish is found.
//!
//! The tracer holds a target (state, frame) pair and walks the closed
//! files downward: every candidate parent is re-expanded and checked
//! against the target. A hit replaces the target with the parent and
//! records the move. Progress is checkpointed before each descent so
//! an interrupted trace resumes instead of restarting.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::compressed::{CompressedState, Frame, FrameGroup, FRAMES_PER_GROUP};
use crate::disk::{rename, BufferedInputStream};
use crate::problem::Problem;
use crate::search::Session;
use crate::workers::WorkerPool;

/// On-disk checkpoint: the group the target was closed in, the target
/// record (subframe included, so its frame is recoverable), and the
/// steps already recovered, finish side first.
#[derive(Serialize, Deserialize)]
struct PartialTrace<S> {
    group: FrameGroup,
    target: [u8; CompressedState::BYTES],
    steps: Vec<S>,
}

fn save_partial<P: Problem>(
    session: &Session<P>,
    group: FrameGroup,
    target: CompressedState,
    steps: &[P::Step],
) -> Result<()> {
    let tmp = session.names.partial_solution_new();
    {
        let file = File::create(&tmp).context("creating trace checkpoint")?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(
            &mut writer,
            &PartialTrace::<P::Step> {
                group,
                target: target.to_le_bytes(),
                steps: steps.to_vec(),
            },
        )
        .context("writing trace checkpoint")?;
        writer.flush()?;
    }
    rename(&tmp, &session.names.partial_solution())
}

fn load_partial<P: Problem>(session: &Session<P>) -> Result<(FrameGroup, CompressedState, Vec<P::Step>)> {
    let file =
        File::open(session.names.partial_solution()).context("opening trace checkpoint")?;
    let partial: PartialTrace<P::Step> =
        bincode::deserialize_from(BufReader::new(file)).context("reading trace checkpoint")?;
    Ok((
        partial.group,
        CompressedState::from_le_bytes(partial.target),
        partial.steps,
    ))
}

/// Scans one closed file for a parent whose expansion reaches the
/// target at exactly the target frame.
fn find_parent<P: Problem>(
    session: &Session<P>,
    group: FrameGroup,
    target: CompressedState,
    target_frame: Frame,
) -> Result<Option<(CompressedState, Frame, P::Step)>> {
    let found_flag = Arc::new(AtomicBool::new(false));
    let found: Arc<Mutex<Option<(CompressedState, Frame, P::Step)>>> =
        Arc::new(Mutex::new(None));

    let problem = Arc::clone(&session.problem);
    let flag = Arc::clone(&found_flag);
    let slot = Arc::clone(&found);
    let pool = WorkerPool::start(
        session.cfg.workers(),
        session.cfg.process_queue_len,
        Arc::new(move |cs: CompressedState| {
            if flag.load(Ordering::Relaxed) {
                return Ok(());
            }
            let parent = problem.decompress(&cs);
            let parent_frame = cs.frame(group);
            let mut hit = None;
            problem.expand(&parent, &mut |step, child, delay| {
                if hit.is_none()
                    && parent_frame + delay == target_frame
                    && problem.compress(child) == target
                {
                    hit = Some(step);
                }
            });
            if let Some(step) = hit {
                let mut guard = slot
                    .lock()
                    .map_err(|_| anyhow!("trace result lock poisoned"))?;
                if guard.is_none() {
                    *guard = Some((cs, parent_frame, step));
                    flag.store(true, Ordering::Relaxed);
                }
            }
            Ok(())
        }),
    );

    let mut input =
        BufferedInputStream::open(session.names.closed(group), session.cfg.buffer_records)?;
    while let Some(cs) = input.read()? {
        pool.process(cs)?;
        if found_flag.load(Ordering::Relaxed) {
            break;
        }
    }
    pool.drain()?;
    let result = found
        .lock()
        .map_err(|_| anyhow!("trace result lock poisoned"))?
        .take();
    Ok(result)
}

/// Traces the path from a finish state back to an initial state and
/// writes the solution file. `start` is the freshly found finish; pass
/// `None` to resume from the on-disk checkpoint.
pub fn trace_exit<P: Problem>(
    session: &Session<P>,
    start: Option<(P::State, Frame)>,
) -> Result<()> {
    let (mut target, mut target_frame, mut steps) =
        if session.names.partial_solution().exists() {
            info!("resuming exit trace");
            let (group, target, steps) = load_partial(session)?;
            let frame = target.frame(group);
            (target, frame, steps)
        } else {
            let (state, frame) = start.context("no finish state to trace")?;
            let mut cs = session.problem.compress(&state);
            cs.set_subframe(frame);
            (cs, frame, Vec::new())
        };

    let initials: Vec<CompressedState> = session
        .problem
        .initial_states()
        .iter()
        .map(|s| session.problem.compress(s))
        .collect();

    loop {
        if target_frame == 0 && initials.iter().any(|i| *i == target) {
            break;
        }
        let target_group = target_frame / FRAMES_PER_GROUP;
        save_partial(session, target_group, target, &steps)?;

        // A parent may share the target's own group; search it first,
        // then walk down.
        let mut parent = None;
        for g in (0..=target_group).rev() {
            if !session.names.closed(g).exists() {
                continue;
            }
            info!("tracing through group {g}");
            parent = find_parent(session, g, target, target_frame)?;
            if parent.is_some() {
                break;
            }
        }
        let Some((parent_cs, parent_frame, step)) = parent else {
            bail!("lost parent node while tracing frame {target_frame}");
        };
        info!("found parent at frame {parent_frame}");
        steps.push(step);
        target = parent_cs;
        target_frame = parent_frame;
    }

    let initial = session.problem.decompress(&target);
    write_solution(session, &initial, &steps, true)?;
    std::fs::remove_file(session.names.partial_solution()).ok();
    info!("solution written to {}", session.names.solution().display());
    Ok(())
}

/// Replays `steps` (stored finish side first) from `start` and writes
/// the solution file: each move name followed by the resulting state.
pub fn write_solution<P: Problem>(
    session: &Session<P>,
    start: &P::State,
    steps: &[P::Step],
    expect_finish: bool,
) -> Result<()> {
    let file = File::create(session.names.solution()).context("creating solution file")?;
    let mut out = BufWriter::new(file);
    let mut state = start.clone();
    if steps.is_empty() {
        write!(out, "{}", session.problem.state_to_string(&state))?;
    }
    for step in steps.iter().rev() {
        let (next, _delay) = session
            .problem
            .apply(&state, *step)
            .with_context(|| format!("solution replay failed at step {step}"))?;
        writeln!(out, "{step}")?;
        write!(out, "{}", session.problem.state_to_string(&next))?;
        state = next;
    }
    out.flush()?;
    if expect_finish {
        ensure!(
            session.problem.is_finish(&state),
            "replayed solution does not end at a finish state"
        );
    }
    Ok(())
}

/// The `write-partial-solution` command: renders the checkpointed
/// trace so far (target up to the finish) without resuming the search.
pub fn write_partial_solution<P: Problem>(session: &Session<P>) -> Result<()> {
    ensure!(
        session.names.partial_solution().exists(),
        "partial trace checkpoint ({}) not found",
        session.names.partial_solution().display()
    );
    let (_group, target, steps) = load_partial(session)?;
    let state = session.problem.decompress(&target);
    write_solution(session, &state, &steps, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::disk::FileNames;
    use crate::maze::{Dir, Maze, MazeState, SAMPLE_LEVEL};

    fn session(tag: &str) -> Session<Maze> {
        let dir = std::env::temp_dir().join(format!("kwirk_trace_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let maze = Maze::parse("maze", SAMPLE_LEVEL).unwrap();
        let cfg = Config {
            ram_size: 4096,
            threads: 1,
            ..Config::default()
        };
        Session::new(maze, cfg, FileNames::new(dir, "maze"))
    }

    #[test]
    fn partial_checkpoint_round_trips() {
        let s = session("roundtrip");
        let mut target = s.problem.compress(&MazeState { x: 3, y: 5 });
        target.set_subframe(23);
        let steps = vec![Dir::Up, Dir::Left, Dir::Left];

        save_partial(&s, 2, target, &steps).unwrap();
        let (group, loaded, loaded_steps) = load_partial(&s).unwrap();
        assert_eq!(group, 2);
        assert_eq!(loaded.data(), target.data());
        assert_eq!(loaded.subframe(), 3);
        // The target frame is recoverable from group and subframe.
        assert_eq!(loaded.frame(group), 23);
        assert_eq!(loaded_steps, steps);

        // A second save replaces the checkpoint atomically.
        save_partial(&s, 1, target, &steps[..1]).unwrap();
        let (group, _, loaded_steps) = load_partial(&s).unwrap();
        assert_eq!(group, 1);
        assert_eq!(loaded_steps, vec![Dir::Up]);
        std::fs::remove_dir_all(s.names.dir()).unwrap();
    }

    #[test]
    fn write_partial_solution_replays_the_checkpoint() {
        let s = session("wps");
        // One step short of the finish: (13,12) then Down onto F.
        let mut target = s.problem.compress(&MazeState { x: 13, y: 12 });
        target.set_subframe(47);
        save_partial(&s, 4, target, &[Dir::Down]).unwrap();

        write_partial_solution(&s).unwrap();
        let text = std::fs::read_to_string(s.names.solution()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Down"));
        // The visualization after the move shows the player on the
        // finish cell.
        let row13: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(row13[13].chars().nth(13), Some('@'));
        std::fs::remove_dir_all(s.names.dir()).unwrap();
    }
}
