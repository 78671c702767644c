//! End-to-end scenarios for the disk search driver, run over the
//! built-in sample maze in scratch directories.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use kwirk_atlas::compressed::CompressedState;
use kwirk_atlas::config::Config;
use kwirk_atlas::disk::{BufferedInputStream, BufferedOutputStream, FileNames};
use kwirk_atlas::maze::{Dir, Maze, MazeState, SAMPLE_LEVEL};
use kwirk_atlas::problem::Problem;
use kwirk_atlas::search::{Outcome, Session};

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "kwirk_scenario_{tag}_{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A small configuration that forces multi-chunk sorts and keeps the
/// cache tiny.
fn test_config() -> Config {
    Config {
        ram_size: 4096,
        threads: 3,
        nodes_per_hash: 2,
        buffer_records: 8,
        all_buffer_records: 8,
        merge_buffer_records: 4,
        process_queue_len: 64,
        open_bytes_limit: 0,
        use_all: false,
    }
}

fn sample_maze() -> Maze {
    Maze::parse("maze", SAMPLE_LEVEL).unwrap()
}

fn maze_session(dir: &PathBuf, cfg: Config) -> Session<Maze> {
    let maze = sample_maze();
    let names = FileNames::new(dir.clone(), maze.name().to_string());
    Session::new(maze, cfg, names)
}

/// Reference shortest distance by plain in-memory BFS.
fn bfs_distance(maze: &Maze) -> u32 {
    let mut seen: HashMap<(u32, u32), u32> = HashMap::new();
    let mut queue = VecDeque::new();
    for s in maze.initial_states() {
        seen.insert((s.x, s.y), 0);
        queue.push_back(s);
    }
    while let Some(s) = queue.pop_front() {
        let d = seen[&(s.x, s.y)];
        if maze.is_finish(&s) {
            return d;
        }
        maze.expand(&s, &mut |_, child, delay| {
            assert_eq!(delay, 1);
            if !seen.contains_key(&(child.x, child.y)) {
                seen.insert((child.x, child.y), d + 1);
                queue.push_back(child.clone());
            }
        });
    }
    panic!("sample maze has no solution");
}

/// Reads the solution file back into a move list.
fn solution_steps(dir: &PathBuf) -> Vec<Dir> {
    let text = std::fs::read_to_string(dir.join("maze-solution.txt")).unwrap();
    text.lines()
        .filter_map(|line| match line {
            "Up" => Some(Dir::Up),
            "Right" => Some(Dir::Right),
            "Down" => Some(Dir::Down),
            "Left" => Some(Dir::Left),
            _ => None,
        })
        .collect()
}

/// Replays moves from one of the initial states; true when some
/// start reaches a finish through exactly these moves.
fn replay_reaches_finish(maze: &Maze, steps: &[Dir]) -> bool {
    'starts: for start in maze.initial_states() {
        let mut state = start;
        for &step in steps {
            match maze.apply(&state, step) {
                Some((next, _)) => state = next,
                None => continue 'starts,
            }
        }
        if maze.is_finish(&state) {
            return true;
        }
    }
    false
}

#[test]
fn search_solves_the_sample_maze() {
    let dir = scratch_dir("solve");
    let session = maze_session(&dir, test_config());
    let outcome = session.search(None).unwrap();
    assert_eq!(outcome, Outcome::Ok);

    let maze = sample_maze();
    let steps = solution_steps(&dir);
    assert!(!steps.is_empty(), "first line should list the first move");
    assert_eq!(steps.len() as u32, bfs_distance(&maze));
    assert!(replay_reaches_finish(&maze, &steps));
    // The trace checkpoint is consumed on success.
    assert!(!dir.join("maze-solution.bin").exists());
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn search_with_all_file_finds_the_same_solution() {
    let dir = scratch_dir("use_all");
    let mut cfg = test_config();
    cfg.use_all = true;
    let session = maze_session(&dir, cfg);
    assert_eq!(session.search(None).unwrap(), Outcome::Ok);

    let maze = sample_maze();
    let steps = solution_steps(&dir);
    assert_eq!(steps.len() as u32, bfs_distance(&maze));
    assert!(replay_reaches_finish(&maze, &steps));
    // The consolidated union exists for the last completed group.
    let has_all = (0..session.max_groups).any(|g| session.names.all(g).exists());
    assert!(has_all);
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn resume_uses_an_existing_merged_file_without_resorting() {
    let dir = scratch_dir("resume");

    // First run: complete groups 0 and 1 only.
    {
        let session = maze_session(&dir, test_config());
        assert_eq!(session.search(Some(2)).unwrap(), Outcome::NotFound);
    }
    assert!(dir.join("maze-closed-0x.bin").exists());
    assert!(dir.join("maze-closed-1x.bin").exists());
    assert!(dir.join("maze-open-2x.bin").exists());

    // Simulate the crash layout: merged-2x alongside open-2x.
    {
        let session = maze_session(&dir, test_config());
        session.sort_and_merge(2).unwrap();
    }
    assert!(dir.join("maze-merged-2x.bin").exists());
    // Empty the open file: if the resumed run wrongly re-sorted it,
    // the frontier would be lost and the search would fail.
    std::fs::write(dir.join("maze-open-2x.bin"), []).unwrap();

    let session = maze_session(&dir, test_config());
    assert_eq!(session.search(None).unwrap(), Outcome::Ok);
    let maze = sample_maze();
    let steps = solution_steps(&dir);
    assert_eq!(steps.len() as u32, bfs_distance(&maze));
    assert!(replay_reaches_finish(&maze, &steps));
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn duplicate_subframes_collapse_to_the_smallest() {
    let dir = scratch_dir("dups");
    let session = maze_session(&dir, test_config());
    let maze = sample_maze();
    let cs = maze.compress(&MazeState { x: 3, y: 5 });

    session.open.enqueue(cs, 7).unwrap();
    session.open.enqueue(cs, 3).unwrap();
    session.open.close_group(0).unwrap();
    session.sort_and_merge(0).unwrap();

    let mut merged = BufferedInputStream::open(session.names.merged(0), 8).unwrap();
    let record = merged.read().unwrap().unwrap();
    assert_eq!(record.data(), cs.data());
    assert_eq!(record.subframe(), 3);
    assert!(merged.read().unwrap().is_none());
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn filter_removes_states_already_closed() {
    let dir = scratch_dir("filter");
    let session = maze_session(&dir, test_config());
    let maze = sample_maze();

    // Ten distinct states; four of them already closed in earlier
    // groups.
    let cells: Vec<MazeState> = (1..11).map(|y| MazeState { x: 1, y }).collect();
    let mut sorted: Vec<CompressedState> = cells.iter().map(|s| maze.compress(s)).collect();
    sorted.sort();

    let write_sorted = |path: PathBuf, records: &[CompressedState]| {
        let mut out = BufferedOutputStream::create(path, 8).unwrap();
        for &cs in records {
            out.write(cs).unwrap();
        }
        out.flush().unwrap();
    };
    write_sorted(session.names.closed(2), &[sorted[0], sorted[4]]);
    write_sorted(session.names.closed(3), &[sorted[1], sorted[7]]);
    for &cs in &sorted {
        session.open.enqueue(cs, 55).unwrap();
    }
    session.open.close_group(5).unwrap();

    let outcome = session.seq_filter_open(5, 6).unwrap();
    assert_eq!(outcome, Outcome::Ok);

    let mut filtered = BufferedInputStream::open(session.names.open(5), 8).unwrap();
    assert_eq!(filtered.size(), 6);
    let excluded = [sorted[0], sorted[1], sorted[4], sorted[7]];
    while let Some(cs) = filtered.read().unwrap() {
        assert!(!excluded.contains(&cs));
    }
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn finish_at_frame_zero_yields_an_empty_solution() {
    // A problem whose single initial state is already a finish.
    struct Trivial;

    #[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
    enum NoStep {}

    impl std::fmt::Display for NoStep {
        fn fmt(&self, _f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match *self {}
        }
    }

    impl Problem for Trivial {
        type State = u8;
        type Step = NoStep;

        fn name(&self) -> &str {
            "trivial"
        }
        fn max_frames(&self) -> u32 {
            10
        }
        fn initial_states(&self) -> Vec<u8> {
            vec![0]
        }
        fn compress(&self, state: &u8) -> CompressedState {
            CompressedState::from_data(*state as u128)
        }
        fn decompress(&self, cs: &CompressedState) -> u8 {
            cs.data() as u8
        }
        fn is_finish(&self, _state: &u8) -> bool {
            true
        }
        fn expand(&self, _state: &u8, _visit: &mut dyn FnMut(NoStep, &u8, u32)) {}
        fn apply(&self, _state: &u8, step: NoStep) -> Option<(u8, u32)> {
            match step {}
        }
        fn state_to_string(&self, state: &u8) -> String {
            format!("state {state}\n")
        }
    }

    let dir = scratch_dir("frame_zero");
    let names = FileNames::new(dir.clone(), "trivial");
    let session = Session::new(Trivial, test_config(), names);
    assert_eq!(session.search(None).unwrap(), Outcome::Ok);

    let solution = std::fs::read_to_string(dir.join("trivial-solution.txt")).unwrap();
    assert_eq!(solution, "state 0\n");
    assert!(!dir.join("trivial-solution.bin").exists());
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn stop_file_interrupts_and_search_resumes_after() {
    let dir = scratch_dir("stop");
    std::fs::write(dir.join("maze-stop.txt"), "").unwrap();

    {
        let session = maze_session(&dir, test_config());
        assert_eq!(session.search(None).unwrap(), Outcome::Stop);
    }
    // The sentinel is consumed and the first group is already closed.
    assert!(!dir.join("maze-stop.txt").exists());
    assert!(dir.join("maze-closed-0x.bin").exists());
    assert!(!dir.join("maze-solution.txt").exists());

    let session = maze_session(&dir, test_config());
    assert_eq!(session.search(None).unwrap(), Outcome::Ok);
    let maze = sample_maze();
    let steps = solution_steps(&dir);
    assert_eq!(steps.len() as u32, bfs_distance(&maze));
    assert!(replay_reaches_finish(&maze, &steps));
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn closed_files_pass_verify_after_a_search() {
    let dir = scratch_dir("verify");
    let session = maze_session(&dir, test_config());
    assert_eq!(session.search(None).unwrap(), Outcome::Ok);

    for g in 0..session.max_groups {
        let path = session.names.closed(g);
        if !path.exists() {
            continue;
        }
        // The verify command accepts every closed file.
        let outcome = session.verify(path.to_str().unwrap()).unwrap();
        assert_eq!(outcome, Outcome::Ok);

        // And the invariants it reports on actually hold.
        let mut input = BufferedInputStream::open(&path, 8).unwrap();
        let mut prev: Option<CompressedState> = None;
        while let Some(cs) = input.read().unwrap() {
            if let Some(p) = prev {
                assert!(p < cs, "closed file must be strictly sorted");
            }
            assert!(cs.subframe() < 10);
            prev = Some(cs);
        }
    }
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn verify_flags_corrupted_files() {
    let dir = scratch_dir("verify_bad");
    let session = maze_session(&dir, test_config());

    let record = |data: u64, low_byte: u8| {
        let mut bytes = CompressedState::from_data(data as u128).to_le_bytes();
        bytes[0] = low_byte;
        CompressedState::from_le_bytes(bytes)
    };
    let write = |name: &str, records: &[CompressedState]| {
        let path = dir.join(name);
        let mut out = BufferedOutputStream::create(&path, 8).unwrap();
        for &cs in records {
            out.write(cs).unwrap();
        }
        out.flush().unwrap();
        path
    };

    // Unordered and duplicate records are reported but tolerated.
    let unordered = write("unordered.bin", &[record(5, 0), record(3, 0)]);
    assert_eq!(
        session.verify(unordered.to_str().unwrap()).unwrap(),
        Outcome::Ok
    );
    let duplicated = write("duplicated.bin", &[record(4, 0), record(4, 9)]);
    assert_eq!(
        session.verify(duplicated.to_str().unwrap()).unwrap(),
        Outcome::Ok
    );

    // A subframe at or beyond the group width is corruption.
    let torn = write("torn.bin", &[record(1, 0), record(2, 12)]);
    assert!(session.verify(torn.to_str().unwrap()).is_err());
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn maintenance_commands_operate_on_search_output() {
    let dir = scratch_dir("maintenance");
    let session = maze_session(&dir, test_config());
    assert_eq!(session.search(None).unwrap(), Outcome::Ok);

    assert_eq!(session.count(0, session.max_groups).unwrap(), Outcome::Ok);
    assert_eq!(session.dump(0).unwrap(), Outcome::Ok);
    assert_eq!(session.sample(0).unwrap(), Outcome::Ok);

    let closed_0 = session.names.closed(0);
    let closed_1 = session.names.closed(1);
    assert_eq!(
        session
            .compare(closed_0.to_str().unwrap(), closed_1.to_str().unwrap())
            .unwrap(),
        Outcome::Ok
    );

    // Consolidate the closed past into an all-file.
    assert_eq!(session.create_all().unwrap(), Outcome::Ok);
    let has_all = (0..session.max_groups).any(|g| session.names.all(g).exists());
    assert!(has_all);

    // Unpacking to per-frame files and converting back reproduces the
    // group file exactly.
    let mut original = Vec::new();
    let mut input = BufferedInputStream::open(&closed_0, 8).unwrap();
    while let Some(cs) = input.read().unwrap() {
        original.push((cs.data(), cs.subframe()));
    }
    assert_eq!(session.unpack(0, 1).unwrap(), Outcome::Ok);
    std::fs::remove_file(&closed_0).unwrap();
    assert_eq!(session.convert(0, 1).unwrap(), Outcome::Ok);
    let mut rebuilt = Vec::new();
    let mut input = BufferedInputStream::open(&closed_0, 8).unwrap();
    while let Some(cs) = input.read().unwrap() {
        rebuilt.push((cs.data(), cs.subframe()));
    }
    assert_eq!(rebuilt, original);

    // The finish state is still on disk, so a fresh scan re-traces it.
    std::fs::remove_file(dir.join("maze-solution.txt")).unwrap();
    assert_eq!(
        session.find_exit(0, session.max_groups).unwrap(),
        Outcome::Ok
    );
    assert!(dir.join("maze-solution.txt").exists());
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn regenerate_pack_sort_and_filter_rebuild_the_frontier() {
    let dir = scratch_dir("regen");
    {
        let session = maze_session(&dir, test_config());
        assert_eq!(session.search(Some(2)).unwrap(), Outcome::NotFound);
    }
    // Lose the frontier file that group 2 would have consumed.
    std::fs::remove_file(dir.join("maze-open-2x.bin")).unwrap();

    {
        let session = maze_session(&dir, test_config());
        assert_eq!(
            session.regenerate_open(0, session.max_groups).unwrap(),
            Outcome::Ok
        );
    }
    assert!(dir.join("maze-open-2x.bin").exists());

    // Compact the regenerated (duplicate-heavy) open file in place.
    {
        let session = maze_session(&dir, test_config());
        assert_eq!(session.pack_open(2, 3).unwrap(), Outcome::Ok);
        assert_eq!(session.sort_open(2, 3).unwrap(), Outcome::Ok);
        session.filter_open().unwrap();
        let open_2 = session.names.open(2);
        assert_eq!(
            session.verify(open_2.to_str().unwrap()).unwrap(),
            Outcome::Ok
        );
    }

    // The rebuilt frontier still leads to the optimal solution.
    let session = maze_session(&dir, test_config());
    assert_eq!(session.search(None).unwrap(), Outcome::Ok);
    let maze = sample_maze();
    let steps = solution_steps(&dir);
    assert_eq!(steps.len() as u32, bfs_distance(&maze));
    assert!(replay_reaches_finish(&maze, &steps));
    std::fs::remove_dir_all(dir).unwrap();
}
