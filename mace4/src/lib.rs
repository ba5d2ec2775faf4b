use anyhow::{Context, Result, bail};
use itertools::Itertools;
use minesweeper::{Cell, KnowledgeView, Predictor};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_PROMPT_DIR: &str = "mace4_prompts";
const DEFAULT_RESPONSE_DIR: &str = "mace4_responses";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Bridge to the Mace4 model finder.
///
/// Each prediction encodes the current knowledge base as a logic program,
/// writes it to a step-numbered request artifact, runs the external program
/// with the artifact on stdin and its stdout captured into a response
/// artifact, and parses the response for mine/safe atoms. Every failure on
/// this path (missing binary, timeout, garbage output) is recoverable: the
/// agent just ends up without a recommendation.
pub struct Mace4 {
    program: PathBuf,
    prompt_dir: PathBuf,
    response_dir: PathBuf,
    timeout: Duration,
    step: AtomicUsize,
}

impl Mace4 {
    pub fn new(program: impl Into<PathBuf>) -> Result<Self> {
        Self::with_dirs(program, DEFAULT_PROMPT_DIR, DEFAULT_RESPONSE_DIR)
    }

    /// Like `new`, with explicit artifact directories. Stale artifacts from a
    /// previous session are cleared out.
    pub fn with_dirs(
        program: impl Into<PathBuf>,
        prompt_dir: impl Into<PathBuf>,
        response_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let prompt_dir = prompt_dir.into();
        let response_dir = response_dir.into();
        reset_dir(&prompt_dir)?;
        reset_dir(&response_dir)?;

        Ok(Mace4 {
            program: program.into(),
            prompt_dir,
            response_dir,
            timeout: DEFAULT_TIMEOUT,
            step: AtomicUsize::new(0),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the prover with `request` on stdin and stdout redirected into
    /// `response`, killing it once the deadline passes. The exit status is
    /// deliberately ignored: Mace4 signals "no model" through its exit code,
    /// and the parser treats an empty or partial response as no information.
    fn run(&self, request: &Path, response: &Path) -> Result<()> {
        let stdin = fs::File::open(request)
            .with_context(|| format!("failed to open {}", request.display()))?;
        let stdout = fs::File::create(response)
            .with_context(|| format!("failed to create {}", response.display()))?;

        let mut child = Command::new(&self.program)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to launch {}", self.program.display()))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait()? {
                Some(_) => return Ok(()),
                None if Instant::now() >= deadline => {
                    child.kill().ok();
                    child.wait().ok();
                    bail!("prover_timeout");
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }
}

impl Predictor for Mace4 {
    fn predict(&self, knowledge: &KnowledgeView<'_>) -> Result<Option<Cell>> {
        if knowledge.sentences.is_empty() {
            // Nothing beyond the trivially known; a model adds no information.
            return Ok(None);
        }

        let step = self.step.fetch_add(1, Ordering::Relaxed) + 1;
        let request = self.prompt_dir.join(format!("mace4_step_{step}.in"));
        let response = self.response_dir.join(format!("output_step_{step}.out"));

        fs::write(&request, encode(knowledge, step))
            .with_context(|| format!("failed to write {}", request.display()))?;
        self.run(&request, &response)?;
        let output = fs::read_to_string(&response)
            .with_context(|| format!("failed to read {}", response.display()))?;

        let (_mines, safes) = parse_model(&output);
        let recommendation = safes.into_iter().find(|cell| {
            cell.row < knowledge.height
                && cell.col < knowledge.width
                && !knowledge.safes.contains(cell)
                && !knowledge.moves_made.contains(cell)
                && !knowledge.mines.contains(cell)
        });
        if let Some(cell) = recommendation {
            tracing::debug!(%cell, step, "prover recommended a cell");
        }
        Ok(recommendation)
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(())
}

fn mine_atom(cell: Cell) -> String {
    format!("mine({},{})", cell.row, cell.col)
}

/// Renders the knowledge base as a Mace4 logic program.
///
/// Known cells become unit facts. A sentence with no mines left, or nothing
/// but mines left, also collapses to unit facts; anything in between is
/// expanded into an at-least disjunction plus at-most negated conjunctions
/// over the cell combinations.
fn encode(knowledge: &KnowledgeView<'_>, step: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "% Mace4 input: Minesweeper knowledge base, move {step}\n"
    ));
    out.push_str("formulas(assumptions).\n");

    out.push_str("% Known safe cells\n");
    for cell in knowledge.safes {
        out.push_str(&format!("-{}.\n", mine_atom(*cell)));
    }
    out.push_str("% Known mines\n");
    for cell in knowledge.mines {
        out.push_str(&format!("{}.\n", mine_atom(*cell)));
    }

    for sentence in knowledge.sentences {
        let cells: Vec<Cell> = sentence.cells().iter().copied().collect();
        let count = sentence.count();
        if count == 0 {
            for cell in &cells {
                out.push_str(&format!("-{}.\n", mine_atom(*cell)));
            }
        } else if count == cells.len() {
            for cell in &cells {
                out.push_str(&format!("{}.\n", mine_atom(*cell)));
            }
        } else {
            // At least `count` mines: some `count`-subset is fully mined.
            out.push_str(&format!("% At least {count} mines\n"));
            let at_least = cells
                .iter()
                .combinations(count)
                .map(|combo| {
                    format!(
                        "({})",
                        combo.iter().map(|cell| mine_atom(**cell)).join(" & ")
                    )
                })
                .join(" | ");
            out.push_str(&format!("{at_least}.\n"));

            // At most `count` mines: no `count + 1`-subset is fully mined.
            out.push_str(&format!("% At most {count} mines\n"));
            for combo in cells.iter().combinations(count + 1) {
                let conjunction = combo.iter().map(|cell| mine_atom(**cell)).join(" & ");
                out.push_str(&format!("-({conjunction}).\n"));
            }
        }
    }

    out.push_str("end_of_list.\n\nformulas(goals).\nend_of_list.\n");
    out
}

/// Extracts mine / safe atoms from prover output.
/// Lines that match neither prefix carry no information and are skipped.
fn parse_model(output: &str) -> (BTreeSet<Cell>, BTreeSet<Cell>) {
    let mut mines = BTreeSet::new();
    let mut safes = BTreeSet::new();
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("-mine(") {
            if let Some(cell) = parse_cell(rest) {
                safes.insert(cell);
            }
        } else if let Some(rest) = line.strip_prefix("mine(") {
            if let Some(cell) = parse_cell(rest) {
                mines.insert(cell);
            }
        }
    }
    (mines, safes)
}

fn parse_cell(rest: &str) -> Option<Cell> {
    let inner = rest.split(')').next()?;
    let (row, col) = inner.split_once(',')?;
    Some(Cell::new(
        row.trim().parse().ok()?,
        col.trim().parse().ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use minesweeper::{Agent, Sentence};
    use std::os::unix::fs::PermissionsExt;

    fn c(row: usize, col: usize) -> Cell {
        Cell::new(row, col)
    }

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mace4_{tag}_{}", std::process::id()))
    }

    fn prover(tag: &str, program: impl Into<PathBuf>) -> Mace4 {
        Mace4::with_dirs(
            program,
            temp_dir(tag).join("prompts"),
            temp_dir(tag).join("responses"),
        )
        .unwrap()
    }

    /// Drops a fake prover script into the test's scratch directory.
    fn script(tag: &str, body: &str) -> PathBuf {
        let dir = temp_dir(tag);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fake_prover.sh");
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// One revealed 1 in the corner: three undetermined neighbours, nothing
    /// provable, so the agent has to guess.
    fn stuck_agent() -> Agent {
        let mut agent = Agent::new(4, 4);
        agent.add_knowledge(c(0, 0), 1).unwrap();
        agent
    }

    #[test]
    fn test_encode_lists_known_facts() {
        let mines = BTreeSet::from([c(2, 2)]);
        let safes = BTreeSet::from([c(0, 0)]);
        let moves = BTreeSet::from([c(0, 0)]);
        let sentences = vec![
            Sentence::new(BTreeSet::from([c(3, 0), c(3, 1)]), 0),
            Sentence::new(BTreeSet::from([c(1, 0), c(1, 1)]), 2),
        ];
        let view = KnowledgeView {
            height: 4,
            width: 4,
            sentences: &sentences,
            mines: &mines,
            safes: &safes,
            moves_made: &moves,
        };

        let program = encode(&view, 3);
        assert!(program.contains("formulas(assumptions)."));
        assert!(program.contains("-mine(0,0)."));
        assert!(program.contains("mine(2,2)."));
        // A zero-count sentence collapses to unit safe facts.
        assert!(program.contains("-mine(3,0)."));
        assert!(program.contains("-mine(3,1)."));
        // A saturated sentence collapses to unit mine facts.
        assert!(program.contains("mine(1,0)."));
        assert!(program.contains("mine(1,1)."));
        assert!(program.contains("end_of_list."));
    }

    #[test]
    fn test_encode_expands_partial_sentences() {
        let empty = BTreeSet::new();
        let sentences = vec![Sentence::new(BTreeSet::from([c(0, 1), c(0, 2), c(0, 3)]), 1)];
        let view = KnowledgeView {
            height: 4,
            width: 4,
            sentences: &sentences,
            mines: &empty,
            safes: &empty,
            moves_made: &empty,
        };

        let program = encode(&view, 1);
        // At least one of the three cells is a mine...
        assert!(program.contains("(mine(0,1)) | (mine(0,2)) | (mine(0,3))."));
        // ...and no two of them are both mines.
        assert!(program.contains("-(mine(0,1) & mine(0,2))."));
        assert!(program.contains("-(mine(0,1) & mine(0,3))."));
        assert!(program.contains("-(mine(0,2) & mine(0,3))."));
    }

    #[test]
    fn test_parse_model_extracts_atoms() {
        let output = "% interpretation header\nmine(3,4).\n-mine(1,2).\nsome noise\nmine(bad).\n-mine(0,0).\n";
        let (mines, safes) = parse_model(output);
        assert_eq!(mines, BTreeSet::from([c(3, 4)]));
        assert_eq!(safes, BTreeSet::from([c(0, 0), c(1, 2)]));
    }

    #[test]
    fn test_predict_skips_empty_knowledge() {
        // Nothing revealed yet: no subprocess is spawned at all.
        let prover = prover("empty", "/nonexistent/mace4-binary");
        let agent = Agent::new(4, 4);
        assert_eq!(prover.predict(&agent.view()).unwrap(), None);
    }

    #[test]
    fn test_predict_recommends_unknown_safe_cell() {
        let script = script("recommend", "#!/bin/sh\necho 'mine(0,1).'\necho '-mine(1,1).'\n");
        let prover = prover("recommend", &script);
        let agent = stuck_agent();

        let pick = prover.predict(&agent.view()).unwrap();
        assert_eq!(pick, Some(c(1, 1)));
    }

    #[test]
    fn test_agent_uses_prover_suggestion() {
        let script = script("integration", "#!/bin/sh\necho '-mine(2,3).'\n");
        let prover = prover("integration", &script);
        let mut agent = Agent::with_predictor(4, 4, Box::new(prover));
        agent.add_knowledge(c(0, 0), 1).unwrap();

        assert_eq!(agent.safe_move(), None);
        assert_eq!(agent.predicted_move(), Some(c(2, 3)));
        // The suggestion stays a guess: it must not be promoted to safe.
        assert!(!agent.safes().contains(&c(2, 3)));
    }

    #[test]
    fn test_predict_fails_when_program_is_missing() {
        let prover = prover("missing", "/nonexistent/mace4-binary");
        let agent = stuck_agent();
        assert!(prover.predict(&agent.view()).is_err());
    }

    #[test]
    fn test_agent_falls_back_when_prover_is_missing() {
        let prover = prover("fallback", "/nonexistent/mace4-binary");
        let mut agent = Agent::with_predictor(4, 4, Box::new(prover));
        agent.add_knowledge(c(0, 0), 1).unwrap();

        // The failure is recoverable: no recommendation, random play goes on.
        assert_eq!(agent.predicted_move(), None);
        let mut rng = rand::rng();
        assert!(agent.random_move(&mut rng).is_some());
    }

    #[test]
    fn test_predict_kills_overrunning_prover() {
        let script = script("timeout", "#!/bin/sh\nsleep 5\n");
        let prover = prover("timeout", &script).with_timeout(Duration::from_millis(100));
        let agent = stuck_agent();

        let started = Instant::now();
        let result = prover.predict(&agent.view());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("prover_timeout"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_request_and_response_artifacts() {
        let prover = prover("artifacts", "cat");
        let agent = stuck_agent();

        // `cat` echoes the request back: the only safe atoms it contains are
        // already known, so there is no recommendation.
        let pick = prover.predict(&agent.view()).unwrap();
        assert_eq!(pick, None);

        let request = temp_dir("artifacts").join("prompts").join("mace4_step_1.in");
        let response = temp_dir("artifacts")
            .join("responses")
            .join("output_step_1.out");
        let written = fs::read_to_string(request).unwrap();
        assert!(written.contains("formulas(assumptions)."));
        assert!(written.contains("-mine(0,0)."));
        assert_eq!(written, fs::read_to_string(response).unwrap());
    }
}
