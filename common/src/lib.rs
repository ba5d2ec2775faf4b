use anyhow::{bail, ensure};
use rand::Rng;
use rand::seq::IndexedRandom;
use std::collections::BTreeSet;
use std::fmt;

/// A (row, column) coordinate on the board.
///
/// Ordered row-first so that `BTreeSet<Cell>` iterates lowest row then lowest
/// column, which keeps every deterministic choice in the engine reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cell {
    pub row: usize,
    pub col: usize,
}

impl Cell {
    pub fn new(row: usize, col: usize) -> Self {
        Cell { row, col }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// All in-bounds neighbours of a cell, up to 8 of them.
/// Cells beyond the board edge are excluded, never wrapped.
pub fn neighbors(height: usize, width: usize, cell: Cell) -> impl Iterator<Item = Cell> {
    (-1..=1).flat_map(move |dr: isize| {
        (-1..=1).filter_map(move |dc: isize| {
            // Skip the cell itself.
            if dr == 0 && dc == 0 {
                return None;
            }

            let row = cell.row as isize + dr;
            let col = cell.col as isize + dc;

            if row >= 0 && row < height as isize && col >= 0 && col < width as isize {
                Some(Cell {
                    row: row as usize,
                    col: col as usize,
                })
            } else {
                None
            }
        })
    })
}

// --- Board (ground truth, read-only after construction) ---

/// The actual minefield. Fixed at construction and never mutated; the agent
/// only ever sees it through the `adjacent_mine_count` answers fed to it by
/// the game loop.
pub struct Board {
    pub height: usize,
    pub width: usize,
    mines: BTreeSet<Cell>,
}

impl Board {
    /// Creates a board with `num_mines` mines placed uniformly at random.
    pub fn new(height: usize, width: usize, num_mines: usize, rng: &mut impl Rng) -> Self {
        if num_mines >= height * width {
            panic!("Total mines must be less than the number of cells on the board.");
        }

        let mut mines = BTreeSet::new();
        while mines.len() != num_mines {
            let cell = Cell::new(rng.random_range(0..height), rng.random_range(0..width));
            mines.insert(cell);
        }

        Board {
            height,
            width,
            mines,
        }
    }

    /// Creates a board with a fixed mine layout.
    ///
    /// Panics if any mine lies outside the board.
    pub fn with_mines(height: usize, width: usize, mines: impl IntoIterator<Item = Cell>) -> Self {
        let mines: BTreeSet<Cell> = mines.into_iter().collect();
        for cell in &mines {
            assert!(
                cell.row < height && cell.col < width,
                "mine {cell} out of bounds for a {height}x{width} board"
            );
        }

        Board {
            height,
            width,
            mines,
        }
    }

    fn check_bounds(&self, cell: Cell) {
        assert!(
            cell.row < self.height && cell.col < self.width,
            "cell {cell} out of bounds for a {}x{} board",
            self.height,
            self.width
        );
    }

    pub fn is_mine(&self, cell: Cell) -> bool {
        self.check_bounds(cell);
        self.mines.contains(&cell)
    }

    /// Number of mines among the (up to 8) neighbours of `cell`.
    pub fn adjacent_mine_count(&self, cell: Cell) -> usize {
        self.check_bounds(cell);
        self.neighbors(cell)
            .filter(|n| self.mines.contains(n))
            .count()
    }

    pub fn neighbors(&self, cell: Cell) -> impl Iterator<Item = Cell> {
        neighbors(self.height, self.width, cell)
    }

    pub fn mine_count(&self) -> usize {
        self.mines.len()
    }

    /// The win condition: the flagged set matches the mine set exactly.
    /// A flagged non-mine or an unflagged mine both mean the game is not won.
    pub fn won(&self, flagged: &BTreeSet<Cell>) -> bool {
        *flagged == self.mines
    }
}

// --- Knowledge representation ---

/// The logical assertion "exactly `count` of `cells` are mines".
///
/// As cells get classified elsewhere they are removed from `cells` (with
/// `count` decremented for mines), so the sentence always ranges over cells
/// whose status is still undetermined. An empty sentence asserts nothing and
/// is a candidate for pruning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    cells: BTreeSet<Cell>,
    count: usize,
}

impl Sentence {
    pub fn new(cells: BTreeSet<Cell>, count: usize) -> Self {
        debug_assert!(count <= cells.len(), "sentence count exceeds its cells");
        Sentence { cells, count }
    }

    pub fn cells(&self) -> &BTreeSet<Cell> {
        &self.cells
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Every cell is a mine iff the remaining mine count equals the number of
    /// undetermined cells (and there is at least one).
    pub fn known_mines(&self) -> BTreeSet<Cell> {
        if self.count > 0 && self.count == self.cells.len() {
            self.cells.clone()
        } else {
            BTreeSet::new()
        }
    }

    /// Every cell is safe iff no mines remain among the undetermined cells.
    pub fn known_safes(&self) -> BTreeSet<Cell> {
        if self.count == 0 {
            self.cells.clone()
        } else {
            BTreeSet::new()
        }
    }

    /// Records that `cell` is a mine. No-op if the sentence does not mention it.
    pub fn mark_mine(&mut self, cell: Cell) {
        if self.cells.remove(&cell) {
            self.count -= 1;
        }
    }

    /// Records that `cell` is safe. No-op if the sentence does not mention it.
    pub fn mark_safe(&mut self, cell: Cell) {
        self.cells.remove(&cell);
    }
}

impl fmt::Display for Sentence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} = {}", self.cells, self.count)
    }
}

// --- External prediction capability ---

/// A borrowed snapshot of the knowledge base, handed to predictors.
pub struct KnowledgeView<'a> {
    pub height: usize,
    pub width: usize,
    pub sentences: &'a [Sentence],
    pub mines: &'a BTreeSet<Cell>,
    pub safes: &'a BTreeSet<Cell>,
    pub moves_made: &'a BTreeSet<Cell>,
}

/// Supplementary move suggestion from an external reasoner.
///
/// Advisory only: a recommendation never carries logical certainty, and any
/// error from the implementation is recoverable (the agent falls back to a
/// random move). A stub returning `Ok(None)` is a valid implementation.
pub trait Predictor {
    fn predict(&self, knowledge: &KnowledgeView<'_>) -> anyhow::Result<Option<Cell>>;
}

// --- The agent ---

/// Plays Minesweeper by maintaining a knowledge base of sentences derived
/// from revealed-cell counts and inferring which cells are provably safe or
/// provably mined. One instance per game; owns all of its state.
pub struct Agent {
    height: usize,
    width: usize,
    /// Cells already revealed by the game loop. Never suggested again.
    moves_made: BTreeSet<Cell>,
    /// Cells known with certainty to be mines. Grows monotonically.
    mines: BTreeSet<Cell>,
    /// Cells known with certainty to be safe. Grows monotonically.
    safes: BTreeSet<Cell>,
    knowledge: Vec<Sentence>,
    predictor: Option<Box<dyn Predictor>>,
}

impl Agent {
    pub fn new(height: usize, width: usize) -> Self {
        Agent {
            height,
            width,
            moves_made: BTreeSet::new(),
            mines: BTreeSet::new(),
            safes: BTreeSet::new(),
            knowledge: Vec::new(),
            predictor: None,
        }
    }

    pub fn with_predictor(height: usize, width: usize, predictor: Box<dyn Predictor>) -> Self {
        Agent {
            predictor: Some(predictor),
            ..Agent::new(height, width)
        }
    }

    pub fn mines(&self) -> &BTreeSet<Cell> {
        &self.mines
    }

    pub fn safes(&self) -> &BTreeSet<Cell> {
        &self.safes
    }

    pub fn moves_made(&self) -> &BTreeSet<Cell> {
        &self.moves_made
    }

    pub fn view(&self) -> KnowledgeView<'_> {
        KnowledgeView {
            height: self.height,
            width: self.width,
            sentences: self.knowledge.as_slice(),
            mines: &self.mines,
            safes: &self.safes,
            moves_made: &self.moves_made,
        }
    }

    /// Classifies `cell` as a mine and propagates the fact into every
    /// sentence. Idempotent. Fails if `cell` is already proven safe: the
    /// knowledge base never silently keeps both classifications.
    pub fn mark_mine(&mut self, cell: Cell) -> anyhow::Result<()> {
        if self.safes.contains(&cell) {
            bail!("knowledge_collision: {cell} is both mine and safe");
        }
        if self.mines.insert(cell) {
            for sentence in &mut self.knowledge {
                ensure!(
                    !(sentence.count() == 0 && sentence.cells().contains(&cell)),
                    "knowledge_collision: {cell} is a mine in a zero-count sentence"
                );
                sentence.mark_mine(cell);
            }
        }
        Ok(())
    }

    /// Classifies `cell` as safe and propagates the fact into every sentence.
    /// Idempotent. Fails if `cell` is already proven to be a mine.
    pub fn mark_safe(&mut self, cell: Cell) -> anyhow::Result<()> {
        if self.mines.contains(&cell) {
            bail!("knowledge_collision: {cell} is both mine and safe");
        }
        if self.safes.insert(cell) {
            for sentence in &mut self.knowledge {
                sentence.mark_safe(cell);
                ensure!(
                    sentence.count() <= sentence.cells().len(),
                    "knowledge_collision: sentence claims more mines than cells after {cell}"
                );
            }
        }
        Ok(())
    }

    /// Feeds one revealed-cell fact into the knowledge base and draws every
    /// conclusion the accumulated facts support.
    ///
    /// The revealed cell is recorded as played and safe, a sentence over its
    /// undetermined neighbours is added (discounting neighbours already known
    /// to be mines), and inference runs to a fixed point.
    pub fn add_knowledge(&mut self, cell: Cell, count: usize) -> anyhow::Result<()> {
        self.moves_made.insert(cell);
        self.mark_safe(cell)?;

        let mut cells = BTreeSet::new();
        let mut count = count;
        for neighbor in neighbors(self.height, self.width, cell) {
            if self.mines.contains(&neighbor) {
                // Already accounted for; the sentence only ranges over
                // undetermined cells.
                let Some(remaining) = count.checked_sub(1) else {
                    bail!("knowledge_collision: count at {cell} below known mines");
                };
                count = remaining;
            } else if self.safes.contains(&neighbor) {
                continue;
            } else {
                cells.insert(neighbor);
            }
        }
        ensure!(
            count <= cells.len(),
            "knowledge_collision: count at {cell} exceeds undetermined neighbours"
        );

        let sentence = Sentence::new(cells, count);
        if !sentence.is_empty() && !self.knowledge.contains(&sentence) {
            self.knowledge.push(sentence);
        }

        self.infer()?;
        tracing::debug!(
            sentences = self.knowledge.len(),
            mines = self.mines.len(),
            safes = self.safes.len(),
            "knowledge settled"
        );
        Ok(())
    }

    /// Runs classification and subset derivation to a nested fixed point:
    /// nothing more is concluded without a new revealed-cell fact.
    fn infer(&mut self) -> anyhow::Result<()> {
        loop {
            self.classify()?;
            // Sentences drained by propagation assert nothing; drop them.
            self.knowledge.retain(|sentence| !sentence.is_empty());

            let derived = self.derive_subsets()?;
            if derived.is_empty() {
                return Ok(());
            }
            self.knowledge.extend(derived);
        }
    }

    /// Marks every cell some sentence proves to be a mine or safe, repeating
    /// until a full scan produces nothing new. Conclusions are staged during
    /// the scan and applied afterwards, so sentences are never mutated while
    /// being iterated.
    fn classify(&mut self) -> anyhow::Result<()> {
        loop {
            let mut found_mines = BTreeSet::new();
            let mut found_safes = BTreeSet::new();
            for sentence in &self.knowledge {
                found_mines.extend(
                    sentence
                        .known_mines()
                        .into_iter()
                        .filter(|cell| !self.mines.contains(cell)),
                );
                found_safes.extend(
                    sentence
                        .known_safes()
                        .into_iter()
                        .filter(|cell| !self.safes.contains(cell)),
                );
            }
            if found_mines.is_empty() && found_safes.is_empty() {
                return Ok(());
            }
            for cell in found_mines {
                self.mark_mine(cell)?;
            }
            for cell in found_safes {
                self.mark_safe(cell)?;
            }
        }
    }

    /// For every pair where A's cells are a proper subset of B's, the extra
    /// cells of B hold exactly `B.count - A.count` mines. Returns the derived
    /// sentences not already known.
    fn derive_subsets(&self) -> anyhow::Result<Vec<Sentence>> {
        let mut derived: Vec<Sentence> = Vec::new();
        for (i, a) in self.knowledge.iter().enumerate() {
            for (j, b) in self.knowledge.iter().enumerate() {
                if i == j || a.cells().len() >= b.cells().len() || !a.cells().is_subset(b.cells())
                {
                    continue;
                }
                let cells: BTreeSet<Cell> = b.cells().difference(a.cells()).copied().collect();
                let Some(count) = b.count().checked_sub(a.count()) else {
                    bail!("knowledge_collision: subset claims more mines than its superset");
                };
                ensure!(
                    count <= cells.len(),
                    "knowledge_collision: derived sentence claims more mines than cells"
                );
                let sentence = Sentence::new(cells, count);
                if !self.knowledge.contains(&sentence) && !derived.contains(&sentence) {
                    derived.push(sentence);
                }
            }
        }
        Ok(derived)
    }

    /// The lowest unplayed cell proven safe, if any. The caller is expected
    /// to reveal it and feed the result back through `add_knowledge`, which
    /// retires it from future suggestions.
    pub fn safe_move(&self) -> Option<Cell> {
        self.safes.difference(&self.moves_made).next().copied()
    }

    /// A uniformly random cell that is neither played nor a known mine, or
    /// `None` when the board is exhausted.
    pub fn random_move(&self, rng: &mut impl Rng) -> Option<Cell> {
        let mut candidates = Vec::new();
        for row in 0..self.height {
            for col in 0..self.width {
                let cell = Cell::new(row, col);
                if !self.moves_made.contains(&cell) && !self.mines.contains(&cell) {
                    candidates.push(cell);
                }
            }
        }
        candidates.choose(rng).copied()
    }

    /// Best available suggestion: a proven-safe cell if one exists (the
    /// predictor may never override proven knowledge), otherwise whatever the
    /// external predictor recommends. The recommendation stays a guess: it is
    /// not added to `safes`, and a failing predictor merely yields `None` so
    /// the caller can fall back to `random_move`.
    pub fn predicted_move(&self) -> Option<Cell> {
        if let Some(cell) = self.safe_move() {
            return Some(cell);
        }
        let predictor = self.predictor.as_deref()?;
        match predictor.predict(&self.view()) {
            Ok(Some(cell))
                if cell.row < self.height
                    && cell.col < self.width
                    && !self.moves_made.contains(&cell)
                    && !self.mines.contains(&cell) =>
            {
                Some(cell)
            }
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(error = %error, "external prover failed, falling back to random move");
                None
            }
        }
    }
}
