use minesweeper::{Agent, Board, Cell};
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

const HEIGHT: usize = 8;
const WIDTH: usize = 8;
const MINES: usize = 8;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // --- 1. Initialization ---
    let mut rng = rand::rng();
    let board = Board::new(HEIGHT, WIDTH, MINES, &mut rng);
    let mut agent = Agent::new(HEIGHT, WIDTH);

    println!("--- Autonomous Minesweeper Bot ---");
    println!("Strategy: play cells proven safe, guess randomly otherwise.");

    // Revealed cells with their adjacent-mine counts, for rendering only.
    let mut revealed: BTreeMap<Cell, usize> = BTreeMap::new();
    let mut lost = false;

    // --- 2. Game Loop ---
    let mut move_count = 0;
    loop {
        move_count += 1;

        // --- 3. Bot's Decision Logic ---

        // Strategy 1: a cell the knowledge base proves safe.
        let (cell, reason) = match agent.safe_move() {
            Some(cell) => (cell, "proven safe"),
            // Strategy 2: no safe cell is known, so guess.
            None => match agent.random_move(&mut rng) {
                Some(cell) => (cell, "random guess"),
                // No candidates left: every unplayed cell is a known mine.
                None => break,
            },
        };

        // --- 4. Execute the Chosen Move ---
        println!("\nMove #{move_count}: reveal {cell} ({reason})");

        if board.is_mine(cell) {
            println!("Boom. {cell} was a mine.");
            lost = true;
            break;
        }

        let count = board.adjacent_mine_count(cell);
        revealed.insert(cell, count);
        agent.add_knowledge(cell, count)?;

        // The bot flags exactly the cells it has proven to be mines.
        print_board(&board, &revealed, &agent);

        if board.won(agent.mines()) {
            break;
        }

        // Keep the game watchable.
        thread::sleep(Duration::from_millis(200));
    }

    // --- 5. Final Result ---
    println!("\n--- Game Over ---");
    if lost {
        println!("Result: the bot hit a mine after {move_count} moves.");
    } else if board.won(agent.mines()) {
        println!("Result: the bot flagged every mine and won in {move_count} moves!");
    } else {
        println!("Result: the game ended without a full flagging.");
    }

    Ok(())
}

fn print_board(board: &Board, revealed: &BTreeMap<Cell, usize>, agent: &Agent) {
    // Print header
    print!("   ");
    for col in 0..board.width {
        print!("{col:^3}");
    }
    println!("\n  +{}", "---".repeat(board.width));

    // Print rows
    for row in 0..board.height {
        print!("{row:^2}|");
        for col in 0..board.width {
            let cell = Cell::new(row, col);
            if let Some(count) = revealed.get(&cell) {
                print!(" {count} ");
            } else if agent.mines().contains(&cell) {
                print!(" F ");
            } else {
                print!(" ■ ");
            }
        }
        println!();
    }
}
