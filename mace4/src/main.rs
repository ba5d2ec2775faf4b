use mace4::Mace4;
use minesweeper::{Agent, Board};

const HEIGHT: usize = 8;
const WIDTH: usize = 8;
const MINES: usize = 8;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // The prover binary can be overridden, e.g. MACE4=bin/mace4.
    let program = std::env::var("MACE4").unwrap_or_else(|_| "mace4".into());
    let prover = Mace4::new(program)?;

    let mut rng = rand::rng();
    let board = Board::new(HEIGHT, WIDTH, MINES, &mut rng);
    let mut agent = Agent::with_predictor(HEIGHT, WIDTH, Box::new(prover));

    println!("--- Prover-Assisted Minesweeper Bot ---");
    println!("Strategy: proven-safe cells, then Mace4 suggestions, then random guesses.");

    let mut lost = false;
    let mut move_count = 0;
    loop {
        move_count += 1;

        let (cell, reason) = if let Some(cell) = agent.safe_move() {
            (cell, "proven safe")
        } else if let Some(cell) = agent.predicted_move() {
            (cell, "prover suggestion")
        } else if let Some(cell) = agent.random_move(&mut rng) {
            (cell, "random guess")
        } else {
            // Every unplayed cell is a known mine.
            break;
        };

        println!("Move #{move_count}: reveal {cell} ({reason})");

        if board.is_mine(cell) {
            println!("Boom. {cell} was a mine.");
            lost = true;
            break;
        }
        agent.add_knowledge(cell, board.adjacent_mine_count(cell))?;

        if board.won(agent.mines()) {
            break;
        }
    }

    println!("\n--- Game Over ---");
    if lost {
        println!("Result: lost after {move_count} moves.");
    } else if board.won(agent.mines()) {
        println!(
            "Result: won in {move_count} moves, all {} mines flagged.",
            board.mine_count()
        );
    } else {
        println!("Result: out of moves without a full flagging.");
    }

    Ok(())
}
