//! spot_edit - edit the parking spot geometry of one source
//!
//! Every change is written back to the spot file immediately.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use parkwatch::config::ParkwatchConfig;
use parkwatch::spots::{EditEvent, EditOutcome, JsonSpotStore, SpotEditor};

#[derive(Parser, Debug)]
#[command(name = "spot_edit", about = "Add, resize and remove parking spots for a source")]
struct Args {
    /// Source id (e.g. lot1)
    #[arg(long)]
    lot: String,

    /// Spot file to edit; defaults to the file configured for the source
    #[arg(long, value_name = "PATH")]
    spots: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every spot as index, x, y, width, height
    List,

    /// Add a default-sized spot with its top-left corner at (x, y)
    Add { x: u32, y: u32 },

    /// Grow or shrink the spot under (x, y) by (dx, dy) pixels
    Resize {
        x: u32,
        y: u32,
        #[arg(allow_negative_numbers = true)]
        dx: i64,
        #[arg(allow_negative_numbers = true)]
        dy: i64,
    },

    /// Remove the first spot containing (x, y)
    Remove { x: u32, y: u32 },

    /// Remove every spot
    Reset,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    parkwatch::validate_source_id(&args.lot)?;

    let path = match args.spots {
        Some(path) => path,
        None => ParkwatchConfig::load()?
            .sources
            .into_iter()
            .find(|source| source.id == args.lot)
            .map(|source| source.spots)
            .ok_or_else(|| anyhow!("source '{}' is not configured; pass --spots", args.lot))?,
    };
    let store = Arc::new(JsonSpotStore::new().with_source(args.lot.clone(), path.clone()));
    let mut editor = SpotEditor::load(&args.lot, store)?;

    let outcome = match args.command {
        Command::List => {
            for (index, region) in editor.regions().iter().enumerate() {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    index, region.x, region.y, region.width, region.height
                );
            }
            return Ok(());
        }
        Command::Add { x, y } => {
            // A press on an existing spot grabs it instead of adding.
            match editor.apply(EditEvent::Press { x, y })? {
                EditOutcome::Grabbed(index) => {
                    return Err(anyhow!("({}, {}) is inside spot {}", x, y, index));
                }
                outcome => outcome,
            }
        }
        Command::Resize { x, y, dx, dy } => {
            let EditOutcome::Grabbed(index) = editor.apply(EditEvent::Press { x, y })? else {
                return Err(anyhow!("no spot contains ({}, {})", x, y));
            };
            editor.resize_by(index, dx, dy)?;
            editor.apply(EditEvent::Release)?;
            EditOutcome::Resized(index)
        }
        Command::Remove { x, y } => editor.apply(EditEvent::RemoveAt { x, y })?,
        Command::Reset => editor.apply(EditEvent::Reset)?,
    };

    match outcome {
        EditOutcome::Ignored => println!("no spot contains the given point; nothing changed"),
        outcome => println!(
            "{:?}: {} spot(s) saved to {}",
            outcome,
            editor.regions().len(),
            path.display()
        ),
    }
    Ok(())
}
