//! CEG patcher.
//!
//! Reads `noceg.json` from the current working directory and rewrites every
//! recorded function in the given binary, saving the result as
//! `<stem>_noceg.<ext>` beside the input.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use noceg::{collect_targets, Patcher, PeImage, RecipeFile};

/// CEG patcher by iArtorias.
#[derive(Parser)]
#[command(name = "noceg-patcher")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the CEG protected binary.
    binary: PathBuf,
}

fn main() -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    println!("CEG patcher by iArtorias (https://github.com/iArtorias).\n");

    let cli = Cli::parse();

    let recipe_path = std::env::current_dir()?.join("noceg.json");
    let recipe = RecipeFile::load(&recipe_path)
        .with_context(|| format!("unable to load '{}'", recipe_path.display()))?;

    let targets = collect_targets(&recipe.recipe);
    if targets.is_empty() {
        bail!("no patches found in '{}'", recipe_path.display());
    }
    println!("[SUCCESS] Total patches loaded: '{}'.", targets.len());

    let bytes = std::fs::read(&cli.binary)
        .with_context(|| format!("unable to open '{}'", cli.binary.display()))?;
    let image = PeImage::parse(bytes)?;

    let mut patcher = Patcher::new(image);
    let applied = patcher.apply(&targets);
    println!("[SUCCESS] Total patches applied '{applied}'.");

    if applied == 0 {
        bail!("no patches applied");
    }

    let output = patcher.save(&cli.binary)?;
    println!(
        "[SUCCESS] Saved the patched file as '{}'.",
        output.display()
    );

    Ok(())
}
