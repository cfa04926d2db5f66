//! CEG signatures finder.
//!
//! Scans a protected binary for the protection's entry points and every
//! protected function, and writes the resulting recipe to `noceg.json` next
//! to this executable. When the input had ASLR enabled, a copy with the
//! dynamic-base flag cleared is written beside it as well.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bytesize::ByteSize;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use noceg::analysis::{AnalysisConfig, ProgressInfo, ProgressStage};
use noceg::{analyze, PeImage, RecipeFile};

/// CEG signatures finder by iArtorias.
#[derive(Parser)]
#[command(name = "noceg-signatures")]
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

    println!("CEG signatures finder by iArtorias (https://github.com/iArtorias)\n");

    let cli = Cli::parse();

    let bytes = std::fs::read(&cli.binary)
        .with_context(|| format!("unable to read '{}'", cli.binary.display()))?;
    println!(
        "Loaded '{}' ({})",
        cli.binary.display(),
        ByteSize::b(bytes.len() as u64)
    );

    let mut image = PeImage::parse(bytes)?;

    let had_aslr = image.aslr_enabled();
    if had_aslr {
        image.clear_aslr_flag();
        println!("[SUCCESS] Successfully disabled ASLR.");
    }

    // Progress bar over the instruction analysis pass.
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let pb_clone = pb.clone();
    let config = AnalysisConfig {
        progress_callback: Some(Box::new(move |info: &ProgressInfo| {
            let pct = if info.total > 0 {
                (info.current as f64 / info.total as f64 * 100.0) as u64
            } else {
                0
            };
            pb_clone.set_position(pct);
            pb_clone.set_message(info.stage.name());
        })),
    };

    let report = analyze(&image, &config);
    pb.finish_with_message(ProgressStage::Complete.name());

    if report.legacy {
        println!("[WARNING] Older CEG version found.");
    }

    let recipe = &report.recipe;
    let print_anchor = |label: &str, address: noceg::Va| {
        if address.is_zero() {
            println!("[ERROR] CEG {label} function not found.");
        } else {
            println!("[SUCCESS] Found CEG {label} function: '{address}'.");
        }
    };
    print_anchor("init", recipe.init);
    print_anchor("terminate", recipe.terminate);
    print_anchor("register thread", recipe.register_thread);

    for (patch_type, label) in [
        (2, "(stolen) (v1)"),
        (3, "(stolen) (v2)"),
        (4, "(stolen) (v3)"),
        (1, "(constant)"),
    ] {
        let count = report.unique_funcs(patch_type);
        if count > 0 {
            println!("[SUCCESS] Found CEG protected {label} functions: '{count}'.");
        }
    }

    if !recipe.integrity.is_empty() {
        println!(
            "[SUCCESS] Found CEG integrity functions: '{}'.",
            recipe.integrity.len()
        );
    }
    if !recipe.test_secret.is_empty() {
        println!(
            "[SUCCESS] Found CEG test secret functions: '{}'.",
            recipe.test_secret.len()
        );
    }

    // The recipe lands next to this executable; the extractor and patcher
    // pick it up from there.
    let recipe_path = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("noceg.json")))
        .unwrap_or_else(|| "noceg.json".into());
    RecipeFile::create(&recipe_path, report.recipe).save()?;
    println!("[SUCCESS] Recipe written to '{}'.", recipe_path.display());

    if had_aslr {
        let stem = cli
            .binary
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = cli
            .binary
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let noaslr = cli.binary.with_file_name(format!("{stem}_noaslr{extension}"));

        std::fs::write(&noaslr, image.bytes())
            .with_context(|| format!("unable to write '{}'", noaslr.display()))?;
        println!(
            "[SUCCESS] Successfully saved the binary with disabled ASLR as '{}'.",
            noaslr.display()
        );
    }

    Ok(())
}
