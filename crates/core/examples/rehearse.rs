//! Play audio files in lock-step as one rehearsal session.
//!
//! Run with: cargo run -p rehearse_core --example rehearse -- drums.wav bass.wav vocals.flac

use std::path::Path;
use std::time::Duration;

use rehearse_core::{FsPersistence, PlayOutcome, Session, SessionConfig, Track, TrackId};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        anyhow::bail!("usage: rehearse <audio file>...");
    }

    let config = SessionConfig::load();
    let persistence = FsPersistence::new(config.sample_root.clone(), config.cache_dir.clone());
    let mut session = Session::new(persistence, config)?;

    let tracks = paths
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let name = Path::new(path)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.clone());
            Track::new(TrackId(i as u64 + 1), name, path.as_str())
        })
        .collect();

    let report = session.load_session(tracks).await?;
    println!("Loaded {}/{} tracks", report.loaded_count(), paths.len());
    for (id, reason) in report.failed_ids.iter().zip(&report.errors) {
        println!("  track {id}: {reason}");
    }

    match session.play().await? {
        PlayOutcome::Started { voices } => println!("Playing {voices} tracks"),
        outcome => {
            println!("Not playing: {outcome:?}");
            return Ok(());
        }
    }

    let duration = session.duration();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    while session.current_time() < duration {
        ticker.tick().await;
        let levels = session.audio_levels();
        let (left, right) = session.master_stereo_levels();
        let meters: Vec<String> = session
            .tracks()
            .iter()
            .map(|t| format!("{} {:>3.0}", t.name, levels.get(&t.id).copied().unwrap_or(0.0)))
            .collect();
        println!(
            "{:>7.2}s  L {left:>3.0} R {right:>3.0} | {}",
            session.current_time(),
            meters.join("  ")
        );
    }

    session.dispose();
    Ok(())
}
