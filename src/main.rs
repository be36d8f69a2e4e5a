//! Offline mix: queue every track under a stems directory and render the
//! automatic transitions between them to a WAV file.
//!
//! ```text
//! stem-mixer <stems-dir> <out.wav> [config.json]
//! ```

use std::{error::Error, fs, path::PathBuf, sync::Arc, thread, time::Duration};

use stem_mixer::{
    audio::{
        analyzer::{MemoryCatalog, TrackInfo},
        clock::SampleClock,
        deck::PlaybackState,
        stems::WavStemSource,
    },
    scheduler::{autodj::OrchestratorState, EventBus, MixEvent, TransitionOrchestrator},
    EngineConfig,
};

const BLOCK_MS: u32 = 10;
const MAX_RENDER_SECS: u32 = 60 * 60;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let (Some(stems_dir), Some(out_path)) = (args.next(), args.next()) else {
        eprintln!("usage: stem-mixer <stems-dir> <out.wav> [config.json]");
        std::process::exit(2);
    };
    let config = match args.next() {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let stems_dir = PathBuf::from(stems_dir);
    let mut tracks: Vec<String> = fs::read_dir(&stems_dir)?
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    tracks.sort();
    if tracks.is_empty() {
        return Err(format!("no track folders under {}", stems_dir.display()).into());
    }

    let catalog = Arc::new(MemoryCatalog::new());
    for id in &tracks {
        catalog.add_track(TrackInfo {
            id: id.clone(),
            title: id.clone(),
            duration_seconds: 0.0,
        });
    }

    let events = EventBus::new();
    let mut event_rx = events.subscribe();
    let clock = SampleClock::new(config.sample_rate);
    let mut orch = TransitionOrchestrator::new(
        &config,
        Arc::new(WavStemSource::new(&stems_dir)),
        catalog,
        clock,
        events,
    );
    for id in &tracks {
        orch.enqueue(id)?;
    }

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: config.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&out_path, spec)?;
    let render = orch.render_handle();
    let frames_per_block = (config.sample_rate * BLOCK_MS / 1000).max(1) as usize;
    let blocks_per_monitor = (config.orchestrator.monitor_interval_ms as u32 / BLOCK_MS).max(1);
    let mut block = vec![0.0_f32; frames_per_block * 2];
    let mut rendered_blocks: u32 = 0;

    loop {
        orch.on_poll();
        while let Ok(event) = event_rx.try_recv() {
            if let MixEvent::TransitionPlanned { summary } = &event {
                log::info!(
                    "{:?}: {} -> {:?} exit {:.2}s entry {:.2}s p={:.2}",
                    summary.style,
                    summary.outgoing_track,
                    summary.incoming_track,
                    summary.exit_seconds,
                    summary.entry_seconds,
                    summary.success_probability
                );
            }
        }

        // Wait for the first track to load before rendering anything.
        if orch.state() == OrchestratorState::Idle {
            if orch.queue().next().is_none() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
            continue;
        }

        let main = orch.scheduler().main_state();
        let done = main.playback == PlaybackState::Ended
            && orch.state() == OrchestratorState::Playing
            && orch.queue().next().is_none();
        if done || rendered_blocks * BLOCK_MS / 1000 >= MAX_RENDER_SECS {
            break;
        }

        render.render(&mut block);
        for &s in &block {
            writer.write_sample(s)?;
        }
        rendered_blocks += 1;
        if rendered_blocks % blocks_per_monitor == 0 {
            orch.on_monitor();
        }
    }

    writer.finalize()?;
    log::info!(
        "Wrote {:.1}s to {out_path} ({} transitions)",
        rendered_blocks as f64 * BLOCK_MS as f64 / 1000.0,
        orch.history().len()
    );
    Ok(())
}
