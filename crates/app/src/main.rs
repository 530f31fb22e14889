use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use vox_core::{
    Category, PlayMode, Studio, StudioConfig, StudioDeps, TrackId, compute_peaks, decode_file,
};

#[derive(Parser)]
#[command(name = "vox", about = "Multi-track vocal playback and mixing")]
struct Cli {
    /// Config file; the platform config dir when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play files in sync on the default output device
    Play {
        /// Vocal takes
        #[arg(short, long)]
        vocal: Vec<PathBuf>,
        /// Beat or instrumental files
        #[arg(short, long)]
        instrumental: Vec<PathBuf>,
        /// Start position in seconds
        #[arg(long, default_value_t = 0.0)]
        offset: f64,
    },
    /// Print waveform peaks of a file
    Peaks {
        file: PathBuf,
        #[arg(short, long, default_value_t = vox_core::WAVEFORM_POINTS)]
        points: usize,
    },
    /// Send a vocal to the mix service, then play raw and processed
    Mix {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = VocalKind::Lead)]
        kind: VocalKind,
        #[arg(long)]
        bpm: Option<f64>,
        /// Bearer token for the backend
        #[arg(long, env = "VOX_TOKEN")]
        token: Option<String>,
        /// Play the result, switching between raw and processed every few seconds
        #[arg(long)]
        play: bool,
    },
    /// Have the backend bounce files into one mix and save it
    Render {
        #[arg(short, long)]
        vocal: Vec<PathBuf>,
        #[arg(short, long)]
        instrumental: Vec<PathBuf>,
        #[arg(short, long, default_value = "mix.wav")]
        out: PathBuf,
        #[arg(long, env = "VOX_TOKEN")]
        token: Option<String>,
    },
    /// Write the default configuration
    InitConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum VocalKind {
    Lead,
    Adlibs,
}

impl From<VocalKind> for Category {
    fn from(kind: VocalKind) -> Self {
        match kind {
            VocalKind::Lead => Category::LeadVocal,
            VocalKind::Adlibs => Category::AdlibsBacks,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => StudioConfig::load_from(path),
        None => StudioConfig::load(),
    };

    match cli.command {
        Commands::Play {
            vocal,
            instrumental,
            offset,
        } => play(config, &vocal, &instrumental, offset).await,
        Commands::Peaks { file, points } => peaks(&file, points),
        Commands::Mix {
            file,
            kind,
            bpm,
            token,
            play,
        } => mix(config, &file, kind.into(), bpm, token, play).await,
        Commands::Render {
            vocal,
            instrumental,
            out,
            token,
        } => render(config, &vocal, &instrumental, &out, token).await,
        Commands::InitConfig => {
            match &cli.config {
                Some(path) => StudioConfig::default().save_to(path)?,
                None => StudioConfig::default().save(),
            }
            Ok(())
        }
    }
}

fn open_studio(config: StudioConfig) -> Result<Studio> {
    let deps = StudioDeps::from_config(&config)?;
    Ok(Studio::new(config, deps))
}

async fn add_file(studio: &mut Studio, path: &Path, category: Category) -> Result<TrackId> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio.wav".to_string());
    let id = studio.add_track();
    studio.set_category(&id, category)?;
    studio.select_file(&id, &name, bytes.into()).await?;
    log::info!("{name}: track {id} ({})", category.as_str());
    Ok(id)
}

/// Poll until playback ends on its own.
async fn run_until_ended(studio: &mut Studio) {
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    let mut last_second = -1;
    while studio.is_playing() {
        ticker.tick().await;
        studio.poll();
        let second = studio.current_offset() as i64;
        if second != last_second {
            last_second = second;
            log::debug!("at {second}s");
        }
    }
}

async fn play(
    config: StudioConfig,
    vocals: &[PathBuf],
    instrumentals: &[PathBuf],
    offset: f64,
) -> Result<()> {
    let mut studio = open_studio(config)?;
    for path in vocals {
        add_file(&mut studio, path, Category::LeadVocal).await?;
    }
    for path in instrumentals {
        add_file(&mut studio, path, Category::Instrumental).await?;
    }
    if offset > 0.0 {
        studio.seek_to(offset)?;
    }

    studio.play_all().await.map_err(|err| anyhow::anyhow!(err.user_message()))?;
    run_until_ended(&mut studio).await;
    studio.flush_snapshot();
    Ok(())
}

fn peaks(path: &Path, points: usize) -> Result<()> {
    let audio = decode_file(path).with_context(|| format!("decoding {}", path.display()))?;
    let peaks = compute_peaks(&audio, points);
    println!("{:.3}s {} Hz {} ch", audio.duration_secs(), audio.sample_rate(), audio.channels());
    let line: Vec<String> = peaks.iter().map(|p| format!("{p:.4}")).collect();
    println!("{}", line.join(" "));
    Ok(())
}

async fn mix(
    config: StudioConfig,
    path: &Path,
    category: Category,
    bpm: Option<f64>,
    token: Option<String>,
    play: bool,
) -> Result<()> {
    let mut studio = open_studio(config)?;
    studio.set_auth_token(token);
    if let Some(bpm) = bpm {
        studio.set_bpm(bpm);
    }
    let id = add_file(&mut studio, path, category).await?;

    let mut progress = studio.subscribe_progress();
    let job = studio.start_mix(&id).map_err(|err| anyhow::anyhow!(err.user_message()))?;
    tokio::pin!(job);
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    let finished = loop {
        tokio::select! {
            finished = &mut job => break finished,
            Ok(()) = progress.changed() => {
                if let Some(percent) = progress.borrow_and_update().get(&id) {
                    println!("mixing {percent}%");
                }
            }
            _ = ticker.tick() => {
                studio.poll();
            }
        }
    };
    studio
        .finish_mix(finished)
        .await
        .map_err(|err| anyhow::anyhow!(err.user_message()))?;

    if let Some(processed) = studio.track(&id).and_then(|t| t.processed_ref.as_ref()) {
        println!("processed: {processed}");
    }
    if !play {
        return Ok(());
    }

    studio.play_all().await.map_err(|err| anyhow::anyhow!(err.user_message()))?;
    let mut ticker = tokio::time::interval(Duration::from_secs(4));
    ticker.tick().await;
    while studio.is_playing() {
        tokio::select! {
            _ = ticker.tick() => {
                studio.toggle_play_mode(&id)?;
                let mode = studio.track(&id).map(|t| t.play_mode);
                println!("{}", if mode == Some(PlayMode::Raw) { "raw" } else { "processed" });
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                studio.poll();
            }
        }
    }
    Ok(())
}

async fn render(
    config: StudioConfig,
    vocals: &[PathBuf],
    instrumentals: &[PathBuf],
    out: &Path,
    token: Option<String>,
) -> Result<()> {
    let mut studio = open_studio(config)?;
    studio.set_auth_token(token);
    for path in vocals {
        add_file(&mut studio, path, Category::LeadVocal).await?;
    }
    for path in instrumentals {
        add_file(&mut studio, path, Category::Instrumental).await?;
    }

    let job = studio.render_mix().map_err(|err| anyhow::anyhow!(err.user_message()))?;
    let bytes = job.await.map_err(|err| anyhow::anyhow!(err.user_message()))?;
    std::fs::write(out, &bytes).with_context(|| format!("writing {}", out.display()))?;
    println!("{} ({} bytes)", out.display(), bytes.len());
    Ok(())
}
