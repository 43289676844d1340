use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use facelock::camera::Cam;
use facelock::config::{AfterMatch, DetectorKind, LockConfig, SessionMode};
use facelock::extractor::{DlibExtractor, EmbeddingExtractor};
use facelock::image_ops::{frame_to_gray, is_dark, to_rgb};
use facelock::notify::{notify_detached, AccessEvent, Notifier, TelegramNotifier};
use facelock::peripheral::{Command, DistanceMonitor, Peripheral};
use facelock::remote::RemoteCorpus;
use facelock::session::{LockSession, Verdict};
use facelock::store::GalleryStore;

#[derive(Debug, Parser, Clone)]
#[command(name = "facelock")]
#[command(about = "Smart-lock face recognition", long_about = None)]
struct Cli {
    /// Identity of the lock this process serves
    #[arg(long, default_value = "front-door")]
    lock_id: String,
    /// V4L2 camera index (/dev/video<N>)
    #[arg(long, default_value_t = 0)]
    camera_index: u32,
    /// Directory with the dlib model .dat files
    #[arg(long, default_value = "models")]
    model_dir: PathBuf,
    /// Per-lock data root (corpus and gallery cache live under it)
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// Euclidean distance under which a face is accepted
    #[arg(long, default_value_t = 0.6)]
    threshold: f64,
    /// Max percent of dark pixels before a frame is skipped
    #[arg(long, default_value_t = 30)]
    dark_threshold: u32,
    /// Consecutive failures before the lock cools down
    #[arg(long, default_value_t = 3)]
    max_failures: u32,
    /// Cooldown after repeated failures
    #[arg(long, default_value = "60s")]
    lockout: humantime::Duration,
    #[arg(long, value_enum, default_value_t = DetectorArg::Hog)]
    detector: DetectorArg,
    /// Serial device of the door controller (opened as a file)
    #[arg(long)]
    serial: Option<PathBuf>,
    /// Base URL of the hosted corpus mirror (manifest.json + images)
    #[arg(long)]
    remote: Option<String>,
    /// Require this PIN on the controller after a face match
    #[arg(long)]
    pin: Option<String>,
    /// Exit after the first successful match instead of looping
    #[arg(long)]
    stop_on_match: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum DetectorArg {
    Hog,
    Cnn,
}

#[derive(clap::Subcommand, Debug, Clone)]
enum Commands {
    /// Run the recognition loop
    Run {
        /// When to exit. Runs indefinitely unless specified.
        #[arg(long)]
        timeout: Option<humantime::Duration>,
    },
    /// Force a full gallery rebuild from the corpus
    Rebuild,
    /// Capture face images for an identity into the corpus
    Enroll {
        /// Person id (first filename segment)
        identity: String,
        /// Display name (may contain spaces)
        name: String,
        /// How many face images to capture
        #[arg(long, default_value_t = 5)]
        count: u32,
        /// How long to wait for enough faces
        #[arg(long, default_value = "30s")]
        timeout: humantime::Duration,
    },
}

fn main() -> Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    let args = Cli::parse();
    let config = build_config(&args)?;
    match args.command.clone() {
        Commands::Run { timeout } => handle_run(&args, config, timeout.map(Into::into)),
        Commands::Rebuild => handle_rebuild(&args, config),
        Commands::Enroll {
            identity,
            name,
            count,
            timeout,
        } => handle_enroll(&args, config, identity, name, count, timeout.into()),
    }
}

fn build_config(args: &Cli) -> Result<LockConfig> {
    let mode = match &args.pin {
        Some(pin) => SessionMode::FacePin {
            expected_pin: pin.clone(),
        },
        None => SessionMode::FaceOnly,
    };
    let after_match = if args.stop_on_match {
        AfterMatch::Stop
    } else {
        AfterMatch::Continue
    };
    LockConfig::new(
        args.lock_id.clone(),
        args.camera_index,
        args.model_dir.clone(),
        args.data_dir.clone(),
        args.threshold,
        args.dark_threshold,
        args.max_failures,
        args.lockout.into(),
        match args.detector {
            DetectorArg::Hog => DetectorKind::Hog,
            DetectorArg::Cnn => DetectorKind::Cnn,
        },
        mode,
        after_match,
    )
}

fn sync_remote(args: &Cli, config: &LockConfig) {
    let Some(base_url) = &args.remote else {
        return;
    };
    let synced = RemoteCorpus::new(base_url.clone()).and_then(|r| r.sync(&config.corpus_dir()));
    match synced {
        Ok(n) => info!("remote corpus sync: {n} new files"),
        Err(e) => warn!("remote corpus sync failed, continuing with local files: {e:#}"),
    }
}

fn telegram_from_env() -> Option<Arc<dyn Notifier>> {
    let token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
    let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;
    let notifier = match TelegramNotifier::new(token, chat_id) {
        Ok(n) => n,
        Err(e) => {
            warn!("telegram client setup failed, notifications disabled: {e:#}");
            return None;
        }
    };
    if !notifier.verify_token() {
        warn!("telegram token rejected, notifications disabled");
        return None;
    }
    Some(Arc::new(notifier))
}

type SerialChannel = Peripheral<File>;

fn open_serial(args: &Cli) -> Option<SerialChannel> {
    let path = args.serial.as_deref()?;
    match Peripheral::open(path) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!("no controller channel ({e:#}), running without one");
            None
        }
    }
}

/// Encode the frame a verdict was made on, for the notification photo.
/// Encoding trouble degrades the alert to text-only.
fn encode_snapshot(img: &image::DynamicImage) -> Option<Vec<u8>> {
    let mut png = Vec::new();
    match img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png) {
        Ok(()) => Some(png),
        Err(e) => {
            warn!("snapshot encode failed: {e}");
            None
        }
    }
}

/// Controller I/O degrades, never aborts recognition.
fn send_or_warn(channel: &mut Option<SerialChannel>, cmd: &Command) {
    if let Some(p) = channel.as_mut() {
        if let Err(e) = p.send(cmd) {
            warn!("controller send failed (skipped): {e:#}");
        }
    }
}

fn handle_rebuild(args: &Cli, config: LockConfig) -> Result<()> {
    sync_remote(args, &config);
    let extractor = DlibExtractor::new(&config)?;
    let store = GalleryStore::new(config.cache_path(), config.corpus_dir());
    let gallery = store.rebuild(&extractor)?;
    info!(
        "rebuilt gallery for {}: {} entries from {} source images",
        config.lock_id(),
        gallery.len(),
        gallery.provenance().len()
    );
    Ok(())
}

fn handle_run(args: &Cli, config: LockConfig, timeout: Option<Duration>) -> Result<()> {
    sync_remote(args, &config);
    let extractor = DlibExtractor::new(&config)?;
    let store = GalleryStore::new(config.cache_path(), config.corpus_dir());
    let gallery = store.load_or_rebuild(&extractor)?;
    info!("serving lock {} with {} known faces", config.lock_id(), gallery.len());
    let mut session = LockSession::new(&config, gallery, Box::new(extractor))?;

    let mut channel = open_serial(args);
    // One reader per tty: distance telemetry gets the read side only when
    // the PIN exchange doesn't need it.
    let distances = match (&args.serial, &config.mode) {
        (Some(path), SessionMode::FaceOnly) => match File::open(path) {
            Ok(f) => Some(DistanceMonitor::spawn(BufReader::new(f))),
            Err(e) => {
                warn!("no distance telemetry: {e}");
                None
            }
        },
        _ => None,
    };
    let notifier = telegram_from_env();

    let mut cam = Cam::start(config.camera_path())?;
    send_or_warn(&mut channel, &Command::SystemReady);
    let start = Instant::now();
    let outcome = loop {
        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                info!("run timeout reached");
                break Ok(());
            }
        }
        let frame = match cam.capture() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("frame capture failed: {e:#}");
                continue;
            }
        };
        let gray = frame_to_gray(frame)?;
        if is_dark(&gray, config.dark_threshold()) {
            info!("frame too dark, skipped");
            continue;
        }
        let img = to_rgb(&gray);
        match session.process_frame(&img, Instant::now())? {
            Verdict::NoFace => continue,
            Verdict::LockedOut { remaining } => {
                info!("locked out, {} remaining", humantime::format_duration(remaining));
                std::thread::sleep(Duration::from_secs(1));
            }
            Verdict::Denied {
                confidence_percent,
                lockout_tripped,
            } => {
                send_or_warn(&mut channel, &Command::Fail);
                if let Some(notifier) = &notifier {
                    notify_detached(
                        notifier,
                        AccessEvent::StrangerDetected {
                            confidence_percent,
                            distance: distances.as_ref().and_then(|d| d.latest()),
                            snapshot: encode_snapshot(&img),
                        },
                    );
                }
                if lockout_tripped {
                    warn!("lockout tripped after repeated failures");
                    if let Some(notifier) = &notifier {
                        notify_detached(
                            notifier,
                            AccessEvent::LockedOut {
                                duration: *args.lockout,
                            },
                        );
                    }
                }
            }
            Verdict::Granted {
                identity,
                display_name,
                confidence_percent,
            } => {
                if let SessionMode::FacePin { expected_pin } = &config.mode {
                    if !verify_pin(&mut channel, expected_pin, &mut session) {
                        continue;
                    }
                }
                info!("access granted to {display_name} ({identity}, {confidence_percent:.1}%)");
                send_or_warn(&mut channel, &Command::Success);
                if let Some(notifier) = &notifier {
                    notify_detached(
                        notifier,
                        AccessEvent::Granted {
                            display_name,
                            confidence_percent,
                            snapshot: encode_snapshot(&img),
                        },
                    );
                }
                if config.after_match == AfterMatch::Stop {
                    break Ok(());
                }
                // give the door time to cycle before the next attempt
                std::thread::sleep(Duration::from_secs(2));
            }
        }
    };
    send_or_warn(&mut channel, &Command::RecognitionDone);
    outcome
}

/// Second factor: collect a PIN on the controller and count mismatches
/// against the session's lockout.
fn verify_pin(
    channel: &mut Option<SerialChannel>,
    expected_pin: &str,
    session: &mut LockSession,
) -> bool {
    let Some(p) = channel.as_mut() else {
        warn!("face+pin mode without a controller channel, denying");
        return false;
    };
    match p.request_pin(Duration::from_secs(30)) {
        Ok(Some(pin)) if pin == expected_pin => true,
        Ok(Some(_)) => {
            warn!("wrong PIN entered");
            session.record_failure(Instant::now());
            let _ = p.send(&Command::Fail);
            false
        }
        Ok(None) => {
            warn!("controller reported PIN timeout");
            session.record_failure(Instant::now());
            false
        }
        Err(e) => {
            warn!("PIN exchange failed: {e}");
            false
        }
    }
}

fn handle_enroll(
    args: &Cli,
    config: LockConfig,
    identity: String,
    name: String,
    count: u32,
    timeout: Duration,
) -> Result<()> {
    if identity.contains('_') {
        bail!("identity must not contain underscores (used as filename separator)");
    }
    // PIN-gate enrollment when a controller is attached
    if let (Some(_), SessionMode::FacePin { expected_pin }) = (&args.serial, &config.mode) {
        let mut channel = open_serial(args);
        let Some(p) = channel.as_mut() else {
            bail!("controller unavailable for PIN check");
        };
        match p.request_pin(Duration::from_secs(30))? {
            Some(pin) if pin == *expected_pin => {
                info!("PIN accepted, starting capture");
                let _ = p.send(&Command::Success);
            }
            _ => {
                let _ = p.send(&Command::Fail);
                bail!("PIN check failed, enrollment refused");
            }
        }
    }

    let extractor = DlibExtractor::new(&config)?;
    let corpus = config.corpus_dir();
    std::fs::create_dir_all(&corpus)
        .with_context(|| format!("creating corpus dir {}", corpus.display()))?;
    let mut cam = Cam::start(config.camera_path())?;
    let start = Instant::now();
    let mut captured = 0;
    while captured < count {
        if start.elapsed() >= timeout {
            bail!("timeout: captured only {captured}/{count} face images");
        }
        let frame = cam.capture()?;
        let gray = frame_to_gray(frame)?;
        if is_dark(&gray, config.dark_threshold()) {
            info!("frame too dark, skipped");
            continue;
        }
        let img = to_rgb(&gray);
        match extractor.extract(&img) {
            Ok(Some(_)) => {
                let file = corpus.join(format!(
                    "{identity}_{}_straight_{}.png",
                    name.replace(' ', "_"),
                    captured + 1
                ));
                img.save(&file)
                    .with_context(|| format!("saving {}", file.display()))?;
                info!("captured {}", file.display());
                captured += 1;
            }
            Ok(None) => info!("no face in frame"),
            Err(e) => warn!("skipping frame: {e}"),
        }
    }
    // fold the new images into the gallery right away
    let store = GalleryStore::new(config.cache_path(), config.corpus_dir());
    let gallery = store.rebuild(&extractor)?;
    info!(
        "enrolled {} ({}): gallery now has {} entries",
        name,
        identity,
        gallery.len()
    );
    Ok(())
}
