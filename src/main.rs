use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use kandar::capture::RegionError;
use kandar::config::{AppConfig, SessionConfig, app_name, version};
use kandar::pipeline::{MediaKind, PipelineError, PipelineLifecycle, TrackConsumer};
use kandar::utils::SignalOfStop;
use log::{error, info, warn};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const EXIT_INTERRUPTED: i32 = 130;

fn cli() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("ID")
                .help("Device, file or 'testsrc[:seconds]' to capture"),
        )
        .arg(
            Arg::new("region")
                .short('r')
                .long("region")
                .value_name("WxH+X+Y")
                .help("Capture geometry"),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("FPS")
                .value_parser(value_parser!(u32))
                .help("Capture frame rate"),
        )
        .arg(
            Arg::new("loop")
                .short('l')
                .long("loop")
                .action(ArgAction::SetTrue)
                .help("Replay a finite source from the start when it ends"),
        )
        .arg(
            Arg::new("throttle")
                .long("throttle")
                .value_name("yes/no")
                .help("Pace delivery to wall-clock time (default: unless the source is live)")
                .ignore_case(true)
                .value_parser(["yes", "no"]),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .value_parser(value_parser!(f64))
                .help("Stop after this many seconds"),
        )
        .arg(
            Arg::new("no-audio")
                .long("no-audio")
                .action(ArgAction::SetTrue)
                .help("Ignore the audio stream"),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<AppConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    let pipeline = &mut config.pipeline;
    if let Some(source) = matches.get_one::<String>("source") {
        pipeline.region.device_or_desktop_id = source.clone();
    }
    if let Some(geometry) = matches.get_one::<String>("region") {
        pipeline.region = pipeline.region.parse_geometry(geometry)?;
    }
    if let Some(fps) = matches.get_one::<u32>("fps") {
        pipeline.region.framerate = *fps;
    }
    if matches.get_flag("loop") {
        pipeline.loop_enabled = true;
    }
    if let Some(throttle) = matches.get_one::<String>("throttle") {
        pipeline.throttle = Some(throttle.eq_ignore_ascii_case("yes"));
    }
    if matches.get_flag("no-audio") {
        pipeline.audio = false;
    }
    Ok(config)
}

/// Read a local track until the pipeline ends it
fn drain(mut track: TrackConsumer) -> anyhow::Result<std::thread::JoinHandle<u64>> {
    let name = format!("kandar-{}-drain", track.kind());
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("Failed to start drain runtime: {}", e);
                    return 0;
                }
            };
            runtime.block_on(async move {
                let mut received = 0;
                while track.recv().await.is_ok() {
                    received += 1;
                }
                received
            })
        })
        .context("spawn drain thread")?;
    Ok(handle)
}

fn run(config: AppConfig, duration: Option<Duration>, quit: SignalOfStop) -> anyhow::Result<()> {
    let session = if config.session.is_enabled() {
        warn!(
            "No signaling connector is built into {}; ignoring server {}",
            app_name(),
            config.session.server_url
        );
        SessionConfig::default()
    } else {
        config.session
    };
    let audio = config.pipeline.audio;

    let rendered = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&rendered);
    let mut pipeline = PipelineLifecycle::new(config.pipeline, session).with_preview(Arc::new(
        move |_: &[u8], width: u32, height: u32| {
            let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 {
                info!("Preview: first frame {}x{}", width, height);
            }
        },
    ));

    let video = match pipeline.attach(MediaKind::Video) {
        Ok(consumer) => consumer,
        Err(PipelineError::InvalidRegion(e @ RegionError::InvalidSize { .. })) => {
            error!("Video size too small");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    let mut drains = Vec::new();
    let mut consumers = vec![video.id];
    if let Some(track) = video.track {
        drains.push(drain(track)?);
    }
    if audio {
        match pipeline.attach(MediaKind::Audio) {
            Ok(consumer) => {
                consumers.push(consumer.id);
                if let Some(track) = consumer.track {
                    drains.push(drain(track)?);
                }
            }
            Err(PipelineError::MissingStream(_)) => info!("Source has no audio"),
            Err(e) => warn!("Audio not attached: {}", e),
        }
    }

    let started = Instant::now();
    loop {
        if quit.wait_timeout(Duration::from_millis(200)) {
            info!("Interrupted");
            break;
        }
        if pipeline.source_ended() {
            if pipeline.source_failed() {
                warn!("Source failed");
            } else {
                info!("Source finished");
            }
            break;
        }
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
    }

    for id in consumers {
        pipeline.detach(id)?;
    }
    let queued: u64 = drains.into_iter().filter_map(|d| d.join().ok()).sum();
    info!(
        "Previewed {} frames, {} items queued locally",
        rendered.load(Ordering::Relaxed),
        queued
    );
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = cli().get_matches();
    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            process::exit(2);
        }
    };
    let duration = matches
        .get_one::<f64>("duration")
        .filter(|secs| secs.is_finite() && **secs > 0.0)
        .map(|secs| Duration::from_secs_f64(*secs));

    // stop gracefully on Ctrl-C
    let quit = SignalOfStop::new();
    let signal = quit.clone();
    if let Err(e) = ctrlc::set_handler(move || signal.cancel()) {
        warn!("Cannot install Ctrl-C handler: {}", e);
    }

    info!("{} {}", app_name(), version());
    if let Err(e) = run(config, duration, quit.clone()) {
        error!("{:#}", e);
        process::exit(1);
    }
    if quit.cancelled() {
        process::exit(EXIT_INTERRUPTED);
    }
}
