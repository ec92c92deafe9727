use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use irr_transcode::{
    backend::CodecBackend,
    session::Session,
    sink::SocketSink,
    source::IngressFrame,
};
use tokio_util::sync::CancellationToken;

mod config;

use config::StreamerConfig;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("irr_transcode", log::LevelFilter::Debug)
        .filter_module("irr_streamer", log::LevelFilter::Debug)
        .init();
}

#[cfg(feature = "ffmpeg")]
fn backend() -> Box<dyn CodecBackend> {
    Box::new(irr_transcode::backend::ffmpeg::FfmpegBackend::new())
}

#[cfg(not(feature = "ffmpeg"))]
fn backend() -> Box<dyn CodecBackend> {
    Box::new(irr_transcode::backend::raw::RawBackend::new())
}

/// Renders a scrolling gradient into `buf`.
fn paint(buf: &mut [u8], width: usize, tick: usize) {
    for (i, pixel) in buf.chunks_exact_mut(4).enumerate() {
        let (x, y) = (i % width, i / width);
        pixel.copy_from_slice(&[(x + tick) as u8, (y + tick / 2) as u8, tick as u8, 0xFF]);
    }
}

/// Stand-in renderer pushing frames at `fps` until cancelled.
fn run_pattern(session: Arc<Session>, fps: u32, cancel: CancellationToken) {
    let (width, height) = {
        let descriptor = session.source().descriptor();
        (descriptor.width as usize, descriptor.height as usize)
    };
    let interval = Duration::from_micros(1_000_000 / fps.max(1) as u64);
    let mut buf = vec![0u8; width * height * 4];
    let mut next = Instant::now();
    let mut tick = 0usize;
    while !cancel.is_cancelled() {
        paint(&mut buf, width, tick);
        let frame = IngressFrame::Raw {
            data: &buf,
            stride: width * 4,
            flip: false,
        };
        if let Err(e) = session.push_frame(frame, None) {
            log::debug!("frame dropped: {}", e);
        }
        tick = tick.wrapping_add(1);
        next += interval;
        std::thread::sleep(next.saturating_duration_since(Instant::now()));
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run().await {
        log::error!("irr-streamer failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    irr_transcode::init()?;
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = StreamerConfig::load(path.as_deref())?;

    let sink = SocketSink::bind(config.listen.as_str())?;
    let session = Arc::new(Session::new(
        config.transcoder.clone(),
        backend(),
        Box::new(sink),
    )?);
    session.start()?;
    log::info!("streaming on {}", config.listen);

    let cancel = CancellationToken::new();
    let renderer = {
        let session = Arc::clone(&session);
        let cancel = cancel.clone();
        let fps = config.pattern_fps;
        tokio::task::spawn_blocking(move || run_pattern(session, fps, cancel))
    };

    tokio::select! {
        _ = cancel.cancelled() => {},
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            cancel.cancel();
        },
    }

    renderer.await?;
    tokio::task::spawn_blocking(move || session.stop()).await?;
    Ok(())
}
