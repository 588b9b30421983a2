//! Loopback session example
//!
//! Negotiates a session between the two in-process peers, then pushes a
//! synthetic 30 fps video track from Local and reports what reaches the
//! render target on Remote.
//!
//! Usage:
//!   cargo run --example loopback -- [config.json] [seconds]
//!
//! Examples:
//!   # Defaults (loopback engine, VP8, run until Ctrl+C)
//!   RUST_LOG=debug cargo run --example loopback
//!
//!   # Custom config, stop after 5 seconds
//!   cargo run --example loopback -- session.json 5

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use webrtc_loopback::{
    MediaFrame, RenderTarget, RtcContext, Session, SessionConfig, SessionEvent,
    DEFAULT_VIDEO_FRAME_DURATION,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => SessionConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => SessionConfig::default(),
    };
    let run_for = args.get(2).and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs);

    println!("========================================");
    println!("  WebRTC Loopback Session");
    println!("========================================");
    println!();
    println!("Engine:        {:?}", config.engine);
    println!("Video codec:   {:?}", config.video_codec);
    println!("Step timeout:  {:?}", config.step_timeout());
    println!();

    let context = RtcContext::initialize(config)?;
    let target = RenderTarget::new("loopback-screen");
    let session = Session::start(&context, Some(target.clone())).await?;
    let mut events = session.take_events().ok_or("session events already taken")?;

    let track = session.add_local_video_track().await?;
    println!("[OK] Video track '{}' attached, negotiating...", track.id());

    // Wait for the first round
    loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv()).await? {
            Some(SessionEvent::NegotiationCompleted(report)) => {
                println!("[OK] Round {} completed in {:?}", report.round, report.total);
                for timing in &report.timings {
                    println!("       {:<16} {:?}", format!("{:?}", timing.step), timing.elapsed);
                }
                break;
            }
            Some(SessionEvent::NegotiationFailed { round, error }) => {
                return Err(format!("round {} failed: {}", round, error).into());
            }
            Some(SessionEvent::TrackReceived { track_id, kind, codec }) => {
                println!("[OK] Remote received {:?} track '{}' ({:?})", kind, track_id, codec);
            }
            Some(SessionEvent::RelayFailed(e)) => println!("[WARN] {}", e),
            None => return Err("session stopped".into()),
        }
    }
    println!();

    // Set up ctrl+c handler
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, shutting down...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    println!("Streaming... Press Ctrl+C to stop.");
    println!();

    let started = Instant::now();
    let mut ticker = tokio::time::interval(DEFAULT_VIDEO_FRAME_DURATION);
    let mut timestamp: u32 = 0;
    let mut frames_sent: u64 = 0;
    let mut last_report = Instant::now();

    while running.load(Ordering::SeqCst) && run_for.map_or(true, |d| started.elapsed() < d) {
        ticker.tick().await;

        // Synthetic payload: frame counter in the first bytes
        let mut payload = vec![0u8; 1200];
        payload[..8].copy_from_slice(&frames_sent.to_be_bytes());
        track.push_frame(&MediaFrame::video(payload, timestamp));
        timestamp = timestamp.wrapping_add(3000);
        frames_sent += 1;

        if last_report.elapsed() >= Duration::from_secs(1) {
            println!(
                "Sent: {} frames | Presented: {} | Candidates applied: local {} remote {}",
                frames_sent,
                target.frames_presented(),
                session.local().candidates_applied(),
                session.remote().candidates_applied(),
            );
            last_report = Instant::now();
        }
    }

    println!();
    println!("Closing session...");
    session.close().await;
    context.shutdown();
    println!("[OK] Closed ({} frames presented)", target.frames_presented());

    Ok(())
}
