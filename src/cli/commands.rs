//! Subcommand handlers for list-cameras, record, export and config actions.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::args::{ConfigAction, ExportArgs, RecordArgs};
use crate::camera::{
    CameraBackend, CameraDevice, CameraError, CameraId, Capability, Detection, DeviceOpener,
    DeviceRegistry, SyntheticBackend, V4l2Backend,
};
use crate::config::{default_path as get_config_path, Config, DEFAULT_CONFIG};
use crate::export::FrameExporter;
use crate::recording::{RecordingSession, SessionDescriptor, SessionOutcome, SessionStatus};

static CTRLC_RECEIVED: AtomicBool = AtomicBool::new(false);

/// How often the record loop checks for Ctrl+C and prints progress.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

fn setup_ctrlc_handler() -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        CTRLC_RECEIVED.store(true, Ordering::SeqCst);
        eprintln!("\nReceived Ctrl+C, stopping recording...");
    })
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn registry(backend: Arc<dyn CameraBackend>, config: &Config) -> DeviceRegistry {
    DeviceRegistry::new(backend).with_probe_timeout(config.probe_timeout())
}

fn print_device(device: &CameraDevice) {
    println!("  {}", device);
    println!("      identity: {:?}", device.identity);
    let candidates: Vec<String> = device
        .access_candidates
        .iter()
        .map(ToString::to_string)
        .collect();
    println!("      open via: {}", candidates.join(", "));
    for mode in device.best_modes(4) {
        println!("      mode: {}", mode);
    }
}

fn print_skipped(detection: &Detection) {
    for skipped in &detection.skipped {
        eprintln!(
            "Warning: skipped {}: {}",
            skipped.node.os_path.display(),
            skipped.error
        );
    }
}

/// List available cameras and print them to stdout.
pub fn list_cameras(config: &Config) {
    let detection = match registry(Arc::new(V4l2Backend::default()), config).detect_cameras() {
        Ok(detection) => detection,
        Err(e) => fail(e),
    };

    if detection.is_empty() {
        println!("No cameras found.");
        println!();
        println!("Make sure your cameras are connected and you can read /dev/video*.");
        println!("On most distributions that means being in the 'video' group.");
    } else {
        println!("Available cameras:");
        for device in &detection.devices {
            print_device(device);
        }
    }
    print_skipped(&detection);
}

/// Capture mode requested on the command line, falling back to the config.
fn requested_capability(args: &RecordArgs, config: &Config) -> Capability {
    let mut requested = config.requested_capability();
    if let Some(width) = args.width {
        requested.resolution.width = width;
    }
    if let Some(height) = args.height {
        requested.resolution.height = height;
    }
    if let Some(fps) = args.fps {
        requested.fps = fps;
    }
    requested
}

/// Detect, open both cameras, record until Ctrl+C or the duration elapses.
pub fn record(args: RecordArgs, config: &Config) {
    let backend: Arc<dyn CameraBackend> = if args.synthetic {
        Arc::new(SyntheticBackend::pair())
    } else {
        Arc::new(V4l2Backend::default())
    };

    let detection = match registry(Arc::clone(&backend), config).detect_cameras() {
        Ok(detection) => detection,
        Err(e) => fail(e),
    };
    print_skipped(&detection);
    let [first, second] = match detection.select_pair() {
        Ok(pair) => pair,
        Err(e) => fail(e),
    };

    let requested = requested_capability(&args, config);
    let opener = DeviceOpener::new(backend);
    let open = |device: &CameraDevice| match opener.open_with_fallback(device, &requested) {
        Ok(handle) => handle,
        Err(e) => {
            if let CameraError::DeviceBusy(_) = e {
                eprintln!("Close other applications using the camera and try again.");
            }
            fail(e)
        }
    };
    let handles = [open(&first), open(&second)];
    for handle in &handles {
        println!(
            "{}: {} ({}) via {}",
            handle.stable_id(),
            handle.device().name(),
            handle.mode(),
            handle.opened_via()
        );
    }

    let mut options = config.session_options();
    if let Some(output) = &args.output {
        options.output_root = output.clone();
    }

    if let Err(e) = setup_ctrlc_handler() {
        log::warn!("Failed to set Ctrl+C handler: {}", e);
    }

    let mut session = RecordingSession::new(handles, options);
    if let Err(e) = session.start_preview() {
        fail(e);
    }
    if let Err(e) = session.start_recording() {
        fail(e);
    }
    if let Some(dir) = session.session_dir() {
        println!("Recording to {}", dir.display());
    }
    println!("Press Ctrl+C to stop.");

    wait_for_stop(&session, args.duration.map(Duration::from_secs_f64));
    println!();

    match session.stop() {
        Ok(outcome) => print_outcome(&outcome),
        Err(e) => {
            if let Some(outcome) = session.outcome() {
                print_outcome(&outcome);
            }
            fail(e);
        }
    }
}

fn wait_for_stop(session: &RecordingSession, duration: Option<Duration>) {
    let started = Instant::now();
    loop {
        if CTRLC_RECEIVED.load(Ordering::SeqCst) {
            break;
        }
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        if session.status() != SessionStatus::Recording {
            break;
        }
        print!(
            "\r{:>7.1}s  camera1: {:>6} frames  camera2: {:>6} frames",
            started.elapsed().as_secs_f64(),
            session.frames_recorded(CameraId::FIRST),
            session.frames_recorded(CameraId::SECOND)
        );
        let _ = std::io::stdout().flush();
        std::thread::sleep(PROGRESS_INTERVAL);
    }
}

fn print_outcome(outcome: &SessionOutcome) {
    let descriptor = &outcome.descriptor;
    println!(
        "Session {} ({:.1}s){}",
        descriptor.session_id,
        descriptor.duration_secs,
        if descriptor.failed { " FAILED" } else { "" }
    );
    for camera in &descriptor.cameras {
        println!(
            "  {}: {} frames at {} -> {}{}",
            camera.camera_id,
            camera.frame_count,
            camera.resolution,
            camera.output_path.display(),
            if camera.faulted { " (camera failed)" } else { "" }
        );
    }
    println!("Descriptor: {}", outcome.descriptor_path.display());
}

/// Export every Nth frame of a finished session.
pub fn export(args: ExportArgs, config: &Config) {
    let descriptor = match SessionDescriptor::load(&args.session) {
        Ok(descriptor) => descriptor,
        Err(e) => fail(e),
    };
    let interval = args.interval.unwrap_or(config.export.interval);

    let mut exporter = FrameExporter::new();
    if let Some(output) = args.output {
        exporter = exporter.with_output_dir(output);
    }
    let summary = match exporter.export_frames(&descriptor, interval) {
        Ok(summary) => summary,
        Err(e) => fail(e),
    };

    println!(
        "Exported every {} frame(s) to {}",
        summary.interval,
        summary.output_dir.display()
    );
    for (camera, result) in &summary.cameras {
        println!(
            "  {}: {} exported, {} skipped",
            camera,
            result.exported.len(),
            result.skipped.len()
        );
        for skipped in &result.skipped {
            println!("    skipped {}", skipped);
        }
    }
}

/// Handle config subcommand actions.
pub fn handle_config_action(action: ConfigAction, config_path: Option<&Path>, config: &Config) {
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(get_config_path);

    match action {
        ConfigAction::Show => {
            let requested = config.requested_capability();
            println!("Current configuration:");
            println!("  Probe timeout: {} ms", config.devices.probe_timeout_ms);
            println!("  Capture: {}", requested);
            println!("  Output dir: {}", config.output_dir().display());
            println!(
                "  Queue: {} frames, {} MB ceiling per camera",
                config.recording.queue_capacity, config.recording.memory_ceiling_mb
            );
            println!(
                "  Rotation: {}° / {}°",
                config.recording.rotation[0].degrees(),
                config.recording.rotation[1].degrees()
            );
            println!(
                "  Preview: {} fps, no signal after {} ms",
                config.preview.fps, config.preview.staleness_ms
            );
            println!("  Export interval: {}", config.export.interval);
            println!();

            if config_path.exists() {
                println!("Config file: {} (exists)", config_path.display());
            } else {
                println!("Config file: {} (not found)", config_path.display());
            }
        }
        ConfigAction::Init => {
            if config_path.exists() {
                eprintln!("Config file already exists: {}", config_path.display());
                eprintln!("Use 'dualcam config show' to view current settings.");
                std::process::exit(1);
            }

            if let Some(parent) = config_path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    eprintln!("Error creating config directory: {}", e);
                    std::process::exit(1);
                }
            }

            if let Err(e) = std::fs::write(&config_path, DEFAULT_CONFIG) {
                eprintln!("Error writing config file: {}", e);
                std::process::exit(1);
            }

            println!("Created config file: {}", config_path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{PixelFormat, Resolution};

    #[test]
    fn test_requested_capability_overrides() {
        let config = Config::default();
        let args = RecordArgs {
            width: Some(640),
            height: Some(480),
            ..RecordArgs::default()
        };
        let requested = requested_capability(&args, &config);
        assert_eq!(requested.resolution, Resolution::VGA);
        assert_eq!(requested.fps, 30);
        assert_eq!(requested.pixel_format, PixelFormat::Mjpeg);
    }

    #[test]
    fn test_requested_capability_from_config() {
        let mut config = Config::default();
        config.capture.fps = 15;
        let requested = requested_capability(&RecordArgs::default(), &config);
        assert_eq!(requested, Capability::new(1280, 720, 15, PixelFormat::Mjpeg));
    }
}
