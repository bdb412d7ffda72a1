use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use webeye::synthetic::SyntheticBackend;
use webeye::{
    CameraController, CameraProfile, CameraSettings, ControllerConfig, DeviceBackend, OurError,
    OurResult, Resolution, UserConfig,
};

#[derive(Parser)]
#[command(name = "webeye")]
#[command(about = "Camera controller: photos, live streams and MJPEG recordings")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Use synthetic test-pattern cameras instead of real hardware
    #[arg(long, global = true)]
    synthetic: bool,
}

#[derive(clap::Args)]
struct CameraArgs {
    /// Saved camera profile to open; --index, --resolution and --fps override it
    #[arg(long)]
    profile: Option<String>,
    /// Device index, defaults to the configured default index
    #[arg(long)]
    index: Option<u32>,
    /// Resolution as WIDTHxHEIGHT
    #[arg(long)]
    resolution: Option<Resolution>,
    /// Frames per second
    #[arg(long)]
    fps: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available cameras
    Devices,
    /// Capture a single photo
    Capture {
        #[command(flatten)]
        camera: CameraArgs,
        /// Output image, format chosen by extension
        #[arg(long, default_value = "photo.jpg")]
        output: PathBuf,
    },
    /// Stream frames for a while and report what arrived
    Stream {
        #[command(flatten)]
        camera: CameraArgs,
        /// Seconds to stream for
        #[arg(long, default_value = "5")]
        seconds: u64,
    },
    /// Record an MJPEG AVI
    Record {
        #[command(flatten)]
        camera: CameraArgs,
        /// Output video file
        #[arg(long, default_value = "recording.avi")]
        output: PathBuf,
        /// Seconds to record for
        #[arg(long, default_value = "5")]
        seconds: u64,
    },
    /// Show camera details
    Info {
        #[command(flatten)]
        camera: CameraArgs,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show configuration
    Show,
    /// Save a camera profile to the user config file
    SaveProfile {
        /// Profile id
        id: String,
        #[command(flatten)]
        camera: CameraArgs,
        /// Mark the profile as the active camera
        #[arg(long)]
        active: bool,
    },
    /// Remove a camera profile from the user config file
    RemoveProfile {
        /// Profile id
        id: String,
    },
}

fn main() -> OurResult<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    if cli.debug {
        debug!("Debug mode enabled");
    }

    let config = match ControllerConfig::new() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let backend = make_backend(cli.synthetic)?;

    match cli.command {
        Commands::Devices => list_devices(backend.as_ref()),
        Commands::Capture { camera, output } => {
            let controller = open_camera(backend, config, &camera)?;
            let photo = controller.capture_photo(None, Some(&output))?;
            let path = photo.saved()?;
            println!(
                "Captured {}x{} photo to {}",
                photo.frame().width(),
                photo.frame().height(),
                path.display()
            );
            Ok(())
        }
        Commands::Stream { camera, seconds } => {
            let controller = open_camera(backend, config, &camera)?;
            let (tx, rx) = crossbeam_channel::unbounded();
            controller.start_stream(None, move |frame| {
                let _ = tx.send((frame.sequence(), frame.width(), frame.height()));
            })?;

            std::thread::sleep(Duration::from_secs(seconds));
            controller.stop_stream(None)?;

            let frames: Vec<_> = rx.try_iter().collect();
            if let Some((_, width, height)) = frames.last() {
                println!("Received {} frames at {width}x{height}", frames.len());
            } else {
                println!("Received no frames");
            }
            report_error(&controller)
        }
        Commands::Record {
            camera,
            output,
            seconds,
        } => {
            let controller = open_camera(backend, config, &camera)?;
            controller.start_recording(None, &output)?;
            std::thread::sleep(Duration::from_secs(seconds));
            controller.stop_recording(None)?;
            let info = controller.info(None)?;
            println!(
                "Recorded {} frames to {}",
                info.frames_recorded,
                output.display()
            );
            report_error(&controller)
        }
        Commands::Info { camera, json } => {
            let controller = open_camera(backend, config, &camera)?;
            let info = controller.info(None)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("Camera {} ({})", info.index, info.device_name);
                println!("  State: {}", info.state);
                println!(
                    "  Resolution: {}@{}fps",
                    info.settings.resolution(),
                    info.settings.fps()
                );
                println!(
                    "  Brightness/contrast/saturation: {}/{}/{}",
                    info.settings.brightness(),
                    info.settings.contrast(),
                    info.settings.saturation()
                );
            }
            Ok(())
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("Configuration:");
                println!("{}", serde_json::to_string_pretty(&config)?);
                let path = ControllerConfig::get_config_path();
                let user_config = ControllerConfig::load_user_config();
                println!("Camera profiles ({}):", path.display());
                println!("{}", serde_json::to_string_pretty(&user_config)?);
                Ok(())
            }
            ConfigAction::SaveProfile { id, camera, active } => {
                let mut user_config = ControllerConfig::load_user_config();
                let (index, settings) = select_camera(&config, &user_config, &camera)?;
                user_config.set_camera(id.clone(), CameraProfile { index, settings });
                if active {
                    user_config.active = Some(id.clone());
                }
                ControllerConfig::save_user_config(&user_config)?;
                println!("Saved profile '{id}' for camera {index}");
                Ok(())
            }
            ConfigAction::RemoveProfile { id } => {
                let mut user_config = ControllerConfig::load_user_config();
                if user_config.get_camera(&id).is_none() {
                    return Err(OurError::NotFound(id));
                }
                user_config.remove_camera(&id);
                ControllerConfig::save_user_config(&user_config)?;
                println!("Removed profile '{id}'");
                Ok(())
            }
        },
    }
}

fn make_backend(synthetic: bool) -> OurResult<Box<dyn DeviceBackend>> {
    if synthetic {
        info!("Using synthetic cameras");
        return Ok(Box::new(SyntheticBackend::new().with_devices(0..2)));
    }

    #[cfg(feature = "usb")]
    return Ok(Box::new(webeye::usb_camera::UsbBackend::new()?));

    #[cfg(not(feature = "usb"))]
    {
        Err(OurError::DeviceUnavailable(
            "Built without USB support, use --synthetic".to_string(),
        ))
    }
}

fn list_devices(backend: &dyn DeviceBackend) -> OurResult<()> {
    let devices = backend.enumerate()?;
    if devices.is_empty() {
        println!("No cameras found");
        return Ok(());
    }

    for device in devices {
        println!("[{}] {}", device.index, device.name);
        println!("    hardware id: {}", device.hardware_id);
        if let (Some(vendor), Some(product)) = (&device.vendor_id, &device.product_id) {
            println!("    usb: {vendor}:{product}");
        }
    }
    Ok(())
}

/// Device index and settings from the named profile or the defaults, with flag overrides
fn select_camera(
    config: &ControllerConfig,
    user_config: &UserConfig,
    args: &CameraArgs,
) -> OurResult<(u32, CameraSettings)> {
    let (index, base) = match &args.profile {
        Some(id) => {
            let profile = user_config
                .get_camera(id)
                .ok_or_else(|| OurError::NotFound(format!("camera profile '{id}'")))?;
            (profile.index, &profile.settings)
        }
        None => (config.default_index, &config.default_settings),
    };

    let mut builder = base.to_builder();
    if let Some(resolution) = args.resolution {
        builder = builder.with_resolution(resolution.width, resolution.height);
    }
    if let Some(fps) = args.fps {
        builder = builder.with_fps(fps);
    }
    Ok((args.index.unwrap_or(index), builder.build()?))
}

fn open_camera(
    backend: Box<dyn DeviceBackend>,
    config: ControllerConfig,
    args: &CameraArgs,
) -> OurResult<CameraController> {
    let user_config = match args.profile {
        Some(_) => ControllerConfig::load_user_config(),
        None => UserConfig::default(),
    };
    let (index, settings) = select_camera(&config, &user_config, args)?;
    let camera_id = args.profile.as_deref().unwrap_or("cli");

    let mut controller = CameraController::with_backend(backend, config)?;
    controller.add_camera(camera_id, index, settings)?;
    controller.set_active(camera_id)?;
    Ok(controller)
}

fn report_error(controller: &CameraController) -> OurResult<()> {
    match controller.info(None)?.last_error {
        Some(error) => {
            warn!("Camera reported an error: {error}");
            Err(OurError::ReadFailure(error))
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_args(args: &[&str]) -> CameraArgs {
        let mut argv = vec!["webeye", "info"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).expect("Test operation should succeed");
        match cli.command {
            Commands::Info { camera, .. } => camera,
            _ => panic!("expected the info command"),
        }
    }

    fn profiles() -> UserConfig {
        let mut user_config = UserConfig::default();
        user_config.set_camera(
            "desk".to_string(),
            CameraProfile {
                index: 4,
                settings: CameraSettings::new(320, 240, 10).expect("Test operation should succeed"),
            },
        );
        user_config
    }

    #[test]
    fn test_defaults_without_profile() {
        let config = ControllerConfig::default();
        let (index, settings) = select_camera(&config, &profiles(), &camera_args(&[]))
            .expect("Test operation should succeed");
        assert_eq!(index, config.default_index);
        assert_eq!(settings, config.default_settings);
    }

    #[test]
    fn test_profile_selects_index_and_settings() {
        let config = ControllerConfig::default();
        let args = camera_args(&["--profile", "desk"]);
        let (index, settings) =
            select_camera(&config, &profiles(), &args).expect("Test operation should succeed");
        assert_eq!(index, 4);
        assert_eq!(settings.resolution(), Resolution::new(320, 240));
        assert_eq!(settings.fps(), 10);
    }

    #[test]
    fn test_flags_override_profile() {
        let config = ControllerConfig::default();
        let args = camera_args(&["--profile", "desk", "--index", "1", "--fps", "25"]);
        let (index, settings) =
            select_camera(&config, &profiles(), &args).expect("Test operation should succeed");
        assert_eq!(index, 1);
        assert_eq!(settings.resolution(), Resolution::new(320, 240));
        assert_eq!(settings.fps(), 25);
    }

    #[test]
    fn test_unknown_profile_is_not_found() {
        let config = ControllerConfig::default();
        let args = camera_args(&["--profile", "attic"]);
        assert!(matches!(
            select_camera(&config, &profiles(), &args),
            Err(OurError::NotFound(_))
        ));
    }

    #[test]
    fn test_save_profile_arguments() {
        let cli = Cli::try_parse_from([
            "webeye",
            "config",
            "save-profile",
            "garage",
            "--index",
            "2",
            "--resolution",
            "640x480",
            "--active",
        ])
        .expect("Test operation should succeed");
        let Commands::Config {
            action: ConfigAction::SaveProfile { id, camera, active },
        } = cli.command
        else {
            panic!("expected config save-profile");
        };
        assert_eq!(id, "garage");
        assert!(active);
        let (index, settings) =
            select_camera(&ControllerConfig::default(), &UserConfig::default(), &camera)
                .expect("Test operation should succeed");
        assert_eq!(index, 2);
        assert_eq!(settings.resolution(), Resolution::new(640, 480));
    }
}
