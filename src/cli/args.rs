//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Record two cameras at once with a live preview, then export stills
#[derive(Parser, Debug)]
#[command(name = "dualcam")]
#[command(version, about = "Dual-camera recorder", long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Config file path
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List available cameras
    ListCameras,
    /// Record both cameras until Ctrl+C or the duration elapses
    Record(RecordArgs),
    /// Export every Nth frame of a finished session as PNG
    Export(ExportArgs),
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Default, PartialEq)]
pub struct RecordArgs {
    /// Stop after this many seconds
    #[arg(long, short)]
    pub duration: Option<f64>,

    /// Directory that receives the session directory
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Requested capture width
    #[arg(long)]
    pub width: Option<u32>,

    /// Requested capture height
    #[arg(long)]
    pub height: Option<u32>,

    /// Requested frame rate
    #[arg(long)]
    pub fps: Option<u32>,

    /// Use generated test-pattern cameras instead of hardware
    #[arg(long)]
    pub synthetic: bool,
}

#[derive(clap::Args, Debug, PartialEq)]
pub struct ExportArgs {
    /// session.json, or the session directory holding it
    pub session: PathBuf,

    /// Export every Nth frame (default from config)
    #[arg(long, short)]
    pub interval: Option<u64>,

    /// Write images here instead of inside the session directory
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Create default config file
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_config_option() {
        let args = Args::parse_from(["dualcam", "--config", "/tmp/config.toml", "list-cameras"]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/config.toml")));

        let args = Args::parse_from(["dualcam", "list-cameras", "-c", "/tmp/test.toml"]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/test.toml")));
    }

    #[test]
    fn test_args_list_cameras_subcommand() {
        let args = Args::parse_from(["dualcam", "list-cameras"]);
        assert!(matches!(args.command, Some(Command::ListCameras)));
        assert!(args.config.is_none());
    }

    #[test]
    fn test_args_record_defaults() {
        let args = Args::parse_from(["dualcam", "record"]);
        match args.command {
            Some(Command::Record(record)) => assert_eq!(record, RecordArgs::default()),
            other => panic!("Expected record command, got {:?}", other),
        }
    }

    #[test]
    fn test_args_record_options() {
        let args = Args::parse_from([
            "dualcam",
            "record",
            "--duration",
            "3.5",
            "-o",
            "/tmp/rec",
            "--width",
            "640",
            "--height",
            "480",
            "--fps",
            "15",
            "--synthetic",
        ]);
        match args.command {
            Some(Command::Record(record)) => {
                assert_eq!(record.duration, Some(3.5));
                assert_eq!(record.output, Some(PathBuf::from("/tmp/rec")));
                assert_eq!(record.width, Some(640));
                assert_eq!(record.height, Some(480));
                assert_eq!(record.fps, Some(15));
                assert!(record.synthetic);
            }
            other => panic!("Expected record command, got {:?}", other),
        }
    }

    #[test]
    fn test_args_export_subcommand() {
        let args = Args::parse_from(["dualcam", "export", "/tmp/s/session.json", "-i", "10"]);
        match args.command {
            Some(Command::Export(export)) => {
                assert_eq!(export.session, PathBuf::from("/tmp/s/session.json"));
                assert_eq!(export.interval, Some(10));
                assert!(export.output.is_none());
            }
            other => panic!("Expected export command, got {:?}", other),
        }
    }

    #[test]
    fn test_args_export_requires_session() {
        assert!(Args::try_parse_from(["dualcam", "export"]).is_err());
    }

    #[test]
    fn test_args_config_show_subcommand() {
        let args = Args::parse_from(["dualcam", "config", "show"]);
        assert!(matches!(
            args.command,
            Some(Command::Config {
                action: ConfigAction::Show
            })
        ));
    }

    #[test]
    fn test_args_config_init_subcommand() {
        let args = Args::parse_from(["dualcam", "config", "init"]);
        assert!(matches!(
            args.command,
            Some(Command::Config {
                action: ConfigAction::Init
            })
        ));
    }
}
