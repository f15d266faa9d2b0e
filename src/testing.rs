//! Stand-in transcoders for tests. They honour the same contract as ffmpeg,
//! media on stdin and the destination as the last argument, and write into
//! a directory under a file name derived from the destination.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transcoder::{TranscoderCommand, DESTINATION_PLACEHOLDER};

const RECORD_PATH: &str = r#""$0/$(printf '%s' "$1" | tr '/:' '__')""#;

pub fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Where the stand-ins record what was sent to `destination`.
pub fn recorded(dir: &Path, destination: &str) -> PathBuf {
    dir.join(destination.replace(['/', ':'], "_"))
}

/// Copies its input into the recording for its destination.
pub fn recording_command(dir: &Path) -> TranscoderCommand {
    TranscoderCommand::new(
        "sh",
        [
            "-c".to_string(),
            format!("cat > {}", RECORD_PATH),
            dir.display().to_string(),
            DESTINATION_PLACEHOLDER.to_string(),
        ],
    )
}

/// Ignores SIGTERM and never reads its input. Writes `ready` into the
/// recording for its destination once the signal disposition is in place.
pub fn stubborn_command(dir: &Path) -> TranscoderCommand {
    TranscoderCommand::new(
        "sh",
        [
            "-c".to_string(),
            format!("trap '' TERM; echo ready > {}; exec sleep 30", RECORD_PATH),
            dir.display().to_string(),
            DESTINATION_PLACEHOLDER.to_string(),
        ],
    )
}

pub async fn wait_for_file(path: &Path) {
    for _ in 0..300 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never appeared", path.display());
}
