//! External decoder subprocess supervision.
//!
//! Network sources are decoded by an external process (ffmpeg by default)
//! invoked with fixed arguments so its stdout carries raw interleaved s16
//! PCM at the engine's configured rate. One supervision loop runs per
//! network source, restarting the process after crashes under a rate limit.

mod supervisor;

pub use supervisor::SupervisorState;
pub(crate) use supervisor::{spawn_supervisor, SupervisorHandle};

use std::process::Stdio;

use tokio::process::Command;

use crate::source::Transport;

/// Builds the decoder invocation for one stream URL.
///
/// The argument list mirrors a standard ffmpeg RTSP pull: video disabled,
/// raw s16le PCM at the configured rate and channel count on stdout.
pub(crate) fn decoder_command(
    program: &str,
    url: &str,
    transport: Transport,
    sample_rate: u32,
    channels: u16,
) -> Command {
    let mut command = Command::new(program);
    command
        .arg("-rtsp_transport")
        .arg(transport.as_arg())
        .arg("-i")
        .arg(url)
        .arg("-loglevel")
        .arg("error")
        .arg("-vn")
        .arg("-f")
        .arg("s16le")
        .arg("-ar")
        .arg(sample_rate.to_string())
        .arg("-ac")
        .arg(channels.to_string())
        .arg("pipe:1");
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_command_arguments() {
        let command = decoder_command("ffmpeg", "rtsp://cam/live", Transport::Tcp, 48_000, 1);
        let std_command = command.as_std();

        assert_eq!(std_command.get_program(), "ffmpeg");
        let args: Vec<String> = std_command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-rtsp_transport",
                "tcp",
                "-i",
                "rtsp://cam/live",
                "-loglevel",
                "error",
                "-vn",
                "-f",
                "s16le",
                "-ar",
                "48000",
                "-ac",
                "1",
                "pipe:1",
            ]
        );
    }

    #[test]
    fn test_decoder_command_udp_transport() {
        let command = decoder_command("ffmpeg", "rtsp://cam/live", Transport::Udp, 44_100, 2);
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"udp".to_string()));
        assert!(args.contains(&"44100".to_string()));
        assert!(args.contains(&"2".to_string()));
    }
}
