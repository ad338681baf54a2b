use std::io;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::config::CommandConfig;

/// Which wrapped binary this invocation stands in for, resolved once from
/// the name the process was started under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    Probe,
    Transcode,
}

impl InvocationMode {
    /// `ffprobe` anywhere in the file name selects probe mode, `ffmpeg`
    /// selects transcode mode; anything else is not a dispatcher alias.
    pub fn from_program_name(argv0: impl AsRef<Path>) -> Option<Self> {
        let name = argv0.as_ref().file_name()?.to_string_lossy().to_lowercase();
        if name.contains("ffprobe") {
            Some(InvocationMode::Probe)
        } else if name.contains("ffmpeg") {
            Some(InvocationMode::Transcode)
        } else {
            None
        }
    }

    pub fn binary_name(&self) -> &'static str {
        match self {
            InvocationMode::Probe => "ffprobe",
            InvocationMode::Transcode => "ffmpeg",
        }
    }

    pub fn remote_binary<'a>(&self, commands: &'a CommandConfig) -> &'a str {
        match self {
            InvocationMode::Probe => &commands.ffprobe,
            InvocationMode::Transcode => &commands.ffmpeg,
        }
    }

    pub fn local_binary(&self, commands: &CommandConfig) -> PathBuf {
        match self {
            InvocationMode::Probe => commands.local_ffprobe(),
            InvocationMode::Transcode => commands.local_ffmpeg(),
        }
    }

    /// Where the child's stdout goes.
    ///
    /// ffmpeg writes progress to stderr and only uses stdout for
    /// informational queries like `-version` or `-encoders`, so in transcode
    /// mode stdout is folded into stderr unless one of `special_flags` is
    /// present. ffprobe always reports on stdout.
    pub fn output_stream(&self, args: &[String], special_flags: &[String]) -> OutputStream {
        match self {
            InvocationMode::Probe => OutputStream::Stdout,
            InvocationMode::Transcode => {
                if args.iter().any(|a| special_flags.contains(a)) {
                    OutputStream::Stdout
                } else {
                    OutputStream::Stderr
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    /// Stdio for the child's stdout, pointed at our own stdout or stderr.
    pub fn child_stdout(&self) -> io::Result<Stdio> {
        match self {
            OutputStream::Stdout => Ok(Stdio::inherit()),
            OutputStream::Stderr => {
                let fd = io::stderr().as_fd().try_clone_to_owned()?;
                Ok(Stdio::from(fd))
            }
        }
    }
}
