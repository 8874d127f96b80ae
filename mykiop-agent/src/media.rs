//! Door camera recording hand-off
//!
//! The agent only decides when a recording starts and stops and whether the
//! resulting file is worth uploading. Capture itself is an external command
//! (e.g. `libcamera-vid`) spawned per door-open period.

use crate::clock::VehicleClock;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command as AsyncCommand};
use tracing::{debug, info, warn};

/// A locally stored recording awaiting upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaArtifact {
    #[serde(rename = "video_path")]
    pub path: PathBuf,
    #[serde(rename = "video_name")]
    pub name: String,
}

/// Recording collaborator driven by door events
#[async_trait]
pub trait MediaPipeline: Send {
    /// Door opened
    async fn start_recording(&mut self) -> Result<()>;

    /// Door closed; returns the finished recording, if one was running
    async fn stop_recording(&mut self) -> Result<Option<MediaArtifact>>;
}

/// Used when no capture command is configured
#[derive(Debug, Default)]
pub struct DisabledMedia;

#[async_trait]
impl MediaPipeline for DisabledMedia {
    async fn start_recording(&mut self) -> Result<()> {
        debug!("Recording disabled, ignoring door open");
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<Option<MediaArtifact>> {
        Ok(None)
    }
}

/// Optional post-stop step turning the raw capture into an uploadable file
#[derive(Debug, Clone)]
pub struct Conversion {
    /// argv with `{input}` and `{output}` placeholders
    pub argv: Vec<String>,
    pub extension: String,
}

/// Runs an external capture command for the length of a door-open period
pub struct CommandRecorder {
    argv: Vec<String>,
    output_dir: PathBuf,
    extension: String,
    clock: VehicleClock,
    conversion: Option<Conversion>,
    running: Option<(Child, MediaArtifact)>,
}

impl CommandRecorder {
    /// `argv` may contain a `{path}` placeholder for the output file
    pub fn new(argv: Vec<String>, output_dir: PathBuf, extension: String, clock: VehicleClock) -> Self {
        Self {
            argv,
            output_dir,
            extension,
            clock,
            conversion: None,
            running: None,
        }
    }

    /// Convert every finished recording (e.g. raw h264 to mp4) before
    /// handing it over
    pub fn with_conversion(mut self, conversion: Conversion) -> Self {
        self.conversion = Some(conversion);
        self
    }

    /// Run the conversion; the raw capture is removed only when the command
    /// exits successfully, otherwise it is returned unchanged.
    async fn convert(&self, raw: MediaArtifact) -> MediaArtifact {
        let Some(conversion) = &self.conversion else {
            return raw;
        };
        let Some((program, args)) = conversion.argv.split_first() else {
            return raw;
        };

        let path = raw.path.with_extension(&conversion.extension);
        let converted = MediaArtifact {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| raw.name.clone()),
            path,
        };

        let input = raw.path.to_string_lossy();
        let output = converted.path.to_string_lossy();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.replace("{input}", &input).replace("{output}", &output))
            .collect();

        let status = AsyncCommand::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => {
                if let Err(e) = tokio::fs::remove_file(&raw.path).await {
                    warn!("Could not remove raw recording {}: {}", raw.path.display(), e);
                }
                info!("Recording converted to {}", converted.path.display());
                converted
            }
            Ok(status) => {
                warn!("Conversion exited with {}, keeping {}", status, raw.path.display());
                raw
            }
            Err(e) => {
                warn!("Failed to run conversion {}: {}, keeping {}", program, e, raw.path.display());
                raw
            }
        }
    }

    fn next_artifact(&self) -> MediaArtifact {
        let stamp = self.clock.now().format("%Y-%m-%dT%H-%M-%S");
        let name = format!("video_{}.{}", stamp, self.extension);
        MediaArtifact {
            path: self.output_dir.join(&name),
            name,
        }
    }
}

#[async_trait]
impl MediaPipeline for CommandRecorder {
    async fn start_recording(&mut self) -> Result<()> {
        if self.running.is_some() {
            debug!("Recording already running");
            return Ok(());
        }

        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("empty record command"))?;

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;

        let artifact = self.next_artifact();
        let target = artifact.path.to_string_lossy();
        let args: Vec<String> = args.iter().map(|a| a.replace("{path}", &target)).collect();

        let child = AsyncCommand::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn record command {}", program))?;

        info!("Started recording to {}", artifact.path.display());
        self.running = Some((child, artifact));
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<Option<MediaArtifact>> {
        let Some((mut child, artifact)) = self.running.take() else {
            return Ok(None);
        };

        if let Err(e) = child.kill().await {
            warn!("Record command did not stop cleanly: {}", e);
        }

        info!("Recording stopped, saved to {}", artifact.path.display());
        Ok(Some(self.convert(artifact).await))
    }
}
