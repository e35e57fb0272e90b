//! The external compiler boundary.
//!
//! The pipeline writes a translation bundle to a source file, asks a
//! [`Toolchain`] to build an artifact from it, and later loads entry points
//! back out of the artifact. [`PortableToolchain`] keeps everything
//! in-process (parse, validate, rewrite) and is the default.
//! [`CommandToolchain`] shells out to a configured command line with a
//! deadline, for setups where an actual external compiler owns the artifact
//! format.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::ToolchainError;
use crate::jit::translation::{Translation, TranslationBundle};

/// A compiler the pipeline can drive.
///
/// Implementations must be callable from the worker thread while the
/// interpreter keeps running.
pub trait Toolchain: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Extension for translation source files.
    fn source_extension(&self) -> &'static str {
        "tu"
    }

    /// Extension for compiled artifacts.
    fn artifact_extension(&self) -> &'static str {
        "kso"
    }

    /// Build `artifact` from `source`.
    fn compile(&self, source: &Path, artifact: &Path) -> Result<(), ToolchainError>;

    /// Extract the translations an artifact carries.
    fn load(&self, artifact: &Path) -> Result<Vec<Translation>, ToolchainError>;

    /// Release whatever `load` mapped in. File removal is the cache's job.
    fn unload(&self, _artifact: &Path) {}
}

/// Read and validate a bundle file.
pub(crate) fn read_bundle(path: &Path) -> Result<Vec<Translation>, ToolchainError> {
    let text = fs::read_to_string(path)?;
    let bundle = TranslationBundle::from_json(&text)?;
    for translation in &bundle.units {
        translation.validate()?;
    }
    Ok(bundle.units)
}

/// In-process toolchain: the artifact is the validated bundle itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortableToolchain;

impl Toolchain for PortableToolchain {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn compile(&self, source: &Path, artifact: &Path) -> Result<(), ToolchainError> {
        let units = read_bundle(source)?;
        let out = TranslationBundle::new(units).to_json()?;
        fs::write(artifact, out)?;
        Ok(())
    }

    fn load(&self, artifact: &Path) -> Result<Vec<Translation>, ToolchainError> {
        read_bundle(artifact)
    }
}

/// Toolchain that runs a configured command line.
///
/// `{source}` and `{artifact}` in the argument vector are substituted with
/// the actual paths. The child's stderr is captured to a sidecar file and
/// reported on failure; a child that outlives the deadline is killed.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandToolchain {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        CommandToolchain { argv, timeout }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Toolchain for CommandToolchain {
    fn name(&self) -> &'static str {
        "command"
    }

    fn compile(&self, source: &Path, artifact: &Path) -> Result<(), ToolchainError> {
        let Some((program, rest)) = self.argv.split_first() else {
            return Err(ToolchainError::Malformed("empty command line".to_owned()));
        };
        let substitute = |arg: &String| {
            arg.replace("{source}", &source.display().to_string())
                .replace("{artifact}", &artifact.display().to_string())
        };

        let stderr_path: PathBuf = {
            let mut os = artifact.as_os_str().to_owned();
            os.push(".log");
            PathBuf::from(os)
        };
        let stderr_file = fs::File::create(&stderr_path)?;

        let spawned = Command::new(substitute(program))
            .args(rest.iter().map(substitute))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let _ = fs::remove_file(&stderr_path);
                return Err(ToolchainError::Spawn {
                    command: program.clone(),
                    source,
                });
            }
        };

        let started = Instant::now();
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    if started.elapsed() >= self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = fs::remove_file(&stderr_path);
                        return Err(ToolchainError::Timeout {
                            timeout_ms: self.timeout_ms(),
                        });
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            }
        };

        let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();
        let _ = fs::remove_file(&stderr_path);

        if status.success() {
            if !stderr.trim().is_empty() {
                tracing::debug!("{}: {}", self.name(), stderr.trim());
            }
            Ok(())
        } else {
            Err(ToolchainError::Exit {
                status: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_owned(),
            })
        }
    }

    fn load(&self, artifact: &Path) -> Result<Vec<Translation>, ToolchainError> {
        read_bundle(artifact)
    }
}
