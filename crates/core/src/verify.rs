use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::archive::{ArchiveCodec, CompressionParams};
use crate::model::StepOutput;

/// Structural check of a finished archive.
///
/// [`IntegrityVerifier::test_archive`] deletes what it rejects, so a broken
/// file can never satisfy a later "archive exists and size unchanged" skip.
/// [`IntegrityVerifier::check_archive`] only reports; restore uses it on the
/// archives it consumes.
#[derive(Clone)]
pub struct IntegrityVerifier {
    codec: Arc<dyn ArchiveCodec>,
    enabled: bool,
}

impl IntegrityVerifier {
    pub fn new(codec: Arc<dyn ArchiveCodec>, enabled: bool) -> Self {
        Self { codec, enabled }
    }

    pub fn test_archive(&self, path: &Path, params: CompressionParams) -> StepOutput {
        let mut out = self.check_archive(path, params);
        if out.success {
            return out;
        }

        out.lines
            .push(format!("{} is broken, trying to delete it.", path.display()));
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(
                    event = "archive.broken_deleted",
                    path = %path.display(),
                    "archive.broken_deleted"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    event = "io.archive.delete_failed",
                    path = %path.display(),
                    error = %e,
                    "io.archive.delete_failed"
                );
                out.lines
                    .push(format!("Failed to delete {}: {e}", path.display()));
            }
        }
        out
    }

    pub fn check_archive(&self, path: &Path, params: CompressionParams) -> StepOutput {
        if !self.enabled {
            return StepOutput::line(true, "Skip testing.");
        }
        let mut out = self.codec.test(path, params);
        if out.success {
            out.lines.push("Everything seems fine.".to_string());
        } else {
            warn!(
                event = "io.archive.test_failed",
                path = %path.display(),
                "io.archive.test_failed"
            );
        }
        out
    }
}
