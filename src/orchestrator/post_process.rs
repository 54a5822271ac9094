//! Post-operation processing utilities.
//!
//! Turns a committed operation into output lines and writes the files that go with it:
//! downloaded datasets and, when an export directory is configured, analysis artifacts.

use crate::cli::Cli;
use crate::engine::{Committed, OperationOutput};
use crate::storage;
use crate::text_summary::build_text_summary;
use std::path::PathBuf;

/// Result of post-operation processing, ready for presentation layers.
pub(crate) struct ProcessedCompletion {
    /// Text lines, or a single pretty-printed JSON document in `--json` mode.
    pub lines: Vec<String>,
    /// Status lines about files written (or failing to be written).
    pub file_messages: Vec<String>,
    pub saved_path: Option<PathBuf>,
}

fn export_stem(output: &OperationOutput) -> Option<String> {
    match output {
        OperationOutput::Trained(_) => Some("model".into()),
        OperationOutput::Interpretation(a) => Some(a.kind.endpoint().to_string()),
        OperationOutput::Exploration(a) => Some(format!("explore-{}", a.kind.as_str())),
        _ => None,
    }
}

pub(crate) fn process_completion(args: &Cli, committed: &Committed) -> ProcessedCompletion {
    let mut file_messages = Vec::new();

    let saved_path = match &committed.output {
        OperationOutput::Downloaded(bytes) => {
            match storage::save_download(args.download_dir.as_deref(), bytes) {
                Ok(path) => {
                    file_messages.push(format!("Saved: {}", path.display()));
                    Some(path)
                }
                Err(e) => {
                    file_messages.push(format!("Save download failed: {e:#}"));
                    None
                }
            }
        }
        _ => None,
    };

    if let (Some(dir), Some(stem)) = (args.export_dir.as_deref(), export_stem(&committed.output)) {
        match storage::export_artifact(dir, &stem, committed) {
            Ok(path) => file_messages.push(format!("Exported JSON: {}", path.display())),
            Err(e) => file_messages.push(format!("Export JSON failed: {e:#}")),
        }
    }

    let lines = if args.json {
        match serde_json::to_string_pretty(committed) {
            Ok(json) => vec![json],
            Err(e) => {
                file_messages.push(format!("Serialize result failed: {e}"));
                Vec::new()
            }
        }
    } else {
        build_text_summary(committed).lines
    };

    ProcessedCompletion {
        lines,
        file_messages,
        saved_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OperationId, OperationKind};
    use bytes::Bytes;
    use clap::Parser;

    #[test]
    fn downloads_are_saved_to_the_configured_directory() {
        let dir = tempfile::tempdir().unwrap();
        let args = Cli::parse_from([
            "copilot-session",
            "--download-dir",
            dir.path().to_str().unwrap(),
            "download",
        ]);
        let committed = Committed {
            id: OperationId(4),
            kind: OperationKind::Download,
            registry_version: 1,
            output: OperationOutput::Downloaded(Bytes::from_static(b"temp\n1\n")),
        };

        let processed = process_completion(&args, &committed);
        let saved = processed.saved_path.unwrap();
        assert_eq!(std::fs::read(&saved).unwrap(), b"temp\n1\n");
        assert!(saved.starts_with(dir.path()));
        assert_eq!(processed.lines, vec!["Downloaded 7 bytes".to_string()]);
    }

    #[test]
    fn context_uploads_write_no_export() {
        let dir = tempfile::tempdir().unwrap();
        let args = Cli::parse_from([
            "copilot-session",
            "--export-dir",
            dir.path().to_str().unwrap(),
            "columns",
        ]);
        let committed = Committed {
            id: OperationId(5),
            kind: OperationKind::ContextUpload,
            registry_version: 1,
            output: OperationOutput::ContextUploaded {
                files: vec!["sop.pdf".into()],
            },
        };
        let processed = process_completion(&args, &committed);
        assert!(processed.file_messages.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn json_mode_prints_the_committed_operation() {
        let args = Cli::parse_from(["copilot-session", "--json", "columns"]);
        let committed = Committed {
            id: OperationId(2),
            kind: OperationKind::Upload,
            registry_version: 1,
            output: OperationOutput::Uploaded {
                file_name: "line3.csv".into(),
            },
        };
        let processed = process_completion(&args, &committed);
        let value: serde_json::Value = serde_json::from_str(&processed.lines[0]).unwrap();
        assert_eq!(value["output"], "uploaded");
        assert_eq!(value["value"]["file_name"], "line3.csv");
        assert!(processed.file_messages.is_empty());
    }
}
