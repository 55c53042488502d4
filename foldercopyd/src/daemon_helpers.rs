fn build_document_store(config: &DaemonConfig, client: &DriveClient) -> Arc<dyn DocumentStore> {
    match config.checkpoint_backend {
        CheckpointBackend::Remote => Arc::new(RemoteDocumentStore::new(client.clone())),
        CheckpointBackend::Local => Arc::new(LocalDocumentStore::new(config.state_dir.clone())),
    }
}

fn describe_outcome(outcome: &SliceOutcome) -> String {
    match outcome {
        SliceOutcome::NoJob => "no current job".to_string(),
        SliceOutcome::Finished { report, resolution } => format!(
            "{:?} after {} copied, {} failed ({:?})",
            report.reason, report.copied, report.failed, resolution
        ),
        SliceOutcome::LoadFailed { trials, gave_up } => {
            if *gave_up {
                format!("checkpoint unreadable after {trials} trials; gave up")
            } else {
                format!("checkpoint unreadable (trial {trials})")
            }
        }
        SliceOutcome::Aborted(message) => format!("aborted: {message}"),
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_STATE_DIR_NAME)
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_backend(value: Option<&str>) -> anyhow::Result<CheckpointBackend> {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("remote") => Ok(CheckpointBackend::Remote),
        Some("local") => Ok(CheckpointBackend::Local),
        Some(other) => anyhow::bail!("unknown FOLDERCOPY_CHECKPOINT_BACKEND: {other}"),
    }
}
