use foldercopyd::copy::SliceOutcome;
use foldercopyd::daemon::{DaemonConfig, DaemonRuntime};
use foldercopyd::job::Selection;

const USAGE: &str = "\
Usage: foldercopyd [COMMAND]
  run                                   Wait for reschedule triggers and run slices (default)
  slice                                 Run one slice of the current job now
  start <source-id> <dest-name> [--permissions] [--parent <id>]
                                        Start copying a folder and run the first slice
  resume <folder-id>                    Resume the job for a source or destination folder
  stop                                  Pause the current job at its next step
  status                                Show the current job and its progress log";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Slice,
    Start(Selection),
    Resume(String),
    Stop,
    Status,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Run);
    };
    let mode = match command.as_str() {
        "run" => CliMode::Run,
        "slice" => CliMode::Slice,
        "stop" => CliMode::Stop,
        "status" => CliMode::Status,
        "--help" | "-h" | "help" => CliMode::Help,
        "resume" => {
            let folder_id = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("resume needs a folder id"))?;
            CliMode::Resume(folder_id)
        }
        "start" => {
            let mut positional = Vec::new();
            let mut copy_permissions = false;
            let mut dest_parent_id = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--permissions" => copy_permissions = true,
                    "--parent" => {
                        dest_parent_id = Some(
                            args.next()
                                .ok_or_else(|| anyhow::anyhow!("--parent needs a folder id"))?,
                        );
                    }
                    other if other.starts_with("--") => {
                        anyhow::bail!("unknown argument: {other}")
                    }
                    _ => positional.push(arg),
                }
            }
            let [source_id, dest_name]: [String; 2] = positional
                .try_into()
                .map_err(|_| anyhow::anyhow!("start needs <source-id> <dest-name>"))?;
            return Ok(CliMode::Start(Selection {
                source_id,
                dest_name,
                dest_parent_id,
                copy_permissions,
            }));
        }
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn print_outcome(outcome: &SliceOutcome) {
    match outcome {
        SliceOutcome::NoJob => println!("no current job"),
        SliceOutcome::Finished { report, resolution } => println!(
            "{:?}: {} copied, {} failed ({:?})",
            report.reason, report.copied, report.failed, resolution
        ),
        SliceOutcome::LoadFailed { trials, gave_up } => {
            println!("could not load progress (trial {trials}, gave up: {gave_up})")
        }
        SliceOutcome::Aborted(message) => println!("copy aborted: {message}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Run => daemon.run().await,
        CliMode::Slice => {
            print_outcome(&daemon.run_slice().await?);
            Ok(())
        }
        CliMode::Start(selection) => {
            let started = daemon.jobs().initialize(&selection).await?;
            println!("copying into {}", started.dest_id);
            print_outcome(&daemon.run_slice().await?);
            Ok(())
        }
        CliMode::Resume(folder_id) => {
            let record = daemon.jobs().resume(&folder_id).await?;
            println!("resuming copy into {}", record.dest_id);
            print_outcome(&daemon.run_slice().await?);
            Ok(())
        }
        CliMode::Stop => {
            daemon.jobs().stop().await?;
            println!("stop requested; the job pauses at its next step");
            Ok(())
        }
        CliMode::Status => {
            let status = daemon.jobs().status().await?;
            let identity = &status.identity;
            println!("source:      {}", identity.source_id.as_deref().unwrap_or("-"));
            println!("destination: {}", identity.dest_id.as_deref().unwrap_or("-"));
            println!("trigger:     {}", identity.trigger_id.as_deref().unwrap_or("-"));
            println!("stopped:     {}", identity.stopped);
            println!("trials:      {}", identity.trials);
            if let Some((state, at)) = &status.status {
                println!("status:      {state} {at}");
            }
            for row in &status.rows {
                println!("{}", row.join("\t"));
            }
            Ok(())
        }
        CliMode::Help => Ok(()),
    }
}
