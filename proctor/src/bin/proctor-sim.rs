// proctor-sim - run a scripted exam attempt against in-memory collaborators
// Useful for exercising configuration, logging and the session lifecycle end to end

use anyhow::{anyhow, Context, Result};
use exam_proctor_lib::session::clock::SystemClock;
use exam_proctor_lib::session::collaborators::CameraFacing;
use exam_proctor_lib::session::config::{CameraRequirement, ExamConfig};
use exam_proctor_lib::session::memory::InMemoryBackend;
use exam_proctor_lib::session::persistence::SessionJournal;
use exam_proctor_lib::session::protocol::{serialize_message, SessionEvent, SessionState};
use exam_proctor_lib::session::violations::HostEvent;
use exam_proctor_lib::session::{SessionController, SubmitOutcome};
use serde::Serialize;
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SUBMIT_WAIT: Duration = Duration::from_secs(10);

fn print_help() {
    println!(
        r#"proctor-sim - simulate a proctored exam attempt

USAGE:
    proctor-sim [CONFIG] [OPTIONS]

ARGS:
    CONFIG               JSON exam configuration (defaults to a built-in demo exam)

OPTIONS:
    --violations <n>     Number of tab switches to simulate (default 0)
    --pages <n>          Answer pages to photograph with the document camera (default 1)
    --exit               Leave the exam early instead of submitting
    --no-camera          Simulate a missing front camera
    --journal            Keep a local session journal under the state directory
    --json               Print events and the delivered payload as JSON lines
    help, --help, -h     Show this help message

ENVIRONMENT:
    RUST_LOG                     Log filter (default: info)
    PROCTOR_STATE_DIR            Journal location
    PROCTOR_MAX_VIOLATIONS       Violation threshold override
    PROCTOR_CAPTURE_INTERVAL_MS  Camera capture cadence override
    PROCTOR_HANDOFF_POLL_SECS    Mobile handoff poll cadence override
    PROCTOR_CAMERA               disabled | optional | mandatory

EXAMPLES:
    proctor-sim --violations 3              # Auto-submits on the third violation
    proctor-sim exam.json --pages 4 --json
    RUST_LOG=debug proctor-sim --exit
"#
    );
}

#[derive(Debug, Default)]
struct Options {
    config_path: Option<PathBuf>,
    violations: usize,
    pages: usize,
    exit: bool,
    no_camera: bool,
    journal: bool,
    json: bool,
}

fn parse_count(flag: &str, value: Option<&String>) -> Result<usize> {
    let value = value.ok_or_else(|| anyhow!("{} requires a value", flag))?;
    value
        .parse()
        .with_context(|| format!("{} must be a non-negative integer", flag))
}

fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut options = Options {
        pages: 1,
        ..Options::default()
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "help" | "--help" | "-h" => return Ok(None),
            "--violations" => {
                i += 1;
                options.violations = parse_count("--violations", args.get(i))?;
            }
            "--pages" => {
                i += 1;
                options.pages = parse_count("--pages", args.get(i))?;
            }
            "--exit" => options.exit = true,
            "--no-camera" => options.no_camera = true,
            "--journal" => options.journal = true,
            "--json" => options.json = true,
            other if other.starts_with('-') => return Err(anyhow!("Unknown option: {}", other)),
            path => {
                if options.config_path.is_some() {
                    return Err(anyhow!("Only one configuration file may be given"));
                }
                options.config_path = Some(PathBuf::from(path));
            }
        }
        i += 1;
    }

    Ok(Some(options))
}

fn load_config(options: &Options) -> Result<ExamConfig> {
    let config = match &options.config_path {
        Some(path) => ExamConfig::from_file(path)?,
        None => {
            let mut config = ExamConfig::new("demo-test", "demo-student", 3600);
            config.camera = CameraRequirement::Optional;
            config.fullscreen_required = true;
            config
        }
    };
    let config = config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Wait until the attempt reaches a terminal state
async fn wait_for_submission(
    controller: &SessionController,
    events: &mut broadcast::Receiver<SessionEvent>,
) -> Result<()> {
    let wait = async {
        while controller.state() != SessionState::Submitted {
            match events.recv().await {
                Ok(SessionEvent::Submitted { .. }) => break,
                Ok(SessionEvent::SubmitFailed { message }) => {
                    return Err(anyhow!("submission failed: {}", message))
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        Ok(())
    };

    tokio::time::timeout(SUBMIT_WAIT, wait)
        .await
        .context("Timed out waiting for the submission")?
}

/// One newline-framed JSON message on stdout
fn print_json_line<T: Serialize>(message: &T) -> Result<()> {
    let bytes = serialize_message(message)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes)?;
    stdout.flush()?;
    Ok(())
}

fn spawn_event_printer(mut events: broadcast::Receiver<SessionEvent>, json: bool) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Tick { .. }) => {}
                Ok(event) if json => {
                    if let Err(e) = print_json_line(&event) {
                        warn!(error = %e, "failed to print event");
                    }
                }
                Ok(event) => println!("event: {:?}", event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let Some(options) = parse_args(&args)? else {
        print_help();
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&options)?;
    let journal = if options.journal {
        config
            .ensure_dirs()
            .context("Failed to create state directory")?;
        Some(SessionJournal::new(config.journal_dir()))
    } else {
        None
    };

    let backend = InMemoryBackend::new();
    if options.no_camera {
        backend.media.set_unavailable(CameraFacing::User, true);
    }

    let controller = SessionController::with_parts(
        config.clone(),
        backend.collaborators(),
        Arc::new(SystemClock::new()),
        journal,
    );
    spawn_event_printer(controller.subscribe(), options.json);
    let mut events = controller.subscribe();

    controller
        .start()
        .await
        .context("Exam attempt could not start")?;
    info!(
        test_id = %config.test_id,
        remaining_seconds = controller.remaining_seconds().unwrap_or_default(),
        "attempt running"
    );

    if options.pages > 0 {
        let pages = controller.capture_pages(options.pages).await?;
        info!(pages = pages.len(), "answer pages captured");
    }

    for _ in 0..options.violations {
        controller.handle_host_event(&HostEvent::VisibilityHidden);
        controller.handle_host_event(&HostEvent::VisibilityVisible);
    }

    // Past the threshold the core submits on its own
    let escalated = controller.snapshot().violations.len() >= config.max_violations as usize;
    if !escalated && controller.state() == SessionState::Active {
        let outcome = if options.exit {
            controller.exit().await?
        } else {
            controller.submit_manual().await?
        };
        if let SubmitOutcome::Submitted { result_ref } = &outcome {
            info!(result_ref = ?result_ref, "attempt submitted");
        }
    }
    wait_for_submission(&controller, &mut events).await?;
    controller.dispose().await;

    let payload = backend
        .session
        .last_payload()
        .ok_or_else(|| anyhow!("No payload was delivered"))?;

    if options.json {
        print_json_line(&payload)?;
    } else {
        println!("reason:      {}", payload.reason);
        println!(
            "artifact:    {}",
            payload
                .answer_artifact_ref
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        println!("violations:  {}", payload.violations.len());
        println!("time taken:  {}s", payload.time_taken_seconds);
        println!("frames sent: {}", backend.monitoring.frames().len());
    }

    Ok(())
}
