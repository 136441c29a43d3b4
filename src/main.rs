use clap::{Parser, Subcommand};
use imaging_pipeline::config::{PipelineConfig, ToolConfig};
use imaging_pipeline::execution::OutputInvalidator;
use imaging_pipeline::protocol::LogLevel;
use imaging_pipeline::subject::Subject;
use imaging_pipeline::supervisor::{
    ProcessSupervisor, RunOutcome, SupervisorConfig, SupervisorObserver, WorkerCommand,
};
use imaging_pipeline::worker::{ImportBatch, ImportJob, PipelineJob, WorkerJob};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "imaging-pipeline", version, about = "Run per-subject imaging tool pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pipeline stages for a batch of subjects
    Run {
        /// Directory holding one folder per subject
        #[arg(long)]
        directory: PathBuf,
        /// Pipeline configuration (JSON)
        #[arg(long)]
        config: PathBuf,
        #[arg(long, num_args = 1.., required = true)]
        subjects: Vec<String>,
        /// Stages to run, in order; every stage when omitted
        #[arg(long, num_args = 1..)]
        stages: Option<Vec<String>>,
    },
    /// Crop and register source images into subject folders
    Import {
        /// JSON array of import jobs
        #[arg(long)]
        jobs: PathBuf,
    },
    /// Create empty subject folders
    CreateSubject {
        #[arg(long)]
        directory: PathBuf,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Show what auto-clean would delete before a stage runs
    CleanPreview {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        stage: String,
        /// Subject folder
        #[arg(long)]
        subject: PathBuf,
    },
    /// Run one job from stdin and report on stdout (used by the supervisor)
    #[command(hide = true)]
    Worker,
}

/// Prints the run log as it streams in
struct ConsoleObserver;

impl SupervisorObserver for ConsoleObserver {
    fn on_progress(&mut self, index: usize, total: usize) {
        println!("[{}/{}]", index, total);
    }

    fn on_log(&mut self, level: LogLevel, message: &str) {
        if level != LogLevel::Debug {
            println!("{:>7}  {}", level, message);
        }
    }

    fn on_job_complete(&mut self, index: usize, success: bool, message: &str) {
        let mark = if success { "ok" } else { "FAILED" };
        println!("job {} {}: {}", index, mark, message);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    imaging_pipeline::init_tracing();
    let cli = Cli::parse();

    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(message) => {
            eprintln!("error: {}", message);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command) -> Result<ExitCode, String> {
    match command {
        Command::Run {
            directory,
            config,
            subjects,
            stages,
        } => {
            let config = PipelineConfig::from_file(&config).map_err(|e| e.to_string())?;
            let tools = ToolConfig::from_env();
            warn_missing_tools(&tools);
            let job = WorkerJob::Pipeline(PipelineJob {
                output_directory: directory,
                subjects,
                stages,
                config,
                tools,
            });
            supervise(&job).await
        }
        Command::Import { jobs } => {
            let content = std::fs::read_to_string(&jobs)
                .map_err(|e| format!("Failed to read {}: {}", jobs.display(), e))?;
            let jobs: Vec<ImportJob> = serde_json::from_str(&content)
                .map_err(|e| format!("Invalid import jobs: {}", e))?;
            let tools = ToolConfig::from_env();
            warn_missing_tools(&tools);
            supervise(&WorkerJob::Import(ImportBatch { jobs, tools })).await
        }
        Command::CreateSubject { directory, names } => {
            for name in &names {
                let subject = Subject::create(&directory, name).map_err(|e| e.to_string())?;
                println!("{}", subject.root().display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::CleanPreview {
            config,
            stage,
            subject,
        } => clean_preview(&config, &stage, &subject),
        Command::Worker => {
            let code = match imaging_pipeline::worker::run_from_stdio().await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(error = %e, "Worker failed");
                    1
                }
            };
            // Exit right away; a blocked job thread must not keep the process alive
            std::process::exit(code)
        }
    }
}

async fn supervise(job: &WorkerJob) -> Result<ExitCode, String> {
    let command = WorkerCommand::current_exe().map_err(|e| e.to_string())?;
    let mut supervisor = ProcessSupervisor::new(command, SupervisorConfig::default());

    let cancel = supervisor.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            cancel.cancel();
        }
    });

    tracing::info!(run_id = %supervisor.run_id(), "Starting supervised run");
    let outcome = supervisor
        .run(job, &mut ConsoleObserver)
        .await
        .map_err(|e| e.to_string())?;

    match &outcome {
        RunOutcome::Completed {
            success_count,
            error_count,
        } => println!("Finished: {} succeeded, {} failed", success_count, error_count),
        RunOutcome::Errored { message } => eprintln!("Run failed: {}", message),
        RunOutcome::Crashed { message } => eprintln!("Worker crashed: {}", message),
        RunOutcome::Cancelled => eprintln!("Run cancelled"),
    }

    Ok(if outcome.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn clean_preview(config: &Path, stage: &str, subject: &Path) -> Result<ExitCode, String> {
    let config = PipelineConfig::from_file(config).map_err(|e| e.to_string())?;
    let subject = Subject::open(subject).map_err(|e| e.to_string())?;
    let auto_clean = config.stage(stage).map(|s| s.auto_clean).unwrap_or(false);
    let plan = OutputInvalidator::plan(&subject, stage, &config).map_err(|e| e.to_string())?;

    if !auto_clean {
        println!("Stage {} does not auto-clean; nothing would be removed", stage);
        return Ok(ExitCode::SUCCESS);
    }
    println!("Stages affected: {}", plan.stages.join(", "));
    for pattern in &plan.patterns {
        println!("  {}", subject.processed_tmp().join(pattern).display());
    }
    Ok(ExitCode::SUCCESS)
}

fn warn_missing_tools(tools: &ToolConfig) {
    for problem in tools.validate_environment() {
        tracing::warn!("{}", problem);
    }
}
