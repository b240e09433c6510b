use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use deckpilot_core::export::ExportKind;
use deckpilot_core::models::{FileScope, JobRef};
use deckpilot_core::region::{DisplaySize, SelectionRect};
use deckpilot_core::services::{ServiceKind, ServiceSettings};
use deckpilot_core::{ClientState, Config, Notifier, Settings};

use crate::commands::{self, MarkdownDoc};
use crate::error::{CommandError, CommandResult, ResultExt};

#[derive(Parser, Debug)]
#[command(name = "deckpilot")]
#[command(about = "Command-line client for the Deckpilot slide-deck service")]
pub struct Cli {
    /// Use a built-in in-memory backend with a sample project
    #[arg(long, global = true)]
    pub offline: bool,

    /// Override the data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect a project
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Manage reference files
    #[command(subcommand)]
    Files(FilesCommand),
    /// Export a project
    Export(ExportArgs),
    /// Manage export tasks
    #[command(subcommand)]
    Tasks(TasksCommand),
    /// Wait for a server job
    #[command(subcommand)]
    Job(JobCommand),
    /// Generate the image of one page
    GenerateImage { project_id: String, page_id: String },
    /// Test connectivity of an external service
    TestService {
        service: ServiceKind,
        /// JSON file with setting overrides
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Crop a region of an image, given in display coordinates
    Crop(CropArgs),
}

#[derive(Subcommand, Debug)]
pub enum ProjectCommand {
    Show { project_id: String },
    /// Write the outline as Markdown
    OutlineMd {
        project_id: String,
        /// Directory to write into (stdout if absent)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write page descriptions as Markdown
    DescriptionsMd {
        project_id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum FilesCommand {
    List {
        /// `all`, `none` or a project id
        #[arg(long, default_value = "all")]
        scope: FileScope,
    },
    Upload {
        paths: Vec<PathBuf>,
        #[arg(long, default_value = "all")]
        scope: FileScope,
        /// Wait until parsing finishes
        #[arg(long)]
        wait: bool,
    },
    /// Parse files and wait for the result
    Parse {
        file_ids: Vec<String>,
        #[arg(long, default_value = "all")]
        scope: FileScope,
    },
    /// Print parsed Markdown
    Preview { file_id: String },
    Delete { file_id: String },
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    pub project_id: String,
    /// pptx, pdf or editable-pptx
    #[arg(long, default_value = "pptx")]
    pub kind: ExportKind,
    /// Comma-separated page ids (whole deck if absent)
    #[arg(long, value_delimiter = ',')]
    pub pages: Option<Vec<String>>,
    /// Wait for asynchronous exports
    #[arg(long)]
    pub wait: bool,
}

#[derive(Subcommand, Debug)]
pub enum TasksCommand {
    List {
        #[arg(long)]
        project: Option<String>,
    },
    /// Resume exports left running by an earlier invocation
    Resume,
}

#[derive(Subcommand, Debug)]
pub enum JobCommand {
    Wait {
        job_id: String,
        /// file-parse, image-generate, export-pptx, export-pdf,
        /// export-editable-pptx or service-test
        #[arg(long)]
        kind: String,
        #[arg(long)]
        project: Option<String>,
    },
}

#[derive(Args, Debug)]
pub struct CropArgs {
    pub image: PathBuf,
    /// Displayed size as WIDTHxHEIGHT
    #[arg(long)]
    pub display: String,
    /// Selection as LEFT,TOP,WIDTH,HEIGHT in display pixels
    #[arg(long)]
    pub rect: String,
    #[arg(long, default_value = ".")]
    pub out: PathBuf,
}

fn parse_display(value: &str) -> CommandResult<DisplaySize> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| CommandError::invalid_argument("Display size must be WIDTHxHEIGHT"))?;
    Ok(DisplaySize::new(
        w.trim().parse().invalid_arg()?,
        h.trim().parse().invalid_arg()?,
    ))
}

fn parse_rect(value: &str) -> CommandResult<SelectionRect> {
    let parts = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .invalid_arg()?;
    match parts.as_slice() {
        [left, top, width, height] => Ok(SelectionRect::new(*left, *top, *width, *height)),
        _ => Err(CommandError::invalid_argument(
            "Selection must be LEFT,TOP,WIDTH,HEIGHT",
        )),
    }
}

fn print_json<T: Serialize>(value: &T) -> CommandResult<()> {
    println!("{}", serde_json::to_string_pretty(value).internal_err()?);
    Ok(())
}

async fn write_markdown(
    state: &ClientState,
    project_id: &str,
    doc: MarkdownDoc,
    out: Option<PathBuf>,
) -> CommandResult<()> {
    let export = commands::project_markdown(state, project_id, doc).await?;
    match out {
        Some(dir) => {
            tokio::fs::create_dir_all(&dir).await.storage_err()?;
            let path = dir.join(&export.filename);
            tokio::fs::write(&path, export.markdown).await.storage_err()?;
            println!("{}", path.display());
        }
        None => print!("{}", export.markdown),
    }
    Ok(())
}

/// Build client state for the chosen backend
pub fn client_state(cli: &Cli, notifier: Arc<dyn Notifier>) -> anyhow::Result<ClientState> {
    let config = match &cli.data_dir {
        Some(dir) => Config::with_data_dir(dir),
        None => Config::load_or_default(),
    };
    config.ensure_dirs()?;
    tracing::debug!("Data directory: {:?}", config.data_dir);

    if cli.offline {
        let settings = Settings::load(&config.settings_file);
        tracing::info!("Using offline backend");
        return Ok(ClientState::new(
            config,
            settings,
            commands::demo_backend(),
            notifier,
        ));
    }
    ClientState::connect(config, notifier)
}

/// Run one command to completion. Ctrl+C cancels waiting.
pub async fn dispatch(state: &ClientState, command: Command) -> CommandResult<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping");
            on_interrupt.cancel();
        }
    });

    let result = match command {
        Command::Project(ProjectCommand::Show { project_id }) => {
            print_json(&commands::show_project(state, &project_id).await?)
        }
        Command::Project(ProjectCommand::OutlineMd { project_id, out }) => {
            write_markdown(state, &project_id, MarkdownDoc::Outline, out).await
        }
        Command::Project(ProjectCommand::DescriptionsMd { project_id, out }) => {
            write_markdown(state, &project_id, MarkdownDoc::Descriptions, out).await
        }
        Command::Files(FilesCommand::List { scope }) => {
            print_json(&commands::list_files(state, scope).await?)
        }
        Command::Files(FilesCommand::Upload { paths, scope, wait }) => {
            print_json(&commands::upload_files(state, scope, &paths, wait, &cancel).await?)
        }
        Command::Files(FilesCommand::Parse { file_ids, scope }) => {
            print_json(&commands::parse_files(state, scope, file_ids, &cancel).await?)
        }
        Command::Files(FilesCommand::Preview { file_id }) => {
            print!("{}", commands::preview_file(state, &file_id).await?);
            Ok(())
        }
        Command::Files(FilesCommand::Delete { file_id }) => {
            commands::delete_file(state, &file_id).await
        }
        Command::Export(args) => print_json(
            &commands::start_export(state, &args.project_id, args.kind, args.pages, args.wait)
                .await?,
        ),
        Command::Tasks(TasksCommand::List { project }) => {
            print_json(&commands::list_tasks(state, project.as_deref()).await?)
        }
        Command::Tasks(TasksCommand::Resume) => print_json(&commands::resume_tasks(state).await?),
        Command::Job(JobCommand::Wait {
            job_id,
            kind,
            project,
        }) => {
            let kind = commands::parse_job_kind(&kind)?;
            let job = match project {
                Some(project_id) => JobRef::for_project(job_id, kind, project_id),
                None => JobRef::new(job_id, kind),
            };
            print_json(&commands::wait_job(state, job, &cancel).await?)
        }
        Command::GenerateImage {
            project_id,
            page_id,
        } => print_json(&commands::generate_image(state, &project_id, &page_id).await?),
        Command::TestService { service, settings } => {
            let settings: ServiceSettings = match settings {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(&path).await.storage_err()?;
                    serde_json::from_str(&raw).invalid_arg()?
                }
                None => ServiceSettings::default(),
            };
            print_json(&commands::test_service(state, service, settings).await?)
        }
        Command::Crop(args) => {
            let display = parse_display(&args.display)?;
            let rect = parse_rect(&args.rect)?;
            match commands::crop_region(
                &args.image,
                display,
                rect,
                state.settings.min_region_px,
                &args.out,
            )
            .await?
            {
                Some(crop) => print_json(&crop),
                None => Err(CommandError::invalid_argument(format!(
                    "Selection is smaller than {}px",
                    state.settings.min_region_px
                ))),
            }
        }
    };

    cancel.cancel();
    result
}
