// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use clap::{Parser, Subcommand};
use dataset_ingest::{
    Error, IngestConfig, Ingestor, InputFile, JsonlMetadataStore, LocalObjectStore, Progress,
    ProgressSink, STEP_IMAGES_TABLE, SplitMode, classify, plan_split, resolve_classes,
};
use log::{debug, info, warn};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file layered under INGEST_* environment variables
    #[clap(long, env = "INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Command to run
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Ingest images, archives and label files into a step of a project.
    /// Directories are walked recursively.  Objects are written under
    /// ROOT/objects and metadata records under ROOT/db.
    Ingest {
        /// Files or directories to ingest
        #[clap(required = true)]
        inputs: Vec<PathBuf>,

        /// Project ID
        #[clap(long)]
        project: String,

        /// Step ID, defaults to a timestamp
        #[clap(long)]
        step: Option<String>,

        /// Local storage root
        #[clap(long, env = "INGEST_ROOT")]
        root: PathBuf,

        /// Split mode: auto, manual or training-only
        #[clap(long, default_value = "auto")]
        mode: String,

        /// Training percentage for manual splits
        #[clap(long)]
        training: Option<u32>,

        /// Validation percentage for manual splits
        #[clap(long)]
        validation: Option<u32>,

        /// Name of the group receiving the manual remainder
        #[clap(long)]
        other_name: Option<String>,

        /// Class names used when no class manifest is selected
        #[clap(long, value_delimiter = ',')]
        classes: Vec<String>,

        /// Parallel upload lanes, overrides the configuration
        #[clap(long)]
        concurrency: Option<usize>,

        /// Records per database insert, overrides the configuration
        #[clap(long)]
        batch_size: Option<usize>,

        /// Storage bucket, overrides the configuration
        #[clap(long)]
        bucket: Option<String>,
    },
    /// Classify the inputs and plan the split without uploading anything.
    /// The plan is printed as JSON.
    Plan {
        /// Files or directories to plan
        #[clap(required = true)]
        inputs: Vec<PathBuf>,

        /// Split mode: auto, manual or training-only
        #[clap(long, default_value = "auto")]
        mode: String,

        /// Training percentage for manual splits
        #[clap(long)]
        training: Option<u32>,

        /// Validation percentage for manual splits
        #[clap(long)]
        validation: Option<u32>,

        /// Name of the group receiving the manual remainder
        #[clap(long)]
        other_name: Option<String>,

        /// Class names used when no class manifest is selected
        #[clap(long, value_delimiter = ',')]
        classes: Vec<String>,
    },
}

fn split_mode(
    mode: &str,
    training: Option<u32>,
    validation: Option<u32>,
    other_name: Option<String>,
) -> Result<SplitMode, Error> {
    match mode {
        "auto" => Ok(SplitMode::Auto),
        "training-only" => Ok(SplitMode::TrainingOnly),
        "manual" => match (training, validation) {
            (Some(training), Some(validation)) if training.saturating_add(validation) <= 100 => {
                Ok(SplitMode::Manual {
                    training,
                    validation,
                    other_name,
                })
            }
            (Some(_), Some(_)) => Err(Error::InvalidParameters(
                "--training and --validation must not exceed 100 together".to_owned(),
            )),
            _ => Err(Error::InvalidParameters(
                "Manual mode requires --training and --validation".to_owned(),
            )),
        },
        other => Err(Error::InvalidParameters(format!(
            "Unknown split mode '{}', expected auto, manual or training-only",
            other
        ))),
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// Read every input, walking directories in file-name order.
fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<InputFile>, Error> {
    let mut inputs = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry.map_err(|err| Error::IoError(err.into()))?;
                if entry.file_type().is_file() && !is_hidden(entry.path()) {
                    inputs.push(InputFile::from_path(entry.path())?);
                }
            }
        } else if path.is_file() {
            inputs.push(InputFile::from_path(path)?);
        } else {
            return Err(Error::InvalidParameters(format!(
                "Input {:?} does not exist",
                path
            )));
        }
    }
    debug!("Collected {} input files", inputs.len());
    Ok(inputs)
}

async fn handle_plan(
    inputs: Vec<PathBuf>,
    mode: SplitMode,
    classes: Vec<String>,
) -> Result<(), Error> {
    let classified = classify(collect_inputs(&inputs)?);
    let plan = plan_split(&classified.images, &mode);
    let table = resolve_classes(classified.class_manifest.as_ref(), &classes);

    let groups: serde_json::Map<String, serde_json::Value> = plan
        .groups()
        .iter()
        .map(|group| (group.name.clone(), group.ids.len().into()))
        .collect();
    let labels: Vec<&str> = classified
        .labels
        .iter()
        .map(|label| label.original_name.as_str())
        .collect();

    let report = serde_json::json!({
        "images": classified.images.len(),
        "groups": groups,
        "labels": labels,
        "class_manifest": classified
            .class_manifest
            .as_ref()
            .map(|manifest| manifest.original_name.as_str()),
        "classes": table.names(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_ingest(
    config: IngestConfig,
    inputs: Vec<PathBuf>,
    project: String,
    step: String,
    root: PathBuf,
    mode: SplitMode,
    classes: Vec<String>,
) -> Result<(), Error> {
    use indicatif::{ProgressBar, ProgressStyle};
    use tokio::sync::mpsc;

    let inputs = collect_inputs(&inputs)?;
    if inputs.is_empty() {
        return Err(Error::InvalidParameters(
            "No input files found. Check the provided paths.".to_owned(),
        ));
    }

    let store = Arc::new(LocalObjectStore::new(root.join("objects"))?);
    let db = Arc::new(JsonlMetadataStore::new(root.join("db"))?);
    let table_path = db.table_path(STEP_IMAGES_TABLE);
    let ingestor = Ingestor::new(store, db, config);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing in-flight files");
                cancel.cancel();
            }
        });
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise} ETA: {eta}] {msg}: {wide_bar:.yellow} {human_pos}/{human_len}",
        )
        .map_err(|err| Error::InvalidParameters(err.to_string()))?
        .progress_chars("█▇▆▅▄▃▂▁  "),
    );
    bar.set_message("Ingesting");

    let (tx, mut rx) = mpsc::channel::<Progress>(16);
    let render = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            if progress.total > 0 {
                bar.set_length(progress.total as u64);
                bar.set_position(progress.current as u64);
            }
        }
        bar.finish_and_clear();
    });

    let summary = ingestor
        .ingest_files(
            &project,
            &step,
            inputs,
            &mode,
            &classes,
            &cancel,
            Some(&tx as &dyn ProgressSink),
        )
        .await;
    drop(tx);
    render.await?;
    let summary = summary?;

    info!(
        "Persisted {} records to {:?}",
        summary.records_persisted, table_path
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.cancelled {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn default_step_id() -> String {
    chrono::Utc::now().format("step-%Y%m%d-%H%M%S").to_string()
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.cmd {
        Command::Plan {
            inputs,
            mode,
            training,
            validation,
            other_name,
            classes,
        } => {
            let mode = split_mode(&mode, training, validation, other_name)?;
            handle_plan(inputs, mode, classes).await
        }
        Command::Ingest {
            inputs,
            project,
            step,
            root,
            mode,
            training,
            validation,
            other_name,
            classes,
            concurrency,
            batch_size,
            bucket,
        } => {
            let mut config = IngestConfig::load(args.config.as_deref())?;
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if let Some(bucket) = bucket {
                config.bucket = bucket;
            }
            config.validate()?;

            let mode = split_mode(&mode, training, validation, other_name)?;
            let step = step.unwrap_or_else(default_step_id);
            handle_ingest(config, inputs, project, step, root, mode, classes).await
        }
    }
}
