//! Thin driver binary for local exercising of `nils_core`, replacing the teacher's napi entry
//! point with `anonymize` and `extract` subcommands over the same library.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nils_core::anonymize::AnonymizationEngine;
use nils_core::config::CohortConfig;
use nils_core::error::CoreResult;
use nils_core::extract::{ExtractionEngine, ResumeState};
use nils_core::id_strategy::IdStrategy;
use nils_core::{db, layout, stack, writer};

#[derive(Parser)]
#[command(name = "nils-cli", about = "Neuroimaging de-identification and extraction pipeline")]
struct Cli {
    /// Path to a JSON cohort configuration file.
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Commands {
    /// Normalize the cohort root and run the Anonymization Engine.
    Anonymize,
    /// Run the Extraction Engine + Writer, then Stack Discovery, against `dcm-raw`.
    Extract,
    /// Run `anonymize` followed by `extract` in one invocation.
    Run,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish(),
    );
}

#[tokio::main]
async fn main() -> CoreResult<()> {
    init_logging();
    let cli = Cli::parse();

    let raw = std::fs::read_to_string(&cli.config).map_err(|e| nils_core::error::CoreError::Configuration {
        message: format!("failed to read config file {:?}: {e}", cli.config),
    })?;
    let config = CohortConfig::load_from_str(&raw)?;

    match cli.command {
        Commands::Anonymize => run_anonymize(&config).await?,
        Commands::Extract => run_extract(&config).await?,
        Commands::Run => {
            run_anonymize(&config).await?;
            run_extract(&config).await?;
        }
    }
    Ok(())
}

async fn run_anonymize(config: &CohortConfig) -> CoreResult<()> {
    let layout = layout::resolve_layout(&config.root)?;
    info!(
        source_path = ?layout.source_path,
        output_path = ?layout.output_path,
        status = ?layout.status,
        "resolved derivatives layout"
    );

    let pool = db::connect(&config.database_url).await?;

    let top_dirs = nils_core::traversal::top_level_dirs(&layout.source_path).map_err(|e| {
        nils_core::error::CoreError::RootUnavailable {
            path: layout.source_path.clone(),
            source: e,
        }
    })?;

    let csv_mapping = load_csv_mapping(&config.anonymize.id_strategy)?;
    let sequential_assignments = if let nils_core::config::IdStrategyConfig::Sequential {
        discovery,
        format,
        base,
    } = &config.anonymize.id_strategy
    {
        Some(nils_core::id_strategy::discover_sequential(
            &top_dirs,
            nils_core::anonymize::candidates_of,
            *discovery,
            format,
            *base,
            nils_core::extract::tags::read_identity,
        ))
    } else {
        None
    };
    let csv_fallback_assignments = if let nils_core::config::IdStrategyConfig::Csv {
        fallback: nils_core::config::CsvFallback::SequentialPerTopFolder,
        format,
        ..
    } = &config.anonymize.id_strategy
    {
        Some(nils_core::id_strategy::discover_csv_fallback(
            &top_dirs,
            nils_core::anonymize::candidates_of,
            csv_mapping.as_ref().unwrap_or(&std::collections::HashMap::new()),
            format,
            nils_core::extract::tags::read_identity,
        ))
    } else {
        None
    };
    let id_strategy = Arc::new(IdStrategy::from_config(
        &config.anonymize.id_strategy,
        csv_mapping,
        sequential_assignments,
        csv_fallback_assignments,
    ));

    let cancelled = Arc::new(AtomicBool::new(false));
    let engine = AnonymizationEngine::new(config.anonymize.clone(), config.cohort_name.clone());
    let summary = engine
        .run(&layout.source_path, &layout.output_path, id_strategy, pool, None, cancelled)
        .await?;

    info!(
        leaves_processed = summary.leaves_processed,
        files_written = summary.files_written,
        files_reused = summary.files_reused,
        files_with_errors = summary.files_with_errors,
        "anonymization run complete"
    );
    Ok(())
}

async fn run_extract(config: &CohortConfig) -> CoreResult<()> {
    let layout = layout::resolve_layout(&config.root)?;
    let pool = db::connect(&config.database_url).await?;

    let csv_mapping = load_csv_mapping(&nils_core::config::IdStrategyConfig::Csv {
        mapping_path: config.extract.subject_code_csv.clone().unwrap_or_default(),
        fallback: nils_core::config::CsvFallback::Hash,
        format: String::new(),
        salt: String::new(),
    })
    .ok()
    .flatten();

    let (tx, rx) = tokio::sync::mpsc::channel(config.extract.queue_size);
    let cancelled = Arc::new(AtomicBool::new(false));

    let extraction = ExtractionEngine::new(config.extract.clone(), csv_mapping);
    let mut writer = writer::Writer::new(pool.clone(), config.writer.clone(), config.cohort_name.clone());

    let extract_cancelled = cancelled.clone();
    let source = layout.output_path.clone();
    let extract_handle = tokio::spawn(async move {
        extraction
            .run(&source, &ResumeState::default(), tx, None, extract_cancelled)
            .await
    });

    writer.run(rx).await?;
    match extract_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "extraction engine returned an error"),
        Err(e) => error!(error = %e, "extraction task panicked"),
    }

    let metrics = writer.metrics();
    info!(
        subjects = metrics.subjects,
        studies = metrics.studies,
        series = metrics.series,
        instances = metrics.instances,
        "extraction + write complete"
    );

    let stacks = stack::run_all(&pool, &layout.output_path).await?;
    info!(stacks, "stack discovery complete");
    Ok(())
}

/// Load the CSV PatientID→code mapping file used by the `csv` id strategy, if configured.
fn load_csv_mapping(
    strategy: &nils_core::config::IdStrategyConfig,
) -> CoreResult<Option<std::collections::HashMap<String, String>>> {
    let nils_core::config::IdStrategyConfig::Csv { mapping_path, .. } = strategy else {
        return Ok(None);
    };
    if mapping_path.as_os_str().is_empty() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(mapping_path).map_err(|e| nils_core::error::CoreError::Configuration {
        message: format!("failed to read CSV mapping {mapping_path:?}: {e}"),
    })?;
    let mut lines = raw.lines();
    let Some(header) = lines.next() else {
        return Ok(Some(std::collections::HashMap::new()));
    };
    let header = header.strip_prefix('\u{feff}').unwrap_or(header);
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let (Some(source_idx), Some(target_idx)) = (
        columns.iter().position(|c| *c == "sourceColumn"),
        columns.iter().position(|c| *c == "targetColumn"),
    ) else {
        return Err(nils_core::error::CoreError::Configuration {
            message: "CSV mapping file must have sourceColumn and targetColumn headers".to_string(),
        });
    };

    let mut mapping = std::collections::HashMap::new();
    for line in lines {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        if cells.len() <= source_idx.max(target_idx) {
            continue;
        }
        let source = cells[source_idx];
        if source.is_empty() {
            continue;
        }
        mapping.insert(source.to_string(), cells[target_idx].to_string());
    }
    Ok(Some(mapping))
}
