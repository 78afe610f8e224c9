//! `butler`: command-line access to a registry repository on disk.
//!
//! Every subcommand is a thin wrapper over `butler_registry::script`.
//! Logging goes to stderr through `tracing`; `RUST_LOG` overrides
//! `--log-level`.

use anyhow::{Context, Result, bail};
use butler_registry::collections::CollectionType;
use butler_registry::datastore::TransferMode;
use butler_registry::script::{self, ChainMode, DatasetQuery, Table};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "butler", version, about = "Manage a data repository registry")]
struct Cli {
    /// Default log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty repository.
    Create {
        repo: PathBuf,
        /// JSON file overlaid on the default configuration.
        #[arg(long)]
        seed_config: Option<PathBuf>,
        /// JSON file replacing the dimension configuration.
        #[arg(long)]
        dimension_config: Option<PathBuf>,
    },
    /// Import an export file into a repository.
    Import {
        repo: PathBuf,
        /// Directory the exported file paths are relative to.
        directory: PathBuf,
        #[arg(long, short = 't')]
        transfer: Option<TransferMode>,
        /// Export file; defaults to export.json in DIRECTORY.
        #[arg(long, short = 'e')]
        export_file: Option<PathBuf>,
        /// Dimension elements whose records are not imported.
        #[arg(long, short = 's')]
        skip_dimensions: Vec<String>,
    },
    /// Print the repository configuration.
    ConfigDump {
        repo: PathBuf,
        /// Dotted selector such as .datastore.root
        #[arg(long, short = 's')]
        subset: Option<String>,
        /// Write to this file instead of stdout.
        #[arg(long, short = 'f')]
        file: Option<PathBuf>,
    },
    /// Check registered dataset types against the configuration.
    ConfigValidate {
        repo: PathBuf,
        #[arg(long, short = 'q')]
        quiet: bool,
        #[arg(long, short = 'd')]
        dataset_type: Vec<String>,
        /// Dataset type patterns to skip.
        #[arg(long, short = 'i')]
        ignore: Vec<String>,
    },
    /// Remove a collection.
    PruneCollection {
        repo: PathBuf,
        collection: String,
        /// Also remove the datasets of a RUN collection.
        #[arg(long)]
        purge: bool,
        /// Drop datastore records of affected datasets.
        #[arg(long)]
        unstore: bool,
    },
    /// List collections.
    QueryCollections {
        repo: PathBuf,
        glob: Vec<String>,
        #[arg(long)]
        collection_type: Vec<CollectionType>,
        /// TABLE, TREE or FLATTEN
        #[arg(long, default_value = "TABLE")]
        chains: ChainMode,
    },
    /// List dataset types.
    QueryDatasetTypes {
        repo: PathBuf,
        glob: Vec<String>,
        #[arg(long, short = 'v')]
        verbose: bool,
        /// Include component dataset types.
        #[arg(long)]
        components: bool,
    },
    /// Remove a dataset type that has no datasets.
    RemoveDatasetType { repo: PathBuf, name: String },
    /// List datasets.
    QueryDatasets {
        repo: PathBuf,
        glob: Vec<String>,
        #[arg(long)]
        collections: Vec<String>,
        #[arg(long = "where")]
        where_: Vec<String>,
        /// Keep only the first dataset per data ID along the collection order.
        #[arg(long)]
        find_first: bool,
        #[arg(long)]
        show_uri: bool,
    },
    /// Certify datasets from one collection into a CALIBRATION collection.
    CertifyCalibrations {
        repo: PathBuf,
        input_collection: String,
        output_collection: String,
        dataset_type: String,
        #[arg(long)]
        begin_date: Option<String>,
        #[arg(long)]
        end_date: Option<String>,
        /// Search every child of a CHAINED input, not just the first.
        #[arg(long)]
        search_all_inputs: bool,
    },
    /// List data IDs supported by dimension records.
    QueryDataIds {
        repo: PathBuf,
        dimensions: Vec<String>,
        #[arg(long)]
        datasets: Vec<String>,
        #[arg(long)]
        collections: Vec<String>,
        #[arg(long = "where")]
        where_: Vec<String>,
    },
    /// List the records of one dimension element.
    QueryDimensionRecords {
        repo: PathBuf,
        element: String,
        #[arg(long = "where")]
        where_: Vec<String>,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    match cli.command {
        Command::Create {
            repo,
            seed_config,
            dimension_config,
        } => script::create(&repo, seed_config.as_deref(), dimension_config.as_deref())
            .with_context(|| format!("creating repository at {}", repo.display())),
        Command::Import {
            repo,
            directory,
            transfer,
            export_file,
            skip_dimensions,
        } => script::import(
            &repo,
            &directory,
            export_file.as_deref(),
            transfer,
            &skip_dimensions,
        )
        .context("import failed"),
        Command::ConfigDump { repo, subset, file } => {
            let text = script::config_dump(&repo, subset.as_deref())?;
            match file {
                Some(path) => std::fs::write(&path, text)
                    .with_context(|| format!("writing {}", path.display())),
                None => {
                    print!("{text}");
                    Ok(())
                }
            }
        }
        Command::ConfigValidate {
            repo,
            quiet,
            dataset_type,
            ignore,
        } => {
            let problems = script::config_validate(&repo, &dataset_type, &ignore)?;
            if !problems.is_empty() {
                bail!("configuration is invalid:\n{}", problems.join("\n"));
            }
            if !quiet {
                println!("No problems encountered with configuration.");
            }
            Ok(())
        }
        Command::PruneCollection {
            repo,
            collection,
            purge,
            unstore,
        } => Ok(script::prune_collection(&repo, &collection, purge, unstore)?),
        Command::QueryCollections {
            repo,
            glob,
            collection_type,
            chains,
        } => print_table(&script::query_collections(
            &repo,
            &glob,
            &collection_type,
            chains,
        )?),
        Command::QueryDatasetTypes {
            repo,
            glob,
            verbose,
            components,
        } => print_table(&script::query_dataset_types(&repo, &glob, verbose, components)?),
        Command::RemoveDatasetType { repo, name } => {
            Ok(script::remove_dataset_type(&repo, &name)?)
        }
        Command::QueryDatasets {
            repo,
            glob,
            collections,
            where_,
            find_first,
            show_uri,
        } => {
            let query = DatasetQuery {
                dataset_types: glob,
                collections,
                where_,
                find_first,
            };
            let tables = script::query_datasets(&repo, &query, show_uri)?;
            if tables.is_empty() {
                println!("No datasets found.");
            }
            for (i, table) in tables.iter().enumerate() {
                if i > 0 {
                    println!();
                }
                print!("{table}");
            }
            Ok(())
        }
        Command::CertifyCalibrations {
            repo,
            input_collection,
            output_collection,
            dataset_type,
            begin_date,
            end_date,
            search_all_inputs,
        } => {
            let certified = script::certify_calibrations(
                &repo,
                &input_collection,
                &output_collection,
                &dataset_type,
                begin_date.as_deref(),
                end_date.as_deref(),
                search_all_inputs,
            )?;
            tracing::info!(certified, output = %output_collection, "certified calibrations");
            Ok(())
        }
        Command::QueryDataIds {
            repo,
            dimensions,
            datasets,
            collections,
            where_,
        } => print_table(&script::query_data_ids(
            &repo,
            &dimensions,
            &datasets,
            &collections,
            &where_,
        )?),
        Command::QueryDimensionRecords {
            repo,
            element,
            where_,
        } => print_table(&script::query_dimension_records(&repo, &element, &where_)?),
    }
}

fn print_table(table: &Table) -> Result<()> {
    if table.is_empty() {
        println!("No results.");
    } else {
        print!("{table}");
    }
    Ok(())
}
