// VecShelf — main.rs
// Binary entry point: populate, bring new data, search, or all three.
// Author: d65v <https://github.com/d65v>

use std::env;
use std::time::Instant;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vshelf::pipeline::Pipeline;
use vshelf::{Record, RecordSource, Session, ShelfConfig};

fn main() {
    // Initialize logger, respects RUST_LOG
    env_logger::init();

    // Load .env if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("run");

    let outcome = match mode {
        "populate" => run_populate(),
        "bring-new" => run_bring_new(),
        "search" => run_search(),
        "run" => run_all(),
        "bench" => run_bench(),
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        unknown => {
            eprintln!("[VecShelf] Unknown mode: '{}'. Try --help.", unknown);
            std::process::exit(1);
        }
    };

    if let Err(e) = outcome {
        eprintln!("[VecShelf] error: {:#}", e);
        std::process::exit(1);
    }
}

fn setup() -> Result<(ShelfConfig, Session, RecordSource)> {
    let config = ShelfConfig::from_env();
    config.validate().context("invalid configuration")?;
    log::info!(
        "Config: uri={}, target={}.{}, index={}, limit={}",
        config.uri,
        config.database,
        config.collection,
        config.index,
        config.search_limit
    );

    let source = RecordSource::load(&config.vectors_path, &config.titles_path)
        .with_context(|| {
            format!(
                "loading record source ({}, {})",
                config.vectors_path, config.titles_path
            )
        })?;
    let session = Session::from_config(&config)
        .with_context(|| format!("opening session on {}", config.uri))?;
    Ok((config, session, source))
}

fn run_populate() -> Result<()> {
    let (config, mut session, source) = setup()?;
    let report = Pipeline::new(&config)
        .populate(&mut session, &source)
        .context("populate failed")?;
    println!(
        "[VecShelf] '{}' populated: {} rows",
        report.collection, report.row_count
    );
    session.close().context("closing session")?;
    Ok(())
}

fn run_bring_new() -> Result<()> {
    let (config, mut session, source) = setup()?;
    let report = Pipeline::new(&config)
        .bring_new_data(&mut session, &source)
        .context("bring-new failed")?;
    println!(
        "[VecShelf] '{}': +{} rows, {} total",
        report.collection, report.inserted, report.row_count
    );
    session.close().context("closing session")?;
    Ok(())
}

fn run_search() -> Result<()> {
    let (config, mut session, source) = setup()?;
    let result = Pipeline::new(&config)
        .search_probe(&mut session, &source)
        .context("search failed")?;
    print_hits(&result.probe, &result.hits)?;
    session.close().context("closing session")?;
    Ok(())
}

fn run_all() -> Result<()> {
    let (config, mut session, source) = setup()?;
    let summary = Pipeline::new(&config)
        .run(&mut session, &source)
        .context("pipeline failed")?;
    println!(
        "[VecShelf] populated {} rows, then {} after bring-new",
        summary.populated.row_count, summary.added.row_count
    );
    print_hits(&summary.probe.probe, &summary.probe.hits)?;
    session.close().context("closing session")?;
    Ok(())
}

fn print_hits(probe: &Record, hits: &[vshelf::Hit]) -> Result<()> {
    println!(
        "\n[VecShelf] Top-{} titles like {:?} (id {}):",
        hits.len(),
        probe.label,
        probe.id
    );
    for hit in hits {
        let line = serde_json::to_string(&hit.to_json("anime_name"))
            .context("encoding hit")?;
        println!("  {}", line);
    }
    Ok(())
}

fn run_bench() -> Result<()> {
    println!("[VecShelf] Running internal benchmark...");

    const N: usize = 20_000;
    const DIM: usize = 128;

    let mut rng = StdRng::seed_from_u64(42);
    let records: Vec<Record> = (0..N)
        .map(|i| {
            let v: Vec<f32> = (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            Record::new(i as i64, format!("synthetic {}", i), v)
        })
        .collect();
    let source = RecordSource::from_records(records).context("building synthetic source")?;

    let config = ShelfConfig {
        uri: "memory://".to_string(),
        ..ShelfConfig::default()
    };
    let mut session = Session::from_config(&config)?;
    let pipeline = Pipeline::new(&config);

    let t0 = Instant::now();
    let populated = pipeline.populate(&mut session, &source)?;
    println!(
        "  Populated {} rows in {}ms",
        populated.row_count,
        t0.elapsed().as_millis()
    );

    let t1 = Instant::now();
    let added = pipeline.bring_new_data(&mut session, &source)?;
    println!(
        "  Added {} rows in {}μs",
        added.inserted,
        t1.elapsed().as_micros()
    );

    let t2 = Instant::now();
    let result = pipeline.search_probe(&mut session, &source)?;
    println!(
        "  Search (top-{}) in {}μs",
        result.hits.len(),
        t2.elapsed().as_micros()
    );

    session.close()?;
    Ok(())
}

fn print_help() {
    println!(
        r#"
VecShelf — Title Embedding Shelf

USAGE:
  vecshelf [MODE]

MODES:
  populate   Reset the collection and bulk-load the catalog
  bring-new  Insert the held-back titles into the populated collection
  search     Query with the held-out probe title and print the hits
  run        All three, in order (default)
  bench      Run the pipeline on a synthetic in-memory dataset
  help       Show this message

ENVIRONMENT:
  VECSHELF_URI             Backend: local://<dir> | memory:// (default: local://./data)
  VECSHELF_TOKEN           Credential passed on connect (default: root:Milvus)
  VECSHELF_DATABASE        Database name (default: anime_database)
  VECSHELF_COLLECTION      Collection name (default: anime_embeddings_collection)
  VECSHELF_VECTORS_PATH    Vectors table, .csv or .npy (default: ./dataset/embeddings_df.csv)
  VECSHELF_TITLES_PATH     Titles table with a 'title' column (default: ./dataset/65k_anime_data.csv)
  VECSHELF_SEARCH_LIMIT    Hits returned by the probe search (default: 11)
  VECSHELF_MAX_RETRIES     Retries for transient backend errors (default: 3)
  VECSHELF_INDEX           Vector index: autoindex | flat | hnsw (default: autoindex)
  RUST_LOG                 Log level: info | debug | warn | error

AUTHOR:
  d65v <https://github.com/d65v>
"#
    );
}
