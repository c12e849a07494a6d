// VecShelf — example/basic.rs
// Provision a collection, load a handful of titles, add one later, search.
// Run with:  cargo run --example basic

use vshelf::{
    BulkIngestor, CollectionProvisioner, IncrementalIngestor, Record, SchemaManager, SchemaSpec,
    Session, SimilaritySearcher,
};

fn main() -> vshelf::Result<()> {
    env_logger::init();

    println!("── VecShelf Basic Example ────────────────────");

    let mut session = Session::open("memory://", "root:Milvus")?;

    let (schema, indexes) = SchemaManager::define(&SchemaSpec::titles(4))?;
    CollectionProvisioner::new(&mut session).provision("demo", "titles", &schema, &indexes)?;

    let catalog = vec![
        Record::new(0, "Cowboy Bebop", vec![0.9, 0.1, 0.0, 0.0]),
        Record::new(1, "Trigun", vec![0.8, 0.2, 0.0, 0.0]),
        Record::new(2, "Clannad", vec![0.0, 0.0, 0.9, 0.1]),
        Record::new(3, "Kanon", vec![0.0, 0.0, 0.8, 0.2]),
    ];
    let report = BulkIngestor::new(&mut session).ingest("titles", &catalog)?;
    println!("Loaded {} titles.", report.row_count);

    let late = vec![Record::new(4, "Outlaw Star", vec![0.7, 0.3, 0.0, 0.0])];
    let report = IncrementalIngestor::new(&mut session).ingest("titles", &late)?;
    println!("Added {}, now {} titles.\n", report.inserted, report.row_count);

    // Something close to "Cowboy Bebop"
    let query = vec![0.95, 0.05, 0.0, 0.0];
    let hits = SimilaritySearcher::new(&mut session).search("titles", &query, 3)?;

    println!("Top-3 for query {:?}:", query);
    for hit in &hits {
        println!("  {}", hit);
    }
    println!("\nExpected: Cowboy Bebop, Trigun, Outlaw Star (in that order)");

    session.close()?;
    println!("\n── Done ──────────────────────────────────────");
    Ok(())
}
