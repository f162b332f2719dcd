//! Genome Anchor CLI
//!
//! Commands:
//!   genome-anchor encode   — print canonical wire form and digest
//!   genome-anchor decode   — validate a genome document
//!   genome-anchor verify   — round-trip and build/encode integrity check
//!   genome-anchor build    — build a phenotype with the test resolver
//!   genome-anchor anchor   — anchor a genome digest on the simulated ledger
//!   genome-anchor records  — list stored anchor records
//!   genome-anchor demo     — run the whole flow end to end

use genome_anchor::genome::{Binding, GenomeCodec, GenomeModel, Unit, UnitKind};
use genome_anchor::ledger::{
    EnvKeyProvider, KeyMaterial, KeyProvider, LedgerContext, SignerIdentity, SimulatedNode,
    StaticKeyProvider,
};
use genome_anchor::phenotype::{PhenotypeBuilder, PhenotypeEncoder, Resolver, TestResolver};
use genome_anchor::{AnchorConfig, BreakerRegistry, RecordStore, TransactionLifecycleManager};
use serde_json::json;
use std::env;
use std::sync::Arc;

const STORE_FILE: &str = "genome-anchor-records.json";
const KEY_NAME: &str = "anchor";
const NODE_ENDPOINT: &str = "https://ledger.simulated.local";

fn print_usage() {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║        Genome Anchor v0.1                                    ║
║        Content-addressed genomes, anchored to a ledger       ║
╚══════════════════════════════════════════════════════════════╝

Usage: genome-anchor <command> [options]

Commands:
  encode   <genome.yaml>                 Print canonical wire form and digest
  decode   <genome.yaml>                 Validate and summarize a genome
  verify   <genome.yaml>                 Round-trip + phenotype integrity check
  build    <genome.yaml>                 Build a phenotype (test resolver)
  anchor   <genome.yaml> [config.yaml]   Anchor the digest (simulated ledger)
  records                                List stored anchor records
  demo                                   Run the full flow end to end

Signing key: hex in ${}, otherwise an ephemeral key is generated.
"#,
        EnvKeyProvider::variable(KEY_NAME)
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "encode" => cmd_encode(&args[2..]),
        "decode" => cmd_decode(&args[2..]),
        "verify" => cmd_verify(&args[2..]).await,
        "build" => cmd_build(&args[2..]).await,
        "anchor" => cmd_anchor(&args[2..]).await,
        "records" => cmd_records(),
        "demo" => cmd_demo().await,
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
        }
    }
}

/// Read and decode a genome file, reporting errors to stderr
fn load_genome(args: &[String], usage: &str) -> Option<GenomeModel> {
    let Some(path) = args.first() else {
        eprintln!("Usage: genome-anchor {}", usage);
        return None;
    };
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("  Cannot read {}: {}", path, e);
            return None;
        }
    };
    match GenomeCodec::decode(&bytes) {
        Ok(model) => Some(model),
        Err(e) => {
            eprintln!("  {}: {}", path, e);
            None
        }
    }
}

fn load_keys() -> Arc<dyn KeyProvider> {
    if env::var(EnvKeyProvider::variable(KEY_NAME)).is_ok() {
        return Arc::new(EnvKeyProvider);
    }
    println!("  No signing key configured, using an ephemeral key");
    Arc::new(StaticKeyProvider::new().with_key(KEY_NAME, KeyMaterial::generate()))
}

fn breakers(config: &AnchorConfig) -> Arc<BreakerRegistry> {
    Arc::new(BreakerRegistry::new(config.breaker_config()))
}

fn cmd_encode(args: &[String]) {
    let Some(model) = load_genome(args, "encode <genome.yaml>") else { return };
    match GenomeCodec::encode(&model) {
        Ok(encoded) => {
            println!("{}", String::from_utf8_lossy(encoded.wire.as_bytes()));
            println!("digest: {}", encoded.digest);
        }
        Err(e) => eprintln!("  Encode failed: {}", e),
    }
}

fn cmd_decode(args: &[String]) {
    let Some(model) = load_genome(args, "decode <genome.yaml>") else { return };
    println!("  Instance:  {}", model.instance_identifier());
    println!("  Schema:    v{}", model.header.schema_version);
    println!("  Limit:     {}", model.header.resource_limit);
    println!("  Units:     {:?}", model.unit_names());
    println!("  Bindings:  {:?}", model.binding_names());
    println!("  Policy:    {}", model.policy_digest);
}

async fn cmd_verify(args: &[String]) {
    let Some(model) = load_genome(args, "verify <genome.yaml>") else { return };
    let digest = match GenomeCodec::verify_round_trip(&model) {
        Ok(digest) => digest,
        Err(e) => {
            eprintln!("  Round trip failed: {}", e);
            return;
        }
    };
    println!("  Round trip OK     {}", digest);

    let builder = PhenotypeBuilder::new(breakers(&AnchorConfig::default()));
    let resolver = Resolver::Test(TestResolver::noop());
    let phenotype = match builder.build(&model, &resolver).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("  Build failed: {}", e);
            return;
        }
    };
    match PhenotypeEncoder::verify(&model, &phenotype) {
        Ok(d) => println!("  Phenotype OK      {}", d),
        Err(e) => eprintln!("  {}", e),
    }
}

async fn cmd_build(args: &[String]) {
    let Some(model) = load_genome(args, "build <genome.yaml>") else { return };
    let builder = PhenotypeBuilder::new(breakers(&AnchorConfig::default()));
    let resolver = Resolver::Test(TestResolver::noop());
    match builder.build(&model, &resolver).await {
        Ok(phenotype) => {
            println!(
                "  Phenotype {} ({} resolver) | est. cost {:.4}{}",
                phenotype.instance_identifier(),
                resolver.variant(),
                phenotype.cost_estimate(),
                if phenotype.is_degraded() { " | DEGRADED" } else { "" }
            );
            for unit in phenotype.units() {
                let caps: Vec<&str> = unit.capabilities().iter().map(|c| c.binding()).collect();
                println!("    {:<16} {:<8} bindings {:?}", unit.name(), unit.kind().tag(), caps);
            }
        }
        Err(e) => eprintln!("  Build failed: {}", e),
    }
}

async fn cmd_anchor(args: &[String]) {
    let Some(model) = load_genome(args, "anchor <genome.yaml> [config.yaml]") else { return };
    let config = match args.get(1) {
        Some(path) => match AnchorConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("  {}", e);
                return;
            }
        },
        None => AnchorConfig::default(),
    };
    let encoded = match GenomeCodec::encode(&model) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("  Encode failed: {}", e);
            return;
        }
    };

    let keys = load_keys();
    let signer = match SignerIdentity::from_provider(KEY_NAME, keys.as_ref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("  {}", e);
            return;
        }
    };
    println!("  Signer:  {}", signer.address);
    println!("  Digest:  {}", encoded.digest);

    let registry = breakers(&config);
    let ctx = LedgerContext::new(Arc::new(SimulatedNode::new(NODE_ENDPOINT)), &registry);
    let manager = TransactionLifecycleManager::new(config, keys, signer);

    let result = manager
        .anchor(&ctx, encoded.digest.as_bytes(), model.instance_identifier(), None)
        .await;
    match &result {
        Ok(record) => println!(
            "  {} | block {:?} | depth {} | {}",
            record.status,
            record.block_reference,
            record.confirmation_depth,
            record.reason.as_deref().unwrap_or("")
        ),
        Err(e) => eprintln!("  Anchor failed: {}", e),
    }
    save_records(&manager);
}

fn save_records(manager: &TransactionLifecycleManager) {
    let mut store = match RecordStore::open(STORE_FILE, KEY_NAME) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("  {}", e);
            return;
        }
    };
    for record in manager.records().into_iter().filter(|r| r.is_terminal()) {
        if let Err(e) = store.add(record) {
            eprintln!("  {}", e);
        }
    }
    match store.save() {
        Ok(()) => println!("  Saved to {}", STORE_FILE),
        Err(e) => eprintln!("  Failed to save: {}", e),
    }
}

fn cmd_records() {
    let store = match RecordStore::open(STORE_FILE, KEY_NAME) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("  {}", e);
            return;
        }
    };
    println!("  {}", store.summary());
    for record in &store.records {
        println!(
            "    {} {:<20} {:<10} {}  {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.instance_identifier,
            record.status.to_string(),
            record.digest_hex().chars().take(16).collect::<String>(),
            record.reason.as_deref().unwrap_or("")
        );
    }
}

fn demo_genome() -> GenomeModel {
    let mut genome = GenomeModel::minimal("demo-agent-1", "0".repeat(64));
    genome.units = vec![
        Unit::new("proc", UnitKind::Echo),
        Unit::new("lookup", UnitKind::Relay)
            .with_param("binding", json!("search"))
            .with_cost(0.25),
        Unit::new("survey", UnitKind::Fanout)
            .with_param("bindings", json!(["search", "archive"]))
            .with_param("fallback", json!("unavailable"))
            .with_cost(1.5),
    ];
    genome.bindings = vec![
        Binding::new("search", "mcp:search", "https://tools.example.org/search").with_price_cap(0.01),
        Binding::new("archive", "mcp:archive", "https://tools.example.org/archive"),
    ];
    genome
}

async fn cmd_demo() {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║              Genome Anchor — Full Demo                       ║
║       Encode + Build + Verify + Anchor                       ║
╚══════════════════════════════════════════════════════════════╝
"#
    );

    println!("Step 1: Encoding genome...");
    println!("{}", "-".repeat(60));
    let genome = demo_genome();
    let encoded = match GenomeCodec::encode(&genome) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("  Encode failed: {}", e);
            return;
        }
    };
    println!("  {} bytes of YAML, digest {}", encoded.wire.len(), encoded.digest);
    match GenomeCodec::decode_with_digest(encoded.wire.as_bytes()) {
        Ok((_, digest)) => println!("  Decoded and re-encoded, digest {}", digest),
        Err(e) => eprintln!("  Decode failed: {}", e),
    }

    println!("\nStep 2: Building phenotype (archive unavailable)...");
    println!("{}", "-".repeat(60));
    let config = AnchorConfig {
        poll_interval_ms: 200,
        finality_threshold: 3,
        ..AnchorConfig::default()
    };
    let registry = breakers(&config);
    let builder = PhenotypeBuilder::new(registry.clone());
    let resolver = Resolver::Test(TestResolver::noop().failing("mcp:archive"));
    let mut phenotype = match builder.build(&genome, &resolver).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("  Build failed: {}", e);
            return;
        }
    };
    for unit in ["proc", "lookup", "survey"] {
        match phenotype.execute(unit, json!({"query": "content addressing"})).await {
            Ok(out) => println!("  {:<8} -> {}", unit, out),
            Err(e) => eprintln!("  {:<8} !! {}", unit, e),
        }
    }
    println!("  Usage: {:?}", phenotype.binding_usage());

    println!("\nStep 3: Verifying phenotype against genome...");
    println!("{}", "-".repeat(60));
    match PhenotypeEncoder::verify(&genome, &phenotype) {
        Ok(d) => println!("  Integrity OK, digest {}", d),
        Err(e) => eprintln!("  {}", e),
    }

    println!("\nStep 4: Anchoring digest on the simulated ledger...");
    println!("{}", "-".repeat(60));
    let keys: Arc<dyn KeyProvider> =
        Arc::new(StaticKeyProvider::new().with_key(KEY_NAME, KeyMaterial::generate()));
    let signer = match SignerIdentity::from_provider(KEY_NAME, keys.as_ref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("  {}", e);
            return;
        }
    };
    let node = Arc::new(SimulatedNode::new(NODE_ENDPOINT));
    node.fail_submissions(1);
    let ctx = LedgerContext::new(node.clone(), &registry);
    let manager = TransactionLifecycleManager::new(config, keys, signer);
    match manager
        .anchor(&ctx, encoded.digest.as_bytes(), genome.instance_identifier(), None)
        .await
    {
        Ok(record) => println!(
            "  {} after {} submission attempts: {}",
            record.status,
            record.attempt_count,
            record.reason.as_deref().unwrap_or("")
        ),
        Err(e) => eprintln!("  Anchor failed: {}", e),
    }

    let stats = manager.stats();
    println!("\n  Records: {} | retries: {}", stats.total_records, stats.retries_performed);
    for breaker in registry.stats() {
        println!(
            "  Breaker {:<40} {} (failures {})",
            breaker.endpoint, breaker.state, breaker.failure_count
        );
    }
}
