//! Command surface for the memory evidence toolchain.
//!
//! Two entry points mirror the build/query split of the system:
//! - `mev index build` parses the memory log and rebuilds the SQLite index.
//! - `mev pack build` answers one hybrid query and renders the evidence pack,
//!   lazily rebuilding the index first when it is empty.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use memory_evidence_core::{
    load_memory_log, render_evidence_pack, score_line, tokenize, DocumentHit, EvidenceHit,
    MemoryHit, TagHit, TaskLinks,
};
use memory_evidence_store_sqlite::SqliteMemoryIndex;

/// Default contract/pattern corpus file names, resolved against `--docs-dir`
/// (or the memory log's directory when no docs dir is given). Missing files
/// are skipped: the corpus is best-effort reference material.
pub const DEFAULT_DOC_CANDIDATES: &[&str] = &[
    "style_guide.md",
    "api_contracts.md",
    "scene_contracts.md",
    "failure_patterns.md",
    "integration_gate_checklist.md",
    "patterns.catalog.yaml",
];

#[derive(Debug, Parser)]
#[command(name = "mev")]
#[command(about = "Memory evidence index and hybrid retrieval CLI")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Index {
        #[command(subcommand)]
        command: Box<IndexCommand>,
    },
    Pack {
        #[command(subcommand)]
        command: Box<PackCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum IndexCommand {
    Build(IndexBuildArgs),
}

#[derive(Debug, Args)]
pub struct IndexBuildArgs {
    #[arg(long)]
    memory_log: PathBuf,
    #[arg(long)]
    db: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum PackCommand {
    Build(PackBuildArgs),
}

#[derive(Debug, Args)]
pub struct PackBuildArgs {
    #[arg(long)]
    query: String,
    #[arg(long)]
    memory_log: PathBuf,
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    task_packet: Option<PathBuf>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value_t = 8)]
    top_k: usize,
    #[arg(long)]
    docs_dir: Option<PathBuf>,
    #[arg(long = "doc")]
    docs: Vec<PathBuf>,
    #[arg(long)]
    json: bool,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the memory log is missing or malformed, or when any
/// store operation fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Index { command } => match *command {
            IndexCommand::Build(args) => run_index_build(&args),
        },
        Command::Pack { command } => match *command {
            PackCommand::Build(args) => run_pack_build(&args),
        },
    }
}

/// Parses the memory log and performs a full index rebuild.
///
/// # Errors
/// Returns an error before touching the store when the log is missing or
/// malformed; store failures roll the index back to its previous state.
pub fn run_index_build(args: &IndexBuildArgs) -> Result<()> {
    let records = load_memory_log(&args.memory_log)?;

    ensure_parent_dir(&args.db)?;
    let mut store = SqliteMemoryIndex::open(&args.db)?;
    store.migrate()?;
    let report = store.rebuild(&records)?;

    println!("[INDEX][PASS] Indexed memories: {}", report.records_indexed);
    println!(
        "[INDEX][PASS] Indexed failure tags: {}",
        report.tag_associations
    );
    println!("[INDEX][PASS] Database: {}", args.db.display());
    Ok(())
}

/// Runs the three retrieval strategies for one query and renders the pack.
///
/// # Errors
/// Returns an error when the lazy rebuild needs the log and it is missing or
/// malformed, or when a store or output-file operation fails.
pub fn run_pack_build(args: &PackBuildArgs) -> Result<()> {
    ensure_parent_dir(&args.db)?;
    let mut store = SqliteMemoryIndex::open(&args.db)?;
    store.migrate()?;

    if store.is_empty()? {
        let records = load_memory_log(&args.memory_log)?;
        let _ = store.rebuild(&records)?;
    }

    let links = load_task_links(args.task_packet.as_deref())?;
    let memory_hits = store.search_memories(&args.query, args.top_k)?;
    let tag_hits = store.search_tags(&args.query, args.top_k)?;
    let document_hits = scan_documents(&document_candidates(args), &args.query, args.top_k);

    let mut hits: Vec<EvidenceHit> = Vec::new();
    hits.extend(memory_hits.iter().cloned().map(EvidenceHit::Memory));
    hits.extend(tag_hits.iter().cloned().map(EvidenceHit::Tag));
    hits.extend(document_hits.iter().cloned().map(EvidenceHit::Document));

    let rendered = render_evidence_pack(&args.query, &links, &hits);

    if let Some(out) = &args.out {
        ensure_parent_dir(out)?;
        fs::write(out, &rendered)
            .with_context(|| format!("failed to write evidence pack to {}", out.display()))?;
        println!("[PACK][PASS] Evidence pack written: {}", out.display());
        println!(
            "[PACK][PASS] Hits: memory={} tags={} documents={}",
            memory_hits.len(),
            tag_hits.len(),
            document_hits.len()
        );
    }

    if args.json {
        let payload = build_pack_json_payload(
            &args.query,
            &links,
            memory_hits,
            tag_hits,
            document_hits,
            rendered,
        );
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if args.out.is_none() {
        print!("{rendered}");
    }

    Ok(())
}

/// Lexical scan over the external document corpus: each non-blank line scores
/// the number of distinct query tokens it contains, and the top `top_k` lines
/// come back ordered by score descending with a deterministic tie-break
/// (document path ascending, then line number ascending).
#[must_use]
pub fn scan_documents(paths: &[PathBuf], query: &str, top_k: usize) -> Vec<DocumentHit> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut scored = Vec::new();
    for path in paths {
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };
        for (index, line) in content.lines().enumerate() {
            let snippet = line.trim();
            if snippet.is_empty() {
                continue;
            }
            let score = score_line(&tokens, line);
            if score > 0 {
                scored.push(DocumentHit {
                    score,
                    path: path.display().to_string(),
                    line: index + 1,
                    snippet: snippet.to_string(),
                });
            }
        }
    }

    scored.sort_by(|lhs, rhs| {
        rhs.score
            .cmp(&lhs.score)
            .then_with(|| lhs.path.cmp(&rhs.path))
            .then_with(|| lhs.line.cmp(&rhs.line))
    });
    scored.truncate(top_k);
    scored
}

fn document_candidates(args: &PackBuildArgs) -> Vec<PathBuf> {
    if !args.docs.is_empty() {
        return args.docs.clone();
    }

    let base = args.docs_dir.clone().unwrap_or_else(|| {
        args.memory_log
            .parent()
            .map_or_else(PathBuf::new, Path::to_path_buf)
    });
    DEFAULT_DOC_CANDIDATES
        .iter()
        .map(|name| base.join(name))
        .collect()
}

/// Reads task linkage metadata from an optional YAML task packet. The packet
/// is an external collaborator's artifact: a missing file or a mis-shaped
/// document degrades to empty links, never an error.
fn load_task_links(path: Option<&Path>) -> Result<TaskLinks> {
    let Some(path) = path else {
        return Ok(TaskLinks::default());
    };
    if !path.exists() {
        return Ok(TaskLinks::default());
    }

    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read task packet {}", path.display()))?;
    Ok(extract_task_links(&text))
}

fn extract_task_links(text: &str) -> TaskLinks {
    let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(text) else {
        return TaskLinks::default();
    };

    let task = &value["task"];
    TaskLinks {
        task_id: yaml_text(&task["task_id"]),
        depends_on_task_ids: yaml_list(&task["depends_on_task_ids"]),
        depends_on_contract_ids: yaml_list(&task["depends_on_contract_ids"]),
    }
}

fn yaml_text(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(text) => text.clone(),
        serde_yaml::Value::Number(number) => number.to_string(),
        serde_yaml::Value::Bool(flag) => flag.to_string(),
        _ => String::new(),
    }
}

fn yaml_list(value: &serde_yaml::Value) -> Vec<String> {
    match value {
        serde_yaml::Value::Sequence(items) => items
            .iter()
            .map(yaml_text)
            .filter(|item| !item.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct PackJsonPayload {
    contract_version: String,
    query: String,
    task_id: String,
    depends_on_task_ids: Vec<String>,
    depends_on_contract_ids: Vec<String>,
    memory_hits: Vec<MemoryHit>,
    tag_hits: Vec<TagHit>,
    document_hits: Vec<DocumentHit>,
    rendered: String,
}

fn build_pack_json_payload(
    query: &str,
    links: &TaskLinks,
    memory_hits: Vec<MemoryHit>,
    tag_hits: Vec<TagHit>,
    document_hits: Vec<DocumentHit>,
    rendered: String,
) -> PackJsonPayload {
    PackJsonPayload {
        contract_version: "evidence_pack.v1".to_string(),
        query: query.to_string(),
        task_id: links.task_id.clone(),
        depends_on_task_ids: links.depends_on_task_ids.clone(),
        depends_on_contract_ids: links.depends_on_contract_ids.clone(),
        memory_hits,
        tag_hits,
        document_hits,
        rendered,
    }
}
