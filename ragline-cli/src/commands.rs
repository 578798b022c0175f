//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use anyhow::Context;
use ragline_core::config::{RaglineConfig, VectorStoreConfig, load_config, user_config_path};
use ragline_core::{DocumentInput, RagService};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    explicit_config: Option<&Path>,
) -> anyhow::Result<()> {
    let command = match command {
        Commands::Config { action } => return handle_config(action, workspace, explicit_config),
        other => other,
    };

    let service = build_service(workspace, explicit_config)?;
    let result = match command {
        Commands::Ingest { paths } => handle_ingest(&service, &paths, workspace).await,
        Commands::Ask {
            question,
            json,
            deadline_secs,
        } => handle_ask(&service, &question, json, deadline_secs).await,
        Commands::Delete { doc_id } => handle_delete(&service, &doc_id).await,
        Commands::Status { json } => handle_status(&service, json).await,
        Commands::Config { .. } => Ok(()),
    };
    service.shutdown().await;
    result
}

fn load(workspace: &Path, explicit_config: Option<&Path>) -> anyhow::Result<RaglineConfig> {
    let mut config = load_config(Some(workspace), explicit_config)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    // Relative store paths live under the workspace, not the caller's cwd.
    if let VectorStoreConfig::Sqlite { path } = &mut config.vector_store
        && path.is_relative()
    {
        *path = workspace.join(&*path);
    }
    Ok(config)
}

fn build_service(workspace: &Path, explicit_config: Option<&Path>) -> anyhow::Result<RagService> {
    let config = load(workspace, explicit_config)?;
    RagService::from_config(config).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    explicit_config: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".ragline");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&RaglineConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, explicit_config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigAction::Path => {
            let describe = |path: &Path| {
                let state = if path.exists() { "found" } else { "not found" };
                format!("{} ({state})", path.display())
            };
            match user_config_path() {
                Some(path) => println!("User:      {}", describe(&path)),
                None => println!("User:      (no home directory)"),
            }
            println!(
                "Workspace: {}",
                describe(&workspace.join(".ragline").join("config.toml"))
            );
            if let Some(path) = explicit_config {
                println!("Explicit:  {}", describe(path));
            }
            println!("Environment overrides: RAGLINE_<SECTION>__<KEY>");
            Ok(())
        }
    }
}

/// Expand directories into the files with a configured extension.
fn collect_files(paths: &[PathBuf], extensions: &[String]) -> Vec<PathBuf> {
    let wanted = |path: &Path| {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
    };
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        for entry in WalkDir::new(path)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() && wanted(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

fn read_document(path: &Path, workspace: &Path) -> anyhow::Result<DocumentInput> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let doc_id = absolute
        .strip_prefix(workspace)
        .unwrap_or(&absolute)
        .to_string_lossy()
        .replace('\\', "/");
    let title = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| doc_id.clone());
    Ok(DocumentInput::new(doc_id, text)
        .with_title(title)
        .with_source(absolute.display().to_string()))
}

async fn handle_ingest(service: &RagService, paths: &[PathBuf], workspace: &Path) -> anyhow::Result<()> {
    let files = collect_files(paths, &service.config().ingest.extensions);
    if files.is_empty() {
        anyhow::bail!("No ingestible files found");
    }

    let mut docs = Vec::with_capacity(files.len());
    for file in &files {
        match read_document(file, workspace) {
            Ok(doc) => docs.push(doc),
            Err(e) => eprintln!("  Skipping: {e:#}"),
        }
    }

    let report = service.ingest_batch(docs).await;
    for r in &report.ingested {
        println!("  {} ({} chunks)", r.doc_id, r.chunks);
    }
    for (doc_id, error) in &report.failed {
        eprintln!("  Failed {doc_id}: {error}");
    }
    println!(
        "Ingested {} document(s), {} chunk(s); {} failed",
        report.ingested.len(),
        report.total_chunks(),
        report.failed.len()
    );
    if report.ingested.is_empty() {
        anyhow::bail!("Nothing was ingested");
    }
    Ok(())
}

async fn handle_ask(
    service: &RagService,
    question: &str,
    json: bool,
    deadline_secs: Option<u64>,
) -> anyhow::Result<()> {
    let answer = match deadline_secs {
        Some(secs) => {
            service
                .answer_with_deadline(question, Duration::from_secs(secs))
                .await?
        }
        None => service.answer(question).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }
    println!("{}", answer.answer_text);
    if !answer.cited_chunks.is_empty() {
        println!("\nSources:");
        for (i, citation) in answer.cited_chunks.iter().enumerate() {
            println!(
                "  [{}] {} ({}, similarity {:.2})",
                i + 1,
                citation.title,
                citation.chunk_id,
                citation.similarity_score
            );
        }
    }
    if answer.degraded {
        eprintln!("\n  (degraded: an upstream service is unreachable)");
    }
    Ok(())
}

async fn handle_delete(service: &RagService, doc_id: &str) -> anyhow::Result<()> {
    let removed = service.delete_document(doc_id).await?;
    if removed == 0 {
        println!("No chunks found for '{doc_id}'");
    } else {
        println!("Removed {removed} chunk(s) of '{doc_id}'");
    }
    Ok(())
}

async fn handle_status(service: &RagService, json: bool) -> anyhow::Result<()> {
    let status = service.status().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    match status.corpus_size {
        Some(n) => println!("Corpus: {n} chunk(s)"),
        None => println!("Corpus: unavailable"),
    }
    println!("\nPools:");
    for pool in &status.pools {
        println!(
            "  {:<13} {:?}  active {}  idle {}  unhealthy {}  (min {}, max {})",
            pool.service,
            pool.health,
            pool.active,
            pool.idle,
            pool.unhealthy,
            pool.min_connections,
            pool.max_connections
        );
    }
    println!("\nCaches:");
    for (name, stats) in [
        ("answer", &status.caches.answer),
        ("retrieval", &status.caches.retrieval),
        ("embedding", &status.caches.embedding),
    ] {
        println!(
            "  {:<13} {} entries  {} bytes  hit rate {:.1}%",
            name,
            stats.entries,
            stats.memory_bytes,
            stats.hit_rate * 100.0
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_files_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "# A").unwrap();
        std::fs::write(dir.path().join("b.txt"), "B").unwrap();
        std::fs::write(dir.path().join("c.png"), [0u8; 4]).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("d.MD"), "D").unwrap();

        let files = collect_files(&[dir.path().to_path_buf()], &["md".into(), "txt".into()]);
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 3);
        assert!(!names.contains(&"c.png".to_string()));
    }

    #[test]
    fn test_read_document_uses_workspace_relative_id() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().canonicalize().unwrap();
        std::fs::create_dir(workspace.join("docs")).unwrap();
        let file = workspace.join("docs").join("guide.md");
        std::fs::write(&file, "Some guide text.").unwrap();

        let doc = read_document(&file, &workspace).unwrap();
        assert_eq!(doc.doc_id, "docs/guide.md");
        assert_eq!(doc.title, "guide");
        assert_eq!(doc.text, "Some guide text.");
    }
}
