use anyhow::{Context, Result};
use clap::Parser;
use repograph::agent::{CommandCompletionClient, Collaborators, ResolutionRequest};
use repograph::cli::{self, RepoArgs};
use repograph::exec::{ShellCommandRunner, VerifyCommands};
use repograph::model::{EdgeKind, NodeId, NodeKind, RepositoryRef};
use repograph::store::{GraphStore, NamePattern, SqliteGraphStore};
use repograph::{Config, Engine, IngestOverrides, logging};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn default_db_path(repo: &Path) -> PathBuf {
    repo.join(".repograph").join("graph.sqlite")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_engine(config: Config, args: &RepoArgs) -> Result<Engine> {
    let db_path = args.db.clone().unwrap_or_else(|| default_db_path(&args.repo));
    let store = SqliteGraphStore::open(&db_path, &config.store)
        .with_context(|| format!("open graph store {}", db_path.display()))?;
    Ok(Engine::new(config, Arc::new(store)))
}

/// Pin the revision to query: explicit, else the latest ingested, else HEAD.
fn query_repo(engine: &Engine, args: &RepoArgs) -> Result<RepositoryRef> {
    let repo = RepositoryRef::open(&args.repo, args.revision.as_deref())?;
    if args.revision.is_some() {
        return Ok(repo);
    }
    match engine.store().latest_revision(&repo.key())? {
        Some(revision) => Ok(RepositoryRef { revision, ..repo }),
        None => Ok(repo),
    }
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    logging::init(args.verbose, args.log_json);
    let config = Config::load(args.config.as_deref())?;

    match args.command {
        cli::Command::Ingest {
            repo,
            max_depth,
            batch_size,
        } => {
            let engine = open_engine(config, &repo)?;
            let repository = RepositoryRef::open(&repo.repo, repo.revision.as_deref())?;
            let summary = engine.ingest(
                &repository,
                IngestOverrides {
                    max_depth,
                    batch_size,
                },
            )?;
            print_json(&summary)
        }
        cli::Command::Retrieve {
            repo,
            query,
            budget,
            text,
        } => {
            let engine = open_engine(config, &repo)?;
            let repository = query_repo(&engine, &repo)?;
            let context = engine.retrieve(&query, &repository, budget)?;
            if text {
                print!("{}", context.render());
                Ok(())
            } else {
                print_json(&context)
            }
        }
        cli::Command::Find {
            repo,
            pattern,
            kind,
        } => {
            let engine = open_engine(config, &repo)?;
            let repository = query_repo(&engine, &repo)?;
            let kind = kind
                .map(|value| value.parse::<NodeKind>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let mut nodes = engine
                .store()
                .find_by_name(&repository.scope(), &NamePattern::new(&pattern), kind)?;
            // file bodies stay out of listings
            nodes.iter_mut().for_each(|node| node.text = None);
            print_json(&nodes)
        }
        cli::Command::Neighbors {
            repo,
            node,
            depth,
            edge_kinds,
        } => {
            let engine = open_engine(config, &repo)?;
            let kinds = if edge_kinds.is_empty() {
                EdgeKind::ALL.to_vec()
            } else {
                edge_kinds
                    .iter()
                    .map(|value| value.parse::<EdgeKind>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(anyhow::Error::msg)?
            };
            let mut neighbors = engine
                .store()
                .get_neighbors(&NodeId(node), &kinds, depth)?;
            neighbors.iter_mut().for_each(|neighbor| neighbor.node.text = None);
            print_json(&neighbors)
        }
        cli::Command::Overview { repo } => {
            let engine = open_engine(config, &repo)?;
            let repository = query_repo(&engine, &repo)?;
            let overview = engine.store().overview(&repository.scope())?;
            print_json(&overview)
        }
        cli::Command::Resolve {
            repo,
            goal,
            content,
            content_file,
            build_cmd,
            test_cmd,
            completion_cmd,
            budget,
        } => {
            let content = match (content, content_file) {
                (Some(text), _) => text,
                (None, Some(path)) => repograph::util::read_to_string(&path)?,
                (None, None) => anyhow::bail!("resolve needs --content or --content-file"),
            };
            let engine = open_engine(config, &repo)?;
            let repository = query_repo(&engine, &repo)?;
            let request = ResolutionRequest {
                goal,
                repository,
                content,
                verify: VerifyCommands {
                    build: build_cmd,
                    test: test_cmd,
                },
                token_budget: budget,
            };
            let completion = CommandCompletionClient::new(
                completion_cmd,
                engine.config().agent.command_timeout(),
            );
            let collaborators =
                Collaborators::new(Arc::new(completion), Arc::new(ShellCommandRunner));

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let outcome = runtime.block_on(engine.resolve(request, collaborators));
            print_json(&outcome)
        }
    }
}
