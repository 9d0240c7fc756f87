use crate::agent::Goal;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "repograph",
    version,
    about = "Code graph indexer and issue resolution agent",
    after_help = r#"Examples:
  repograph ingest --repo .
  repograph retrieve --repo . --query "why does `parse_config` fail on empty files?"
  repograph find --repo . --pattern "*config*" --kind function
  repograph neighbors --repo . --node n_3f2a9c0d1e4b5a6f --depth 2 --edge-kind calls
  repograph overview --repo .
  repograph resolve --repo . --goal issue --content-file issue.md --test-cmd "cargo test" --completion-cmd ./llm.sh
"#
)]
pub struct Args {
    /// TOML configuration file; REPOGRAPH_* variables override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Repository selection shared by every command.
#[derive(ClapArgs, Debug, Clone)]
pub struct RepoArgs {
    #[arg(long, default_value = ".")]
    pub repo: PathBuf,
    /// Graph database; defaults to <repo>/.repograph/graph.sqlite.
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Revision to pin. Queries default to the latest ingested revision,
    /// ingestion to the git HEAD.
    #[arg(long)]
    pub revision: Option<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Parse the repository and write its graph.
    Ingest {
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long)]
        max_depth: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Print the context a query would retrieve.
    Retrieve {
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long)]
        query: String,
        #[arg(long)]
        budget: Option<usize>,
        /// Print the rendered prompt context instead of JSON.
        #[arg(long)]
        text: bool,
    },
    /// Find nodes by name (`*` wildcard, case-insensitive).
    Find {
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long)]
        pattern: String,
        #[arg(long)]
        kind: Option<String>,
    },
    /// Breadth-first neighborhood of a node.
    Neighbors {
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long)]
        node: String,
        #[arg(long, default_value_t = 1)]
        depth: usize,
        /// Edge kinds to follow; all kinds when omitted.
        #[arg(long = "edge-kind", value_delimiter = ',')]
        edge_kinds: Vec<String>,
    },
    /// Node and edge counts for the repository graph.
    Overview {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Answer a question, resolve an issue or review a diff.
    Resolve {
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long, default_value = "issue")]
        goal: Goal,
        /// Request text; use --content-file for longer input.
        #[arg(long, conflicts_with = "content_file")]
        content: Option<String>,
        #[arg(long, value_name = "PATH")]
        content_file: Option<PathBuf>,
        #[arg(long)]
        build_cmd: Option<String>,
        #[arg(long)]
        test_cmd: Option<String>,
        /// Reads the prompt on stdin and writes the completion to stdout.
        #[arg(long)]
        completion_cmd: String,
        #[arg(long)]
        budget: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_arguments_parse() {
        let args = Args::parse_from([
            "repograph",
            "-vv",
            "resolve",
            "--repo",
            "/tmp/r",
            "--goal",
            "review",
            "--content-file",
            "pr.diff",
            "--completion-cmd",
            "cat",
        ]);
        assert_eq!(args.verbose, 2);
        match args.command {
            Command::Resolve {
                repo,
                goal,
                content_file,
                build_cmd,
                ..
            } => {
                assert_eq!(repo.repo, PathBuf::from("/tmp/r"));
                assert_eq!(goal, Goal::Review);
                assert_eq!(content_file, Some(PathBuf::from("pr.diff")));
                assert!(build_cmd.is_none());
            }
            _ => panic!("expected resolve"),
        }
    }

    #[test]
    fn edge_kinds_are_comma_separated() {
        let args = Args::parse_from([
            "repograph",
            "neighbors",
            "--node",
            "n_1",
            "--edge-kind",
            "calls,references",
        ]);
        match args.command {
            Command::Neighbors { edge_kinds, depth, .. } => {
                assert_eq!(edge_kinds, vec!["calls", "references"]);
                assert_eq!(depth, 1);
            }
            _ => panic!("expected neighbors"),
        }
    }
}
