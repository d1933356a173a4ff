//! Lineboard server — hosts boards and serves live updates over WebSocket.
//!
//! Boards are either bulk-loaded from a JSON array (`--bootstrap`) or start
//! as a single empty board. Board ids are logged at startup; clients connect
//! to `ws://{bind}/socket/{board_id}`.
//!
//! Connected peers can only edit line values. This binary has no endpoint for
//! creating boards or lines: the board layout is fixed at startup by the
//! bootstrap file. Embed `lineboard-collab` and use its `BoardRegistry` to
//! create boards and create or delete lines at runtime.

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use log::info;
use serde_json::Value;

use lineboard_collab::{BoardConfig, BoardId, BoardRegistry, BoardServer, DeletePolicy, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "lineboard-server")]
#[command(about = "Real-time collaborative line boards over WebSocket", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: String,

    /// Per-connection outbound queue size; updates beyond it are dropped
    #[arg(long, default_value_t = lineboard_collab::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Which deletions are refused
    #[arg(long, value_enum, default_value_t = PolicyArg::ProtectRoot)]
    delete_policy: PolicyArg,

    /// JSON file holding an array of line values to load as a board
    #[arg(long)]
    bootstrap: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    /// The root line can never be deleted
    ProtectRoot,
    /// Any line can be deleted while another remains
    KeepLastLine,
}

impl From<PolicyArg> for DeletePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::ProtectRoot => DeletePolicy::ProtectRoot,
            PolicyArg::KeepLastLine => DeletePolicy::KeepLastLine,
        }
    }
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            board: BoardConfig {
                queue_capacity: self.queue_capacity,
                delete_policy: self.delete_policy.into(),
            },
        }
    }
}

/// Read a bootstrap file: a JSON array, one element per line.
fn read_bootstrap(path: &Path) -> Result<Vec<Value>, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read bootstrap file {}: {e}", path.display()))?;
    let values: Vec<Value> = serde_json::from_str(&text)
        .map_err(|e| format!("bootstrap file {} is not a JSON array: {e}", path.display()))?;
    Ok(values)
}

/// Create the startup board, from the bootstrap file when one is given.
fn initial_board(registry: &BoardRegistry, bootstrap: Option<&Path>) -> Result<BoardId, Box<dyn Error>> {
    match bootstrap {
        Some(path) => {
            let values = read_bootstrap(path)?;
            Ok(registry.load_board(values)?)
        }
        None => Ok(registry.create_board()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    info!("Starting lineboard server...");

    let server = BoardServer::new(cli.server_config());
    let board = initial_board(server.registry(), cli.bootstrap.as_deref())?;
    info!("Board {board} ready at ws://{}/socket/{board}", server.bind_addr());

    server.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn bootstrap_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["lineboard-server"]);
        let config = cli.server_config();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.board.queue_capacity, 3);
        assert_eq!(config.board.delete_policy, DeletePolicy::ProtectRoot);
        assert!(cli.bootstrap.is_none());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "lineboard-server",
            "--bind",
            "0.0.0.0:9000",
            "--queue-capacity",
            "32",
            "--delete-policy",
            "keep-last-line",
            "--bootstrap",
            "board.json",
        ]);
        let config = cli.server_config();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.board.queue_capacity, 32);
        assert_eq!(config.board.delete_policy, DeletePolicy::KeepLastLine);
        assert_eq!(cli.bootstrap, Some(PathBuf::from("board.json")));
    }

    #[test]
    fn test_cli_rejects_unknown_policy() {
        assert!(Cli::try_parse_from(["lineboard-server", "--delete-policy", "never"]).is_err());
    }

    #[test]
    fn test_bootstrap_loads_values_in_order() {
        let file = bootstrap_file(r#"["title", {"text": "body", "done": true}, 42, null]"#);
        let registry = BoardRegistry::default();

        let board = initial_board(&registry, Some(file.path())).unwrap();
        let values: Vec<Value> = registry
            .resolve(&board)
            .unwrap()
            .lines()
            .into_iter()
            .map(|line| line.value)
            .collect();
        assert_eq!(
            values,
            vec![json!("title"), json!({"text": "body", "done": true}), json!(42), Value::Null]
        );
    }

    #[test]
    fn test_bootstrap_empty_array() {
        let file = bootstrap_file("[]");
        let registry = BoardRegistry::default();
        let board = initial_board(&registry, Some(file.path())).unwrap();
        assert_eq!(registry.resolve(&board).unwrap().line_count(), 1);
    }

    #[test]
    fn test_bootstrap_rejects_non_array() {
        let file = bootstrap_file(r#"{"lines": []}"#);
        assert!(read_bootstrap(file.path()).is_err());

        let file = bootstrap_file("not json");
        assert!(read_bootstrap(file.path()).is_err());
    }

    #[test]
    fn test_bootstrap_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BoardRegistry::default();
        let missing = dir.path().join("missing.json");
        assert!(initial_board(&registry, Some(&missing)).is_err());
        assert_eq!(registry.board_count(), 0);
    }

    #[test]
    fn test_no_bootstrap_creates_empty_board() {
        let registry = BoardRegistry::default();
        let board = initial_board(&registry, None).unwrap();
        assert!(registry.exists(&board));
        assert_eq!(registry.board_count(), 1);
    }
}
