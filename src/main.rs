use clap::{Parser, Subcommand};
use engram::client::{ops, ApiResponse, ResilientClient};
use engram::config::EngramConfig;
use engram::state::StateStore;
use engram::supervisor::Supervisor;
use serde_json::{Map, Value};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "engram",
    version,
    about = "Local memory service supervisor and client for agent hooks"
)]
struct Cli {
    /// Session identifier for log correlation. Generated when omitted.
    #[arg(long, global = true)]
    session: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ensure the background server is running
    Start {
        /// Return as soon as the process is launched instead of waiting for readiness
        #[arg(long)]
        no_wait: bool,
        /// Maximum seconds to wait for readiness
        #[arg(long, default_value_t = 10)]
        max_wait: u64,
    },
    /// Stop the background server, forcing after the timeout
    Stop {
        /// Seconds to wait for graceful termination
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Show the recorded server instance and whether it is alive
    Status,
    /// Query server health
    Health,
    /// Search stored knowledge
    Search {
        #[arg(long)]
        query: String,
        #[arg(long)]
        project: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        #[arg(long, default_value_t = 0.6)]
        min_score: f64,
    },
    /// Record a candidate question/answer pair
    RecordCandidate {
        #[arg(long)]
        project: String,
        #[arg(long)]
        question: String,
        #[arg(long)]
        answer: String,
    },
    /// Record which knowledge entries a session used
    RecordHit {
        #[arg(long)]
        project: String,
        #[arg(long = "qa-id")]
        qa_ids: Vec<String>,
        #[arg(long = "shown-id")]
        shown_ids: Vec<String>,
    },
    /// Record a validation verdict (raw JSON object)
    RecordValidation {
        #[arg(long)]
        payload: String,
    },
    /// Evaluate a finished session server-side (raw JSON object)
    EvaluateSession {
        #[arg(long)]
        payload: String,
    },
    /// Ask the server to shut itself down
    Shutdown,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match EngramConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("engram: failed to load config: {err:#}; using defaults");
            EngramConfig::default()
        }
    };

    // Log to stderr so stdout stays clean for the JSON results hooks consume.
    let filter = EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let session_id = cli
        .session
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

    if run(cli.command, &session_id, config) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run(command: Command, session_id: &str, config: EngramConfig) -> bool {
    match command {
        Command::Start { no_wait, max_wait } => {
            let supervisor = Supervisor::new(config).with_session(session_id);
            let ok = supervisor.start(!no_wait, Duration::from_secs(max_wait));
            print_json(&serde_json::json!({ "success": ok }));
            ok
        }
        Command::Stop { timeout } => {
            let supervisor = Supervisor::new(config);
            let ok = supervisor.stop(Duration::from_secs(timeout));
            print_json(&serde_json::json!({ "success": ok }));
            ok
        }
        Command::Status => {
            let supervisor = Supervisor::new(config);
            let record = supervisor.store().load();
            let running = supervisor.is_running();
            print_json(&serde_json::json!({
                "success": true,
                "running": running,
                "record": record,
            }));
            true
        }
        Command::Health => {
            let client = ResilientClient::new(session_id, config);
            print_response(&client.call(&ops::health()))
        }
        Command::Search {
            query,
            project,
            limit,
            min_score,
        } => {
            let client = ResilientClient::new(session_id, config);
            print_response(&client.call_with_fallback(&ops::search(
                &query, &project, limit, min_score,
            )))
        }
        Command::RecordCandidate {
            project,
            question,
            answer,
        } => {
            let client = ResilientClient::new(session_id, config);
            print_response(&client.call_with_fallback(&ops::record_candidate(
                &project, &question, &answer,
            )))
        }
        Command::RecordHit {
            project,
            qa_ids,
            shown_ids,
        } => {
            let client = ResilientClient::new(session_id, config);
            print_response(&client.call_with_fallback(&ops::record_hit(
                &project, &qa_ids, &shown_ids,
            )))
        }
        Command::RecordValidation { payload } => match parse_payload(&payload) {
            Ok(payload) => {
                let client = ResilientClient::new(session_id, config);
                print_response(&client.call_with_fallback(&ops::record_validation(payload)))
            }
            Err(response) => print_response(&response),
        },
        Command::EvaluateSession { payload } => match parse_payload(&payload) {
            Ok(payload) => {
                let client = ResilientClient::new(session_id, config);
                print_response(&client.call(&ops::evaluate_session(payload)))
            }
            Err(response) => print_response(&response),
        },
        Command::Shutdown => {
            let client = ResilientClient::new(session_id, config.clone());
            let response = client.call(&ops::shutdown());
            if response.success {
                // The recorded instance is gone; drop the stale record now
                // instead of leaving it for the next caller to detect.
                StateStore::new(config.state_file()).clear();
            }
            print_response(&response)
        }
    }
}

fn parse_payload(raw: &str) -> Result<Map<String, Value>, ApiResponse> {
    serde_json::from_str(raw)
        .map_err(|err| ApiResponse::failure(format!("invalid --payload JSON: {err}")))
}

fn print_response(response: &ApiResponse) -> bool {
    match serde_json::to_string(response) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => println!("{{\"success\":false,\"error\":\"failed to render response: {err}\"}}"),
    }
    response.success
}

fn print_json(value: &Value) {
    println!("{value}");
}
