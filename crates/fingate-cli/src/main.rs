use std::io::{self, BufWriter};
use std::process;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use fingate_store::Gateway;
use fingate_types::JsonMap;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod config;
mod dispatch;
mod tools;

const CONFIG_ERROR: i32 = 3;
const IO_ERROR: i32 = 4;

#[derive(Parser)]
#[command(name = "fingate")]
#[command(about = "Read-only SQL gateway for the household finance database", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print JSON responses indented
    #[arg(long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available tools and their input schemas
    Tools,
    /// Run a single tool
    Call {
        /// Tool name, e.g. get_spending_summary
        tool: String,
        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,
    },
    /// Answer {"tool": ..., "arguments": {...}} requests, one per stdin line
    Serve,
}

fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    process::exit(run(&cli));
}

fn run(cli: &Cli) -> i32 {
    let db_config = match config::from_env() {
        Ok(db_config) => db_config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return CONFIG_ERROR;
        }
    };
    let gateway = match Gateway::new(db_config) {
        Ok(gateway) => gateway,
        Err(err) => {
            error!(error = %err, "gateway could not be built");
            return CONFIG_ERROR;
        }
    };

    match &cli.command {
        Commands::Tools => {
            print(&dispatch::to_value(&tools::describe(gateway.catalog())), cli.pretty);
            0
        }
        Commands::Call { tool, arguments } => {
            let response = match dispatch::parse_json::<JsonMap>(arguments) {
                Ok(arguments) => dispatch::call(&gateway, tool, &arguments),
                Err(err) => dispatch::to_value(&err),
            };
            print(&response, cli.pretty);
            0
        }
        Commands::Serve => {
            let stdin = io::stdin();
            let stdout = io::stdout();
            match dispatch::serve(&gateway, stdin.lock(), BufWriter::new(stdout.lock())) {
                Ok(_) => 0,
                Err(err) => {
                    error!(error = %err, "serve loop stopped");
                    IO_ERROR
                }
            }
        }
    }
}

fn print(value: &serde_json::Value, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(text) => println!("{}", text),
        Err(err) => error!(error = %err, "response could not be rendered"),
    }
}
