mod cmd;
mod output;
mod settings;

use clap::{Parser, Subcommand};
use cmd::{automation::AutomationSubcommand, job::JobSubcommand};
use settings::Overrides;

#[derive(Parser)]
#[command(
    name = "catalyst",
    about = "Run incident-response automations in throwaway containers",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the automation service until interrupted
    Serve,

    /// Run one automation now and print its result
    Run {
        /// Automation ID
        automation: String,
        /// JSON payload handed to the script
        #[arg(long, default_value = "null")]
        payload: String,
        /// Complete a playbook task with the result: TICKET/PLAYBOOK/TASK
        #[arg(long, conflicts_with = "artifact")]
        task: Option<String>,
        /// Enrich an artifact with the result: TICKET/ARTIFACT
        #[arg(long)]
        artifact: Option<String>,
        /// Job ID (default: random UUID)
        #[arg(long)]
        id: Option<String>,
    },

    /// Manage automations
    Automation {
        #[command(subcommand)]
        subcommand: AutomationSubcommand,
    },

    /// Inspect jobs
    Job {
        #[command(subcommand)]
        subcommand: JobSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = settings::resolve(&cli.overrides).and_then(|config| match cli.command {
        Commands::Serve => cmd::serve::run(&config),
        Commands::Run {
            automation,
            payload,
            task,
            artifact,
            id,
        } => cmd::run::run(
            &config,
            cmd::run::RunArgs {
                automation,
                payload,
                task,
                artifact,
                id,
            },
            cli.json,
        ),
        Commands::Automation { subcommand } => cmd::automation::run(&config, subcommand, cli.json),
        Commands::Job { subcommand } => cmd::job::run(&config, subcommand, cli.json),
    });

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
