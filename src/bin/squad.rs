#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use squad_harness::gateway::OpenRouterAdapter;
use squad_harness::structure::dashboard;
use squad_harness::structure::decision::{DecisionRecord, ProblemStatement};
use squad_harness::structure::decompose::decompose;
use squad_harness::structure::extract::parse_proposal;
use squad_harness::template::{render_with_report, Variables};
use squad_harness::{http, Config, SquadStore, StructureService};

#[derive(Parser)]
#[command(name = "squad", version, about = "Squad structure proposal harness")]
struct Cli {
    /// SQLite store (defaults to SQUAD_STORE_PATH or .squad_harness.sqlite)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Create a workspace and add its first members
    WorkspaceCreate {
        #[arg(long)]
        name: String,
        #[arg(long = "member")]
        members: Vec<String>,
    },
    /// Create a squad in a workspace
    SquadCreate {
        #[arg(long)]
        workspace: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Add a backlog item to a squad
    BacklogAdd {
        #[arg(long)]
        squad: i64,
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Append a phase to a squad's flow
    PhaseAdd {
        #[arg(long)]
        squad: i64,
        #[arg(long)]
        name: String,
        /// Position in the flow (defaults to after the last phase)
        #[arg(long)]
        order: Option<i64>,
    },
    /// Record the squad's problem statement
    ProblemSet {
        #[arg(long)]
        squad: i64,
        #[arg(long)]
        user: String,
        statement: String,
    },
    /// Generate a structure proposal for a squad (LLM call)
    Generate {
        #[arg(long)]
        squad: i64,
        #[arg(long)]
        user: String,
        /// Model used when the active prompt does not pin one
        #[arg(long)]
        model: Option<String>,
    },
    /// Split an existing proposal into pending suggestions
    Breakdown {
        #[arg(long)]
        proposal: i64,
        #[arg(long)]
        user: String,
    },
    /// Confirm a DRAFT proposal
    Confirm {
        #[arg(long)]
        proposal: i64,
        #[arg(long)]
        user: String,
    },
    /// Discard a DRAFT proposal
    Discard {
        #[arg(long)]
        proposal: i64,
        #[arg(long)]
        user: String,
    },
    /// Review pending suggestions
    Review {
        #[arg(long)]
        squad: i64,
        #[arg(long)]
        user: String,
        /// Show one suggestion in detail
        #[arg(long, conflicts_with_all = ["approve", "reject"])]
        show: Option<i64>,
        /// Approve a suggestion
        #[arg(long, conflicts_with = "reject")]
        approve: Option<i64>,
        /// JSON file replacing the suggestion's payload (with --approve)
        #[arg(long, requires = "approve")]
        edited: Option<PathBuf>,
        /// Reject a suggestion
        #[arg(long)]
        reject: Option<i64>,
        /// Rejection reason (with --reject)
        #[arg(long, requires = "reject")]
        reason: Option<String>,
    },
    /// Show the squad dashboard
    Dashboard {
        #[arg(long)]
        squad: i64,
    },
    /// Render a template file with JSON variables
    Render {
        #[arg(long)]
        template: PathBuf,
        #[arg(long)]
        vars: Option<PathBuf>,
    },
    /// Decompose a raw model response (or proposal JSON) into suggestions
    Decompose {
        #[arg(long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(path) = cli.store {
        config = config.with_store_path(path);
    }

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config = config.with_bind(bind);
            }
            let service = Arc::new(service(&config)?);
            http::serve(service, config.bind).await?;
        }
        Commands::WorkspaceCreate { name, members } => {
            let store = SquadStore::new(&config.store_path)?;
            let id = store.create_workspace(&name).await?;
            for member in &members {
                store.add_member(id, member).await?;
            }
            println!("Workspace #{id} created ({} members).", members.len());
        }
        Commands::SquadCreate {
            workspace,
            name,
            description,
        } => {
            let store = SquadStore::new(&config.store_path)?;
            let id = store
                .create_squad(workspace, &name, description.as_deref())
                .await?;
            println!("Squad #{id} created.");
        }
        Commands::BacklogAdd {
            squad,
            title,
            description,
        } => {
            let store = SquadStore::new(&config.store_path)?;
            let id = store
                .add_backlog_item(squad, &title, description.as_deref())
                .await?;
            println!("Backlog item #{id} added.");
        }
        Commands::PhaseAdd { squad, name, order } => {
            let store = SquadStore::new(&config.store_path)?;
            let order = match order {
                Some(order) => order,
                None => {
                    let phases = store.squad_phases(squad).await?;
                    phases.iter().map(|p| p.order_index).max().unwrap_or(0) + 1
                }
            };
            let id = store.add_phase(squad, &name, order).await?;
            println!("Phase #{id} added at position {order}.");
        }
        Commands::ProblemSet {
            squad,
            user,
            statement,
        } => {
            let store = SquadStore::new(&config.store_path)?;
            let record = DecisionRecord::ProblemStatement(ProblemStatement {
                statement,
                ..Default::default()
            });
            let id = store
                .record_decision(squad, record, Some(user.as_str()))
                .await?;
            println!("Problem statement recorded (decision #{id}).");
        }
        Commands::Generate { squad, user, model } => {
            if let Some(model) = model {
                config = config.with_model(model);
            }
            let service = service(&config)?;
            let generated = service.generate_proposal(squad, &user).await?;
            println!(
                "{}",
                dashboard::render_proposal(&generated.proposal, &generated.suggestions)
            );
        }
        Commands::Breakdown { proposal, user } => {
            let service = service(&config)?;
            let created = service.breakdown(proposal, &user).await?;
            println!("Proposal #{proposal}: {created} suggestions created.");
        }
        Commands::Confirm { proposal, user } => {
            let service = service(&config)?;
            service.confirm_proposal(proposal, &user).await?;
            println!("Proposal #{proposal} confirmed.");
        }
        Commands::Discard { proposal, user } => {
            let service = service(&config)?;
            service.discard_proposal(proposal, &user).await?;
            println!("Proposal #{proposal} discarded.");
        }
        Commands::Review {
            squad,
            user,
            show,
            approve,
            edited,
            reject,
            reason,
        } => {
            let service = service(&config)?;
            if let Some(id) = approve {
                let edited_payload = match edited {
                    Some(path) => Some(serde_json::from_str::<Value>(&std::fs::read_to_string(
                        path,
                    )?)?),
                    None => None,
                };
                let decided = service.approve(id, &user, edited_payload).await?;
                println!(
                    "Suggestion #{id} {}.",
                    decided.suggestion.status.as_str().replace('_', " ")
                );
                if let Some(outcome) = decided.outcome {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
            } else if let Some(id) = reject {
                service.reject(id, &user, reason).await?;
                println!("Suggestion #{id} rejected.");
            } else if let Some(id) = show {
                let pending = service.list_pending(squad, &user).await?;
                let suggestion = match pending.iter().find(|s| s.id == id) {
                    Some(s) => s.clone(),
                    None => service.store().get_suggestion(id).await?,
                };
                println!("{}", dashboard::render_suggestion(&suggestion));
            } else {
                let pending = service.list_pending(squad, &user).await?;
                println!("{}", dashboard::render_suggestion_list(&pending));
            }
        }
        Commands::Dashboard { squad } => {
            let store = SquadStore::new(&config.store_path)?;
            println!("{}", dashboard::render_dashboard(&store, squad).await?);
        }
        Commands::Render { template, vars } => {
            let template = std::fs::read_to_string(template)?;
            let vars: Variables = match vars {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => Variables::new(),
            };
            let report = render_with_report(&template, &vars);
            if !report.missing.is_empty() {
                eprintln!("missing variables: {}", report.missing.join(", "));
            }
            if !report.unresolved.is_empty() {
                eprintln!("unresolved tokens: {}", report.unresolved.join(", "));
            }
            print!("{}", report.text);
        }
        Commands::Decompose { input } => {
            let raw = std::fs::read_to_string(input)?;
            let proposal = Value::Object(parse_proposal(&raw)?);
            println!("{}", serde_json::to_string_pretty(&decompose(&proposal))?);
        }
    }

    Ok(())
}

fn service(config: &Config) -> Result<StructureService, Box<dyn std::error::Error>> {
    let store = SquadStore::new(&config.store_path)?;
    let gateway = Arc::new(OpenRouterAdapter::from_env()?);
    Ok(StructureService::new(store, gateway, config))
}
