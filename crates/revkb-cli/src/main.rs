//! revkb CLI
//!
//! Command-line front end over a WAL-backed store directory:
//! - Creating a store (`init`) from a JSON schema
//! - Writing objects (`put`, `delete`), one revision per invocation
//! - Reading current and historical state (`get --at`, `history`, `log`)
//! - Branching (`branch create`, `branches`)

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use revkb_store::{
    Attributes, BranchId, Identity, KnowledgeBase, ObjectId, Revision, Session, TypeName,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod assign;
mod store_dir;

use store_dir::StoreDir;

#[derive(Parser)]
#[command(name = "revkb")]
#[command(author, version, about = "revkb: revisioned, branchable object store")]
struct Cli {
    /// Store directory
    #[arg(short, long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Branch to operate on (default: trunk)
    #[arg(short, long, global = true)]
    branch: Option<u64>,

    /// Log more (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a store directory with a schema and default config.
    Init {
        /// Schema JSON (`{"types": [...]}`); a small demo schema otherwise
        #[arg(long)]
        schema: Option<PathBuf>,
    },

    /// Create an object, or update attributes of an existing one.
    ///
    /// Values: `null`, `true`, `42`, `1.5`, `@7` (reference), `"quoted text"`,
    /// anything else is text.
    Put {
        /// Type name, e.g. `Doc`
        type_name: String,
        /// Object id; allocated when omitted
        #[arg(long)]
        id: Option<u64>,
        /// `name=value` pairs
        assignments: Vec<String>,
        #[arg(short, long)]
        message: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },

    /// Show an object's attributes.
    Get {
        type_name: String,
        id: u64,
        /// Read as of this revision instead of the latest
        #[arg(long)]
        at: Option<u64>,
        /// Print attributes as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete an object.
    Delete {
        type_name: String,
        id: u64,
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Every stored version of an object.
    History { type_name: String, id: u64 },

    /// Committed revisions, newest first.
    Log {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Branch management.
    Branch {
        #[command(subcommand)]
        command: BranchCommands,
    },

    /// List branches.
    Branches,
}

#[derive(Subcommand)]
enum BranchCommands {
    /// Fork a branch; only the listed types get their own copy.
    Create {
        /// Type to branch (repeatable)
        #[arg(long = "type", required = true)]
        types: Vec<String>,
        /// Base branch (default: the `--branch` option, else trunk)
        #[arg(long)]
        from: Option<u64>,
        /// Base revision (default: latest)
        #[arg(long)]
        at: Option<u64>,
        #[arg(short, long, default_value = "create branch")]
        message: String,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let store = StoreDir::new(&cli.dir);
    let branch = cli.branch.map_or(BranchId::TRUNK, BranchId);

    match cli.command {
        Commands::Init { schema } => cmd_init(&store, schema.as_ref()),
        Commands::Put {
            type_name,
            id,
            assignments,
            message,
            author,
        } => cmd_put(
            &store,
            branch,
            &type_name,
            id,
            &assignments,
            message,
            author,
        ),
        Commands::Get {
            type_name,
            id,
            at,
            json,
        } => cmd_get(&store, branch, &type_name, id, at, json),
        Commands::Delete {
            type_name,
            id,
            message,
        } => cmd_delete(&store, branch, &type_name, id, message),
        Commands::History { type_name, id } => cmd_history(&store, branch, &type_name, id),
        Commands::Log { limit } => cmd_log(&store, limit),
        Commands::Branch { command } => match command {
            BranchCommands::Create {
                types,
                from,
                at,
                message,
            } => cmd_branch_create(
                &store,
                from.map_or(branch, BranchId),
                &types,
                at,
                &message,
            ),
        },
        Commands::Branches => cmd_branches(&store),
    }
}

fn open_session(store: &StoreDir, branch: BranchId) -> Result<(Arc<KnowledgeBase>, Session)> {
    let kb = store.open()?;
    let session = kb.session_on(branch)?;
    Ok((kb, session))
}

fn format_attributes(attributes: &Attributes) -> String {
    attributes
        .iter()
        .map(|(name, value)| format!("{}={}", name.cyan(), value))
        .collect::<Vec<_>>()
        .join(" ")
}

fn report_commit(outcome: Option<Revision>) {
    match outcome {
        Some(revision) => println!("{} {}", "committed".green().bold(), revision),
        None => println!("{}", "nothing to commit".yellow()),
    }
}

fn cmd_init(store: &StoreDir, schema: Option<&PathBuf>) -> Result<()> {
    let def = store.init(schema.map(PathBuf::as_path))?;
    let kb = store.open()?;
    println!(
        "{} {}",
        "Initialized".green().bold(),
        store.root().display().to_string().bold()
    );
    for descriptor in &def.types {
        println!(
            "  Type {}: {} attributes{}",
            descriptor.name.as_str().yellow(),
            descriptor.attributes.len(),
            if descriptor.flexible { " (flexible)" } else { "" }
        );
    }
    println!("  Revision: {}", kb.last_local_revision());
    Ok(())
}

fn cmd_put(
    store: &StoreDir,
    branch: BranchId,
    type_name: &str,
    id: Option<u64>,
    assignments: &[String],
    message: Option<String>,
    author: Option<String>,
) -> Result<()> {
    let attributes = assign::parse_assignments(assignments)?;
    let (_kb, mut session) = open_session(store, branch)?;
    let type_name = TypeName::new(type_name);

    if let Some(message) = message {
        session.set_commit_message(message)?;
    }
    if let Some(author) = author {
        session.set_author(author)?;
    }

    let existing = match id {
        Some(id) => session.lookup(&type_name, ObjectId(id))?,
        None => None,
    };
    let item = match existing {
        Some(item) => {
            for (name, value) in attributes {
                session.set(&item, &name, value)?;
            }
            println!("{} {}", "Updating".green().bold(), item.identity());
            item
        }
        None => {
            let item = session.create(&type_name, id.map(ObjectId), attributes)?;
            println!("{} {}", "Creating".green().bold(), item.identity());
            item
        }
    };
    report_commit(session.commit()?);
    println!("  {}", format_attributes(&*session.attributes(&item)?));
    Ok(())
}

fn cmd_get(
    store: &StoreDir,
    branch: BranchId,
    type_name: &str,
    id: u64,
    at: Option<u64>,
    json: bool,
) -> Result<()> {
    let (_kb, mut session) = open_session(store, branch)?;
    let type_name = TypeName::new(type_name);
    let revision = at.map_or(Revision::CURRENT, Revision);
    let item = session
        .lookup_at(&type_name, ObjectId(id), revision)?
        .ok_or_else(|| anyhow!("{type_name} {} is not alive at {revision}", ObjectId(id)))?;
    let attributes = session.attributes(&item)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&*attributes)?);
        return Ok(());
    }
    println!(
        "{} {}",
        item.identity().to_string().bold(),
        format!("({})", if at.is_some() { revision } else { session.revision() }).dimmed()
    );
    for (name, value) in attributes.iter() {
        println!("  {} = {}", name.cyan(), value);
    }
    Ok(())
}

fn cmd_delete(
    store: &StoreDir,
    branch: BranchId,
    type_name: &str,
    id: u64,
    message: Option<String>,
) -> Result<()> {
    let (_kb, mut session) = open_session(store, branch)?;
    let type_name = TypeName::new(type_name);
    let item = session
        .lookup(&type_name, ObjectId(id))?
        .ok_or_else(|| anyhow!("{type_name} {} does not exist", ObjectId(id)))?;
    if let Some(message) = message {
        session.set_commit_message(message)?;
    }
    session.delete(&item)?;
    println!("{} {}", "Deleting".red().bold(), item.identity());
    report_commit(session.commit()?);
    Ok(())
}

fn cmd_history(store: &StoreDir, branch: BranchId, type_name: &str, id: u64) -> Result<()> {
    let kb = store.open()?;
    let type_name = TypeName::new(type_name);
    kb.schema().descriptor(&type_name)?;
    let data_branch = kb.branch(branch)?.data_branch(&type_name);
    let identity = Identity::new(data_branch, type_name, ObjectId(id));
    let rows = kb.history(&identity)?;
    if rows.is_empty() {
        println!("{} {}", "No versions of".yellow(), identity);
        return Ok(());
    }
    println!("{}", identity.to_string().bold());
    for row in rows {
        let range = format!("[{}, {}]", row.rev_min, row.rev_max);
        println!("  {:<16} {}", range.dimmed(), format_attributes(&row.attributes));
    }
    Ok(())
}

fn cmd_log(store: &StoreDir, limit: Option<usize>) -> Result<()> {
    let kb = store.open()?;
    let branches = kb.branches();
    let records = kb.revisions()?;
    let limit = limit.unwrap_or(records.len());
    for record in records.iter().rev().take(limit) {
        let created: Vec<String> = branches
            .iter()
            .filter(|b| b.base_branch().is_some() && b.created_at() == record.revision)
            .map(|b| b.id().to_string())
            .collect();
        let suffix = if created.is_empty() {
            String::new()
        } else {
            format!(" (created {})", created.join(", "))
        };
        println!(
            "{} {} {} {}{}",
            record.revision.to_string().yellow().bold(),
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.author.cyan(),
            record.message,
            suffix.green()
        );
    }
    Ok(())
}

fn cmd_branch_create(
    store: &StoreDir,
    base: BranchId,
    types: &[String],
    at: Option<u64>,
    message: &str,
) -> Result<()> {
    let kb = store.open()?;
    let branched: Vec<TypeName> = types.iter().map(TypeName::new).collect();
    let branch = kb.create_branch(base, at.map(Revision), &branched, message)?;
    println!(
        "{} {} from {} at {}",
        "Created branch".green().bold(),
        branch.id().to_string().bold(),
        base,
        branch.base_revision()
    );
    Ok(())
}

fn cmd_branches(store: &StoreDir) -> Result<()> {
    let kb = store.open()?;
    let mut branches = kb.branches();
    branches.sort_by_key(|b| b.id());
    for branch in branches {
        let branched: Vec<&str> = branch.branched_types().map(TypeName::as_str).collect();
        match branch.base_branch() {
            None => println!("{} {}", branch.id().to_string().bold(), "(trunk)".dimmed()),
            Some(base) => println!(
                "{} from {} at {} created {} types [{}]",
                branch.id().to_string().bold(),
                base,
                branch.base_revision(),
                branch.created_at(),
                branched.join(", ").yellow()
            ),
        }
    }
    Ok(())
}
