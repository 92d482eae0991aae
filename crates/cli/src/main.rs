//! `ldapcnx` command line client.
//!
//! This binary is the composition root for the workspace. Responsibilities:
//!
//! 1. **Load configuration**: read a JSON profile (connection options, bind
//!    credentials, default search options) and apply command line overrides.
//! 2. **Wire observability**: install `tracing-subscriber` with an `EnvFilter`
//!    and a human or JSON formatter on stderr. Structured events from every
//!    crate in the workspace flow through it.
//! 3. **Construct infrastructure**: open a [`directory::Connection`] over the
//!    `ldap3`-backed [`ldap_engine::Ldap3Connector`].
//! 4. **Run one command**: bind, search (following paged/VLV continuation),
//!    find-and-bind, add, modify, delete or rename. Results are printed to
//!    stdout as JSON.

mod profile;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use directory::{
    parse_attribute_list, Attribute, Connection, ModOp, Modification, Scope, SearchControlType,
    SearchOptions,
};
use ldap_engine::Ldap3Connector;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use profile::Profile;

#[derive(Parser)]
#[command(name = "ldapcnx", version)]
#[command(about = "Directory client with request correlation, reconnection and paged search")]
struct Cli {
    /// JSON profile with connection, credential and search options
    #[arg(short, long, env = "LDAPCNX_PROFILE")]
    profile: Option<PathBuf>,

    /// Directory URI (overrides the profile)
    #[arg(short = 'H', long, env = "LDAPCNX_URI")]
    uri: Option<String>,

    /// DN to bind as before running the command (overrides the profile)
    #[arg(short = 'D', long)]
    binddn: Option<String>,

    /// Password for --binddn
    #[arg(short = 'w', long, env = "LDAPCNX_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Per-request timeout in milliseconds (overrides the profile)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Print connection counters to stderr when done
    #[arg(long)]
    stats: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bind with the configured credentials and report the outcome
    Bind,
    /// Search the directory, following paged or VLV continuation
    Search(SearchArgs),
    /// Locate one entry by filter and authenticate as it
    Findandbind {
        #[command(flatten)]
        search: SearchArgs,
        /// Password of the located entry
        #[arg(short = 'W', long, env = "LDAPCNX_USER_PASSWORD", hide_env_values = true)]
        user_password: String,
    },
    /// Add an entry; attributes are given as name=value, repeatable
    Add {
        dn: String,
        #[arg(short, long = "attr", value_parser = parse_assignment)]
        attrs: Vec<(String, String)>,
    },
    /// Modify an entry; changes are op:name[=value] with op add, delete or replace
    Modify {
        dn: String,
        #[arg(short, long = "change", value_parser = parse_change)]
        changes: Vec<Modification>,
    },
    /// Delete an entry
    Delete { dn: String },
    /// Rename an entry within its parent
    Rename { dn: String, new_rdn: String },
}

#[derive(Args, Clone, Default)]
struct SearchArgs {
    /// Search base
    #[arg(short, long)]
    base: Option<String>,
    /// Search filter
    #[arg(short, long)]
    filter: Option<String>,
    /// Attributes to return, space or comma separated
    #[arg(short, long)]
    attrs: Option<String>,
    /// base, one, sub, subordinate or default
    #[arg(short, long)]
    scope: Option<Scope>,
    /// Page size for paged or VLV searches
    #[arg(long)]
    pagesize: Option<u32>,
    /// Server-side sort specification (selects VLV with --pagesize)
    #[arg(long)]
    sort: Option<String>,
    /// vlv or pagedresults
    #[arg(long)]
    control_type: Option<SearchControlType>,
    /// Starting VLV offset
    #[arg(long)]
    offset: Option<u32>,
    /// Stop after the first page
    #[arg(long)]
    no_follow: bool,
}

impl SearchArgs {
    /// Layers these flags over the profile's search options.
    fn apply(&self, mut options: SearchOptions) -> SearchOptions {
        if let Some(base) = &self.base {
            options.base = Some(base.clone());
        }
        if let Some(filter) = &self.filter {
            options.filter = Some(filter.clone());
        }
        if let Some(attrs) = &self.attrs {
            options.attrs = Some(parse_attribute_list(attrs));
        }
        options.scope = self.scope.or(options.scope);
        options.page_size = self.pagesize.or(options.page_size);
        if let Some(sort) = &self.sort {
            options.sort = Some(sort.clone());
        }
        options.control_type = self.control_type.or(options.control_type);
        options.offset = self.offset.or(options.offset);
        if options.control_type == Some(SearchControlType::Vlv) && options.offset.is_none() {
            options.offset = Some(0);
        }
        options
    }
}

fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_owned(), value.to_owned())),
        _ => Err(format!("expected name=value, got '{raw}'")),
    }
}

fn parse_change(raw: &str) -> Result<Modification, String> {
    let (op, rest) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected op:name[=value], got '{raw}'"))?;
    let op = match op.to_ascii_lowercase().as_str() {
        "add" => ModOp::Add,
        "delete" => ModOp::Delete,
        "replace" => ModOp::Replace,
        other => return Err(format!("unknown modification '{other}'")),
    };
    let (attr, vals) = match rest.split_once('=') {
        Some((attr, value)) => (attr, vec![value.to_owned()]),
        None => (rest, Vec::new()),
    };
    if attr.is_empty() {
        return Err(format!("missing attribute name in '{raw}'"));
    }
    Ok(Modification::new(op, attr, vals))
}

/// Groups repeated `name=value` pairs into attributes, keeping first-seen order.
fn group_attributes(pairs: Vec<(String, String)>) -> Vec<Attribute> {
    let mut attrs: Vec<Attribute> = Vec::new();
    for (name, value) in pairs {
        match attrs.iter_mut().find(|a| a.attr == name) {
            Some(attr) => attr.vals.push(value),
            None => attrs.push(Attribute::new(name, [value])),
        }
    }
    attrs
}

fn init_tracing(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}

fn load_profile(cli: &Cli) -> anyhow::Result<Profile> {
    let mut profile = match (&cli.profile, &cli.uri) {
        (Some(path), _) => Profile::load(path)?,
        (None, Some(uri)) => Profile::for_uri(uri),
        (None, None) => bail!("either --profile or --uri is required"),
    };
    if let Some(uri) = &cli.uri {
        profile.connection.uri = uri.clone();
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        profile.connection.timeout_ms = timeout_ms;
    }
    if let Some(binddn) = &cli.binddn {
        profile.credentials = Some(directory::BindCredentials::new(
            binddn.clone(),
            cli.password.clone().unwrap_or_default(),
        ));
    }
    Ok(profile)
}

async fn run_search(
    conn: &Connection,
    mut options: SearchOptions,
    follow: bool,
) -> anyhow::Result<()> {
    let mut pages = 0usize;
    let mut total = 0usize;
    let mut reported = None;
    loop {
        let page = conn.search(&options).await.context("search failed")?;
        pages += 1;
        total += page.entries.len();
        if let Some(count) = page.page_result.as_ref().and_then(|r| r.count) {
            reported = Some(count);
        }
        println!("{}", serde_json::to_string_pretty(&page)?);
        debug!(page = pages, entries = page.entries.len(), "search page received");

        match page.next_options(&options) {
            Some(next) if follow => options = next,
            _ => break,
        }
    }
    info!(pages, total, server_count = ?reported, "search finished");
    Ok(())
}

async fn run(cli: Cli, profile: Profile) -> anyhow::Result<()> {
    let conn = Connection::open(profile.connection, Arc::new(Ldap3Connector))
        .await
        .context("cannot connect")?;

    if let Some(credentials) = &profile.credentials {
        conn.bind(&credentials.binddn, &credentials.password)
            .await
            .with_context(|| format!("bind as {} failed", credentials.binddn))?;
        info!(binddn = %credentials.binddn, "bound");
    }

    let outcome = match cli.command {
        Command::Bind => {
            if profile.credentials.is_none() {
                conn.bind("", "").await.context("anonymous bind failed")?;
            }
            println!("{}", serde_json::json!({ "bound": true }));
            Ok(())
        }
        Command::Search(args) => {
            let options = args.apply(profile.search);
            run_search(&conn, options, !args.no_follow).await
        }
        Command::Findandbind {
            search,
            user_password,
        } => {
            let options = search.apply(profile.search);
            let entry = conn
                .findandbind(&options, &user_password)
                .await
                .context("find-and-bind failed")?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
        Command::Add { dn, attrs } => conn
            .add(&dn, &group_attributes(attrs))
            .await
            .with_context(|| format!("add {dn} failed")),
        Command::Modify { dn, changes } => conn
            .modify(&dn, &changes)
            .await
            .with_context(|| format!("modify {dn} failed")),
        Command::Delete { dn } => conn
            .delete(&dn)
            .await
            .with_context(|| format!("delete {dn} failed")),
        Command::Rename { dn, new_rdn } => conn
            .rename(&dn, &new_rdn)
            .await
            .with_context(|| format!("rename {dn} failed")),
    };

    if cli.stats {
        eprintln!("{}", serde_json::to_string_pretty(&conn.stats())?);
    }
    conn.close().await;
    outcome
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json)?;

    let profile = load_profile(&cli)?;
    info!(uri = %profile.connection.uri, "starting ldapcnx");
    run(cli, profile).await
}
