//! Sema editor: line-driven client for one report.
//!
//! ```text
//! sema-editor <document-id> <catalog.json> [--admin] [--server-url <url>]
//! ```
//!
//! Reads commands from stdin and drives a session controller connected to
//! `--server-url` (or `SEMA_SERVER_URL`, default `ws://127.0.0.1:8080`):
//!
//! ```text
//! open <section>               switch section ("settings" opens settings)
//! type <field> <pos> <text>    insert text at a character position
//! delete <field> <pos> <len>   delete a range
//! bold <field> <pos> <len>     format a range bold
//! reconnect                    reopen the current section
//! quit                         publish, leave and exit
//! ```

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{info, warn};
use sema_collab::delta::{Attributes, Delta};
use sema_collab::{
    EditorSurface, SectionDescriptor, SessionConfig, SessionController, SessionHandle,
    SessionNotice, StaticAccessControl, StaticCatalog, WebSocketConnector,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "sema-editor", version, about = "Edit a collaborative report section by section")]
struct Args {
    /// Report to edit
    document_id: String,

    /// Section catalog for the report (JSON)
    #[arg(value_name = "PATH")]
    catalog: PathBuf,

    /// Grant admin rights on the report
    #[arg(long)]
    admin: bool,

    #[arg(
        long,
        env = "SEMA_SERVER_URL",
        default_value = "ws://127.0.0.1:8080",
        help = "Relay to connect to"
    )]
    server_url: String,
}

/// Prints what peers do to the open section.
struct ConsoleSurface;

impl EditorSurface for ConsoleSurface {
    fn section_mounted(&mut self, descriptor: &SectionDescriptor) {
        println!(
            "[{}] fields: {}",
            descriptor.title,
            descriptor.subsection_titles.join(", ")
        );
    }

    fn apply_remote_change(&mut self, field_id: &str, ops: &Delta) {
        println!("<- {field_id}: {} op(s)", ops.ops().len());
    }

    fn replace_content(&mut self, field_id: &str, content: &Delta) {
        println!("<= {field_id}: {:?}", content.plain_text());
    }
}

#[derive(Debug, PartialEq)]
enum EditorCommand {
    Open(String),
    Edit { field_id: String, ops: Delta },
    Reconnect,
    Quit,
}

fn parse_command(line: &str) -> Result<EditorCommand, String> {
    let line = line.trim();
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    match verb {
        "open" if !rest.trim().is_empty() => Ok(EditorCommand::Open(rest.trim().to_string())),
        "type" => {
            let mut parts = rest.splitn(3, ' ');
            let field_id = parts.next().filter(|f| !f.is_empty()).ok_or("missing field")?;
            let pos = parse_len(parts.next())?;
            let text = parts.next().ok_or("missing text")?;
            Ok(EditorCommand::Edit {
                field_id: field_id.to_string(),
                ops: Delta::new().retain(pos).insert(text),
            })
        }
        "delete" | "bold" => {
            let mut parts = rest.split_whitespace();
            let field_id = parts.next().ok_or("missing field")?;
            let pos = parse_len(parts.next())?;
            let len = parse_len(parts.next())?;
            let ops = if verb == "delete" {
                Delta::new().retain(pos).delete(len)
            } else {
                let mut bold = Attributes::new();
                bold.insert("bold".into(), Value::Bool(true));
                Delta::new().retain(pos).retain_with(len, Some(bold))
            };
            Ok(EditorCommand::Edit {
                field_id: field_id.to_string(),
                ops,
            })
        }
        "reconnect" => Ok(EditorCommand::Reconnect),
        "quit" | "exit" => Ok(EditorCommand::Quit),
        _ => Err(format!("unknown command: {line}")),
    }
}

fn parse_len(part: Option<&str>) -> Result<usize, String> {
    let part = part.ok_or("missing number")?;
    part.parse().map_err(|_| format!("not a number: {part}"))
}

fn describe(notice: &SessionNotice) -> String {
    match notice {
        SessionNotice::SectionOpened { section, fields } => {
            format!("opened {section} ({} fields)", fields.len())
        }
        SessionNotice::SectionNotFound { section } => format!("no section named {section}"),
        SessionNotice::SettingsOpened { is_admin } => format!("settings (admin: {is_admin})"),
        SessionNotice::TransportFailed { section, reason } => {
            format!("connection to {section} failed: {reason}; use `reconnect`")
        }
        SessionNotice::ProtocolError { error } => format!("bad frame: {error}"),
        SessionNotice::PublishTimeout { section } => {
            format!("publishing {section} timed out; edits may be lost")
        }
        SessionNotice::ResyncForced { section, reason } => {
            format!("resyncing {section}: {reason}")
        }
        SessionNotice::TornDown => "session closed".to_string(),
    }
}

async fn drive(handle: &SessionHandle) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(EditorCommand::Open(section)) => handle.switch_to(section).await?,
            Ok(EditorCommand::Edit { field_id, ops }) => handle.local_change(field_id, ops).await?,
            Ok(EditorCommand::Reconnect) => handle.reconnect().await?,
            Ok(EditorCommand::Quit) => break,
            Err(e) => eprintln!("{e}"),
        }
    }
    handle.teardown().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let Args {
        document_id,
        catalog: catalog_path,
        admin,
        server_url,
    } = Args::parse();

    let catalog = match fs::read_to_string(&catalog_path)
        .map_err(|e| e.to_string())
        .and_then(|json| StaticCatalog::from_json(&document_id, &json).map_err(|e| e.to_string()))
    {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("cannot load catalog {}: {e}", catalog_path.display());
            process::exit(2);
        }
    };

    let mut access = StaticAccessControl::new();
    if admin {
        access = access.with_admin(&document_id);
    }

    let config = SessionConfig {
        server_url,
        ..SessionConfig::default()
    };
    info!("Editing {document_id} via {}", config.server_url);

    let connector = WebSocketConnector::new(&config.server_url);
    let (controller, mut notices) =
        SessionController::new(config, document_id, connector, catalog, access);
    let (handle, task) = controller.with_surface(ConsoleSurface).start();

    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            println!("* {}", describe(&notice));
        }
    });

    if let Err(e) = drive(&handle).await {
        warn!("Editor stopped: {e}");
    }
    if let Err(e) = task.await {
        warn!("Session task failed: {e}");
    }
}
