//! subbot: operator CLI for the sub-bot session orchestrator
//!
//! Talks to the server's HTTP API. Every subcommand prints a short human
//! summary, or the raw JSON body with `--json`.
//!
//! # Subcommands
//! - `create <owner> [--pairing] [--phone <digits>] [--name <name>]`
//! - `list [--owner <owner>]`, `show <code>`
//! - `deactivate <code>`, `revoke <code>`, `reauth <code> [--pairing]`, `relaunch <code>`
//! - `events [--code <code>] [--kind <kind>] [-n <limit>] [--offset <n>]`
//! - `global [on|off]`, `group <id> [on|off]`
//! - `status`

use clap::{Parser, Subcommand, ValueEnum};
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8787";
const DEFAULT_EVENT_LIMIT: u32 = 20;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "subbot", version, about = "Operate sub-bot sessions")]
struct Cli {
    /// Subbot HTTP server URL (overrides SUBBOT_HTTP_URL env var)
    #[arg(long, env = "SUBBOT_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Print the raw JSON response
    #[arg(long, global = true)]
    json: bool,

    /// Actor recorded on state-changing commands
    #[arg(long, global = true, default_value = "operator")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a new sub-bot for an owner and print its challenge
    Create {
        owner: String,
        /// Authenticate with a pairing code instead of a QR scan
        #[arg(long)]
        pairing: bool,
        /// Phone digits for pairing (defaults to the owner's digits)
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },

    /// List sessions, optionally for one owner
    List {
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show one session
    Show { code: String },

    /// Stop a session, leaving it inactive
    Deactivate { code: String },

    /// Stop and delete a session
    Revoke { code: String },

    /// Start a fresh authentication for an inactive or failed session
    Reauth {
        code: String,
        #[arg(long)]
        pairing: bool,
        #[arg(long)]
        phone: Option<String>,
    },

    /// Resume a disconnected session from its stored credentials
    Relaunch { code: String },

    /// Page through the event log
    Events {
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(short = 'n', long, default_value_t = DEFAULT_EVENT_LIMIT)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Show or set the global on/off switch
    Global { state: Option<Switch> },

    /// Show or set a group's activation override
    Group { group: String, state: Option<Switch> },

    /// Show server health
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn is_on(self) -> bool {
        self == Switch::On
    }
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionView {
    pub code: String,
    #[serde(rename = "owner_identifier")]
    pub owner: String,
    #[serde(rename = "owner_display_name")]
    pub display_name: Option<String>,
    pub status: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub message_count: i64,
    #[serde(default)]
    pub has_credentials: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChallengeView {
    pub kind: String,
    pub payload: Option<String>,
    pub rendered: Option<String>,
    pub display: Option<String>,
}

// ============================================================================
// Formatting
// ============================================================================

pub fn session_line(s: &SessionView) -> String {
    let mut line = format!(
        "{}  {:<16} {:<14} msgs={}",
        s.code, s.owner, s.status, s.message_count
    );
    if !s.is_active {
        line.push_str("  (inactive)");
    }
    if s.has_credentials {
        line.push_str("  [creds]");
    }
    if let Some(name) = &s.display_name {
        line.push_str(&format!("  \"{}\"", name));
    }
    line
}

pub fn challenge_text(c: &ChallengeView) -> String {
    match c.kind.as_str() {
        "pairing" => format!(
            "Pairing code: {}\nEnter it under Linked devices > Link with phone number.",
            c.display.as_deref().unwrap_or("?")
        ),
        "qr" => match (&c.rendered, &c.payload) {
            (Some(rendered), _) => format!("Scan this QR code:\n{}", rendered),
            (None, Some(payload)) => format!("QR payload: {}", payload),
            (None, None) => "QR pending".to_string(),
        },
        "resumed" => "Session resumed from stored credentials".to_string(),
        other => format!("Challenge: {}", other),
    }
}

pub fn event_line(e: &Value) -> String {
    format!(
        "{:>6}  {}  {:<10}  {:<20} {}",
        e["id"].as_i64().unwrap_or_default(),
        e["created_at"].as_str().unwrap_or("?"),
        e["code"].as_str().unwrap_or("?"),
        e["event_kind"].as_str().unwrap_or("?"),
        e["payload"]
    )
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Api {
    client: Client,
    server: String,
}

impl Api {
    fn new(server: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    /// Send the request; non-2xx replies become errors carrying the server message.
    fn send(&self, request: RequestBuilder) -> anyhow::Result<Value> {
        let resp = request.send()?;
        let status = resp.status();
        let body: Value = resp.json().unwrap_or_default();
        if !status.is_success() {
            let msg = body["error"].as_str().unwrap_or("unknown error");
            anyhow::bail!("server returned {}: {}", status, msg);
        }
        Ok(body)
    }

    fn get(&self, path: &str) -> anyhow::Result<Value> {
        self.send(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        self.send(self.client.post(self.url(path)).json(&body))
    }

    fn put(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        self.send(self.client.put(self.url(path)).json(&body))
    }

    fn delete(&self, path: &str, actor: &str) -> anyhow::Result<Value> {
        self.send(self.client.delete(self.url(path)).query(&[("actor", actor)]))
    }
}

fn method_name(pairing: bool) -> &'static str {
    if pairing {
        "pairing"
    } else {
        "qr"
    }
}

fn print_launch(body: &Value) -> anyhow::Result<()> {
    let session: SessionView = serde_json::from_value(body["session"].clone())?;
    let challenge: ChallengeView = serde_json::from_value(body["challenge"].clone())?;
    println!("{}", session_line(&session));
    println!("{}", challenge_text(&challenge));
    Ok(())
}

fn print_sessions(body: &Value) -> anyhow::Result<()> {
    let sessions: Vec<SessionView> = serde_json::from_value(body["sessions"].clone())?;
    if sessions.is_empty() {
        eprintln!("No sessions");
    }
    for s in &sessions {
        println!("{}", session_line(s));
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let api = Api::new(&cli.server)?;
    let actor = cli.actor.as_str();

    let body = match &cli.command {
        Commands::Create {
            owner,
            pairing,
            phone,
            name,
        } => api.post(
            "/sessions",
            serde_json::json!({
                "owner": owner,
                "display_name": name,
                "method": method_name(*pairing),
                "phone_number": phone,
            }),
        )?,
        Commands::List { owner } => match owner {
            Some(owner) => api.send(api.client.get(api.url("/sessions")).query(&[("owner", owner)]))?,
            None => api.get("/sessions")?,
        },
        Commands::Show { code } => api.get(&format!("/sessions/{}", code))?,
        Commands::Deactivate { code } => api.post(
            &format!("/sessions/{}/deactivate", code),
            serde_json::json!({ "actor": actor }),
        )?,
        Commands::Revoke { code } => api.delete(&format!("/sessions/{}", code), actor)?,
        Commands::Reauth {
            code,
            pairing,
            phone,
        } => api.post(
            &format!("/sessions/{}/reauthenticate", code),
            serde_json::json!({
                "method": method_name(*pairing),
                "phone_number": phone,
                "actor": actor,
            }),
        )?,
        Commands::Relaunch { code } => {
            api.post(&format!("/sessions/{}/relaunch", code), serde_json::json!({}))?
        }
        Commands::Events {
            code,
            kind,
            limit,
            offset,
        } => {
            let mut query: Vec<(&str, String)> =
                vec![("limit", limit.to_string()), ("offset", offset.to_string())];
            if let Some(code) = code {
                query.push(("code", code.clone()));
            }
            if let Some(kind) = kind {
                query.push(("event_kind", kind.clone()));
            }
            api.send(api.client.get(api.url("/events")).query(&query))?
        }
        Commands::Global { state } => match state {
            Some(s) => api.put(
                "/activation",
                serde_json::json!({ "is_on": s.is_on(), "actor": actor }),
            )?,
            None => api.get("/activation")?,
        },
        Commands::Group { group, state } => {
            let path = format!("/groups/{}/activation", group);
            match state {
                Some(s) => api.put(
                    &path,
                    serde_json::json!({ "is_active": s.is_on(), "actor": actor }),
                )?,
                None => api.get(&path)?,
            }
        }
        Commands::Status => api.get("/health")?,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    match &cli.command {
        Commands::Create { .. } | Commands::Reauth { .. } => print_launch(&body)?,
        Commands::List { .. } => print_sessions(&body)?,
        Commands::Show { .. } | Commands::Deactivate { .. } | Commands::Relaunch { .. } => {
            let session: SessionView = serde_json::from_value(body)?;
            println!("{}", session_line(&session));
        }
        Commands::Revoke { code } => println!("Revoked {}", code),
        Commands::Events { .. } => {
            let events = body["events"].as_array().cloned().unwrap_or_default();
            if events.is_empty() {
                eprintln!("No events");
            }
            for e in &events {
                println!("{}", event_line(e));
            }
        }
        Commands::Global { .. } => {
            println!(
                "Bot is {} (last changed by {})",
                on_off(body["is_on"].as_bool().unwrap_or(true)),
                body["last_changed_by"].as_str().unwrap_or("nobody")
            );
        }
        Commands::Group { group, .. } => {
            let overridden = if body["overridden"].as_bool().unwrap_or(false) {
                ""
            } else {
                " (default)"
            };
            println!(
                "Group {} is {}{}",
                group,
                on_off(body["is_active"].as_bool().unwrap_or(true)),
                overridden
            );
        }
        Commands::Status => {
            println!("Subbot server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:       {}", body["version"].as_str().unwrap_or("?"));
            println!("Store:         {}", body["store"].as_str().unwrap_or("?"));
            println!("Live sessions: {}", body["live_sessions"]);
            println!("Socket:        {}", body["socket"].as_str().unwrap_or("?"));
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("subbot: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn session(status: &str) -> SessionView {
        SessionView {
            code: "SB-1A2B3C4D".to_string(),
            owner: "549111".to_string(),
            display_name: None,
            status: status.to_string(),
            is_active: true,
            message_count: 3,
            has_credentials: false,
        }
    }

    #[test]
    fn test_session_line_basic() {
        let line = session_line(&session("connected"));
        assert!(line.starts_with("SB-1A2B3C4D"));
        assert!(line.contains("connected"));
        assert!(line.contains("msgs=3"));
        assert!(!line.contains("inactive"));
    }

    #[test]
    fn test_session_line_flags_and_name() {
        let mut s = session("disconnected");
        s.is_active = false;
        s.has_credentials = true;
        s.display_name = Some("Ana".to_string());
        let line = session_line(&s);
        assert!(line.contains("(inactive)"));
        assert!(line.contains("[creds]"));
        assert!(line.ends_with("\"Ana\""));
    }

    #[test]
    fn test_session_view_ignores_extra_fields() {
        let s: SessionView = serde_json::from_value(serde_json::json!({
            "code": "SB-1",
            "owner_identifier": "o",
            "status": "waiting_scan",
            "created_at": "2026-01-01T00:00:00Z",
            "metadata": {},
        }))
        .unwrap();
        assert_eq!(s.status, "waiting_scan");
        assert!(!s.has_credentials);
    }

    #[test]
    fn test_challenge_text_pairing() {
        let c = ChallengeView {
            kind: "pairing".into(),
            payload: None,
            rendered: None,
            display: Some("K7QX-2M9P".into()),
        };
        assert!(challenge_text(&c).contains("K7QX-2M9P"));
    }

    #[test]
    fn test_challenge_text_qr_prefers_rendering() {
        let c = ChallengeView {
            kind: "qr".into(),
            payload: Some("2@abc".into()),
            rendered: Some("█▀█".into()),
            display: None,
        };
        let text = challenge_text(&c);
        assert!(text.contains("█▀█"));
        assert!(!text.contains("2@abc"));

        let bare = ChallengeView {
            rendered: None,
            ..c
        };
        assert!(challenge_text(&bare).contains("2@abc"));
    }

    #[test]
    fn test_event_line_handles_missing_fields() {
        let line = event_line(&serde_json::json!({ "id": 7, "event_kind": "launch" }));
        assert!(line.contains("launch"));
        assert!(line.trim_start().starts_with('7'));
    }

    #[test]
    fn test_cli_parses_group_switch() {
        let cli = Cli::try_parse_from(["subbot", "group", "1203@g.us", "off"]).unwrap();
        match cli.command {
            Commands::Group { group, state } => {
                assert_eq!(group, "1203@g.us");
                assert_eq!(state, Some(Switch::Off));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
