use std::io;
use std::path::Path;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use engine::{EffectiveSettings, GlobalSettings, SiteOverride};
use frames::{Data, Frame, Status, Syscall};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket closed")]
    WsClosed,
    #[error("frame decode failed: {0}")]
    Decode(#[from] frames::CodecError),
    #[error("timed out waiting for websocket frame")]
    Timeout,
    #[error("server returned error for {syscall}: {message}")]
    ServerError { syscall: String, message: String },
    #[error("missing expected field `{0}`")]
    MissingField(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("cannot read input: {0}")]
    Io(#[from] io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "nightctl", about = "Night mode coordinator CLI")]
struct Cli {
    #[arg(long, env = "NIGHTMODE_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone)]
struct CliContext {
    base_url: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the coordinator is up.
    Ping,
    /// Print the global settings, or the settings resolved for a page.
    Get {
        #[arg(long)]
        url: Option<String>,
    },
    /// Flip the global enabled flag.
    Toggle,
    /// Replace the global settings with a JSON document.
    Save {
        #[arg(long, help = "Settings JSON file, or - for stdin")]
        file: String,
    },
    /// Manage per-site overrides.
    Site(SiteCommand),
    /// Report the operating system color scheme.
    Theme {
        #[arg(value_enum)]
        scheme: Scheme,
    },
    /// Print the stylesheet a page would receive.
    Css(CssArgs),
    /// Attach as a page and print every push.
    Watch(WatchArgs),
    /// Send one raw syscall over the socket and print the reply.
    Call(CallArgs),
}

#[derive(Args, Debug)]
struct SiteCommand {
    #[command(subcommand)]
    command: SiteSubcommand,
}

#[derive(Subcommand, Debug)]
enum SiteSubcommand {
    Set {
        host: String,
        #[arg(long, conflicts_with = "json", required_unless_present = "json")]
        file: Option<String>,
        #[arg(long)]
        json: Option<String>,
    },
    Rm {
        host: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scheme {
    Dark,
    Light,
}

impl Scheme {
    fn is_dark(self) -> bool {
        self == Self::Dark
    }
}

#[derive(Args, Debug)]
struct CssArgs {
    #[arg(long)]
    url: Option<String>,

    #[arg(long, help = "Compile from a local settings file instead of the coordinator")]
    file: Option<String>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long)]
    url: String,

    #[arg(long, help = "Exit after this many pushes")]
    count: Option<usize>,

    #[arg(long, default_value_t = false, help = "Print the compiled stylesheet for each APPLY")]
    css: bool,
}

#[derive(Args, Debug)]
struct CallArgs {
    syscall: Syscall,

    #[arg(long, default_value = "{}")]
    data: String,

    #[arg(long, help = "Register the socket as this page first")]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let ctx = CliContext { base_url: cli.base_url };

    match cli.command {
        Command::Ping => run_ping(&ctx).await,
        Command::Get { url } => run_get(&ctx, url.as_deref()).await,
        Command::Toggle => run_toggle(&ctx).await,
        Command::Save { file } => run_save(&ctx, &file).await,
        Command::Site(site) => run_site(&ctx, site).await,
        Command::Theme { scheme } => run_theme(&ctx, scheme).await,
        Command::Css(args) => run_css(&ctx, args).await,
        Command::Watch(args) => run_watch(&ctx, args).await,
        Command::Call(args) => run_call(&ctx, args).await,
    }
}

// =============================================================================
// HTTP COMMANDS
// =============================================================================

async fn run_ping(cli: &CliContext) -> Result<(), CliError> {
    let client = reqwest::Client::new();
    let url = format!("{}/healthz", cli.base_url.trim_end_matches('/'));
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerError {
            syscall: format!("HTTP {}", status.as_u16()),
            message: "health check failed".to_owned(),
        });
    }
    println!("ok");
    Ok(())
}

async fn run_get(cli: &CliContext, url: Option<&str>) -> Result<(), CliError> {
    let json = fetch_settings(cli, url).await?;
    print_json(&json)
}

async fn run_toggle(cli: &CliContext) -> Result<(), CliError> {
    let json = api_request(cli, reqwest::Method::POST, "/api/settings/toggle", None).await?;
    print_json(&json)
}

async fn run_save(cli: &CliContext, file: &str) -> Result<(), CliError> {
    let settings: GlobalSettings = serde_json::from_str(&read_input(file)?)?;
    for problem in settings.out_of_range() {
        eprintln!("warning: {problem}; the coordinator will clamp it");
    }
    let json = api_request(cli, reqwest::Method::PUT, "/api/settings", Some(serde_json::to_value(&settings)?)).await?;
    println!("saved revision {}", json.get("revision").and_then(Value::as_u64).unwrap_or_default());
    Ok(())
}

async fn run_site(cli: &CliContext, site: SiteCommand) -> Result<(), CliError> {
    match site.command {
        SiteSubcommand::Set { host, file, json } => {
            let text = match (file, json) {
                (_, Some(inline)) => inline,
                (Some(path), None) => read_input(&path)?,
                (None, None) => return Err(CliError::MissingField("override")),
            };
            let entry: SiteOverride = serde_json::from_str(&text)?;
            let path = format!("/api/sites/{host}");
            let json = api_request(cli, reqwest::Method::PUT, &path, Some(serde_json::to_value(&entry)?)).await?;
            print_json(&json)
        }
        SiteSubcommand::Rm { host } => {
            let path = format!("/api/sites/{host}");
            let json = api_request(cli, reqwest::Method::DELETE, &path, None).await?;
            print_json(&json)
        }
    }
}

async fn run_theme(cli: &CliContext, scheme: Scheme) -> Result<(), CliError> {
    let body = json!({ "dark": scheme.is_dark() });
    let json = api_request(cli, reqwest::Method::POST, "/api/theme", Some(body)).await?;
    print_json(&json)
}

async fn run_css(cli: &CliContext, args: CssArgs) -> Result<(), CliError> {
    let effective = match args.file {
        Some(path) => {
            let global = serde_json::from_str::<GlobalSettings>(&read_input(&path)?)?.normalized();
            local_effective(&global, args.url.as_deref())
        }
        None => {
            let body = fetch_settings(cli, args.url.as_deref()).await?;
            let settings = body.get("settings").cloned().ok_or(CliError::MissingField("settings"))?;
            serde_json::from_value::<EffectiveSettings>(settings)?
        }
    };

    if !effective.enabled {
        eprintln!("night mode is off for this target; no stylesheet would be mounted");
        return Ok(());
    }
    println!("{}", engine::style::compile(&effective));
    Ok(())
}

/// Resolve the way the coordinator does: no page means the global record.
fn local_effective(global: &GlobalSettings, url: Option<&str>) -> EffectiveSettings {
    match url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => engine::resolve::resolve_or_disabled(global, url),
        None => global.to_effective(),
    }
}

async fn fetch_settings(cli: &CliContext, url: Option<&str>) -> Result<Value, CliError> {
    let query: Vec<(&str, &str)> = url.map(|u| vec![("url", u)]).unwrap_or_default();
    api_request_with_query(cli, reqwest::Method::GET, "/api/settings", &query, None).await
}

async fn api_request(
    cli: &CliContext,
    method: reqwest::Method,
    path: &str,
    body: Option<Value>,
) -> Result<Value, CliError> {
    api_request_with_query(cli, method, path, &[], body).await
}

async fn api_request_with_query(
    cli: &CliContext,
    method: reqwest::Method,
    path: &str,
    query: &[(&str, &str)],
    body: Option<Value>,
) -> Result<Value, CliError> {
    let client = reqwest::Client::new();
    let url = format!("{}{}", cli.base_url.trim_end_matches('/'), path);

    let request = client.request(method, &url).query(query);
    let request = if let Some(json) = body {
        request.json(&json)
    } else {
        request
    };

    let response = request.send().await?;
    let status = response.status();
    let value = response
        .json::<Value>()
        .await
        .unwrap_or_else(|_| Value::Null);

    if !status.is_success() {
        return Err(CliError::ServerError {
            syscall: format!("HTTP {}", status.as_u16()),
            message: value.to_string(),
        });
    }

    Ok(value)
}

// =============================================================================
// WEBSOCKET COMMANDS
// =============================================================================

async fn run_watch(cli: &CliContext, args: WatchArgs) -> Result<(), CliError> {
    let url = ws_url(&cli.base_url, Some(&args.url))?;
    let (mut stream, _) = connect_async(url)
        .await
        .map_err(|error| CliError::WsConnect(Box::new(error)))?;

    let mut pushes = 0usize;
    loop {
        let frame = recv_frame(&mut stream).await?;
        print_json(&serde_json::to_value(&frame)?)?;

        if args.css && frame.syscall() == Some(Syscall::ApplyNightMode) {
            if let Some(settings) = frame.data.get("settings").cloned() {
                let effective = serde_json::from_value::<EffectiveSettings>(settings)?;
                println!("{}", engine::style::compile(&effective));
            }
        }

        if let Some(ack) = acknowledge(&frame) {
            send_frame(&mut stream, &ack).await?;
            pushes += 1;
            if args.count.is_some_and(|limit| pushes >= limit) {
                return Ok(());
            }
        }
    }
}

async fn run_call(cli: &CliContext, args: CallArgs) -> Result<(), CliError> {
    let data = parse_object(&args.data)?;
    let url = ws_url(&cli.base_url, args.url.as_deref())?;
    let (mut stream, _) = connect_async(url)
        .await
        .map_err(|error| CliError::WsConnect(Box::new(error)))?;

    let request = Frame::request(args.syscall, data);
    send_frame(&mut stream, &request).await?;
    let reply = wait_for_terminal_response(&mut stream, &request.id, &request.syscall).await?;
    print_json(&Value::Object(reply.data))
}

/// Reply a page owes for a coordinator push, if any.
fn acknowledge(frame: &Frame) -> Option<Frame> {
    if frame.status != Status::Request {
        return None;
    }
    match frame.syscall()? {
        Syscall::ApplyNightMode | Syscall::RemoveNightMode => {
            let mut data = Data::new();
            data.insert("success".into(), Value::Bool(true));
            Some(frame.done_with(data))
        }
        _ => None,
    }
}

fn ws_url(base_url: &str, page_url: Option<&str>) -> Result<String, CliError> {
    let base = base_url.trim_end_matches('/');
    let socket_base = if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        return Err(CliError::InvalidBaseUrl(base_url.to_owned()));
    };

    let mut url = reqwest::Url::parse(&format!("{socket_base}/api/ws"))
        .map_err(|_| CliError::InvalidBaseUrl(base_url.to_owned()))?;
    if let Some(page) = page_url {
        url.query_pairs_mut().append_pair("url", page);
    }
    Ok(url.into())
}

async fn send_frame(stream: &mut WsStream, frame: &Frame) -> Result<(), CliError> {
    stream
        .send(Message::Binary(frames::encode_frame(frame).into()))
        .await
        .map_err(|error| CliError::WsConnect(Box::new(error)))
}

async fn wait_for_terminal_response(stream: &mut WsStream, request_id: &str, syscall: &str) -> Result<Frame, CliError> {
    loop {
        let frame = recv_next(stream, Duration::from_secs(15)).await?;
        if frame.parent_id.as_deref() != Some(request_id) {
            continue;
        }
        if frame.syscall != syscall || !frame.status.is_terminal() {
            continue;
        }
        if frame.status == Status::Error {
            return Err(CliError::ServerError { syscall: frame.syscall.clone(), message: frame.error_summary() });
        }
        return Ok(frame);
    }
}

async fn recv_next(stream: &mut WsStream, timeout: Duration) -> Result<Frame, CliError> {
    tokio::time::timeout(timeout, recv_frame(stream))
        .await
        .map_err(|_| CliError::Timeout)?
}

async fn recv_frame(stream: &mut WsStream) -> Result<Frame, CliError> {
    loop {
        let Some(message) = stream.next().await else {
            return Err(CliError::WsClosed);
        };
        match message.map_err(|error| CliError::WsConnect(Box::new(error)))? {
            Message::Binary(bytes) => return frames::decode_frame(&bytes).map_err(CliError::from),
            Message::Text(text) => return serde_json::from_str(text.as_str()).map_err(CliError::from),
            Message::Close(_) => return Err(CliError::WsClosed),
            _ => {}
        }
    }
}

// =============================================================================
// INPUT / OUTPUT
// =============================================================================

fn read_input(path: &str) -> Result<String, CliError> {
    if path == "-" {
        return Ok(io::read_to_string(io::stdin())?);
    }
    Ok(std::fs::read_to_string(Path::new(path))?)
}

fn parse_object(text: &str) -> Result<Data, CliError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(CliError::MissingField("data object")),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
