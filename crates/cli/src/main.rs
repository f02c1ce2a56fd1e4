use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkvault_core::{Catalog, Config, Manager, Manifest, Node, SqliteCatalog};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Parser)]
#[command(name = "chunkvault")]
#[command(about = "Chunked blob store over rate-limited webhook attachments", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a local file as chunked attachments, replacing any existing
    /// content at `remote` (no in-place edits: reopening for write replaces).
    Put { local: PathBuf, remote: String },
    /// Reassemble a blob (optionally a byte range of it) to a local file.
    Get {
        remote: String,
        local: PathBuf,
        #[arg(long)]
        offset: Option<u64>,
        #[arg(long)]
        length: Option<u64>,
    },
    Ls {
        path: String,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    Stat { path: String },
    Mkdir { path: String },
    Rm { path: String },
    Mv { src: String, dst: String },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<chunkvault_core::Error> for CliError {
    fn from(e: chunkvault_core::Error) -> Self {
        let code = match &e {
            chunkvault_core::Error::NotExist { .. } => "not_exist",
            chunkvault_core::Error::Exist { .. } => "exist",
            chunkvault_core::Error::InvalidParent { .. } => "invalid_parent",
            chunkvault_core::Error::InvalidName { .. } => "invalid_name",
            chunkvault_core::Error::Permission { .. } => "permission",
            chunkvault_core::Error::InvalidSeek { .. } => "invalid_seek",
            chunkvault_core::Error::InvalidRange { .. } => "invalid_range",
            chunkvault_core::Error::Transport { .. } => "transport",
            chunkvault_core::Error::Remote { .. } => "remote",
            chunkvault_core::Error::Malformed { .. } => "malformed",
            chunkvault_core::Error::Closed | chunkvault_core::Error::AlreadyClosed => "closed",
            chunkvault_core::Error::Poisoned(_) => "poisoned",
            chunkvault_core::Error::Cancelled => "cancelled",
            _ => "internal",
        };
        CliError::new(code, e.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::new("io", e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    chunk_size: u64,
    webhooks: Vec<String>,
    #[serde(default)]
    async_write: bool,
    #[serde(default = "default_db_path")]
    db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("chunkvault.sqlite3")
}

fn default_config_path() -> PathBuf {
    std::env::var("CHUNKVAULT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("chunkvault.toml"))
}

fn load_config(path: &Path) -> Result<FileConfig, CliError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CliError::new("config", format!("reading {}: {e}", path.display())))?;
    let cfg: FileConfig = toml::from_str(&text)
        .map_err(|e| CliError::new("config", format!("parsing {}: {e}", path.display())))?;
    Config {
        chunk_size: cfg.chunk_size,
        webhooks: cfg.webhooks.clone(),
        async_write: cfg.async_write,
    }
    .validate()
    .map_err(CliError::from)?;
    Ok(cfg)
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_target(false))
        .try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let json = cli.json;
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e, json);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let file_cfg = load_config(&config_path)?;
    let db_path = cli.db.unwrap_or(file_cfg.db_path.clone());

    let catalog = SqliteCatalog::connect(&db_path).await?;
    let manager = Arc::new(Manager::from_webhook_urls(&file_cfg.webhooks)?);

    match cli.cmd {
        Command::Put { local, remote } => put(&catalog, &manager, &file_cfg, &local, &remote, cli.json).await,
        Command::Get {
            remote,
            local,
            offset,
            length,
        } => get(&catalog, &manager, &remote, &local, offset, length, cli.json).await,
        Command::Ls { path, limit, offset } => ls(&catalog, &path, limit, offset, cli.json).await,
        Command::Stat { path } => stat(&catalog, &path, cli.json).await,
        Command::Mkdir { path } => mkdir(&catalog, &path, cli.json).await,
        Command::Rm { path } => rm(&catalog, &path, cli.json).await,
        Command::Mv { src, dst } => mv(&catalog, &src, &dst, cli.json).await,
    }
}

async fn put(
    catalog: &SqliteCatalog,
    manager: &Arc<Manager>,
    file_cfg: &FileConfig,
    local: &Path,
    remote: &str,
    json: bool,
) -> Result<(), CliError> {
    let mut source = tokio::fs::File::open(local).await?;

    let file = match catalog.stat(remote).await {
        Ok(file) => {
            catalog.delete_nodes(file.id).await?;
            file
        }
        Err(chunkvault_core::Error::NotExist { .. }) => catalog.touch(remote).await?,
        Err(e) => return Err(e.into()),
    };

    let collected: Arc<std::sync::Mutex<Vec<chunkvault_core::Attachment>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let collected_cb = Arc::clone(&collected);
    let on_chunk: chunkvault_core::OnChunk = Box::new(move |a| collected_cb.lock().unwrap().push(a));

    let mut writer = manager
        .new_writer(file_cfg.chunk_size, file_cfg.async_write, on_chunk)
        .map_err(CliError::from)?;

    let mut buf = vec![0u8; file_cfg.chunk_size.min(1024 * 1024) as usize];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n]).await.map_err(CliError::from)?;
    }
    writer.close().await.map_err(CliError::from)?;

    let attachments = Arc::try_unwrap(collected)
        .expect("writer has dropped its clone by the time close() returns")
        .into_inner()
        .expect("mutex not poisoned");
    let nodes: Vec<Node> = attachments
        .into_iter()
        .map(|a| Node {
            file_id: file.id,
            url: a.url,
            size: a.size,
            index: a.index,
            iv: None,
        })
        .collect();
    catalog.add_nodes(file.id, nodes).await?;

    emit_ok(json, serde_json::json!({ "path": remote, "id": file.id.to_string() }));
    Ok(())
}

async fn get(
    catalog: &SqliteCatalog,
    manager: &Arc<Manager>,
    remote: &str,
    local: &Path,
    offset: Option<u64>,
    length: Option<u64>,
    json: bool,
) -> Result<(), CliError> {
    let file = catalog.stat(remote).await?;
    let nodes = catalog.get_nodes(file.id).await?;
    let attachments = nodes
        .into_iter()
        .map(|n| chunkvault_core::Attachment {
            url: n.url,
            size: n.size,
            index: n.index,
        })
        .collect();
    let manifest = Manifest::new(attachments).map_err(CliError::from)?;

    let start = offset.unwrap_or(0);
    let mut reader = manager.new_reader(manifest.clone(), start).map_err(CliError::from)?;
    let end = length
        .map(|len| start.saturating_add(len))
        .unwrap_or(manifest.total_size());

    let mut dest = tokio::fs::File::create(local).await?;
    let mut buf = vec![0u8; 1024 * 1024];
    let mut pos = start;
    while pos < end {
        let want = ((end - pos) as usize).min(buf.len());
        let n = reader.read(&mut buf[..want]).await.map_err(CliError::from)?;
        if n == 0 {
            break;
        }
        dest.write_all(&buf[..n]).await?;
        pos += n as u64;
    }
    dest.flush().await?;

    emit_ok(json, serde_json::json!({ "path": remote, "bytes": pos - start }));
    Ok(())
}

async fn ls(catalog: &SqliteCatalog, path: &str, limit: usize, offset: usize, json: bool) -> Result<(), CliError> {
    let files = catalog.ls(path, limit, offset).await?;
    if json {
        let items: Vec<_> = files
            .iter()
            .map(|f| {
                serde_json::json!({
                    "name": f.name,
                    "isDirectory": f.is_directory,
                    "size": f.size,
                    "mtime": f.mtime.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::json!({ "entries": items }));
    } else {
        for f in files {
            let kind = if f.is_directory { "dir " } else { "file" };
            println!("{kind}  {:>12}  {}  {}", f.size, f.mtime.to_rfc3339(), f.name);
        }
    }
    Ok(())
}

async fn stat(catalog: &SqliteCatalog, path: &str, json: bool) -> Result<(), CliError> {
    let file = catalog.stat(path).await?;
    emit_ok(
        json,
        serde_json::json!({
            "id": file.id.to_string(),
            "name": file.name,
            "isDirectory": file.is_directory,
            "size": file.size,
            "mtime": file.mtime.to_rfc3339(),
        }),
    );
    Ok(())
}

async fn mkdir(catalog: &SqliteCatalog, path: &str, json: bool) -> Result<(), CliError> {
    catalog.mkdir(path).await?;
    emit_ok(json, serde_json::json!({ "path": path }));
    Ok(())
}

async fn rm(catalog: &SqliteCatalog, path: &str, json: bool) -> Result<(), CliError> {
    catalog.rm(path).await?;
    emit_ok(json, serde_json::json!({ "path": path }));
    Ok(())
}

async fn mv(catalog: &SqliteCatalog, src: &str, dst: &str, json: bool) -> Result<(), CliError> {
    catalog.mv(src, dst).await?;
    emit_ok(json, serde_json::json!({ "from": src, "to": dst }));
    Ok(())
}

fn emit_ok(json: bool, value: serde_json::Value) {
    if json {
        println!("{value}");
    } else {
        println!("ok");
    }
    let _ = std::io::stdout().flush();
}

fn emit_error(e: &CliError, json: bool) {
    if json {
        let line = serde_json::to_string(e)
            .unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\"}".to_string());
        let _ = writeln!(std::io::stderr(), "{line}");
    } else {
        let _ = writeln!(std::io::stderr(), "error[{}]: {}", e.code, e.message);
    }
}
