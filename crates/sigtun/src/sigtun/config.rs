use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};

use crate::sigtun::tunnel::server::DeadlineMode;

pub const CONFIG_ENV: &str = "SIGTUN_CONFIG";

/// Which binary role a config file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn file_stem(self) -> &'static str {
        match self {
            Role::Client => "sigtun-client",
            Role::Server => "sigtun-server",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
        }
    }
}

pub fn resolve_config_path(
    role: Role,
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(role, &p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps SIGTUN_CONFIG into the flag value; this covers callers without clap.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(role, Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    let path = discover_config_path(role, Path::new("."))?;
    Ok(ResolvedConfigPath {
        path,
        source: ConfigPathSource::Cwd,
    })
}

fn normalize_explicit_path(role: Role, p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    match fs::metadata(p) {
        Ok(m) if m.is_dir() => discover_config_path(role, p),
        _ => Ok(p.to_path_buf()),
    }
}

fn discover_config_path(role: Role, dir: &Path) -> anyhow::Result<PathBuf> {
    let stem = role.file_stem();
    for ext in ["yaml", "yml", "toml"] {
        let p = dir.join(format!("{stem}.{ext}"));
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!(
        "config: no {stem}.{{yaml,yml,toml}} in {} (pass --config or set {CONFIG_ENV})",
        dir.display()
    )
}

fn parse_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display())),
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))
        }
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    }
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    Duration::from_millis(v.map(|ms| ms.max(0) as u64).unwrap_or(default_ms))
}

/// Resolves a `*_ms` key against its legacy whole-seconds spelling.
fn millis_or_secs(
    ms_key: &str,
    ms: Option<i64>,
    secs: Option<i64>,
    default_ms: u64,
) -> anyhow::Result<Duration> {
    match (ms, secs) {
        (Some(_), Some(_)) => anyhow::bail!("config: set either {ms_key} or timeout, not both"),
        (None, Some(s)) => Ok(Duration::from_secs(s.max(0) as u64)),
        (ms, None) => Ok(millis(ms, default_ms)),
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// SOCKS5 listen address.
    pub local_address: String,
    pub signal_base_url: String,
    pub user_id: u64,
    pub password: Vec<u8>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub insecure_skip_verify: bool,
    pub transport: String,
    pub ice_servers: Vec<String>,
    /// Dial timeout and tunnel idle timeout.
    pub timeout: Duration,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Signal HTTP listen address.
    pub server_addr: String,
    pub admin_addr: String,
    pub transport: String,
    pub rendezvous: RendezvousConfig,
    pub ice_servers: Vec<String>,
    pub users: HashMap<u64, Vec<u8>>,
    pub answer_ttl: Duration,
    pub deny: DenyConfig,
    pub handshake_timeout: Duration,
    pub session_deadline: Duration,
    pub deadline_mode: DeadlineMode,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub listen_addr: String,
    pub advertise: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DenyConfig {
    pub status: u16,
    /// Contents of the decoy body file, empty if none.
    pub body: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClientConfig {
    local_address: Option<String>,
    #[serde(default)]
    signal_base_url: String,
    user_id: Option<u64>,
    #[serde(default)]
    password: String,
    poll_interval_ms: Option<i64>,
    request_timeout_ms: Option<i64>,
    #[serde(default)]
    insecure_skip_verify: bool,
    transport: Option<String>,
    ice_server: Option<FileIceServer>,
    timeout_ms: Option<i64>,
    /// Legacy key, in seconds.
    timeout: Option<i64>,
    #[serde(default)]
    max_attempts: u32,
    connect_timeout_ms: Option<i64>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServerConfig {
    #[serde(default)]
    server_addr: String,
    #[serde(default)]
    admin_addr: String,
    transport: Option<String>,
    rendezvous: Option<FileRendezvous>,
    ice_server: Option<FileIceServer>,
    web_signal: Option<FileWebSignal>,
    handshake_timeout_ms: Option<i64>,
    /// Legacy key, in seconds; same meaning as `handshake_timeout_ms`.
    timeout: Option<i64>,
    session_deadline_ms: Option<i64>,
    deadline_mode: Option<String>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileIceServer {
    #[serde(default)]
    urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRendezvous {
    listen_addr: Option<String>,
    #[serde(default)]
    advertise: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileWebSignal {
    #[serde(default)]
    default_users: HashMap<FileUserId, String>,
    answer_ttl_ms: Option<i64>,
    deny_status: Option<u16>,
    deny_body_file: Option<String>,
}

/// YAML keys may be bare integers; TOML keys are always strings.
#[derive(Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
enum FileUserId {
    Num(u64),
    Text(String),
}

impl FileUserId {
    fn to_u64(&self) -> anyhow::Result<u64> {
        match self {
            FileUserId::Num(n) => Ok(*n),
            FileUserId::Text(s) => s
                .trim()
                .parse()
                .with_context(|| format!("config: invalid user id {s:?}")),
        }
    }
}

impl LoggingConfig {
    fn from_file(fl: Option<FileLogging>) -> Self {
        let mut out = LoggingConfig::default();
        if let Some(fl) = fl {
            if let Some(v) = fl.level.filter(|s| !s.trim().is_empty()) {
                out.level = v.trim().to_ascii_lowercase();
            }
            if let Some(v) = fl.format.filter(|s| !s.trim().is_empty()) {
                out.format = v.trim().to_ascii_lowercase();
            }
            if let Some(v) = fl.output.filter(|s| !s.trim().is_empty()) {
                out.output = v.trim().to_string();
            }
            out.add_source = fl.add_source;
        }
        out
    }
}

fn transport_name(t: Option<String>) -> String {
    t.map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "rendezvous".into())
}

pub fn load_client_config(path: &Path) -> anyhow::Result<ClientConfig> {
    let fc: FileClientConfig = parse_file(path)?;

    let signal_base_url = fc.signal_base_url.trim().to_string();
    if signal_base_url.is_empty() {
        anyhow::bail!("config: signal_base_url is required");
    }
    let Some(user_id) = fc.user_id else {
        anyhow::bail!("config: user_id is required");
    };
    if fc.password.is_empty() {
        anyhow::bail!("config: password is required");
    }

    Ok(ClientConfig {
        local_address: fc
            .local_address
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "127.0.0.1:1080".into()),
        signal_base_url,
        user_id,
        password: fc.password.into_bytes(),
        poll_interval: millis(fc.poll_interval_ms, 2_000),
        request_timeout: millis(fc.request_timeout_ms, 30_000),
        insecure_skip_verify: fc.insecure_skip_verify,
        transport: transport_name(fc.transport),
        ice_servers: fc.ice_server.map(|i| i.urls).unwrap_or_default(),
        timeout: millis_or_secs("timeout_ms", fc.timeout_ms, fc.timeout, 10_000)?,
        max_attempts: fc.max_attempts,
        connect_timeout: millis(fc.connect_timeout_ms, 0),
        logging: LoggingConfig::from_file(fc.logging),
    })
}

pub fn load_server_config(path: &Path) -> anyhow::Result<ServerConfig> {
    let fc: FileServerConfig = parse_file(path)?;

    let server_addr = fc.server_addr.trim().to_string();
    if server_addr.is_empty() {
        anyhow::bail!("config: server_addr is required");
    }
    let admin_addr = fc.admin_addr.trim().to_string();

    let ws = fc.web_signal.unwrap_or(FileWebSignal {
        default_users: HashMap::new(),
        answer_ttl_ms: None,
        deny_status: None,
        deny_body_file: None,
    });

    let mut users = HashMap::with_capacity(ws.default_users.len());
    for (id, password) in &ws.default_users {
        if password.is_empty() {
            anyhow::bail!("config: empty password for user {id:?}");
        }
        users.insert(id.to_u64()?, password.clone().into_bytes());
    }
    if users.is_empty() && admin_addr.is_empty() {
        anyhow::bail!("config: web_signal.default_users is empty and no admin_addr is set to add users later");
    }

    let status = ws.deny_status.unwrap_or(404);
    if !(100..=599).contains(&status) {
        anyhow::bail!("config: web_signal.deny_status {status} is not an HTTP status");
    }
    let body = match ws.deny_body_file.as_deref().map(str::trim) {
        Some(f) if !f.is_empty() => {
            let p = resolve_relative(path, f);
            fs::read(&p).with_context(|| format!("config: read deny_body_file {}", p.display()))?
        }
        _ => Vec::new(),
    };

    let rv = fc.rendezvous.unwrap_or(FileRendezvous {
        listen_addr: None,
        advertise: Vec::new(),
    });

    let deadline_mode = DeadlineMode::parse(fc.deadline_mode.as_deref().unwrap_or(""))
        .context("config: deadline_mode")?;

    Ok(ServerConfig {
        server_addr,
        admin_addr,
        transport: transport_name(fc.transport),
        rendezvous: RendezvousConfig {
            listen_addr: rv
                .listen_addr
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| ":29444".into()),
            advertise: rv
                .advertise
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        },
        ice_servers: fc.ice_server.map(|i| i.urls).unwrap_or_default(),
        users,
        answer_ttl: millis(ws.answer_ttl_ms, 60_000),
        deny: DenyConfig { status, body },
        handshake_timeout: millis_or_secs(
            "handshake_timeout_ms",
            fc.handshake_timeout_ms,
            fc.timeout,
            10_000,
        )?,
        session_deadline: millis(fc.session_deadline_ms, 15 * 60 * 1_000),
        deadline_mode,
        logging: LoggingConfig::from_file(fc.logging),
    })
}

/// Resolves `p` against the directory of the config file unless it is absolute.
fn resolve_relative(config_path: &Path, p: &str) -> PathBuf {
    let p = Path::new(p);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match config_path.parent() {
        Some(dir) => dir.join(p),
        None => p.to_path_buf(),
    }
}
