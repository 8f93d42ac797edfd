//! Mount configuration: the command line surface and `my.cnf` defaults.
//!
//! Connection settings can come from the command line or, mirroring the
//! stock MySQL clients, from a named group in the usual `my.cnf` locations;
//! command line values always win. Everything else (pool sizing, fsck,
//! mount passthrough flags) is command line only.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mysql::{Opts, OptsBuilder};

/// Command line options of the `sqlfs` mount binary.
#[derive(Parser, Debug)]
#[command(
    name = "sqlfs",
    version,
    about = "Mount a MySQL database as a POSIX filesystem"
)]
pub struct Cli {
    /// Directory to mount the filesystem on.
    pub mountpoint: PathBuf,

    /// Database server host.
    #[arg(long)]
    pub host: Option<String>,

    /// Database server TCP port.
    #[arg(short = 'P', long)]
    pub port: Option<u16>,

    /// Connect through a UNIX socket instead of TCP.
    #[arg(short = 'S', long)]
    pub socket: Option<String>,

    /// Database user.
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Database password.
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Database holding the filesystem tables.
    #[arg(short = 'D', long)]
    pub database: Option<String>,

    /// Prefix shared by all backing tables.
    #[arg(long, default_value = "")]
    pub table_prefix: String,

    /// Read connection defaults from this group in my.cnf.
    #[arg(long)]
    pub mycnf_group: Option<String>,

    /// Append log output to this file instead of stderr.
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Run consistency repair before mounting (the default).
    #[arg(long)]
    pub fsck: bool,

    /// Skip consistency repair.
    #[arg(long, conflicts_with = "fsck")]
    pub nofsck: bool,

    /// Detach from the terminal once startup has succeeded.
    #[arg(long)]
    pub background: bool,

    /// Database sessions opened eagerly at startup.
    #[arg(long, default_value_t = 1)]
    pub init_conns: usize,

    /// Idle sessions kept around for reuse.
    #[arg(long, default_value_t = 5)]
    pub max_idling_conns: usize,

    /// Ceiling on concurrently open sessions.
    #[arg(long, default_value_t = 16)]
    pub max_open_conns: usize,

    /// Let other users access the mount (passed through to the host).
    #[arg(long)]
    pub allow_other: bool,

    /// Enable kernel-side permission checks (passed through to the host).
    #[arg(long)]
    pub default_permissions: bool,

    /// Allow larger write requests (passed through to the host).
    #[arg(long)]
    pub big_writes: bool,
}

/// Fully resolved database connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Server host; may be absent when connecting over a socket.
    pub host: Option<String>,
    /// Server TCP port.
    pub port: u16,
    /// UNIX socket path, if connecting locally.
    pub socket: Option<String>,
    /// Database user.
    pub user: String,
    /// Database password, if any.
    pub password: Option<String>,
    /// Database holding the filesystem tables.
    pub database: String,
}

/// Table prefixes end up inside SQL statements, so they are restricted to
/// plain identifier characters.
pub fn valid_table_prefix(prefix: &str) -> bool {
    prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolve the connection settings from the command line and, when a group
/// was named, the `my.cnf` files.
pub fn resolve_db(cli: &Cli) -> anyhow::Result<DbConfig> {
    let defaults = match &cli.mycnf_group {
        Some(group) => load_mycnf(group),
        None => HashMap::new(),
    };
    resolve_with(cli, &defaults)
}

fn resolve_with(cli: &Cli, defaults: &HashMap<String, String>) -> anyhow::Result<DbConfig> {
    let pick = |from_cli: &Option<String>, key: &str| -> Option<String> {
        from_cli.clone().or_else(|| defaults.get(key).cloned())
    };

    let host = pick(&cli.host, "host");
    let socket = pick(&cli.socket, "socket");
    if host.is_none() && socket.is_none() {
        anyhow::bail!("no database host or socket configured");
    }

    let port = cli
        .port
        .or_else(|| defaults.get("port").and_then(|p| p.parse().ok()))
        .unwrap_or(3306);

    Ok(DbConfig {
        host,
        port,
        socket,
        user: pick(&cli.user, "user").context("no database user configured")?,
        password: pick(&cli.password, "password"),
        database: pick(&cli.database, "database").context("no database name configured")?,
    })
}

/// Turn the resolved settings into client options.
pub fn client_opts(db: &DbConfig) -> Opts {
    let builder = OptsBuilder::new()
        .ip_or_hostname(db.host.clone())
        .tcp_port(db.port)
        .socket(db.socket.clone())
        .user(Some(db.user.clone()))
        .pass(db.password.clone())
        .db_name(Some(db.database.clone()));
    Opts::from(builder)
}

/// Extract `key = value` pairs from the named group of a my.cnf document.
pub fn mycnf_section(text: &str, group: &str) -> HashMap<String, String> {
    let header = format!("[{}]", group);
    let mut values = HashMap::new();
    let mut in_group = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            in_group = line == header;
            continue;
        }
        if !in_group {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    values
}

/// Read the named group from the usual my.cnf locations; later files
/// override earlier ones.
fn load_mycnf(group: &str) -> HashMap<String, String> {
    let mut paths = vec![
        PathBuf::from("/etc/my.cnf"),
        PathBuf::from("/etc/mysql/my.cnf"),
    ];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".my.cnf"));
    }

    let mut values = HashMap::new();
    for path in paths {
        if let Ok(text) = std::fs::read_to_string(&path) {
            values.extend(mycnf_section(&text, group));
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["sqlfs"];
        full.extend_from_slice(args);
        full.push("/mnt/test");
        Cli::parse_from(full)
    }

    #[test]
    fn section_parsing_skips_other_groups_and_comments() {
        let text = "\
[client]
user = other
[sqlfs]
# a comment
host = db.example.com
port = 3307
password = \"secret word\"
[mysqld]
datadir = /var/lib/mysql
";
        let values = mycnf_section(text, "sqlfs");
        assert_eq!(values.get("host").unwrap(), "db.example.com");
        assert_eq!(values.get("port").unwrap(), "3307");
        assert_eq!(values.get("password").unwrap(), "secret word");
        assert!(!values.contains_key("user"));
        assert!(!values.contains_key("datadir"));
    }

    #[test]
    fn command_line_wins_over_mycnf() {
        let c = cli(&["--user", "alice", "--database", "fs", "--host", "cli-host"]);
        let mut defaults = HashMap::new();
        defaults.insert("host".to_string(), "cnf-host".to_string());
        defaults.insert("port".to_string(), "3307".to_string());
        defaults.insert("password".to_string(), "pw".to_string());

        let db = resolve_with(&c, &defaults).unwrap();
        assert_eq!(db.host.as_deref(), Some("cli-host"));
        assert_eq!(db.port, 3307);
        assert_eq!(db.password.as_deref(), Some("pw"));
        assert_eq!(db.user, "alice");
    }

    #[test]
    fn missing_user_or_database_is_rejected() {
        let c = cli(&["--host", "h", "--database", "fs"]);
        assert!(resolve_with(&c, &HashMap::new()).is_err());

        let c = cli(&["--host", "h", "--user", "u"]);
        assert!(resolve_with(&c, &HashMap::new()).is_err());
    }

    #[test]
    fn socket_alone_satisfies_the_endpoint_requirement() {
        let c = cli(&["--socket", "/run/mysqld.sock", "--user", "u", "--database", "fs"]);
        let db = resolve_with(&c, &HashMap::new()).unwrap();
        assert_eq!(db.socket.as_deref(), Some("/run/mysqld.sock"));
        assert_eq!(db.port, 3306);
    }

    #[test]
    fn table_prefix_is_restricted_to_identifier_characters() {
        assert!(valid_table_prefix(""));
        assert!(valid_table_prefix("fs_"));
        assert!(valid_table_prefix("team2_"));
        assert!(!valid_table_prefix("fs-"));
        assert!(!valid_table_prefix("fs; DROP TABLE inodes;"));
    }
}
