//! The `sqlfs` mount binary: parse configuration, warm the session pool,
//! repair if asked, then hand control to the FUSE host.

use std::ffi::{OsStr, OsString};
use std::fs::OpenOptions;

use anyhow::{bail, Context};
use clap::Parser;
use fuse_mt::FuseMT;

use sqlfs::config::{self, Cli};
use sqlfs::{fsck, fuse::SqlFs, tree};
use sqlfs_api::pool::{Pool, PoolConfig};
use sqlfs_api::types::TableSet;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    if !config::valid_table_prefix(&cli.table_prefix) {
        bail!(
            "table prefix {:?} contains characters outside [A-Za-z0-9_]",
            cli.table_prefix
        );
    }
    let tables = TableSet::with_prefix(&cli.table_prefix);
    let db = config::resolve_db(&cli)?;
    log::info!(
        "connecting to mysql://{}@{}:{}/{} (tables: {}*)",
        db.user,
        db.host.as_deref().unwrap_or("<socket>"),
        db.port,
        db.database,
        cli.table_prefix
    );

    let pool_cfg = PoolConfig {
        init_conns: cli.init_conns,
        max_idling_conns: cli.max_idling_conns,
        max_open_conns: cli.max_open_conns,
        ..PoolConfig::default()
    };
    let pool = Pool::init(config::client_opts(&db), pool_cfg, &tables)
        .context("database startup failed")?;

    {
        let mut sess = pool
            .acquire()
            .context("no session available for startup checks")?;
        tree::ensure_root(sess.conn(), &tables).context("root entry check failed")?;
        if !cli.nofsck {
            fsck::run(sess.conn(), &tables).context("fsck failed")?;
        }
    }

    if cli.background {
        daemonize()?;
    }

    let options = mount_options(&cli);
    let option_refs: Vec<&OsStr> = options.iter().map(|o| o.as_os_str()).collect();
    log::info!("mounting on {:?}", cli.mountpoint);

    let filesystem = SqlFs::new(pool, tables);
    fuse_mt::mount(
        FuseMT::new(filesystem, cli.max_open_conns),
        &cli.mountpoint,
        &option_refs,
    )
    .context("mount failed")?;

    Ok(())
}

/// Mount options handed through to the FUSE host.
fn mount_options(cli: &Cli) -> Vec<OsString> {
    let mut options = vec![OsString::from("-o"), OsString::from("fsname=sqlfs")];
    let passthrough = [
        (cli.allow_other, "allow_other"),
        (cli.default_permissions, "default_permissions"),
        (cli.big_writes, "big_writes"),
    ];
    for (enabled, flag) in passthrough {
        if enabled {
            options.push(OsString::from("-o"));
            options.push(OsString::from(flag));
        }
    }
    options
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = &cli.logfile {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open logfile {:?}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

/// Fork and let the parent exit, leaving the mount in the child.
fn daemonize() -> anyhow::Result<()> {
    // SAFETY: called before the host spawns its worker threads; the child
    // continues with the already-open database connections.
    match unsafe { libc::fork() } {
        -1 => bail!("fork failed: {}", std::io::Error::last_os_error()),
        0 => Ok(()),
        _ => std::process::exit(0),
    }
}
