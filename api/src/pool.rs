//! A bounded pool of live database sessions.
//!
//! The FUSE host delivers filesystem callbacks on a parallel thread pool,
//! while a MySQL connection may serve only one statement stream at a time.
//! The pool bridges the two: each callback acquires one [`Session`] for its
//! whole duration and releases it on return, so every connection is used by
//! at most one callback at any moment.
//!
//! Idle sessions sit in a bounded MPMC channel: `acquire` is a receive,
//! release is a send. When the channel is empty a fresh connection is opened,
//! up to a configurable ceiling; at the ceiling, `acquire` waits out a
//! deadline for some other caller's release and then fails with
//! [`FsError::PoolExhausted`]. No lock is ever held across a database call.
//!
//! Sessions are validated with a ping before reuse; a dead session is
//! discarded and replaced with a fresh connection.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use mysql::prelude::Queryable;
use mysql::{Conn, Opts};

use crate::error::{FsError, Result};
use crate::types::TableSet;

/// Sizing and timing knobs for the [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Sessions opened eagerly at startup.
    pub init_conns: usize,
    /// Capacity of the idle queue; a release beyond this closes the session.
    pub max_idling_conns: usize,
    /// Hard ceiling on concurrently open connections.
    pub max_open_conns: usize,
    /// How long `acquire` waits for a release once the ceiling is reached.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            init_conns: 1,
            max_idling_conns: 5,
            max_open_conns: 16,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// One live connection to the database.
#[derive(Debug)]
pub struct Session {
    conn: Conn,
}

impl Session {
    /// Open a fresh connection with the given client options.
    pub fn connect(opts: &Opts) -> Result<Session> {
        Ok(Session {
            conn: Conn::new(opts.clone())?,
        })
    }

    /// Ping the server. A `false` result means the session must be thrown
    /// away.
    pub fn is_alive(&mut self) -> bool {
        self.conn.ping().is_ok()
    }

    /// The underlying connection, for the query layer.
    pub fn conn(&mut self) -> &mut Conn {
        &mut self.conn
    }
}

/// Bounded multi-producer/multi-consumer pool of [`Session`]s.
#[derive(Debug)]
pub struct Pool {
    idle_tx: Sender<Session>,
    idle_rx: Receiver<Session>,
    open: AtomicUsize,
    opts: Opts,
    cfg: PoolConfig,
}

impl Pool {
    /// Open the pool: warm `init_conns` sessions and verify that every
    /// backing table is present in the database.
    ///
    /// Schema creation itself happens out-of-band (see `schema.sql`); a
    /// missing table is a startup failure, not something to repair here.
    pub fn init(opts: Opts, cfg: PoolConfig, tables: &TableSet) -> Result<Pool> {
        let (idle_tx, idle_rx) = bounded(cfg.max_idling_conns.max(1));
        let pool = Pool {
            idle_tx,
            idle_rx,
            open: AtomicUsize::new(0),
            opts,
            cfg,
        };

        let mut first = pool.open_session()?;
        verify_schema(first.conn(), tables)?;
        pool.park(first);
        for _ in 1..pool.cfg.init_conns {
            let sess = pool.open_session()?;
            pool.park(sess);
        }
        Ok(pool)
    }

    /// Borrow a session for the duration of one callback.
    ///
    /// Returns the first idle session, or opens a new one below the ceiling.
    /// At the ceiling, waits up to the configured deadline for a release.
    pub fn acquire(&self) -> Result<PooledSession<'_>> {
        if let Ok(sess) = self.idle_rx.try_recv() {
            return Ok(PooledSession::new(self, self.revive(sess)?));
        }

        match self.open_session() {
            Ok(sess) => return Ok(PooledSession::new(self, sess)),
            Err(FsError::PoolExhausted) => {}
            Err(e) => return Err(e),
        }

        match self.idle_rx.recv_timeout(self.cfg.acquire_timeout) {
            Ok(sess) => Ok(PooledSession::new(self, self.revive(sess)?)),
            Err(_) => {
                log::error!(
                    "session pool exhausted: {} connections open, none released within {:?}",
                    self.open.load(Ordering::SeqCst),
                    self.cfg.acquire_timeout
                );
                Err(FsError::PoolExhausted)
            }
        }
    }

    /// Number of connections currently open, idle or borrowed.
    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Ensure an idle session is usable, replacing it if the server hung up.
    fn revive(&self, mut sess: Session) -> Result<Session> {
        if sess.is_alive() {
            return Ok(sess);
        }
        log::warn!("discarding dead database session");
        drop(sess);
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.open_session()
    }

    /// Open a fresh session, first reserving a slot under the ceiling.
    fn open_session(&self) -> Result<Session> {
        let mut current = self.open.load(Ordering::SeqCst);
        loop {
            if current >= self.cfg.max_open_conns {
                return Err(FsError::PoolExhausted);
            }
            match self.open.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
        match Session::connect(&self.opts) {
            Ok(sess) => Ok(sess),
            Err(e) => {
                self.open.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Return a session to the idle queue, or close it when the queue is
    /// already at capacity.
    fn park(&self, sess: Session) {
        if self.idle_tx.try_send(sess).is_err() {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// RAII guard around a borrowed [`Session`]; dropping it is the release.
#[derive(Debug)]
pub struct PooledSession<'a> {
    pool: &'a Pool,
    sess: Option<Session>,
}

impl<'a> PooledSession<'a> {
    fn new(pool: &'a Pool, sess: Session) -> PooledSession<'a> {
        PooledSession {
            pool,
            sess: Some(sess),
        }
    }
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.sess.as_ref().expect("session taken before drop")
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.sess.as_mut().expect("session taken before drop")
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(sess) = self.sess.take() {
            self.pool.park(sess);
        }
    }
}

/// Check that every backing table answers a trivial SELECT.
fn verify_schema(conn: &mut Conn, tables: &TableSet) -> Result<()> {
    for table in tables.all() {
        conn.query_drop(format!("SELECT 1 FROM {} LIMIT 1", table))
            .map_err(|e| {
                log::error!("schema check failed for table {}: {}", table, e);
                FsError::Db(e)
            })?;
    }
    Ok(())
}
