//! Command implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use imgup_hasher::{ContentHash, ProgressFn, SourceFile};
use imgup_session_store::{SessionStore, UploadOptions, UploadSession, default_session_dir};
use imgup_worker_pool::{PoolConfig, WorkerPool};
use tracing::{debug, info};

use crate::config::{CliConfig, default_config_path};

/// Shared state for one CLI invocation.
pub struct Context {
    config: CliConfig,
    pool: Arc<WorkerPool>,
}

impl Context {
    pub fn new(config: CliConfig) -> Self {
        let pool = WorkerPool::new(PoolConfig {
            max_workers: config.max_workers,
        });
        Self {
            config,
            pool: Arc::new(pool),
        }
    }

    fn session_dir(&self) -> Result<PathBuf> {
        self.config
            .session_dir
            .clone()
            .or_else(default_session_dir)
            .context("cannot determine session directory, pass --session-dir")
    }

    fn store(&self) -> Result<SessionStore> {
        Ok(SessionStore::open(self.session_dir()?).with_ttl(self.config.session_ttl()))
    }
}

fn log_progress(path: &std::path::Path) -> ProgressFn {
    let path = path.display().to_string();
    Box::new(move |percent| debug!(path = %path, percent, "hashing"))
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

pub async fn hash(ctx: &Context, paths: Vec<PathBuf>) -> Result<()> {
    let handles: Vec<_> = paths
        .into_iter()
        .map(|path| {
            let pool = Arc::clone(&ctx.pool);
            tokio::spawn(async move {
                let progress = log_progress(&path);
                let digest = pool.digest(&path, Some(progress)).await;
                (path, digest)
            })
        })
        .collect();

    for handle in handles {
        let (path, digest) = handle.await?;
        let digest = digest.with_context(|| format!("failed to hash {}", path.display()))?;
        println!("{digest}  {}", path.display());
    }
    Ok(())
}

pub async fn split(
    ctx: &Context,
    path: PathBuf,
    chunk_size: Option<u64>,
    track: bool,
) -> Result<()> {
    let chunk_size = chunk_size.unwrap_or(ctx.config.chunk_size);
    let (digest, chunks) = tokio::try_join!(
        ctx.pool.digest(&path, Some(log_progress(&path))),
        ctx.pool.split(&path, chunk_size, None),
    )
    .with_context(|| format!("failed to split {}", path.display()))?;

    let session = if track {
        Some(open_session(ctx, &path, digest.clone(), chunk_size)?)
    } else {
        None
    };

    println!("{digest}  {}", path.display());
    for chunk in &chunks {
        let status = match &session {
            Some(s) if s.uploaded_chunks.contains(&chunk.index) => "uploaded",
            Some(_) => "pending",
            None => "",
        };
        println!(
            "{:>5}  {:>12}  {:>12}  {}  {status}",
            chunk.index, chunk.start, chunk.end, chunk.digest
        );
    }
    if let Some(session) = session {
        println!("session {}", session.id);
    }
    Ok(())
}

/// Resumes a session for the same content and chunk size, or starts one.
fn open_session(
    ctx: &Context,
    path: &std::path::Path,
    digest: ContentHash,
    chunk_size: u64,
) -> Result<UploadSession> {
    let store = ctx.store()?;
    let source = SourceFile::open(path)?;

    if let Some(existing) = store.find_by_content(&digest, source.size)
        && existing.chunk_size == chunk_size
    {
        info!(
            id = %existing.id,
            remaining = existing.remaining_chunks().len(),
            "resuming upload session"
        );
        return Ok(existing);
    }

    let session = UploadSession::new(&source, digest, chunk_size, UploadOptions::default());
    info!(id = %session.id, total_chunks = session.total_chunks, "upload session created");
    Ok(store.save(&session).unwrap_or(session))
}

pub async fn verify(ctx: &Context, path: PathBuf, expected: ContentHash) -> Result<()> {
    let matches = ctx
        .pool
        .verify(&path, expected, Some(log_progress(&path)))
        .await
        .with_context(|| format!("failed to verify {}", path.display()))?;
    if !matches {
        anyhow::bail!("{}: digest mismatch", path.display());
    }
    println!("{}: OK", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub fn sessions_list(ctx: &Context, all: bool) -> Result<()> {
    let store = ctx.store()?;
    let sessions = if all {
        store.list_all()
    } else {
        store.list_resumable()
    };

    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for s in &sessions {
        println!(
            "{}  {:>4}/{:<4} {:>5.1}%  {}  {}",
            s.id,
            s.uploaded_chunks.len(),
            s.total_chunks,
            s.progress_percent(),
            s.last_activity.format("%Y-%m-%d %H:%M:%S"),
            s.file_name,
        );
    }
    Ok(())
}

pub fn sessions_show(ctx: &Context, id: &str) -> Result<()> {
    let session = ctx
        .store()?
        .get(id)
        .with_context(|| format!("no such session: {id}"))?;
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

pub fn sessions_ack(ctx: &Context, id: &str, chunks: &[u64]) -> Result<()> {
    let session = ctx
        .store()?
        .update_progress(id, chunks)
        .with_context(|| format!("no such session: {id}"))?;
    println!(
        "{}: {}/{} chunks uploaded",
        session.id,
        session.uploaded_chunks.len(),
        session.total_chunks
    );
    Ok(())
}

pub fn sessions_remove(ctx: &Context, id: &str) -> Result<()> {
    if !ctx.store()?.remove(id) {
        anyhow::bail!("no such session: {id}");
    }
    Ok(())
}

pub fn sessions_sweep(ctx: &Context) -> Result<()> {
    let swept = ctx.store()?.sweep_expired();
    println!("{swept} expired session(s) removed");
    Ok(())
}

pub fn sessions_clear(ctx: &Context) -> Result<()> {
    ctx.store()?.clear_all();
    println!("all sessions removed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub fn status(ctx: &Context) -> Result<()> {
    ctx.pool.initialize();
    let session_dir = ctx.session_dir().ok();
    let resumable = match &session_dir {
        Some(_) => ctx.store()?.list_resumable().len(),
        None => 0,
    };

    let report = serde_json::json!({
        "configPath": default_config_path(),
        "config": ctx.config,
        "pool": ctx.pool.status(),
        "sessionDir": session_dir,
        "resumableSessions": resumable,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
