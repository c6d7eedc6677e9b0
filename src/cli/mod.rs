//! # Command-line surface
//!
//! `clap`-derived argument parsing and the four subcommand handlers
//! (`mkfs`/`mount`/`umount`/`fsck`, SPEC_FULL.md §4.7) that tie together the
//! backend driver, crypto/compression wrappers, metadata lifecycle, block
//! cache and `fuser` adapter into a runnable binary.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use fuser::MountOption;

use crate::backend::crypto_wrap::EncryptingBackend;
use crate::backend::local::LocalBackend;
use crate::backend::Backend;
use crate::block_cache::BlockCache;
use crate::compression::Algorithm;
use crate::crypto::{DataKey, WrappedDataKey};
use crate::fs::{FuseAdapter, MountConfig, Operations};
use crate::metadata::{lifecycle, mkfs as mkfs_mod, Lifecycle};

const PASSPHRASE_KEY: &str = "s3ql_passphrase";

#[derive(Parser)]
#[command(name = "s3ql", version, about = "A FUSE filesystem backed by a content-addressed object store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Initialize a fresh backend.
    Mkfs {
        storage_url: String,
        #[arg(long, default_value_t = 131072)]
        blocksize: u64,
        #[arg(long, default_value = "")]
        label: String,
        #[arg(long)]
        force: bool,
    },
    /// Mount a filesystem.
    Mount {
        storage_url: String,
        mountpoint: PathBuf,
        #[arg(long)]
        cachesize: Option<u64>,
        #[arg(long)]
        max_cache_entries: Option<usize>,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long, default_value = "lzma")]
        compress: CompressArg,
        #[arg(long)]
        metadata_upload_interval: Option<u64>,
        #[arg(long)]
        nfs: bool,
        #[arg(long)]
        fg: bool,
        #[arg(long, conflicts_with = "allow_root")]
        allow_other: bool,
        #[arg(long)]
        allow_root: bool,
        #[arg(long)]
        batch: bool,
    },
    /// Unmount a filesystem mounted with `mount`.
    Umount { mountpoint: PathBuf },
    /// Check a filesystem's metadata against its backend for consistency.
    Fsck {
        storage_url: String,
        #[arg(long)]
        batch: bool,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CompressArg {
    None,
    Zlib,
    Bzip2,
    Lzma,
}

impl From<CompressArg> for Algorithm {
    fn from(a: CompressArg) -> Algorithm {
        match a {
            CompressArg::None => Algorithm::None,
            CompressArg::Zlib => Algorithm::Zlib,
            CompressArg::Bzip2 => Algorithm::Bzip2,
            CompressArg::Lzma => Algorithm::Lzma,
        }
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Mkfs { storage_url, blocksize, label, force } => cmd_mkfs(&storage_url, blocksize, label, force).await,
        Command::Mount {
            storage_url,
            mountpoint,
            cachesize,
            max_cache_entries,
            threads,
            compress,
            metadata_upload_interval,
            nfs,
            fg,
            allow_other,
            allow_root,
            batch,
        } => {
            cmd_mount(MountArgs {
                storage_url,
                mountpoint,
                cachesize,
                max_cache_entries,
                threads,
                compress: compress.into(),
                metadata_upload_interval,
                nfs,
                fg,
                allow_other,
                allow_root,
                batch,
            })
            .await
        }
        Command::Umount { mountpoint } => cmd_umount(&mountpoint).await,
        Command::Fsck { storage_url, batch, force } => cmd_fsck(&storage_url, batch, force).await,
    }
}

/// `local://<path>` is the only scheme this build can actually open; the
/// others are recognized (so the CLI surface matches the full `storage-url`
/// grammar) but refuse with [`crate::backend::BackendError::Unsupported`]
/// (SPEC_FULL.md §4.1 Non-goals).
fn open_backend(storage_url: &str) -> anyhow::Result<Arc<dyn Backend>> {
    if let Some(path) = storage_url.strip_prefix("local://") {
        return Ok(Arc::new(LocalBackend::new(path)?));
    }
    for scheme in ["s3://", "s3c://", "swift://", "gs://", "azure://"] {
        if storage_url.starts_with(scheme) {
            anyhow::bail!(crate::backend::BackendError::Unsupported(scheme.trim_end_matches("://").to_string()));
        }
    }
    anyhow::bail!("unrecognized storage-url {storage_url:?}; expected a local://<path> URL");
}

/// The cache directory a mount of `storage_url` uses, derived from its
/// content so repeated mounts of the same backend reuse the same local
/// state. Rooted under `dirs::cache_dir()`, falling back to `.s3ql_cache` in
/// the current directory if the platform doesn't expose one.
fn cache_dir_for(storage_url: &str) -> PathBuf {
    let root = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    let digest = blake3::hash(storage_url.as_bytes());
    root.join("s3ql").join(digest.to_hex().as_str())
}

fn read_line() -> anyhow::Result<String> {
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// No terminal-echo-suppression crate is in this stack, so the prompt falls
/// back to `S3QL_PASSPHRASE` when set (scripted/batch use) and otherwise
/// reads a plain line from stdin.
fn read_existing_passphrase(batch: bool) -> anyhow::Result<String> {
    if let Ok(p) = std::env::var("S3QL_PASSPHRASE") {
        return Ok(p);
    }
    if batch {
        anyhow::bail!("--batch given but S3QL_PASSPHRASE is not set");
    }
    print!("Enter passphrase: ");
    std::io::stdout().flush()?;
    read_line()
}

fn read_new_passphrase(batch: bool) -> anyhow::Result<String> {
    if let Ok(p) = std::env::var("S3QL_PASSPHRASE") {
        return Ok(p);
    }
    if batch {
        anyhow::bail!("--batch given but S3QL_PASSPHRASE is not set");
    }
    print!("Enter new passphrase: ");
    std::io::stdout().flush()?;
    let first = read_line()?;
    print!("Confirm passphrase: ");
    std::io::stdout().flush()?;
    let second = read_line()?;
    if first != second {
        anyhow::bail!("passphrases don't match");
    }
    Ok(first)
}

async fn fetch_and_unwrap_key(backend: &dyn Backend, passphrase: &str) -> anyhow::Result<DataKey> {
    let mut rh = backend.open_read(PASSPHRASE_KEY).await?;
    let mut body = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut rh.stream, &mut body).await?;
    let wrapped: WrappedDataKey = bincode::deserialize(&body)?;
    Ok(wrapped.unwrap(passphrase)?)
}

async fn cmd_mkfs(storage_url: &str, blocksize: u64, label: String, force: bool) -> anyhow::Result<()> {
    let backend = open_backend(storage_url)?;
    let passphrase = read_new_passphrase(false)?;
    let data_key = DataKey::generate();
    let cache_dir = cache_dir_for(storage_url);
    let local_db_path = cache_dir.join("metadata.db");

    if force {
        mkfs_mod::mkfs_forced(backend, data_key, passphrase, label, blocksize, true, &local_db_path).await?;
    } else {
        mkfs_mod::mkfs(backend, data_key, passphrase, label, blocksize, &local_db_path).await?;
    }

    log::info!("mkfs complete for {storage_url} at {}", format_epoch(crate::util::time::now_epoch()));
    Ok(())
}

struct MountArgs {
    storage_url: String,
    mountpoint: PathBuf,
    cachesize: Option<u64>,
    max_cache_entries: Option<usize>,
    threads: Option<usize>,
    compress: Algorithm,
    metadata_upload_interval: Option<u64>,
    nfs: bool,
    fg: bool,
    allow_other: bool,
    allow_root: bool,
    batch: bool,
}

async fn cmd_mount(args: MountArgs) -> anyhow::Result<()> {
    if !args.fg {
        log::info!("no daemonizing crate in this stack; staying in the foreground regardless of --fg");
    }

    let backend = open_backend(&args.storage_url)?;
    let passphrase = read_existing_passphrase(args.batch)?;
    let data_key = fetch_and_unwrap_key(backend.as_ref(), &passphrase).await?;
    let cache_dir = cache_dir_for(&args.storage_url);

    let (lifecycle, db) = Lifecycle::mount(backend.clone(), data_key.clone(), args.compress, cache_dir.clone()).await?;
    let db = Arc::new(db);

    let blocksize = lifecycle.params.blocksize as i64;
    let encrypting_backend: Arc<dyn Backend> = Arc::new(EncryptingBackend::new(backend.clone(), data_key, args.compress));
    let cache_bytes = args.cachesize.unwrap_or(768 * 1024) * 1024;
    let max_entries = args.max_cache_entries.unwrap_or(100);
    let threads = args
        .threads
        .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));
    let block_cache = Arc::new(
        BlockCache::new(cache_dir.join("blocks"), max_entries, cache_bytes, threads, encrypting_backend, db.clone())
            .await?,
    );

    let mut config = MountConfig::default();
    config.nfs_mode = args.nfs;
    config.blocksize = blocksize;
    let ops = Arc::new(Operations::new(db.clone(), block_cache, config));

    let runtime = tokio::runtime::Handle::current();
    let adapter = FuseAdapter::new(ops.clone(), runtime);

    let mut options = vec![MountOption::FSName("s3ql".to_string())];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }
    if args.allow_root {
        options.push(MountOption::AllowRoot);
    }

    let lifecycle = Arc::new(tokio::sync::Mutex::new(Some(lifecycle)));
    let upload_interval = Duration::from_secs(args.metadata_upload_interval.unwrap_or(24 * 3600));
    let periodic_handle = {
        let lifecycle = lifecycle.clone();
        let db = db.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(upload_interval).await;
                let mut guard = lifecycle.lock().await;
                match guard.as_mut() {
                    Some(lc) => {
                        if let Err(e) = lc.periodic_upload(&db).await {
                            log::error!("periodic metadata upload failed: {e}");
                        }
                    }
                    None => break,
                }
            }
        })
    };

    log::info!("mounting {} at {}", args.storage_url, args.mountpoint.display());
    let mountpoint = args.mountpoint.clone();
    tokio::task::spawn_blocking(move || fuser::mount2(adapter, &mountpoint, &options)).await??;
    log::info!("fuse session ended, unmounting");

    periodic_handle.abort();

    Arc::try_unwrap(ops)
        .map_err(|_| anyhow::anyhow!("operations handle still has outstanding references at unmount"))?
        .destroy()
        .await?;

    if let Some(lc) = lifecycle.lock().await.take() {
        lc.unmount(&db).await?;
    }
    db.close().await;

    Ok(())
}

/// Shells out to `fusermount -u`; this crate doesn't track which process
/// owns a given mountpoint across invocations, so there's nothing local to
/// clean up beyond asking the kernel to tear the FUSE session down.
async fn cmd_umount(mountpoint: &std::path::Path) -> anyhow::Result<()> {
    let status = tokio::process::Command::new("fusermount").arg("-u").arg(mountpoint).status().await?;
    if !status.success() {
        anyhow::bail!("fusermount -u {} failed with {status}", mountpoint.display());
    }
    Ok(())
}

async fn cmd_fsck(storage_url: &str, batch: bool, force: bool) -> anyhow::Result<()> {
    let backend = open_backend(storage_url)?;
    let passphrase = read_existing_passphrase(batch)?;
    let data_key = fetch_and_unwrap_key(backend.as_ref(), &passphrase).await?;
    let cache_dir = cache_dir_for(storage_url);
    let db_path = cache_dir.join("metadata.db");
    let params_path = cache_dir.join(".params");

    let remote_seq_no = lifecycle::backend_seq_no(backend.as_ref()).await?;
    if remote_seq_no == 0 {
        anyhow::bail!("no seq_no markers found on backend; has mkfs been run?");
    }

    let have_local_cache = tokio::fs::try_exists(&db_path).await.unwrap_or(false);
    if !have_local_cache && !force {
        anyhow::bail!(
            "no local metadata cache found for this backend; mount it at least once, \
             or pass --force to download a fresh snapshot"
        );
    }

    let params = if force || !have_local_cache {
        lifecycle::download_and_rebuild(backend.as_ref(), &data_key, &db_path).await?
    } else {
        crate::metadata::Params::from_bytes(&tokio::fs::read(&params_path).await?)?
    };
    let compress = params_compression(&params);
    let previous_fsck = format_epoch(params.last_fsck);

    let report = crate::metadata::fsck::run(&db_path, backend.as_ref(), &data_key, compress, params).await?;

    if report.is_clean() {
        log::info!(
            "fsck: clean ({} dangling extents removed, {} orphan objects deleted, previous fsck was {previous_fsck})",
            report.dangling_extents_removed,
            report.orphan_objects_deleted
        );
    } else {
        for err in &report.integrity_errors {
            log::error!("fsck: {err}");
        }
        anyhow::bail!("fsck found uncorrectable errors");
    }

    Ok(())
}

/// `Params` doesn't carry its own compression tag (that travels on the
/// backend object, recovered at download time); a standalone `fsck` run
/// that hasn't just downloaded a snapshot falls back to the codec `mkfs`
/// defaults new filesystems to.
fn params_compression(_params: &crate::metadata::Params) -> Algorithm {
    Algorithm::default()
}

/// UTC epoch seconds as stored in `Params`, formatted for CLI output only.
/// Everything internal compares raw epoch integers; this is the one place
/// that needs a calendar.
fn format_epoch(epoch: i64) -> String {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| epoch.to_string())
}
