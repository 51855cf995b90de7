//! X.509 sources backed by files on disk or by memory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::identity::{IdentityError, TrustBundle, X509Source, X509Svid};

pub const SVID_FILE: &str = "svid.pem";
pub const SVID_KEY_FILE: &str = "svid_key.pem";
pub const BUNDLE_FILE: &str = "svid_bundle.pem";

/// Fixed identity, for embedding and tests.
#[derive(Debug)]
pub struct StaticSource {
    svid: Arc<X509Svid>,
    bundle: Arc<TrustBundle>,
}

impl StaticSource {
    pub fn new(svid: X509Svid, bundle: TrustBundle) -> Self {
        Self {
            svid: Arc::new(svid),
            bundle: Arc::new(bundle),
        }
    }
}

impl X509Source for StaticSource {
    fn svid(&self) -> Arc<X509Svid> {
        Arc::clone(&self.svid)
    }

    fn bundle(&self) -> Arc<TrustBundle> {
        Arc::clone(&self.bundle)
    }
}

/// Identity written to a directory by a workload identity helper.
///
/// The directory is watched; whenever the helper rewrites the files the new
/// material replaces the current one. A rewrite that fails to parse keeps the
/// previous SVID in place.
pub struct PemFileSource {
    dir: PathBuf,
    svid: ArcSwap<X509Svid>,
    bundle: ArcSwap<TrustBundle>,
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl PemFileSource {
    /// Wait until the helper has issued an SVID and return a source that
    /// follows its rotation.
    ///
    /// There is no timeout: issuance can legitimately take a while. A missing
    /// directory or malformed material fails immediately.
    pub async fn acquire(dir: &Path) -> Result<Arc<Self>, IdentityError> {
        if !dir.is_dir() {
            return Err(IdentityError::MissingDirectory(dir.to_path_buf()));
        }

        // Watch before the first load so a write between the two is not missed.
        let (changes_tx, mut changes) = mpsc::unbounded_channel();
        let watcher = watch_dir(dir, changes_tx)?;

        let (svid, bundle) = loop {
            match load(dir) {
                Ok(material) => break material,
                Err(e) if e.is_pending() => {
                    tracing::info!(dir = %dir.display(), reason = %e, "Waiting for X.509 SVID to be issued");
                    if changes.recv().await.is_none() {
                        return Err(IdentityError::WatcherClosed);
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let source = Arc::new(Self {
            dir: dir.to_path_buf(),
            svid: ArcSwap::from_pointee(svid),
            bundle: ArcSwap::from_pointee(bundle),
            _watcher: Mutex::new(Some(watcher)),
        });

        tokio::spawn(follow_rotation(Arc::downgrade(&source), changes));
        Ok(source)
    }

    /// Re-read the files now.
    pub fn reload(&self) -> Result<(), IdentityError> {
        let (svid, bundle) = load(&self.dir)?;
        tracing::info!(spiffe_id = %svid.id(), expires_at = ?svid.expires_at(), "X.509 SVID updated");
        self.svid.store(Arc::new(svid));
        self.bundle.store(Arc::new(bundle));
        Ok(())
    }
}

impl X509Source for PemFileSource {
    fn svid(&self) -> Arc<X509Svid> {
        self.svid.load_full()
    }

    fn bundle(&self) -> Arc<TrustBundle> {
        self.bundle.load_full()
    }
}

async fn follow_rotation(source: Weak<PemFileSource>, mut changes: mpsc::UnboundedReceiver<()>) {
    while changes.recv().await.is_some() {
        // Writers replace three files in a row; let them finish.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while changes.try_recv().is_ok() {}

        let Some(source) = source.upgrade() else {
            return;
        };
        if let Err(e) = source.reload() {
            tracing::warn!(error = %e, "Failed to reload X.509 SVID. Keeping current identity.");
        }
    }
}

fn watch_dir(
    dir: &Path,
    changes: mpsc::UnboundedSender<()>,
) -> Result<RecommendedWatcher, IdentityError> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = changes.send(());
                }
            }
            Err(e) => tracing::error!("Watch error: {:?}", e),
        },
        Config::default().with_poll_interval(Duration::from_secs(2)),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    tracing::debug!(dir = %dir.display(), "Identity watcher started");
    Ok(watcher)
}

fn load(dir: &Path) -> Result<(X509Svid, TrustBundle), IdentityError> {
    let cert = read(&dir.join(SVID_FILE))?;
    let key = read(&dir.join(SVID_KEY_FILE))?;
    let bundle = read(&dir.join(BUNDLE_FILE))?;
    Ok((X509Svid::from_pem(&cert, &key)?, TrustBundle::from_pem(&bundle)?))
}

fn read(path: &Path) -> Result<Vec<u8>, IdentityError> {
    std::fs::read(path).map_err(|source| IdentityError::Read {
        path: path.to_path_buf(),
        source,
    })
}
