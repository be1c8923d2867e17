use std::sync::Arc;
use log::warn;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How far cancellation has escalated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelLevel {
    None,
    Soft,
    Hard,
}

impl CancelLevel {
    fn escalated(self) -> Self {
        match self {
            CancelLevel::None => CancelLevel::Soft,
            CancelLevel::Soft | CancelLevel::Hard => CancelLevel::Hard,
        }
    }
}

/// Cloneable handle on the run's cancellation state
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<CancelLevel>>,
    rx: watch::Receiver<CancelLevel>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(CancelLevel::None);
        Self { tx: Arc::new(tx), rx }
    }

    /// Current level
    pub fn level(&self) -> CancelLevel {
        *self.rx.borrow()
    }

    /// True once at least a soft stop has been requested
    pub fn is_cancelled(&self) -> bool {
        self.level() >= CancelLevel::Soft
    }

    /// True once a hard stop has been requested
    pub fn is_hard(&self) -> bool {
        self.level() >= CancelLevel::Hard
    }

    /// Raise the level to at least `level`. Levels never go down.
    pub fn request(&self, level: CancelLevel) {
        self.tx.send_modify(|current| {
            if level > *current {
                *current = level;
            }
        });
    }

    /// Move one step up (None -> Soft -> Hard) and return the new level
    pub fn escalate(&self) -> CancelLevel {
        let mut next = CancelLevel::None;
        self.tx.send_modify(|current| {
            *current = current.escalated();
            next = *current;
        });
        next
    }

    /// Resolve once the level reaches `level`.
    ///
    /// Waiting on `CancelLevel::None` resolves immediately.
    pub async fn reached(&self, level: CancelLevel) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|current| *current >= level).await.is_err() {
            // Sender gone: the level can no longer change
            std::future::pending::<()>().await;
        }
    }
}

/// Escalate `token` on every SIGINT (and SIGTERM on unix)
pub fn install_signal_handlers(token: CancelToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                None
            }
        };

        loop {
            #[cfg(unix)]
            {
                let term = async {
                    match terminate.as_mut() {
                        Some(s) => {
                            s.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    r = tokio::signal::ctrl_c() => {
                        if r.is_err() {
                            warn!("Ctrl+C handler failed; interrupts are no longer observed");
                            return;
                        }
                    }
                    _ = term => {}
                }
            }
            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_err() {
                    warn!("Ctrl+C handler failed; interrupts are no longer observed");
                    return;
                }
            }

            match token.escalate() {
                CancelLevel::Soft => warn!(
                    "⏸️  Interruption received: finishing the current file's last chunk if possible, then stopping (interrupt again to abort now)"
                ),
                _ => warn!("🛑 Second interruption: aborting the current encode"),
            }
        }
    })
}
