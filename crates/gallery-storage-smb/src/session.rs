//! SMB session owned by a dedicated worker thread.
//!
//! libsmbclient contexts are blocking and not safe to share between threads,
//! so the client lives on one OS thread and every operation is shipped to it
//! as a job. Jobs run one at a time, which serializes all calls against the
//! share session.

use std::sync::{mpsc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use gallery_storage_core::{SmbSpec, StorageError};
use pavao::{SmbClient, SmbCredentials, SmbOptions};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce(&SmbClient) + Send>;

pub struct SmbSession {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    label: String,
}

impl SmbSession {
    /// Spawn the worker, open the share and check it with a root listing.
    /// Resolves once that listing finishes; the caller bounds the wait.
    pub async fn open(spec: &SmbSpec) -> Result<Self, StorageError> {
        let label = format!("{}:{}/{}", spec.ip, spec.port, spec.service_name);
        let credentials = SmbCredentials::default()
            .server(format!("smb://{}:{}", spec.ip, spec.port))
            .share(format!("/{}", spec.service_name))
            .username(spec.username.as_str())
            .password(spec.password.expose())
            .workgroup(spec.domain.as_str());
        let options = SmbOptions::default()
            .case_sensitive(true)
            .one_share_per_server(true);

        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), StorageError>>();
        let thread_label = label.clone();

        let worker = std::thread::Builder::new()
            .name(format!("smb-{}", spec.ip))
            .spawn(move || {
                let client = match SmbClient::new(credentials, options) {
                    Ok(client) => client,
                    Err(e) => {
                        let _ = ready_tx.send(Err(StorageError::Connection(format!(
                            "SMB client init for {} failed: {}",
                            thread_label, e
                        ))));
                        return;
                    }
                };

                if let Err(e) = client.list_dir("/") {
                    let _ = ready_tx.send(Err(map_session_error(&e.to_string(), &thread_label)));
                    return;
                }
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }

                while let Ok(job) = job_rx.recv() {
                    job(&client);
                }
                debug!("SMB worker for {} exiting", thread_label);
            })
            .map_err(|e| StorageError::Connection(format!("Failed to spawn SMB worker: {}", e)))?;

        ready_rx.await.map_err(|_| {
            StorageError::Connection(format!("SMB worker for {} stopped during connect", label))
        })??;

        info!("Connected to SMB share {}", label);
        Ok(Self {
            jobs: Mutex::new(Some(job_tx)),
            worker: Mutex::new(Some(worker)),
            label,
        })
    }

    /// Run `f` against the client on the worker thread.
    pub async fn run<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&SmbClient) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |client| {
            let _ = tx.send(f(client));
        });

        {
            let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            let sender = jobs.as_ref().ok_or_else(|| {
                StorageError::Connection(format!("SMB session {} is closed", self.label))
            })?;
            sender.send(job).map_err(|_| {
                StorageError::Connection(format!("SMB worker for {} has stopped", self.label))
            })?;
        }

        rx.await.map_err(|_| {
            StorageError::Connection(format!("SMB worker for {} dropped the request", self.label))
        })?
    }

    /// Stop the worker. Dropping the client closes the share connection.
    ///
    /// Waits at most `wait` for the worker to finish its current job; past
    /// that the thread is left to exit on its own once libsmbclient returns.
    pub async fn close(&self, wait: Duration) -> Result<(), StorageError> {
        let sender = self.jobs.lock().unwrap_or_else(|p| p.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        drop(sender);

        if let Some(worker) = worker {
            let label = self.label.clone();
            let joined = tokio::task::spawn_blocking(move || {
                if worker.join().is_err() {
                    warn!("SMB worker for {} panicked", label);
                }
            });
            match tokio::time::timeout(wait, joined).await {
                Ok(Ok(())) => info!("Closed SMB session {}", self.label),
                Ok(Err(e)) => {
                    return Err(StorageError::Connection(format!(
                        "SMB worker join failed: {}",
                        e
                    )))
                }
                Err(_) => {
                    return Err(StorageError::Connection(format!(
                        "SMB worker for {} still busy after {}s; detached",
                        self.label,
                        wait.as_secs()
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Classify a libsmbclient failure raised while opening the share.
pub fn map_session_error(message: &str, label: &str) -> StorageError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission denied")
        || lower.contains("access denied")
        || lower.contains("logon failure")
    {
        StorageError::Auth(format!("SMB login to {} rejected: {}", label, message))
    } else {
        StorageError::Connection(format!("SMB connect to {} failed: {}", label, message))
    }
}

/// Whether a libsmbclient failure means the path does not exist.
pub fn is_not_found(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("no such file") || lower.contains("not found") || lower.contains("enoent")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_session_error() {
        assert!(matches!(
            map_session_error("Permission denied (os error 13)", "nas"),
            StorageError::Auth(_)
        ));
        assert!(matches!(
            map_session_error("Connection refused (os error 111)", "nas"),
            StorageError::Connection(_)
        ));
    }

    #[tokio::test]
    async fn test_close_stops_waiting_for_busy_worker() {
        let (jobs, _rx) = mpsc::channel::<Job>();
        let worker = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(500)));
        let session = SmbSession {
            jobs: Mutex::new(Some(jobs)),
            worker: Mutex::new(Some(worker)),
            label: "nas:445/share".to_string(),
        };

        let started = std::time::Instant::now();
        let err = session.close(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, StorageError::Connection(_)));
        assert!(started.elapsed() < Duration::from_millis(400));

        // Already detached: closing again is a no-op and the session is unusable.
        session.close(Duration::from_millis(50)).await.unwrap();
        assert!(matches!(
            session.run(|_| Ok(())).await,
            Err(StorageError::Connection(_))
        ));
    }

    #[test]
    fn test_is_not_found() {
        assert!(is_not_found("No such file or directory (os error 2)"));
        assert!(!is_not_found("Permission denied"));
    }
}
