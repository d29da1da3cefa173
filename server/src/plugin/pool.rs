use log::{debug, error, trace, warn};
use nms_shared::bus::DATA_CHANNEL_CAPACITY;
use nms_shared::os::stopper::Stopper;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

/// One batched invocation of a plugin binary: the whole task list is
/// marshalled to a single JSON document on stdin.
#[derive(Debug)]
pub struct PluginJob<T> {
    pub binary: PathBuf,
    pub tasks: Vec<T>,
}

/// Submission handle for a pool of subprocess workers. Cloned freely;
/// `submit` blocks once the job buffer is full, which is the natural
/// backpressure on the scheduler and discovery service.
pub struct PluginPool<T> {
    jobs: mpsc::Sender<PluginJob<T>>,
}

impl<T> Clone for PluginPool<T> {
    fn clone(&self) -> Self {
        PluginPool {
            jobs: self.jobs.clone(),
        }
    }
}

impl<T: Serialize + Send + Sync + 'static> PluginPool<T> {
    /// Starts `workers` worker tasks over a bounded job channel of size
    /// `buffer`. Every worker appends `extra_args` (e.g. `-discovery`) to
    /// each invocation. Results from all workers share one channel, which
    /// closes only after every worker has drained its in-flight subprocess
    /// and exited.
    pub fn start<R: DeserializeOwned + Send + 'static>(
        name: &'static str,
        workers: usize,
        buffer: usize,
        extra_args: Vec<String>,
        stopper: Stopper,
    ) -> (PluginPool<T>, mpsc::Receiver<Vec<R>>) {
        let (job_tx, job_rx) = mpsc::channel(buffer.max(1));
        let (result_tx, result_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let shared_jobs = Arc::new(Mutex::new(job_rx));
        for index in 0..workers.max(1) {
            let jobs = shared_jobs.clone();
            let results = result_tx.clone();
            let args = extra_args.clone();
            let stopper = stopper.clone();
            tokio::spawn(worker_loop(name, index, jobs, results, args, stopper));
        }
        (PluginPool { jobs: job_tx }, result_rx)
    }

    pub async fn submit(&self, job: PluginJob<T>) -> anyhow::Result<()> {
        self.jobs
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("plugin pool is shut down"))
    }
}

async fn worker_loop<T: Serialize, R: DeserializeOwned>(
    name: &'static str,
    index: usize,
    jobs: Arc<Mutex<mpsc::Receiver<PluginJob<T>>>>,
    results: mpsc::Sender<Vec<R>>,
    extra_args: Vec<String>,
    stopper: Stopper,
) {
    loop {
        // The lock is held only while waiting for the next job; execution
        // happens outside it so workers run batches concurrently.
        let job = {
            let mut jobs = jobs.lock().await;
            tokio::select! {
                _ = stopper.stopped() => None,
                job = jobs.recv() => job,
            }
        };
        let Some(job) = job else {
            trace!("worker_loop - {} worker {} exiting", name, index);
            return;
        };
        let batch = execute(&job.binary, &extra_args, &job.tasks).await;
        if results.send(batch).await.is_err() {
            return;
        }
    }
}

/// Runs one batch through one subprocess. Spawn failures, stdio errors,
/// non-zero exits and unparseable stdout all collapse to an empty result
/// slice; partial batches are never produced.
async fn execute<T: Serialize, R: DeserializeOwned>(
    binary: &Path,
    extra_args: &[String],
    tasks: &[T],
) -> Vec<R> {
    let payload = match serde_json::to_vec(tasks) {
        Ok(payload) => payload,
        Err(e) => {
            error!("execute - failed to encode {} tasks: {}", tasks.len(), e);
            return Vec::new();
        }
    };
    let mut child = match Command::new(binary)
        .args(extra_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!("execute - failed to spawn {}: {}", binary.display(), e);
            return Vec::new();
        }
    };
    // Feed stdin from its own task so a child that floods stdout before
    // reading stdin cannot deadlock against us.
    let writer = child.stdin.take().map(|mut stdin| {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&payload).await {
                debug!("execute - stdin write failed: {}", e);
            }
        })
    });
    let output = match child.wait_with_output().await {
        Ok(output) => output,
        Err(e) => {
            error!("execute - {} did not finish: {}", binary.display(), e);
            return Vec::new();
        }
    };
    if let Some(writer) = writer {
        let _ = writer.await;
    }
    if !output.stderr.is_empty() {
        debug!(
            "execute - {} stderr: {}",
            binary.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    if !output.status.success() {
        warn!(
            "execute - {} exited with {}, discarding batch",
            binary.display(),
            output.status
        );
        return Vec::new();
    }
    match serde_json::from_slice::<Vec<R>>(&output.stdout) {
        Ok(results) => results,
        Err(e) => {
            warn!(
                "execute - {} produced unparseable output: {}",
                binary.display(),
                e
            );
            Vec::new()
        }
    }
}
