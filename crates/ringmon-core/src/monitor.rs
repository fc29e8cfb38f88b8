//! The storage worker: a single thread that owns every series and drains
//! the task queue. Receivers and readers never touch series state; they
//! enqueue tasks and get answers back through their respond callbacks.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::calendar;
use crate::registry::Registry;
use crate::storage::range_params;
use crate::task::{ReadTask, Task, TaskQueue};
use crate::util::unix_now;

/// Point queries return at most this many samples per series.
const MAX_POINTS: u32 = 600;

/// Owns the task queue and the worker thread. Dropping (or [`Monitor::stop`])
/// drains the queue, flushes every open series and joins the worker.
pub struct Monitor {
    queue: Arc<TaskQueue>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Monitor {
    /// Spawns the worker for `datadir`. Failure to start the thread is the
    /// one fatal error of the whole subsystem.
    pub fn start(datadir: impl Into<PathBuf>) -> io::Result<Monitor> {
        let queue = Arc::new(TaskQueue::new());
        let datadir = datadir.into();
        let q = queue.clone();
        let worker = thread::Builder::new()
            .name("ringmon-storage".into())
            .spawn(move || worker_loop(&q, datadir))?;
        Ok(Monitor { queue, worker: Some(worker) })
    }

    /// Handle for collaborators to submit tasks.
    pub fn queue(&self) -> Arc<TaskQueue> {
        self.queue.clone()
    }

    /// Stops after draining all queued tasks, then flushes and joins.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.queue.put(Task::Stop);
            if worker.join().is_err() {
                warn!("storage worker panicked");
            }
        }
    }

    /// Stops ahead of queued tasks; whatever is still queued is dropped.
    pub fn stop_now(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.queue.stop();
            if worker.join().is_err() {
                warn!("storage worker panicked");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(queue: &TaskQueue, datadir: PathBuf) {
    debug!("storage worker started");
    let mut registry = Registry::new(datadir);
    loop {
        match queue.get() {
            Task::Stop => break,
            Task::Write(task) => {
                if let Err(e) = (task.parse)(&task.payload, &mut registry) {
                    warn!(error = %e, "write task failed");
                }
            }
            Task::Read(mut task) => {
                match task.take_parse().map(|parse| parse(&mut task)) {
                    Some(Ok(())) | None => {
                        if let Err(e) = read_data(&mut registry, &mut task) {
                            warn!(error = %e, "read task failed");
                            task.failed = true;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "read request rejected");
                        task.failed = true;
                    }
                }
                if let Some(respond) = task.take_respond() {
                    respond(*task);
                }
            }
        }
    }
    registry.flush_all();
    debug!("storage worker finished");
}

/// Plans and runs a read task against the registry: an evenly-stepped point
/// range, or calendar-window aggregation when an aggregation is requested.
fn read_data(registry: &mut Registry, task: &mut ReadTask) -> io::Result<()> {
    let cur = unix_now();
    match task.aggr {
        None => {
            let p = range_params(task.start, task.end, cur, MAX_POINTS);
            task.step = p.step;
            let points = p.points();
            task.times = (0..points as u32).map(|i| p.start + i * p.step).collect();
            task.values = vec![f32::NAN; points * task.names.len()];
            for (i, name) in task.names.iter().enumerate() {
                if points == 0 {
                    break;
                }
                let row = &mut task.values[i * points..(i + 1) * points];
                match registry.resolve(name) {
                    Some(log) => log.range(p.start, p.end, p.step, row)?,
                    None => warn!(series = %name, "no data"),
                }
            }
        }
        Some(aggr) => {
            let (aggr, bounds) = calendar::boundaries(aggr, task.start, task.end.min(cur));
            let windows = bounds.len().saturating_sub(1);
            task.step = aggr.nominal_step();
            task.times = bounds.iter().take(windows).copied().collect();
            task.values = vec![0.0; windows * task.names.len()];
            for (i, name) in task.names.iter().enumerate() {
                if windows == 0 {
                    break;
                }
                let row = &mut task.values[i * windows..(i + 1) * windows];
                match registry.resolve(name) {
                    Some(log) => log.aggregate(&bounds, row),
                    None => warn!(series = %name, "no data"),
                }
            }
        }
    }
    Ok(())
}
