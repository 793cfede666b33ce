//! IO threads and the load-aware thread group
//!
//! Each [`IoThread`] owns one OS thread running one [`EventLoop`]. The
//! [`IoThreadGroup`] sizes itself from a base count adjusted by a
//! best-effort look at CPU utilisation and load average, then hands
//! loops out round-robin.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::error::NetError;
use crate::event_loop::{EventLoop, LoopHandle};

/// One named OS thread running an event loop.
pub struct IoThread {
    handle: LoopHandle,
    join: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl IoThread {
    /// Spawn the thread and block until its loop is constructed and its
    /// handle published, so a returned `IoThread` is always usable.
    pub fn start(name: &str) -> Result<Self, NetError> {
        let (tx, rx) = mpsc::channel::<Result<LoopHandle, NetError>>();
        let thread_name = name.to_string();
        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let lp = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                let _ = tx.send(Ok(lp.handle()));
                lp.run();
            })
            .map_err(NetError::ThreadSpawn)?;

        let handle = rx.recv().map_err(|_| NetError::ThreadStart)??;
        debug!(name = %thread_name, "io thread started");
        Ok(IoThread {
            handle,
            join: Mutex::new(Some(join)),
            name: thread_name,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the loop and join the thread. Safe to call twice.
    pub fn stop(&self) {
        self.handle.stop();
        let join = self.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(join) = join {
            if join.join().is_err() {
                warn!(name = %self.name, "io thread panicked");
            }
        }
    }
}

/// Round-robin pool of IO threads.
pub struct IoThreadGroup {
    threads: Vec<IoThread>,
    next: AtomicUsize,
}

impl IoThreadGroup {
    /// Spawn `base` threads adjusted by current machine load.
    pub fn new(base: usize) -> Result<Self, NetError> {
        let cpu = cpu_utilization().unwrap_or(0.5);
        let load = normalized_load_average().unwrap_or(0.5);
        let size = provisioned_size(base, cpu, load);
        info!(base, size, cpu, load, "io thread group sizing");

        let mut threads = Vec::with_capacity(size);
        for i in 0..size {
            threads.push(IoThread::start(&format!("binrpc-io-{i}"))?);
        }
        Ok(IoThreadGroup {
            threads,
            next: AtomicUsize::new(0),
        })
    }

    /// Next loop handle, round-robin with wraparound.
    pub fn next(&self) -> LoopHandle {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[idx].handle()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Stop every loop and join every thread.
    pub fn stop(&self) {
        for t in &self.threads {
            t.stop();
        }
    }
}

/// Size heuristic: double under pressure, halve (floor 2) when idle.
fn provisioned_size(base: usize, cpu: f64, load: f64) -> usize {
    let mut size = base.max(1);
    if cpu > 0.8 || load > 0.8 {
        size *= 2;
    }
    if cpu < 0.2 && load < 0.2 {
        size = (size / 2).max(2);
    }
    size
}

/// Busy fraction since boot from the first line of /proc/stat.
/// Coarse: busy fraction since boot, good enough for a sizing hint.
fn cpu_utilization() -> Option<f64> {
    let stat = fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().next()?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    if total == 0 {
        return None;
    }
    Some((total - idle) as f64 / total as f64)
}

/// One-minute load average divided by the online CPU count.
fn normalized_load_average() -> Option<f64> {
    let loadavg = fs::read_to_string("/proc/loadavg").ok()?;
    let one_min: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if cpus <= 0 {
        return None;
    }
    Some(one_min / cpus as f64)
}
