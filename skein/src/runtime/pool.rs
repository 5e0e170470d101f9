use crate::context;
use crate::runtime::worker::Worker;
use crate::runtime::{EventLoop, Handle};
use anyhow::{Result, anyhow};
use crossbeam_deque::Worker as CbWorker;
use parking_lot::Mutex;
use std::rc::Rc;
use std::thread;

/// Join handles for one group of engine threads (workers, compute threads or
/// the reactor).
#[derive(Debug, Default)]
pub(crate) struct ThreadPool {
    handles: Mutex<Vec<(String, thread::JoinHandle<()>)>>,
}

impl ThreadPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn spawn_workers(&self, handle: &Handle) -> Result<()> {
        let cfg = handle.cfg();
        let num_workers = cfg.worker_threads;

        // Create Crossbeam LIFO queues and their stealers
        let mut local_queues = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let w = CbWorker::new_lifo();
            stealers.push(w.stealer());
            local_queues.push(w);
        }

        for (i, local_queue) in local_queues.into_iter().enumerate() {
            // Give each worker a list of all *other* workers' stealers
            let other_stealers = stealers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, s)| s.clone())
                .collect::<Vec<_>>();

            let handle = handle.clone();
            self.spawn_thread(cfg.thread_name.0(), cfg.thread_stack_size, move || {
                let worker = Rc::new(Worker::new(
                    handle.id(),
                    i,
                    handle.cfg(),
                    handle.injector().clone(),
                    handle.shared().clone(),
                    local_queue,
                    other_stealers,
                ));

                context::init_worker(handle, worker.clone());
                worker.event_loop();

                drop(worker);
                context::take_worker();
            })?;
        }

        Ok(())
    }

    pub(crate) fn spawn_thread<F>(
        &self,
        name: String,
        stack_size: Option<usize>,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut builder = thread::Builder::new().name(name.clone());

        if let Some(stack_size) = stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder
            .spawn(f)
            .map_err(|e| anyhow!("failed to spawn thread {}: {}", name, e))?;

        self.handles.lock().push((name, handle));
        Ok(())
    }

    pub(crate) fn join_all(&self) -> Result<()> {
        let handles = self.handles.lock().drain(..).collect::<Vec<_>>();

        let errors = handles
            .into_iter()
            .filter_map(|(name, handle)| handle.join().err().map(|_| name))
            .collect::<Vec<_>>();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("thread(s) panicked: {}", errors.join(", ")))
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.lock().len()
    }
}
