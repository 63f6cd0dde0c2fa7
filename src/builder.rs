//! Builder for [`Dispatcher`] instances.

use std::io;

use crate::dispatcher::{default_error_sink, Dispatcher, ErrorSink, WorkerHook};

pub struct DispatcherBuilder {
    threads: usize,
    queue_depth: u32,
    error_sink: ErrorSink,
    init_hook: Option<WorkerHook>,
    teardown_hook: Option<WorkerHook>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        DispatcherBuilder {
            threads: num_cpus::get(),
            queue_depth: 256,
            error_sink: default_error_sink(),
            init_hook: None,
            teardown_hook: None,
        }
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        DispatcherBuilder::default()
    }

    /// Number of worker threads draining the completion channel.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Submission/completion ring depth.
    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Sink receiving unexpected failures from worker threads.
    pub fn error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = sink;
        self
    }

    /// Hook run on each worker thread before it enters the drain loop.
    pub fn init_hook(mut self, hook: WorkerHook) -> Self {
        self.init_hook = Some(hook);
        self
    }

    /// Hook run on each worker thread after it leaves the drain loop.
    pub fn teardown_hook(mut self, hook: WorkerHook) -> Self {
        self.teardown_hook = Some(hook);
        self
    }

    /// Open the completion channel and spawn the workers.
    pub fn build(self) -> io::Result<Dispatcher> {
        Dispatcher::start(
            self.queue_depth,
            self.threads,
            self.error_sink,
            self.init_hook,
            self.teardown_hook,
        )
    }
}
