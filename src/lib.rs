//! Proactor-style asynchronous I/O runtime.
//!
//! Application code issues read/write/accept/connect requests against
//! handles; the runtime submits them to the kernel's completion facility
//! (`io_uring`) and a pool of worker threads drains completions and runs
//! the user-supplied continuations. Composed transfer algorithms layer
//! "transfer N bytes" semantics over the single-shot primitives.
//!
//! ```no_run
//! use stratus::{AsHandle, Dispatcher};
//!
//! # fn main() -> std::io::Result<()> {
//! let dispatcher = Dispatcher::new(4)?;
//! let listener = stratus::net::TcpListener::bind(
//!     &dispatcher,
//!     "127.0.0.1:0".parse().unwrap(),
//!     128,
//! )?;
//! dispatcher.bind(listener.handle())?;
//! # Ok(())
//! # }
//! ```

pub mod buf;
pub mod builder;
pub mod dispatcher;
pub mod fs;
pub mod handle;
pub mod net;
pub mod pipe;
pub mod pool;
pub mod transfer;
pub mod watch;

mod op;
mod util;

pub use buf::{ConstBuf, MutBuf};
pub use builder::DispatcherBuilder;
pub use dispatcher::{Dispatcher, ErrorSink, WorkerHook};
pub use handle::{AsHandle, Handle};
pub use pool::{LocalPool, Pool, SharedPool};
pub use transfer::{transfer_all, transfer_at_least, CompletionCondition};
