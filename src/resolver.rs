//! Asynchronous host and service name resolution.
//!
//! Resolution is inherently blocking on POSIX (`getaddrinfo(3)`), so
//! each context runs a detached worker thread draining a queue of
//! queries; results come back through the normal cross-thread wakeup
//! path and resume the awaiting task on its own context.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::pin::Pin;
use std::slice;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};
use std::thread;

use log::{error, trace};

use crate::context::{Inner, Service};
use crate::error::canceled;
use crate::{sys, Executor, IoContext, StopToken};

/// Flags controlling a [`Resolver::resolve`] query, mapped onto the
/// platform's `AI_*` flags.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct ResolveFlags(u32);

const PASSIVE: u32 = 0b00_0001;
const NUMERIC_HOST: u32 = 0b00_0010;
const NUMERIC_SERVICE: u32 = 0b00_0100;
const ADDRESS_CONFIGURED: u32 = 0b00_1000;
const V4_MAPPED: u32 = 0b01_0000;
const ALL_MATCHING: u32 = 0b10_0000;

impl ResolveFlags {
    /// Resolve for binding a listener rather than connecting.
    pub const PASSIVE: ResolveFlags = ResolveFlags(PASSIVE);
    /// The host is a literal address; no lookup is performed.
    pub const NUMERIC_HOST: ResolveFlags = ResolveFlags(NUMERIC_HOST);
    /// The service is a literal port number; no lookup is performed.
    pub const NUMERIC_SERVICE: ResolveFlags = ResolveFlags(NUMERIC_SERVICE);
    /// Only return families configured on this system.
    pub const ADDRESS_CONFIGURED: ResolveFlags = ResolveFlags(ADDRESS_CONFIGURED);
    /// Report v4 addresses as v4-mapped v6 when v6 is requested.
    pub const V4_MAPPED: ResolveFlags = ResolveFlags(V4_MAPPED);
    /// Together with v4-mapped, return both matching families.
    pub const ALL_MATCHING: ResolveFlags = ResolveFlags(ALL_MATCHING);

    /// No flags set.
    pub const fn empty() -> ResolveFlags {
        ResolveFlags(0)
    }

    /// Whether every flag in `other` is set in `self`.
    pub const fn contains(self, other: ResolveFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn ai_flags(self) -> libc::c_int {
        let mut flags = 0;
        if self.contains(ResolveFlags::PASSIVE) {
            flags |= libc::AI_PASSIVE;
        }
        if self.contains(ResolveFlags::NUMERIC_HOST) {
            flags |= libc::AI_NUMERICHOST;
        }
        if self.contains(ResolveFlags::NUMERIC_SERVICE) {
            flags |= libc::AI_NUMERICSERV;
        }
        if self.contains(ResolveFlags::ADDRESS_CONFIGURED) {
            flags |= libc::AI_ADDRCONFIG;
        }
        if self.contains(ResolveFlags::V4_MAPPED) {
            flags |= libc::AI_V4MAPPED;
        }
        if self.contains(ResolveFlags::ALL_MATCHING) {
            flags |= libc::AI_ALL;
        }
        flags
    }
}

impl BitOr for ResolveFlags {
    type Output = ResolveFlags;

    fn bitor(self, other: ResolveFlags) -> ResolveFlags {
        ResolveFlags(self.0 | other.0)
    }
}

impl fmt::Debug for ResolveFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (bit, name) in [
            (ResolveFlags::PASSIVE, "PASSIVE"),
            (ResolveFlags::NUMERIC_HOST, "NUMERIC_HOST"),
            (ResolveFlags::NUMERIC_SERVICE, "NUMERIC_SERVICE"),
            (ResolveFlags::ADDRESS_CONFIGURED, "ADDRESS_CONFIGURED"),
            (ResolveFlags::V4_MAPPED, "V4_MAPPED"),
            (ResolveFlags::ALL_MATCHING, "ALL_MATCHING"),
        ] {
            if self.contains(bit) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

/// One resolved endpoint with the names that produced it.
#[derive(Clone, Debug)]
pub struct ResolverEntry {
    endpoint: SocketAddr,
    host_name: String,
    service_name: String,
}

impl ResolverEntry {
    /// The resolved endpoint.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// The canonical host name when the lookup produced one, otherwise
    /// the queried host.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// The queried service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// The ordered sequence of entries a query produced.
#[derive(Clone, Debug, Default)]
pub struct ResolverResults {
    entries: Vec<ResolverEntry>,
}

impl ResolverResults {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the query produced no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates the entries in resolution order.
    pub fn iter(&self) -> slice::Iter<'_, ResolverEntry> {
        self.entries.iter()
    }
}

impl IntoIterator for ResolverResults {
    type Item = ResolverEntry;
    type IntoIter = std::vec::IntoIter<ResolverEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResolverResults {
    type Item = &'a ResolverEntry;
    type IntoIter = slice::Iter<'a, ResolverEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

struct Job {
    host: Option<String>,
    service: String,
    flags: ResolveFlags,
    query: Arc<QueryShared>,
}

struct QueryShared {
    state: Mutex<QueryState>,
}

struct QueryState {
    result: Option<io::Result<ResolverResults>>,
    waker: Option<Waker>,
    canceled: bool,
}

impl QueryShared {
    fn complete(&self, result: io::Result<ResolverResults>) {
        let waker = {
            let mut state = self.state.lock().unwrap();
            if state.result.is_some() {
                // Cancelled while the worker was resolving; the late
                // result is discarded.
                return;
            }
            state.result = Some(result);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn cancel(&self) {
        let waker = {
            let mut state = self.state.lock().unwrap();
            state.canceled = true;
            if state.result.is_some() {
                return;
            }
            state.result = Some(Err(canceled()));
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn is_canceled(&self) -> bool {
        self.state.lock().unwrap().canceled
    }
}

/// Per-context resolution service: the submission side of the worker
/// thread's queue.
pub(crate) struct ResolverService {
    tx: Mutex<Option<Sender<Job>>>,
}

impl ResolverService {
    fn create(_inner: &Arc<Inner>) -> Arc<ResolverService> {
        let (tx, rx) = mpsc::channel::<Job>();
        let spawned = thread::Builder::new()
            .name("corio-resolver".into())
            .spawn(move || worker(rx));
        let tx = match spawned {
            Ok(_) => Some(tx),
            Err(err) => {
                error!("failed to start resolver worker: {}", err);
                None
            }
        };
        Arc::new(ResolverService { tx: Mutex::new(tx) })
    }

    fn submit(&self, job: Job) {
        let query = job.query.clone();
        let sent = {
            let tx = self.tx.lock().unwrap();
            match tx.as_ref() {
                Some(tx) => tx.send(job).is_ok(),
                None => false,
            }
        };
        if !sent {
            query.cancel();
        }
    }
}

impl Service for ResolverService {
    fn shutdown(&self) {
        // Closing the queue lets the worker drain and exit. The worker
        // is never joined: a getaddrinfo call cannot be interrupted and
        // must not block context teardown.
        self.tx.lock().unwrap().take();
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

fn worker(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if job.query.is_canceled() {
            continue;
        }
        trace!(
            "resolving host={:?} service={:?} flags={:?}",
            job.host,
            job.service,
            job.flags
        );
        let result = run_query(&job);
        job.query.complete(result);
    }
}

fn run_query(job: &Job) -> io::Result<ResolverResults> {
    let mut ai_flags = job.flags.ai_flags();
    if job.host.is_some() {
        ai_flags |= libc::AI_CANONNAME;
    }
    let raw = sys::getaddrinfo(job.host.as_deref(), &job.service, ai_flags)?;

    let queried_host = job.host.clone().unwrap_or_default();
    let canonical = raw
        .first()
        .and_then(|entry| entry.canonical_name.clone())
        .unwrap_or(queried_host);

    let entries = raw
        .into_iter()
        .map(|entry| ResolverEntry {
            endpoint: entry.addr,
            host_name: canonical.clone(),
            service_name: job.service.clone(),
        })
        .collect();
    Ok(ResolverResults { entries })
}

/// Asynchronous resolver for host/service pairs.
///
/// # Examples
///
/// ```
/// use corio::resolver::{ResolveFlags, Resolver};
/// use corio::IoContext;
///
/// # fn main() -> std::io::Result<()> {
/// let ioc = IoContext::new()?;
/// let resolver = Resolver::new(&ioc);
/// ioc.spawn(async move {
///     let results = resolver
///         .resolve(
///             "127.0.0.1",
///             "8080",
///             ResolveFlags::NUMERIC_HOST | ResolveFlags::NUMERIC_SERVICE,
///         )
///         .await
///         .unwrap();
///     assert_eq!(results.len(), 1);
/// })
/// .detach();
/// ioc.run();
/// # Ok(())
/// # }
/// ```
pub struct Resolver {
    service: Arc<ResolverService>,
    queries: Mutex<Vec<Weak<QueryShared>>>,
}

impl Resolver {
    /// Creates a resolver on `ctx`, starting the context's resolution
    /// service on first use.
    pub fn new(ctx: &IoContext) -> Resolver {
        Resolver {
            service: ctx.inner().use_service(ResolverService::create),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Creates a resolver on the executor's context.
    pub fn from_executor(ex: &Executor) -> Resolver {
        Resolver {
            service: ex.inner.use_service(ResolverService::create),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Resolves a host/service pair into an ordered sequence of
    /// endpoints. An empty host resolves the wildcard/loopback address
    /// per the `PASSIVE` flag.
    pub fn resolve(&self, host: &str, service: &str, flags: ResolveFlags) -> Resolve<'_> {
        Resolve {
            resolver: self,
            host: host.to_owned(),
            service: service.to_owned(),
            flags,
            query: None,
            stop: None,
        }
    }

    /// Cancels this resolver's outstanding queries; each completes with
    /// [`Cond::Canceled`]. A query already running on the worker thread
    /// finishes there but its result is discarded.
    ///
    /// [`Cond::Canceled`]: crate::Cond::Canceled
    pub fn cancel(&self) {
        let queries: Vec<Arc<QueryShared>> = {
            let mut queries = self.queries.lock().unwrap();
            let live = queries.iter().filter_map(Weak::upgrade).collect();
            queries.clear();
            live
        };
        for query in queries {
            query.cancel();
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish()
    }
}

/// Future returned by [`Resolver::resolve`].
#[must_use = "futures do nothing unless awaited"]
pub struct Resolve<'a> {
    resolver: &'a Resolver,
    host: String,
    service: String,
    flags: ResolveFlags,
    query: Option<Arc<QueryShared>>,
    stop: Option<StopToken>,
}

impl Resolve<'_> {
    /// Attaches a stop token; a token signalled before the first poll
    /// completes with canceled without submitting the query.
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        self.stop = Some(token);
        self
    }
}

impl Future for Resolve<'_> {
    type Output = io::Result<ResolverResults>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<ResolverResults>> {
        let this = self.get_mut();

        if let Some(query) = &this.query {
            let mut state = query.state.lock().unwrap();
            if let Some(result) = state.result.take() {
                return Poll::Ready(result);
            }
            if this.stop.as_ref().map_or(false, |t| t.stop_requested()) {
                state.canceled = true;
                return Poll::Ready(Err(canceled()));
            }
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        if this.stop.as_ref().map_or(false, |t| t.stop_requested()) {
            return Poll::Ready(Err(canceled()));
        }

        let query = Arc::new(QueryShared {
            state: Mutex::new(QueryState {
                result: None,
                waker: Some(cx.waker().clone()),
                canceled: false,
            }),
        });
        this.resolver
            .queries
            .lock()
            .unwrap()
            .push(Arc::downgrade(&query));
        this.query = Some(query.clone());

        let host = if this.host.is_empty() {
            None
        } else {
            Some(this.host.clone())
        };
        this.resolver.service.submit(Job {
            host,
            service: this.service.clone(),
            flags: this.flags,
            query,
        });

        if let Some(token) = &this.stop {
            token.register(cx.waker());
        }
        Poll::Pending
    }
}

impl Drop for Resolve<'_> {
    fn drop(&mut self) {
        if let Some(query) = &self.query {
            query.cancel();
        }
    }
}

impl fmt::Debug for Resolve<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolve")
            .field("host", &self.host)
            .field("service", &self.service)
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_algebra() {
        let flags = ResolveFlags::NUMERIC_HOST | ResolveFlags::NUMERIC_SERVICE;
        assert!(flags.contains(ResolveFlags::NUMERIC_HOST));
        assert!(flags.contains(ResolveFlags::NUMERIC_SERVICE));
        assert!(!flags.contains(ResolveFlags::PASSIVE));
        assert!(ResolveFlags::empty().contains(ResolveFlags::empty()));
    }
}
